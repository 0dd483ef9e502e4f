//! The param-group state machine (§4.3) — the core of this crate.

use std::rc::Rc;
use std::sync::Arc;

use tch::{Device, Kind, Tensor};
use tracing::{debug, trace};

use crate::accelerator::{AcceleratorEvent, Streams};
use crate::all_gather_state::{AllGatherState, AllGatherStateHolder};
use crate::collectives::{AllGatherResult, CollectiveTransport};
use crate::error::FsdpError;
use crate::hooks::{register_post_backward_hook, AutogradHookInstaller};
use crate::mesh::MeshInfo;
use crate::param::{FSDPParam, ShardedState};

/// Drives stream selection and prefetch policy (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingState {
    Idle,
    Forward,
    PreBackward,
    PostBackward,
}

/// Given `W = data_parallel_world_size`, the largest power of two `F` such
/// that `W % F == 0 && W / F > F`, paired with `post = W / F`. Dividing by
/// `pre` before the reduce and `post` after keeps intermediate magnitudes
/// near `sqrt(W)`, avoiding fp16 overflow/underflow versus dividing by `W` in
/// one shot (§3).
pub fn grad_divide_factors(data_parallel_world_size: usize) -> (f64, f64) {
    let world_size = data_parallel_world_size as u64;
    let mut factor: u64 = 1;
    while world_size % factor == 0 && world_size / factor > factor {
        factor *= 2;
    }
    (factor as f64, world_size as f64 / factor as f64)
}

pub struct FSDPParamGroup {
    fsdp_params: Vec<FSDPParam>,
    mesh_info: MeshInfo,
    device: Device,

    training_state: TrainingState,
    sharded_state: ShardedState,

    orig_dtype: Kind,
    param_dtype: Kind,

    streams: Streams,
    transport: Arc<dyn CollectiveTransport>,
    autograd: Arc<dyn AutogradHookInstaller>,

    all_gather_state: AllGatherStateHolder,
    grad_predivide_factor: f64,
    grad_postdivide_factor: f64,

    all_gather_result: Option<AllGatherResult>,
    reduce_scatter_view_out_event: Option<Arc<dyn AcceleratorEvent>>,

    reshard_after_forward: bool,
}

impl FSDPParamGroup {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fsdp_params: Vec<FSDPParam>,
        mesh_info: MeshInfo,
        device: Device,
        streams: Streams,
        transport: Arc<dyn CollectiveTransport>,
        autograd: Arc<dyn AutogradHookInstaller>,
        reshard_after_forward: bool,
        param_dtype_override: Option<Kind>,
    ) -> Result<Self, FsdpError> {
        let mut seen = std::collections::HashSet::new();
        let distinct_dtypes: Vec<Kind> = fsdp_params
            .iter()
            .map(|p| p.orig_dtype)
            .filter(|dtype| seen.insert(format!("{dtype:?}")))
            .collect();
        if distinct_dtypes.len() > 1 {
            return Err(FsdpError::MixedDtypes(distinct_dtypes));
        }
        let orig_dtype = distinct_dtypes.first().copied().unwrap_or(Kind::Float);
        let param_dtype = param_dtype_override.unwrap_or(orig_dtype);
        let (grad_predivide_factor, grad_postdivide_factor) =
            grad_divide_factors(mesh_info.data_parallel_world_size());

        Ok(Self {
            fsdp_params,
            mesh_info,
            device,
            training_state: TrainingState::Idle,
            sharded_state: ShardedState::Sharded,
            orig_dtype,
            param_dtype,
            streams,
            transport,
            autograd,
            all_gather_state: AllGatherStateHolder::new(),
            grad_predivide_factor,
            grad_postdivide_factor,
            all_gather_result: None,
            reduce_scatter_view_out_event: None,
            reshard_after_forward,
        })
    }

    pub fn sharded_state(&self) -> ShardedState {
        self.sharded_state
    }

    pub fn training_state(&self) -> TrainingState {
        self.training_state
    }

    pub fn params(&self) -> &[FSDPParam] {
        &self.fsdp_params
    }

    fn use_all_gather_stream(&self) -> bool {
        matches!(
            self.training_state,
            TrainingState::Forward | TrainingState::PreBackward
        )
    }

    fn all_gather_copy_in_stream_for_unshard(&self) -> &dyn crate::accelerator::AcceleratorStream {
        if self.use_all_gather_stream() {
            &*self.streams.all_gather_copy_in_stream
        } else {
            &*self.streams.default_stream
        }
    }

    fn all_gather_stream_for_unshard(&self) -> &dyn crate::accelerator::AcceleratorStream {
        if self.use_all_gather_stream() {
            &*self.streams.all_gather_stream
        } else {
            &*self.streams.default_stream
        }
    }

    /// Launches an all-gather unless one is already pending or the group is
    /// already unsharded (both benign no-ops per §7).
    pub fn unshard(&mut self, async_op: bool) -> Result<(), FsdpError> {
        if self.all_gather_result.is_some() {
            trace!("unshard: all-gather already pending, no-op");
            return Ok(());
        }
        if self.sharded_state == ShardedState::Unsharded {
            trace!("unshard: already unsharded, no-op");
            return Ok(());
        }
        let copy_in_stream = self.all_gather_copy_in_stream_for_unshard();
        let comm_stream = self.all_gather_stream_for_unshard();
        debug!(world_size = self.mesh_info.data_parallel_world_size(), "launching all-gather");
        let result = self.transport.all_gather(
            &self.fsdp_params,
            &*self.mesh_info.shard_group,
            async_op,
            copy_in_stream,
            comm_stream,
            self.param_dtype,
        )?;
        self.all_gather_result = Some(result);
        Ok(())
    }

    /// See §4.3: overlaps the previous group's copy-out free with the
    /// current group's unshard during implicit (forward) prefetch, and
    /// otherwise frees eagerly since the previous reduce-scatter already
    /// overlaps the current copy-out.
    pub fn wait_for_unshard(&mut self) -> Result<(), FsdpError> {
        let Some(result) = self.all_gather_result.take() else {
            trace!("wait_for_unshard: no preceding unshard, no-op");
            return Ok(());
        };

        if self.training_state == TrainingState::Forward {
            if let Some(AllGatherState { event, .. }) = self.all_gather_state.pop() {
                self.wait_all_gather_streams_on_event(&*event);
            }
        }

        self.transport
            .all_gather_copy_out(&result, &mut self.fsdp_params, &*self.mesh_info.shard_group)?;
        for param in &mut self.fsdp_params {
            param.init_unsharded_param();
        }
        self.to_unsharded_state();

        let copy_out_event = crate::accelerator::CpuEvent::new();
        copy_out_event.record(&*self.streams.default_stream);

        if self.training_state == TrainingState::Forward {
            self.all_gather_state.put(AllGatherState {
                result,
                event: copy_out_event,
            })?;
        } else {
            self.wait_all_gather_streams_on_event(&*copy_out_event);
            drop(result);
        }
        Ok(())
    }

    fn wait_all_gather_streams_on_event(&self, event: &dyn AcceleratorEvent) {
        self.streams.all_gather_copy_in_stream.wait_event(event);
        self.streams.all_gather_stream.wait_event(event);
    }

    fn to_sharded_state(&mut self) {
        if self.sharded_state != ShardedState::Sharded {
            for param in &mut self.fsdp_params {
                param.to_sharded();
            }
            self.sharded_state = ShardedState::Sharded;
        }
    }

    fn to_unsharded_state(&mut self) {
        if self.sharded_state != ShardedState::Unsharded {
            self.sharded_state = ShardedState::Unsharded;
        }
    }

    pub fn reshard(&mut self) {
        self.to_sharded_state();
    }

    /// `on_post_backward` is installed on every forward input that requires
    /// gradient; it must fire `self.post_backward()` exactly once when the
    /// backward pass reaches those inputs. Callers build it with
    /// [`Self::post_backward_callback`], which closes over a non-owning
    /// handle so the installed hook cannot extend the group's lifetime past
    /// the training step (§9 DESIGN NOTES).
    pub fn pre_forward(
        &mut self,
        inputs: Vec<Tensor>,
        on_post_backward: Rc<dyn Fn()>,
    ) -> Result<Vec<Tensor>, FsdpError> {
        self.training_state = TrainingState::Forward;
        self.unshard(false)?;
        self.wait_for_unshard()?;
        Ok(register_post_backward_hook(&*self.autograd, inputs, on_post_backward))
    }

    /// Builds the callback `pre_forward` should install: a weak handle into
    /// `group` that calls `post_backward` if the group still exists when the
    /// autograd engine fires it.
    pub fn post_backward_callback(group: &Rc<std::cell::RefCell<FSDPParamGroup>>) -> Rc<dyn Fn()> {
        let weak = Rc::downgrade(group);
        Rc::new(move || {
            if let Some(group) = weak.upgrade() {
                group.borrow_mut().post_backward();
            }
        })
    }

    /// Resharding here trades one fewer all-gather in `pre_backward` (it
    /// becomes a no-op, since the group is already unsharded) for holding the
    /// unsharded form in memory across the whole forward/backward gap — the
    /// sole user-tunable memory/latency trade-off (§6).
    pub fn post_forward(&mut self) {
        if self.reshard_after_forward {
            self.reshard();
        }
        self.training_state = TrainingState::Idle;
    }

    pub fn pre_backward(&mut self) -> Result<(), FsdpError> {
        self.training_state = TrainingState::PreBackward;
        self.unshard(false)?;
        self.wait_for_unshard()
    }

    /// Invoked from the autograd hook (or, as a fallback, from
    /// `finalize_backward` when no input required gradient).
    pub fn post_backward(&mut self) {
        self.training_state = TrainingState::PostBackward;

        // Save the autograd-computed gradients before resharding, since
        // resharding drops each param's unsharded view and the gradient
        // living on it would go with it.
        let mut indices = Vec::new();
        let mut grads = Vec::new();
        for (i, param) in self.fsdp_params.iter().enumerate() {
            if let Some(unsharded) = param.unsharded_param() {
                let grad = unsharded.grad();
                if grad.defined() {
                    indices.push(i);
                    grads.push(grad);
                }
            }
        }
        self.reshard();

        if grads.is_empty() {
            trace!("post_backward: no gradients present, no-op");
            return;
        }

        debug!(num_params = indices.len(), "launching reduce-scatter");
        match self.transport.reduce_scatter(
            &mut self.fsdp_params,
            &indices,
            &grads,
            &*self.mesh_info.shard_group,
            &*self.streams.reduce_scatter_stream,
            self.orig_dtype,
            self.grad_predivide_factor,
            self.grad_postdivide_factor,
        ) {
            Ok(event) => self.reduce_scatter_view_out_event = Some(event),
            Err(err) => {
                tracing::error!("reduce-scatter failed: {err:#}");
                panic!("fatal collective failure in post_backward: {err:#}");
            }
        }
    }

    /// If the group never fired its post-backward hook (no grad-requiring
    /// forward input), runs it directly. Then waits the default stream on
    /// the reduce-scatter completion event, if any, and returns to IDLE.
    pub fn finalize_backward(&mut self) {
        if self.sharded_state == ShardedState::Unsharded {
            self.post_backward();
        }
        if let Some(event) = self.reduce_scatter_view_out_event.take() {
            self.streams.default_stream.wait_event(&*event);
        }
        self.training_state = TrainingState::Idle;
    }
}

impl std::fmt::Debug for FSDPParamGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FSDPParamGroup")
            .field("num_params", &self.fsdp_params.len())
            .field("training_state", &self.training_state)
            .field("sharded_state", &self.sharded_state)
            .field("reshard_after_forward", &self.reshard_after_forward)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectives::SingleProcessTransport;
    use crate::hooks::ManualFireHookInstaller;
    use crate::mesh::{MeshInfo, SingleProcessGroup};
    use crate::module_tree::{new_param_cell, Module, ParamCellHandle};
    use std::cell::RefCell;

    #[test]
    fn grad_divide_factors_power_of_two_world_size() {
        // factor doubles 1 -> 2 -> 4 and stops there: 8/8 = 1 is not > 8, so
        // a factor of 8 is never reached even though 8 is itself a power of
        // two.
        assert_eq!(grad_divide_factors(8), (4.0, 2.0));
    }

    #[test]
    fn grad_divide_factors_non_power_of_two_world_size() {
        // 12 = 4 * 3: largest power of two dividing 12 with quotient > factor.
        assert_eq!(grad_divide_factors(12), (4.0, 3.0));
    }

    #[test]
    fn grad_divide_factors_single_worker_is_identity() {
        assert_eq!(grad_divide_factors(1), (1.0, 1.0));
    }

    #[derive(Debug, Default)]
    struct MockLinear {
        weight: Option<ParamCellHandle>,
    }

    impl Module for MockLinear {
        fn named_children(&self) -> Vec<(String, Rc<RefCell<dyn Module>>)> {
            Vec::new()
        }

        fn named_parameters(&self) -> Vec<(String, ParamCellHandle)> {
            self.weight
                .clone()
                .map(|cell| vec![("weight".to_string(), cell)])
                .unwrap_or_default()
        }

        fn rebind_parameter(&mut self, name: &str, cell: ParamCellHandle) {
            if name == "weight" {
                self.weight = Some(cell);
            }
        }
    }

    /// Builds a one-parameter group wired with the single-process mock
    /// transport, a CPU stream set, and a named `ManualFireHookInstaller` the
    /// test can drive directly (unlike the trait object `fully_shard` stores
    /// internally).
    fn build_group() -> (Rc<RefCell<FSDPParamGroup>>, Arc<ManualFireHookInstaller>) {
        build_group_with(true)
    }

    fn build_group_with(
        reshard_after_forward: bool,
    ) -> (Rc<RefCell<FSDPParamGroup>>, Arc<ManualFireHookInstaller>) {
        let orig = Tensor::arange(8, (Kind::Float, Device::Cpu));
        let cell = new_param_cell(orig.shallow_clone());
        let module = Rc::new(RefCell::new(MockLinear {
            weight: Some(cell.clone()),
        })) as Rc<RefCell<dyn Module>>;

        let installer = Arc::new(ManualFireHookInstaller::new());
        let config = crate::config::FullyShardConfig {
            mesh: MeshInfo::fsdp(Arc::new(SingleProcessGroup)),
            device: Device::Cpu,
            reshard_after_forward,
            param_dtype: None,
            transport: Arc::new(SingleProcessTransport),
            streams: None,
            autograd: installer.clone(),
        };
        let group = crate::config::fully_shard(&module, vec![cell], config).unwrap();
        (group, installer)
    }

    /// S2: with `reshard_after_forward` disabled, the group must stay
    /// UNSHARDED across the whole forward/backward gap, and `pre_backward`'s
    /// own `unshard()` call becomes a documented no-op (no second all-gather).
    #[test]
    fn post_forward_retains_unsharded_state_when_reshard_after_forward_is_false() {
        let (group, _installer) = build_group_with(false);
        let on_post_backward = FSDPParamGroup::post_backward_callback(&group);

        let input = Tensor::zeros([1], (Kind::Float, Device::Cpu));
        group
            .borrow_mut()
            .pre_forward(vec![input], on_post_backward)
            .unwrap();
        assert_eq!(group.borrow().sharded_state(), ShardedState::Unsharded);

        group.borrow_mut().post_forward();
        assert_eq!(
            group.borrow().sharded_state(),
            ShardedState::Unsharded,
            "reshard_after_forward=false must keep the group unsharded"
        );

        // pre_backward's unshard() is now a no-op: already unsharded, and no
        // pending all-gather result to wait on.
        group.borrow_mut().pre_backward().unwrap();
        assert_eq!(group.borrow().sharded_state(), ShardedState::Unsharded);
    }

    #[test]
    fn fresh_group_starts_idle_and_sharded() {
        let (group, _installer) = build_group();
        let group = group.borrow();
        assert_eq!(group.training_state(), TrainingState::Idle);
        assert_eq!(group.sharded_state(), ShardedState::Sharded);
    }

    #[test]
    fn forward_then_post_forward_round_trips_to_sharded() {
        let (group, installer) = build_group();
        let on_post_backward = FSDPParamGroup::post_backward_callback(&group);

        let input = Tensor::zeros([1], (Kind::Float, Device::Cpu));
        let outputs = group
            .borrow_mut()
            .pre_forward(vec![input], on_post_backward)
            .unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(group.borrow().training_state(), TrainingState::Forward);
        assert_eq!(group.borrow().sharded_state(), ShardedState::Unsharded);
        assert_eq!(installer.pending(), 0, "no input required grad, hook never installed");

        group.borrow_mut().post_forward();
        assert_eq!(group.borrow().training_state(), TrainingState::Idle);
        assert_eq!(group.borrow().sharded_state(), ShardedState::Sharded);
    }

    #[test]
    fn full_step_drives_post_backward_through_the_autograd_hook() {
        let (group, installer) = build_group();
        let on_post_backward = FSDPParamGroup::post_backward_callback(&group);

        let input = Tensor::zeros([1], (Kind::Float, Device::Cpu)).set_requires_grad(true);
        group
            .borrow_mut()
            .pre_forward(vec![input], on_post_backward)
            .unwrap();
        group.borrow_mut().post_forward();
        assert_eq!(installer.pending(), 1, "grad-requiring input installs exactly one hook");

        group.borrow_mut().pre_backward().unwrap();
        assert_eq!(group.borrow().sharded_state(), ShardedState::Unsharded);

        // Run a real backward against the unsharded view: `init_unsharded_param`
        // already made it a leaf by calling `set_requires_grad(true)` on a
        // tensor with no grad history, so this populates its `.grad()` the
        // same way the reference implementation's all-gathered buffer does.
        {
            let group = group.borrow();
            let unsharded = group.fsdp_params[0].unsharded_param().unwrap();
            unsharded.sum(Kind::Float).backward();
        }

        // Simulate the backward pass reaching the hook installed on the
        // forward input; this fires `post_backward` through the weak handle.
        installer.fire_all();
        assert_eq!(group.borrow().training_state(), TrainingState::PostBackward);
        assert_eq!(group.borrow().sharded_state(), ShardedState::Sharded);

        group.borrow_mut().finalize_backward();
        assert_eq!(group.borrow().training_state(), TrainingState::Idle);
    }

    #[test]
    fn finalize_backward_without_a_grad_requiring_input_falls_back_to_post_backward() {
        // S6-style scenario: no forward input required grad, so the autograd
        // hook never installs and only `finalize_backward`'s own fallback can
        // return the group to SHARDED.
        let (group, installer) = build_group();
        let on_post_backward = FSDPParamGroup::post_backward_callback(&group);

        let input = Tensor::zeros([1], (Kind::Float, Device::Cpu));
        group
            .borrow_mut()
            .pre_forward(vec![input], on_post_backward)
            .unwrap();
        assert_eq!(installer.pending(), 0);

        group.borrow_mut().pre_backward().unwrap();
        assert_eq!(group.borrow().sharded_state(), ShardedState::Unsharded);

        group.borrow_mut().finalize_backward();
        assert_eq!(group.borrow().sharded_state(), ShardedState::Sharded);
        assert_eq!(group.borrow().training_state(), TrainingState::Idle);
    }

    #[test]
    fn unshard_is_a_benign_noop_when_already_unsharded() {
        let (group, _installer) = build_group();
        group.borrow_mut().unshard(false).unwrap();
        assert_eq!(group.borrow().sharded_state(), ShardedState::Sharded);
        group.borrow_mut().wait_for_unshard().unwrap();
        assert_eq!(group.borrow().sharded_state(), ShardedState::Unsharded);

        // A second unshard while already unsharded must not launch another
        // all-gather or disturb the state.
        group.borrow_mut().unshard(false).unwrap();
        group.borrow_mut().wait_for_unshard().unwrap();
        assert_eq!(group.borrow().sharded_state(), ShardedState::Unsharded);
    }
}
