//! Per-parameter FSDP state (§3 `FSDPParam`, §4.1).

use tch::{Device, Kind, Tensor};

use crate::module_tree::{ParamCellHandle, ParamCellValue, ParamModuleInfo};

/// Two-valued sharded/unsharded state, mirrored at both the param and group
/// level (§3 `ShardedState` invariant: the group's state equals the state of
/// every contained parameter).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardedState {
    Sharded,
    Unsharded,
}

/// Per-parameter state the group manages: original metadata, the always-
/// resident local shard, and the transient unsharded view/gradient that only
/// exist while the owning group is `Unsharded`.
#[derive(Debug)]
pub struct FSDPParam {
    pub orig_dtype: Kind,
    pub orig_shape: Vec<i64>,
    pub module_binding: ParamModuleInfo,

    /// The handle every bound module already points to (discovery found this
    /// parameter by `Arc::ptr_eq` against it). Mutated in place on every
    /// sharded/unsharded transition instead of being replaced, so the
    /// identity every binding observes never changes (§9 DESIGN NOTES:
    /// "tagged parameter cell with stable identity").
    cell: ParamCellHandle,

    /// Always resident: this worker's slice along dim 0.
    sharded_storage: Tensor,
    /// Present only between `to_unsharded` and `to_sharded`.
    unsharded_param: Option<Tensor>,
    /// This worker's slice of the reduced gradient, written by
    /// `CollectiveTransport::reduce_scatter` (already reduced and re-sharded,
    /// i.e. the same shape/numel as `sharded_storage`, not the full unsharded
    /// gradient — see §4.2). The optimizer is this crate's caller, not a
    /// dependency of it (Non-goals: "does not own the optimizer"), so nothing
    /// in this crate reads it back; `sharded_grad`/`take_sharded_grad` exist
    /// for that external caller to pull the reduced gradient off each param
    /// once `finalize_backward` returns, the way it would read any other
    /// parameter's `.grad` before stepping.
    sharded_grad: Option<Tensor>,

    device: Device,
    /// `init_unsharded_param` is idempotent within a training iteration;
    /// this tracks whether it has already run for the current unshard.
    unsharded_param_initialized: bool,
}

/// Ceiling-division shard size: `ceil(numel / shard_size)`. The last shard is
/// padded with zeros so every worker holds an equal-sized, contiguous slice.
pub fn sharded_numel(orig_numel: i64, shard_world_size: usize) -> i64 {
    let shard_world_size = shard_world_size as i64;
    (orig_numel + shard_world_size - 1) / shard_world_size
}

impl FSDPParam {
    /// Splits `orig_param` into `shard_world_size` equal (ceiling-divided,
    /// zero-padded) chunks along dim 0 and keeps only this worker's shard,
    /// moved to `device`.
    pub fn new(
        orig_param: &Tensor,
        cell: ParamCellHandle,
        module_binding: ParamModuleInfo,
        shard_rank: usize,
        shard_world_size: usize,
        device: Device,
    ) -> Self {
        let _no_grad = tch::no_grad_guard();
        let orig_shape = orig_param.size();
        let orig_dtype = orig_param.kind();
        let orig_numel = orig_param.numel() as i64;
        let flat = orig_param.reshape([-1]);

        let padded_numel = sharded_numel(orig_numel, shard_world_size) * shard_world_size as i64;
        let padded = if padded_numel != orig_numel {
            let mut buf = Tensor::zeros([padded_numel], (orig_dtype, flat.device()));
            buf.narrow(0, 0, orig_numel).copy_(&flat);
            buf
        } else {
            flat
        };

        let shard_size = padded_numel / shard_world_size as i64;
        let sharded_storage = padded
            .narrow(0, shard_rank as i64 * shard_size, shard_size)
            .to(device)
            .contiguous();

        Self {
            orig_dtype,
            orig_shape,
            module_binding,
            cell,
            sharded_storage,
            unsharded_param: None,
            sharded_grad: None,
            device,
            unsharded_param_initialized: false,
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn sharded_storage(&self) -> &Tensor {
        &self.sharded_storage
    }

    pub fn sharded_numel(&self) -> i64 {
        self.sharded_storage.numel() as i64
    }

    pub fn unsharded_param(&self) -> Option<&Tensor> {
        self.unsharded_param.as_ref()
    }

    /// The reduced, re-sharded gradient for this worker's shard, if a
    /// reduce-scatter has completed since the last time it was taken.
    pub fn sharded_grad(&self) -> Option<&Tensor> {
        self.sharded_grad.as_ref()
    }

    /// Takes the reduced gradient, leaving the slot empty. Callers (e.g. an
    /// optimizer step) use this instead of `sharded_grad` when they want to
    /// consume it exactly once, mirroring `Tensor::grad`/`zero_grad` pairs.
    pub fn take_sharded_grad(&mut self) -> Option<Tensor> {
        self.sharded_grad.take()
    }

    pub fn set_sharded_grad(&mut self, grad: Tensor) {
        self.sharded_grad = Some(grad);
    }

    /// Release the unsharded view and restore the sharded-tensor wrapper as
    /// the live parameter attribute on every bound module. Mutates the
    /// existing cell in place rather than allocating a new handle, so every
    /// module bound to this parameter (shared or not) observes the change
    /// through the same `Arc` it already holds.
    pub fn to_sharded(&mut self) {
        self.unsharded_param = None;
        self.unsharded_param_initialized = false;
        *self.cell.write().unwrap() = ParamCellValue::Sharded(self.sharded_storage.shallow_clone());
        self.rebind_all_to_cell();
    }

    /// Install `unsharded_view` (a slice of the group's all-gather output
    /// buffer) as the live parameter attribute on every bound module, again
    /// by mutating the shared cell in place.
    pub fn to_unsharded(&mut self, unsharded_view: Tensor) {
        *self.cell.write().unwrap() = ParamCellValue::Unsharded(unsharded_view.shallow_clone());
        self.unsharded_param = Some(unsharded_view);
        self.rebind_all_to_cell();
    }

    /// Re-points every bound module's attribute at `self.cell`. A no-op for
    /// the common case where the module already holds this exact `Arc`
    /// (that's how discovery found it in the first place); only matters for
    /// a binding whose module attribute was swapped out from under it.
    fn rebind_all_to_cell(&self) {
        for (module, name) in self.module_binding.all_bindings() {
            module.borrow_mut().rebind_parameter(&name, self.cell.clone());
        }
    }

    /// Binds the viewed tensor into the autograd graph so gradients
    /// accumulate into the contiguous all-gather buffer. A no-op after the
    /// first call within an iteration.
    pub fn init_unsharded_param(&mut self) {
        if self.unsharded_param_initialized {
            return;
        }
        if let Some(param) = &self.unsharded_param {
            param.set_requires_grad(true);
        }
        self.unsharded_param_initialized = true;
    }
}
