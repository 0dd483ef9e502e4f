//! Collective transport interface contract (§4.2).
//!
//! The real all-gather/reduce-scatter primitives live in a transport crate
//! this engine does not own (Non-goals: "does not implement the collective
//! transport itself"). `CollectiveTransport` is the seam: production code
//! plugs in a real NCCL/gloo-backed implementation, while
//! [`SingleProcessTransport`] below gives the param-group state machine
//! something to call in single-worker unit tests.

use std::sync::Arc;

use tch::{Kind, Tensor};

use crate::accelerator::{AcceleratorEvent, AcceleratorStream, CpuEvent};
use crate::error::FsdpError;
use crate::mesh::ProcessGroupHandle;
use crate::param::FSDPParam;

/// Handle returned by `all_gather`: the concatenated output buffer plus
/// enough metadata to split it back into per-param views in `copy_out`.
pub struct AllGatherResult {
    pub output: Tensor,
    pub event: Arc<dyn AcceleratorEvent>,
    /// Numel of each input param's local shard, in order, so `copy_out` can
    /// slice the flat `output` buffer without needing the params again.
    shard_numels: Vec<i64>,
}

impl std::fmt::Debug for AllGatherResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllGatherResult")
            .field("output_numel", &self.output.numel())
            .field("shard_numels", &self.shard_numels)
            .finish()
    }
}

pub trait CollectiveTransport: std::fmt::Debug + Send + Sync {
    /// Concatenate each param's local shard into one contiguous buffer on
    /// `copy_in_stream` (casting to `dtype` if needed), enqueue the
    /// all-gather on `comm_stream`.
    #[allow(clippy::too_many_arguments)]
    fn all_gather(
        &self,
        params: &[FSDPParam],
        group: &dyn ProcessGroupHandle,
        async_op: bool,
        copy_in_stream: &dyn AcceleratorStream,
        comm_stream: &dyn AcceleratorStream,
        dtype: Kind,
    ) -> Result<AllGatherResult, FsdpError>;

    /// Split the gathered buffer into per-param unsharded views, without a
    /// data copy where strides permit, and install each view via
    /// `params[i].to_unsharded`.
    fn all_gather_copy_out(
        &self,
        result: &AllGatherResult,
        params: &mut [FSDPParam],
        group: &dyn ProcessGroupHandle,
    ) -> Result<(), FsdpError>;

    /// Scale `grads` by `1/pre_factor`, reduce-scatter by summation, scale
    /// the local shard by `1/post_factor`, and write the result into the
    /// sharded gradient slot of `params[indices[i]]` for each `grads[i]`.
    /// Returns a completion event. Scaling order (pre-then-post) is
    /// observable and must not be reordered.
    #[allow(clippy::too_many_arguments)]
    fn reduce_scatter(
        &self,
        params: &mut [FSDPParam],
        indices: &[usize],
        grads: &[Tensor],
        group: &dyn ProcessGroupHandle,
        rs_stream: &dyn AcceleratorStream,
        output_dtype: Kind,
        pre_factor: f64,
        post_factor: f64,
    ) -> Result<Arc<dyn AcceleratorEvent>, FsdpError>;
}

/// Single-worker transport: "all-gather" is just a concatenation of the
/// local shards (there is nothing to gather from anyone else), and
/// "reduce-scatter" is scale-then-slice with no cross-worker sum. Used by
/// unit tests that exercise the state machine's control flow without a real
/// multi-process transport, which the spec treats as external.
#[derive(Debug, Default)]
pub struct SingleProcessTransport;

impl CollectiveTransport for SingleProcessTransport {
    fn all_gather(
        &self,
        params: &[FSDPParam],
        group: &dyn ProcessGroupHandle,
        _async_op: bool,
        _copy_in_stream: &dyn AcceleratorStream,
        _comm_stream: &dyn AcceleratorStream,
        dtype: Kind,
    ) -> Result<AllGatherResult, FsdpError> {
        debug_assert_eq!(group.size(), 1, "SingleProcessTransport requires world size 1");
        let _no_grad = tch::no_grad_guard();
        let shard_numels: Vec<i64> = params.iter().map(|p| p.sharded_numel()).collect();
        let shards: Vec<Tensor> = params
            .iter()
            .map(|p| p.sharded_storage().to_kind(dtype))
            .collect();
        let output = if shards.is_empty() {
            Tensor::zeros([0], (dtype, params.first().map_or(tch::Device::Cpu, |p| p.device())))
        } else {
            Tensor::cat(&shards, 0)
        };
        let event = CpuEvent::new();
        Ok(AllGatherResult {
            output,
            event,
            shard_numels,
        })
    }

    fn all_gather_copy_out(
        &self,
        result: &AllGatherResult,
        params: &mut [FSDPParam],
        _group: &dyn ProcessGroupHandle,
    ) -> Result<(), FsdpError> {
        let mut offset = 0i64;
        for (param, &numel) in params.iter_mut().zip(&result.shard_numels) {
            let view = result
                .output
                .narrow(0, offset, numel)
                .to_kind(param.orig_dtype)
                .view(param.orig_shape.as_slice());
            param.to_unsharded(view);
            offset += numel;
        }
        Ok(())
    }

    fn reduce_scatter(
        &self,
        params: &mut [FSDPParam],
        indices: &[usize],
        grads: &[Tensor],
        group: &dyn ProcessGroupHandle,
        _rs_stream: &dyn AcceleratorStream,
        output_dtype: Kind,
        pre_factor: f64,
        post_factor: f64,
    ) -> Result<Arc<dyn AcceleratorEvent>, FsdpError> {
        debug_assert_eq!(group.size(), 1, "SingleProcessTransport requires world size 1");
        debug_assert_eq!(indices.len(), grads.len());
        let _no_grad = tch::no_grad_guard();
        for (&index, grad) in indices.iter().zip(grads) {
            let param = &mut params[index];
            let scaled = grad
                .f_div_scalar(pre_factor)
                .unwrap()
                .f_div_scalar(post_factor)
                .unwrap();
            let reshaped = scaled
                .reshape([-1])
                .narrow(0, 0, param.sharded_numel())
                .to_kind(output_dtype);
            param.set_sharded_grad(reshaped);
        }
        Ok(CpuEvent::new())
    }
}
