//! Process mesh description (§3, `MeshInfo`).

use std::fmt::Debug;
use std::sync::Arc;

/// Opaque transport handle for one dimension of the process mesh. The real
/// implementation wraps whatever the collective transport uses to identify a
/// sub-group (an NCCL communicator, a `ProcessGroup`, ...); this crate only
/// needs `size()` and `rank()` from it.
pub trait ProcessGroupHandle: Debug + Send + Sync {
    fn size(&self) -> usize;
    fn rank(&self) -> usize;
}

/// Single-process stand-in used by tests: one worker, rank 0.
#[derive(Debug, Clone, Copy)]
pub struct SingleProcessGroup;

impl ProcessGroupHandle for SingleProcessGroup {
    fn size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }
}

/// Fixed-size mock group for exercising multi-worker arithmetic (gradient
/// divide factors, shard sizing) without a real transport.
#[derive(Debug, Clone, Copy)]
pub struct FixedSizeGroup {
    pub size: usize,
    pub rank: usize,
}

impl ProcessGroupHandle for FixedSizeGroup {
    fn size(&self) -> usize {
        self.size
    }

    fn rank(&self) -> usize {
        self.rank
    }
}

/// Describes the process mesh a parameter group shards/replicates across.
///
/// `shard_group` is required (plain FSDP); `replicate_group` is present only
/// for HSDP (hybrid-sharded data parallel), where workers are first grouped
/// into replicate-sized cliques and each clique shards independently.
#[derive(Debug, Clone)]
pub struct MeshInfo {
    pub shard_group: Arc<dyn ProcessGroupHandle>,
    pub replicate_group: Option<Arc<dyn ProcessGroupHandle>>,
}

impl MeshInfo {
    pub fn fsdp(shard_group: Arc<dyn ProcessGroupHandle>) -> Self {
        Self {
            shard_group,
            replicate_group: None,
        }
    }

    pub fn hsdp(
        shard_group: Arc<dyn ProcessGroupHandle>,
        replicate_group: Arc<dyn ProcessGroupHandle>,
    ) -> Self {
        Self {
            shard_group,
            replicate_group: Some(replicate_group),
        }
    }

    pub fn shard_mesh_size(&self) -> usize {
        self.shard_group.size()
    }

    pub fn replicate_mesh_size(&self) -> usize {
        self.replicate_group.as_ref().map_or(1, |g| g.size())
    }

    /// `shard_size × replicate_size`.
    pub fn data_parallel_world_size(&self) -> usize {
        self.shard_mesh_size() * self.replicate_mesh_size()
    }
}
