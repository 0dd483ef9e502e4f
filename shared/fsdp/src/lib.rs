//! Fully-Sharded Data-Parallel (FSDP) parameter-group engine.
//!
//! Partitions a module's parameters across a process mesh, reconstitutes
//! them on demand for forward/backward, and reduces gradients back to
//! sharded form, overlapping collective communication with computation on an
//! accelerator. See `SPEC_FULL.md` at the repository root for the full
//! design; [`param_group::FSDPParamGroup`] is the state machine this crate
//! exists to implement.

pub mod accelerator;
pub mod all_gather_state;
pub mod collectives;
pub mod config;
pub mod device_utils;
pub mod error;
pub mod hooks;
pub mod mesh;
pub mod module_tree;
pub mod param;
pub mod param_group;

pub use config::{fully_shard, FullyShardConfig};
pub use error::FsdpError;
pub use param::{sharded_numel, FSDPParam, ShardedState};
pub use param_group::{grad_divide_factors, FSDPParamGroup, TrainingState};
