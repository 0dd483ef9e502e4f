use thiserror::Error;

/// Fatal errors raised by the FSDP engine.
///
/// Construction-time configuration mistakes are returned here so a caller can
/// react to a bad sharding request. Violations of the state machine's own
/// invariants (observed at runtime, in the hot forward/backward path) are not
/// represented as variants: they `panic!`/`debug_assert!` instead, since by
/// definition they indicate a defect in this crate rather than something a
/// caller can recover from.
#[derive(Debug, Error)]
pub enum FsdpError {
    #[error("FSDP group expects a single original parameter dtype but got {0:?}")]
    MixedDtypes(Vec<tch::Kind>),

    #[error("parameter `{0}` is not reachable from the bound module's subtree")]
    ParamNotInModule(String),

    #[error("AllGatherStateHolder already holds a pending all-gather result")]
    StateHolderOccupied,

    #[error("collective transport failed: {0}")]
    Collective(#[from] anyhow::Error),
}
