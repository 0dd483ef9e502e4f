//! Single-slot handoff of a pending all-gather, enabling implicit forward
//! prefetch (§4.5).

use std::sync::Arc;
use parking_lot::Mutex;

use crate::accelerator::AcceleratorEvent;
use crate::collectives::AllGatherResult;
use crate::error::FsdpError;

/// An in-flight all-gather result plus the event marking its copy-out as
/// complete. Held for exactly one step: produced by group K's
/// `wait_for_unshard` while in FORWARD, consumed by group K+1's next
/// `wait_for_unshard`.
pub struct AllGatherState {
    pub result: AllGatherResult,
    pub event: Arc<dyn AcceleratorEvent>,
}

/// Bounds the overlap window to one step: holding more than one pending
/// all-gather at a time would mean forward is running arbitrarily far ahead
/// of copy-out, defeating the memory savings FSDP is for.
#[derive(Default)]
pub struct AllGatherStateHolder {
    slot: Mutex<Option<AllGatherState>>,
}

impl AllGatherStateHolder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the call if the slot is already occupied — calling `put` twice
    /// without an intervening `pop` is a programming error (§4.5, §7).
    pub fn put(&self, state: AllGatherState) -> Result<(), FsdpError> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(FsdpError::StateHolderOccupied);
        }
        *slot = Some(state);
        Ok(())
    }

    pub fn pop(&self) -> Option<AllGatherState> {
        self.slot.lock().take()
    }

    pub fn is_occupied(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl std::fmt::Debug for AllGatherStateHolder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllGatherStateHolder")
            .field("occupied", &self.is_occupied())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accelerator::CpuEvent;
    use crate::collectives::{CollectiveTransport, SingleProcessTransport};
    use crate::mesh::SingleProcessGroup;
    use tch::Kind;

    // Tests here only care about the holder's slot discipline, so build the
    // smallest real `AllGatherResult` via the single-process transport mock
    // rather than reaching into its crate-private fields.
    fn empty_all_gather_result() -> AllGatherResult {
        SingleProcessTransport
            .all_gather(
                &[],
                &SingleProcessGroup,
                false,
                &*crate::accelerator::CpuStream::new("copy_in"),
                &*crate::accelerator::CpuStream::new("comm"),
                Kind::Float,
            )
            .unwrap()
    }

    fn dummy_state() -> AllGatherState {
        AllGatherState {
            result: empty_all_gather_result(),
            event: CpuEvent::new(),
        }
    }

    #[test]
    fn holds_at_most_one_entry() {
        let holder = AllGatherStateHolder::new();
        assert!(!holder.is_occupied());
        holder.put(dummy_state()).unwrap();
        assert!(holder.is_occupied());
        let err = holder.put(dummy_state()).unwrap_err();
        assert!(matches!(err, FsdpError::StateHolderOccupied));
    }

    #[test]
    fn pop_frees_the_slot_for_reuse() {
        let holder = AllGatherStateHolder::new();
        holder.put(dummy_state()).unwrap();
        assert!(holder.pop().is_some());
        assert!(!holder.is_occupied());
        holder.put(dummy_state()).unwrap();
        assert!(holder.is_occupied());
    }

    #[test]
    fn pop_on_empty_holder_is_a_benign_noop() {
        let holder = AllGatherStateHolder::new();
        assert!(holder.pop().is_none());
    }
}
