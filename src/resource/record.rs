//! Per-resource preparation records.

use crate::cancel::CancelToken;
use crate::resource::shared::{JoinPreparation, ObservePreparation, PrepFactory, SharedPreparation};

/// The access pattern a resource was (or is being) prepared for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PreparedMode {
    /// No established fit for either access pattern; must be prepared
    /// before use.
    Unknown,
    /// Prepared for concurrent (shared) access.
    Concurrent,
    /// Prepared for exclusive access.
    Exclusive,
}

/// Immutable bookkeeping entry pairing a resource's current preparation
/// with the mode it targets.
///
/// Records are replaced, never mutated: the successor is stored in the
/// table before its chained delegate can run, so joiners arriving between
/// replacement and chain-start already see the new target mode.
#[derive(Clone, Debug)]
pub(crate) struct PreparationRecord {
    shared: SharedPreparation,
    target_mode: PreparedMode,
}

impl PreparationRecord {
    /// Creates a record whose shared computation is produced by `factory`.
    pub(crate) fn new(factory: PrepFactory, target_mode: PreparedMode, can_cancel: bool) -> Self {
        Self {
            shared: SharedPreparation::new(factory, can_cancel),
            target_mode,
        }
    }

    pub(crate) const fn target_mode(&self) -> PreparedMode {
        self.target_mode
    }

    /// Attempts to join the preparation as a new waiter.
    pub(crate) fn try_join(&self, ct: &CancelToken) -> Option<JoinPreparation> {
        self.shared.try_join(ct)
    }

    /// Returns a passive observer used to chain a successor after this
    /// preparation has run to rest.
    pub(crate) fn observe(&self) -> ObservePreparation {
        self.shared.observe()
    }

    pub(crate) fn is_faulted(&self) -> bool {
        self.shared.is_faulted()
    }
}
