//! Change notification seam.
//!
//! # Responsibility
//! - Tell interested parties that attendance, delegation or ballot state may
//!   have changed after a commit.
//!
//! # Invariants
//! - Notifications carry occurrence only. Receivers recompute from the store
//!   and never patch state from the payload, so duplicates and drops are
//!   harmless.
//! - Notifiers are invoked after the write committed, never inside it.

use crate::model::{AssemblyId, MemberId, VoteId};

/// What may have changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateChange {
    Attendance { assembly: AssemblyId },
    Delegation { principal: MemberId },
    Ballots { vote: VoteId },
}

/// Receiver of post-commit change signals (live-update transport adapter).
pub trait ChangeNotifier: Send + Sync {
    fn state_changed(&self, change: StateChange);
}

/// Drops every signal.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl ChangeNotifier for NoopNotifier {
    fn state_changed(&self, _change: StateChange) {}
}
