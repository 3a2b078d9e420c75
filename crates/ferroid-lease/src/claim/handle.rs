use core::time::Duration;
use std::sync::Arc;

use portable_atomic::{AtomicU8, Ordering};
use tokio::time::Instant;

use crate::{Error, Result};

/// Lifecycle of a [`ClaimHandle`].
///
/// A handle starts in `HasClaim` and moves to `ClaimRelinquished` exactly once,
/// when its TTL elapses. There is no way back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClaimState {
    HasClaim,
    ClaimRelinquished,
}

const HAS_CLAIM: u8 = 0;
const CLAIM_RELINQUISHED: u8 = 1;

/// State shared between a handle (and its clones) and the lease monitor.
#[derive(Debug)]
pub(crate) struct ClaimCell {
    state: AtomicU8,
}

impl ClaimCell {
    pub(crate) const fn new() -> Self {
        Self {
            state: AtomicU8::new(HAS_CLAIM),
        }
    }

    /// Moves the cell to `ClaimRelinquished`. Returns `false` if it already
    /// was.
    pub(crate) fn relinquish(&self) -> bool {
        self.state.swap(CLAIM_RELINQUISHED, Ordering::AcqRel) == HAS_CLAIM
    }

    pub(crate) fn load(&self) -> ClaimState {
        match self.state.load(Ordering::Acquire) {
            HAS_CLAIM => ClaimState::HasClaim,
            _ => ClaimState::ClaimRelinquished,
        }
    }
}

/// Exclusive, time-bounded ownership of one slot.
///
/// Handles are only produced by [`SlotAllocator::claim_expiring`]. The slot is
/// released when the TTL elapses; there is no early release and no renewal.
/// A process that needs to keep an identity must claim again, which may or may
/// not return the same slot.
///
/// Clones share state, so every clone observes the same transition.
///
/// [`SlotAllocator::claim_expiring`]: crate::SlotAllocator::claim_expiring
#[derive(Debug, Clone)]
pub struct ClaimHandle {
    slot: u32,
    deadline: Instant,
    cell: Arc<ClaimCell>,
}

impl ClaimHandle {
    pub(crate) const fn new(slot: u32, deadline: Instant, cell: Arc<ClaimCell>) -> Self {
        Self {
            slot,
            deadline,
            cell,
        }
    }

    /// Returns the owned slot while the claim is held.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ClaimNotHeld`] once the claim has been relinquished,
    /// every time it is called afterwards.
    pub fn get(&self) -> Result<u32> {
        match self.state() {
            ClaimState::HasClaim => Ok(self.slot),
            ClaimState::ClaimRelinquished => Err(Error::ClaimNotHeld),
        }
    }

    /// Current state of the claim.
    ///
    /// Past the deadline this reports `ClaimRelinquished` even if the lease
    /// monitor has not fired yet, so a stale `HasClaim` is never observed.
    pub fn state(&self) -> ClaimState {
        match self.cell.load() {
            ClaimState::HasClaim if Instant::now() < self.deadline => ClaimState::HasClaim,
            _ => ClaimState::ClaimRelinquished,
        }
    }

    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the claim is relinquished.
    pub fn remaining(&self) -> Duration {
        match self.state() {
            ClaimState::HasClaim => self.deadline.saturating_duration_since(Instant::now()),
            ClaimState::ClaimRelinquished => Duration::ZERO,
        }
    }
}
