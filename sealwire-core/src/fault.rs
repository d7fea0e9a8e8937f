//! Test-only fault injection.
//!
//! A [`FaultController`] is a set of armed one-shot faults. Objects consult
//! it at the points where each fault applies; tripping a fault disarms it.
//! The controller is handed to objects explicitly, never read from a
//! global.

use std::sync::atomic::{AtomicU32, Ordering};

/// Injectable faults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FaultKind {
    /// Flip a byte of an envelope header on emission.
    CorruptHeader = 1 << 0,
    /// Flip a byte of a payload segment or data record on receipt.
    CorruptPayload = 1 << 1,
    /// Flip a byte of a signature before verification.
    CorruptSignature = 1 << 2,
    /// Fail the next transport read.
    TransportRead = 1 << 3,
    /// Fail the next transport write.
    TransportWrite = 1 << 4,
    /// Fail the next allocation that can fall back to the heap.
    AllocFailure = 1 << 5,
    /// Deny the next authentication decision.
    DenyAuth = 1 << 6,
}

/// Armed fault set, shareable across threads.
#[derive(Debug, Default)]
pub struct FaultController {
    armed: AtomicU32,
}

impl FaultController {
    /// Controller with nothing armed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm `kind` for one occurrence.
    pub fn arm(&self, kind: FaultKind) {
        self.armed.fetch_or(kind as u32, Ordering::SeqCst);
    }

    /// Disarm `kind`.
    pub fn disarm(&self, kind: FaultKind) {
        self.armed.fetch_and(!(kind as u32), Ordering::SeqCst);
    }

    /// Whether `kind` is armed.
    pub fn is_armed(&self, kind: FaultKind) -> bool {
        self.armed.load(Ordering::SeqCst) & kind as u32 != 0
    }

    /// Consume `kind` if armed. Returns true when the caller should inject
    /// the fault.
    pub fn trip(&self, kind: FaultKind) -> bool {
        let previous = self.armed.fetch_and(!(kind as u32), Ordering::SeqCst);
        let tripped = previous & kind as u32 != 0;
        if tripped {
            tracing::debug!(fault = ?kind, "injecting fault");
        }
        tripped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trip_is_one_shot() {
        let faults = FaultController::new();
        assert!(!faults.trip(FaultKind::CorruptHeader));
        faults.arm(FaultKind::CorruptHeader);
        faults.arm(FaultKind::DenyAuth);
        assert!(faults.trip(FaultKind::CorruptHeader));
        assert!(!faults.trip(FaultKind::CorruptHeader));
        assert!(faults.is_armed(FaultKind::DenyAuth));
        faults.disarm(FaultKind::DenyAuth);
        assert!(!faults.is_armed(FaultKind::DenyAuth));
    }
}
