//! State shared with the external bumper interrupt.
//!
//! The handler only ever sets one flag; the control loop swaps it back to
//! `false` once per tick.

use core::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct BumperFlag {
    pending: AtomicBool,
}

impl BumperFlag {
    pub const fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
        }
    }

    /// Called from interrupt context.
    #[inline]
    pub fn signal(&self) {
        self.pending.store(true, Ordering::Release);
    }

    /// Consume the flag. `true` if the interrupt fired since the last call.
    #[inline]
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::AcqRel)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

impl Default for BumperFlag {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static FLAG: BumperFlag = BumperFlag::new();

    #[test]
    fn test_flag_consumed_once() {
        assert!(!FLAG.take());
        FLAG.signal();
        FLAG.signal();
        assert!(FLAG.is_pending());
        assert!(FLAG.take());
        assert!(!FLAG.take());
    }
}
