use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag for an in-flight transfer.
///
/// Clones share one flag, so the transport side can keep a handle and set it
/// when the client disconnects. The copy loops poll the flag at the top of
/// every buffer iteration; a write already in flight is never interrupted,
/// cancellation only prevents starting the next read.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the transfer before its next buffer iteration.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::CancelSignal;

    #[test]
    fn test_shared_flag() {
        let signal = CancelSignal::new();
        let handle = signal.clone();
        assert!(!signal.is_cancelled());

        handle.cancel();
        assert!(signal.is_cancelled());
    }
}
