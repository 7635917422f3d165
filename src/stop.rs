use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A cooperative stop request, shared between the acquisition loop, the
/// consumer, and the interrupt handler.
///
/// There are no preemption points inside a host service call, so the token is
/// only consulted at defined suspension points: the start of each enumeration
/// pass, the start of each retry delay, and wherever the consumer chooses to
/// poll it.
#[derive(Clone, Debug, Default)]
pub struct StopToken {
    requested: Arc<AtomicBool>,
}

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask everyone holding a clone of this token to wind down. Safe to call
    /// from a signal handler thread, and idempotent.
    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_is_visible_through_clones() {
        let token = StopToken::new();
        let clone = token.clone();

        assert!(!clone.is_requested());
        token.request();
        assert!(clone.is_requested());

        // Idempotent.
        token.request();
        assert!(token.is_requested());
    }
}
