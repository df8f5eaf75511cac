//! Cooperative cancellation

use std::sync::Arc;
use tokio::sync::watch;

/// Shared cancellation flag
///
/// Cancelling never interrupts running work; holders check the flag at their
/// own suspension points or wait on [`CancelToken::cancelled`].
#[derive(Clone, Debug)]
pub struct CancelToken {
    flag: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Create a new, uncancelled token
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self { flag: Arc::new(flag) }
    }

    /// Mark as cancelled; returns false if already cancelled
    pub fn cancel(&self) -> bool {
        !self.flag.send_replace(true)
    }

    /// Check the flag
    pub fn is_cancelled(&self) -> bool {
        *self.flag.borrow()
    }

    /// Wait until cancelled
    pub async fn cancelled(&self) {
        let mut rx = self.flag.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_once() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        assert!(token.cancel());
        assert!(!token.cancel());
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_for_cancel() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel();
        waiter.await.unwrap();

        // Already cancelled tokens resolve immediately
        token.cancelled().await;
    }
}
