//! Stop signal shared between a run's controller and its processing loop.

use tokio::sync::watch;

/// Owning side; flipping it wakes every [`StopToken`].
#[derive(Debug)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

/// Observing side, cheap to clone.
#[derive(Debug, Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

pub fn stop_pair() -> (StopHandle, StopToken) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopToken { rx })
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn token(&self) -> StopToken {
        StopToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl StopToken {
    /// A token that is never triggered.
    pub fn never() -> Self {
        let (tx, rx) = watch::channel(false);
        // `stopped()` pends forever once the sender is gone.
        drop(tx);
        Self { rx }
    }

    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once stop has been requested.
    pub async fn stopped(&self) {
        let mut rx = self.rx.clone();
        if rx.wait_for(|stopped| *stopped).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_wakes_waiters() {
        let (handle, token) = stop_pair();
        assert!(!token.is_stopped());

        let waiter = tokio::spawn({
            let token = token.clone();
            async move { token.stopped().await }
        });
        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(token.is_stopped());
        assert!(handle.is_stopped());
        assert!(handle.token().is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_token_pends() {
        let token = StopToken::never();
        assert!(!token.is_stopped());
        let result = tokio::time::timeout(Duration::from_secs(5), token.stopped()).await;
        assert!(result.is_err());
    }
}
