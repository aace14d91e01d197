//! Cancellable one-shot timers

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A timer that runs a future once after a delay.
///
/// Arming cancels any instance that is still pending, so at most one
/// callback is ever scheduled.
#[derive(Debug, Default)]
pub struct OneShotTimer {
    armed: Mutex<Option<CancellationToken>>,
}

impl OneShotTimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm<F>(&self, after: Duration, callback: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let previous = match self.armed.lock() {
            Ok(mut guard) => guard.replace(token.clone()),
            Err(poisoned) => poisoned.into_inner().replace(token.clone()),
        };
        if let Some(previous) = previous {
            previous.cancel();
        }

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(after) => {
                    token.cancel();
                    callback.await;
                }
            }
        });
    }

    pub fn disarm(&self) {
        let previous = match self.armed.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    /// A callback is scheduled and has not fired yet
    pub fn is_armed(&self) -> bool {
        match self.armed.lock() {
            Ok(guard) => guard.as_ref().is_some_and(|t| !t.is_cancelled()),
            Err(poisoned) => poisoned.into_inner().as_ref().is_some_and(|t| !t.is_cancelled()),
        }
    }
}

impl Drop for OneShotTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}
