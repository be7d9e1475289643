use std::{future::Future, time::Duration};

use tokio::time::Instant;

use crate::vault::VaultError;

/// Caller-supplied deadline for vault round trips. The core never retries and
/// never spawns work; dropping the returned future cancels the call outright.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallContext {
    deadline: Option<Instant>,
}

impl CallContext {
    /// No deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Runs one vault call, failing with [`VaultError::TimedOut`] once the deadline passes.
    pub async fn run<T, F>(&self, call: F) -> Result<T, VaultError>
    where
        F: Future<Output = Result<T, VaultError>>,
    {
        match self.deadline {
            None => call.await,
            Some(deadline) => tokio::time::timeout_at(deadline, call)
                .await
                .map_err(|_| VaultError::TimedOut)?,
        }
    }
}
