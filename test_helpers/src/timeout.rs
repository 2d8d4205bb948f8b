//! Bounded waiting on futures in tests.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;

/// Extension trait to panic a test instead of hanging it forever.
#[async_trait]
pub trait FutureTimeout: Future + Send + Sized {
    /// Await the future, panicking if it takes longer than `timeout`.
    async fn with_timeout_panic(self, timeout: Duration) -> Self::Output
    where
        Self::Output: Send,
    {
        tokio::time::timeout(timeout, self)
            .await
            .expect("future did not complete within timeout")
    }

    /// Await the future for at most `timeout`.
    async fn with_timeout(self, timeout: Duration) -> Result<Self::Output, tokio::time::error::Elapsed>
    where
        Self::Output: Send,
    {
        tokio::time::timeout(timeout, self).await
    }
}

#[async_trait]
impl<F: Future + Send + Sized> FutureTimeout for F {}
