use std::future::Future;

use tokio_util::sync::{CancellationToken, DropGuard, WaitForCancellationFuture};
use uuid::Uuid;

use crate::{CalciferError, Result};

/// Cancellation handle plus the observability identifiers that travel with a
/// request through the pipeline.
///
/// Cloning shares the cancellation state; [`RequestContext::detached`] breaks
/// it while keeping the identifiers, which is what the streaming caching
/// relay needs for its terminal cache write.
#[derive(Clone, Debug)]
pub struct RequestContext {
    token: CancellationToken,
    pub trace_id: String,
    pub request_id: String,
    pub model: Option<String>,
    pub provider: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            trace_id: Uuid::new_v4().simple().to_string(),
            request_id: Uuid::new_v4().to_string(),
            model: None,
            provider: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    /// Guard that cancels this context when dropped. The HTTP boundary ties
    /// one to each response so a client disconnect propagates downward.
    pub fn cancel_on_drop(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }

    /// A context with the same trace/request identifiers whose cancellation
    /// is not linked to this one.
    pub fn detached(&self) -> Self {
        Self {
            token: CancellationToken::new(),
            trace_id: self.trace_id.clone(),
            request_id: self.request_id.clone(),
            model: self.model.clone(),
            provider: self.provider.clone(),
        }
    }

    /// Race `fut` against cancellation of this context.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            _ = self.token.cancelled() => Err(CalciferError::Cancelled),
            out = fut => out,
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
