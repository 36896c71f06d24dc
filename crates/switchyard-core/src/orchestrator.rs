// ABOUTME: Invocation orchestrator - routes a request, streams deltas, and fails over
// ABOUTME: Records each attempt's outcome on the backend's circuit breaker

use crate::backend::{Backend, Fragment};
use crate::breaker::BreakerTable;
use crate::error::{BackendInvocationError, ErrorCode};
use crate::normalize::normalize_one_shot;
use crate::router::BackendRouter;
use crate::types::{BackendInvokeRequest, BackendMode, BackendName, BackendStreamEvent};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Live events for one request. The last item is an `Err` only when every
/// candidate backend failed.
pub type EventStream = BoxStream<'static, Result<BackendStreamEvent, BackendInvocationError>>;

type EventSender = mpsc::Sender<Result<BackendStreamEvent, BackendInvocationError>>;

/// Details for an attempt whose stream stopped without reporting an outcome.
const RUNNER_ABORTED: &str = "runner aborted";

/// How a single backend attempt ended.
enum Attempt {
    /// Backend reported a clean finish
    Succeeded,
    /// Caller cancelled or stopped listening; nothing to record
    Abandoned,
    Failed(BackendInvocationError),
}

#[derive(Clone)]
pub struct Orchestrator {
    router: BackendRouter,
    backends: Arc<HashMap<BackendName, Arc<dyn Backend>>>,
}

impl Orchestrator {
    pub fn new(router: BackendRouter, backends: Vec<Arc<dyn Backend>>) -> Self {
        let backends = backends
            .into_iter()
            .map(|backend| (backend.name(), backend))
            .collect();
        Self {
            router,
            backends: Arc::new(backends),
        }
    }

    pub fn router(&self) -> &BackendRouter {
        &self.router
    }

    pub fn breakers(&self) -> &Arc<BreakerTable> {
        self.router.breakers()
    }

    /// Stream a request's deltas as they arrive, failing over between
    /// candidates. Dropping the stream cancels the running attempt.
    pub fn stream(&self, request: BackendInvokeRequest, mode: BackendMode) -> EventStream {
        let (tx, rx) = mpsc::channel(100);
        let this = self.clone();

        tokio::spawn(async move {
            if let Some(err) = this.run_request(&request, mode, &tx).await {
                let _ = tx.send(Err(err)).await;
            }
        });

        Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
    }

    /// Run a request to completion and return one cleaned-up reply.
    ///
    /// A cancelled request returns whatever text arrived before cancellation.
    pub async fn complete(
        &self,
        request: BackendInvokeRequest,
        mode: BackendMode,
    ) -> Result<String, BackendInvocationError> {
        let mut events = self.stream(request, mode);
        let mut full_response = String::new();
        while let Some(event) = events.next().await {
            full_response.push_str(event?.text());
        }
        Ok(normalize_one_shot(full_response.trim()))
    }

    /// Drive the candidate list. Returns the error to surface, if any.
    async fn run_request(
        &self,
        request: &BackendInvokeRequest,
        mode: BackendMode,
        tx: &EventSender,
    ) -> Option<BackendInvocationError> {
        let candidates = self.router.select(mode, Instant::now());
        tracing::debug!(
            mode = %mode,
            candidates = ?candidates,
            session_id = %request.session_id,
            "Selected backend candidates"
        );

        let mut last_error = None;
        for (index, name) in candidates.iter().copied().enumerate() {
            match self.attempt(name, request, tx).await {
                Attempt::Succeeded => {
                    self.breakers().mark_success(name);
                    tracing::info!(backend = %name, attempt = index + 1, "Backend request succeeded");
                    return None;
                }
                Attempt::Abandoned => {
                    tracing::debug!(backend = %name, "Request cancelled, no outcome recorded");
                    return None;
                }
                Attempt::Failed(err) => {
                    self.breakers().mark_failure(name, Instant::now());
                    let remaining = candidates.len() - index - 1;
                    if err.transient {
                        tracing::warn!(
                            backend = %name,
                            code = %err.code,
                            remaining,
                            "Backend attempt failed"
                        );
                    } else {
                        tracing::error!(
                            backend = %name,
                            code = %err.code,
                            remaining,
                            "Backend attempt aborted"
                        );
                    }
                    last_error = Some(err);
                }
            }
        }

        if last_error.is_none() {
            tracing::error!(mode = %mode, "No backend candidates to attempt");
        }
        last_error
    }

    async fn attempt(
        &self,
        name: BackendName,
        request: &BackendInvokeRequest,
        tx: &EventSender,
    ) -> Attempt {
        let Some(backend) = self.backends.get(&name) else {
            return Attempt::Failed(BackendInvocationError::new(
                name,
                ErrorCode::SpawnFailure,
                "no adapter registered for this backend",
            ));
        };

        let mut fragments = backend.invoke(request).await;
        loop {
            let item = tokio::select! {
                biased;
                _ = tx.closed() => return Attempt::Abandoned,
                item = fragments.next() => item,
            };

            match item {
                Some(Ok(Fragment::Text(text))) => {
                    if text.is_empty() {
                        continue;
                    }
                    if tx.send(Ok(BackendStreamEvent::delta(text))).await.is_err() {
                        return Attempt::Abandoned;
                    }
                }
                Some(Ok(Fragment::Finished)) => return Attempt::Succeeded,
                Some(Err(err)) => return Attempt::Failed(err),
                None if request.cancellation.is_cancelled() => return Attempt::Abandoned,
                // The stream died without a terminal item; never a success
                None => {
                    return Attempt::Failed(BackendInvocationError::new(
                        name,
                        ErrorCode::ExitNonzero,
                        RUNNER_ABORTED,
                    ));
                }
            }
        }
    }
}
