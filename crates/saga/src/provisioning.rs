//! Workspace provisioning: the HTTP client and its bounded retry loop.
//!
//! [`ProvisioningClient`] POSTs a [`ProvisionRequest`] to
//! `{base_url}/provision`. The provisioning service must treat a repeated
//! request for the same workspace as a no-op, because a resumed saga re-issues
//! the call without knowing whether an earlier attempt landed.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use onboard_core::backoff::BackoffPolicy;
use onboard_core::saga::Saga;
use onboard_core::types::SagaId;
use onboard_core::workspace::workspace_id_for;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// HTTP request timeout for a single provisioning attempt.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// Body of a provisioning call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    /// Deterministic per subject, so retries name the same workspace.
    pub workspace_id: String,
    pub owner_id: String,
    pub saga_id: SagaId,
}

impl ProvisionRequest {
    pub fn for_saga(saga: &Saga) -> Self {
        Self {
            workspace_id: workspace_id_for(&saga.subject_id),
            owner_id: saga.subject_id.clone(),
            saga_id: saga.id,
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// Network, DNS, timeout and similar failures.
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Provisioning service returned HTTP {0}")]
    HttpStatus(u16),

    #[error("Provisioning failed: {0}")]
    Other(String),
}

// ---------------------------------------------------------------------------
// Provisioner
// ---------------------------------------------------------------------------

/// One provisioning attempt. Retrying is the caller's job.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(&self, request: &ProvisionRequest) -> Result<(), ProvisionError>;
}

/// Provisioner backed by the workspace service's HTTP API.
pub struct ProvisioningClient {
    client: reqwest::Client,
    endpoint: String,
}

impl ProvisioningClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ProvisionError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/provision", base_url.trim_end_matches('/')),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Provisioner for ProvisioningClient {
    async fn provision(&self, request: &ProvisionRequest) -> Result<(), ProvisionError> {
        let response = self.client.post(&self.endpoint).json(request).send().await?;
        if !response.status().is_success() {
            return Err(ProvisionError::HttpStatus(response.status().as_u16()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Retry loop
// ---------------------------------------------------------------------------

/// How a bounded provisioning run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    Succeeded { attempts: u32 },
    /// The policy ran out of attempts or time.
    Exhausted { attempts: u32, last_error: String },
    /// Shutdown interrupted the run.
    Cancelled { attempts: u32 },
}

impl ProvisionOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            ProvisionOutcome::Succeeded { attempts }
            | ProvisionOutcome::Exhausted { attempts, .. }
            | ProvisionOutcome::Cancelled { attempts } => *attempts,
        }
    }
}

/// Call `provisioner` until it succeeds or `policy` says stop.
///
/// Both the calls and the backoff sleeps are raced against `cancel`.
pub async fn provision_with_retry(
    provisioner: &dyn Provisioner,
    request: &ProvisionRequest,
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
) -> ProvisionOutcome {
    let started = Instant::now();
    let mut attempts = 0;

    loop {
        if cancel.is_cancelled() {
            return ProvisionOutcome::Cancelled { attempts };
        }
        attempts += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => return ProvisionOutcome::Cancelled { attempts },
            result = provisioner.provision(request) => result,
        };

        let err = match result {
            Ok(()) => return ProvisionOutcome::Succeeded { attempts },
            Err(e) => e,
        };

        let Some(delay) = policy.next_delay(attempts, started.elapsed()) else {
            tracing::warn!(
                saga_id = %request.saga_id,
                attempts,
                error = %err,
                "Provisioning retries exhausted"
            );
            return ProvisionOutcome::Exhausted {
                attempts,
                last_error: err.to_string(),
            };
        };

        tracing::warn!(
            saga_id = %request.saga_id,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Provisioning attempt failed, retrying"
        );

        tokio::select! {
            _ = cancel.cancelled() => return ProvisionOutcome::Cancelled { attempts },
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use onboard_core::types::new_saga_id;

    use super::*;
    use crate::testing::StubProvisioner;

    fn request() -> ProvisionRequest {
        ProvisionRequest {
            workspace_id: workspace_id_for("u1"),
            owner_id: "u1".into(),
            saga_id: new_saga_id(),
        }
    }

    /// Serve `router` on an ephemeral port and return its base URL.
    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn request_serializes_camel_case() {
        let req = request();
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["ownerId"], "u1");
        assert_eq!(json["workspaceId"], req.workspace_id);
        assert_eq!(json["sagaId"], req.saga_id.to_string());
    }

    #[test]
    fn endpoint_tolerates_trailing_slash() {
        let client = ProvisioningClient::new("http://svc:8081/", DEFAULT_REQUEST_TIMEOUT).unwrap();
        assert_eq!(client.endpoint(), "http://svc:8081/provision");
    }

    #[tokio::test]
    async fn client_posts_request_body() {
        let seen = Arc::new(tokio::sync::Mutex::new(None));
        let captured = seen.clone();
        let router = Router::new().route(
            "/provision",
            post(move |Json(body): Json<serde_json::Value>| {
                let captured = captured.clone();
                async move {
                    *captured.lock().await = Some(body);
                    StatusCode::CREATED
                }
            }),
        );
        let client = ProvisioningClient::new(&serve(router).await, DEFAULT_REQUEST_TIMEOUT).unwrap();

        client.provision(&request()).await.unwrap();

        let body = seen.lock().await.clone().unwrap();
        assert_eq!(body["ownerId"], "u1");
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let router = Router::new().route("/provision", post(|| async { StatusCode::SERVICE_UNAVAILABLE }));
        let client = ProvisioningClient::new(&serve(router).await, DEFAULT_REQUEST_TIMEOUT).unwrap();

        let err = client.provision(&request()).await.unwrap_err();
        assert_matches!(err, ProvisionError::HttpStatus(503));
    }

    #[tokio::test]
    async fn unreachable_service_is_a_request_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = ProvisioningClient::new(&format!("http://{addr}"), Duration::from_secs(1)).unwrap();

        let err = client.provision(&request()).await.unwrap_err();
        assert_matches!(err, ProvisionError::Request(_));
    }

    #[tokio::test]
    async fn always_failing_service_is_tried_exactly_max_attempts() {
        let stub = StubProvisioner::failing();
        let outcome = provision_with_retry(
            &stub,
            &request(),
            &BackoffPolicy::immediate(3),
            &CancellationToken::new(),
        )
        .await;

        assert_matches!(outcome, ProvisionOutcome::Exhausted { attempts: 3, .. });
        assert_eq!(stub.calls(), 3);
    }

    #[tokio::test]
    async fn success_after_transient_failures() {
        let stub = StubProvisioner::failing_times(2);
        let outcome = provision_with_retry(
            &stub,
            &request(),
            &BackoffPolicy::immediate(3),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, ProvisionOutcome::Succeeded { attempts: 3 });
    }

    #[tokio::test]
    async fn retries_against_a_real_endpoint() {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/provision",
            post(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        StatusCode::BAD_GATEWAY
                    } else {
                        StatusCode::OK
                    }
                }
            }),
        );
        let client = ProvisioningClient::new(&serve(router).await, DEFAULT_REQUEST_TIMEOUT).unwrap();

        let outcome = provision_with_retry(
            &client,
            &request(),
            &BackoffPolicy::fixed(3, Duration::from_millis(5)),
            &CancellationToken::new(),
        )
        .await;

        assert_eq!(outcome, ProvisionOutcome::Succeeded { attempts: 2 });
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let stub = StubProvisioner::failing();
        let cancel = CancellationToken::new();
        let policy = BackoffPolicy::fixed(5, Duration::from_secs(60));

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let outcome = provision_with_retry(&stub, &request(), &policy, &cancel).await;
        assert_eq!(outcome, ProvisionOutcome::Cancelled { attempts: 1 });
    }

    #[tokio::test]
    async fn elapsed_budget_stops_retries_early() {
        let stub = StubProvisioner::failing();
        let policy = BackoffPolicy {
            max_elapsed: Some(Duration::from_millis(1)),
            ..BackoffPolicy::fixed(10, Duration::from_millis(50))
        };

        let outcome = provision_with_retry(&stub, &request(), &policy, &CancellationToken::new()).await;
        assert_matches!(outcome, ProvisionOutcome::Exhausted { attempts: 1, .. });
    }
}
