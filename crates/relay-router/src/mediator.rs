//! HTTP Mediator - executes one dispatch and classifies its outcome.
//!
//! The request is a tiny JSON envelope (`{"messageId": "<id>"}`); the
//! endpoint fetches the real payload itself. There are no HTTP-layer
//! retries: the queue's redelivery cycle is the retry mechanism, so every
//! non-ack classification maps to a visibility decision upstream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info, warn};

use relay_core::{
    MediationOutcome, MediationResponse, MediationType, MediatorSettings, MessagePointer,
    WarningCategory, WarningSeverity,
};

use crate::breaker::CircuitBreakerRegistry;
use crate::warning::WarningService;
use crate::Result;

/// Trait for message mediation.
#[async_trait]
pub trait Mediator: Send + Sync {
    async fn process(&self, pointer: &MessagePointer) -> MediationOutcome;
}

#[derive(Debug, Serialize)]
struct MediationPayload<'a> {
    #[serde(rename = "messageId")]
    message_id: &'a str,
}

#[derive(Debug, Clone)]
pub struct HttpMediatorConfig {
    /// Per-request timeout. Defaults high to tolerate long synchronous
    /// back-ends; operators typically configure much lower.
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpMediatorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(900),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&MediatorSettings> for HttpMediatorConfig {
    fn from(settings: &MediatorSettings) -> Self {
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP/2 mediator with per-target circuit breakers.
pub struct HttpMediator {
    client: Client,
    breakers: Arc<CircuitBreakerRegistry>,
    warnings: Option<Arc<WarningService>>,
}

impl HttpMediator {
    pub fn new(breakers: Arc<CircuitBreakerRegistry>) -> Result<Self> {
        Self::with_config(HttpMediatorConfig::default(), breakers)
    }

    pub fn with_config(
        config: HttpMediatorConfig,
        breakers: Arc<CircuitBreakerRegistry>,
    ) -> Result<Self> {
        // HTTPS negotiates HTTP/2 via ALPN; no prior-knowledge h2c.
        let client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_max_idle_per_host(10)
            .build()?;

        info!(
            timeout_secs = config.timeout.as_secs(),
            "HttpMediator initialized"
        );

        Ok(Self {
            client,
            breakers,
            warnings: None,
        })
    }

    pub fn with_warning_service(mut self, warnings: Arc<WarningService>) -> Self {
        self.warnings = Some(warnings);
        self
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    fn warn_data_quality(&self, pointer: &MessagePointer, status: u16, description: &str) {
        if let Some(ref warnings) = self.warnings {
            warnings.add_warning(
                WarningCategory::DataQuality,
                WarningSeverity::Error,
                format!(
                    "HTTP {} {} for message {} at {}",
                    status, description, pointer.id, pointer.mediation_target
                ),
                "HttpMediator".to_string(),
            );
        }
    }

    async fn classify_2xx(&self, pointer: &MessagePointer, response: reqwest::Response) -> MediationOutcome {
        let target = &pointer.mediation_target;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        if body.trim().is_empty() {
            self.breakers.record_success(target);
            return MediationOutcome::success(status);
        }

        match serde_json::from_str::<MediationResponse>(&body) {
            Ok(parsed) if !parsed.ack => {
                // The endpoint saw the message and refused it; a later
                // redelivery may succeed.
                self.breakers.record_failure(target);
                debug!(
                    message_id = %pointer.id,
                    message = ?parsed.message,
                    "Endpoint returned ack=false"
                );
                MediationOutcome::error_process(
                    Some(status),
                    parsed
                        .message
                        .unwrap_or_else(|| "endpoint returned ack=false".to_string()),
                )
            }
            Ok(parsed) => {
                self.breakers.record_success(target);
                match parsed.visibility_delay {
                    Some(delay) if delay > 0 => {
                        debug!(
                            message_id = %pointer.id,
                            delay_seconds = delay,
                            "Endpoint acked with a backoff hint"
                        );
                        MediationOutcome::success_with_delay(status, delay)
                    }
                    _ => MediationOutcome::success(status),
                }
            }
            Err(_) => {
                // Legacy endpoints answer with arbitrary bodies; a 2xx is
                // still an ack.
                self.breakers.record_success(target);
                warn!(
                    message_id = %pointer.id,
                    target = %target,
                    "2xx response body is not a mediation response - treating as ack"
                );
                MediationOutcome::success(status)
            }
        }
    }

    async fn dispatch(&self, pointer: &MessagePointer) -> MediationOutcome {
        let target = &pointer.mediation_target;
        let payload = MediationPayload {
            message_id: &pointer.id,
        };

        debug!(
            message_id = %pointer.id,
            target = %target,
            auth_token_preview = %pointer.auth_token_preview(),
            "Dispatching message"
        );

        let response = self
            .client
            .post(target)
            .header(AUTHORIZATION, &pointer.auth_token)
            .header(CONTENT_TYPE, "application/json")
            .json(&payload)
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) => {
                self.breakers.record_failure(target);
                return if e.is_timeout() {
                    warn!(message_id = %pointer.id, target = %target, "Request timed out");
                    MediationOutcome::error_timeout(format!("request timeout: {}", e))
                } else {
                    warn!(
                        message_id = %pointer.id,
                        target = %target,
                        error = %e,
                        "Connection failed"
                    );
                    MediationOutcome::error_connection(format!("connection error: {}", e))
                };
            }
        };

        let status = response.status();
        let status_code = status.as_u16();

        if status.is_success() {
            return self.classify_2xx(pointer, response).await;
        }

        match status_code {
            401 | 403 => {
                // Credentials may be rotated out-of-band, so auth errors
                // stay retryable.
                self.breakers.record_failure(target);
                warn!(
                    message_id = %pointer.id,
                    status_code,
                    "Endpoint rejected credentials"
                );
                MediationOutcome::error_process(
                    Some(status_code),
                    format!("HTTP {}: authentication rejected", status_code),
                )
            }
            429 => {
                self.breakers.record_disregarded(target);
                let retry_after = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u32>().ok());
                warn!(
                    message_id = %pointer.id,
                    retry_after = ?retry_after,
                    "Endpoint rate limited the router"
                );
                MediationOutcome::rate_limited(retry_after)
            }
            code if status.is_client_error() => {
                self.breakers.record_disregarded(target);
                warn!(
                    message_id = %pointer.id,
                    status_code = code,
                    "Client error - dropping message as a data-quality failure"
                );
                self.warn_data_quality(pointer, code, "client error");
                MediationOutcome::error_payload(code, format!("HTTP {}: client error", code))
            }
            code if status.is_server_error() => {
                self.breakers.record_failure(target);
                warn!(
                    message_id = %pointer.id,
                    status_code = code,
                    "Server error - message will be redelivered"
                );
                MediationOutcome::error_process(
                    Some(code),
                    format!("HTTP {}: server error", code),
                )
            }
            code => {
                self.breakers.record_failure(target);
                warn!(message_id = %pointer.id, status_code = code, "Unexpected status");
                MediationOutcome::error_process(
                    Some(code),
                    format!("HTTP {}: unexpected status", code),
                )
            }
        }
    }
}

#[async_trait]
impl Mediator for HttpMediator {
    async fn process(&self, pointer: &MessagePointer) -> MediationOutcome {
        if pointer.mediation_type != MediationType::Http {
            self.warn_data_quality(pointer, 0, "unsupported mediation type");
            return MediationOutcome {
                result: relay_core::MediationResult::ErrorPayload,
                status_code: None,
                retry_after: None,
                error_message: Some(format!(
                    "unsupported mediation type: {:?}",
                    pointer.mediation_type
                )),
            };
        }

        // The pool consumes the real breaker permit before dispatch; this
        // gate covers callers that reach the mediator directly.
        if self.breakers.is_call_blocked(&pointer.mediation_target) {
            debug!(
                message_id = %pointer.id,
                target = %pointer.mediation_target,
                "Circuit open - failing fast without a request"
            );
            return MediationOutcome::circuit_open(&pointer.mediation_target);
        }

        self.dispatch(pointer).await
    }
}
