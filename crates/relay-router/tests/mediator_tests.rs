//! HttpMediator classification tests.
//!
//! Drives the full classification table against a wiremock endpoint:
//! success shapes, backoff hints, auth failures, rate limiting, payload
//! drops, server errors, timeouts, connection failures, and the circuit
//! pre-call gate.

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relay_core::{BreakerSettings, MediationResult, MediationType, MessagePointer};
use relay_router::{CircuitBreakerRegistry, HttpMediator, HttpMediatorConfig, Mediator};

fn pointer(id: &str, target: &str) -> MessagePointer {
    MessagePointer {
        id: id.to_string(),
        pool_code: "DEFAULT".to_string(),
        auth_token: "token-abc".to_string(),
        mediation_type: MediationType::Http,
        mediation_target: target.to_string(),
        message_group_id: None,
        target_client_id: None,
    }
}

fn mediator_with(breakers: Arc<CircuitBreakerRegistry>) -> HttpMediator {
    let config = HttpMediatorConfig {
        timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(1),
    };
    HttpMediator::with_config(config, breakers).unwrap()
}

fn mediator() -> HttpMediator {
    mediator_with(Arc::new(CircuitBreakerRegistry::default()))
}

#[tokio::test]
async fn successful_ack_sends_envelope_and_auth_header() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(header("Authorization", "token-abc"))
        .and(header("Content-Type", "application/json"))
        .and(body_json(serde_json::json!({"messageId": "m1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ack": true})))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = mediator()
        .process(&pointer("m1", &format!("{}/hook", server.uri())))
        .await;

    assert_eq!(outcome.result, MediationResult::Success);
    assert_eq!(outcome.status_code, Some(200));
}

#[tokio::test]
async fn ack_with_visibility_delay_is_success_with_delay() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"ack": true, "visibilityDelay": 45})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let outcome = mediator()
        .process(&pointer("m1", &format!("{}/hook", server.uri())))
        .await;

    assert_eq!(outcome.result, MediationResult::SuccessWithDelay(45));
}

#[tokio::test]
async fn ack_false_is_a_process_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({"ack": false, "message": "not ready"})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let breakers = Arc::new(CircuitBreakerRegistry::default());
    let target = format!("{}/hook", server.uri());
    let outcome = mediator_with(breakers.clone())
        .process(&pointer("m1", &target))
        .await;

    assert_eq!(outcome.result, MediationResult::ErrorProcess);
    assert_eq!(outcome.error_message.as_deref(), Some("not ready"));
    assert_eq!(breakers.stats(&target).unwrap().failed_calls, 1);
}

#[tokio::test]
async fn unparseable_2xx_body_is_permissive_success() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK, thanks!"))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = mediator()
        .process(&pointer("m1", &format!("{}/hook", server.uri())))
        .await;

    assert_eq!(outcome.result, MediationResult::Success);
}

#[tokio::test]
async fn empty_2xx_body_is_success() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let outcome = mediator()
        .process(&pointer("m1", &format!("{}/hook", server.uri())))
        .await;

    assert_eq!(outcome.result, MediationResult::Success);
}

#[tokio::test]
async fn auth_failures_stay_retryable() {
    for status in [401u16, 403] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status))
            .expect(1)
            .mount(&server)
            .await;

        let breakers = Arc::new(CircuitBreakerRegistry::default());
        let target = format!("{}/hook", server.uri());
        let outcome = mediator_with(breakers.clone())
            .process(&pointer("m1", &target))
            .await;

        assert_eq!(outcome.result, MediationResult::ErrorProcess);
        assert_eq!(outcome.status_code, Some(status));
        // Auth failures count against the endpoint.
        assert_eq!(breakers.stats(&target).unwrap().failed_calls, 1);
    }
}

#[tokio::test]
async fn rate_limiting_honors_retry_after_and_skips_the_breaker() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
        .expect(1)
        .mount(&server)
        .await;

    let breakers = Arc::new(CircuitBreakerRegistry::default());
    let target = format!("{}/hook", server.uri());
    let outcome = mediator_with(breakers.clone())
        .process(&pointer("m1", &target))
        .await;

    assert_eq!(outcome.result, MediationResult::NackRateLimit);
    assert_eq!(outcome.retry_after, Some(7));
    let stats = breakers.stats(&target).unwrap();
    assert_eq!(stats.failed_calls, 0);
    assert_eq!(stats.window_calls, 0);
}

#[tokio::test]
async fn other_4xx_is_a_payload_drop() {
    for status in [404u16, 410, 422] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status))
            .expect(1)
            .mount(&server)
            .await;

        let breakers = Arc::new(CircuitBreakerRegistry::default());
        let target = format!("{}/hook", server.uri());
        let outcome = mediator_with(breakers.clone())
            .process(&pointer("m1", &target))
            .await;

        assert_eq!(outcome.result, MediationResult::ErrorPayload);
        assert_eq!(outcome.status_code, Some(status));
        assert_eq!(breakers.stats(&target).unwrap().failed_calls, 0);
    }
}

#[tokio::test]
async fn server_errors_fail_without_http_level_retries() {
    let server = MockServer::start().await;

    // The queue is the retry mechanism: exactly one request per dispatch.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let breakers = Arc::new(CircuitBreakerRegistry::default());
    let target = format!("{}/hook", server.uri());
    let outcome = mediator_with(breakers.clone())
        .process(&pointer("m1", &target))
        .await;

    assert_eq!(outcome.result, MediationResult::ErrorProcess);
    assert_eq!(outcome.status_code, Some(503));
    assert_eq!(breakers.stats(&target).unwrap().failed_calls, 1);
}

#[tokio::test]
async fn read_timeout_classifies_as_timeout() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let breakers = Arc::new(CircuitBreakerRegistry::default());
    let config = HttpMediatorConfig {
        timeout: Duration::from_millis(200),
        connect_timeout: Duration::from_secs(1),
    };
    let mediator = HttpMediator::with_config(config, breakers.clone()).unwrap();
    let target = format!("{}/hook", server.uri());

    let outcome = mediator.process(&pointer("m1", &target)).await;

    assert_eq!(outcome.result, MediationResult::ErrorTimeout);
    assert_eq!(breakers.stats(&target).unwrap().failed_calls, 1);
}

#[tokio::test]
async fn connection_refused_classifies_as_connection_error() {
    let breakers = Arc::new(CircuitBreakerRegistry::default());
    let target = "http://127.0.0.1:59999/hook";

    let outcome = mediator_with(breakers.clone())
        .process(&pointer("m1", target))
        .await;

    assert_eq!(outcome.result, MediationResult::ErrorConnection);
    assert!(outcome.error_message.is_some());
    assert_eq!(breakers.stats(target).unwrap().failed_calls, 1);
}

#[tokio::test]
async fn open_circuit_fails_fast_without_a_request() {
    let server = MockServer::start().await;

    // Exactly 5 requests trip the breaker; the 6th dispatch must not
    // reach the endpoint.
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(5)
        .mount(&server)
        .await;

    let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerSettings {
        window_size: 10,
        failure_rate_percent: 50,
        minimum_calls: 5,
        open_duration_seconds: 60,
        half_open_permitted_calls: 2,
        idle_ttl_seconds: 3_600,
    }));
    let mediator = mediator_with(breakers.clone());
    let target = format!("{}/hook", server.uri());

    for i in 0..5 {
        let outcome = mediator.process(&pointer(&format!("m{}", i), &target)).await;
        assert_eq!(outcome.result, MediationResult::ErrorProcess);
    }

    let outcome = mediator.process(&pointer("m5", &target)).await;
    assert_eq!(outcome.result, MediationResult::NackCircuitOpen);
}
