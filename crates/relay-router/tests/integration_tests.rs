//! End-to-end flow: embedded queue -> manager -> pool -> HTTP endpoint.

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relay_core::{
    BreakerSettings, LifecycleSettings, MediationType, MessagePointer, PoolConfig, RouterConfig,
};
use relay_queue::memory::MemoryQueue;
use relay_queue::{MessageSink, QueueConsumer, QueuePublisher, VisibilityProfile};
use relay_router::{
    CircuitBreakerRegistry, HttpMediator, HttpMediatorConfig, QueueManager, VisibilityExtender,
};

fn pointer(id: &str, target: &str, group: Option<&str>) -> MessagePointer {
    MessagePointer {
        id: id.to_string(),
        pool_code: "P".to_string(),
        auth_token: "tok".to_string(),
        mediation_type: MediationType::Http,
        mediation_target: target.to_string(),
        message_group_id: group.map(|s| s.to_string()),
        target_client_id: None,
    }
}

fn build_manager() -> Arc<QueueManager> {
    let breakers = Arc::new(CircuitBreakerRegistry::new(BreakerSettings::default()));
    let extender = Arc::new(VisibilityExtender::new(&LifecycleSettings::default()));
    let mediator = Arc::new(
        HttpMediator::with_config(
            HttpMediatorConfig {
                timeout: Duration::from_secs(2),
                connect_timeout: Duration::from_secs(1),
            },
            breakers.clone(),
        )
        .unwrap(),
    );
    let manager = Arc::new(QueueManager::new(mediator, breakers, extender));
    manager
        .apply_config(&RouterConfig {
            pools: vec![PoolConfig {
                code: "P".to_string(),
                max_concurrency: 10,
                rate_limit: None,
            }],
            queues: vec![],
        })
        .unwrap();
    manager
}

async fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn happy_path_acks_and_empties_the_queue() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .and(body_json(serde_json::json!({"messageId": "m1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ack": true})))
        .expect(1)
        .mount(&server)
        .await;

    let manager = build_manager();
    let queue = Arc::new(
        MemoryQueue::new("jobs", manager.clone() as Arc<dyn MessageSink>)
            .with_receive_timeout(Duration::from_millis(20)),
    );

    queue
        .publish(pointer("m1", &format!("{}/hook", server.uri()), Some("g")))
        .await
        .unwrap();
    queue.start().await.unwrap();

    assert!(
        wait_until(|| queue.depth() == 0, Duration::from_secs(3)).await,
        "message was not acked"
    );
    assert_eq!(manager.in_flight_count(), 0);
    queue.stop().await;
}

#[tokio::test]
async fn endpoint_failure_redelivers_until_it_succeeds() {
    let server = MockServer::start().await;

    // First attempt fails; the redelivered message succeeds.
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ack": true})))
        .expect(1)
        .mount(&server)
        .await;

    let manager = build_manager();
    // Short visibility delays so the redelivery happens within the test.
    let queue = Arc::new(
        MemoryQueue::new("jobs", manager.clone() as Arc<dyn MessageSink>)
            .with_visibility_profile(VisibilityProfile {
                fast_fail_seconds: 1,
                default_delay_seconds: 1,
            })
            .with_receive_timeout(Duration::from_millis(20)),
    );

    queue
        .publish(pointer("m1", &format!("{}/hook", server.uri()), None))
        .await
        .unwrap();
    queue.start().await.unwrap();

    assert!(
        wait_until(|| queue.depth() == 0, Duration::from_secs(5)).await,
        "message was not redelivered to success"
    );
    queue.stop().await;
}

#[tokio::test]
async fn malformed_queue_bodies_never_reach_the_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let manager = build_manager();
    let queue = Arc::new(
        MemoryQueue::new("jobs", manager.clone() as Arc<dyn MessageSink>)
            .with_receive_timeout(Duration::from_millis(20)),
    );

    queue.publish_raw("definitely not json", None);
    queue.start().await.unwrap();

    assert!(
        wait_until(|| queue.depth() == 0, Duration::from_secs(3)).await,
        "malformed message was not terminated"
    );
    let metrics = queue.metrics().await.unwrap().unwrap();
    assert_eq!(metrics.total_data_quality_failures, 1);
    assert_eq!(metrics.total_received, 0);
    queue.stop().await;
}

#[tokio::test]
async fn grouped_messages_post_in_submission_order() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ack": true})))
        .expect(3)
        .mount(&server)
        .await;

    let manager = build_manager();
    let queue = Arc::new(
        MemoryQueue::new("jobs", manager.clone() as Arc<dyn MessageSink>)
            .with_receive_timeout(Duration::from_millis(20)),
    );

    let target = format!("{}/hook", server.uri());
    for i in 0..3 {
        queue
            .publish(pointer(&format!("m{}", i), &target, Some("g")))
            .await
            .unwrap();
    }
    queue.start().await.unwrap();

    assert!(
        wait_until(|| queue.depth() == 0, Duration::from_secs(3)).await,
        "group did not drain"
    );

    // Wiremock records requests in arrival order.
    let requests = server.received_requests().await.unwrap();
    let ids: Vec<String> = requests
        .iter()
        .map(|r| {
            serde_json::from_slice::<serde_json::Value>(&r.body).unwrap()["messageId"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(ids, vec!["m0", "m1", "m2"]);
    queue.stop().await;
}
