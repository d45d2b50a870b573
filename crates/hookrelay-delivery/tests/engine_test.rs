//! End-to-end dispatch pipeline tests.
//!
//! Drives the planner and a dispatcher worker against the in-memory store
//! and work queue, with wiremock standing in for consumer endpoints.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::json;
use sqlx::types::Json;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

use hookrelay_core::{
    models::{
        AlertConfig, DeliveryStatus, Endpoint, EndpointId, EndpointSecret, EndpointStatus,
        FilterConfig, Project, ProjectConfig, ProjectId, ProjectType, StrategyConfig,
        StrategyKind, Subscription, SubscriptionId, SubscriptionType,
    },
    queue::MemoryWorkQueue,
    RealClock,
};
use hookrelay_delivery::{
    circuit::CircuitBreaker,
    planner::{FanoutPlanner, RawEvent},
    replay::ReplayService,
    storage::{mock::MockDeliveryStore, DeliveryStore},
    worker::{DeliveryWorker, DispatcherConfig, EndpointSlots, EngineStats, EntityCaches},
    DeliveryClient, IdentityTransformer, MemoryRateLimiter, NoOpNotifier,
};

struct TestEnv {
    store: Arc<MockDeliveryStore>,
    queue: Arc<MemoryWorkQueue>,
    planner: Arc<FanoutPlanner>,
    worker: DeliveryWorker,
    caches: EntityCaches,
    project: Project,
}

fn project(strategy: StrategyConfig) -> Project {
    let now = Utc::now();
    Project {
        id: ProjectId::new(),
        name: "payments".to_string(),
        project_type: ProjectType::Outgoing,
        config: Json(ProjectConfig { strategy, ..ProjectConfig::default() }),
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

fn endpoint(project_id: ProjectId, url: String) -> Endpoint {
    let now = Utc::now();
    Endpoint {
        id: EndpointId::new(),
        project_id,
        name: "orders".to_string(),
        target_url: url,
        secrets: Json(vec![EndpointSecret {
            uid: Uuid::new_v4(),
            value: "shhh".to_string(),
            created_at: now,
            expires_at: None,
        }]),
        http_timeout_seconds: 5,
        rate_limit: 0,
        rate_limit_duration_seconds: 0,
        status: EndpointStatus::Active,
        auth: None,
        alert_config: Some(Json(AlertConfig { count: 2, threshold_seconds: 3600 })),
        breaker_failure_count: 0,
        breaker_window_started_at: None,
        disabled_by_breaker: false,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

fn subscription(project_id: ProjectId, endpoint_id: EndpointId) -> Subscription {
    let now = Utc::now();
    Subscription {
        id: SubscriptionId::new(),
        sub_type: SubscriptionType::Api,
        project_id,
        name: "orders-sub".to_string(),
        endpoint_id: Some(endpoint_id),
        source_id: None,
        device_id: None,
        filter_config: Json(FilterConfig::default()),
        alert_config: None,
        retry_config: None,
        rate_limit_config: None,
        function: None,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

fn raw_event(endpoint_ids: Vec<EndpointId>) -> RawEvent {
    RawEvent {
        event_type: "user.created".to_string(),
        endpoint_ids,
        source_id: None,
        data: json!({"id": 42}),
        raw: r#"{"id":42}"#.to_string(),
        headers: HashMap::new(),
        url_query_params: None,
        idempotency_key: None,
        create_subscription: false,
        delay: Duration::ZERO,
    }
}

async fn setup(strategy: StrategyConfig) -> TestEnv {
    let store = Arc::new(MockDeliveryStore::new());
    let queue = Arc::new(MemoryWorkQueue::new());
    let planner = Arc::new(FanoutPlanner::new(store.clone(), queue.clone()));

    let config = DispatcherConfig::default();
    let breaker = Arc::new(CircuitBreaker::new(
        store.clone(),
        Arc::new(NoOpNotifier),
        config.default_alert,
    ));
    let caches = EntityCaches::new();
    let worker = DeliveryWorker::new(
        0,
        store.clone(),
        queue.clone(),
        Arc::new(DeliveryClient::new(config.client_config.clone()).unwrap()),
        Arc::new(MemoryRateLimiter::new()),
        breaker,
        Arc::new(IdentityTransformer),
        planner.clone(),
        caches.clone(),
        Arc::new(EndpointSlots::new(config.endpoint_concurrency)),
        Arc::new(RwLock::new(EngineStats::default())),
        config,
        CancellationToken::new(),
        Arc::new(RealClock::new()),
    );

    let project = project(strategy);
    store.insert_project(project.clone()).await;

    TestEnv { store, queue, planner, worker, caches, project }
}

/// Drains the queue until no ready job remains.
async fn drain(env: &TestEnv) {
    loop {
        let processed = env.worker.process_batch().await.unwrap();
        if processed == 0 {
            break;
        }
    }
}

#[tokio::test]
async fn happy_delivery_succeeds_on_first_attempt() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::path("/hook"))
        .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
        .expect(1)
        .mount(&server)
        .await;

    let env = setup(StrategyConfig {
        kind: StrategyKind::Linear,
        duration_seconds: 30,
        retry_limit: 3,
    })
    .await;
    let ep = endpoint(env.project.id, format!("{}/hook", server.uri()));
    env.store.insert_endpoint(ep.clone()).await;
    env.store.insert_subscription(subscription(env.project.id, ep.id)).await;

    let result = env.planner.plan(&env.project, raw_event(vec![ep.id])).await.unwrap();
    assert_eq!(result.deliveries.len(), 1);
    let delivery_id = result.deliveries[0].id;

    drain(&env).await;

    assert_eq!(env.store.delivery_status(delivery_id).await, Some(DeliveryStatus::Success));
    let attempts = env.store.attempts_for(delivery_id).await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].http_status, Some(200));
    assert!(attempts[0].status);

    let delivery = env.store.find_delivery(env.project.id, delivery_id).await.unwrap().unwrap();
    assert_eq!(delivery.metadata.0.num_trials, 1);

    server.verify().await;
}

#[tokio::test]
async fn outbound_request_carries_signature_and_platform_headers() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .and(matchers::header_exists("X-Hookrelay-Signature"))
        .and(matchers::header("X-Hookrelay-Event-Type", "user.created"))
        .and(matchers::header("X-Hookrelay-Delivery-Attempt", "1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let env = setup(StrategyConfig::default()).await;
    let ep = endpoint(env.project.id, format!("{}/hook", server.uri()));
    env.store.insert_endpoint(ep.clone()).await;
    env.store.insert_subscription(subscription(env.project.id, ep.id)).await;

    env.planner.plan(&env.project, raw_event(vec![ep.id])).await.unwrap();
    drain(&env).await;

    server.verify().await;
}

#[tokio::test]
async fn retriable_failures_retry_then_succeed() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    // Zero interval so retries become due immediately.
    let env = setup(StrategyConfig {
        kind: StrategyKind::Linear,
        duration_seconds: 0,
        retry_limit: 3,
    })
    .await;
    let ep = endpoint(env.project.id, format!("{}/hook", server.uri()));
    env.store.insert_endpoint(ep.clone()).await;
    env.store.insert_subscription(subscription(env.project.id, ep.id)).await;

    let result = env.planner.plan(&env.project, raw_event(vec![ep.id])).await.unwrap();
    let delivery_id = result.deliveries[0].id;

    drain(&env).await;

    assert_eq!(env.store.delivery_status(delivery_id).await, Some(DeliveryStatus::Success));
    let attempts = env.store.attempts_for(delivery_id).await;
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[0].http_status, Some(503));
    assert_eq!(attempts[1].http_status, Some(503));
    assert_eq!(attempts[2].http_status, Some(200));

    // A success resets the breaker counter.
    let stored = env.store.find_endpoint(ep.id).await.unwrap().unwrap();
    assert_eq!(stored.breaker_failure_count, 0);

    server.verify().await;
}

#[tokio::test]
async fn exhausted_retries_mark_failure_and_advance_breaker() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(4)
        .mount(&server)
        .await;

    let env = setup(StrategyConfig {
        kind: StrategyKind::Linear,
        duration_seconds: 0,
        retry_limit: 3,
    })
    .await;
    let ep = endpoint(env.project.id, format!("{}/hook", server.uri()));
    env.store.insert_endpoint(ep.clone()).await;
    env.store.insert_subscription(subscription(env.project.id, ep.id)).await;

    let result = env.planner.plan(&env.project, raw_event(vec![ep.id])).await.unwrap();
    let delivery_id = result.deliveries[0].id;

    drain(&env).await;

    // retry_limit retries after the first attempt: 4 attempts total.
    assert_eq!(env.store.delivery_status(delivery_id).await, Some(DeliveryStatus::Failure));
    assert_eq!(env.store.attempts_for(delivery_id).await.len(), 4);

    let stored = env.store.find_endpoint(ep.id).await.unwrap().unwrap();
    assert_eq!(stored.breaker_failure_count, 1);

    server.verify().await;
}

#[tokio::test]
async fn non_retriable_response_fails_immediately() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(410))
        .expect(1)
        .mount(&server)
        .await;

    let env = setup(StrategyConfig {
        kind: StrategyKind::Linear,
        duration_seconds: 0,
        retry_limit: 5,
    })
    .await;
    let ep = endpoint(env.project.id, format!("{}/hook", server.uri()));
    env.store.insert_endpoint(ep.clone()).await;
    env.store.insert_subscription(subscription(env.project.id, ep.id)).await;

    let result = env.planner.plan(&env.project, raw_event(vec![ep.id])).await.unwrap();
    let delivery_id = result.deliveries[0].id;

    drain(&env).await;

    assert_eq!(env.store.delivery_status(delivery_id).await, Some(DeliveryStatus::Failure));
    assert_eq!(env.store.attempts_for(delivery_id).await.len(), 1);

    server.verify().await;
}

#[tokio::test]
async fn zero_retry_limit_means_single_attempt() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let env = setup(StrategyConfig {
        kind: StrategyKind::Linear,
        duration_seconds: 0,
        retry_limit: 0,
    })
    .await;
    let ep = endpoint(env.project.id, format!("{}/hook", server.uri()));
    env.store.insert_endpoint(ep.clone()).await;
    env.store.insert_subscription(subscription(env.project.id, ep.id)).await;

    let result = env.planner.plan(&env.project, raw_event(vec![ep.id])).await.unwrap();
    let delivery_id = result.deliveries[0].id;

    drain(&env).await;

    assert_eq!(env.store.delivery_status(delivery_id).await, Some(DeliveryStatus::Failure));
    assert_eq!(env.store.attempts_for(delivery_id).await.len(), 1);

    server.verify().await;
}

#[tokio::test]
async fn breaker_disables_endpoint_and_discards_following_deliveries() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let env = setup(StrategyConfig {
        kind: StrategyKind::Linear,
        duration_seconds: 0,
        retry_limit: 0,
    })
    .await;
    // alert_config.count = 2 on the endpoint fixture.
    let ep = endpoint(env.project.id, format!("{}/hook", server.uri()));
    env.store.insert_endpoint(ep.clone()).await;
    env.store.insert_subscription(subscription(env.project.id, ep.id)).await;

    // Two terminal failures trip the breaker.
    let first = env.planner.plan(&env.project, raw_event(vec![ep.id])).await.unwrap();
    drain(&env).await;
    let second = env.planner.plan(&env.project, raw_event(vec![ep.id])).await.unwrap();
    drain(&env).await;

    let stored = env.store.find_endpoint(ep.id).await.unwrap().unwrap();
    assert_eq!(stored.status, EndpointStatus::Inactive);
    assert!(stored.disabled_by_breaker);

    // The next delivery is discarded by the pre-check, with no attempt.
    let third = env.planner.plan(&env.project, raw_event(vec![ep.id])).await.unwrap();
    drain(&env).await;

    assert_eq!(
        env.store.delivery_status(first.deliveries[0].id).await,
        Some(DeliveryStatus::Failure)
    );
    assert_eq!(
        env.store.delivery_status(second.deliveries[0].id).await,
        Some(DeliveryStatus::Failure)
    );
    assert_eq!(
        env.store.delivery_status(third.deliveries[0].id).await,
        Some(DeliveryStatus::Discarded)
    );
    assert!(env.store.attempts_for(third.deliveries[0].id).await.is_empty());
}

#[tokio::test]
async fn paused_endpoint_holds_delivery_in_scheduled() {
    let env = setup(StrategyConfig::default()).await;
    let mut ep = endpoint(env.project.id, "https://example.invalid/hook".to_string());
    ep.status = EndpointStatus::Paused;
    env.store.insert_endpoint(ep.clone()).await;
    env.store.insert_subscription(subscription(env.project.id, ep.id)).await;

    let result = env.planner.plan(&env.project, raw_event(vec![ep.id])).await.unwrap();
    let delivery_id = result.deliveries[0].id;

    env.worker.process_batch().await.unwrap();

    assert_eq!(env.store.delivery_status(delivery_id).await, Some(DeliveryStatus::Scheduled));
    assert!(env.store.attempts_for(delivery_id).await.is_empty());
}

#[tokio::test]
async fn rate_limited_delivery_does_not_consume_a_trial() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let env = setup(StrategyConfig::default()).await;
    let mut ep = endpoint(env.project.id, format!("{}/hook", server.uri()));
    ep.rate_limit = 1;
    ep.rate_limit_duration_seconds = 3600;
    env.store.insert_endpoint(ep.clone()).await;
    env.store.insert_subscription(subscription(env.project.id, ep.id)).await;

    let first = env.planner.plan(&env.project, raw_event(vec![ep.id])).await.unwrap();
    let second = env.planner.plan(&env.project, raw_event(vec![ep.id])).await.unwrap();

    drain(&env).await;

    // One delivery went out; the other was pushed back without an attempt.
    let first_id = first.deliveries[0].id;
    let second_id = second.deliveries[0].id;

    let statuses = (
        env.store.delivery_status(first_id).await.unwrap(),
        env.store.delivery_status(second_id).await.unwrap(),
    );
    assert!(
        matches!(
            statuses,
            (DeliveryStatus::Success, DeliveryStatus::Scheduled)
                | (DeliveryStatus::Scheduled, DeliveryStatus::Success)
        ),
        "unexpected statuses: {statuses:?}"
    );

    let (delivered, held) = if statuses.0 == DeliveryStatus::Success {
        (first_id, second_id)
    } else {
        (second_id, first_id)
    };
    assert_eq!(env.store.attempts_for(delivered).await.len(), 1);
    assert!(env.store.attempts_for(held).await.is_empty());

    let held_delivery = env.store.find_delivery(env.project.id, held).await.unwrap().unwrap();
    assert_eq!(held_delivery.metadata.0.num_trials, 0);

    server.verify().await;
}

#[tokio::test]
async fn force_resend_of_discarded_delivers_after_reactivation() {
    let server = MockServer::start().await;
    Mock::given(matchers::method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let env = setup(StrategyConfig::default()).await;
    let mut ep = endpoint(env.project.id, format!("{}/hook", server.uri()));
    ep.status = EndpointStatus::Inactive;
    env.store.insert_endpoint(ep.clone()).await;
    env.store.insert_subscription(subscription(env.project.id, ep.id)).await;

    // Fan out while the endpoint is inactive: the delivery is discarded.
    let result = env.planner.plan(&env.project, raw_event(vec![ep.id])).await.unwrap();
    let delivery_id = result.deliveries[0].id;
    drain(&env).await;
    assert_eq!(env.store.delivery_status(delivery_id).await, Some(DeliveryStatus::Discarded));

    // Re-enable the endpoint, then force resend. Writers invalidate the
    // dispatcher cache by key.
    {
        let mut endpoints = env.store.endpoints.write().await;
        endpoints.get_mut(&ep.id).unwrap().status = EndpointStatus::Active;
    }
    env.caches.endpoints.invalidate(&ep.id).await;
    let replay = ReplayService::new(env.store.clone(), env.queue.clone(), env.planner.clone());
    let summary = replay.force_resend(&env.project, &[delivery_id]).await.unwrap();
    assert_eq!(summary.successes, 1);

    drain(&env).await;

    assert_eq!(env.store.delivery_status(delivery_id).await, Some(DeliveryStatus::Success));
    assert_eq!(env.store.attempts_for(delivery_id).await.len(), 1);

    server.verify().await;
}
