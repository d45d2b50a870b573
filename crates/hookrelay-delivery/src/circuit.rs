//! Per-endpoint circuit breaking.
//!
//! Counts consecutive terminal delivery failures per endpoint. When the
//! count reaches the endpoint's alert policy inside its rolling window,
//! the breaker disables the endpoint, emits an endpoint-disabled
//! notification, and subsequent deliveries are discarded by the scheduler
//! until the endpoint is reactivated. One success resets the counter and
//! reactivates endpoints the breaker disabled.
//!
//! Counters are persisted on the endpoint row so breaker state survives
//! restarts; this module owns the policy, the store owns the counters.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use hookrelay_core::models::{AlertConfig, Endpoint, EndpointId};

use crate::{error::Result, storage::DeliveryStore};

/// Receiver of breaker side effects.
///
/// Production wires an email/notification service; tests observe calls.
#[async_trait::async_trait]
pub trait BreakerNotifier: Send + Sync {
    /// An endpoint crossed its failure threshold and was disabled.
    async fn endpoint_disabled(&self, endpoint_id: EndpointId, consecutive_failures: u32);

    /// A previously disabled endpoint recovered and was reactivated.
    async fn endpoint_reactivated(&self, endpoint_id: EndpointId);
}

/// Notifier that drops all notifications.
#[derive(Debug, Default)]
pub struct NoOpNotifier;

#[async_trait::async_trait]
impl BreakerNotifier for NoOpNotifier {
    async fn endpoint_disabled(&self, _endpoint_id: EndpointId, _consecutive_failures: u32) {}
    async fn endpoint_reactivated(&self, _endpoint_id: EndpointId) {}
}

/// Circuit breaker shared by all dispatcher workers.
pub struct CircuitBreaker {
    store: Arc<dyn DeliveryStore>,
    notifier: Arc<dyn BreakerNotifier>,
    default_policy: AlertConfig,
}

impl CircuitBreaker {
    /// Creates a breaker over the given store and notifier.
    pub fn new(
        store: Arc<dyn DeliveryStore>,
        notifier: Arc<dyn BreakerNotifier>,
        default_policy: AlertConfig,
    ) -> Self {
        Self { store, notifier, default_policy }
    }

    /// Policy in force for an endpoint: its override or the default.
    fn policy_for(&self, endpoint: &Endpoint) -> AlertConfig {
        endpoint.alert_config.as_ref().map_or(self.default_policy, |config| config.0)
    }

    /// Records a terminal delivery failure.
    ///
    /// Advances the persisted counter and disables the endpoint once the
    /// policy threshold is reached inside the rolling window. Returns
    /// whether this failure tripped the breaker, so the caller can
    /// invalidate cached endpoint state.
    ///
    /// # Errors
    ///
    /// Returns an error when counter persistence fails.
    pub async fn record_failure(&self, endpoint: &Endpoint) -> Result<bool> {
        let policy = self.policy_for(endpoint);
        let window_floor = Utc::now()
            - Duration::seconds(i64::try_from(policy.threshold_seconds).unwrap_or(i64::MAX));

        let count = self.store.advance_breaker(endpoint.id, window_floor).await?;
        let count = u32::try_from(count).unwrap_or(0);

        if count >= policy.count {
            warn!(
                endpoint_id = %endpoint.id,
                consecutive_failures = count,
                threshold = policy.count,
                "breaker tripped, disabling endpoint"
            );
            self.store.disable_endpoint(endpoint.id).await?;
            self.notifier.endpoint_disabled(endpoint.id, count).await;
            return Ok(true);
        }

        Ok(false)
    }

    /// Records a successful delivery.
    ///
    /// Resets the counter; endpoints the breaker disabled are reactivated
    /// and announced. Returns whether a reactivation happened.
    ///
    /// # Errors
    ///
    /// Returns an error when counter persistence fails.
    pub async fn record_success(&self, endpoint_id: EndpointId) -> Result<bool> {
        let reactivated = self.store.reset_breaker(endpoint_id).await?;
        if reactivated {
            info!(endpoint_id = %endpoint_id, "endpoint recovered, reactivated by breaker");
            self.notifier.endpoint_reactivated(endpoint_id).await;
        }
        Ok(reactivated)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use chrono::Utc;
    use sqlx::types::Json;
    use uuid::Uuid;

    use hookrelay_core::models::{EndpointStatus, ProjectId};

    use super::*;
    use crate::storage::mock::MockDeliveryStore;

    #[derive(Default)]
    struct CountingNotifier {
        disabled: AtomicU32,
        reactivated: AtomicU32,
    }

    #[async_trait::async_trait]
    impl BreakerNotifier for CountingNotifier {
        async fn endpoint_disabled(&self, _endpoint_id: EndpointId, _failures: u32) {
            self.disabled.fetch_add(1, Ordering::SeqCst);
        }

        async fn endpoint_reactivated(&self, _endpoint_id: EndpointId) {
            self.reactivated.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_endpoint(alert: Option<AlertConfig>) -> Endpoint {
        Endpoint {
            id: EndpointId::new(),
            project_id: ProjectId::new(),
            name: "orders".to_string(),
            target_url: "https://example.com/hooks".to_string(),
            secrets: Json(vec![]),
            http_timeout_seconds: 30,
            rate_limit: 0,
            rate_limit_duration_seconds: 0,
            status: EndpointStatus::Active,
            auth: None,
            alert_config: alert.map(Json),
            breaker_failure_count: 0,
            breaker_window_started_at: None,
            disabled_by_breaker: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    async fn setup(
        alert: Option<AlertConfig>,
    ) -> (Arc<MockDeliveryStore>, Arc<CountingNotifier>, CircuitBreaker, Endpoint) {
        let store = Arc::new(MockDeliveryStore::new());
        let notifier = Arc::new(CountingNotifier::default());
        let endpoint = test_endpoint(alert);
        store.insert_endpoint(endpoint.clone()).await;

        let breaker = CircuitBreaker::new(
            store.clone(),
            notifier.clone(),
            AlertConfig { count: 3, threshold_seconds: 3600 },
        );
        (store, notifier, breaker, endpoint)
    }

    #[tokio::test]
    async fn failures_below_threshold_leave_endpoint_active() {
        let (store, notifier, breaker, endpoint) = setup(None).await;

        breaker.record_failure(&endpoint).await.unwrap();
        breaker.record_failure(&endpoint).await.unwrap();

        let stored = store.find_endpoint(endpoint.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EndpointStatus::Active);
        assert_eq!(stored.breaker_failure_count, 2);
        assert_eq!(notifier.disabled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn threshold_disables_endpoint_and_notifies() {
        let (store, notifier, breaker, endpoint) = setup(None).await;

        for _ in 0..3 {
            breaker.record_failure(&endpoint).await.unwrap();
        }

        let stored = store.find_endpoint(endpoint.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EndpointStatus::Inactive);
        assert!(stored.disabled_by_breaker);
        assert_eq!(notifier.disabled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn endpoint_override_takes_precedence() {
        let (store, notifier, breaker, endpoint) =
            setup(Some(AlertConfig { count: 1, threshold_seconds: 60 })).await;

        breaker.record_failure(&endpoint).await.unwrap();

        let stored = store.find_endpoint(endpoint.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EndpointStatus::Inactive);
        assert_eq!(notifier.disabled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_resets_counter() {
        let (store, _notifier, breaker, endpoint) = setup(None).await;

        breaker.record_failure(&endpoint).await.unwrap();
        breaker.record_failure(&endpoint).await.unwrap();
        breaker.record_success(endpoint.id).await.unwrap();

        let stored = store.find_endpoint(endpoint.id).await.unwrap().unwrap();
        assert_eq!(stored.breaker_failure_count, 0);
        assert_eq!(stored.status, EndpointStatus::Active);
    }

    #[tokio::test]
    async fn success_reactivates_breaker_disabled_endpoint() {
        let (store, notifier, breaker, endpoint) = setup(None).await;

        for _ in 0..3 {
            breaker.record_failure(&endpoint).await.unwrap();
        }
        assert_eq!(
            store.find_endpoint(endpoint.id).await.unwrap().unwrap().status,
            EndpointStatus::Inactive
        );

        breaker.record_success(endpoint.id).await.unwrap();

        let stored = store.find_endpoint(endpoint.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EndpointStatus::Active);
        assert!(!stored.disabled_by_breaker);
        assert_eq!(notifier.reactivated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn manual_disable_is_not_reactivated_by_success() {
        let (store, notifier, breaker, endpoint) = setup(None).await;

        // Operator disables by hand, not via the breaker path.
        {
            let mut endpoints = store.endpoints.write().await;
            let stored = endpoints.get_mut(&endpoint.id).unwrap();
            stored.status = EndpointStatus::Inactive;
            stored.disabled_by_breaker = false;
        }

        breaker.record_success(endpoint.id).await.unwrap();

        let stored = store.find_endpoint(endpoint.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EndpointStatus::Inactive);
        assert_eq!(notifier.reactivated.load(Ordering::SeqCst), 0);
    }
}
