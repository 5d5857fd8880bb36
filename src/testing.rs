//! Fakes and fixtures shared by unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use tempfile::TempDir;

use crate::clock::ManualClock;
use crate::config::Settings;
use crate::engine::{EngineState, SubscriptionEngine};
use crate::error::{Result, SubscriptionError};
use crate::events::{EventListener, SubscriptionEvent};
use crate::gateways::{Capability, CapabilitySet, ChargeOutcome, GatewayRegistry, PaymentGateway};
use crate::notify::{NotificationContext, Notifier, Recipient};
use crate::order::{NewOrder, Order, OrderStatus, OrderStore};
use crate::relations::RelationType;
use crate::retry::{NewRetry, Retry, RetryQuery, RetryStatus, RetryStore};
use crate::scheduler::{ActionArgs, ScheduledAction, ScheduledHook, Scheduler};
use crate::storage::Database;
use crate::subscription::{
    BillingPeriod, NewSubscription, Subscription, SubscriptionDates, SubscriptionStatus,
    SubscriptionStore,
};

pub struct FakeGateway {
    id: String,
    capabilities: CapabilitySet,
    failing: AtomicBool,
    charges: AtomicUsize,
    status_changes: Mutex<Vec<(i64, SubscriptionStatus)>>,
}

impl FakeGateway {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            capabilities: CapabilitySet::new(&[
                Capability::Subscriptions,
                Capability::SubscriptionCancellation,
                Capability::SubscriptionSuspension,
                Capability::SubscriptionReactivation,
                Capability::SubscriptionDateChanges,
                Capability::PaymentMethodChange,
            ]),
            failing: AtomicBool::new(false),
            charges: AtomicUsize::new(0),
            status_changes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: &[Capability]) -> Self {
        self.capabilities = CapabilitySet::new(capabilities);
        self
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn charge_count(&self) -> usize {
        self.charges.load(Ordering::SeqCst)
    }

    pub fn status_changes(&self) -> Vec<(i64, SubscriptionStatus)> {
        self.status_changes.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    fn id(&self) -> &str {
        &self.id
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities.clone()
    }

    async fn charge(&self, order: &Order, _amount: Decimal) -> Result<ChargeOutcome> {
        let n = self.charges.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.load(Ordering::SeqCst) {
            return Ok(ChargeOutcome::Failure {
                reason: "card declined".into(),
            });
        }
        Ok(ChargeOutcome::Success {
            transaction_id: format!("txn_{}_{}", order.id, n),
        })
    }

    async fn on_status_changed(
        &self,
        subscription: &Subscription,
        _old_status: SubscriptionStatus,
        new_status: SubscriptionStatus,
    ) -> Result<()> {
        self.status_changes
            .lock()
            .unwrap()
            .push((subscription.id, new_status));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, Recipient, NotificationContext)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(String, Recipient, NotificationContext)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        template_key: &str,
        recipient: Recipient,
        context: &NotificationContext,
    ) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((template_key.to_string(), recipient, context.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<SubscriptionEvent>>,
}

impl RecordingListener {
    pub fn events(&self) -> Vec<SubscriptionEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl EventListener for RecordingListener {
    fn on_event(&self, event: &SubscriptionEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Accepts everything except new schedules.
pub struct FailingScheduler;

#[async_trait]
impl Scheduler for FailingScheduler {
    async fn schedule_at(&self, _at: DateTime<Utc>, _hook: ScheduledHook, _args: ActionArgs) -> Result<i64> {
        Err(SubscriptionError::Config("scheduler unavailable".into()))
    }

    async fn unschedule(&self, _hook: ScheduledHook, _args: ActionArgs) -> Result<u64> {
        Ok(0)
    }

    async fn next_scheduled(&self, _hook: ScheduledHook, _args: ActionArgs) -> Result<Option<ScheduledAction>> {
        Ok(None)
    }

    async fn due_actions(&self, _now: DateTime<Utc>, _limit: usize) -> Result<Vec<ScheduledAction>> {
        Ok(Vec::new())
    }

    async fn mark_complete(&self, _id: i64) -> Result<()> {
        Ok(())
    }

    async fn mark_failed(&self, _id: i64, _message: &str) -> Result<()> {
        Ok(())
    }
}

/// Holds no retries and refuses to store new ones.
pub struct FailingRetryStore;

#[async_trait]
impl RetryStore for FailingRetryStore {
    async fn create_retry(&self, _retry: NewRetry) -> Result<Retry> {
        Err(SubscriptionError::Config("retry store unavailable".into()))
    }

    async fn get_retry(&self, _id: i64) -> Result<Option<Retry>> {
        Ok(None)
    }

    async fn update_retry_status(&self, _id: i64, _status: RetryStatus) -> Result<bool> {
        Ok(false)
    }

    async fn get_retries_for_order(&self, _order_id: i64) -> Result<Vec<Retry>> {
        Ok(Vec::new())
    }

    async fn get_retries(&self, _query: RetryQuery) -> Result<Vec<Retry>> {
        Ok(Vec::new())
    }

    async fn delete_retry(&self, _id: i64) -> Result<bool> {
        Ok(false)
    }

    async fn import_retry(&self, _retry: &Retry) -> Result<i64> {
        Err(SubscriptionError::Config("retry store unavailable".into()))
    }
}

/// Active monthly subscription started 2024-01-01, next payment 2024-02-01.
pub fn new_subscription(payment_method: &str) -> NewSubscription {
    NewSubscription {
        customer_id: 1,
        status: SubscriptionStatus::Active,
        billing_interval: 1,
        billing_period: BillingPeriod::Month,
        dates: SubscriptionDates {
            start: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            next_payment: Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
            ..Default::default()
        },
        payment_method: payment_method.to_string(),
        total: Decimal::new(1999, 2),
        currency: "USD".into(),
        created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    }
}

/// An engine over a temporary database with a "stripe" gateway that supports
/// every lifecycle capability and a "basic" one that only charges.
pub struct TestEngine {
    pub engine: SubscriptionEngine,
    pub db: Database,
    pub clock: Arc<ManualClock>,
    pub gateway: Arc<FakeGateway>,
    pub notifier: Arc<RecordingNotifier>,
    pub listener: Arc<RecordingListener>,
    _dir: TempDir,
}

impl TestEngine {
    pub async fn new() -> Self {
        Self::build(|_| {}, |_| {}).await
    }

    pub async fn with_settings(configure: impl FnOnce(&mut Settings)) -> Self {
        Self::build(configure, |_| {}).await
    }

    pub async fn build(
        configure: impl FnOnce(&mut Settings),
        customize: impl FnOnce(&mut EngineState),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(dir.path().join("test.db").to_str().unwrap())
            .await
            .unwrap();
        let mut settings = Settings::default();
        configure(&mut settings);

        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()));
        let gateway = Arc::new(FakeGateway::new("stripe"));
        let mut gateways = GatewayRegistry::new();
        gateways.register(gateway.clone());
        gateways.register(Arc::new(
            FakeGateway::new("basic").with_capabilities(&[Capability::Subscriptions]),
        ));
        let notifier = Arc::new(RecordingNotifier::default());
        let listener = Arc::new(RecordingListener::default());

        let mut state = EngineState::from_database(
            db.clone(),
            settings,
            gateways,
            notifier.clone(),
            clock.clone(),
        )
        .unwrap();
        state.events.subscribe(listener.clone());
        customize(&mut state);

        Self {
            engine: SubscriptionEngine::new(state),
            db,
            clock,
            gateway,
            notifier,
            listener,
            _dir: dir,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        use crate::clock::Clock;
        self.clock.now()
    }

    pub async fn create_subscription(&self, payload: NewSubscription) -> Subscription {
        self.db.create_subscription(payload).await.unwrap()
    }

    /// A pending renewal order linked through the configured relation store.
    pub async fn renewal_order_for(&self, subscription: &Subscription) -> Order {
        let order = self
            .db
            .create_order(NewOrder {
                customer_id: subscription.customer_id,
                status: OrderStatus::Pending,
                total: subscription.total,
                currency: subscription.currency.clone(),
                payment_method: subscription.payment_method.clone(),
                created_at: self.now(),
            })
            .await
            .unwrap();
        self.engine
            .state()
            .relations
            .add_relation(order.id, subscription.id, RelationType::Renewal)
            .await
            .unwrap();
        order
    }
}
