use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::config::{Settings, StoreBackend};
use crate::early_renewal_tokens::EarlyRenewalTokenStore;
use crate::error::{Result, SubscriptionError};
use crate::events::EventBus;
use crate::gateways::{Capability, CapabilityCache, GatewayRegistry};
use crate::locks::SubscriptionLocks;
use crate::meta::MetaStore;
use crate::notify::Notifier;
use crate::order::{Order, OrderStore};
use crate::relations::{RelatedOrderStore, RelationType};
use crate::renewal::{
    EarlyRenewalOutcome, EarlyRenewalProcessor, EarlyRenewalRequest, RenewalOutcome,
    RenewalProcessor,
};
use crate::retry::{MigrationProgress, RetryManager, RetryOutcome, RetryRules, RetryStore, RetryStoreMigrator};
use crate::scheduler::{ActionArgs, ScheduledAction, ScheduledHook, Scheduler};
use crate::status::{StatusMachine, TransitionOutcome};
use crate::storage::{Database, MetaRelationStore, MetaRetryStore};
use crate::subscription::{
    PaymentMethodChange, PaymentMethodChangeOutcome, Subscription, SubscriptionStatus,
    SubscriptionStore, TransitionContext,
};

/// Collaborators shared by every lifecycle component.
pub struct EngineState {
    pub settings: Settings,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub orders: Arc<dyn OrderStore>,
    pub meta: Arc<dyn MetaStore>,
    pub relations: Arc<dyn RelatedOrderStore>,
    pub retries: Arc<dyn RetryStore>,
    pub tokens: Arc<dyn EarlyRenewalTokenStore>,
    pub scheduler: Arc<dyn Scheduler>,
    pub notifier: Arc<dyn Notifier>,
    pub gateways: GatewayRegistry,
    pub events: EventBus,
    pub locks: SubscriptionLocks,
    pub clock: Arc<dyn Clock>,
    pub retry_rules: RetryRules,
}

impl EngineState {
    /// Wires every store to the SQLite database, picking the relation and
    /// retry backends from `settings`.
    pub fn from_database(
        database: Database,
        settings: Settings,
        gateways: GatewayRegistry,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let db = Arc::new(database);
        let meta: Arc<dyn MetaStore> = db.clone();
        let relations: Arc<dyn RelatedOrderStore> = match settings.relations.store {
            StoreBackend::Meta => Arc::new(MetaRelationStore::new(meta.clone())),
            StoreBackend::Table => db.clone(),
        };
        let retries: Arc<dyn RetryStore> = match settings.retry.store {
            StoreBackend::Meta => Arc::new(MetaRetryStore::new(meta.clone())),
            StoreBackend::Table => db.clone(),
        };
        let retry_rules = RetryRules::from_config(&settings.retry)?;
        let mut capabilities = CapabilityCache::new();
        if settings.early_renewal.enabled
            && !gateways.any_supports(Capability::SubscriptionDateChanges, &mut capabilities)
        {
            tracing::warn!("early renewal is enabled but no gateway supports date changes");
        }
        tracing::info!(
            relations = ?settings.relations.store,
            retries = ?settings.retry.store,
            retry_rules = retry_rules.len(),
            gateways = ?gateways.ids(),
            "engine state initialized"
        );

        Ok(Self {
            settings,
            subscriptions: db.clone(),
            orders: db.clone(),
            meta,
            relations,
            retries,
            tokens: db.clone(),
            scheduler: db,
            notifier,
            gateways,
            events: EventBus::new(),
            locks: SubscriptionLocks::new(),
            clock,
            retry_rules,
        })
    }

    pub async fn require_subscription(&self, id: i64) -> Result<Subscription> {
        self.subscriptions
            .get_subscription(id)
            .await?
            .ok_or(SubscriptionError::SubscriptionNotFound(id))
    }

    pub async fn require_order(&self, id: i64) -> Result<Order> {
        self.orders
            .get_order(id)
            .await?
            .ok_or(SubscriptionError::OrderNotFound(id))
    }

    pub fn transition_context(&self, subscription: &Subscription, forced: bool) -> TransitionContext {
        TransitionContext {
            now: self.clock.now(),
            forced,
            payment_method_valid: self
                .gateways
                .is_valid_payment_method(&subscription.payment_method),
            manual_renewals_accepted: self.settings.renewal.accept_manual_renewals,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub completed: usize,
    pub failed: usize,
}

/// Public entry points. Each holds the lock of every subscription it touches
/// for the whole operation.
#[derive(Clone)]
pub struct SubscriptionEngine {
    state: Arc<EngineState>,
}

impl SubscriptionEngine {
    pub fn new(state: EngineState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> &Arc<EngineState> {
        &self.state
    }

    pub fn status_machine(&self) -> StatusMachine {
        StatusMachine::new(self.state.clone())
    }

    pub fn retry_manager(&self) -> RetryManager {
        RetryManager::new(self.state.clone())
    }

    pub fn renewals(&self) -> RenewalProcessor {
        RenewalProcessor::new(self.state.clone())
    }

    pub fn early_renewals(&self) -> EarlyRenewalProcessor {
        EarlyRenewalProcessor::new(self.state.clone())
    }

    pub async fn update_status(
        &self,
        subscription_id: i64,
        new_status: SubscriptionStatus,
        forced: bool,
    ) -> Result<TransitionOutcome> {
        let _guard = self.state.locks.lock(subscription_id).await;
        self.status_machine()
            .update_status(subscription_id, new_status, forced)
            .await
    }

    pub async fn process_payment_due(
        &self,
        subscription_id: i64,
        due_at: DateTime<Utc>,
    ) -> Result<RenewalOutcome> {
        let _guard = self.state.locks.lock(subscription_id).await;
        self.renewals().process_payment_due(subscription_id, due_at).await
    }

    pub async fn process_retry(&self, order_id: i64) -> Result<RetryOutcome> {
        let _guards = self.lock_order(order_id).await?;
        self.retry_manager().process_retry(order_id).await
    }

    /// Called by the host once a customer pays a renewal order themselves.
    pub async fn complete_renewal_payment(&self, order_id: i64) -> Result<()> {
        let _guards = self.lock_order(order_id).await?;
        self.renewals().complete_renewal_payment(order_id).await
    }

    pub async fn apply_payment_method_change(
        &self,
        order_id: i64,
        change: &PaymentMethodChange,
    ) -> Result<Vec<(i64, PaymentMethodChangeOutcome)>> {
        let _guards = self.lock_order(order_id).await?;
        self.retry_manager()
            .apply_payment_method_change(order_id, change)
            .await
    }

    pub async fn process_subscription_end(&self, subscription_id: i64) -> Result<TransitionOutcome> {
        let _guard = self.state.locks.lock(subscription_id).await;
        self.renewals().process_subscription_end(subscription_id).await
    }

    pub async fn process_end_of_prepaid_term(&self, subscription_id: i64) -> Result<TransitionOutcome> {
        let _guard = self.state.locks.lock(subscription_id).await;
        self.renewals()
            .process_end_of_prepaid_term(subscription_id)
            .await
    }

    pub async fn issue_early_renewal_token(&self, subscription_id: i64, customer_id: i64) -> Result<String> {
        self.early_renewals()
            .issue_token(subscription_id, customer_id)
            .await
    }

    pub async fn handle_early_renewal(&self, request: EarlyRenewalRequest) -> Result<EarlyRenewalOutcome> {
        let _guard = self.state.locks.lock(request.subscription_id).await;
        self.early_renewals().handle_request(request).await
    }

    pub fn retry_migrator(&self) -> RetryStoreMigrator {
        RetryStoreMigrator::new(
            Arc::new(MetaRetryStore::new(self.state.meta.clone())),
            self.state.retries.clone(),
            self.state.meta.clone(),
            self.state.settings.migration.batch_size,
        )
    }

    pub async fn migrate_retries(&self) -> Result<MigrationProgress> {
        if self.state.settings.retry.store != StoreBackend::Table {
            return Err(SubscriptionError::Config(
                "retry migration needs retry.store = \"table\"".into(),
            ));
        }
        self.retry_migrator().migrate_all().await
    }

    /// Runs every scheduled action due now, oldest first. A failing handler
    /// marks its action failed and does not stop the batch.
    pub async fn run_due_actions(&self, limit: usize) -> Result<RunSummary> {
        let now = self.state.clock.now();
        let due = self.state.scheduler.due_actions(now, limit).await?;
        let mut summary = RunSummary::default();
        for action in due {
            match self.run_action(&action).await {
                Ok(()) => {
                    self.state.scheduler.mark_complete(action.id).await?;
                    summary.completed += 1;
                }
                Err(e) => {
                    tracing::error!(
                        action_id = action.id,
                        hook = action.hook.as_str(),
                        args = ?action.args,
                        "scheduled action failed: {}",
                        e
                    );
                    self.state
                        .scheduler
                        .mark_failed(action.id, &e.to_string())
                        .await?;
                    summary.failed += 1;
                }
            }
        }
        if summary.completed + summary.failed > 0 {
            tracing::info!(completed = summary.completed, failed = summary.failed, "processed due actions");
        }

        let purged = self.state.tokens.purge_expired_tokens(now).await?;
        if purged > 0 {
            tracing::debug!(purged, "purged expired early renewal tokens");
        }
        Ok(summary)
    }

    async fn run_action(&self, action: &ScheduledAction) -> Result<()> {
        match (action.hook, &action.args) {
            (ScheduledHook::PaymentDue, ActionArgs::Subscription { subscription_id }) => {
                let outcome = self
                    .process_payment_due(*subscription_id, action.scheduled_at)
                    .await?;
                tracing::debug!(subscription_id, ?outcome, "payment due handled");
            }
            (ScheduledHook::PaymentRetry, ActionArgs::Order { order_id }) => {
                let outcome = self.process_retry(*order_id).await?;
                tracing::debug!(order_id, ?outcome, "payment retry handled");
            }
            (ScheduledHook::SubscriptionEnd, ActionArgs::Subscription { subscription_id }) => {
                self.process_subscription_end(*subscription_id).await?;
            }
            (ScheduledHook::EndOfPrepaidTerm, ActionArgs::Subscription { subscription_id }) => {
                self.process_end_of_prepaid_term(*subscription_id).await?;
            }
            (hook, args) => {
                return Err(SubscriptionError::InvalidArgument(format!(
                    "action {} has arguments {:?} that do not fit hook {}",
                    action.id,
                    args,
                    hook.as_str()
                )));
            }
        }
        Ok(())
    }

    async fn lock_order(&self, order_id: i64) -> Result<Vec<tokio::sync::OwnedMutexGuard<()>>> {
        let ids = self
            .state
            .relations
            .get_related_subscription_ids(order_id, RelationType::Renewal)
            .await?;
        Ok(self.state.locks.lock_all(&ids).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderStatus;
    use crate::retry::RetryStatus;
    use crate::testing::{TestEngine, new_subscription};
    use chrono::Duration;

    #[tokio::test]
    async fn worker_runs_renewal_then_retry() {
        let t = TestEngine::new().await;
        t.gateway.set_failing(true);
        let sub = t.create_subscription(new_subscription("stripe")).await;
        let due_at = sub.dates.next_payment.unwrap();
        t.db.schedule_at(
            due_at,
            ScheduledHook::PaymentDue,
            ActionArgs::Subscription { subscription_id: sub.id },
        )
        .await
        .unwrap();

        // Nothing is due yet.
        assert_eq!(t.engine.run_due_actions(10).await.unwrap(), RunSummary::default());

        t.clock.set(due_at);
        let summary = t.engine.run_due_actions(10).await.unwrap();
        assert_eq!(summary, RunSummary { completed: 1, failed: 0 });
        let order_id = t
            .engine
            .state()
            .relations
            .get_last_related_order_id(sub.id, RelationType::Renewal)
            .await
            .unwrap()
            .unwrap();

        t.gateway.set_failing(false);
        t.clock.advance(Duration::hours(12));
        let summary = t.engine.run_due_actions(10).await.unwrap();
        assert_eq!(summary, RunSummary { completed: 1, failed: 0 });

        let retry = t
            .engine
            .retry_manager()
            .store()
            .get_last_retry_for_order(order_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retry.status, RetryStatus::Complete);
        let order = t.engine.state().require_order(order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Processing);
        let stored = t.engine.state().require_subscription(sub.id).await.unwrap();
        assert_eq!(stored.status, SubscriptionStatus::Active);

        // The next renewal is queued for a month later, not due yet.
        assert_eq!(t.engine.run_due_actions(10).await.unwrap(), RunSummary::default());
    }

    #[tokio::test]
    async fn worker_purges_expired_early_renewal_tokens() {
        let t = TestEngine::new().await;
        let sub = t.create_subscription(new_subscription("stripe")).await;
        t.engine.issue_early_renewal_token(sub.id, sub.customer_id).await.unwrap();

        t.engine.run_due_actions(10).await.unwrap();
        t.clock
            .advance(Duration::seconds(t.engine.state().settings.early_renewal.token_ttl_secs + 1));
        t.engine.run_due_actions(10).await.unwrap();

        // Already gone, so a direct purge finds nothing left.
        assert_eq!(t.db.purge_expired_tokens(t.now()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn mismatched_action_is_marked_failed() {
        let t = TestEngine::new().await;
        t.db.schedule_at(t.now(), ScheduledHook::PaymentRetry, ActionArgs::Subscription { subscription_id: 1 })
            .await
            .unwrap();
        let summary = t.engine.run_due_actions(10).await.unwrap();
        assert_eq!(summary, RunSummary { completed: 0, failed: 1 });
        assert_eq!(t.engine.run_due_actions(10).await.unwrap(), RunSummary::default());
    }

    #[tokio::test]
    async fn migration_requires_the_table_backend() {
        let t = TestEngine::with_settings(|s| s.retry.store = StoreBackend::Meta).await;
        assert!(matches!(
            t.engine.migrate_retries().await,
            Err(SubscriptionError::Config(_))
        ));
    }

    #[tokio::test]
    async fn meta_backends_drive_the_same_lifecycle() {
        let t = TestEngine::with_settings(|s| {
            s.retry.store = StoreBackend::Meta;
            s.relations.store = StoreBackend::Meta;
        })
        .await;
        t.gateway.set_failing(true);
        let sub = t.create_subscription(new_subscription("stripe")).await;

        let outcome = t
            .engine
            .process_payment_due(sub.id, sub.dates.next_payment.unwrap())
            .await
            .unwrap();
        let RenewalOutcome::Failed { order_id, retry: Some(RetryOutcome::Scheduled(_)) } = outcome else {
            panic!("expected a scheduled retry");
        };
        t.gateway.set_failing(false);
        assert_eq!(t.engine.process_retry(order_id).await.unwrap(), RetryOutcome::Paid);
        assert_eq!(
            t.engine.state().require_subscription(sub.id).await.unwrap().status,
            SubscriptionStatus::Active
        );
    }
}
