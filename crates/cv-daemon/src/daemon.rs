use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cv_agents::delivery::{DeliveryWorker, GroupResponseSink};
use cv_agents::group_tasks::GroupTasks;
use cv_agents::intake::{IntakeOptions, IntakeWorker, TaskIntake};
use cv_agents::membership::{MembershipManager, MembershipOptions};
use cv_agents::processor::TaskProcessor;
use cv_agents::router::GroupRouter;
use cv_bridge::http_transport::HttpLogTransport;
use cv_bridge::transport::{GroupTransport, Subscription};
use cv_bridge::work_queue::WorkQueue;
use cv_core::config::{Config, PROXY_API_KEY_ENV};
use cv_core::ledger::LedgerDb;
use cv_core::types::AgentIdentity;
use cv_harness::shutdown::{ShutdownSignal, TaskScope};
use cv_telemetry::metrics::global_metrics;
use tracing::{debug, error, info, warn};

use crate::processor::HttpProcessor;

/// Time loops get to wind down after shutdown is requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const ROUTER_BACKOFF_MAX: Duration = Duration::from_secs(60);
const QUEUE_CAPACITY: usize = 1024;

/// Wires the ledger, group membership and the worker loops together.
pub struct Daemon {
    config: Config,
    ledger: Arc<LedgerDb>,
    transport: Arc<dyn GroupTransport>,
    membership: MembershipManager,
    processor: Arc<dyn TaskProcessor>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Build a daemon talking to the configured log proxy and processor
    /// endpoint.
    pub async fn new(config: Config) -> Result<Self> {
        let transport = HttpLogTransport::new(
            config.transport.proxy_url.clone(),
            config.group.consumer_group(),
            config.group.poll_interval(),
            config.transport.request_timeout(),
        )
        .context("failed to build log proxy client")?
        .with_api_key(std::env::var(PROXY_API_KEY_ENV).ok());
        let processor = HttpProcessor::new(
            config.processor.endpoint.clone(),
            config.intake.processor_timeout(),
        )
        .context("failed to build processor client")?;
        Self::with_parts(config, Arc::new(transport), Arc::new(processor)).await
    }

    /// Build a daemon over an explicit transport and processor.
    pub async fn with_parts(
        config: Config,
        transport: Arc<dyn GroupTransport>,
        processor: Arc<dyn TaskProcessor>,
    ) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        let db_path = config.resolved_store_path();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let ledger = Arc::new(
            LedgerDb::new(&db_path)
                .await
                .with_context(|| format!("failed to open ledger at {}", db_path.display()))?,
        );
        info!(path = %db_path.display(), "ledger opened");

        let membership = MembershipManager::new(
            config.group.group_name.clone(),
            identity_from(&config),
            transport.clone(),
            ledger.clone(),
            MembershipOptions::from_config(&config.group),
        );

        Ok(Self {
            config,
            ledger,
            transport,
            membership,
            processor,
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn ledger(&self) -> Arc<LedgerDb> {
        self.ledger.clone()
    }

    pub fn membership(&self) -> MembershipManager {
        self.membership.clone()
    }

    /// Handle that stops [`Daemon::run`] when triggered.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Run until the shutdown handle fires, then drain the loops and leave
    /// the group.
    pub async fn run(self) -> Result<()> {
        let queue = WorkQueue::bounded(QUEUE_CAPACITY);
        let group_enabled = self.config.group.enabled;

        let mut intake = TaskIntake::new(
            self.ledger.clone(),
            self.processor.clone(),
            IntakeOptions::from_config(&self.config.intake),
        );
        if group_enabled {
            intake = intake.with_publisher(Arc::new(self.membership.clone()));
        }

        let mut delivery = DeliveryWorker::new(self.ledger.clone(), self.config.delivery.clone());
        let mut routing = None;
        if group_enabled {
            let tasks = GroupTasks::new(self.membership.clone(), self.ledger.clone());
            delivery = delivery.with_sink(
                GroupResponseSink::channel(),
                Arc::new(GroupResponseSink::new(tasks)),
            );
            let router = GroupRouter::new(
                self.transport.clone(),
                self.membership.clone(),
                self.ledger.clone(),
                queue.clone(),
            );
            // Listen first so the peers' join replies are not missed.
            let subscription = router
                .subscribe()
                .await
                .context("failed to subscribe to group topics")?;
            self.membership
                .join()
                .await
                .context("failed to join group")?;
            routing = Some((router, subscription));
        }

        let mut scope = TaskScope::new("daemon");
        let signal = scope.signal();
        scope.spawn(
            IntakeWorker::new(intake, queue.clone(), self.config.intake.max_concurrent)
                .run(signal.clone()),
        );
        scope.spawn(delivery.run(signal.clone()));

        if let Some((router, subscription)) = routing {
            scope.spawn(supervise_router(router, subscription, signal.clone()));
        } else {
            info!("group disabled, running local intake only");
        }

        info!(
            group_enabled,
            agent_id = %self.membership.agent_id(),
            "daemon running"
        );
        self.shutdown.cancelled().await;
        info!("shutdown requested");

        let drained = scope.shutdown(SHUTDOWN_GRACE).await;
        if !drained.is_complete() {
            warn!(?drained, "some loops did not stop in time");
        }
        if self.membership.is_active() {
            if let Err(e) = self.membership.leave().await {
                warn!(error = %e, "failed to leave group");
            }
        }
        debug!(metrics = %global_metrics().export_prometheus(), "final metrics");
        info!("daemon stopped");
        Ok(())
    }
}

/// Route from `subscription`, then resubscribe after transport failures,
/// backing off exponentially.
async fn supervise_router(
    router: GroupRouter,
    subscription: Subscription,
    shutdown: ShutdownSignal,
) {
    let mut backoff = Duration::from_secs(1);
    let mut result = router.route(subscription, shutdown.clone()).await;
    loop {
        match result {
            Ok(()) => return,
            Err(e) => error!(error = %e, retry_in_secs = backoff.as_secs(), "router stopped"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(ROUTER_BACKOFF_MAX);
        result = router.run(shutdown.clone()).await;
    }
}

fn identity_from(config: &Config) -> AgentIdentity {
    let id = &config.identity;
    let name = if id.name.is_empty() {
        config.group.agent_id.clone()
    } else {
        id.name.clone()
    };
    AgentIdentity::new(config.group.agent_id.clone(), name)
        .with_summary(id.soul_summary.clone())
        .with_capabilities(id.capabilities.iter().cloned())
        .with_channels(id.channels.iter().cloned())
        .with_model(id.model.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_name_falls_back_to_agent_id() {
        let mut config = Config::default();
        config.group.agent_id = "a1".into();
        config.identity.capabilities = vec!["search".into(), "search".into()];
        let identity = identity_from(&config);
        assert_eq!(identity.agent_name, "a1");
        assert_eq!(identity.capabilities.len(), 1);

        config.identity.name = "Scout".into();
        assert_eq!(identity_from(&config).agent_name, "Scout");
    }
}
