use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::gateway::SandboxGateway;
use crate::ids::UlidGenerator;
use crate::interrupt::{InterruptConnector, InterruptDispatcher};
use crate::lifecycle::TaskLifecycleManager;
use crate::notifier::ClientNotifier;
use crate::orchestrator::SandboxOrchestrator;
use crate::reconciler::StatusReconciler;
use crate::repository::SqliteRepository;
use crate::service::TopicTaskService;
use crate::sweeper::StaleTaskSweeper;

pub struct AppState {
    pub db: SqlitePool,
    pub service: Arc<TopicTaskService>,
    pub reconciler: Arc<StatusReconciler>,
    pub sweeper: Arc<StaleTaskSweeper>,
}

impl AppState {
    /// Wire the core services over `db` and the given collaborators.
    pub fn build(
        config: &Config,
        db: SqlitePool,
        gateway: Arc<dyn SandboxGateway>,
        connector: Arc<dyn InterruptConnector>,
        notifier: Arc<dyn ClientNotifier>,
    ) -> Self {
        let repo = Arc::new(SqliteRepository::new(db.clone()));
        let lifecycle = Arc::new(TaskLifecycleManager::new(
            repo,
            Arc::new(UlidGenerator::new()),
        ));
        let orchestrator = Arc::new(SandboxOrchestrator::new(
            Arc::clone(&gateway),
            config.readiness,
        ));
        let reconciler = Arc::new(StatusReconciler::new(
            Arc::clone(&lifecycle),
            Arc::clone(&gateway),
        ));
        let interrupts = Arc::new(InterruptDispatcher::new(
            gateway,
            connector,
            config.interrupt_connect_timeout,
            config.interrupt_ack_timeout,
        ));
        let sweeper = Arc::new(StaleTaskSweeper::new(
            Arc::clone(&lifecycle),
            config.stale_task_max_age,
            config.stale_task_sweep_limit,
        ));
        let service = Arc::new(
            TopicTaskService::new(
                lifecycle,
                orchestrator,
                Arc::clone(&reconciler),
                interrupts,
                notifier,
            )
            .with_running_limit(config.max_running_topics_per_user),
        );

        Self {
            db,
            service,
            reconciler,
            sweeper,
        }
    }
}
