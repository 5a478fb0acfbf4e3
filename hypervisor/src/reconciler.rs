use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shared_types::{DataIsolation, TaskStatus};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::gateway::SandboxGateway;
use crate::lifecycle::TaskLifecycleManager;

/// Reason recorded on tasks suspended because their sandbox is gone.
pub const SYNC_REASON: &str = "Synchronize sandbox status";

/// Corrects RUNNING topics whose sandbox the gateway no longer reports as
/// running.
pub struct StatusReconciler {
    lifecycle: Arc<TaskLifecycleManager>,
    gateway: Arc<dyn SandboxGateway>,
}

impl StatusReconciler {
    pub fn new(lifecycle: Arc<TaskLifecycleManager>, gateway: Arc<dyn SandboxGateway>) -> Self {
        Self { lifecycle, gateway }
    }

    /// Returns how many of the user's topics are still genuinely running.
    ///
    /// A failed gateway query or bulk update leaves the records alone and
    /// reports the recorded count.
    pub async fn reconcile_user_topics(&self, isolation: &DataIsolation) -> Result<usize> {
        let topics = self
            .lifecycle
            .repository()
            .get_user_running_topics(&isolation.user_id)
            .await?;
        let initial = topics.len();

        let queried: BTreeSet<String> = topics
            .iter()
            .filter(|t| !t.sandbox_id.is_empty())
            .map(|t| t.sandbox_id.clone())
            .collect();
        if queried.is_empty() {
            return Ok(initial);
        }
        let queried: Vec<String> = queried.into_iter().collect();

        let started = Instant::now();
        let statuses = match self.gateway.get_batch_sandbox_status(&queried).await {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!(
                    user_id = %isolation.user_id,
                    sandboxes = queried.len(),
                    error = %e,
                    "batch sandbox status query failed, skipping reconciliation"
                );
                return Ok(initial);
            }
        };

        let known: HashSet<&str> = queried.iter().map(String::as_str).collect();
        let mut stale = Vec::new();
        for entry in statuses {
            if entry.status.is_running() {
                continue;
            }
            if !known.contains(entry.sandbox_id.as_str()) {
                error!(
                    user_id = %isolation.user_id,
                    sandbox_id = %entry.sandbox_id,
                    "gateway reported a sandbox that was not queried"
                );
                continue;
            }
            if !stale.contains(&entry.sandbox_id) {
                stale.push(entry.sandbox_id);
            }
        }

        let stale_topics = topics
            .iter()
            .filter(|t| stale.contains(&t.sandbox_id))
            .count();
        if stale.is_empty() {
            debug!(user_id = %isolation.user_id, running = initial, "all running topics are live");
            return Ok(initial);
        }

        match self
            .lifecycle
            .update_task_status_by_sandbox_ids(&stale, TaskStatus::Suspended, SYNC_REASON)
            .await
        {
            Ok(count) => info!(
                user_id = %isolation.user_id,
                stale_sandboxes = stale.len(),
                topics = count.topics,
                tasks = count.tasks,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "suspended topics with dead sandboxes"
            ),
            Err(e) => {
                warn!(user_id = %isolation.user_id, error = %e, "failed to suspend stale topics");
                return Ok(initial);
            }
        }

        Ok(initial - stale_topics)
    }

    /// Reconcile every user that has running topics.
    pub async fn reconcile_all(&self) -> Result<usize> {
        let users = self
            .lifecycle
            .repository()
            .get_users_with_running_topics()
            .await?;
        let mut running = 0;
        for user_id in users {
            let isolation = DataIsolation::new(String::new(), user_id);
            match self.reconcile_user_topics(&isolation).await {
                Ok(n) => running += n,
                Err(e) => error!(user_id = %isolation.user_id, error = %e, "reconciliation failed"),
            }
        }
        Ok(running)
    }

    /// Background task: reconcile all users every `period`.
    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut interval = tokio::time::interval(period);
        interval.tick().await; // first tick is immediate; skip it
        loop {
            interval.tick().await;
            match self.reconcile_all().await {
                Ok(running) => debug!(running, "periodic reconciliation finished"),
                Err(e) => error!("periodic reconciliation failed: {e}"),
            }
        }
    }
}
