// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! The offer-matching and task-launching loop.
//!
//! Driven entirely by resource-manager callbacks: offers on one thread,
//! status updates possibly on another. Callback failures are logged and
//! absorbed; nothing propagates back into the resource-manager binding.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, warn};

use trebuchet_core::context::{ExecutionType, ShardingContexts, TaskContext};
use trebuchet_core::error::Result;
use trebuchet_core::framework::{
    CommandInfo, CommandUri, ExecutorInfo, FrameworkScheduler, ResourceDriver,
    ResourceOffer, StatusUpdate, TaskInfo, TaskState,
};

use crate::config::SchedulerConfig;
use crate::planner::{FirstFitPlanner, Lease, ResourcePlanner, TaskRequest};
use crate::state::SchedulerState;

pub struct SchedulerEngine {
    state: Arc<SchedulerState>,
    planner: Arc<dyn ResourcePlanner>,
    driver: Arc<dyn ResourceDriver>,
}

impl SchedulerEngine {
    pub fn new(
        state: Arc<SchedulerState>,
        planner: Arc<dyn ResourcePlanner>,
        driver: Arc<dyn ResourceDriver>,
    ) -> Self {
        Self {
            state,
            planner,
            driver,
        }
    }

    /// Engine over the default planner, configured by `config`.
    pub fn with_config(
        state: Arc<SchedulerState>,
        driver: Arc<dyn ResourceDriver>,
        config: SchedulerConfig,
    ) -> Self {
        let planner = Arc::new(FirstFitPlanner::new(config.task_distribution));
        Self::new(state, planner, driver)
    }

    async fn handle_offers(&self, offers: Vec<ResourceOffer>) -> Result<()> {
        let leases: Vec<Lease> = offers.into_iter().map(Lease::from).collect();

        let contexts = self.state.eligible_job_contexts().await?;

        // One request per assigned shard, with the resource demand from the
        // job config and the placeholder slave id.
        let mut requests = Vec::new();
        let mut total_counts: HashMap<String, u32> = HashMap::new();
        for context in &contexts {
            let config = &context.job_config;
            if context.execution_type != ExecutionType::Failover {
                // Failover launches are partial by definition and exempt
                // from the sharding-integrity rule.
                total_counts
                    .insert(config.job_name.clone(), config.sharding_total_count);
            }
            for item in &context.assigned_sharding_items {
                requests.push(TaskRequest::new(
                    TaskContext::new(config.job_name.as_str(), *item, context.execution_type),
                    config.cpu_count,
                    config.memory_mb,
                ));
            }
        }

        // Always run the planner, even with nothing to place: it is how new
        // leases enter the cache.
        let plan = self.planner.plan(requests, leases);

        let mut assigned_counts: HashMap<String, u32> = HashMap::new();
        for vm in &plan {
            for task in &vm.tasks {
                *assigned_counts
                    .entry(task.context.job_name().to_owned())
                    .or_insert(0) += 1;
            }
        }

        // Sharding integrity: a non-failover job either launches all of its
        // shards in one cycle or none of them.
        let violations: HashSet<String> = total_counts
            .iter()
            .filter(|(job_name, total)| {
                assigned_counts.get(*job_name).copied().unwrap_or(0) < **total
            })
            .map(|(job_name, _)| job_name.clone())
            .collect();
        for job_name in &violations {
            warn!(
                "Deferring job {job_name}: {}/{} shards assigned this cycle",
                assigned_counts.get(job_name).copied().unwrap_or(0),
                total_counts[job_name],
            );
        }

        for vm in &plan {
            let mut launched: Vec<TaskContext> = Vec::new();
            let mut task_infos: Vec<TaskInfo> = Vec::new();
            for task in &vm.tasks {
                if violations.contains(task.context.job_name()) {
                    continue;
                }
                let mut context = task.context.clone();
                context.set_slave_id(vm.slave_id.as_str());
                if self.state.is_running(&context.meta) {
                    debug!("Skipping {}: already running", context.id());
                    continue;
                }
                match self.task_info(&context).await? {
                    Some(task_info) => {
                        self.planner.assign_task(&task_info.task_id, &vm.slave_id);
                        task_infos.push(task_info);
                        launched.push(context);
                    }
                    // The job raced a deregister between eligibility and
                    // launch.
                    None => debug!("Skipping {}: config is gone", context.id()),
                }
            }
            if task_infos.is_empty() {
                continue;
            }
            info!(
                "Launching {} tasks on slave {} via {} offers",
                task_infos.len(),
                vm.slave_id,
                vm.offer_ids.len()
            );
            self.driver
                .launch_tasks(vm.offer_ids.clone(), task_infos)
                .await?;
            for context in &launched {
                self.state.add_running(context).await?;
            }
            self.state.remove_launched_tasks(&launched).await?;
        }

        for context in &contexts {
            let job_name = &context.job_config.job_name;
            if !assigned_counts.contains_key(job_name)
                && !self.state.running.has_running_tasks(job_name)
            {
                info!("Resources insufficient for job {job_name}");
            }
        }

        Ok(())
    }

    /// Build the launch description for one assigned task, or `None` when its
    /// configuration has been removed in the meantime.
    async fn task_info(&self, context: &TaskContext) -> Result<Option<TaskInfo>> {
        let config = match self.state.job_config.load(context.job_name()).await? {
            Some(config) => config,
            None => return Ok(None),
        };
        let payload = ShardingContexts::for_shard(&config, context.sharding_item());
        Ok(Some(TaskInfo {
            task_id: context.id(),
            name: context.meta.to_string(),
            slave_id: context.slave_id.clone(),
            cpus: config.cpu_count,
            memory_mb: config.memory_mb,
            executor: ExecutorInfo {
                executor_id: context.executor_id(&config.app_url),
                command: CommandInfo {
                    value: config.bootstrap_script.clone(),
                    uris: vec![CommandUri {
                        value: config.app_url.clone(),
                        extract: true,
                        cache: false,
                    }],
                },
            },
            data: serde_json::to_vec(&payload)?,
        }))
    }

    async fn handle_status_update(&self, status: StatusUpdate) -> Result<()> {
        let context = TaskContext::parse(&status.task_id)?;
        debug!("Task {} reported {:?}", status.task_id, status.state);
        match status.state {
            TaskState::Running => match status.message.as_deref() {
                Some("BEGIN") => self.state.update_daemon_status(&context, false).await?,
                Some("COMPLETE") => {
                    self.state.update_daemon_status(&context, true).await?
                }
                _ => {}
            },
            TaskState::Finished => {
                self.state.remove_running(&context.meta).await?;
                self.planner.unassign_task(&status.task_id, &status.slave_id);
            }
            // Killing is typically operator-driven reconfiguration: the cron
            // trigger covers transient jobs, daemon jobs must be re-queued.
            TaskState::Killed => {
                self.state.remove_running(&context.meta).await?;
                self.state
                    .add_daemon_job_to_ready_queue(context.job_name())
                    .await?;
                self.planner.unassign_task(&status.task_id, &status.slave_id);
            }
            // Recoverable endings: the shard re-enters via the failover path.
            TaskState::Lost | TaskState::Failed | TaskState::Error => {
                self.state.remove_running(&context.meta).await?;
                self.state.record_failover_task(&context).await?;
                self.state
                    .add_daemon_job_to_ready_queue(context.job_name())
                    .await?;
                self.planner.unassign_task(&status.task_id, &status.slave_id);
            }
            TaskState::Staging | TaskState::Starting => {}
        }
        Ok(())
    }
}

#[async_trait]
impl FrameworkScheduler for SchedulerEngine {
    async fn registered(&self, framework_id: &str, master: &str) {
        info!("Registered as framework {framework_id} with master {master}");
        if let Err(e) = self.state.start().await {
            error!("Failed to start state watches: {e}");
        }
        self.planner.expire_all_leases();
    }

    async fn reregistered(&self, master: &str) {
        info!("Re-registered with master {master}");
        if let Err(e) = self.state.start().await {
            error!("Failed to start state watches: {e}");
        }
        self.planner.expire_all_leases();
    }

    async fn disconnected(&self) {
        info!("Disconnected from master");
        self.state.stop();
    }

    async fn resource_offers(&self, offers: Vec<ResourceOffer>) {
        if let Err(e) = self.handle_offers(offers).await {
            error!("Offer cycle failed: {e}");
        }
    }

    async fn offer_rescinded(&self, offer_id: &str) {
        debug!("Offer {offer_id} rescinded");
        self.planner.expire_lease(offer_id);
    }

    async fn status_update(&self, status: StatusUpdate) {
        if let Err(e) = self.handle_status_update(status).await {
            error!("Status update failed: {e}");
        }
    }

    async fn slave_lost(&self, slave_id: &str) {
        warn!("Slave {slave_id} lost");
        self.planner.expire_slave_leases(slave_id);
    }

    async fn executor_lost(&self, executor_id: &str, slave_id: &str) {
        warn!("Executor {executor_id} lost on slave {slave_id}");
    }

    async fn error(&self, message: &str) {
        error!("Resource manager error: {message}");
    }
}

#[cfg(test)]
mod test {
    use trebuchet_core::context::TaskMetaInfo;

    use super::*;
    use crate::planner::{FirstFitPlanner, TaskDistribution};
    use crate::state::backend::memory::MemoryStore;
    use crate::test_utils::{daemon_job, offer, transient_job, MockResourceDriver};

    struct Fixture {
        state: Arc<SchedulerState>,
        planner: Arc<FirstFitPlanner>,
        driver: Arc<MockResourceDriver>,
        engine: SchedulerEngine,
    }

    fn fixture() -> Fixture {
        let state = Arc::new(SchedulerState::new(Arc::new(MemoryStore::new())));
        let planner = Arc::new(FirstFitPlanner::new(TaskDistribution::Bias));
        let driver = Arc::new(MockResourceDriver::default());
        let engine =
            SchedulerEngine::new(state.clone(), planner.clone(), driver.clone());
        Fixture {
            state,
            planner,
            driver,
            engine,
        }
    }

    #[tokio::test]
    async fn test_offer_cycle_launches_full_shard_set() -> Result<()> {
        let f = fixture();
        f.state
            .job_config
            .add(&transient_job("transient_test_job", 2))
            .await?;
        f.state.ready.add_transient("transient_test_job").await?;

        f.engine
            .resource_offers(vec![offer("o1", "s1", 4.0, 1024.0)])
            .await;

        let batches = f.driver.launched_batches();
        assert_eq!(batches.len(), 1);
        let (offer_ids, tasks) = &batches[0];
        assert_eq!(offer_ids, &vec!["o1".to_owned()]);
        assert_eq!(tasks.len(), 2);

        for task in tasks {
            let context = TaskContext::parse(&task.task_id)?;
            assert_eq!(context.execution_type, ExecutionType::Ready);
            assert_eq!(context.slave_id, "s1");
            assert_eq!(task.slave_id, "s1");
            assert_eq!(task.cpus, 1.0);
            assert_eq!(task.memory_mb, 128.0);
            assert_eq!(task.name, context.meta.to_string());
            assert!(task
                .executor
                .executor_id
                .starts_with("transient_test_job@-@"));
            assert_eq!(task.executor.command.value, "bin/start.sh");
            assert_eq!(
                task.executor.command.uris,
                vec![CommandUri {
                    value: "http://apps/transient_test_job.tar.gz".to_owned(),
                    extract: true,
                    cache: false,
                }]
            );
            let payload: ShardingContexts = serde_json::from_slice(&task.data)?;
            assert_eq!(payload.job_name, "transient_test_job");
            assert_eq!(payload.sharding_total_count, 2);
            assert!(f.state.is_running(&context.meta));
            assert!(f
                .planner
                .assigned_tasks("s1")
                .contains(&task.task_id));
        }

        assert!(!f.state.ready.contains("transient_test_job").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_with_config_round_robin_spreads_shards() -> Result<()> {
        let state = Arc::new(SchedulerState::new(Arc::new(MemoryStore::new())));
        let driver = Arc::new(MockResourceDriver::default());
        let engine = SchedulerEngine::with_config(
            state.clone(),
            driver.clone(),
            SchedulerConfig::default().with_task_distribution(TaskDistribution::RoundRobin),
        );

        state
            .job_config
            .add(&transient_job("transient_test_job", 2))
            .await?;
        state.ready.add_transient("transient_test_job").await?;

        engine
            .resource_offers(vec![
                offer("o1", "s1", 4.0, 1024.0),
                offer("o2", "s2", 4.0, 1024.0),
            ])
            .await;

        let batches = driver.launched_batches();
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|(_, tasks)| tasks.len() == 1));
        Ok(())
    }

    #[tokio::test]
    async fn test_integrity_violation_defers_whole_job() -> Result<()> {
        let f = fixture();
        f.state
            .job_config
            .add(&transient_job("transient_test_job", 3))
            .await?;
        f.state.ready.add_transient("transient_test_job").await?;

        // Room for only two of the three shards.
        f.engine
            .resource_offers(vec![offer("o1", "s1", 2.0, 1024.0)])
            .await;

        assert!(f.driver.launched_batches().is_empty());
        assert!(!f.state.running.has_running_tasks("transient_test_job"));
        assert!(f.state.ready.contains("transient_test_job").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_running_shard_is_not_launched_again() -> Result<()> {
        let f = fixture();
        f.state
            .job_config
            .add(&daemon_job("daemon_test_job", 2))
            .await?;
        f.state.ready.add_daemon("daemon_test_job").await?;

        let already_running =
            TaskContext::new("daemon_test_job", 0, ExecutionType::Daemon);
        f.state.running.add(&already_running).await?;

        f.engine
            .resource_offers(vec![offer("o1", "s1", 8.0, 2048.0)])
            .await;

        let launched = f.driver.launched_task_ids();
        assert_eq!(launched.len(), 1);
        let context = TaskContext::parse(&launched[0])?;
        assert_eq!(context.sharding_item(), 1);
        assert_eq!(context.execution_type, ExecutionType::Daemon);
        assert!(f.state.is_running(&TaskMetaInfo::new("daemon_test_job", 1)));
        Ok(())
    }

    #[tokio::test]
    async fn test_failover_launch_bypasses_integrity_rule() -> Result<()> {
        let f = fixture();
        f.state
            .job_config
            .add(&transient_job("transient_test_job", 3))
            .await?;
        f.state
            .failover
            .add(&TaskContext::new("transient_test_job", 2, ExecutionType::Ready))
            .await?;

        // Only one shard's worth of resources, which is all failover needs.
        f.engine
            .resource_offers(vec![offer("o1", "s1", 1.0, 128.0)])
            .await;

        let launched = f.driver.launched_task_ids();
        assert_eq!(launched.len(), 1);
        let context = TaskContext::parse(&launched[0])?;
        assert_eq!(context.execution_type, ExecutionType::Failover);
        assert_eq!(context.sharding_item(), 2);
        assert!(f.state.failover.all_metas().await?.is_empty());
        assert!(f.state.is_running(&context.meta));
        Ok(())
    }

    #[tokio::test]
    async fn test_unused_offers_stay_leased() -> Result<()> {
        let f = fixture();

        // Nothing eligible: the offer must still enter the lease cache.
        f.engine
            .resource_offers(vec![offer("o1", "s1", 4.0, 1024.0)])
            .await;
        assert_eq!(f.planner.cached_lease_count(), 1);

        // A later cycle launches from the cached lease alone.
        f.state
            .job_config
            .add(&transient_job("transient_test_job", 1))
            .await?;
        f.state.ready.add_transient("transient_test_job").await?;
        f.engine.resource_offers(vec![]).await;

        assert_eq!(f.driver.launched_task_ids().len(), 1);
        assert_eq!(f.planner.cached_lease_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_lease_invalidation_callbacks() -> Result<()> {
        let f = fixture();
        f.engine
            .resource_offers(vec![
                offer("o1", "s1", 1.0, 128.0),
                offer("o2", "s2", 1.0, 128.0),
                offer("o3", "s2", 1.0, 128.0),
            ])
            .await;
        assert_eq!(f.planner.cached_lease_count(), 3);

        f.engine.offer_rescinded("o1").await;
        assert_eq!(f.planner.cached_lease_count(), 2);

        f.engine.slave_lost("s2").await;
        assert_eq!(f.planner.cached_lease_count(), 0);

        f.engine
            .resource_offers(vec![offer("o4", "s3", 1.0, 128.0)])
            .await;
        f.engine.registered("framework-1", "master-1").await;
        assert_eq!(f.planner.cached_lease_count(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_task_info_is_none_without_config() -> Result<()> {
        let f = fixture();
        let context = TaskContext::new("gone_job", 0, ExecutionType::Ready);
        assert!(f.engine.task_info(&context).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_status_finished_removes_from_running() -> Result<()> {
        let f = fixture();
        f.state
            .job_config
            .add(&transient_job("transient_test_job", 2))
            .await?;
        let context = TaskContext::new("transient_test_job", 1, ExecutionType::Ready);
        f.state.running.add(&context).await?;
        f.planner.assign_task(&context.id(), "s1");

        f.engine
            .status_update(StatusUpdate {
                task_id: context.id(),
                slave_id: "s1".to_owned(),
                state: TaskState::Finished,
                message: None,
            })
            .await;

        assert!(!f.state.is_running(&context.meta));
        assert!(f.state.failover.all_metas().await?.is_empty());
        assert!(!f.state.ready.contains("transient_test_job").await?);
        assert!(f.planner.assigned_tasks("s1").is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_status_killed_requeues_daemon() -> Result<()> {
        let f = fixture();
        f.state
            .job_config
            .add(&daemon_job("daemon_test_job", 2))
            .await?;
        let context = TaskContext::new("daemon_test_job", 0, ExecutionType::Daemon);
        f.state.running.add(&context).await?;

        f.engine
            .status_update(StatusUpdate {
                task_id: context.id(),
                slave_id: "s1".to_owned(),
                state: TaskState::Killed,
                message: None,
            })
            .await;

        assert!(!f.state.is_running(&context.meta));
        assert!(f.state.ready.contains("daemon_test_job").await?);
        assert!(f.state.failover.all_metas().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_status_failed_records_failover() -> Result<()> {
        let f = fixture();
        f.state
            .job_config
            .add(&daemon_job("daemon_test_job", 2))
            .await?;
        let context = TaskContext::new("daemon_test_job", 1, ExecutionType::Daemon);
        f.state.running.add(&context).await?;

        f.engine
            .status_update(StatusUpdate {
                task_id: context.id(),
                slave_id: "s1".to_owned(),
                state: TaskState::Failed,
                message: None,
            })
            .await;

        assert!(!f.state.is_running(&context.meta));
        assert_eq!(f.state.failover.all_metas().await?, vec![context.meta.clone()]);
        assert!(f.state.ready.contains("daemon_test_job").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_status_update_for_deregistered_job_is_absorbed() -> Result<()> {
        let f = fixture();
        let context = TaskContext::new("gone_job", 0, ExecutionType::Daemon);
        f.state.running.add(&context).await?;

        f.engine
            .status_update(StatusUpdate {
                task_id: context.id(),
                slave_id: "s1".to_owned(),
                state: TaskState::Lost,
                message: None,
            })
            .await;

        assert!(!f.state.is_running(&context.meta));
        assert!(f.state.failover.all_metas().await?.is_empty());
        assert!(!f.state.ready.contains("gone_job").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_running_messages_toggle_daemon_idle() -> Result<()> {
        let f = fixture();
        f.state
            .job_config
            .add(&daemon_job("daemon_test_job", 1))
            .await?;
        let context = TaskContext::new("daemon_test_job", 0, ExecutionType::Daemon);
        f.state.running.add(&context).await?;

        f.engine
            .status_update(StatusUpdate {
                task_id: context.id(),
                slave_id: "s1".to_owned(),
                state: TaskState::Running,
                message: Some("COMPLETE".to_owned()),
            })
            .await;
        assert_eq!(f.state.running.is_idle(&context.meta), Some(true));

        f.engine
            .status_update(StatusUpdate {
                task_id: context.id(),
                slave_id: "s1".to_owned(),
                state: TaskState::Running,
                message: Some("BEGIN".to_owned()),
            })
            .await;
        assert_eq!(f.state.running.is_idle(&context.meta), Some(false));
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_status_update_is_absorbed() {
        let f = fixture();
        f.engine
            .status_update(StatusUpdate {
                task_id: "not-a-task-id".to_owned(),
                slave_id: "s1".to_owned(),
                state: TaskState::Finished,
                message: None,
            })
            .await;
    }
}
