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

//! Job lifecycle control: registration, update, deregistration.

pub mod lifecycle;
pub mod transient;

use std::sync::Arc;

use futures::future::BoxFuture;
use log::{info, warn};

use trebuchet_core::config::{JobConfig, JobExecutionType};
use trebuchet_core::error::{Result, TrebuchetError};
use trebuchet_core::framework::ResourceDriver;

use crate::producer::lifecycle::LifecycleManager;
use crate::producer::transient::{EnqueueFn, TransientProducerScheduler};
use crate::state::backend::{with_lock, Keyspace};
use crate::state::SchedulerState;

/// Entry point for operator actions on jobs.
///
/// Every mutating operation takes the store lock for its job name, so
/// concurrent operations on one job are totally ordered and the loser
/// observes the post-state.
pub struct ProducerManager {
    state: Arc<SchedulerState>,
    lifecycle: LifecycleManager,
    transient: TransientProducerScheduler,
}

impl ProducerManager {
    pub fn new(state: Arc<SchedulerState>, driver: Arc<dyn ResourceDriver>) -> Self {
        let lifecycle = LifecycleManager::new(state.running.clone(), driver);
        let enqueue_state = state.clone();
        let enqueue: EnqueueFn = Arc::new(move |job_name: String| -> BoxFuture<'static, ()> {
            let state = enqueue_state.clone();
            Box::pin(async move {
                if let Err(e) = state.add_transient_job_to_ready_queue(&job_name).await {
                    warn!("Failed to enqueue transient job {job_name}: {e}");
                }
            })
        });
        Self {
            state,
            lifecycle,
            transient: TransientProducerScheduler::new(enqueue),
        }
    }

    /// Wire up all persisted jobs: transient jobs get their cron trigger,
    /// daemon jobs enter the ready queue once. Safe to call repeatedly.
    pub async fn startup(&self) -> Result<()> {
        info!("Starting up producer manager");
        for config in self.state.job_config.all().await? {
            match config.execution_type {
                JobExecutionType::Transient => {
                    let cron = config.cron_expression.as_deref().unwrap_or_default();
                    if let Err(e) = self.transient.register(&config.job_name, cron) {
                        warn!("Not scheduling job {}: {e}", config.job_name);
                    }
                }
                JobExecutionType::Daemon => {
                    self.state.ready.add_daemon(&config.job_name).await?;
                }
            }
        }
        Ok(())
    }

    /// Stop the cron trigger. Running tasks are left alone; draining them is
    /// a separate concern.
    pub fn shutdown(&self) {
        self.transient.shutdown();
    }

    pub async fn register(&self, config: &JobConfig) -> Result<()> {
        self.validate(config)?;
        let lock = self
            .state
            .store()
            .lock(Keyspace::Config, &config.job_name)
            .await?;
        with_lock(lock, async {
            if self.state.job_config.load(&config.job_name).await?.is_some() {
                return Err(TrebuchetError::JobAlreadyExists(config.job_name.clone()));
            }
            self.state.job_config.add(config).await?;
            match config.execution_type {
                JobExecutionType::Transient => self.transient.register(
                    &config.job_name,
                    config.cron_expression.as_deref().unwrap_or_default(),
                )?,
                JobExecutionType::Daemon => {
                    self.state.ready.add_daemon(&config.job_name).await?;
                }
            }
            info!("Registered job {}", config.job_name);
            Ok(())
        })
        .await
    }

    /// Replace a job's configuration and tear down all of its in-flight
    /// work. The new shard count, resources or schedule apply from a clean
    /// state: running tasks are killed, and its queue entries dropped.
    pub async fn update(&self, config: &JobConfig) -> Result<()> {
        self.validate(config)?;
        let lock = self
            .state
            .store()
            .lock(Keyspace::Config, &config.job_name)
            .await?;
        with_lock(lock, async {
            if self.state.job_config.load(&config.job_name).await?.is_none() {
                return Err(TrebuchetError::JobNotFound(config.job_name.clone()));
            }
            self.state.job_config.update(config).await?;
            self.lifecycle.kill_job_tasks(&config.job_name).await?;
            self.state.running.remove_job(&config.job_name).await?;
            self.state.ready.remove(&[config.job_name.clone()]).await?;
            match config.execution_type {
                JobExecutionType::Transient => self.transient.register(
                    &config.job_name,
                    config.cron_expression.as_deref().unwrap_or_default(),
                )?,
                JobExecutionType::Daemon => self.transient.deregister(&config.job_name),
            }
            info!("Updated job {}", config.job_name);
            Ok(())
        })
        .await
    }

    /// Remove a job. A no-op when the job is not registered. The config
    /// entry goes last, so status updates racing the kills still resolve a
    /// valid configuration.
    pub async fn deregister(&self, job_name: &str) -> Result<()> {
        let lock = self.state.store().lock(Keyspace::Config, job_name).await?;
        with_lock(lock, async {
            if self.state.job_config.load(job_name).await?.is_none() {
                return Ok(());
            }
            self.transient.deregister(job_name);
            self.lifecycle.kill_job_tasks(job_name).await?;
            self.state.running.remove_job(job_name).await?;
            self.state.ready.remove(&[job_name.to_owned()]).await?;
            self.state.job_config.remove(job_name).await?;
            info!("Deregistered job {job_name}");
            Ok(())
        })
        .await
    }

    fn validate(&self, config: &JobConfig) -> Result<()> {
        config.validate()?;
        if let Some(cron) = &config.cron_expression {
            TransientProducerScheduler::validate_expression(&config.job_name, cron)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn transient_scheduler(&self) -> &TransientProducerScheduler {
        &self.transient
    }
}

#[cfg(test)]
mod test {
    use trebuchet_core::context::{ExecutionType, TaskContext};

    use super::*;
    use crate::state::backend::memory::MemoryStore;
    use crate::test_utils::{daemon_job, transient_job, MockResourceDriver};

    fn manager() -> (ProducerManager, Arc<SchedulerState>, Arc<MockResourceDriver>) {
        let state = Arc::new(SchedulerState::new(Arc::new(MemoryStore::new())));
        let driver = Arc::new(MockResourceDriver::default());
        (
            ProducerManager::new(state.clone(), driver.clone()),
            state,
            driver,
        )
    }

    #[tokio::test]
    async fn test_startup_with_two_jobs() -> Result<()> {
        let (manager, state, _) = manager();
        state.job_config.add(&transient_job("transient_test_job", 2)).await?;
        state.job_config.add(&daemon_job("daemon_test_job", 2)).await?;

        manager.startup().await?;
        // Repeating startup must not double-register anything.
        manager.startup().await?;

        assert!(manager.transient_scheduler().is_registered("transient_test_job"));
        assert!(!manager.transient_scheduler().is_registered("daemon_test_job"));
        assert_eq!(state.ready.all().await?, vec!["daemon_test_job".to_owned()]);

        manager.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn test_register_existing_fails() -> Result<()> {
        let (manager, state, _) = manager();
        let config = transient_job("transient_test_job", 2);
        manager.register(&config).await?;

        let modified = transient_job("transient_test_job", 5);
        let result = manager.register(&modified).await;
        assert!(matches!(result, Err(TrebuchetError::JobAlreadyExists(_))));

        // The store kept the original definition.
        let stored = state.job_config.load("transient_test_job").await?.unwrap();
        assert_eq!(stored.sharding_total_count, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_register_daemon_enqueues_once() -> Result<()> {
        let (manager, state, _) = manager();
        manager.register(&daemon_job("daemon_test_job", 2)).await?;

        assert_eq!(state.ready.all().await?, vec!["daemon_test_job".to_owned()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_config() -> Result<()> {
        let (manager, state, _) = manager();
        let mut config = transient_job("transient_test_job", 2);
        config.cron_expression = Some("bad".to_owned());

        assert!(matches!(
            manager.register(&config).await,
            Err(TrebuchetError::InvalidJobConfig(_))
        ));
        assert!(state.job_config.load("transient_test_job").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_update_reconciles_running_work() -> Result<()> {
        let (manager, state, driver) = manager();
        manager.register(&transient_job("transient_test_job", 2)).await?;

        let shard0 = TaskContext::new("transient_test_job", 0, ExecutionType::Ready);
        let shard1 = TaskContext::new("transient_test_job", 1, ExecutionType::Ready);
        state.running.add(&shard0).await?;
        state.running.add(&shard1).await?;
        state.ready.add_transient("transient_test_job").await?;

        let updated = transient_job("transient_test_job", 3);
        manager.update(&updated).await?;

        let stored = state.job_config.load("transient_test_job").await?.unwrap();
        assert_eq!(stored.sharding_total_count, 3);

        let killed = driver.killed_tasks();
        assert_eq!(killed.len(), 2);
        assert!(killed.contains(&shard0.id()));
        assert!(killed.contains(&shard1.id()));

        assert!(!state.running.has_running_tasks("transient_test_job"));
        assert!(!state.ready.contains("transient_test_job").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_update_absent_fails() -> Result<()> {
        let (manager, _, _) = manager();
        let result = manager.update(&transient_job("transient_test_job", 2)).await;
        assert!(matches!(result, Err(TrebuchetError::JobNotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_deregister_absent_mutates_nothing() -> Result<()> {
        let (manager, state, driver) = manager();
        // Stray state under the job's name that a deregister of an absent
        // job must not touch.
        state.ready.add_transient("transient_test_job").await?;
        let stray = TaskContext::new("transient_test_job", 0, ExecutionType::Ready);
        state.running.add(&stray).await?;

        manager.deregister("transient_test_job").await?;

        assert!(state.ready.contains("transient_test_job").await?);
        assert!(state.running.is_running(&stray.meta));
        assert!(driver.killed_tasks().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_deregister_tears_down_job() -> Result<()> {
        let (manager, state, driver) = manager();
        manager.register(&daemon_job("daemon_test_job", 1)).await?;
        let context = TaskContext::new("daemon_test_job", 0, ExecutionType::Daemon);
        state.running.add(&context).await?;

        manager.deregister("daemon_test_job").await?;

        assert!(state.job_config.load("daemon_test_job").await?.is_none());
        assert!(!state.ready.contains("daemon_test_job").await?);
        assert!(!state.running.has_running_tasks("daemon_test_job"));
        assert_eq!(driver.killed_tasks(), vec![context.id()]);
        Ok(())
    }
}
