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

pub mod backend;
pub mod failover;
pub mod job_config;
pub mod ready;
pub mod running;

use std::collections::HashSet;
use std::sync::Arc;

use log::debug;

use trebuchet_core::context::{ExecutionType, JobContext, TaskContext, TaskMetaInfo};
use trebuchet_core::error::Result;

use crate::state::backend::StateStore;
use crate::state::failover::FailoverQueue;
use crate::state::job_config::JobConfigManager;
use crate::state::ready::ReadyQueue;
use crate::state::running::RunningSet;

/// Composite view over configuration, the ready/failover queues and the
/// running set. The engine and the producer manager only ever talk to this.
#[derive(Clone)]
pub struct SchedulerState {
    store: Arc<dyn StateStore>,
    pub job_config: JobConfigManager,
    pub ready: ReadyQueue,
    pub running: RunningSet,
    pub failover: FailoverQueue,
}

impl SchedulerState {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            job_config: JobConfigManager::new(store.clone()),
            ready: ReadyQueue::new(store.clone()),
            running: RunningSet::new(store.clone()),
            failover: FailoverQueue::new(store.clone()),
            store,
        }
    }

    pub fn store(&self) -> Arc<dyn StateStore> {
        self.store.clone()
    }

    /// Activate the state watches.
    pub async fn start(&self) -> Result<()> {
        self.running.start().await
    }

    pub fn stop(&self) {
        self.running.stop();
    }

    /// The job contexts eligible for the current offer cycle.
    ///
    /// Failover entries take precedence: a job with queued failover shards
    /// contributes exactly those shards, and its ready entry (if any) waits
    /// for a later cycle. Ready entries contribute the full shard range.
    /// Entries whose configuration has vanished are dropped from their queue.
    pub async fn eligible_job_contexts(&self) -> Result<Vec<JobContext>> {
        let mut contexts = Vec::new();
        let mut with_failover: HashSet<String> = HashSet::new();

        for (job_name, metas) in group_by_job(self.failover.all_metas().await?) {
            match self.job_config.load(&job_name).await? {
                Some(config) => {
                    let items = metas.iter().map(|meta| meta.sharding_item).collect();
                    contexts.push(JobContext::new(config, items, ExecutionType::Failover));
                    with_failover.insert(job_name);
                }
                None => {
                    debug!("Dropping failover shards of removed job {job_name}");
                    self.failover.remove(&metas).await?;
                }
            }
        }

        for job_name in self.ready.all().await? {
            if with_failover.contains(&job_name) {
                continue;
            }
            match self.job_config.load(&job_name).await? {
                Some(config) => {
                    let execution_type = if config.is_daemon() {
                        ExecutionType::Daemon
                    } else {
                        ExecutionType::Ready
                    };
                    contexts.push(JobContext::from_job_config(config, execution_type));
                }
                None => {
                    debug!("Dropping ready entry of removed job {job_name}");
                    self.ready.remove(&[job_name]).await?;
                }
            }
        }

        Ok(contexts)
    }

    /// Consume the queue entries behind a batch of launched tasks, routed by
    /// each task's execution type. One launch of a job's shard set consumes
    /// one ready enqueue.
    pub async fn remove_launched_tasks(&self, contexts: &[TaskContext]) -> Result<()> {
        let mut failover_metas = Vec::new();
        let mut ready_jobs: Vec<&str> = Vec::new();
        for context in contexts {
            match context.execution_type {
                ExecutionType::Failover => failover_metas.push(context.meta.clone()),
                ExecutionType::Ready | ExecutionType::Daemon => {
                    if !ready_jobs.contains(&context.job_name()) {
                        ready_jobs.push(context.job_name());
                    }
                }
            }
        }
        self.failover.remove(&failover_metas).await?;
        for job_name in ready_jobs {
            self.ready.poll(job_name).await?;
        }
        Ok(())
    }

    pub async fn add_running(&self, context: &TaskContext) -> Result<()> {
        self.running.add(context).await
    }

    pub async fn remove_running(&self, meta: &TaskMetaInfo) -> Result<()> {
        self.running.remove(meta).await
    }

    pub fn is_running(&self, meta: &TaskMetaInfo) -> bool {
        self.running.is_running(meta)
    }

    pub async fn update_daemon_status(
        &self,
        context: &TaskContext,
        idle: bool,
    ) -> Result<()> {
        self.running.update_idle(&context.meta, idle).await
    }

    /// Queue a shard for failover re-launch. A shard of a job that has been
    /// deregistered in the meantime is absorbed instead of re-queued.
    pub async fn record_failover_task(&self, context: &TaskContext) -> Result<()> {
        if self.job_config.load(context.job_name()).await?.is_none() {
            debug!(
                "Not recording failover for removed job {}",
                context.job_name()
            );
            return Ok(());
        }
        self.failover.add(context).await
    }

    /// Re-enqueue a daemon job after one of its shards terminated. A no-op
    /// unless the job still exists and is a daemon job, which also absorbs
    /// the re-queue racing a deregister.
    pub async fn add_daemon_job_to_ready_queue(&self, job_name: &str) -> Result<()> {
        match self.job_config.load(job_name).await? {
            Some(config) if config.is_daemon() => self.ready.add_daemon(job_name).await,
            _ => Ok(()),
        }
    }

    /// Enqueue one launch of a transient job from its cron trigger. A no-op
    /// if the job no longer exists or is not transient.
    pub async fn add_transient_job_to_ready_queue(&self, job_name: &str) -> Result<()> {
        match self.job_config.load(job_name).await? {
            Some(config) if config.is_transient() => {
                self.ready.add_transient(job_name).await
            }
            _ => Ok(()),
        }
    }
}

fn group_by_job(metas: Vec<TaskMetaInfo>) -> Vec<(String, Vec<TaskMetaInfo>)> {
    let mut groups: Vec<(String, Vec<TaskMetaInfo>)> = Vec::new();
    for meta in metas {
        match groups.iter_mut().find(|(job_name, _)| *job_name == meta.job_name) {
            Some((_, group)) => group.push(meta),
            None => groups.push((meta.job_name.clone(), vec![meta])),
        }
    }
    groups
}
