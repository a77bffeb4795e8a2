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

//! Cron trigger for transient jobs.
//!
//! Jobs sharing a cron expression share one fire loop. On each fire every
//! registered job name is handed to the enqueue callback; the callback, not
//! this module, decides what enqueueing means. That keeps the trigger free of
//! any pointer back into the producer manager.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use futures::future::BoxFuture;
use log::{info, warn};
use parking_lot::Mutex;
use tokio::task::AbortHandle;

use trebuchet_core::error::{Result, TrebuchetError};

/// Callback invoked with a job name on every cron fire.
pub type EnqueueFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

struct CronGroup {
    job_names: Vec<String>,
    handle: AbortHandle,
}

pub struct TransientProducerScheduler {
    enqueue: EnqueueFn,
    groups: Arc<Mutex<HashMap<String, CronGroup>>>,
}

impl TransientProducerScheduler {
    pub fn new(enqueue: EnqueueFn) -> Self {
        Self {
            enqueue,
            groups: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Check a cron expression without registering anything.
    pub fn validate_expression(job_name: &str, cron_expression: &str) -> Result<Schedule> {
        Schedule::from_str(cron_expression).map_err(|e| {
            TrebuchetError::InvalidJobConfig(format!(
                "bad cron expression '{cron_expression}' for job '{job_name}': {e}"
            ))
        })
    }

    /// Register a job under a cron expression. Re-registering moves the job
    /// to the new expression; registering it twice is a no-op.
    pub fn register(&self, job_name: &str, cron_expression: &str) -> Result<()> {
        let schedule = Self::validate_expression(job_name, cron_expression)?;

        self.deregister(job_name);

        let mut groups = self.groups.lock();
        if let Some(group) = groups.get_mut(cron_expression) {
            group.job_names.push(job_name.to_owned());
            return Ok(());
        }

        let handle = self.spawn_fire_loop(cron_expression.to_owned(), schedule);
        groups.insert(
            cron_expression.to_owned(),
            CronGroup {
                job_names: vec![job_name.to_owned()],
                handle,
            },
        );
        Ok(())
    }

    /// Remove a job from its trigger. The fire loop stops once its last job
    /// is gone.
    pub fn deregister(&self, job_name: &str) {
        let mut groups = self.groups.lock();
        let mut empty: Option<String> = None;
        for (cron_expression, group) in groups.iter_mut() {
            group.job_names.retain(|name| name != job_name);
            if group.job_names.is_empty() {
                empty = Some(cron_expression.clone());
            }
        }
        if let Some(cron_expression) = empty {
            if let Some(group) = groups.remove(&cron_expression) {
                group.handle.abort();
            }
        }
    }

    pub fn is_registered(&self, job_name: &str) -> bool {
        self.groups
            .lock()
            .values()
            .any(|group| group.job_names.iter().any(|name| name == job_name))
    }

    /// Stop all fire loops.
    pub fn shutdown(&self) {
        let mut groups = self.groups.lock();
        for (cron_expression, group) in groups.drain() {
            info!("Stopping cron trigger {cron_expression}");
            group.handle.abort();
        }
    }

    fn spawn_fire_loop(&self, cron_expression: String, schedule: Schedule) -> AbortHandle {
        let groups = self.groups.clone();
        let enqueue = self.enqueue.clone();
        tokio::spawn(async move {
            loop {
                let Some(next) = schedule.upcoming(Utc).next() else {
                    warn!("Cron trigger {cron_expression} has no upcoming fire time");
                    break;
                };
                let Ok(wait) = (next - Utc::now()).to_std() else {
                    continue;
                };
                tokio::time::sleep(wait).await;

                let job_names: Vec<String> = groups
                    .lock()
                    .get(&cron_expression)
                    .map(|group| group.job_names.clone())
                    .unwrap_or_default();
                for job_name in job_names {
                    enqueue(job_name).await;
                }
            }
        })
        .abort_handle()
    }
}

impl Drop for TransientProducerScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
