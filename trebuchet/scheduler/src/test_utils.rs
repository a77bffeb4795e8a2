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

//! Fixtures shared by the scheduler tests.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use trebuchet_core::config::{JobConfig, JobExecutionType};
use trebuchet_core::error::Result;
use trebuchet_core::framework::{ResourceDriver, ResourceOffer, TaskInfo};

/// Records every driver interaction instead of talking to a resource manager.
#[derive(Default)]
pub struct MockResourceDriver {
    launched: Mutex<Vec<(Vec<String>, Vec<TaskInfo>)>>,
    killed: Mutex<Vec<String>>,
}

#[async_trait]
impl ResourceDriver for MockResourceDriver {
    async fn launch_tasks(
        &self,
        offer_ids: Vec<String>,
        tasks: Vec<TaskInfo>,
    ) -> Result<()> {
        self.launched.lock().push((offer_ids, tasks));
        Ok(())
    }

    async fn kill_task(&self, task_id: String) -> Result<()> {
        self.killed.lock().push(task_id);
        Ok(())
    }
}

impl MockResourceDriver {
    /// Launched batches in launch order, one entry per `launch_tasks` call.
    pub fn launched_batches(&self) -> Vec<(Vec<String>, Vec<TaskInfo>)> {
        self.launched.lock().clone()
    }

    pub fn launched_task_ids(&self) -> Vec<String> {
        self.launched
            .lock()
            .iter()
            .flat_map(|(_, tasks)| tasks.iter().map(|task| task.task_id.clone()))
            .collect()
    }

    pub fn killed_tasks(&self) -> Vec<String> {
        self.killed.lock().clone()
    }
}

pub fn transient_job(job_name: &str, sharding_total_count: u32) -> JobConfig {
    JobConfig::new(job_name, JobExecutionType::Transient, sharding_total_count)
        .with_cron_expression("0 * * * * *")
        .with_resources(1.0, 128.0)
        .with_app_url(format!("http://apps/{job_name}.tar.gz"))
        .with_bootstrap_script("bin/start.sh")
}

pub fn daemon_job(job_name: &str, sharding_total_count: u32) -> JobConfig {
    JobConfig::new(job_name, JobExecutionType::Daemon, sharding_total_count)
        .with_resources(1.0, 128.0)
        .with_app_url(format!("http://apps/{job_name}.tar.gz"))
        .with_bootstrap_script("bin/start.sh")
}

pub fn offer(offer_id: &str, slave_id: &str, cpus: f64, memory_mb: f64) -> ResourceOffer {
    ResourceOffer {
        offer_id: offer_id.to_owned(),
        slave_id: slave_id.to_owned(),
        hostname: format!("host-{slave_id}"),
        cpus,
        memory_mb,
    }
}

/// Utility for running some async check multiple times to verify a condition.
/// It will run the check at the specified interval up to a maximum of the
/// specified iterations.
pub async fn await_condition<Fut: Future<Output = Result<bool>>, F: Fn() -> Fut>(
    interval: Duration,
    iterations: usize,
    cond: F,
) -> Result<bool> {
    let mut iteration = 0;

    while iteration < iterations {
        let check = cond().await?;

        if check {
            return Ok(true);
        } else {
            iteration += 1;
            tokio::time::sleep(interval).await;
        }
    }

    Ok(false)
}
