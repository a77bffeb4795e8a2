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

//! Killing a job's running tasks through the resource-manager driver.

use std::sync::Arc;

use log::{info, warn};

use trebuchet_core::error::Result;
use trebuchet_core::framework::ResourceDriver;

use crate::state::running::RunningSet;

#[derive(Clone)]
pub struct LifecycleManager {
    running: RunningSet,
    driver: Arc<dyn ResourceDriver>,
}

impl LifecycleManager {
    pub fn new(running: RunningSet, driver: Arc<dyn ResourceDriver>) -> Self {
        Self { running, driver }
    }

    /// Issue a kill for every running task of the job. The tasks leave the
    /// running set later, when their terminal status updates arrive.
    pub async fn kill_job_tasks(&self, job_name: &str) -> Result<()> {
        let tasks = self.running.tasks_of_job(job_name);
        if tasks.is_empty() {
            return Ok(());
        }
        info!("Killing {} running tasks of job {job_name}", tasks.len());
        for context in tasks {
            let task_id = context.id();
            if let Err(e) = self.driver.kill_task(task_id.clone()).await {
                warn!("Failed to kill task {task_id}: {e}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use trebuchet_core::context::{ExecutionType, TaskContext};

    use super::*;
    use crate::state::backend::memory::MemoryStore;
    use crate::test_utils::MockResourceDriver;

    #[tokio::test]
    async fn test_kills_each_running_task_once() -> Result<()> {
        let running = RunningSet::new(Arc::new(MemoryStore::new()));
        let driver = Arc::new(MockResourceDriver::default());
        let lifecycle = LifecycleManager::new(running.clone(), driver.clone());

        let first = TaskContext::new("test_job", 0, ExecutionType::Ready);
        let second = TaskContext::new("test_job", 1, ExecutionType::Ready);
        running.add(&first).await?;
        running.add(&second).await?;
        running
            .add(&TaskContext::new("other_job", 0, ExecutionType::Ready))
            .await?;

        lifecycle.kill_job_tasks("test_job").await?;

        let killed = driver.killed_tasks();
        assert_eq!(killed.len(), 2);
        assert!(killed.contains(&first.id()));
        assert!(killed.contains(&second.id()));
        Ok(())
    }

    #[tokio::test]
    async fn test_no_running_tasks_is_a_no_op() -> Result<()> {
        let running = RunningSet::new(Arc::new(MemoryStore::new()));
        let driver = Arc::new(MockResourceDriver::default());
        let lifecycle = LifecycleManager::new(running, driver.clone());

        lifecycle.kill_job_tasks("test_job").await?;
        assert!(driver.killed_tasks().is_empty());
        Ok(())
    }
}
