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

//! Queue of job names awaiting the next offer cycle.
//!
//! The queue is a multiset: a transient job enqueued twice by its trigger is
//! launched twice. A daemon job appears at most once.

use std::sync::Arc;

use trebuchet_core::error::Result;

use crate::state::backend::{Keyspace, StateStore};

#[derive(Clone)]
pub struct ReadyQueue {
    store: Arc<dyn StateStore>,
}

impl ReadyQueue {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Enqueue one more launch of a transient job.
    pub async fn add_transient(&self, job_name: &str) -> Result<()> {
        let times = self.times(job_name).await? + 1;
        self.put_times(job_name, times).await
    }

    /// Enqueue a daemon job. Idempotent.
    pub async fn add_daemon(&self, job_name: &str) -> Result<()> {
        if self.times(job_name).await? == 0 {
            self.put_times(job_name, 1).await?;
        }
        Ok(())
    }

    /// Consume one enqueue after a successful launch; the entry disappears
    /// once its count reaches zero.
    pub async fn poll(&self, job_name: &str) -> Result<()> {
        match self.times(job_name).await? {
            0 | 1 => self.store.delete(Keyspace::Ready, job_name).await,
            times => self.put_times(job_name, times - 1).await,
        }
    }

    /// Drop the named jobs from the queue outright, whatever their counts.
    pub async fn remove(&self, job_names: &[String]) -> Result<()> {
        for job_name in job_names {
            self.store.delete(Keyspace::Ready, job_name).await?;
        }
        Ok(())
    }

    /// Queued job names in store order.
    pub async fn all(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .scan(Keyspace::Ready)
            .await?
            .into_iter()
            .map(|(job_name, _)| job_name)
            .collect())
    }

    pub async fn contains(&self, job_name: &str) -> Result<bool> {
        Ok(self.times(job_name).await? > 0)
    }

    async fn times(&self, job_name: &str) -> Result<u32> {
        Ok(match self.store.get(Keyspace::Ready, job_name).await? {
            Some(value) => serde_json::from_slice(&value)?,
            None => 0,
        })
    }

    async fn put_times(&self, job_name: &str, times: u32) -> Result<()> {
        self.store
            .put(
                Keyspace::Ready,
                job_name.to_owned(),
                serde_json::to_vec(&times)?,
            )
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::state::backend::memory::MemoryStore;

    #[tokio::test]
    async fn test_daemon_add_is_idempotent() -> Result<()> {
        let queue = ReadyQueue::new(Arc::new(MemoryStore::new()));

        queue.add_daemon("daemon_test_job").await?;
        queue.add_daemon("daemon_test_job").await?;

        assert_eq!(queue.all().await?, vec!["daemon_test_job".to_owned()]);
        queue.poll("daemon_test_job").await?;
        assert!(queue.all().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_add_counts_launches() -> Result<()> {
        let queue = ReadyQueue::new(Arc::new(MemoryStore::new()));

        queue.add_transient("transient_test_job").await?;
        queue.add_transient("transient_test_job").await?;

        queue.poll("transient_test_job").await?;
        assert!(queue.contains("transient_test_job").await?);
        queue.poll("transient_test_job").await?;
        assert!(!queue.contains("transient_test_job").await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_drops_all_counts() -> Result<()> {
        let queue = ReadyQueue::new(Arc::new(MemoryStore::new()));

        queue.add_transient("transient_test_job").await?;
        queue.add_transient("transient_test_job").await?;
        queue.remove(&["transient_test_job".to_owned()]).await?;

        assert!(!queue.contains("transient_test_job").await?);
        Ok(())
    }
}
