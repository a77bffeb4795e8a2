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

//! The set of currently running tasks, grouped by job.
//!
//! Membership lives in the coordination store; a local cache answers the hot
//! `is_running` checks on the offer path. Rather than scanning the store on
//! every check, mutations dual-write store and cache, and a watch keeps the
//! cache in step with writes from other schedulers.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::StreamExt;
use log::warn;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;

use trebuchet_core::context::{TaskContext, TaskMetaInfo};
use trebuchet_core::error::Result;

use crate::state::backend::{Keyspace, Operation, StateStore, WatchEvent};

/// One running shard and its daemon-liveness flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningTask {
    pub context: TaskContext,
    /// True while a daemon shard is between iterations.
    pub idle: bool,
}

type RunningCache = Arc<DashMap<String, HashMap<u32, RunningTask>>>;

#[derive(Clone)]
pub struct RunningSet {
    store: Arc<dyn StateStore>,
    cache: RunningCache,
    listener: Arc<Mutex<Option<AbortHandle>>>,
}

impl RunningSet {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            cache: Arc::new(DashMap::new()),
            listener: Arc::new(Mutex::new(None)),
        }
    }

    /// Fill the cache from the store and start the watch keeping it fresh.
    pub async fn start(&self) -> Result<()> {
        self.cache.clear();
        for (key, value) in self.store.scan(Keyspace::Running).await? {
            match serde_json::from_slice::<RunningTask>(&value) {
                Ok(task) => cache_insert(&self.cache, &task),
                Err(e) => warn!("Skipping undecodable running entry {key}: {e}"),
            }
        }

        let mut watch = self.store.watch(Keyspace::Running, String::new()).await?;
        let cache = self.cache.clone();
        let handle = tokio::task::spawn(async move {
            while let Some(event) = watch.next().await {
                match event {
                    WatchEvent::Put(key, value) => {
                        match serde_json::from_slice::<RunningTask>(&value) {
                            Ok(task) => cache_insert(&cache, &task),
                            Err(e) => {
                                warn!("Ignoring undecodable running event {key}: {e}")
                            }
                        }
                    }
                    WatchEvent::Delete(key) => {
                        if let Ok(meta) = parse_key(&key) {
                            cache_remove(&cache, &meta);
                        }
                    }
                }
            }
        })
        .abort_handle();

        if let Some(previous) = self.listener.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop watching the store. The cache keeps serving its last state.
    pub fn stop(&self) {
        if let Some(handle) = self.listener.lock().take() {
            handle.abort();
        }
    }

    pub async fn add(&self, context: &TaskContext) -> Result<()> {
        let task = RunningTask {
            context: context.clone(),
            idle: false,
        };
        self.store
            .put(
                Keyspace::Running,
                running_key(&context.meta),
                serde_json::to_vec(&task)?,
            )
            .await?;
        cache_insert(&self.cache, &task);
        Ok(())
    }

    pub async fn remove(&self, meta: &TaskMetaInfo) -> Result<()> {
        self.store
            .delete(Keyspace::Running, &running_key(meta))
            .await?;
        cache_remove(&self.cache, meta);
        Ok(())
    }

    /// Remove every running task of a job in one transaction.
    pub async fn remove_job(&self, job_name: &str) -> Result<()> {
        let metas = self.metas_of_job(job_name);
        if metas.is_empty() {
            return Ok(());
        }
        let ops = metas
            .iter()
            .map(|meta| (Operation::Delete, Keyspace::Running, running_key(meta)))
            .collect();
        self.store.apply_txn(ops).await?;
        self.cache.remove(job_name);
        Ok(())
    }

    pub fn is_running(&self, meta: &TaskMetaInfo) -> bool {
        self.cache
            .get(&meta.job_name)
            .map(|shards| shards.contains_key(&meta.sharding_item))
            .unwrap_or(false)
    }

    pub fn has_running_tasks(&self, job_name: &str) -> bool {
        self.cache
            .get(job_name)
            .map(|shards| !shards.is_empty())
            .unwrap_or(false)
    }

    /// Running task contexts of one job, in shard order.
    pub fn tasks_of_job(&self, job_name: &str) -> Vec<TaskContext> {
        let mut tasks: Vec<(u32, TaskContext)> = self
            .cache
            .get(job_name)
            .map(|shards| {
                shards
                    .iter()
                    .map(|(item, task)| (*item, task.context.clone()))
                    .collect()
            })
            .unwrap_or_default();
        tasks.sort_by_key(|(item, _)| *item);
        tasks.into_iter().map(|(_, context)| context).collect()
    }

    pub fn metas_of_job(&self, job_name: &str) -> Vec<TaskMetaInfo> {
        self.tasks_of_job(job_name)
            .into_iter()
            .map(|context| context.meta)
            .collect()
    }

    /// Flip the daemon-liveness flag of a running shard. Unknown shards are
    /// ignored: the update raced a terminal status.
    pub async fn update_idle(&self, meta: &TaskMetaInfo, idle: bool) -> Result<()> {
        let task = match self
            .cache
            .get(&meta.job_name)
            .and_then(|shards| shards.get(&meta.sharding_item).cloned())
        {
            Some(mut task) => {
                task.idle = idle;
                task
            }
            None => return Ok(()),
        };
        self.store
            .put(
                Keyspace::Running,
                running_key(meta),
                serde_json::to_vec(&task)?,
            )
            .await?;
        cache_insert(&self.cache, &task);
        Ok(())
    }

    pub fn is_idle(&self, meta: &TaskMetaInfo) -> Option<bool> {
        self.cache
            .get(&meta.job_name)
            .and_then(|shards| shards.get(&meta.sharding_item).map(|task| task.idle))
    }
}

fn running_key(meta: &TaskMetaInfo) -> String {
    format!("{}/{}", meta.job_name, meta.sharding_item)
}

fn parse_key(key: &str) -> Result<TaskMetaInfo> {
    let (job_name, sharding_item) = key.rsplit_once('/').ok_or_else(|| {
        trebuchet_core::error::TrebuchetError::Internal(format!(
            "malformed running key '{key}'"
        ))
    })?;
    Ok(TaskMetaInfo::new(
        job_name,
        sharding_item.parse::<u32>().map_err(|_| {
            trebuchet_core::error::TrebuchetError::Internal(format!(
                "malformed running key '{key}'"
            ))
        })?,
    ))
}

fn cache_insert(cache: &RunningCache, task: &RunningTask) {
    cache
        .entry(task.context.job_name().to_owned())
        .or_default()
        .insert(task.context.sharding_item(), task.clone());
}

fn cache_remove(cache: &RunningCache, meta: &TaskMetaInfo) {
    if let Some(mut shards) = cache.get_mut(&meta.job_name) {
        shards.remove(&meta.sharding_item);
        if shards.is_empty() {
            drop(shards);
            cache.remove_if(&meta.job_name, |_, shards| shards.is_empty());
        }
    }
}
