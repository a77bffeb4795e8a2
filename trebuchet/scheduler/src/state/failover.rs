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

//! Shards whose last run ended abnormally, queued for re-launch.

use std::sync::Arc;

use trebuchet_core::context::{TaskContext, TaskMetaInfo};
use trebuchet_core::error::Result;

use crate::state::backend::{Keyspace, StateStore};

#[derive(Clone)]
pub struct FailoverQueue {
    store: Arc<dyn StateStore>,
}

impl FailoverQueue {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Queue a shard for re-launch. Deduplicated by meta info: a shard that
    /// is already queued keeps its original entry.
    pub async fn add(&self, context: &TaskContext) -> Result<()> {
        let key = failover_key(&context.meta);
        if self.store.get(Keyspace::Failover, &key).await?.is_some() {
            return Ok(());
        }
        self.store
            .put(Keyspace::Failover, key, context.id().into_bytes())
            .await
    }

    pub async fn remove(&self, metas: &[TaskMetaInfo]) -> Result<()> {
        for meta in metas {
            self.store
                .delete(Keyspace::Failover, &failover_key(meta))
                .await?;
        }
        Ok(())
    }

    /// All queued shards in store order.
    pub async fn all_metas(&self) -> Result<Vec<TaskMetaInfo>> {
        let mut metas = Vec::new();
        for (key, _) in self.store.scan(Keyspace::Failover).await? {
            if let Some((job_name, item)) = key.rsplit_once('/') {
                if let Ok(sharding_item) = item.parse::<u32>() {
                    metas.push(TaskMetaInfo::new(job_name, sharding_item));
                }
            }
        }
        Ok(metas)
    }

    pub async fn contains(&self, meta: &TaskMetaInfo) -> Result<bool> {
        Ok(self
            .store
            .get(Keyspace::Failover, &failover_key(meta))
            .await?
            .is_some())
    }
}

fn failover_key(meta: &TaskMetaInfo) -> String {
    format!("{}/{}", meta.job_name, meta.sharding_item)
}
