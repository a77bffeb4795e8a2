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

//! Store-backed access to registered job configurations.

use std::sync::Arc;

use log::warn;

use trebuchet_core::config::JobConfig;
use trebuchet_core::error::Result;

use crate::state::backend::{Keyspace, StateStore};

#[derive(Clone)]
pub struct JobConfigManager {
    store: Arc<dyn StateStore>,
}

impl JobConfigManager {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, job_name: &str) -> Result<Option<JobConfig>> {
        match self.store.get(Keyspace::Config, job_name).await? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    pub async fn add(&self, config: &JobConfig) -> Result<()> {
        self.save(config).await
    }

    pub async fn update(&self, config: &JobConfig) -> Result<()> {
        self.save(config).await
    }

    pub async fn remove(&self, job_name: &str) -> Result<()> {
        self.store.delete(Keyspace::Config, job_name).await
    }

    /// All registered configurations. Entries that fail to decode are skipped
    /// with a warning rather than poisoning startup.
    pub async fn all(&self) -> Result<Vec<JobConfig>> {
        let mut configs = Vec::new();
        for (job_name, value) in self.store.scan(Keyspace::Config).await? {
            match serde_json::from_slice(&value) {
                Ok(config) => configs.push(config),
                Err(e) => warn!("Skipping undecodable config for job {job_name}: {e}"),
            }
        }
        Ok(configs)
    }

    async fn save(&self, config: &JobConfig) -> Result<()> {
        let value = serde_json::to_vec(config)?;
        self.store
            .put(Keyspace::Config, config.job_name.clone(), value)
            .await
    }
}
