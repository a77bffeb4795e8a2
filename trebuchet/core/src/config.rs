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

//! Job configuration

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrebuchetError};

/// How a job becomes eligible for launching.
///
/// Transient jobs are enqueued by their cron trigger; daemon jobs are always
/// eligible and get re-enqueued after a shard terminates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobExecutionType {
    Transient,
    Daemon,
}

impl fmt::Display for JobExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobExecutionType::Transient => write!(f, "TRANSIENT"),
            JobExecutionType::Daemon => write!(f, "DAEMON"),
        }
    }
}

/// A job definition as registered by an operator.
///
/// Immutable once registered; changed only through an explicit update, which
/// tears down all in-flight work for the job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_name: String,
    pub execution_type: JobExecutionType,
    /// Cron expression driving the transient trigger. Ignored for daemon jobs.
    pub cron_expression: Option<String>,
    pub sharding_total_count: u32,
    pub sharding_item_parameters: HashMap<u32, String>,
    pub job_parameter: String,
    pub cpu_count: f64,
    pub memory_mb: f64,
    pub app_url: String,
    pub bootstrap_script: String,
}

impl JobConfig {
    pub fn new(
        job_name: impl Into<String>,
        execution_type: JobExecutionType,
        sharding_total_count: u32,
    ) -> Self {
        Self {
            job_name: job_name.into(),
            execution_type,
            cron_expression: None,
            sharding_total_count,
            sharding_item_parameters: HashMap::new(),
            job_parameter: String::new(),
            cpu_count: 1.0,
            memory_mb: 128.0,
            app_url: String::new(),
            bootstrap_script: String::new(),
        }
    }

    pub fn with_cron_expression(mut self, cron_expression: impl Into<String>) -> Self {
        self.cron_expression = Some(cron_expression.into());
        self
    }

    pub fn with_sharding_item_parameters(
        mut self,
        parameters: HashMap<u32, String>,
    ) -> Self {
        self.sharding_item_parameters = parameters;
        self
    }

    pub fn with_job_parameter(mut self, job_parameter: impl Into<String>) -> Self {
        self.job_parameter = job_parameter.into();
        self
    }

    pub fn with_resources(mut self, cpu_count: f64, memory_mb: f64) -> Self {
        self.cpu_count = cpu_count;
        self.memory_mb = memory_mb;
        self
    }

    pub fn with_app_url(mut self, app_url: impl Into<String>) -> Self {
        self.app_url = app_url.into();
        self
    }

    pub fn with_bootstrap_script(mut self, bootstrap_script: impl Into<String>) -> Self {
        self.bootstrap_script = bootstrap_script.into();
        self
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.execution_type, JobExecutionType::Transient)
    }

    pub fn is_daemon(&self) -> bool {
        matches!(self.execution_type, JobExecutionType::Daemon)
    }

    /// Validate the structural constraints of a job definition.
    ///
    /// Cron syntax is checked by the transient trigger at registration time;
    /// this only enforces presence.
    pub fn validate(&self) -> Result<()> {
        if self.job_name.is_empty() {
            return Err(TrebuchetError::InvalidJobConfig(
                "job name must not be empty".to_owned(),
            ));
        }
        if self.sharding_total_count < 1 {
            return Err(TrebuchetError::InvalidJobConfig(format!(
                "job '{}' must have at least one sharding item",
                self.job_name
            )));
        }
        if self.cpu_count <= 0.0 {
            return Err(TrebuchetError::InvalidJobConfig(format!(
                "job '{}' must request positive cpus, got {}",
                self.job_name, self.cpu_count
            )));
        }
        if self.memory_mb <= 0.0 {
            return Err(TrebuchetError::InvalidJobConfig(format!(
                "job '{}' must request positive memory, got {}",
                self.job_name, self.memory_mb
            )));
        }
        if self.app_url.is_empty() {
            return Err(TrebuchetError::InvalidJobConfig(format!(
                "job '{}' must provide an app URL",
                self.job_name
            )));
        }
        if self.is_transient()
            && self
                .cron_expression
                .as_ref()
                .map(|c| c.is_empty())
                .unwrap_or(true)
        {
            return Err(TrebuchetError::InvalidJobConfig(format!(
                "transient job '{}' must provide a cron expression",
                self.job_name
            )));
        }
        Ok(())
    }
}
