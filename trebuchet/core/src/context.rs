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

//! Task identities and their wire encoding.
//!
//! A task is one shard of a job. Its identity travels through the resource
//! manager as a delimited string (the task id), so encode/parse must
//! round-trip exactly.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::JobConfig;
use crate::error::{Result, TrebuchetError};

/// Field delimiter of the task id wire format.
pub const DELIMITER: &str = "@-@";

/// Placeholder slave id carried by task requests before assignment. The real
/// slave is only known once the planner has placed the task. Assumed to never
/// collide with a slave id handed out by the resource manager.
pub const UNASSIGNED_SLAVE_ID: &str = "fake-slave";

/// Which queue a task was launched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionType {
    Ready,
    Failover,
    Daemon,
}

impl fmt::Display for ExecutionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ExecutionType::Ready => write!(f, "READY"),
            ExecutionType::Failover => write!(f, "FAILOVER"),
            ExecutionType::Daemon => write!(f, "DAEMON"),
        }
    }
}

impl FromStr for ExecutionType {
    type Err = TrebuchetError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "READY" => Ok(ExecutionType::Ready),
            "FAILOVER" => Ok(ExecutionType::Failover),
            "DAEMON" => Ok(ExecutionType::Daemon),
            other => Err(TrebuchetError::General(format!(
                "unknown execution type '{other}'"
            ))),
        }
    }
}

/// Identifies a shard within a job. Stable across retries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskMetaInfo {
    pub job_name: String,
    pub sharding_item: u32,
}

impl TaskMetaInfo {
    pub fn new(job_name: impl Into<String>, sharding_item: u32) -> Self {
        Self {
            job_name: job_name.into(),
            sharding_item,
        }
    }

    /// Parse a meta info from any task id form; only the first two fields are
    /// read.
    pub fn parse(value: &str) -> Result<Self> {
        let mut fields = value.split(DELIMITER);
        let job_name = fields
            .next()
            .filter(|f| !f.is_empty())
            .ok_or_else(|| invalid_task_id(value))?;
        let sharding_item = fields
            .next()
            .and_then(|f| f.parse::<u32>().ok())
            .ok_or_else(|| invalid_task_id(value))?;
        Ok(Self::new(job_name, sharding_item))
    }
}

impl fmt::Display for TaskMetaInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}{}", self.job_name, DELIMITER, self.sharding_item)
    }
}

fn invalid_task_id(value: &str) -> TrebuchetError {
    TrebuchetError::General(format!("invalid task id '{value}'"))
}

/// Full identity of one task instance:
/// `jobName@-@shard@-@type@-@slave@-@uuid`.
///
/// The uuid is generated at construction, opaque to the system and preserved
/// through encode/parse round-trips.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskContext {
    pub meta: TaskMetaInfo,
    pub execution_type: ExecutionType,
    pub slave_id: String,
    uuid: String,
}

impl TaskContext {
    /// Create a context with the placeholder slave id and a fresh uuid.
    pub fn new(
        job_name: impl Into<String>,
        sharding_item: u32,
        execution_type: ExecutionType,
    ) -> Self {
        Self {
            meta: TaskMetaInfo::new(job_name, sharding_item),
            execution_type,
            slave_id: UNASSIGNED_SLAVE_ID.to_owned(),
            uuid: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Parse a task id. Accepts the five-field form and the four-field form
    /// without a uuid, in which case a fresh uuid is generated.
    pub fn parse(value: &str) -> Result<Self> {
        let fields: Vec<&str> = value.split(DELIMITER).collect();
        if fields.len() != 4 && fields.len() != 5 {
            return Err(invalid_task_id(value));
        }
        let sharding_item = fields[1]
            .parse::<u32>()
            .map_err(|_| invalid_task_id(value))?;
        let uuid = fields
            .get(4)
            .map(|f| (*f).to_owned())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        Ok(Self {
            meta: TaskMetaInfo::new(fields[0], sharding_item),
            execution_type: fields[2].parse()?,
            slave_id: fields[3].to_owned(),
            uuid,
        })
    }

    /// The full task id string handed to the resource manager.
    pub fn id(&self) -> String {
        format!(
            "{}{}{}{}{}{}{}",
            self.meta,
            DELIMITER,
            self.execution_type,
            DELIMITER,
            self.slave_id,
            DELIMITER,
            self.uuid
        )
    }

    pub fn job_name(&self) -> &str {
        &self.meta.job_name
    }

    pub fn sharding_item(&self) -> u32 {
        self.meta.sharding_item
    }

    /// Rebind the context to the slave chosen by the planner.
    pub fn set_slave_id(&mut self, slave_id: impl Into<String>) {
        self.slave_id = slave_id.into();
    }

    /// Executor id of the form `jobName@-@hash(appURL)`, shared by all tasks
    /// of the same job build so the resource manager can reuse the executor.
    pub fn executor_id(&self, app_url: &str) -> String {
        let mut hasher = DefaultHasher::new();
        app_url.hash(&mut hasher);
        format!("{}{}{:x}", self.meta.job_name, DELIMITER, hasher.finish())
    }
}

impl fmt::Display for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.id())
    }
}

/// One job's slice of an offer cycle: the shards to launch and the queue they
/// came from.
#[derive(Debug, Clone, PartialEq)]
pub struct JobContext {
    pub job_config: JobConfig,
    pub assigned_sharding_items: Vec<u32>,
    pub execution_type: ExecutionType,
}

impl JobContext {
    pub fn new(
        job_config: JobConfig,
        assigned_sharding_items: Vec<u32>,
        execution_type: ExecutionType,
    ) -> Self {
        Self {
            job_config,
            assigned_sharding_items,
            execution_type,
        }
    }

    /// A context covering the full shard range `0..sharding_total_count`.
    pub fn from_job_config(job_config: JobConfig, execution_type: ExecutionType) -> Self {
        let items = (0..job_config.sharding_total_count).collect();
        Self::new(job_config, items, execution_type)
    }
}

/// Executor payload describing the shard a launched task must run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardingContexts {
    pub job_name: String,
    pub sharding_total_count: u32,
    pub job_parameter: String,
    pub sharding_item_parameters: HashMap<u32, String>,
}

impl ShardingContexts {
    /// Payload for a single shard; its parameter defaults to the empty string
    /// when the configuration does not name one.
    pub fn for_shard(job_config: &JobConfig, sharding_item: u32) -> Self {
        let mut sharding_item_parameters = HashMap::new();
        sharding_item_parameters.insert(
            sharding_item,
            job_config
                .sharding_item_parameters
                .get(&sharding_item)
                .cloned()
                .unwrap_or_default(),
        );
        Self {
            job_name: job_config.job_name.clone(),
            sharding_total_count: job_config.sharding_total_count,
            job_parameter: job_config.job_parameter.clone(),
            sharding_item_parameters,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::JobExecutionType;

    #[test]
    fn test_task_context_round_trip() {
        let context = TaskContext::new("test_job", 7, ExecutionType::Failover);
        let parsed = TaskContext::parse(&context.id()).unwrap();
        assert_eq!(context, parsed);
    }

    #[test]
    fn test_meta_info_round_trip() {
        let meta = TaskMetaInfo::new("test_job", 2);
        assert_eq!(meta, TaskMetaInfo::parse(&meta.to_string()).unwrap());
    }

    #[test]
    fn test_meta_info_parses_full_task_id() {
        let context = TaskContext::new("test_job", 3, ExecutionType::Ready);
        let meta = TaskMetaInfo::parse(&context.id()).unwrap();
        assert_eq!(meta, TaskMetaInfo::new("test_job", 3));
    }

    #[test]
    fn test_parse_without_uuid_generates_one() {
        let parsed = TaskContext::parse("test_job@-@0@-@READY@-@slave-s0").unwrap();
        assert_eq!(parsed.job_name(), "test_job");
        assert_eq!(parsed.sharding_item(), 0);
        assert_eq!(parsed.execution_type, ExecutionType::Ready);
        assert_eq!(parsed.slave_id, "slave-s0");
        assert_eq!(parsed.uuid.len(), 32);
    }

    #[test]
    fn test_parse_rejects_malformed_ids() {
        assert!(TaskContext::parse("test_job").is_err());
        assert!(TaskContext::parse("test_job@-@x@-@READY@-@s0@-@u").is_err());
        assert!(TaskContext::parse("test_job@-@0@-@SOMETIMES@-@s0@-@u").is_err());
        assert!(TaskMetaInfo::parse("").is_err());
    }

    #[test]
    fn test_new_context_uses_placeholder_slave() {
        let mut context = TaskContext::new("test_job", 0, ExecutionType::Daemon);
        assert_eq!(context.slave_id, UNASSIGNED_SLAVE_ID);
        context.set_slave_id("slave-s1");
        assert_eq!(context.slave_id, "slave-s1");
    }

    #[test]
    fn test_executor_id_stable_per_app_url() {
        let a = TaskContext::new("test_job", 0, ExecutionType::Ready);
        let b = TaskContext::new("test_job", 1, ExecutionType::Ready);
        assert_eq!(a.executor_id("http://apps/a"), b.executor_id("http://apps/a"));
        assert_ne!(a.executor_id("http://apps/a"), a.executor_id("http://apps/b"));
        assert!(a.executor_id("http://apps/a").starts_with("test_job@-@"));
    }

    #[test]
    fn test_sharding_contexts_defaults_missing_parameter() {
        let mut config = JobConfig::new("test_job", JobExecutionType::Transient, 2);
        config.sharding_item_parameters.insert(0, "first".to_owned());
        config.job_parameter = "-v".to_owned();

        let with_param = ShardingContexts::for_shard(&config, 0);
        assert_eq!(with_param.sharding_item_parameters[&0], "first");

        let defaulted = ShardingContexts::for_shard(&config, 1);
        assert_eq!(defaulted.sharding_item_parameters[&1], "");
        assert_eq!(defaulted.sharding_total_count, 2);
        assert_eq!(defaulted.job_parameter, "-v");
    }
}
