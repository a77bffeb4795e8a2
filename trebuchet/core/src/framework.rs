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

//! The framework-scheduler contract with the underlying resource manager.
//!
//! The scheduler never links against a resource-manager SDK. A binding
//! translates SDK callbacks into [`FrameworkScheduler`] calls and implements
//! [`ResourceDriver`] on top of its driver handle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// A resource advertisement for one slave, valid until rescinded.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceOffer {
    pub offer_id: String,
    pub slave_id: String,
    pub hostname: String,
    pub cpus: f64,
    pub memory_mb: f64,
}

/// Task states reported by the resource manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
    Error,
}

/// One task-status callback payload. `message` carries executor-defined
/// detail such as the daemon BEGIN/COMPLETE markers.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub task_id: String,
    pub slave_id: String,
    pub state: TaskState,
    pub message: Option<String>,
}

/// A fetchable artifact for the executor sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandUri {
    pub value: String,
    pub extract: bool,
    pub cache: bool,
}

/// Shell command starting the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInfo {
    pub value: String,
    pub uris: Vec<CommandUri>,
}

/// Executor the task runs under; shared per job build for reuse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorInfo {
    pub executor_id: String,
    pub command: CommandInfo,
}

/// Everything the resource manager needs to launch one task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInfo {
    pub task_id: String,
    pub name: String,
    pub slave_id: String,
    pub cpus: f64,
    pub memory_mb: f64,
    pub executor: ExecutorInfo,
    /// Serialized [`crate::context::ShardingContexts`] payload.
    pub data: Vec<u8>,
}

/// Handle for the actions the scheduler takes against the resource manager.
#[async_trait]
pub trait ResourceDriver: Send + Sync {
    /// Launch a batch of tasks against the offers backing them. All offers
    /// must belong to a single slave.
    async fn launch_tasks(&self, offer_ids: Vec<String>, tasks: Vec<TaskInfo>)
        -> Result<()>;

    /// Ask the resource manager to kill one task.
    async fn kill_task(&self, task_id: String) -> Result<()>;
}

/// The callback capability set a resource-manager binding drives.
///
/// Callbacks may arrive concurrently on different threads. Implementations
/// must absorb their own failures; nothing propagates back into the SDK.
#[async_trait]
pub trait FrameworkScheduler: Send + Sync {
    async fn registered(&self, framework_id: &str, master: &str);

    async fn reregistered(&self, master: &str);

    async fn disconnected(&self);

    async fn resource_offers(&self, offers: Vec<ResourceOffer>);

    async fn offer_rescinded(&self, offer_id: &str);

    async fn status_update(&self, status: StatusUpdate);

    async fn slave_lost(&self, slave_id: &str);

    async fn executor_lost(&self, executor_id: &str, slave_id: &str);

    async fn error(&self, message: &str);
}
