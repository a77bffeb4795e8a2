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

pub mod memory;

use std::future::Future;

use async_trait::async_trait;
use futures::Stream;
use log::debug;
use tokio::sync::OwnedMutexGuard;

use trebuchet_core::error::Result;

/// The per-job state families kept in the coordination store.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Keyspace {
    /// Registered job configurations, keyed by job name
    Config,
    /// Job names awaiting the next offer cycle, keyed by job name
    Ready,
    /// Currently running tasks, keyed by `job/shard`
    Running,
    /// Shards awaiting re-launch after an abnormal exit, keyed by `job/shard`
    Failover,
}

#[derive(Debug, Eq, PartialEq, Hash)]
pub enum Operation {
    Put(Vec<u8>),
    Delete,
}

/// A KeyValue interface with basic locking primitives for persisting the
/// scheduler's cluster state.
///
/// The store is the synchronization point for the running set and the queues:
/// implementations must linearize writes per key, and the queues must survive
/// scheduler restarts.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Retrieve the data associated with a specific key in a given keyspace.
    ///
    /// `None` is returned if the key does not exist.
    async fn get(&self, keyspace: Keyspace, key: &str) -> Result<Option<Vec<u8>>>;

    /// Retrieve all key/value pairs in a given keyspace matching a given key
    /// prefix, in key order.
    async fn get_from_prefix(
        &self,
        keyspace: Keyspace,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>>;

    /// Retrieve all key/value pairs in a given keyspace, in key order.
    async fn scan(&self, keyspace: Keyspace) -> Result<Vec<(String, Vec<u8>)>>;

    /// Saves the value into the provided key, overriding any previous data
    /// that might have been associated to that key.
    async fn put(&self, keyspace: Keyspace, key: String, value: Vec<u8>) -> Result<()>;

    /// Bundle multiple operations in a single transaction. Either all values
    /// are applied, or none are.
    async fn apply_txn(&self, ops: Vec<(Operation, Keyspace, String)>) -> Result<()>;

    /// Permanently delete a key from state
    async fn delete(&self, keyspace: Keyspace, key: &str) -> Result<()>;

    /// Acquire mutex with specified ID.
    async fn lock(&self, keyspace: Keyspace, key: &str) -> Result<Box<dyn Lock>>;

    /// Watch all events that happen on a specific prefix.
    async fn watch(
        &self,
        keyspace: Keyspace,
        prefix: String,
    ) -> Result<Box<dyn Watch<Item = WatchEvent>>>;
}

#[async_trait]
pub trait Lock: Send + Sync {
    async fn unlock(&mut self);
}

/// A held store lock, remembering which entry it covers. The mutex is
/// released on `unlock` or, failing that, on drop.
pub struct KeyLock {
    keyspace: Keyspace,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLock {
    pub fn new(
        keyspace: Keyspace,
        key: impl Into<String>,
        guard: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            keyspace,
            key: key.into(),
            guard: Some(guard),
        }
    }
}

#[async_trait]
impl Lock for KeyLock {
    async fn unlock(&mut self) {
        if self.guard.take().is_some() {
            debug!("Released {:?} lock for {}", self.keyspace, self.key);
        }
    }
}

/// Utility for running a future while holding a store lock.
pub async fn with_lock<Out, F: Future<Output = Out>>(mut lock: Box<dyn Lock>, op: F) -> Out {
    let result = op.await;
    lock.unlock().await;
    result
}

/// A Watch is a cancelable stream of put or delete events in the [`StateStore`]
#[async_trait]
pub trait Watch: Stream<Item = WatchEvent> + Send + Unpin {
    async fn cancel(&mut self) -> Result<()>;
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum WatchEvent {
    /// Contains the inserted or updated key and the new value
    Put(String, Vec<u8>),

    /// Contains the deleted key
    Delete(String),
}
