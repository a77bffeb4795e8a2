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

//! In-process [`StateStore`] implementation.
//!
//! State lives only as long as the process; durable backends (etcd,
//! zookeeper, ...) plug in behind the same trait.

use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::Stream;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;

use trebuchet_core::error::Result;

use crate::state::backend::{
    KeyLock, Keyspace, Lock, Operation, StateStore, Watch, WatchEvent,
};

type KeyspaceMap = HashMap<Keyspace, BTreeMap<String, Vec<u8>>>;

struct Watcher {
    keyspace: Keyspace,
    prefix: String,
    sender: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<KeyspaceMap>>,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    watchers: Arc<Mutex<Vec<Watcher>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, keyspace: Keyspace, events: Vec<WatchEvent>) {
        let mut watchers = self.watchers.lock();
        // Senders whose receiver is gone are pruned on the way through.
        watchers.retain(|watcher| {
            if watcher.keyspace != keyspace {
                return true;
            }
            for event in &events {
                let key = match event {
                    WatchEvent::Put(key, _) => key,
                    WatchEvent::Delete(key) => key,
                };
                if key.starts_with(&watcher.prefix)
                    && watcher.sender.send(event.clone()).is_err()
                {
                    return false;
                }
            }
            true
        });
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, keyspace: Keyspace, key: &str) -> Result<Option<Vec<u8>>> {
        let state = self.state.read();
        Ok(state
            .get(&keyspace)
            .and_then(|space| space.get(key))
            .cloned())
    }

    async fn get_from_prefix(
        &self,
        keyspace: Keyspace,
        prefix: &str,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let state = self.state.read();
        Ok(state
            .get(&keyspace)
            .map(|space| {
                space
                    .range(prefix.to_owned()..)
                    .take_while(|(key, _)| key.starts_with(prefix))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn scan(&self, keyspace: Keyspace) -> Result<Vec<(String, Vec<u8>)>> {
        let state = self.state.read();
        Ok(state
            .get(&keyspace)
            .map(|space| {
                space
                    .iter()
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn put(&self, keyspace: Keyspace, key: String, value: Vec<u8>) -> Result<()> {
        {
            let mut state = self.state.write();
            state
                .entry(keyspace)
                .or_default()
                .insert(key.clone(), value.clone());
        }
        self.notify(keyspace, vec![WatchEvent::Put(key, value)]);
        Ok(())
    }

    async fn apply_txn(&self, ops: Vec<(Operation, Keyspace, String)>) -> Result<()> {
        let mut events: Vec<(Keyspace, WatchEvent)> = Vec::with_capacity(ops.len());
        {
            let mut state = self.state.write();
            for (op, keyspace, key) in ops {
                let space = state.entry(keyspace).or_default();
                match op {
                    Operation::Put(value) => {
                        space.insert(key.clone(), value.clone());
                        events.push((keyspace, WatchEvent::Put(key, value)));
                    }
                    Operation::Delete => {
                        if space.remove(&key).is_some() {
                            events.push((keyspace, WatchEvent::Delete(key)));
                        }
                    }
                }
            }
        }
        for (keyspace, event) in events {
            self.notify(keyspace, vec![event]);
        }
        Ok(())
    }

    async fn delete(&self, keyspace: Keyspace, key: &str) -> Result<()> {
        let removed = {
            let mut state = self.state.write();
            state
                .get_mut(&keyspace)
                .and_then(|space| space.remove(key))
                .is_some()
        };
        if removed {
            self.notify(keyspace, vec![WatchEvent::Delete(key.to_owned())]);
        }
        Ok(())
    }

    async fn lock(&self, keyspace: Keyspace, key: &str) -> Result<Box<dyn Lock>> {
        let mutex = {
            let mut locks = self.locks.lock();
            locks
                .entry(format!("{keyspace:?}/{key}"))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        Ok(Box::new(KeyLock::new(keyspace, key, mutex.lock_owned().await)))
    }

    async fn watch(
        &self,
        keyspace: Keyspace,
        prefix: String,
    ) -> Result<Box<dyn Watch<Item = WatchEvent>>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.watchers.lock().push(Watcher {
            keyspace,
            prefix,
            sender,
        });
        Ok(Box::new(MemoryWatch { receiver }))
    }
}

struct MemoryWatch {
    receiver: mpsc::UnboundedReceiver<WatchEvent>,
}

impl Stream for MemoryWatch {
    type Item = WatchEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

#[async_trait]
impl Watch for MemoryWatch {
    async fn cancel(&mut self) -> Result<()> {
        self.receiver.close();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use futures::StreamExt;

    use super::*;

    #[tokio::test]
    async fn test_put_get_delete() -> Result<()> {
        let store = MemoryStore::new();

        store
            .put(Keyspace::Config, "job_a".to_owned(), b"cfg".to_vec())
            .await?;
        assert_eq!(
            store.get(Keyspace::Config, "job_a").await?,
            Some(b"cfg".to_vec())
        );
        assert_eq!(store.get(Keyspace::Ready, "job_a").await?, None);

        store.delete(Keyspace::Config, "job_a").await?;
        assert_eq!(store.get(Keyspace::Config, "job_a").await?, None);

        Ok(())
    }

    #[tokio::test]
    async fn test_prefix_scan_is_ordered() -> Result<()> {
        let store = MemoryStore::new();

        for key in ["job_a/1", "job_a/0", "job_b/0"] {
            store
                .put(Keyspace::Running, key.to_owned(), vec![])
                .await?;
        }

        let entries = store.get_from_prefix(Keyspace::Running, "job_a/").await?;
        let keys: Vec<&str> = entries.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["job_a/0", "job_a/1"]);

        assert_eq!(store.scan(Keyspace::Running).await?.len(), 3);

        Ok(())
    }

    #[tokio::test]
    async fn test_txn_applies_all_ops() -> Result<()> {
        let store = MemoryStore::new();
        store
            .put(Keyspace::Running, "job_a/0".to_owned(), vec![1])
            .await?;

        store
            .apply_txn(vec![
                (Operation::Delete, Keyspace::Running, "job_a/0".to_owned()),
                (
                    Operation::Put(vec![2]),
                    Keyspace::Failover,
                    "job_a/0".to_owned(),
                ),
            ])
            .await?;

        assert_eq!(store.get(Keyspace::Running, "job_a/0").await?, None);
        assert_eq!(store.get(Keyspace::Failover, "job_a/0").await?, Some(vec![2]));

        Ok(())
    }

    #[tokio::test]
    async fn test_watch_sees_prefix_events() -> Result<()> {
        let store = MemoryStore::new();
        let mut watch = store.watch(Keyspace::Running, "job_a/".to_owned()).await?;

        store
            .put(Keyspace::Running, "job_b/0".to_owned(), vec![])
            .await?;
        store
            .put(Keyspace::Running, "job_a/0".to_owned(), vec![7])
            .await?;
        store.delete(Keyspace::Running, "job_a/0").await?;

        assert_eq!(
            watch.next().await,
            Some(WatchEvent::Put("job_a/0".to_owned(), vec![7]))
        );
        assert_eq!(
            watch.next().await,
            Some(WatchEvent::Delete("job_a/0".to_owned()))
        );

        watch.cancel().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_lock_serializes_writers() -> Result<()> {
        let store = MemoryStore::new();

        let first = store.lock(Keyspace::Config, "job_a").await?;
        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                let lock = store.lock(Keyspace::Config, "job_a").await.unwrap();
                crate::state::backend::with_lock(lock, async {}).await;
            })
        };

        // The contender cannot finish until the first lock is released.
        assert!(!contender.is_finished());
        crate::state::backend::with_lock(first, async {}).await;
        contender.await.unwrap();

        Ok(())
    }
}
