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

//! Constraint-aware assignment of task requests to resource leases.
//!
//! The engine hands every offer cycle to a [`ResourcePlanner`] and launches
//! whatever it returns. The planner owns the lease cache and the registry of
//! placed tasks; both are mutated only on the callback thread that received
//! the offer.

use std::collections::{BTreeMap, HashMap, HashSet};

use log::debug;
use parking_lot::Mutex;

use trebuchet_core::context::TaskContext;
use trebuchet_core::framework::ResourceOffer;

/// One task to place, carrying its resource demand. The context still holds
/// the placeholder slave id; the chosen slave is known only after planning.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskRequest {
    pub context: TaskContext,
    pub cpus: f64,
    pub memory_mb: f64,
}

impl TaskRequest {
    pub fn new(context: TaskContext, cpus: f64, memory_mb: f64) -> Self {
        Self {
            context,
            cpus,
            memory_mb,
        }
    }
}

/// A cached resource offer.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub offer_id: String,
    pub slave_id: String,
    pub hostname: String,
    pub cpus: f64,
    pub memory_mb: f64,
}

impl From<ResourceOffer> for Lease {
    fn from(offer: ResourceOffer) -> Self {
        Self {
            offer_id: offer.offer_id,
            slave_id: offer.slave_id,
            hostname: offer.hostname,
            cpus: offer.cpus,
            memory_mb: offer.memory_mb,
        }
    }
}

/// The tasks one slave received in a cycle, together with the offers that
/// back their launch.
#[derive(Debug, Clone)]
pub struct VmAssignmentResult {
    pub slave_id: String,
    pub hostname: String,
    pub offer_ids: Vec<String>,
    pub tasks: Vec<TaskRequest>,
}

/// Method of distributing tasks to slaves with free resources
#[derive(Debug, Clone, Copy)]
pub enum TaskDistribution {
    /// Eagerly fill one slave before moving to the next
    Bias,
    /// Iterate through slaves and assign one task to each until all tasks
    /// are assigned
    RoundRobin,
}

/// The assignment algorithm the engine delegates to.
///
/// Implementations cache leases across cycles: offers not consumed by a plan
/// stay available until rescinded, their slave is lost, or the scheduler
/// (re)registers.
pub trait ResourcePlanner: Send + Sync {
    /// Place the given requests onto the cached and newly offered leases.
    /// Leases of every slave that appears in the result are consumed.
    fn plan(
        &self,
        requests: Vec<TaskRequest>,
        new_leases: Vec<Lease>,
    ) -> Vec<VmAssignmentResult>;

    /// Drop one cached lease after the resource manager rescinded its offer.
    fn expire_lease(&self, offer_id: &str);

    /// Drop every cached lease of a lost slave.
    fn expire_slave_leases(&self, slave_id: &str);

    /// Drop the whole lease cache, e.g. on (re)registration.
    fn expire_all_leases(&self);

    /// Record that a task was launched on a slave, so subsequent cycles see
    /// it placed.
    fn assign_task(&self, task_id: &str, slave_id: &str);

    /// Forget a placement after the task reached a terminal state.
    fn unassign_task(&self, task_id: &str, slave_id: &str);
}

/// Default planner: first-fit by cpu and memory over per-slave resource
/// pools, with a bias or round-robin slave order.
pub struct FirstFitPlanner {
    distribution: TaskDistribution,
    leases: Mutex<HashMap<String, Lease>>,
    assigned: Mutex<HashMap<String, HashSet<String>>>,
}

impl FirstFitPlanner {
    pub fn new(distribution: TaskDistribution) -> Self {
        Self {
            distribution,
            leases: Mutex::new(HashMap::new()),
            assigned: Mutex::new(HashMap::new()),
        }
    }

    pub fn cached_lease_count(&self) -> usize {
        self.leases.lock().len()
    }

    /// Task ids currently placed on a slave.
    pub fn assigned_tasks(&self, slave_id: &str) -> HashSet<String> {
        self.assigned
            .lock()
            .get(slave_id)
            .cloned()
            .unwrap_or_default()
    }
}

struct SlavePool {
    hostname: String,
    offer_ids: Vec<String>,
    cpus: f64,
    memory_mb: f64,
    tasks: Vec<TaskRequest>,
}

impl SlavePool {
    fn fits(&self, request: &TaskRequest) -> bool {
        self.cpus >= request.cpus && self.memory_mb >= request.memory_mb
    }

    fn place(&mut self, request: TaskRequest) {
        self.cpus -= request.cpus;
        self.memory_mb -= request.memory_mb;
        self.tasks.push(request);
    }
}

impl ResourcePlanner for FirstFitPlanner {
    fn plan(
        &self,
        requests: Vec<TaskRequest>,
        new_leases: Vec<Lease>,
    ) -> Vec<VmAssignmentResult> {
        let mut leases = self.leases.lock();
        for lease in new_leases {
            leases.entry(lease.offer_id.clone()).or_insert(lease);
        }

        // Aggregate the cached leases into one resource pool per slave,
        // in slave-id order for deterministic placement.
        let mut pools: BTreeMap<String, SlavePool> = BTreeMap::new();
        for lease in leases.values() {
            let pool = pools
                .entry(lease.slave_id.clone())
                .or_insert_with(|| SlavePool {
                    hostname: lease.hostname.clone(),
                    offer_ids: Vec::new(),
                    cpus: 0.0,
                    memory_mb: 0.0,
                    tasks: Vec::new(),
                });
            pool.offer_ids.push(lease.offer_id.clone());
            pool.cpus += lease.cpus;
            pool.memory_mb += lease.memory_mb;
        }

        let mut slave_ids: Vec<String> = pools.keys().cloned().collect();
        slave_ids.sort();
        let mut cursor = 0usize;

        for request in requests {
            let placed = match self.distribution {
                TaskDistribution::Bias => slave_ids
                    .iter()
                    .find(|slave_id| pools[*slave_id].fits(&request))
                    .cloned(),
                TaskDistribution::RoundRobin => {
                    let mut chosen = None;
                    for step in 0..slave_ids.len() {
                        let index = (cursor + step) % slave_ids.len();
                        if pools[&slave_ids[index]].fits(&request) {
                            cursor = (index + 1) % slave_ids.len();
                            chosen = Some(slave_ids[index].clone());
                            break;
                        }
                    }
                    chosen
                }
            };
            match placed {
                Some(slave_id) => {
                    if let Some(pool) = pools.get_mut(&slave_id) {
                        pool.place(request);
                    }
                }
                None => debug!(
                    "No lease fits task {} ({} cpus, {} mb)",
                    request.context.id(),
                    request.cpus,
                    request.memory_mb
                ),
            }
        }

        let mut results = Vec::new();
        for (slave_id, pool) in pools {
            if pool.tasks.is_empty() {
                continue;
            }
            for offer_id in &pool.offer_ids {
                leases.remove(offer_id);
            }
            results.push(VmAssignmentResult {
                slave_id,
                hostname: pool.hostname,
                offer_ids: pool.offer_ids,
                tasks: pool.tasks,
            });
        }
        results
    }

    fn expire_lease(&self, offer_id: &str) {
        self.leases.lock().remove(offer_id);
    }

    fn expire_slave_leases(&self, slave_id: &str) {
        self.leases
            .lock()
            .retain(|_, lease| lease.slave_id != slave_id);
    }

    fn expire_all_leases(&self) {
        self.leases.lock().clear();
    }

    fn assign_task(&self, task_id: &str, slave_id: &str) {
        self.assigned
            .lock()
            .entry(slave_id.to_owned())
            .or_default()
            .insert(task_id.to_owned());
    }

    fn unassign_task(&self, task_id: &str, slave_id: &str) {
        let mut assigned = self.assigned.lock();
        if let Some(tasks) = assigned.get_mut(slave_id) {
            tasks.remove(task_id);
            if tasks.is_empty() {
                assigned.remove(slave_id);
            }
        }
    }
}
