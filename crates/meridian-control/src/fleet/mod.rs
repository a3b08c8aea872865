//! Cloud fleet provider abstraction.
//!
//! Controllers launch, terminate and inspect hosts through [`CloudFleetApi`].
//! The HTTP implementation talks to a provisioning service; [`MockFleet`] keeps
//! everything in memory and records what it was asked to do.

mod client;

pub use client::HttpFleet;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{FleetBackend, FleetConfig};
use crate::error::{ControlError, ControlResult};
use crate::types::HostId;

/// Operations the control plane needs from the cloud provider.
#[async_trait]
pub trait CloudFleetApi: Send + Sync {
    /// Launch up to `count` hosts for `cluster` outside its pool.
    ///
    /// Partial success is possible; an empty result means nothing launched.
    async fn launch_hosts(
        &self,
        cluster: &str,
        count: usize,
        image: Option<&str>,
    ) -> ControlResult<Vec<HostId>>;

    /// Request termination of `ids`.
    ///
    /// With `drain` set the provider lets the hosts finish in-flight work and
    /// does not shrink the pool to compensate.
    async fn terminate_hosts(&self, cluster: &str, ids: &[HostId], drain: bool)
        -> ControlResult<()>;

    /// Subset of `ids` the provider reports terminated or stopped.
    async fn list_terminated(&self, ids: &[HostId]) -> ControlResult<HashSet<HostId>>;

    /// Subset of `ids` the provider reports running, in input order.
    async fn list_running(&self, ids: &[HostId]) -> ControlResult<Vec<HostId>>;

    /// Move out-of-pool hosts into the pool of `cluster`.
    async fn attach_to_pool(&self, ids: &[HostId], cluster: &str) -> ControlResult<()>;

    /// Desired size of the pool of `cluster`.
    async fn current_pool_size(&self, cluster: &str) -> ControlResult<u64>;

    /// Value of provider tag `tag` on each of `ids` that carries it.
    async fn host_tags(&self, ids: &[HostId], tag: &str)
        -> ControlResult<HashMap<HostId, String>>;
}

/// Create a fleet client from configuration.
pub fn create_fleet(config: &FleetConfig) -> ControlResult<Arc<dyn CloudFleetApi>> {
    match config.backend {
        FleetBackend::Http => {
            let fleet = HttpFleet::new(config)?;
            Ok(Arc::new(fleet))
        }
        FleetBackend::Mock => Ok(Arc::new(MockFleet::default())),
    }
}

#[derive(Debug, Clone)]
struct MockHost {
    cluster: String,
    terminated: bool,
    tags: HashMap<String, String>,
}

/// A recorded `terminate_hosts` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminateCall {
    pub cluster: String,
    pub ids: Vec<HostId>,
    pub drain: bool,
}

/// A recorded `launch_hosts` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCall {
    pub cluster: String,
    pub count: usize,
    pub image: Option<String>,
    pub launched: Vec<HostId>,
}

#[derive(Debug, Default)]
struct MockState {
    hosts: BTreeMap<HostId, MockHost>,
    pool_sizes: HashMap<String, u64>,
    launch_limit: Option<usize>,
    launch_capacity: Option<usize>,
    fail_launches: bool,
    next_id: u64,
    launches: Vec<LaunchCall>,
    terminations: Vec<TerminateCall>,
    attachments: Vec<(String, Vec<HostId>)>,
}

/// In-memory fleet for tests and local runs.
#[derive(Debug, Default)]
pub struct MockFleet {
    state: Mutex<MockState>,
}

impl MockFleet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running host.
    pub fn add_host(&self, cluster: &str, id: &HostId) {
        self.state.lock().hosts.insert(
            id.clone(),
            MockHost {
                cluster: cluster.to_owned(),
                terminated: false,
                tags: HashMap::new(),
            },
        );
    }

    /// Make the provider report `id` as terminated.
    pub fn mark_terminated(&self, id: &HostId) {
        if let Some(host) = self.state.lock().hosts.get_mut(id) {
            host.terminated = true;
        }
    }

    /// Launch at most `limit` hosts per call.
    pub fn set_launch_limit(&self, limit: Option<usize>) {
        self.state.lock().launch_limit = limit;
    }

    /// Launch at most `capacity` hosts in total until reset.
    pub fn set_launch_capacity(&self, capacity: Option<usize>) {
        self.state.lock().launch_capacity = capacity;
    }

    /// Make every launch return nothing.
    pub fn fail_launches(&self, fail: bool) {
        self.state.lock().fail_launches = fail;
    }

    pub fn set_pool_size(&self, cluster: &str, size: u64) {
        self.state.lock().pool_sizes.insert(cluster.to_owned(), size);
    }

    pub fn set_tag(&self, id: &HostId, tag: &str, value: &str) {
        if let Some(host) = self.state.lock().hosts.get_mut(id) {
            host.tags.insert(tag.to_owned(), value.to_owned());
        }
    }

    #[must_use]
    pub fn is_terminated(&self, id: &HostId) -> bool {
        self.state
            .lock()
            .hosts
            .get(id)
            .is_some_and(|host| host.terminated)
    }

    #[must_use]
    pub fn launches(&self) -> Vec<LaunchCall> {
        self.state.lock().launches.clone()
    }

    #[must_use]
    pub fn terminations(&self) -> Vec<TerminateCall> {
        self.state.lock().terminations.clone()
    }

    /// Every host id passed to `terminate_hosts`, in call order.
    #[must_use]
    pub fn terminated_ids(&self) -> Vec<HostId> {
        self.state
            .lock()
            .terminations
            .iter()
            .flat_map(|call| call.ids.iter().cloned())
            .collect()
    }

    #[must_use]
    pub fn attachments(&self) -> Vec<(String, Vec<HostId>)> {
        self.state.lock().attachments.clone()
    }
}

#[async_trait]
impl CloudFleetApi for MockFleet {
    async fn launch_hosts(
        &self,
        cluster: &str,
        count: usize,
        image: Option<&str>,
    ) -> ControlResult<Vec<HostId>> {
        let mut state = self.state.lock();
        let count = if state.fail_launches {
            0
        } else {
            state.launch_limit.map_or(count, |limit| count.min(limit))
        };
        let count = state.launch_capacity.map_or(count, |left| count.min(left));
        if let Some(left) = state.launch_capacity.as_mut() {
            *left -= count;
        }

        let mut launched = Vec::with_capacity(count);
        for _ in 0..count {
            state.next_id += 1;
            let id = HostId::new(format!("i-mock-{:04}", state.next_id));
            state.hosts.insert(
                id.clone(),
                MockHost {
                    cluster: cluster.to_owned(),
                    terminated: false,
                    tags: HashMap::new(),
                },
            );
            launched.push(id);
        }

        state.launches.push(LaunchCall {
            cluster: cluster.to_owned(),
            count,
            image: image.map(ToOwned::to_owned),
            launched: launched.clone(),
        });
        Ok(launched)
    }

    async fn terminate_hosts(
        &self,
        cluster: &str,
        ids: &[HostId],
        drain: bool,
    ) -> ControlResult<()> {
        let mut state = self.state.lock();
        for id in ids {
            match state.hosts.get_mut(id) {
                Some(host) if host.cluster == cluster => host.terminated = true,
                Some(host) => {
                    return Err(ControlError::fleet(format!(
                        "host {id} belongs to {}, not {cluster}",
                        host.cluster
                    )))
                }
                None => {}
            }
        }
        state.terminations.push(TerminateCall {
            cluster: cluster.to_owned(),
            ids: ids.to_vec(),
            drain,
        });
        Ok(())
    }

    async fn list_terminated(&self, ids: &[HostId]) -> ControlResult<HashSet<HostId>> {
        let state = self.state.lock();
        Ok(ids
            .iter()
            .filter(|id| state.hosts.get(*id).is_some_and(|host| host.terminated))
            .cloned()
            .collect())
    }

    async fn list_running(&self, ids: &[HostId]) -> ControlResult<Vec<HostId>> {
        let state = self.state.lock();
        Ok(ids
            .iter()
            .filter(|id| state.hosts.get(*id).is_some_and(|host| !host.terminated))
            .cloned()
            .collect())
    }

    async fn attach_to_pool(&self, ids: &[HostId], cluster: &str) -> ControlResult<()> {
        self.state
            .lock()
            .attachments
            .push((cluster.to_owned(), ids.to_vec()));
        Ok(())
    }

    async fn current_pool_size(&self, cluster: &str) -> ControlResult<u64> {
        Ok(self
            .state
            .lock()
            .pool_sizes
            .get(cluster)
            .copied()
            .unwrap_or(0))
    }

    async fn host_tags(
        &self,
        ids: &[HostId],
        tag: &str,
    ) -> ControlResult<HashMap<HostId, String>> {
        let state = self.state.lock();
        Ok(ids
            .iter()
            .filter_map(|id| {
                let value = state.hosts.get(id)?.tags.get(tag)?;
                Some((id.clone(), value.clone()))
            })
            .collect())
    }
}
