//! An in-memory control plane which simulates slow, eventually consistent convergence.
//!
//! Clusters are created in status `creating` and become `active` only after a configurable
//! number of describe calls. Connectivity updates follow the same pattern. Every mutation is
//! guarded by a server side version check and deduplicated per client token.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::control_plane::{ClientToken, ControlPlaneClient};
use crate::error::{ControlPlaneError, ControlPlaneResult};
use crate::models::{AuthMode, ClusterRef, ClusterSpec, ClusterState, ClusterStatus, ConnectivityInfo, ConnectivityStatus, VersionToken};

/// The data plane port used by brokers for SASL/IAM clients.
pub const PORT_SASL_IAM: u16 = 9098;
/// The data plane port used by brokers for mutual TLS clients.
pub const PORT_MUTUAL_TLS: u16 = 9094;

/// The operations of the control plane, used for fault injection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    FindCluster,
    CreateCluster,
    Describe,
    UpdateConnectivity,
    GetEndpoints,
}

/// An in-memory control plane.
pub struct MemoryControlPlane {
    /// The number of describe calls a pending change needs before it converges.
    convergence_polls: u32,
    inner: Mutex<Inner>,
    /// The number of mutating calls received.
    mutating_calls: AtomicU64,
    /// The number of read calls received.
    read_calls: AtomicU64,
}

#[derive(Default)]
struct Inner {
    clusters: BTreeMap<ClusterRef, SimCluster>,
    names: HashMap<String, ClusterRef>,
    create_tokens: HashMap<ClientToken, ClusterRef>,
    update_tokens: HashMap<ClientToken, VersionToken>,
    faults: HashMap<Operation, VecDeque<ControlPlaneError>>,
    last_version: u64,
    last_id: u64,
}

struct SimCluster {
    spec: ClusterSpec,
    state: ClusterState,
    /// Describe calls remaining before the pending change converges.
    pending_polls: u32,
}

impl MemoryControlPlane {
    /// Create a new instance.
    pub fn new(convergence_polls: u32) -> Self {
        Self {
            convergence_polls,
            inner: Mutex::new(Inner::default()),
            mutating_calls: AtomicU64::new(0),
            read_calls: AtomicU64::new(0),
        }
    }

    /// The number of mutating calls (create, update) this control plane has received.
    pub fn mutating_calls(&self) -> u64 {
        self.mutating_calls.load(Ordering::SeqCst)
    }

    /// The number of read calls (find, describe, get endpoints) this control plane has received.
    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::SeqCst)
    }

    /// Queue an error to be returned by the next call of the given operation.
    pub async fn inject_fault(&self, op: Operation, err: ControlPlaneError) {
        self.inner.lock().await.faults.entry(op).or_default().push_back(err);
    }

    /// Advance the version of a cluster out of band, as a concurrent writer would.
    pub async fn bump_version(&self, cluster: &ClusterRef) -> Option<VersionToken> {
        let mut inner = self.inner.lock().await;
        let version = inner.next_version();
        let sim = inner.clusters.get_mut(cluster)?;
        sim.state.current_version = version.clone();
        Some(version)
    }

    /// Force the status of a cluster, bypassing convergence.
    pub async fn set_status(&self, cluster: &ClusterRef, status: ClusterStatus) {
        if let Some(sim) = self.inner.lock().await.clusters.get_mut(cluster) {
            sim.state.status = status;
        }
    }

    /// Get a snapshot of a cluster's state without counting it as a call or driving convergence.
    pub async fn peek(&self, cluster: &ClusterRef) -> Option<ClusterState> {
        self.inner.lock().await.clusters.get(cluster).map(|sim| sim.state.clone())
    }

    fn count_read(&self) {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn count_mutation(&self) {
        self.mutating_calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl Inner {
    fn next_version(&mut self) -> VersionToken {
        self.last_version += 1;
        VersionToken::new(format!("K{:012X}", self.last_version))
    }

    fn take_fault(&mut self, op: Operation) -> ControlPlaneResult<()> {
        match self.faults.get_mut(&op).and_then(|queue| queue.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl SimCluster {
    /// Drive any pending change one step closer to convergence.
    fn tick(&mut self) {
        let pending = matches!(self.state.status, ClusterStatus::Creating | ClusterStatus::Updating)
            || self.state.connectivity_status == ConnectivityStatus::Enabling;
        if !pending {
            return;
        }
        self.pending_polls = self.pending_polls.saturating_sub(1);
        if self.pending_polls > 0 {
            return;
        }
        if matches!(self.state.status, ClusterStatus::Creating | ClusterStatus::Updating) {
            self.state.status = ClusterStatus::Active;
        }
        if self.state.connectivity_status == ConnectivityStatus::Enabling {
            self.state.connectivity_status = ConnectivityStatus::Enabled;
            self.state.bootstrap_endpoints = self.endpoints();
        }
    }

    /// Build the bootstrap strings of every auth mode enabled both on the cluster and on its
    /// connectivity.
    fn endpoints(&self) -> BTreeMap<AuthMode, String> {
        let modes = match &self.state.connectivity {
            Some(conn) => &conn.auth_modes,
            None => return BTreeMap::new(),
        };
        self.spec
            .auth_modes
            .iter()
            .filter(|mode| modes.contains(mode))
            .map(|mode| {
                let port = match mode {
                    AuthMode::SaslIam => PORT_SASL_IAM,
                    AuthMode::MutualTls => PORT_MUTUAL_TLS,
                };
                let servers: Vec<_> = (1..=self.spec.broker_count)
                    .map(|broker| format!("b-{}.{}.kafka.local:{}", broker, self.spec.name, port))
                    .collect();
                (*mode, servers.join(","))
            })
            .collect()
    }
}

#[async_trait]
impl ControlPlaneClient for MemoryControlPlane {
    async fn find_cluster(&self, name: &str) -> ControlPlaneResult<Option<ClusterRef>> {
        self.count_read();
        let mut inner = self.inner.lock().await;
        inner.take_fault(Operation::FindCluster)?;
        Ok(inner.names.get(name).cloned())
    }

    async fn create_cluster(&self, spec: &ClusterSpec, token: &ClientToken) -> ControlPlaneResult<ClusterRef> {
        self.count_mutation();
        let mut inner = self.inner.lock().await;
        inner.take_fault(Operation::CreateCluster)?;
        if let Some(arn) = inner.create_tokens.get(token) {
            return Ok(arn.clone());
        }
        spec.validate().map_err(|err| ControlPlaneError::Rejected(err.to_string()))?;
        if inner.names.contains_key(&spec.name) {
            return Err(ControlPlaneError::Rejected(format!("a cluster named {} already exists", spec.name)));
        }

        inner.last_id += 1;
        let arn = ClusterRef::new(format!("arn:sim:kafka:cluster/{}/{:08x}", spec.name, inner.last_id));
        let current_version = inner.next_version();
        let state = ClusterState {
            arn: arn.clone(),
            current_version,
            status: if self.convergence_polls == 0 { ClusterStatus::Active } else { ClusterStatus::Creating },
            connectivity: None,
            connectivity_status: ConnectivityStatus::Disabled,
            bootstrap_endpoints: BTreeMap::new(),
        };
        inner.clusters.insert(arn.clone(), SimCluster {
            spec: spec.clone(),
            state,
            pending_polls: self.convergence_polls,
        });
        inner.names.insert(spec.name.clone(), arn.clone());
        inner.create_tokens.insert(*token, arn.clone());
        tracing::debug!(cluster = %arn, "simulated cluster created");
        Ok(arn)
    }

    async fn describe(&self, cluster: &ClusterRef) -> ControlPlaneResult<ClusterState> {
        self.count_read();
        let mut inner = self.inner.lock().await;
        inner.take_fault(Operation::Describe)?;
        let sim = inner
            .clusters
            .get_mut(cluster)
            .ok_or_else(|| ControlPlaneError::NotFound(cluster.to_string()))?;
        sim.tick();
        Ok(sim.state.clone())
    }

    async fn update_connectivity(
        &self, cluster: &ClusterRef, expected: &VersionToken, desired: &ConnectivityInfo, token: &ClientToken,
    ) -> ControlPlaneResult<VersionToken> {
        self.count_mutation();
        let mut inner = self.inner.lock().await;
        inner.take_fault(Operation::UpdateConnectivity)?;
        if let Some(version) = inner.update_tokens.get(token) {
            return Ok(version.clone());
        }
        let new_version = {
            let sim = inner
                .clusters
                .get(cluster)
                .ok_or_else(|| ControlPlaneError::NotFound(cluster.to_string()))?;
            if &sim.state.current_version != expected {
                return Err(ControlPlaneError::VersionConflict {
                    expected: expected.clone(),
                    current: sim.state.current_version.clone(),
                });
            }
            if !sim.state.is_active() {
                return Err(ControlPlaneError::Rejected(format!(
                    "cluster {} is {}, connectivity may only be updated on active clusters",
                    cluster, sim.state.status
                )));
            }
            if let Some(mode) = desired.auth_modes.iter().find(|mode| !sim.spec.auth_modes.contains(mode)) {
                return Err(ControlPlaneError::Rejected(format!("auth mode {} is not enabled on cluster {}", mode, cluster)));
            }
            inner.next_version()
        };

        let convergence_polls = self.convergence_polls;
        if let Some(sim) = inner.clusters.get_mut(cluster) {
            sim.state.current_version = new_version.clone();
            sim.state.connectivity = Some(desired.clone());
            sim.state.connectivity_status = ConnectivityStatus::Enabling;
            sim.state.status = ClusterStatus::Updating;
            sim.state.bootstrap_endpoints.clear();
            sim.pending_polls = convergence_polls;
            if convergence_polls == 0 {
                sim.pending_polls = 1;
                sim.tick();
            }
        }
        inner.update_tokens.insert(*token, new_version.clone());
        tracing::debug!(%cluster, version = %new_version, "simulated connectivity update accepted");
        Ok(new_version)
    }

    async fn get_endpoints(&self, cluster: &ClusterRef) -> ControlPlaneResult<BTreeMap<AuthMode, String>> {
        self.count_read();
        let mut inner = self.inner.lock().await;
        inner.take_fault(Operation::GetEndpoints)?;
        let sim = inner
            .clusters
            .get(cluster)
            .ok_or_else(|| ControlPlaneError::NotFound(cluster.to_string()))?;
        if sim.state.connectivity_status != ConnectivityStatus::Enabled {
            return Err(ControlPlaneError::NotReady(format!("connectivity of cluster {} is not enabled", cluster)));
        }
        Ok(sim.state.bootstrap_endpoints.clone())
    }
}
