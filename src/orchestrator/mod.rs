//! Cluster lifecycle orchestration.
//!
//! The orchestrator drives a broker cluster from not existing to being reachable over
//! multi-network connectivity with resolved data plane endpoints. Every step is idempotent and
//! may be resumed from whatever state the control plane reports. Mutations are guarded by the
//! cluster's version token, which is always read immediately before the mutation is issued.


use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::Mutex;

use crate::control_plane::{ClientToken, ControlPlaneClient};
use crate::endpoint::{self, Endpoint};
use crate::error::{ConfigError, ControlPlaneError, ControlPlaneResult, DeployError, DeployResult};
use crate::models::{AuthMode, ClusterRef, ClusterSpec, ClusterState, ClusterStatus, ConnectivityInfo, VersionToken};
use crate::poll::{poll_until, retry_transient, BackoffPolicy, PollError, Probe};

/// Metric name for mutating calls issued against the control plane.
pub const METRIC_CONTROL_PLANE_MUTATIONS: &str = "sensorstream_control_plane_mutations";
/// Metric name for version conflicts observed on connectivity updates.
pub const METRIC_VERSION_CONFLICTS: &str = "sensorstream_version_conflicts";

/// The lifecycle states of a cluster, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LifecycleState {
    /// No cluster with the desired name exists.
    Absent,
    /// Creation has been requested, the cluster is not active yet.
    Creating,
    /// The cluster exists and is active.
    Created,
    /// The connectivity update has been accepted, and is converging.
    ConnectivityPending,
    /// Multi-network connectivity is enabled.
    ConnectivityEnabled,
    /// Data plane endpoints have been resolved for every desired auth mode.
    EndpointsResolved,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Absent => "absent",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::ConnectivityPending => "connectivity_pending",
            Self::ConnectivityEnabled => "connectivity_enabled",
            Self::EndpointsResolved => "endpoints_resolved",
        })
    }
}

/// Per-cluster critical sections for mutating control plane calls.
///
/// Clones share the same set of locks, so orchestrators in the same process which target the
/// same cluster never issue mutations concurrently.
#[derive(Clone, Default)]
pub struct ClusterLocks(Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>);

impl ClusterLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the lock of the named cluster.
    pub async fn for_cluster(&self, name: &str) -> Arc<Mutex<()>> {
        self.0.lock().await.entry(name.to_string()).or_default().clone()
    }
}

/// A state machine driving a single cluster through its lifecycle.
pub struct ClusterLifecycleOrchestrator {
    client: Arc<dyn ControlPlaneClient>,
    spec: Arc<ClusterSpec>,
    desired: ConnectivityInfo,
    policy: BackoffPolicy,
    locks: ClusterLocks,

    /// The current lifecycle state.
    state: LifecycleState,
    /// The cluster being driven, once known.
    cluster: Option<ClusterRef>,
    /// The version observed by `capture_version`, kept for status reporting only.
    captured_version: Option<VersionToken>,
    /// The last cluster state observed from the control plane.
    last_observed: ArcSwapOption<ClusterState>,
    /// Endpoints resolved per desired auth mode.
    endpoints: BTreeMap<AuthMode, Endpoint>,
}

impl ClusterLifecycleOrchestrator {
    /// Create a new instance.
    ///
    /// The cluster spec and the desired connectivity are validated here, configuration errors are fatal.
    pub fn new(client: Arc<dyn ControlPlaneClient>, spec: Arc<ClusterSpec>, desired: ConnectivityInfo, policy: BackoffPolicy) -> DeployResult<Self> {
        spec.validate()?;
        if desired.auth_modes.is_empty() {
            return Err(ConfigError::new("desired connectivity must enable at least one auth mode").into());
        }
        if let Some(mode) = desired.auth_modes.iter().find(|mode| !spec.auth_modes.contains(mode)) {
            return Err(ConfigError::new(format!("desired connectivity auth mode {} is not enabled on the cluster", mode)).into());
        }
        metrics::register_counter!(METRIC_CONTROL_PLANE_MUTATIONS, metrics::Unit::Count, "mutating calls issued against the control plane");
        metrics::register_counter!(METRIC_VERSION_CONFLICTS, metrics::Unit::Count, "version conflicts observed on connectivity updates");
        Ok(Self {
            client,
            spec,
            desired,
            policy,
            locks: ClusterLocks::new(),
            state: LifecycleState::Absent,
            cluster: None,
            captured_version: None,
            last_observed: ArcSwapOption::empty(),
            endpoints: BTreeMap::new(),
        })
    }

    /// Share the given set of cluster locks with other orchestrators.
    pub fn with_locks(mut self, locks: ClusterLocks) -> Self {
        self.locks = locks;
        self
    }

    /// The current lifecycle state.
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// The cluster being driven, if known.
    pub fn cluster(&self) -> Option<&ClusterRef> {
        self.cluster.as_ref()
    }

    /// The version recorded by `capture_version`.
    pub fn captured_version(&self) -> Option<&VersionToken> {
        self.captured_version.as_ref()
    }

    /// The last cluster state observed from the control plane.
    pub fn last_observed(&self) -> Option<Arc<ClusterState>> {
        self.last_observed.load_full()
    }

    /// The endpoints resolved so far.
    pub fn endpoints(&self) -> &BTreeMap<AuthMode, Endpoint> {
        &self.endpoints
    }

    /// Drive the cluster through every lifecycle state, returning its resolved endpoints.
    #[tracing::instrument(level = "debug", skip(self), fields(cluster = %self.spec.name))]
    pub async fn run(&mut self) -> DeployResult<BTreeMap<AuthMode, Endpoint>> {
        self.observe().await?;
        self.ensure_created().await?;
        self.capture_version().await?;
        self.enable_connectivity().await?;
        self.resolve_endpoints().await?;
        Ok(self.endpoints.clone())
    }

    /// Reconstruct the lifecycle state from what the control plane reports.
    #[tracing::instrument(level = "debug", skip(self), fields(cluster = %self.spec.name))]
    pub async fn observe(&mut self) -> DeployResult<LifecycleState> {
        let arn = match self.find().await? {
            Some(arn) => arn,
            None => {
                self.state = LifecycleState::Absent;
                return Ok(self.state);
            }
        };
        self.cluster = Some(arn.clone());
        let observed = match self.describe_current(&arn).await {
            Ok(observed) => observed,
            // Newly created clusters may be listed before they can be described.
            Err(DeployError::ControlPlane { source: ControlPlaneError::NotFound(_), .. }) => {
                self.state = LifecycleState::Creating;
                return Ok(self.state);
            }
            Err(err) => return Err(err),
        };
        self.ensure_not_failed(&observed)?;

        let resolved = self.desired.auth_modes.iter().all(|mode| self.endpoints.contains_key(mode));
        let connectivity_configured = observed.connectivity.as_ref().map(|conn| conn.satisfies(&self.desired)).unwrap_or(false);
        self.state = match observed.status {
            ClusterStatus::Creating => LifecycleState::Creating,
            _ if observed.is_active() && observed.connectivity_enabled(&self.desired) && resolved => LifecycleState::EndpointsResolved,
            _ if observed.is_active() && observed.connectivity_enabled(&self.desired) => LifecycleState::ConnectivityEnabled,
            _ if connectivity_configured => LifecycleState::ConnectivityPending,
            _ => LifecycleState::Created,
        };
        tracing::debug!(cluster = %arn, state = %self.state, status = %observed.status, "observed cluster lifecycle state");
        Ok(self.state)
    }

    /// Ensure the cluster exists and is active.
    #[tracing::instrument(level = "debug", skip(self), fields(cluster = %self.spec.name))]
    pub async fn ensure_created(&mut self) -> DeployResult<()> {
        if self.cluster.is_none() {
            self.observe().await?;
        }
        if self.state >= LifecycleState::Created {
            return Ok(());
        }

        if self.state == LifecycleState::Absent {
            let lock = self.locks.for_cluster(&self.spec.name).await;
            let _guard = lock.lock().await;
            // Another orchestrator may have created the cluster while we were waiting.
            let arn = match self.find().await? {
                Some(arn) => arn,
                None => {
                    let (client, spec, token) = (&self.client, self.spec.as_ref(), ClientToken::generate());
                    tracing::info!(cluster = %spec.name, %token, "creating cluster");
                    metrics::increment_counter!(METRIC_CONTROL_PLANE_MUTATIONS);
                    retry_transient(&self.policy, "create_cluster", move || async move { client.create_cluster(spec, &token).await })
                        .await
                        .map_err(|err| self.control_plane_error("create_cluster", err))?
                }
            };
            self.cluster = Some(arn);
            self.state = LifecycleState::Creating;
        }

        let arn = self.cluster_ref("ensure_created")?;
        let observed = self.wait_for(&arn, "cluster to become active", ClusterState::is_active).await?;
        self.state = LifecycleState::Created;
        tracing::info!(cluster = %arn, version = %observed.current_version, "cluster is active");
        Ok(())
    }

    /// Describe the cluster and record its current version for status reporting.
    ///
    /// The captured version is never presented to a mutation, `enable_connectivity` always
    /// reads a fresh one.
    #[tracing::instrument(level = "debug", skip(self), fields(cluster = %self.spec.name))]
    pub async fn capture_version(&mut self) -> DeployResult<VersionToken> {
        self.require("capture_version", LifecycleState::Created)?;
        let arn = self.cluster_ref("capture_version")?;
        let observed = self.describe_current(&arn).await?;
        self.ensure_not_failed(&observed)?;
        tracing::info!(cluster = %arn, version = %observed.current_version, "captured cluster version");
        self.captured_version = Some(observed.current_version.clone());
        Ok(observed.current_version)
    }

    /// Enable the desired multi-network connectivity on the cluster and wait for it to converge.
    #[tracing::instrument(level = "debug", skip(self), fields(cluster = %self.spec.name))]
    pub async fn enable_connectivity(&mut self) -> DeployResult<()> {
        self.require("enable_connectivity", LifecycleState::Created)?;
        if self.state >= LifecycleState::ConnectivityEnabled {
            return Ok(());
        }
        let arn = self.cluster_ref("enable_connectivity")?;

        if self.state < LifecycleState::ConnectivityPending {
            let lock = self.locks.for_cluster(&self.spec.name).await;
            let _guard = lock.lock().await;
            self.update_connectivity(&arn).await?;
            self.state = LifecycleState::ConnectivityPending;
        }

        let desired = self.desired.clone();
        self.wait_for(&arn, "connectivity to be enabled", move |state| state.is_active() && state.connectivity_enabled(&desired))
            .await?;
        self.state = LifecycleState::ConnectivityEnabled;
        tracing::info!(cluster = %arn, scope = %self.desired.scope, "cluster connectivity enabled");
        Ok(())
    }

    /// Resolve the data plane endpoints of every desired auth mode.
    #[tracing::instrument(level = "debug", skip(self), fields(cluster = %self.spec.name))]
    pub async fn resolve_endpoints(&mut self) -> DeployResult<BTreeMap<AuthMode, Endpoint>> {
        self.require("resolve_endpoints", LifecycleState::ConnectivityEnabled)?;
        let arn = self.cluster_ref("resolve_endpoints")?;

        let (client, modes, arn_ref) = (&self.client, &self.desired.auth_modes, &arn);
        let raw = poll_until(&self.policy, "data plane endpoints", move || async move {
            let raw = client.get_endpoints(arn_ref).await?;
            let complete = modes.iter().all(|mode| raw.get(mode).map(|val| !val.trim().is_empty()).unwrap_or(false));
            Ok::<_, ControlPlaneError>(if complete { Probe::Ready(raw) } else { Probe::Pending })
        })
        .await
        .map_err(|err| self.poll_error("data plane endpoints", err))?;

        let mut observed = match self.last_observed.load_full() {
            Some(observed) => (*observed).clone(),
            None => self.describe_current(&arn).await?,
        };
        observed.bootstrap_endpoints = raw;
        let endpoints = self
            .desired
            .auth_modes
            .iter()
            .map(|mode| endpoint::resolve(&observed, *mode).map(|endpoint| (*mode, endpoint)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        self.last_observed.store(Some(Arc::new(observed)));

        for endpoint in endpoints.values() {
            tracing::info!(cluster = %arn, auth_mode = %endpoint.auth_mode, bootstrap = %endpoint.bootstrap(), "resolved data plane endpoint");
        }
        self.endpoints = endpoints;
        self.state = LifecycleState::EndpointsResolved;
        Ok(self.endpoints.clone())
    }

    /// Issue the connectivity update with the cluster's current version, retrying version
    /// conflicts up to the policy's budget. Must be called within the cluster's critical section.
    async fn update_connectivity(&self, arn: &ClusterRef) -> DeployResult<()> {
        let mut conflicts = 0u32;
        loop {
            // Always read the version right before mutating, never reuse an earlier one.
            let observed = self.wait_for(arn, "cluster to become active before connectivity update", ClusterState::is_active).await?;
            if observed.connectivity.as_ref().map(|conn| conn.satisfies(&self.desired)).unwrap_or(false) {
                tracing::info!(cluster = %arn, "desired connectivity already configured, skipping update");
                return Ok(());
            }

            // A conflict means a new request against a new version, so it gets a new token.
            // Transient retries of the same request reuse it.
            let token = ClientToken::generate();
            let (client, desired, expected) = (&self.client, &self.desired, &observed.current_version);
            tracing::info!(cluster = %arn, version = %expected, scope = %desired.scope, %token, "updating cluster connectivity");
            metrics::increment_counter!(METRIC_CONTROL_PLANE_MUTATIONS);
            let res = retry_transient(&self.policy, "update_connectivity", move || async move {
                client.update_connectivity(arn, expected, desired, &token).await
            })
            .await;
            match res {
                Ok(version) => {
                    tracing::info!(cluster = %arn, version = %version, "connectivity update accepted");
                    return Ok(());
                }
                Err(ControlPlaneError::VersionConflict { expected, current }) => {
                    metrics::increment_counter!(METRIC_VERSION_CONFLICTS);
                    conflicts += 1;
                    if conflicts > self.policy.max_version_conflict_retries {
                        tracing::error!(cluster = %arn, %expected, %current, conflicts, "connectivity update kept conflicting");
                        return Err(DeployError::VersionConflict {
                            cluster: arn.clone(),
                            attempts: conflicts,
                            last_observed: self.last_observed_boxed(),
                        });
                    }
                    tracing::warn!(cluster = %arn, %expected, %current, "version conflict on connectivity update, re-reading cluster");
                }
                Err(err) => return Err(self.control_plane_error("update_connectivity", err)),
            }
        }
    }

    /// Poll the cluster until the given condition holds, failing fast if the cluster fails or is deleted.
    async fn wait_for<F>(&self, arn: &ClusterRef, waiting_for: &'static str, done: F) -> DeployResult<ClusterState>
    where
        F: Fn(&ClusterState) -> bool + Sync,
    {
        let (client, last_observed, done) = (&self.client, &self.last_observed, &done);
        let observed = poll_until(&self.policy, waiting_for, move || async move {
            let observed = describe_and_record(client.as_ref(), last_observed, arn).await?;
            let probe = if observed.status.is_terminal() || done(&observed) {
                Probe::Ready(observed)
            } else {
                Probe::Pending
            };
            Ok::<_, ControlPlaneError>(probe)
        })
        .await
        .map_err(|err| self.poll_error(waiting_for, err))?;
        self.ensure_not_failed(&observed)?;
        Ok(observed)
    }

    /// Describe the cluster once, retrying transient errors.
    async fn describe_current(&self, arn: &ClusterRef) -> DeployResult<ClusterState> {
        let (client, last_observed) = (&self.client, &self.last_observed);
        retry_transient(&self.policy, "describe", move || async move { describe_and_record(client.as_ref(), last_observed, arn).await })
            .await
            .map_err(|err| self.control_plane_error("describe", err))
    }

    /// Look up the cluster by name, retrying transient errors.
    async fn find(&self) -> DeployResult<Option<ClusterRef>> {
        let (client, name) = (&self.client, self.spec.name.as_str());
        retry_transient(&self.policy, "find_cluster", move || async move { client.find_cluster(name).await })
            .await
            .map_err(|err| self.control_plane_error("find_cluster", err))
    }

    fn require(&self, action: &'static str, required: LifecycleState) -> DeployResult<()> {
        if self.state < required {
            return Err(DeployError::NotReady {
                action,
                required,
                current: self.state,
                last_observed: self.last_observed_boxed(),
            });
        }
        Ok(())
    }

    fn cluster_ref(&self, action: &'static str) -> DeployResult<ClusterRef> {
        self.cluster.clone().ok_or_else(|| DeployError::NotReady {
            action,
            required: LifecycleState::Creating,
            current: self.state,
            last_observed: self.last_observed_boxed(),
        })
    }

    fn ensure_not_failed(&self, observed: &ClusterState) -> DeployResult<()> {
        if observed.status.is_terminal() {
            tracing::error!(cluster = %observed.arn, status = %observed.status, "cluster entered a terminal status");
            return Err(DeployError::ClusterFailed {
                cluster: observed.arn.clone(),
                status: observed.status,
                last_observed: Some(Box::new(observed.clone())),
            });
        }
        Ok(())
    }

    fn last_observed_boxed(&self) -> Option<Box<ClusterState>> {
        self.last_observed.load_full().map(|observed| Box::new((*observed).clone()))
    }

    fn control_plane_error(&self, action: &'static str, source: ControlPlaneError) -> DeployError {
        tracing::error!(cluster = %self.spec.name, action, error = %source, "control plane call failed");
        DeployError::ControlPlane {
            action,
            source,
            last_observed: self.last_observed_boxed(),
        }
    }

    fn poll_error(&self, waiting_for: &'static str, err: PollError<ControlPlaneError>) -> DeployError {
        match err {
            PollError::Failed(source) => self.control_plane_error(waiting_for, source),
            PollError::DeadlineExceeded { elapsed, attempts, last_error } => {
                tracing::error!(cluster = %self.spec.name, waiting_for, ?elapsed, attempts, "deadline exceeded");
                DeployError::Timeout {
                    waiting_for,
                    elapsed,
                    last_error,
                    last_observed: self.last_observed_boxed(),
                }
            }
        }
    }
}

/// Describe a cluster, recording the observed state.
async fn describe_and_record(
    client: &dyn ControlPlaneClient, last_observed: &ArcSwapOption<ClusterState>, arn: &ClusterRef,
) -> ControlPlaneResult<ClusterState> {
    let observed = client.describe(arn).await?;
    last_observed.store(Some(Arc::new(observed.clone())));
    Ok(observed)
}
