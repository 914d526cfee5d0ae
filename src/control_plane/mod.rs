//! The cluster control plane interface.

pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::ControlPlaneResult;
use crate::models::{AuthMode, ClusterRef, ClusterSpec, ClusterState, ConnectivityInfo, VersionToken};

pub use memory::MemoryControlPlane;

/// A client request token used to make mutating calls idempotent.
///
/// A token is generated once per provisioning action and reused across every retry of that
/// action, so that the control plane may deduplicate calls which succeeded but whose responses
/// were lost.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ClientToken(Uuid);

impl ClientToken {
    /// Generate a new random token.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ClientToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// The external, eventually consistent cluster management API.
#[async_trait]
pub trait ControlPlaneClient: Send + Sync + 'static {
    /// Look up a cluster by its unique name.
    async fn find_cluster(&self, name: &str) -> ControlPlaneResult<Option<ClusterRef>>;

    /// Request creation of a new cluster. Idempotent per client token.
    async fn create_cluster(&self, spec: &ClusterSpec, token: &ClientToken) -> ControlPlaneResult<ClusterRef>;

    /// Describe the current state of a cluster.
    async fn describe(&self, cluster: &ClusterRef) -> ControlPlaneResult<ClusterState>;

    /// Update the client connectivity of a cluster.
    ///
    /// The update is applied only if `expected` is the cluster's current version, otherwise
    /// `VersionConflict` is returned and no state is changed. Returns the new version.
    async fn update_connectivity(
        &self, cluster: &ClusterRef, expected: &VersionToken, desired: &ConnectivityInfo, token: &ClientToken,
    ) -> ControlPlaneResult<VersionToken>;

    /// Get the data plane bootstrap strings of a cluster per auth mode.
    async fn get_endpoints(&self, cluster: &ClusterRef) -> ControlPlaneResult<BTreeMap<AuthMode, String>>;
}
