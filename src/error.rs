//! Sensorstream error abstractions.

use std::time::Duration;

use thiserror::Error;

use crate::models::{Actor, AuthMode, ClusterRef, ClusterState, ClusterStatus, VersionToken};
use crate::orchestrator::LifecycleState;
use crate::poll::Retryable;

/// Errors returned by the cluster control plane.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ControlPlaneError {
    /// The referenced cluster does not exist, or is not yet visible.
    #[error("cluster not found: {0}")]
    NotFound(String),
    /// The caller has exceeded the control plane's request rate.
    #[error("request throttled by the control plane")]
    Throttled,
    /// A network or service error which may succeed if retried.
    #[error("transient control plane error: {0}")]
    Transient(String),
    /// The version presented with a mutation is not the cluster's current version.
    #[error("version conflict, expected {expected} but current version is {current}")]
    VersionConflict { expected: VersionToken, current: VersionToken },
    /// The requested data is not available yet.
    #[error("resource not ready: {0}")]
    NotReady(String),
    /// The request was rejected outright and must not be retried.
    #[error("request rejected by the control plane: {0}")]
    Rejected(String),
}

impl Retryable for ControlPlaneError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Throttled | Self::Transient(_))
    }

    fn is_pending(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::NotReady(_))
    }
}

/// A result type for control plane calls.
pub type ControlPlaneResult<T> = ::std::result::Result<T, ControlPlaneError>;

/// An invalid cluster or pipeline configuration. Never retried.
#[derive(Clone, Debug, Error, PartialEq)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);

impl ConfigError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Errors related to resolving data plane endpoints from cluster state.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum EndpointError {
    /// Connectivity has not been enabled on the cluster yet.
    #[error("connectivity is not enabled on cluster {0}")]
    NotReady(ClusterRef),
    /// The cluster exposes no endpoint for the requested auth mode.
    #[error("no bootstrap endpoint available for auth mode {0}")]
    Unavailable(AuthMode),
    /// No auth mode was requested at all.
    #[error("no auth mode configured for endpoint resolution")]
    NoAuthModes,
    /// The endpoint string could not be parsed as a `host:port` list.
    #[error("malformed bootstrap endpoint for auth mode {mode}: {value}")]
    Malformed { mode: AuthMode, value: String },
}

/// A failed delivery of pipeline data.
///
/// Delivery failures are always propagated to whatever invoked the pipeline actor, so that the
/// work may be redelivered.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum DeliveryError {
    #[error("error publishing to topic {topic}: {reason}")]
    Publish { topic: String, reason: String },
    #[error("error encoding record: {0}")]
    Encode(String),
    #[error("error flushing producer: {0}")]
    Flush(String),
    #[error("error committing offset {offset} for {topic}/{group}: {reason}")]
    Commit { topic: String, group: String, offset: u64, reason: String },
    #[error("unknown topic {0}")]
    UnknownTopic(String),
    #[error("error writing archive key {key}: {reason}")]
    Archive { key: String, reason: String },
    #[error("error publishing notification for sensor {sensor_id}: {reason}")]
    Notify { sensor_id: String, reason: String },
    #[error("batch exceeded its time budget of {0:?}")]
    TimedOut(Duration),
    #[error("error connecting to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },
}

/// A fatal deployment failure.
///
/// Every variant which originates from the control plane carries the last observed cluster
/// state, so that an operator may inspect what was left behind. Nothing is torn down.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Configuration(#[from] ConfigError),
    #[error("timed out after {elapsed:?} waiting for {waiting_for}")]
    Timeout {
        waiting_for: &'static str,
        elapsed: Duration,
        last_error: Option<ControlPlaneError>,
        last_observed: Option<Box<ClusterState>>,
    },
    #[error("connectivity update on cluster {cluster} hit {attempts} consecutive version conflicts")]
    VersionConflict {
        cluster: ClusterRef,
        attempts: u32,
        last_observed: Option<Box<ClusterState>>,
    },
    #[error("control plane call {action} failed: {source}")]
    ControlPlane {
        action: &'static str,
        source: ControlPlaneError,
        last_observed: Option<Box<ClusterState>>,
    },
    #[error("cluster {cluster} entered status {status}")]
    ClusterFailed {
        cluster: ClusterRef,
        status: ClusterStatus,
        last_observed: Option<Box<ClusterState>>,
    },
    #[error("{action} requires lifecycle state {required}, cluster is {current}")]
    NotReady {
        action: &'static str,
        required: LifecycleState,
        current: LifecycleState,
        last_observed: Option<Box<ClusterState>>,
    },
    #[error("error resolving endpoint: {0}")]
    Endpoint(#[from] EndpointError),
    #[error("error wiring {actor}: {source}")]
    Wiring { actor: Actor, source: DeliveryError },
}

impl DeployError {
    /// The last cluster state observed before this failure, if any.
    pub fn last_observed(&self) -> Option<&ClusterState> {
        match self {
            Self::Timeout { last_observed, .. }
            | Self::VersionConflict { last_observed, .. }
            | Self::ControlPlane { last_observed, .. }
            | Self::ClusterFailed { last_observed, .. }
            | Self::NotReady { last_observed, .. } => last_observed.as_deref(),
            Self::Configuration(_) | Self::Endpoint(_) | Self::Wiring { .. } => None,
        }
    }
}

/// A result type for deployment operations.
pub type DeployResult<T> = ::std::result::Result<T, DeployError>;
