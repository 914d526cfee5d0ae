//! Data plane endpoint resolution.

use std::fmt;

use crate::error::EndpointError;
use crate::models::{AuthMode, ClusterState, ConnectivityStatus};

/// A resolved data plane endpoint for a specific auth mode.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// The auth mode clients must use on this endpoint.
    pub auth_mode: AuthMode,
    /// The bootstrap servers, each formatted as `host:port`.
    pub servers: Vec<String>,
}

impl Endpoint {
    /// The bootstrap string of this endpoint, formatted as `host1:port,host2:port`.
    pub fn bootstrap(&self) -> String {
        self.servers.join(",")
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.auth_mode, self.bootstrap())
    }
}

/// Resolve the endpoint of the given auth mode from an observed cluster state.
pub fn resolve(state: &ClusterState, mode: AuthMode) -> Result<Endpoint, EndpointError> {
    if state.connectivity_status != ConnectivityStatus::Enabled {
        return Err(EndpointError::NotReady(state.arn.clone()));
    }
    let raw = match state.bootstrap_endpoints.get(&mode).map(|val| val.trim()) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Err(EndpointError::Unavailable(mode)),
    };
    let servers = raw
        .split(',')
        .map(|server| server.trim())
        .map(|server| match server.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(server.to_string()),
            _ => Err(EndpointError::Malformed { mode, value: raw.to_string() }),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Endpoint { auth_mode: mode, servers })
}

/// Resolve the first endpoint available from the given preference list of auth modes.
///
/// Fails closed: an empty preference list is an error, never an unauthenticated fallback.
pub fn resolve_any(state: &ClusterState, modes: &[AuthMode]) -> Result<Endpoint, EndpointError> {
    let mut last_err = EndpointError::NoAuthModes;
    for mode in modes {
        match resolve(state, *mode) {
            Ok(endpoint) => return Ok(endpoint),
            Err(err @ EndpointError::NotReady(_)) => return Err(err),
            Err(err) => last_err = err,
        }
    }
    Err(last_err)
}
