//! The deployment graph.
//!
//! Provisioning is modeled as an explicit DAG of named actions. Actions are executed one at a
//! time in topological order, actions which are already satisfied are skipped, and a failed
//! action stops the run. Applying the graph again resumes from the first unsatisfied action.


use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::control_plane::ControlPlaneClient;
use crate::error::{ConfigError, DeployError, DeployResult, EndpointError};
use crate::models::{Actor, AuthMode, ClusterSpec, ConnectivityInfo};
use crate::orchestrator::{ClusterLifecycleOrchestrator, ClusterLocks, LifecycleState};
use crate::pipeline::{DataPlane, DataPlaneConnector};
use crate::poll::BackoffPolicy;

/// The provisioning actions of a deployment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActionKind {
    Create,
    DescribeAndCaptureVersion,
    EnableConnectivity,
    ResolveEndpoints,
    WireProducer,
    WireProcessor,
    WireConsumer,
}

impl ActionKind {
    /// Every action of a deployment.
    pub const ALL: [ActionKind; 7] = [
        Self::Create,
        Self::DescribeAndCaptureVersion,
        Self::EnableConnectivity,
        Self::ResolveEndpoints,
        Self::WireProducer,
        Self::WireProcessor,
        Self::WireConsumer,
    ];

    /// The actions which must be satisfied before this one may run.
    pub fn depends_on(&self) -> &'static [ActionKind] {
        match self {
            Self::Create => &[],
            Self::DescribeAndCaptureVersion => &[Self::Create],
            Self::EnableConnectivity => &[Self::DescribeAndCaptureVersion],
            Self::ResolveEndpoints => &[Self::EnableConnectivity],
            Self::WireProducer | Self::WireProcessor | Self::WireConsumer => &[Self::ResolveEndpoints],
        }
    }

    /// The pipeline actor wired by this action, if any.
    pub fn actor(&self) -> Option<Actor> {
        match self {
            Self::WireProducer => Some(Actor::Producer),
            Self::WireProcessor => Some(Actor::Processor),
            Self::WireConsumer => Some(Actor::Consumer),
            _ => None,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Create => "create",
            Self::DescribeAndCaptureVersion => "describe_and_capture_version",
            Self::EnableConnectivity => "enable_connectivity",
            Self::ResolveEndpoints => "resolve_endpoints",
            Self::WireProducer => "wire_producer",
            Self::WireProcessor => "wire_processor",
            Self::WireConsumer => "wire_consumer",
        })
    }
}

/// The execution status of an action.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionStatus {
    Pending,
    Running,
    Satisfied,
    Failed(String),
}

/// A snapshot of the status of every action.
pub type StatusMap = BTreeMap<ActionKind, ActionStatus>;

/// Deployment settings.
#[derive(Clone, Debug)]
pub struct DeploymentSettings {
    pub spec: Arc<ClusterSpec>,
    pub connectivity: ConnectivityInfo,
    pub policy: BackoffPolicy,
    pub producer_auth_mode: AuthMode,
    pub processor_auth_mode: AuthMode,
    pub consumer_auth_mode: AuthMode,
}

impl DeploymentSettings {
    /// The auth mode the given actor connects with.
    pub fn auth_mode(&self, actor: Actor) -> AuthMode {
        match actor {
            Actor::Producer => self.producer_auth_mode,
            Actor::Processor => self.processor_auth_mode,
            Actor::Consumer => self.consumer_auth_mode,
        }
    }
}

/// Data plane connections of every pipeline actor.
#[derive(Clone)]
pub struct PipelineWiring {
    pub producer: Arc<dyn DataPlane>,
    pub processor: Arc<dyn DataPlane>,
    pub consumer: Arc<dyn DataPlane>,
}

/// The deployment DAG of a pipeline.
pub struct DeploymentGraph {
    graph: DiGraph<ActionKind, ()>,
    /// The topological execution order of the graph.
    order: Vec<NodeIndex>,
    statuses: StatusMap,
    /// The published status snapshot, for observers.
    snapshot: Arc<ArcSwap<StatusMap>>,

    orchestrator: ClusterLifecycleOrchestrator,
    connector: Arc<dyn DataPlaneConnector>,
    settings: DeploymentSettings,
    wired: BTreeMap<Actor, Arc<dyn DataPlane>>,
}

impl DeploymentGraph {
    /// Create a new instance.
    pub fn new(client: Arc<dyn ControlPlaneClient>, connector: Arc<dyn DataPlaneConnector>, settings: DeploymentSettings) -> DeployResult<Self> {
        for actor in [Actor::Producer, Actor::Processor, Actor::Consumer] {
            let mode = settings.auth_mode(actor);
            if !settings.connectivity.auth_modes.contains(&mode) {
                return Err(ConfigError::new(format!("{} auth mode {} is not enabled on the desired connectivity", actor, mode)).into());
            }
        }
        let orchestrator = ClusterLifecycleOrchestrator::new(client, settings.spec.clone(), settings.connectivity.clone(), settings.policy.clone())?;

        let mut graph = DiGraph::new();
        let nodes: BTreeMap<_, _> = ActionKind::ALL.iter().map(|action| (*action, graph.add_node(*action))).collect();
        for action in ActionKind::ALL.iter() {
            for dep in action.depends_on() {
                graph.add_edge(nodes[dep], nodes[action], ());
            }
        }
        let order = toposort(&graph, None).map_err(|cycle| ConfigError::new(format!("deployment graph has a cycle at {}", graph[cycle.node_id()])))?;

        let statuses: StatusMap = ActionKind::ALL.iter().map(|action| (*action, ActionStatus::Pending)).collect();
        Ok(Self {
            graph,
            order,
            snapshot: Arc::new(ArcSwap::from_pointee(statuses.clone())),
            statuses,
            orchestrator,
            connector,
            settings,
            wired: BTreeMap::new(),
        })
    }

    /// Share the given cluster locks with other deployments in this process.
    pub fn with_locks(mut self, locks: ClusterLocks) -> Self {
        self.orchestrator = self.orchestrator.with_locks(locks);
        self
    }

    /// The actions of this graph in execution order.
    pub fn order(&self) -> Vec<ActionKind> {
        self.order.iter().map(|idx| self.graph[*idx]).collect()
    }

    /// The current status of every action.
    pub fn status(&self) -> StatusMap {
        self.statuses.clone()
    }

    /// A handle to the live status snapshot of this graph.
    pub fn status_handle(&self) -> Arc<ArcSwap<StatusMap>> {
        self.snapshot.clone()
    }

    /// The lifecycle state of the deployment's cluster.
    pub fn cluster_state(&self) -> LifecycleState {
        self.orchestrator.state()
    }

    /// Execute every unsatisfied action in order, returning the wiring of the pipeline actors.
    #[tracing::instrument(level = "debug", skip(self), fields(cluster = %self.settings.spec.name))]
    pub async fn apply(&mut self) -> DeployResult<PipelineWiring> {
        if let Err(err) = self.orchestrator.observe().await {
            tracing::error!(error = %err, "error observing cluster before deployment");
            if let Some(action) = self.next_unsatisfied() {
                self.set_status(action, ActionStatus::Failed(err.to_string()));
            }
            return Err(err);
        }
        for idx in self.order.clone() {
            let action = self.graph[idx];
            if self.is_satisfied(action) {
                self.set_status(action, ActionStatus::Satisfied);
                continue;
            }

            tracing::info!(%action, "executing deployment action");
            self.set_status(action, ActionStatus::Running);
            match self.execute(action).await {
                Ok(()) => self.set_status(action, ActionStatus::Satisfied),
                Err(err) => {
                    tracing::error!(%action, error = %err, "deployment action failed");
                    self.set_status(action, ActionStatus::Failed(err.to_string()));
                    return Err(err);
                }
            }
        }

        Ok(PipelineWiring {
            producer: self.wiring(Actor::Producer)?,
            processor: self.wiring(Actor::Processor)?,
            consumer: self.wiring(Actor::Consumer)?,
        })
    }

    /// The first action in execution order which is not yet satisfied.
    fn next_unsatisfied(&self) -> Option<ActionKind> {
        self.order.iter().map(|idx| self.graph[*idx]).find(|action| !self.is_satisfied(*action))
    }

    fn is_satisfied(&self, action: ActionKind) -> bool {
        let state = self.orchestrator.state();
        match action {
            ActionKind::Create => state >= LifecycleState::Created,
            ActionKind::DescribeAndCaptureVersion => state >= LifecycleState::Created && self.orchestrator.captured_version().is_some(),
            ActionKind::EnableConnectivity => state >= LifecycleState::ConnectivityEnabled,
            ActionKind::ResolveEndpoints => state >= LifecycleState::EndpointsResolved,
            ActionKind::WireProducer | ActionKind::WireProcessor | ActionKind::WireConsumer => {
                action.actor().map(|actor| self.wired.contains_key(&actor)).unwrap_or(false)
            }
        }
    }

    async fn execute(&mut self, action: ActionKind) -> DeployResult<()> {
        match action {
            ActionKind::Create => self.orchestrator.ensure_created().await,
            ActionKind::DescribeAndCaptureVersion => self.orchestrator.capture_version().await.map(|_| ()),
            ActionKind::EnableConnectivity => self.orchestrator.enable_connectivity().await,
            ActionKind::ResolveEndpoints => self.orchestrator.resolve_endpoints().await.map(|_| ()),
            ActionKind::WireProducer | ActionKind::WireProcessor | ActionKind::WireConsumer => match action.actor() {
                Some(actor) => self.wire(actor).await,
                None => Ok(()),
            },
        }
    }

    /// Connect an actor to the data plane with the endpoint of its configured auth mode.
    async fn wire(&mut self, actor: Actor) -> DeployResult<()> {
        let mode = self.settings.auth_mode(actor);
        let endpoint = self.orchestrator.endpoints().get(&mode).cloned().ok_or(EndpointError::Unavailable(mode))?;
        let data_plane = self
            .connector
            .connect(&endpoint)
            .await
            .map_err(|source| DeployError::Wiring { actor, source })?;
        tracing::info!(%actor, %endpoint, "pipeline actor wired");
        self.wired.insert(actor, data_plane);
        Ok(())
    }

    fn wiring(&self, actor: Actor) -> DeployResult<Arc<dyn DataPlane>> {
        let mode = self.settings.auth_mode(actor);
        self.wired.get(&actor).cloned().ok_or(DeployError::Endpoint(EndpointError::Unavailable(mode)))
    }

    fn set_status(&mut self, action: ActionKind, status: ActionStatus) {
        self.statuses.insert(action, status);
        self.snapshot.store(Arc::new(self.statuses.clone()));
    }
}
