use std::cell::RefCell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use culvert_core::{
    validate_chain, BufferConfig, BufferPool, Chain, ChainError, MasterPool, NodeMeta, ShiftBuf,
};
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;
use tracing::{debug, info};

use crate::acceptor::{Acceptor, FilterOptions, Registration};
use crate::nodes::{
    BridgeBlueprint, BridgeConfig, ConnectorBlueprint, ListenerBlueprint, Node, TcpConnectorConfig,
    TcpListenerConfig,
};
use crate::tun::{TunDevice, TunError, TunReadCallback};
use crate::worker::{Event, WorkerCtx, WorkerHandle, Workers};

/// A node of the configured graph, as handed over by the config layer
///
/// `next` links nodes into chains; a node nothing links to is a chain head.
/// Parsing config files into specs is a collaborator's job — the engine only
/// consumes the typed result.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    /// Unique node name within the graph
    pub name: String,
    /// Registered type name, e.g. `"TcpListener"`
    pub kind: String,
    /// Name of the node below this one in the chain
    pub next: Option<String>,
    /// Type-specific settings
    pub settings: NodeSettings,
}

impl NodeSpec {
    /// Describe a node
    pub fn new(name: &str, kind: &str, settings: NodeSettings) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            next: None,
            settings,
        }
    }

    /// Link this node to the one below it
    pub fn with_next(mut self, next: &str) -> Self {
        self.next = Some(next.into());
        self
    }
}

/// Typed settings for each node kind
#[derive(Debug, Clone)]
#[allow(missing_docs)]
pub enum NodeSettings {
    TcpListener(TcpListenerConfig),
    TcpConnector(TcpConnectorConfig),
    Bridge(BridgeConfig),
}

/// A validated node spec, shareable across worker instantiations
pub struct Blueprint(BlueprintKind);

enum BlueprintKind {
    Listener(ListenerBlueprint),
    Connector(ConnectorBlueprint),
    Bridge(BridgeBlueprint),
}

impl Blueprint {
    /// Validate listener settings
    pub fn tcp_listener(name: &str, cfg: TcpListenerConfig) -> Result<Self, BuildError> {
        Ok(Self(BlueprintKind::Listener(ListenerBlueprint::new(
            name, cfg,
        )?)))
    }

    /// Validate connector settings
    pub fn tcp_connector(name: &str, cfg: TcpConnectorConfig) -> Result<Self, BuildError> {
        Ok(Self(BlueprintKind::Connector(ConnectorBlueprint::new(
            name, cfg,
        )?)))
    }

    /// Validate bridge settings
    pub fn bridge(name: &str, cfg: BridgeConfig) -> Result<Self, BuildError> {
        Ok(Self(BlueprintKind::Bridge(BridgeBlueprint::new(name, cfg)?)))
    }

    fn meta(&self) -> NodeMeta {
        match &self.0 {
            BlueprintKind::Listener(_) => ListenerBlueprint::meta(),
            BlueprintKind::Connector(_) => ConnectorBlueprint::meta(),
            BlueprintKind::Bridge(_) => BridgeBlueprint::meta(),
        }
    }

    fn filter(&self) -> Option<FilterOptions> {
        match &self.0 {
            BlueprintKind::Listener(bp) => Some(bp.filter()),
            _ => None,
        }
    }

    fn bridge_pair(&self) -> Option<&str> {
        match &self.0 {
            BlueprintKind::Bridge(bp) => Some(bp.pair()),
            _ => None,
        }
    }

    fn instantiate(&self, pool: Rc<RefCell<BufferPool>>) -> Node {
        match &self.0 {
            BlueprintKind::Listener(bp) => Node::TcpListener(bp.instantiate(pool)),
            BlueprintKind::Connector(bp) => Node::TcpConnector(bp.instantiate(pool)),
            BlueprintKind::Bridge(bp) => Node::Bridge(bp.instantiate()),
        }
    }
}

/// Produces a [`Blueprint`] from a spec; registered per node type name
pub type NodeFactory = fn(&NodeSpec) -> Result<Blueprint, BuildError>;

/// Maps node type names to their factories
///
/// An explicit object handed to [`Engine::start`]; there is no ambient
/// global registry.
#[derive(Default)]
pub struct NodeRegistry {
    factories: FxHashMap<String, NodeFactory>,
}

impl NodeRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in catalog: `TcpListener`, `TcpConnector`, `Bridge`
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("TcpListener", |spec| match &spec.settings {
            NodeSettings::TcpListener(cfg) => Blueprint::tcp_listener(&spec.name, cfg.clone()),
            _ => Err(BuildError::SettingsMismatch(spec.name.clone())),
        });
        registry.register("TcpConnector", |spec| match &spec.settings {
            NodeSettings::TcpConnector(cfg) => Blueprint::tcp_connector(&spec.name, cfg.clone()),
            _ => Err(BuildError::SettingsMismatch(spec.name.clone())),
        });
        registry.register("Bridge", |spec| match &spec.settings {
            NodeSettings::Bridge(cfg) => Blueprint::bridge(&spec.name, cfg.clone()),
            _ => Err(BuildError::SettingsMismatch(spec.name.clone())),
        });
        registry
    }

    /// Register a factory under a type name
    pub fn register(&mut self, type_name: &str, factory: NodeFactory) {
        self.factories.insert(type_name.into(), factory);
    }

    fn build(&self, spec: &NodeSpec) -> Result<Blueprint, BuildError> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| BuildError::UnknownNodeType(spec.kind.clone()))?;
        factory(spec)
    }
}

/// Engine construction settings
pub struct EngineConfig {
    specs: Vec<NodeSpec>,
    workers: usize,
    buffers: BufferConfig,
}

impl EngineConfig {
    /// Configure an engine around a node graph
    pub fn new(specs: Vec<NodeSpec>) -> Self {
        Self {
            specs,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            buffers: BufferConfig::default(),
        }
    }

    /// Number of worker threads; defaults to the available parallelism
    pub fn workers(&mut self, count: usize) -> &mut Self {
        self.workers = count.max(1);
        self
    }

    /// Buffer pool sizing
    pub fn buffers_mut(&mut self) -> &mut BufferConfig {
        &mut self.buffers
    }
}

/// The graph could not be brought up
///
/// All of these are fatal-at-startup: a binary logs the error and exits
/// nonzero, nothing is partially started.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The spec names a type no factory is registered for
    #[error("unknown node type `{0}`")]
    UnknownNodeType(String),
    /// Settings enum variant does not match the node's type
    #[error("node `{0}`: settings do not match its type")]
    SettingsMismatch(String),
    /// Type-specific validation failed
    #[error("node `{0}`: {1}")]
    InvalidSettings(String, String),
    /// Two specs share a name
    #[error("node name `{0}` is used more than once")]
    DuplicateName(String),
    /// `next` names a node that does not exist
    #[error("node `{0}` links to unknown node `{1}`")]
    UnknownNext(String, String),
    /// Two chains link to the same node
    #[error("node `{0}` is referenced by more than one chain")]
    NodeReused(String),
    /// Following `next` links revisits a node
    #[error("node graph contains a cycle through `{0}`")]
    GraphCycle(String),
    /// A bridge pair is missing its other half
    #[error("bridge pair `{0}` is missing its other half")]
    UnpairedBridge(String),
    /// The spec list is empty
    #[error("no chains configured")]
    NoChains,
    /// A chain violates composition rules
    #[error("chain starting at `{0}`: {1}")]
    InvalidChain(String, ChainError),
    /// Socket setup failed
    #[error(transparent)]
    Io(#[from] io::Error),
}

struct ChainPlan {
    head_name: String,
    blueprints: Vec<Arc<Blueprint>>,
}

/// The running engine: workers, acceptor, shared buffer pools
///
/// Dropping the engine shuts it down; [`shutdown`](Engine::shutdown) does so
/// explicitly and [`wait`](Engine::wait) parks the caller for a server-style
/// main.
pub struct Engine {
    workers: Option<Workers>,
    acceptor: Option<Acceptor>,
    handles: Vec<WorkerHandle>,
    masters: (Arc<MasterPool<ShiftBuf>>, Arc<MasterPool<ShiftBuf>>),
    buffers: BufferConfig,
}

impl Engine {
    /// Assemble the chains, spawn the workers, and start accepting
    pub fn start(mut config: EngineConfig, registry: &NodeRegistry) -> Result<Self, BuildError> {
        let plans = assemble(&config.specs, registry)?;

        // buffers must reserve the largest header run any chain prepends
        let padding = plans
            .iter()
            .map(|plan| {
                plan.blueprints
                    .iter()
                    .map(|bp| bp.meta().required_left_padding)
                    .sum::<usize>()
            })
            .max()
            .unwrap_or(0);
        config.buffers.left_padding(padding);

        for plan in &plans {
            let metas: Vec<NodeMeta> = plan.blueprints.iter().map(|bp| bp.meta()).collect();
            validate_chain(&metas)
                .map_err(|err| BuildError::InvalidChain(plan.head_name.clone(), err))?;
            info!(
                chain = %plan.head_name,
                nodes = plan.blueprints.len(),
                "chain assembled"
            );
        }

        let masters = config.buffers.build_masters();
        let plans = Arc::new(plans);
        let factory_plans = plans.clone();
        let workers = Workers::spawn(
            config.workers,
            masters.clone(),
            config.buffers.clone(),
            Arc::new(move |ctx: &WorkerCtx| {
                factory_plans
                    .iter()
                    .map(|plan| {
                        let nodes: Vec<Node> = plan
                            .blueprints
                            .iter()
                            .map(|bp| bp.instantiate(ctx.buffer_pool().clone()))
                            .collect();
                        let chain = Rc::new(
                            Chain::new(nodes).expect("chain plans are validated at startup"),
                        );
                        for node in chain.nodes() {
                            node.attach(&chain);
                        }
                        chain
                    })
                    .collect()
            }),
        );
        let handles = workers.handles().to_vec();

        let mut registrations = Vec::new();
        for (chain_index, plan) in plans.iter().enumerate() {
            for (node_index, bp) in plan.blueprints.iter().enumerate() {
                if let Some(filter) = bp.filter() {
                    registrations.push(Registration {
                        filter,
                        chain: chain_index,
                        node: node_index,
                    });
                }
            }
        }
        let acceptor = if registrations.is_empty() {
            None
        } else {
            Some(Acceptor::start(registrations, handles.clone())?)
        };

        debug!(workers = config.workers, chains = plans.len(), "engine started");
        Ok(Self {
            workers: Some(workers),
            acceptor,
            handles,
            masters,
            buffers: config.buffers,
        })
    }

    /// Number of worker threads
    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Addresses the acceptor actually bound, in registration order
    pub fn local_addrs(&self) -> &[SocketAddr] {
        self.acceptor
            .as_ref()
            .map(|a| a.local_addrs())
            .unwrap_or(&[])
    }

    /// Run a closure on a worker thread and return its result
    ///
    /// Returns `None` if the worker is gone or shutting down.
    pub fn with_worker<R, F>(&self, worker: usize, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce(&WorkerCtx) -> R + Send + 'static,
    {
        let handle = self.handles.get(worker)?;
        let (tx, rx) = std::sync::mpsc::channel();
        handle
            .post(Event::Run(Box::new(move |ctx| {
                let _ = tx.send(f(ctx));
            })))
            .ok()?;
        rx.recv().ok()
    }

    /// Create a TUN device wired to this engine's workers and buffer pools
    ///
    /// The device starts down; call [`TunDevice::bring_up`].
    pub fn create_tun(
        &self,
        name: &str,
        offload: bool,
        callback: TunReadCallback,
    ) -> Result<Arc<TunDevice>, TunError> {
        TunDevice::create(
            name,
            offload,
            self.handles.clone(),
            self.masters.clone(),
            self.buffers.clone(),
            callback,
        )
    }

    /// Stop accepting, stop the workers, and join every thread
    pub fn shutdown(mut self) {
        self.shutdown_impl();
    }

    /// Park until the engine is torn down externally
    pub fn wait(mut self) {
        // keep accepting; join only returns once the workers exit
        let _acceptor = self.acceptor.take();
        if let Some(workers) = self.workers.take() {
            workers.join();
        }
    }

    fn shutdown_impl(&mut self) {
        if let Some(acceptor) = self.acceptor.take() {
            acceptor.stop();
        }
        if let Some(workers) = self.workers.take() {
            workers.shutdown();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown_impl();
    }
}

/// Resolve specs to blueprints, follow `next` links into chains, and fuse
/// bridge pairs
fn assemble(specs: &[NodeSpec], registry: &NodeRegistry) -> Result<Vec<ChainPlan>, BuildError> {
    if specs.is_empty() {
        return Err(BuildError::NoChains);
    }
    let mut by_name: FxHashMap<&str, usize> = FxHashMap::default();
    for (index, spec) in specs.iter().enumerate() {
        if by_name.insert(spec.name.as_str(), index).is_some() {
            return Err(BuildError::DuplicateName(spec.name.clone()));
        }
    }

    let blueprints: Vec<Arc<Blueprint>> = specs
        .iter()
        .map(|spec| registry.build(spec).map(Arc::new))
        .collect::<Result<_, _>>()?;

    let mut referenced: FxHashSet<usize> = FxHashSet::default();
    for spec in specs {
        if let Some(next) = &spec.next {
            let target = *by_name
                .get(next.as_str())
                .ok_or_else(|| BuildError::UnknownNext(spec.name.clone(), next.clone()))?;
            if !referenced.insert(target) {
                return Err(BuildError::NodeReused(next.clone()));
            }
        }
    }

    let mut chains: Vec<Vec<usize>> = Vec::new();
    let mut visited: FxHashSet<usize> = FxHashSet::default();
    for head in 0..specs.len() {
        if referenced.contains(&head) {
            continue;
        }
        let mut members = Vec::new();
        let mut cursor = Some(head);
        while let Some(index) = cursor {
            if !visited.insert(index) {
                return Err(BuildError::GraphCycle(specs[index].name.clone()));
            }
            members.push(index);
            cursor = specs[index]
                .next
                .as_ref()
                .map(|next| by_name[next.as_str()]);
        }
        chains.push(members);
    }
    if visited.len() != specs.len() {
        let stray = (0..specs.len())
            .find(|index| !visited.contains(index))
            .unwrap();
        return Err(BuildError::GraphCycle(specs[stray].name.clone()));
    }

    fuse_bridges(&mut chains, &blueprints)?;

    Ok(chains
        .into_iter()
        .map(|members| ChainPlan {
            head_name: specs[members[0]].name.clone(),
            blueprints: members
                .into_iter()
                .map(|index| blueprints[index].clone())
                .collect(),
        })
        .collect())
}

/// Splice `[…, bridge(p)]` + `[bridge(p), …]` into one chain, keeping a
/// single bridge node at the seam
fn fuse_bridges(
    chains: &mut Vec<Vec<usize>>,
    blueprints: &[Arc<Blueprint>],
) -> Result<(), BuildError> {
    loop {
        let mut fused = false;
        'outer: for left in 0..chains.len() {
            let Some(pair) = chains[left]
                .last()
                .and_then(|&index| blueprints[index].bridge_pair())
            else {
                continue;
            };
            for right in 0..chains.len() {
                if right == left {
                    continue;
                }
                let starts_with_pair = chains[right]
                    .first()
                    .is_some_and(|&index| blueprints[index].bridge_pair() == Some(pair));
                if starts_with_pair {
                    let tail: Vec<usize> = chains[right].drain(1..).collect();
                    chains.remove(right);
                    let left = if right < left { left - 1 } else { left };
                    chains[left].extend(tail);
                    fused = true;
                    break 'outer;
                }
            }
        }
        if !fused {
            break;
        }
    }
    // whatever still dangles at an end never found its other half
    for members in chains.iter() {
        if let Some(pair) = chains_end_pair(members, blueprints) {
            return Err(BuildError::UnpairedBridge(pair.into()));
        }
    }
    Ok(())
}

fn chains_end_pair<'a>(members: &[usize], blueprints: &'a [Arc<Blueprint>]) -> Option<&'a str> {
    let head = members.first().and_then(|&i| blueprints[i].bridge_pair());
    let tail = members.last().and_then(|&i| blueprints[i].bridge_pair());
    head.or(tail)
}
