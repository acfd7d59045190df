use std::cell::Cell;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::rc::Rc;
use std::thread::JoinHandle;

use culvert_core::address::{IpMask, Protocol};
use rustc_hash::FxHashMap;
use slab::Slab;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::worker::{Event, WorkerHandle};

/// What a listener node registers with the socket acceptor
///
/// The acceptor owns the actual accept loops; the node only describes what
/// to listen for and receives accepted connections through the engine's
/// dispatch.
#[derive(Debug, Clone)]
pub struct FilterOptions {
    /// Listen address (numeric)
    pub host: String,
    /// First port of the range
    pub port_min: u16,
    /// Last port of the range; zero means a single port
    pub port_max: u16,
    /// Transport protocol
    pub protocol: Protocol,
    /// Set TCP_NODELAY on accepted connections
    pub nodelay: bool,
    /// Accept only peers matching one of these prefixes; empty accepts all
    pub whitelist: Vec<IpMask>,
    /// Bind the listening sockets to this interface
    pub interface: Option<String>,
    /// Rotate accepted connections among listeners sharing this group
    pub balance_group: Option<String>,
    /// Accepts per rotation step
    pub balance_interval: u32,
    /// How a port range maps onto sockets
    pub multiport_backend: MultiportBackend,
}

/// How a listener realizes a port range
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MultiportBackend {
    /// One plainly bound socket per port
    Default,
    /// A single socket; external NAT rules redirect the range onto it, and
    /// the port the client dialed is recovered from the accepted socket
    Iptables,
    /// One SO_REUSEPORT socket per port
    Socket,
}

pub(crate) struct Registration {
    pub(crate) filter: FilterOptions,
    pub(crate) chain: usize,
    pub(crate) node: usize,
}

struct AcceptEntry {
    reg: usize,
    listener: std::net::TcpListener,
}

/// Rotates accepted connections among the chains of a balance group
struct BalanceGroup {
    targets: Vec<(usize, usize)>,
    interval: u32,
    count: Cell<u32>,
}

impl BalanceGroup {
    fn next_target(&self) -> (usize, usize) {
        let count = self.count.get();
        self.count.set(count.wrapping_add(1));
        let step = count / self.interval.max(1);
        self.targets[step as usize % self.targets.len()]
    }
}

struct AcceptState {
    registrations: Vec<Registration>,
    workers: Vec<WorkerHandle>,
    groups: FxHashMap<String, BalanceGroup>,
    next_worker: Cell<usize>,
}

impl AcceptState {
    fn dispatch(&self, reg_index: usize, stream: tokio::net::TcpStream, peer: SocketAddr) {
        let reg = &self.registrations[reg_index];
        let filter = &reg.filter;
        if !filter.whitelist.is_empty()
            && !filter.whitelist.iter().any(|mask| mask.contains(peer.ip()))
        {
            debug!(%peer, "connection rejected by whitelist");
            return;
        }
        if filter.nodelay {
            let _ = stream.set_nodelay(true);
        }
        let local_port = stream
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(filter.port_min);
        let (chain, node) = match filter
            .balance_group
            .as_ref()
            .and_then(|name| self.groups.get(name))
        {
            Some(group) => group.next_target(),
            None => (reg.chain, reg.node),
        };
        // deregister from the acceptor's reactor; the target worker adopts
        // the socket into its own
        let io = match stream.into_std() {
            Ok(io) => io,
            Err(err) => {
                warn!(%peer, %err, "failed to detach accepted socket");
                return;
            }
        };
        let wid = self.next_worker.get();
        self.next_worker.set((wid + 1) % self.workers.len());
        debug!(%peer, worker = wid, "dispatching inbound connection");
        if self.workers[wid]
            .post(Event::Inbound {
                chain,
                node,
                io,
                peer,
                local_port,
            })
            .is_err()
        {
            warn!(%peer, "worker unavailable, dropping inbound connection");
        }
    }
}

/// The engine's accept thread: binds every registered filter and feeds
/// accepted connections to the workers
pub(crate) struct Acceptor {
    join: Option<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    local_addrs: Vec<SocketAddr>,
}

impl Acceptor {
    /// Bind every registration (fatal on error, before any traffic) and
    /// start the accept loops on a dedicated thread
    pub(crate) fn start(
        registrations: Vec<Registration>,
        workers: Vec<WorkerHandle>,
    ) -> io::Result<Self> {
        let mut entries: Slab<AcceptEntry> = Slab::new();
        let mut local_addrs = Vec::new();
        for (reg_index, reg) in registrations.iter().enumerate() {
            let ip: IpAddr = reg.filter.host.parse().map_err(|_| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("listen address `{}` is not a numeric address", reg.filter.host),
                )
            })?;
            let ports: Vec<u16> =
                if reg.filter.port_max == 0 || reg.filter.port_max == reg.filter.port_min {
                    vec![reg.filter.port_min]
                } else {
                    match reg.filter.multiport_backend {
                        MultiportBackend::Iptables => vec![reg.filter.port_min],
                        _ => (reg.filter.port_min..=reg.filter.port_max).collect(),
                    }
                };
            for port in ports {
                let listener = bind_listener(ip, port, &reg.filter)?;
                local_addrs.push(listener.local_addr()?);
                entries.insert(AcceptEntry {
                    reg: reg_index,
                    listener,
                });
            }
        }

        let mut groups: FxHashMap<String, BalanceGroup> = FxHashMap::default();
        for reg in &registrations {
            if let Some(name) = &reg.filter.balance_group {
                let group = groups.entry(name.clone()).or_insert_with(|| BalanceGroup {
                    targets: Vec::new(),
                    interval: reg.filter.balance_interval,
                    count: Cell::new(0),
                });
                group.targets.push((reg.chain, reg.node));
            }
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let state = AcceptState {
            registrations,
            workers,
            groups,
            next_worker: Cell::new(0),
        };
        let join = std::thread::Builder::new()
            .name("culvert-acceptor".into())
            .spawn(move || run_acceptor(entries, state, shutdown_rx))
            .expect("failed to spawn acceptor thread");

        Ok(Self {
            join: Some(join),
            shutdown,
            local_addrs,
        })
    }

    /// Addresses actually bound, in registration order; useful when a
    /// filter asked for port 0
    pub(crate) fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Stop accepting and join the thread
    pub(crate) fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn bind_listener(
    ip: IpAddr,
    port: u16,
    filter: &FilterOptions,
) -> io::Result<std::net::TcpListener> {
    let domain = if ip.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    if filter.multiport_backend == MultiportBackend::Socket {
        socket.set_reuse_port(true)?;
    }
    #[cfg(target_os = "linux")]
    if let Some(interface) = &filter.interface {
        socket.bind_device(Some(interface.as_bytes()))?;
    }
    socket.bind(&SocketAddr::new(ip, port).into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn run_acceptor(entries: Slab<AcceptEntry>, state: AcceptState, shutdown: watch::Receiver<bool>) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build acceptor runtime");
    let local = tokio::task::LocalSet::new();
    let state = Rc::new(state);

    local.block_on(&runtime, async move {
        for (_, entry) in entries {
            tokio::task::spawn_local(accept_loop(entry, state.clone(), shutdown.clone()));
        }
        let mut shutdown = shutdown;
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
    });
    debug!("acceptor stopped");
}

async fn accept_loop(
    entry: AcceptEntry,
    state: Rc<AcceptState>,
    mut shutdown: watch::Receiver<bool>,
) {
    let listener = match tokio::net::TcpListener::from_std(entry.listener) {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, "failed to adopt listening socket");
            return;
        }
    };
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => state.dispatch(entry.reg, stream, peer),
                Err(err) => warn!(%err, "accept failed"),
            }
        }
    }
}
