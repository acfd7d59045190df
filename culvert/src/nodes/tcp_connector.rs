use std::cell::OnceCell;
use std::cell::RefCell;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use culvert_core::address::{AddressStrategy, Host, PortStrategy, Protocol};
use culvert_core::{BufferPool, BufferQueue, Chain, Ctx, Layer, Line, NodeMeta, ShiftBuf};
use tracing::{debug, error, info, trace, warn};

use crate::engine::BuildError;
use crate::nodes::Node;
use crate::sockio::{IoWait, LineIo, ReadOutcome, READ_WRITE_TIMEOUT};

/// Settings of a [`TcpConnector`] node
///
/// Destination address and port each carry their own selection strategy:
/// `from-source` mirrors the line's source context, `constant` always dials
/// the configured value, and `from-destination` trusts whatever an upstream
/// node already recorded (transparent proxying).
#[derive(Debug, Clone)]
pub struct TcpConnectorConfig {
    pub(crate) address: AddressStrategy,
    pub(crate) port: PortStrategy,
    pub(crate) nodelay: bool,
    pub(crate) interface: Option<String>,
    pub(crate) idle_timeout: Duration,
}

impl TcpConnectorConfig {
    /// Dial with explicit strategies
    pub fn new(address: AddressStrategy, port: PortStrategy) -> Self {
        Self {
            address,
            port,
            nodelay: false,
            interface: None,
            idle_timeout: READ_WRITE_TIMEOUT,
        }
    }

    /// Always dial `host:port`; `host` may be numeric or a domain name
    pub fn to_host(host: &str, port: u16) -> Self {
        let host = match host.parse::<IpAddr>() {
            Ok(ip) => Host::Ip(ip),
            Err(_) => Host::Name(host.into()),
        };
        Self::new(
            AddressStrategy::Constant(host),
            PortStrategy::Constant(port),
        )
    }

    /// Set TCP_NODELAY on outbound connections
    pub fn nodelay(&mut self, value: bool) -> &mut Self {
        self.nodelay = value;
        self
    }

    /// Bind outbound sockets to a specific interface
    pub fn interface(&mut self, name: &str) -> &mut Self {
        self.interface = Some(name.into());
        self
    }

    /// Inactivity window on the outbound connection
    pub fn idle_timeout(&mut self, value: Duration) -> &mut Self {
        self.idle_timeout = value;
        self
    }
}

/// Validated, shareable form of a connector spec
pub struct ConnectorBlueprint {
    pub(crate) cfg: Arc<TcpConnectorConfig>,
}

impl ConnectorBlueprint {
    pub(crate) fn new(name: &str, cfg: TcpConnectorConfig) -> Result<Self, BuildError> {
        if let AddressStrategy::Constant(Host::Name(domain)) = &cfg.address {
            if domain.is_empty() {
                return Err(BuildError::InvalidSettings(
                    name.into(),
                    "destination host is empty".into(),
                ));
            }
        }
        Ok(Self { cfg: Arc::new(cfg) })
    }

    pub(crate) fn meta() -> NodeMeta {
        let mut meta = NodeMeta::new("TcpConnector");
        meta.chain_tail = true;
        meta.can_have_next = false;
        meta.layer = Layer::Transport;
        meta
    }

    pub(crate) fn instantiate(&self, pool: Rc<RefCell<BufferPool>>) -> TcpConnector {
        TcpConnector {
            meta: Self::meta(),
            cfg: self.cfg.clone(),
            pool,
            chain: OnceCell::new(),
        }
    }
}

/// Chain-tail node dialing the destination and owning the outbound socket
pub struct TcpConnector {
    pub(crate) meta: NodeMeta,
    cfg: Arc<TcpConnectorConfig>,
    pool: Rc<RefCell<BufferPool>>,
    chain: OnceCell<Weak<Chain<Node>>>,
}

struct ConnectorState {
    /// `None` until the outbound connect completes
    io: Option<Rc<LineIo>>,
    write_paused: bool,
    pause_signaled: bool,
    /// Outbound payload parked while connecting or write-pending
    queue: BufferQueue,
}

impl TcpConnector {
    pub(crate) fn attach(&self, chain: &Rc<Chain<Node>>) {
        let _ = self.chain.set(Rc::downgrade(chain));
    }

    /// Resolve the destination per strategy and start the dial; payloads
    /// queue behind `write_paused` until establish
    pub(crate) fn init_down(&self, ctx: Ctx<'_, Node>, line: &Rc<Line>) {
        let index = ctx.index();
        line.set_state(
            index,
            ConnectorState {
                io: None,
                write_paused: true,
                pause_signaled: false,
                queue: BufferQueue::new(),
            },
        );

        let dest = {
            let mut routing = line.routing_mut();
            let src_host = routing.src.host.clone();
            let src_port = routing.src.port;
            match &self.cfg.address {
                AddressStrategy::FromSource => routing.dest.host = src_host,
                AddressStrategy::Constant(host) => routing.dest.host = Some(host.clone()),
                AddressStrategy::FromDest => {}
            }
            match self.cfg.port {
                PortStrategy::FromSource => routing.dest.port = src_port,
                PortStrategy::Constant(port) => routing.dest.port = port,
                PortStrategy::FromDest => {}
            }
            routing.dest.protocol = Some(Protocol::Tcp);
            routing.dest.clone()
        };

        let Some(host) = dest.host else {
            error!(line = line.id(), "destination address is not set");
            self.fail(ctx, line);
            return;
        };
        let Some(chain) = self.chain.get().and_then(Weak::upgrade) else {
            return;
        };
        Self::spawn_connect_task(
            chain,
            index,
            line.clone(),
            self.pool.clone(),
            self.cfg.clone(),
            host,
            dest.port,
        );
    }

    /// Outbound payload: write through, or park and pause the producer
    pub(crate) fn payload_down(&self, ctx: Ctx<'_, Node>, line: &Rc<Line>, buf: ShiftBuf) {
        let index = ctx.index();
        let mut signal_pause = false;
        let mut failed = false;
        let mut watcher_io = None;
        {
            let Some(mut state) = line.state_mut::<ConnectorState>(index) else {
                self.pool.borrow_mut().reuse(buf);
                return;
            };
            match state.io.clone() {
                Some(io) if !state.write_paused => {
                    match io.write_or_park(buf, &mut state.queue, &mut self.pool.borrow_mut()) {
                        Ok(true) => {}
                        Ok(false) => {
                            state.write_paused = true;
                            watcher_io = Some(io);
                            if !state.pause_signaled {
                                state.pause_signaled = true;
                                signal_pause = true;
                            }
                        }
                        Err(err) => {
                            debug!(line = line.id(), %err, "outbound write failed");
                            failed = true;
                        }
                    }
                }
                // still connecting, or a write is already pending
                _ => {
                    state.queue.push_back(buf);
                    if !state.pause_signaled {
                        state.pause_signaled = true;
                        signal_pause = true;
                    }
                }
            }
        }
        if failed {
            Self::close_from_io(ctx.chain(), index, line, &self.pool);
            return;
        }
        if let Some(io) = watcher_io {
            if let Some(chain) = self.chain.get().and_then(Weak::upgrade) {
                Self::spawn_write_watcher(chain, index, line.clone(), io, self.pool.clone());
            }
        }
        if signal_pause {
            ctx.send_pause_up(line);
        }
    }

    pub(crate) fn pause_down(&self, ctx: Ctx<'_, Node>, line: &Rc<Line>) {
        if let Some(state) = line.state_mut::<ConnectorState>(ctx.index()) {
            if let Some(io) = &state.io {
                io.pause_reads();
            }
        }
    }

    pub(crate) fn resume_down(&self, ctx: Ctx<'_, Node>, line: &Rc<Line>) {
        if let Some(state) = line.state_mut::<ConnectorState>(ctx.index()) {
            if let Some(io) = &state.io {
                io.resume_reads();
            }
        }
    }

    /// The chain is done with this line; release the outbound socket once
    pub(crate) fn finish_down(&self, ctx: Ctx<'_, Node>, line: &Rc<Line>) {
        let Some(mut state) = line.take_state::<ConnectorState>(ctx.index()) else {
            return;
        };
        debug!(line = line.id(), "closing outbound connection");
        if let Some(io) = &state.io {
            io.close();
        }
        state.queue.recycle_into(&mut self.pool.borrow_mut());
    }

    /// Init-time failure: destination unset or unresolvable
    fn fail(&self, ctx: Ctx<'_, Node>, line: &Rc<Line>) {
        if let Some(mut state) = line.take_state::<ConnectorState>(ctx.index()) {
            state.queue.recycle_into(&mut self.pool.borrow_mut());
        }
        ctx.send_finish_up(line);
    }

    /// Same as [`fail`](Self::fail) but reachable from spawned tasks
    fn fail_async(
        chain: &Chain<Node>,
        index: usize,
        line: &Rc<Line>,
        pool: &Rc<RefCell<BufferPool>>,
    ) {
        let _guard = line.guard();
        if let Some(mut state) = line.take_state::<ConnectorState>(index) {
            if let Some(io) = &state.io {
                io.close();
            }
            state.queue.recycle_into(&mut pool.borrow_mut());
        }
        chain.ctx(index).send_finish_up(line);
    }

    /// Teardown initiated by the outbound socket (close, error, idle)
    fn close_from_io(
        chain: &Chain<Node>,
        index: usize,
        line: &Rc<Line>,
        pool: &Rc<RefCell<BufferPool>>,
    ) {
        Self::fail_async(chain, index, line, pool);
    }

    fn spawn_connect_task(
        chain: Rc<Chain<Node>>,
        index: usize,
        line: Rc<Line>,
        pool: Rc<RefCell<BufferPool>>,
        cfg: Arc<TcpConnectorConfig>,
        host: Host,
        port: u16,
    ) {
        tokio::task::spawn_local(async move {
            let target = match host {
                Host::Ip(ip) => SocketAddr::new(ip, port),
                Host::Name(name) => {
                    // suspension point, not a blocking call: payloads queue
                    // behind write_paused while the lookup runs
                    match tokio::net::lookup_host((name.as_str(), port)).await {
                        Ok(mut addrs) => match addrs.next() {
                            Some(addr) => {
                                info!(line = line.id(), domain = %name, ip = %addr.ip(), "resolved destination");
                                if !line.is_alive() {
                                    return;
                                }
                                line.routing_mut().dest.set_ip(addr.ip());
                                addr
                            }
                            None => {
                                warn!(line = line.id(), domain = %name, "resolve returned no addresses");
                                Self::fail_async(&chain, index, &line, &pool);
                                return;
                            }
                        },
                        Err(err) => {
                            warn!(line = line.id(), domain = %name, %err, "resolve failed");
                            Self::fail_async(&chain, index, &line, &pool);
                            return;
                        }
                    }
                }
            };
            if !line.is_alive() {
                return;
            }
            let socket = match build_socket(&cfg, target) {
                Ok(socket) => socket,
                Err(err) => {
                    error!(line = line.id(), %err, "could not create outbound socket");
                    Self::fail_async(&chain, index, &line, &pool);
                    return;
                }
            };
            match socket.connect(target).await {
                Ok(stream) => {
                    debug!(line = line.id(), peer = %target, "outbound connected");
                    Self::on_connected(&chain, index, &line, &pool, &cfg, stream);
                }
                Err(err) => {
                    debug!(line = line.id(), peer = %target, %err, "connect failed");
                    Self::fail_async(&chain, index, &line, &pool);
                }
            }
        });
    }

    /// Connect completion: establish upstream, flush everything parked
    /// while dialing, then start reading the peer
    fn on_connected(
        chain: &Rc<Chain<Node>>,
        index: usize,
        line: &Rc<Line>,
        pool: &Rc<RefCell<BufferPool>>,
        cfg: &TcpConnectorConfig,
        stream: tokio::net::TcpStream,
    ) {
        let io = LineIo::new(stream, cfg.idle_timeout);
        let _guard = line.guard();
        {
            let Some(mut state) = line.state_mut::<ConnectorState>(index) else {
                // the line finished while we were dialing
                return;
            };
            state.io = Some(io.clone());
        }
        chain.ctx(index).send_establish_up(line);
        if !line.is_alive() {
            return;
        }

        let mut failed = false;
        let mut drained = false;
        let mut resume = false;
        {
            let Some(mut state) = line.state_mut::<ConnectorState>(index) else {
                return;
            };
            match io.flush_queue(&mut state.queue, &mut pool.borrow_mut()) {
                Ok(true) => {
                    state.write_paused = false;
                    drained = true;
                    if state.pause_signaled {
                        state.pause_signaled = false;
                        resume = true;
                    }
                }
                Ok(false) => {
                    // stay write-paused behind the leftover queue
                }
                Err(err) => {
                    debug!(line = line.id(), %err, "outbound write failed");
                    failed = true;
                }
            }
        }
        if failed {
            Self::close_from_io(chain, index, line, pool);
            return;
        }
        if resume {
            chain.ctx(index).send_resume_up(line);
        }
        if !line.is_alive() {
            return;
        }
        if !drained {
            Self::spawn_write_watcher(chain.clone(), index, line.clone(), io.clone(), pool.clone());
        }
        Self::spawn_read_task(chain.clone(), index, line.clone(), io, pool.clone());
    }

    fn spawn_read_task(
        chain: Rc<Chain<Node>>,
        index: usize,
        line: Rc<Line>,
        io: Rc<LineIo>,
        pool: Rc<RefCell<BufferPool>>,
    ) {
        tokio::task::spawn_local(async move {
            loop {
                if io.is_closed() || !line.is_alive() {
                    return;
                }
                if io.reads_paused() {
                    match io.wait_read_wake().await {
                        IoWait::IdleExpired => {
                            debug!(line = line.id(), "idle timeout");
                            Self::close_from_io(&chain, index, &line, &pool);
                            return;
                        }
                        _ => continue,
                    }
                }
                match io.wait_readable().await {
                    IoWait::Woken => continue,
                    IoWait::Ready => {}
                    IoWait::IdleExpired => {
                        debug!(line = line.id(), "idle timeout");
                        Self::close_from_io(&chain, index, &line, &pool);
                        return;
                    }
                    IoWait::Failed(err) => {
                        debug!(line = line.id(), %err, "outbound socket error");
                        Self::close_from_io(&chain, index, &line, &pool);
                        return;
                    }
                }
                let mut buf = pool.borrow_mut().get_large();
                match io.try_read_into(&mut buf) {
                    Ok(ReadOutcome::Retry) => pool.borrow_mut().reuse(buf),
                    Ok(ReadOutcome::Eof) => {
                        pool.borrow_mut().reuse(buf);
                        debug!(line = line.id(), "peer closed");
                        Self::close_from_io(&chain, index, &line, &pool);
                        return;
                    }
                    Ok(ReadOutcome::Data(n)) => {
                        trace!(line = line.id(), bytes = n, "peer payload");
                        let _guard = line.guard();
                        chain.ctx(index).send_payload_up(&line, buf);
                    }
                    Err(err) => {
                        pool.borrow_mut().reuse(buf);
                        debug!(line = line.id(), %err, "outbound read failed");
                        Self::close_from_io(&chain, index, &line, &pool);
                        return;
                    }
                }
            }
        });
    }

    /// Runs while an outbound write is pending; drains the queue and resumes
    /// the producer exactly once when it empties
    fn spawn_write_watcher(
        chain: Rc<Chain<Node>>,
        index: usize,
        line: Rc<Line>,
        io: Rc<LineIo>,
        pool: Rc<RefCell<BufferPool>>,
    ) {
        tokio::task::spawn_local(async move {
            loop {
                if io.is_closed() || !line.is_alive() {
                    return;
                }
                match io.wait_writable().await {
                    IoWait::Woken => continue,
                    IoWait::Ready => {}
                    IoWait::IdleExpired => {
                        debug!(line = line.id(), "write-pending idle timeout");
                        Self::close_from_io(&chain, index, &line, &pool);
                        return;
                    }
                    IoWait::Failed(err) => {
                        debug!(line = line.id(), %err, "outbound socket error");
                        Self::close_from_io(&chain, index, &line, &pool);
                        return;
                    }
                }
                let _guard = line.guard();
                let mut drained = false;
                {
                    let Some(mut state) = line.state_mut::<ConnectorState>(index) else {
                        return;
                    };
                    match io.flush_queue(&mut state.queue, &mut pool.borrow_mut()) {
                        Ok(true) => {
                            state.write_paused = false;
                            drained = true;
                        }
                        Ok(false) => {}
                        Err(err) => {
                            drop(state);
                            debug!(line = line.id(), %err, "outbound write failed");
                            Self::close_from_io(&chain, index, &line, &pool);
                            return;
                        }
                    }
                }
                if drained {
                    let resume = match line.state_mut::<ConnectorState>(index) {
                        Some(mut state) => {
                            let resume = state.pause_signaled;
                            state.pause_signaled = false;
                            resume
                        }
                        None => return,
                    };
                    if resume {
                        chain.ctx(index).send_resume_up(&line);
                    }
                    return;
                }
            }
        });
    }
}

/// Create and configure the outbound socket before the async connect
fn build_socket(cfg: &TcpConnectorConfig, target: SocketAddr) -> io::Result<tokio::net::TcpSocket> {
    let domain = if target.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;
    if cfg.nodelay {
        socket.set_nodelay(true)?;
    }
    #[cfg(target_os = "linux")]
    if let Some(interface) = &cfg.interface {
        socket.bind_device(Some(interface.as_bytes()))?;
    }
    #[cfg(not(target_os = "linux"))]
    if cfg.interface.is_some() {
        warn!("outbound interface binding is only supported on linux");
    }
    socket.set_nonblocking(true)?;
    Ok(tokio::net::TcpSocket::from_std_stream(socket.into()))
}
