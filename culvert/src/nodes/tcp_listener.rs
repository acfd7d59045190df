use std::cell::OnceCell;
use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

use culvert_core::address::{IpMask, Protocol};
use culvert_core::{BufferPool, BufferQueue, Chain, Ctx, Layer, Line, NodeMeta, ShiftBuf};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::acceptor::{FilterOptions, MultiportBackend};
use crate::engine::BuildError;
use crate::nodes::Node;
use crate::sockio::{IoWait, LineIo, ReadOutcome, ESTABLISHED_IDLE_TIMEOUT, KEEPALIVE_TIMEOUT};
use crate::worker::WorkerCtx;

/// Settings of a [`TcpListener`] node
///
/// These correspond to the generic listener settings a config layer feeds in:
/// `address`, `port` (single or `[min, max]` range), `nodelay`, `interface`,
/// `whitelist`, `balance-group`/`balance-interval`, `multiport-backend`.
#[derive(Debug, Clone)]
pub struct TcpListenerConfig {
    pub(crate) address: String,
    pub(crate) port_min: u16,
    pub(crate) port_max: u16,
    pub(crate) nodelay: bool,
    pub(crate) interface: Option<String>,
    pub(crate) whitelist: Vec<IpMask>,
    pub(crate) balance_group: Option<String>,
    pub(crate) balance_interval: u32,
    pub(crate) multiport_backend: MultiportBackend,
    pub(crate) idle_timeout: Duration,
    pub(crate) established_idle_timeout: Duration,
}

impl TcpListenerConfig {
    /// Listen on a single port
    pub fn new(address: &str, port: u16) -> Self {
        Self {
            address: address.into(),
            port_min: port,
            port_max: 0,
            nodelay: false,
            interface: None,
            whitelist: Vec::new(),
            balance_group: None,
            balance_interval: 0,
            multiport_backend: MultiportBackend::Default,
            idle_timeout: KEEPALIVE_TIMEOUT,
            established_idle_timeout: ESTABLISHED_IDLE_TIMEOUT,
        }
    }

    /// Listen on an inclusive port range
    pub fn port_range(&mut self, min: u16, max: u16) -> &mut Self {
        self.port_min = min;
        self.port_max = max;
        self
    }

    /// Set TCP_NODELAY on accepted connections
    pub fn nodelay(&mut self, value: bool) -> &mut Self {
        self.nodelay = value;
        self
    }

    /// Bind the listening sockets to a specific interface
    pub fn interface(&mut self, name: &str) -> &mut Self {
        self.interface = Some(name.into());
        self
    }

    /// Only accept peers matching one of these prefixes
    pub fn whitelist(&mut self, masks: Vec<IpMask>) -> &mut Self {
        self.whitelist = masks;
        self
    }

    /// Share accepted connections with other listeners in `group`, rotating
    /// every `interval` accepts
    pub fn balance_group(&mut self, group: &str, interval: u32) -> &mut Self {
        self.balance_group = Some(group.into());
        self.balance_interval = interval;
        self
    }

    /// How a port range is realized on the socket layer
    pub fn multiport_backend(&mut self, backend: MultiportBackend) -> &mut Self {
        self.multiport_backend = backend;
        self
    }

    /// Inactivity window before the chain reports established
    pub fn idle_timeout(&mut self, value: Duration) -> &mut Self {
        self.idle_timeout = value;
        self
    }

    /// Inactivity window once established
    pub fn established_idle_timeout(&mut self, value: Duration) -> &mut Self {
        self.established_idle_timeout = value;
        self
    }
}

/// Validated, shareable form of a listener spec
pub struct ListenerBlueprint {
    pub(crate) cfg: Arc<TcpListenerConfig>,
}

impl ListenerBlueprint {
    pub(crate) fn new(name: &str, cfg: TcpListenerConfig) -> Result<Self, BuildError> {
        if cfg.address.is_empty() {
            return Err(BuildError::InvalidSettings(
                name.into(),
                "listen address is empty".into(),
            ));
        }
        if cfg.port_max != 0 && cfg.port_max < cfg.port_min {
            return Err(BuildError::InvalidSettings(
                name.into(),
                "port range is inverted".into(),
            ));
        }
        Ok(Self { cfg: Arc::new(cfg) })
    }

    pub(crate) fn meta() -> NodeMeta {
        let mut meta = NodeMeta::new("TcpListener");
        meta.chain_head = true;
        meta.layer = Layer::Transport;
        meta
    }

    /// The registration this listener hands to the socket acceptor
    pub(crate) fn filter(&self) -> FilterOptions {
        FilterOptions {
            host: self.cfg.address.clone(),
            port_min: self.cfg.port_min,
            port_max: self.cfg.port_max,
            protocol: Protocol::Tcp,
            nodelay: self.cfg.nodelay,
            whitelist: self.cfg.whitelist.clone(),
            interface: self.cfg.interface.clone(),
            balance_group: self.cfg.balance_group.clone(),
            balance_interval: self.cfg.balance_interval,
            multiport_backend: self.cfg.multiport_backend,
        }
    }

    pub(crate) fn instantiate(&self, pool: Rc<RefCell<BufferPool>>) -> TcpListener {
        TcpListener {
            meta: Self::meta(),
            cfg: self.cfg.clone(),
            pool,
            chain: OnceCell::new(),
        }
    }
}

/// Chain-head node owning the client-facing side of every accepted line
pub struct TcpListener {
    pub(crate) meta: NodeMeta,
    cfg: Arc<TcpListenerConfig>,
    pool: Rc<RefCell<BufferPool>>,
    chain: OnceCell<Weak<Chain<Node>>>,
}

struct ListenerState {
    io: Rc<LineIo>,
    established: bool,
    write_paused: bool,
    pause_signaled: bool,
    /// Client-bound payload parked until the chain reports established
    data_queue: BufferQueue,
    /// Client-bound payload parked behind a pending write
    pause_queue: BufferQueue,
}

impl TcpListener {
    pub(crate) fn attach(&self, chain: &Rc<Chain<Node>>) {
        let _ = self.chain.set(Rc::downgrade(chain));
    }

    /// Accept-callback entry: builds the line and pushes `init` down the
    /// chain, then starts reading the client
    pub(crate) fn on_inbound(
        &self,
        chain: &Rc<Chain<Node>>,
        index: usize,
        wctx: &WorkerCtx,
        stream: TcpStream,
        peer: SocketAddr,
        local_port: u16,
    ) {
        let line = Line::new(wctx.alloc_line_id(), wctx.id(), chain.len());
        {
            let mut routing = line.routing_mut();
            routing.src.set_ip(peer.ip());
            // the port the client dialed, so from-source strategies can
            // mirror it even behind a multiport range
            routing.src.port = local_port;
            routing.src.protocol = Some(Protocol::Tcp);
        }
        let io = LineIo::new(stream, self.cfg.idle_timeout);
        line.set_state(
            index,
            ListenerState {
                io: io.clone(),
                established: false,
                write_paused: false,
                pause_signaled: false,
                data_queue: BufferQueue::new(),
                pause_queue: BufferQueue::new(),
            },
        );
        debug!(line = line.id(), %peer, port = local_port, "accepted connection");

        {
            let _guard = line.guard();
            chain.ctx(index).send_init_down(&line);
        }
        if !line.is_alive() {
            warn!(line = line.id(), "line closed by the chain before it started");
            io.close();
            return;
        }
        Self::spawn_read_task(chain.clone(), index, line, io, self.pool.clone());
    }

    pub(crate) fn establish_up(&self, ctx: Ctx<'_, Node>, line: &Rc<Line>) {
        let mut signal_pause = false;
        let mut failed = false;
        let mut watcher_io = None;
        {
            let Some(mut state) = line.state_mut::<ListenerState>(ctx.index()) else {
                return;
            };
            if state.established {
                return;
            }
            state.established = true;
            state.io.set_idle_timeout(self.cfg.established_idle_timeout);
            let io = state.io.clone();
            while let Some(buf) = state.data_queue.pop_front() {
                match io.write_or_park(buf, &mut state.pause_queue, &mut self.pool.borrow_mut()) {
                    Ok(_) => {}
                    Err(err) => {
                        debug!(line = line.id(), %err, "client write failed");
                        failed = true;
                        break;
                    }
                }
            }
            if !failed && !state.pause_queue.is_empty() {
                state.write_paused = true;
                watcher_io = Some(io);
                if !state.pause_signaled {
                    state.pause_signaled = true;
                    signal_pause = true;
                }
            }
        }
        if failed {
            Self::close_from_io(ctx.chain(), ctx.index(), line, &self.pool);
            return;
        }
        if let Some(io) = watcher_io {
            if let Some(chain) = self.chain.get().and_then(Weak::upgrade) {
                Self::spawn_write_watcher(chain, ctx.index(), line.clone(), io, self.pool.clone());
            }
        }
        if signal_pause {
            ctx.send_pause_down(line);
        }
    }

    /// Client-bound payload: write through, or park and pause the producer
    pub(crate) fn payload_up(&self, ctx: Ctx<'_, Node>, line: &Rc<Line>, buf: ShiftBuf) {
        let index = ctx.index();
        let mut signal_pause = false;
        let mut failed = false;
        let mut watcher_io = None;
        {
            let Some(mut state) = line.state_mut::<ListenerState>(index) else {
                // payload for a finished line is dropped, never forwarded
                self.pool.borrow_mut().reuse(buf);
                return;
            };
            if !state.established {
                state.data_queue.push_back(buf);
            } else if state.write_paused {
                state.pause_queue.push_back(buf);
                if !state.pause_signaled {
                    state.pause_signaled = true;
                    signal_pause = true;
                }
            } else {
                let io = state.io.clone();
                match io.write_or_park(buf, &mut state.pause_queue, &mut self.pool.borrow_mut()) {
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
                        debug!(line = line.id(), %err, "client write failed");
                        failed = true;
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
            ctx.send_pause_down(line);
        }
    }

    pub(crate) fn pause_up(&self, ctx: Ctx<'_, Node>, line: &Rc<Line>) {
        if let Some(state) = line.state_mut::<ListenerState>(ctx.index()) {
            state.io.pause_reads();
        }
    }

    pub(crate) fn resume_up(&self, ctx: Ctx<'_, Node>, line: &Rc<Line>) {
        if let Some(state) = line.state_mut::<ListenerState>(ctx.index()) {
            state.io.resume_reads();
        }
    }

    /// The chain is done with this line; the head also owns destroying it
    pub(crate) fn finish_up(&self, ctx: Ctx<'_, Node>, line: &Rc<Line>) {
        let Some(mut state) = line.take_state::<ListenerState>(ctx.index()) else {
            return;
        };
        debug!(line = line.id(), "closing client connection");
        state.io.close();
        state.data_queue.recycle_into(&mut self.pool.borrow_mut());
        state.pause_queue.recycle_into(&mut self.pool.borrow_mut());
        line.destroy();
    }

    /// Teardown initiated by the client socket itself (close, error, idle)
    fn close_from_io(
        chain: &Chain<Node>,
        index: usize,
        line: &Rc<Line>,
        pool: &Rc<RefCell<BufferPool>>,
    ) {
        let _guard = line.guard();
        let Some(mut state) = line.take_state::<ListenerState>(index) else {
            return;
        };
        state.io.close();
        state.data_queue.recycle_into(&mut pool.borrow_mut());
        state.pause_queue.recycle_into(&mut pool.borrow_mut());
        chain.ctx(index).send_finish_down(line);
        line.destroy();
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
                        debug!(line = line.id(), %err, "client socket error");
                        Self::close_from_io(&chain, index, &line, &pool);
                        return;
                    }
                }
                let mut buf = pool.borrow_mut().get_large();
                match io.try_read_into(&mut buf) {
                    Ok(ReadOutcome::Retry) => pool.borrow_mut().reuse(buf),
                    Ok(ReadOutcome::Eof) => {
                        pool.borrow_mut().reuse(buf);
                        debug!(line = line.id(), "client closed");
                        Self::close_from_io(&chain, index, &line, &pool);
                        return;
                    }
                    Ok(ReadOutcome::Data(n)) => {
                        trace!(line = line.id(), bytes = n, "client payload");
                        let _guard = line.guard();
                        chain.ctx(index).send_payload_down(&line, buf);
                    }
                    Err(err) => {
                        pool.borrow_mut().reuse(buf);
                        debug!(line = line.id(), %err, "client read failed");
                        Self::close_from_io(&chain, index, &line, &pool);
                        return;
                    }
                }
            }
        });
    }

    /// Runs while a client-bound write is pending; drains the queue and
    /// resumes the producer exactly once when it empties
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
                        debug!(line = line.id(), %err, "client socket error");
                        Self::close_from_io(&chain, index, &line, &pool);
                        return;
                    }
                }
                let _guard = line.guard();
                let mut drained = false;
                {
                    let Some(mut state) = line.state_mut::<ListenerState>(index) else {
                        return;
                    };
                    match io.flush_queue(&mut state.pause_queue, &mut pool.borrow_mut()) {
                        Ok(true) => {
                            state.write_paused = false;
                            drained = true;
                        }
                        Ok(false) => {}
                        Err(err) => {
                            drop(state);
                            debug!(line = line.id(), %err, "client write failed");
                            Self::close_from_io(&chain, index, &line, &pool);
                            return;
                        }
                    }
                }
                if drained {
                    let resume = match line.state_mut::<ListenerState>(index) {
                        Some(mut state) => {
                            let resume = state.pause_signaled;
                            state.pause_signaled = false;
                            resume
                        }
                        None => return,
                    };
                    if resume {
                        chain.ctx(index).send_resume_down(&line);
                    }
                    return;
                }
            }
        });
    }
}
