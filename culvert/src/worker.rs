use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::thread::JoinHandle;

use culvert_core::{BufferConfig, BufferPool, Chain, MasterPool, ShiftBuf, WorkerId};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::nodes::Node;
use crate::tun::TunDevice;

/// Work posted into a worker's event loop from another thread
///
/// Posting transfers ownership completely; the sender must not touch a
/// posted buffer or stream again.
pub(crate) enum Event {
    /// An accepted connection handed over by the acceptor
    Inbound {
        chain: usize,
        node: usize,
        io: std::net::TcpStream,
        peer: SocketAddr,
        local_port: u16,
    },
    /// A packet read from a TUN device, fanned out to this worker
    TunPacket { dev: Arc<TunDevice>, buf: ShiftBuf },
    /// Run a closure on the worker thread
    Run(Box<dyn FnOnce(&WorkerCtx) + Send>),
    /// Stop the event loop
    Shutdown,
}

/// Cross-thread handle to one worker's event loop
#[derive(Clone)]
pub struct WorkerHandle {
    id: WorkerId,
    events: mpsc::UnboundedSender<Event>,
}

impl WorkerHandle {
    /// The worker this handle posts to
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Post an event; on a dead worker the event comes back to the caller
    /// so owned buffers can be recycled
    pub(crate) fn post(&self, event: Event) -> Result<(), Event> {
        self.events.send(event).map_err(|err| err.0)
    }
}

/// Per-thread state of one worker: its buffer pool, its instances of the
/// configured chains, and its line-id allocator
///
/// `!Send` by construction; a reference is only ever observed from the
/// owning worker thread.
pub struct WorkerCtx {
    id: WorkerId,
    pool: Rc<RefCell<BufferPool>>,
    chains: RefCell<Vec<Rc<Chain<Node>>>>,
    next_line: Cell<u64>,
}

impl WorkerCtx {
    /// The worker's id
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// The worker's buffer pool
    pub fn buffer_pool(&self) -> &Rc<RefCell<BufferPool>> {
        &self.pool
    }

    pub(crate) fn chain(&self, index: usize) -> Option<Rc<Chain<Node>>> {
        self.chains.borrow().get(index).cloned()
    }

    /// Line ids carry the worker in the high bits so logs stay unambiguous
    /// across workers
    pub(crate) fn alloc_line_id(&self) -> u64 {
        let seq = self.next_line.get();
        self.next_line.set(seq + 1);
        ((self.id.0 as u64) << 40) | seq
    }
}

/// Builds a worker's chain instances once its context exists
pub(crate) type ChainFactory = dyn Fn(&WorkerCtx) -> Vec<Rc<Chain<Node>>> + Send + Sync;

/// The engine's set of worker threads
pub(crate) struct Workers {
    handles: Vec<WorkerHandle>,
    joins: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Spawn `count` workers, each owning a single-threaded event loop
    pub(crate) fn spawn(
        count: usize,
        masters: (Arc<MasterPool<ShiftBuf>>, Arc<MasterPool<ShiftBuf>>),
        buffers: BufferConfig,
        factory: Arc<ChainFactory>,
    ) -> Self {
        let mut handles = Vec::with_capacity(count);
        let mut joins = Vec::with_capacity(count);
        for index in 0..count {
            let id = WorkerId(index);
            let (tx, rx) = mpsc::unbounded_channel();
            let masters = masters.clone();
            let buffers = buffers.clone();
            let factory = factory.clone();
            let join = std::thread::Builder::new()
                .name(format!("culvert-worker-{index}"))
                .spawn(move || run_worker(id, rx, masters, buffers, factory))
                .expect("failed to spawn worker thread");
            handles.push(WorkerHandle { id, events: tx });
            joins.push(join);
        }
        Self { handles, joins }
    }

    pub(crate) fn handles(&self) -> &[WorkerHandle] {
        &self.handles
    }

    /// Join the threads without stopping them; the handles stay alive so
    /// the loops keep running until something else ends the process
    pub(crate) fn join(self) {
        let Self { handles, joins } = self;
        for join in joins {
            let _ = join.join();
        }
        drop(handles);
    }

    /// Stop every event loop and join the threads
    pub(crate) fn shutdown(self) {
        for handle in &self.handles {
            let _ = handle.post(Event::Shutdown);
        }
        for join in self.joins {
            let _ = join.join();
        }
    }
}

fn run_worker(
    id: WorkerId,
    mut events: mpsc::UnboundedReceiver<Event>,
    masters: (Arc<MasterPool<ShiftBuf>>, Arc<MasterPool<ShiftBuf>>),
    buffers: BufferConfig,
    factory: Arc<ChainFactory>,
) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build worker runtime");
    let local = tokio::task::LocalSet::new();

    let ctx = WorkerCtx {
        id,
        pool: Rc::new(RefCell::new(BufferPool::new(masters.0, masters.1, &buffers))),
        chains: RefCell::new(Vec::new()),
        next_line: Cell::new(0),
    };
    *ctx.chains.borrow_mut() = factory(&ctx);
    debug!(worker = %id, chains = ctx.chains.borrow().len(), "worker started");

    local.block_on(&runtime, async {
        while let Some(event) = events.recv().await {
            match event {
                Event::Inbound {
                    chain,
                    node,
                    io,
                    peer,
                    local_port,
                } => {
                    let Some(chain) = ctx.chain(chain) else {
                        error!(worker = %id, "inbound connection for unknown chain");
                        continue;
                    };
                    let stream = match tokio::net::TcpStream::from_std(io) {
                        Ok(stream) => stream,
                        Err(err) => {
                            error!(worker = %id, %err, "failed to adopt accepted socket");
                            continue;
                        }
                    };
                    match chain.node(node) {
                        Node::TcpListener(listener) => {
                            listener.on_inbound(&chain, node, &ctx, stream, peer, local_port);
                        }
                        _ => error!(worker = %id, "inbound connection routed to a non-listener node"),
                    }
                }
                Event::TunPacket { dev, buf } => dev.dispatch(&ctx, buf),
                Event::Run(f) => f(&ctx),
                Event::Shutdown => break,
            }
        }
    });
    debug!(worker = %id, "worker stopped");
}
