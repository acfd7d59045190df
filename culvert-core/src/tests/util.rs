use std::cell::{Cell, RefCell};
use std::net::Ipv4Addr;
use std::rc::Rc;

use crate::{
    BufferConfig, BufferPool, BufferQueue, Chain, Ctx, Line, NodeMeta, ShiftBuf, Tunnel, WorkerId,
};

/// Head node standing in for a listener: records every signal that reaches
/// it and collects upstream payload as its "client-facing wire".
pub(super) struct Source {
    meta: NodeMeta,
    pub pauses: Cell<u32>,
    pub resumes: Cell<u32>,
    pub establishes: Cell<u32>,
    pub finishes: Cell<u32>,
    pub client_wire: RefCell<Vec<u8>>,
    pool: Rc<RefCell<BufferPool>>,
}

impl Source {
    fn new(pool: Rc<RefCell<BufferPool>>) -> Self {
        let mut meta = NodeMeta::new("test-source");
        meta.chain_head = true;
        Self {
            meta,
            pauses: Cell::new(0),
            resumes: Cell::new(0),
            establishes: Cell::new(0),
            finishes: Cell::new(0),
            client_wire: RefCell::new(Vec::new()),
            pool,
        }
    }
}

/// Transparent mid-chain adapter; exercises the default forwarding bodies.
pub(super) struct Relay {
    meta: NodeMeta,
}

impl Relay {
    fn new() -> Self {
        Self {
            meta: NodeMeta::new("test-relay"),
        }
    }
}

/// Tail node standing in for a connector over a mock transport that accepts
/// only `budget` bytes before reporting write-pending.
pub(super) struct Sink {
    meta: NodeMeta,
    pub budget: Cell<usize>,
    pub wire: RefCell<Vec<u8>>,
    pub open_resources: Cell<i32>,
    fail_init: bool,
    pool: Rc<RefCell<BufferPool>>,
}

struct SinkState {
    write_paused: bool,
    pause_signaled: bool,
    queue: BufferQueue,
}

impl Sink {
    fn new(budget: usize, fail_init: bool, pool: Rc<RefCell<BufferPool>>) -> Self {
        let mut meta = NodeMeta::new("test-sink");
        meta.chain_tail = true;
        Self {
            meta,
            budget: Cell::new(budget),
            wire: RefCell::new(Vec::new()),
            open_resources: Cell::new(0),
            fail_init,
            pool,
        }
    }

    fn init_down(&self, ctx: Ctx<'_, TestNode>, line: &Rc<Line>) {
        if self.fail_init {
            ctx.send_finish_up(line);
            return;
        }
        line.set_state(
            ctx.index(),
            SinkState {
                write_paused: false,
                pause_signaled: false,
                queue: BufferQueue::new(),
            },
        );
        self.open_resources.set(self.open_resources.get() + 1);
        ctx.send_establish_up(line);
    }

    /// Accept what the budget allows, park the rest, pause the producer on
    /// the transition into write-pending.
    fn payload_down(&self, ctx: Ctx<'_, TestNode>, line: &Rc<Line>, buf: ShiftBuf) {
        let Some(mut state) = line.state_mut::<SinkState>(ctx.index()) else {
            self.pool.borrow_mut().reuse(buf);
            return;
        };
        let mut signal_pause = false;
        if state.write_paused {
            state.queue.push_back(buf);
            if !state.pause_signaled {
                state.pause_signaled = true;
                signal_pause = true;
            }
        } else {
            let accepted = buf.len().min(self.budget.get());
            self.wire
                .borrow_mut()
                .extend_from_slice(&buf.as_slice()[..accepted]);
            self.budget.set(self.budget.get() - accepted);
            if accepted < buf.len() {
                let mut rest = buf;
                rest.consume(accepted);
                state.write_paused = true;
                state.queue.push_back(rest);
                if !state.pause_signaled {
                    state.pause_signaled = true;
                    signal_pause = true;
                }
            } else {
                self.pool.borrow_mut().reuse(buf);
            }
        }
        drop(state);
        if signal_pause {
            ctx.send_pause_up(line);
        }
    }

    fn finish_down(&self, ctx: Ctx<'_, TestNode>, line: &Rc<Line>) {
        // an emptied slot is how a second finish stays a no-op
        let Some(mut state) = line.take_state::<SinkState>(ctx.index()) else {
            return;
        };
        self.open_resources.set(self.open_resources.get() - 1);
        state.queue.recycle_into(&mut self.pool.borrow_mut());
    }

    /// Simulated write-completion callback from the mock transport
    pub(super) fn complete_writes(&self, ctx: Ctx<'_, TestNode>, line: &Rc<Line>, budget: usize) {
        self.budget.set(budget);
        let Some(mut state) = line.state_mut::<SinkState>(ctx.index()) else {
            return;
        };
        while let Some(mut buf) = state.queue.pop_front() {
            let accepted = buf.len().min(self.budget.get());
            self.wire
                .borrow_mut()
                .extend_from_slice(&buf.as_slice()[..accepted]);
            self.budget.set(self.budget.get() - accepted);
            if accepted < buf.len() {
                buf.consume(accepted);
                state.queue.push_front(buf);
                break;
            }
            self.pool.borrow_mut().reuse(buf);
        }
        let mut signal_resume = false;
        if state.queue.is_empty() {
            state.write_paused = false;
            if state.pause_signaled {
                state.pause_signaled = false;
                signal_resume = true;
            }
        }
        drop(state);
        if signal_resume {
            ctx.send_resume_up(line);
        }
    }
}

pub(super) enum TestNode {
    Source(Source),
    Relay(Relay),
    Sink(Sink),
}

impl Tunnel for TestNode {
    fn meta(&self) -> &NodeMeta {
        match self {
            Self::Source(n) => &n.meta,
            Self::Relay(n) => &n.meta,
            Self::Sink(n) => &n.meta,
        }
    }

    fn init_down(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        match self {
            Self::Sink(n) => n.init_down(ctx, line),
            _ => ctx.send_init_down(line),
        }
    }

    fn payload_down(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>, buf: ShiftBuf) {
        match self {
            Self::Sink(n) => n.payload_down(ctx, line, buf),
            _ => ctx.send_payload_down(line, buf),
        }
    }

    fn finish_down(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        match self {
            Self::Sink(n) => n.finish_down(ctx, line),
            _ => ctx.send_finish_down(line),
        }
    }

    fn payload_up(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>, buf: ShiftBuf) {
        match self {
            Self::Source(n) => {
                n.client_wire.borrow_mut().extend_from_slice(buf.as_slice());
                n.pool.borrow_mut().reuse(buf);
            }
            _ => ctx.send_payload_up(line, buf),
        }
    }

    fn establish_up(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        match self {
            Self::Source(n) => n.establishes.set(n.establishes.get() + 1),
            _ => ctx.send_establish_up(line),
        }
    }

    fn pause_up(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        match self {
            Self::Source(n) => n.pauses.set(n.pauses.get() + 1),
            _ => ctx.send_pause_up(line),
        }
    }

    fn resume_up(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        match self {
            Self::Source(n) => n.resumes.set(n.resumes.get() + 1),
            _ => ctx.send_resume_up(line),
        }
    }

    fn finish_up(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        match self {
            Self::Source(n) => {
                n.finishes.set(n.finishes.get() + 1);
                line.destroy();
            }
            _ => ctx.send_finish_up(line),
        }
    }
}

/// A three-node chain (source → relay → sink) over one line, with its own
/// buffer pool for leak accounting.
pub(super) struct TestChain {
    pub chain: Chain<TestNode>,
    pub line: Rc<Line>,
    pub pool: Rc<RefCell<BufferPool>>,
}

impl TestChain {
    pub fn new(budget: usize) -> Self {
        Self::build(budget, false)
    }

    pub fn failing() -> Self {
        Self::build(0, true)
    }

    fn build(budget: usize, fail_init: bool) -> Self {
        let mut config = BufferConfig::default();
        config.local_target(4).master_capacity(32);
        let (small, large) = config.build_masters();
        let pool = Rc::new(RefCell::new(BufferPool::new(small, large, &config)));

        let nodes = vec![
            TestNode::Source(Source::new(pool.clone())),
            TestNode::Relay(Relay::new()),
            TestNode::Sink(Sink::new(budget, fail_init, pool.clone())),
        ];
        let chain = Chain::new(nodes).unwrap();
        let line = Line::new(1, WorkerId(0), chain.len());
        {
            let mut routing = line.routing_mut();
            routing.src.set_ip(Ipv4Addr::LOCALHOST.into());
            routing.src.port = 9000;
        }
        Self { chain, line, pool }
    }

    pub fn open(&self) {
        let _guard = self.line.guard();
        self.chain.ctx(0).send_init_down(&self.line);
    }

    pub fn send(&self, data: &[u8]) {
        let mut buf = self.pool.borrow_mut().get_small();
        buf.extend_from_slice(data);
        let _guard = self.line.guard();
        self.chain.ctx(0).send_payload_down(&self.line, buf);
    }

    pub fn finish_from_head(&self) {
        let _guard = self.line.guard();
        self.chain.ctx(0).send_finish_down(&self.line);
    }

    pub fn complete_writes(&self, budget: usize) {
        let _guard = self.line.guard();
        self.sink()
            .complete_writes(self.chain.ctx(2), &self.line, budget);
    }

    pub fn source(&self) -> &Source {
        match self.chain.node(0) {
            TestNode::Source(n) => n,
            _ => unreachable!(),
        }
    }

    pub fn sink(&self) -> &Sink {
        match self.chain.node(2) {
            TestNode::Sink(n) => n,
            _ => unreachable!(),
        }
    }

    pub fn in_flight(&self) -> u64 {
        self.pool.borrow().in_flight()
    }
}
