use std::rc::Rc;

use thiserror::Error;

use crate::{Line, ShiftBuf};

/// Stable FNV-1a hash of a node type name
///
/// Node types are compared by this hash in wire-facing and diagnostic
/// contexts; it must not change between builds.
pub const fn type_hash(name: &str) -> u64 {
    let bytes = name.as_bytes();
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    let mut i = 0;
    while i < bytes.len() {
        hash ^= bytes[i] as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        i += 1;
    }
    hash
}

/// Which protocol layer a node operates at
///
/// Adjacent nodes must agree: a node declaring `Transport` output cannot
/// feed a node expecting `Network` input. `Anything` matches every group.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Layer {
    /// No layer constraint
    Anything,
    /// Packet-level (IP) traffic
    Network,
    /// Stream/datagram-level (TCP/UDP) traffic
    Transport,
}

impl Layer {
    fn accepts(self, other: Self) -> bool {
        self == Self::Anything || other == Self::Anything || self == other
    }
}

/// Immutable description of a node type's place in a chain
#[derive(Debug, Clone)]
pub struct NodeMeta {
    /// Node type name, unique within a registry
    pub type_name: &'static str,
    /// Stable hash of `type_name`
    pub type_hash: u64,
    /// Whether this node may start a chain (it originates lines)
    pub chain_head: bool,
    /// Whether this node may terminate a chain (it owns the far transport)
    pub chain_tail: bool,
    /// Whether a node may follow this one
    pub can_have_next: bool,
    /// Whether a node may precede this one
    pub can_have_prev: bool,
    /// Layer group of the node itself
    pub layer: Layer,
    /// Layer group expected of the next node
    pub layer_next: Layer,
    /// Layer group expected of the previous node
    pub layer_prev: Layer,
    /// Header bytes this node prepends; the chain's buffers reserve the sum
    pub required_left_padding: usize,
}

impl NodeMeta {
    /// Describe a mid-chain adapter with no constraints
    pub fn new(type_name: &'static str) -> Self {
        Self {
            type_name,
            type_hash: type_hash(type_name),
            chain_head: false,
            chain_tail: false,
            can_have_next: true,
            can_have_prev: true,
            layer: Layer::Anything,
            layer_next: Layer::Anything,
            layer_prev: Layer::Anything,
            required_left_padding: 0,
        }
    }
}

/// One stage of a tunnel chain
///
/// The twelve handlers are the whole inter-node surface: six lifecycle
/// operations per direction. Downstream handlers are invoked by the node
/// above (closer to the network-facing head) on the node below; upstream
/// handlers mirror them. Default bodies forward along the chain, which is
/// the correct behavior for transparent adapters — a node overrides exactly
/// the operations it participates in.
///
/// Handlers never return errors. A node that fails (resolution, socket
/// creation, a dead peer) signals it by propagating `finish` toward the
/// initiator, making failure structurally identical to normal teardown.
///
/// Within one line all handler invocations are strictly ordered: they all
/// run on the line's owning worker thread, and propagation is plain
/// recursion bounded by the chain length.
#[allow(unused_variables)]
pub trait Tunnel: Sized {
    /// The node's chain-placement description
    fn meta(&self) -> &NodeMeta;

    /// A new line is opening; allocate per-line state and forward, or fail
    /// by finishing back toward the initiator. Invoked once per line —
    /// double initialization is a contract violation, not a handled case.
    fn init_down(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        ctx.send_init_down(line);
    }

    /// The head-side transport of some node above became ready
    fn establish_down(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        ctx.send_establish_down(line);
    }

    /// Payload moving toward the tail
    fn payload_down(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>, buf: ShiftBuf) {
        ctx.send_payload_down(line, buf);
    }

    /// A node above cannot currently absorb upstream payload; stop
    /// producing until resumed
    fn pause_down(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        ctx.send_pause_down(line);
    }

    /// The node above drained; production may continue. Queued payload is
    /// flushed in FIFO order before this signal travels further.
    fn resume_down(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        ctx.send_resume_down(line);
    }

    /// The line is closing from above; release per-line state exactly once
    /// and forward. A second finish on the same line must be absorbed.
    fn finish_down(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        ctx.send_finish_down(line);
    }

    /// Mirror of [`init_down`](Tunnel::init_down) for tail-originated lines
    fn init_up(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        ctx.send_init_up(line);
    }

    /// The tail-side transport of some node below became ready; anything
    /// queued while connecting flushes now
    fn establish_up(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        ctx.send_establish_up(line);
    }

    /// Payload moving toward the head
    fn payload_up(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>, buf: ShiftBuf) {
        ctx.send_payload_up(line, buf);
    }

    /// A node below cannot currently absorb downstream payload
    fn pause_up(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        ctx.send_pause_up(line);
    }

    /// The node below drained
    fn resume_up(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        ctx.send_resume_up(line);
    }

    /// The line is closing from below
    fn finish_up(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        ctx.send_finish_up(line);
    }
}

/// An immutable, validated, ordered set of tunnel nodes
///
/// Topology is fixed at construction; lines flow through a chain but never
/// reshape it. One chain instance belongs to one worker thread — every
/// worker gets its own instance of the configured graph, which is what keeps
/// a line's entire life single-threaded.
pub struct Chain<T: Tunnel> {
    nodes: Vec<T>,
    left_padding: usize,
}

impl<T: Tunnel> Chain<T> {
    /// Validate composition and build the chain
    pub fn new(nodes: Vec<T>) -> Result<Self, ChainError> {
        validate_chain(&nodes.iter().map(|n| n.meta().clone()).collect::<Vec<_>>())?;
        let left_padding = nodes.iter().map(|n| n.meta().required_left_padding).sum();
        Ok(Self {
            nodes,
            left_padding,
        })
    }

    /// Number of nodes, which is also the per-line state slot count
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Chains are never empty
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Cumulative left padding the chain's buffers must reserve
    pub fn left_padding(&self) -> usize {
        self.left_padding
    }

    /// The node at `index`
    pub fn node(&self, index: usize) -> &T {
        &self.nodes[index]
    }

    /// All nodes in chain order
    pub fn nodes(&self) -> &[T] {
        &self.nodes
    }

    /// A propagation cursor positioned at `index`
    ///
    /// Drivers (accept callbacks, read tasks) obtain their node's cursor
    /// here and originate sends from it.
    pub fn ctx(&self, index: usize) -> Ctx<'_, T> {
        assert!(index < self.nodes.len());
        Ctx { chain: self, index }
    }
}

/// Check chain composition rules over node descriptions
///
/// The engine runs this against blueprints before any worker instantiates
/// the graph, so per-worker construction cannot fail.
pub fn validate_chain(metas: &[NodeMeta]) -> Result<(), ChainError> {
    let Some(head) = metas.first() else {
        return Err(ChainError::Empty);
    };
    let tail = metas.last().unwrap();
    if !head.chain_head {
        return Err(ChainError::BadHead(head.type_name));
    }
    if !tail.chain_tail {
        return Err(ChainError::BadTail(tail.type_name));
    }
    for pair in metas.windows(2) {
        let (above, below) = (&pair[0], &pair[1]);
        if !above.can_have_next {
            return Err(ChainError::NoNext(above.type_name));
        }
        if !below.can_have_prev {
            return Err(ChainError::NoPrev(below.type_name));
        }
        if !above.layer_next.accepts(below.layer) || !below.layer_prev.accepts(above.layer) {
            return Err(ChainError::LayerMismatch(above.type_name, below.type_name));
        }
    }
    Ok(())
}

/// A chain could not be assembled from the given nodes
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ChainError {
    /// No nodes at all
    #[error("chain has no nodes")]
    Empty,
    /// First node cannot start a chain
    #[error("`{0}` cannot be a chain head")]
    BadHead(&'static str),
    /// Last node cannot terminate a chain
    #[error("`{0}` cannot be a chain tail")]
    BadTail(&'static str),
    /// Node forbids a successor
    #[error("`{0}` cannot have a next node")]
    NoNext(&'static str),
    /// Node forbids a predecessor
    #[error("`{0}` cannot have a previous node")]
    NoPrev(&'static str),
    /// Adjacent nodes disagree about their layer groups
    #[error("`{0}` and `{1}` operate at incompatible layers")]
    LayerMismatch(&'static str, &'static str),
}

/// A node's position in a chain, used to move work to its neighbors
///
/// `send_*_down` invokes the corresponding handler on the next node;
/// `send_*_up` on the previous one. Sending past either end of the chain is
/// a contract violation on the part of the node and panics — the head and
/// tail own transports and must consume what reaches them.
pub struct Ctx<'a, T: Tunnel> {
    chain: &'a Chain<T>,
    index: usize,
}

impl<T: Tunnel> Copy for Ctx<'_, T> {}

impl<T: Tunnel> Clone for Ctx<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

macro_rules! forward_down {
    ($fn_name:ident, $handler:ident, $what:literal $(, $buf:ident: $buf_ty:ty)?) => {
        #[doc = concat!("Invoke `", stringify!($handler), "` on the next node")]
        pub fn $fn_name(self, line: &Rc<Line> $(, $buf: $buf_ty)?) {
            let below = self.index + 1;
            match self.chain.nodes.get(below) {
                Some(node) => node.$handler(Ctx { chain: self.chain, index: below }, line $(, $buf)?),
                None => panic!(
                    "`{}` forwarded {} past the chain tail",
                    self.chain.nodes[self.index].meta().type_name,
                    $what,
                ),
            }
        }
    };
}

macro_rules! forward_up {
    ($fn_name:ident, $handler:ident, $what:literal $(, $buf:ident: $buf_ty:ty)?) => {
        #[doc = concat!("Invoke `", stringify!($handler), "` on the previous node")]
        pub fn $fn_name(self, line: &Rc<Line> $(, $buf: $buf_ty)?) {
            let Some(above) = self.index.checked_sub(1) else {
                panic!(
                    "`{}` forwarded {} past the chain head",
                    self.chain.nodes[self.index].meta().type_name,
                    $what,
                );
            };
            self.chain.nodes[above].$handler(Ctx { chain: self.chain, index: above }, line $(, $buf)?);
        }
    };
}

impl<'a, T: Tunnel> Ctx<'a, T> {
    /// This node's chain position, which is also its line-state slot index
    pub fn index(self) -> usize {
        self.index
    }

    /// The chain this cursor walks
    pub fn chain(self) -> &'a Chain<T> {
        self.chain
    }

    /// The node this cursor points at
    pub fn node(self) -> &'a T {
        &self.chain.nodes[self.index]
    }

    forward_down!(send_init_down, init_down, "init");
    forward_down!(send_establish_down, establish_down, "establish");
    forward_down!(send_payload_down, payload_down, "payload", buf: ShiftBuf);
    forward_down!(send_pause_down, pause_down, "pause");
    forward_down!(send_resume_down, resume_down, "resume");
    forward_down!(send_finish_down, finish_down, "finish");

    forward_up!(send_init_up, init_up, "init");
    forward_up!(send_establish_up, establish_up, "establish");
    forward_up!(send_payload_up, payload_up, "payload", buf: ShiftBuf);
    forward_up!(send_pause_up, pause_up, "pause");
    forward_up!(send_resume_up, resume_up, "resume");
    forward_up!(send_finish_up, finish_up, "finish");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(name: &'static str) -> NodeMeta {
        NodeMeta::new(name)
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(type_hash("TcpListener"), type_hash("TcpListener"));
        assert_ne!(type_hash("TcpListener"), type_hash("TcpConnector"));
        // FNV-1a of the empty string
        assert_eq!(type_hash(""), 0xcbf2_9ce4_8422_2325);
    }

    #[test]
    fn composition_rules() {
        assert_eq!(validate_chain(&[]), Err(ChainError::Empty));

        let mut head = meta("head");
        head.chain_head = true;
        let mut tail = meta("tail");
        tail.chain_tail = true;
        let relay = meta("relay");

        assert_eq!(
            validate_chain(&[relay.clone(), tail.clone()]),
            Err(ChainError::BadHead("relay"))
        );
        assert_eq!(
            validate_chain(&[head.clone(), relay.clone()]),
            Err(ChainError::BadTail("relay"))
        );
        assert!(validate_chain(&[head.clone(), relay.clone(), tail.clone()]).is_ok());

        let mut lonely = head.clone();
        lonely.can_have_next = false;
        assert_eq!(
            validate_chain(&[lonely, tail.clone()]),
            Err(ChainError::NoNext("head"))
        );

        let mut packet_tail = tail.clone();
        packet_tail.layer = Layer::Network;
        let mut stream_head = head.clone();
        stream_head.layer = Layer::Transport;
        stream_head.layer_next = Layer::Transport;
        assert_eq!(
            validate_chain(&[stream_head, packet_tail]),
            Err(ChainError::LayerMismatch("head", "tail"))
        );
    }
}
