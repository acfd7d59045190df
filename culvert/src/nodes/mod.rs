//! The built-in node catalog
//!
//! Node kinds are a closed set: a chain is a `Chain<Node>` and dispatch goes
//! through this enum rather than through boxed trait objects. Adding a node
//! kind means adding a variant and its delegation arms — everything else
//! (state slots, propagation, validation) comes from `culvert-core`.

use std::rc::Rc;

use culvert_core::{Chain, Ctx, Line, NodeMeta, ShiftBuf, Tunnel};

mod bridge;
mod tcp_connector;
mod tcp_listener;

pub use bridge::{Bridge, BridgeConfig};
pub use tcp_connector::{TcpConnector, TcpConnectorConfig};
pub use tcp_listener::{TcpListener, TcpListenerConfig};

pub(crate) use bridge::BridgeBlueprint;
pub(crate) use tcp_connector::ConnectorBlueprint;
pub(crate) use tcp_listener::ListenerBlueprint;

/// One node of a running chain
pub enum Node {
    /// Accepts inbound connections at the chain head
    TcpListener(TcpListener),
    /// Dials the destination at the chain tail
    TcpConnector(TcpConnector),
    /// Splices two configured chain halves
    Bridge(Bridge),
}

impl Node {
    /// Give nodes that spawn tasks a way back to their chain
    pub(crate) fn attach(&self, chain: &Rc<Chain<Node>>) {
        match self {
            Self::TcpListener(node) => node.attach(chain),
            Self::TcpConnector(node) => node.attach(chain),
            Self::Bridge(_) => {}
        }
    }
}

impl Tunnel for Node {
    fn meta(&self) -> &NodeMeta {
        match self {
            Self::TcpListener(node) => &node.meta,
            Self::TcpConnector(node) => &node.meta,
            Self::Bridge(node) => &node.meta,
        }
    }

    fn init_down(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        match self {
            Self::TcpConnector(node) => node.init_down(ctx, line),
            _ => ctx.send_init_down(line),
        }
    }

    fn payload_down(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>, buf: ShiftBuf) {
        match self {
            Self::TcpConnector(node) => node.payload_down(ctx, line, buf),
            Self::Bridge(node) => node.payload_down(ctx, line, buf),
            _ => ctx.send_payload_down(line, buf),
        }
    }

    fn pause_down(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        match self {
            Self::TcpConnector(node) => node.pause_down(ctx, line),
            _ => ctx.send_pause_down(line),
        }
    }

    fn resume_down(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        match self {
            Self::TcpConnector(node) => node.resume_down(ctx, line),
            _ => ctx.send_resume_down(line),
        }
    }

    fn finish_down(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        match self {
            Self::TcpConnector(node) => node.finish_down(ctx, line),
            _ => ctx.send_finish_down(line),
        }
    }

    fn establish_up(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        match self {
            Self::TcpListener(node) => node.establish_up(ctx, line),
            _ => ctx.send_establish_up(line),
        }
    }

    fn payload_up(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>, buf: ShiftBuf) {
        match self {
            Self::TcpListener(node) => node.payload_up(ctx, line, buf),
            Self::Bridge(node) => node.payload_up(ctx, line, buf),
            _ => ctx.send_payload_up(line, buf),
        }
    }

    fn pause_up(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        match self {
            Self::TcpListener(node) => node.pause_up(ctx, line),
            _ => ctx.send_pause_up(line),
        }
    }

    fn resume_up(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        match self {
            Self::TcpListener(node) => node.resume_up(ctx, line),
            _ => ctx.send_resume_up(line),
        }
    }

    fn finish_up(&self, ctx: Ctx<'_, Self>, line: &Rc<Line>) {
        match self {
            Self::TcpListener(node) => node.finish_up(ctx, line),
            _ => ctx.send_finish_up(line),
        }
    }
}
