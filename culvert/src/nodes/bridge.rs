use std::rc::Rc;
use std::sync::Arc;

use culvert_core::{Ctx, Line, NodeMeta, ShiftBuf};
use tracing::trace;

use crate::engine::BuildError;
use crate::nodes::Node;

/// Settings of a [`Bridge`] node
///
/// Two bridge specs naming the same `pair` splice their chains together at
/// startup: the graph `[listener, bridge-a]` + `[bridge-a, connector]`
/// becomes one chain with the bridge as the splice point.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub(crate) pair: String,
}

impl BridgeConfig {
    /// Name the pairing; both halves must use the same name
    pub fn new(pair: &str) -> Self {
        Self { pair: pair.into() }
    }
}

/// Validated, shareable form of a bridge spec
pub struct BridgeBlueprint {
    pub(crate) cfg: Arc<BridgeConfig>,
}

impl BridgeBlueprint {
    pub(crate) fn new(name: &str, cfg: BridgeConfig) -> Result<Self, BuildError> {
        if cfg.pair.is_empty() {
            return Err(BuildError::InvalidSettings(
                name.into(),
                "bridge pair name is empty".into(),
            ));
        }
        Ok(Self { cfg: Arc::new(cfg) })
    }

    pub(crate) fn meta() -> NodeMeta {
        let mut meta = NodeMeta::new("Bridge");
        meta.chain_head = true;
        meta.chain_tail = true;
        meta
    }

    pub(crate) fn pair(&self) -> &str {
        &self.cfg.pair
    }

    pub(crate) fn instantiate(&self) -> Bridge {
        Bridge {
            meta: Self::meta(),
            cfg: self.cfg.clone(),
        }
    }
}

/// The splice point between two configured chain halves
///
/// Every operation passes straight through; the node exists so two
/// separately configured graphs can be joined without either knowing the
/// other's shape, and so the splice shows up in traces.
pub struct Bridge {
    pub(crate) meta: NodeMeta,
    cfg: Arc<BridgeConfig>,
}

impl Bridge {
    pub(crate) fn payload_down(&self, ctx: Ctx<'_, Node>, line: &Rc<Line>, buf: ShiftBuf) {
        trace!(pair = %self.cfg.pair, line = line.id(), bytes = buf.len(), "bridging payload down");
        ctx.send_payload_down(line, buf);
    }

    pub(crate) fn payload_up(&self, ctx: Ctx<'_, Node>, line: &Rc<Line>, buf: ShiftBuf) {
        trace!(pair = %self.cfg.pair, line = line.id(), bytes = buf.len(), "bridging payload up");
        ctx.send_payload_up(line, buf);
    }
}
