//! External control port.
//!
//! A thin pass-through: messages queued by the peer are forwarded to the
//! satellite module while the port is started and dropped otherwise.

use tracing::{debug, warn};

use super::{PortEnv, PortState};
use crate::channel::{BitQueue, QueueHandle};
use crate::error::{OlcError, Result};
use crate::ids::{PortId, PortRef, SubGraphId};
use crate::satellite::SatelliteDriver;

/// Message on a control port queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CtrlPortMsg {
    /// Opaque message bytes.
    pub data: Vec<u8>,
}

/// External control port.
#[derive(Debug)]
pub struct ExtCtrlPort {
    id: PortId,
    key: PortRef,
    sub_graph: SubGraphId,
    bit: u32,
    queue: BitQueue<CtrlPortMsg>,
    pub(crate) state: PortState,
    pub(crate) closing: bool,
}

impl ExtCtrlPort {
    pub(crate) fn create(env: &mut PortEnv<'_>, key: PortRef, sub_graph: SubGraphId, id: PortId) -> Result<Self> {
        let bit = env.pool.request().ok_or(OlcError::NoBitAvailable {
            available: env.pool.available(),
        })?;
        let queue = BitQueue::new(format!("CTRL{:08X}", env.log_id), env.data_capacity, bit, env.channel);
        debug!(log_id = env.log_id, "ctrl port {key} created, bit 0x{bit:08X}");
        Ok(Self {
            id,
            key,
            sub_graph,
            bit,
            queue,
            state: PortState::Stopped,
            closing: false,
        })
    }

    pub(crate) fn deinit(self, env: &mut PortEnv<'_>) {
        let dropped = self.queue.drain().count();
        if dropped > 0 {
            debug!(log_id = env.log_id, "ctrl port {}: {dropped} messages dropped", self.key);
        }
        env.pool.release(self.bit);
    }

    /// Unique port id.
    pub fn id(&self) -> PortId {
        self.id
    }

    /// Module port this control port is attached to.
    pub fn key(&self) -> PortRef {
        self.key
    }

    /// Owning sub-graph.
    pub fn sub_graph(&self) -> SubGraphId {
        self.sub_graph
    }

    /// Channel bit.
    pub fn bit(&self) -> u32 {
        self.bit
    }

    /// Port state.
    pub fn state(&self) -> PortState {
        self.state
    }

    /// Producer handle for the peer.
    pub fn handle(&self) -> QueueHandle<CtrlPortMsg> {
        self.queue.handle()
    }

    /// Forwards everything queued. Returns the number forwarded.
    pub(crate) fn process(&mut self, driver: &mut dyn SatelliteDriver) -> Result<usize> {
        let mut forwarded = 0;
        while let Some(msg) = self.queue.pop() {
            if self.state != PortState::Started {
                warn!("ctrl port {}: not started, message dropped", self.key);
                continue;
            }
            driver.forward_ctrl_msg(self.key, &msg.data)?;
            forwarded += 1;
        }
        Ok(forwarded)
    }

    /// Drops everything queued.
    pub(crate) fn flush(&mut self) {
        for _ in self.queue.drain() {}
    }
}
