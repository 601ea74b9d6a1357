//! External port model.
//!
//! An external port sits where a sub-graph boundary crosses the container
//! boundary. Each one owns a channel bit shared by two queues: a data queue
//! facing the peer container and an event queue facing the satellite data
//! port.
//!
//! - [`ExtInPort`]: upstream buffers in, written to a satellite write port.
//! - [`ExtOutPort`]: satellite read port data out, delivered in locally
//!   allocated buffers to the downstream peer.
//! - [`ExtCtrlPort`]: control-message pass-through.

mod ctrl;
mod ext_in;
mod ext_out;

pub use ctrl::{CtrlPortMsg, ExtCtrlPort};
pub use ext_in::{ExtInFlags, ExtInPort};
pub use ext_out::{ExtOutPort, IcbInfo, MfPath};

use std::sync::Arc;

use crossbeam_channel::Sender;

use crate::bitmask::BitMaskPool;
use crate::channel::{QueueHandle, WaitChannel};
use crate::media::{MediaFormat, Timestamp};
use crate::metadata::{self, Metadata};
use crate::satellite::SatelliteDriver;

/// State of a port, derived from its sub-graph and its connected peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum PortState {
    /// Not yet opened, or no peer information.
    #[default]
    Invalid,
    /// Stopped.
    Stopped,
    /// Prepared.
    Prepared,
    /// Started.
    Started,
    /// Suspended.
    Suspended,
}

impl PortState {
    /// Combines this port's own state with its peer's.
    ///
    /// The stronger "off" state wins: `Stopped > Suspended > Prepared >
    /// Started`. An `Invalid` peer imposes nothing.
    pub fn downgrade(self, peer: PortState) -> PortState {
        fn rank(s: PortState) -> u8 {
            match s {
                PortState::Stopped => 4,
                PortState::Suspended => 3,
                PortState::Prepared => 2,
                PortState::Started => 1,
                PortState::Invalid => 0,
            }
        }
        if rank(peer) > rank(self) && self != PortState::Invalid {
            peer
        } else {
            self
        }
    }

    /// Wire encoding used by the topo-state peer property.
    pub fn as_raw(self) -> u32 {
        match self {
            PortState::Invalid => 0,
            PortState::Started => 1,
            PortState::Prepared => 2,
            PortState::Stopped => 3,
            PortState::Suspended => 4,
        }
    }

    /// Decodes [`as_raw`](Self::as_raw); unknown values are `Invalid`.
    pub fn from_raw(raw: u32) -> PortState {
        match raw {
            1 => PortState::Started,
            2 => PortState::Prepared,
            3 => PortState::Stopped,
            4 => PortState::Suspended,
            _ => PortState::Invalid,
        }
    }
}

/// Whether data is currently flowing through a port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DataFlowState {
    /// No data since the last EOS (or ever).
    #[default]
    AtGap,
    /// Data has started.
    Flowing,
}

/// Property exchanged between peer ports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PortProperty {
    /// The upstream side is real-time.
    IsUpstreamRt,
    /// The downstream side is real-time.
    IsDownstreamRt,
    /// The peer port's state, encoded with [`PortState::as_raw`].
    TopoState,
    /// Anything else; never handled.
    Other(u32),
}

/// One property update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeerProperty {
    /// Which property.
    pub property: PortProperty,
    /// New value.
    pub value: u32,
}

impl PeerProperty {
    /// Boolean-valued property.
    pub fn flag(property: PortProperty, on: bool) -> Self {
        Self {
            property,
            value: u32::from(on),
        }
    }

    /// Topo-state property.
    pub fn state(state: PortState) -> Self {
        Self {
            property: PortProperty::TopoState,
            value: state.as_raw(),
        }
    }
}

/// A data buffer exchanged between containers.
///
/// Buffers owned by an output port carry a return path; recycling sends
/// them back to the owner's queue.
#[derive(Debug, Default)]
pub struct DataBuffer {
    /// Valid payload bytes.
    pub data: Vec<u8>,
    /// Buffer size in bytes.
    pub max_len: usize,
    /// Timestamp of the first sample.
    pub timestamp: Option<Timestamp>,
    /// Metadata riding on this buffer.
    pub metadata: Vec<Metadata>,
    return_to: Option<QueueHandle<DataBuffer>>,
}

impl DataBuffer {
    /// Filled buffer without a return path.
    pub fn filled(data: Vec<u8>) -> Self {
        let max_len = data.len();
        Self {
            data,
            max_len,
            ..Self::default()
        }
    }

    /// Empty buffer of `max_len` bytes.
    pub fn empty(max_len: usize) -> Self {
        Self {
            data: Vec::with_capacity(max_len),
            max_len,
            ..Self::default()
        }
    }

    /// Sets the return path.
    pub fn with_return(mut self, owner: QueueHandle<DataBuffer>) -> Self {
        self.return_to = Some(owner);
        self
    }

    /// Adds a metadata item.
    pub fn with_metadata(mut self, md: Metadata) -> Self {
        self.metadata.push(md);
        self
    }

    /// Sets the timestamp.
    pub fn with_timestamp(mut self, ts: Timestamp) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Returns `true` if the buffer goes back to an owner when recycled.
    pub fn has_return_path(&self) -> bool {
        self.return_to.is_some()
    }

    /// Clears the buffer and hands it back to its owner.
    ///
    /// Leftover metadata is destroyed as dropped. Returns `false` when there
    /// is no owner or the owner's queue is gone.
    pub fn recycle(mut self) -> bool {
        metadata::destroy_all(&mut self.metadata, true);
        self.data.clear();
        self.timestamp = None;
        match self.return_to.clone() {
            Some(owner) => owner.push(self).is_ok(),
            None => false,
        }
    }
}

/// Message on a data queue between containers.
#[derive(Debug)]
pub enum DataMsg {
    /// Data (possibly empty, carrying only metadata).
    Buffer(DataBuffer),
    /// In-band media format.
    MediaFormat(MediaFormat),
}

/// Control-path message between peer containers.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCtrlMsg {
    /// Out-of-band media format for the peer's input.
    MediaFormat(MediaFormat),
    /// Property updates.
    PropertyUpdate(Vec<PeerProperty>),
    /// Downstream acknowledges that its upstream stopped.
    UpstreamStopped,
}

/// Handles of the downstream peer of an output port.
#[derive(Debug, Clone)]
pub struct DownstreamHandle {
    /// Peer input data queue.
    pub data: QueueHandle<DataMsg>,
    /// Peer command queue.
    pub cmd: Sender<PeerCtrlMsg>,
}

/// Handle of the upstream peer of an input port.
#[derive(Debug, Clone)]
pub struct UpstreamHandle {
    /// Peer command queue.
    pub cmd: Sender<PeerCtrlMsg>,
}

/// Shared resources a port needs while it is built or torn down.
pub(crate) struct PortEnv<'a> {
    pub log_id: u32,
    pub pool: &'a mut BitMaskPool,
    pub channel: &'a Arc<WaitChannel>,
    pub driver: &'a mut dyn SatelliteDriver,
    pub data_capacity: usize,
}
