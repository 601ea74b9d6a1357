//! Offload container engine.
//!
//! An offload container stands in, on the host processor, for sub-graphs
//! whose modules actually run on a satellite processor. Peer containers on
//! the host see ordinary external ports; the container relays every
//! command, parameter, buffer and property across the processor boundary
//! and keeps the host-side picture of the satellite graph consistent.
//!
//! # Core Abstractions
//!
//! ## Container
//!
//! - [`Olc`] - single-threaded engine owning all state, driven by one
//!   [`WaitChannel`]
//! - [`OlcParams`] - creation parameters with `with_*` builders
//! - [`OlcHandle`] - cloneable sender for commands and system messages
//! - [`OlcReport`] - point-in-time snapshot of the container
//!
//! ## Channel and Queues
//!
//! - [`BitMaskPool`] - allocator of the 32 channel bits
//! - [`BitQueue`] - bounded queue that signals its bit on push
//!
//! ## Seams
//!
//! - [`SatelliteDriver`] - everything sent across the processor boundary
//! - [`PowerVoter`] - clock, bandwidth and latency votes
//!
//! ## Ports
//!
//! - [`ExtInPort`] - peer buffers in, written to a satellite write port
//! - [`ExtOutPort`] - satellite reads out, delivered to the downstream peer
//! - [`ExtCtrlPort`] - control-message pass-through
//!
//! # Threading
//!
//! Each container runs on its own thread ([`Olc::spawn`]). Nothing inside
//! [`Olc`] is shared: peers and the satellite reach it only through queues
//! whose pushes set a bit on the container's channel. Commands that need a
//! satellite answer are parked and the command bit is masked until the
//! answer arrives on the response queue.
//!
//! # Example
//!
//! ```rust,ignore
//! use olc_core::{CommandMsg, Olc, OlcParams, Opcode, Payload};
//! use olc_core::sim::{LoopbackSatellite, RecordingVoter};
//!
//! let sat = LoopbackSatellite::new();
//! let olc = Olc::create(OlcParams::default(), Box::new(sat.clone()), Box::new(RecordingVoter::new()))?;
//! let handle = olc.handle();
//! let join = olc.spawn()?;
//! handle.send(CommandMsg::new(Opcode::GraphOpen, Payload::GraphOpen(open)))?;
//! ```

pub mod bitmask;
pub mod channel;
pub mod command;
pub mod container;
pub mod error;
pub mod gpr;
pub mod ids;
pub mod media;
pub mod metadata;
pub mod pm;
pub mod port;
pub mod satellite;
pub mod sim;
pub mod topology;

mod calib;
mod completion;
mod correlation;
mod data;
mod dispatch;
mod lifecycle;
mod propagation;

pub use bitmask::{BitMaskPool, CMD_BIT, RESERVED_BITS, SYSTEM_Q_BIT};
pub use calib::{
    CfgDestination, PARAM_ID_DESTROY_SRC_MOD_DELAY_LIST, PARAM_ID_GET_PROF_INFO, PARAM_ID_PATH_DELAY,
    PARAM_ID_PATH_DESTROY, PARAM_ID_PROC_DURATION, PARAM_ID_SRC_MOD_DELAY_LIST, PARAM_ID_VOICE_SESSION_INFO,
};
pub use channel::{BitQueue, QueueError, QueueHandle, WaitChannel};
pub use command::{
    CmdAck, CommandMsg, DownstreamIcb, GprPacket, GraphMgmtPayload, GraphOpenPayload, ModuleCfg, ModuleEvent,
    Opcode, ParamPayload, Payload, PeerLink, PerfMode, SatellitePacket, ServiceStatus, SubGraphCfg, SystemMsg,
};
pub use container::{
    BASE_STACK_SIZE, MIN_HOST_STACK_SIZE, Olc, OlcHandle, OlcParams, OlcReport, PROCESS_STACK_SIZE,
    required_stack_size,
};
pub use dispatch::handled_opcodes;
pub use error::{DriverError, OlcError, Result, Status};
pub use ids::{CorrelationId, ModuleId, PortId, PortRef, SubGraphId};
pub use lifecycle::{LOW_LATENCY_FRAME_US, LOW_POWER_FRAME_US, frame_size_us};
pub use media::{DataFormat, MediaFormat, PcmFormat, Timestamp};
pub use metadata::{EosFlags, Metadata, MetadataKind, SharedEos};
pub use pm::{ClockVote, LogVoter, PowerVoter, PriorityEntry};
pub use port::{
    DataBuffer, DataFlowState, DataMsg, DownstreamHandle, ExtCtrlPort, ExtInPort, ExtOutPort, PeerCtrlMsg,
    PeerProperty, PortProperty, PortState, UpstreamHandle,
};
pub use satellite::{
    DataPortHandle, DriverContext, GraphCommand, ResponseKind, SatDataEvent, SatReadData,
    SatelliteDriver, SatelliteResponse,
};
pub use topology::{ExtPortKind, SgOp, SgState};
