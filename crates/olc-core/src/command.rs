//! Command surface of the container.
//!
//! Commands arrive on the command queue as [`CommandMsg`] values. Each one
//! carries an [`Opcode`], a typed [`Payload`] and an optional responder
//! through which exactly one [`CmdAck`] is sent.

use std::fmt;

use crossbeam_channel::Sender;

use crate::error::{OlcError, Status};
use crate::ids::{ModuleId, PortRef, SubGraphId};
use crate::media::MediaFormat;
use crate::port::{DownstreamHandle, PeerProperty, UpstreamHandle};
use crate::satellite::SatelliteResponse;

/// Commands handled by the container.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Opcode {
    /// GPR packet from a client.
    Gpr,
    /// Set config parameters.
    SetCfg,
    /// Get config parameters.
    GetCfg,
    /// Inter-container buffering info from the downstream peer.
    IcbInfoFromDownstream,
    /// Message for an external control port.
    CtrlPortTrigger,
    /// Property update from a peer port.
    PeerPortPropertyUpdate,
    /// Downstream acknowledges that this upstream stopped.
    UpstreamStoppedAck,
    /// Open sub-graphs.
    GraphOpen,
    /// Prepare sub-graphs.
    GraphPrepare,
    /// Start sub-graphs.
    GraphStart,
    /// Suspend sub-graphs.
    GraphSuspend,
    /// Stop sub-graphs.
    GraphStop,
    /// Flush sub-graphs or ports.
    GraphFlush,
    /// Close sub-graphs or ports.
    GraphClose,
    /// Attach peer handles.
    GraphConnect,
    /// Detach peer handles.
    GraphDisconnect,
    /// Destroy the container.
    DestroyContainer,
    /// Control-path media format for an external input.
    MediaFormat,
    /// Register persistent config.
    RegisterCfg,
    /// Deregister persistent config.
    DeregisterCfg,
    /// Packet from the satellite transport.
    SatelliteGpr,
    /// Opcode outside the dispatch table.
    Other(u32),
}

impl Opcode {
    /// Short log tag.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Gpr => "GPR",
            Opcode::SetCfg => "SET_CFG",
            Opcode::GetCfg => "GET_CFG",
            Opcode::IcbInfoFromDownstream => "INFORM_ICB_INFO",
            Opcode::CtrlPortTrigger => "CTRL_PORT_TRIGGER",
            Opcode::PeerPortPropertyUpdate => "PEER_PORT_PROPERTY_UPDATE",
            Opcode::UpstreamStoppedAck => "UPSTREAM_STOPPED_ACK",
            Opcode::GraphOpen => "GRAPH_OPEN",
            Opcode::GraphPrepare => "GRAPH_PREPARE",
            Opcode::GraphStart => "GRAPH_START",
            Opcode::GraphSuspend => "GRAPH_SUSPEND",
            Opcode::GraphStop => "GRAPH_STOP",
            Opcode::GraphFlush => "GRAPH_FLUSH",
            Opcode::GraphClose => "GRAPH_CLOSE",
            Opcode::GraphConnect => "GRAPH_CONNECT",
            Opcode::GraphDisconnect => "GRAPH_DISCONNECT",
            Opcode::DestroyContainer => "DESTROY_CONTAINER",
            Opcode::MediaFormat => "MEDIA_FORMAT",
            Opcode::RegisterCfg => "REGISTER_CFG",
            Opcode::DeregisterCfg => "DEREGISTER_CFG",
            Opcode::SatelliteGpr => "SATELLITE_GPR",
            Opcode::Other(_) => "UNKNOWN",
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Other(raw) => write!(f, "UNKNOWN(0x{raw:08X})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Performance mode declared by a sub-graph.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PerfMode {
    /// 1 ms frames.
    LowLatency,
    /// 5 ms frames.
    LowPower,
    /// Unrecognised mode value.
    Other(u32),
}

/// One sub-graph of an open command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubGraphCfg {
    /// Sub-graph id.
    pub id: SubGraphId,
    /// Declared performance mode.
    pub perf_mode: PerfMode,
}

/// One module of an open command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleCfg {
    /// Instance id.
    pub id: ModuleId,
    /// Owning sub-graph.
    pub sub_graph: SubGraphId,
}

/// Open payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GraphOpenPayload {
    /// Sub-graphs to open.
    pub sub_graphs: Vec<SubGraphCfg>,
    /// Modules, each in one of the listed (or an already open) sub-graph.
    pub modules: Vec<ModuleCfg>,
    /// Module ports that become external inputs.
    pub ext_inputs: Vec<PortRef>,
    /// Module ports that become external outputs.
    pub ext_outputs: Vec<PortRef>,
    /// Module ports that become external control ports.
    pub ext_ctrl: Vec<PortRef>,
}

/// Payload of prepare/start/suspend/stop/flush/close/disconnect.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GraphMgmtPayload {
    /// Target sub-graphs.
    pub sub_graphs: Vec<SubGraphId>,
    /// Explicit external port handles.
    pub ports: Vec<PortRef>,
}

/// One peer attachment of a connect command.
#[derive(Debug, Clone)]
pub enum PeerLink {
    /// Downstream peer of an external output.
    Downstream {
        /// Local external output.
        port: PortRef,
        /// Peer handles.
        peer: DownstreamHandle,
    },
    /// Upstream peer of an external input.
    Upstream {
        /// Local external input.
        port: PortRef,
        /// Peer handle.
        peer: UpstreamHandle,
    },
}

/// One module parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamPayload {
    /// Addressed module instance (the container's own id for container
    /// parameters).
    pub module: ModuleId,
    /// Parameter id.
    pub param_id: u32,
    /// Parameter bytes.
    pub data: Vec<u8>,
    /// Per-parameter result.
    pub status: Status,
}

impl ParamPayload {
    /// Parameter with `data`.
    pub fn new(module: u32, param_id: u32, data: Vec<u8>) -> Self {
        Self {
            module: ModuleId(module),
            param_id,
            data,
            status: Status::Ok,
        }
    }

    /// Little-endian `u32` at word `index`, if present.
    pub fn word(&self, index: usize) -> Option<u32> {
        let start = index * 4;
        let bytes = self.data.get(start..start + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

/// Packet received through the client GPR transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GprPacket {
    /// APM opcode.
    pub opcode: u32,
    /// Client token.
    pub token: u32,
    /// Destination module.
    pub dst_module: ModuleId,
    /// Parameters.
    pub params: Vec<ParamPayload>,
}

/// Event raised by a satellite module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleEvent {
    /// Raising module.
    pub module: ModuleId,
    /// Event id.
    pub event_id: u32,
    /// Event bytes.
    pub payload: Vec<u8>,
}

/// Packet received through the satellite transport.
#[derive(Clone, Debug, PartialEq)]
pub enum SatellitePacket {
    /// Response to a dispatched command.
    Response(SatelliteResponse),
    /// Module event for a registered client.
    ModuleEvent(ModuleEvent),
}

/// Inter-container buffering info from a downstream peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownstreamIcb {
    /// Downstream frame length in µs.
    pub frame_len_us: u32,
    /// Downstream period in µs.
    pub period_us: u32,
    /// Downstream is real-time.
    pub is_real_time: bool,
}

/// Typed command payload.
#[derive(Debug)]
pub enum Payload {
    /// For `GraphOpen`.
    GraphOpen(GraphOpenPayload),
    /// For prepare/start/suspend/stop/flush/close/disconnect.
    GraphMgmt(GraphMgmtPayload),
    /// For `GraphConnect`.
    Connect(Vec<PeerLink>),
    /// For set/get/register/deregister config.
    ParamCfg(Vec<ParamPayload>),
    /// For `Gpr`.
    Gpr(GprPacket),
    /// For `MediaFormat`.
    MediaFormat {
        /// Target external input.
        port: PortRef,
        /// Format.
        fmt: MediaFormat,
    },
    /// For `PeerPortPropertyUpdate`.
    PeerProperty {
        /// Local external port receiving the update.
        port: PortRef,
        /// Updates.
        props: Vec<PeerProperty>,
    },
    /// For `UpstreamStoppedAck`.
    UpstreamStopped {
        /// Local external input whose upstream stopped.
        port: PortRef,
    },
    /// For `IcbInfoFromDownstream`.
    IcbInfo {
        /// Local external output.
        port: PortRef,
        /// Downstream info.
        info: DownstreamIcb,
    },
    /// For `CtrlPortTrigger`.
    CtrlPortTrigger {
        /// Local external control port.
        port: PortRef,
        /// Message bytes.
        data: Vec<u8>,
    },
    /// For `SatelliteGpr`.
    Satellite(SatellitePacket),
    /// No payload.
    Empty,
}

impl Payload {
    /// Log tag of the payload variant.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Payload::GraphOpen(_) => "graph-open",
            Payload::GraphMgmt(_) => "graph-mgmt",
            Payload::Connect(_) => "connect",
            Payload::ParamCfg(_) => "param-cfg",
            Payload::Gpr(_) => "gpr",
            Payload::MediaFormat { .. } => "media-format",
            Payload::PeerProperty { .. } => "peer-property",
            Payload::UpstreamStopped { .. } => "upstream-stopped",
            Payload::IcbInfo { .. } => "icb-info",
            Payload::CtrlPortTrigger { .. } => "ctrl-port-trigger",
            Payload::Satellite(_) => "satellite",
            Payload::Empty => "empty",
        }
    }
}

/// Acknowledgement of one command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CmdAck {
    /// Acknowledged opcode.
    pub opcode: Opcode,
    /// Token copied from the command.
    pub token: u32,
    /// Result.
    pub status: Status,
    /// Returned parameters (get-cfg, container queries).
    pub params: Vec<ParamPayload>,
}

/// One command on the command queue.
#[derive(Debug)]
pub struct CommandMsg {
    /// Opcode.
    pub opcode: Opcode,
    /// Client token, echoed in the ack.
    pub token: u32,
    /// Payload.
    pub payload: Payload,
    responder: Option<Sender<CmdAck>>,
}

impl CommandMsg {
    /// Command without a responder.
    pub fn new(opcode: Opcode, payload: Payload) -> Self {
        Self {
            opcode,
            token: 0,
            payload,
            responder: None,
        }
    }

    /// Sets the client token.
    pub fn with_token(mut self, token: u32) -> Self {
        self.token = token;
        self
    }

    /// Sets where the ack goes.
    pub fn with_responder(mut self, tx: Sender<CmdAck>) -> Self {
        self.responder = Some(tx);
        self
    }

    /// Sends the ack and consumes the command.
    pub(crate) fn ack(self, status: Status) {
        self.ack_with(status, Vec::new());
    }

    /// Sends the ack with returned parameters.
    pub(crate) fn ack_with(self, status: Status, params: Vec<ParamPayload>) {
        if let Some(tx) = self.responder {
            let _ = tx.send(CmdAck {
                opcode: self.opcode,
                token: self.token,
                status,
                params,
            });
        }
    }

    pub(crate) fn malformed(&self, expected: &'static str) -> OlcError {
        OlcError::MalformedPayload {
            opcode: self.opcode,
            expected,
            found: self.payload.kind_name(),
        }
    }

    /// Sub-graph ids of a graph-management payload.
    pub fn mgmt(&self) -> Result<&GraphMgmtPayload, OlcError> {
        match &self.payload {
            Payload::GraphMgmt(p) => Ok(p),
            _ => Err(self.malformed("graph-mgmt")),
        }
    }

    /// Open payload.
    pub fn open(&self) -> Result<&GraphOpenPayload, OlcError> {
        match &self.payload {
            Payload::GraphOpen(p) => Ok(p),
            _ => Err(self.malformed("graph-open")),
        }
    }

    /// Parameter list.
    pub fn params(&self) -> Result<&[ParamPayload], OlcError> {
        match &self.payload {
            Payload::ParamCfg(p) => Ok(p),
            _ => Err(self.malformed("param-cfg")),
        }
    }

    /// GPR packet.
    pub fn gpr(&self) -> Result<&GprPacket, OlcError> {
        match &self.payload {
            Payload::Gpr(p) => Ok(p),
            _ => Err(self.malformed("gpr")),
        }
    }
}

/// Message on the system queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SystemMsg {
    /// Service-registry status notification for the satellite domain.
    ServiceStatus(ServiceStatus),
    /// Any other system opcode.
    Other(u32),
}

/// Satellite service status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceStatus {
    /// Satellite is up.
    Up,
    /// Satellite went down (subsystem restart).
    Down,
    /// Unrecognised status value.
    Unknown(u32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    // --- acks ---

    #[test]
    fn ack_echoes_opcode_and_token() {
        let (tx, rx) = unbounded();
        let msg = CommandMsg::new(Opcode::GraphStart, Payload::Empty)
            .with_token(42)
            .with_responder(tx);
        msg.ack(Status::Ok);
        let ack = rx.try_recv().unwrap();
        assert_eq!(ack.opcode, Opcode::GraphStart);
        assert_eq!(ack.token, 42);
        assert_eq!(ack.status, Status::Ok);
    }

    #[test]
    fn ack_without_responder_is_silent() {
        CommandMsg::new(Opcode::GraphStart, Payload::Empty).ack(Status::Failed);
    }

    // --- payload access ---

    #[test]
    fn wrong_payload_is_malformed() {
        let msg = CommandMsg::new(Opcode::GraphStart, Payload::Empty);
        let err = msg.mgmt().unwrap_err();
        assert!(matches!(
            err,
            OlcError::MalformedPayload {
                expected: "graph-mgmt",
                found: "empty",
                ..
            }
        ));
        assert_eq!(err.status(), Status::BadParam);
    }

    #[test]
    fn param_word_reads_little_endian() {
        let p = ParamPayload::new(1, 2, vec![0x10, 0x27, 0, 0, 1]);
        assert_eq!(p.word(0), Some(10_000));
        assert_eq!(p.word(1), None);
    }

    #[test]
    fn opcode_display() {
        assert_eq!(Opcode::GraphOpen.to_string(), "GRAPH_OPEN");
        assert_eq!(Opcode::Other(0x1234).to_string(), "UNKNOWN(0x00001234)");
    }
}
