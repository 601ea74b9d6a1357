//! Interface to the satellite graph-management driver.
//!
//! The container never talks to the satellite processor directly. Every
//! mirrored command, data-port operation and data transfer goes through a
//! [`SatelliteDriver`]. The driver reports back on two kinds of queue:
//!
//! - the container's response queue ([`SatelliteResponse`]), handed over at
//!   [`init`](SatelliteDriver::init);
//! - each data port's event queue ([`SatDataEvent`]), handed over at port
//!   creation. It shares the owning external port's channel bit.
//!
//! [`ResponseKind`] names the completion slot a response is routed to.

use std::fmt;

use crate::channel::QueueHandle;
use crate::command::{GprPacket, GraphOpenPayload, ParamPayload};
use crate::error::{DriverError, Status};
use crate::ids::{CorrelationId, PortRef, SubGraphId};
use crate::media::{MediaFormat, Timestamp};
use crate::metadata::EosFlags;
use crate::port::PeerProperty;
use crate::topology::SgOp;

/// Handle of a satellite read or write data port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DataPortHandle(pub u32);

impl DataPortHandle {
    /// Driver-side port index.
    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

/// Completion slot a satellite response is routed to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResponseKind {
    /// Graph open.
    Open,
    /// Graph prepare.
    Prepare,
    /// Graph start.
    Start,
    /// Graph suspend.
    Suspend,
    /// Graph stop.
    Stop,
    /// Graph flush.
    Flush,
    /// Graph close.
    Close,
    /// Set/get config on the command path.
    SetGetCfg,
    /// Set/get config from a GPR packet.
    SetGetCfgPacked,
    /// Persistent register/deregister on the command path.
    Persistent,
    /// Persistent register/deregister from a GPR packet.
    PersistentPacked,
    /// Module event registration.
    EventReg,
}

impl ResponseKind {
    /// Every kind, in response-table order.
    pub const ALL: [ResponseKind; 12] = [
        ResponseKind::Open,
        ResponseKind::Prepare,
        ResponseKind::Start,
        ResponseKind::Suspend,
        ResponseKind::Stop,
        ResponseKind::Flush,
        ResponseKind::Close,
        ResponseKind::SetGetCfg,
        ResponseKind::SetGetCfgPacked,
        ResponseKind::Persistent,
        ResponseKind::PersistentPacked,
        ResponseKind::EventReg,
    ];

    /// Response kind for a sub-graph operation.
    pub fn for_sg_op(op: SgOp) -> Option<ResponseKind> {
        match op {
            SgOp::Prepare => Some(ResponseKind::Prepare),
            SgOp::Start => Some(ResponseKind::Start),
            SgOp::Suspend => Some(ResponseKind::Suspend),
            SgOp::Stop => Some(ResponseKind::Stop),
            SgOp::Flush => Some(ResponseKind::Flush),
            SgOp::Close => Some(ResponseKind::Close),
            SgOp::Disconnect => None,
        }
    }
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResponseKind::Open => "GRAPH_OPEN",
            ResponseKind::Prepare => "GRAPH_PREPARE",
            ResponseKind::Start => "GRAPH_START",
            ResponseKind::Suspend => "GRAPH_SUSPEND",
            ResponseKind::Stop => "GRAPH_STOP",
            ResponseKind::Flush => "GRAPH_FLUSH",
            ResponseKind::Close => "GRAPH_CLOSE",
            ResponseKind::SetGetCfg => "SET_GET_CFG",
            ResponseKind::SetGetCfgPacked => "SET_GET_CFG_PACKED",
            ResponseKind::Persistent => "PERSISTENT_CFG",
            ResponseKind::PersistentPacked => "PERSISTENT_CFG_PACKED",
            ResponseKind::EventReg => "EVENT_REG",
        };
        f.write_str(name)
    }
}

/// A response from the satellite to one dispatched command.
#[derive(Debug, Clone, PartialEq)]
pub struct SatelliteResponse {
    /// Correlation id of the command.
    pub id: CorrelationId,
    /// Completion slot.
    pub kind: ResponseKind,
    /// Satellite-side result.
    pub status: Status,
    /// Returned parameter payloads (get-cfg).
    pub params: Vec<ParamPayload>,
}

impl SatelliteResponse {
    /// Response without parameters.
    pub fn new(id: CorrelationId, kind: ResponseKind, status: Status) -> Self {
        Self {
            id,
            kind,
            status,
            params: Vec::new(),
        }
    }
}

/// Result of handing a command to the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Nothing was sent to the satellite (or it completed synchronously);
    /// no response will follow.
    Completed,
    /// A [`SatelliteResponse`] with the same id will arrive later.
    AwaitResponse,
}

/// Data read from the satellite read port.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SatReadData {
    /// Payload bytes.
    pub data: Vec<u8>,
    /// Timestamp of the first sample.
    pub timestamp: Option<Timestamp>,
    /// EOS rendered at the end of this chunk.
    pub eos: Option<EosFlags>,
}

/// Event posted by the driver on a data port's event queue.
#[derive(Debug, Clone, PartialEq)]
pub enum SatDataEvent {
    /// The satellite consumed `consumed` bytes of the last write.
    WriteDone {
        /// Bytes taken.
        consumed: usize,
    },
    /// The satellite consumed the last EOS written.
    EosDone,
    /// Data is available on a read port.
    ReadDone(SatReadData),
    /// The satellite output media format changed.
    MediaFormat {
        /// New format.
        fmt: MediaFormat,
        /// Buffer size the satellite needs; 0 lets the container compute it.
        required_buf_size: usize,
    },
    /// The satellite's neighbour module changed a port property.
    PeerProperty(PeerProperty),
}

/// A mirrored graph command.
#[derive(Debug, Clone, Copy)]
pub enum GraphCommand<'a> {
    /// Graph open with the full configuration.
    Open(&'a GraphOpenPayload),
    /// Sub-graph management operation.
    Mgmt {
        /// Operation.
        op: SgOp,
        /// Target sub-graphs.
        sub_graphs: &'a [SubGraphId],
    },
}

/// Everything the driver needs from the container, provided once.
#[derive(Debug, Clone)]
pub struct DriverContext {
    /// Container log id.
    pub log_id: u32,
    /// Container instance id.
    pub container_id: u32,
    /// Host processor domain id.
    pub host_domain_id: u32,
    /// Where satellite responses go.
    pub responses: QueueHandle<SatelliteResponse>,
}

/// Satellite graph-management driver.
///
/// Methods that return [`Dispatch`] never block on the satellite: either
/// they complete in place or a response follows on the response queue.
pub trait SatelliteDriver: Send {
    /// Connects the driver to the container.
    fn init(&mut self, ctx: DriverContext) -> Result<(), DriverError>;

    /// Releases driver resources. Safe to call more than once.
    fn deinit(&mut self);

    /// Creates the write data port behind an external input.
    fn create_write_port(
        &mut self,
        port: PortRef,
        events: QueueHandle<SatDataEvent>,
    ) -> Result<DataPortHandle, DriverError>;

    /// Configures a created write port.
    fn setup_write_port(&mut self, handle: DataPortHandle) -> Result<(), DriverError>;

    /// Creates the read data port behind an external output.
    fn create_read_port(
        &mut self,
        port: PortRef,
        events: QueueHandle<SatDataEvent>,
    ) -> Result<DataPortHandle, DriverError>;

    /// Configures a created read port.
    fn setup_read_port(&mut self, handle: DataPortHandle) -> Result<(), DriverError>;

    /// Destroys a write port.
    fn destroy_write_port(&mut self, handle: DataPortHandle);

    /// Destroys a read port.
    fn destroy_read_port(&mut self, handle: DataPortHandle);

    /// Discards data queued on a write port.
    fn flush_write_port(&mut self, handle: DataPortHandle, is_flush: bool, post_processing: bool);

    /// Discards data queued on a read port.
    fn flush_read_port(&mut self, handle: DataPortHandle, is_flush: bool, post_processing: bool);

    /// Tells the write port that its upstream stopped.
    fn process_upstream_stopped(&mut self, handle: DataPortHandle);

    /// Mirrors a graph command.
    fn send_graph_command(
        &mut self,
        id: CorrelationId,
        cmd: GraphCommand<'_>,
    ) -> Result<Dispatch, DriverError>;

    /// Sends set/get config parameters.
    fn send_cfg(
        &mut self,
        id: CorrelationId,
        is_set: bool,
        params: &[ParamPayload],
    ) -> Result<Dispatch, DriverError>;

    /// Sends persistent register/deregister parameters.
    fn send_persistent_cfg(
        &mut self,
        id: CorrelationId,
        register: bool,
        params: &[ParamPayload],
    ) -> Result<Dispatch, DriverError>;

    /// Forwards a packed GPR config packet.
    fn send_packed_cfg(
        &mut self,
        id: CorrelationId,
        kind: ResponseKind,
        packet: &GprPacket,
    ) -> Result<Dispatch, DriverError>;

    /// Forwards a module event registration.
    fn register_module_events(
        &mut self,
        id: CorrelationId,
        packet: &GprPacket,
    ) -> Result<Dispatch, DriverError>;

    /// Writes data to a write port. Consumption is reported by
    /// [`SatDataEvent::WriteDone`].
    fn write_data(
        &mut self,
        handle: DataPortHandle,
        data: &[u8],
        timestamp: Option<Timestamp>,
    ) -> Result<(), DriverError>;

    /// Writes an EOS. Consumption is reported by [`SatDataEvent::EosDone`].
    fn write_eos(&mut self, handle: DataPortHandle, flags: EosFlags) -> Result<(), DriverError>;

    /// Marks a data-flow gap on a write port.
    fn insert_data_flow_gap(&mut self, handle: DataPortHandle) -> Result<(), DriverError>;

    /// Sends the input media format on a write port.
    fn write_dl_pcd(&mut self, handle: DataPortHandle, fmt: &MediaFormat) -> Result<(), DriverError>;

    /// Asks a read port for more data.
    fn read_dl_pcd(&mut self, handle: DataPortHandle) -> Result<(), DriverError>;

    /// Informs a read port of the new local buffer size and count.
    fn recreate_output_buffers(
        &mut self,
        handle: DataPortHandle,
        buf_size: usize,
        count: u32,
    ) -> Result<(), DriverError>;

    /// Forwards a peer property to a data port.
    fn peer_port_property(&mut self, handle: DataPortHandle, prop: PeerProperty) -> Result<(), DriverError>;

    /// Forwards a control-port message to the satellite module.
    fn forward_ctrl_msg(&mut self, port: PortRef, data: &[u8]) -> Result<(), DriverError> {
        let _ = (port, data);
        Ok(())
    }

    /// Registers a delay path and returns the satellite-side delay in µs.
    fn query_path_delay(&mut self, path_id: u32) -> Result<u32, DriverError> {
        let _ = path_id;
        Ok(0)
    }

    /// Destroys a delay path; 0 destroys every path.
    fn destroy_path(&mut self, path_id: u32) -> Result<(), DriverError> {
        let _ = path_id;
        Ok(())
    }
}
