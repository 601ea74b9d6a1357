//! In-process stand-ins for the satellite, the power manager and peer
//! containers.
//!
//! [`LoopbackSatellite`] answers every command on the container's response
//! queue and reports data-port consumption on the port event queues, the
//! way a real graph-management driver would. All three types are `Clone`
//! and share their state, so a test keeps one copy for inspection and
//! hands the other to the container.

use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;

use crate::channel::{BitQueue, QueueHandle, WaitChannel};
use crate::command::{GprPacket, ParamPayload};
use crate::error::{DriverError, Status};
use crate::ids::{CorrelationId, PortRef, SubGraphId};
use crate::media::{MediaFormat, Timestamp};
use crate::metadata::EosFlags;
use crate::pm::{ClockVote, PowerVoter};
use crate::port::{DataMsg, DownstreamHandle, PeerCtrlMsg, PeerProperty, UpstreamHandle};
use crate::satellite::{
    DataPortHandle, Dispatch, DriverContext, GraphCommand, ResponseKind, SatDataEvent, SatReadData,
    SatelliteDriver, SatelliteResponse,
};
use crate::topology::SgOp;

/// When [`LoopbackSatellite`] answers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResponseMode {
    /// Commands complete in place; no response is queued.
    Inline,
    /// The response is queued right away and handled on a later dispatch.
    #[default]
    Deferred,
    /// Responses are held until [`LoopbackSatellite::deliver_held`] or
    /// [`LoopbackSatellite::respond`].
    Held,
}

/// A graph command as the satellite received it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SentGraphCommand {
    /// Open of these sub-graphs.
    Open(Vec<SubGraphId>),
    /// Management operation.
    Mgmt(SgOp, Vec<SubGraphId>),
}

#[derive(Debug)]
struct DataPort {
    port: PortRef,
    events: QueueHandle<SatDataEvent>,
}

#[derive(Debug, Default)]
struct SatState {
    ctx: Option<DriverContext>,
    mode: ResponseMode,
    no_auto_eos_done: bool,
    init_failure: bool,
    failures: BTreeMap<ResponseKind, Status>,
    path_delay_us: u32,
    next_handle: u32,
    write_ports: BTreeMap<u32, DataPort>,
    read_ports: BTreeMap<u32, DataPort>,
    held: Vec<SatelliteResponse>,
    graph_commands: Vec<SentGraphCommand>,
    cfg_sent: Vec<(bool, Vec<ParamPayload>)>,
    bytes_written: usize,
    eos_written: u32,
    gaps_inserted: u32,
    dl_pcd_writes: Vec<MediaFormat>,
    read_requests: u32,
    recreate_calls: u32,
    upstream_stopped_calls: u32,
    flush_calls: u32,
    destroyed_paths: Vec<u32>,
    ctrl_messages: Vec<(PortRef, Vec<u8>)>,
    forwarded_properties: Vec<(DataPortHandle, PeerProperty)>,
}

/// Loopback satellite driver.
#[derive(Debug, Clone, Default)]
pub struct LoopbackSatellite {
    state: Arc<Mutex<SatState>>,
}

impl LoopbackSatellite {
    /// Satellite answering every command successfully on the response queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects when responses are delivered.
    pub fn with_response_mode(self, mode: ResponseMode) -> Self {
        self.set_response_mode(mode);
        self
    }

    /// Controls whether a written EOS is reported consumed right away.
    pub fn with_auto_eos_done(self, on: bool) -> Self {
        self.state.lock().no_auto_eos_done = !on;
        self
    }

    /// Fails every response of `kind` with `status`.
    pub fn fail_kind(self, kind: ResponseKind, status: Status) -> Self {
        self.set_failure(kind, Some(status));
        self
    }

    /// Delay returned for path-delay queries.
    pub fn with_path_delay(self, delay_us: u32) -> Self {
        self.state.lock().path_delay_us = delay_us;
        self
    }

    /// Makes `init` fail.
    pub fn with_init_failure(self) -> Self {
        self.state.lock().init_failure = true;
        self
    }

    /// Changes the response mode of a running satellite.
    pub fn set_response_mode(&self, mode: ResponseMode) {
        self.state.lock().mode = mode;
    }

    /// Sets or clears the failure injected for `kind`.
    pub fn set_failure(&self, kind: ResponseKind, status: Option<Status>) {
        let mut st = self.state.lock();
        match status {
            Some(status) => st.failures.insert(kind, status),
            None => st.failures.remove(&kind),
        };
    }

    // --- held responses ---

    /// Held responses, oldest first.
    pub fn held(&self) -> Vec<(CorrelationId, ResponseKind)> {
        self.state.lock().held.iter().map(|r| (r.id, r.kind)).collect()
    }

    /// Queues every held response. Returns how many were queued.
    pub fn deliver_held(&self) -> usize {
        let mut st = self.state.lock();
        let held = std::mem::take(&mut st.held);
        let Some(ctx) = st.ctx.as_ref() else {
            return 0;
        };
        held.into_iter().filter(|r| ctx.responses.push(r.clone()).is_ok()).count()
    }

    /// Queues the held response `id` with `status` instead of its own.
    pub fn respond(&self, id: CorrelationId, status: Status) -> bool {
        let mut st = self.state.lock();
        let Some(i) = st.held.iter().position(|r| r.id == id) else {
            return false;
        };
        let mut rsp = st.held.remove(i);
        rsp.status = status;
        st.ctx.as_ref().is_some_and(|ctx| ctx.responses.push(rsp).is_ok())
    }

    /// Queues an arbitrary response, as a misbehaving transport would.
    pub fn inject_response(&self, rsp: SatelliteResponse) -> bool {
        self.state.lock().ctx.as_ref().is_some_and(|ctx| ctx.responses.push(rsp).is_ok())
    }

    // --- data ports ---

    /// Posts data on the read port behind `port`.
    pub fn push_read(&self, port: PortRef, data: SatReadData) -> bool {
        self.push_read_event(port, SatDataEvent::ReadDone(data))
    }

    /// Posts an event on the read port behind `port`.
    pub fn push_read_event(&self, port: PortRef, event: SatDataEvent) -> bool {
        let st = self.state.lock();
        st.read_ports
            .values()
            .find(|p| p.port == port)
            .is_some_and(|p| p.events.push(event).is_ok())
    }

    /// Posts an event on the write port behind `port`.
    pub fn push_write_event(&self, port: PortRef, event: SatDataEvent) -> bool {
        let st = self.state.lock();
        st.write_ports
            .values()
            .find(|p| p.port == port)
            .is_some_and(|p| p.events.push(event).is_ok())
    }

    // --- inspection ---

    /// Write ports alive.
    pub fn live_write_ports(&self) -> usize {
        self.state.lock().write_ports.len()
    }

    /// Read ports alive.
    pub fn live_read_ports(&self) -> usize {
        self.state.lock().read_ports.len()
    }

    /// Bytes written on all write ports.
    pub fn bytes_written(&self) -> usize {
        self.state.lock().bytes_written
    }

    /// EOS markers written.
    pub fn eos_written(&self) -> u32 {
        self.state.lock().eos_written
    }

    /// Data-flow gaps inserted.
    pub fn gaps_inserted(&self) -> u32 {
        self.state.lock().gaps_inserted
    }

    /// Input media formats sent on write ports.
    pub fn dl_pcd_writes(&self) -> Vec<MediaFormat> {
        self.state.lock().dl_pcd_writes.clone()
    }

    /// Read requests issued.
    pub fn read_requests(&self) -> u32 {
        self.state.lock().read_requests
    }

    /// Output buffer recreations announced.
    pub fn recreate_calls(&self) -> u32 {
        self.state.lock().recreate_calls
    }

    /// Upstream-stopped notifications.
    pub fn upstream_stopped_calls(&self) -> u32 {
        self.state.lock().upstream_stopped_calls
    }

    /// Data-port flushes.
    pub fn flush_calls(&self) -> u32 {
        self.state.lock().flush_calls
    }

    /// Graph commands received, in order.
    pub fn graph_commands(&self) -> Vec<SentGraphCommand> {
        self.state.lock().graph_commands.clone()
    }

    /// Set/get config parameters received, with `is_set`.
    pub fn cfg_sent(&self) -> Vec<(bool, Vec<ParamPayload>)> {
        self.state.lock().cfg_sent.clone()
    }

    /// Control-port messages forwarded.
    pub fn ctrl_messages(&self) -> Vec<(PortRef, Vec<u8>)> {
        self.state.lock().ctrl_messages.clone()
    }

    /// Peer properties forwarded to data ports.
    pub fn forwarded_properties(&self) -> Vec<(DataPortHandle, PeerProperty)> {
        self.state.lock().forwarded_properties.clone()
    }

    /// Paths destroyed.
    pub fn destroyed_paths(&self) -> Vec<u32> {
        self.state.lock().destroyed_paths.clone()
    }

    /// `init` has run and `deinit` has not.
    pub fn is_initialised(&self) -> bool {
        self.state.lock().ctx.is_some()
    }

    fn answer(&self, id: CorrelationId, kind: ResponseKind, params: Vec<ParamPayload>) -> Result<Dispatch, DriverError> {
        let mut st = self.state.lock();
        let status = st.failures.get(&kind).copied().unwrap_or(Status::Ok);
        let ctx = st.ctx.as_ref().ok_or(DriverError::NotInitialised)?;
        let rsp = SatelliteResponse {
            id,
            kind,
            status,
            params,
        };
        match st.mode {
            ResponseMode::Inline if status.is_ok() => Ok(Dispatch::Completed),
            ResponseMode::Inline => Err(DriverError::Rejected(status)),
            ResponseMode::Deferred => {
                ctx.responses.push(rsp).map_err(|_| DriverError::Transport)?;
                Ok(Dispatch::AwaitResponse)
            }
            ResponseMode::Held => {
                st.held.push(rsp);
                Ok(Dispatch::AwaitResponse)
            }
        }
    }

    fn create_port(&self, read: bool, port: PortRef, events: QueueHandle<SatDataEvent>) -> DataPortHandle {
        let mut st = self.state.lock();
        st.next_handle += 1;
        let handle = st.next_handle;
        let ports = if read { &mut st.read_ports } else { &mut st.write_ports };
        ports.insert(handle, DataPort { port, events });
        DataPortHandle(handle)
    }
}

impl SatelliteDriver for LoopbackSatellite {
    fn init(&mut self, ctx: DriverContext) -> Result<(), DriverError> {
        let mut st = self.state.lock();
        if st.init_failure {
            return Err(DriverError::Transport);
        }
        st.ctx = Some(ctx);
        Ok(())
    }

    fn deinit(&mut self) {
        let mut st = self.state.lock();
        st.ctx = None;
        st.held.clear();
    }

    fn create_write_port(
        &mut self,
        port: PortRef,
        events: QueueHandle<SatDataEvent>,
    ) -> Result<DataPortHandle, DriverError> {
        Ok(self.create_port(false, port, events))
    }

    fn setup_write_port(&mut self, handle: DataPortHandle) -> Result<(), DriverError> {
        if self.state.lock().write_ports.contains_key(&handle.0) {
            Ok(())
        } else {
            Err(DriverError::UnknownPort(handle.0))
        }
    }

    fn create_read_port(
        &mut self,
        port: PortRef,
        events: QueueHandle<SatDataEvent>,
    ) -> Result<DataPortHandle, DriverError> {
        Ok(self.create_port(true, port, events))
    }

    fn setup_read_port(&mut self, handle: DataPortHandle) -> Result<(), DriverError> {
        if self.state.lock().read_ports.contains_key(&handle.0) {
            Ok(())
        } else {
            Err(DriverError::UnknownPort(handle.0))
        }
    }

    fn destroy_write_port(&mut self, handle: DataPortHandle) {
        self.state.lock().write_ports.remove(&handle.0);
    }

    fn destroy_read_port(&mut self, handle: DataPortHandle) {
        self.state.lock().read_ports.remove(&handle.0);
    }

    fn flush_write_port(&mut self, _handle: DataPortHandle, _is_flush: bool, _post_processing: bool) {
        self.state.lock().flush_calls += 1;
    }

    fn flush_read_port(&mut self, _handle: DataPortHandle, _is_flush: bool, _post_processing: bool) {
        self.state.lock().flush_calls += 1;
    }

    fn process_upstream_stopped(&mut self, _handle: DataPortHandle) {
        self.state.lock().upstream_stopped_calls += 1;
    }

    fn send_graph_command(&mut self, id: CorrelationId, cmd: GraphCommand<'_>) -> Result<Dispatch, DriverError> {
        let (kind, sent) = match cmd {
            GraphCommand::Open(open) => (
                ResponseKind::Open,
                SentGraphCommand::Open(open.sub_graphs.iter().map(|sg| sg.id).collect()),
            ),
            GraphCommand::Mgmt { op, sub_graphs } => {
                let kind = ResponseKind::for_sg_op(op).ok_or(DriverError::Rejected(Status::Unsupported))?;
                (kind, SentGraphCommand::Mgmt(op, sub_graphs.to_vec()))
            }
        };
        self.state.lock().graph_commands.push(sent);
        self.answer(id, kind, Vec::new())
    }

    fn send_cfg(&mut self, id: CorrelationId, is_set: bool, params: &[ParamPayload]) -> Result<Dispatch, DriverError> {
        self.state.lock().cfg_sent.push((is_set, params.to_vec()));
        let echoed = if is_set { Vec::new() } else { params.to_vec() };
        self.answer(id, ResponseKind::SetGetCfg, echoed)
    }

    fn send_persistent_cfg(
        &mut self,
        id: CorrelationId,
        _register: bool,
        _params: &[ParamPayload],
    ) -> Result<Dispatch, DriverError> {
        self.answer(id, ResponseKind::Persistent, Vec::new())
    }

    fn send_packed_cfg(&mut self, id: CorrelationId, kind: ResponseKind, packet: &GprPacket) -> Result<Dispatch, DriverError> {
        self.answer(id, kind, packet.params.clone())
    }

    fn register_module_events(&mut self, id: CorrelationId, _packet: &GprPacket) -> Result<Dispatch, DriverError> {
        self.answer(id, ResponseKind::EventReg, Vec::new())
    }

    fn write_data(
        &mut self,
        handle: DataPortHandle,
        data: &[u8],
        _timestamp: Option<Timestamp>,
    ) -> Result<(), DriverError> {
        let mut st = self.state.lock();
        let port = st.write_ports.get(&handle.0).ok_or(DriverError::UnknownPort(handle.0))?;
        port.events
            .push(SatDataEvent::WriteDone { consumed: data.len() })
            .map_err(|_| DriverError::Transport)?;
        st.bytes_written += data.len();
        Ok(())
    }

    fn write_eos(&mut self, handle: DataPortHandle, _flags: EosFlags) -> Result<(), DriverError> {
        let mut st = self.state.lock();
        let port = st.write_ports.get(&handle.0).ok_or(DriverError::UnknownPort(handle.0))?;
        if !st.no_auto_eos_done {
            port.events.push(SatDataEvent::EosDone).map_err(|_| DriverError::Transport)?;
        }
        st.eos_written += 1;
        Ok(())
    }

    fn insert_data_flow_gap(&mut self, handle: DataPortHandle) -> Result<(), DriverError> {
        let mut st = self.state.lock();
        if !st.write_ports.contains_key(&handle.0) {
            return Err(DriverError::UnknownPort(handle.0));
        }
        st.gaps_inserted += 1;
        Ok(())
    }

    fn write_dl_pcd(&mut self, handle: DataPortHandle, fmt: &MediaFormat) -> Result<(), DriverError> {
        let mut st = self.state.lock();
        if !st.write_ports.contains_key(&handle.0) {
            return Err(DriverError::UnknownPort(handle.0));
        }
        st.dl_pcd_writes.push(*fmt);
        Ok(())
    }

    fn read_dl_pcd(&mut self, handle: DataPortHandle) -> Result<(), DriverError> {
        let mut st = self.state.lock();
        if !st.read_ports.contains_key(&handle.0) {
            return Err(DriverError::UnknownPort(handle.0));
        }
        st.read_requests += 1;
        Ok(())
    }

    fn recreate_output_buffers(&mut self, _handle: DataPortHandle, _buf_size: usize, _count: u32) -> Result<(), DriverError> {
        self.state.lock().recreate_calls += 1;
        Ok(())
    }

    fn peer_port_property(&mut self, handle: DataPortHandle, prop: PeerProperty) -> Result<(), DriverError> {
        self.state.lock().forwarded_properties.push((handle, prop));
        Ok(())
    }

    fn forward_ctrl_msg(&mut self, port: PortRef, data: &[u8]) -> Result<(), DriverError> {
        self.state.lock().ctrl_messages.push((port, data.to_vec()));
        Ok(())
    }

    fn query_path_delay(&mut self, _path_id: u32) -> Result<u32, DriverError> {
        Ok(self.state.lock().path_delay_us)
    }

    fn destroy_path(&mut self, path_id: u32) -> Result<(), DriverError> {
        self.state.lock().destroyed_paths.push(path_id);
        Ok(())
    }
}

/// One request seen by [`RecordingVoter`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PmRecord {
    /// Clock and bandwidth vote.
    Clock(ClockVote),
    /// Latency vote.
    Latency(u32),
    /// Thread priority change.
    Priority(i32),
}

/// Power voter that records every request.
#[derive(Debug, Clone, Default)]
pub struct RecordingVoter {
    records: Arc<Mutex<Vec<PmRecord>>>,
}

impl RecordingVoter {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded, in order.
    pub fn records(&self) -> Vec<PmRecord> {
        self.records.lock().clone()
    }

    /// Clock votes, in order.
    pub fn clock_votes(&self) -> Vec<ClockVote> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                PmRecord::Clock(v) => Some(*v),
                _ => None,
            })
            .collect()
    }

    /// Most recent clock vote.
    pub fn last_clock(&self) -> Option<ClockVote> {
        self.clock_votes().last().copied()
    }

    /// Latency votes, in order.
    pub fn latency_votes(&self) -> Vec<u32> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                PmRecord::Latency(l) => Some(*l),
                _ => None,
            })
            .collect()
    }

    /// Priority changes, in order.
    pub fn priorities(&self) -> Vec<i32> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match r {
                PmRecord::Priority(p) => Some(*p),
                _ => None,
            })
            .collect()
    }

    /// Forgets everything recorded.
    pub fn clear(&self) {
        self.records.lock().clear();
    }
}

impl PowerVoter for RecordingVoter {
    fn vote_clock(&mut self, vote: ClockVote) {
        self.records.lock().push(PmRecord::Clock(vote));
    }

    fn vote_latency(&mut self, latency_us: u32) {
        self.records.lock().push(PmRecord::Latency(latency_us));
    }

    fn set_thread_priority(&mut self, priority: i32) {
        self.records.lock().push(PmRecord::Priority(priority));
    }
}

/// A peer container endpoint: an input data queue and a command queue.
#[derive(Debug)]
pub struct PeerEndpoint {
    _channel: Arc<WaitChannel>,
    data: BitQueue<DataMsg>,
    ctrl_tx: Sender<PeerCtrlMsg>,
    ctrl_rx: Receiver<PeerCtrlMsg>,
}

impl PeerEndpoint {
    /// Endpoint with room for `capacity` messages on each queue.
    pub fn new(capacity: usize) -> Self {
        let channel = WaitChannel::new();
        let data = BitQueue::new("PEER", capacity, 1, &channel);
        let (ctrl_tx, ctrl_rx) = bounded(capacity);
        Self {
            _channel: channel,
            data,
            ctrl_tx,
            ctrl_rx,
        }
    }

    /// Handles for a local output whose downstream is this peer.
    pub fn downstream_handle(&self) -> DownstreamHandle {
        DownstreamHandle {
            data: self.data.handle(),
            cmd: self.ctrl_tx.clone(),
        }
    }

    /// Handle for a local input whose upstream is this peer.
    pub fn upstream_handle(&self) -> UpstreamHandle {
        UpstreamHandle {
            cmd: self.ctrl_tx.clone(),
        }
    }

    /// Next data message, if any.
    pub fn try_recv_data(&self) -> Option<DataMsg> {
        self.data.pop()
    }

    /// Next control message, if any.
    pub fn try_recv_ctrl(&self) -> Option<PeerCtrlMsg> {
        self.ctrl_rx.try_recv().ok()
    }

    /// Data messages waiting.
    pub fn data_len(&self) -> usize {
        self.data.len()
    }
}
