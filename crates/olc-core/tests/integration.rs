//! Integration tests for the offload container.
//!
//! Every test drives a real [`Olc`] through its command queue against the
//! loopback satellite, stepping the dispatcher with `run_until_idle` and
//! checking the acks, the container report and what the satellite saw.

use crossbeam_channel::{Receiver, Sender, unbounded};
use olc_core::sim::{LoopbackSatellite, PeerEndpoint, RecordingVoter, ResponseMode, SentGraphCommand};
use olc_core::{
    CMD_BIT, CmdAck, CommandMsg, DataBuffer, DataMsg, DownstreamIcb, EosFlags, GprPacket, GraphMgmtPayload,
    GraphOpenPayload, Metadata, ModuleCfg, ModuleEvent, ModuleId, Olc, OlcHandle, OlcParams, Opcode,
    PARAM_ID_GET_PROF_INFO, PARAM_ID_PATH_DELAY, PARAM_ID_PROC_DURATION, PARAM_ID_VOICE_SESSION_INFO,
    ParamPayload, Payload, PeerCtrlMsg, PeerLink, PeerProperty, PerfMode, PortProperty, PortRef, PortState,
    ResponseKind, SYSTEM_Q_BIT, SatDataEvent, SatReadData, SatellitePacket, SatelliteResponse, ServiceStatus,
    SgState, Status, SubGraphCfg, SubGraphId, SystemMsg,
};

const CONTAINER_ID: u32 = 0x4000;
const SG1: SubGraphId = SubGraphId(1);
const SG2: SubGraphId = SubGraphId(2);
const IN: PortRef = PortRef::new(0x10, 1);
const OUT: PortRef = PortRef::new(0x20, 1);
const CTRL: PortRef = PortRef::new(0x20, 9);

// ============================================================================
// Harness
// ============================================================================

struct Rig {
    olc: Olc,
    sat: LoopbackSatellite,
    pm: RecordingVoter,
    handle: OlcHandle,
    tx: Sender<CmdAck>,
    rx: Receiver<CmdAck>,
}

impl Rig {
    fn new() -> Self {
        Self::with_satellite(LoopbackSatellite::new())
    }

    fn with_satellite(sat: LoopbackSatellite) -> Self {
        let pm = RecordingVoter::new();
        let params = OlcParams::default().with_log_id(7).with_container_id(CONTAINER_ID);
        let olc = Olc::create(params, Box::new(sat.clone()), Box::new(pm.clone())).unwrap();
        let handle = olc.handle();
        let (tx, rx) = unbounded();
        Self {
            olc,
            sat,
            pm,
            handle,
            tx,
            rx,
        }
    }

    fn post(&self, opcode: Opcode, payload: Payload) {
        let cmd = CommandMsg::new(opcode, payload).with_token(0xAB).with_responder(self.tx.clone());
        self.handle.send(cmd).unwrap();
    }

    /// Sends a command and returns its ack.
    fn cmd(&mut self, opcode: Opcode, payload: Payload) -> CmdAck {
        self.post(opcode, payload);
        self.olc.run_until_idle();
        self.rx.try_recv().expect("command was not acked")
    }

    /// Sends a command that must stay parked.
    fn park(&mut self, opcode: Opcode, payload: Payload) {
        self.post(opcode, payload);
        self.olc.run_until_idle();
        assert!(self.rx.try_recv().is_err(), "{opcode} should be waiting for the satellite");
    }

    fn next_ack(&mut self) -> CmdAck {
        self.olc.run_until_idle();
        self.rx.try_recv().expect("no ack")
    }

    fn mgmt(&mut self, opcode: Opcode, sub_graphs: &[SubGraphId], ports: &[PortRef]) -> Status {
        self.cmd(opcode, mgmt(sub_graphs, ports)).status
    }

    fn system(&mut self, msg: SystemMsg) {
        self.handle.send_system(msg).unwrap();
        self.olc.run_until_idle();
    }

    /// SG1 (low latency) with one input on module 0x10 and one output on
    /// module 0x20.
    fn open_basic(&mut self) {
        let open = open(&[(1, PerfMode::LowLatency)], &[(0x10, 1), (0x20, 1)], &[IN], &[OUT]);
        assert_eq!(self.cmd(Opcode::GraphOpen, Payload::GraphOpen(open)).status, Status::Ok);
    }

    fn connect_peers(&mut self, down: &PeerEndpoint, up: &PeerEndpoint) {
        let links = vec![
            PeerLink::Downstream {
                port: OUT,
                peer: down.downstream_handle(),
            },
            PeerLink::Upstream {
                port: IN,
                peer: up.upstream_handle(),
            },
        ];
        assert_eq!(self.cmd(Opcode::GraphConnect, Payload::Connect(links)).status, Status::Ok);
    }

    fn start_basic(&mut self) {
        assert_eq!(self.mgmt(Opcode::GraphPrepare, &[SG1], &[]), Status::Ok);
        assert_eq!(self.mgmt(Opcode::GraphStart, &[SG1], &[]), Status::Ok);
    }

    fn push_input(&self, msg: DataMsg) {
        self.olc.ext_in_port(IN).unwrap().data_handle().push(msg).unwrap();
    }

    /// Marks the upstream of IN as real-time.
    fn rt_upstream(&mut self) {
        let prop = PeerProperty::flag(PortProperty::IsUpstreamRt, true);
        let ack = self.cmd(
            Opcode::PeerPortPropertyUpdate,
            Payload::PeerProperty {
                port: IN,
                props: vec![prop],
            },
        );
        assert_eq!(ack.status, Status::Ok);
    }
}

fn open(
    sub_graphs: &[(u32, PerfMode)],
    modules: &[(u32, u32)],
    inputs: &[PortRef],
    outputs: &[PortRef],
) -> GraphOpenPayload {
    GraphOpenPayload {
        sub_graphs: sub_graphs
            .iter()
            .map(|&(id, perf_mode)| SubGraphCfg {
                id: SubGraphId(id),
                perf_mode,
            })
            .collect(),
        modules: modules
            .iter()
            .map(|&(id, sg)| ModuleCfg {
                id: ModuleId(id),
                sub_graph: SubGraphId(sg),
            })
            .collect(),
        ext_inputs: inputs.to_vec(),
        ext_outputs: outputs.to_vec(),
        ext_ctrl: Vec::new(),
    }
}

fn mgmt(sub_graphs: &[SubGraphId], ports: &[PortRef]) -> Payload {
    Payload::GraphMgmt(GraphMgmtPayload {
        sub_graphs: sub_graphs.to_vec(),
        ports: ports.to_vec(),
    })
}

fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

// ============================================================================
// 1. Graph lifecycle
// ============================================================================

#[test]
fn open_mirrors_to_satellite_and_creates_ports() {
    let mut rig = Rig::new();
    let free = rig.olc.free_bits();
    rig.open_basic();

    assert_eq!(rig.sat.graph_commands(), vec![SentGraphCommand::Open(vec![SG1])]);
    assert_eq!(rig.sat.live_write_ports(), 1);
    assert_eq!(rig.sat.live_read_ports(), 1);
    assert_eq!(rig.olc.free_bits(), free - 2);
    assert_eq!(rig.olc.sub_graph_state(SG1), Some(SgState::Stopped));
    assert_eq!(rig.olc.ext_in_port(IN).unwrap().state(), PortState::Stopped);
    assert_eq!(rig.olc.pending_len(), 0);
    assert_ne!(rig.olc.curr_chan_mask() & CMD_BIT, 0);
}

#[test]
fn full_lifecycle_ends_in_self_destroy() {
    let mut rig = Rig::new();
    rig.open_basic();
    rig.start_basic();
    assert!(rig.olc.is_started());
    assert_eq!(rig.olc.ext_out_port(OUT).unwrap().state(), PortState::Started);

    assert_eq!(rig.mgmt(Opcode::GraphStop, &[SG1], &[]), Status::Ok);
    assert!(!rig.olc.is_started());
    assert_eq!(rig.olc.sub_graph_state(SG1), Some(SgState::Stopped));

    assert_eq!(rig.mgmt(Opcode::GraphClose, &[SG1], &[]), Status::Terminated);
    assert!(rig.olc.is_terminated());
    assert_eq!(rig.sat.live_write_ports(), 0);
    assert_eq!(rig.sat.live_read_ports(), 0);
    assert!(!rig.sat.is_initialised());
    assert_eq!(
        rig.sat.graph_commands().last(),
        Some(&SentGraphCommand::Mgmt(olc_core::SgOp::Close, vec![SG1]))
    );
}

#[test]
fn closing_one_of_two_sub_graphs_keeps_the_container() {
    let mut rig = Rig::new();
    let open = open(
        &[(1, PerfMode::LowPower), (2, PerfMode::LowPower)],
        &[(0x10, 1), (0x20, 2)],
        &[IN],
        &[OUT],
    );
    assert_eq!(rig.cmd(Opcode::GraphOpen, Payload::GraphOpen(open)).status, Status::Ok);
    assert_eq!(rig.mgmt(Opcode::GraphClose, &[SG2], &[]), Status::Ok);
    assert!(!rig.olc.is_terminated());
    assert_eq!(rig.olc.num_sub_graphs(), 1);
    assert!(rig.olc.ext_out_port(OUT).is_none());
    assert!(rig.olc.ext_in_port(IN).is_some());
    assert_eq!(rig.sat.live_read_ports(), 0);
}

#[test]
fn management_of_unknown_sub_graphs_completes_locally() {
    let mut rig = Rig::new();
    rig.open_basic();
    let sent = rig.sat.graph_commands().len();
    assert_eq!(rig.mgmt(Opcode::GraphStart, &[SubGraphId(99)], &[]), Status::Ok);
    assert_eq!(rig.sat.graph_commands().len(), sent);
}

#[test]
fn destroy_container_acks_terminated_including_queued_commands() {
    let mut rig = Rig::new();
    rig.open_basic();
    rig.post(Opcode::DestroyContainer, Payload::Empty);
    rig.post(Opcode::GraphStart, mgmt(&[SG1], &[]));
    rig.olc.run_until_idle();
    let acks: Vec<_> = rig.rx.try_iter().collect();
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[0].opcode, Opcode::GraphStart);
    assert_eq!(acks[1].opcode, Opcode::DestroyContainer);
    assert!(acks.iter().all(|a| a.status == Status::Terminated));
    assert_eq!(rig.olc.curr_chan_mask(), 0);
}

#[test]
fn unknown_opcode_is_unsupported_and_echoes_token() {
    let mut rig = Rig::new();
    let ack = rig.cmd(Opcode::Other(0x77), Payload::Empty);
    assert_eq!(ack.status, Status::Unsupported);
    assert_eq!(ack.token, 0xAB);
}

#[test]
fn malformed_payload_is_bad_param() {
    let mut rig = Rig::new();
    assert_eq!(rig.cmd(Opcode::GraphStart, Payload::Empty).status, Status::BadParam);
    assert_eq!(rig.cmd(Opcode::GraphOpen, Payload::Empty).status, Status::BadParam);
}

#[test]
fn commands_are_serialized_while_one_is_parked() {
    let mut rig = Rig::with_satellite(LoopbackSatellite::new().with_response_mode(ResponseMode::Held));
    let open = open(&[(1, PerfMode::LowPower)], &[(0x10, 1)], &[IN], &[]);
    rig.park(Opcode::GraphOpen, Payload::GraphOpen(open));
    assert_eq!(rig.olc.curr_chan_mask() & CMD_BIT, 0);

    rig.post(Opcode::GraphPrepare, mgmt(&[SG1], &[]));
    rig.olc.run_until_idle();
    assert_eq!(rig.sat.graph_commands().len(), 1);

    assert_eq!(rig.sat.deliver_held(), 1);
    rig.olc.run_until_idle();
    let acks: Vec<_> = rig.rx.try_iter().collect();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].opcode, Opcode::GraphOpen);
    assert_eq!(rig.sat.graph_commands().len(), 2);
    rig.sat.deliver_held();
    assert_eq!(rig.next_ack().opcode, Opcode::GraphPrepare);
}

// ============================================================================
// 2. Satellite failures
// ============================================================================

#[test]
fn satellite_open_failure_unwinds_everything() {
    let mut rig = Rig::with_satellite(LoopbackSatellite::new().fail_kind(ResponseKind::Open, Status::Failed));
    let free = rig.olc.free_bits();
    let open = open(&[(1, PerfMode::LowLatency)], &[(0x10, 1), (0x20, 1)], &[IN], &[OUT]);
    assert_eq!(rig.cmd(Opcode::GraphOpen, Payload::GraphOpen(open)).status, Status::Failed);
    assert_eq!(rig.olc.num_sub_graphs(), 0);
    assert_eq!(rig.olc.free_bits(), free);
    assert_eq!(rig.sat.live_write_ports(), 0);
    assert_eq!(rig.sat.live_read_ports(), 0);
}

#[test]
fn refused_start_restores_prepared_state_without_voting() {
    let mut rig = Rig::with_satellite(LoopbackSatellite::new().fail_kind(ResponseKind::Start, Status::Failed));
    rig.open_basic();
    rig.rt_upstream();
    assert_eq!(rig.mgmt(Opcode::GraphPrepare, &[SG1], &[]), Status::Ok);
    let mask = rig.olc.curr_chan_mask();
    let votes = rig.pm.clock_votes().len();
    let priorities = rig.pm.priorities().len();

    assert_eq!(rig.mgmt(Opcode::GraphStart, &[SG1], &[]), Status::Failed);
    assert!(!rig.olc.is_started());
    assert_eq!(rig.olc.sub_graph_state(SG1), Some(SgState::Prepared));
    assert_eq!(rig.olc.ext_in_port(IN).unwrap().state(), PortState::Prepared);
    assert_eq!(rig.olc.ext_out_port(OUT).unwrap().state(), PortState::Prepared);
    assert_eq!(rig.pm.clock_votes().len(), votes, "{:?}", rig.pm.clock_votes());
    assert_eq!(rig.pm.priorities().len(), priorities);
    assert_eq!(rig.olc.curr_chan_mask(), mask);
    assert_eq!(mask & rig.olc.ext_in_port(IN).unwrap().bit(), 0);

    rig.sat.set_failure(ResponseKind::Start, None);
    assert_eq!(rig.mgmt(Opcode::GraphStart, &[SG1], &[]), Status::Ok);
    assert!(rig.olc.is_started());
    assert_ne!(rig.olc.curr_chan_mask() & rig.olc.ext_in_port(IN).unwrap().bit(), 0);
    assert!(!rig.pm.last_clock().unwrap().release);
}

#[test]
fn refused_start_from_stopped_goes_back_to_stopped() {
    let mut rig = Rig::with_satellite(LoopbackSatellite::new().fail_kind(ResponseKind::Start, Status::NoMemory));
    rig.open_basic();
    assert_eq!(rig.mgmt(Opcode::GraphStart, &[SG1], &[]), Status::NoMemory);
    assert_eq!(rig.olc.sub_graph_state(SG1), Some(SgState::Stopped));
    assert_eq!(rig.olc.ext_in_port(IN).unwrap().state(), PortState::Stopped);
    assert!(rig.pm.clock_votes().is_empty());
}

#[test]
fn refused_stop_still_stops_locally_and_releases() {
    let mut rig = Rig::with_satellite(LoopbackSatellite::new().fail_kind(ResponseKind::Stop, Status::Failed));
    rig.open_basic();
    rig.rt_upstream();
    rig.start_basic();
    assert!(rig.olc.is_started());
    assert!(!rig.pm.last_clock().unwrap().release);

    assert_eq!(rig.mgmt(Opcode::GraphStop, &[SG1], &[]), Status::Failed);
    assert!(!rig.olc.is_started());
    assert_eq!(rig.olc.sub_graph_state(SG1), Some(SgState::Stopped));
    assert_eq!(rig.olc.ext_in_port(IN).unwrap().state(), PortState::Stopped);
    assert_eq!(rig.olc.curr_chan_mask() & rig.olc.ext_in_port(IN).unwrap().bit(), 0);
    assert!(rig.pm.last_clock().unwrap().release);
    assert_eq!(rig.olc.pm_state().cntr_kpps, 0);
}

#[test]
fn refused_prepare_is_reported_without_a_vote() {
    let mut rig = Rig::with_satellite(LoopbackSatellite::new().fail_kind(ResponseKind::Prepare, Status::Failed));
    rig.open_basic();
    let down = PeerEndpoint::new(8);
    let up = PeerEndpoint::new(8);
    rig.connect_peers(&down, &up);
    let fmt = olc_core::MediaFormat::pcm(48_000, 2, 16);
    assert_eq!(rig.cmd(Opcode::MediaFormat, Payload::MediaFormat { port: IN, fmt }).status, Status::Ok);
    assert_eq!(rig.mgmt(Opcode::GraphPrepare, &[SG1], &[]), Status::Failed);
    assert!(rig.pm.clock_votes().iter().all(|v| v.release), "{:?}", rig.pm.clock_votes());
    assert_eq!(rig.olc.pm_state().cntr_kpps, 0);
}

#[test]
fn bit_pool_exhaustion_fails_open_with_no_resource() {
    let mut rig = Rig::new();
    let free = rig.olc.free_bits();
    let inputs: Vec<PortRef> = (0..30).map(|i| PortRef::new(0x10, i)).collect();
    let open = open(&[(1, PerfMode::LowPower)], &[(0x10, 1)], &inputs, &[]);
    assert_eq!(rig.cmd(Opcode::GraphOpen, Payload::GraphOpen(open)).status, Status::NoResource);
    assert_eq!(rig.olc.free_bits(), free);
    assert_eq!(rig.sat.live_write_ports(), 0);
    assert!(rig.sat.graph_commands().is_empty());
}

#[test]
fn reopening_an_open_sub_graph_leaves_the_first_alone() {
    let mut rig = Rig::new();
    rig.open_basic();
    let again = open(&[(1, PerfMode::LowLatency)], &[], &[], &[]);
    assert_eq!(rig.cmd(Opcode::GraphOpen, Payload::GraphOpen(again)).status, Status::Failed);
    assert_eq!(rig.olc.num_sub_graphs(), 1);
    assert!(rig.olc.ext_in_port(IN).is_some());
}

// ============================================================================
// 3. Frame size (Scenario A, P2)
// ============================================================================

#[test]
fn mixed_perf_modes_pick_the_smallest_frame() {
    let mut rig = Rig::new();
    let open = open(&[(1, PerfMode::LowLatency), (2, PerfMode::LowPower)], &[], &[], &[]);
    assert_eq!(rig.cmd(Opcode::GraphOpen, Payload::GraphOpen(open)).status, Status::Ok);
    assert_eq!(rig.olc.configured_frame_size_us(), 1000);
}

#[test]
fn later_larger_frame_does_not_raise_it() {
    let mut rig = Rig::new();
    let ll = open(&[(1, PerfMode::LowLatency)], &[], &[], &[]);
    let lp = open(&[(2, PerfMode::LowPower)], &[], &[], &[]);
    rig.cmd(Opcode::GraphOpen, Payload::GraphOpen(ll));
    rig.cmd(Opcode::GraphOpen, Payload::GraphOpen(lp));
    assert_eq!(rig.olc.configured_frame_size_us(), 1000);
}

// ============================================================================
// 4. Stop/flush semantics (Scenario C)
// ============================================================================

#[test]
fn stop_with_running_peer_keeps_input_queue() {
    let mut rig = Rig::new();
    rig.open_basic();
    assert_eq!(rig.mgmt(Opcode::GraphPrepare, &[SG1], &[IN]), Status::Ok);
    assert_eq!(rig.olc.ext_in_port(IN).unwrap().connected_state(), PortState::Prepared);

    rig.push_input(DataMsg::Buffer(DataBuffer::filled(vec![1; 16])));
    rig.push_input(DataMsg::Buffer(DataBuffer::filled(vec![2; 16])));
    rig.olc.run_until_idle();

    assert_eq!(rig.mgmt(Opcode::GraphStop, &[SG1], &[]), Status::Ok);
    let port = rig.olc.ext_in_port(IN).unwrap();
    assert_eq!(port.state(), PortState::Stopped);
    assert_eq!(port.queued(), 2);

    assert_eq!(rig.mgmt(Opcode::GraphStop, &[], &[IN]), Status::Ok);
    assert_eq!(rig.olc.ext_in_port(IN).unwrap().queued(), 0);
}

#[test]
fn flush_keeps_media_format_but_drops_buffers() {
    let mut rig = Rig::new();
    rig.open_basic();
    rig.push_input(DataMsg::MediaFormat(olc_core::MediaFormat::pcm(48_000, 2, 16)));
    rig.push_input(DataMsg::Buffer(DataBuffer::filled(vec![0; 8])));
    assert_eq!(rig.mgmt(Opcode::GraphFlush, &[SG1], &[]), Status::Ok);
    assert_eq!(rig.olc.ext_in_port(IN).unwrap().queued(), 1);
    assert!(rig.sat.flush_calls() >= 2);
}

#[test]
fn disconnect_clears_peer_handles() {
    let mut rig = Rig::new();
    rig.open_basic();
    let down = PeerEndpoint::new(8);
    let up = PeerEndpoint::new(8);
    rig.connect_peers(&down, &up);
    assert_eq!(rig.mgmt(Opcode::GraphDisconnect, &[], &[IN, OUT]), Status::Ok);
    assert_eq!(rig.olc.ext_in_port(IN).unwrap().connected_state(), PortState::Invalid);
    assert_eq!(rig.olc.ext_out_port(OUT).unwrap().connected_state(), PortState::Invalid);

    let fmt = olc_core::MediaFormat::pcm(48_000, 1, 16);
    let ack = rig.cmd(Opcode::MediaFormat, Payload::MediaFormat { port: IN, fmt });
    assert_eq!(ack.status, Status::Ok);
    assert!(!rig.olc.ext_in_port(IN).unwrap().flags().pending_mf);
}

// ============================================================================
// 5. Data path
// ============================================================================

#[test]
fn input_buffers_reach_the_satellite_and_return_upstream() {
    let mut rig = Rig::new();
    rig.open_basic();
    rig.start_basic();

    rig.push_input(DataMsg::Buffer(DataBuffer::filled(vec![9; 32])));
    rig.push_input(DataMsg::Buffer(DataBuffer::filled(vec![8; 16])));
    rig.olc.run_until_idle();
    assert_eq!(rig.sat.bytes_written(), 48);
    let port = rig.olc.ext_in_port(IN).unwrap();
    assert!(!port.is_holding_buffer());
    assert_eq!(port.queued(), 0);
}

#[test]
fn stopped_input_does_not_consume() {
    let mut rig = Rig::new();
    rig.open_basic();
    rig.push_input(DataMsg::Buffer(DataBuffer::filled(vec![9; 32])));
    rig.olc.run_until_idle();
    assert_eq!(rig.sat.bytes_written(), 0);
    assert_eq!(rig.olc.ext_in_port(IN).unwrap().queued(), 1);

    rig.start_basic();
    assert_eq!(rig.sat.bytes_written(), 32);
}

#[test]
fn output_buffers_are_counted_through_the_container() {
    let mut rig = Rig::new();
    rig.open_basic();
    let port = rig.olc.ext_out_port_mut(OUT).unwrap();
    assert_eq!(port.num_buf_allocated(), 0);
    port.create_bufs(4, 256).unwrap();
    assert_eq!(port.destroy_ext_buffers(2), 2);
    assert_eq!(port.num_buf_allocated(), 2);

    let (ts, frames, resident) = (port.timestamp(), port.frame_count(), port.resident_buffers());
    port.flush_cnt_output_data_queue();
    assert_eq!(port.timestamp(), ts);
    assert_eq!(port.frame_count(), frames);
    assert_eq!(port.resident_buffers(), resident);
}

#[test]
fn connect_sizes_output_buffers_for_an_unknown_downstream() {
    let mut rig = Rig::new();
    rig.open_basic();
    let down = PeerEndpoint::new(8);
    let up = PeerEndpoint::new(8);
    rig.connect_peers(&down, &up);
    let out = rig.olc.ext_out_port(OUT).unwrap();
    assert_eq!(out.num_buf_allocated(), 2);
    assert_eq!(out.buf_max_size(), 1920);
    assert_eq!(rig.sat.recreate_calls(), 1);
}

#[test]
fn satellite_reads_are_delivered_downstream() {
    let mut rig = Rig::new();
    rig.open_basic();
    let down = PeerEndpoint::new(8);
    let up = PeerEndpoint::new(8);
    rig.connect_peers(&down, &up);
    rig.start_basic();
    let reads = rig.sat.read_requests();

    assert!(rig.sat.push_read(
        OUT,
        SatReadData {
            data: vec![5; 64],
            ..SatReadData::default()
        }
    ));
    rig.olc.run_until_idle();

    match down.try_recv_data() {
        Some(DataMsg::Buffer(buf)) => assert_eq!(buf.data, vec![5; 64]),
        other => panic!("expected a buffer, got {other:?}"),
    }
    assert!(rig.sat.read_requests() > reads);
    assert_eq!(rig.olc.ext_out_port(OUT).unwrap().frame_count(), 1);
}

#[test]
fn stop_sends_internal_eos_to_a_running_downstream() {
    let mut rig = Rig::new();
    rig.open_basic();
    let down = PeerEndpoint::new(8);
    let up = PeerEndpoint::new(8);
    rig.connect_peers(&down, &up);
    assert_eq!(rig.mgmt(Opcode::GraphStart, &[], &[OUT]), Status::Ok);
    rig.start_basic();

    assert_eq!(rig.mgmt(Opcode::GraphStop, &[SG1], &[]), Status::Ok);
    match down.try_recv_data() {
        Some(DataMsg::Buffer(buf)) => {
            assert!(buf.data.is_empty());
            assert!(buf.metadata.iter().any(Metadata::is_flushing_eos));
        }
        other => panic!("expected an EOS buffer, got {other:?}"),
    }
}

#[test]
fn flushing_eos_counter_survives_duplicate_done() {
    let mut rig = Rig::with_satellite(LoopbackSatellite::new().with_auto_eos_done(false));
    rig.open_basic();
    rig.start_basic();

    let eos = DataBuffer::default().with_metadata(Metadata::eos(EosFlags::INTERNAL_FLUSHING));
    rig.push_input(DataMsg::Buffer(eos));
    rig.olc.run_until_idle();
    assert_eq!(rig.sat.eos_written(), 1);
    assert_eq!(rig.olc.flushing_eos_in_flight(), 1);

    assert!(rig.sat.push_write_event(IN, SatDataEvent::EosDone));
    assert!(rig.sat.push_write_event(IN, SatDataEvent::EosDone));
    rig.olc.run_until_idle();
    assert_eq!(rig.olc.flushing_eos_in_flight(), 0);
}

#[test]
fn ctrl_port_messages_are_forwarded_when_started() {
    let mut rig = Rig::new();
    let mut payload = open(&[(1, PerfMode::LowPower)], &[(0x20, 1)], &[], &[]);
    payload.ext_ctrl = vec![CTRL];
    assert_eq!(rig.cmd(Opcode::GraphOpen, Payload::GraphOpen(payload)).status, Status::Ok);

    let trigger = |data: Vec<u8>| Payload::CtrlPortTrigger { port: CTRL, data };
    assert_eq!(rig.cmd(Opcode::CtrlPortTrigger, trigger(vec![1])).status, Status::Ok);
    assert!(rig.sat.ctrl_messages().is_empty());

    rig.start_basic();
    assert_eq!(rig.sat.ctrl_messages(), vec![(CTRL, vec![1])]);

    let missing = Payload::CtrlPortTrigger {
        port: PortRef::new(0x20, 77),
        data: vec![],
    };
    assert_eq!(rig.cmd(Opcode::CtrlPortTrigger, missing).status, Status::BadParam);
}

// ============================================================================
// 6. Power voting (Scenario D, P5)
// ============================================================================

#[test]
fn ftrt_inputs_without_data_release_then_vote_on_data_flow() {
    let mut rig = Rig::new();
    rig.open_basic();
    rig.start_basic();
    let vote = rig.pm.last_clock().expect("start votes");
    assert!(vote.release, "no data yet must release: {vote:?}");

    rig.push_input(DataMsg::Buffer(DataBuffer::filled(vec![0; 16])));
    rig.olc.run_until_idle();
    let vote = rig.pm.last_clock().expect("data flow votes");
    assert!(!vote.release, "data flow must request: {vote:?}");
    assert_eq!(vote.period_us, 1000);
}

#[test]
fn rt_upstream_votes_a_request_on_start() {
    let mut rig = Rig::new();
    rig.open_basic();
    rig.rt_upstream();
    assert!(!rig.olc.ext_in_port(IN).unwrap().is_ftrt());
    rig.start_basic();
    assert!(!rig.pm.last_clock().unwrap().release);
    assert!(!rig.pm.priorities().is_empty());
}

#[test]
fn prepare_aggregates_prepared_ports() {
    let mut rig = Rig::new();
    rig.open_basic();
    let down = PeerEndpoint::new(8);
    let up = PeerEndpoint::new(8);
    rig.connect_peers(&down, &up);
    let fmt = olc_core::MediaFormat::pcm(48_000, 2, 16);
    assert_eq!(rig.cmd(Opcode::MediaFormat, Payload::MediaFormat { port: IN, fmt }).status, Status::Ok);
    assert_eq!(rig.olc.pm_state().cntr_kpps, 0);

    assert_eq!(rig.mgmt(Opcode::GraphPrepare, &[SG1], &[]), Status::Ok);
    assert_eq!(rig.olc.ext_in_port(IN).unwrap().state(), PortState::Prepared);
    assert_eq!(rig.olc.pm_state().cntr_kpps, 48);
    assert_eq!(rig.olc.pm_state().cntr_bw, 2 * 48_000 * 2 * 2);
    let request = rig
        .pm
        .clock_votes()
        .into_iter()
        .find(|v| !v.release)
        .expect("prepare requests the aggregate");
    assert_eq!((request.kpps, request.bw), (48, 2 * 48_000 * 2 * 2));
    assert_eq!(request.period_us, 1000);
}

#[test]
fn prof_info_reports_a_fresh_aggregate() {
    let mut rig = Rig::new();
    rig.open_basic();
    let down = PeerEndpoint::new(8);
    let up = PeerEndpoint::new(8);
    rig.connect_peers(&down, &up);
    assert_eq!(rig.mgmt(Opcode::GraphPrepare, &[SG1], &[]), Status::Ok);
    let fmt = olc_core::MediaFormat::pcm(48_000, 2, 16);
    assert_eq!(rig.cmd(Opcode::MediaFormat, Payload::MediaFormat { port: IN, fmt }).status, Status::Ok);

    let params = vec![ParamPayload::new(CONTAINER_ID, PARAM_ID_GET_PROF_INFO, vec![])];
    let ack = rig.cmd(Opcode::GetCfg, Payload::ParamCfg(params));
    assert_eq!(ack.status, Status::Ok);
    assert_eq!(ack.params[0].data, words(&[48, 2 * 48_000 * 2 * 2]));
}

// ============================================================================
// 7. Property propagation (Scenario E)
// ============================================================================

#[test]
fn unchanged_upstream_rt_is_not_propagated() {
    let mut rig = Rig::new();
    rig.open_basic();
    let down = PeerEndpoint::new(8);
    let up = PeerEndpoint::new(8);
    rig.connect_peers(&down, &up);
    rig.start_basic();
    while down.try_recv_ctrl().is_some() {}
    let recreates = rig.sat.recreate_calls();

    let same = PeerProperty::flag(PortProperty::IsUpstreamRt, false);
    assert!(rig.sat.push_read_event(OUT, SatDataEvent::PeerProperty(same)));
    rig.olc.run_until_idle();
    assert_eq!(down.try_recv_ctrl(), None);
    assert_eq!(rig.sat.recreate_calls(), recreates);

    let changed = PeerProperty::flag(PortProperty::IsUpstreamRt, true);
    assert!(rig.sat.push_read_event(OUT, SatDataEvent::PeerProperty(changed)));
    rig.olc.run_until_idle();
    assert_eq!(down.try_recv_ctrl(), Some(PeerCtrlMsg::PropertyUpdate(vec![changed])));
    assert!(rig.olc.ext_out_port(OUT).unwrap().is_upstream_rt());
}

#[test]
fn write_port_topo_stop_reaches_upstream() {
    let mut rig = Rig::new();
    rig.open_basic();
    let down = PeerEndpoint::new(8);
    let up = PeerEndpoint::new(8);
    rig.connect_peers(&down, &up);
    rig.start_basic();

    let stopped = PeerProperty::state(PortState::Stopped);
    assert!(rig.sat.push_write_event(IN, SatDataEvent::PeerProperty(stopped)));
    rig.olc.run_until_idle();
    assert_eq!(rig.sat.upstream_stopped_calls(), 1);
    assert_eq!(up.try_recv_ctrl(), Some(PeerCtrlMsg::PropertyUpdate(vec![stopped])));
}

#[test]
fn peer_properties_are_routed_to_data_ports() {
    let mut rig = Rig::new();
    rig.open_basic();
    let ds_rt = PeerProperty::flag(PortProperty::IsDownstreamRt, true);
    let ack = rig.cmd(
        Opcode::PeerPortPropertyUpdate,
        Payload::PeerProperty {
            port: OUT,
            props: vec![ds_rt, PeerProperty::state(PortState::Started)],
        },
    );
    assert_eq!(ack.status, Status::Ok);
    let out = rig.olc.ext_out_port(OUT).unwrap();
    assert!(out.icb().ds_is_real_time);
    assert_eq!(out.connected_state(), PortState::Started);
    assert_eq!(rig.sat.forwarded_properties().len(), 2);

    let other = PeerProperty {
        property: PortProperty::Other(5),
        value: 1,
    };
    let ack = rig.cmd(
        Opcode::PeerPortPropertyUpdate,
        Payload::PeerProperty {
            port: OUT,
            props: vec![other],
        },
    );
    assert_eq!(ack.status, Status::Unsupported);
}

#[test]
fn icb_info_recreates_output_buffers() {
    let mut rig = Rig::new();
    rig.open_basic();
    let down = PeerEndpoint::new(8);
    let up = PeerEndpoint::new(8);
    rig.connect_peers(&down, &up);
    let info = DownstreamIcb {
        frame_len_us: 1000,
        period_us: 1000,
        is_real_time: true,
    };
    let ack = rig.cmd(Opcode::IcbInfoFromDownstream, Payload::IcbInfo { port: OUT, info });
    assert_eq!(ack.status, Status::Ok);
    let icb = rig.olc.ext_out_port(OUT).unwrap().icb();
    assert!(icb.ds_is_real_time);
    assert_eq!(icb.num_reg_prebufs, 1);
}

#[test]
fn ctrl_path_media_format_rules() {
    let mut rig = Rig::new();
    rig.open_basic();
    let fmt = olc_core::MediaFormat::pcm(48_000, 2, 16);
    let ack = rig.cmd(Opcode::MediaFormat, Payload::MediaFormat { port: IN, fmt });
    assert_eq!(ack.status, Status::Ok);
    assert!(!rig.olc.ext_in_port(IN).unwrap().flags().pending_mf);

    let down = PeerEndpoint::new(8);
    let up = PeerEndpoint::new(8);
    rig.connect_peers(&down, &up);
    let ack = rig.cmd(Opcode::MediaFormat, Payload::MediaFormat { port: IN, fmt });
    assert_eq!(ack.status, Status::Ok);
    assert!(rig.olc.ext_in_port(IN).unwrap().flags().pending_mf);

    assert_eq!(rig.mgmt(Opcode::GraphStart, &[], &[IN]), Status::Ok);
    rig.start_basic();
    assert_eq!(rig.sat.dl_pcd_writes().last(), Some(&fmt));
    let ack = rig.cmd(Opcode::MediaFormat, Payload::MediaFormat { port: IN, fmt });
    assert_eq!(ack.status, Status::Unsupported);
}

// ============================================================================
// 8. Configuration commands
// ============================================================================

#[test]
fn mixed_set_cfg_is_split_and_merged() {
    let mut rig = Rig::new();
    rig.open_basic();
    let local = ParamPayload::new(CONTAINER_ID, PARAM_ID_PROC_DURATION, words(&[2000]));
    let remote = ParamPayload::new(0x10, 0x0800_2000, words(&[1]));
    let ack = rig.cmd(Opcode::SetCfg, Payload::ParamCfg(vec![local, remote.clone()]));
    assert_eq!(ack.status, Status::Ok);
    assert_eq!(ack.params.len(), 2);
    assert_eq!(rig.sat.cfg_sent(), vec![(true, vec![remote])]);
    assert_eq!(rig.olc.pm_state().proc_duration_us, 2000);
    assert!(rig.olc.pm_state().proc_dur_set_paramed);
}

#[test]
fn container_only_get_cfg_never_reaches_the_satellite() {
    let mut rig = Rig::with_satellite(LoopbackSatellite::new().with_path_delay(1500));
    rig.open_basic();
    let params = vec![
        ParamPayload::new(CONTAINER_ID, PARAM_ID_PROC_DURATION, vec![]),
        ParamPayload::new(CONTAINER_ID, PARAM_ID_PATH_DELAY, words(&[3])),
        ParamPayload::new(CONTAINER_ID, PARAM_ID_GET_PROF_INFO, vec![]),
    ];
    let ack = rig.cmd(Opcode::GetCfg, Payload::ParamCfg(params));
    assert_eq!(ack.status, Status::Ok);
    assert!(rig.sat.cfg_sent().is_empty());
    assert_eq!(ack.params[0].word(0), Some(1000));
    assert_eq!(ack.params[1].data, words(&[3, 1500]));
    assert_eq!(ack.params[2].data.len(), 8);
}

#[test]
fn container_param_errors() {
    let mut rig = Rig::new();
    let zero = ParamPayload::new(CONTAINER_ID, PARAM_ID_PROC_DURATION, words(&[0]));
    assert_eq!(rig.cmd(Opcode::SetCfg, Payload::ParamCfg(vec![zero])).status, Status::Failed);
    let voice = ParamPayload::new(CONTAINER_ID, PARAM_ID_VOICE_SESSION_INFO, vec![]);
    assert_eq!(rig.cmd(Opcode::SetCfg, Payload::ParamCfg(vec![voice])).status, Status::BadParam);
    let unknown = ParamPayload::new(CONTAINER_ID, 0x1234, vec![]);
    assert_eq!(rig.cmd(Opcode::SetCfg, Payload::ParamCfg(vec![unknown])).status, Status::Unexpected);
    assert_eq!(rig.cmd(Opcode::SetCfg, Payload::ParamCfg(vec![])).status, Status::Unexpected);
}

#[test]
fn satellite_cfg_failure_is_reported() {
    let mut rig = Rig::with_satellite(LoopbackSatellite::new().fail_kind(ResponseKind::SetGetCfg, Status::BadParam));
    rig.open_basic();
    let remote = ParamPayload::new(0x10, 0x0800_2000, words(&[1]));
    assert_eq!(rig.cmd(Opcode::SetCfg, Payload::ParamCfg(vec![remote])).status, Status::BadParam);
}

#[test]
fn persistent_cfg_round_trips_through_the_satellite() {
    let mut rig = Rig::new();
    rig.open_basic();
    let param = ParamPayload::new(0x10, 0x0800_3000, words(&[4]));
    assert_eq!(rig.cmd(Opcode::RegisterCfg, Payload::ParamCfg(vec![param.clone()])).status, Status::Ok);
    assert_eq!(rig.cmd(Opcode::DeregisterCfg, Payload::ParamCfg(vec![param])).status, Status::Ok);
    assert_eq!(rig.cmd(Opcode::RegisterCfg, Payload::ParamCfg(vec![])).status, Status::Unexpected);
}

// ============================================================================
// 9. GPR and module events
// ============================================================================

fn gpr_packet(opcode: u32, module: u32, params: Vec<ParamPayload>) -> Payload {
    Payload::Gpr(GprPacket {
        opcode,
        token: 0x55,
        dst_module: ModuleId(module),
        params,
    })
}

#[test]
fn gpr_classification() {
    let mut rig = Rig::new();
    rig.open_basic();
    let packed = gpr_packet(olc_core::gpr::APM_CMD_GET_CFG, 0x10, vec![ParamPayload::new(0x10, 1, vec![7])]);
    let ack = rig.cmd(Opcode::Gpr, packed);
    assert_eq!(ack.status, Status::Ok);
    assert_eq!(ack.params.len(), 1);

    assert_eq!(rig.cmd(Opcode::Gpr, gpr_packet(0x0100_FFFF, 0x10, vec![])).status, Status::Unsupported);
    assert_eq!(rig.cmd(Opcode::Gpr, gpr_packet(0x0100_FFFF, 0x99, vec![])).status, Status::BadParam);
}

#[test]
fn module_events_reach_a_registered_client() {
    let (sink_tx, sink_rx) = unbounded();
    let sat = LoopbackSatellite::new();
    let pm = RecordingVoter::new();
    let olc = Olc::create(OlcParams::default(), Box::new(sat.clone()), Box::new(pm.clone()))
        .unwrap()
        .with_event_sink(sink_tx);
    let handle = olc.handle();
    let (tx, rx) = unbounded();
    let mut rig = Rig {
        olc,
        sat,
        pm,
        handle,
        tx,
        rx,
    };
    rig.open_basic();

    let event = ModuleEvent {
        module: ModuleId(0x10),
        event_id: 0x42,
        payload: vec![1, 2],
    };
    let deliver = |event: &ModuleEvent| Payload::Satellite(SatellitePacket::ModuleEvent(event.clone()));
    assert_eq!(rig.cmd(Opcode::SatelliteGpr, deliver(&event)).status, Status::Ok);
    assert!(sink_rx.try_recv().is_err());

    let reg = ParamPayload::new(0x10, 0, words(&[0x42, 1]));
    let ack = rig.cmd(
        Opcode::Gpr,
        gpr_packet(olc_core::gpr::APM_CMD_REGISTER_MODULE_EVENTS, 0x10, vec![reg]),
    );
    assert_eq!(ack.status, Status::Ok);
    assert_eq!(rig.cmd(Opcode::SatelliteGpr, deliver(&event)).status, Status::Ok);
    assert_eq!(sink_rx.try_recv().ok(), Some(event));
}

// ============================================================================
// 10. Correlation (P6)
// ============================================================================

#[test]
fn duplicate_response_runs_completion_once() {
    let mut rig = Rig::with_satellite(LoopbackSatellite::new().with_response_mode(ResponseMode::Held));
    let open = open(&[(1, PerfMode::LowPower)], &[(0x10, 1), (0x20, 1)], &[IN], &[OUT]);
    rig.park(Opcode::GraphOpen, Payload::GraphOpen(open));
    rig.sat.deliver_held();
    assert_eq!(rig.next_ack().status, Status::Ok);

    rig.park(Opcode::GraphFlush, mgmt(&[SG1], &[]));
    let held = rig.sat.held();
    assert_eq!(held.len(), 1);
    let (id, kind) = held[0];
    assert_eq!(kind, ResponseKind::Flush);
    assert!(rig.sat.respond(id, Status::Ok));
    assert_eq!(rig.next_ack().status, Status::Ok);
    let flushes = rig.sat.flush_calls();

    assert!(rig.sat.inject_response(SatelliteResponse::new(id, kind, Status::Ok)));
    rig.olc.run_until_idle();
    assert!(rig.rx.try_recv().is_err());
    assert_eq!(rig.sat.flush_calls(), flushes);
    assert_eq!(rig.olc.pending_len(), 0);
}

#[test]
fn response_of_the_wrong_kind_keeps_the_command_parked() {
    let mut rig = Rig::with_satellite(LoopbackSatellite::new().with_response_mode(ResponseMode::Held));
    let remote = ParamPayload::new(0x10, 0x0800_2000, words(&[1]));
    rig.park(Opcode::SetCfg, Payload::ParamCfg(vec![remote]));
    let (id, _) = rig.sat.held()[0];
    rig.sat.inject_response(SatelliteResponse::new(id, ResponseKind::Start, Status::Ok));
    rig.olc.run_until_idle();
    assert_eq!(rig.olc.pending_len(), 1);
    rig.sat.deliver_held();
    assert_eq!(rig.next_ack().status, Status::Ok);
}

#[test]
fn response_carried_on_satellite_gpr_is_correlated() {
    let mut rig = Rig::with_satellite(LoopbackSatellite::new().with_response_mode(ResponseMode::Held));
    let remote = ParamPayload::new(0x10, 0x0800_2000, words(&[1]));
    rig.park(Opcode::SetCfg, Payload::ParamCfg(vec![remote]));
    let (id, kind) = rig.sat.held()[0];
    rig.sat.deliver_held();
    rig.olc.run_until_idle();
    let acks: Vec<_> = rig.rx.try_iter().collect();
    assert_eq!(acks.len(), 1);

    let late = Payload::Satellite(SatellitePacket::Response(SatelliteResponse::new(id, kind, Status::Ok)));
    let ack = rig.cmd(Opcode::SatelliteGpr, late);
    assert_eq!(ack.status, Status::Ok);
    assert!(rig.rx.try_recv().is_err());
}

// ============================================================================
// 11. Satellite restart
// ============================================================================

#[test]
fn satellite_down_fails_pending_and_blocks_new_work() {
    let mut rig = Rig::new();
    rig.open_basic();
    rig.sat.set_response_mode(ResponseMode::Held);
    rig.park(Opcode::GraphPrepare, mgmt(&[SG1], &[]));

    rig.system(SystemMsg::ServiceStatus(ServiceStatus::Down));
    assert_eq!(rig.rx.try_recv().unwrap().status, Status::NotReady);
    assert!(!rig.olc.satellite_up());
    assert_eq!(rig.olc.curr_chan_mask(), SYSTEM_Q_BIT | CMD_BIT);
    assert_eq!(rig.olc.pending_len(), 0);

    assert_eq!(rig.mgmt(Opcode::GraphStart, &[SG1], &[]), Status::NotReady);
    let remote = ParamPayload::new(0x10, 0x0800_2000, words(&[1]));
    assert_eq!(rig.cmd(Opcode::SetCfg, Payload::ParamCfg(vec![remote])).status, Status::NotReady);

    rig.system(SystemMsg::ServiceStatus(ServiceStatus::Up));
    assert!(rig.olc.satellite_up());
    assert_ne!(rig.olc.curr_chan_mask() & !(SYSTEM_Q_BIT | CMD_BIT), 0);
}

#[test]
fn satellite_down_during_start_restores_the_sub_graph() {
    let mut rig = Rig::new();
    rig.open_basic();
    assert_eq!(rig.mgmt(Opcode::GraphPrepare, &[SG1], &[]), Status::Ok);
    rig.sat.set_response_mode(ResponseMode::Held);
    rig.park(Opcode::GraphStart, mgmt(&[SG1], &[]));

    rig.system(SystemMsg::ServiceStatus(ServiceStatus::Down));
    assert_eq!(rig.rx.try_recv().unwrap().status, Status::NotReady);
    assert!(!rig.olc.is_started());
    assert_eq!(rig.olc.sub_graph_state(SG1), Some(SgState::Prepared));
    assert_eq!(rig.olc.ext_in_port(IN).unwrap().state(), PortState::Prepared);
}

#[test]
fn satellite_down_during_open_unwinds_it() {
    let mut rig = Rig::with_satellite(LoopbackSatellite::new().with_response_mode(ResponseMode::Held));
    let free = rig.olc.free_bits();
    let open = open(&[(1, PerfMode::LowPower)], &[(0x10, 1)], &[IN], &[]);
    rig.park(Opcode::GraphOpen, Payload::GraphOpen(open));
    rig.system(SystemMsg::ServiceStatus(ServiceStatus::Down));
    assert_eq!(rig.rx.try_recv().unwrap().status, Status::NotReady);
    assert_eq!(rig.olc.num_sub_graphs(), 0);
    assert_eq!(rig.olc.free_bits(), free);
}

#[test]
fn close_works_while_the_satellite_is_down() {
    let mut rig = Rig::new();
    rig.open_basic();
    rig.system(SystemMsg::ServiceStatus(ServiceStatus::Down));
    let sent = rig.sat.graph_commands().len();
    assert_eq!(rig.mgmt(Opcode::GraphClose, &[SG1], &[]), Status::Terminated);
    assert_eq!(rig.sat.graph_commands().len(), sent);
}

#[test]
fn unknown_system_message_is_ignored() {
    let mut rig = Rig::new();
    let mask = rig.olc.curr_chan_mask();
    rig.system(SystemMsg::Other(0x1234));
    rig.system(SystemMsg::ServiceStatus(ServiceStatus::Unknown(9)));
    assert_eq!(rig.olc.curr_chan_mask(), mask);
    assert!(rig.olc.satellite_up());
}

// ============================================================================
// 12. Threaded run
// ============================================================================

#[test]
fn spawned_container_serves_commands() {
    let sat = LoopbackSatellite::new();
    let olc = Olc::create(OlcParams::default(), Box::new(sat.clone()), Box::new(RecordingVoter::new())).unwrap();
    let handle = olc.handle();
    let join = olc.spawn().unwrap();
    let (tx, rx) = unbounded();

    let open = open(&[(1, PerfMode::LowLatency)], &[(0x10, 1)], &[IN], &[]);
    handle
        .send(CommandMsg::new(Opcode::GraphOpen, Payload::GraphOpen(open)).with_responder(tx.clone()))
        .unwrap();
    let ack = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    assert_eq!(ack.status, Status::Ok);

    handle
        .send(CommandMsg::new(Opcode::DestroyContainer, Payload::Empty).with_responder(tx))
        .unwrap();
    let ack = rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    assert_eq!(ack.status, Status::Terminated);
    join.join().unwrap();
    assert!(!sat.is_initialised());
}
