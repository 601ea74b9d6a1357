//! Sub-graph lifecycle commands.
//!
//! # Architecture
//!
//! Every management command runs in two phases. The handler updates the
//! shadow graph and the external ports right away ([`Olc::operate`]) and
//! then mirrors the command to the satellite; the completion in
//! `completion.rs` finishes whatever needs the satellite's answer.
//!
//! Port states follow their sub-graph, downgraded by the connected peer's
//! state. Data queues are flushed only once the peer is known to be stopped,
//! so a running upstream never refills a queue that was just emptied.

use tracing::{debug, error, info, warn};

use crate::command::{CommandMsg, GraphOpenPayload, Payload, PeerLink, PerfMode};
use crate::container::Olc;
use crate::correlation::{Continuation, PendingCommand};
use crate::error::{OlcError, Result, Status};
use crate::ids::{ModuleId, PortRef, SubGraphId};
use crate::metadata::{EosFlags, Metadata};
use crate::port::{DataFlowState, ExtInPort, ExtOutPort, MfPath, PortState};
use crate::satellite::{GraphCommand, ResponseKind, SatelliteDriver};
use crate::topology::{ExtPortKind, SgOp, SgState};

/// Frame size of a low-latency sub-graph.
pub const LOW_LATENCY_FRAME_US: u32 = 1000;

/// Frame size of a low-power sub-graph, and the fallback.
pub const LOW_POWER_FRAME_US: u32 = 5000;

/// Frame size implied by a performance mode.
pub fn frame_size_us(mode: PerfMode) -> u32 {
    match mode {
        PerfMode::LowLatency => LOW_LATENCY_FRAME_US,
        PerfMode::LowPower | PerfMode::Other(_) => LOW_POWER_FRAME_US,
    }
}

/// What an open added, so a failure can take exactly that back out.
#[derive(Debug, Default)]
struct OpenAdditions {
    sub_graphs: Vec<SubGraphId>,
    modules: Vec<ModuleId>,
    ports: Vec<(ExtPortKind, PortRef)>,
}

impl Olc {
    // --- open ---

    pub(crate) fn graph_open(&mut self, cmd: CommandMsg) {
        if !self.satellite_up {
            warn!(log_id = self.params.log_id, "CMD:{}: satellite is down", cmd.opcode);
            return cmd.ack(OlcError::SatelliteDown.status());
        }
        let open = match cmd.open() {
            Ok(open) => open,
            Err(e) => {
                error!(log_id = self.params.log_id, "CMD:{}: {e}", cmd.opcode);
                return cmd.ack(e.status());
            }
        };

        let mut added = OpenAdditions::default();
        if let Err(e) = self.build_open(open, &mut added) {
            error!(log_id = self.params.log_id, "CMD:{}: building the graph failed: {e}", cmd.opcode);
            let status = e.status();
            return self.handle_failure_at_graph_open(cmd, &added.sub_graphs, &added.modules, &added.ports, status);
        }
        self.check_sg_cfg_for_frame_size(open);
        self.refresh_port_mask();

        let cont = Continuation::Open {
            sub_graphs: added.sub_graphs,
            modules: added.modules,
            ports: added.ports,
        };
        self.forward(cmd, ResponseKind::Open, cont, |driver, id, cmd| {
            Ok(driver.send_graph_command(id, GraphCommand::Open(cmd.open()?))?)
        });
    }

    fn build_open(&mut self, open: &GraphOpenPayload, added: &mut OpenAdditions) -> Result<()> {
        for sg in &open.sub_graphs {
            self.graph.add_sub_graph(sg)?;
            added.sub_graphs.push(sg.id);
        }
        for module in &open.modules {
            self.graph.add_module(module)?;
            added.modules.push(module.id);
            self.gpr.register(module.id);
        }
        let lists = [
            (ExtPortKind::Input, &open.ext_inputs),
            (ExtPortKind::Output, &open.ext_outputs),
            (ExtPortKind::Control, &open.ext_ctrl),
        ];
        for (kind, keys) in lists {
            for &key in keys {
                self.create_ext_port(kind, key)?;
                added.ports.push((kind, key));
            }
        }
        Ok(())
    }

    /// Takes back what a failed open added and acks `status`.
    pub(crate) fn handle_failure_at_graph_open(
        &mut self,
        cmd: CommandMsg,
        sub_graphs: &[SubGraphId],
        modules: &[ModuleId],
        ports: &[(ExtPortKind, PortRef)],
        status: Status,
    ) {
        for &(kind, key) in ports.iter().rev() {
            self.destroy_ext_port(kind, key);
        }
        for &module in modules.iter().rev() {
            self.graph.remove_module(module);
            self.gpr.deregister(module);
        }
        self.graph.mark_closing(sub_graphs);
        let removed = self.graph.remove_closing();
        for module in removed.modules {
            self.gpr.deregister(module);
        }
        for (kind, key) in removed.ext_ports {
            self.destroy_ext_port(kind, key);
        }
        self.refresh_port_mask();
        warn!(
            log_id = self.params.log_id,
            "CMD:{}: open unwound ({} sub-graphs, {} ports), status {status}",
            cmd.opcode,
            sub_graphs.len(),
            ports.len()
        );
        cmd.ack(status);
    }

    /// Lowers the configured frame size to the smallest one the opened
    /// sub-graphs ask for.
    pub(crate) fn check_sg_cfg_for_frame_size(&mut self, open: &GraphOpenPayload) {
        let mut frame = self.configured_frame_size_us;
        for sg in &open.sub_graphs {
            if let PerfMode::Other(raw) = sg.perf_mode {
                error!(
                    log_id = self.params.log_id,
                    "sub-graph {} has unknown perf mode {raw}; using {LOW_POWER_FRAME_US}us",
                    sg.id
                );
            }
            let us = frame_size_us(sg.perf_mode);
            if frame == 0 || us < frame {
                frame = us;
            }
        }
        if frame != self.configured_frame_size_us {
            info!(
                log_id = self.params.log_id,
                "configured frame size {}us -> {frame}us",
                self.configured_frame_size_us
            );
            self.configured_frame_size_us = frame;
            self.handle_frame_length_n_state_change();
        }
    }

    /// Resizes output buffers for the current frame size and recomputes
    /// the container load.
    pub(crate) fn handle_frame_length_n_state_change(&mut self) {
        let frame = self.configured_frame_size_us;
        for port in &mut self.ext_out {
            if let Err(e) = port.recreate_ext_out_buffers(self.driver.as_mut(), frame) {
                warn!(log_id = self.params.log_id, "ext out port {}: {e}", port.key());
            }
        }
        self.update_cntr_kpps_bw(false);
    }

    // --- management ---

    pub(crate) fn graph_prepare(&mut self, cmd: CommandMsg) {
        self.graph_mgmt_cmd(cmd, SgOp::Prepare);
    }

    pub(crate) fn graph_start(&mut self, cmd: CommandMsg) {
        self.graph_mgmt_cmd(cmd, SgOp::Start);
    }

    pub(crate) fn graph_suspend(&mut self, cmd: CommandMsg) {
        self.graph_mgmt_cmd(cmd, SgOp::Suspend);
    }

    pub(crate) fn graph_stop(&mut self, cmd: CommandMsg) {
        self.graph_mgmt_cmd(cmd, SgOp::Stop);
    }

    pub(crate) fn graph_flush(&mut self, cmd: CommandMsg) {
        self.graph_mgmt_cmd(cmd, SgOp::Flush);
    }

    pub(crate) fn graph_close(&mut self, cmd: CommandMsg) {
        self.graph_mgmt_cmd(cmd, SgOp::Close);
    }

    fn graph_mgmt_cmd(&mut self, cmd: CommandMsg, op: SgOp) {
        if op != SgOp::Close && !self.satellite_up {
            warn!(log_id = self.params.log_id, "CMD:{}: satellite is down", cmd.opcode);
            return cmd.ack(OlcError::SatelliteDown.status());
        }
        let mgmt = match cmd.mgmt() {
            Ok(mgmt) => mgmt,
            Err(e) => {
                error!(log_id = self.params.log_id, "CMD:{}: {e}", cmd.opcode);
                return cmd.ack(e.status());
            }
        };
        let mut sub_graphs = Vec::with_capacity(mgmt.sub_graphs.len());
        for &id in &mgmt.sub_graphs {
            if self.graph.sub_graph(id).is_some() {
                sub_graphs.push(id);
            } else {
                warn!(log_id = self.params.log_id, "CMD:{}: sub-graph {id} is not open here", cmd.opcode);
            }
        }
        let ports = mgmt.ports.clone();
        let prior: Vec<(SubGraphId, SgState)> = sub_graphs
            .iter()
            .filter_map(|&id| self.graph.sub_graph(id).map(|sg| (id, sg.state)))
            .collect();

        if op == SgOp::Prepare {
            self.apply_pending_output_media_fmt();
        }
        self.operate(op, &sub_graphs, &ports);

        let Some(kind) = ResponseKind::for_sg_op(op) else {
            return cmd.ack(Status::Unsupported);
        };
        let cont = Continuation::Mgmt {
            sub_graphs: sub_graphs.clone(),
            prior,
        };
        if sub_graphs.is_empty() || !self.satellite_up {
            let id = self.pending.next_id();
            return self.complete(PendingCommand { id, kind, cmd, cont }, Status::Ok, Vec::new());
        }
        self.forward(cmd, kind, cont, |driver, id, _| {
            Ok(driver.send_graph_command(
                id,
                GraphCommand::Mgmt {
                    op,
                    sub_graphs: &sub_graphs,
                },
            )?)
        });
    }

    fn apply_pending_output_media_fmt(&mut self) {
        for port in self.ext_out.iter_mut().filter(|p| p.media_fmt_changed) {
            match port.apply_pending_media_fmt(MfPath::Command) {
                Ok(true) => debug!(log_id = self.params.log_id, "ext out port {}: media format sent", port.key()),
                Ok(false) => {}
                Err(e) => warn!(log_id = self.params.log_id, "ext out port {}: {e}", port.key()),
            }
        }
    }

    /// Applies `op` to the listed sub-graphs and to the ports whose peer is
    /// affected.
    ///
    /// `peer_ports` are local external ports whose connected peer is the
    /// subject of the operation; only their connected state changes.
    pub(crate) fn operate(&mut self, op: SgOp, sub_graphs: &[SubGraphId], peer_ports: &[PortRef]) {
        let log_id = self.params.log_id;
        let pre_states: Vec<(PortRef, PortState)> = self
            .ext_in
            .iter()
            .filter(|p| peer_ports.contains(&p.key()))
            .map(|p| (p.key(), p.state))
            .collect();

        for &id in sub_graphs {
            if let Some(sg) = self.graph.sub_graph_mut(id) {
                if let Some(state) = op.target_state() {
                    sg.state = state;
                }
                if op == SgOp::Close {
                    sg.closing = true;
                }
            }
        }

        let peer_state = match op {
            SgOp::Close => Some(PortState::Stopped),
            SgOp::Disconnect => Some(PortState::Invalid),
            SgOp::Flush => None,
            other => other.target_state().map(SgState::as_port_state),
        };

        let driver = self.driver.as_mut();
        for port in &mut self.ext_in {
            let self_op = sub_graphs.contains(&port.sub_graph());
            let peer_op = peer_ports.contains(&port.key());
            if !self_op && !peer_op {
                continue;
            }
            if let (true, Some(state)) = (peer_op, peer_state) {
                port.connected_state = state;
            }
            operate_on_ext_in(port, driver, op, self_op, peer_op, &mut self.flushing_eos_in_flight);
            let sg_state = self.graph.sub_graph(port.sub_graph()).map_or(SgState::Stopped, |sg| sg.state);
            port.state = sg_state.as_port_state().downgrade(port.connected_state);
            apply_downgraded_state_on_input(port, driver, &mut self.flushing_eos_in_flight);
        }

        for port in &mut self.ext_out {
            let self_op = sub_graphs.contains(&port.sub_graph());
            let peer_op = peer_ports.contains(&port.key());
            if !self_op && !peer_op {
                continue;
            }
            if let (true, Some(state)) = (peer_op, peer_state) {
                port.connected_state = state;
            }
            operate_on_ext_out(port, driver, op, self_op, log_id);
            let sg_state = self.graph.sub_graph(port.sub_graph()).map_or(SgState::Stopped, |sg| sg.state);
            port.state = sg_state.as_port_state().downgrade(port.connected_state);
            apply_downgraded_state_on_output(port, driver);
        }

        for port in &mut self.ext_ctrl {
            if !sub_graphs.contains(&port.sub_graph()) {
                continue;
            }
            if op == SgOp::Close {
                port.flush();
                port.closing = true;
            }
            port.state = self
                .graph
                .sub_graph(port.sub_graph())
                .map_or(PortState::Stopped, |sg| sg.state.as_port_state());
        }

        if matches!(op, SgOp::Stop | SgOp::Flush | SgOp::Suspend) {
            for (key, pre) in pre_states {
                if pre != PortState::Started {
                    continue;
                }
                let Some(port) = self.ext_in.iter_mut().find(|p| p.key() == key) else {
                    continue;
                };
                if port.data_flow == DataFlowState::AtGap {
                    continue;
                }
                let res = match op {
                    SgOp::Suspend => port.insert_data_flow_gap(self.driver.as_mut()),
                    SgOp::Flush if port.upstream_rt => Ok(()),
                    _ => port.send_internal_eos(self.driver.as_mut(), &mut self.flushing_eos_in_flight),
                };
                if let Err(e) = res {
                    warn!(log_id, "ext in port {key}: post-{} handling failed: {e}", op.name());
                }
            }
        }

        debug!(log_id, "{} applied to {} sub-graphs, {} peer ports", op.name(), sub_graphs.len(), peer_ports.len());
        self.refresh_port_mask();
    }

    /// Puts sub-graphs back into the states in `prior` after the satellite
    /// refused an operation, and re-derives the state of their ports.
    ///
    /// Nothing is sent to the satellite or to peers.
    pub(crate) fn restore_sub_graph_states(&mut self, prior: &[(SubGraphId, SgState)]) {
        let mut restored = Vec::with_capacity(prior.len());
        for &(id, state) in prior {
            if let Some(sg) = self.graph.sub_graph_mut(id)
                && !sg.closing
            {
                sg.state = state;
                restored.push(id);
            }
        }
        let graph = &self.graph;
        let port_state = |id: SubGraphId| graph.sub_graph(id).map_or(SgState::Stopped, |sg| sg.state).as_port_state();
        for port in self.ext_in.iter_mut().filter(|p| restored.contains(&p.sub_graph())) {
            port.state = port_state(port.sub_graph()).downgrade(port.connected_state);
        }
        for port in self.ext_out.iter_mut().filter(|p| restored.contains(&p.sub_graph())) {
            port.state = port_state(port.sub_graph()).downgrade(port.connected_state);
        }
        for port in self.ext_ctrl.iter_mut().filter(|p| restored.contains(&p.sub_graph())) {
            port.state = port_state(port.sub_graph());
        }
        debug!(log_id = self.params.log_id, "restored sub-graphs {restored:?}");
        self.refresh_port_mask();
    }

    // --- peers and teardown ---

    pub(crate) fn graph_connect(&mut self, mut cmd: CommandMsg) {
        let links = match std::mem::replace(&mut cmd.payload, Payload::Empty) {
            Payload::Connect(links) => links,
            other => {
                cmd.payload = other;
                let e = cmd.malformed("connect");
                error!(log_id = self.params.log_id, "CMD:{}: {e}", cmd.opcode);
                return cmd.ack(Status::Ok);
            }
        };
        let frame = self.configured_frame_size_us;
        for link in links {
            match link {
                PeerLink::Downstream { port, peer } => {
                    let Some(out) = self.ext_out.iter_mut().find(|p| p.key() == port) else {
                        warn!(log_id = self.params.log_id, "connect: no ext out port {port}");
                        continue;
                    };
                    out.downstream = Some(peer);
                    if out.media_fmt.is_known() {
                        out.media_fmt_changed = true;
                    }
                    if let Err(e) = out.recreate_ext_out_buffers(self.driver.as_mut(), frame) {
                        warn!(log_id = self.params.log_id, "connect: ext out port {port}: {e}");
                    }
                }
                PeerLink::Upstream { port, peer } => {
                    let Some(input) = self.ext_in.iter_mut().find(|p| p.key() == port) else {
                        warn!(log_id = self.params.log_id, "connect: no ext in port {port}");
                        continue;
                    };
                    input.upstream = Some(peer);
                }
            }
        }
        cmd.ack(Status::Ok);
    }

    pub(crate) fn graph_disconnect(&mut self, cmd: CommandMsg) {
        match cmd.mgmt() {
            Ok(mgmt) => {
                let ports = mgmt.ports.clone();
                self.operate(SgOp::Disconnect, &[], &ports);
            }
            Err(e) => error!(log_id = self.params.log_id, "CMD:{}: {e}", cmd.opcode),
        }
        cmd.ack(Status::Ok);
    }

    pub(crate) fn destroy_container(&mut self, cmd: CommandMsg) {
        self.destroy();
        cmd.ack(Status::Terminated);
    }
}

fn operate_on_ext_in(
    port: &mut ExtInPort,
    driver: &mut dyn SatelliteDriver,
    op: SgOp,
    self_op: bool,
    peer_op: bool,
    eos_counter: &mut u32,
) {
    let disconnect = op == SgOp::Disconnect;
    if op == SgOp::Start && self_op && port.media_fmt.is_known() {
        if let Some(handle) = port.write_port() {
            if let Err(e) = driver.write_dl_pcd(handle, &port.media_fmt) {
                warn!("ext in port {}: sending media format failed: {e}", port.key());
            }
        }
    }
    if matches!(op, SgOp::Close | SgOp::Flush) || disconnect {
        let is_flush = op == SgOp::Flush;
        port.flush_input_data_queue(driver, is_flush, is_flush, false, eos_counter);
    }
    if disconnect || (self_op && matches!(op, SgOp::Close | SgOp::Flush)) || (peer_op && op == SgOp::Close) {
        port.reset();
    }
    if disconnect {
        port.upstream = None;
    }
    if self_op && op == SgOp::Close {
        port.closing = true;
    }
}

fn apply_downgraded_state_on_input(port: &mut ExtInPort, driver: &mut dyn SatelliteDriver, eos_counter: &mut u32) {
    if port.connected_state == PortState::Stopped && matches!(port.state, PortState::Stopped | PortState::Suspended) {
        port.flush_input_data_queue(driver, true, false, false, eos_counter);
    }
    if port.state == PortState::Stopped {
        port.reset();
    }
}

fn operate_on_ext_out(port: &mut ExtOutPort, driver: &mut dyn SatelliteDriver, op: SgOp, self_op: bool, log_id: u32) {
    let disconnect = op == SgOp::Disconnect;
    if op == SgOp::Start && self_op {
        if let Some(handle) = port.read_port() {
            if let Err(e) = driver.read_dl_pcd(handle) {
                warn!(log_id, "ext out port {}: read request failed: {e}", port.key());
            }
        }
    }
    if self_op && matches!(op, SgOp::Stop | SgOp::Flush) {
        reset_downstream_and_send_internal_eos(port, log_id);
    }
    if matches!(op, SgOp::Close | SgOp::Flush | SgOp::Stop) || disconnect {
        port.flush_output_data_queue(driver, op == SgOp::Flush);
        port.reset();
    }
    if disconnect {
        port.downstream = None;
    }
    if self_op && op == SgOp::Close {
        port.closing = true;
    }
}

fn apply_downgraded_state_on_output(port: &mut ExtOutPort, driver: &mut dyn SatelliteDriver) {
    if port.connected_state == PortState::Stopped && port.state == PortState::Stopped {
        port.flush_output_data_queue(driver, false);
    }
    if port.state == PortState::Stopped {
        port.reset();
    }
}

/// Tells a running downstream that this stream ended: a flushing internal
/// EOS is pushed on its own buffer. The port is reset either way.
pub(crate) fn reset_downstream_and_send_internal_eos(port: &mut ExtOutPort, log_id: u32) {
    let peer_running = !matches!(port.connected_state, PortState::Stopped | PortState::Invalid);
    if peer_running && port.downstream.is_some() {
        let eos = Metadata::eos(EosFlags::INTERNAL_FLUSHING);
        match port.push_metadata_only(eos) {
            Ok(()) => debug!(log_id, "ext out port {}: internal EOS sent downstream", port.key()),
            Err(e) => warn!(log_id, "ext out port {}: internal EOS dropped: {e}", port.key()),
        }
    }
    port.basic_reset();
}
