//! Satellite response handling.
//!
//! A response is matched to its parked command, then routed through
//! [`RESPONSE_TABLE`] by [`ResponseKind`]. When the satellite goes down,
//! every parked command is failed through [`ERROR_RESPONSE_TABLE`] instead,
//! which unwinds opens and finishes closes locally.

use tracing::{debug, error, info, warn};

use crate::bitmask::CMD_BIT;
use crate::command::{CommandMsg, ModuleEvent, ParamPayload, SatellitePacket};
use crate::container::Olc;
use crate::correlation::{Continuation, Miss, PendingCommand};
use crate::error::Status;
use crate::ids::SubGraphId;
use crate::satellite::{ResponseKind, SatelliteResponse};
use crate::topology::ExtPortKind;

/// Completion handler for one response kind.
pub(crate) type RspHandler = fn(&mut Olc, PendingCommand, Status, Vec<ParamPayload>);

/// Handlers for responses that arrived.
pub(crate) const RESPONSE_TABLE: &[(ResponseKind, RspHandler)] = &[
    (ResponseKind::Open, Olc::open_done),
    (ResponseKind::Prepare, Olc::prepare_done),
    (ResponseKind::Start, Olc::start_done),
    (ResponseKind::Suspend, Olc::stop_suspend_done),
    (ResponseKind::Stop, Olc::stop_suspend_done),
    (ResponseKind::Flush, Olc::flush_done),
    (ResponseKind::Close, Olc::close_done),
    (ResponseKind::SetGetCfg, Olc::cfg_done),
    (ResponseKind::SetGetCfgPacked, Olc::params_done),
    (ResponseKind::Persistent, Olc::params_done),
    (ResponseKind::PersistentPacked, Olc::params_done),
    (ResponseKind::EventReg, Olc::event_reg_done),
];

/// Handlers for commands failed without a response (satellite down).
pub(crate) const ERROR_RESPONSE_TABLE: &[(ResponseKind, RspHandler)] = &[
    (ResponseKind::Open, Olc::open_done),
    (ResponseKind::Prepare, Olc::error_done),
    (ResponseKind::Start, Olc::start_done),
    (ResponseKind::Suspend, Olc::error_done),
    (ResponseKind::Stop, Olc::error_done),
    (ResponseKind::Flush, Olc::error_done),
    (ResponseKind::Close, Olc::close_done),
    (ResponseKind::SetGetCfg, Olc::cfg_done),
    (ResponseKind::SetGetCfgPacked, Olc::error_done),
    (ResponseKind::Persistent, Olc::error_done),
    (ResponseKind::PersistentPacked, Olc::error_done),
    (ResponseKind::EventReg, Olc::error_done),
];

fn lookup(table: &[(ResponseKind, RspHandler)], kind: ResponseKind) -> RspHandler {
    table
        .iter()
        .find(|(k, _)| *k == kind)
        .map_or(Olc::error_done as RspHandler, |(_, h)| *h)
}

fn unexpected_continuation(cmd: CommandMsg, kind: ResponseKind) {
    error!("CMD:{}: continuation does not fit a {kind} response", cmd.opcode);
    cmd.ack(Status::Unexpected);
}

impl Olc {
    /// Runs the completion of `pending` and resumes command processing.
    pub(crate) fn complete(&mut self, pending: PendingCommand, status: Status, params: Vec<ParamPayload>) {
        debug!(
            log_id = self.params.log_id,
            "CMD:{}: completing {} ({}) with {status}",
            pending.cmd.opcode,
            pending.id,
            pending.kind
        );
        let handler = lookup(RESPONSE_TABLE, pending.kind);
        handler(self, pending, status, params);
        self.resume_commands();
    }

    /// Handles one response from the satellite.
    pub(crate) fn on_satellite_response(&mut self, rsp: SatelliteResponse) {
        match self.pending.take(rsp.id, rsp.kind) {
            Ok(pending) => self.complete(pending, rsp.status, rsp.params),
            Err(Miss::Unknown) => error!(
                log_id = self.params.log_id,
                "response {} ({}) matches no pending command; dropped",
                rsp.id,
                rsp.kind
            ),
            Err(Miss::Mismatch { expected }) => error!(
                log_id = self.params.log_id,
                "response {} is a {} response but {expected} was expected; dropped",
                rsp.id,
                rsp.kind
            ),
        }
    }

    /// Fails every parked command with `status`.
    pub(crate) fn fail_pending_commands(&mut self, status: Status) {
        let drained = self.pending.drain();
        if !drained.is_empty() {
            warn!(
                log_id = self.params.log_id,
                "failing {} pending commands with {status}",
                drained.len()
            );
        }
        for pending in drained {
            let handler = lookup(ERROR_RESPONSE_TABLE, pending.kind);
            handler(self, pending, status, Vec::new());
        }
        self.resume_commands();
    }

    /// Handles a packet received through the satellite transport.
    pub(crate) fn satellite_packet(&mut self, packet: SatellitePacket) {
        match packet {
            SatellitePacket::Response(rsp) => self.on_satellite_response(rsp),
            SatellitePacket::ModuleEvent(event) => self.route_module_event(event),
        }
    }

    fn route_module_event(&mut self, event: ModuleEvent) {
        let registered = self.gpr.event_token(event.module, event.event_id).is_some();
        match (&self.event_sink, registered) {
            (Some(sink), true) => {
                if sink.try_send(event).is_err() {
                    warn!(log_id = self.params.log_id, "module event dropped: sink unavailable");
                }
            }
            _ => warn!(
                log_id = self.params.log_id,
                "event 0x{:X} of module {} has no client registration; dropped",
                event.event_id,
                event.module
            ),
        }
    }

    fn resume_commands(&mut self) {
        if self.terminated {
            return;
        }
        self.curr_chan_mask |= CMD_BIT;
        if !self.cmd_q.is_empty() {
            self.channel.signal(CMD_BIT);
        }
        self.handle_fwk_events();
    }

    // --- handlers ---

    fn error_done(&mut self, pending: PendingCommand, status: Status, _params: Vec<ParamPayload>) {
        if !status.is_ok() {
            warn!(
                log_id = self.params.log_id,
                "CMD:{}: {} failed with {status}",
                pending.cmd.opcode,
                pending.kind
            );
        }
        pending.cmd.ack(status);
    }

    fn open_done(&mut self, pending: PendingCommand, status: Status, _params: Vec<ParamPayload>) {
        let PendingCommand { cmd, cont, kind, .. } = pending;
        let Continuation::Open {
            sub_graphs,
            modules,
            ports,
        } = cont
        else {
            return unexpected_continuation(cmd, kind);
        };
        if status.is_ok() {
            self.update_thread_stack_size();
            info!(
                log_id = self.params.log_id,
                "CMD:{}: opened {} sub-graphs, frame {}us",
                cmd.opcode,
                sub_graphs.len(),
                self.configured_frame_size_us
            );
            cmd.ack(Status::Ok);
        } else {
            error!(log_id = self.params.log_id, "CMD:{}: satellite open failed: {status}", cmd.opcode);
            self.handle_failure_at_graph_open(cmd, &sub_graphs, &modules, &ports, status);
        }
    }

    fn prepare_done(&mut self, pending: PendingCommand, status: Status, _params: Vec<ParamPayload>) {
        if status.is_ok() {
            let (kpps, bw) = self.aggregate_kpps_bw();
            debug!(log_id = self.params.log_id, "CMD:{}: prepared, kpps {kpps}, bw {bw} Bps", pending.cmd.opcode);
        } else {
            error!(log_id = self.params.log_id, "CMD:{}: prepare failed: {status}", pending.cmd.opcode);
        }
        pending.cmd.ack(status);
    }

    fn start_done(&mut self, pending: PendingCommand, status: Status, _params: Vec<ParamPayload>) {
        let PendingCommand { cmd, cont, kind, .. } = pending;
        let Continuation::Mgmt { prior, .. } = cont else {
            return unexpected_continuation(cmd, kind);
        };
        if !status.is_ok() {
            error!(log_id = self.params.log_id, "CMD:{}: start failed: {status}", cmd.opcode);
            self.restore_sub_graph_states(&prior);
            return cmd.ack(status);
        }
        let was_running = self.is_cntr_started;
        self.is_cntr_started = true;
        self.events.sg_state_change = true;
        if !was_running {
            self.events.cntr_run_state_change = true;
        }
        self.update_cntr_kpps_bw(false);
        self.vote_pm_conditionally(self.configured_frame_size_us, self.graph.any_started());
        self.get_set_thread_priority();
        self.events = Default::default();
        cmd.ack(status);
    }

    fn stop_suspend_done(&mut self, pending: PendingCommand, status: Status, _params: Vec<ParamPayload>) {
        if !status.is_ok() {
            error!(
                log_id = self.params.log_id,
                "CMD:{}: {} failed: {status}",
                pending.cmd.opcode,
                pending.kind
            );
        }
        let running = self.graph.any_started();
        if running != self.is_cntr_started {
            self.is_cntr_started = running;
            self.events.cntr_run_state_change = true;
        }
        self.update_cntr_kpps_bw(false);
        self.events.sg_state_change = true;
        pending.cmd.ack(status);
    }

    fn flush_done(&mut self, pending: PendingCommand, status: Status, _params: Vec<ParamPayload>) {
        let PendingCommand { cmd, cont, kind, .. } = pending;
        let Continuation::Mgmt { sub_graphs, .. } = cont else {
            return unexpected_continuation(cmd, kind);
        };
        self.flush_satellite_ports(&sub_graphs);
        cmd.ack(status);
    }

    fn flush_satellite_ports(&mut self, sub_graphs: &[SubGraphId]) {
        for port in self.ext_in.iter().filter(|p| sub_graphs.contains(&p.sub_graph())) {
            if let Some(h) = port.write_port() {
                self.driver.flush_write_port(h, true, true);
            }
        }
        for port in self.ext_out.iter().filter(|p| sub_graphs.contains(&p.sub_graph())) {
            if let Some(h) = port.read_port() {
                self.driver.flush_read_port(h, true, true);
            }
        }
    }

    /// Finishes a close: sub-graphs marked closing go away with their
    /// modules, and closing ports are torn down. The client sees success
    /// even when the satellite refused.
    pub(crate) fn close_done(&mut self, pending: PendingCommand, status: Status, _params: Vec<ParamPayload>) {
        if !status.is_ok() {
            warn!(
                log_id = self.params.log_id,
                "CMD:{}: satellite close failed with {status}; closing locally",
                pending.cmd.opcode
            );
        }
        self.close_closing_items();
        if self.graph.num_sub_graphs() == 0 {
            info!(log_id = self.params.log_id, "last sub-graph closed; destroying container");
            self.destroy();
            pending.cmd.ack(Status::Terminated);
        } else {
            pending.cmd.ack(Status::Ok);
        }
    }

    /// Removes closing sub-graphs and modules, and tears down closing ports.
    pub(crate) fn close_closing_items(&mut self) {
        let removed = self.graph.remove_closing();
        for module in &removed.modules {
            self.gpr.deregister(*module);
        }
        let mut doomed: Vec<(ExtPortKind, _)> = removed.ext_ports;
        doomed.extend(
            self.ext_in
                .iter()
                .filter(|p| p.closing)
                .map(|p| (ExtPortKind::Input, p.key())),
        );
        doomed.extend(
            self.ext_out
                .iter()
                .filter(|p| p.closing)
                .map(|p| (ExtPortKind::Output, p.key())),
        );
        doomed.extend(
            self.ext_ctrl
                .iter()
                .filter(|p| p.closing)
                .map(|p| (ExtPortKind::Control, p.key())),
        );
        doomed.sort();
        doomed.dedup();
        for (kind, key) in doomed {
            self.destroy_ext_port(kind, key);
        }
        if !removed.sub_graphs.is_empty() {
            debug!(
                log_id = self.params.log_id,
                "closed sub-graphs {:?}",
                removed.sub_graphs
            );
        }

        self.update_cntr_kpps_bw(false);
        let running = self.graph.any_started();
        if running != self.is_cntr_started {
            self.is_cntr_started = running;
            self.events.cntr_run_state_change = true;
        }
        self.vote_pm_conditionally(self.configured_frame_size_us, running);
        self.refresh_port_mask();
    }

    fn cfg_done(&mut self, pending: PendingCommand, status: Status, params: Vec<ParamPayload>) {
        let PendingCommand { cmd, cont, kind, .. } = pending;
        let Continuation::Cfg {
            is_set,
            mut local,
            local_status,
        } = cont
        else {
            return unexpected_continuation(cmd, kind);
        };
        let remote = if params.is_empty() {
            cmd.params().map(<[ParamPayload]>::to_vec).unwrap_or_default()
        } else {
            params
        };
        local.extend(remote);
        let merged = local_status.merge(status);
        if !merged.is_ok() {
            warn!(
                log_id = self.params.log_id,
                "CMD:{}: {} config finished with {merged}",
                cmd.opcode,
                if is_set { "set" } else { "get" }
            );
        }
        cmd.ack_with(merged, local);
    }

    fn params_done(&mut self, pending: PendingCommand, status: Status, params: Vec<ParamPayload>) {
        pending.cmd.ack_with(status, params);
    }

    fn event_reg_done(&mut self, pending: PendingCommand, status: Status, _params: Vec<ParamPayload>) {
        let PendingCommand { cmd, cont, kind, .. } = pending;
        let Continuation::EventReg { registrations } = cont else {
            return unexpected_continuation(cmd, kind);
        };
        if status.is_ok() {
            for (module, event_id, register) in registrations {
                if register {
                    self.gpr.register_event(module, event_id, cmd.token);
                } else {
                    self.gpr.deregister_event(module, event_id);
                }
            }
        }
        cmd.ack(status);
    }
}
