//! Command dispatch.
//!
//! # Architecture
//!
//! [`Olc::dispatch`] services the ready bits in a fixed order:
//!
//! 1. system queue (satellite up/down)
//! 2. response queue
//! 3. one command
//! 4. port bits
//!
//! Before each stage the ready bits are masked again with the current
//! listen mask, since an earlier stage may have changed it. Commands go
//! through [`CMD_HANDLER_TABLE`]; an opcode outside it is acked
//! `Unsupported`.

use tracing::{debug, error, info, warn};

use crate::bitmask::{CMD_BIT, RESERVED_BITS, SYSTEM_Q_BIT};
use crate::command::{CommandMsg, Opcode, ServiceStatus, SystemMsg};
use crate::container::Olc;
use crate::error::{OlcError, Status};

/// Command handler.
pub(crate) type CmdHandler = fn(&mut Olc, CommandMsg);

/// Handler of every supported opcode.
pub(crate) const CMD_HANDLER_TABLE: &[(Opcode, CmdHandler)] = &[
    (Opcode::Gpr, Olc::gpr_cmd),
    (Opcode::SetCfg, Olc::set_get_cfg_cmd),
    (Opcode::GetCfg, Olc::set_get_cfg_cmd),
    (Opcode::IcbInfoFromDownstream, Olc::icb_info_cmd),
    (Opcode::CtrlPortTrigger, Olc::ctrl_port_trigger_cmd),
    (Opcode::PeerPortPropertyUpdate, Olc::peer_property_cmd),
    (Opcode::UpstreamStoppedAck, Olc::upstream_stopped_cmd),
    (Opcode::GraphOpen, Olc::graph_open),
    (Opcode::GraphPrepare, Olc::graph_prepare),
    (Opcode::GraphStart, Olc::graph_start),
    (Opcode::GraphSuspend, Olc::graph_suspend),
    (Opcode::GraphStop, Olc::graph_stop),
    (Opcode::GraphFlush, Olc::graph_flush),
    (Opcode::GraphClose, Olc::graph_close),
    (Opcode::GraphConnect, Olc::graph_connect),
    (Opcode::GraphDisconnect, Olc::graph_disconnect),
    (Opcode::DestroyContainer, Olc::destroy_container),
    (Opcode::MediaFormat, Olc::ctrl_mf_cmd),
    (Opcode::RegisterCfg, Olc::persistent_cfg_cmd),
    (Opcode::DeregisterCfg, Olc::persistent_cfg_cmd),
    (Opcode::SatelliteGpr, Olc::satellite_gpr_cmd),
];

/// Opcodes with a handler, in table order.
pub fn handled_opcodes() -> impl Iterator<Item = Opcode> {
    CMD_HANDLER_TABLE.iter().map(|(op, _)| *op)
}

impl Olc {
    pub(crate) fn dispatch(&mut self, mut ready: u32) {
        if ready & SYSTEM_Q_BIT != 0 {
            while let Some(msg) = self.sys_q.pop() {
                self.handle_system_msg(msg);
                if self.terminated {
                    return;
                }
            }
        }

        let rsp_bit = self.rsp_q.bit();
        ready &= self.curr_chan_mask;
        if ready & rsp_bit != 0 {
            while let Some(rsp) = self.rsp_q.pop() {
                self.on_satellite_response(rsp);
                if self.terminated {
                    return;
                }
            }
        }

        ready &= self.curr_chan_mask;
        if ready & CMD_BIT != 0 {
            self.process_one_command();
            if self.terminated {
                return;
            }
        }

        ready &= self.curr_chan_mask;
        let ports = ready & !(RESERVED_BITS | rsp_bit);
        if ports != 0 {
            self.process_port_bits(ports);
        }
        self.handle_fwk_events();
    }

    fn process_one_command(&mut self) {
        let Some(cmd) = self.cmd_q.pop() else {
            return;
        };
        let opcode = cmd.opcode;
        debug!(
            log_id = self.params.log_id,
            "CMD:{opcode}: executing, mask=0x{:08X}",
            self.curr_chan_mask
        );
        match CMD_HANDLER_TABLE.iter().find(|(op, _)| *op == opcode) {
            Some((_, handler)) => handler(self, cmd),
            None => {
                warn!(log_id = self.params.log_id, "CMD:{opcode}: unsupported");
                cmd.ack(Status::Unsupported);
            }
        }
        debug!(log_id = self.params.log_id, "CMD:{opcode}: done");
        self.handle_fwk_events();
        if !self.terminated && self.curr_chan_mask & CMD_BIT != 0 && !self.cmd_q.is_empty() {
            self.channel.signal(CMD_BIT);
        }
    }

    fn handle_system_msg(&mut self, msg: SystemMsg) {
        match msg {
            SystemMsg::ServiceStatus(ServiceStatus::Down) => self.on_satellite_down(),
            SystemMsg::ServiceStatus(ServiceStatus::Up) => {
                info!(log_id = self.params.log_id, "satellite up");
                self.satellite_up = true;
                self.refresh_port_mask();
            }
            SystemMsg::ServiceStatus(ServiceStatus::Unknown(raw)) => error!(
                log_id = self.params.log_id,
                "unknown satellite status {raw}: {}",
                Status::BadParam
            ),
            SystemMsg::Other(op) => error!(
                log_id = self.params.log_id,
                "unsupported system opcode 0x{op:08X}: {}",
                Status::BadParam
            ),
        }
    }

    /// The satellite went away: only system messages and commands are
    /// listened to, and everything waiting on it fails.
    fn on_satellite_down(&mut self) {
        warn!(
            log_id = self.params.log_id,
            "satellite down; failing {} pending commands",
            self.pending.len()
        );
        self.satellite_up = false;
        let stale = self.rsp_q.drain().count();
        if stale > 0 {
            debug!(log_id = self.params.log_id, "{stale} stale responses dropped");
        }
        self.fail_pending_commands(OlcError::SatelliteDown.status());
        if !self.terminated {
            self.curr_chan_mask = SYSTEM_Q_BIT | CMD_BIT;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_every_named_opcode_once() {
        let ops: Vec<Opcode> = handled_opcodes().collect();
        assert_eq!(ops.len(), 21);
        let mut sorted = ops.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 21);
        assert!(!ops.contains(&Opcode::Other(0)));
    }
}
