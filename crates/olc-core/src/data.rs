//! Data-path triggers.
//!
//! A set port bit means the port's own queue or its satellite event queue
//! has something. Inputs write upstream data to the satellite; outputs
//! deliver satellite reads downstream; control ports forward messages.

use tracing::{debug, warn};

use crate::command::{CommandMsg, Payload};
use crate::container::Olc;
use crate::error::Status;
use crate::port::CtrlPortMsg;

impl Olc {
    /// Services every port whose bit is in `bits`.
    pub(crate) fn process_port_bits(&mut self, bits: u32) {
        for i in 0..self.ext_in.len() {
            if bits & self.ext_in[i].bit() != 0 {
                self.process_ext_in(i);
            }
        }
        for i in 0..self.ext_out.len() {
            if bits & self.ext_out[i].bit() != 0 {
                self.process_ext_out(i);
            }
        }
        for port in &mut self.ext_ctrl {
            if bits & port.bit() == 0 {
                continue;
            }
            match port.process(self.driver.as_mut()) {
                Ok(0) => {}
                Ok(n) => debug!(log_id = self.params.log_id, "ctrl port {}: {n} messages forwarded", port.key()),
                Err(e) => warn!(log_id = self.params.log_id, "ctrl port {}: {e}", port.key()),
            }
        }
    }

    fn process_ext_in(&mut self, index: usize) {
        let port = &mut self.ext_in[index];
        let before = port.data_flow;
        match port.process(self.driver.as_mut(), &mut self.flushing_eos_in_flight) {
            Ok(progress) => {
                if progress.data_flow_started || port.data_flow != before {
                    debug!(
                        log_id = self.params.log_id,
                        "ext in port {}: data flow {:?} -> {:?}",
                        port.key(),
                        before,
                        port.data_flow
                    );
                    self.events.dfs_change = true;
                }
                if !progress.properties.is_empty() {
                    self.propagate_to_upstream(index, progress.properties);
                }
            }
            Err(e) => warn!(log_id = self.params.log_id, "ext in port {}: {e}", port.key()),
        }
    }

    fn process_ext_out(&mut self, index: usize) {
        let frame = self.configured_frame_size_us;
        let port = &mut self.ext_out[index];
        match port.process(self.driver.as_mut(), frame) {
            Ok(progress) => {
                if progress.delivered > 0 {
                    debug!(
                        log_id = self.params.log_id,
                        "ext out port {}: {} buffers delivered",
                        port.key(),
                        progress.delivered
                    );
                }
                if !progress.properties.is_empty() {
                    self.propagate_to_downstream(index, progress.properties);
                }
            }
            Err(e) => warn!(log_id = self.params.log_id, "ext out port {}: {e}", port.key()),
        }
    }

    pub(crate) fn ctrl_port_trigger_cmd(&mut self, mut cmd: CommandMsg) {
        let (key, data) = match std::mem::replace(&mut cmd.payload, Payload::Empty) {
            Payload::CtrlPortTrigger { port, data } => (port, data),
            other => {
                cmd.payload = other;
                let e = cmd.malformed("ctrl-port-trigger");
                return cmd.ack(e.status());
            }
        };
        let Some(port) = self.ext_ctrl.iter().find(|p| p.key() == key) else {
            warn!(log_id = self.params.log_id, "CMD:{}: no ctrl port {key}", cmd.opcode);
            return cmd.ack(Status::BadParam);
        };
        let status = match port.handle().push(CtrlPortMsg { data }) {
            Ok(()) => Status::Ok,
            Err(e) => {
                warn!(log_id = self.params.log_id, "CMD:{}: ctrl port {key}: {e}", cmd.opcode);
                Status::NoResource
            }
        };
        cmd.ack(status);
    }
}
