//! Port property and state propagation between peers and the satellite.
//!
//! Properties flow in both directions: peer containers send updates through
//! `PEER_PORT_PROPERTY_UPDATE`, and the satellite reports what its boundary
//! modules see on the data-port event queues. Each update is cached on the
//! external port before being passed on.

use tracing::{debug, warn};

use crate::command::{CommandMsg, Payload};
use crate::container::Olc;
use crate::error::{OlcError, Result, Status};
use crate::ids::PortRef;
use crate::port::{PeerCtrlMsg, PeerProperty, PortProperty, PortState};
use crate::topology::SgState;

impl Olc {
    // --- commands from peers ---

    pub(crate) fn peer_property_cmd(&mut self, cmd: CommandMsg) {
        let Payload::PeerProperty { port, props } = &cmd.payload else {
            let e = cmd.malformed("peer-property");
            warn!(log_id = self.params.log_id, "CMD:{}: {e}", cmd.opcode);
            return cmd.ack(e.status());
        };
        let (port, props) = (*port, props.clone());
        let mut status = Status::Ok;
        for prop in props {
            let res = match prop.property {
                PortProperty::IsUpstreamRt => self.update_input_from_upstream(port, prop),
                PortProperty::IsDownstreamRt | PortProperty::TopoState => self.update_output_from_downstream(port, prop),
                PortProperty::Other(id) => Err(OlcError::unsupported(format!("peer property 0x{id:X}"))),
            };
            if let Err(e) = res {
                warn!(log_id = self.params.log_id, "CMD:{}: port {port}: {e}", cmd.opcode);
                status = status.merge(e.status());
            }
        }
        self.handle_frame_length_n_state_change();
        self.refresh_port_mask();
        cmd.ack(status);
    }

    fn update_input_from_upstream(&mut self, key: PortRef, prop: PeerProperty) -> Result<()> {
        let port = self
            .ext_in
            .iter_mut()
            .find(|p| p.key() == key)
            .ok_or_else(|| OlcError::not_found(format!("ext in port {key}")))?;
        let rt = prop.value != 0;
        if port.upstream_rt != rt {
            port.upstream_rt = rt;
            self.events.rt_ftrt_change = true;
            debug!(log_id = self.params.log_id, "ext in port {key}: upstream RT {rt}");
        }
        if let Some(handle) = port.write_port() {
            self.driver.peer_port_property(handle, prop)?;
        }
        Ok(())
    }

    fn update_output_from_downstream(&mut self, key: PortRef, prop: PeerProperty) -> Result<()> {
        let port = self
            .ext_out
            .iter_mut()
            .find(|p| p.key() == key)
            .ok_or_else(|| OlcError::not_found(format!("ext out port {key}")))?;
        match prop.property {
            PortProperty::IsDownstreamRt => {
                let rt = prop.value != 0;
                if port.icb.ds_is_real_time != rt {
                    port.icb.ds_is_real_time = rt;
                    self.events.rt_ftrt_change = true;
                }
            }
            PortProperty::TopoState => {
                port.connected_state = PortState::from_raw(prop.value);
                let sg_state = self.graph.sub_graph(port.sub_graph()).map_or(SgState::Stopped, |sg| sg.state);
                port.state = sg_state.as_port_state().downgrade(port.connected_state);
            }
            _ => {}
        }
        if let Some(handle) = port.read_port() {
            self.driver.peer_port_property(handle, prop)?;
        }
        Ok(())
    }

    pub(crate) fn upstream_stopped_cmd(&mut self, cmd: CommandMsg) {
        let Payload::UpstreamStopped { port: key } = cmd.payload else {
            let e = cmd.malformed("upstream-stopped");
            return cmd.ack(e.status());
        };
        if !self.satellite_up {
            warn!(log_id = self.params.log_id, "CMD:{}: satellite is down", cmd.opcode);
            return cmd.ack(OlcError::SatelliteDown.status());
        }
        let Some(port) = self.ext_in.iter_mut().find(|p| p.key() == key) else {
            warn!(log_id = self.params.log_id, "CMD:{}: no ext in port {key}", cmd.opcode);
            return cmd.ack(Status::BadParam);
        };
        port.flush_input_data_queue(self.driver.as_mut(), true, false, false, &mut self.flushing_eos_in_flight);
        cmd.ack(Status::Ok);
    }

    pub(crate) fn icb_info_cmd(&mut self, cmd: CommandMsg) {
        let Payload::IcbInfo { port: key, info } = cmd.payload else {
            let e = cmd.malformed("icb-info");
            return cmd.ack(e.status());
        };
        if !self.satellite_up {
            warn!(log_id = self.params.log_id, "CMD:{}: satellite is down", cmd.opcode);
            return cmd.ack(OlcError::SatelliteDown.status());
        }
        let frame = self.configured_frame_size_us;
        let Some(port) = self.ext_out.iter_mut().find(|p| p.key() == key) else {
            warn!(log_id = self.params.log_id, "CMD:{}: no ext out port {key}", cmd.opcode);
            return cmd.ack(Status::BadParam);
        };
        port.icb.ds_frame_len_us = info.frame_len_us;
        port.icb.ds_period_us = info.period_us;
        port.icb.ds_is_real_time = info.is_real_time;
        let status = match port.recreate_ext_out_buffers(self.driver.as_mut(), frame) {
            Ok(()) => Status::Ok,
            Err(e) => {
                warn!(log_id = self.params.log_id, "CMD:{}: port {key}: {e}", cmd.opcode);
                e.status()
            }
        };
        cmd.ack(status);
    }

    pub(crate) fn ctrl_mf_cmd(&mut self, cmd: CommandMsg) {
        let Payload::MediaFormat { port: key, fmt } = cmd.payload else {
            let e = cmd.malformed("media-format");
            return cmd.ack(e.status());
        };
        if !self.satellite_up {
            warn!(log_id = self.params.log_id, "CMD:{}: satellite is down", cmd.opcode);
            return cmd.ack(OlcError::SatelliteDown.status());
        }
        let Some(port) = self.ext_in.iter_mut().find(|p| p.key() == key) else {
            warn!(log_id = self.params.log_id, "CMD:{}: no ext in port {key}", cmd.opcode);
            return cmd.ack(Status::BadParam);
        };
        if port.upstream.is_none() {
            warn!(
                log_id = self.params.log_id,
                "CMD:{}: ext in port {key} has no upstream; media format dropped",
                cmd.opcode
            );
            return cmd.ack(Status::Ok);
        }
        if port.state == PortState::Started && port.connected_state == PortState::Started {
            warn!(
                log_id = self.params.log_id,
                "CMD:{}: ext in port {key} and its peer are running; control-path media format rejected",
                cmd.opcode
            );
            return cmd.ack(Status::Unsupported);
        }
        port.media_fmt = fmt;
        port.flags.pending_mf = true;
        self.channel.signal(port.bit());
        cmd.ack(Status::Ok);
    }

    // --- reports from the satellite ---

    /// Properties reported on a read port: the satellite's upstream side,
    /// passed on to the downstream peer.
    pub(crate) fn propagate_to_downstream(&mut self, index: usize, props: Vec<PeerProperty>) {
        let frame = self.configured_frame_size_us;
        let Some(port) = self.ext_out.get_mut(index) else {
            return;
        };
        for prop in props {
            if prop.property == PortProperty::IsUpstreamRt {
                let rt = prop.value != 0;
                if port.is_upstream_rt == rt {
                    continue;
                }
                port.is_upstream_rt = rt;
                self.events.rt_ftrt_change = true;
                if let Err(e) = port.recreate_ext_out_buffers(self.driver.as_mut(), frame) {
                    warn!(log_id = self.params.log_id, "ext out port {}: {e}", port.key());
                }
            }
            match port.send_peer_property(prop) {
                Ok(true) => {}
                Ok(false) => debug!(log_id = self.params.log_id, "ext out port {}: no downstream", port.key()),
                Err(e) => warn!(log_id = self.params.log_id, "ext out port {}: {e}", port.key()),
            }
        }
    }

    /// Properties reported on a write port: the satellite's downstream side,
    /// passed on to the upstream peer.
    pub(crate) fn propagate_to_upstream(&mut self, index: usize, props: Vec<PeerProperty>) {
        let Some(port) = self.ext_in.get(index) else {
            return;
        };
        for prop in props {
            if prop.property == PortProperty::TopoState && PortState::from_raw(prop.value) == PortState::Stopped {
                if let Some(handle) = port.write_port() {
                    self.driver.process_upstream_stopped(handle);
                }
            }
            let Some(upstream) = &port.upstream else {
                debug!(log_id = self.params.log_id, "ext in port {}: no upstream", port.key());
                continue;
            };
            if upstream.cmd.try_send(PeerCtrlMsg::PropertyUpdate(vec![prop])).is_err() {
                warn!(log_id = self.params.log_id, "ext in port {}: upstream queue unavailable", port.key());
            }
        }
    }
}
