//! Configuration commands: set/get config, persistent config and client
//! GPR packets.
//!
//! Parameters addressed to the container instance id are handled here; the
//! rest go to the satellite. A mixed list is split, and the two results are
//! merged when the satellite answers.

use tracing::{debug, warn};

use crate::command::{CommandMsg, Opcode, ParamPayload, Payload};
use crate::container::Olc;
use crate::correlation::Continuation;
use crate::error::{OlcError, Result, Status};
use crate::gpr::{GprClass, classify, event_registration};
use crate::ids::ModuleId;
use crate::satellite::ResponseKind;

/// Processing duration in µs (set/get).
pub const PARAM_ID_PROC_DURATION: u32 = 0x0800_1000;
/// Path delay query: `[path_id]` in, `[path_id, delay_us]` out.
pub const PARAM_ID_PATH_DELAY: u32 = 0x0800_1001;
/// Path destroy: `[path_id]`, 0 means all paths.
pub const PARAM_ID_PATH_DESTROY: u32 = 0x0800_1002;
/// Profiling info: `[kpps, bw]` out.
pub const PARAM_ID_GET_PROF_INFO: u32 = 0x0800_1003;
/// Source module delay list.
pub const PARAM_ID_SRC_MOD_DELAY_LIST: u32 = 0x0800_1004;
/// Destroy of the source module delay list.
pub const PARAM_ID_DESTROY_SRC_MOD_DELAY_LIST: u32 = 0x0800_1005;
/// Voice session info.
pub const PARAM_ID_VOICE_SESSION_INFO: u32 = 0x0800_1006;

/// Where the parameters of one command go.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CfgDestination {
    /// Only container parameters.
    ContainerOnly,
    /// Only satellite module parameters.
    SatelliteOnly,
    /// Both; the list is split.
    SatelliteAndContainer,
}

impl CfgDestination {
    /// Classifies a parameter list by the container instance id.
    pub fn of(params: &[ParamPayload], container: ModuleId) -> Option<CfgDestination> {
        let local = params.iter().filter(|p| p.module == container).count();
        match (local, params.len() - local) {
            (0, 0) => None,
            (_, 0) => Some(CfgDestination::ContainerOnly),
            (0, _) => Some(CfgDestination::SatelliteOnly),
            _ => Some(CfgDestination::SatelliteAndContainer),
        }
    }
}

fn words(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

impl Olc {
    pub(crate) fn set_get_cfg_cmd(&mut self, mut cmd: CommandMsg) {
        let is_set = cmd.opcode == Opcode::SetCfg;
        let params = match std::mem::replace(&mut cmd.payload, Payload::Empty) {
            Payload::ParamCfg(params) => params,
            other => {
                cmd.payload = other;
                let e = cmd.malformed("param-cfg");
                warn!(log_id = self.params.log_id, "CMD:{}: {e}", cmd.opcode);
                return cmd.ack(e.status());
            }
        };
        let container = ModuleId(self.params.container_id);
        let Some(dest) = CfgDestination::of(&params, container) else {
            warn!(log_id = self.params.log_id, "CMD:{}: no parameters", cmd.opcode);
            return cmd.ack(Status::Unexpected);
        };
        debug!(
            log_id = self.params.log_id,
            "CMD:{}: {} params, {dest:?}",
            cmd.opcode,
            params.len()
        );

        let (mut local, remote): (Vec<_>, Vec<_>) = params.into_iter().partition(|p| p.module == container);
        let mut local_status = Status::Ok;
        for param in &mut local {
            param.status = match self.set_get_container_param(is_set, param) {
                Ok(()) => Status::Ok,
                Err(e) => {
                    warn!(
                        log_id = self.params.log_id,
                        "container param 0x{:08X}: {e}",
                        param.param_id
                    );
                    e.status()
                }
            };
            local_status = local_status.merge(param.status);
        }

        if remote.is_empty() {
            return cmd.ack_with(local_status, local);
        }
        if !self.satellite_up {
            warn!(log_id = self.params.log_id, "CMD:{}: satellite is down", cmd.opcode);
            return cmd.ack_with(local_status.merge(OlcError::SatelliteDown.status()), local);
        }
        cmd.payload = Payload::ParamCfg(remote);
        let cont = Continuation::Cfg {
            is_set,
            local,
            local_status,
        };
        self.forward(cmd, ResponseKind::SetGetCfg, cont, |driver, id, cmd| {
            Ok(driver.send_cfg(id, is_set, cmd.params()?)?)
        });
    }

    /// Sets or gets one container parameter in place.
    fn set_get_container_param(&mut self, is_set: bool, param: &mut ParamPayload) -> Result<()> {
        match param.param_id {
            PARAM_ID_PROC_DURATION => {
                if !is_set {
                    param.data = words(&[self.proc_duration_us()]);
                    return Ok(());
                }
                let value = param
                    .word(0)
                    .ok_or_else(|| OlcError::invalid_state("proc duration payload too short"))?;
                if value == 0 {
                    return Err(OlcError::invalid_state("proc duration 0"));
                }
                self.pm.proc_duration_us = value;
                self.pm.proc_dur_set_paramed = true;
                self.events.proc_dur_change = true;
                debug!(log_id = self.params.log_id, "proc duration set to {value}us");
                Ok(())
            }
            PARAM_ID_PATH_DELAY => {
                let path_id = param.word(0).unwrap_or(0);
                if path_id == 0 {
                    return Err(OlcError::bad_param("path id 0"));
                }
                let delay = self.driver.query_path_delay(path_id)?;
                param.data = words(&[path_id, delay]);
                Ok(())
            }
            PARAM_ID_PATH_DESTROY => {
                let path_id = param.word(0).unwrap_or(0);
                self.driver.destroy_path(path_id)?;
                Ok(())
            }
            PARAM_ID_GET_PROF_INFO => {
                let (kpps, bw) = self.aggregate_kpps_bw();
                param.data = words(&[kpps, bw]);
                Ok(())
            }
            PARAM_ID_SRC_MOD_DELAY_LIST | PARAM_ID_DESTROY_SRC_MOD_DELAY_LIST | PARAM_ID_VOICE_SESSION_INFO => Err(
                OlcError::bad_param(format!("param 0x{:08X} not supported by this container", param.param_id)),
            ),
            other => Err(OlcError::unexpected(format!("unknown container param 0x{other:08X}"))),
        }
    }

    pub(crate) fn persistent_cfg_cmd(&mut self, cmd: CommandMsg) {
        let register = cmd.opcode == Opcode::RegisterCfg;
        match cmd.params() {
            Ok([]) => return cmd.ack(Status::Unexpected),
            Ok(_) => {}
            Err(e) => {
                warn!(log_id = self.params.log_id, "CMD:{}: {e}", cmd.opcode);
                return cmd.ack(e.status());
            }
        }
        if !self.satellite_up {
            warn!(log_id = self.params.log_id, "CMD:{}: satellite is down", cmd.opcode);
            return cmd.ack(OlcError::SatelliteDown.status());
        }
        self.forward(cmd, ResponseKind::Persistent, Continuation::Persistent { register }, |driver, id, cmd| {
            Ok(driver.send_persistent_cfg(id, register, cmd.params()?)?)
        });
    }

    pub(crate) fn gpr_cmd(&mut self, cmd: CommandMsg) {
        let packet = match cmd.gpr() {
            Ok(packet) => packet,
            Err(e) => {
                warn!(log_id = self.params.log_id, "CMD:{}: {e}", cmd.opcode);
                return cmd.ack(e.status());
            }
        };
        let class = classify(packet.opcode);
        if class == GprClass::Unknown {
            let e = if self.gpr.is_registered(packet.dst_module) {
                OlcError::unsupported(format!("GPR opcode 0x{:08X}", packet.opcode))
            } else {
                OlcError::not_found(format!("module {}", packet.dst_module))
            };
            warn!(log_id = self.params.log_id, "CMD:{}: {e}", cmd.opcode);
            return cmd.ack(e.status());
        }
        if !self.satellite_up {
            warn!(log_id = self.params.log_id, "CMD:{}: satellite is down", cmd.opcode);
            return cmd.ack(OlcError::SatelliteDown.status());
        }
        match class {
            GprClass::PackedCfg | GprClass::PackedPersistent => {
                let kind = if class == GprClass::PackedCfg {
                    ResponseKind::SetGetCfgPacked
                } else {
                    ResponseKind::PersistentPacked
                };
                self.forward(cmd, kind, Continuation::Packed, |driver, id, cmd| {
                    Ok(driver.send_packed_cfg(id, kind, cmd.gpr()?)?)
                });
            }
            GprClass::EventRegistration => {
                let registrations = packet
                    .params
                    .iter()
                    .filter_map(|p| event_registration(&p.data).map(|(event, on)| (p.module, event, on)))
                    .collect();
                self.forward(
                    cmd,
                    ResponseKind::EventReg,
                    Continuation::EventReg { registrations },
                    |driver, id, cmd| Ok(driver.register_module_events(id, cmd.gpr()?)?),
                );
            }
            GprClass::Unknown => {}
        }
    }

    pub(crate) fn satellite_gpr_cmd(&mut self, mut cmd: CommandMsg) {
        match std::mem::replace(&mut cmd.payload, Payload::Empty) {
            Payload::Satellite(packet) => {
                self.satellite_packet(packet);
                cmd.ack(Status::Ok);
            }
            other => {
                cmd.payload = other;
                let e = cmd.malformed("satellite");
                warn!(log_id = self.params.log_id, "CMD:{}: {e}", cmd.opcode);
                cmd.ack(e.status());
            }
        }
    }
}
