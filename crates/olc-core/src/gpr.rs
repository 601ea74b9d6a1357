//! Client GPR registrations.
//!
//! Modules of an open sub-graph are registered with the client transport so
//! that packets addressed to them reach the container. Event registrations
//! from `REGISTER_MODULE_EVENTS` are tracked per `(module, event_id)`.

use std::collections::{BTreeMap, BTreeSet};

use crate::ids::ModuleId;

/// `APM_CMD_SET_CFG`.
pub const APM_CMD_SET_CFG: u32 = 0x0100_1006;
/// `APM_CMD_GET_CFG`.
pub const APM_CMD_GET_CFG: u32 = 0x0100_1007;
/// `APM_CMD_REGISTER_CFG`.
pub const APM_CMD_REGISTER_CFG: u32 = 0x0100_1008;
/// `APM_CMD_DEREGISTER_CFG`.
pub const APM_CMD_DEREGISTER_CFG: u32 = 0x0100_1009;
/// `APM_CMD_REGISTER_SHARED_CFG`.
pub const APM_CMD_REGISTER_SHARED_CFG: u32 = 0x0100_100A;
/// `APM_CMD_DEREGISTER_SHARED_CFG`.
pub const APM_CMD_DEREGISTER_SHARED_CFG: u32 = 0x0100_100B;
/// `APM_CMD_REGISTER_MODULE_EVENTS`.
pub const APM_CMD_REGISTER_MODULE_EVENTS: u32 = 0x0100_100E;

/// How a client GPR packet is handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GprClass {
    /// Packed set/get config.
    PackedCfg,
    /// Packed persistent register/deregister.
    PackedPersistent,
    /// Module event registration.
    EventRegistration,
    /// Not handled.
    Unknown,
}

/// Classifies a GPR opcode.
pub fn classify(opcode: u32) -> GprClass {
    match opcode {
        APM_CMD_SET_CFG | APM_CMD_GET_CFG => GprClass::PackedCfg,
        APM_CMD_REGISTER_CFG
        | APM_CMD_DEREGISTER_CFG
        | APM_CMD_REGISTER_SHARED_CFG
        | APM_CMD_DEREGISTER_SHARED_CFG => GprClass::PackedPersistent,
        APM_CMD_REGISTER_MODULE_EVENTS => GprClass::EventRegistration,
        _ => GprClass::Unknown,
    }
}

/// Decodes the registration words of an event-registration parameter:
/// `[event_id, is_register]`.
pub fn event_registration(data: &[u8]) -> Option<(u32, bool)> {
    let word = |i: usize| -> Option<u32> {
        let b = data.get(i * 4..i * 4 + 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    };
    Some((word(0)?, word(1)? != 0))
}

/// Registered modules and module events.
#[derive(Debug, Default, Clone)]
pub struct GprRegistry {
    modules: BTreeSet<ModuleId>,
    events: BTreeMap<(ModuleId, u32), u32>,
}

impl GprRegistry {
    /// Registers a module. Returns `false` if it already was.
    pub fn register(&mut self, module: ModuleId) -> bool {
        self.modules.insert(module)
    }

    /// Deregisters a module and drops its event registrations.
    pub fn deregister(&mut self, module: ModuleId) -> bool {
        self.events.retain(|(m, _), _| *m != module);
        self.modules.remove(&module)
    }

    /// Returns `true` if `module` is registered.
    pub fn is_registered(&self, module: ModuleId) -> bool {
        self.modules.contains(&module)
    }

    /// Records an event registration with its client token.
    pub fn register_event(&mut self, module: ModuleId, event_id: u32, token: u32) {
        self.events.insert((module, event_id), token);
    }

    /// Drops an event registration.
    pub fn deregister_event(&mut self, module: ModuleId, event_id: u32) -> bool {
        self.events.remove(&(module, event_id)).is_some()
    }

    /// Client token of an event registration.
    pub fn event_token(&self, module: ModuleId, event_id: u32) -> Option<u32> {
        self.events.get(&(module, event_id)).copied()
    }

    /// Registered module count.
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}
