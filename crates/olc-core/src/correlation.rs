//! Pending satellite operations.
//!
//! A command that needs a satellite response is parked here under a fresh
//! [`CorrelationId`] together with a [`Continuation`] describing what is
//! left to do. The response handler takes the entry out; a second response
//! with the same id finds nothing and is dropped, so a completion runs at
//! most once.

use std::collections::BTreeMap;

use tracing::{debug, error};

use crate::bitmask::CMD_BIT;
use crate::command::{CommandMsg, ParamPayload};
use crate::container::Olc;
use crate::error::{OlcError, Status};
use crate::ids::{CorrelationId, ModuleId, PortRef, SubGraphId};
use crate::satellite::{Dispatch, ResponseKind, SatelliteDriver};
use crate::topology::{ExtPortKind, SgState};

/// What the response handler still has to do.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Continuation {
    /// Graph open: what this command added.
    Open {
        sub_graphs: Vec<SubGraphId>,
        modules: Vec<ModuleId>,
        ports: Vec<(ExtPortKind, PortRef)>,
    },
    /// Prepare, start, suspend, stop, flush or close. `prior` holds the
    /// sub-graph states from before the command was applied.
    Mgmt {
        sub_graphs: Vec<SubGraphId>,
        prior: Vec<(SubGraphId, SgState)>,
    },
    /// Set/get config, with the container's share already handled.
    Cfg {
        is_set: bool,
        local: Vec<ParamPayload>,
        local_status: Status,
    },
    /// Persistent register/deregister.
    Persistent { register: bool },
    /// Packed config from a GPR packet.
    Packed,
    /// Module event registration: `(module, event_id, is_register)`.
    EventReg {
        registrations: Vec<(ModuleId, u32, bool)>,
    },
}

/// A command waiting for its satellite response.
#[derive(Debug)]
pub(crate) struct PendingCommand {
    pub id: CorrelationId,
    pub kind: ResponseKind,
    pub cmd: CommandMsg,
    pub cont: Continuation,
}

/// Why a response could not be matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Miss {
    /// No command is parked under the id.
    Unknown,
    /// The parked command expects another response kind.
    Mismatch { expected: ResponseKind },
}

/// Parked commands by correlation id.
#[derive(Debug)]
pub(crate) struct PendingOps {
    next: u32,
    map: BTreeMap<CorrelationId, PendingCommand>,
}

impl Default for PendingOps {
    fn default() -> Self {
        Self {
            next: 1,
            map: BTreeMap::new(),
        }
    }
}

impl PendingOps {
    /// Fresh id, never one that is currently parked.
    pub fn next_id(&mut self) -> CorrelationId {
        loop {
            let id = CorrelationId(self.next);
            self.next = self.next.wrapping_add(1).max(1);
            if !self.map.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn park(&mut self, pending: PendingCommand) {
        if let Some(old) = self.map.insert(pending.id, pending) {
            error!("correlation id {} reused; dropping the older command", old.id);
            old.cmd.ack(Status::Unexpected);
        }
    }

    /// Takes the command parked under `id` if it expects `kind`.
    ///
    /// On a kind mismatch the entry stays parked.
    pub fn take(&mut self, id: CorrelationId, kind: ResponseKind) -> Result<PendingCommand, Miss> {
        let pending = self.map.remove(&id).ok_or(Miss::Unknown)?;
        if pending.kind != kind {
            let expected = pending.kind;
            self.map.insert(id, pending);
            return Err(Miss::Mismatch { expected });
        }
        Ok(pending)
    }

    /// Removes every parked command, oldest id first.
    pub fn drain(&mut self) -> Vec<PendingCommand> {
        std::mem::take(&mut self.map).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

impl Olc {
    /// Hands `cmd` to the driver through `send` and either parks it or
    /// completes it in place.
    ///
    /// While a command is parked the command bit is left out of the listen
    /// mask, so commands are handled one at a time.
    pub(crate) fn forward<F>(&mut self, cmd: CommandMsg, kind: ResponseKind, cont: Continuation, send: F)
    where
        F: FnOnce(&mut dyn SatelliteDriver, CorrelationId, &CommandMsg) -> Result<Dispatch, OlcError>,
    {
        let id = self.pending.next_id();
        let outcome = send(self.driver.as_mut(), id, &cmd);
        let pending = PendingCommand { id, kind, cmd, cont };
        match outcome {
            Ok(Dispatch::AwaitResponse) => {
                debug!(
                    log_id = self.params.log_id,
                    "CMD:{}: waiting for satellite response {id} ({kind})",
                    pending.cmd.opcode
                );
                self.pending.park(pending);
                self.curr_chan_mask &= !CMD_BIT;
            }
            Ok(Dispatch::Completed) => self.complete(pending, Status::Ok, Vec::new()),
            Err(e) => {
                error!(
                    log_id = self.params.log_id,
                    "CMD:{}: sending to satellite failed: {e}",
                    pending.cmd.opcode
                );
                self.complete(pending, e.status(), Vec::new());
            }
        }
    }
}
