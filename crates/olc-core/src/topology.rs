//! Shadow graph unit.
//!
//! The container keeps a shadow of the sub-graphs it proxies: which
//! sub-graphs are open and in what state, which modules they hold, and which
//! module ports are attached to external ports. No samples are processed
//! here; the graph unit only answers structural questions for the
//! lifecycle, power and propagation code.

use std::collections::BTreeMap;

use crate::command::{ModuleCfg, PerfMode, SubGraphCfg};
use crate::error::{OlcError, Result};
use crate::ids::{ModuleId, PortRef, SubGraphId};
use crate::port::PortState;

/// Sub-graph operation requested by a graph-management command.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SgOp {
    /// Prepare.
    Prepare,
    /// Start.
    Start,
    /// Suspend.
    Suspend,
    /// Stop.
    Stop,
    /// Flush (no state change).
    Flush,
    /// Close.
    Close,
    /// Disconnect (no state change).
    Disconnect,
}

impl SgOp {
    /// State the sub-graph ends up in, if the operation changes state.
    pub fn target_state(self) -> Option<SgState> {
        match self {
            SgOp::Prepare => Some(SgState::Prepared),
            SgOp::Start => Some(SgState::Started),
            SgOp::Suspend => Some(SgState::Suspended),
            SgOp::Stop | SgOp::Close => Some(SgState::Stopped),
            SgOp::Flush | SgOp::Disconnect => None,
        }
    }

    /// Log tag.
    pub fn name(self) -> &'static str {
        match self {
            SgOp::Prepare => "PREPARE",
            SgOp::Start => "START",
            SgOp::Suspend => "SUSPEND",
            SgOp::Stop => "STOP",
            SgOp::Flush => "FLUSH",
            SgOp::Close => "CLOSE",
            SgOp::Disconnect => "DISCONNECT",
        }
    }
}

/// Sub-graph state. A freshly opened sub-graph is `Stopped`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum SgState {
    /// Opened or stopped.
    #[default]
    Stopped,
    /// Prepared.
    Prepared,
    /// Started.
    Started,
    /// Suspended.
    Suspended,
}

impl SgState {
    /// Port state implied by this sub-graph state.
    pub fn as_port_state(self) -> PortState {
        match self {
            SgState::Stopped => PortState::Stopped,
            SgState::Prepared => PortState::Prepared,
            SgState::Started => PortState::Started,
            SgState::Suspended => PortState::Suspended,
        }
    }
}

/// Kind of external port attached to a module port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExtPortKind {
    /// External input.
    Input,
    /// External output.
    Output,
    /// External control port.
    Control,
}

/// One open sub-graph.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubGraph {
    /// Id.
    pub id: SubGraphId,
    /// Declared performance mode.
    pub perf_mode: PerfMode,
    /// Current state.
    pub state: SgState,
    /// Marked by close (or a failed open); removed by [`GraphUnit::remove_closing`].
    pub closing: bool,
    /// Modules in this sub-graph.
    pub modules: Vec<ModuleId>,
}

/// One module instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Module {
    /// Instance id.
    pub id: ModuleId,
    /// Owning sub-graph.
    pub sub_graph: SubGraphId,
    /// Ports attached to external ports.
    pub ext_ports: Vec<(ExtPortKind, PortRef)>,
}

/// What [`GraphUnit::remove_closing`] took out.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemovedGraph {
    /// Removed sub-graphs.
    pub sub_graphs: Vec<SubGraphId>,
    /// Removed modules.
    pub modules: Vec<ModuleId>,
    /// External ports whose modules were removed.
    pub ext_ports: Vec<(ExtPortKind, PortRef)>,
}

/// The container's shadow graph.
#[derive(Clone, Debug, Default)]
pub struct GraphUnit {
    sub_graphs: BTreeMap<SubGraphId, SubGraph>,
    modules: BTreeMap<ModuleId, Module>,
}

impl GraphUnit {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an opened sub-graph in the `Stopped` state.
    pub fn add_sub_graph(&mut self, cfg: &SubGraphCfg) -> Result<()> {
        if self.sub_graphs.contains_key(&cfg.id) {
            return Err(OlcError::invalid_state(format!("{} already open", cfg.id)));
        }
        self.sub_graphs.insert(
            cfg.id,
            SubGraph {
                id: cfg.id,
                perf_mode: cfg.perf_mode,
                state: SgState::Stopped,
                closing: false,
                modules: Vec::new(),
            },
        );
        Ok(())
    }

    /// Adds a module to an existing sub-graph.
    pub fn add_module(&mut self, cfg: &ModuleCfg) -> Result<()> {
        if self.modules.contains_key(&cfg.id) {
            return Err(OlcError::invalid_state(format!("module {} already exists", cfg.id)));
        }
        let sg = self
            .sub_graphs
            .get_mut(&cfg.sub_graph)
            .ok_or_else(|| OlcError::not_found(cfg.sub_graph.to_string()))?;
        sg.modules.push(cfg.id);
        self.modules.insert(
            cfg.id,
            Module {
                id: cfg.id,
                sub_graph: cfg.sub_graph,
                ext_ports: Vec::new(),
            },
        );
        Ok(())
    }

    /// Records that `port` is attached to an external port of `kind`.
    pub fn attach(&mut self, kind: ExtPortKind, port: PortRef) -> Result<SubGraphId> {
        let module = self
            .modules
            .get_mut(&port.module)
            .ok_or_else(|| OlcError::not_found(format!("module {}", port.module)))?;
        if module.ext_ports.iter().any(|(_, p)| *p == port) {
            return Err(OlcError::invalid_state(format!("port {port} already attached")));
        }
        module.ext_ports.push((kind, port));
        Ok(module.sub_graph)
    }

    /// Removes an attachment, if present.
    pub fn detach(&mut self, port: PortRef) {
        if let Some(module) = self.modules.get_mut(&port.module) {
            module.ext_ports.retain(|(_, p)| *p != port);
        }
    }

    /// Removes a module from its sub-graph, returning it.
    pub fn remove_module(&mut self, id: ModuleId) -> Option<Module> {
        let module = self.modules.remove(&id)?;
        if let Some(sg) = self.sub_graphs.get_mut(&module.sub_graph) {
            sg.modules.retain(|m| *m != id);
        }
        Some(module)
    }

    /// Looks up a sub-graph.
    pub fn sub_graph(&self, id: SubGraphId) -> Option<&SubGraph> {
        self.sub_graphs.get(&id)
    }

    /// Looks up a sub-graph for update.
    pub fn sub_graph_mut(&mut self, id: SubGraphId) -> Option<&mut SubGraph> {
        self.sub_graphs.get_mut(&id)
    }

    /// Looks up a module.
    pub fn module(&self, id: ModuleId) -> Option<&Module> {
        self.modules.get(&id)
    }

    /// All sub-graphs, by id.
    pub fn sub_graphs(&self) -> impl Iterator<Item = &SubGraph> {
        self.sub_graphs.values()
    }

    /// Number of open sub-graphs.
    pub fn num_sub_graphs(&self) -> usize {
        self.sub_graphs.len()
    }

    /// Returns `true` if any sub-graph is started.
    pub fn any_started(&self) -> bool {
        self.sub_graphs.values().any(|sg| sg.state == SgState::Started && !sg.closing)
    }

    /// State of the sub-graph owning `port`'s module.
    pub fn sg_state_of(&self, port: PortRef) -> Option<SgState> {
        let module = self.modules.get(&port.module)?;
        self.sub_graphs.get(&module.sub_graph).map(|sg| sg.state)
    }

    /// External ports attached to modules of sub-graph `id`.
    pub fn ext_ports_in(&self, id: SubGraphId) -> Vec<(ExtPortKind, PortRef)> {
        let Some(sg) = self.sub_graphs.get(&id) else {
            return Vec::new();
        };
        sg.modules
            .iter()
            .filter_map(|m| self.modules.get(m))
            .flat_map(|m| m.ext_ports.iter().copied())
            .collect()
    }

    /// Marks sub-graphs for removal.
    pub fn mark_closing(&mut self, ids: &[SubGraphId]) {
        for id in ids {
            if let Some(sg) = self.sub_graphs.get_mut(id) {
                sg.closing = true;
            }
        }
    }

    /// Removes every sub-graph marked closing, with its modules.
    pub fn remove_closing(&mut self) -> RemovedGraph {
        let closing: Vec<SubGraphId> = self
            .sub_graphs
            .values()
            .filter(|sg| sg.closing)
            .map(|sg| sg.id)
            .collect();
        let mut removed = RemovedGraph::default();
        for id in closing {
            let Some(sg) = self.sub_graphs.remove(&id) else {
                continue;
            };
            for module_id in sg.modules {
                if let Some(module) = self.modules.remove(&module_id) {
                    removed.ext_ports.extend(module.ext_ports);
                    removed.modules.push(module_id);
                }
            }
            removed.sub_graphs.push(id);
        }
        removed
    }
}
