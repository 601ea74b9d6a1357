//! Scripted container scenarios.
//!
//! A scenario is a TOML file holding a container configuration, the
//! behaviour of the loopback satellite, and an ordered list of steps. Each
//! step is one command, one system message or one data event; steps that
//! produce a command acknowledgement may state the status they expect.
//!
//! ```toml
//! name = "start and stop"
//!
//! [satellite]
//! response_mode = "deferred"
//!
//! [[step]]
//! op = "open"
//! sub_graphs = [{ id = 1, perf_mode = "low-latency" }]
//! modules = [{ id = 0x10, sub_graph = 1 }]
//! inputs = [{ module = 0x10, port = 1 }]
//!
//! [[step]]
//! op = "start"
//! sub_graphs = [1]
//! expect = "ok"
//! ```

use std::path::Path;

use olc_core::sim::{LoopbackSatellite, ResponseMode};
use olc_core::{
    CommandMsg, GraphMgmtPayload, GraphOpenPayload, ModuleCfg, ModuleId, Opcode, ParamPayload, Payload,
    PeerProperty, PerfMode, PortProperty, PortRef, PortState, ResponseKind, ServiceStatus, Status, SubGraphCfg,
    SubGraphId, SystemMsg,
};
use serde::{Deserialize, Serialize};

use crate::container::ContainerConfig;
use crate::error::ConfigError;

/// A complete scenario file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Scenario {
    /// Scenario name.
    #[serde(default)]
    pub name: String,

    /// Optional description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Container under test.
    #[serde(default)]
    pub container: ContainerConfig,

    /// Loopback satellite behaviour.
    #[serde(default)]
    pub satellite: SatelliteConfig,

    /// Steps, in order.
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

impl Scenario {
    /// Load a scenario from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        Self::from_toml(&content)
    }

    /// Load a scenario from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Convert the scenario to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Checks the container configuration and every step.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.container.validate()?;
        for (index, step) in self.steps.iter().enumerate() {
            step.action.check(index)?;
        }
        Ok(())
    }
}

/// Response timing of the loopback satellite.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseModeSpec {
    /// Commands complete in place.
    Inline,
    /// Responses are queued and handled on a later dispatch.
    #[default]
    Deferred,
}

impl From<ResponseModeSpec> for ResponseMode {
    fn from(mode: ResponseModeSpec) -> Self {
        match mode {
            ResponseModeSpec::Inline => ResponseMode::Inline,
            ResponseModeSpec::Deferred => ResponseMode::Deferred,
        }
    }
}

/// Satellite response slot, as named in scenario files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ResponseKindSpec {
    /// Graph open.
    Open,
    /// Graph prepare.
    Prepare,
    /// Graph start.
    Start,
    /// Graph suspend.
    Suspend,
    /// Graph stop.
    Stop,
    /// Graph flush.
    Flush,
    /// Graph close.
    Close,
    /// Set/get config.
    SetGetCfg,
    /// Set/get config from a GPR packet.
    SetGetCfgPacked,
    /// Persistent register/deregister.
    Persistent,
    /// Persistent register/deregister from a GPR packet.
    PersistentPacked,
    /// Module event registration.
    EventReg,
}

impl From<ResponseKindSpec> for ResponseKind {
    fn from(kind: ResponseKindSpec) -> Self {
        match kind {
            ResponseKindSpec::Open => ResponseKind::Open,
            ResponseKindSpec::Prepare => ResponseKind::Prepare,
            ResponseKindSpec::Start => ResponseKind::Start,
            ResponseKindSpec::Suspend => ResponseKind::Suspend,
            ResponseKindSpec::Stop => ResponseKind::Stop,
            ResponseKindSpec::Flush => ResponseKind::Flush,
            ResponseKindSpec::Close => ResponseKind::Close,
            ResponseKindSpec::SetGetCfg => ResponseKind::SetGetCfg,
            ResponseKindSpec::SetGetCfgPacked => ResponseKind::SetGetCfgPacked,
            ResponseKindSpec::Persistent => ResponseKind::Persistent,
            ResponseKindSpec::PersistentPacked => ResponseKind::PersistentPacked,
            ResponseKindSpec::EventReg => ResponseKind::EventReg,
        }
    }
}

/// Acknowledgement status, as named in scenario files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StatusSpec {
    /// Success.
    Ok,
    /// Generic failure.
    Failed,
    /// Rejected parameter or payload.
    BadParam,
    /// Not handled.
    Unsupported,
    /// Pool exhausted.
    NoResource,
    /// Allocation failed.
    NoMemory,
    /// Satellite unreachable.
    NotReady,
    /// Container destroyed.
    Terminated,
    /// Internal invariant broken.
    Unexpected,
}

impl From<StatusSpec> for Status {
    fn from(status: StatusSpec) -> Self {
        match status {
            StatusSpec::Ok => Status::Ok,
            StatusSpec::Failed => Status::Failed,
            StatusSpec::BadParam => Status::BadParam,
            StatusSpec::Unsupported => Status::Unsupported,
            StatusSpec::NoResource => Status::NoResource,
            StatusSpec::NoMemory => Status::NoMemory,
            StatusSpec::NotReady => Status::NotReady,
            StatusSpec::Terminated => Status::Terminated,
            StatusSpec::Unexpected => Status::Unexpected,
        }
    }
}

/// Forced failure of one response kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailRule {
    /// Which responses fail.
    pub kind: ResponseKindSpec,
    /// Status they carry.
    #[serde(default = "default_fail_status")]
    pub status: StatusSpec,
}

fn default_fail_status() -> StatusSpec {
    StatusSpec::Failed
}

/// Loopback satellite behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SatelliteConfig {
    /// When responses are delivered.
    #[serde(default)]
    pub response_mode: ResponseModeSpec,

    /// Report a written EOS as consumed right away.
    #[serde(default = "default_auto_eos_done")]
    pub auto_eos_done: bool,

    /// Delay returned for path-delay queries.
    #[serde(default)]
    pub path_delay_us: u32,

    /// Responses forced to fail.
    #[serde(default, rename = "fail")]
    pub failures: Vec<FailRule>,
}

fn default_auto_eos_done() -> bool {
    true
}

impl Default for SatelliteConfig {
    fn default() -> Self {
        Self {
            response_mode: ResponseModeSpec::default(),
            auto_eos_done: default_auto_eos_done(),
            path_delay_us: 0,
            failures: Vec::new(),
        }
    }
}

impl SatelliteConfig {
    /// Loopback satellite with this behaviour.
    pub fn build(&self) -> LoopbackSatellite {
        let mut sat = LoopbackSatellite::new()
            .with_response_mode(self.response_mode.into())
            .with_auto_eos_done(self.auto_eos_done)
            .with_path_delay(self.path_delay_us);
        for rule in &self.failures {
            sat = sat.fail_kind(rule.kind.into(), rule.status.into());
        }
        sat
    }
}

/// Address of a module port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortSpec {
    /// Module instance id.
    pub module: u32,
    /// Port id.
    pub port: u32,
}

impl From<PortSpec> for PortRef {
    fn from(spec: PortSpec) -> Self {
        PortRef::new(spec.module, spec.port)
    }
}

/// Sub-graph performance mode.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PerfModeSpec {
    /// 1 ms frames.
    LowLatency,
    /// 5 ms frames.
    #[default]
    LowPower,
}

impl From<PerfModeSpec> for PerfMode {
    fn from(mode: PerfModeSpec) -> Self {
        match mode {
            PerfModeSpec::LowLatency => PerfMode::LowLatency,
            PerfModeSpec::LowPower => PerfMode::LowPower,
        }
    }
}

/// One sub-graph of an open step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubGraphSpec {
    /// Sub-graph id.
    pub id: u32,
    /// Declared performance mode.
    #[serde(default)]
    pub perf_mode: PerfModeSpec,
}

/// One module of an open step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModuleSpec {
    /// Instance id.
    pub id: u32,
    /// Owning sub-graph.
    pub sub_graph: u32,
}

/// One module parameter. `words` are encoded little-endian.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParamSpec {
    /// Target module instance id, or the container id for container parameters.
    pub module: u32,
    /// Parameter id.
    pub param_id: u32,
    /// Payload words.
    #[serde(default)]
    pub words: Vec<u32>,
}

impl ParamSpec {
    /// Engine form of this parameter.
    pub fn to_payload(&self) -> ParamPayload {
        let data = self.words.iter().flat_map(|w| w.to_le_bytes()).collect();
        ParamPayload::new(self.module, self.param_id, data)
    }
}

/// Target of a sub-graph management step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MgmtTarget {
    /// Sub-graph ids.
    #[serde(default)]
    pub sub_graphs: Vec<u32>,
    /// Individual external ports.
    #[serde(default)]
    pub ports: Vec<PortSpec>,
}

impl MgmtTarget {
    fn to_payload(&self) -> Payload {
        Payload::GraphMgmt(GraphMgmtPayload {
            sub_graphs: self.sub_graphs.iter().copied().map(SubGraphId).collect(),
            ports: self.ports.iter().copied().map(PortRef::from).collect(),
        })
    }
}

/// Parameters of a config step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParamList {
    /// Parameters in order.
    #[serde(default)]
    pub params: Vec<ParamSpec>,
}

impl ParamList {
    fn to_payload(&self) -> Payload {
        Payload::ParamCfg(self.params.iter().map(ParamSpec::to_payload).collect())
    }
}

/// Which side of a local port a peer is connected on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum PeerSide {
    /// The peer feeds a local external input.
    Upstream,
    /// The peer consumes a local external output.
    Downstream,
}

/// Port state, as named in scenario files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StateSpec {
    /// Stopped.
    Stopped,
    /// Prepared.
    Prepared,
    /// Started.
    Started,
    /// Suspended.
    Suspended,
}

impl From<StateSpec> for PortState {
    fn from(state: StateSpec) -> Self {
        match state {
            StateSpec::Stopped => PortState::Stopped,
            StateSpec::Prepared => PortState::Prepared,
            StateSpec::Started => PortState::Started,
            StateSpec::Suspended => PortState::Suspended,
        }
    }
}

/// A peer port property update.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "property", rename_all = "kebab-case")]
pub enum PropertySpec {
    /// Upstream real-time flag.
    IsUpstreamRt {
        /// Flag value.
        on: bool,
    },
    /// Downstream real-time flag.
    IsDownstreamRt {
        /// Flag value.
        on: bool,
    },
    /// Peer port state.
    TopoState {
        /// New state.
        state: StateSpec,
    },
}

impl From<PropertySpec> for PeerProperty {
    fn from(spec: PropertySpec) -> Self {
        match spec {
            PropertySpec::IsUpstreamRt { on } => PeerProperty::flag(PortProperty::IsUpstreamRt, on),
            PropertySpec::IsDownstreamRt { on } => PeerProperty::flag(PortProperty::IsDownstreamRt, on),
            PropertySpec::TopoState { state } => PeerProperty::state(state.into()),
        }
    }
}

fn default_peer_capacity() -> usize {
    16
}

fn default_bytes() -> usize {
    1920
}

fn default_count() -> u32 {
    1
}

/// What one step does.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Action {
    /// Open sub-graphs with their modules and external ports.
    Open {
        /// Sub-graphs.
        #[serde(default)]
        sub_graphs: Vec<SubGraphSpec>,
        /// Modules.
        #[serde(default)]
        modules: Vec<ModuleSpec>,
        /// External inputs.
        #[serde(default)]
        inputs: Vec<PortSpec>,
        /// External outputs.
        #[serde(default)]
        outputs: Vec<PortSpec>,
        /// External control ports.
        #[serde(default)]
        ctrl: Vec<PortSpec>,
    },
    /// Prepare.
    Prepare(MgmtTarget),
    /// Start.
    Start(MgmtTarget),
    /// Suspend.
    Suspend(MgmtTarget),
    /// Stop.
    Stop(MgmtTarget),
    /// Flush.
    Flush(MgmtTarget),
    /// Close.
    Close(MgmtTarget),
    /// Disconnect ports.
    Disconnect(MgmtTarget),
    /// Attach a simulated peer container to a local port.
    Connect {
        /// Local external port.
        port: PortSpec,
        /// Side the peer sits on.
        side: PeerSide,
        /// Peer queue depth.
        #[serde(default = "default_peer_capacity")]
        capacity: usize,
    },
    /// Set config.
    SetCfg(ParamList),
    /// Get config.
    GetCfg(ParamList),
    /// Register persistent config.
    RegisterCfg(ParamList),
    /// Deregister persistent config.
    DeregisterCfg(ParamList),
    /// Property update from the peer of a local port.
    PeerProperty {
        /// Local external port.
        port: PortSpec,
        /// Update.
        update: PropertySpec,
    },
    /// The upstream of a local input acknowledged its stop.
    UpstreamStopped {
        /// Local external input.
        port: PortSpec,
    },
    /// Control message for a control port.
    CtrlTrigger {
        /// Local external control port.
        port: PortSpec,
        /// Message bytes.
        #[serde(default)]
        data: Vec<u8>,
    },
    /// Upstream peer writes buffers into a local input.
    PushData {
        /// Local external input.
        port: PortSpec,
        /// Bytes per buffer.
        #[serde(default = "default_bytes")]
        bytes: usize,
        /// Number of buffers.
        #[serde(default = "default_count")]
        count: u32,
    },
    /// Satellite produces data on a read port.
    SatelliteRead {
        /// Local external output fed by the read port.
        port: PortSpec,
        /// Bytes read.
        #[serde(default = "default_bytes")]
        bytes: usize,
    },
    /// Satellite went down.
    SatelliteDown,
    /// Satellite came back up.
    SatelliteUp,
    /// Destroy the container.
    Destroy,
}

impl Action {
    /// Step operation name, as written in scenario files.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Open { .. } => "open",
            Action::Prepare(_) => "prepare",
            Action::Start(_) => "start",
            Action::Suspend(_) => "suspend",
            Action::Stop(_) => "stop",
            Action::Flush(_) => "flush",
            Action::Close(_) => "close",
            Action::Disconnect(_) => "disconnect",
            Action::Connect { .. } => "connect",
            Action::SetCfg(_) => "set-cfg",
            Action::GetCfg(_) => "get-cfg",
            Action::RegisterCfg(_) => "register-cfg",
            Action::DeregisterCfg(_) => "deregister-cfg",
            Action::PeerProperty { .. } => "peer-property",
            Action::UpstreamStopped { .. } => "upstream-stopped",
            Action::CtrlTrigger { .. } => "ctrl-trigger",
            Action::PushData { .. } => "push-data",
            Action::SatelliteRead { .. } => "satellite-read",
            Action::SatelliteDown => "satellite-down",
            Action::SatelliteUp => "satellite-up",
            Action::Destroy => "destroy",
        }
    }

    /// Command sent to the container, for steps that are commands.
    ///
    /// `Connect` is a command too, but needs peer handles; the runner
    /// builds it.
    pub fn to_command(&self) -> Option<CommandMsg> {
        let (opcode, payload) = match self {
            Action::Open {
                sub_graphs,
                modules,
                inputs,
                outputs,
                ctrl,
            } => {
                let open = GraphOpenPayload {
                    sub_graphs: sub_graphs
                        .iter()
                        .map(|sg| SubGraphCfg {
                            id: SubGraphId(sg.id),
                            perf_mode: sg.perf_mode.into(),
                        })
                        .collect(),
                    modules: modules
                        .iter()
                        .map(|m| ModuleCfg {
                            id: ModuleId(m.id),
                            sub_graph: SubGraphId(m.sub_graph),
                        })
                        .collect(),
                    ext_inputs: inputs.iter().copied().map(PortRef::from).collect(),
                    ext_outputs: outputs.iter().copied().map(PortRef::from).collect(),
                    ext_ctrl: ctrl.iter().copied().map(PortRef::from).collect(),
                };
                (Opcode::GraphOpen, Payload::GraphOpen(open))
            }
            Action::Prepare(t) => (Opcode::GraphPrepare, t.to_payload()),
            Action::Start(t) => (Opcode::GraphStart, t.to_payload()),
            Action::Suspend(t) => (Opcode::GraphSuspend, t.to_payload()),
            Action::Stop(t) => (Opcode::GraphStop, t.to_payload()),
            Action::Flush(t) => (Opcode::GraphFlush, t.to_payload()),
            Action::Close(t) => (Opcode::GraphClose, t.to_payload()),
            Action::Disconnect(t) => (Opcode::GraphDisconnect, t.to_payload()),
            Action::SetCfg(p) => (Opcode::SetCfg, p.to_payload()),
            Action::GetCfg(p) => (Opcode::GetCfg, p.to_payload()),
            Action::RegisterCfg(p) => (Opcode::RegisterCfg, p.to_payload()),
            Action::DeregisterCfg(p) => (Opcode::DeregisterCfg, p.to_payload()),
            Action::PeerProperty { port, update } => (
                Opcode::PeerPortPropertyUpdate,
                Payload::PeerProperty {
                    port: (*port).into(),
                    props: vec![(*update).into()],
                },
            ),
            Action::UpstreamStopped { port } => (
                Opcode::UpstreamStoppedAck,
                Payload::UpstreamStopped { port: (*port).into() },
            ),
            Action::CtrlTrigger { port, data } => (
                Opcode::CtrlPortTrigger,
                Payload::CtrlPortTrigger {
                    port: (*port).into(),
                    data: data.clone(),
                },
            ),
            Action::Destroy => (Opcode::DestroyContainer, Payload::Empty),
            Action::Connect { .. }
            | Action::PushData { .. }
            | Action::SatelliteRead { .. }
            | Action::SatelliteDown
            | Action::SatelliteUp => return None,
        };
        Some(CommandMsg::new(opcode, payload))
    }

    /// System message, for satellite up/down steps.
    pub fn to_system_msg(&self) -> Option<SystemMsg> {
        match self {
            Action::SatelliteDown => Some(SystemMsg::ServiceStatus(ServiceStatus::Down)),
            Action::SatelliteUp => Some(SystemMsg::ServiceStatus(ServiceStatus::Up)),
            _ => None,
        }
    }

    /// The step produces a command acknowledgement.
    pub fn is_acked(&self) -> bool {
        !matches!(
            self,
            Action::PushData { .. } | Action::SatelliteRead { .. } | Action::SatelliteDown | Action::SatelliteUp
        )
    }

    fn check(&self, index: usize) -> Result<(), ConfigError> {
        let op = self.name();
        match self {
            Action::Open { sub_graphs, .. } if sub_graphs.is_empty() => {
                Err(ConfigError::invalid_step(index, op, "no sub-graphs"))
            }
            Action::PushData { count: 0, .. } => Err(ConfigError::invalid_step(index, op, "count is 0")),
            Action::Connect { capacity: 0, .. } => Err(ConfigError::invalid_step(index, op, "capacity is 0")),
            _ => Ok(()),
        }
    }
}

/// One scenario step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    /// What the step does.
    #[serde(flatten)]
    pub action: Action,

    /// Expected acknowledgement status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect: Option<StatusSpec>,
}

impl Step {
    /// Step without an expectation.
    pub fn new(action: Action) -> Self {
        Self { action, expect: None }
    }

    /// Expects `status` in the acknowledgement.
    pub fn expecting(mut self, status: StatusSpec) -> Self {
        self.expect = Some(status);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPEN_AND_START: &str = r#"
name = "open and start"

[satellite]
response_mode = "inline"
path_delay_us = 1500
fail = [{ kind = "stop", status = "not-ready" }]

[[step]]
op = "open"
sub_graphs = [{ id = 1, perf_mode = "low-latency" }]
modules = [{ id = 0x10, sub_graph = 1 }]
inputs = [{ module = 0x10, port = 1 }]
outputs = [{ module = 0x20, port = 1 }]

[[step]]
op = "start"
sub_graphs = [1]
expect = "ok"

[[step]]
op = "peer-property"
port = { module = 0x10, port = 1 }
update = { property = "topo-state", state = "stopped" }

[[step]]
op = "satellite-down"
"#;

    // --- parsing ---

    #[test]
    fn parses_steps_in_order() {
        let scenario = Scenario::from_toml(OPEN_AND_START).unwrap();
        let names: Vec<_> = scenario.steps.iter().map(|s| s.action.name()).collect();
        assert_eq!(names, ["open", "start", "peer-property", "satellite-down"]);
        assert_eq!(scenario.steps[1].expect, Some(StatusSpec::Ok));
        assert_eq!(scenario.steps[0].expect, None);
    }

    #[test]
    fn satellite_section_parses() {
        let scenario = Scenario::from_toml(OPEN_AND_START).unwrap();
        assert_eq!(scenario.satellite.response_mode, ResponseModeSpec::Inline);
        assert_eq!(scenario.satellite.path_delay_us, 1500);
        assert!(scenario.satellite.auto_eos_done);
        assert_eq!(
            scenario.satellite.failures,
            vec![FailRule {
                kind: ResponseKindSpec::Stop,
                status: StatusSpec::NotReady,
            }]
        );
    }

    #[test]
    fn missing_sections_take_defaults() {
        let scenario = Scenario::from_toml("name = \"empty\"").unwrap();
        assert_eq!(scenario.container, ContainerConfig::default());
        assert_eq!(scenario.satellite, SatelliteConfig::default());
        assert!(scenario.steps.is_empty());
    }

    #[test]
    fn unknown_op_is_a_parse_error() {
        let result = Scenario::from_toml("[[step]]\nop = \"teleport\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn data_steps_take_default_sizes() {
        let scenario = Scenario::from_toml(
            "[[step]]\nop = \"push-data\"\nport = { module = 0x10, port = 1 }\n",
        )
        .unwrap();
        assert_eq!(
            scenario.steps[0].action,
            Action::PushData {
                port: PortSpec { module: 0x10, port: 1 },
                bytes: 1920,
                count: 1,
            }
        );
    }

    // --- commands ---

    #[test]
    fn open_builds_graph_open_payload() {
        let scenario = Scenario::from_toml(OPEN_AND_START).unwrap();
        let cmd = scenario.steps[0].action.to_command().unwrap();
        assert_eq!(cmd.opcode, Opcode::GraphOpen);
        match cmd.payload {
            Payload::GraphOpen(open) => {
                assert_eq!(open.sub_graphs[0].perf_mode, PerfMode::LowLatency);
                assert_eq!(open.ext_inputs, vec![PortRef::new(0x10, 1)]);
                assert_eq!(open.ext_outputs, vec![PortRef::new(0x20, 1)]);
                assert!(open.ext_ctrl.is_empty());
            }
            other => panic!("expected an open payload, got {other:?}"),
        }
    }

    #[test]
    fn property_step_encodes_topo_state() {
        let scenario = Scenario::from_toml(OPEN_AND_START).unwrap();
        let cmd = scenario.steps[2].action.to_command().unwrap();
        assert_eq!(cmd.opcode, Opcode::PeerPortPropertyUpdate);
        match cmd.payload {
            Payload::PeerProperty { port, props } => {
                assert_eq!(port, PortRef::new(0x10, 1));
                assert_eq!(props, vec![PeerProperty::state(PortState::Stopped)]);
            }
            other => panic!("expected a property payload, got {other:?}"),
        }
    }

    #[test]
    fn param_words_are_little_endian() {
        let param = ParamSpec {
            module: 0x4000,
            param_id: 0x0800_1000,
            words: vec![1000, 0x0102_0304],
        };
        let payload = param.to_payload();
        assert_eq!(payload.data, vec![0xE8, 0x03, 0, 0, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn non_command_steps_build_no_command() {
        assert!(Action::SatelliteDown.to_command().is_none());
        assert_eq!(
            Action::SatelliteUp.to_system_msg(),
            Some(SystemMsg::ServiceStatus(ServiceStatus::Up))
        );
        assert!(!Action::SatelliteUp.is_acked());
        assert!(Action::Destroy.is_acked());
    }

    // --- validation ---

    #[test]
    fn empty_open_is_rejected() {
        let scenario = Scenario {
            steps: vec![Step::new(Action::Open {
                sub_graphs: Vec::new(),
                modules: Vec::new(),
                inputs: Vec::new(),
                outputs: Vec::new(),
                ctrl: Vec::new(),
            })],
            ..Scenario::default()
        };
        assert!(matches!(
            scenario.validate(),
            Err(ConfigError::InvalidStep { index: 0, op: "open", .. })
        ));
    }

    #[test]
    fn invalid_container_fails_scenario_validation() {
        let scenario = Scenario {
            container: ContainerConfig::new().with_data_queue_capacity(0),
            ..Scenario::default()
        };
        assert!(matches!(scenario.validate(), Err(ConfigError::Validation(_))));
    }
}
