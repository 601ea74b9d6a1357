//! Scenario runner.
//!
//! Drives one container through the steps of a scenario file, against the
//! loopback satellite, and prints the acknowledgement log followed by the
//! final container report.

use std::path::PathBuf;

use anyhow::{Context, anyhow};
use clap::Args;
use crossbeam_channel::{Receiver, Sender, unbounded};
use olc_config::scenario::PeerSide;
use olc_config::{Action, Scenario, Step};
use olc_core::sim::{LoopbackSatellite, PeerEndpoint, RecordingVoter};
use olc_core::{
    CmdAck, CommandMsg, DataBuffer, DataMsg, Olc, OlcHandle, OlcReport, Opcode, Payload, PeerLink, PortRef,
    SatReadData, Status,
};
use serde::Serialize;

#[derive(Args)]
pub struct RunArgs {
    /// Scenario file (TOML)
    pub scenario: PathBuf,

    /// Print the log and report as JSON
    #[arg(long)]
    pub json: bool,

    /// Exit successfully even when an expectation fails
    #[arg(long)]
    pub keep_going: bool,
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StepRecord {
    /// Zero-based step index.
    pub index: usize,
    /// Step operation.
    pub op: &'static str,
    /// Acknowledged opcode, for command steps.
    pub opcode: Option<String>,
    /// Acknowledged status.
    pub status: Option<String>,
    /// Expected status.
    pub expected: Option<String>,
    /// Parameters echoed in the ack.
    pub params: usize,
    /// Expectation held, or there was none.
    pub passed: bool,
}

/// A simulated peer attached by a `connect` step.
struct Peer {
    port: PortRef,
    side: PeerSide,
    endpoint: PeerEndpoint,
}

/// One container, its satellite and the peers attached so far.
pub struct ScenarioRunner {
    olc: Olc,
    sat: LoopbackSatellite,
    handle: OlcHandle,
    tx: Sender<CmdAck>,
    rx: Receiver<CmdAck>,
    peers: Vec<Peer>,
}

impl ScenarioRunner {
    /// Creates the container described by `scenario`.
    pub fn new(scenario: &Scenario) -> anyhow::Result<Self> {
        let sat = scenario.satellite.build();
        let olc = Olc::create(
            scenario.container.to_params(),
            Box::new(sat.clone()),
            Box::new(RecordingVoter::new()),
        )
        .context("failed to create container")?;
        let handle = olc.handle();
        let (tx, rx) = unbounded();
        Ok(Self {
            olc,
            sat,
            handle,
            tx,
            rx,
            peers: Vec::new(),
        })
    }

    /// Runs every step, stopping early once the container destroys itself.
    pub fn run_all(&mut self, steps: &[Step]) -> anyhow::Result<Vec<StepRecord>> {
        let mut records = Vec::with_capacity(steps.len());
        for (index, step) in steps.iter().enumerate() {
            records.push(self.step(index, step)?);
            if self.olc.is_terminated() {
                if index + 1 < steps.len() {
                    tracing::warn!(index, "container terminated, skipping remaining steps");
                }
                break;
            }
        }
        Ok(records)
    }

    /// Runs one step to quiescence.
    pub fn step(&mut self, index: usize, step: &Step) -> anyhow::Result<StepRecord> {
        tracing::debug!(index, op = step.action.name(), "step");
        match &step.action {
            Action::Connect { port, side, capacity } => {
                let port = PortRef::from(*port);
                let endpoint = PeerEndpoint::new(*capacity);
                let link = match side {
                    PeerSide::Upstream => PeerLink::Upstream {
                        port,
                        peer: endpoint.upstream_handle(),
                    },
                    PeerSide::Downstream => PeerLink::Downstream {
                        port,
                        peer: endpoint.downstream_handle(),
                    },
                };
                self.peers.push(Peer {
                    port,
                    side: *side,
                    endpoint,
                });
                self.send(CommandMsg::new(Opcode::GraphConnect, Payload::Connect(vec![link])))?;
            }
            Action::PushData { port, bytes, count } => {
                let port = PortRef::from(*port);
                let data = self
                    .olc
                    .ext_in_port(port)
                    .ok_or_else(|| anyhow!("step {index}: no external input {port}"))?
                    .data_handle();
                for _ in 0..*count {
                    data.push(DataMsg::Buffer(DataBuffer::filled(vec![0; *bytes])))
                        .map_err(|e| anyhow!("step {index}: input {port}: {e}"))?;
                }
            }
            Action::SatelliteRead { port, bytes } => {
                let port = PortRef::from(*port);
                let read = SatReadData {
                    data: vec![0; *bytes],
                    ..SatReadData::default()
                };
                if !self.sat.push_read(port, read) {
                    anyhow::bail!("step {index}: no satellite read port behind {port}");
                }
            }
            action => {
                if let Some(msg) = action.to_system_msg() {
                    self.handle
                        .send_system(msg)
                        .map_err(|e| anyhow!("step {index}: system queue: {e}"))?;
                } else if let Some(cmd) = action.to_command() {
                    self.send(cmd)?;
                }
            }
        }
        self.olc.run_until_idle();

        let ack = if step.action.is_acked() {
            self.rx.try_recv().ok()
        } else {
            None
        };
        let expected = step.expect.map(Status::from);
        let passed = match (expected, &ack) {
            (None, _) => true,
            (Some(want), Some(ack)) => ack.status == want,
            (Some(_), None) => false,
        };
        Ok(StepRecord {
            index,
            op: step.action.name(),
            opcode: ack.as_ref().map(|a| a.opcode.to_string()),
            status: ack.as_ref().map(|a| a.status.to_string()),
            expected: expected.map(|s| s.to_string()),
            params: ack.as_ref().map_or(0, |a| a.params.len()),
            passed,
        })
    }

    fn send(&self, cmd: CommandMsg) -> anyhow::Result<()> {
        self.handle
            .send(cmd.with_responder(self.tx.clone()))
            .map_err(|e| anyhow!("command queue: {e}"))
    }

    /// Container snapshot.
    pub fn report(&self) -> OlcReport {
        self.olc.report()
    }

    /// Data messages each downstream peer has received, draining them.
    pub fn drain_downstream(&self) -> Vec<(PortRef, usize)> {
        self.peers
            .iter()
            .filter(|p| p.side == PeerSide::Downstream)
            .map(|p| {
                let mut n = 0;
                while p.endpoint.try_recv_data().is_some() {
                    n += 1;
                }
                (p.port, n)
            })
            .collect()
    }
}

/// Run the scenario command.
pub fn run(args: RunArgs) -> anyhow::Result<()> {
    let scenario = Scenario::load(&args.scenario)
        .with_context(|| format!("failed to load scenario {}", args.scenario.display()))?;
    scenario.validate().context("invalid scenario")?;

    let mut runner = ScenarioRunner::new(&scenario)?;
    let records = runner.run_all(&scenario.steps)?;
    let report = runner.report();
    let delivered = runner.drain_downstream();
    let failed = records.iter().filter(|r| !r.passed).count();

    if args.json {
        let json = serde_json::json!({
            "scenario": scenario.name,
            "steps": records,
            "failed": failed,
            "delivered": delivered
                .iter()
                .map(|(port, n)| serde_json::json!({ "port": port.to_string(), "messages": n }))
                .collect::<Vec<_>>(),
            "report": report_json(&report),
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
    } else {
        print_text(&scenario, &records, &report, &delivered);
    }

    if failed > 0 && !args.keep_going {
        anyhow::bail!("{failed} step(s) did not meet their expectation");
    }
    Ok(())
}

fn report_json(report: &OlcReport) -> serde_json::Value {
    serde_json::json!({
        "log_id": report.log_id,
        "configured_frame_size_us": report.configured_frame_size_us,
        "curr_chan_mask": format!("0x{:08X}", report.curr_chan_mask),
        "satellite_up": report.satellite_up,
        "terminated": report.terminated,
        "is_started": report.is_started,
        "sub_graphs": report
            .sub_graphs
            .iter()
            .map(|(id, state)| serde_json::json!({ "id": id.0, "state": format!("{state:?}") }))
            .collect::<Vec<_>>(),
        "ext_inputs": report
            .ext_inputs
            .iter()
            .map(|(port, state)| serde_json::json!({ "port": port.to_string(), "state": format!("{state:?}") }))
            .collect::<Vec<_>>(),
        "ext_outputs": report
            .ext_outputs
            .iter()
            .map(|(port, state)| serde_json::json!({ "port": port.to_string(), "state": format!("{state:?}") }))
            .collect::<Vec<_>>(),
        "ext_ctrl_ports": report.ext_ctrl_ports,
        "pending_commands": report.pending_commands,
        "flushing_eos_in_flight": report.flushing_eos_in_flight,
        "thread_priority": report.pm.thread_priority,
        "clock_votes": report.pm.clock_votes,
        "thread_stack_size": report.thread_stack_size,
    })
}

fn print_text(scenario: &Scenario, records: &[StepRecord], report: &OlcReport, delivered: &[(PortRef, usize)]) {
    let title = if scenario.name.is_empty() { "(unnamed)" } else { scenario.name.as_str() };
    println!("Scenario: {title}");
    if let Some(description) = &scenario.description {
        println!("{description}");
    }
    println!();

    for r in records {
        let ack = match (&r.opcode, &r.status) {
            (Some(op), Some(status)) => format!("{op:<26}  {status}"),
            _ => "-".to_string(),
        };
        let check = match (&r.expected, r.passed) {
            (Some(_), true) => "  ok".to_string(),
            (Some(want), false) => format!("  MISMATCH (expected {want})"),
            (None, _) => String::new(),
        };
        println!("  [{:>2}] {:<16}  {ack}{check}", r.index, r.op);
    }

    println!();
    println!("Container report:");
    println!("  log id:          {}", report.log_id);
    println!("  frame size:      {} us", report.configured_frame_size_us);
    println!("  listen mask:     0x{:08X}", report.curr_chan_mask);
    println!("  satellite up:    {}", report.satellite_up);
    println!("  terminated:      {}", report.terminated);
    println!("  started:         {}", report.is_started);
    println!("  pending cmds:    {}", report.pending_commands);
    println!("  stack size:      {} bytes", report.thread_stack_size);
    if let Some(priority) = report.pm.thread_priority {
        println!("  thread priority: {priority}");
    }
    for (id, state) in &report.sub_graphs {
        println!("  {id}: {state:?}");
    }
    for (port, state) in &report.ext_inputs {
        println!("  in  {port}: {state:?}");
    }
    for (port, state) in &report.ext_outputs {
        println!("  out {port}: {state:?}");
    }
    for (port, n) in delivered {
        println!("  downstream of {port}: {n} message(s)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIFECYCLE: &str = r#"
[[step]]
op = "open"
sub_graphs = [{ id = 1, perf_mode = "low-latency" }]
modules = [{ id = 0x10, sub_graph = 1 }, { id = 0x20, sub_graph = 1 }]
inputs = [{ module = 0x10, port = 1 }]
outputs = [{ module = 0x20, port = 1 }]
expect = "ok"

[[step]]
op = "connect"
port = { module = 0x20, port = 1 }
side = "downstream"
expect = "ok"

[[step]]
op = "prepare"
sub_graphs = [1]

[[step]]
op = "start"
sub_graphs = [1]
expect = "ok"

[[step]]
op = "push-data"
port = { module = 0x10, port = 1 }
count = 2

[[step]]
op = "satellite-read"
port = { module = 0x20, port = 1 }
bytes = 64

[[step]]
op = "close"
sub_graphs = [1]
expect = "terminated"

[[step]]
op = "start"
sub_graphs = [1]
"#;

    fn runner(toml: &str) -> (Scenario, ScenarioRunner) {
        let scenario = Scenario::from_toml(toml).unwrap();
        let runner = ScenarioRunner::new(&scenario).unwrap();
        (scenario, runner)
    }

    // --- lifecycle ---

    #[test]
    fn lifecycle_meets_every_expectation() {
        let (scenario, mut runner) = runner(LIFECYCLE);
        let records = runner.run_all(&scenario.steps).unwrap();
        assert!(records.iter().all(|r| r.passed), "{records:#?}");
        assert_eq!(records[0].opcode.as_deref(), Some("GRAPH_OPEN"));
        assert!(runner.report().terminated);
    }

    #[test]
    fn steps_after_termination_are_skipped() {
        let (scenario, mut runner) = runner(LIFECYCLE);
        let records = runner.run_all(&scenario.steps).unwrap();
        assert_eq!(records.len(), scenario.steps.len() - 1);
    }

    #[test]
    fn data_steps_have_no_ack() {
        let (scenario, mut runner) = runner(LIFECYCLE);
        let records = runner.run_all(&scenario.steps).unwrap();
        assert_eq!(records[4].op, "push-data");
        assert_eq!(records[4].status, None);
        assert!(records[4].passed);
    }

    #[test]
    fn satellite_read_reaches_the_downstream_peer() {
        let (scenario, mut runner) = runner(LIFECYCLE);
        runner.run_all(&scenario.steps[..6]).unwrap();
        let delivered = runner.drain_downstream();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, PortRef::new(0x20, 1));
        assert!(delivered[0].1 >= 1);
    }

    // --- expectations ---

    #[test]
    fn wrong_expectation_is_reported() {
        let toml = r#"
[[step]]
op = "get-cfg"
params = []
expect = "ok"
"#;
        let (scenario, mut runner) = runner(toml);
        let records = runner.run_all(&scenario.steps).unwrap();
        assert!(!records[0].passed);
        assert_eq!(records[0].expected.as_deref(), Some("OK (0x0)"));
        assert_eq!(records[0].status.as_deref(), Some("UNEXPECTED (0x5)"));
    }

    #[test]
    fn push_to_unknown_port_is_an_error() {
        let toml = r#"
[[step]]
op = "push-data"
port = { module = 0x99, port = 1 }
"#;
        let (scenario, mut runner) = runner(toml);
        let err = runner.run_all(&scenario.steps).unwrap_err();
        assert!(err.to_string().contains("no external input"), "got: {err}");
    }

    // --- satellite restart ---

    #[test]
    fn satellite_down_then_up_restores_status() {
        let toml = r#"
[[step]]
op = "open"
sub_graphs = [{ id = 1 }]
modules = [{ id = 0x10, sub_graph = 1 }]

[[step]]
op = "satellite-down"

[[step]]
op = "start"
sub_graphs = [1]
expect = "not-ready"

[[step]]
op = "satellite-up"
"#;
        let (scenario, mut runner) = runner(toml);
        let records = runner.run_all(&scenario.steps[..3]).unwrap();
        assert!(!runner.report().satellite_up);
        assert!(records[2].passed, "{:?}", records[2]);
        runner.step(3, &scenario.steps[3]).unwrap();
        assert!(runner.report().satellite_up);
    }
}
