//! The offload container instance.
//!
//! # Architecture
//!
//! ```text
//!  OlcHandle ──cmd──►  COLC queue (CMD_BIT) ─┐
//!            ──sys──►  system queue (SYS)  ──┤
//!  driver    ──rsp──►  response queue        ├──► WaitChannel ──► Olc::dispatch
//!  peers/sat ──data──► port queues (1 bit)  ─┘
//! ```
//!
//! One thread owns an [`Olc`] and everything in it. Other threads only hold
//! queue handles. [`Olc::run`] blocks on the wait channel with the current
//! listen mask; [`Olc::process_ready`] runs one dispatch step without
//! blocking, which is how tests and the CLI drive it.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::Sender;
use tracing::{debug, error, info, info_span, warn};

use crate::bitmask::{BitMaskPool, CMD_BIT, SYSTEM_Q_BIT};
use crate::channel::{BitQueue, QueueError, QueueHandle, WaitChannel};
use crate::command::{CommandMsg, ModuleEvent, SystemMsg};
use crate::correlation::PendingOps;
use crate::error::{OlcError, Result, Status};
use crate::gpr::GprRegistry;
use crate::ids::{PortId, PortRef, SubGraphId};
use crate::pm::{FwkEvents, PmState, PowerVoter, PriorityEntry, default_priority_table};
use crate::port::{ExtCtrlPort, ExtInPort, ExtOutPort, PortEnv, PortState};
use crate::satellite::{DriverContext, SatelliteDriver, SatelliteResponse};
use crate::topology::{ExtPortKind, GraphUnit, SgState};

/// Minimum stack for the container thread.
pub const BASE_STACK_SIZE: usize = 4096;

/// Stack added on top of the base for processing.
pub const PROCESS_STACK_SIZE: usize = 2048;

/// Smallest stack a host thread is actually spawned with.
pub const MIN_HOST_STACK_SIZE: usize = 512 * 1024;

/// Upper bound on dispatch steps taken by [`Olc::run_until_idle`].
const MAX_IDLE_STEPS: usize = 10_000;

/// Construction parameters of a container.
#[derive(Debug, Clone, PartialEq)]
pub struct OlcParams {
    /// Log id, used in queue and thread names.
    pub log_id: u32,
    /// Container instance id; parameters addressed to it are handled locally.
    pub container_id: u32,
    /// Host processor domain.
    pub host_domain_id: u32,
    /// Stack size requested by the graph.
    pub configured_stack_size: usize,
    /// Overrides the computed thread priority.
    pub configured_thread_priority: Option<i32>,
    /// Priority used when nothing runs.
    pub floor_thread_priority: i32,
    /// Frame duration to priority table.
    pub priority_table: Vec<PriorityEntry>,
    /// Bound on waiting for lent output buffers at port teardown.
    pub reclaim_timeout: Duration,
    /// Capacity of every port data queue.
    pub data_queue_capacity: usize,
    /// Capacity of the command queue.
    pub command_queue_capacity: usize,
    /// Capacity of the system queue.
    pub system_queue_capacity: usize,
}

impl Default for OlcParams {
    fn default() -> Self {
        Self {
            log_id: 0x1,
            container_id: 0x4000,
            host_domain_id: 1,
            configured_stack_size: 0,
            configured_thread_priority: None,
            floor_thread_priority: 100,
            priority_table: default_priority_table(),
            reclaim_timeout: Duration::from_millis(100),
            data_queue_capacity: 128,
            command_queue_capacity: 8,
            system_queue_capacity: 8,
        }
    }
}

impl OlcParams {
    /// Sets the log id.
    pub fn with_log_id(mut self, log_id: u32) -> Self {
        self.log_id = log_id;
        self
    }

    /// Sets the container instance id.
    pub fn with_container_id(mut self, id: u32) -> Self {
        self.container_id = id;
        self
    }

    /// Sets the host domain id.
    pub fn with_host_domain_id(mut self, id: u32) -> Self {
        self.host_domain_id = id;
        self
    }

    /// Sets the configured stack size.
    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.configured_stack_size = bytes;
        self
    }

    /// Forces a thread priority.
    pub fn with_thread_priority(mut self, priority: i32) -> Self {
        self.configured_thread_priority = Some(priority);
        self
    }

    /// Sets the floor priority.
    pub fn with_floor_priority(mut self, priority: i32) -> Self {
        self.floor_thread_priority = priority;
        self
    }

    /// Replaces the priority table.
    pub fn with_priority_table(mut self, table: Vec<PriorityEntry>) -> Self {
        self.priority_table = table;
        self
    }

    /// Sets the buffer reclaim timeout.
    pub fn with_reclaim_timeout(mut self, timeout: Duration) -> Self {
        self.reclaim_timeout = timeout;
        self
    }

    /// Sets the data queue capacity.
    pub fn with_data_queue_capacity(mut self, capacity: usize) -> Self {
        self.data_queue_capacity = capacity;
        self
    }

    /// Sets the command and system queue capacities.
    pub fn with_control_queue_capacity(mut self, command: usize, system: usize) -> Self {
        self.command_queue_capacity = command;
        self.system_queue_capacity = system;
        self
    }
}

/// Stack needed for a configured size: the base floor plus processing.
pub fn required_stack_size(configured: usize) -> usize {
    configured.max(BASE_STACK_SIZE) + PROCESS_STACK_SIZE
}

/// Producer side of a container, cheap to clone across threads.
#[derive(Debug, Clone)]
pub struct OlcHandle {
    cmd: QueueHandle<CommandMsg>,
    sys: QueueHandle<SystemMsg>,
}

impl OlcHandle {
    /// Queues a command.
    pub fn send(&self, cmd: CommandMsg) -> std::result::Result<(), QueueError<CommandMsg>> {
        self.cmd.push(cmd)
    }

    /// Queues a system message.
    pub fn send_system(&self, msg: SystemMsg) -> std::result::Result<(), QueueError<SystemMsg>> {
        self.sys.push(msg)
    }
}

/// Snapshot of a container, for logs and the CLI.
#[derive(Debug, Clone, PartialEq)]
pub struct OlcReport {
    /// Log id.
    pub log_id: u32,
    /// Configured frame size in µs; 0 until a sub-graph is opened.
    pub configured_frame_size_us: u32,
    /// Current listen mask.
    pub curr_chan_mask: u32,
    /// Satellite status.
    pub satellite_up: bool,
    /// The container destroyed itself.
    pub terminated: bool,
    /// Open sub-graphs and their states.
    pub sub_graphs: Vec<(SubGraphId, SgState)>,
    /// External inputs and their states.
    pub ext_inputs: Vec<(PortRef, PortState)>,
    /// External outputs and their states.
    pub ext_outputs: Vec<(PortRef, PortState)>,
    /// Number of control ports.
    pub ext_ctrl_ports: usize,
    /// Commands waiting for the satellite.
    pub pending_commands: usize,
    /// Flushing EOS markers still in flight.
    pub flushing_eos_in_flight: u32,
    /// A sub-graph is started.
    pub is_started: bool,
    /// Power bookkeeping.
    pub pm: PmState,
    /// Stack the container thread needs.
    pub thread_stack_size: usize,
}

/// Offload container.
pub struct Olc {
    pub(crate) params: OlcParams,
    pub(crate) channel: Arc<WaitChannel>,
    pub(crate) pool: BitMaskPool,
    pub(crate) cmd_q: BitQueue<CommandMsg>,
    pub(crate) sys_q: BitQueue<SystemMsg>,
    pub(crate) rsp_q: BitQueue<SatelliteResponse>,
    pub(crate) driver: Box<dyn SatelliteDriver>,
    pub(crate) voter: Box<dyn PowerVoter>,
    pub(crate) graph: GraphUnit,
    pub(crate) ext_in: Vec<ExtInPort>,
    pub(crate) ext_out: Vec<ExtOutPort>,
    pub(crate) ext_ctrl: Vec<ExtCtrlPort>,
    pub(crate) curr_chan_mask: u32,
    pub(crate) configured_frame_size_us: u32,
    pub(crate) pending: PendingOps,
    pub(crate) gpr: GprRegistry,
    pub(crate) satellite_up: bool,
    pub(crate) flushing_eos_in_flight: u32,
    pub(crate) pm: PmState,
    pub(crate) events: FwkEvents,
    pub(crate) is_cntr_started: bool,
    pub(crate) thread_stack_size: usize,
    pub(crate) terminated: bool,
    pub(crate) event_sink: Option<Sender<ModuleEvent>>,
    next_port_id: u32,
    driver_ready: bool,
}

impl std::fmt::Debug for Olc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Olc")
            .field("log_id", &format_args!("0x{:X}", self.params.log_id))
            .field("mask", &format_args!("0x{:08X}", self.curr_chan_mask))
            .field("sub_graphs", &self.graph.num_sub_graphs())
            .field("satellite_up", &self.satellite_up)
            .field("terminated", &self.terminated)
            .finish_non_exhaustive()
    }
}

impl Olc {
    /// Creates a container and connects the satellite driver.
    ///
    /// A failing driver `init` leaves nothing behind.
    pub fn create(params: OlcParams, mut driver: Box<dyn SatelliteDriver>, voter: Box<dyn PowerVoter>) -> Result<Self> {
        let log_id = params.log_id;
        let channel = WaitChannel::new();
        let mut pool = BitMaskPool::new();
        let cmd_q = BitQueue::new(format!("COLC{log_id:08X}"), params.command_queue_capacity, CMD_BIT, &channel);
        let sys_q = BitQueue::new(
            format!("YOLC{log_id:08X}"),
            params.system_queue_capacity,
            SYSTEM_Q_BIT,
            &channel,
        );
        let rsp_bit = pool.request().ok_or(OlcError::NoBitAvailable {
            available: pool.available(),
        })?;
        let rsp_q = BitQueue::new(format!("ROLC{log_id:08X}"), params.command_queue_capacity, rsp_bit, &channel);

        driver.init(DriverContext {
            log_id,
            container_id: params.container_id,
            host_domain_id: params.host_domain_id,
            responses: rsp_q.handle(),
        })?;

        let thread_stack_size = required_stack_size(params.configured_stack_size);
        info!(
            log_id,
            "container 0x{:X} created, stack {thread_stack_size} bytes",
            params.container_id
        );
        Ok(Self {
            params,
            channel,
            pool,
            cmd_q,
            sys_q,
            rsp_q,
            driver,
            voter,
            graph: GraphUnit::new(),
            ext_in: Vec::new(),
            ext_out: Vec::new(),
            ext_ctrl: Vec::new(),
            curr_chan_mask: SYSTEM_Q_BIT | CMD_BIT | rsp_bit,
            configured_frame_size_us: 0,
            pending: PendingOps::default(),
            gpr: GprRegistry::default(),
            satellite_up: true,
            flushing_eos_in_flight: 0,
            pm: PmState::default(),
            events: FwkEvents::default(),
            is_cntr_started: false,
            thread_stack_size,
            terminated: false,
            event_sink: None,
            next_port_id: 0,
            driver_ready: true,
        })
    }

    /// Routes module events registered by clients to `sink`.
    pub fn with_event_sink(mut self, sink: Sender<ModuleEvent>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Producer handle for commands and system messages.
    pub fn handle(&self) -> OlcHandle {
        OlcHandle {
            cmd: self.cmd_q.handle(),
            sys: self.sys_q.handle(),
        }
    }

    /// Runs one dispatch step on whatever is ready. Returns the ready bits.
    pub fn process_ready(&mut self) -> u32 {
        if self.terminated {
            return 0;
        }
        let ready = self.channel.take(self.curr_chan_mask);
        if ready != 0 {
            let _span = info_span!("olc", log_id = self.params.log_id).entered();
            self.dispatch(ready);
        }
        ready
    }

    /// Steps until nothing is ready. Returns the number of steps taken.
    pub fn run_until_idle(&mut self) -> usize {
        let mut steps = 0;
        while steps < MAX_IDLE_STEPS && self.process_ready() != 0 {
            steps += 1;
        }
        if steps == MAX_IDLE_STEPS {
            warn!(log_id = self.params.log_id, "still busy after {steps} steps");
        }
        steps
    }

    /// Blocks on the wait channel and dispatches until destroyed.
    pub fn run(mut self) {
        info!(log_id = self.params.log_id, "container thread running");
        while !self.terminated {
            let ready = self.channel.wait(self.curr_chan_mask);
            let _span = info_span!("olc", log_id = self.params.log_id).entered();
            self.dispatch(ready);
        }
        info!(log_id = self.params.log_id, "container thread exiting");
    }

    /// Moves the container onto its own thread, named `OLC_<log id>`.
    pub fn spawn(self) -> io::Result<JoinHandle<()>> {
        let stack = self.thread_stack_size.max(MIN_HOST_STACK_SIZE);
        thread::Builder::new()
            .name(format!("OLC_{:X}", self.params.log_id))
            .stack_size(stack)
            .spawn(move || self.run())
    }

    /// Destroys the container. Pending and queued commands are acked
    /// `Terminated`. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.terminated {
            return;
        }
        for pending in self.pending.drain() {
            warn!(
                log_id = self.params.log_id,
                "CMD:{}: dropped by destroy while waiting for {}",
                pending.cmd.opcode,
                pending.id
            );
            pending.cmd.ack(Status::Terminated);
        }

        let ins: Vec<PortRef> = self.ext_in.iter().map(ExtInPort::key).collect();
        let outs: Vec<PortRef> = self.ext_out.iter().map(ExtOutPort::key).collect();
        let ctrls: Vec<PortRef> = self.ext_ctrl.iter().map(ExtCtrlPort::key).collect();
        for key in ins {
            self.destroy_ext_port(ExtPortKind::Input, key);
        }
        for key in outs {
            self.destroy_ext_port(ExtPortKind::Output, key);
        }
        for key in ctrls {
            self.destroy_ext_port(ExtPortKind::Control, key);
        }

        let ids: Vec<SubGraphId> = self.graph.sub_graphs().map(|sg| sg.id).collect();
        self.graph.mark_closing(&ids);
        for module in self.graph.remove_closing().modules {
            self.gpr.deregister(module);
        }

        if self.driver_ready {
            self.driver.deinit();
            self.driver_ready = false;
        }
        self.pool.release(self.rsp_q.bit());
        for _ in self.rsp_q.drain() {}
        for cmd in self.cmd_q.drain() {
            cmd.ack(Status::Terminated);
        }
        self.curr_chan_mask = 0;
        self.terminated = true;
        info!(log_id = self.params.log_id, "container destroyed");
    }

    // --- accessors ---

    /// Construction parameters.
    pub fn params(&self) -> &OlcParams {
        &self.params
    }

    /// Configured frame size in µs; 0 until a sub-graph is opened.
    pub fn configured_frame_size_us(&self) -> u32 {
        self.configured_frame_size_us
    }

    /// Current listen mask.
    pub fn curr_chan_mask(&self) -> u32 {
        self.curr_chan_mask
    }

    /// The satellite is up.
    pub fn satellite_up(&self) -> bool {
        self.satellite_up
    }

    /// The container destroyed itself.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Any sub-graph is started.
    pub fn is_started(&self) -> bool {
        self.is_cntr_started
    }

    /// Power bookkeeping.
    pub fn pm_state(&self) -> &PmState {
        &self.pm
    }

    /// Stack the container thread needs.
    pub fn thread_stack_size(&self) -> usize {
        self.thread_stack_size
    }

    /// Number of open sub-graphs.
    pub fn num_sub_graphs(&self) -> usize {
        self.graph.num_sub_graphs()
    }

    /// State of an open sub-graph.
    pub fn sub_graph_state(&self, id: SubGraphId) -> Option<SgState> {
        self.graph.sub_graph(id).map(|sg| sg.state)
    }

    /// Commands waiting for a satellite response.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Flushing EOS markers written to the satellite and not yet consumed.
    pub fn flushing_eos_in_flight(&self) -> u32 {
        self.flushing_eos_in_flight
    }

    /// Free bits left in the pool.
    pub fn free_bits(&self) -> u32 {
        self.pool.count_available()
    }

    /// External input attached to `key`.
    pub fn ext_in_port(&self, key: PortRef) -> Option<&ExtInPort> {
        self.ext_in.iter().find(|p| p.key() == key)
    }

    /// External output attached to `key`.
    pub fn ext_out_port(&self, key: PortRef) -> Option<&ExtOutPort> {
        self.ext_out.iter().find(|p| p.key() == key)
    }

    /// External output attached to `key`, for buffer management.
    pub fn ext_out_port_mut(&mut self, key: PortRef) -> Option<&mut ExtOutPort> {
        self.ext_out.iter_mut().find(|p| p.key() == key)
    }

    /// Control port attached to `key`.
    pub fn ext_ctrl_port(&self, key: PortRef) -> Option<&ExtCtrlPort> {
        self.ext_ctrl.iter().find(|p| p.key() == key)
    }

    /// Snapshot for logs and reports.
    pub fn report(&self) -> OlcReport {
        OlcReport {
            log_id: self.params.log_id,
            configured_frame_size_us: self.configured_frame_size_us,
            curr_chan_mask: self.curr_chan_mask,
            satellite_up: self.satellite_up,
            terminated: self.terminated,
            sub_graphs: self.graph.sub_graphs().map(|sg| (sg.id, sg.state)).collect(),
            ext_inputs: self.ext_in.iter().map(|p| (p.key(), p.state())).collect(),
            ext_outputs: self.ext_out.iter().map(|p| (p.key(), p.state())).collect(),
            ext_ctrl_ports: self.ext_ctrl.len(),
            pending_commands: self.pending.len(),
            flushing_eos_in_flight: self.flushing_eos_in_flight,
            is_started: self.is_cntr_started,
            pm: self.pm.clone(),
            thread_stack_size: self.thread_stack_size,
        }
    }

    // --- internals ---

    /// Raises the thread stack size to what the configuration needs. Never
    /// lowers it, so a repeated open does not grow it twice.
    pub(crate) fn update_thread_stack_size(&mut self) {
        let needed = required_stack_size(self.params.configured_stack_size);
        if needed > self.thread_stack_size {
            debug!(
                log_id = self.params.log_id,
                "thread stack {} -> {needed} bytes",
                self.thread_stack_size
            );
        }
        self.thread_stack_size = self.thread_stack_size.max(needed);
    }

    /// Creates an external port on `key` and records the attachment.
    pub(crate) fn create_ext_port(&mut self, kind: ExtPortKind, key: PortRef) -> Result<()> {
        let sub_graph = self.graph.attach(kind, key)?;
        let id = PortId(self.next_port_id);
        self.next_port_id += 1;
        let mut env = PortEnv {
            log_id: self.params.log_id,
            pool: &mut self.pool,
            channel: &self.channel,
            driver: self.driver.as_mut(),
            data_capacity: self.params.data_queue_capacity,
        };
        let created = match kind {
            ExtPortKind::Input => ExtInPort::create(&mut env, key, sub_graph, id).map(|p| self.ext_in.push(p)),
            ExtPortKind::Output => ExtOutPort::create(&mut env, key, sub_graph, id).map(|p| self.ext_out.push(p)),
            ExtPortKind::Control => ExtCtrlPort::create(&mut env, key, sub_graph, id).map(|p| self.ext_ctrl.push(p)),
        };
        if let Err(e) = created {
            error!(log_id = self.params.log_id, "creating {kind:?} port {key} failed: {e}");
            self.graph.detach(key);
            return Err(e);
        }
        Ok(())
    }

    /// Tears down the external port on `key`, if there is one.
    pub(crate) fn destroy_ext_port(&mut self, kind: ExtPortKind, key: PortRef) {
        let mut env = PortEnv {
            log_id: self.params.log_id,
            pool: &mut self.pool,
            channel: &self.channel,
            driver: self.driver.as_mut(),
            data_capacity: self.params.data_queue_capacity,
        };
        match kind {
            ExtPortKind::Input => {
                if let Some(i) = self.ext_in.iter().position(|p| p.key() == key) {
                    self.ext_in.remove(i).deinit(&mut env, &mut self.flushing_eos_in_flight);
                }
            }
            ExtPortKind::Output => {
                if let Some(i) = self.ext_out.iter().position(|p| p.key() == key) {
                    self.ext_out.remove(i).deinit(&mut env, self.params.reclaim_timeout);
                }
            }
            ExtPortKind::Control => {
                if let Some(i) = self.ext_ctrl.iter().position(|p| p.key() == key) {
                    self.ext_ctrl.remove(i).deinit(&mut env);
                }
            }
        }
        self.graph.detach(key);
    }

    /// Rebuilds the listen mask from port states.
    ///
    /// Data ports are listened to only while started and while the satellite
    /// is up. Bits of started ports are signalled so that data queued while
    /// they were not listened to is picked up.
    pub(crate) fn refresh_port_mask(&mut self) {
        if self.terminated {
            return;
        }
        let mut ports = 0;
        let mut started = 0;
        if self.satellite_up {
            for (state, bit) in self
                .ext_in
                .iter()
                .map(|p| (p.state, p.bit()))
                .chain(self.ext_out.iter().map(|p| (p.state, p.bit())))
            {
                if state == PortState::Started {
                    ports |= bit;
                    started |= bit;
                }
            }
        }
        for port in &self.ext_ctrl {
            if port.state == PortState::Started {
                ports |= port.bit();
                started |= port.bit();
            }
        }
        let rsp = if self.satellite_up { self.rsp_q.bit() } else { 0 };
        let new_mask = (self.curr_chan_mask & CMD_BIT) | SYSTEM_Q_BIT | rsp | ports;
        if new_mask != self.curr_chan_mask {
            debug!(
                log_id = self.params.log_id,
                "listen mask 0x{:08X} -> 0x{new_mask:08X}",
                self.curr_chan_mask
            );
        }
        self.curr_chan_mask = new_mask;
        if started != 0 {
            self.channel.signal(started);
        }
    }
}

impl Drop for Olc {
    fn drop(&mut self) {
        self.destroy();
    }
}
