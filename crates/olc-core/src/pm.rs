//! Power and thread-priority management.
//!
//! The container aggregates a kpps and bandwidth estimate from the media
//! formats of its started external ports and votes it, together with a
//! latency request and a thread priority, through a [`PowerVoter`].
//!
//! # Vote gating
//!
//! Nothing is requested until a sub-graph is started, and a container whose
//! inputs are all faster-than-real-time keeps releasing until data flow
//! begins on one of them.

use tracing::{debug, info, warn};

use crate::container::Olc;
use crate::media::MediaFormat;
use crate::port::{DataFlowState, PortState};

/// Extra bandwidth for sample rates above 48 kHz.
pub const EXTRA_BW_HIGH_SR: u32 = 6 * 1024 * 1024;

/// Extra bandwidth for more than two channels.
pub const EXTRA_BW_MULTI_CH: u32 = 7 * 1024 * 1024;

/// Latency floor in µs.
pub const MIN_LATENCY_US: u32 = 40;

/// Latency value that releases the vote.
pub const LATENCY_RELEASE: u32 = u32::MAX;

/// Processing duration meaning "no constraint".
pub const DURATION_DONT_CARE: u32 = u32::MAX;

/// Core and bus clock vote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ClockVote {
    /// Release instead of request.
    pub release: bool,
    /// Container kpps.
    pub kpps: u32,
    /// Container bandwidth in bytes per second.
    pub bw: u32,
    /// Topology kpps; always 0 here.
    pub topo_kpps: u32,
    /// Topology bandwidth; always 0 here.
    pub topo_bw: u32,
    /// Container period in µs; 0 on release.
    pub period_us: u32,
}

/// Power manager back end.
pub trait PowerVoter: Send {
    /// Votes core and bus clocks.
    fn vote_clock(&mut self, vote: ClockVote);

    /// Votes a latency in µs; [`LATENCY_RELEASE`] releases.
    fn vote_latency(&mut self, latency_us: u32);

    /// Sets the container thread priority (larger is higher).
    fn set_thread_priority(&mut self, priority: i32);
}

/// Voter that only logs.
#[derive(Debug, Default)]
pub struct LogVoter;

impl PowerVoter for LogVoter {
    fn vote_clock(&mut self, vote: ClockVote) {
        debug!(
            "clock vote: release={} kpps={} bw={} period={}us",
            vote.release, vote.kpps, vote.bw, vote.period_us
        );
    }

    fn vote_latency(&mut self, latency_us: u32) {
        debug!("latency vote: {latency_us}us");
    }

    fn set_thread_priority(&mut self, priority: i32) {
        debug!("thread priority: {priority}");
    }
}

/// One row of the priority table: frames up to `max_frame_us` run at
/// `priority`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PriorityEntry {
    /// Largest frame duration covered by this row.
    pub max_frame_us: u32,
    /// Priority for those frames.
    pub priority: i32,
}

/// Default table: shorter frames get higher priority.
pub fn default_priority_table() -> Vec<PriorityEntry> {
    vec![
        PriorityEntry {
            max_frame_us: 1000,
            priority: 220,
        },
        PriorityEntry {
            max_frame_us: 5000,
            priority: 180,
        },
        PriorityEntry {
            max_frame_us: 20_000,
            priority: 140,
        },
    ]
}

/// Framework event flags collected while handling one command or trigger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FwkEvents {
    /// Aggregated kpps or bandwidth changed.
    pub kpps_bw_scale_factor_change: bool,
    /// A sub-graph changed state.
    pub sg_state_change: bool,
    /// The container went from stopped to running or back.
    pub cntr_run_state_change: bool,
    /// Data flow started or stopped on an input.
    pub dfs_change: bool,
    /// An RT/FTRT property flipped.
    pub rt_ftrt_change: bool,
    /// The processing duration changed.
    pub proc_dur_change: bool,
}

impl FwkEvents {
    /// Returns `true` if any flag is set.
    pub fn any(&self) -> bool {
        *self != FwkEvents::default()
    }
}

/// PM bookkeeping of one container.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PmState {
    /// Aggregated kpps.
    pub cntr_kpps: u32,
    /// Aggregated bandwidth.
    pub cntr_bw: u32,
    /// Last latency voted, if any.
    pub last_latency_vote: Option<u32>,
    /// Processing duration set through the container parameter.
    pub proc_duration_us: u32,
    /// `proc_duration_us` was set by a parameter.
    pub proc_dur_set_paramed: bool,
    /// Current thread priority, once set.
    pub thread_priority: Option<i32>,
    /// Clock votes issued.
    pub clock_votes: u32,
}

/// kpps and bandwidth contributed by one port.
///
/// Bandwidth counts the port twice (container copy plus shared-memory copy)
/// and adds the high sample rate and multichannel surcharges. Only PCM and
/// packetized formats contribute.
pub fn port_load(fmt: &MediaFormat) -> (u32, u32) {
    if !fmt.data_format.is_pcm_or_packetized() {
        return (0, 0);
    }
    let pcm = fmt.pcm;
    let bytes = fmt.bytes_per_sample();
    let per_copy = pcm.sample_rate.saturating_mul(pcm.num_channels).saturating_mul(bytes);
    let mut bw = per_copy.saturating_mul(2);
    if pcm.sample_rate > 48_000 {
        bw = bw.saturating_add(EXTRA_BW_HIGH_SR);
    }
    if pcm.num_channels > 2 {
        bw = bw.saturating_add(EXTRA_BW_MULTI_CH);
    }
    let kpps = (u64::from(bytes) * u64::from(pcm.num_channels) * u64::from(pcm.sample_rate) / 4000) as u32;
    (kpps, bw)
}

/// Sums [`port_load`] over ports that are started (or prepared, with
/// `force`).
pub fn aggregate_kpps_bw(ports: impl IntoIterator<Item = (PortState, MediaFormat)>, force: bool) -> (u32, u32) {
    ports
        .into_iter()
        .filter(|(state, _)| *state == PortState::Started || (force && *state == PortState::Prepared))
        .map(|(_, fmt)| port_load(&fmt))
        .fold((0u32, 0u32), |(k, b), (pk, pb)| (k.saturating_add(pk), b.saturating_add(pb)))
}

/// Latency request for `proc_duration_us`: 3 % of it when real-time, 70 %
/// otherwise, never below [`MIN_LATENCY_US`].
pub fn latency_request_us(proc_duration_us: u32, is_rt: bool) -> u32 {
    let factor: u64 = if is_rt { 3 } else { 70 };
    let value = (factor * u64::from(proc_duration_us) / 100) as u32;
    value.max(MIN_LATENCY_US)
}

/// Thread priority selection inputs.
#[derive(Clone, Copy, Debug)]
pub struct PriorityQuery<'a> {
    /// Any sub-graph is started.
    pub started: bool,
    /// Processing duration in µs.
    pub duration_us: u32,
    /// Container is real-time.
    pub is_rt: bool,
    /// Current priority.
    pub current: i32,
    /// Floor priority.
    pub floor: i32,
    /// Duration-to-priority table, sorted by `max_frame_us`.
    pub table: &'a [PriorityEntry],
    /// Configured override.
    pub configured: Option<i32>,
}

/// Picks the thread priority. Returns the chosen priority and the one the
/// internal logic would have used.
pub fn select_thread_priority(q: &PriorityQuery<'_>) -> (i32, i32) {
    let computed = if !q.started {
        q.floor
    } else if q.duration_us == 0 || q.duration_us == DURATION_DONT_CARE {
        q.current
    } else if !q.is_rt {
        q.floor
    } else {
        q.table
            .iter()
            .find(|e| q.duration_us <= e.max_frame_us)
            .or(q.table.last())
            .map_or(q.floor, |e| e.priority)
    };
    (q.configured.unwrap_or(computed), computed)
}

impl Olc {
    /// Recomputes the container kpps and bandwidth from its external ports.
    pub(crate) fn update_cntr_kpps_bw(&mut self, force: bool) {
        let ins = self.ext_in.iter().map(|p| (p.state, p.media_fmt));
        let outs = self.ext_out.iter().map(|p| (p.state, p.media_fmt));
        let (kpps, bw) = aggregate_kpps_bw(ins.chain(outs), force);
        if kpps != self.pm.cntr_kpps || bw != self.pm.cntr_bw {
            self.pm.cntr_kpps = kpps;
            self.pm.cntr_bw = bw;
            self.events.kpps_bw_scale_factor_change = true;
            debug!(log_id = self.params.log_id, "container kpps {kpps}, bw {bw} Bps");
        }
    }

    /// Forced aggregation: counts prepared ports as well as started ones,
    /// then requests the result. Returns the container kpps and bandwidth.
    pub(crate) fn aggregate_kpps_bw(&mut self) -> (u32, u32) {
        self.update_cntr_kpps_bw(true);
        self.handle_clk_vote_change(false, self.configured_frame_size_us);
        (self.pm.cntr_kpps, self.pm.cntr_bw)
    }

    /// Every external input is FTRT and none has data flowing.
    pub(crate) fn all_ftrt_and_at_gap(&self) -> bool {
        !self.ext_in.is_empty()
            && self
                .ext_in
                .iter()
                .all(|p| p.is_ftrt() && p.data_flow == DataFlowState::AtGap)
    }

    /// Any port faces a real-time peer.
    pub(crate) fn is_realtime(&self) -> bool {
        self.ext_in.iter().any(|p| p.upstream_rt) || self.ext_out.iter().any(|p| p.icb.ds_is_real_time)
    }

    /// Processing duration: the parameter value if set, else the frame size.
    pub(crate) fn proc_duration_us(&self) -> u32 {
        if self.pm.proc_dur_set_paramed {
            self.pm.proc_duration_us
        } else {
            self.configured_frame_size_us
        }
    }

    pub(crate) fn handle_clk_vote_change(&mut self, release: bool, period_us: u32) {
        let vote = ClockVote {
            release,
            kpps: if release { 0 } else { self.pm.cntr_kpps },
            bw: if release { 0 } else { self.pm.cntr_bw },
            topo_kpps: 0,
            topo_bw: 0,
            period_us: if release { 0 } else { period_us },
        };
        self.pm.clock_votes += 1;
        self.voter.vote_clock(vote);
    }

    pub(crate) fn vote_latency(&mut self, release: bool) {
        let duration = self.proc_duration_us();
        let release = release || duration == 0;
        let value = if release {
            LATENCY_RELEASE
        } else {
            latency_request_us(duration, self.is_realtime())
        };
        if self.pm.last_latency_vote == Some(value) {
            return;
        }
        if release && self.pm.last_latency_vote.is_none() {
            return;
        }
        self.pm.last_latency_vote = Some(value);
        self.voter.vote_latency(value);
    }

    /// Sets the thread priority for the current state.
    pub(crate) fn get_set_thread_priority(&mut self) -> i32 {
        let current = self.pm.thread_priority.unwrap_or(self.params.floor_thread_priority);
        let (prio, computed) = select_thread_priority(&PriorityQuery {
            started: self.is_cntr_started,
            duration_us: self.proc_duration_us(),
            is_rt: self.is_realtime(),
            current,
            floor: self.params.floor_thread_priority,
            table: &self.params.priority_table,
            configured: self.params.configured_thread_priority,
        });
        if self.pm.thread_priority != Some(prio) {
            info!(
                log_id = self.params.log_id,
                "thread priority {prio}, frame {}us, proc duration {}us",
                self.configured_frame_size_us,
                self.proc_duration_us()
            );
            if prio != computed {
                warn!(
                    log_id = self.params.log_id,
                    "thread priority: configured {prio} overrides internal logic {computed}"
                );
            }
            self.pm.thread_priority = Some(prio);
            self.voter.set_thread_priority(prio);
        }
        prio
    }

    /// Votes after a start or close: releases when nothing runs or when no
    /// FTRT input has data yet.
    pub(crate) fn vote_pm_conditionally(&mut self, period_us: u32, any_started: bool) {
        let mut release = !any_started;
        if !release && self.all_ftrt_and_at_gap() {
            info!(
                log_id = self.params.log_id,
                "all inputs are FTRT with no data flow; releasing kpps/bw vote"
            );
            release = true;
        }
        let period = if release { 0 } else { period_us };
        self.vote_latency(release);
        self.handle_clk_vote_change(release, period);
    }

    /// Votes whatever the collected event flags call for.
    pub(crate) fn perf_vote(&mut self, flags: FwkEvents) {
        let mut release = !self.is_cntr_started;
        if !release && self.all_ftrt_and_at_gap() {
            debug!(log_id = self.params.log_id, "all inputs FTRT and at gap; releasing");
            release = true;
        }
        let cmn = release || flags.dfs_change || flags.rt_ftrt_change;
        if cmn || flags.kpps_bw_scale_factor_change || flags.sg_state_change {
            let period = self.configured_frame_size_us;
            self.handle_clk_vote_change(release, period);
        }
        if cmn || flags.proc_dur_change || flags.cntr_run_state_change {
            self.get_set_thread_priority();
            self.vote_latency(release);
        }
    }

    /// Runs [`perf_vote`](Self::perf_vote) on the collected flags and
    /// clears them.
    pub(crate) fn handle_fwk_events(&mut self) {
        if !self.events.any() {
            return;
        }
        let flags = self.events;
        self.perf_vote(flags);
        self.events = FwkEvents::default();
    }
}
