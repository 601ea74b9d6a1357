//! External input port: upstream buffers in, satellite write port out.

use tracing::{debug, error, warn};

use super::{DataBuffer, DataFlowState, DataMsg, PeerProperty, PortEnv, PortState, UpstreamHandle};
use crate::channel::{BitQueue, QueueHandle};
use crate::error::{OlcError, Result};
use crate::ids::{PortId, PortRef, SubGraphId};
use crate::media::{MediaFormat, Timestamp};
use crate::metadata::{self, EosFlags, Metadata, MetadataKind};
use crate::satellite::{DataPortHandle, SatDataEvent, SatelliteDriver};

/// Input-side stream flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExtInFlags {
    /// The last upstream buffer ended a frame with an EOS.
    pub eof: bool,
    /// A flushing EOS is in flight; no more input until it drains.
    pub flushing_eos: bool,
    /// A media format change split the stream.
    pub input_discontinuity: bool,
    /// A control-path media format waits to be sent to the write port.
    pub pending_mf: bool,
}

#[derive(Debug)]
struct HeldInput {
    buf: DataBuffer,
    written: usize,
}

/// What one pass over the input port produced.
#[derive(Debug, Default)]
pub(crate) struct InputProgress {
    /// Data flow moved from at-gap to flowing.
    pub data_flow_started: bool,
    /// Properties reported by the satellite write port.
    pub properties: Vec<PeerProperty>,
}

/// External input port.
#[derive(Debug)]
pub struct ExtInPort {
    id: PortId,
    key: PortRef,
    sub_graph: SubGraphId,
    bit: u32,
    data_q: BitQueue<DataMsg>,
    sat_q: BitQueue<SatDataEvent>,
    write_port: Option<DataPortHandle>,
    pub(crate) state: PortState,
    pub(crate) connected_state: PortState,
    pub(crate) upstream_rt: bool,
    pub(crate) data_flow: DataFlowState,
    pub(crate) media_fmt: MediaFormat,
    pub(crate) bytes_from_prev_buf: usize,
    pub(crate) metadata: Vec<Metadata>,
    pub(crate) flags: ExtInFlags,
    held: Option<HeldInput>,
    pub(crate) timestamp: Option<Timestamp>,
    pending_eos: Option<Metadata>,
    pub(crate) pending_eos_to_satellite: bool,
    eos_in_flight: Option<Metadata>,
    pub(crate) upstream: Option<UpstreamHandle>,
    pub(crate) closing: bool,
}

impl ExtInPort {
    /// Requests a bit, creates both queues and the satellite write port.
    ///
    /// Nothing is left behind on failure: the bit goes back to the pool and a
    /// created write port is destroyed.
    pub(crate) fn create(env: &mut PortEnv<'_>, key: PortRef, sub_graph: SubGraphId, id: PortId) -> Result<Self> {
        let bit = env.pool.request().ok_or(OlcError::NoBitAvailable {
            available: env.pool.available(),
        })?;
        let data_q = BitQueue::new(format!("DOLC{:08X}", env.log_id), env.data_capacity, bit, env.channel);
        let sat_q = BitQueue::new(format!("SOLC{:08X}", env.log_id), env.data_capacity, bit, env.channel);

        let handle = match env.driver.create_write_port(key, sat_q.handle()) {
            Ok(h) => h,
            Err(e) => {
                env.pool.release(bit);
                return Err(e.into());
            }
        };
        if let Err(e) = env.driver.setup_write_port(handle) {
            env.driver.destroy_write_port(handle);
            env.pool.release(bit);
            return Err(e.into());
        }

        debug!(
            log_id = env.log_id,
            "ext in port {key} created, bit 0x{bit:08X}, write port {}",
            handle.index()
        );
        Ok(Self {
            id,
            key,
            sub_graph,
            bit,
            data_q,
            sat_q,
            write_port: Some(handle),
            state: PortState::Stopped,
            connected_state: PortState::Invalid,
            upstream_rt: false,
            data_flow: DataFlowState::AtGap,
            media_fmt: MediaFormat::default(),
            bytes_from_prev_buf: 0,
            metadata: Vec::new(),
            flags: ExtInFlags::default(),
            held: None,
            timestamp: None,
            pending_eos: None,
            pending_eos_to_satellite: false,
            eos_in_flight: None,
            upstream: None,
            closing: false,
        })
    }

    /// Tears the port down: drops everything queued, destroys the write
    /// port and returns the bit.
    pub(crate) fn deinit(mut self, env: &mut PortEnv<'_>, eos_counter: &mut u32) {
        self.flush_input_data_queue(env.driver, false, false, false, eos_counter);
        metadata::destroy_all(&mut self.metadata, true);
        if let Some(handle) = self.write_port.take() {
            env.driver.destroy_write_port(handle);
        }
        if !env.pool.release(self.bit) {
            error!(log_id = env.log_id, "ext in port {}: bit 0x{:08X} was not in use", self.key, self.bit);
        }
        debug!(log_id = env.log_id, "ext in port {} destroyed", self.key);
    }

    /// Unique port id.
    pub fn id(&self) -> PortId {
        self.id
    }

    /// Module port this external port is attached to.
    pub fn key(&self) -> PortRef {
        self.key
    }

    /// Owning sub-graph.
    pub fn sub_graph(&self) -> SubGraphId {
        self.sub_graph
    }

    /// Channel bit.
    pub fn bit(&self) -> u32 {
        self.bit
    }

    /// Port state after downgrade.
    pub fn state(&self) -> PortState {
        self.state
    }

    /// Last state reported by the connected upstream port.
    pub fn connected_state(&self) -> PortState {
        self.connected_state
    }

    /// Data flow state.
    pub fn data_flow(&self) -> DataFlowState {
        self.data_flow
    }

    /// Current input media format.
    pub fn media_format(&self) -> MediaFormat {
        self.media_fmt
    }

    /// Stream flags.
    pub fn flags(&self) -> ExtInFlags {
        self.flags
    }

    /// Satellite write port.
    pub fn write_port(&self) -> Option<DataPortHandle> {
        self.write_port
    }

    /// Upstream is real-time.
    pub fn is_upstream_rt(&self) -> bool {
        self.upstream_rt
    }

    /// Faster-than-real-time input: the upstream is not real-time.
    pub fn is_ftrt(&self) -> bool {
        !self.upstream_rt
    }

    /// Messages waiting on the data queue.
    pub fn queued(&self) -> usize {
        self.data_q.len()
    }

    /// Producer handle of the data queue, given to the upstream peer.
    pub fn data_handle(&self) -> QueueHandle<DataMsg> {
        self.data_q.handle()
    }

    /// Returns `true` while an upstream buffer is being written.
    pub fn is_holding_buffer(&self) -> bool {
        self.held.is_some()
    }

    /// Returns `true` while an EOS written to the satellite is unacknowledged.
    pub fn has_eos_in_flight(&self) -> bool {
        self.eos_in_flight.is_some()
    }

    fn is_stalled(&self) -> bool {
        self.held.is_some() || self.pending_eos_to_satellite || (self.flags.flushing_eos && self.eos_in_flight.is_some())
    }

    /// Runs the port until no more progress can be made.
    ///
    /// Satellite events are always drained. Upstream messages are only popped
    /// while the port is started and nothing is held.
    pub(crate) fn process(&mut self, driver: &mut dyn SatelliteDriver, eos_counter: &mut u32) -> Result<InputProgress> {
        let handle = self
            .write_port
            .ok_or_else(|| OlcError::unexpected(format!("ext in port {} has no write port", self.key)))?;
        let mut progress = InputProgress::default();
        loop {
            let mut moved = false;
            while let Some(event) = self.sat_q.pop() {
                moved = true;
                self.on_sat_event(driver, handle, event, eos_counter, &mut progress)?;
            }
            if self.state == PortState::Started && !self.is_stalled() {
                if self.flags.pending_mf {
                    driver.write_dl_pcd(handle, &self.media_fmt)?;
                    self.flags.pending_mf = false;
                }
                if let Some(msg) = self.data_q.pop() {
                    moved = true;
                    self.accept(driver, handle, msg, eos_counter, &mut progress)?;
                }
            }
            if !moved {
                return Ok(progress);
            }
        }
    }

    fn on_sat_event(
        &mut self,
        driver: &mut dyn SatelliteDriver,
        handle: DataPortHandle,
        event: SatDataEvent,
        eos_counter: &mut u32,
        progress: &mut InputProgress,
    ) -> Result<()> {
        match event {
            SatDataEvent::WriteDone { consumed } => {
                let Some(held) = self.held.as_mut() else {
                    debug!("ext in port {}: write done with nothing held", self.key);
                    return Ok(());
                };
                held.written += consumed;
                let len = held.buf.data.len();
                if held.written < len {
                    self.bytes_from_prev_buf = len - held.written;
                    driver.write_data(handle, &held.buf.data[held.written..], None)?;
                    return Ok(());
                }
                self.bytes_from_prev_buf = 0;
                if let Some(held) = self.held.take() {
                    release_upstream(held.buf);
                }
                metadata::destroy_all(&mut self.metadata, false);
                if let Some(eos) = self.pending_eos.take() {
                    self.pending_eos_to_satellite = false;
                    self.write_eos(driver, handle, eos, eos_counter)?;
                }
            }
            SatDataEvent::EosDone => match self.eos_in_flight.take() {
                Some(eos) => {
                    if eos.is_flushing_eos() {
                        *eos_counter = eos_counter.saturating_sub(1);
                    }
                    eos.destroy(false);
                    self.flags.flushing_eos = false;
                    self.flags.eof = false;
                }
                None => debug!("ext in port {}: duplicate EOS done ignored", self.key),
            },
            SatDataEvent::PeerProperty(prop) => progress.properties.push(prop),
            other => warn!("ext in port {}: unexpected satellite event {other:?}", self.key),
        }
        Ok(())
    }

    fn accept(
        &mut self,
        driver: &mut dyn SatelliteDriver,
        handle: DataPortHandle,
        msg: DataMsg,
        eos_counter: &mut u32,
        progress: &mut InputProgress,
    ) -> Result<()> {
        let mut buf = match msg {
            DataMsg::MediaFormat(fmt) => {
                debug!("ext in port {}: media format from upstream {:?}", self.key, fmt.data_format);
                self.media_fmt = fmt;
                self.flags.input_discontinuity = false;
                self.flags.pending_mf = false;
                driver.write_dl_pcd(handle, &fmt)?;
                return Ok(());
            }
            DataMsg::Buffer(buf) => buf,
        };

        if self.media_fmt.data_format.is_pcm() {
            let unit = self.media_fmt.frame_unit_size() as usize;
            if unit != 0 && buf.data.len() % unit != 0 {
                error!(
                    "ext in port {}: buffer of {} bytes is not a whole number of samples per channel",
                    self.key,
                    buf.data.len()
                );
                metadata::destroy_all(&mut buf.metadata, true);
                release_upstream(buf);
                return Err(OlcError::bad_param("partial PCM frame"));
            }
        }

        let mut eos = None;
        for md in buf.metadata.drain(..) {
            if md.is_eos() && eos.is_none() {
                eos = Some(md);
            } else if md.is_eos() {
                md.destroy(true);
            } else {
                self.metadata.push(md);
            }
        }
        self.timestamp = buf.timestamp;
        self.flags.eof = false;

        if buf.data.is_empty() {
            metadata::destroy_all(&mut self.metadata, false);
            release_upstream(buf);
            if let Some(eos) = eos {
                self.write_eos(driver, handle, eos, eos_counter)?;
            }
            return Ok(());
        }

        if self.data_flow == DataFlowState::AtGap {
            self.data_flow = DataFlowState::Flowing;
            progress.data_flow_started = true;
            debug!("ext in port {}: data flow started", self.key);
        }
        if let Err(e) = driver.write_data(handle, &buf.data, buf.timestamp) {
            metadata::destroy_all(&mut self.metadata, true);
            if let Some(eos) = eos {
                eos.destroy(true);
            }
            release_upstream(buf);
            return Err(e.into());
        }
        self.held = Some(HeldInput { buf, written: 0 });
        if let Some(eos) = eos {
            self.pending_eos = Some(eos);
            self.pending_eos_to_satellite = true;
        }
        Ok(())
    }

    fn write_eos(
        &mut self,
        driver: &mut dyn SatelliteDriver,
        handle: DataPortHandle,
        eos: Metadata,
        eos_counter: &mut u32,
    ) -> Result<()> {
        let flags = match eos.kind {
            MetadataKind::Eos(flags) => flags,
            _ => EosFlags::default(),
        };
        if let Err(e) = driver.write_eos(handle, flags) {
            error!("ext in port {}: EOS write failed, dropping it", self.key);
            eos.destroy(true);
            return Err(e.into());
        }
        if flags.flushing {
            *eos_counter += 1;
            self.flags.flushing_eos = true;
        }
        self.flags.eof = true;
        self.data_flow = DataFlowState::AtGap;
        if let Some(old) = self.eos_in_flight.replace(eos) {
            old.destroy(true);
        }
        Ok(())
    }

    /// Writes an internal flushing EOS to the satellite, unless the port is
    /// already at gap or has one in flight.
    pub(crate) fn send_internal_eos(&mut self, driver: &mut dyn SatelliteDriver, eos_counter: &mut u32) -> Result<()> {
        if self.data_flow == DataFlowState::AtGap || self.eos_in_flight.is_some() {
            return Ok(());
        }
        let handle = self
            .write_port
            .ok_or_else(|| OlcError::unexpected(format!("ext in port {} has no write port", self.key)))?;
        self.write_eos(driver, handle, Metadata::eos(EosFlags::INTERNAL_FLUSHING), eos_counter)
    }

    /// Inserts a data-flow gap on the write port.
    pub(crate) fn insert_data_flow_gap(&mut self, driver: &mut dyn SatelliteDriver) -> Result<()> {
        if let Some(handle) = self.write_port {
            driver.insert_data_flow_gap(handle)?;
        }
        self.data_flow = DataFlowState::AtGap;
        Ok(())
    }

    /// Discards queued input.
    ///
    /// With `keep_data_msg`, media-format messages go back on the queue in
    /// order; buffers are always released. Pending and in-flight EOS are
    /// destroyed as dropped.
    pub(crate) fn flush_input_data_queue(
        &mut self,
        driver: &mut dyn SatelliteDriver,
        keep_data_msg: bool,
        is_flush: bool,
        post_processing: bool,
        eos_counter: &mut u32,
    ) {
        if let Some(handle) = self.write_port {
            driver.flush_write_port(handle, is_flush, post_processing);
        }
        if let Some(held) = self.held.take() {
            release_upstream(held.buf);
        }
        self.bytes_from_prev_buf = 0;

        let drained: Vec<DataMsg> = self.data_q.drain().collect();
        for msg in drained {
            match msg {
                DataMsg::MediaFormat(fmt) if keep_data_msg => {
                    if self.data_q.push(DataMsg::MediaFormat(fmt)).is_err() {
                        error!("ext in port {}: pushing media format back failed", self.key);
                    }
                }
                DataMsg::MediaFormat(_) => {}
                DataMsg::Buffer(mut buf) => {
                    metadata::destroy_all(&mut buf.metadata, true);
                    release_upstream(buf);
                }
            }
        }

        if let Some(eos) = self.pending_eos.take() {
            eos.destroy(true);
        }
        self.pending_eos_to_satellite = false;
        if let Some(eos) = self.eos_in_flight.take() {
            if eos.is_flushing_eos() {
                *eos_counter = eos_counter.saturating_sub(1);
            }
            eos.destroy(true);
        }
        self.flags.flushing_eos = false;
    }

    /// Clears stream state after a stop or flush.
    pub(crate) fn reset(&mut self) {
        self.flags = ExtInFlags {
            pending_mf: self.flags.pending_mf,
            ..ExtInFlags::default()
        };
        self.data_flow = DataFlowState::AtGap;
        self.timestamp = None;
        self.bytes_from_prev_buf = 0;
        metadata::destroy_all(&mut self.metadata, true);
    }
}

fn release_upstream(buf: DataBuffer) {
    if buf.has_return_path() && !buf.recycle() {
        debug!("upstream buffer owner is gone");
    }
}
