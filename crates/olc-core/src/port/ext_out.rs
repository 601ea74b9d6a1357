//! External output port: satellite read port in, local buffers out.
//!
//! Buffers are owned by the port and lent to the downstream peer. Each one
//! carries a return path to the port's buffer queue, so a recycled buffer
//! signals the port bit and unblocks delivery.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crossbeam_channel::TrySendError;
use tracing::{debug, error, warn};

use super::{DataBuffer, DataMsg, DownstreamHandle, PeerCtrlMsg, PeerProperty, PortEnv, PortState};
use crate::channel::{BitQueue, QueueError};
use crate::error::{OlcError, Result};
use crate::ids::{PortId, PortRef, SubGraphId};
use crate::media::{DataFormat, MediaFormat, Timestamp};
use crate::metadata::{self, Metadata};
use crate::satellite::{DataPortHandle, SatDataEvent, SatReadData, SatelliteDriver};

/// Buffer size used when nothing better is known.
pub const DEFAULT_BUF_SIZE: usize = 1920;

/// Buffer size for raw compressed streams.
pub const RAW_COMPRESSED_BUF_SIZE: usize = 2048;

/// Where a pending output media format is sent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MfPath {
    /// In band, on the downstream data queue.
    Data,
    /// Out of band, on the downstream command queue.
    Command,
}

/// Inter-container buffering state of an output port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IcbInfo {
    /// Downstream is real-time.
    pub ds_is_real_time: bool,
    /// Downstream frame length in µs; 0 until informed.
    pub ds_frame_len_us: u32,
    /// Downstream period in µs; 0 until informed.
    pub ds_period_us: u32,
    /// Regular buffers needed.
    pub num_reg_bufs: u32,
    /// Prebuffers needed.
    pub num_reg_prebufs: u32,
}

impl IcbInfo {
    fn downstream_known(&self) -> bool {
        self.ds_frame_len_us != 0 || self.ds_period_us != 0
    }
}

/// What one pass over the output port produced.
#[derive(Debug, Default)]
pub(crate) struct OutputProgress {
    /// Buffers handed to the downstream peer.
    pub delivered: u32,
    /// Properties reported by the satellite read port.
    pub properties: Vec<PeerProperty>,
}

/// External output port.
#[derive(Debug)]
pub struct ExtOutPort {
    id: PortId,
    key: PortRef,
    sub_graph: SubGraphId,
    bit: u32,
    buf_q: BitQueue<DataBuffer>,
    sat_q: BitQueue<SatDataEvent>,
    read_port: Option<DataPortHandle>,
    pub(crate) state: PortState,
    pub(crate) connected_state: PortState,
    pub(crate) icb: IcbInfo,
    pub(crate) is_upstream_rt: bool,
    pub(crate) media_fmt: MediaFormat,
    pub(crate) first_media_format: bool,
    pub(crate) media_fmt_changed: bool,
    pub(crate) timestamp: Option<Timestamp>,
    pub(crate) frame_count: u64,
    num_buf_allocated: u32,
    buf_max_size: usize,
    pub(crate) required_buf_size: usize,
    held: Option<DataBuffer>,
    pending_read: VecDeque<SatReadData>,
    pub(crate) metadata: Vec<Metadata>,
    pub(crate) downstream: Option<DownstreamHandle>,
    pub(crate) closing: bool,
}

impl ExtOutPort {
    /// Requests a bit, creates both queues and the satellite read port.
    pub(crate) fn create(env: &mut PortEnv<'_>, key: PortRef, sub_graph: SubGraphId, id: PortId) -> Result<Self> {
        let bit = env.pool.request().ok_or(OlcError::NoBitAvailable {
            available: env.pool.available(),
        })?;
        let buf_q = BitQueue::new(format!("BOLC{:08X}", env.log_id), env.data_capacity, bit, env.channel);
        let sat_q = BitQueue::new(format!("SOLC{:08X}", env.log_id), env.data_capacity, bit, env.channel);

        let handle = match env.driver.create_read_port(key, sat_q.handle()) {
            Ok(h) => h,
            Err(e) => {
                env.pool.release(bit);
                return Err(e.into());
            }
        };
        if let Err(e) = env.driver.setup_read_port(handle) {
            env.driver.destroy_read_port(handle);
            env.pool.release(bit);
            return Err(e.into());
        }

        debug!(
            log_id = env.log_id,
            "ext out port {key} created, bit 0x{bit:08X}, read port {}",
            handle.index()
        );
        Ok(Self {
            id,
            key,
            sub_graph,
            bit,
            buf_q,
            sat_q,
            read_port: Some(handle),
            state: PortState::Stopped,
            connected_state: PortState::Invalid,
            icb: IcbInfo::default(),
            is_upstream_rt: false,
            media_fmt: MediaFormat::default(),
            first_media_format: true,
            media_fmt_changed: false,
            timestamp: None,
            frame_count: 0,
            num_buf_allocated: 0,
            buf_max_size: 0,
            required_buf_size: 0,
            held: None,
            pending_read: VecDeque::new(),
            metadata: Vec::new(),
            downstream: None,
            closing: false,
        })
    }

    /// Tears the port down.
    ///
    /// Waits on the port bit for lent buffers to come back, for at most
    /// `reclaim_timeout` in total. Buffers still out after that are leaked
    /// to their holder.
    pub(crate) fn deinit(mut self, env: &mut PortEnv<'_>, reclaim_timeout: Duration) {
        self.flush_output_data_queue(env.driver, false);
        self.destroy_ext_buffers(0);
        let deadline = Instant::now() + reclaim_timeout;
        while self.num_buf_allocated > 0 {
            let now = Instant::now();
            if now >= deadline {
                warn!(
                    log_id = env.log_id,
                    "ext out port {}: {} buffers not returned in time",
                    self.key,
                    self.num_buf_allocated
                );
                break;
            }
            env.channel.wait_timeout(self.bit, deadline - now);
            self.destroy_ext_buffers(0);
        }
        metadata::destroy_all(&mut self.metadata, true);
        if let Some(handle) = self.read_port.take() {
            env.driver.destroy_read_port(handle);
        }
        if !env.pool.release(self.bit) {
            error!(log_id = env.log_id, "ext out port {}: bit 0x{:08X} was not in use", self.key, self.bit);
        }
        debug!(log_id = env.log_id, "ext out port {} destroyed", self.key);
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

    /// Last state reported by the connected downstream port.
    pub fn connected_state(&self) -> PortState {
        self.connected_state
    }

    /// Output media format.
    pub fn media_format(&self) -> MediaFormat {
        self.media_fmt
    }

    /// A media format waits to be sent downstream.
    pub fn media_format_changed(&self) -> bool {
        self.media_fmt_changed
    }

    /// Upstream (satellite side) is real-time.
    pub fn is_upstream_rt(&self) -> bool {
        self.is_upstream_rt
    }

    /// Buffering info.
    pub fn icb(&self) -> IcbInfo {
        self.icb
    }

    /// Buffers currently owned by the port, resident or lent out.
    pub fn num_buf_allocated(&self) -> u32 {
        self.num_buf_allocated
    }

    /// Size of newly created buffers.
    pub fn buf_max_size(&self) -> usize {
        self.buf_max_size
    }

    /// Timestamp of the last delivered buffer.
    pub fn timestamp(&self) -> Option<Timestamp> {
        self.timestamp
    }

    /// Buffers delivered since the last reset.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Satellite read port.
    pub fn read_port(&self) -> Option<DataPortHandle> {
        self.read_port
    }

    /// Buffers resident in the port's queue.
    pub fn resident_buffers(&self) -> usize {
        self.buf_q.len() + usize::from(self.held.is_some())
    }

    /// Satellite reads waiting for a free buffer.
    pub fn pending_reads(&self) -> usize {
        self.pending_read.len()
    }

    /// Creates `count` buffers of `size` bytes and queues them.
    pub fn create_bufs(&mut self, count: u32, size: usize) -> Result<()> {
        if size <= 1 {
            return Ok(());
        }
        debug!("ext out port {}: creating {count} buffers of {size} bytes", self.key);
        for _ in 0..count {
            let buf = DataBuffer::empty(size).with_return(self.buf_q.handle());
            self.buf_q.push(buf).map_err(|_| OlcError::QueueFull {
                name: self.buf_q.name().to_string(),
            })?;
            self.num_buf_allocated += 1;
        }
        Ok(())
    }

    /// Frees `allocated - keep` buffers, or fewer if some are lent out.
    ///
    /// Returns how many were freed. Never blocks: buffers still held by the
    /// downstream stay allocated, and the caller decides whether to wait for
    /// them. Teardown does so in `deinit`, bounded by the reclaim timeout.
    pub fn destroy_ext_buffers(&mut self, keep: u32) -> u32 {
        let target = self.num_buf_allocated.saturating_sub(keep);
        self.return_held();
        let mut freed = 0;
        while freed < target {
            let Some(mut buf) = self.buf_q.pop() else {
                break;
            };
            metadata::destroy_all(&mut buf.metadata, true);
            freed += 1;
        }
        self.num_buf_allocated -= freed;
        debug!(
            "ext out port {}: destroyed {freed} buffers, {} kept",
            self.key, self.num_buf_allocated
        );
        freed
    }

    fn return_held(&mut self) {
        if let Some(mut buf) = self.held.take() {
            metadata::destroy_all(&mut buf.metadata, true);
            buf.data.clear();
            buf.timestamp = None;
            if self.buf_q.push(buf).is_err() {
                error!("ext out port {}: returning held buffer failed", self.key);
                self.num_buf_allocated = self.num_buf_allocated.saturating_sub(1);
            }
        }
    }

    /// Returns the held buffer to the queue. Timestamps and counters are
    /// left alone, so flushing an idle port changes nothing.
    pub fn flush_cnt_output_data_queue(&mut self) {
        self.return_held();
    }

    /// Local flush plus a flush of the satellite read port.
    pub(crate) fn flush_output_data_queue(&mut self, driver: &mut dyn SatelliteDriver, is_client_cmd: bool) {
        self.flush_cnt_output_data_queue();
        self.pending_read.clear();
        if let Some(handle) = self.read_port {
            driver.flush_read_port(handle, is_client_cmd, false);
        }
    }

    /// Clears per-stream state; buffers stay allocated.
    pub(crate) fn basic_reset(&mut self) {
        self.flush_cnt_output_data_queue();
        metadata::destroy_all(&mut self.metadata, true);
    }

    /// Full reset after stop.
    pub(crate) fn reset(&mut self) {
        self.basic_reset();
        self.pending_read.clear();
        self.timestamp = None;
        self.frame_count = 0;
    }

    /// Sends the output media format downstream.
    ///
    /// Returns `Ok(false)` when there is no downstream peer or the format is
    /// still unknown.
    pub fn apply_pending_media_fmt(&mut self, path: MfPath) -> Result<bool> {
        let Some(ds) = &self.downstream else {
            return Ok(false);
        };
        if self.media_fmt.data_format == DataFormat::Unknown {
            return Ok(false);
        }
        let fmt = self.media_fmt;
        match path {
            MfPath::Data => ds.data.push(DataMsg::MediaFormat(fmt)).map_err(|_| OlcError::QueueFull {
                name: format!("downstream of {}", self.key),
            })?,
            MfPath::Command => ds
                .cmd
                .try_send(PeerCtrlMsg::MediaFormat(fmt))
                .map_err(|_| OlcError::QueueFull {
                    name: format!("downstream cmd of {}", self.key),
                })?,
        }
        debug!("ext out port {}: media format sent on {path:?} path", self.key);
        self.media_fmt_changed = false;
        self.first_media_format = false;
        Ok(true)
    }

    /// Buffer size for the current format and container frame size.
    pub fn required_out_buf_size(&self, frame_size_us: u32) -> usize {
        if self.required_buf_size != 0 {
            return self.required_buf_size;
        }
        match self.media_fmt.data_format {
            DataFormat::RawCompressed => RAW_COMPRESSED_BUF_SIZE,
            df if df.is_pcm() => match self.media_fmt.bytes_for_duration(frame_size_us) {
                0 => DEFAULT_BUF_SIZE,
                size => size,
            },
            _ => DEFAULT_BUF_SIZE,
        }
    }

    /// Works out the regular and prebuffer counts.
    fn determine_buffering(&mut self) -> u32 {
        self.icb.num_reg_prebufs = 0;
        self.icb.num_reg_bufs = if self.media_fmt.data_format == DataFormat::RawCompressed || !self.icb.downstream_known() {
            2
        } else if self.icb.ds_is_real_time || self.is_upstream_rt {
            2
        } else {
            1
        };
        if self.icb.downstream_known() && self.icb.ds_is_real_time && !self.is_upstream_rt {
            self.icb.num_reg_prebufs = 1;
        }
        self.icb.num_reg_bufs + self.icb.num_reg_prebufs
    }

    /// Resizes the buffer pool after a format, frame size or RT change.
    ///
    /// Growing destroys and recreates every resident buffer; shrinking only
    /// lowers `buf_max_size`. Without a downstream peer nothing is done.
    pub(crate) fn recreate_ext_out_buffers(&mut self, driver: &mut dyn SatelliteDriver, frame_size_us: u32) -> Result<()> {
        if self.downstream.is_none() {
            debug!("ext out port {}: no downstream yet, buffers not created", self.key);
            return Ok(());
        }
        let size = self.required_out_buf_size(frame_size_us);
        let count = self.determine_buffering();
        let handle = self
            .read_port
            .ok_or_else(|| OlcError::unexpected(format!("ext out port {} has no read port", self.key)))?;

        if size > self.buf_max_size {
            self.destroy_ext_buffers(0);
            self.buf_max_size = size;
            let missing = count.saturating_sub(self.num_buf_allocated);
            self.create_bufs(missing, size)?;
            driver.recreate_output_buffers(handle, size, count)?;
        } else if size < self.buf_max_size {
            self.buf_max_size = size;
            driver.recreate_output_buffers(handle, size, count)?;
        }
        Ok(())
    }

    fn buffers_needed(&self) -> u32 {
        match self.icb.num_reg_bufs + self.icb.num_reg_prebufs {
            0 => 2,
            n => n,
        }
    }

    /// Pops a free buffer, replacing undersized ones and allocating on
    /// demand up to the needed count.
    fn pop_out_buf(&mut self) -> Result<Option<DataBuffer>> {
        if self.buf_max_size == 0 {
            self.buf_max_size = DEFAULT_BUF_SIZE;
        }
        while let Some(buf) = self.buf_q.pop() {
            if buf.max_len >= self.buf_max_size && self.num_buf_allocated <= self.buffers_needed() {
                return Ok(Some(buf));
            }
            self.num_buf_allocated -= 1;
            debug!("ext out port {}: dropped a stale {}-byte buffer", self.key, buf.max_len);
        }
        if self.num_buf_allocated < self.buffers_needed() {
            self.num_buf_allocated += 1;
            return Ok(Some(DataBuffer::empty(self.buf_max_size).with_return(self.buf_q.handle())));
        }
        Ok(None)
    }

    /// Runs the port until no more progress can be made.
    pub(crate) fn process(&mut self, driver: &mut dyn SatelliteDriver, frame_size_us: u32) -> Result<OutputProgress> {
        let mut progress = OutputProgress::default();
        loop {
            let mut moved = false;
            while let Some(event) = self.sat_q.pop() {
                moved = true;
                match event {
                    SatDataEvent::ReadDone(chunk) => self.pending_read.push_back(chunk),
                    SatDataEvent::MediaFormat { fmt, required_buf_size } => {
                        debug!("ext out port {}: satellite media format {:?}", self.key, fmt.data_format);
                        self.media_fmt = fmt;
                        self.media_fmt_changed = true;
                        self.required_buf_size = required_buf_size;
                        self.recreate_ext_out_buffers(driver, frame_size_us)?;
                    }
                    SatDataEvent::PeerProperty(prop) => progress.properties.push(prop),
                    other => warn!("ext out port {}: unexpected satellite event {other:?}", self.key),
                }
            }
            if self.state == PortState::Started {
                moved |= self.deliver_pending(&mut progress)?;
            }
            if !moved {
                break;
            }
        }
        if progress.delivered > 0 && self.state == PortState::Started {
            if let Some(handle) = self.read_port {
                driver.read_dl_pcd(handle)?;
            }
        }
        Ok(progress)
    }

    fn deliver_pending(&mut self, progress: &mut OutputProgress) -> Result<bool> {
        let mut moved = false;
        if let Some(buf) = self.held.take() {
            if !self.send_downstream(buf)? {
                return Ok(false);
            }
            progress.delivered += 1;
            moved = true;
        }
        while !self.pending_read.is_empty() {
            let Some(mut buf) = self.pop_out_buf()? else {
                break;
            };
            let Some(chunk) = self.pending_read.pop_front() else {
                break;
            };
            if self.media_fmt_changed && !self.apply_pending_media_fmt(MfPath::Data)? {
                debug!("ext out port {}: media format not sent, no downstream", self.key);
            }
            self.fill(&mut buf, chunk);
            moved = true;
            if !self.send_downstream(buf)? {
                break;
            }
            progress.delivered += 1;
        }
        Ok(moved)
    }

    fn fill(&mut self, buf: &mut DataBuffer, chunk: SatReadData) {
        let SatReadData { mut data, timestamp, eos } = chunk;
        if data.len() > buf.max_len {
            warn!(
                "ext out port {}: {} bytes read into a {}-byte buffer, truncating",
                self.key,
                data.len(),
                buf.max_len
            );
            data.truncate(buf.max_len);
        }
        buf.data = data;
        buf.timestamp = timestamp;
        self.timestamp = timestamp.or(self.timestamp);
        buf.metadata.append(&mut self.metadata);
        if let Some(flags) = eos {
            buf.metadata.push(Metadata::eos(flags));
        }
        self.frame_count += 1;
    }

    /// Returns `Ok(false)` if the downstream queue is full; the buffer is
    /// then held for the next trigger.
    fn send_downstream(&mut self, buf: DataBuffer) -> Result<bool> {
        let Some(ds) = &self.downstream else {
            warn!("ext out port {}: no downstream, dropping buffer", self.key);
            let mut buf = buf;
            metadata::destroy_all(&mut buf.metadata, true);
            if !buf.recycle() {
                self.num_buf_allocated = self.num_buf_allocated.saturating_sub(1);
            }
            return Ok(true);
        };
        match ds.data.push(DataMsg::Buffer(buf)) {
            Ok(()) => Ok(true),
            Err(QueueError::Full(DataMsg::Buffer(buf))) => {
                self.held = Some(buf);
                Ok(false)
            }
            Err(err) => {
                error!("ext out port {}: downstream queue closed", self.key);
                if let DataMsg::Buffer(mut buf) = err.into_inner() {
                    metadata::destroy_all(&mut buf.metadata, true);
                    if !buf.recycle() {
                        self.num_buf_allocated = self.num_buf_allocated.saturating_sub(1);
                    }
                }
                Err(OlcError::QueueFull {
                    name: format!("downstream of {}", self.key),
                })
            }
        }
    }

    /// Forwards a property to the downstream peer's command queue.
    pub(crate) fn send_peer_property(&self, prop: PeerProperty) -> Result<bool> {
        let Some(ds) = &self.downstream else {
            return Ok(false);
        };
        match ds.cmd.try_send(PeerCtrlMsg::PropertyUpdate(vec![prop])) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(_) | TrySendError::Disconnected(_)) => Err(OlcError::QueueFull {
                name: format!("downstream cmd of {}", self.key),
            }),
        }
    }

    /// Hands a buffer carrying only `md` downstream.
    pub(crate) fn push_metadata_only(&mut self, md: Metadata) -> Result<()> {
        let mut buf = match self.pop_out_buf()? {
            Some(buf) => buf,
            None => DataBuffer::default(),
        };
        buf.metadata.push(md);
        if !self.send_downstream(buf)? {
            return Err(OlcError::QueueFull {
                name: format!("downstream of {}", self.key),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmask::BitMaskPool;
    use crate::channel::WaitChannel;
    use crate::metadata::EosFlags;
    use crate::sim::{LoopbackSatellite, PeerEndpoint};

    fn make(pool: &mut BitMaskPool, sat: &mut LoopbackSatellite) -> ExtOutPort {
        let ch = WaitChannel::new();
        let mut env = PortEnv {
            log_id: 1,
            pool,
            channel: &ch,
            driver: sat,
            data_capacity: 8,
        };
        ExtOutPort::create(&mut env, PortRef::new(0x20, 1), SubGraphId(1), PortId(1)).unwrap()
    }

    // --- buffer accounting ---

    #[test]
    fn destroy_keeps_exactly_the_rest() {
        let mut pool = BitMaskPool::new();
        let mut sat = LoopbackSatellite::new();
        let mut port = make(&mut pool, &mut sat);
        port.create_bufs(4, 256).unwrap();
        assert_eq!(port.destroy_ext_buffers(2), 2);
        assert_eq!(port.num_buf_allocated(), 2);
        assert_eq!(port.destroy_ext_buffers(5), 0);
    }

    #[test]
    fn lent_buffers_are_not_freed() {
        let mut pool = BitMaskPool::new();
        let mut sat = LoopbackSatellite::new();
        let mut port = make(&mut pool, &mut sat);
        port.create_bufs(3, 256).unwrap();
        let lent = port.buf_q.pop().unwrap();
        assert_eq!(port.destroy_ext_buffers(0), 2);
        assert_eq!(port.num_buf_allocated(), 1);
        assert!(lent.recycle());
        assert_eq!(port.destroy_ext_buffers(0), 1);
        assert_eq!(port.num_buf_allocated(), 0);
    }

    #[test]
    fn deinit_stops_waiting_for_lent_buffers_at_the_timeout() {
        let mut pool = BitMaskPool::new();
        let free = pool.count_available();
        let mut sat = LoopbackSatellite::new();
        let mut port = make(&mut pool, &mut sat);
        port.create_bufs(2, 64).unwrap();
        let _lent = port.buf_q.pop().unwrap();

        let ch = WaitChannel::new();
        let mut env = PortEnv {
            log_id: 1,
            pool: &mut pool,
            channel: &ch,
            driver: &mut sat,
            data_capacity: 8,
        };
        let begun = Instant::now();
        port.deinit(&mut env, Duration::from_millis(5));
        assert!(begun.elapsed() >= Duration::from_millis(5));
        assert_eq!(pool.count_available(), free);
    }

    #[test]
    fn flush_on_idle_port_changes_nothing() {
        let mut pool = BitMaskPool::new();
        let mut sat = LoopbackSatellite::new();
        let mut port = make(&mut pool, &mut sat);
        port.create_bufs(2, 64).unwrap();
        port.timestamp = Some(Timestamp::at(500));
        port.flush_cnt_output_data_queue();
        assert_eq!(port.num_buf_allocated(), 2);
        assert_eq!(port.resident_buffers(), 2);
        assert_eq!(port.timestamp(), Some(Timestamp::at(500)));
    }

    // --- sizing ---

    #[test]
    fn buffer_size_follows_format() {
        let mut pool = BitMaskPool::new();
        let mut sat = LoopbackSatellite::new();
        let mut port = make(&mut pool, &mut sat);
        assert_eq!(port.required_out_buf_size(1000), DEFAULT_BUF_SIZE);
        port.media_fmt = MediaFormat::pcm(48_000, 2, 16);
        assert_eq!(port.required_out_buf_size(1000), 192);
        port.media_fmt = MediaFormat::raw_compressed(7);
        assert_eq!(port.required_out_buf_size(1000), RAW_COMPRESSED_BUF_SIZE);
        port.required_buf_size = 4000;
        assert_eq!(port.required_out_buf_size(1000), 4000);
    }

    #[test]
    fn recreate_grows_and_shrinks() {
        let mut pool = BitMaskPool::new();
        let mut sat = LoopbackSatellite::new();
        let mut port = make(&mut pool, &mut sat);
        let peer = PeerEndpoint::new(8);
        port.downstream = Some(peer.downstream_handle());
        port.media_fmt = MediaFormat::pcm(48_000, 2, 16);
        port.recreate_ext_out_buffers(&mut sat, 5000).unwrap();
        assert_eq!(port.buf_max_size(), 960);
        assert_eq!(port.num_buf_allocated(), 2);
        port.recreate_ext_out_buffers(&mut sat, 1000).unwrap();
        assert_eq!(port.buf_max_size(), 192);
        assert_eq!(sat.recreate_calls(), 2);
        port.recreate_ext_out_buffers(&mut sat, 1000).unwrap();
        assert_eq!(sat.recreate_calls(), 2);
    }

    #[test]
    fn prebuffer_for_rt_downstream_of_ftrt() {
        let mut pool = BitMaskPool::new();
        let mut sat = LoopbackSatellite::new();
        let mut port = make(&mut pool, &mut sat);
        port.media_fmt = MediaFormat::pcm(48_000, 2, 16);
        port.icb.ds_frame_len_us = 1000;
        port.icb.ds_is_real_time = true;
        assert_eq!(port.determine_buffering(), 3);
        port.is_upstream_rt = true;
        assert_eq!(port.determine_buffering(), 2);
        port.icb.ds_is_real_time = false;
        port.is_upstream_rt = false;
        assert_eq!(port.determine_buffering(), 1);
    }

    // --- delivery ---

    #[test]
    fn read_done_is_delivered_with_media_format_first() {
        let mut pool = BitMaskPool::new();
        let mut sat = LoopbackSatellite::new();
        let mut port = make(&mut pool, &mut sat);
        let peer = PeerEndpoint::new(8);
        port.downstream = Some(peer.downstream_handle());
        port.state = PortState::Started;
        port.media_fmt = MediaFormat::pcm(48_000, 1, 16);
        port.media_fmt_changed = true;
        let events = port.sat_q.handle();
        events
            .push(SatDataEvent::ReadDone(SatReadData {
                data: vec![7; 32],
                timestamp: Some(Timestamp::at(100)),
                eos: Some(EosFlags::default()),
            }))
            .unwrap();
        let progress = port.process(&mut sat, 1000).unwrap();
        assert_eq!(progress.delivered, 1);
        assert!(matches!(peer.try_recv_data(), Some(DataMsg::MediaFormat(_))));
        let Some(DataMsg::Buffer(buf)) = peer.try_recv_data() else {
            panic!("expected a buffer");
        };
        assert_eq!(buf.data.len(), 32);
        assert!(buf.metadata.iter().any(Metadata::is_eos));
        assert_eq!(port.timestamp(), Some(Timestamp::at(100)));
        assert!(!port.media_format_changed());
    }

    #[test]
    fn stalls_without_free_buffers() {
        let mut pool = BitMaskPool::new();
        let mut sat = LoopbackSatellite::new();
        let mut port = make(&mut pool, &mut sat);
        let peer = PeerEndpoint::new(8);
        port.downstream = Some(peer.downstream_handle());
        port.state = PortState::Started;
        let events = port.sat_q.handle();
        for _ in 0..3 {
            events.push(SatDataEvent::ReadDone(SatReadData::default())).unwrap();
        }
        let progress = port.process(&mut sat, 1000).unwrap();
        assert_eq!(progress.delivered, 2);
        assert_eq!(port.pending_reads(), 1);

        let Some(DataMsg::Buffer(buf)) = peer.try_recv_data() else {
            panic!("expected a buffer");
        };
        assert!(buf.recycle());
        let progress = port.process(&mut sat, 1000).unwrap();
        assert_eq!(progress.delivered, 1);
        assert_eq!(port.pending_reads(), 0);
    }
}
