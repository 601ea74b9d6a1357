//! Media format and timestamp descriptors carried across port boundaries.

/// Data format of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum DataFormat {
    /// Not yet known; nothing can be propagated.
    #[default]
    Unknown,
    /// Interleaved or deinterleaved fixed-point PCM.
    FixedPoint,
    /// Floating-point PCM.
    FloatingPoint,
    /// Packetized (e.g. IEC 61937) stream.
    Packetized,
    /// Raw compressed bitstream.
    RawCompressed,
}

impl DataFormat {
    /// PCM formats (fixed or floating point).
    #[inline]
    pub fn is_pcm(self) -> bool {
        matches!(self, DataFormat::FixedPoint | DataFormat::FloatingPoint)
    }

    /// Formats counted by the kpps/bandwidth model.
    #[inline]
    pub fn is_pcm_or_packetized(self) -> bool {
        self.is_pcm() || self == DataFormat::Packetized
    }
}

/// PCM stream parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct PcmFormat {
    /// Samples per second.
    pub sample_rate: u32,
    /// Channel count.
    pub num_channels: u32,
    /// Container bits per sample.
    pub bits_per_sample: u32,
}

/// Media format of an external port.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct MediaFormat {
    /// Data format.
    pub data_format: DataFormat,
    /// PCM parameters; zero for non-PCM formats.
    pub pcm: PcmFormat,
    /// Client format id (codec id for compressed data).
    pub fmt_id: u32,
}

impl MediaFormat {
    /// Fixed-point PCM format.
    pub fn pcm(sample_rate: u32, num_channels: u32, bits_per_sample: u32) -> Self {
        Self {
            data_format: DataFormat::FixedPoint,
            pcm: PcmFormat {
                sample_rate,
                num_channels,
                bits_per_sample,
            },
            fmt_id: 0,
        }
    }

    /// Raw compressed format with a codec id.
    pub fn raw_compressed(fmt_id: u32) -> Self {
        Self {
            data_format: DataFormat::RawCompressed,
            pcm: PcmFormat::default(),
            fmt_id,
        }
    }

    /// Returns `true` when the data format is known.
    #[inline]
    pub fn is_known(&self) -> bool {
        self.data_format != DataFormat::Unknown
    }

    /// Bytes per sample, rounded down from the bit depth.
    #[inline]
    pub fn bytes_per_sample(&self) -> u32 {
        self.pcm.bits_per_sample / 8
    }

    /// Size of one sample across all channels, or 0 if unknown.
    #[inline]
    pub fn frame_unit_size(&self) -> u32 {
        self.pcm.num_channels * self.bytes_per_sample()
    }

    /// Bytes covering `duration_us` of PCM audio: `sr/1000 × B × ch × us/1000`.
    pub fn bytes_for_duration(&self, duration_us: u32) -> usize {
        let per_ms =
            u64::from(self.pcm.sample_rate / 1000) * u64::from(self.bytes_per_sample()) * u64::from(self.pcm.num_channels);
        (per_ms * u64::from(duration_us) / 1000) as usize
    }
}

/// Timestamp attached to a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Timestamp {
    /// Microseconds.
    pub value_us: i64,
    /// Whether `value_us` is meaningful.
    pub valid: bool,
    /// Whether the timestamp continues the previous buffer's.
    pub continuous: bool,
}

impl Timestamp {
    /// Valid timestamp at `value_us`.
    pub fn at(value_us: i64) -> Self {
        Self {
            value_us,
            valid: true,
            continuous: false,
        }
    }
}
