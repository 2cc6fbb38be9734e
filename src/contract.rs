use std::num::NonZeroU32;
use std::{fmt, fmt::Display};

const NANOS_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    H264,
    Hevc,
}

impl Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::H264 => f.write_str("h264"),
            Self::Hevc => f.write_str("hevc"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: NonZeroU32,
    pub height: NonZeroU32,
}

impl Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Frame rate as an exact numerator/denominator pair. The rational form is
/// authoritative for all timestamp math; see [`Rational::as_f64`] for the
/// advisory float form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rational {
    pub num: u32,
    pub den: u32,
}

impl Rational {
    #[must_use]
    pub fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// Rough estimate only; the numerator/denominator pair is exact.
    #[must_use]
    pub fn as_f64(&self) -> f64 {
        f64::from(self.num) / f64::from(self.den.max(1))
    }

    /// Presentation timestamp of the frame at `index`, in nanoseconds.
    ///
    /// Computed per index rather than by accumulation, so rounding error
    /// never drifts over long sessions.
    #[must_use]
    pub fn timestamp_nanos(&self, index: u64) -> u64 {
        let ticks = u128::from(index) * u128::from(NANOS_PER_SEC) * u128::from(self.den);
        (ticks / u128::from(self.num.max(1))) as u64
    }

    /// One frame period in nanoseconds.
    #[must_use]
    pub fn frame_duration_nanos(&self) -> u64 {
        self.timestamp_nanos(1)
    }
}

impl Display for Rational {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameFlag {
    #[default]
    None,
    /// Force the frame to start a fresh, independently decodable reference
    /// chain (IDR).
    ForceIdr,
}

/// One unit of compressed output.
///
/// `data` borrows transiently-owned memory and is valid only for the
/// synchronous extent of the sink invocation; copy it to retain it.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub data: &'a [u8],
    /// Monotonically increasing per session since the last flush.
    pub index: u32,
    pub timestamp_nanos: u64,
    pub duration_nanos: u64,
    pub keyframe: bool,
}

/// Caller-supplied chunk sink. Single slot, overwrite-on-set; not an event
/// bus.
pub type ChunkSink = Box<dyn FnMut(Chunk<'_>)>;

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub dims: Dimensions,
    pub fps: Rational,
    pub codec: Codec,
}

impl EncoderConfig {
    #[must_use]
    pub fn new(dims: Dimensions, fps: Rational, codec: Codec) -> Self {
        Self { dims, fps, codec }
    }
}

impl Display for EncoderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EncoderConfig(dims={}, fps={}, codec={})",
            self.dims, self.fps, self.codec
        )
    }
}

/// The GPU input surface the caller uploads pixel data into. The layout
/// contract is fixed at open time: ARGB, `pitch = width * 4`.
#[derive(Debug, Clone, Copy)]
pub struct InputSurface {
    pub device_ptr: u64,
    pub pitch: u32,
    pub size_bytes: usize,
}

/// One completed bitstream unit in hardware retrieval order.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub data: Vec<u8>,
    pub keyframe: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("unsupported codec: {0:?}")]
    UnsupportedCodec(Codec),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("temporary backpressure: {0}")]
    TemporaryBackpressure(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SessionOpenError {
    #[error("invalid frame rate: {0}")]
    InvalidFrameRate(Rational),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Hardware encode pipeline bound to one session: an opened encoder with one
/// registered input surface and an output stream. Opening the session is the
/// implementation's constructor; teardown is its `Drop`.
pub trait EncodeBackend {
    fn input_surface(&self) -> InputSurface;

    /// Encode the input surface's current contents. Returns whatever
    /// completed output the hardware made retrievable; an empty vec means
    /// the frame was accepted but its output is still buffered.
    fn encode(
        &mut self,
        flag: FrameFlag,
        timestamp_nanos: u64,
        duration_nanos: u64,
    ) -> Result<Vec<EncodedPayload>, BackendError>;

    /// Drain all in-flight work and return every remaining payload in
    /// submission order.
    fn drain(&mut self) -> Result<Vec<EncodedPayload>, BackendError>;
}
