use tracing::{debug, info};

mod contract;
#[cfg(all(
    feature = "backend-nvidia",
    any(target_os = "linux", target_os = "windows")
))]
mod nv_backend;

pub use contract::{
    BackendError, Chunk, ChunkSink, Codec, Dimensions, EncodeBackend, EncodedPayload,
    EncoderConfig, FrameFlag, InputSurface, Rational, SessionOpenError,
};

#[cfg(all(
    feature = "backend-nvidia",
    any(target_os = "linux", target_os = "windows")
))]
pub use nv_backend::NvEncodeBackend;

/// A hardware encoder session bound to fixed dimensions, frame rate, and
/// codec, holding exactly one registered GPU input buffer.
///
/// The caller uploads pixel data into the surface described by
/// [`EncodeSession::input_surface`], then calls [`EncodeSession::submit_frame`].
/// Completed output is handed to the active sink as [`Chunk`] views; the
/// buffer must not be written while a submit or flush call is in progress.
/// The session is single-threaded; concurrent encoding requires independent
/// sessions.
pub struct EncodeSession {
    backend: Box<dyn EncodeBackend>,
    sink: ChunkSink,
    dims: Dimensions,
    fps: Rational,
    codec: Codec,
    bytes_encoded: u64,
    frames_encoded: u32,
    chunks_emitted: u32,
}

impl EncodeSession {
    /// Open a session on an NVENC device bound to the caller's CUDA context.
    #[cfg(all(
        feature = "backend-nvidia",
        any(target_os = "linux", target_os = "windows")
    ))]
    pub fn open(
        config: EncoderConfig,
        ctx: std::sync::Arc<cudarc::driver::CudaContext>,
        sink: ChunkSink,
    ) -> Result<Self, SessionOpenError> {
        if !config.fps.is_valid() {
            return Err(SessionOpenError::InvalidFrameRate(config.fps));
        }
        let backend = nv_backend::NvEncodeBackend::open(&config, ctx)?;
        Self::with_backend(config, Box::new(backend), sink)
    }

    /// Open a session over an already-constructed backend.
    pub fn with_backend(
        config: EncoderConfig,
        backend: Box<dyn EncodeBackend>,
        sink: ChunkSink,
    ) -> Result<Self, SessionOpenError> {
        if !config.fps.is_valid() {
            return Err(SessionOpenError::InvalidFrameRate(config.fps));
        }
        info!(%config, "encode session opened");
        Ok(Self {
            backend,
            sink,
            dims: config.dims,
            fps: config.fps,
            codec: config.codec,
            bytes_encoded: 0,
            frames_encoded: 0,
            chunks_emitted: 0,
        })
    }

    /// Encode the input surface's current contents as one frame.
    ///
    /// The frame counter advances only once the hardware accepts the encode
    /// call; on error the counters are untouched and the session remains
    /// open and usable. No retries happen here; retry policy belongs to the
    /// caller.
    pub fn submit_frame(&mut self, flag: FrameFlag) -> Result<(), BackendError> {
        let timestamp = self.fps.timestamp_nanos(u64::from(self.frames_encoded));
        let payloads = self
            .backend
            .encode(flag, timestamp, self.fps.frame_duration_nanos())?;
        self.frames_encoded = self.frames_encoded.saturating_add(1);
        self.deliver(payloads);
        Ok(())
    }

    /// Drain all in-flight frames, deliver every pending chunk, then reset
    /// the byte/frame counters so they again read "since last flush".
    ///
    /// On error the session stays open, but pending output is lost: the
    /// hardware output stream cannot be re-drained without handing the
    /// caller duplicate or torn payloads. Counters are left un-reset in that
    /// case, since nothing was delivered.
    pub fn flush(&mut self) -> Result<(), BackendError> {
        let payloads = self.backend.drain()?;
        self.deliver(payloads);
        debug!(
            frames = self.frames_encoded,
            bytes = self.bytes_encoded,
            chunks = self.chunks_emitted,
            "flush complete, counters reset"
        );
        self.bytes_encoded = 0;
        self.frames_encoded = 0;
        self.chunks_emitted = 0;
        Ok(())
    }

    fn deliver(&mut self, payloads: Vec<EncodedPayload>) {
        for payload in payloads {
            let index = self.chunks_emitted;
            let chunk = Chunk {
                data: &payload.data,
                index,
                timestamp_nanos: self.fps.timestamp_nanos(u64::from(index)),
                duration_nanos: self.fps.frame_duration_nanos(),
                keyframe: payload.keyframe,
            };
            (self.sink)(chunk);
            self.chunks_emitted = self.chunks_emitted.saturating_add(1);
            self.bytes_encoded = self.bytes_encoded.saturating_add(payload.data.len() as u64);
        }
    }

    /// Replace the chunk sink. Chunks from subsequent submit/flush calls go
    /// to the new sink only.
    pub fn set_sink(&mut self, sink: ChunkSink) {
        self.sink = sink;
    }

    /// The GPU surface the caller uploads frames into.
    #[must_use]
    pub fn input_surface(&self) -> InputSurface {
        self.backend.input_surface()
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.dims.width.get()
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.dims.height.get()
    }

    #[must_use]
    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Frame rate as a float, for display and rough estimation only;
    /// [`EncodeSession::fps_exact`] is authoritative.
    #[must_use]
    pub fn fps(&self) -> f64 {
        self.fps.as_f64()
    }

    #[must_use]
    pub fn fps_exact(&self) -> Rational {
        self.fps
    }

    /// Total bytes emitted since creation or the last flush.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.bytes_encoded
    }

    /// Total frames processed since creation or the last flush.
    #[must_use]
    pub fn total_frames(&self) -> u32 {
        self.frames_encoded
    }

    /// Current time on the encoder in seconds.
    #[must_use]
    pub fn time(&self) -> f64 {
        f64::from(self.frames_encoded) / self.fps()
    }
}
