use std::num::NonZeroU32;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use video_enc::{
    BackendError, Chunk, ChunkSink, Codec, Dimensions, EncodeBackend, EncodeSession,
    EncodedPayload, EncoderConfig, FrameFlag, InputSurface, Rational,
};

/// Backend that returns a fixed-size payload per encode call, so the bench
/// measures the session's sequencing and delivery path rather than hardware.
struct FixedPayloadBackend {
    payload: Vec<u8>,
}

impl EncodeBackend for FixedPayloadBackend {
    fn input_surface(&self) -> InputSurface {
        InputSurface {
            device_ptr: 0x7000_0000,
            pitch: 1920 * 4,
            size_bytes: 1920 * 1080 * 4,
        }
    }

    fn encode(
        &mut self,
        _flag: FrameFlag,
        _timestamp_nanos: u64,
        _duration_nanos: u64,
    ) -> Result<Vec<EncodedPayload>, BackendError> {
        Ok(vec![EncodedPayload {
            data: self.payload.clone(),
            keyframe: false,
        }])
    }

    fn drain(&mut self) -> Result<Vec<EncodedPayload>, BackendError> {
        Ok(Vec::new())
    }
}

fn session_with_payload(payload_bytes: usize) -> EncodeSession {
    let config = EncoderConfig::new(
        Dimensions {
            width: NonZeroU32::new(1920).unwrap(),
            height: NonZeroU32::new(1080).unwrap(),
        },
        Rational::new(30_000, 1_001),
        Codec::H264,
    );
    let backend = Box::new(FixedPayloadBackend {
        payload: vec![0x42; payload_bytes],
    });
    let sink: ChunkSink = Box::new(|chunk: Chunk<'_>| {
        std::hint::black_box(chunk.data.len());
    });
    EncodeSession::with_backend(config, backend, sink).expect("session should open")
}

fn submit_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("submit_deliver");
    group.sample_size(50);
    group.measurement_time(Duration::from_secs(5));
    group.warm_up_time(Duration::from_secs(1));

    for payload_bytes in [1024usize, 16 * 1024, 256 * 1024] {
        group.throughput(Throughput::Bytes(payload_bytes as u64));
        group.bench_with_input(
            BenchmarkId::new("submit_frame", format!("payload_{payload_bytes}")),
            &payload_bytes,
            |b, &payload_bytes| {
                let mut session = session_with_payload(payload_bytes);
                b.iter(|| {
                    session
                        .submit_frame(FrameFlag::None)
                        .expect("submit should succeed in benchmark");
                });
            },
        );
    }

    for payload_bytes in [1024usize, 16 * 1024] {
        group.throughput(Throughput::Bytes((payload_bytes * 30) as u64));
        group.bench_with_input(
            BenchmarkId::new("thirty_frames_and_flush", format!("payload_{payload_bytes}")),
            &payload_bytes,
            |b, &payload_bytes| {
                b.iter(|| {
                    let mut session = session_with_payload(payload_bytes);
                    for _ in 0..30 {
                        session
                            .submit_frame(FrameFlag::None)
                            .expect("submit should succeed in benchmark");
                    }
                    session.flush().expect("flush should succeed in benchmark");
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, submit_benchmark);
criterion_main!(benches);
