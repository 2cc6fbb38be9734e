use std::cell::RefCell;
use std::num::NonZeroU32;
use std::rc::Rc;
use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use cudarc::driver::CudaContext;
use video_enc::{
    Chunk, ChunkSink, Codec, Dimensions, EncodeSession, EncoderConfig, FrameFlag, Rational,
};

#[derive(Parser, Debug)]
#[command(about = "Encode synthetic ARGB frames through an NVENC session")]
struct Args {
    #[arg(long, default_value = "h264")]
    codec: String,
    #[arg(long, default_value_t = 640)]
    width: u32,
    #[arg(long, default_value_t = 360)]
    height: u32,
    #[arg(long, default_value_t = 30000)]
    fps_num: u32,
    #[arg(long, default_value_t = 1001)]
    fps_den: u32,
    #[arg(long, default_value_t = 300)]
    frame_count: usize,
    #[arg(long, default_value_t = 0)]
    device: usize,
    #[arg(long, default_value = "./encoded-output.bin")]
    output: PathBuf,
    #[arg(long, default_value_t = 60)]
    idr_interval: usize,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let codec = parse_codec(&args.codec)?;
    let dims = Dimensions {
        width: NonZeroU32::new(args.width).context("width must be nonzero")?,
        height: NonZeroU32::new(args.height).context("height must be nonzero")?,
    };
    let config = EncoderConfig::new(dims, Rational::new(args.fps_num, args.fps_den), codec);

    let ctx = CudaContext::new(args.device)
        .with_context(|| format!("failed to initialize CUDA device {}", args.device))?;

    let bitstream = Rc::new(RefCell::new(Vec::<u8>::new()));
    let chunk_count = Rc::new(RefCell::new(0usize));
    let sink: ChunkSink = {
        let bitstream = Rc::clone(&bitstream);
        let chunk_count = Rc::clone(&chunk_count);
        Box::new(move |chunk: Chunk<'_>| {
            bitstream.borrow_mut().extend_from_slice(chunk.data);
            *chunk_count.borrow_mut() += 1;
        })
    };

    let mut session =
        EncodeSession::open(config, ctx.clone(), sink).context("failed to open encode session")?;

    let surface = session.input_surface();
    let width = args.width as usize;
    let height = args.height as usize;
    let mut frame = vec![0u8; surface.size_bytes];

    for i in 0..args.frame_count {
        fill_synthetic_argb(&mut frame, width, height, i);
        ctx.bind_to_thread()
            .context("failed to bind CUDA context")?;
        // SAFETY: the surface pointer and length come straight from the
        // session's registered input buffer.
        unsafe {
            cudarc::driver::result::memcpy_htod_sync(surface.device_ptr, &frame)
                .context("frame upload failed")?;
        }

        let flag = if args.idr_interval > 0 && i % args.idr_interval == 0 {
            FrameFlag::ForceIdr
        } else {
            FrameFlag::None
        };
        session
            .submit_frame(flag)
            .with_context(|| format!("submit failed at frame {i}"))?;
    }

    let encoded_seconds = session.time();
    session.flush().context("flush failed")?;

    fs::write(&args.output, bitstream.borrow().as_slice())
        .with_context(|| format!("failed to write output: {}", args.output.display()))?;
    println!(
        "frames={}, chunks={}, output_bytes={}, encoded_seconds={:.3}, output={}, codec={}",
        args.frame_count,
        chunk_count.borrow(),
        bitstream.borrow().len(),
        encoded_seconds,
        args.output.display(),
        args.codec
    );
    Ok(())
}

fn parse_codec(raw: &str) -> Result<Codec> {
    match raw.to_ascii_lowercase().as_str() {
        "h264" => Ok(Codec::H264),
        "hevc" | "h265" => Ok(Codec::Hevc),
        other => anyhow::bail!("unsupported codec: {other}"),
    }
}

fn fill_synthetic_argb(buffer: &mut [u8], width: usize, height: usize, frame_index: usize) {
    for y in 0..height {
        for x in 0..width {
            let offset = (y * width + x) * 4;
            buffer[offset] = ((x + frame_index) % 256) as u8;
            buffer[offset + 1] = ((y + frame_index * 2) % 256) as u8;
            buffer[offset + 2] = ((frame_index * 5) % 256) as u8;
            buffer[offset + 3] = 255;
        }
    }
}
