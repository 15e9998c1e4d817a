//! Drives a `Recorder` with two synthetic encoders and reports what it saw.
//!
//! Each encoder owns a small pool of output buffers and only reuses a buffer
//! once the recorder has released it, so a slow release shows up as encoder
//! stalls rather than as lost samples.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use crossbeam_channel::{bounded, Receiver, Sender};
use segmux_core::{
    Recorder, RecorderConfig, RecorderStatusEvent, SampleFlags, SampleInfo, SegmentEvent,
    StaticFormats, TrackFormat, TrackKind,
};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Output buffers per synthetic encoder.
const POOL_SIZE: usize = 4;

/// Library and binary log targets when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "segmux_core=info,segbench=info";

#[derive(Debug)]
struct Args {
    config: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    seconds: u64,
    segment_ms: Option<u64>,
    fps: u32,
    audio_packets_per_sec: u32,
    video_bytes: usize,
    audio_bytes: usize,
    summary: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy)]
struct EncoderSpec {
    kind: TrackKind,
    interval: Duration,
    bytes: usize,
    key_every: u64,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct EncoderStats {
    produced: u64,
    refused: u64,
    pool_stalls: u64,
    max_submit_us: u128,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    output_dir: PathBuf,
    seconds: u64,
    video: EncoderStats,
    audio: EncoderStats,
    outcome: String,
    segments: Vec<segmux_core::engine::rotation::FinalizedSegment>,
    diagnostics: segmux_core::engine::pipeline::DiagnosticsSnapshot,
    segment_events: Vec<SegmentEvent>,
    status_events: Vec<RecorderStatusEvent>,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        config: None,
        output_dir: None,
        seconds: 12,
        segment_ms: None,
        fps: 30,
        audio_packets_per_sec: 43,
        video_bytes: 24 * 1024,
        audio_bytes: 372,
        summary: None,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| {
            it.next()
                .ok_or_else(|| anyhow!("missing value for {name}"))
        };
        match arg.as_str() {
            "--config" => args.config = Some(PathBuf::from(value("--config")?)),
            "--out" => args.output_dir = Some(PathBuf::from(value("--out")?)),
            "--seconds" => {
                args.seconds = value("--seconds")?
                    .parse::<u64>()
                    .context("invalid value for --seconds")?
                    .clamp(1, 3600);
            }
            "--segment-ms" => {
                args.segment_ms = Some(
                    value("--segment-ms")?
                        .parse()
                        .context("invalid value for --segment-ms")?,
                );
            }
            "--fps" => {
                args.fps = value("--fps")?
                    .parse::<u32>()
                    .context("invalid value for --fps")?
                    .clamp(1, 240);
            }
            "--audio-rate" => {
                args.audio_packets_per_sec = value("--audio-rate")?
                    .parse::<u32>()
                    .context("invalid value for --audio-rate")?
                    .clamp(1, 1000);
            }
            "--video-bytes" => {
                args.video_bytes = value("--video-bytes")?
                    .parse()
                    .context("invalid value for --video-bytes")?;
            }
            "--audio-bytes" => {
                args.audio_bytes = value("--audio-bytes")?
                    .parse()
                    .context("invalid value for --audio-bytes")?;
            }
            "--summary" => args.summary = Some(PathBuf::from(value("--summary")?)),
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p segmux-core --bin segbench -- \\
  [--config <recorder.json>] [--out <dir>] [--seconds <n>] [--segment-ms <ms>] \\
  [--fps <n>] [--audio-rate <packets/s>] [--video-bytes <n>] [--audio-bytes <n>] \\
  [--summary <file.json>]"
                );
                std::process::exit(0);
            }
            other => return Err(anyhow!("unknown argument: {other}")),
        }
    }
    Ok(args)
}

/// Deterministic fake payload: pts in the first bytes, size jitter by frame.
fn fill(buf: &mut Vec<u8>, n: u64, nominal: usize, key: bool) {
    let size = if key {
        nominal * 4
    } else {
        nominal / 2 + (n as usize * 7919) % nominal.max(1)
    };
    buf.clear();
    buf.extend_from_slice(&n.to_le_bytes());
    buf.resize(size.max(8), (n % 251) as u8);
}

fn run_encoder(
    recorder: Arc<Recorder>,
    spec: EncoderSpec,
    until: Instant,
) -> EncoderStats {
    let (free_tx, free_rx): (Sender<usize>, Receiver<usize>) = bounded(POOL_SIZE);
    let mut buffers: Vec<Vec<u8>> = (0..POOL_SIZE).map(|_| Vec::new()).collect();
    for slot in 0..POOL_SIZE {
        let _ = free_tx.send(slot);
    }

    let mut stats = EncoderStats::default();
    let start = Instant::now();
    let mut n: u64 = 0;
    while Instant::now() < until {
        let slot = match free_rx.try_recv() {
            Ok(slot) => slot,
            Err(_) => {
                stats.pool_stalls += 1;
                match free_rx.recv_timeout(Duration::from_secs(1)) {
                    Ok(slot) => slot,
                    Err(_) => {
                        warn!(track = %spec.kind, "no output buffer released for 1s");
                        break;
                    }
                }
            }
        };

        let key = spec.key_every > 0 && n % spec.key_every == 0;
        fill(&mut buffers[slot], n, spec.bytes, key);
        let pts_us = start.elapsed().as_micros() as i64;
        let flags = if key { SampleFlags::KEY_FRAME } else { SampleFlags::NONE };
        let info = SampleInfo::new(pts_us, flags, buffers[slot].len());

        let release_tx = free_tx.clone();
        let submitted = Instant::now();
        let result = recorder.on_sample_available(spec.kind, &buffers[slot], info, move || {
            let _ = release_tx.send(slot);
        });
        stats.max_submit_us = stats.max_submit_us.max(submitted.elapsed().as_micros());
        match result {
            Ok(()) => stats.produced += 1,
            Err(e) => {
                stats.refused += 1;
                warn!(track = %spec.kind, "sample refused: {e}");
                if e.is_fatal() || matches!(e, segmux_core::RecorderError::Aborted) {
                    break;
                }
            }
        }

        n += 1;
        let next = start + spec.interval * n as u32;
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }
    stats
}

fn drain<T: Clone>(rx: &mut broadcast::Receiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => out.push(event),
            Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "event subscriber lagged"),
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    out
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("segbench failed: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = parse_args()?;

    let mut config = match &args.config {
        Some(path) => RecorderConfig::load(path)?,
        None => RecorderConfig::default(),
    };
    config.output_dir = match args.output_dir {
        Some(dir) => dir,
        None => PathBuf::from("segbench")
            .join(chrono::Local::now().format("run-%Y%m%d-%H%M%S").to_string()),
    };
    if let Some(ms) = args.segment_ms {
        config.segment_duration_ms = ms;
    }
    let output_dir = config.output_dir.clone();

    let formats = Arc::new(StaticFormats {
        video: TrackFormat::video("video/avc", 1280, 720),
        audio: TrackFormat::audio("audio/mp4a-latm", 44_100, 1),
    });
    let recorder = Arc::new(Recorder::new(config, formats));
    let mut segment_rx = recorder.subscribe_segments();
    let mut status_rx = recorder.subscribe_status();

    recorder.start()?;
    info!(
        dir = %output_dir.display(),
        seconds = args.seconds,
        fps = args.fps,
        "segbench running"
    );

    let until = Instant::now() + Duration::from_secs(args.seconds);
    let encoders = [
        EncoderSpec {
            kind: TrackKind::Video,
            interval: Duration::from_secs(1) / args.fps,
            bytes: args.video_bytes,
            key_every: u64::from(args.fps),
        },
        EncoderSpec {
            kind: TrackKind::Audio,
            interval: Duration::from_secs(1) / args.audio_packets_per_sec,
            bytes: args.audio_bytes,
            key_every: 0,
        },
    ];
    let handles = encoders
        .into_iter()
        .map(|spec| {
            let recorder = Arc::clone(&recorder);
            thread::Builder::new()
                .name(format!("segbench-{}-encoder", spec.kind))
                .spawn(move || run_encoder(recorder, spec, until))
                .context("failed to spawn encoder thread")
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut stats = Vec::with_capacity(2);
    for handle in handles {
        stats.push(
            handle
                .join()
                .map_err(|_| anyhow!("encoder thread panicked"))?,
        );
    }
    let audio = stats.pop().unwrap_or_default();
    let video = stats.pop().unwrap_or_default();

    let (outcome, segments) = match recorder.stop() {
        Ok(summary) => ("stopped".to_string(), summary.segments),
        Err(e) => {
            warn!("recording ended with an error: {e}");
            (e.to_string(), Vec::new())
        }
    };

    let report = Report {
        output_dir,
        seconds: args.seconds,
        video,
        audio,
        outcome,
        segments,
        diagnostics: recorder.diagnostics_snapshot(),
        segment_events: drain(&mut segment_rx),
        status_events: drain(&mut status_rx),
    };
    let json = serde_json::to_string_pretty(&report)?;
    match args.summary {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "summary written");
        }
        None => println!("{json}"),
    }
    Ok(())
}
