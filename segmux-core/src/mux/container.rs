//! `SegmentFileMuxer` — the on-disk segment container.
//!
//! ## Layout (all integers little-endian)
//!
//! ```text
//! "SEGMUX01"                      magic
//! u32 len, [u8; len]              JSON track table (Vec<TrackFormat>)
//! repeated:
//!   0x01 u8 track u32 flags i64 pts_us u32 len [u8; len]
//! 0xFF u32 track_count [u64; track_count] "SEGEND"   trailer, written by stop()
//! ```
//!
//! A file without a trailer was never finalized and `read_segment` rejects it.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::buffering::sample::{SampleFlags, SampleInfo};
use crate::error::{RecorderError, Result};
use crate::mux::{Muxer, MuxerFactory, TrackFormat};

const MAGIC: &[u8; 8] = b"SEGMUX01";
const END_MAGIC: &[u8; 6] = b"SEGEND";
const TAG_SAMPLE: u8 = 0x01;
const TAG_TRAILER: u8 = 0xFF;
/// 1 MiB write buffer per open segment.
const WRITE_BUFFER_BYTES: usize = 1 << 20;

pub struct SegmentFileMuxer {
    writer: Option<BufWriter<File>>,
    path: PathBuf,
    tracks: Vec<TrackFormat>,
    counts: Vec<u64>,
    started: bool,
    bytes_written: u64,
}

impl SegmentFileMuxer {
    pub fn create(path: &Path) -> Result<Self> {
        // Never truncate an existing segment.
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| match e.kind() {
                ErrorKind::AlreadyExists => {
                    RecorderError::Muxer(format!("{} already exists", path.display()))
                }
                _ => RecorderError::Muxer(format!("failed to create {}: {e}", path.display())),
            })?;
        Ok(Self {
            writer: Some(BufWriter::with_capacity(WRITE_BUFFER_BYTES, file)),
            path: path.to_path_buf(),
            tracks: Vec::new(),
            counts: Vec::new(),
            started: false,
            bytes_written: 0,
        })
    }

    fn writer(&mut self) -> Result<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| RecorderError::Muxer(format!("{} already released", self.path.display())))
    }

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        let path = self.path.clone();
        self.writer()?
            .write_all(bytes)
            .map_err(|e| RecorderError::Muxer(format!("failed to write {}: {e}", path.display())))?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }
}

impl Muxer for SegmentFileMuxer {
    fn add_track(&mut self, format: &TrackFormat) -> Result<usize> {
        if self.started {
            return Err(RecorderError::Muxer("muxer already started".into()));
        }
        if u8::try_from(self.tracks.len()).is_err() {
            return Err(RecorderError::Muxer("too many tracks for one segment".into()));
        }
        self.tracks.push(format.clone());
        self.counts.push(0);
        Ok(self.tracks.len() - 1)
    }

    fn start(&mut self) -> Result<()> {
        let table = serde_json::to_vec(&self.tracks)?;
        self.put(MAGIC)?;
        self.put(&(table.len() as u32).to_le_bytes())?;
        self.put(&table)?;
        self.started = true;
        Ok(())
    }

    fn write_sample(&mut self, track_index: usize, data: &[u8], info: &SampleInfo) -> Result<()> {
        if !self.started {
            return Err(RecorderError::Muxer("muxer not started".into()));
        }
        if track_index >= self.tracks.len() {
            return Err(RecorderError::Muxer(format!("unknown track index {track_index}")));
        }

        let track = u8::try_from(track_index)
            .map_err(|_| RecorderError::Muxer(format!("track index {track_index} out of range")))?;
        let len = u32::try_from(data.len()).map_err(|_| {
            RecorderError::Muxer(format!("{}-byte sample too large for a record", data.len()))
        })?;

        let mut record = Vec::with_capacity(18);
        record.push(TAG_SAMPLE);
        record.push(track);
        record.extend_from_slice(&info.flags.bits().to_le_bytes());
        record.extend_from_slice(&info.pts_us.to_le_bytes());
        record.extend_from_slice(&len.to_le_bytes());
        self.put(&record)?;
        self.put(data)?;
        self.counts[track_index] += 1;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut trailer = vec![TAG_TRAILER];
        trailer.extend_from_slice(&(self.counts.len() as u32).to_le_bytes());
        for count in &self.counts {
            trailer.extend_from_slice(&count.to_le_bytes());
        }
        trailer.extend_from_slice(END_MAGIC);
        self.put(&trailer)?;

        let path = self.path.clone();
        let writer = self.writer()?;
        writer
            .flush()
            .and_then(|_| writer.get_ref().sync_all())
            .map_err(|e| RecorderError::Muxer(format!("failed to flush {}: {e}", path.display())))?;

        debug!(
            path = %self.path.display(),
            bytes = self.bytes_written,
            "segment container flushed"
        );
        Ok(())
    }

    fn release(&mut self) {
        self.writer = None;
    }
}

/// Creates `SegmentFileMuxer`s on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct SegmentFileMuxerFactory;

impl MuxerFactory for SegmentFileMuxerFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn Muxer>> {
        Ok(Box::new(SegmentFileMuxer::create(path)?))
    }
}

/// One sample read back from a finalized segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSample {
    pub track: usize,
    pub info: SampleInfo,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SegmentContents {
    pub tracks: Vec<TrackFormat>,
    pub samples: Vec<SegmentSample>,
}

impl SegmentContents {
    /// Samples of the track registered with `kind`, in file order.
    pub fn samples_for(&self, kind: crate::buffering::sample::TrackKind) -> Vec<&SegmentSample> {
        let Some(index) = self.tracks.iter().position(|t| t.kind == kind) else {
            return Vec::new();
        };
        self.samples.iter().filter(|s| s.track == index).collect()
    }
}

/// Parse a finalized segment file.
///
/// # Errors
/// `RecorderError::Muxer` when the magic, trailer or sample counts do not
/// match, which is what a truncated or never-finalized segment looks like.
pub fn read_segment(path: &Path) -> Result<SegmentContents> {
    let mut reader = BufReader::new(File::open(path)?);
    let corrupt = |what: &str| RecorderError::Muxer(format!("{}: {what}", path.display()));

    let mut magic = [0u8; 8];
    read_exact_or(&mut reader, &mut magic, || corrupt("missing header"))?;
    if &magic != MAGIC {
        return Err(corrupt("bad magic"));
    }
    let table_len = read_u32(&mut reader).map_err(|_| corrupt("missing track table"))? as usize;
    let mut table = vec![0u8; table_len];
    read_exact_or(&mut reader, &mut table, || corrupt("truncated track table"))?;
    let tracks: Vec<TrackFormat> = serde_json::from_slice(&table)?;

    let mut samples = Vec::new();
    loop {
        let mut tag = [0u8; 1];
        read_exact_or(&mut reader, &mut tag, || corrupt("not finalized (no trailer)"))?;
        match tag[0] {
            TAG_SAMPLE => {
                let mut head = [0u8; 17];
                read_exact_or(&mut reader, &mut head, || corrupt("truncated sample header"))?;
                let track = head[0] as usize;
                let flags = u32::from_le_bytes([head[1], head[2], head[3], head[4]]);
                let mut pts = [0u8; 8];
                pts.copy_from_slice(&head[5..13]);
                let len = u32::from_le_bytes([head[13], head[14], head[15], head[16]]) as usize;
                let mut data = vec![0u8; len];
                read_exact_or(&mut reader, &mut data, || corrupt("truncated sample payload"))?;
                samples.push(SegmentSample {
                    track,
                    info: SampleInfo::new(i64::from_le_bytes(pts), SampleFlags::from_bits(flags), len),
                    data,
                });
            }
            TAG_TRAILER => {
                let count = read_u32(&mut reader).map_err(|_| corrupt("truncated trailer"))? as usize;
                for track in 0..count {
                    let mut buf = [0u8; 8];
                    read_exact_or(&mut reader, &mut buf, || corrupt("truncated trailer"))?;
                    let expected = u64::from_le_bytes(buf);
                    let actual = samples.iter().filter(|s| s.track == track).count() as u64;
                    if expected != actual {
                        return Err(corrupt("trailer sample count mismatch"));
                    }
                }
                let mut end = [0u8; 6];
                read_exact_or(&mut reader, &mut end, || corrupt("truncated trailer"))?;
                if &end != END_MAGIC {
                    return Err(corrupt("bad end marker"));
                }
                break;
            }
            _ => return Err(corrupt("unknown record tag")),
        }
    }

    Ok(SegmentContents { tracks, samples })
}

fn read_u32(reader: &mut impl Read) -> std::io::Result<u32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_exact_or(
    reader: &mut impl Read,
    buf: &mut [u8],
    on_eof: impl FnOnce() -> RecorderError,
) -> Result<()> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(on_eof()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffering::sample::TrackKind;

    fn formats() -> (TrackFormat, TrackFormat) {
        (
            TrackFormat::video("video/avc", 1280, 720),
            TrackFormat::audio("audio/mp4a-latm", 48_000, 2),
        )
    }

    #[test]
    fn finalized_segment_reads_back_in_write_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("video_101.seg");
        let (video, audio) = formats();

        let mut muxer = SegmentFileMuxer::create(&path).expect("create");
        assert_eq!(muxer.add_track(&video).expect("video"), 0);
        assert_eq!(muxer.add_track(&audio).expect("audio"), 1);
        muxer.start().expect("start");
        muxer
            .write_sample(0, &[9, 9, 9], &SampleInfo::new(0, SampleFlags::KEY_FRAME, 3))
            .expect("video sample");
        muxer
            .write_sample(1, &[7], &SampleInfo::new(21_333, SampleFlags::NONE, 1))
            .expect("audio sample");
        muxer.stop().expect("stop");
        muxer.release();

        let contents = read_segment(&path).expect("read back");
        assert_eq!(contents.tracks, vec![video, audio]);
        assert_eq!(contents.samples.len(), 2);
        assert_eq!(contents.samples[0].data, vec![9, 9, 9]);
        assert!(contents.samples[0].info.flags.contains(SampleFlags::KEY_FRAME));
        let audio_samples = contents.samples_for(TrackKind::Audio);
        assert_eq!(audio_samples.len(), 1);
        assert_eq!(audio_samples[0].info.pts_us, 21_333);
    }

    #[test]
    fn segment_without_trailer_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("video_102.seg");
        let (video, audio) = formats();

        let mut muxer = SegmentFileMuxer::create(&path).expect("create");
        muxer.add_track(&video).expect("video");
        muxer.add_track(&audio).expect("audio");
        muxer.start().expect("start");
        muxer
            .write_sample(0, &[1], &SampleInfo::new(0, SampleFlags::NONE, 1))
            .expect("sample");
        // Flush the header and sample without writing a trailer.
        muxer.writer().expect("writer").flush().expect("flush");
        muxer.release();

        let err = read_segment(&path).expect_err("unfinalized segment");
        assert!(err.to_string().contains("not finalized"), "{err}");
    }

    #[test]
    fn write_to_unknown_track_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut muxer = SegmentFileMuxer::create(&dir.path().join("x.seg")).expect("create");
        muxer.add_track(&formats().0).expect("video");
        muxer.start().expect("start");
        assert!(muxer
            .write_sample(3, &[1], &SampleInfo::new(0, SampleFlags::NONE, 1))
            .is_err());
    }

    #[test]
    fn existing_segment_is_never_truncated() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("video_101.seg");
        std::fs::write(&path, b"earlier recording").expect("seed file");

        let err = match SegmentFileMuxer::create(&path) {
            Ok(_) => panic!("create over an existing segment must fail"),
            Err(e) => e,
        };
        assert!(err.to_string().contains("already exists"), "{err}");
        assert_eq!(std::fs::read(&path).expect("read"), b"earlier recording");
    }

    #[test]
    fn track_table_is_limited_to_one_byte_indices() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut muxer = SegmentFileMuxer::create(&dir.path().join("many.seg")).expect("create");
        let video = formats().0;
        for i in 0..=usize::from(u8::MAX) {
            assert_eq!(muxer.add_track(&video).expect("track fits"), i);
        }
        assert!(matches!(muxer.add_track(&video), Err(RecorderError::Muxer(_))));
    }
}
