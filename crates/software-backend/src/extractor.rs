//! Demuxer for Y4M video and RIFF/WAVE audio files.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use duocam_codec_core::{
    BufferFlags, MediaExtractor, MediaFormat, ResourceGuard, ResourceKind, ResourceLedger,
    MIME_RAW_AUDIO, MIME_RAW_VIDEO,
};
use duocam_common::{DuocamError, DuocamResult};

use crate::y4m::{Y4mReader, MAGIC};

#[derive(Debug)]
struct WavData {
    path: PathBuf,
    data_offset: u64,
    data_len: u64,
}

#[derive(Debug)]
enum Source {
    Video(Y4mReader),
    Audio(WavData),
}

/// Single-track extractor. Y4M files expose one `video/raw` track; WAV
/// files expose one `audio/raw` track whose data chunk is a single sample.
#[derive(Debug)]
pub struct SoftwareExtractor {
    source: Option<Source>,
    format: MediaFormat,
    selected: bool,
    cursor: usize,
    guard: ResourceGuard,
}

impl SoftwareExtractor {
    pub fn open(path: &Path, ledger: &ResourceLedger) -> DuocamResult<Self> {
        if !path.is_file() {
            return Err(DuocamError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        let mut magic = [0u8; 12];
        let read = File::open(path)?.read(&mut magic)?;
        let magic = &magic[..read];

        let (source, format) = if magic.starts_with(MAGIC.as_bytes()) {
            let reader = Y4mReader::open(path)?;
            let header = reader.header();
            let format = MediaFormat::video(MIME_RAW_VIDEO, header.width, header.height)
                .with_frame_rate(header.frame_rate())
                .with_duration_us(reader.duration_us());
            (Source::Video(reader), format)
        } else if magic.len() == 12 && &magic[..4] == b"RIFF" && &magic[8..12] == b"WAVE" {
            let (wav, format) = parse_wav(path)?;
            (Source::Audio(wav), format)
        } else {
            return Err(DuocamError::demux(format!(
                "{}: unrecognized container",
                path.display()
            )));
        };

        tracing::debug!(path = %path.display(), mime = %format.mime, "opened extractor");
        Ok(Self {
            source: Some(source),
            format,
            selected: false,
            cursor: 0,
            guard: ledger.acquire(ResourceKind::Extractor),
        })
    }

    fn sample_count(&self) -> usize {
        match &self.source {
            Some(Source::Video(reader)) => reader.frame_count(),
            Some(Source::Audio(_)) => 1,
            None => 0,
        }
    }
}

fn parse_wav(path: &Path) -> DuocamResult<(WavData, MediaFormat)> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(12))?;
    let mut sample_rate = None;
    let mut channels = None;
    let mut data = None;
    let mut chunk = [0u8; 8];
    while file.read_exact(&mut chunk).is_ok() {
        let id = &chunk[..4];
        let size = u32::from_le_bytes([chunk[4], chunk[5], chunk[6], chunk[7]]) as u64;
        let body_start = file.stream_position()?;
        match id {
            b"fmt " => {
                let mut fmt = [0u8; 8];
                file.read_exact(&mut fmt)?;
                channels = Some(u16::from_le_bytes([fmt[2], fmt[3]]) as u32);
                sample_rate = Some(u32::from_le_bytes([fmt[4], fmt[5], fmt[6], fmt[7]]));
            }
            b"data" => data = Some((body_start, size)),
            _ => {}
        }
        // Chunks are word aligned.
        file.seek(SeekFrom::Start(body_start + size + (size & 1)))?;
    }
    let (Some(sample_rate), Some(channels), Some((data_offset, data_len))) =
        (sample_rate, channels, data)
    else {
        return Err(DuocamError::demux(format!(
            "{}: WAVE file lacks fmt or data chunk",
            path.display()
        )));
    };
    Ok((
        WavData {
            path: path.to_path_buf(),
            data_offset,
            data_len,
        },
        MediaFormat::audio(MIME_RAW_AUDIO, sample_rate, channels),
    ))
}

impl MediaExtractor for SoftwareExtractor {
    fn track_count(&self) -> usize {
        usize::from(self.source.is_some())
    }

    fn track_format(&self, index: usize) -> DuocamResult<MediaFormat> {
        if index >= self.track_count() {
            return Err(DuocamError::demux(format!("no track {index}")));
        }
        Ok(self.format.clone())
    }

    fn select_track(&mut self, index: usize) -> DuocamResult<()> {
        if index >= self.track_count() {
            return Err(DuocamError::demux(format!("no track {index}")));
        }
        self.selected = true;
        self.cursor = 0;
        Ok(())
    }

    fn read_sample_data(&mut self, buf: &mut Vec<u8>) -> DuocamResult<Option<usize>> {
        if !self.selected {
            return Err(DuocamError::demux("no track selected"));
        }
        if self.cursor >= self.sample_count() {
            return Ok(None);
        }
        match &mut self.source {
            Some(Source::Video(reader)) => reader.read_frame(self.cursor, buf)?,
            Some(Source::Audio(wav)) => {
                let mut file = File::open(&wav.path)?;
                file.seek(SeekFrom::Start(wav.data_offset))?;
                buf.clear();
                file.take(wav.data_len).read_to_end(buf)?;
            }
            None => return Ok(None),
        }
        Ok(Some(buf.len()))
    }

    fn sample_time_us(&self) -> Option<i64> {
        if self.cursor >= self.sample_count() {
            return None;
        }
        match &self.source {
            Some(Source::Video(reader)) => Some(reader.header().pts_us(self.cursor as u64)),
            Some(Source::Audio(_)) => Some(0),
            None => None,
        }
    }

    fn sample_flags(&self) -> BufferFlags {
        match &self.source {
            Some(Source::Video(_)) => BufferFlags::KEY_FRAME,
            _ => BufferFlags::NONE,
        }
    }

    fn advance(&mut self) -> bool {
        if self.cursor < self.sample_count() {
            self.cursor += 1;
        }
        self.cursor < self.sample_count()
    }

    fn release(&mut self) {
        self.source = None;
        self.guard.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::y4m::write_clip;
    use duocam_codec_core::VideoFrame;

    fn write_wav(path: &Path) {
        let mut bytes = Vec::new();
        let pcm = [0u8; 8];
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(4 + 24 + 8 + pcm.len() as u32).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes()); // PCM
        bytes.extend_from_slice(&2u16.to_le_bytes()); // channels
        bytes.extend_from_slice(&48_000u32.to_le_bytes());
        bytes.extend_from_slice(&(48_000u32 * 4).to_le_bytes());
        bytes.extend_from_slice(&4u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&(pcm.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&pcm);
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn test_video_track_samples() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.y4m");
        write_clip(&path, 2, 2, 30, (0..3).map(|_| VideoFrame::filled(2, 2, 0, [0; 4]))).unwrap();

        let ledger = ResourceLedger::new();
        let mut ex = SoftwareExtractor::open(&path, &ledger).unwrap();
        assert_eq!(ledger.snapshot().extractors, 1);
        assert_eq!(ex.track_count(), 1);
        let fmt = ex.track_format(0).unwrap();
        assert_eq!(fmt.mime, MIME_RAW_VIDEO);
        assert_eq!(fmt.duration_us, Some(100_000));

        let mut buf = Vec::new();
        assert!(ex.read_sample_data(&mut buf).is_err());
        ex.select_track(0).unwrap();
        let mut times = Vec::new();
        while let Some(n) = ex.read_sample_data(&mut buf).unwrap() {
            assert_eq!(n, 6);
            times.push(ex.sample_time_us().unwrap());
            ex.advance();
        }
        assert_eq!(times, vec![0, 33_333, 66_666]);
        assert_eq!(ex.sample_time_us(), None);

        ex.release();
        ex.release();
        assert_eq!(ledger.snapshot().extractors, 0);
        assert_eq!(ex.track_count(), 0);
    }

    #[test]
    fn test_wav_is_audio_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.wav");
        write_wav(&path);
        let ledger = ResourceLedger::new();
        let mut ex = SoftwareExtractor::open(&path, &ledger).unwrap();
        let fmt = ex.track_format(0).unwrap();
        assert!(fmt.is_audio());
        assert_eq!(fmt.sample_rate, Some(48_000));
        assert_eq!(fmt.channel_count, Some(2));
        ex.select_track(0).unwrap();
        let mut buf = Vec::new();
        assert_eq!(ex.read_sample_data(&mut buf).unwrap(), Some(8));
    }

    #[test]
    fn test_missing_and_unknown_files() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ResourceLedger::new();
        let missing = SoftwareExtractor::open(&dir.path().join("nope.y4m"), &ledger);
        assert!(matches!(missing, Err(DuocamError::FileNotFound { .. })));

        let junk = dir.path().join("junk.mp4");
        std::fs::write(&junk, b"\x00\x00\x00\x18ftypisom").unwrap();
        assert!(matches!(
            SoftwareExtractor::open(&junk, &ledger),
            Err(DuocamError::Demux { .. })
        ));
        assert_eq!(ledger.acquired_total(), 0);
    }
}
