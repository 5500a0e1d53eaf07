//! Y4M muxer for raw I420 streams.

use std::fs::File;
use std::path::{Path, PathBuf};

use duocam_codec_core::{BufferInfo, MediaFormat, MediaMuxer, ResourceGuard, MIME_RAW_VIDEO};
use duocam_common::{DuocamError, DuocamResult};

use crate::y4m::{Y4mHeader, Y4mWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuxerState {
    Initialized,
    Started,
    Stopped,
    Released,
}

/// Writes one `video/raw` track as YUV4MPEG2. The output file is created
/// on construction and the stream header is written on `start`.
#[derive(Debug)]
pub struct Y4mMuxer {
    path: PathBuf,
    file: Option<File>,
    writer: Option<Y4mWriter>,
    track: Option<MediaFormat>,
    state: MuxerState,
    guard: ResourceGuard,
}

impl Y4mMuxer {
    pub fn create(path: &Path, guard: ResourceGuard) -> DuocamResult<Self> {
        let file = File::create(path).map_err(|e| {
            DuocamError::muxer(format!("cannot create {}: {e}", path.display()))
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            writer: None,
            track: None,
            state: MuxerState::Initialized,
            guard,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MediaMuxer for Y4mMuxer {
    fn add_track(&mut self, format: &MediaFormat) -> DuocamResult<usize> {
        if self.state != MuxerState::Initialized {
            return Err(DuocamError::muxer("tracks must be added before start"));
        }
        if self.track.is_some() {
            return Err(DuocamError::muxer("Y4M holds a single video track"));
        }
        if format.mime != MIME_RAW_VIDEO || format.size().is_none() {
            return Err(DuocamError::muxer(format!(
                "Y4M cannot carry {}",
                format.mime
            )));
        }
        self.track = Some(format.clone());
        Ok(0)
    }

    fn start(&mut self) -> DuocamResult<()> {
        if self.state != MuxerState::Initialized {
            return Err(DuocamError::muxer(format!("start while {:?}", self.state)));
        }
        let (Some(track), Some(file)) = (&self.track, self.file.take()) else {
            return Err(DuocamError::muxer("start without a track"));
        };
        let (width, height) = track
            .size()
            .ok_or_else(|| DuocamError::muxer("track has no picture size"))?;
        let header = Y4mHeader::with_frame_rate(width, height, track.frame_rate.unwrap_or(30.0));
        self.writer = Some(Y4mWriter::from_file(file, header)?);
        self.state = MuxerState::Started;
        tracing::debug!(path = %self.path.display(), width, height, "muxer started");
        Ok(())
    }

    fn write_sample_data(
        &mut self,
        track: usize,
        data: &[u8],
        info: &BufferInfo,
    ) -> DuocamResult<()> {
        if self.state != MuxerState::Started {
            return Err(DuocamError::muxer(format!(
                "write_sample_data while {:?}",
                self.state
            )));
        }
        if track != 0 {
            return Err(DuocamError::muxer(format!("no track {track}")));
        }
        if info.is_codec_config() {
            return Ok(());
        }
        let end = info.offset + info.size;
        let sample = data.get(info.offset..end).ok_or_else(|| {
            DuocamError::muxer(format!(
                "sample range {}..{end} exceeds buffer of {} bytes",
                info.offset,
                data.len()
            ))
        })?;
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DuocamError::muxer("muxer has no writer"))?;
        writer.write_frame(sample)
    }

    fn stop(&mut self) -> DuocamResult<()> {
        if self.state != MuxerState::Started {
            return Err(DuocamError::muxer(format!("stop while {:?}", self.state)));
        }
        self.state = MuxerState::Stopped;
        if let Some(writer) = self.writer.take() {
            let frames = writer.finish()?;
            tracing::debug!(path = %self.path.display(), frames, "muxer stopped");
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.state == MuxerState::Released {
            return;
        }
        self.state = MuxerState::Released;
        self.file = None;
        self.writer = None;
        self.guard.release();
    }
}
