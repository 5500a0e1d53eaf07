//! Raw I420 "encoder" that consumes RGBA pictures from its input surface.

use std::collections::VecDeque;
use std::time::Duration;

use duocam_codec_core::{
    BufferFlags, BufferInfo, MediaFormat, OutputEvent, ResourceGuard, Surface, VideoEncoder,
    VideoFrame, MIME_RAW_VIDEO,
};
use duocam_common::{DuocamError, DuocamResult};

use crate::yuv::rgba_to_i420;
use crate::CodecState;

pub const OUTPUT_SLOTS: usize = 4;

#[derive(Debug)]
struct EncodedSlot {
    data: Vec<u8>,
    info: BufferInfo,
}

/// Encodes each surface frame to one I420 buffer. Every `key_frame_interval`
/// frames is flagged as a key frame (all of them when the interval is 0).
#[derive(Debug)]
pub struct RawVideoEncoder {
    state: CodecState,
    format: Option<MediaFormat>,
    surface: Option<Surface>,
    outputs: Vec<Option<EncodedSlot>>,
    free: VecDeque<usize>,
    ready: VecDeque<usize>,
    key_frame_interval: u64,
    frames_encoded: u64,
    format_reported: bool,
    eos_signalled: bool,
    eos_emitted: bool,
    guard: ResourceGuard,
}

impl RawVideoEncoder {
    pub fn new(guard: ResourceGuard) -> Self {
        Self {
            state: CodecState::Uninitialized,
            format: None,
            surface: None,
            outputs: (0..OUTPUT_SLOTS).map(|_| None).collect(),
            free: (0..OUTPUT_SLOTS).collect(),
            ready: VecDeque::new(),
            key_frame_interval: 1,
            frames_encoded: 0,
            format_reported: false,
            eos_signalled: false,
            eos_emitted: false,
            guard,
        }
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    fn encode(&mut self, frame: VideoFrame) {
        let Some(index) = self.free.pop_front() else {
            return;
        };
        let data = rgba_to_i420(frame.width, frame.height, &frame.data);
        let mut flags = BufferFlags::NONE;
        if self.key_frame_interval == 0 || self.frames_encoded % self.key_frame_interval == 0 {
            flags |= BufferFlags::KEY_FRAME;
        }
        self.frames_encoded += 1;
        let info = BufferInfo {
            offset: 0,
            size: data.len(),
            presentation_time_us: frame.pts_us,
            flags,
        };
        self.outputs[index] = Some(EncodedSlot { data, info });
        self.ready.push_back(index);
    }

    fn held(&self, index: usize) -> DuocamResult<&EncodedSlot> {
        self.outputs
            .get(index)
            .and_then(Option::as_ref)
            .ok_or_else(|| DuocamError::codec(format!("output buffer {index} is not held")))
    }
}

impl VideoEncoder for RawVideoEncoder {
    fn configure(&mut self, format: &MediaFormat) -> DuocamResult<()> {
        if self.state != CodecState::Uninitialized {
            return Err(DuocamError::codec_setup(format!(
                "encoder configure while {:?}",
                self.state
            )));
        }
        if format.mime != MIME_RAW_VIDEO {
            return Err(DuocamError::codec_setup(format!(
                "no software encoder for {}",
                format.mime
            )));
        }
        if format.size().is_none() {
            return Err(DuocamError::codec_setup("encoder format has no picture size"));
        }
        let fps = format.frame_rate.unwrap_or(30.0).max(1.0);
        self.key_frame_interval = format
            .key_frame_interval_secs
            .map_or(1, |secs| (secs as f64 * fps).round() as u64);
        self.format = Some(format.clone());
        self.state = CodecState::Configured;
        Ok(())
    }

    fn create_input_surface(&mut self) -> DuocamResult<Surface> {
        if self.state != CodecState::Configured {
            return Err(DuocamError::codec_setup(
                "input surface must be created after configure and before start",
            ));
        }
        if self.surface.is_some() {
            return Err(DuocamError::codec_setup("input surface already created"));
        }
        let (width, height) = self
            .format
            .as_ref()
            .and_then(MediaFormat::size)
            .ok_or_else(|| DuocamError::codec_setup("encoder is not configured"))?;
        let surface = Surface::new(width, height);
        self.surface = Some(surface.clone());
        Ok(surface)
    }

    fn start(&mut self) -> DuocamResult<()> {
        if self.state != CodecState::Configured {
            return Err(DuocamError::codec_setup(format!(
                "encoder start while {:?}",
                self.state
            )));
        }
        if self.surface.is_none() {
            return Err(DuocamError::codec_setup(
                "encoder started without an input surface",
            ));
        }
        self.state = CodecState::Running;
        Ok(())
    }

    fn signal_end_of_input_stream(&mut self) -> DuocamResult<()> {
        if self.state != CodecState::Running {
            return Err(DuocamError::codec(format!(
                "end of stream signalled while {:?}",
                self.state
            )));
        }
        if self.eos_signalled {
            return Err(DuocamError::codec("end of stream already signalled"));
        }
        self.eos_signalled = true;
        if let Some(surface) = &self.surface {
            surface.close_input();
        }
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, _timeout: Duration) -> DuocamResult<OutputEvent> {
        if self.state != CodecState::Running {
            return Err(DuocamError::codec(format!(
                "encoder dequeue while {:?}",
                self.state
            )));
        }
        while !self.free.is_empty() {
            let Some(frame) = self.surface.as_ref().and_then(Surface::acquire_frame) else {
                break;
            };
            self.encode(frame);
        }

        if let Some(&index) = self.ready.front() {
            if !self.format_reported {
                self.format_reported = true;
                return Ok(OutputEvent::FormatChanged);
            }
            self.ready.pop_front();
            return Ok(OutputEvent::Buffer {
                index,
                info: self.held(index)?.info,
            });
        }

        let drained = self.surface.as_ref().map_or(true, |s| s.pending() == 0);
        if self.eos_signalled && drained && !self.eos_emitted {
            if let Some(index) = self.free.pop_front() {
                self.eos_emitted = true;
                let info = BufferInfo {
                    flags: BufferFlags::END_OF_STREAM,
                    ..BufferInfo::default()
                };
                self.outputs[index] = Some(EncodedSlot {
                    data: Vec::new(),
                    info,
                });
                return Ok(OutputEvent::Buffer { index, info });
            }
        }
        Ok(OutputEvent::TryAgainLater)
    }

    fn output_format(&self) -> DuocamResult<MediaFormat> {
        self.format
            .clone()
            .ok_or_else(|| DuocamError::codec("encoder is not configured"))
    }

    fn output_buffer(&self, index: usize) -> DuocamResult<&[u8]> {
        Ok(&self.held(index)?.data)
    }

    fn release_output_buffer(&mut self, index: usize) -> DuocamResult<()> {
        self.held(index)?;
        self.outputs[index] = None;
        self.free.push_back(index);
        Ok(())
    }

    fn stop(&mut self) -> DuocamResult<()> {
        match self.state {
            CodecState::Running | CodecState::Configured => {
                self.state = CodecState::Stopped;
                self.ready.clear();
                Ok(())
            }
            other => Err(DuocamError::codec(format!("encoder stop while {other:?}"))),
        }
    }

    fn release(&mut self) {
        if self.state == CodecState::Released {
            return;
        }
        self.state = CodecState::Released;
        if let Some(surface) = self.surface.take() {
            surface.release();
        }
        self.guard.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duocam_codec_core::{ResourceKind, ResourceLedger};

    const T: Duration = Duration::from_millis(10);

    fn started(ledger: &ResourceLedger) -> (RawVideoEncoder, Surface) {
        let mut enc = RawVideoEncoder::new(ledger.acquire(ResourceKind::Encoder));
        enc.configure(
            &MediaFormat::video(MIME_RAW_VIDEO, 2, 2)
                .with_frame_rate(2.0)
                .with_key_frame_interval(1),
        )
        .unwrap();
        let surface = enc.create_input_surface().unwrap();
        enc.start().unwrap();
        (enc, surface)
    }

    #[test]
    fn test_surface_frames_become_buffers() {
        let ledger = ResourceLedger::new();
        let (mut enc, surface) = started(&ledger);
        assert_eq!(enc.dequeue_output_buffer(T).unwrap(), OutputEvent::TryAgainLater);

        for pts in [0, 500_000, 1_000_000] {
            surface
                .queue_frame(VideoFrame::filled(2, 2, pts, [128, 128, 128, 255]))
                .unwrap();
        }
        assert_eq!(enc.dequeue_output_buffer(T).unwrap(), OutputEvent::FormatChanged);
        let mut keys = Vec::new();
        while let OutputEvent::Buffer { index, info } = enc.dequeue_output_buffer(T).unwrap() {
            assert_eq!(enc.output_buffer(index).unwrap().len(), 6);
            keys.push(info.flags.contains(BufferFlags::KEY_FRAME));
            enc.release_output_buffer(index).unwrap();
        }
        // Two frames per second, one key frame per second.
        assert_eq!(keys, vec![true, false, true]);
    }

    #[test]
    fn test_end_of_stream_after_drain() {
        let ledger = ResourceLedger::new();
        let (mut enc, surface) = started(&ledger);
        surface.queue_frame(VideoFrame::filled(2, 2, 0, [0; 4])).unwrap();
        enc.signal_end_of_input_stream().unwrap();
        assert!(surface.queue_frame(VideoFrame::filled(2, 2, 1, [0; 4])).is_err());
        assert!(enc.signal_end_of_input_stream().is_err());

        assert_eq!(enc.dequeue_output_buffer(T).unwrap(), OutputEvent::FormatChanged);
        let OutputEvent::Buffer { index, info } = enc.dequeue_output_buffer(T).unwrap() else {
            panic!("expected data");
        };
        assert!(!info.is_end_of_stream());
        enc.release_output_buffer(index).unwrap();
        let OutputEvent::Buffer { index, info } = enc.dequeue_output_buffer(T).unwrap() else {
            panic!("expected end of stream");
        };
        assert!(info.is_end_of_stream());
        assert_eq!(info.size, 0);
        enc.release_output_buffer(index).unwrap();
        assert_eq!(enc.dequeue_output_buffer(T).unwrap(), OutputEvent::TryAgainLater);
    }

    #[test]
    fn test_zero_frames_yields_only_end_of_stream() {
        let ledger = ResourceLedger::new();
        let (mut enc, _surface) = started(&ledger);
        enc.signal_end_of_input_stream().unwrap();
        let OutputEvent::Buffer { info, .. } = enc.dequeue_output_buffer(T).unwrap() else {
            panic!("expected end of stream");
        };
        assert!(info.is_end_of_stream());
    }

    #[test]
    fn test_setup_order_is_enforced() {
        let ledger = ResourceLedger::new();
        let mut enc = RawVideoEncoder::new(ledger.acquire(ResourceKind::Encoder));
        assert!(enc.create_input_surface().is_err());
        assert!(enc
            .configure(&MediaFormat::video("video/avc", 2, 2))
            .is_err());
        enc.configure(&MediaFormat::video(MIME_RAW_VIDEO, 2, 2)).unwrap();
        assert!(enc.start().is_err());
        let surface = enc.create_input_surface().unwrap();
        assert!(enc.create_input_surface().is_err());
        enc.start().unwrap();

        enc.stop().unwrap();
        enc.release();
        enc.release();
        assert!(surface.is_released());
        assert_eq!(ledger.snapshot().encoders, 0);
    }
}
