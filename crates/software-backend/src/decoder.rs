//! Raw I420 "decoder" that feeds decoded pictures to a [`SurfaceTexture`].

use std::collections::VecDeque;
use std::time::Duration;

use duocam_codec_core::{
    BufferFlags, BufferInfo, MediaFormat, OutputEvent, ResourceGuard, SurfaceTexture,
    VideoDecoder, VideoFrame, MIME_RAW_VIDEO,
};
use duocam_common::{DuocamError, DuocamResult};

use crate::yuv::{i420_len, i420_to_rgba};
use crate::CodecState;

pub const INPUT_SLOTS: usize = 4;
pub const OUTPUT_SLOTS: usize = 2;

#[derive(Debug)]
struct PendingInput {
    index: usize,
    size: usize,
    pts_us: i64,
    flags: BufferFlags,
}

#[derive(Debug)]
struct DecodedSlot {
    frame: Option<VideoFrame>,
    info: BufferInfo,
}

/// Converts queued I420 samples to RGBA pictures. Output buffers are
/// handed to the configured [`SurfaceTexture`] when released with
/// `render = true`.
#[derive(Debug)]
pub struct RawVideoDecoder {
    state: CodecState,
    size: (u32, u32),
    output: Option<SurfaceTexture>,
    inputs: Vec<Vec<u8>>,
    input_owned: Vec<bool>,
    free_inputs: VecDeque<usize>,
    pending: VecDeque<PendingInput>,
    outputs: Vec<Option<DecodedSlot>>,
    free_outputs: VecDeque<usize>,
    ready: VecDeque<usize>,
    pending_eos: Option<i64>,
    format_reported: bool,
    input_eos: bool,
    guard: ResourceGuard,
}

impl RawVideoDecoder {
    pub fn new(guard: ResourceGuard) -> Self {
        Self {
            state: CodecState::Uninitialized,
            size: (0, 0),
            output: None,
            inputs: vec![Vec::new(); INPUT_SLOTS],
            input_owned: vec![false; INPUT_SLOTS],
            free_inputs: (0..INPUT_SLOTS).collect(),
            pending: VecDeque::new(),
            outputs: (0..OUTPUT_SLOTS).map(|_| None).collect(),
            free_outputs: (0..OUTPUT_SLOTS).collect(),
            ready: VecDeque::new(),
            pending_eos: None,
            format_reported: false,
            input_eos: false,
            guard,
        }
    }

    fn require_running(&self, op: &str) -> DuocamResult<()> {
        if self.state != CodecState::Running {
            return Err(DuocamError::codec(format!(
                "decoder {op} while {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Decode queued inputs into free output slots.
    fn pump(&mut self) -> DuocamResult<()> {
        let (width, height) = self.size;
        while !self.free_outputs.is_empty() {
            if let Some(pts_us) = self.pending_eos.take() {
                let info = BufferInfo {
                    offset: 0,
                    size: 0,
                    presentation_time_us: pts_us,
                    flags: BufferFlags::END_OF_STREAM,
                };
                self.emit(DecodedSlot { frame: None, info });
                continue;
            }
            let Some(input) = self.pending.pop_front() else {
                break;
            };
            let frame = if input.size > 0 {
                let expected = i420_len(width, height);
                if input.size != expected {
                    self.free_inputs.push_back(input.index);
                    return Err(DuocamError::codec(format!(
                        "sample of {} bytes is not a {width}x{height} I420 picture ({expected} bytes)",
                        input.size
                    )));
                }
                let rgba = i420_to_rgba(width, height, &self.inputs[input.index][..input.size]);
                Some(VideoFrame::new(width, height, input.pts_us, rgba)?)
            } else {
                None
            };
            self.free_inputs.push_back(input.index);

            let eos = input.flags.contains(BufferFlags::END_OF_STREAM);
            match frame {
                Some(frame) => {
                    let info = BufferInfo {
                        offset: 0,
                        size: frame.data.len(),
                        presentation_time_us: input.pts_us,
                        flags: input.flags.without(BufferFlags::END_OF_STREAM),
                    };
                    self.emit(DecodedSlot {
                        frame: Some(frame),
                        info,
                    });
                    // A final sample carrying data is followed by a bare EOS buffer.
                    if eos {
                        self.pending_eos = Some(input.pts_us);
                    }
                }
                None if eos => self.pending_eos = Some(input.pts_us),
                // Empty, non-terminal samples produce nothing.
                None => {}
            }
        }
        Ok(())
    }

    fn emit(&mut self, slot: DecodedSlot) {
        if let Some(index) = self.free_outputs.pop_front() {
            self.outputs[index] = Some(slot);
            self.ready.push_back(index);
        }
    }
}

impl VideoDecoder for RawVideoDecoder {
    fn configure(&mut self, format: &MediaFormat, output: SurfaceTexture) -> DuocamResult<()> {
        if self.state != CodecState::Uninitialized {
            return Err(DuocamError::codec_setup(format!(
                "decoder configure while {:?}",
                self.state
            )));
        }
        if format.mime != MIME_RAW_VIDEO {
            return Err(DuocamError::codec_setup(format!(
                "no software decoder for {}",
                format.mime
            )));
        }
        let Some(size) = format.size() else {
            return Err(DuocamError::codec_setup("video format has no picture size"));
        };
        self.size = size;
        self.output = Some(output);
        self.state = CodecState::Configured;
        Ok(())
    }

    fn start(&mut self) -> DuocamResult<()> {
        if self.state != CodecState::Configured {
            return Err(DuocamError::codec_setup(format!(
                "decoder start while {:?}",
                self.state
            )));
        }
        self.state = CodecState::Running;
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> DuocamResult<Option<usize>> {
        self.require_running("dequeue_input_buffer")?;
        if self.input_eos {
            return Ok(None);
        }
        let index = self.free_inputs.pop_front();
        if let Some(i) = index {
            self.input_owned[i] = true;
        }
        Ok(index)
    }

    fn input_buffer(&mut self, index: usize) -> DuocamResult<&mut Vec<u8>> {
        if !self.input_owned.get(index).copied().unwrap_or(false) {
            return Err(DuocamError::codec(format!(
                "input buffer {index} is not dequeued"
            )));
        }
        Ok(&mut self.inputs[index])
    }

    fn queue_input_buffer(
        &mut self,
        index: usize,
        size: usize,
        pts_us: i64,
        flags: BufferFlags,
    ) -> DuocamResult<()> {
        self.require_running("queue_input_buffer")?;
        if !self.input_owned.get(index).copied().unwrap_or(false) {
            return Err(DuocamError::codec(format!(
                "input buffer {index} is not dequeued"
            )));
        }
        if size > self.inputs[index].len() {
            return Err(DuocamError::codec(format!(
                "queued {size} bytes but input buffer {index} holds {}",
                self.inputs[index].len()
            )));
        }
        self.input_owned[index] = false;
        if flags.contains(BufferFlags::END_OF_STREAM) {
            self.input_eos = true;
        }
        self.pending.push_back(PendingInput {
            index,
            size,
            pts_us,
            flags,
        });
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, _timeout: Duration) -> DuocamResult<OutputEvent> {
        self.require_running("dequeue_output_buffer")?;
        self.pump()?;
        let Some(&index) = self.ready.front() else {
            return Ok(OutputEvent::TryAgainLater);
        };
        if !self.format_reported {
            self.format_reported = true;
            return Ok(OutputEvent::FormatChanged);
        }
        self.ready.pop_front();
        let info = self.outputs[index]
            .as_ref()
            .map(|slot| slot.info)
            .ok_or_else(|| DuocamError::codec(format!("output slot {index} is empty")))?;
        Ok(OutputEvent::Buffer { index, info })
    }

    fn release_output_buffer(&mut self, index: usize, render: bool) -> DuocamResult<()> {
        let slot = self
            .outputs
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(|| DuocamError::codec(format!("output buffer {index} is not held")))?;
        if render {
            if let (Some(frame), Some(output)) = (slot.frame, &self.output) {
                output.post(frame);
            }
        }
        self.free_outputs.push_back(index);
        Ok(())
    }

    fn stop(&mut self) -> DuocamResult<()> {
        match self.state {
            CodecState::Running | CodecState::Configured => {
                self.pending.clear();
                self.ready.clear();
                self.pending_eos = None;
                self.state = CodecState::Stopped;
                Ok(())
            }
            other => Err(DuocamError::codec(format!("decoder stop while {other:?}"))),
        }
    }

    fn release(&mut self) {
        if self.state == CodecState::Released {
            return;
        }
        self.state = CodecState::Released;
        self.output = None;
        self.pending.clear();
        self.ready.clear();
        self.guard.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::yuv::rgba_to_i420;
    use duocam_codec_core::{ResourceKind, ResourceLedger};

    const T: Duration = Duration::from_millis(10);

    fn started(ledger: &ResourceLedger, texture: &SurfaceTexture) -> RawVideoDecoder {
        let mut dec = RawVideoDecoder::new(ledger.acquire(ResourceKind::Decoder));
        dec.configure(&MediaFormat::video(MIME_RAW_VIDEO, 2, 2), texture.clone())
            .unwrap();
        dec.start().unwrap();
        dec
    }

    fn queue(dec: &mut RawVideoDecoder, data: &[u8], pts: i64, flags: BufferFlags) {
        let idx = dec.dequeue_input_buffer(T).unwrap().unwrap();
        let buf = dec.input_buffer(idx).unwrap();
        buf.clear();
        buf.extend_from_slice(data);
        dec.queue_input_buffer(idx, data.len(), pts, flags).unwrap();
    }

    #[test]
    fn test_format_change_precedes_first_buffer() {
        let ledger = ResourceLedger::new();
        let texture = SurfaceTexture::new();
        let mut dec = started(&ledger, &texture);
        assert_eq!(dec.dequeue_output_buffer(T).unwrap(), OutputEvent::TryAgainLater);

        let red = rgba_to_i420(2, 2, &[255, 0, 0, 255].repeat(4));
        queue(&mut dec, &red, 0, BufferFlags::KEY_FRAME);
        assert_eq!(dec.dequeue_output_buffer(T).unwrap(), OutputEvent::FormatChanged);
        let OutputEvent::Buffer { index, info } = dec.dequeue_output_buffer(T).unwrap() else {
            panic!("expected a buffer");
        };
        assert_eq!(info.size, 16);
        assert!(!texture.frame_available());
        dec.release_output_buffer(index, true).unwrap();
        let frame = texture.take_latest().unwrap();
        assert!(frame.pixel(0, 0)[0] > 250);
    }

    #[test]
    fn test_end_of_stream_buffer() {
        let ledger = ResourceLedger::new();
        let texture = SurfaceTexture::new();
        let mut dec = started(&ledger, &texture);
        queue(&mut dec, &[], 0, BufferFlags::END_OF_STREAM);
        assert_eq!(dec.dequeue_input_buffer(T).unwrap(), None);
        assert_eq!(dec.dequeue_output_buffer(T).unwrap(), OutputEvent::FormatChanged);
        let OutputEvent::Buffer { index, info } = dec.dequeue_output_buffer(T).unwrap() else {
            panic!("expected a buffer");
        };
        assert!(info.is_end_of_stream());
        assert_eq!(info.size, 0);
        dec.release_output_buffer(index, true).unwrap();
        assert!(!texture.frame_available());
    }

    #[test]
    fn test_output_slots_bound_decoding() {
        let ledger = ResourceLedger::new();
        let texture = SurfaceTexture::new();
        let mut dec = started(&ledger, &texture);
        let grey = rgba_to_i420(2, 2, &[128; 16]);
        for pts in 0..3 {
            queue(&mut dec, &grey, pts, BufferFlags::NONE);
        }
        assert_eq!(dec.dequeue_output_buffer(T).unwrap(), OutputEvent::FormatChanged);
        let mut held = Vec::new();
        while let OutputEvent::Buffer { index, .. } = dec.dequeue_output_buffer(T).unwrap() {
            held.push(index);
        }
        assert_eq!(held.len(), OUTPUT_SLOTS);
        dec.release_output_buffer(held[0], false).unwrap();
        assert!(matches!(
            dec.dequeue_output_buffer(T).unwrap(),
            OutputEvent::Buffer { .. }
        ));
        assert!(dec.release_output_buffer(held[0], false).is_err());
    }

    #[test]
    fn test_wrong_sample_size_is_codec_error() {
        let ledger = ResourceLedger::new();
        let texture = SurfaceTexture::new();
        let mut dec = started(&ledger, &texture);
        queue(&mut dec, &[0; 5], 0, BufferFlags::NONE);
        assert!(matches!(
            dec.dequeue_output_buffer(T),
            Err(DuocamError::Codec { .. })
        ));
    }

    #[test]
    fn test_lifecycle_and_release() {
        let ledger = ResourceLedger::new();
        let mut dec = RawVideoDecoder::new(ledger.acquire(ResourceKind::Decoder));
        assert!(dec.start().is_err());
        assert!(dec
            .configure(&MediaFormat::video("video/avc", 2, 2), SurfaceTexture::new())
            .is_err());
        dec.release();
        dec.release();
        assert_eq!(ledger.snapshot().decoders, 0);
    }
}
