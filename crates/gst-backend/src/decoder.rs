//! H.264 decoding.
//!
//! Pipeline: appsrc → h264parse → decodebin → videoconvert → appsink (RGBA).
//! `decodebin` picks the best decoder GStreamer has, hardware first.

use std::collections::VecDeque;
use std::time::Duration;

use duocam_codec_core::{
    BufferFlags, BufferInfo, MediaFormat, OutputEvent, ResourceGuard, SurfaceTexture,
    VideoDecoder, VideoFrame, MIME_AVC,
};
use duocam_common::{DuocamError, DuocamResult};
use gst::prelude::*;
use gstreamer as gst;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;

use crate::caps::h264_caps;
use crate::{check_bus, clock_time, init_gstreamer, make_element, pts_to_clock, shutdown};

const INPUT_SLOTS: usize = 4;
const OUTPUT_SLOTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Configured,
    Running,
    Stopped,
    Released,
}

#[derive(Debug)]
struct DecodedSlot {
    frame: Option<VideoFrame>,
    info: BufferInfo,
}

#[derive(Debug)]
struct Pipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
}

#[derive(Debug)]
pub struct GstVideoDecoder {
    state: State,
    pipeline: Option<Pipeline>,
    output: Option<SurfaceTexture>,
    inputs: Vec<Vec<u8>>,
    input_owned: Vec<bool>,
    free_inputs: VecDeque<usize>,
    outputs: Vec<Option<DecodedSlot>>,
    free_outputs: VecDeque<usize>,
    pending: Option<DecodedSlot>,
    format_reported: bool,
    input_eos: bool,
    eos_emitted: bool,
    guard: ResourceGuard,
}

impl GstVideoDecoder {
    pub fn new(guard: ResourceGuard) -> DuocamResult<Self> {
        init_gstreamer()?;
        Ok(Self {
            state: State::Uninitialized,
            pipeline: None,
            output: None,
            inputs: vec![Vec::new(); INPUT_SLOTS],
            input_owned: vec![false; INPUT_SLOTS],
            free_inputs: (0..INPUT_SLOTS).collect(),
            outputs: (0..OUTPUT_SLOTS).map(|_| None).collect(),
            free_outputs: (0..OUTPUT_SLOTS).collect(),
            pending: None,
            format_reported: false,
            input_eos: false,
            eos_emitted: false,
            guard,
        })
    }

    fn build_pipeline(format: &MediaFormat) -> DuocamResult<Pipeline> {
        let pipeline = gst::Pipeline::new();
        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(&h264_caps(format))
            .format(gst::Format::Time)
            .is_live(false)
            .build();
        let h264parse = make_element("h264parse")?;
        let decodebin = make_element("decodebin")?;
        let videoconvert = make_element("videoconvert")?;
        let appsink = gst_app::AppSink::builder()
            .name("sink")
            .caps(
                &gst_video::VideoCapsBuilder::new()
                    .format(gst_video::VideoFormat::Rgba)
                    .build(),
            )
            .sync(false)
            .max_buffers(OUTPUT_SLOTS as u32 + 2)
            .drop(false)
            .build();

        pipeline
            .add_many([
                appsrc.upcast_ref(),
                &h264parse,
                &decodebin,
                &videoconvert,
                appsink.upcast_ref(),
            ])
            .map_err(|e| DuocamError::codec_setup(format!("Failed to add elements: {e}")))?;
        gst::Element::link_many([appsrc.upcast_ref(), &h264parse, &decodebin]).map_err(|e| {
            DuocamError::codec_setup(format!("Failed to link src→parse→decode: {e}"))
        })?;
        gst::Element::link_many([&videoconvert, appsink.upcast_ref()]).map_err(|e| {
            DuocamError::codec_setup(format!("Failed to link convert→sink: {e}"))
        })?;

        // decodebin exposes its source pad once the stream is typed.
        let convert_weak = videoconvert.downgrade();
        decodebin.connect_pad_added(move |_decodebin, src_pad| {
            let Some(convert) = convert_weak.upgrade() else {
                return;
            };
            let Some(sink_pad) = convert.static_pad("sink") else {
                return;
            };
            if sink_pad.is_linked() {
                return;
            }
            if let Err(e) = src_pad.link(&sink_pad) {
                tracing::error!(error = ?e, "Failed to link decodebin pad");
            } else {
                tracing::debug!("decodebin linked to videoconvert");
            }
        });

        Ok(Pipeline {
            pipeline,
            appsrc,
            appsink,
        })
    }

    fn running(&self) -> DuocamResult<&Pipeline> {
        match (&self.pipeline, self.state) {
            (Some(p), State::Running) => Ok(p),
            _ => Err(DuocamError::codec(format!("decoder used while {:?}", self.state))),
        }
    }

    fn pull(&mut self, timeout: Duration) -> DuocamResult<Option<DecodedSlot>> {
        let p = self.running()?;
        if let Some(sample) = p.appsink.try_pull_sample(clock_time(timeout)) {
            let frame = sample_to_frame(&sample)?;
            let info = BufferInfo {
                offset: 0,
                size: frame.data.len(),
                presentation_time_us: frame.pts_us,
                flags: BufferFlags::NONE,
            };
            return Ok(Some(DecodedSlot {
                frame: Some(frame),
                info,
            }));
        }
        check_bus(&p.pipeline, "decoder")?;
        if p.appsink.is_eos() && !self.eos_emitted {
            self.eos_emitted = true;
            return Ok(Some(DecodedSlot {
                frame: None,
                info: BufferInfo {
                    flags: BufferFlags::END_OF_STREAM,
                    ..BufferInfo::default()
                },
            }));
        }
        Ok(None)
    }
}

fn sample_to_frame(sample: &gst::Sample) -> DuocamResult<VideoFrame> {
    let buffer = sample
        .buffer()
        .ok_or_else(|| DuocamError::codec("No buffer in decoded sample"))?;
    let caps = sample
        .caps()
        .ok_or_else(|| DuocamError::codec("No caps in decoded sample"))?;
    let info = gst_video::VideoInfo::from_caps(caps)
        .map_err(|e| DuocamError::codec(format!("Invalid video caps: {e}")))?;
    let frame = gst_video::VideoFrameRef::from_buffer_ref_readable(buffer, &info)
        .map_err(|e| DuocamError::codec(format!("Failed to map decoded frame: {e}")))?;
    let (width, height) = (info.width(), info.height());
    let stride = frame.plane_stride()[0] as usize;
    let plane = frame
        .plane_data(0)
        .map_err(|e| DuocamError::codec(format!("Failed to read decoded plane: {e}")))?;
    let row = width as usize * 4;
    let mut data = Vec::with_capacity(row * height as usize);
    for y in 0..height as usize {
        data.extend_from_slice(&plane[y * stride..y * stride + row]);
    }
    let pts_us = buffer.pts().map_or(0, |t| t.useconds() as i64);
    VideoFrame::new(width, height, pts_us, data)
}

impl VideoDecoder for GstVideoDecoder {
    fn configure(&mut self, format: &MediaFormat, output: SurfaceTexture) -> DuocamResult<()> {
        if self.state != State::Uninitialized {
            return Err(DuocamError::codec_setup(format!(
                "decoder configure while {:?}",
                self.state
            )));
        }
        if format.mime != MIME_AVC {
            return Err(DuocamError::codec_setup(format!(
                "GStreamer backend cannot decode {}",
                format.mime
            )));
        }
        self.pipeline = Some(Self::build_pipeline(format)?);
        self.output = Some(output);
        self.state = State::Configured;
        Ok(())
    }

    fn start(&mut self) -> DuocamResult<()> {
        let (Some(p), State::Configured) = (&self.pipeline, self.state) else {
            return Err(DuocamError::codec_setup(format!(
                "decoder start while {:?}",
                self.state
            )));
        };
        p.pipeline.set_state(gst::State::Playing).map_err(|e| {
            DuocamError::codec_setup(format!("Failed to start decoder pipeline: {e:?}"))
        })?;
        self.state = State::Running;
        Ok(())
    }

    fn dequeue_input_buffer(&mut self, _timeout: Duration) -> DuocamResult<Option<usize>> {
        self.running()?;
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
            return Err(DuocamError::codec(format!("input buffer {index} is not dequeued")));
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
        if !self.input_owned.get(index).copied().unwrap_or(false) {
            return Err(DuocamError::codec(format!("input buffer {index} is not dequeued")));
        }
        let data = self.inputs[index]
            .get(..size)
            .ok_or_else(|| DuocamError::codec(format!("input buffer {index} holds fewer than {size} bytes")))?
            .to_vec();
        let p = self.running()?;
        if size > 0 {
            let mut buffer = gst::Buffer::from_slice(data);
            if let Some(b) = buffer.get_mut() {
                b.set_pts(pts_to_clock(pts_us));
                if !flags.contains(BufferFlags::KEY_FRAME) {
                    b.set_flags(gst::BufferFlags::DELTA_UNIT);
                }
            }
            p.appsrc
                .push_buffer(buffer)
                .map_err(|e| DuocamError::codec(format!("Failed to push sample: {e:?}")))?;
        }
        if flags.contains(BufferFlags::END_OF_STREAM) {
            p.appsrc
                .end_of_stream()
                .map_err(|e| DuocamError::codec(format!("Failed to signal end of stream: {e:?}")))?;
            self.input_eos = true;
        }
        self.input_owned[index] = false;
        self.free_inputs.push_back(index);
        Ok(())
    }

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> DuocamResult<OutputEvent> {
        if self.pending.is_none() {
            self.pending = self.pull(timeout)?;
        }
        if self.pending.is_none() {
            return Ok(OutputEvent::TryAgainLater);
        }
        if !self.format_reported {
            self.format_reported = true;
            return Ok(OutputEvent::FormatChanged);
        }
        let Some(index) = self.free_outputs.pop_front() else {
            return Ok(OutputEvent::TryAgainLater);
        };
        let Some(slot) = self.pending.take() else {
            self.free_outputs.push_front(index);
            return Ok(OutputEvent::TryAgainLater);
        };
        let info = slot.info;
        self.outputs[index] = Some(slot);
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
        match (&self.pipeline, self.state) {
            (Some(p), State::Running | State::Configured) => {
                p.pipeline.set_state(gst::State::Null).map_err(|e| {
                    DuocamError::codec(format!("Failed to stop decoder pipeline: {e:?}"))
                })?;
                self.state = State::Stopped;
                Ok(())
            }
            _ => Err(DuocamError::codec(format!("decoder stop while {:?}", self.state))),
        }
    }

    fn release(&mut self) {
        if self.state == State::Released {
            return;
        }
        self.state = State::Released;
        if let Some(p) = self.pipeline.take() {
            shutdown(&p.pipeline, "decoder");
        }
        self.output = None;
        self.pending = None;
        self.guard.release();
    }
}

impl Drop for GstVideoDecoder {
    fn drop(&mut self) {
        self.release();
    }
}
