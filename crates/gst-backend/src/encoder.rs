//! H.264 encoding.
//!
//! Pipeline: appsrc (RGBA) → videoconvert → encoder → h264parse → appsink.
//! The encoder element is the first one in [`H264_ENCODERS`] the registry
//! knows about.

use std::collections::VecDeque;
use std::time::Duration;

use duocam_codec_core::{
    BufferFlags, BufferInfo, MediaFormat, OutputEvent, ResourceGuard, Surface, VideoEncoder,
    VideoFrame, MIME_AVC,
};
use duocam_common::{DuocamError, DuocamResult};
use gst::prelude::*;
use gstreamer as gst;
use gstreamer_app as gst_app;

use crate::caps::{format_from_caps, rgba_caps};
use crate::{check_bus, clock_time, init_gstreamer, make_element, pts_to_clock, shutdown};

const OUTPUT_SLOTS: usize = 4;

/// H.264 encoder elements in order of preference: VA-API, NVENC, QSV, AMF
/// and V4L2 hardware first, then the software encoders.
pub const H264_ENCODERS: &[&str] = &[
    "vah264enc",
    "vaapih264enc",
    "nvh264enc",
    "qsvh264enc",
    "amfh264enc",
    "v4l2h264enc",
    "x264enc",
    "openh264enc",
];

/// First encoder in [`H264_ENCODERS`] accepted by `available`.
pub fn pick_encoder(available: impl Fn(&str) -> bool) -> Option<&'static str> {
    H264_ENCODERS.iter().copied().find(|name| available(name))
}

/// First H.264 encoder element installed on this host.
pub fn find_h264_encoder() -> Option<&'static str> {
    init_gstreamer().ok()?;
    pick_encoder(|name| gst::ElementFactory::find(name).is_some())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Configured,
    Running,
    Stopped,
    Released,
}

#[derive(Debug)]
struct EncodedSlot {
    data: Vec<u8>,
    info: BufferInfo,
}

#[derive(Debug)]
struct Pipeline {
    pipeline: gst::Pipeline,
    appsrc: gst_app::AppSrc,
    appsink: gst_app::AppSink,
}

/// Hardware-preferring H.264 encoder fed through an input [`Surface`].
#[derive(Debug)]
pub struct GstVideoEncoder {
    state: State,
    element: Option<&'static str>,
    pipeline: Option<Pipeline>,
    format: Option<MediaFormat>,
    output_format: Option<MediaFormat>,
    surface: Option<Surface>,
    outputs: Vec<Option<EncodedSlot>>,
    free: VecDeque<usize>,
    pending: Option<EncodedSlot>,
    format_reported: bool,
    eos_signalled: bool,
    input_ended: bool,
    eos_emitted: bool,
    frame_duration: gst::ClockTime,
    guard: ResourceGuard,
}

impl GstVideoEncoder {
    pub fn new(guard: ResourceGuard) -> DuocamResult<Self> {
        init_gstreamer()?;
        Ok(Self {
            state: State::Uninitialized,
            element: None,
            pipeline: None,
            format: None,
            output_format: None,
            surface: None,
            outputs: (0..OUTPUT_SLOTS).map(|_| None).collect(),
            free: (0..OUTPUT_SLOTS).collect(),
            pending: None,
            format_reported: false,
            eos_signalled: false,
            input_ended: false,
            eos_emitted: false,
            frame_duration: gst::ClockTime::ZERO,
            guard,
        })
    }

    /// Name of the encoder element in use, once configured.
    pub fn element_name(&self) -> Option<&'static str> {
        self.element
    }

    fn build_pipeline(
        element: &str,
        format: &MediaFormat,
        (width, height): (u32, u32),
    ) -> DuocamResult<Pipeline> {
        let fps = format.frame_rate.unwrap_or(30.0);
        let pipeline = gst::Pipeline::new();
        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(&rgba_caps(width, height, fps))
            .format(gst::Format::Time)
            .is_live(false)
            .build();
        let videoconvert = make_element("videoconvert")?;
        let encoder = make_element(element)?;
        configure_encoder(&encoder, element, format);
        let h264parse = make_element("h264parse")?;
        let appsink = gst_app::AppSink::builder()
            .name("sink")
            .caps(
                &gst::Caps::builder("video/x-h264")
                    .field("stream-format", "avc")
                    .field("alignment", "au")
                    .build(),
            )
            .sync(false)
            .drop(false)
            .build();

        pipeline
            .add_many([
                appsrc.upcast_ref(),
                &videoconvert,
                &encoder,
                &h264parse,
                appsink.upcast_ref(),
            ])
            .map_err(|e| DuocamError::codec_setup(format!("Failed to add elements: {e}")))?;
        gst::Element::link_many([
            appsrc.upcast_ref(),
            &videoconvert,
            &encoder,
            &h264parse,
            appsink.upcast_ref(),
        ])
        .map_err(|e| DuocamError::codec_setup(format!("Failed to link {element} pipeline: {e}")))?;

        Ok(Pipeline {
            pipeline,
            appsrc,
            appsink,
        })
    }

    fn running(&self) -> DuocamResult<&Pipeline> {
        match (&self.pipeline, self.state) {
            (Some(p), State::Running) => Ok(p),
            _ => Err(DuocamError::codec(format!("encoder used while {:?}", self.state))),
        }
    }

    /// Hand every frame waiting on the input surface to the pipeline.
    fn push_surface_frames(&mut self) -> DuocamResult<()> {
        let Some(surface) = self.surface.clone() else {
            return Ok(());
        };
        let p = self.running()?;
        while let Some(frame) = surface.acquire_frame() {
            let VideoFrame { pts_us, data, .. } = frame;
            let mut buffer = gst::Buffer::from_mut_slice(data);
            if let Some(b) = buffer.get_mut() {
                b.set_pts(pts_to_clock(pts_us));
                b.set_duration(self.frame_duration);
            }
            p.appsrc
                .push_buffer(buffer)
                .map_err(|e| DuocamError::codec(format!("Failed to push frame: {e:?}")))?;
        }
        if self.eos_signalled && !self.input_ended && surface.pending() == 0 {
            p.appsrc
                .end_of_stream()
                .map_err(|e| DuocamError::codec(format!("Failed to signal end of stream: {e:?}")))?;
            self.input_ended = true;
        }
        Ok(())
    }

    fn pull(&mut self, timeout: Duration) -> DuocamResult<Option<EncodedSlot>> {
        let p = self.running()?;
        if let Some(sample) = p.appsink.try_pull_sample(clock_time(timeout)) {
            if self.output_format.is_none() {
                self.output_format = Some(self.describe_output(&sample));
            }
            let buffer = sample
                .buffer()
                .ok_or_else(|| DuocamError::codec("No buffer in encoded sample"))?;
            let map = buffer
                .map_readable()
                .map_err(|e| DuocamError::codec(format!("Failed to map encoded sample: {e}")))?;
            let flags = if buffer.flags().contains(gst::BufferFlags::DELTA_UNIT) {
                BufferFlags::NONE
            } else {
                BufferFlags::KEY_FRAME
            };
            let data = map.as_slice().to_vec();
            return Ok(Some(EncodedSlot {
                info: BufferInfo {
                    offset: 0,
                    size: data.len(),
                    presentation_time_us: buffer.pts().map_or(0, |t| t.useconds() as i64),
                    flags,
                },
                data,
            }));
        }
        check_bus(&p.pipeline, "encoder")?;
        if p.appsink.is_eos() && !self.eos_emitted {
            self.eos_emitted = true;
            return Ok(Some(EncodedSlot {
                data: Vec::new(),
                info: BufferInfo {
                    flags: BufferFlags::END_OF_STREAM,
                    ..BufferInfo::default()
                },
            }));
        }
        Ok(None)
    }

    fn describe_output(&self, sample: &gst::Sample) -> MediaFormat {
        let mut out = sample
            .caps()
            .and_then(format_from_caps)
            .unwrap_or_else(|| MediaFormat {
                mime: MIME_AVC.to_string(),
                ..Default::default()
            });
        if let Some(configured) = &self.format {
            out.width = out.width.or(configured.width);
            out.height = out.height.or(configured.height);
            out.frame_rate = out.frame_rate.or(configured.frame_rate);
            out.bit_rate = configured.bit_rate;
            out.key_frame_interval_secs = configured.key_frame_interval_secs;
        }
        out
    }

    fn held(&self, index: usize) -> DuocamResult<&EncodedSlot> {
        self.outputs
            .get(index)
            .and_then(Option::as_ref)
            .ok_or_else(|| DuocamError::codec(format!("output buffer {index} is not held")))
    }
}

/// Apply bitrate and key-frame spacing using each element's own property
/// names and units.
fn configure_encoder(encoder: &gst::Element, name: &str, format: &MediaFormat) {
    let kbps = format.bit_rate.map(|bps| (bps / 1000).max(1));
    let fps = format.frame_rate.unwrap_or(30.0).max(1.0);
    let key_int = format
        .key_frame_interval_secs
        .map(|secs| ((secs as f64 * fps).round() as u32).max(1));

    match name {
        "x264enc" => {
            set_from_str(encoder, "speed-preset", "veryfast");
            set_from_str(encoder, "tune", "zerolatency");
        }
        "vah264enc" | "amfh264enc" => set_from_str(encoder, "rate-control", "cbr"),
        "nvh264enc" => set_from_str(encoder, "rc-mode", "cbr"),
        "openh264enc" => {
            set_from_str(encoder, "rate-control", "bitrate");
            set_from_str(encoder, "usage-type", "camera");
        }
        _ => {}
    }

    if let Some(kbps) = kbps {
        // openh264enc takes bits per second; the others kilobits.
        let value = if name == "openh264enc" { kbps * 1000 } else { kbps };
        set_number(encoder, "bitrate", value);
    }
    if let Some(key_int) = key_int {
        for property in ["key-int-max", "keyframe-period", "gop-size", "idr-interval"] {
            if set_number(encoder, property, key_int) {
                break;
            }
        }
    }
    tracing::debug!(
        encoder = name,
        bitrate_kbps = ?kbps,
        key_int = ?key_int,
        "Configured H.264 encoder"
    );
}

fn set_from_str(element: &gst::Element, property: &str, value: &str) {
    if element.has_property(property) {
        element.set_property_from_str(property, value);
    }
}

/// Set an integer property whatever its signedness. Returns whether the
/// element has it.
fn set_number(element: &gst::Element, property: &str, value: u32) -> bool {
    let Some(pspec) = element.find_property(property) else {
        return false;
    };
    let ty = pspec.value_type();
    if ty == u32::static_type() {
        element.set_property(property, value);
    } else if ty == i32::static_type() {
        element.set_property(property, value.min(i32::MAX as u32) as i32);
    } else if ty == u64::static_type() {
        element.set_property(property, value as u64);
    } else if ty == i64::static_type() {
        element.set_property(property, value as i64);
    } else {
        return false;
    }
    true
}

impl VideoEncoder for GstVideoEncoder {
    fn configure(&mut self, format: &MediaFormat) -> DuocamResult<()> {
        if self.state != State::Uninitialized {
            return Err(DuocamError::codec_setup(format!(
                "encoder configure while {:?}",
                self.state
            )));
        }
        if format.mime != MIME_AVC {
            return Err(DuocamError::codec_setup(format!(
                "GStreamer backend cannot encode {}",
                format.mime
            )));
        }
        let size = format
            .size()
            .ok_or_else(|| DuocamError::codec_setup("encoder format has no picture size"))?;
        let element = pick_encoder(|name| gst::ElementFactory::find(name).is_some())
            .ok_or_else(|| {
                DuocamError::codec_setup(
                    "No H.264 encoder available. Install gst-plugins-ugly (x264enc), \
                     gst-plugins-bad (openh264enc) or a hardware encoder plugin",
                )
            })?;
        tracing::info!(encoder = element, width = size.0, height = size.1, "Selected H.264 encoder");
        self.pipeline = Some(Self::build_pipeline(element, format, size)?);
        let fps = format.frame_rate.unwrap_or(30.0).max(1.0);
        self.frame_duration = gst::ClockTime::from_nseconds((1e9 / fps).round() as u64);
        self.element = Some(element);
        self.format = Some(format.clone());
        self.state = State::Configured;
        Ok(())
    }

    fn create_input_surface(&mut self) -> DuocamResult<Surface> {
        if self.state != State::Configured {
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
        let (Some(p), State::Configured) = (&self.pipeline, self.state) else {
            return Err(DuocamError::codec_setup(format!(
                "encoder start while {:?}",
                self.state
            )));
        };
        if self.surface.is_none() {
            return Err(DuocamError::codec_setup(
                "encoder started without an input surface",
            ));
        }
        p.pipeline.set_state(gst::State::Playing).map_err(|e| {
            DuocamError::codec_setup(format!("Failed to start encoder pipeline: {e:?}"))
        })?;
        self.state = State::Running;
        Ok(())
    }

    fn signal_end_of_input_stream(&mut self) -> DuocamResult<()> {
        self.running()?;
        if self.eos_signalled {
            return Err(DuocamError::codec("end of stream already signalled"));
        }
        self.eos_signalled = true;
        if let Some(surface) = &self.surface {
            surface.close_input();
        }
        self.push_surface_frames()
    }

    fn dequeue_output_buffer(&mut self, timeout: Duration) -> DuocamResult<OutputEvent> {
        self.push_surface_frames()?;
        if self.pending.is_none() {
            self.pending = self.pull(timeout)?;
        }
        if self.pending.is_none() {
            return Ok(OutputEvent::TryAgainLater);
        }
        if !self.format_reported && self.output_format.is_some() {
            self.format_reported = true;
            return Ok(OutputEvent::FormatChanged);
        }
        let Some(index) = self.free.pop_front() else {
            return Ok(OutputEvent::TryAgainLater);
        };
        let Some(slot) = self.pending.take() else {
            self.free.push_front(index);
            return Ok(OutputEvent::TryAgainLater);
        };
        let info = slot.info;
        self.outputs[index] = Some(slot);
        Ok(OutputEvent::Buffer { index, info })
    }

    fn output_format(&self) -> DuocamResult<MediaFormat> {
        self.output_format
            .clone()
            .ok_or_else(|| DuocamError::codec("encoder output format is not known yet"))
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
        match (&self.pipeline, self.state) {
            (Some(p), State::Running | State::Configured) => {
                p.pipeline.set_state(gst::State::Null).map_err(|e| {
                    DuocamError::codec(format!("Failed to stop encoder pipeline: {e:?}"))
                })?;
                self.state = State::Stopped;
                self.pending = None;
                Ok(())
            }
            _ => Err(DuocamError::codec(format!("encoder stop while {:?}", self.state))),
        }
    }

    fn release(&mut self) {
        if self.state == State::Released {
            return;
        }
        self.state = State::Released;
        if let Some(p) = self.pipeline.take() {
            shutdown(&p.pipeline, "encoder");
        }
        if let Some(surface) = self.surface.take() {
            surface.release();
        }
        self.pending = None;
        self.guard.release();
    }
}

impl Drop for GstVideoEncoder {
    fn drop(&mut self) {
        self.release();
    }
}
