//! DuoCam GStreamer backend.
//!
//! Implements the codec contracts with GStreamer pipelines: `qtdemux` for
//! extraction, `decodebin` for H.264 decoding, the best available H.264
//! encoder element, and `mp4mux` for output. Elements are fed and drained
//! through `appsrc`/`appsink` so the merge engine keeps control of the
//! buffer loop.

pub mod caps;
pub mod decoder;
pub mod encoder;
pub mod extractor;
pub mod factory;
pub mod muxer;
pub mod probe;

use std::sync::OnceLock;
use std::time::Duration;

use duocam_common::{DuocamError, DuocamResult};
use gst::prelude::*;
use gstreamer as gst;

pub use decoder::GstVideoDecoder;
pub use encoder::{find_h264_encoder, GstVideoEncoder, H264_ENCODERS};
pub use extractor::GstExtractor;
pub use factory::GstCodecFactory;
pub use muxer::GstMuxer;
pub use probe::{probe_environment, GstEnvironment};

pub(crate) fn init_gstreamer() -> DuocamResult<()> {
    static GST_INIT: OnceLock<Result<(), String>> = OnceLock::new();
    let init_res = GST_INIT.get_or_init(|| gst::init().map_err(|e| e.to_string()));
    match init_res {
        Ok(()) => Ok(()),
        Err(e) => Err(DuocamError::codec_setup(format!(
            "Failed to initialize GStreamer: {e}"
        ))),
    }
}

pub(crate) fn clock_time(duration: Duration) -> gst::ClockTime {
    gst::ClockTime::from_nseconds(duration.as_nanos() as u64)
}

pub(crate) fn pts_to_clock(pts_us: i64) -> gst::ClockTime {
    gst::ClockTime::from_useconds(pts_us.max(0) as u64)
}

pub(crate) fn make_element(factory: &str) -> DuocamResult<gst::Element> {
    gst::ElementFactory::make(factory)
        .build()
        .map_err(|e| DuocamError::codec_setup(format!("Failed to create {factory}: {e}")))
}

/// Drain pending bus messages, logging warnings and returning the first
/// error.
pub(crate) fn check_bus(pipeline: &gst::Pipeline, name: &str) -> DuocamResult<()> {
    let Some(bus) = pipeline.bus() else {
        return Ok(());
    };
    while let Some(msg) = bus.pop() {
        match msg.view() {
            gst::MessageView::Error(err) => {
                return Err(DuocamError::codec(format!(
                    "{name} pipeline error: {} ({})",
                    err.error(),
                    err.debug().unwrap_or_default()
                )));
            }
            gst::MessageView::Warning(warn) => {
                tracing::warn!(
                    pipeline = name,
                    warning = %warn.error(),
                    "GStreamer warning"
                );
            }
            _ => {}
        }
    }
    Ok(())
}

/// Send EOS and wait for it to reach the sinks, then shut the pipeline
/// down.
pub(crate) fn drain_and_stop(
    pipeline: &gst::Pipeline,
    name: &str,
    timeout: Duration,
) -> DuocamResult<()> {
    let mut result = Ok(());
    if let Some(bus) = pipeline.bus() {
        match bus.timed_pop_filtered(
            clock_time(timeout),
            &[gst::MessageType::Eos, gst::MessageType::Error],
        ) {
            Some(msg) => match msg.view() {
                gst::MessageView::Eos(_) => {
                    tracing::debug!(pipeline = name, "EOS received; pipeline drained");
                }
                gst::MessageView::Error(e) => {
                    result = Err(DuocamError::muxer(format!(
                        "{name} pipeline error during EOS drain: {}",
                        e.error()
                    )));
                }
                _ => {}
            },
            None => {
                tracing::warn!(pipeline = name, ?timeout, "EOS drain timed out");
                result = Err(DuocamError::muxer(format!(
                    "{name} pipeline did not drain within {timeout:?}"
                )));
            }
        }
    }
    pipeline.set_state(gst::State::Null).map_err(|e| {
        DuocamError::codec(format!("Failed to stop {name} pipeline: {e:?}"))
    })?;
    result
}

/// Best-effort shutdown for release paths.
pub(crate) fn shutdown(pipeline: &gst::Pipeline, name: &str) {
    if let Err(e) = pipeline.set_state(gst::State::Null) {
        tracing::warn!(pipeline = name, error = ?e, "Failed to stop pipeline");
    }
}
