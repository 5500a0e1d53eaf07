//! Host capability report for `duocam check`.

use gstreamer as gst;
use serde::Serialize;

use crate::encoder::find_h264_encoder;
use crate::factory::GstCodecFactory;
use crate::init_gstreamer;

#[derive(Debug, Clone, Serialize)]
pub struct GstEnvironment {
    /// `None` when GStreamer failed to initialize.
    pub version: Option<String>,
    /// H.264 encoder element a merge would use.
    pub encoder: Option<String>,
    pub hardware_encoder: bool,
    pub missing_elements: Vec<String>,
}

impl GstEnvironment {
    pub fn is_usable(&self) -> bool {
        self.version.is_some() && self.encoder.is_some() && self.missing_elements.is_empty()
    }
}

pub fn probe_environment() -> GstEnvironment {
    if let Err(e) = init_gstreamer() {
        tracing::warn!(error = %e, "GStreamer unavailable");
        return GstEnvironment {
            version: None,
            encoder: None,
            hardware_encoder: false,
            missing_elements: Vec::new(),
        };
    }
    let encoder = find_h264_encoder();
    GstEnvironment {
        version: Some(gst::version_string().to_string()),
        hardware_encoder: encoder.is_some_and(|name| !matches!(name, "x264enc" | "openh264enc")),
        encoder: encoder.map(str::to_string),
        missing_elements: GstCodecFactory::missing_elements()
            .into_iter()
            .map(str::to_string)
            .collect(),
    }
}
