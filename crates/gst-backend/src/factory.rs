use std::path::Path;

use duocam_codec_core::{
    CodecFactory, ContainerFormat, MediaExtractor, MediaMuxer, ResourceKind, ResourceLedger,
    ResourceSnapshot, VideoDecoder, VideoEncoder, MIME_AVC,
};
use duocam_common::{DuocamError, DuocamResult};
use gstreamer as gst;

use crate::decoder::GstVideoDecoder;
use crate::encoder::{find_h264_encoder, GstVideoEncoder};
use crate::extractor::GstExtractor;
use crate::init_gstreamer;
use crate::muxer::GstMuxer;

/// Elements every merge needs besides an H.264 encoder.
pub const REQUIRED_ELEMENTS: &[&str] = &[
    "filesrc",
    "qtdemux",
    "h264parse",
    "decodebin",
    "videoconvert",
    "mp4mux",
    "filesink",
    "appsrc",
    "appsink",
];

/// H.264 in MP4 through GStreamer.
#[derive(Debug, Clone, Default)]
pub struct GstCodecFactory {
    ledger: ResourceLedger,
}

impl GstCodecFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Required elements the registry does not have.
    pub fn missing_elements() -> Vec<&'static str> {
        if init_gstreamer().is_err() {
            return REQUIRED_ELEMENTS.to_vec();
        }
        REQUIRED_ELEMENTS
            .iter()
            .copied()
            .filter(|name| gst::ElementFactory::find(name).is_none())
            .collect()
    }
}

impl CodecFactory for GstCodecFactory {
    fn name(&self) -> &str {
        "gstreamer"
    }

    fn is_available(&self) -> bool {
        init_gstreamer().is_ok() && Self::missing_elements().is_empty() && find_h264_encoder().is_some()
    }

    fn create_extractor(&self, path: &Path) -> DuocamResult<Box<dyn MediaExtractor>> {
        Ok(Box::new(GstExtractor::open(path, &self.ledger)?))
    }

    fn create_decoder(&self, mime: &str) -> DuocamResult<Box<dyn VideoDecoder>> {
        if mime != MIME_AVC {
            return Err(DuocamError::codec_setup(format!(
                "GStreamer backend cannot decode {mime}"
            )));
        }
        Ok(Box::new(GstVideoDecoder::new(
            self.ledger.acquire(ResourceKind::Decoder),
        )?))
    }

    fn create_encoder(&self, mime: &str) -> DuocamResult<Box<dyn VideoEncoder>> {
        if mime != MIME_AVC {
            return Err(DuocamError::codec_setup(format!(
                "GStreamer backend cannot encode {mime}"
            )));
        }
        Ok(Box::new(GstVideoEncoder::new(
            self.ledger.acquire(ResourceKind::Encoder),
        )?))
    }

    fn create_muxer(
        &self,
        path: &Path,
        container: ContainerFormat,
    ) -> DuocamResult<Box<dyn MediaMuxer>> {
        if container != ContainerFormat::Mpeg4 {
            return Err(DuocamError::codec_setup(format!(
                "GStreamer backend cannot write {container:?} containers"
            )));
        }
        Ok(Box::new(GstMuxer::create(
            path,
            self.ledger.acquire(ResourceKind::Muxer),
        )?))
    }

    fn resources(&self) -> ResourceSnapshot {
        self.ledger.snapshot()
    }
}
