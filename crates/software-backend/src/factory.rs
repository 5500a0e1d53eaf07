use std::path::Path;

use duocam_codec_core::{
    CodecFactory, ContainerFormat, MediaExtractor, MediaMuxer, ResourceKind, ResourceLedger,
    ResourceSnapshot, VideoDecoder, VideoEncoder, MIME_RAW_VIDEO,
};
use duocam_common::{DuocamError, DuocamResult};

use crate::decoder::RawVideoDecoder;
use crate::encoder::RawVideoEncoder;
use crate::extractor::SoftwareExtractor;
use crate::muxer::Y4mMuxer;

/// In-process codecs for raw video in Y4M files. Always available.
#[derive(Debug, Clone, Default)]
pub struct SoftwareCodecFactory {
    ledger: ResourceLedger,
}

impl SoftwareCodecFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }
}

impl CodecFactory for SoftwareCodecFactory {
    fn name(&self) -> &str {
        "software"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn create_extractor(&self, path: &Path) -> DuocamResult<Box<dyn MediaExtractor>> {
        Ok(Box::new(SoftwareExtractor::open(path, &self.ledger)?))
    }

    fn create_decoder(&self, mime: &str) -> DuocamResult<Box<dyn VideoDecoder>> {
        if mime != MIME_RAW_VIDEO {
            return Err(DuocamError::codec_setup(format!(
                "software backend cannot decode {mime}"
            )));
        }
        Ok(Box::new(RawVideoDecoder::new(
            self.ledger.acquire(ResourceKind::Decoder),
        )))
    }

    fn create_encoder(&self, mime: &str) -> DuocamResult<Box<dyn VideoEncoder>> {
        if mime != MIME_RAW_VIDEO {
            return Err(DuocamError::codec_setup(format!(
                "software backend cannot encode {mime}"
            )));
        }
        Ok(Box::new(RawVideoEncoder::new(
            self.ledger.acquire(ResourceKind::Encoder),
        )))
    }

    fn create_muxer(
        &self,
        path: &Path,
        container: ContainerFormat,
    ) -> DuocamResult<Box<dyn MediaMuxer>> {
        if container != ContainerFormat::Y4m {
            return Err(DuocamError::codec_setup(format!(
                "software backend cannot write {container:?} containers"
            )));
        }
        Ok(Box::new(Y4mMuxer::create(
            path,
            self.ledger.acquire(ResourceKind::Muxer),
        )?))
    }

    fn resources(&self) -> ResourceSnapshot {
        self.ledger.snapshot()
    }
}
