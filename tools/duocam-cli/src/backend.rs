//! Codec backend selection.

use std::sync::Arc;

use clap::ValueEnum;

use duocam_codec_core::{CodecFactory, ContainerFormat, GpuDevice, MIME_AVC, MIME_RAW_VIDEO};
use duocam_common::EncoderSettings;
use duocam_gles::GlesGpu;
use duocam_gst::GstCodecFactory;
use duocam_software::{SoftwareCodecFactory, SoftwareGpu};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// GStreamer: H.264 in MP4
    Gst,
    /// CPU only: raw video in Y4M, drawn by the fake GPU device
    Software,
}

impl Backend {
    pub fn codecs(self) -> anyhow::Result<Arc<dyn CodecFactory>> {
        let codecs: Arc<dyn CodecFactory> = match self {
            Backend::Gst => Arc::new(GstCodecFactory::new()),
            Backend::Software => Arc::new(SoftwareCodecFactory::new()),
        };
        if !codecs.is_available() {
            anyhow::bail!(
                "{} backend is not available on this host (see `duocam check`)",
                codecs.name()
            );
        }
        Ok(codecs)
    }

    /// GPU device that composites for this backend. GStreamer output is
    /// rendered with OpenGL ES over EGL.
    pub fn gpu(self) -> anyhow::Result<Arc<dyn GpuDevice>> {
        match self {
            Backend::Gst => {
                if !GlesGpu::is_available() {
                    anyhow::bail!(
                        "no usable EGL display on this host (see `duocam check`); \
                         try EGL_PLATFORM=surfaceless or `--backend software`"
                    );
                }
                Ok(Arc::new(GlesGpu::new()?))
            }
            Backend::Software => Ok(Arc::new(SoftwareGpu::new())),
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            Backend::Gst => MIME_AVC,
            Backend::Software => MIME_RAW_VIDEO,
        }
    }

    pub fn container(self) -> ContainerFormat {
        match self {
            Backend::Gst => ContainerFormat::Mpeg4,
            Backend::Software => ContainerFormat::Y4m,
        }
    }

    /// Point the encoder at the stream type this backend writes.
    pub fn adapt(self, settings: &mut EncoderSettings) {
        settings.mime = self.mime().to_string();
    }
}
