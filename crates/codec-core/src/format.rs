//! Track and container descriptions.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// H.264 elementary stream.
pub const MIME_AVC: &str = "video/avc";
/// Uncompressed 4:2:0 planar video, one frame per sample.
pub const MIME_RAW_VIDEO: &str = "video/raw";
/// Uncompressed PCM audio.
pub const MIME_RAW_AUDIO: &str = "audio/raw";
/// AAC audio.
pub const MIME_AAC: &str = "audio/mp4a-latm";

/// Description of one elementary stream, as reported by an extractor or
/// an encoder and as accepted by decoders and muxers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MediaFormat {
    pub mime: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Frames per second; may be fractional (e.g. 30000/1001).
    pub frame_rate: Option<f64>,
    /// Bits per second.
    pub bit_rate: Option<u32>,
    /// Seconds between key frames.
    pub key_frame_interval_secs: Option<u32>,
    pub duration_us: Option<i64>,
    pub sample_rate: Option<u32>,
    pub channel_count: Option<u32>,
    /// Out-of-band codec configuration (e.g. avcC).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub codec_config: Vec<u8>,
}

impl MediaFormat {
    pub fn video(mime: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            mime: mime.into(),
            width: Some(width),
            height: Some(height),
            ..Default::default()
        }
    }

    pub fn audio(mime: impl Into<String>, sample_rate: u32, channel_count: u32) -> Self {
        Self {
            mime: mime.into(),
            sample_rate: Some(sample_rate),
            channel_count: Some(channel_count),
            ..Default::default()
        }
    }

    pub fn with_frame_rate(mut self, fps: f64) -> Self {
        self.frame_rate = Some(fps);
        self
    }

    pub fn with_bit_rate(mut self, bps: u32) -> Self {
        self.bit_rate = Some(bps);
        self
    }

    pub fn with_key_frame_interval(mut self, secs: u32) -> Self {
        self.key_frame_interval_secs = Some(secs);
        self
    }

    pub fn with_duration_us(mut self, duration_us: i64) -> Self {
        self.duration_us = Some(duration_us);
        self
    }

    pub fn is_video(&self) -> bool {
        self.mime.starts_with("video/")
    }

    pub fn is_audio(&self) -> bool {
        self.mime.starts_with("audio/")
    }

    /// `(width, height)` when both are known.
    pub fn size(&self) -> Option<(u32, u32)> {
        Some((self.width?, self.height?))
    }
}

/// Output container written by a muxer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerFormat {
    /// ISO BMFF / MPEG-4 Part 14.
    Mpeg4,
    /// YUV4MPEG2 raw video stream.
    Y4m,
}

impl ContainerFormat {
    /// Pick the container from a file extension. Unknown extensions map
    /// to MPEG-4.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("y4m") => Self::Y4m,
            _ => Self::Mpeg4,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Mpeg4 => "mp4",
            Self::Y4m => "y4m",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_format_builder() {
        let fmt = MediaFormat::video(MIME_AVC, 1920, 1080)
            .with_frame_rate(30.0)
            .with_bit_rate(5_000_000)
            .with_key_frame_interval(1);
        assert!(fmt.is_video());
        assert!(!fmt.is_audio());
        assert_eq!(fmt.size(), Some((1920, 1080)));
        assert_eq!(fmt.bit_rate, Some(5_000_000));
    }

    #[test]
    fn test_audio_format_has_no_size() {
        let fmt = MediaFormat::audio(MIME_AAC, 48_000, 2);
        assert!(fmt.is_audio());
        assert_eq!(fmt.size(), None);
    }

    #[test]
    fn test_container_from_extension() {
        assert_eq!(
            ContainerFormat::from_path(Path::new("/tmp/out.Y4M")),
            ContainerFormat::Y4m
        );
        assert_eq!(
            ContainerFormat::from_path(Path::new("/tmp/out.mp4")),
            ContainerFormat::Mpeg4
        );
        assert_eq!(
            ContainerFormat::from_path(Path::new("/tmp/noext")),
            ContainerFormat::Mpeg4
        );
    }

    #[test]
    fn test_format_serializes_without_empty_config() {
        let json = serde_json::to_string(&MediaFormat::video(MIME_RAW_VIDEO, 2, 2)).unwrap();
        assert!(!json.contains("codec_config"));
    }
}
