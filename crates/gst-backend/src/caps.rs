//! Conversions between [`MediaFormat`] and GStreamer caps.

use duocam_codec_core::{MediaFormat, MIME_AAC, MIME_AVC};
use gstreamer as gst;
use gstreamer_video as gst_video;

/// Rational frame rate for `fps`. NTSC-style rates map onto /1001.
pub fn fraction_from_fps(fps: f64) -> (i32, i32) {
    if !fps.is_finite() || fps <= 0.0 {
        return (30, 1);
    }
    let rounded = fps.round();
    if (fps - rounded).abs() < 1e-3 {
        return (rounded as i32, 1);
    }
    ((fps * 1001.0).round() as i32, 1001)
}

/// Describe a demuxed or encoded stream. Unknown media types keep their
/// caps name as the MIME type.
pub fn format_from_caps(caps: &gst::CapsRef) -> Option<MediaFormat> {
    let s = caps.structure(0)?;
    let name = s.name().as_str();
    let mut format = match name {
        "video/x-h264" => MediaFormat {
            mime: MIME_AVC.to_string(),
            ..Default::default()
        },
        "audio/mpeg" => MediaFormat {
            mime: MIME_AAC.to_string(),
            ..Default::default()
        },
        other => MediaFormat {
            mime: other.to_string(),
            ..Default::default()
        },
    };
    if let (Ok(w), Ok(h)) = (s.get::<i32>("width"), s.get::<i32>("height")) {
        format.width = Some(w as u32);
        format.height = Some(h as u32);
    }
    if let Ok(rate) = s.get::<gst::Fraction>("framerate") {
        if rate.denom() != 0 && rate.numer() > 0 {
            format.frame_rate = Some(rate.numer() as f64 / rate.denom() as f64);
        }
    }
    if let Ok(rate) = s.get::<i32>("rate") {
        format.sample_rate = Some(rate as u32);
    }
    if let Ok(channels) = s.get::<i32>("channels") {
        format.channel_count = Some(channels as u32);
    }
    if let Ok(codec_data) = s.get::<gst::Buffer>("codec_data") {
        if let Ok(map) = codec_data.map_readable() {
            format.codec_config = map.as_slice().to_vec();
        }
    }
    Some(format)
}

/// Length-prefixed, access-unit aligned H.264 caps as `qtdemux` produces
/// and `mp4mux` consumes.
pub fn h264_caps(format: &MediaFormat) -> gst::Caps {
    let mut builder = gst::Caps::builder("video/x-h264")
        .field("stream-format", "avc")
        .field("alignment", "au");
    if let Some((width, height)) = format.size() {
        builder = builder
            .field("width", width as i32)
            .field("height", height as i32);
    }
    if let Some(fps) = format.frame_rate {
        let (num, den) = fraction_from_fps(fps);
        builder = builder.field("framerate", gst::Fraction::new(num, den));
    }
    if !format.codec_config.is_empty() {
        builder = builder.field(
            "codec_data",
            gst::Buffer::from_slice(format.codec_config.clone()),
        );
    }
    builder.build()
}

/// Tightly packed RGBA at a fixed size and rate.
pub fn rgba_caps(width: u32, height: u32, fps: f64) -> gst::Caps {
    let (num, den) = fraction_from_fps(fps);
    gst_video::VideoCapsBuilder::new()
        .format(gst_video::VideoFormat::Rgba)
        .width(width as i32)
        .height(height as i32)
        .framerate(gst::Fraction::new(num, den))
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_rates() {
        assert_eq!(fraction_from_fps(30.0), (30, 1));
        assert_eq!(fraction_from_fps(60.0), (60, 1));
    }

    #[test]
    fn test_ntsc_rates() {
        assert_eq!(fraction_from_fps(30_000.0 / 1001.0), (30_000, 1001));
        assert_eq!(fraction_from_fps(24_000.0 / 1001.0), (24_000, 1001));
    }

    #[test]
    fn test_bad_rates_fall_back() {
        assert_eq!(fraction_from_fps(0.0), (30, 1));
        assert_eq!(fraction_from_fps(f64::NAN), (30, 1));
    }
}
