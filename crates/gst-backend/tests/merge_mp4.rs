//! End-to-end merge of two H.264/MP4 recordings through GStreamer.
//!
//! Inputs are encoded with `x264enc` so the test returns early on hosts
//! without the GStreamer backend or that encoder. Compositing uses the EGL
//! device when a display is available and the software fake otherwise.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use duocam_codec_core::{CodecFactory, GpuDevice, MIME_AVC};
use duocam_common::{EncoderSettings, PipelineSettings};
use duocam_gles::GlesGpu;
use duocam_gst::GstCodecFactory;
use duocam_merge_engine::{CancelToken, MergePipeline, MergeRequest};
use duocam_software::SoftwareGpu;
use gstreamer as gst;
use gstreamer::prelude::*;

fn gst_ready() -> bool {
    let codecs = GstCodecFactory::new();
    if !codecs.is_available() {
        println!("Skipping test (GStreamer backend unavailable)");
        return false;
    }
    if gst::ElementFactory::find("x264enc").is_none() {
        println!("Skipping test (x264enc not installed)");
        return false;
    }
    true
}

/// Record `frames` frames of a solid test pattern as 320x240 H.264 in MP4.
fn record(dir: &Path, name: &str, frames: u32, pattern: &str) -> PathBuf {
    let path = dir.join(name);
    let description = format!(
        "videotestsrc num-buffers={frames} pattern={pattern} \
         ! video/x-raw,width=320,height=240,framerate=30/1 \
         ! x264enc ! mp4mux ! filesink location={}",
        path.display()
    );
    let pipeline = gst::parse::launch(&description)
        .unwrap()
        .downcast::<gst::Pipeline>()
        .unwrap();
    pipeline.set_state(gst::State::Playing).unwrap();
    let bus = pipeline.bus().unwrap();
    let msg = bus
        .timed_pop_filtered(
            gst::ClockTime::from_seconds(30),
            &[gst::MessageType::Eos, gst::MessageType::Error],
        )
        .expect("recording should finish");
    if let gst::MessageView::Error(err) = msg.view() {
        panic!("recording {name} failed: {}", err.error());
    }
    pipeline.set_state(gst::State::Null).unwrap();
    path
}

fn gpu() -> Arc<dyn GpuDevice> {
    if GlesGpu::is_available() {
        if let Ok(gpu) = GlesGpu::new() {
            return Arc::new(gpu);
        }
    }
    println!("No EGL display, compositing with the software device");
    Arc::new(SoftwareGpu::new())
}

#[test]
fn test_h264_inputs_merge_into_mp4() {
    if !gst_ready() {
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let front = record(dir.path(), "front.mp4", 45, "red");
    let back = record(dir.path(), "back.mp4", 30, "blue");

    let codecs = GstCodecFactory::new();
    let gpu = gpu();
    let pipeline = MergePipeline::with_settings(
        Arc::new(codecs.clone()),
        gpu.clone(),
        EncoderSettings::default(),
        PipelineSettings::default(),
    );
    let request = MergeRequest::new(front, back, dir.path().join("merged_output.mp4"));
    let artifact = pipeline
        .merge(&request, &CancelToken::new(), None)
        .expect("merge should succeed");

    assert_eq!((artifact.width, artifact.height), (1920, 1080));
    assert_eq!(artifact.frames, 30);
    assert!(artifact.bytes > 0);

    let mut extractor = codecs.create_extractor(&artifact.path).unwrap();
    assert_eq!(extractor.track_count(), 1);
    let format = extractor.track_format(0).unwrap();
    assert_eq!(format.mime, MIME_AVC);
    assert_eq!((format.width, format.height), (Some(1920), Some(1080)));

    extractor.select_track(0).unwrap();
    let mut buf = Vec::new();
    let mut samples = 0;
    while extractor.read_sample_data(&mut buf).unwrap().is_some() {
        samples += 1;
        if !extractor.advance() {
            break;
        }
    }
    assert_eq!(samples, 30);
    extractor.release();
    drop(extractor);

    assert_eq!(codecs.resources().total(), 0, "codec sessions leaked");
    assert!(gpu.object_counts().is_empty(), "GPU objects leaked");
}
