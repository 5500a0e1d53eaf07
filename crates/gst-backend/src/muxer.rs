//! MP4 output: `appsrc ! mp4mux ! filesink`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use duocam_codec_core::{BufferFlags, BufferInfo, MediaFormat, MediaMuxer, ResourceGuard, MIME_AVC};
use duocam_common::{DuocamError, DuocamResult};
use gst::prelude::*;
use gstreamer as gst;
use gstreamer_app as gst_app;

use crate::caps::h264_caps;
use crate::{check_bus, drain_and_stop, init_gstreamer, make_element, pts_to_clock, shutdown};

const FINALIZE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Started,
    Stopped,
    Released,
}

#[derive(Debug)]
pub struct GstMuxer {
    path: PathBuf,
    state: State,
    track: Option<MediaFormat>,
    pipeline: Option<gst::Pipeline>,
    appsrc: Option<gst_app::AppSrc>,
    samples: u64,
    guard: ResourceGuard,
}

impl GstMuxer {
    pub fn create(path: &Path, guard: ResourceGuard) -> DuocamResult<Self> {
        init_gstreamer()?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        tracing::debug!(path = %path.display(), "Created MP4 muxer");
        Ok(Self {
            path: path.to_path_buf(),
            state: State::Created,
            track: None,
            pipeline: None,
            appsrc: None,
            samples: 0,
            guard,
        })
    }

    pub fn samples_written(&self) -> u64 {
        self.samples
    }

    fn build_pipeline(&self, format: &MediaFormat) -> DuocamResult<(gst::Pipeline, gst_app::AppSrc)> {
        let pipeline = gst::Pipeline::new();
        let appsrc = gst_app::AppSrc::builder()
            .name("src")
            .caps(&h264_caps(format))
            .format(gst::Format::Time)
            .is_live(false)
            .build();
        let mux = make_element("mp4mux")?;
        // Seekable output: write duration and index at the end.
        if mux.has_property("streamable") {
            mux.set_property("streamable", false);
        }
        let filesink = gst::ElementFactory::make("filesink")
            .property("location", self.path.to_string_lossy().as_ref())
            .build()
            .map_err(|e| DuocamError::muxer(format!("Failed to create filesink: {e}")))?;

        pipeline
            .add_many([appsrc.upcast_ref(), &mux, &filesink])
            .map_err(|e| DuocamError::muxer(format!("Failed to add elements: {e}")))?;
        gst::Element::link_many([appsrc.upcast_ref(), &mux, &filesink])
            .map_err(|e| DuocamError::muxer(format!("Failed to link src→mp4mux→filesink: {e}")))?;
        Ok((pipeline, appsrc))
    }
}

impl MediaMuxer for GstMuxer {
    fn add_track(&mut self, format: &MediaFormat) -> DuocamResult<usize> {
        if self.state != State::Created {
            return Err(DuocamError::muxer(format!("add_track while {:?}", self.state)));
        }
        if self.track.is_some() {
            return Err(DuocamError::muxer("MP4 muxer takes a single video track"));
        }
        if format.mime != MIME_AVC {
            return Err(DuocamError::muxer(format!(
                "MP4 muxer cannot store {}",
                format.mime
            )));
        }
        self.track = Some(format.clone());
        Ok(0)
    }

    fn start(&mut self) -> DuocamResult<()> {
        if self.state != State::Created {
            return Err(DuocamError::muxer(format!("start while {:?}", self.state)));
        }
        let format = self
            .track
            .clone()
            .ok_or_else(|| DuocamError::muxer("start without a track"))?;
        let (pipeline, appsrc) = self.build_pipeline(&format)?;
        if let Err(e) = pipeline.set_state(gst::State::Playing) {
            shutdown(&pipeline, "muxer");
            return Err(DuocamError::muxer(format!("Failed to start muxer pipeline: {e:?}")));
        }
        self.pipeline = Some(pipeline);
        self.appsrc = Some(appsrc);
        self.state = State::Started;
        tracing::debug!(path = %self.path.display(), "MP4 muxer started");
        Ok(())
    }

    fn write_sample_data(
        &mut self,
        track: usize,
        data: &[u8],
        info: &BufferInfo,
    ) -> DuocamResult<()> {
        if self.state != State::Started {
            return Err(DuocamError::muxer(format!("write while {:?}", self.state)));
        }
        if track != 0 {
            return Err(DuocamError::muxer(format!("no track {track}")));
        }
        // avcC already travels in the track caps.
        if info.is_codec_config() {
            return Ok(());
        }
        let payload = data
            .get(info.offset..info.offset + info.size)
            .ok_or_else(|| {
                DuocamError::muxer(format!(
                    "sample range {}+{} exceeds {} bytes",
                    info.offset,
                    info.size,
                    data.len()
                ))
            })?;
        let (Some(pipeline), Some(appsrc)) = (&self.pipeline, &self.appsrc) else {
            return Err(DuocamError::muxer("muxer pipeline missing"));
        };
        check_bus(pipeline, "muxer")?;
        let mut buffer = gst::Buffer::from_slice(payload.to_vec());
        if let Some(b) = buffer.get_mut() {
            let pts = pts_to_clock(info.presentation_time_us);
            b.set_pts(pts);
            b.set_dts(pts);
            if !info.flags.contains(BufferFlags::KEY_FRAME) {
                b.set_flags(gst::BufferFlags::DELTA_UNIT);
            }
        }
        appsrc
            .push_buffer(buffer)
            .map_err(|e| DuocamError::muxer(format!("Failed to push sample: {e:?}")))?;
        self.samples += 1;
        Ok(())
    }

    fn stop(&mut self) -> DuocamResult<()> {
        if self.state != State::Started {
            return Err(DuocamError::muxer(format!("stop while {:?}", self.state)));
        }
        self.state = State::Stopped;
        let (Some(pipeline), Some(appsrc)) = (self.pipeline.take(), self.appsrc.take()) else {
            return Err(DuocamError::muxer("muxer pipeline missing"));
        };
        if let Err(e) = appsrc.end_of_stream() {
            shutdown(&pipeline, "muxer");
            return Err(DuocamError::muxer(format!("Failed to send EOS: {e:?}")));
        }
        drain_and_stop(&pipeline, "muxer", FINALIZE_TIMEOUT)?;
        tracing::info!(
            path = %self.path.display(),
            samples = self.samples,
            "MP4 finalized"
        );
        Ok(())
    }

    fn release(&mut self) {
        if self.state == State::Released {
            return;
        }
        self.state = State::Released;
        if let Some(pipeline) = self.pipeline.take() {
            shutdown(&pipeline, "muxer");
        }
        self.appsrc = None;
        self.guard.release();
    }
}

impl Drop for GstMuxer {
    fn drop(&mut self) {
        self.release();
    }
}
