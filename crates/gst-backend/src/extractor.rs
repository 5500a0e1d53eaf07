//! MP4 demuxing: `filesrc ! qtdemux`, one `appsink` per elementary stream.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use duocam_codec_core::{
    BufferFlags, MediaExtractor, MediaFormat, ResourceGuard, ResourceKind, ResourceLedger,
};
use duocam_common::{DuocamError, DuocamResult};
use gst::prelude::*;
use gstreamer as gst;
use gstreamer_app as gst_app;

use crate::caps::format_from_caps;
use crate::{check_bus, clock_time, init_gstreamer, make_element, shutdown};

const PREROLL_TIMEOUT: Duration = Duration::from_secs(10);
const PULL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct Stream {
    format: MediaFormat,
    sink: gst_app::AppSink,
}

#[derive(Debug)]
struct CurrentSample {
    data: Vec<u8>,
    pts_us: Option<i64>,
    flags: BufferFlags,
}

/// Pull-based demuxer over a GStreamer pipeline.
#[derive(Debug)]
pub struct GstExtractor {
    name: String,
    pipeline: Option<gst::Pipeline>,
    streams: Vec<Stream>,
    selected: Option<usize>,
    current: Option<CurrentSample>,
    guard: ResourceGuard,
}

impl GstExtractor {
    pub fn open(path: &Path, ledger: &ResourceLedger) -> DuocamResult<Self> {
        if !path.is_file() {
            return Err(DuocamError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        init_gstreamer()?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "extractor".to_string());

        let pipeline = gst::Pipeline::new();
        let src = gst::ElementFactory::make("filesrc")
            .property("location", path.to_string_lossy().as_ref())
            .build()
            .map_err(|e| DuocamError::demux(format!("Failed to create filesrc: {e}")))?;
        let demux = make_element("qtdemux")?;
        pipeline
            .add_many([&src, &demux])
            .map_err(|e| DuocamError::demux(format!("Failed to add elements: {e}")))?;
        src.link(&demux)
            .map_err(|e| DuocamError::demux(format!("Failed to link filesrc→qtdemux: {e}")))?;

        let streams: Arc<Mutex<Vec<Stream>>> = Arc::new(Mutex::new(Vec::new()));
        let pipeline_weak = pipeline.downgrade();
        let found = Arc::clone(&streams);
        demux.connect_pad_added(move |_demux, src_pad| {
            let Some(pipeline) = pipeline_weak.upgrade() else {
                return;
            };
            let Some(format) = src_pad.current_caps().and_then(|c| format_from_caps(&c)) else {
                return;
            };
            let queue = match gst::ElementFactory::make("queue").build() {
                Ok(q) => q,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create queue for demuxed stream");
                    return;
                }
            };
            // Unselected streams must not stall the demuxer.
            let sink = gst_app::AppSink::builder()
                .sync(false)
                .max_buffers(1)
                .drop(true)
                .build();
            if pipeline.add_many([&queue, sink.upcast_ref()]).is_err() {
                return;
            }
            let linked = gst::Element::link_many([&queue, sink.upcast_ref()]).is_ok()
                && queue
                    .static_pad("sink")
                    .map(|pad| src_pad.link(&pad).is_ok())
                    .unwrap_or(false);
            if !linked {
                tracing::error!(pad = %src_pad.name(), "Failed to link demuxed stream");
                return;
            }
            let _ = queue.sync_state_with_parent();
            let _ = sink.sync_state_with_parent();
            tracing::debug!(mime = %format.mime, pad = %src_pad.name(), "Demuxed stream found");
            if let Ok(mut streams) = found.lock() {
                streams.push(Stream { format, sink });
            }
        });

        pipeline
            .set_state(gst::State::Paused)
            .map_err(|e| DuocamError::demux(format!("{name}: failed to preroll: {e:?}")))?;
        let prerolled = pipeline.bus().and_then(|bus| {
            bus.timed_pop_filtered(
                clock_time(PREROLL_TIMEOUT),
                &[gst::MessageType::AsyncDone, gst::MessageType::Error],
            )
        });
        match prerolled.as_ref().map(|m| m.view()) {
            Some(gst::MessageView::AsyncDone(_)) => {}
            Some(gst::MessageView::Error(err)) => {
                shutdown(&pipeline, &name);
                return Err(DuocamError::demux(format!("{name}: {}", err.error())));
            }
            _ => {
                shutdown(&pipeline, &name);
                return Err(DuocamError::demux(format!("{name}: preroll timed out")));
            }
        }

        let duration_us = pipeline
            .query_duration::<gst::ClockTime>()
            .map(|d| d.useconds() as i64);
        let mut streams = streams
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default();
        for stream in &mut streams {
            if let Some(duration) = duration_us {
                stream.format.duration_us.get_or_insert(duration);
            }
        }

        tracing::debug!(%name, tracks = streams.len(), "Opened MP4 extractor");
        Ok(Self {
            name,
            pipeline: Some(pipeline),
            streams,
            selected: None,
            current: None,
            guard: ledger.acquire(ResourceKind::Extractor),
        })
    }

    fn pull(&mut self) -> DuocamResult<()> {
        self.current = None;
        let (Some(index), Some(pipeline)) = (self.selected, &self.pipeline) else {
            return Ok(());
        };
        let sink = &self.streams[index].sink;
        let Some(sample) = sink.try_pull_sample(clock_time(PULL_TIMEOUT)) else {
            check_bus(pipeline, &self.name)?;
            if !sink.is_eos() {
                tracing::warn!(name = %self.name, "No sample within timeout; treating as end of track");
            }
            return Ok(());
        };
        let Some(buffer) = sample.buffer() else {
            return Ok(());
        };
        let map = buffer
            .map_readable()
            .map_err(|e| DuocamError::demux(format!("Failed to map sample: {e}")))?;
        let flags = if buffer.flags().contains(gst::BufferFlags::DELTA_UNIT) {
            BufferFlags::NONE
        } else {
            BufferFlags::KEY_FRAME
        };
        self.current = Some(CurrentSample {
            data: map.as_slice().to_vec(),
            pts_us: buffer.pts().map(|t| t.useconds() as i64),
            flags,
        });
        Ok(())
    }
}

impl MediaExtractor for GstExtractor {
    fn track_count(&self) -> usize {
        self.streams.len()
    }

    fn track_format(&self, index: usize) -> DuocamResult<MediaFormat> {
        self.streams
            .get(index)
            .map(|s| s.format.clone())
            .ok_or_else(|| DuocamError::demux(format!("no track {index}")))
    }

    fn select_track(&mut self, index: usize) -> DuocamResult<()> {
        let stream = self
            .streams
            .get(index)
            .ok_or_else(|| DuocamError::demux(format!("no track {index}")))?;
        stream.sink.set_drop(false);
        stream.sink.set_max_buffers(8);
        self.selected = Some(index);
        if let Some(pipeline) = &self.pipeline {
            pipeline.set_state(gst::State::Playing).map_err(|e| {
                DuocamError::demux(format!("{}: failed to start demuxing: {e:?}", self.name))
            })?;
        }
        self.pull()
    }

    fn read_sample_data(&mut self, buf: &mut Vec<u8>) -> DuocamResult<Option<usize>> {
        if self.selected.is_none() {
            return Err(DuocamError::demux("no track selected"));
        }
        let Some(current) = &self.current else {
            return Ok(None);
        };
        buf.clear();
        buf.extend_from_slice(&current.data);
        Ok(Some(buf.len()))
    }

    fn sample_time_us(&self) -> Option<i64> {
        self.current.as_ref().and_then(|c| c.pts_us)
    }

    fn sample_flags(&self) -> BufferFlags {
        self.current
            .as_ref()
            .map_or(BufferFlags::NONE, |c| c.flags)
    }

    fn advance(&mut self) -> bool {
        if let Err(e) = self.pull() {
            tracing::warn!(name = %self.name, error = %e, "Demuxer failed while advancing");
        }
        self.current.is_some()
    }

    fn release(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            shutdown(&pipeline, &self.name);
        }
        self.current = None;
        self.guard.release();
    }
}

impl Drop for GstExtractor {
    fn drop(&mut self) {
        self.release();
    }
}
