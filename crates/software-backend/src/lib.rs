//! DuoCam software backend.
//!
//! Runs the whole pipeline on the CPU: raw I420 video in Y4M files stands
//! in for compressed streams, and [`SoftwareGpu`] is a fake GPU device that
//! checks shader interfaces and draws the split-screen quad without running
//! shader code. Used by the test suites and on machines without a working
//! GStreamer or EGL install.

pub mod decoder;
pub mod encoder;
pub mod extractor;
pub mod factory;
pub mod gpu;
mod interface;
pub mod muxer;
pub mod y4m;
pub mod yuv;

pub use decoder::RawVideoDecoder;
pub use encoder::RawVideoEncoder;
pub use extractor::SoftwareExtractor;
pub use factory::SoftwareCodecFactory;
pub use gpu::SoftwareGpu;
pub use muxer::Y4mMuxer;
pub use y4m::{read_clip, write_clip, Y4mHeader, Y4mReader, Y4mWriter};

/// Lifecycle shared by the software decoder and encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CodecState {
    Uninitialized,
    Configured,
    Running,
    Stopped,
    Released,
}
