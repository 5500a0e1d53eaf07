//! DuoCam codec core contracts.
//!
//! Backend-neutral types shared by the merge engine and the codec/GPU
//! backends: track formats, the codec buffer protocol, decoded pictures,
//! producer/consumer surfaces, session accounting, and the codec and GPU
//! traits themselves.

pub mod buffer;
pub mod codec;
pub mod format;
pub mod frame;
pub mod gpu;
pub mod resources;
pub mod surface;

pub use buffer::{BufferFlags, BufferInfo, OutputEvent};
pub use codec::{CodecFactory, MediaExtractor, MediaMuxer, VideoDecoder, VideoEncoder};
pub use format::{ContainerFormat, MediaFormat, MIME_AAC, MIME_AVC, MIME_RAW_AUDIO, MIME_RAW_VIDEO};
pub use frame::VideoFrame;
pub use gpu::{
    ConfigAttribs, ConfigId, ContextId, DisplayId, GpuDevice, GpuObjectCounts, Primitive,
    ProgramId, ShaderId, ShaderStage, SurfaceId, TextureFilter, TextureId, TextureParam,
    TextureTarget, TextureWrap, UniformLocation,
};
pub use resources::{ResourceGuard, ResourceKind, ResourceLedger, ResourceSnapshot};
pub use surface::{Surface, SurfaceTexture, DEFAULT_SURFACE_CAPACITY};
