//! DuoCam merge engine.
//!
//! Combines a front-camera and a back-camera recording into one
//! side-by-side video: two decode sources feed external textures, a
//! shader program draws them into the left and right halves of a render
//! context, and that context presents straight into an encoder's input
//! surface.
//!
//! Codec and GPU access go through the `duocam-codec-core` traits, so the
//! same pipeline runs against GStreamer or the software backend.

pub mod compositor;
pub mod decode_source;
pub mod encode_sink;
pub mod merge;
pub mod publish;
pub mod render_context;
pub mod shader;

pub use compositor::{create_external_texture, Compositor, HalfPlacement, LEFT_HALF, RIGHT_HALF};
pub use decode_source::DecodeSource;
pub use encode_sink::{EncodeSink, SinkState, SinkStats};
pub use merge::{
    CancelToken, MergePipeline, MergeProgress, MergeRequest, MergeStage, OutputArtifact,
    ProgressCallback,
};
pub use publish::{
    merge_and_publish, ArtifactPublisher, LocalDirectoryPublisher, VideoRecord, WorkflowOutcome,
    METADATA_FILE,
};
pub use render_context::{Current, RenderContext};
pub use shader::{ShaderProgram, FRAGMENT_SHADER, VERTEX_SHADER};
