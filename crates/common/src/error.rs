//! Error types shared across DuoCam crates.

use std::path::PathBuf;

/// Top-level error type for DuoCam operations.
#[derive(Debug, thiserror::Error)]
pub enum DuocamError {
    #[error("File not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("No video track in {path}")]
    NoVideoTrack { path: PathBuf },

    #[error("Demux error: {message}")]
    Demux { message: String },

    #[error("Codec setup error: {message}")]
    CodecSetup { message: String },

    #[error("{stage} shader failed to compile: {log}")]
    ShaderCompile { stage: String, log: String },

    #[error("Shader program failed to link: {log}")]
    ProgramLink { log: String },

    #[error("Render context error: {message}")]
    ContextInit { message: String },

    #[error("GPU error: {message}")]
    Gpu { message: String },

    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("Muxer error: {message}")]
    Muxer { message: String },

    #[error("Encoder session failed: {message}")]
    EncoderSession { message: String },

    #[error("No frames were composited")]
    NoFramesComposited,

    #[error("Merge cancelled")]
    Cancelled,

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Unsupported operation: {message}")]
    Unsupported { message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias using DuocamError.
pub type DuocamResult<T> = Result<T, DuocamError>;

/// Coarse classification of a failure, used by callers that only need to
/// know which stage of a merge went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Inputs, shaders, or GPU/codec sessions could not be set up. Nothing
    /// usable was produced.
    Setup,
    /// A decoder, encoder, or muxer failed mid-pipeline.
    CodecRuntime,
    /// The caller asked the merge to stop.
    Cancelled,
    /// Host failures outside the pipeline (filesystem, serialization).
    Environment,
}

impl DuocamError {
    pub fn demux(msg: impl Into<String>) -> Self {
        Self::Demux {
            message: msg.into(),
        }
    }

    pub fn codec_setup(msg: impl Into<String>) -> Self {
        Self::CodecSetup {
            message: msg.into(),
        }
    }

    pub fn context_init(msg: impl Into<String>) -> Self {
        Self::ContextInit {
            message: msg.into(),
        }
    }

    pub fn gpu(msg: impl Into<String>) -> Self {
        Self::Gpu {
            message: msg.into(),
        }
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec {
            message: msg.into(),
        }
    }

    pub fn muxer(msg: impl Into<String>) -> Self {
        Self::Muxer {
            message: msg.into(),
        }
    }

    pub fn encoder_session(msg: impl Into<String>) -> Self {
        Self::EncoderSession {
            message: msg.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported {
            message: msg.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::FileNotFound { .. }
            | Self::NoVideoTrack { .. }
            | Self::Demux { .. }
            | Self::CodecSetup { .. }
            | Self::ShaderCompile { .. }
            | Self::ProgramLink { .. }
            | Self::ContextInit { .. }
            | Self::Config { .. }
            | Self::Unsupported { .. } => FailureKind::Setup,
            Self::Gpu { .. }
            | Self::Codec { .. }
            | Self::Muxer { .. }
            | Self::EncoderSession { .. }
            | Self::NoFramesComposited => FailureKind::CodecRuntime,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Io(_) | Self::Json(_) | Self::Other(_) => FailureKind::Environment,
        }
    }

    /// Short, user-facing description suitable for a pass/fail notification.
    pub fn user_message(&self) -> String {
        match self {
            Self::FileNotFound { path } => format!("Recording not found: {}", path.display()),
            Self::NoVideoTrack { path } => {
                format!("Recording has no video: {}", path.display())
            }
            Self::Cancelled => "Merge cancelled".to_string(),
            Self::NoFramesComposited => "Recordings contained no frames".to_string(),
            other => match other.kind() {
                FailureKind::Setup => format!("Could not prepare merge: {other}"),
                FailureKind::CodecRuntime => format!("Merge failed while encoding: {other}"),
                _ => other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_errors_classify_as_setup() {
        let missing = DuocamError::FileNotFound {
            path: PathBuf::from("/nope.mp4"),
        };
        assert_eq!(missing.kind(), FailureKind::Setup);
        assert_eq!(
            DuocamError::ShaderCompile {
                stage: "fragment".into(),
                log: "ERROR: 0:1: bad".into()
            }
            .kind(),
            FailureKind::Setup
        );
        assert_eq!(
            DuocamError::context_init("no display").kind(),
            FailureKind::Setup
        );
    }

    #[test]
    fn test_runtime_errors_classify_as_codec_runtime() {
        assert_eq!(DuocamError::muxer("boom").kind(), FailureKind::CodecRuntime);
        assert_eq!(
            DuocamError::encoder_session("released").kind(),
            FailureKind::CodecRuntime
        );
        assert_eq!(DuocamError::Cancelled.kind(), FailureKind::Cancelled);
    }

    #[test]
    fn test_io_is_environment() {
        let err: DuocamError = std::io::Error::other("disk full").into();
        assert_eq!(err.kind(), FailureKind::Environment);
    }

    #[test]
    fn test_user_message_mentions_path() {
        let err = DuocamError::NoVideoTrack {
            path: PathBuf::from("/tmp/front.mp4"),
        };
        assert!(err.user_message().contains("/tmp/front.mp4"));
        assert!(DuocamError::codec("decoder died")
            .user_message()
            .contains("decoder died"));
    }
}
