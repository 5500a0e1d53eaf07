//! DuoCam GPU backend: OpenGL ES 2.0 over EGL.
//!
//! `libEGL` is loaded at runtime, so hosts without a GPU stack can still run
//! the binary with the software device. On headless machines Mesa's
//! surfaceless platform works (`EGL_PLATFORM=surfaceless`).

mod device;
mod source;

pub use device::GlesGpu;
pub use source::adapt_fragment_source;
