//! GPU device contract: an EGL-style display/context/surface lifecycle plus
//! the OpenGL ES 2.0 subset the compositor uses.
//!
//! Unlike GL, no call relies on an implicit current context. Every GL entry
//! point names the [`ContextId`] it targets, and implementations must fail
//! the call unless that context is current on the calling thread.

use std::fmt;

use duocam_common::DuocamResult;

use crate::surface::{Surface, SurfaceTexture};

macro_rules! gpu_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u32);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

gpu_handle!(DisplayId);
gpu_handle!(ConfigId);
gpu_handle!(ContextId);
gpu_handle!(
    /// EGL window surface bound to a [`Surface`].
    SurfaceId
);
gpu_handle!(TextureId);
gpu_handle!(ShaderId);
gpu_handle!(ProgramId);

/// Location of a uniform in a linked program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UniformLocation(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl fmt::Display for ShaderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vertex => write!(f, "vertex"),
            Self::Fragment => write!(f, "fragment"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureTarget {
    Texture2D,
    /// `GL_TEXTURE_EXTERNAL_OES`, fed by a [`SurfaceTexture`].
    ExternalOes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFilter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureWrap {
    ClampToEdge,
    Repeat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureParam {
    MinFilter(TextureFilter),
    MagFilter(TextureFilter),
    WrapS(TextureWrap),
    WrapT(TextureWrap),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    Triangles,
    TriangleStrip,
}

/// Requested framebuffer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigAttribs {
    pub red_bits: u8,
    pub green_bits: u8,
    pub blue_bits: u8,
    pub alpha_bits: u8,
    /// Client API version the config must support (2 for ES2).
    pub es_version: u32,
    /// Surfaces must be consumable by a video encoder.
    pub recordable: bool,
}

impl ConfigAttribs {
    /// 8-bit RGBA, ES2 renderable, recordable.
    pub fn rgba8888_es2() -> Self {
        Self {
            red_bits: 8,
            green_bits: 8,
            blue_bits: 8,
            alpha_bits: 8,
            es_version: 2,
            recordable: true,
        }
    }
}

/// Live object counts, for leak checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GpuObjectCounts {
    pub displays: usize,
    pub contexts: usize,
    pub surfaces: usize,
    pub textures: usize,
    pub shaders: usize,
    pub programs: usize,
}

impl GpuObjectCounts {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// A GPU the compositor can render with.
pub trait GpuDevice: Send + Sync {
    fn name(&self) -> &str;

    // Display and context lifecycle.

    fn get_display(&self) -> DuocamResult<DisplayId>;

    /// Returns the implementation's `(major, minor)` version.
    fn initialize(&self, display: DisplayId) -> DuocamResult<(u32, u32)>;

    fn choose_config(
        &self,
        display: DisplayId,
        attribs: &ConfigAttribs,
    ) -> DuocamResult<Option<ConfigId>>;

    fn create_context(
        &self,
        display: DisplayId,
        config: ConfigId,
        client_version: u32,
    ) -> DuocamResult<ContextId>;

    /// Window surface whose swaps queue frames onto `target`.
    fn create_window_surface(
        &self,
        display: DisplayId,
        config: ConfigId,
        target: &Surface,
    ) -> DuocamResult<SurfaceId>;

    /// Bind `context` and `surface` to the calling thread; `None` for both
    /// unbinds.
    fn make_current(
        &self,
        display: DisplayId,
        surface: Option<SurfaceId>,
        context: Option<ContextId>,
    ) -> DuocamResult<()>;

    fn current_context(&self) -> Option<ContextId>;

    fn swap_buffers(&self, display: DisplayId, surface: SurfaceId) -> DuocamResult<()>;

    /// Timestamp attached to the next swapped frame.
    fn set_presentation_time(
        &self,
        display: DisplayId,
        surface: SurfaceId,
        pts_us: i64,
    ) -> DuocamResult<()>;

    fn destroy_surface(&self, display: DisplayId, surface: SurfaceId) -> DuocamResult<()>;

    fn destroy_context(&self, display: DisplayId, context: ContextId) -> DuocamResult<()>;

    /// Drop any binding held by the calling thread.
    fn release_thread(&self) -> DuocamResult<()>;

    /// Destroy everything still owned by `display`.
    fn terminate(&self, display: DisplayId) -> DuocamResult<()>;

    // Textures.

    fn gen_texture(&self, ctx: ContextId) -> DuocamResult<TextureId>;

    fn delete_texture(&self, ctx: ContextId, texture: TextureId) -> DuocamResult<()>;

    fn active_texture(&self, ctx: ContextId, unit: u32) -> DuocamResult<()>;

    fn bind_texture(
        &self,
        ctx: ContextId,
        target: TextureTarget,
        texture: Option<TextureId>,
    ) -> DuocamResult<()>;

    fn tex_parameter(
        &self,
        ctx: ContextId,
        target: TextureTarget,
        param: TextureParam,
    ) -> DuocamResult<()>;

    /// Latch the newest picture of `source` into external texture
    /// `texture`. Returns its timestamp, or `None` if nothing new arrived.
    fn update_tex_image(
        &self,
        ctx: ContextId,
        texture: TextureId,
        source: &SurfaceTexture,
    ) -> DuocamResult<Option<i64>>;

    // Shaders and programs.

    fn create_shader(&self, ctx: ContextId, stage: ShaderStage) -> DuocamResult<ShaderId>;

    fn shader_source(&self, ctx: ContextId, shader: ShaderId, source: &str) -> DuocamResult<()>;

    /// Returns the compile status.
    fn compile_shader(&self, ctx: ContextId, shader: ShaderId) -> DuocamResult<bool>;

    fn shader_info_log(&self, ctx: ContextId, shader: ShaderId) -> DuocamResult<String>;

    fn delete_shader(&self, ctx: ContextId, shader: ShaderId) -> DuocamResult<()>;

    fn create_program(&self, ctx: ContextId) -> DuocamResult<ProgramId>;

    fn attach_shader(&self, ctx: ContextId, program: ProgramId, shader: ShaderId)
        -> DuocamResult<()>;

    /// Returns the link status.
    fn link_program(&self, ctx: ContextId, program: ProgramId) -> DuocamResult<bool>;

    fn program_info_log(&self, ctx: ContextId, program: ProgramId) -> DuocamResult<String>;

    fn delete_program(&self, ctx: ContextId, program: ProgramId) -> DuocamResult<()>;

    fn use_program(&self, ctx: ContextId, program: Option<ProgramId>) -> DuocamResult<()>;

    fn attrib_location(
        &self,
        ctx: ContextId,
        program: ProgramId,
        name: &str,
    ) -> DuocamResult<Option<u32>>;

    fn uniform_location(
        &self,
        ctx: ContextId,
        program: ProgramId,
        name: &str,
    ) -> DuocamResult<Option<UniformLocation>>;

    fn uniform1f(&self, ctx: ContextId, location: UniformLocation, value: f32)
        -> DuocamResult<()>;

    fn uniform1i(&self, ctx: ContextId, location: UniformLocation, value: i32)
        -> DuocamResult<()>;

    // Vertex input and drawing.

    /// Client-side, tightly packed float attribute array with `size`
    /// components per vertex.
    fn vertex_attrib_pointer(
        &self,
        ctx: ContextId,
        index: u32,
        size: u32,
        data: &[f32],
    ) -> DuocamResult<()>;

    fn enable_vertex_attrib_array(&self, ctx: ContextId, index: u32) -> DuocamResult<()>;

    fn disable_vertex_attrib_array(&self, ctx: ContextId, index: u32) -> DuocamResult<()>;

    fn viewport(&self, ctx: ContextId, x: i32, y: i32, width: u32, height: u32)
        -> DuocamResult<()>;

    fn clear_color(&self, ctx: ContextId, rgba: [f32; 4]) -> DuocamResult<()>;

    /// Clear the colour buffer of the surface bound with `ctx`.
    fn clear(&self, ctx: ContextId) -> DuocamResult<()>;

    fn draw_arrays(
        &self,
        ctx: ContextId,
        mode: Primitive,
        first: usize,
        count: usize,
    ) -> DuocamResult<()>;

    fn object_counts(&self) -> GpuObjectCounts;
}
