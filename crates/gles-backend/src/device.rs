//! [`GpuDevice`] on a real OpenGL ES 2.0 driver.
//!
//! Window surfaces are pbuffers sized to their target [`Surface`]. A swap
//! reads the pbuffer back and queues it onto the target, top row first.
//! Textures of either target are GL 2D textures filled by
//! `update_tex_image`.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Mutex, MutexGuard};

use duocam_codec_core::{
    ConfigAttribs, ConfigId, ContextId, DisplayId, GpuDevice, GpuObjectCounts, Primitive,
    ProgramId, ShaderId, ShaderStage, Surface, SurfaceId, SurfaceTexture, TextureFilter,
    TextureId, TextureParam, TextureTarget, TextureWrap, UniformLocation, VideoFrame,
};
use duocam_common::{DuocamError, DuocamResult};
use glow::HasContext;
use khronos_egl as egl;

use crate::source::adapt_fragment_source;

type Egl = egl::DynamicInstance<egl::EGL1_4>;

/// Initialized displays and how many devices use each. EGL displays are
/// process-wide, so only the last user may terminate one.
static DISPLAY_USERS: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());

fn display_users() -> MutexGuard<'static, Vec<(usize, usize)>> {
    DISPLAY_USERS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn retain_display(raw: egl::Display) {
    let key = raw.as_ptr() as usize;
    let mut users = display_users();
    match users.iter_mut().find(|(k, _)| *k == key) {
        Some((_, count)) => *count += 1,
        None => users.push((key, 1)),
    }
}

/// Returns true when the caller was the last user.
fn release_display(raw: egl::Display) -> bool {
    let key = raw.as_ptr() as usize;
    let mut users = display_users();
    let Some(pos) = users.iter().position(|(k, _)| *k == key) else {
        return false;
    };
    users[pos].1 -= 1;
    if users[pos].1 == 0 {
        users.swap_remove(pos);
        true
    } else {
        false
    }
}

fn egl_failed(what: &'static str) -> impl FnOnce(egl::Error) -> DuocamError {
    move |e| DuocamError::gpu(format!("{what} failed: {e}"))
}

fn gl_error(gl: &glow::Context) -> DuocamResult<()> {
    match unsafe { gl.get_error() } {
        glow::NO_ERROR => Ok(()),
        code => Err(DuocamError::gpu(format!("GL error 0x{code:04x}"))),
    }
}

fn gl_target(target: TextureTarget) -> u32 {
    match target {
        TextureTarget::Texture2D | TextureTarget::ExternalOes => glow::TEXTURE_2D,
    }
}

fn gl_filter(filter: TextureFilter) -> i32 {
    match filter {
        TextureFilter::Nearest => glow::NEAREST as i32,
        TextureFilter::Linear => glow::LINEAR as i32,
    }
}

fn gl_wrap(wrap: TextureWrap) -> i32 {
    match wrap {
        TextureWrap::ClampToEdge => glow::CLAMP_TO_EDGE as i32,
        TextureWrap::Repeat => glow::REPEAT as i32,
    }
}

struct DisplayState {
    raw: egl::Display,
    initialized: bool,
    configs: HashMap<ConfigId, egl::Config>,
}

struct WindowSurface {
    display: DisplayId,
    raw: egl::Surface,
    target: Surface,
    pending_pts_us: Option<i64>,
    last_pts_us: i64,
}

struct Texture {
    raw: glow::NativeTexture,
    size: Option<(u32, u32)>,
}

/// GL objects owned by one context.
#[derive(Default)]
struct GlObjects {
    textures: HashMap<TextureId, Texture>,
    shaders: HashMap<ShaderId, (glow::NativeShader, ShaderStage)>,
    programs: HashMap<ProgramId, glow::NativeProgram>,
    attrib_buffers: HashMap<u32, glow::NativeBuffer>,
    active_unit: u32,
    bound: HashMap<u32, TextureId>,
}

impl GlObjects {
    fn texture(&self, id: TextureId) -> DuocamResult<&Texture> {
        self.textures
            .get(&id)
            .ok_or_else(|| DuocamError::gpu(format!("{id:?} does not exist")))
    }

    fn shader(&self, id: ShaderId) -> DuocamResult<(glow::NativeShader, ShaderStage)> {
        self.shaders
            .get(&id)
            .copied()
            .ok_or_else(|| DuocamError::gpu(format!("{id:?} does not exist")))
    }

    fn program(&self, id: ProgramId) -> DuocamResult<glow::NativeProgram> {
        self.programs
            .get(&id)
            .copied()
            .ok_or_else(|| DuocamError::gpu(format!("{id:?} does not exist")))
    }
}

struct ContextState {
    display: DisplayId,
    raw: egl::Context,
    /// Loaded the first time the context is made current.
    gl: Option<glow::Context>,
    objects: GlObjects,
}

#[derive(Default)]
struct GpuState {
    next_id: u32,
    displays: HashMap<DisplayId, DisplayState>,
    contexts: HashMap<ContextId, ContextState>,
    surfaces: HashMap<SurfaceId, WindowSurface>,
}

impl GpuState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn initialized(&mut self, display: DisplayId) -> DuocamResult<&mut DisplayState> {
        match self.displays.get_mut(&display) {
            Some(d) if d.initialized => Ok(d),
            Some(_) => Err(DuocamError::gpu(format!("{display:?} is not initialized"))),
            None => Err(DuocamError::gpu(format!("{display:?} does not exist"))),
        }
    }

    fn config(
        &mut self,
        display: DisplayId,
        config: ConfigId,
    ) -> DuocamResult<(egl::Display, egl::Config)> {
        let d = self.initialized(display)?;
        let raw = d
            .configs
            .get(&config)
            .copied()
            .ok_or_else(|| DuocamError::gpu(format!("{config:?} is not a valid config")))?;
        Ok((d.raw, raw))
    }
}

/// OpenGL ES 2.0 device driven through a dynamically loaded `libEGL`.
pub struct GlesGpu {
    egl: Egl,
    state: Mutex<GpuState>,
}

// SAFETY: EGL entry points may be called from any thread, and every EGL and
// GL handle is only touched with `state` locked. GL calls additionally check
// that their context is current on the calling thread.
unsafe impl Send for GlesGpu {}
unsafe impl Sync for GlesGpu {}

impl std::fmt::Debug for GlesGpu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlesGpu")
            .field("objects", &self.object_counts())
            .finish_non_exhaustive()
    }
}

impl GlesGpu {
    /// Load `libEGL`. Fails on hosts without one.
    pub fn new() -> DuocamResult<Self> {
        // SAFETY: the loaded library is kept alive by `egl` for the device's
        // lifetime and only EGL 1.4 entry points are resolved from it.
        let egl = unsafe { Egl::load_required() }
            .map_err(|e| DuocamError::unsupported(format!("Failed to load libEGL: {e}")))?;
        Ok(Self {
            egl,
            state: Mutex::new(GpuState::default()),
        })
    }

    /// Whether a display can be opened and initialized on this host.
    pub fn is_available() -> bool {
        let Ok(gpu) = Self::new() else {
            return false;
        };
        let Ok(display) = gpu.get_display() else {
            return false;
        };
        let usable = gpu.initialize(display).is_ok();
        if usable {
            let _ = gpu.terminate(display);
        }
        usable
    }

    fn lock(&self) -> MutexGuard<'_, GpuState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_current(&self, raw: egl::Context) -> bool {
        self.egl.get_current_context().map(|c| c.as_ptr()) == Some(raw.as_ptr())
    }

    /// Run `f` against `ctx`'s GL functions, which must be current on the
    /// calling thread. Any GL error raised by `f` fails the call.
    fn with_gl<T>(
        &self,
        ctx: ContextId,
        f: impl FnOnce(&glow::Context, &mut GlObjects) -> DuocamResult<T>,
    ) -> DuocamResult<T> {
        let mut state = self.lock();
        let context = state
            .contexts
            .get_mut(&ctx)
            .ok_or_else(|| DuocamError::gpu(format!("{ctx:?} does not exist")))?;
        if !self.is_current(context.raw) {
            return Err(DuocamError::gpu(format!("{ctx:?} is not current on this thread")));
        }
        let gl = context
            .gl
            .as_ref()
            .ok_or_else(|| DuocamError::gpu(format!("{ctx:?} has no GL functions loaded")))?;
        let value = f(gl, &mut context.objects)?;
        gl_error(gl)?;
        Ok(value)
    }
}

impl GpuDevice for GlesGpu {
    fn name(&self) -> &str {
        "egl-gles2"
    }

    fn get_display(&self) -> DuocamResult<DisplayId> {
        let raw = unsafe { self.egl.get_display(egl::DEFAULT_DISPLAY) }
            .ok_or_else(|| DuocamError::gpu("no EGL display available"))?;
        let mut state = self.lock();
        if let Some((&id, _)) = state
            .displays
            .iter()
            .find(|(_, d)| d.raw.as_ptr() == raw.as_ptr())
        {
            return Ok(id);
        }
        let id = DisplayId(state.next_id());
        state.displays.insert(
            id,
            DisplayState {
                raw,
                initialized: false,
                configs: HashMap::new(),
            },
        );
        Ok(id)
    }

    fn initialize(&self, display: DisplayId) -> DuocamResult<(u32, u32)> {
        let mut state = self.lock();
        let d = state
            .displays
            .get_mut(&display)
            .ok_or_else(|| DuocamError::gpu(format!("{display:?} does not exist")))?;
        let (major, minor) = self
            .egl
            .initialize(d.raw)
            .map_err(egl_failed("eglInitialize"))?;
        if !d.initialized {
            d.initialized = true;
            retain_display(d.raw);
        }
        self.egl
            .bind_api(egl::OPENGL_ES_API)
            .map_err(egl_failed("eglBindAPI"))?;
        Ok((major as u32, minor as u32))
    }

    fn choose_config(
        &self,
        display: DisplayId,
        attribs: &ConfigAttribs,
    ) -> DuocamResult<Option<ConfigId>> {
        let mut state = self.lock();
        let id = ConfigId(state.next_id());
        let d = state.initialized(display)?;
        let renderable = if attribs.es_version >= 2 {
            egl::OPENGL_ES2_BIT
        } else {
            egl::OPENGL_ES_BIT
        };
        let list = [
            egl::RED_SIZE,
            attribs.red_bits as egl::Int,
            egl::GREEN_SIZE,
            attribs.green_bits as egl::Int,
            egl::BLUE_SIZE,
            attribs.blue_bits as egl::Int,
            egl::ALPHA_SIZE,
            attribs.alpha_bits as egl::Int,
            egl::SURFACE_TYPE,
            egl::PBUFFER_BIT,
            egl::RENDERABLE_TYPE,
            renderable,
            egl::NONE,
        ];
        // Swaps read pixels back, so any pbuffer config can feed an encoder.
        let Some(config) = self
            .egl
            .choose_first_config(d.raw, &list)
            .map_err(egl_failed("eglChooseConfig"))?
        else {
            return Ok(None);
        };
        d.configs.insert(id, config);
        Ok(Some(id))
    }

    fn create_context(
        &self,
        display: DisplayId,
        config: ConfigId,
        client_version: u32,
    ) -> DuocamResult<ContextId> {
        let mut state = self.lock();
        let (raw_display, raw_config) = state.config(display, config)?;
        self.egl
            .bind_api(egl::OPENGL_ES_API)
            .map_err(egl_failed("eglBindAPI"))?;
        let raw = self
            .egl
            .create_context(
                raw_display,
                raw_config,
                None,
                &[egl::CONTEXT_CLIENT_VERSION, client_version as egl::Int, egl::NONE],
            )
            .map_err(egl_failed("eglCreateContext"))?;
        let id = ContextId(state.next_id());
        state.contexts.insert(
            id,
            ContextState {
                display,
                raw,
                gl: None,
                objects: GlObjects::default(),
            },
        );
        tracing::trace!(?id, "created GL context");
        Ok(id)
    }

    fn create_window_surface(
        &self,
        display: DisplayId,
        config: ConfigId,
        target: &Surface,
    ) -> DuocamResult<SurfaceId> {
        if target.is_released() {
            return Err(DuocamError::gpu("target surface has been released"));
        }
        let (width, height) = target.size();
        if width == 0 || height == 0 {
            return Err(DuocamError::gpu(format!(
                "cannot render into a {width}x{height} surface"
            )));
        }
        let mut state = self.lock();
        let (raw_display, raw_config) = state.config(display, config)?;
        let raw = self
            .egl
            .create_pbuffer_surface(
                raw_display,
                raw_config,
                &[
                    egl::WIDTH,
                    width as egl::Int,
                    egl::HEIGHT,
                    height as egl::Int,
                    egl::NONE,
                ],
            )
            .map_err(egl_failed("eglCreatePbufferSurface"))?;
        let id = SurfaceId(state.next_id());
        state.surfaces.insert(
            id,
            WindowSurface {
                display,
                raw,
                target: target.clone(),
                pending_pts_us: None,
                last_pts_us: 0,
            },
        );
        Ok(id)
    }

    fn make_current(
        &self,
        display: DisplayId,
        surface: Option<SurfaceId>,
        context: Option<ContextId>,
    ) -> DuocamResult<()> {
        let mut state = self.lock();
        let raw_display = state.initialized(display)?.raw;
        let Some(context) = context else {
            if surface.is_some() {
                return Err(DuocamError::gpu("surface given without a context"));
            }
            return self
                .egl
                .make_current(raw_display, None, None, None)
                .map_err(egl_failed("eglMakeCurrent"));
        };

        let raw_surface = match surface {
            Some(id) => match state.surfaces.get(&id) {
                Some(w) if w.display == display => Some(w.raw),
                _ => {
                    return Err(DuocamError::gpu(format!(
                        "{id:?} is not a surface of {display:?}"
                    )))
                }
            },
            None => None,
        };
        let ctx = match state.contexts.get_mut(&context) {
            Some(c) if c.display == display => c,
            _ => {
                return Err(DuocamError::gpu(format!(
                    "{context:?} is not a context of {display:?}"
                )))
            }
        };
        self.egl
            .make_current(raw_display, raw_surface, raw_surface, Some(ctx.raw))
            .map_err(egl_failed("eglMakeCurrent"))?;

        if ctx.gl.is_none() {
            let egl = &self.egl;
            let gl = unsafe {
                glow::Context::from_loader_function(|name| {
                    egl.get_proc_address(name)
                        .map_or(std::ptr::null(), |f| f as *const c_void)
                })
            };
            tracing::debug!(version = ?gl.version(), "GL functions loaded");
            ctx.gl = Some(gl);
        }
        Ok(())
    }

    fn current_context(&self) -> Option<ContextId> {
        let raw = self.egl.get_current_context()?;
        self.lock()
            .contexts
            .iter()
            .find(|(_, c)| c.raw.as_ptr() == raw.as_ptr())
            .map(|(&id, _)| id)
    }

    fn swap_buffers(&self, display: DisplayId, surface: SurfaceId) -> DuocamResult<()> {
        let mut state = self.lock();
        let GpuState {
            displays,
            contexts,
            surfaces,
            ..
        } = &mut *state;
        let window = match surfaces.get_mut(&surface) {
            Some(w) if w.display == display => w,
            _ => return Err(DuocamError::gpu(format!("{surface:?} does not exist"))),
        };
        let drawing = self.egl.get_current_surface(egl::DRAW).map(|s| s.as_ptr());
        if drawing != Some(window.raw.as_ptr()) {
            return Err(DuocamError::gpu(format!(
                "{surface:?} is not current on this thread"
            )));
        }
        let gl = self
            .egl
            .get_current_context()
            .and_then(|raw| contexts.values().find(|c| c.raw.as_ptr() == raw.as_ptr()))
            .and_then(|c| c.gl.as_ref())
            .ok_or_else(|| DuocamError::gpu("no GL context is current"))?;

        let (width, height) = window.target.size();
        let mut pixels = vec![0u8; VideoFrame::byte_len(width, height)];
        unsafe {
            gl.pixel_store_i32(glow::PACK_ALIGNMENT, 1);
            gl.read_pixels(
                0,
                0,
                width as i32,
                height as i32,
                glow::RGBA,
                glow::UNSIGNED_BYTE,
                glow::PixelPackData::Slice(&mut pixels),
            );
        }
        gl_error(gl)?;
        if let Some(d) = displays.get(&display) {
            self.egl
                .swap_buffers(d.raw, window.raw)
                .map_err(egl_failed("eglSwapBuffers"))?;
        }

        // GL rows run bottom to top.
        let stride = width as usize * 4;
        let top_down: Vec<u8> = pixels
            .chunks_exact(stride)
            .rev()
            .flatten()
            .copied()
            .collect();
        let pts_us = window.pending_pts_us.take().unwrap_or(window.last_pts_us);
        window.last_pts_us = pts_us;
        window
            .target
            .queue_frame(VideoFrame::new(width, height, pts_us, top_down)?)
    }

    fn set_presentation_time(
        &self,
        display: DisplayId,
        surface: SurfaceId,
        pts_us: i64,
    ) -> DuocamResult<()> {
        match self.lock().surfaces.get_mut(&surface) {
            Some(window) if window.display == display => {
                window.pending_pts_us = Some(pts_us);
                Ok(())
            }
            _ => Err(DuocamError::gpu(format!("{surface:?} does not exist"))),
        }
    }

    fn destroy_surface(&self, display: DisplayId, surface: SurfaceId) -> DuocamResult<()> {
        let mut state = self.lock();
        let raw = match state.surfaces.get(&surface) {
            Some(w) if w.display == display => w.raw,
            _ => return Err(DuocamError::gpu(format!("{surface:?} does not exist"))),
        };
        let raw_display = state.initialized(display)?.raw;
        self.egl
            .destroy_surface(raw_display, raw)
            .map_err(egl_failed("eglDestroySurface"))?;
        state.surfaces.remove(&surface);
        Ok(())
    }

    fn destroy_context(&self, display: DisplayId, context: ContextId) -> DuocamResult<()> {
        let mut state = self.lock();
        let raw = match state.contexts.get(&context) {
            Some(c) if c.display == display => c.raw,
            _ => return Err(DuocamError::gpu(format!("{context:?} does not exist"))),
        };
        let raw_display = state.initialized(display)?.raw;
        self.egl
            .destroy_context(raw_display, raw)
            .map_err(egl_failed("eglDestroyContext"))?;
        state.contexts.remove(&context);
        Ok(())
    }

    fn release_thread(&self) -> DuocamResult<()> {
        self.egl
            .release_thread()
            .map_err(egl_failed("eglReleaseThread"))
    }

    fn terminate(&self, display: DisplayId) -> DuocamResult<()> {
        let mut state = self.lock();
        let raw_display = state.initialized(display)?.raw;

        // Objects the caller did not destroy would outlive this device when
        // another user keeps the display alive.
        let surfaces: Vec<_> = state
            .surfaces
            .iter()
            .filter(|(_, s)| s.display == display)
            .map(|(&id, s)| (id, s.raw))
            .collect();
        for (id, raw) in surfaces {
            if let Err(e) = self.egl.destroy_surface(raw_display, raw) {
                tracing::warn!(?id, error = %e, "Failed to destroy surface at terminate");
            }
            state.surfaces.remove(&id);
        }
        let contexts: Vec<_> = state
            .contexts
            .iter()
            .filter(|(_, c)| c.display == display)
            .map(|(&id, c)| (id, c.raw))
            .collect();
        for (id, raw) in contexts {
            if let Err(e) = self.egl.destroy_context(raw_display, raw) {
                tracing::warn!(?id, error = %e, "Failed to destroy context at terminate");
            }
            state.contexts.remove(&id);
        }

        if let Some(d) = state.displays.get_mut(&display) {
            d.initialized = false;
            d.configs.clear();
        }
        if release_display(raw_display) {
            self.egl
                .terminate(raw_display)
                .map_err(egl_failed("eglTerminate"))?;
        }
        Ok(())
    }

    fn gen_texture(&self, ctx: ContextId) -> DuocamResult<TextureId> {
        let id = TextureId(self.lock().next_id());
        self.with_gl(ctx, |gl, objects| {
            let raw = unsafe { gl.create_texture() }.map_err(DuocamError::gpu)?;
            objects.textures.insert(id, Texture { raw, size: None });
            Ok(id)
        })
    }

    fn delete_texture(&self, ctx: ContextId, texture: TextureId) -> DuocamResult<()> {
        self.with_gl(ctx, |gl, objects| {
            if let Some(t) = objects.textures.remove(&texture) {
                unsafe { gl.delete_texture(t.raw) };
            }
            objects.bound.retain(|_, id| *id != texture);
            Ok(())
        })
    }

    fn active_texture(&self, ctx: ContextId, unit: u32) -> DuocamResult<()> {
        self.with_gl(ctx, |gl, objects| {
            unsafe { gl.active_texture(glow::TEXTURE0 + unit) };
            objects.active_unit = unit;
            Ok(())
        })
    }

    fn bind_texture(
        &self,
        ctx: ContextId,
        target: TextureTarget,
        texture: Option<TextureId>,
    ) -> DuocamResult<()> {
        self.with_gl(ctx, |gl, objects| {
            let raw = texture.map(|id| objects.texture(id).map(|t| t.raw)).transpose()?;
            unsafe { gl.bind_texture(gl_target(target), raw) };
            let unit = objects.active_unit;
            match texture {
                Some(id) => objects.bound.insert(unit, id),
                None => objects.bound.remove(&unit),
            };
            Ok(())
        })
    }

    fn tex_parameter(
        &self,
        ctx: ContextId,
        target: TextureTarget,
        param: TextureParam,
    ) -> DuocamResult<()> {
        let (name, value) = match param {
            TextureParam::MinFilter(f) => (glow::TEXTURE_MIN_FILTER, gl_filter(f)),
            TextureParam::MagFilter(f) => (glow::TEXTURE_MAG_FILTER, gl_filter(f)),
            TextureParam::WrapS(w) => (glow::TEXTURE_WRAP_S, gl_wrap(w)),
            TextureParam::WrapT(w) => (glow::TEXTURE_WRAP_T, gl_wrap(w)),
        };
        self.with_gl(ctx, |gl, _| {
            unsafe { gl.tex_parameter_i32(gl_target(target), name, value) };
            Ok(())
        })
    }

    fn update_tex_image(
        &self,
        ctx: ContextId,
        texture: TextureId,
        source: &SurfaceTexture,
    ) -> DuocamResult<Option<i64>> {
        if source.is_released() {
            return Err(DuocamError::gpu("surface texture has been released"));
        }
        self.with_gl(ctx, |gl, objects| {
            objects.texture(texture)?;
            let Some(frame) = source.take_latest() else {
                return Ok(None);
            };
            let previous = objects
                .bound
                .get(&objects.active_unit)
                .and_then(|id| objects.textures.get(id))
                .map(|t| t.raw);
            let Some(t) = objects.textures.get_mut(&texture) else {
                return Err(DuocamError::gpu(format!("{texture:?} does not exist")));
            };
            let (width, height) = (frame.width as i32, frame.height as i32);
            unsafe {
                gl.bind_texture(glow::TEXTURE_2D, Some(t.raw));
                gl.pixel_store_i32(glow::UNPACK_ALIGNMENT, 1);
                if t.size == Some((frame.width, frame.height)) {
                    gl.tex_sub_image_2d(
                        glow::TEXTURE_2D,
                        0,
                        0,
                        0,
                        width,
                        height,
                        glow::RGBA,
                        glow::UNSIGNED_BYTE,
                        glow::PixelUnpackData::Slice(&frame.data),
                    );
                } else {
                    gl.tex_image_2d(
                        glow::TEXTURE_2D,
                        0,
                        glow::RGBA as i32,
                        width,
                        height,
                        0,
                        glow::RGBA,
                        glow::UNSIGNED_BYTE,
                        Some(&frame.data),
                    );
                    t.size = Some((frame.width, frame.height));
                }
                gl.bind_texture(glow::TEXTURE_2D, previous);
            }
            Ok(Some(frame.pts_us))
        })
    }

    fn create_shader(&self, ctx: ContextId, stage: ShaderStage) -> DuocamResult<ShaderId> {
        let id = ShaderId(self.lock().next_id());
        self.with_gl(ctx, |gl, objects| {
            let kind = match stage {
                ShaderStage::Vertex => glow::VERTEX_SHADER,
                ShaderStage::Fragment => glow::FRAGMENT_SHADER,
            };
            let raw = unsafe { gl.create_shader(kind) }.map_err(DuocamError::gpu)?;
            objects.shaders.insert(id, (raw, stage));
            Ok(id)
        })
    }

    fn shader_source(&self, ctx: ContextId, shader: ShaderId, source: &str) -> DuocamResult<()> {
        self.with_gl(ctx, |gl, objects| {
            let (raw, stage) = objects.shader(shader)?;
            let source = match stage {
                ShaderStage::Fragment => adapt_fragment_source(source),
                ShaderStage::Vertex => source.to_string(),
            };
            unsafe { gl.shader_source(raw, &source) };
            Ok(())
        })
    }

    fn compile_shader(&self, ctx: ContextId, shader: ShaderId) -> DuocamResult<bool> {
        self.with_gl(ctx, |gl, objects| {
            let (raw, _) = objects.shader(shader)?;
            unsafe {
                gl.compile_shader(raw);
                Ok(gl.get_shader_compile_status(raw))
            }
        })
    }

    fn shader_info_log(&self, ctx: ContextId, shader: ShaderId) -> DuocamResult<String> {
        self.with_gl(ctx, |gl, objects| {
            let (raw, _) = objects.shader(shader)?;
            Ok(unsafe { gl.get_shader_info_log(raw) })
        })
    }

    fn delete_shader(&self, ctx: ContextId, shader: ShaderId) -> DuocamResult<()> {
        self.with_gl(ctx, |gl, objects| {
            if let Some((raw, _)) = objects.shaders.remove(&shader) {
                unsafe { gl.delete_shader(raw) };
            }
            Ok(())
        })
    }

    fn create_program(&self, ctx: ContextId) -> DuocamResult<ProgramId> {
        let id = ProgramId(self.lock().next_id());
        self.with_gl(ctx, |gl, objects| {
            let raw = unsafe { gl.create_program() }.map_err(DuocamError::gpu)?;
            objects.programs.insert(id, raw);
            Ok(id)
        })
    }

    fn attach_shader(
        &self,
        ctx: ContextId,
        program: ProgramId,
        shader: ShaderId,
    ) -> DuocamResult<()> {
        self.with_gl(ctx, |gl, objects| {
            let (raw_shader, _) = objects.shader(shader)?;
            let raw = objects.program(program)?;
            unsafe { gl.attach_shader(raw, raw_shader) };
            Ok(())
        })
    }

    fn link_program(&self, ctx: ContextId, program: ProgramId) -> DuocamResult<bool> {
        self.with_gl(ctx, |gl, objects| {
            let raw = objects.program(program)?;
            unsafe {
                gl.link_program(raw);
                Ok(gl.get_program_link_status(raw))
            }
        })
    }

    fn program_info_log(&self, ctx: ContextId, program: ProgramId) -> DuocamResult<String> {
        self.with_gl(ctx, |gl, objects| {
            let raw = objects.program(program)?;
            Ok(unsafe { gl.get_program_info_log(raw) })
        })
    }

    fn delete_program(&self, ctx: ContextId, program: ProgramId) -> DuocamResult<()> {
        self.with_gl(ctx, |gl, objects| {
            if let Some(raw) = objects.programs.remove(&program) {
                unsafe { gl.delete_program(raw) };
            }
            Ok(())
        })
    }

    fn use_program(&self, ctx: ContextId, program: Option<ProgramId>) -> DuocamResult<()> {
        self.with_gl(ctx, |gl, objects| {
            let raw = program.map(|id| objects.program(id)).transpose()?;
            unsafe { gl.use_program(raw) };
            Ok(())
        })
    }

    fn attrib_location(
        &self,
        ctx: ContextId,
        program: ProgramId,
        name: &str,
    ) -> DuocamResult<Option<u32>> {
        self.with_gl(ctx, |gl, objects| {
            let raw = objects.program(program)?;
            Ok(unsafe { gl.get_attrib_location(raw, name) })
        })
    }

    fn uniform_location(
        &self,
        ctx: ContextId,
        program: ProgramId,
        name: &str,
    ) -> DuocamResult<Option<UniformLocation>> {
        self.with_gl(ctx, |gl, objects| {
            let raw = objects.program(program)?;
            Ok(unsafe { gl.get_uniform_location(raw, name) }.map(|loc| UniformLocation(loc.0)))
        })
    }

    fn uniform1f(&self, ctx: ContextId, location: UniformLocation, value: f32) -> DuocamResult<()> {
        self.with_gl(ctx, |gl, _| {
            let loc = glow::NativeUniformLocation(location.0);
            unsafe { gl.uniform_1_f32(Some(&loc), value) };
            Ok(())
        })
    }

    fn uniform1i(&self, ctx: ContextId, location: UniformLocation, value: i32) -> DuocamResult<()> {
        self.with_gl(ctx, |gl, _| {
            let loc = glow::NativeUniformLocation(location.0);
            unsafe { gl.uniform_1_i32(Some(&loc), value) };
            Ok(())
        })
    }

    fn vertex_attrib_pointer(
        &self,
        ctx: ContextId,
        index: u32,
        size: u32,
        data: &[f32],
    ) -> DuocamResult<()> {
        self.with_gl(ctx, |gl, objects| {
            let buffer = match objects.attrib_buffers.get(&index) {
                Some(&buffer) => buffer,
                None => {
                    let buffer = unsafe { gl.create_buffer() }.map_err(DuocamError::gpu)?;
                    objects.attrib_buffers.insert(index, buffer);
                    buffer
                }
            };
            let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_ne_bytes()).collect();
            unsafe {
                gl.bind_buffer(glow::ARRAY_BUFFER, Some(buffer));
                gl.buffer_data_u8_slice(glow::ARRAY_BUFFER, &bytes, glow::STREAM_DRAW);
                gl.vertex_attrib_pointer_f32(index, size as i32, glow::FLOAT, false, 0, 0);
                gl.bind_buffer(glow::ARRAY_BUFFER, None);
            }
            Ok(())
        })
    }

    fn enable_vertex_attrib_array(&self, ctx: ContextId, index: u32) -> DuocamResult<()> {
        self.with_gl(ctx, |gl, _| {
            unsafe { gl.enable_vertex_attrib_array(index) };
            Ok(())
        })
    }

    fn disable_vertex_attrib_array(&self, ctx: ContextId, index: u32) -> DuocamResult<()> {
        self.with_gl(ctx, |gl, _| {
            unsafe { gl.disable_vertex_attrib_array(index) };
            Ok(())
        })
    }

    fn viewport(
        &self,
        ctx: ContextId,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> DuocamResult<()> {
        self.with_gl(ctx, |gl, _| {
            unsafe { gl.viewport(x, y, width as i32, height as i32) };
            Ok(())
        })
    }

    fn clear_color(&self, ctx: ContextId, rgba: [f32; 4]) -> DuocamResult<()> {
        self.with_gl(ctx, |gl, _| {
            let [r, g, b, a] = rgba;
            unsafe { gl.clear_color(r, g, b, a) };
            Ok(())
        })
    }

    fn clear(&self, ctx: ContextId) -> DuocamResult<()> {
        self.with_gl(ctx, |gl, _| {
            unsafe { gl.clear(glow::COLOR_BUFFER_BIT) };
            Ok(())
        })
    }

    fn draw_arrays(
        &self,
        ctx: ContextId,
        mode: Primitive,
        first: usize,
        count: usize,
    ) -> DuocamResult<()> {
        let mode = match mode {
            Primitive::Triangles => glow::TRIANGLES,
            Primitive::TriangleStrip => glow::TRIANGLE_STRIP,
        };
        self.with_gl(ctx, |gl, _| {
            unsafe { gl.draw_arrays(mode, first as i32, count as i32) };
            Ok(())
        })
    }

    fn object_counts(&self) -> GpuObjectCounts {
        let state = self.lock();
        GpuObjectCounts {
            displays: state.displays.values().filter(|d| d.initialized).count(),
            contexts: state.contexts.len(),
            surfaces: state.surfaces.len(),
            textures: state.contexts.values().map(|c| c.objects.textures.len()).sum(),
            shaders: state.contexts.values().map(|c| c.objects.shaders.len()).sum(),
            programs: state.contexts.values().map(|c| c.objects.programs.len()).sum(),
        }
    }
}
