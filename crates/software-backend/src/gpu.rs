//! In-memory fake of [`GpuDevice`] for tests and GPU-less hosts.
//!
//! Shaders are checked by [`crate::interface`] but never executed. A draw
//! stands in for the split-screen program: it maps the `aPosition` quad
//! through `uScaleX`/`uTranslateX`, fills the covered rectangle of the
//! current window surface and samples the bound texture along `aTexCoord`.
//! Real rendering lives in the `duocam-gles` crate.
//!
//! Contexts bind per thread. A context may be current on at most one thread
//! and every GL call fails unless its context is current on the caller.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use duocam_codec_core::{
    ConfigAttribs, ConfigId, ContextId, DisplayId, GpuDevice, GpuObjectCounts, Primitive,
    ProgramId, ShaderId, ShaderStage, Surface, SurfaceId, SurfaceTexture, TextureFilter,
    TextureId, TextureParam, TextureTarget, TextureWrap, UniformLocation, VideoFrame,
};
use duocam_common::{DuocamError, DuocamResult};

use crate::interface::{self, ProgramInterface, ShaderInterface, UniformType};

pub const MAX_TEXTURE_UNITS: u32 = 8;
pub const MAX_VERTEX_ATTRIBS: u32 = 8;

const DEFAULT_DISPLAY: DisplayId = DisplayId(1);
const RGBA8888_CONFIG: ConfigId = ConfigId(1);

#[derive(Debug, Clone, Copy)]
struct Binding {
    display: DisplayId,
    context: ContextId,
    surface: Option<SurfaceId>,
}

#[derive(Debug)]
struct TextureObject {
    target: Option<TextureTarget>,
    image: Option<Arc<VideoFrame>>,
    min_filter: TextureFilter,
    mag_filter: TextureFilter,
    wrap_s: TextureWrap,
    wrap_t: TextureWrap,
}

impl Default for TextureObject {
    fn default() -> Self {
        Self {
            target: None,
            image: None,
            min_filter: TextureFilter::Linear,
            mag_filter: TextureFilter::Linear,
            wrap_s: TextureWrap::Repeat,
            wrap_t: TextureWrap::Repeat,
        }
    }
}

#[derive(Debug)]
struct ShaderObject {
    stage: ShaderStage,
    source: String,
    compiled: Option<ShaderInterface>,
    log: String,
}

#[derive(Debug, Default)]
struct ProgramObject {
    attached: Vec<ShaderId>,
    linked: Option<ProgramInterface>,
    uniforms: Vec<f32>,
    log: String,
}

#[derive(Debug, Clone, Copy, Default)]
struct UnitBinding {
    texture_2d: Option<TextureId>,
    external: Option<TextureId>,
}

impl UnitBinding {
    fn slot(&mut self, target: TextureTarget) -> &mut Option<TextureId> {
        match target {
            TextureTarget::Texture2D => &mut self.texture_2d,
            TextureTarget::ExternalOes => &mut self.external,
        }
    }

    fn get(&self, target: TextureTarget) -> Option<TextureId> {
        match target {
            TextureTarget::Texture2D => self.texture_2d,
            TextureTarget::ExternalOes => self.external,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct AttribArray {
    enabled: bool,
    size: u32,
    data: Vec<f32>,
}

impl AttribArray {
    fn vertex(&self, index: usize) -> [f32; 2] {
        let size = self.size as usize;
        let at = |component: usize| {
            if self.enabled && component < size {
                self.data.get(index * size + component).copied().unwrap_or(0.0)
            } else {
                0.0
            }
        };
        [at(0), at(1)]
    }
}

#[derive(Debug, Clone, Copy)]
struct Viewport {
    x: i32,
    y: i32,
    width: u32,
    height: u32,
}

/// Window-surface pixels, bottom row first like GL.
#[derive(Debug)]
struct Framebuffer {
    width: u32,
    height: u32,
    pixels: Vec<[u8; 4]>,
}

impl Framebuffer {
    fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![[0; 4]; (width * height) as usize],
        }
    }

    fn clear(&mut self, rgba: [f32; 4]) {
        let color = rgba.map(to_byte);
        self.pixels.fill(color);
    }

    fn put(&mut self, x: u32, y: u32, rgba: [f32; 4]) {
        let index = (y * self.width + x) as usize;
        self.pixels[index] = rgba.map(to_byte);
    }

    fn to_top_down(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.pixels.len() * 4);
        for row in self.pixels.chunks(self.width.max(1) as usize).rev() {
            for pixel in row {
                data.extend_from_slice(pixel);
            }
        }
        data
    }
}

fn to_byte(c: f32) -> u8 {
    (c.clamp(0.0, 1.0) * 255.0).round() as u8
}

#[derive(Debug)]
struct ContextState {
    display: DisplayId,
    textures: HashMap<TextureId, TextureObject>,
    shaders: HashMap<ShaderId, ShaderObject>,
    programs: HashMap<ProgramId, ProgramObject>,
    active_unit: u32,
    units: Vec<UnitBinding>,
    attribs: Vec<AttribArray>,
    viewport: Option<Viewport>,
    clear_color: [f32; 4],
    current_program: Option<ProgramId>,
}

impl ContextState {
    fn new(display: DisplayId) -> Self {
        Self {
            display,
            textures: HashMap::new(),
            shaders: HashMap::new(),
            programs: HashMap::new(),
            active_unit: 0,
            units: vec![UnitBinding::default(); MAX_TEXTURE_UNITS as usize],
            attribs: vec![AttribArray::default(); MAX_VERTEX_ATTRIBS as usize],
            viewport: None,
            clear_color: [0.0, 0.0, 0.0, 0.0],
            current_program: None,
        }
    }

    fn program_mut(&mut self, program: ProgramId) -> DuocamResult<&mut ProgramObject> {
        self.programs
            .get_mut(&program)
            .ok_or_else(|| DuocamError::gpu(format!("{program:?} does not exist")))
    }

    fn linked(&self, program: ProgramId) -> DuocamResult<&ProgramInterface> {
        self.programs
            .get(&program)
            .ok_or_else(|| DuocamError::gpu(format!("{program:?} does not exist")))?
            .linked
            .as_ref()
            .ok_or_else(|| DuocamError::gpu(format!("{program:?} is not linked")))
    }

    fn bound_texture(&mut self, target: TextureTarget) -> DuocamResult<&mut TextureObject> {
        let id = self.units[self.active_unit as usize]
            .get(target)
            .ok_or_else(|| DuocamError::gpu(format!("no texture bound to {target:?}")))?;
        self.textures
            .get_mut(&id)
            .ok_or_else(|| DuocamError::gpu(format!("{id:?} does not exist")))
    }
}

#[derive(Debug)]
struct WindowSurface {
    display: DisplayId,
    target: Surface,
    framebuffer: Framebuffer,
    pending_pts_us: Option<i64>,
    last_pts_us: i64,
}

#[derive(Debug, Default)]
struct GpuState {
    next_id: u32,
    initialized: HashMap<DisplayId, bool>,
    contexts: HashMap<ContextId, ContextState>,
    surfaces: HashMap<SurfaceId, WindowSurface>,
    bindings: HashMap<ThreadId, Binding>,
}

impl GpuState {
    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn require_initialized(&self, display: DisplayId) -> DuocamResult<()> {
        if self.initialized.get(&display).copied().unwrap_or(false) {
            Ok(())
        } else {
            Err(DuocamError::gpu(format!("{display:?} is not initialized")))
        }
    }

    fn binding(&self) -> Option<Binding> {
        self.bindings.get(&thread::current().id()).copied()
    }

    fn context_mut(&mut self, ctx: ContextId) -> DuocamResult<&mut ContextState> {
        match self.binding() {
            Some(binding) if binding.context == ctx => {}
            _ => {
                return Err(DuocamError::gpu(format!(
                    "{ctx:?} is not current on this thread"
                )))
            }
        }
        self.contexts
            .get_mut(&ctx)
            .ok_or_else(|| DuocamError::gpu(format!("{ctx:?} does not exist")))
    }
}

/// A bound texture captured for one draw.
#[derive(Debug, Clone)]
struct Sampler {
    image: Arc<VideoFrame>,
    filter: TextureFilter,
    wrap_s: TextureWrap,
    wrap_t: TextureWrap,
}

impl Sampler {
    fn texel(&self, x: i64, y: i64) -> [f32; 4] {
        let (w, h) = (self.image.width as i64, self.image.height as i64);
        let x = wrap(x, w, self.wrap_s);
        let y = wrap(y, h, self.wrap_t);
        self.image.pixel(x as u32, y as u32).map(|c| c as f32 / 255.0)
    }

    /// `t = 0` is the top row of the picture.
    fn sample(&self, s: f32, t: f32) -> [f32; 4] {
        let (w, h) = (self.image.width as f32, self.image.height as f32);
        match self.filter {
            TextureFilter::Nearest => self.texel((s * w).floor() as i64, (t * h).floor() as i64),
            TextureFilter::Linear => {
                let u = s * w - 0.5;
                let v = t * h - 0.5;
                let (x0, y0) = (u.floor(), v.floor());
                let (fx, fy) = (u - x0, v - y0);
                let (x0, y0) = (x0 as i64, y0 as i64);
                let a = self.texel(x0, y0);
                let b = self.texel(x0 + 1, y0);
                let c = self.texel(x0, y0 + 1);
                let d = self.texel(x0 + 1, y0 + 1);
                let mut out = [0.0; 4];
                for i in 0..4 {
                    let top = a[i] + (b[i] - a[i]) * fx;
                    let bottom = c[i] + (d[i] - c[i]) * fx;
                    out[i] = top + (bottom - top) * fy;
                }
                out
            }
        }
    }
}

fn wrap(coord: i64, len: i64, mode: TextureWrap) -> i64 {
    match mode {
        TextureWrap::ClampToEdge => coord.clamp(0, len - 1),
        TextureWrap::Repeat => coord.rem_euclid(len),
    }
}

/// Corner of the drawn rectangle in window pixels with its texture coordinate.
#[derive(Debug, Clone, Copy)]
struct Corner {
    x: f32,
    y: f32,
    s: f32,
    t: f32,
}

/// Axis-aligned bounds of the drawn vertices plus the texture coordinates
/// at the left/right and bottom/top edges.
#[derive(Debug, Clone, Copy)]
struct Quad {
    x0: f32,
    x1: f32,
    y0: f32,
    y1: f32,
    s0: f32,
    s1: f32,
    t0: f32,
    t1: f32,
}

impl Quad {
    fn bounding(corners: &[Corner]) -> Option<Self> {
        let first = corners.first()?;
        let mut quad = Quad {
            x0: first.x,
            x1: first.x,
            y0: first.y,
            y1: first.y,
            s0: first.s,
            s1: first.s,
            t0: first.t,
            t1: first.t,
        };
        for c in corners {
            if c.x < quad.x0 {
                (quad.x0, quad.s0) = (c.x, c.s);
            }
            if c.x > quad.x1 {
                (quad.x1, quad.s1) = (c.x, c.s);
            }
            if c.y < quad.y0 {
                (quad.y0, quad.t0) = (c.y, c.t);
            }
            if c.y > quad.y1 {
                (quad.y1, quad.t1) = (c.y, c.t);
            }
        }
        (quad.x1 > quad.x0 && quad.y1 > quad.y0).then_some(quad)
    }

    fn tex_coord(&self, x: f32, y: f32) -> (f32, f32) {
        let fx = (x - self.x0) / (self.x1 - self.x0);
        let fy = (y - self.y0) / (self.y1 - self.y0);
        (
            self.s0 + (self.s1 - self.s0) * fx,
            self.t0 + (self.t1 - self.t0) * fy,
        )
    }
}

/// Fake OpenGL ES 2.0 device.
#[derive(Debug, Default)]
pub struct SoftwareGpu {
    state: Mutex<GpuState>,
}

impl SoftwareGpu {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GpuState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_context<T>(
        &self,
        ctx: ContextId,
        f: impl FnOnce(&mut ContextState) -> DuocamResult<T>,
    ) -> DuocamResult<T> {
        let mut state = self.lock();
        f(state.context_mut(ctx)?)
    }
}

impl GpuDevice for SoftwareGpu {
    fn name(&self) -> &str {
        "software-fake"
    }

    fn get_display(&self) -> DuocamResult<DisplayId> {
        self.lock().initialized.entry(DEFAULT_DISPLAY).or_insert(false);
        Ok(DEFAULT_DISPLAY)
    }

    fn initialize(&self, display: DisplayId) -> DuocamResult<(u32, u32)> {
        let mut state = self.lock();
        let initialized = state
            .initialized
            .get_mut(&display)
            .ok_or_else(|| DuocamError::gpu(format!("{display:?} does not exist")))?;
        *initialized = true;
        Ok((1, 5))
    }

    fn choose_config(
        &self,
        display: DisplayId,
        attribs: &ConfigAttribs,
    ) -> DuocamResult<Option<ConfigId>> {
        self.lock().require_initialized(display)?;
        let fits = [
            attribs.red_bits,
            attribs.green_bits,
            attribs.blue_bits,
            attribs.alpha_bits,
        ]
        .iter()
        .all(|&bits| bits <= 8)
            && attribs.es_version <= 2;
        Ok(fits.then_some(RGBA8888_CONFIG))
    }

    fn create_context(
        &self,
        display: DisplayId,
        config: ConfigId,
        client_version: u32,
    ) -> DuocamResult<ContextId> {
        let mut state = self.lock();
        state.require_initialized(display)?;
        if config != RGBA8888_CONFIG {
            return Err(DuocamError::gpu(format!("{config:?} is not a valid config")));
        }
        if client_version != 2 {
            return Err(DuocamError::gpu(format!(
                "client version {client_version} is not supported"
            )));
        }
        let id = ContextId(state.next_id());
        state.contexts.insert(id, ContextState::new(display));
        tracing::trace!(?id, "created context");
        Ok(id)
    }

    fn create_window_surface(
        &self,
        display: DisplayId,
        config: ConfigId,
        target: &Surface,
    ) -> DuocamResult<SurfaceId> {
        let mut state = self.lock();
        state.require_initialized(display)?;
        if config != RGBA8888_CONFIG {
            return Err(DuocamError::gpu(format!("{config:?} is not a valid config")));
        }
        if target.is_released() {
            return Err(DuocamError::gpu("target surface has been released"));
        }
        let (width, height) = target.size();
        let id = SurfaceId(state.next_id());
        state.surfaces.insert(
            id,
            WindowSurface {
                display,
                target: target.clone(),
                framebuffer: Framebuffer::new(width, height),
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
        state.require_initialized(display)?;
        let me = thread::current().id();
        let Some(context) = context else {
            if surface.is_some() {
                return Err(DuocamError::gpu("surface given without a context"));
            }
            state.bindings.remove(&me);
            return Ok(());
        };

        match state.contexts.get(&context) {
            Some(ctx) if ctx.display == display => {}
            _ => return Err(DuocamError::gpu(format!("{context:?} is not a context of {display:?}"))),
        }
        if let Some(surface) = surface {
            match state.surfaces.get(&surface) {
                Some(s) if s.display == display => {}
                _ => return Err(DuocamError::gpu(format!("{surface:?} is not a surface of {display:?}"))),
            }
        }
        let elsewhere = state
            .bindings
            .iter()
            .any(|(thread, b)| *thread != me && b.context == context);
        if elsewhere {
            return Err(DuocamError::gpu(format!(
                "{context:?} is current on another thread"
            )));
        }

        // The first binding sizes the viewport to the draw surface.
        let surface_size = surface
            .and_then(|s| state.surfaces.get(&s))
            .map(|s| (s.framebuffer.width, s.framebuffer.height));
        if let (Some(ctx), Some((width, height))) = (state.contexts.get_mut(&context), surface_size) {
            if ctx.viewport.is_none() {
                ctx.viewport = Some(Viewport {
                    x: 0,
                    y: 0,
                    width,
                    height,
                });
            }
        }
        state.bindings.insert(
            me,
            Binding {
                display,
                context,
                surface,
            },
        );
        Ok(())
    }

    fn current_context(&self) -> Option<ContextId> {
        self.lock().binding().map(|b| b.context)
    }

    fn swap_buffers(&self, display: DisplayId, surface: SurfaceId) -> DuocamResult<()> {
        let mut state = self.lock();
        match state.binding() {
            Some(b) if b.display == display && b.surface == Some(surface) => {}
            _ => {
                return Err(DuocamError::gpu(format!(
                    "{surface:?} is not current on this thread"
                )))
            }
        }
        let window = state
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| DuocamError::gpu(format!("{surface:?} does not exist")))?;
        let pts_us = window.pending_pts_us.take().unwrap_or(window.last_pts_us);
        window.last_pts_us = pts_us;
        let fb = &window.framebuffer;
        let frame = VideoFrame::new(fb.width, fb.height, pts_us, fb.to_top_down())?;
        window.target.queue_frame(frame)
    }

    fn set_presentation_time(
        &self,
        display: DisplayId,
        surface: SurfaceId,
        pts_us: i64,
    ) -> DuocamResult<()> {
        let mut state = self.lock();
        match state.surfaces.get_mut(&surface) {
            Some(window) if window.display == display => {
                window.pending_pts_us = Some(pts_us);
                Ok(())
            }
            _ => Err(DuocamError::gpu(format!("{surface:?} does not exist"))),
        }
    }

    fn destroy_surface(&self, display: DisplayId, surface: SurfaceId) -> DuocamResult<()> {
        let mut state = self.lock();
        match state.surfaces.get(&surface) {
            Some(window) if window.display == display => {}
            _ => return Err(DuocamError::gpu(format!("{surface:?} does not exist"))),
        }
        state.surfaces.remove(&surface);
        for binding in state.bindings.values_mut() {
            if binding.surface == Some(surface) {
                binding.surface = None;
            }
        }
        Ok(())
    }

    fn destroy_context(&self, display: DisplayId, context: ContextId) -> DuocamResult<()> {
        let mut state = self.lock();
        match state.contexts.get(&context) {
            Some(ctx) if ctx.display == display => {}
            _ => return Err(DuocamError::gpu(format!("{context:?} does not exist"))),
        }
        state.contexts.remove(&context);
        state.bindings.retain(|_, b| b.context != context);
        Ok(())
    }

    fn release_thread(&self) -> DuocamResult<()> {
        self.lock().bindings.remove(&thread::current().id());
        Ok(())
    }

    fn terminate(&self, display: DisplayId) -> DuocamResult<()> {
        let mut state = self.lock();
        let Some(initialized) = state.initialized.get_mut(&display) else {
            return Err(DuocamError::gpu(format!("{display:?} does not exist")));
        };
        *initialized = false;
        state.contexts.retain(|_, c| c.display != display);
        state.surfaces.retain(|_, s| s.display != display);
        state.bindings.retain(|_, b| b.display != display);
        Ok(())
    }

    fn gen_texture(&self, ctx: ContextId) -> DuocamResult<TextureId> {
        let mut state = self.lock();
        let id = TextureId(state.next_id());
        state
            .context_mut(ctx)?
            .textures
            .insert(id, TextureObject::default());
        Ok(id)
    }

    fn delete_texture(&self, ctx: ContextId, texture: TextureId) -> DuocamResult<()> {
        self.with_context(ctx, |c| {
            c.textures.remove(&texture);
            for unit in &mut c.units {
                for target in [TextureTarget::Texture2D, TextureTarget::ExternalOes] {
                    let slot = unit.slot(target);
                    if *slot == Some(texture) {
                        *slot = None;
                    }
                }
            }
            Ok(())
        })
    }

    fn active_texture(&self, ctx: ContextId, unit: u32) -> DuocamResult<()> {
        self.with_context(ctx, |c| {
            if unit >= MAX_TEXTURE_UNITS {
                return Err(DuocamError::gpu(format!("texture unit {unit} out of range")));
            }
            c.active_unit = unit;
            Ok(())
        })
    }

    fn bind_texture(
        &self,
        ctx: ContextId,
        target: TextureTarget,
        texture: Option<TextureId>,
    ) -> DuocamResult<()> {
        self.with_context(ctx, |c| {
            if let Some(id) = texture {
                let object = c
                    .textures
                    .get_mut(&id)
                    .ok_or_else(|| DuocamError::gpu(format!("{id:?} does not exist")))?;
                match object.target {
                    Some(existing) if existing != target => {
                        return Err(DuocamError::gpu(format!(
                            "{id:?} was first bound to {existing:?}, not {target:?}"
                        )))
                    }
                    _ => object.target = Some(target),
                }
            }
            let unit = c.active_unit as usize;
            *c.units[unit].slot(target) = texture;
            Ok(())
        })
    }

    fn tex_parameter(
        &self,
        ctx: ContextId,
        target: TextureTarget,
        param: TextureParam,
    ) -> DuocamResult<()> {
        self.with_context(ctx, |c| {
            let texture = c.bound_texture(target)?;
            match param {
                TextureParam::MinFilter(f) => texture.min_filter = f,
                TextureParam::MagFilter(f) => texture.mag_filter = f,
                TextureParam::WrapS(w) => texture.wrap_s = w,
                TextureParam::WrapT(w) => texture.wrap_t = w,
            }
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
        self.with_context(ctx, |c| {
            let object = c
                .textures
                .get_mut(&texture)
                .ok_or_else(|| DuocamError::gpu(format!("{texture:?} does not exist")))?;
            if object.target == Some(TextureTarget::Texture2D) {
                return Err(DuocamError::gpu(format!("{texture:?} is not an external texture")));
            }
            let Some(frame) = source.take_latest() else {
                return Ok(None);
            };
            let pts = frame.pts_us;
            object.target = Some(TextureTarget::ExternalOes);
            object.image = Some(Arc::new(frame));
            Ok(Some(pts))
        })
    }

    fn create_shader(&self, ctx: ContextId, stage: ShaderStage) -> DuocamResult<ShaderId> {
        let mut state = self.lock();
        let id = ShaderId(state.next_id());
        state.context_mut(ctx)?.shaders.insert(
            id,
            ShaderObject {
                stage,
                source: String::new(),
                compiled: None,
                log: String::new(),
            },
        );
        Ok(id)
    }

    fn shader_source(&self, ctx: ContextId, shader: ShaderId, source: &str) -> DuocamResult<()> {
        self.with_context(ctx, |c| {
            let object = c
                .shaders
                .get_mut(&shader)
                .ok_or_else(|| DuocamError::gpu(format!("{shader:?} does not exist")))?;
            object.source = source.to_string();
            Ok(())
        })
    }

    fn compile_shader(&self, ctx: ContextId, shader: ShaderId) -> DuocamResult<bool> {
        self.with_context(ctx, |c| {
            let object = c
                .shaders
                .get_mut(&shader)
                .ok_or_else(|| DuocamError::gpu(format!("{shader:?} does not exist")))?;
            match interface::compile(object.stage, &object.source) {
                Ok(compiled) => {
                    object.compiled = Some(compiled);
                    object.log.clear();
                    Ok(true)
                }
                Err(log) => {
                    object.compiled = None;
                    object.log = log;
                    Ok(false)
                }
            }
        })
    }

    fn shader_info_log(&self, ctx: ContextId, shader: ShaderId) -> DuocamResult<String> {
        self.with_context(ctx, |c| {
            c.shaders
                .get(&shader)
                .map(|s| s.log.clone())
                .ok_or_else(|| DuocamError::gpu(format!("{shader:?} does not exist")))
        })
    }

    fn delete_shader(&self, ctx: ContextId, shader: ShaderId) -> DuocamResult<()> {
        self.with_context(ctx, |c| {
            c.shaders.remove(&shader);
            Ok(())
        })
    }

    fn create_program(&self, ctx: ContextId) -> DuocamResult<ProgramId> {
        let mut state = self.lock();
        let id = ProgramId(state.next_id());
        state
            .context_mut(ctx)?
            .programs
            .insert(id, ProgramObject::default());
        Ok(id)
    }

    fn attach_shader(
        &self,
        ctx: ContextId,
        program: ProgramId,
        shader: ShaderId,
    ) -> DuocamResult<()> {
        self.with_context(ctx, |c| {
            if !c.shaders.contains_key(&shader) {
                return Err(DuocamError::gpu(format!("{shader:?} does not exist")));
            }
            let object = c.program_mut(program)?;
            if !object.attached.contains(&shader) {
                object.attached.push(shader);
            }
            Ok(())
        })
    }

    fn link_program(&self, ctx: ContextId, program: ProgramId) -> DuocamResult<bool> {
        self.with_context(ctx, |c| {
            let attached = c.program_mut(program)?.attached.clone();
            let compiled = |stage: ShaderStage| {
                attached
                    .iter()
                    .filter_map(|id| c.shaders.get(id))
                    .find(|s| s.stage == stage)
                    .and_then(|s| s.compiled.as_ref())
            };
            let result = match (compiled(ShaderStage::Vertex), compiled(ShaderStage::Fragment)) {
                (Some(vs), Some(fs)) => interface::link(vs, fs),
                _ => Err("ERROR: Program needs a compiled vertex and fragment shader.\n".to_string()),
            };
            let object = c.program_mut(program)?;
            match result {
                Ok(linked) => {
                    object.uniforms = vec![0.0; linked.uniforms.len()];
                    object.linked = Some(linked);
                    object.log.clear();
                    Ok(true)
                }
                Err(log) => {
                    object.linked = None;
                    object.log = log;
                    Ok(false)
                }
            }
        })
    }

    fn program_info_log(&self, ctx: ContextId, program: ProgramId) -> DuocamResult<String> {
        self.with_context(ctx, |c| Ok(c.program_mut(program)?.log.clone()))
    }

    fn delete_program(&self, ctx: ContextId, program: ProgramId) -> DuocamResult<()> {
        self.with_context(ctx, |c| {
            c.programs.remove(&program);
            if c.current_program == Some(program) {
                c.current_program = None;
            }
            Ok(())
        })
    }

    fn use_program(&self, ctx: ContextId, program: Option<ProgramId>) -> DuocamResult<()> {
        self.with_context(ctx, |c| {
            if let Some(program) = program {
                c.linked(program)?;
            }
            c.current_program = program;
            Ok(())
        })
    }

    fn attrib_location(
        &self,
        ctx: ContextId,
        program: ProgramId,
        name: &str,
    ) -> DuocamResult<Option<u32>> {
        self.with_context(ctx, |c| Ok(c.linked(program)?.attrib_location(name)))
    }

    fn uniform_location(
        &self,
        ctx: ContextId,
        program: ProgramId,
        name: &str,
    ) -> DuocamResult<Option<UniformLocation>> {
        self.with_context(ctx, |c| {
            Ok(c.linked(program)?.uniform_location(name).map(UniformLocation))
        })
    }

    fn uniform1f(&self, ctx: ContextId, location: UniformLocation, value: f32) -> DuocamResult<()> {
        self.with_context(ctx, |c| {
            set_uniform(c, location, value, |ty| ty == UniformType::Float)
        })
    }

    fn uniform1i(&self, ctx: ContextId, location: UniformLocation, value: i32) -> DuocamResult<()> {
        self.with_context(ctx, |c| {
            let unit_ok = value >= 0 && (value as u32) < MAX_TEXTURE_UNITS;
            set_uniform(c, location, value as f32, |ty| {
                ty == UniformType::Int || (ty.is_sampler() && unit_ok)
            })
        })
    }

    fn vertex_attrib_pointer(
        &self,
        ctx: ContextId,
        index: u32,
        size: u32,
        data: &[f32],
    ) -> DuocamResult<()> {
        self.with_context(ctx, |c| {
            if index >= MAX_VERTEX_ATTRIBS || !(1..=4).contains(&size) {
                return Err(DuocamError::gpu(format!(
                    "invalid attribute pointer (index {index}, size {size})"
                )));
            }
            let attrib = &mut c.attribs[index as usize];
            attrib.size = size;
            attrib.data = data.to_vec();
            Ok(())
        })
    }

    fn enable_vertex_attrib_array(&self, ctx: ContextId, index: u32) -> DuocamResult<()> {
        self.with_context(ctx, |c| set_attrib_enabled(c, index, true))
    }

    fn disable_vertex_attrib_array(&self, ctx: ContextId, index: u32) -> DuocamResult<()> {
        self.with_context(ctx, |c| set_attrib_enabled(c, index, false))
    }

    fn viewport(
        &self,
        ctx: ContextId,
        x: i32,
        y: i32,
        width: u32,
        height: u32,
    ) -> DuocamResult<()> {
        self.with_context(ctx, |c| {
            c.viewport = Some(Viewport {
                x,
                y,
                width,
                height,
            });
            Ok(())
        })
    }

    fn clear_color(&self, ctx: ContextId, rgba: [f32; 4]) -> DuocamResult<()> {
        self.with_context(ctx, |c| {
            c.clear_color = rgba;
            Ok(())
        })
    }

    fn clear(&self, ctx: ContextId) -> DuocamResult<()> {
        let mut state = self.lock();
        let color = state.context_mut(ctx)?.clear_color;
        let surface = state
            .binding()
            .and_then(|b| b.surface)
            .ok_or_else(|| DuocamError::gpu("no draw surface is current"))?;
        let window = state
            .surfaces
            .get_mut(&surface)
            .ok_or_else(|| DuocamError::gpu(format!("{surface:?} does not exist")))?;
        window.framebuffer.clear(color);
        Ok(())
    }

    fn draw_arrays(
        &self,
        ctx: ContextId,
        mode: Primitive,
        first: usize,
        count: usize,
    ) -> DuocamResult<()> {
        let mut state = self.lock();
        state.context_mut(ctx)?;
        let surface = state
            .binding()
            .and_then(|b| b.surface)
            .ok_or_else(|| DuocamError::gpu("no draw surface is current"))?;
        let GpuState {
            contexts, surfaces, ..
        } = &mut *state;
        let c = contexts
            .get(&ctx)
            .ok_or_else(|| DuocamError::gpu(format!("{ctx:?} does not exist")))?;
        let window = surfaces
            .get_mut(&surface)
            .ok_or_else(|| DuocamError::gpu(format!("{surface:?} does not exist")))?;

        let program_id = c
            .current_program
            .ok_or_else(|| DuocamError::gpu("draw without a program in use"))?;
        let program = c.linked(program_id)?;
        let uniforms = c
            .programs
            .get(&program_id)
            .map(|p| p.uniforms.as_slice())
            .unwrap_or_default();
        let fb = &mut window.framebuffer;
        let viewport = c.viewport.unwrap_or(Viewport {
            x: 0,
            y: 0,
            width: fb.width,
            height: fb.height,
        });

        let drawable = match mode {
            Primitive::Triangles | Primitive::TriangleStrip => count >= 3,
        };
        if !drawable {
            return Ok(());
        }
        let end = first + count;
        for (location, attrib) in c.attribs.iter().enumerate() {
            if attrib.enabled && attrib.data.len() < end * attrib.size as usize {
                return Err(DuocamError::gpu(format!(
                    "attribute {location} holds {} floats, draw needs {}",
                    attrib.data.len(),
                    end * attrib.size as usize
                )));
            }
        }

        let uniform = |name: &str, default: f32| {
            program
                .uniform_location(name)
                .and_then(|l| uniforms.get(l as usize).copied())
                .unwrap_or(default)
        };
        let scale_x = uniform("uScaleX", 1.0);
        let translate_x = uniform("uTranslateX", 0.0);
        let attrib = |name: &str| {
            program
                .attrib_location(name)
                .and_then(|l| c.attribs.get(l as usize))
        };
        let (Some(position), tex_coord) = (attrib("aPosition"), attrib("aTexCoord")) else {
            return Err(DuocamError::gpu("program has no aPosition attribute"));
        };

        let corners: Vec<Corner> = (first..end)
            .map(|i| {
                let [x, y] = position.vertex(i);
                let [s, t] = tex_coord.map(|a| a.vertex(i)).unwrap_or_default();
                let clip_x = x * scale_x + translate_x;
                Corner {
                    x: viewport.x as f32 + (clip_x + 1.0) * 0.5 * viewport.width as f32,
                    y: viewport.y as f32 + (y + 1.0) * 0.5 * viewport.height as f32,
                    s,
                    t,
                }
            })
            .collect();
        let Some(quad) = Quad::bounding(&corners) else {
            return Ok(());
        };

        let sampler = program
            .uniforms
            .iter()
            .enumerate()
            .find(|(_, (_, ty))| ty.is_sampler())
            .and_then(|(location, (_, ty))| {
                let unit = c.units.get(*uniforms.get(location)? as usize)?;
                let target = match ty {
                    UniformType::SamplerExternal => TextureTarget::ExternalOes,
                    _ => TextureTarget::Texture2D,
                };
                let texture = c.textures.get(&unit.get(target)?)?;
                let image = texture.image.clone()?;
                let minifying = image.width as f32 > quad.x1 - quad.x0
                    || image.height as f32 > quad.y1 - quad.y0;
                Some(Sampler {
                    filter: if minifying {
                        texture.min_filter
                    } else {
                        texture.mag_filter
                    },
                    wrap_s: texture.wrap_s,
                    wrap_t: texture.wrap_t,
                    image,
                })
            });

        let clip_x0 = viewport.x.max(0) as f32;
        let clip_y0 = viewport.y.max(0) as f32;
        let clip_x1 = (viewport.x as f32 + viewport.width as f32).min(fb.width as f32);
        let clip_y1 = (viewport.y as f32 + viewport.height as f32).min(fb.height as f32);
        for py in 0..fb.height {
            let cy = py as f32 + 0.5;
            if cy < quad.y0.max(clip_y0) || cy >= quad.y1.min(clip_y1) {
                continue;
            }
            for px in 0..fb.width {
                let cx = px as f32 + 0.5;
                if cx < quad.x0.max(clip_x0) || cx >= quad.x1.min(clip_x1) {
                    continue;
                }
                let color = match &sampler {
                    Some(sampler) => {
                        let (s, t) = quad.tex_coord(cx, cy);
                        sampler.sample(s, t)
                    }
                    // Incomplete textures sample as opaque black.
                    None => [0.0, 0.0, 0.0, 1.0],
                };
                fb.put(px, py, color);
            }
        }
        Ok(())
    }

    fn object_counts(&self) -> GpuObjectCounts {
        let state = self.lock();
        GpuObjectCounts {
            displays: state.initialized.values().filter(|&&i| i).count(),
            contexts: state.contexts.len(),
            surfaces: state.surfaces.len(),
            textures: state.contexts.values().map(|c| c.textures.len()).sum(),
            shaders: state.contexts.values().map(|c| c.shaders.len()).sum(),
            programs: state.contexts.values().map(|c| c.programs.len()).sum(),
        }
    }
}

fn set_uniform(
    c: &mut ContextState,
    location: UniformLocation,
    value: f32,
    accepts: impl Fn(UniformType) -> bool,
) -> DuocamResult<()> {
    let program = c
        .current_program
        .ok_or_else(|| DuocamError::gpu("uniform set without a program in use"))?;
    let ty = c
        .linked(program)?
        .uniform_type(location.0)
        .ok_or_else(|| DuocamError::gpu(format!("{location:?} is not a uniform location")))?;
    if !accepts(ty) {
        return Err(DuocamError::gpu(format!(
            "value does not fit uniform {location:?} of type {ty:?}"
        )));
    }
    c.program_mut(program)?.uniforms[location.0 as usize] = value;
    Ok(())
}

fn set_attrib_enabled(c: &mut ContextState, index: u32, enabled: bool) -> DuocamResult<()> {
    let attrib = c
        .attribs
        .get_mut(index as usize)
        .ok_or_else(|| DuocamError::gpu(format!("attribute {index} out of range")))?;
    attrib.enabled = enabled;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const VERTEX: &str = "attribute vec4 aPosition;
attribute vec2 aTexCoord;
varying vec2 vTexCoord;
uniform float uScaleX;
uniform float uTranslateX;
void main() {
    vec4 scaled = aPosition;
    scaled.x = aPosition.x * uScaleX + uTranslateX;
    gl_Position = scaled;
    vTexCoord = aTexCoord;
}";

    const FRAGMENT: &str = "#extension GL_OES_EGL_image_external : require
precision mediump float;
varying vec2 vTexCoord;
uniform samplerExternalOES sTexture;
void main() {
    gl_FragColor = texture2D(sTexture, vTexCoord);
}";

    const QUAD: [f32; 8] = [-1.0, -1.0, 1.0, -1.0, -1.0, 1.0, 1.0, 1.0];
    const TEX: [f32; 8] = [0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0];

    const RED: [u8; 4] = [255, 0, 0, 255];
    const BLUE: [u8; 4] = [0, 0, 255, 255];

    struct Setup {
        gpu: SoftwareGpu,
        display: DisplayId,
        ctx: ContextId,
        window: SurfaceId,
        target: Surface,
    }

    fn setup(width: u32, height: u32) -> Setup {
        let gpu = SoftwareGpu::new();
        let display = gpu.get_display().unwrap();
        gpu.initialize(display).unwrap();
        let config = gpu
            .choose_config(display, &ConfigAttribs::rgba8888_es2())
            .unwrap()
            .unwrap();
        let ctx = gpu.create_context(display, config, 2).unwrap();
        let target = Surface::new(width, height);
        let window = gpu.create_window_surface(display, config, &target).unwrap();
        gpu.make_current(display, Some(window), Some(ctx)).unwrap();
        Setup {
            gpu,
            display,
            ctx,
            window,
            target,
        }
    }

    fn program(s: &Setup) -> ProgramId {
        let gpu = &s.gpu;
        let vs = gpu.create_shader(s.ctx, ShaderStage::Vertex).unwrap();
        gpu.shader_source(s.ctx, vs, VERTEX).unwrap();
        assert!(gpu.compile_shader(s.ctx, vs).unwrap());
        let fs = gpu.create_shader(s.ctx, ShaderStage::Fragment).unwrap();
        gpu.shader_source(s.ctx, fs, FRAGMENT).unwrap();
        assert!(gpu.compile_shader(s.ctx, fs).unwrap());
        let p = gpu.create_program(s.ctx).unwrap();
        gpu.attach_shader(s.ctx, p, vs).unwrap();
        gpu.attach_shader(s.ctx, p, fs).unwrap();
        assert!(gpu.link_program(s.ctx, p).unwrap());
        p
    }

    fn external_texture(s: &Setup, image: VideoFrame) -> TextureId {
        let gpu = &s.gpu;
        let source = SurfaceTexture::new();
        source.post(image);
        let tex = gpu.gen_texture(s.ctx).unwrap();
        gpu.bind_texture(s.ctx, TextureTarget::ExternalOes, Some(tex)).unwrap();
        for param in [
            TextureParam::MinFilter(TextureFilter::Nearest),
            TextureParam::MagFilter(TextureFilter::Nearest),
        ] {
            gpu.tex_parameter(s.ctx, TextureTarget::ExternalOes, param).unwrap();
        }
        assert!(gpu.update_tex_image(s.ctx, tex, &source).unwrap().is_some());
        assert_eq!(gpu.update_tex_image(s.ctx, tex, &source).unwrap(), None);
        tex
    }

    fn bind_quad(s: &Setup, p: ProgramId) {
        let gpu = &s.gpu;
        gpu.use_program(s.ctx, Some(p)).unwrap();
        let pos = gpu.attrib_location(s.ctx, p, "aPosition").unwrap().unwrap();
        let uv = gpu.attrib_location(s.ctx, p, "aTexCoord").unwrap().unwrap();
        gpu.vertex_attrib_pointer(s.ctx, pos, 2, &QUAD).unwrap();
        gpu.vertex_attrib_pointer(s.ctx, uv, 2, &TEX).unwrap();
        gpu.enable_vertex_attrib_array(s.ctx, pos).unwrap();
        gpu.enable_vertex_attrib_array(s.ctx, uv).unwrap();
        let sampler = gpu.uniform_location(s.ctx, p, "sTexture").unwrap().unwrap();
        gpu.uniform1i(s.ctx, sampler, 0).unwrap();
    }

    fn set_half(s: &Setup, p: ProgramId, scale_x: f32, translate_x: f32) {
        let gpu = &s.gpu;
        let scale = gpu.uniform_location(s.ctx, p, "uScaleX").unwrap().unwrap();
        let translate = gpu.uniform_location(s.ctx, p, "uTranslateX").unwrap().unwrap();
        gpu.uniform1f(s.ctx, scale, scale_x).unwrap();
        gpu.uniform1f(s.ctx, translate, translate_x).unwrap();
    }

    #[test]
    fn test_textured_quad_is_upright() {
        let s = setup(2, 2);
        let p = program(&s);
        let mut image = VideoFrame::filled(2, 2, 7, BLUE);
        image.set_pixel(0, 0, RED);
        image.set_pixel(1, 0, RED);
        external_texture(&s, image);
        bind_quad(&s, p);
        set_half(&s, p, 1.0, 0.0);

        let gpu = &s.gpu;
        gpu.clear(s.ctx).unwrap();
        gpu.draw_arrays(s.ctx, Primitive::TriangleStrip, 0, 4).unwrap();
        gpu.set_presentation_time(s.display, s.window, 1_000).unwrap();
        gpu.swap_buffers(s.display, s.window).unwrap();

        let out = s.target.acquire_frame().unwrap();
        assert_eq!(out.pts_us, 1_000);
        assert_eq!(out.pixel(0, 0), RED);
        assert_eq!(out.pixel(1, 1), BLUE);
    }

    #[test]
    fn test_split_transform_places_halves() {
        let s = setup(4, 2);
        let p = program(&s);
        let left = external_texture(&s, VideoFrame::filled(2, 2, 0, RED));
        let right = external_texture(&s, VideoFrame::filled(2, 2, 0, BLUE));
        bind_quad(&s, p);

        let gpu = &s.gpu;
        gpu.clear_color(s.ctx, [0.0, 1.0, 0.0, 1.0]).unwrap();
        gpu.clear(s.ctx).unwrap();
        for (tex, translate_x) in [(left, -0.5), (right, 0.5)] {
            gpu.bind_texture(s.ctx, TextureTarget::ExternalOes, Some(tex)).unwrap();
            set_half(&s, p, 0.5, translate_x);
            gpu.draw_arrays(s.ctx, Primitive::TriangleStrip, 0, 4).unwrap();
        }
        gpu.swap_buffers(s.display, s.window).unwrap();

        let out = s.target.acquire_frame().unwrap();
        for y in 0..2 {
            assert_eq!(out.pixel(0, y), RED);
            assert_eq!(out.pixel(1, y), RED);
            assert_eq!(out.pixel(2, y), BLUE);
            assert_eq!(out.pixel(3, y), BLUE);
        }
    }

    proptest! {
        #[test]
        fn prop_split_covers_each_half(half_width in 1u32..16, height in 1u32..12) {
            let s = setup(half_width * 2, height);
            let p = program(&s);
            let left = external_texture(&s, VideoFrame::filled(3, 5, 0, RED));
            let right = external_texture(&s, VideoFrame::filled(7, 2, 0, BLUE));
            bind_quad(&s, p);

            let gpu = &s.gpu;
            gpu.clear(s.ctx).unwrap();
            for (tex, translate_x) in [(left, -0.5), (right, 0.5)] {
                gpu.bind_texture(s.ctx, TextureTarget::ExternalOes, Some(tex)).unwrap();
                set_half(&s, p, 0.5, translate_x);
                gpu.draw_arrays(s.ctx, Primitive::TriangleStrip, 0, 4).unwrap();
            }
            gpu.swap_buffers(s.display, s.window).unwrap();

            let out = s.target.acquire_frame().unwrap();
            for y in 0..height {
                for x in 0..half_width * 2 {
                    let expected = if x < half_width { RED } else { BLUE };
                    prop_assert_eq!(out.pixel(x, y), expected);
                }
            }
        }
    }

    #[test]
    fn test_calls_require_current_context() {
        let s = setup(2, 2);
        let other = s.ctx;
        s.gpu.release_thread().unwrap();
        assert_eq!(s.gpu.current_context(), None);
        assert!(s.gpu.gen_texture(other).is_err());

        s.gpu
            .make_current(s.display, Some(s.window), Some(s.ctx))
            .unwrap();
        let gpu = &s.gpu;
        let ctx = s.ctx;
        let display = s.display;
        let window = s.window;
        std::thread::scope(|scope| {
            scope
                .spawn(|| {
                    assert!(gpu.make_current(display, Some(window), Some(ctx)).is_err());
                    assert!(gpu.clear(ctx).is_err());
                })
                .join()
                .unwrap();
        });
    }

    #[test]
    fn test_compile_failure_reports_log() {
        let s = setup(2, 2);
        let shader = s.gpu.create_shader(s.ctx, ShaderStage::Fragment).unwrap();
        s.gpu
            .shader_source(s.ctx, shader, "void main() { gl_FragColor = oops; }")
            .unwrap();
        assert!(!s.gpu.compile_shader(s.ctx, shader).unwrap());
        assert!(s.gpu.shader_info_log(s.ctx, shader).unwrap().starts_with("ERROR: 0:1:"));

        let p = s.gpu.create_program(s.ctx).unwrap();
        s.gpu.attach_shader(s.ctx, p, shader).unwrap();
        assert!(!s.gpu.link_program(s.ctx, p).unwrap());
        assert!(!s.gpu.program_info_log(s.ctx, p).unwrap().is_empty());
        assert!(s.gpu.use_program(s.ctx, Some(p)).is_err());
    }

    #[test]
    fn test_uniform_type_checked() {
        let s = setup(2, 2);
        let p = program(&s);
        s.gpu.use_program(s.ctx, Some(p)).unwrap();
        let sampler = s.gpu.uniform_location(s.ctx, p, "sTexture").unwrap().unwrap();
        assert!(s.gpu.uniform1f(s.ctx, sampler, 1.0).is_err());
        assert!(s.gpu.uniform1i(s.ctx, sampler, 99).is_err());
    }

    #[test]
    fn test_terminate_frees_everything() {
        let s = setup(4, 4);
        program(&s);
        s.gpu.gen_texture(s.ctx).unwrap();
        let counts = s.gpu.object_counts();
        assert_eq!(counts.contexts, 1);
        assert_eq!(counts.surfaces, 1);
        assert_eq!(counts.textures, 1);
        assert_eq!(counts.programs, 1);

        s.gpu.make_current(s.display, None, None).unwrap();
        s.gpu.destroy_surface(s.display, s.window).unwrap();
        s.gpu.destroy_context(s.display, s.ctx).unwrap();
        s.gpu.terminate(s.display).unwrap();
        assert!(s.gpu.object_counts().is_empty());
    }

    #[test]
    fn test_swap_after_target_closed_fails() {
        let s = setup(2, 2);
        s.target.close_input();
        assert!(s.gpu.swap_buffers(s.display, s.window).is_err());
    }
}
