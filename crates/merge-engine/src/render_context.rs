//! EGL-style display/context/window-surface triple targeting the encoder's
//! input surface.

use std::sync::Arc;

use duocam_codec_core::{
    ConfigAttribs, ContextId, DisplayId, GpuDevice, Surface, SurfaceId,
};
use duocam_common::{DuocamError, DuocamResult};

/// A context bound to the calling thread. GL work is issued through this
/// handle so it can only happen after [`RenderContext::make_current`].
#[derive(Clone, Copy)]
pub struct Current<'a> {
    gpu: &'a dyn GpuDevice,
    context: ContextId,
}

impl<'a> Current<'a> {
    pub fn gpu(&self) -> &'a dyn GpuDevice {
        self.gpu
    }

    pub fn id(&self) -> ContextId {
        self.context
    }
}

impl std::fmt::Debug for Current<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Current").field(&self.context).finish()
    }
}

#[derive(Default)]
struct Partial {
    display: Option<DisplayId>,
    context: Option<ContextId>,
    surface: Option<SurfaceId>,
}

impl Partial {
    fn teardown(&self, gpu: &dyn GpuDevice) {
        let Some(display) = self.display else {
            return;
        };
        let _ = gpu.make_current(display, None, None);
        if let Some(surface) = self.surface {
            let _ = gpu.destroy_surface(display, surface);
        }
        if let Some(context) = self.context {
            let _ = gpu.destroy_context(display, context);
        }
        let _ = gpu.terminate(display);
    }
}

pub struct RenderContext {
    gpu: Arc<dyn GpuDevice>,
    display: DisplayId,
    context: ContextId,
    surface: SurfaceId,
    size: (u32, u32),
    released: bool,
}

impl std::fmt::Debug for RenderContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderContext")
            .field("gpu", &self.gpu.name())
            .field("display", &self.display)
            .field("context", &self.context)
            .field("surface", &self.surface)
            .field("size", &self.size)
            .field("released", &self.released)
            .finish()
    }
}

impl RenderContext {
    /// Set up a context rendering into `target` and make it current.
    /// Anything created before a failing step is destroyed again.
    pub fn init(gpu: Arc<dyn GpuDevice>, target: &Surface) -> DuocamResult<Self> {
        let mut partial = Partial::default();
        if let Err(e) = Self::build(gpu.as_ref(), target, &mut partial) {
            partial.teardown(gpu.as_ref());
            return Err(e);
        }
        let (Some(display), Some(context), Some(surface)) =
            (partial.display, partial.context, partial.surface)
        else {
            partial.teardown(gpu.as_ref());
            return Err(DuocamError::context_init("incomplete render context"));
        };
        let size = target.size();
        tracing::debug!(
            gpu = gpu.name(),
            width = size.0,
            height = size.1,
            "Render context ready"
        );
        Ok(Self {
            gpu,
            display,
            context,
            surface,
            size,
            released: false,
        })
    }

    fn build(gpu: &dyn GpuDevice, target: &Surface, partial: &mut Partial) -> DuocamResult<()> {
        let step = |what: &'static str| {
            move |e: DuocamError| DuocamError::context_init(format!("{what} failed: {e}"))
        };

        let display = gpu.get_display().map_err(step("get display"))?;
        let (major, minor) = gpu.initialize(display).map_err(step("initialize display"))?;
        partial.display = Some(display);
        tracing::debug!(major, minor, "GPU display initialized");

        let config = gpu
            .choose_config(display, &ConfigAttribs::rgba8888_es2())
            .map_err(step("choose config"))?
            .ok_or_else(|| {
                DuocamError::context_init("no RGBA8888 ES2 recordable config available")
            })?;

        let context = gpu
            .create_context(display, config, 2)
            .map_err(step("create context"))?;
        partial.context = Some(context);

        let surface = gpu
            .create_window_surface(display, config, target)
            .map_err(step("create window surface"))?;
        partial.surface = Some(surface);

        gpu.make_current(display, Some(surface), Some(context))
            .map_err(step("make current"))?;
        let (width, height) = target.size();
        gpu.viewport(context, 0, 0, width, height)
            .map_err(step("set viewport"))?;
        Ok(())
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Bind the context to the calling thread. Must precede every frame's
    /// drawing since decoders update textures from other threads.
    pub fn make_current(&self) -> DuocamResult<Current<'_>> {
        if self.released {
            return Err(DuocamError::gpu("render context has been released"));
        }
        self.gpu
            .make_current(self.display, Some(self.surface), Some(self.context))?;
        Ok(Current {
            gpu: self.gpu.as_ref(),
            context: self.context,
        })
    }

    /// Push the composed frame to the encoder surface with timestamp
    /// `pts_us`.
    pub fn present(&self, pts_us: i64) -> DuocamResult<()> {
        if self.released {
            return Err(DuocamError::gpu("render context has been released"));
        }
        self.gpu
            .set_presentation_time(self.display, self.surface, pts_us)?;
        self.gpu.swap_buffers(self.display, self.surface)
    }

    /// Unbind and destroy the surface, context and display. A second call
    /// is a logged no-op.
    pub fn release(&mut self) {
        if self.released {
            tracing::debug!("Render context already released");
            return;
        }
        self.released = true;
        let gpu = self.gpu.as_ref();
        let steps = [
            ("unbind", gpu.make_current(self.display, None, None)),
            ("destroy surface", gpu.destroy_surface(self.display, self.surface)),
            ("destroy context", gpu.destroy_context(self.display, self.context)),
            ("release thread", gpu.release_thread()),
            ("terminate display", gpu.terminate(self.display)),
        ];
        for (what, result) in steps {
            if let Err(e) = result {
                tracing::warn!(step = what, error = %e, "Render context teardown step failed");
            }
        }
        tracing::debug!("Render context released");
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        self.release();
    }
}
