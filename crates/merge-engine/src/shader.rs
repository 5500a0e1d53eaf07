//! The split-screen shader program.

use duocam_codec_core::{ProgramId, ShaderId, ShaderStage, UniformLocation};
use duocam_common::{DuocamError, DuocamResult};

use crate::render_context::Current;

/// Squeezes the unit quad horizontally and shifts it into one half of the
/// frame.
pub const VERTEX_SHADER: &str = "attribute vec4 aPosition;
attribute vec2 aTexCoord;
varying vec2 vTexCoord;
uniform float uScaleX;
uniform float uTranslateX;
void main() {
    vec4 scaled = aPosition;
    scaled.x = aPosition.x * uScaleX + uTranslateX;
    gl_Position = scaled;
    vTexCoord = aTexCoord;
}
";

/// Samples the decoder's external texture.
pub const FRAGMENT_SHADER: &str = "#extension GL_OES_EGL_image_external : require
precision mediump float;
varying vec2 vTexCoord;
uniform samplerExternalOES sTexture;
void main() {
    gl_FragColor = texture2D(sTexture, vTexCoord);
}
";

/// Linked program plus its resolved attribute and uniform locations.
#[derive(Debug, Clone, Copy)]
pub struct ShaderProgram {
    pub program: ProgramId,
    pub a_position: u32,
    pub a_tex_coord: u32,
    pub u_scale_x: UniformLocation,
    pub u_translate_x: UniformLocation,
    pub s_texture: UniformLocation,
}

impl ShaderProgram {
    pub fn init(current: &Current<'_>) -> DuocamResult<Self> {
        Self::from_sources(current, VERTEX_SHADER, FRAGMENT_SHADER)
    }

    pub fn from_sources(current: &Current<'_>, vertex: &str, fragment: &str) -> DuocamResult<Self> {
        let vs = compile(current, ShaderStage::Vertex, vertex)?;
        let fs = match compile(current, ShaderStage::Fragment, fragment) {
            Ok(fs) => fs,
            Err(e) => {
                let _ = current.gpu().delete_shader(current.id(), vs);
                return Err(e);
            }
        };
        let linked = link(current, vs, fs);
        // The program keeps what it needs; the shader objects can go.
        for shader in [vs, fs] {
            let _ = current.gpu().delete_shader(current.id(), shader);
        }
        let program = linked?;
        match Self::resolve(current, program) {
            Ok(resolved) => Ok(resolved),
            Err(e) => {
                let _ = current.gpu().delete_program(current.id(), program);
                Err(e)
            }
        }
    }

    fn resolve(current: &Current<'_>, program: ProgramId) -> DuocamResult<Self> {
        let (gpu, ctx) = (current.gpu(), current.id());
        let attrib = |name: &str| {
            gpu.attrib_location(ctx, program, name)?.ok_or_else(|| DuocamError::ProgramLink {
                log: format!("program has no active attribute '{name}'"),
            })
        };
        let uniform = |name: &str| {
            gpu.uniform_location(ctx, program, name)?.ok_or_else(|| DuocamError::ProgramLink {
                log: format!("program has no active uniform '{name}'"),
            })
        };
        Ok(Self {
            program,
            a_position: attrib("aPosition")?,
            a_tex_coord: attrib("aTexCoord")?,
            u_scale_x: uniform("uScaleX")?,
            u_translate_x: uniform("uTranslateX")?,
            s_texture: uniform("sTexture")?,
        })
    }

    pub fn release(&self, current: &Current<'_>) -> DuocamResult<()> {
        current.gpu().use_program(current.id(), None)?;
        current.gpu().delete_program(current.id(), self.program)
    }
}

fn compile(current: &Current<'_>, stage: ShaderStage, source: &str) -> DuocamResult<ShaderId> {
    let (gpu, ctx) = (current.gpu(), current.id());
    let shader = gpu.create_shader(ctx, stage)?;
    gpu.shader_source(ctx, shader, source)?;
    if gpu.compile_shader(ctx, shader)? {
        return Ok(shader);
    }
    let log = gpu.shader_info_log(ctx, shader)?;
    let _ = gpu.delete_shader(ctx, shader);
    tracing::error!(%stage, log = %log.trim_end(), "Shader compilation failed");
    Err(DuocamError::ShaderCompile {
        stage: stage.to_string(),
        log,
    })
}

fn link(current: &Current<'_>, vs: ShaderId, fs: ShaderId) -> DuocamResult<ProgramId> {
    let (gpu, ctx) = (current.gpu(), current.id());
    let program = gpu.create_program(ctx)?;
    let linked = gpu
        .attach_shader(ctx, program, vs)
        .and_then(|()| gpu.attach_shader(ctx, program, fs))
        .and_then(|()| gpu.link_program(ctx, program));
    match linked {
        Ok(true) => Ok(program),
        Ok(false) => {
            let log = gpu.program_info_log(ctx, program)?;
            let _ = gpu.delete_program(ctx, program);
            tracing::error!(log = %log.trim_end(), "Program link failed");
            Err(DuocamError::ProgramLink { log })
        }
        Err(e) => {
            let _ = gpu.delete_program(ctx, program);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::render_context::RenderContext;
    use duocam_codec_core::{GpuDevice, Surface};
    use duocam_software::SoftwareGpu;

    fn context(gpu: &Arc<SoftwareGpu>) -> (RenderContext, Surface) {
        let target = Surface::new(4, 4);
        (RenderContext::init(gpu.clone(), &target).unwrap(), target)
    }

    #[test]
    fn test_compiles_and_resolves_locations() {
        let gpu = Arc::new(SoftwareGpu::new());
        let (render, _target) = context(&gpu);
        let current = render.make_current().unwrap();
        let program = ShaderProgram::init(&current).unwrap();
        assert_ne!(program.a_position, program.a_tex_coord);
        let counts = gpu.object_counts();
        assert_eq!(counts.programs, 1);
        assert_eq!(counts.shaders, 0);
        program.release(&current).unwrap();
        assert_eq!(gpu.object_counts().programs, 0);
    }

    #[test]
    fn test_compile_error_carries_log() {
        let gpu = Arc::new(SoftwareGpu::new());
        let (render, _target) = context(&gpu);
        let current = render.make_current().unwrap();
        let broken = "precision mediump float;\nvoid main() {\n    gl_FragColor = nope;\n}\n";
        let err = ShaderProgram::from_sources(&current, VERTEX_SHADER, broken).unwrap_err();
        match err {
            DuocamError::ShaderCompile { stage, log } => {
                assert_eq!(stage, "fragment");
                assert!(log.contains("ERROR: 0:3"), "{log}");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(gpu.object_counts().shaders, 0);
    }

    #[test]
    fn test_link_error_carries_log() {
        let gpu = Arc::new(SoftwareGpu::new());
        let (render, _target) = context(&gpu);
        let current = render.make_current().unwrap();
        let vertex = "attribute vec4 aPosition;\nvoid main() {\n    gl_Position = aPosition;\n}\n";
        let err = ShaderProgram::from_sources(&current, vertex, FRAGMENT_SHADER).unwrap_err();
        match err {
            DuocamError::ProgramLink { log } => assert!(log.contains("vTexCoord"), "{log}"),
            other => panic!("unexpected error: {other}"),
        }
        let counts = gpu.object_counts();
        assert_eq!((counts.shaders, counts.programs), (0, 0));
    }
}
