//! Side-by-side composition of two external textures.

use duocam_codec_core::{
    Primitive, TextureFilter, TextureId, TextureParam, TextureTarget, TextureWrap,
};
use duocam_common::DuocamResult;

use crate::render_context::Current;
use crate::shader::ShaderProgram;

/// Full-screen quad as a triangle strip, in clip space.
pub const QUAD_VERTICES: [f32; 8] = [-1.0, -1.0, 1.0, -1.0, -1.0, 1.0, 1.0, 1.0];

/// Texture coordinates for [`QUAD_VERTICES`]. Decoded pictures are stored
/// top row first, so t = 0 is the top of the picture.
pub const QUAD_TEX_COORDS: [f32; 8] = [0.0, 1.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0];

/// Horizontal scale and offset for one half of the frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HalfPlacement {
    pub scale_x: f32,
    pub translate_x: f32,
}

pub const LEFT_HALF: HalfPlacement = HalfPlacement {
    scale_x: 0.5,
    translate_x: -0.5,
};

pub const RIGHT_HALF: HalfPlacement = HalfPlacement {
    scale_x: 0.5,
    translate_x: 0.5,
};

/// Generate an external texture with linear filtering and clamped edges,
/// ready to latch decoder output.
pub fn create_external_texture(current: &Current<'_>) -> DuocamResult<TextureId> {
    let (gpu, ctx) = (current.gpu(), current.id());
    let texture = gpu.gen_texture(ctx)?;
    gpu.bind_texture(ctx, TextureTarget::ExternalOes, Some(texture))?;
    for param in [
        TextureParam::MinFilter(TextureFilter::Linear),
        TextureParam::MagFilter(TextureFilter::Linear),
        TextureParam::WrapS(TextureWrap::ClampToEdge),
        TextureParam::WrapT(TextureWrap::ClampToEdge),
    ] {
        gpu.tex_parameter(ctx, TextureTarget::ExternalOes, param)?;
    }
    gpu.bind_texture(ctx, TextureTarget::ExternalOes, None)?;
    Ok(texture)
}

/// Draws the front camera into the left half and the back camera into the
/// right half of the target.
#[derive(Debug)]
pub struct Compositor {
    program: ShaderProgram,
    clear_color: [f32; 4],
}

impl Compositor {
    pub fn init(current: &Current<'_>, clear_color: [f32; 4]) -> DuocamResult<Self> {
        Ok(Self {
            program: ShaderProgram::init(current)?,
            clear_color,
        })
    }

    pub fn program(&self) -> &ShaderProgram {
        &self.program
    }

    pub fn clear(&self, current: &Current<'_>) -> DuocamResult<()> {
        current.gpu().clear_color(current.id(), self.clear_color)?;
        current.gpu().clear(current.id())
    }

    /// Draw `left` then `right`, each squeezed into half the frame.
    pub fn draw_split(
        &self,
        current: &Current<'_>,
        left: TextureId,
        right: TextureId,
    ) -> DuocamResult<()> {
        let (gpu, ctx) = (current.gpu(), current.id());
        let p = &self.program;

        gpu.use_program(ctx, Some(p.program))?;
        gpu.vertex_attrib_pointer(ctx, p.a_position, 2, &QUAD_VERTICES)?;
        gpu.vertex_attrib_pointer(ctx, p.a_tex_coord, 2, &QUAD_TEX_COORDS)?;
        gpu.enable_vertex_attrib_array(ctx, p.a_position)?;
        gpu.enable_vertex_attrib_array(ctx, p.a_tex_coord)?;
        gpu.active_texture(ctx, 0)?;
        gpu.uniform1i(ctx, p.s_texture, 0)?;

        for (texture, half) in [(left, LEFT_HALF), (right, RIGHT_HALF)] {
            gpu.bind_texture(ctx, TextureTarget::ExternalOes, Some(texture))?;
            gpu.uniform1f(ctx, p.u_scale_x, half.scale_x)?;
            gpu.uniform1f(ctx, p.u_translate_x, half.translate_x)?;
            gpu.draw_arrays(ctx, Primitive::TriangleStrip, 0, 4)?;
        }

        gpu.disable_vertex_attrib_array(ctx, p.a_position)?;
        gpu.disable_vertex_attrib_array(ctx, p.a_tex_coord)?;
        gpu.bind_texture(ctx, TextureTarget::ExternalOes, None)
    }

    pub fn release(&self, current: &Current<'_>) -> DuocamResult<()> {
        self.program.release(current)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::render_context::RenderContext;
    use duocam_codec_core::{GpuDevice, Surface, SurfaceTexture, VideoFrame};
    use duocam_software::SoftwareGpu;

    const RED: [u8; 4] = [255, 0, 0, 255];
    const BLUE: [u8; 4] = [0, 0, 255, 255];

    #[test]
    fn test_left_and_right_halves() {
        let gpu = Arc::new(SoftwareGpu::new());
        let target = Surface::new(8, 4);
        let render = RenderContext::init(gpu.clone(), &target).unwrap();
        let current = render.make_current().unwrap();
        let compositor = Compositor::init(&current, [0.0, 0.0, 0.0, 1.0]).unwrap();

        let front = SurfaceTexture::new();
        let back = SurfaceTexture::new();
        front.post(VideoFrame::filled(4, 4, 0, RED));
        back.post(VideoFrame::filled(4, 4, 0, BLUE));
        let left = create_external_texture(&current).unwrap();
        let right = create_external_texture(&current).unwrap();
        gpu.update_tex_image(current.id(), left, &front).unwrap();
        gpu.update_tex_image(current.id(), right, &back).unwrap();

        compositor.clear(&current).unwrap();
        compositor.draw_split(&current, left, right).unwrap();
        render.present(0).unwrap();

        let frame = target.acquire_frame().unwrap();
        for y in 0..4 {
            assert_eq!(frame.pixel(1, y), RED);
            assert_eq!(frame.pixel(6, y), BLUE);
        }
    }

    #[test]
    fn test_top_of_picture_stays_on_top() {
        let gpu = Arc::new(SoftwareGpu::new());
        let target = Surface::new(4, 4);
        let render = RenderContext::init(gpu.clone(), &target).unwrap();
        let current = render.make_current().unwrap();
        let compositor = Compositor::init(&current, [0.0, 0.0, 0.0, 1.0]).unwrap();

        let mut picture = VideoFrame::filled(2, 2, 0, BLUE);
        picture.set_pixel(0, 0, RED);
        picture.set_pixel(1, 0, RED);
        let source = SurfaceTexture::new();
        let tex = create_external_texture(&current).unwrap();
        source.post(picture);
        gpu.update_tex_image(current.id(), tex, &source).unwrap();

        compositor.clear(&current).unwrap();
        compositor.draw_split(&current, tex, tex).unwrap();
        render.present(0).unwrap();

        let frame = target.acquire_frame().unwrap();
        assert_eq!(frame.pixel(0, 0), RED);
        assert_eq!(frame.pixel(3, 0), RED);
        assert_eq!(frame.pixel(0, 3), BLUE);
        assert_eq!(frame.pixel(3, 3), BLUE);
    }

    #[test]
    fn test_release_deletes_program() {
        let gpu = Arc::new(SoftwareGpu::new());
        let target = Surface::new(2, 2);
        let render = RenderContext::init(gpu.clone(), &target).unwrap();
        let current = render.make_current().unwrap();
        let compositor = Compositor::init(&current, [0.0; 4]).unwrap();
        compositor.release(&current).unwrap();
        assert_eq!(gpu.object_counts().programs, 0);
    }
}
