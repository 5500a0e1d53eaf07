//! Compositor and shader program on a real OpenGL ES driver.
//!
//! Every test returns early on hosts without a usable EGL display.

use std::sync::Arc;

use duocam_codec_core::{GpuDevice, ShaderStage, Surface, SurfaceTexture, VideoFrame};
use duocam_common::DuocamError;
use duocam_gles::GlesGpu;
use duocam_merge_engine::{create_external_texture, Compositor, RenderContext, ShaderProgram};

const RED: [u8; 4] = [255, 0, 0, 255];
const BLUE: [u8; 4] = [0, 0, 255, 255];

fn gles() -> Option<Arc<GlesGpu>> {
    if !GlesGpu::is_available() {
        println!("Skipping test (no EGL display)");
        return None;
    }
    match GlesGpu::new() {
        Ok(gpu) => Some(Arc::new(gpu)),
        Err(e) => {
            println!("Skipping test (no EGL display): {e}");
            None
        }
    }
}

fn near(actual: [u8; 4], expected: [u8; 4]) -> bool {
    actual
        .iter()
        .zip(expected)
        .all(|(&a, e)| (a as i16 - e as i16).abs() <= 2)
}

#[test]
fn test_driver_draws_halves_upright() {
    let Some(gpu) = gles() else { return };
    let target = Surface::new(16, 8);
    let mut render = RenderContext::init(gpu.clone(), &target).unwrap();
    {
        let current = render.make_current().unwrap();
        let compositor = Compositor::init(&current, [0.0, 1.0, 0.0, 1.0]).unwrap();

        let mut front_picture = VideoFrame::filled(8, 8, 0, BLUE);
        for x in 0..8 {
            for y in 0..4 {
                front_picture.set_pixel(x, y, RED);
            }
        }
        let front = SurfaceTexture::new();
        let back = SurfaceTexture::new();
        front.post(front_picture);
        back.post(VideoFrame::filled(8, 8, 0, BLUE));
        let left = create_external_texture(&current).unwrap();
        let right = create_external_texture(&current).unwrap();
        assert_eq!(gpu.update_tex_image(current.id(), left, &front).unwrap(), Some(0));
        assert_eq!(gpu.update_tex_image(current.id(), right, &back).unwrap(), Some(0));

        compositor.clear(&current).unwrap();
        compositor.draw_split(&current, left, right).unwrap();
        render.present(33_333).unwrap();

        gpu.delete_texture(current.id(), left).unwrap();
        gpu.delete_texture(current.id(), right).unwrap();
        compositor.release(&current).unwrap();
    }

    let frame = target.acquire_frame().unwrap();
    assert_eq!(frame.pts_us, 33_333);
    assert_eq!((frame.width, frame.height), (16, 8));
    assert!(near(frame.pixel(2, 0), RED), "{:?}", frame.pixel(2, 0));
    assert!(near(frame.pixel(2, 7), BLUE), "{:?}", frame.pixel(2, 7));
    for y in [0, 7] {
        assert!(near(frame.pixel(13, y), BLUE), "{:?}", frame.pixel(13, y));
    }

    render.release();
    assert!(gpu.object_counts().is_empty());
}

#[test]
fn test_driver_compile_error_has_log() {
    let Some(gpu) = gles() else { return };
    let target = Surface::new(4, 4);
    let render = RenderContext::init(gpu.clone(), &target).unwrap();
    let current = render.make_current().unwrap();

    let shader = gpu.create_shader(current.id(), ShaderStage::Fragment).unwrap();
    gpu.shader_source(
        current.id(),
        shader,
        "precision mediump float;\nvoid main() {\n    gl_FragColor = nope;\n}\n",
    )
    .unwrap();
    assert!(!gpu.compile_shader(current.id(), shader).unwrap());
    assert!(!gpu.shader_info_log(current.id(), shader).unwrap().trim().is_empty());
    gpu.delete_shader(current.id(), shader).unwrap();

    // The real shaders link and resolve every location.
    let program = ShaderProgram::init(&current).unwrap();
    program.release(&current).unwrap();
}

#[test]
fn test_driver_rejects_calls_off_thread() {
    let Some(gpu) = gles() else { return };
    let target = Surface::new(4, 4);
    let render = RenderContext::init(gpu.clone(), &target).unwrap();
    let current = render.make_current().unwrap();
    let ctx = current.id();

    std::thread::scope(|scope| {
        scope
            .spawn(|| match gpu.gen_texture(ctx) {
                Err(DuocamError::Gpu { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
                Ok(texture) => panic!("{texture:?} created without a current context"),
            })
            .join()
            .unwrap();
    });
}
