//! Check codec backend availability.

use duocam_gles::GlesGpu;
use duocam_gst::{probe_environment, H264_ENCODERS};

pub fn run() -> anyhow::Result<()> {
    println!("DuoCam System Check");
    println!("{}", "=".repeat(50));

    let env = probe_environment();
    match &env.version {
        Some(version) => println!("[OK] {version}"),
        None => println!("[FAIL] GStreamer could not be initialized"),
    }

    match &env.encoder {
        Some(name) if env.hardware_encoder => println!("[OK] H.264 encoder: {name} (hardware)"),
        Some(name) => println!("[OK] H.264 encoder: {name} (software)"),
        None => {
            println!("[FAIL] No H.264 encoder found");
            println!("     Looked for: {}", H264_ENCODERS.join(", "));
        }
    }

    if env.missing_elements.is_empty() {
        if env.version.is_some() {
            println!("[OK] Required elements present");
        }
    } else {
        println!("[FAIL] Missing elements: {}", env.missing_elements.join(", "));
    }

    let egl = GlesGpu::is_available();
    if egl {
        println!("[OK] EGL display with OpenGL ES 2.0");
    } else {
        println!("[FAIL] No usable EGL display (headless hosts can set EGL_PLATFORM=surfaceless)");
    }

    println!("[OK] Software backend: always available (Y4M output)");

    println!();
    if env.is_usable() && egl {
        println!("GStreamer backend is ready. `duocam merge` will write MP4/H.264.");
    } else {
        println!("GStreamer backend is unavailable. Use `--backend software` or install the missing plugins and EGL drivers.");
    }

    Ok(())
}
