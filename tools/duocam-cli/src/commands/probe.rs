//! Show a recording's tracks.

use std::path::PathBuf;

use duocam_common::us_to_secs;

use crate::backend::Backend;

pub fn run(path: PathBuf, backend: Backend) -> anyhow::Result<()> {
    let codecs = backend.codecs()?;
    let mut extractor = codecs
        .create_extractor(&path)
        .map_err(|e| anyhow::anyhow!("Failed to open recording: {}", e.user_message()))?;

    println!("Recording: {}", path.display());
    println!("  Tracks: {}", extractor.track_count());
    let mut has_video = false;
    for index in 0..extractor.track_count() {
        let format = extractor.track_format(index)?;
        if format.is_video() {
            has_video = true;
            println!(
                "  [{index}] video {} {}x{} @ {}fps{}",
                format.mime,
                format.width.unwrap_or(0),
                format.height.unwrap_or(0),
                format.frame_rate.map_or("?".to_string(), |fps| format!("{fps:.2}")),
                format
                    .duration_us
                    .map_or(String::new(), |d| format!(", {:.2}s", us_to_secs(d))),
            );
        } else if format.is_audio() {
            println!(
                "  [{index}] audio {} {}Hz x{} (not merged)",
                format.mime,
                format.sample_rate.unwrap_or(0),
                format.channel_count.unwrap_or(0),
            );
        } else {
            println!("  [{index}] {}", format.mime);
        }
    }
    extractor.release();

    if !has_video {
        println!();
        println!("No video track: this file cannot be merged.");
    }
    Ok(())
}
