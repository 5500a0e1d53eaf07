//! Shader source adjustments for CPU-uploaded pictures.

const EXTERNAL_IMAGE_EXTENSION: &str = "GL_OES_EGL_image_external";

/// Decoded pictures reach this device as RGBA in memory and are uploaded
/// into 2D textures, so external samplers become `sampler2D` and the
/// external-image extension directive is blanked. Line numbers are kept so
/// driver logs still point at the caller's source.
pub fn adapt_fragment_source(source: &str) -> String {
    source
        .split('\n')
        .map(|line| {
            let directive = line.trim_start();
            if directive.starts_with("#extension") && directive.contains(EXTERNAL_IMAGE_EXTENSION) {
                String::new()
            } else {
                line.replace("samplerExternalOES", "sampler2D")
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
