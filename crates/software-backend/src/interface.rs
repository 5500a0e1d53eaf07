//! Shader interface checks for [`SoftwareGpu`](crate::SoftwareGpu).
//!
//! Sources are not executed. Compiling scans the global declarations and
//! the names used inside function bodies; linking matches varyings and
//! assigns attribute and uniform locations in declaration order. Logs use
//! the `ERROR: 0:<line>: ` prefix GLES drivers print.

use duocam_codec_core::ShaderStage;

const EXTERNAL_IMAGE_EXTENSION: &str = "GL_OES_EGL_image_external";

const TYPES: &[&str] = &[
    "void", "bool", "int", "float", "vec2", "vec3", "vec4", "mat2", "mat3", "mat4",
    "sampler2D", "samplerExternalOES",
];

const BUILTINS: &[&str] = &[
    "gl_Position", "gl_FragColor", "gl_FragCoord", "texture2D", "mix", "clamp", "min", "max",
    "abs", "dot", "fract", "floor", "return", "if", "else", "for", "true", "false",
];

const PRECISIONS: &[&str] = &["lowp", "mediump", "highp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniformType {
    Float,
    Int,
    Sampler2D,
    SamplerExternal,
    Other,
}

impl UniformType {
    fn from_name(name: &str) -> Self {
        match name {
            "float" => Self::Float,
            "int" | "bool" => Self::Int,
            "sampler2D" => Self::Sampler2D,
            "samplerExternalOES" => Self::SamplerExternal,
            _ => Self::Other,
        }
    }

    pub fn is_sampler(self) -> bool {
        matches!(self, Self::Sampler2D | Self::SamplerExternal)
    }
}

/// Globals one compiled shader declares.
#[derive(Debug, Clone, Default)]
pub struct ShaderInterface {
    pub attributes: Vec<String>,
    pub uniforms: Vec<(String, UniformType)>,
    pub varyings: Vec<String>,
}

/// Locations of a linked vertex/fragment pair.
#[derive(Debug, Clone, Default)]
pub struct ProgramInterface {
    pub attributes: Vec<String>,
    pub uniforms: Vec<(String, UniformType)>,
}

impl ProgramInterface {
    pub fn attrib_location(&self, name: &str) -> Option<u32> {
        self.attributes.iter().position(|a| a == name).map(|i| i as u32)
    }

    pub fn uniform_location(&self, name: &str) -> Option<u32> {
        self.uniforms.iter().position(|(u, _)| u == name).map(|i| i as u32)
    }

    pub fn uniform_type(&self, location: u32) -> Option<UniformType> {
        self.uniforms.get(location as usize).map(|(_, ty)| *ty)
    }
}

fn error(line: usize, token: &str, message: &str) -> String {
    format!("ERROR: 0:{line}: '{token}' : {message}\n")
}

fn identifiers(code: &str) -> impl Iterator<Item = (bool, &str)> {
    let mut rest = code;
    std::iter::from_fn(move || {
        let start = rest.find(|c: char| c.is_ascii_alphabetic() || c == '_')?;
        let after_dot = rest[..start].trim_end().ends_with('.');
        let tail = &rest[start..];
        let len = tail
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(tail.len());
        rest = &tail[len..];
        Some((after_dot, &tail[..len]))
    })
}

pub fn compile(stage: ShaderStage, source: &str) -> Result<ShaderInterface, String> {
    let mut interface = ShaderInterface::default();
    let mut external_enabled = false;
    let mut depth = 0usize;
    let mut locals: Vec<String> = Vec::new();
    let mut has_main = false;

    for (index, raw) in source.lines().enumerate() {
        let line_no = index + 1;
        let line = raw.split("//").next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        if depth == 0 {
            if let Some(directive) = line.strip_prefix('#') {
                if directive.trim_start().starts_with("extension")
                    && directive.contains(EXTERNAL_IMAGE_EXTENSION)
                {
                    external_enabled = true;
                }
                continue;
            }
            if line.starts_with("precision ") {
                continue;
            }
            if line.starts_with("void main") {
                has_main = true;
                locals.clear();
            } else {
                declare(stage, line, line_no, external_enabled, &mut interface)?;
                continue;
            }
        }

        let mut previous_was_type = false;
        for (after_dot, name) in identifiers(line) {
            if after_dot {
                previous_was_type = false;
                continue;
            }
            if previous_was_type && !TYPES.contains(&name) && name != "main" {
                locals.push(name.to_string());
            } else if !known(name, &interface, &locals) {
                return Err(error(line_no, name, "undeclared identifier"));
            }
            previous_was_type = TYPES.contains(&name);
        }

        for c in line.chars() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth = depth
                        .checked_sub(1)
                        .ok_or_else(|| error(line_no, "}", "syntax error"))?;
                }
                _ => {}
            }
        }
    }

    if depth != 0 {
        return Err(error(source.lines().count(), "", "syntax error: unexpected end of file"));
    }
    if !has_main {
        return Err("ERROR: 0:0: '' : Missing main()\n".to_string());
    }
    Ok(interface)
}

fn known(name: &str, interface: &ShaderInterface, locals: &[String]) -> bool {
    name == "main"
        || TYPES.contains(&name)
        || PRECISIONS.contains(&name)
        || BUILTINS.contains(&name)
        || interface.attributes.iter().any(|a| a == name)
        || interface.varyings.iter().any(|v| v == name)
        || interface.uniforms.iter().any(|(u, _)| u == name)
        || locals.iter().any(|l| l == name)
}

/// `attribute|uniform|varying [precision] type name;`
fn declare(
    stage: ShaderStage,
    line: &str,
    line_no: usize,
    external_enabled: bool,
    interface: &mut ShaderInterface,
) -> Result<(), String> {
    let Some(body) = line.strip_suffix(';') else {
        return Err(error(line_no, line, "syntax error"));
    };
    let tokens: Vec<&str> = body
        .split_whitespace()
        .filter(|t| !PRECISIONS.contains(t))
        .collect();
    let [qualifier, ty, name] = tokens[..] else {
        return Err(error(line_no, line, "syntax error"));
    };
    if !TYPES.contains(&ty) || ty == "void" {
        return Err(error(line_no, ty, "unknown type"));
    }
    if ty == "samplerExternalOES" && !external_enabled {
        return Err(error(
            line_no,
            ty,
            "requires extension GL_OES_EGL_image_external to be enabled",
        ));
    }
    match qualifier {
        "attribute" if stage == ShaderStage::Vertex => interface.attributes.push(name.to_string()),
        "attribute" => {
            return Err(error(line_no, "attribute", "supported in vertex shaders only"))
        }
        "varying" => interface.varyings.push(name.to_string()),
        "uniform" => interface
            .uniforms
            .push((name.to_string(), UniformType::from_name(ty))),
        other => return Err(error(line_no, other, "syntax error")),
    }
    Ok(())
}

pub fn link(vertex: &ShaderInterface, fragment: &ShaderInterface) -> Result<ProgramInterface, String> {
    let mut log = String::new();
    for varying in &fragment.varyings {
        if !vertex.varyings.contains(varying) {
            log.push_str(&format!(
                "ERROR: Varying '{varying}' is read by the fragment shader but not declared in the vertex shader.\n"
            ));
        }
    }
    let mut uniforms = vertex.uniforms.clone();
    for (name, ty) in &fragment.uniforms {
        match uniforms.iter().find(|(n, _)| n == name) {
            Some((_, existing)) if existing != ty => log.push_str(&format!(
                "ERROR: Uniform '{name}' differs in type between shader stages.\n"
            )),
            Some(_) => {}
            None => uniforms.push((name.clone(), *ty)),
        }
    }
    if !log.is_empty() {
        return Err(log);
    }
    Ok(ProgramInterface {
        attributes: vertex.attributes.clone(),
        uniforms,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const VERTEX: &str = "attribute vec4 aPosition;
attribute vec2 aTexCoord;
varying vec2 vTexCoord;
uniform float uScaleX;
void main() {
    vec4 scaled = aPosition;
    scaled.x = aPosition.x * uScaleX;
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

    #[test]
    fn test_declarations_are_collected() {
        let vs = compile(ShaderStage::Vertex, VERTEX).unwrap();
        assert_eq!(vs.attributes, ["aPosition", "aTexCoord"]);
        assert_eq!(vs.varyings, ["vTexCoord"]);
        let fs = compile(ShaderStage::Fragment, FRAGMENT).unwrap();
        assert_eq!(fs.uniforms, [("sTexture".to_string(), UniformType::SamplerExternal)]);

        let program = link(&vs, &fs).unwrap();
        assert_eq!(program.attrib_location("aTexCoord"), Some(1));
        assert_eq!(program.uniform_location("sTexture"), Some(1));
        assert_eq!(program.uniform_type(0), Some(UniformType::Float));
    }

    #[test]
    fn test_undeclared_name_reports_line() {
        let log = compile(
            ShaderStage::Fragment,
            "precision mediump float;\nvoid main() {\n    gl_FragColor = nope;\n}\n",
        )
        .unwrap_err();
        assert_eq!(log, "ERROR: 0:3: 'nope' : undeclared identifier\n");
    }

    #[test]
    fn test_external_sampler_needs_extension() {
        let source = FRAGMENT.replacen("#extension GL_OES_EGL_image_external : require", "", 1);
        let log = compile(ShaderStage::Fragment, &source).unwrap_err();
        assert!(log.starts_with("ERROR: 0:4:"), "{log}");
    }

    #[test]
    fn test_missing_main_and_attribute_in_fragment() {
        assert!(compile(ShaderStage::Vertex, "attribute vec4 a;\n")
            .unwrap_err()
            .contains("Missing main()"));
        assert!(compile(ShaderStage::Fragment, "attribute vec4 a;\nvoid main() {}\n")
            .unwrap_err()
            .contains("vertex shaders only"));
    }

    #[test]
    fn test_unmatched_varying_fails_link() {
        let vs = compile(
            ShaderStage::Vertex,
            "attribute vec4 aPosition;\nvoid main() {\n    gl_Position = aPosition;\n}\n",
        )
        .unwrap();
        let fs = compile(ShaderStage::Fragment, FRAGMENT).unwrap();
        let log = link(&vs, &fs).unwrap_err();
        assert!(log.contains("'vTexCoord'"), "{log}");
    }
}
