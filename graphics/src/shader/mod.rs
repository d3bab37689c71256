//! GLSL compute shader composition.
//!
//! [`ShaderComposer`] resolves `#include` directives, applies a
//! [`ShaderDefines`] set through naga's preprocessor, validates the module and
//! emits WGSL for the wgpu backend.
//!
//! # Example
//!
//! ```ignore
//! use avatar_graphics::shader::{ShaderComposer, ShaderDefines};
//!
//! let mut composer = ShaderComposer::new();
//! composer.register_include("ovr/skinning_packing.glsl", PACKING_SOURCE);
//!
//! let mut defines = ShaderDefines::new();
//! defines.enable("OVR_HAS_TANGENTS");
//! let wgsl = composer.compose(SKINNING_SOURCE, &defines)?;
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};

use avatar_core::profiling::profile_scope;

use crate::error::GraphicsError;

/// Shader composer for resolving includes and composing final compute shaders.
///
/// # Include Syntax
///
/// ```glsl
/// #include "ovr/skinning_packing.glsl"
/// ```
///
/// Each include is expanded at most once per composition.
///
/// # Shader Definitions
///
/// ```glsl
/// #ifdef OVR_HAS_TANGENTS
///     vec4 tangent = loadTangent(compactIndex);
/// #endif
/// ```
pub struct ShaderComposer {
    /// Registered include sources: path -> source text.
    includes: HashMap<String, String>,
}

impl Default for ShaderComposer {
    fn default() -> Self {
        Self::new()
    }
}

impl ShaderComposer {
    /// Create a new empty shader composer.
    pub fn new() -> Self {
        Self {
            includes: HashMap::new(),
        }
    }

    /// Register a single include source.
    ///
    /// The path is what appears in `#include "path"` directives.
    pub fn register_include(&mut self, path: &str, source: &str) {
        self.includes.insert(path.to_string(), source.to_string());
    }

    /// Resolve `#include` directives in a GLSL source without parsing it.
    pub fn resolve_glsl(&self, source: &str) -> Result<String, GraphicsError> {
        let mut included = HashSet::new();
        self.resolve_includes(source, &mut included)
    }

    /// Compose a GLSL compute shader and convert it to validated WGSL.
    pub fn compose(&self, source: &str, defines: &ShaderDefines) -> Result<String, GraphicsError> {
        profile_scope!("shader_compose");

        let naga_module = self.compose_to_naga(source, defines)?;

        let mut validator = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        let module_info = validator.validate(&naga_module).map_err(|e| {
            GraphicsError::ShaderCompilationFailed(format!("Validation error: {e}"))
        })?;

        let wgsl = naga::back::wgsl::write_string(
            &naga_module,
            &module_info,
            naga::back::wgsl::WriterFlags::empty(),
        )
        .map_err(|e| {
            GraphicsError::ShaderCompilationFailed(format!("WGSL generation error: {e}"))
        })?;

        Ok(wgsl)
    }

    /// Compose a GLSL compute shader and return the raw naga module.
    pub fn compose_to_naga(
        &self,
        source: &str,
        defines: &ShaderDefines,
    ) -> Result<naga::Module, GraphicsError> {
        profile_scope!("shader_compose_to_naga");

        let resolved = self.resolve_glsl(source)?;

        let mut naga_defines = naga::FastHashMap::default();
        naga_defines.insert("COMPUTE".to_string(), String::new());
        for (name, value) in defines.preprocessor_defines() {
            naga_defines.insert(name, value);
        }

        let options = naga::front::glsl::Options {
            stage: naga::ShaderStage::Compute,
            defines: naga_defines,
        };

        let mut frontend = naga::front::glsl::Frontend::default();
        let module = frontend.parse(&options, &resolved).map_err(|errors| {
            GraphicsError::ShaderCompilationFailed(format!("GLSL parse error:\n{errors}"))
        })?;

        Ok(module)
    }

    /// Resolve `#include "path"` directives recursively.
    fn resolve_includes(
        &self,
        source: &str,
        included: &mut HashSet<String>,
    ) -> Result<String, GraphicsError> {
        let mut result = String::with_capacity(source.len());

        for line in source.lines() {
            let trimmed = line.trim();
            if let Some(path) = parse_include_directive(trimmed) {
                if included.contains(path) {
                    continue;
                }
                included.insert(path.to_string());

                let include_source = self.includes.get(path).ok_or_else(|| {
                    GraphicsError::ShaderCompilationFailed(format!("Include not found: \"{path}\""))
                })?;

                let resolved = self.resolve_includes(include_source, included)?;
                result.push_str(&resolved);
                result.push('\n');
            } else {
                result.push_str(line);
                result.push('\n');
            }
        }

        Ok(result)
    }
}

/// Parse a `#include "path"` directive, returning the path if found.
fn parse_include_directive(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("#include")?;
    let rest = rest.trim();
    if let Some(inner) = rest.strip_prefix('"') {
        inner.strip_suffix('"')
    } else if let Some(inner) = rest.strip_prefix('<') {
        inner.strip_suffix('>')
    } else {
        None
    }
}

/// Shader definition value for compile-time conditionals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShaderDef {
    /// Boolean definition (`#ifdef`, `#ifndef`).
    Bool(bool),
    /// Integer definition (`#if VAR == 5`).
    Int(i32),
    /// Unsigned integer definition.
    UInt(u32),
}

impl From<bool> for ShaderDef {
    fn from(v: bool) -> Self {
        ShaderDef::Bool(v)
    }
}

impl From<i32> for ShaderDef {
    fn from(v: i32) -> Self {
        ShaderDef::Int(v)
    }
}

impl From<u32> for ShaderDef {
    fn from(v: u32) -> Self {
        ShaderDef::UInt(v)
    }
}

/// An ordered set of shader definitions.
///
/// Ordering makes the set usable as a pipeline cache key: two sets with the
/// same entries compare equal regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderDefines {
    defs: BTreeMap<String, ShaderDef>,
}

impl ShaderDefines {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines `name` as a keyword (`#ifdef name`).
    pub fn enable(&mut self, name: impl Into<String>) -> &mut Self {
        self.set(name, ShaderDef::Bool(true))
    }

    pub fn set(&mut self, name: impl Into<String>, def: impl Into<ShaderDef>) -> &mut Self {
        self.defs.insert(name.into(), def.into());
        self
    }

    /// Whether `name` is visible to `#ifdef`.
    pub fn is_defined(&self, name: &str) -> bool {
        match self.defs.get(name) {
            Some(ShaderDef::Bool(enabled)) => *enabled,
            Some(_) => true,
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<ShaderDef> {
        self.defs.get(name).copied()
    }

    /// Names of all definitions visible to `#ifdef`, in order.
    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.defs
            .iter()
            .filter(|(name, _)| self.is_defined(name))
            .map(|(name, _)| name.as_str())
    }

    /// The `(name, value)` pairs handed to the preprocessor. Disabled
    /// booleans are omitted.
    pub fn preprocessor_defines(&self) -> Vec<(String, String)> {
        self.defs
            .iter()
            .filter_map(|(name, def)| match def {
                ShaderDef::Bool(true) => Some((name.clone(), String::new())),
                ShaderDef::Bool(false) => None,
                ShaderDef::Int(v) => Some((name.clone(), v.to_string())),
                ShaderDef::UInt(v) => Some((name.clone(), v.to_string())),
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }
}

impl std::fmt::Display for ShaderDefines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keywords: Vec<&str> = self.keywords().collect();
        if keywords.is_empty() {
            f.write_str("<none>")
        } else {
            f.write_str(&keywords.join(" "))
        }
    }
}
