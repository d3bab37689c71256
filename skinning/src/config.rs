//! Skinning configuration, loaded from TOML.
//!
//! ```toml
//! max_joints_per_vertex = 2
//! per_instance_updates = "shadow_buffer"
//!
//! [position_output]
//! format = "unorm16"
//! bias = [-1.0, 0.0, -1.0]
//! scale = [2.0, 2.0, 2.0]
//!
//! [time_slice]
//! budget_ms = 1.5
//!
//! [renderable]
//! motion_vectors = true
//! ```

use std::path::Path;
use std::time::Duration;

use avatar_core::compute::SliceBudget;
use avatar_graphics::BackendType;
use glam::Vec3;
use serde::Deserialize;

use crate::error::SkinningError;
use crate::format::PositionOutputFormat;

/// Top-level skinning configuration. Every field has a default.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SkinningConfig {
    pub position_output: PositionOutputConfig,
    /// Joint influences evaluated per vertex: 1, 2 or 4.
    pub max_joints_per_vertex: u32,
    pub per_instance_updates: PerInstanceUpdates,
    pub time_slice: TimeSliceConfig,
    pub renderable: RenderableConfig,
}

impl Default for SkinningConfig {
    fn default() -> Self {
        Self {
            position_output: PositionOutputConfig::default(),
            max_joints_per_vertex: 4,
            per_instance_updates: PerInstanceUpdates::Auto,
            time_slice: TimeSliceConfig::default(),
            renderable: RenderableConfig::default(),
        }
    }
}

impl SkinningConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, SkinningError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| SkinningError::InvalidConfig(format!("failed to parse: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a config file.
    pub fn load(path: &Path) -> Result<Self, SkinningError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SkinningError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            SkinningError::InvalidConfig(msg) => {
                SkinningError::InvalidConfig(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn validate(&self) -> Result<(), SkinningError> {
        validate_max_joints(self.max_joints_per_vertex).map_err(SkinningError::InvalidConfig)?;
        self.position_output
            .validate()
            .map_err(SkinningError::InvalidConfig)?;
        if self.time_slice.budget_ms.is_nan() || self.time_slice.budget_ms < 0.0 {
            return Err(SkinningError::InvalidConfig(format!(
                "time_slice.budget_ms must be non-negative, got {}",
                self.time_slice.budget_ms
            )));
        }
        Ok(())
    }
}

pub(crate) fn validate_max_joints(value: u32) -> Result<(), String> {
    match value {
        1 | 2 | 4 => Ok(()),
        other => Err(format!("max_joints_per_vertex must be 1, 2 or 4, got {other}")),
    }
}

/// Output position encoding and, for normalized formats, the window it covers.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct PositionOutputConfig {
    pub format: PositionOutputFormat,
    pub bias: [f32; 3],
    pub scale: [f32; 3],
}

impl Default for PositionOutputConfig {
    fn default() -> Self {
        Self {
            format: PositionOutputFormat::Float,
            bias: [0.0; 3],
            scale: [1.0; 3],
        }
    }
}

impl PositionOutputConfig {
    pub fn new(format: PositionOutputFormat) -> Self {
        Self {
            format,
            ..Self::default()
        }
    }

    /// Normalized output covering the box `[min, max]`.
    pub fn normalized(format: PositionOutputFormat, min: Vec3, max: Vec3) -> Self {
        Self {
            format,
            bias: min.to_array(),
            scale: (max - min).to_array(),
        }
    }

    pub fn bias(&self) -> Vec3 {
        Vec3::from_array(self.bias)
    }

    pub fn scale(&self) -> Vec3 {
        Vec3::from_array(self.scale)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.format.is_normalized() && self.scale.iter().any(|s| *s == 0.0 || !s.is_finite()) {
            return Err(format!(
                "position_output.scale must be finite and non-zero for {:?}, got {:?}",
                self.format, self.scale
            ));
        }
        Ok(())
    }
}

/// How per-instance data reaches the GPU.
///
/// Some graphics APIs (Vulkan, GLES and Metal through wgpu) mishandle several
/// partial writes into one buffer per frame, so `Auto` uses a shadow buffer
/// there and only writes fields individually on the host backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PerInstanceUpdates {
    #[default]
    Auto,
    /// Accumulate into a CPU copy and upload it once per frame.
    ShadowBuffer,
    /// Write each field into the GPU buffer as it is set.
    PartialWrites,
}

impl PerInstanceUpdates {
    /// Resolves `Auto` for a backend.
    pub fn resolve(self, backend: BackendType) -> Self {
        match (self, backend) {
            (Self::Auto, BackendType::Dummy) => Self::PartialWrites,
            (Self::Auto, _) => Self::ShadowBuffer,
            (explicit, _) => explicit,
        }
    }
}

/// Builder scheduling limits.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct TimeSliceConfig {
    pub budget_ms: f32,
    pub max_steps_per_task: u32,
}

impl Default for TimeSliceConfig {
    fn default() -> Self {
        Self {
            budget_ms: 2.0,
            max_steps_per_task: 64,
        }
    }
}

impl TimeSliceConfig {
    pub fn budget(&self) -> SliceBudget {
        SliceBudget {
            frame_budget: Duration::from_micros((self.budget_ms.max(0.0) * 1000.0).round() as u64),
            max_steps_per_task: self.max_steps_per_task.max(1),
        }
    }
}

/// Output slice requirements of the renderer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct RenderableConfig {
    /// Interpolate between the last two skinned frames.
    pub motion_smoothing: bool,
    /// Keep the previous frame for motion vector generation.
    pub motion_vectors: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_document_uses_defaults() {
        let config = SkinningConfig::from_toml_str("").unwrap();
        assert_eq!(config, SkinningConfig::default());
        assert_eq!(config.max_joints_per_vertex, 4);
        assert_eq!(config.time_slice.budget(), SliceBudget::default());
    }

    #[test]
    fn full_document() {
        let config = SkinningConfig::from_toml_str(
            r#"
            max_joints_per_vertex = 2
            per_instance_updates = "partial_writes"

            [position_output]
            format = "unorm16"
            bias = [-1.0, 0.0, -1.0]
            scale = [2.0, 2.0, 2.0]

            [time_slice]
            budget_ms = 1.5
            max_steps_per_task = 8

            [renderable]
            motion_vectors = true
            "#,
        )
        .unwrap();
        assert_eq!(config.max_joints_per_vertex, 2);
        assert_eq!(config.per_instance_updates, PerInstanceUpdates::PartialWrites);
        assert_eq!(config.position_output.format, PositionOutputFormat::Unorm16);
        assert_eq!(config.position_output.bias(), Vec3::new(-1.0, 0.0, -1.0));
        assert_eq!(config.time_slice.budget().max_steps_per_task, 8);
        assert!(config.renderable.motion_vectors);
        assert!(!config.renderable.motion_smoothing);
    }

    #[rstest]
    #[case::bad_joint_count("max_joints_per_vertex = 3")]
    #[case::zero_scale("[position_output]\nformat = \"unorm8\"\nscale = [1.0, 0.0, 1.0]")]
    #[case::negative_budget("[time_slice]\nbudget_ms = -1.0")]
    #[case::unknown_format("[position_output]\nformat = \"double\"")]
    fn invalid_documents(#[case] content: &str) {
        assert!(matches!(
            SkinningConfig::from_toml_str(content),
            Err(SkinningError::InvalidConfig(_))
        ));
    }

    #[test]
    fn auto_update_strategy() {
        assert_eq!(
            PerInstanceUpdates::Auto.resolve(BackendType::Dummy),
            PerInstanceUpdates::PartialWrites
        );
        assert_eq!(
            PerInstanceUpdates::Auto.resolve(BackendType::Wgpu),
            PerInstanceUpdates::ShadowBuffer
        );
        assert_eq!(
            PerInstanceUpdates::PartialWrites.resolve(BackendType::Wgpu),
            PerInstanceUpdates::PartialWrites
        );
    }

    #[test]
    fn load_missing_file() {
        let err = SkinningConfig::load(Path::new("/nonexistent/skinning.toml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
