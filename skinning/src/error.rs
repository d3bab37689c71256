//! Skinning error types.

use std::fmt;

use avatar_core::compute::Cancelled;
use avatar_graphics::GraphicsError;

use crate::source::SkinningAttribute;

/// Errors reported by a [`SkinningDataSource`](crate::source::SkinningDataSource).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The asset has no data for this attribute. Normal for optional attributes.
    DataNotAvailable(SkinningAttribute),
    /// The provider failed while producing the attribute.
    Failed {
        attribute: SkinningAttribute,
        message: String,
    },
}

impl SourceError {
    pub fn attribute(&self) -> SkinningAttribute {
        match self {
            Self::DataNotAvailable(attribute) => *attribute,
            Self::Failed { attribute, .. } => *attribute,
        }
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataNotAvailable(attr) => write!(f, "{attr} data not available"),
            Self::Failed { attribute, message } => {
                write!(f, "failed to fetch {attribute}: {message}")
            }
        }
    }
}

impl std::error::Error for SourceError {}

/// Errors produced by the skinning subsystem.
#[derive(Debug, Clone, PartialEq)]
pub enum SkinningError {
    /// A required attribute is missing from the asset.
    DataNotAvailable(SkinningAttribute),
    /// Building the shared vertex buffer failed; every waiter receives this.
    BuildFailure(String),
    /// The build was cancelled before it completed.
    Cancelled,
    /// The shared vertex buffer is not available yet.
    NotReady,
    /// A caller passed an argument that violates an API contract.
    InvalidParameter(String),
    /// The configuration could not be loaded or parsed.
    InvalidConfig(String),
    /// The graphics layer failed.
    Graphics(GraphicsError),
}

impl fmt::Display for SkinningError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DataNotAvailable(attr) => write!(f, "required {attr} data not available"),
            Self::BuildFailure(msg) => write!(f, "vertex buffer build failed: {msg}"),
            Self::Cancelled => write!(f, "vertex buffer build cancelled"),
            Self::NotReady => write!(f, "vertex buffer not ready"),
            Self::InvalidParameter(msg) => write!(f, "invalid parameter: {msg}"),
            Self::InvalidConfig(msg) => write!(f, "invalid skinning config: {msg}"),
            Self::Graphics(e) => write!(f, "graphics error: {e}"),
        }
    }
}

impl std::error::Error for SkinningError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Graphics(e) => Some(e),
            _ => None,
        }
    }
}

impl From<GraphicsError> for SkinningError {
    fn from(e: GraphicsError) -> Self {
        Self::Graphics(e)
    }
}

impl From<Cancelled> for SkinningError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}
