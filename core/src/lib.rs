//! # Avatar Core
//!
//! Frame-cooperative compute primitives shared by the avatar crates: cancellation
//! tokens, worker-thread IO handles, the per-frame [`TimeSlicer`](compute::TimeSlicer)
//! and profiling macros.

pub mod compute;
pub mod profiling;

/// Core library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
