//! GPU resources.
//!
//! [`Buffer`] is created by [`GraphicsDevice`] and reference-counted with
//! [`Arc`]. It holds a weak reference back to its parent device and reports
//! its destruction to the device statistics.
//!
//! [`GraphicsDevice`]: crate::GraphicsDevice
//! [`Arc`]: std::sync::Arc

mod buffer;

pub use buffer::Buffer;
