//! attendly-hw: V4L2 camera capture for the attendance pipeline.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo};
pub use frame::{Frame, PixelFormat};
