//! tally-hw — Frame sources for the attendance pipeline.
//!
//! V4L2 webcam capture with pixel-format conversion to RGB, and a directory
//! replay source that feeds still images through the same interface.

pub mod camera;
pub mod frame;
pub mod replay;

pub use camera::{Camera, CameraError, CameraStream, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use replay::DirectorySource;

/// Anything that yields camera frames one at a time.
pub trait FrameSource {
    /// Next frame, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>, CameraError>;
}
