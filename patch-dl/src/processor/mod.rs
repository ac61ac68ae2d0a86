//! Data preprocessing building blocks.

pub mod color_distort;
pub mod patch_cropper;
pub mod preprocess;
pub mod random_flip;

pub use color_distort::*;
pub use patch_cropper::*;
pub use preprocess::*;
pub use random_flip::*;
