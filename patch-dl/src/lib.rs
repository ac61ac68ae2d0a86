//! The building blocks of the landmark patch recognition model.

mod common;
pub mod dataset;
pub mod model;
pub mod processor;
pub mod profiling;
pub mod record;
pub mod utils;
