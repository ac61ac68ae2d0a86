//! The multi-branch patch classifier.

mod metrics;
mod patch_net;
mod tower;

pub use metrics::*;
pub use patch_net::*;
pub use tower::*;
