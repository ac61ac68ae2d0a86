//! Misc utilities.

mod checkpoint;
mod lr_scheduler;
mod rate_counter;
mod tensor;

pub use checkpoint::*;
pub use lr_scheduler::*;
pub use rate_counter::*;
pub use tensor::*;
