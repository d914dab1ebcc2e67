//! Small utilities shared by the helios workspace crates.

pub mod log_setup;
pub mod parallel;
mod shared_fn;

pub use shared_fn::SharedFn;
