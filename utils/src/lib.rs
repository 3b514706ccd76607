// A set of helper structs for common operations
//
// Austin Shafer - 2025
pub mod fdwatch;
#[macro_use]
pub mod logging;
pub mod log;
pub mod ring_buffer;
pub mod timed_semaphore;
pub mod timing;

extern crate anyhow;
pub use anyhow::{anyhow, Context, Error, Result};
