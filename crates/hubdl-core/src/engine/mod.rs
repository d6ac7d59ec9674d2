//! Download engine
//!
//! - Worker processes, one per active task, talking over a progress channel
//! - Transfer backends behind a progress-sink interface
//! - A single progress monitor applying events to tasks
//! - SQLite persistence through one writer task

mod launcher;
mod monitor;
mod persistence;
mod sink;
mod transfer;
mod worker;

pub use launcher::*;
pub use monitor::*;
pub use persistence::*;
pub use sink::*;
pub use transfer::*;
pub use worker::*;
