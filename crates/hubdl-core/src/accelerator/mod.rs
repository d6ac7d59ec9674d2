//! Accelerator backend
//!
//! A shared external download daemon driven over JSON-RPC. The daemon
//! supervisor starts it on demand, the bridge turns tasks into job groups
//! and polls them back into progress events.

mod bridge;
mod daemon;
mod rpc;

pub use bridge::*;
pub use daemon::*;
pub use rpc::*;
