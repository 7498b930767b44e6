//! Command-list execution engine for Level Zero compute devices.
//!
//! Command lists encode kernel launches, builtin copies and fills, barriers
//! and event operations into command buffers and heaps, and keep the
//! engine's hardware state (state base address, front end, compute mode,
//! pipeline select) consistent across submissions.

pub mod builtins;
pub mod cmd_parse;
pub mod cmdlist;
pub mod cmdqueue;
pub mod command_container;
pub mod config;
pub mod csr;
pub mod device;
pub mod encoder;
pub mod error;
pub mod event;
pub mod hw_cmds;
pub mod hw_info;
pub mod image;
pub mod indirect_heap;
pub mod kernel;
pub mod linear_stream;
pub mod memory;
pub mod scheduler;
pub mod scratch;
pub mod split;
pub mod state_base_address;
pub mod stream_properties;

#[cfg(test)]
pub(crate) mod testing;

pub use cmdlist::{CmdListKernelLaunchParams, CommandList, ImmediateListDesc};
pub use cmdqueue::{CommandQueue, CommandQueueDesc, Fence, SubmissionMode};
pub use config::Config;
pub use device::Device;
pub use error::{DriverError, Result, ZeResult};
