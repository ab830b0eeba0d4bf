//! luasandbox library
//!
//! Runs untrusted Lua code inside the host process under CPU and memory
//! limits, with value conversion and function calls in both directions.

pub mod config;
pub mod error;
pub mod lua;

// Re-export commonly used types
pub use config::SandboxConfig;
pub use error::{CallbackError, MarshalError, Result, SandboxError};
pub use lua::{
    ArrayKey, CallContext, ErrorKind, ErrorRecord, FunctionHandle, HostArray, HostFunction, HostValue,
    LuaSandbox, ProfilerUnits, ResourceBudget,
};
