//! Lua sandbox
//!
//! Runs guest Lua code under CPU and memory limits, converts values between
//! the host and the guest, and lets each side call the other's functions.

mod convert;
mod error;
mod function;
mod governor;
mod library;
mod memory;
mod profiler;
mod sandbox;
mod timer;
mod value;

pub use self::error::{
    ErrorKind, ErrorRecord, FrameKind, StackFrame, EMERGENCY_TIMEOUT_MESSAGE, TIMEOUT_MESSAGE,
};
pub use self::function::{CallContext, FunctionHandle, FunctionOrigin, HostFunction};
pub use self::governor::{GovernorPhase, ResourceBudget};
pub use self::library::DEFAULT_ALLOWED_GLOBALS;
pub use self::profiler::{ProfileEntry, ProfilerUnits};
pub use self::sandbox::{LuaSandbox, VersionInfo};
pub use self::timer::Interrupt;
pub use self::value::{ArrayKey, HostArray, HostRef, HostValue};

/// A value as the interpreter sees it
pub type GuestValue = mlua::Value;
