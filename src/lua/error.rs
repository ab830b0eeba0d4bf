//! Guest error taxonomy
//!
//! Every guest-originated failure is reported as a single [`ErrorRecord`]
//! tagged with an [`ErrorKind`]. This module also classifies raw interpreter
//! outcomes (error values and `mlua::Error`s) into records, and defines the
//! internal signal used to carry non-catchable errors through guest
//! protected calls.

use std::fmt;

use mlua::{Lua, Value};

/// Message reported for a normal CPU limit breach
pub const TIMEOUT_MESSAGE: &str = "The maximum execution time for this script was exceeded";

/// Message reported for an emergency CPU limit breach
pub const EMERGENCY_TIMEOUT_MESSAGE: &str =
    "The maximum execution time was exceeded and the current Lua statement failed to return";

/// What the interpreter raises when an allocation is refused
pub(crate) const MEMORY_ERROR_MESSAGE: &str = "not enough memory";

/// What the interpreter raises when a message handler itself fails
pub(crate) const ERROR_IN_ERROR_MESSAGE: &str = "error in error handling";

/// Chunk name of the sandbox's own Lua glue; its frames are hidden from traces
pub(crate) const INTERNAL_CHUNK_NAME: &str = "=[luasandbox]";
const INTERNAL_SHORT_SRC: &str = "[luasandbox]";

const MAX_TRACE_FRAMES: usize = 64;

/// Classification of a guest failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Error raised by guest code
    Runtime,

    /// Host-side fault inside a callback
    Fatal,

    /// Parse or compile failure
    Syntax,

    /// Allocation refused by the memory limit
    Memory,

    /// Error raised while handling an error
    ErrorInError,

    /// Normal CPU limit exceeded
    Timeout,

    /// Emergency CPU limit exceeded
    EmergencyTimeout,
}

impl ErrorKind {
    /// Whether guest `pcall`/`xpcall` may intercept this kind
    pub fn is_catchable(self) -> bool {
        matches!(self, ErrorKind::Runtime)
    }

    /// Whether this kind always escapes to the host
    pub fn is_fatal(self) -> bool {
        !self.is_catchable()
    }

    /// Interpreter status code associated with the kind
    pub fn code(self) -> i32 {
        match self {
            ErrorKind::Syntax => 3,
            ErrorKind::Memory => 4,
            ErrorKind::ErrorInError => 5,
            ErrorKind::Runtime
            | ErrorKind::Fatal
            | ErrorKind::Timeout
            | ErrorKind::EmergencyTimeout => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Runtime => "runtime error",
            ErrorKind::Fatal => "fatal error",
            ErrorKind::Syntax => "syntax error",
            ErrorKind::Memory => "memory error",
            ErrorKind::ErrorInError => "error in error handling",
            ErrorKind::Timeout => "timeout",
            ErrorKind::EmergencyTimeout => "emergency timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Kind of function executing in a stack frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Lua function
    Lua,

    /// Native (C or host) function
    Native,

    /// Top level of a chunk
    Main,
}

/// One frame of a guest call stack
#[derive(Debug, Clone, PartialEq)]
pub struct StackFrame {
    /// Function name, if the interpreter could determine one
    pub function: Option<String>,

    /// Short source name, e.g. `[string "chunk"]` or `[C]`
    pub source: String,

    /// Line being executed, if known
    pub line: Option<u32>,

    /// What kind of function the frame runs
    pub kind: FrameKind,
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: in ", self.source, line)?,
            None => write!(f, "{}: in ", self.source)?,
        }
        match (&self.kind, &self.function) {
            (FrameKind::Main, _) => write!(f, "main chunk"),
            (_, Some(name)) => write!(f, "function '{}'", name),
            (_, None) => write!(f, "anonymous function"),
        }
    }
}

/// A guest failure as reported to the host
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ErrorRecord {
    /// Classification
    pub kind: ErrorKind,

    /// Error message
    pub message: String,

    /// Guest stack at the point of failure, innermost frame first
    pub trace: Vec<StackFrame>,
}

impl ErrorRecord {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        ErrorRecord {
            kind,
            message: message.into(),
            trace: Vec::new(),
        }
    }

    pub fn with_trace(mut self, trace: Vec<StackFrame>) -> Self {
        self.trace = trace;
        self
    }

    pub fn is_catchable(&self) -> bool {
        self.kind.is_catchable()
    }

    /// Render the trace the way the interpreter's `debug.traceback` does
    pub fn traceback(&self) -> String {
        let mut out = String::from("stack traceback:");
        for frame in &self.trace {
            out.push_str("\n\t");
            out.push_str(&frame.to_string());
        }
        out
    }
}

/// Carrier for non-catchable errors while they travel through the guest.
/// Raised as an external `mlua::Error` so guest code only sees an opaque value.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub(crate) struct FatalSignal(pub(crate) ErrorRecord);

impl FatalSignal {
    pub(crate) fn raise(record: ErrorRecord) -> mlua::Error {
        mlua::Error::external(FatalSignal(record))
    }
}

/// The record carried by a fatal signal, looking through callback wrappers
pub(crate) fn fatal_record(err: &mlua::Error) -> Option<&ErrorRecord> {
    match err {
        mlua::Error::ExternalError(inner) => (**inner).downcast_ref::<FatalSignal>().map(|s| &s.0),
        mlua::Error::CallbackError { cause, .. } => fatal_record(cause),
        mlua::Error::WithContext { cause, .. } => fatal_record(cause),
        _ => None,
    }
}

/// Non-catchable kind of a raw guest error value, if it is one
pub(crate) fn fatal_kind_of_value(value: &Value) -> Option<ErrorKind> {
    match value {
        Value::Error(err) => fatal_record(err).map(|record| record.kind).or(match **err {
            mlua::Error::MemoryError(_) => Some(ErrorKind::Memory),
            _ => None,
        }),
        Value::String(s) => kind_for_marker(&s.as_bytes()[..]),
        _ => None,
    }
}

fn kind_for_marker(message: &[u8]) -> Option<ErrorKind> {
    if message == MEMORY_ERROR_MESSAGE.as_bytes() {
        Some(ErrorKind::Memory)
    } else if message == ERROR_IN_ERROR_MESSAGE.as_bytes() {
        Some(ErrorKind::ErrorInError)
    } else {
        None
    }
}

/// Classify an error returned by an mlua API call
pub(crate) fn record_from_error(err: &mlua::Error) -> ErrorRecord {
    if let Some(record) = fatal_record(err) {
        return record.clone();
    }
    match err {
        mlua::Error::SyntaxError { message, .. } => ErrorRecord::new(ErrorKind::Syntax, message.clone()),
        mlua::Error::MemoryError(message) => ErrorRecord::new(ErrorKind::Memory, message.clone()),
        mlua::Error::RuntimeError(message) => {
            let message = strip_traceback(message);
            let kind = kind_for_marker(message.as_bytes()).unwrap_or(ErrorKind::Runtime);
            ErrorRecord::new(kind, message)
        }
        mlua::Error::CallbackError { cause, .. } => record_from_error(cause),
        mlua::Error::WithContext { cause, .. } => record_from_error(cause),
        other => ErrorRecord::new(ErrorKind::Runtime, strip_traceback(&other.to_string())),
    }
}

/// Classify the error value produced by a failed protected call
pub(crate) fn record_from_value(value: Value, trace: Vec<StackFrame>) -> ErrorRecord {
    let record = match value {
        Value::Error(err) => record_from_error(&err),
        Value::String(s) => {
            let bytes = s.as_bytes();
            let kind = kind_for_marker(&bytes[..]).unwrap_or(ErrorKind::Runtime);
            ErrorRecord::new(kind, String::from_utf8_lossy(&bytes[..]).into_owned())
        }
        Value::Integer(i) => ErrorRecord::new(ErrorKind::Runtime, i.to_string()),
        Value::Number(n) => ErrorRecord::new(ErrorKind::Runtime, n.to_string()),
        Value::Nil => ErrorRecord::new(ErrorKind::Runtime, "nil"),
        _ => ErrorRecord::new(ErrorKind::Runtime, "unknown error"),
    };
    if record.trace.is_empty() {
        record.with_trace(trace)
    } else {
        record
    }
}

fn strip_traceback(message: &str) -> String {
    match message.find("\nstack traceback:") {
        Some(pos) => message[..pos].to_string(),
        None => message.to_string(),
    }
}

/// Walk the guest call stack from `start_level` outwards
pub(crate) fn capture_trace(lua: &Lua, start_level: usize) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    let mut level = start_level;
    while frames.len() < MAX_TRACE_FRAMES {
        let Some(debug) = lua.inspect_stack(level) else {
            break;
        };
        level += 1;

        let source = debug.source();
        let short_src = source
            .short_src
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "?".to_string());
        if short_src == INTERNAL_SHORT_SRC {
            continue;
        }
        let kind = match source.what {
            "main" => FrameKind::Main,
            "C" => FrameKind::Native,
            _ => FrameKind::Lua,
        };
        let line = u32::try_from(debug.curr_line()).ok().filter(|line| *line > 0);
        let function = debug.names().name.as_ref().map(|name| name.to_string());

        frames.push(StackFrame {
            function,
            source: short_src,
            line,
            kind,
        });
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_runtime_is_catchable() {
        let kinds = [
            ErrorKind::Runtime,
            ErrorKind::Fatal,
            ErrorKind::Syntax,
            ErrorKind::Memory,
            ErrorKind::ErrorInError,
            ErrorKind::Timeout,
            ErrorKind::EmergencyTimeout,
        ];
        for kind in kinds {
            assert_eq!(kind.is_catchable(), kind == ErrorKind::Runtime, "{:?}", kind);
        }
        assert_eq!(ErrorKind::Syntax.code(), 3);
        assert_eq!(ErrorKind::Memory.code(), 4);
        assert_eq!(ErrorKind::ErrorInError.code(), 5);
    }

    #[test]
    fn test_traceback_format() {
        let record = ErrorRecord::new(ErrorKind::Runtime, "boom").with_trace(vec![
            StackFrame {
                function: Some("inner".to_string()),
                source: "[string \"t\"]".to_string(),
                line: Some(2),
                kind: FrameKind::Lua,
            },
            StackFrame {
                function: None,
                source: "[string \"t\"]".to_string(),
                line: Some(5),
                kind: FrameKind::Main,
            },
        ]);
        assert_eq!(
            record.traceback(),
            "stack traceback:\n\t[string \"t\"]:2: in function 'inner'\n\t[string \"t\"]:5: in main chunk"
        );
        assert_eq!(record.to_string(), "boom");
    }

    #[test]
    fn test_fatal_signal_survives_callback_wrapping() {
        let record = ErrorRecord::new(ErrorKind::Timeout, TIMEOUT_MESSAGE);
        let wrapped = mlua::Error::CallbackError {
            traceback: String::new(),
            cause: std::sync::Arc::new(FatalSignal::raise(record.clone())),
        };
        assert_eq!(fatal_record(&wrapped), Some(&record));
        assert_eq!(record_from_error(&wrapped).kind, ErrorKind::Timeout);
    }

    #[test]
    fn test_runtime_message_loses_traceback() {
        let err = mlua::Error::RuntimeError("oops\nstack traceback:\n\t[C]: in ?".to_string());
        let record = record_from_error(&err);
        assert_eq!(record.kind, ErrorKind::Runtime);
        assert_eq!(record.message, "oops");
    }

    #[test]
    fn test_memory_error_classification() {
        let record = record_from_error(&mlua::Error::MemoryError("not enough memory".to_string()));
        assert_eq!(record.kind, ErrorKind::Memory);
        assert_eq!(kind_for_marker(b"error in error handling"), Some(ErrorKind::ErrorInError));
        assert_eq!(kind_for_marker(b"plain"), None);
    }
}
