//! Error type shared by the compiler, the VM, and the embedder API.
//!
//! Every failure in the pipeline is a `ScriptError` carrying the taxonomy
//! kind, the best-known source position, and a formatted message. Opcode
//! handlers and `eval` propagate errors with `?`; `exec_command` /
//! `exec_script` are the reset points where they surface to the embedder.

use std::fmt;

/// Result alias used throughout the crate.
pub type ScriptResult<T> = Result<T, ScriptError>;

/// Classification of a failure, mirroring the stages of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::IntoStaticStr)]
pub enum ErrorKind {
    /// Lexing or parsing failed; no compile tree was produced.
    Parse,
    /// The compile tree could not be lowered to bytecode.
    Compile,
    /// A registered namespace's parent never appeared, or hookup cycled.
    Link,
    /// A runtime value had the wrong type for the operation.
    Type,
    /// A name, object id, method, or stack frame failed to resolve at runtime.
    Resolution,
    /// A fixed limit was exceeded (call depth, parameter count, ...).
    Resource,
    /// File or cache I/O failed.
    Io,
    /// An internal invariant broke; indicates a bug in this crate.
    Internal,
}

/// A failure anywhere in the compile/execute pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptError {
    /// Which stage failed.
    pub kind: ErrorKind,
    /// Source file (or `<stdin>` for interactive statements), when known.
    pub file: Option<String>,
    /// 1-based source line, when known.
    pub line: Option<u32>,
    /// Human-readable description.
    pub message: String,
}

impl ScriptError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            file: None,
            line: None,
            message: message.into(),
        }
    }

    /// Attaches a source position; existing positions are kept, so the
    /// innermost (most precise) location wins as the error propagates out.
    #[must_use]
    pub fn at(mut self, file: &str, line: u32) -> Self {
        if self.file.is_none() {
            self.file = Some(file.to_owned());
            self.line = Some(line);
        }
        self
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Parse, message)
    }

    pub fn compile(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Compile, message)
    }

    pub fn link(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Link, message)
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn resolution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resolution, message)
    }

    pub fn resource(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resource, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind: &'static str = self.kind.into();
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{kind} error [{file}:{line}]: {}", self.message),
            (Some(file), None) => write!(f, "{kind} error [{file}]: {}", self.message),
            _ => write!(f, "{kind} error: {}", self.message),
        }
    }
}

impl std::error::Error for ScriptError {}

impl From<std::io::Error> for ScriptError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_with_position() {
        let err = ScriptError::compile("undefined variable: x").at("game.ts", 12);
        assert_eq!(err.to_string(), "Compile error [game.ts:12]: undefined variable: x");
    }

    #[test]
    fn at_keeps_innermost_position() {
        let err = ScriptError::type_error("divide by zero").at("a.ts", 3).at("b.ts", 9);
        assert_eq!(err.file.as_deref(), Some("a.ts"));
        assert_eq!(err.line, Some(3));
    }
}
