// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Failures reported by algorithm processes.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Who is to blame for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// The user code raised
    User,
    /// The algorithm runtime failed
    System,
}

/// One traceback entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFrame {
    /// Source file
    pub file: String,
    /// Line number
    pub line: u32,
    /// Function name
    pub function: String,
    /// Source line
    #[serde(default)]
    pub code: String,
}

/// Failure payload of an `err` reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Blame
    pub kind: FailureKind,
    /// Error class, e.g. `ValueError`
    pub class: String,
    /// Error message
    pub message: String,
    /// Innermost frame last
    #[serde(default)]
    pub traceback: Vec<TraceFrame>,
}

impl Failure {
    /// Failure of the user code.
    pub fn user(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::User,
            class: class.into(),
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    /// Failure of the runtime.
    pub fn system(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::System,
            class: class.into(),
            message: message.into(),
            traceback: Vec::new(),
        }
    }

    /// Append a traceback frame.
    pub fn with_frame(mut self, file: &str, line: u32, function: &str, code: &str) -> Self {
        self.traceback.push(TraceFrame {
            file: file.to_string(),
            line,
            function: function.to_string(),
            code: code.to_string(),
        });
        self
    }

    /// Decode an `err` payload. Anything that is not a failure document is
    /// kept verbatim as a system failure message.
    pub fn parse(payload: &[u8]) -> Self {
        serde_json::from_slice(payload).unwrap_or_else(|_| {
            Self::system("Error", String::from_utf8_lossy(payload).trim().to_string())
        })
    }

    /// Encode as an `err` payload.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self}"))
    }

    /// Traceback restricted to frames under `root`, followed by
    /// `Class: message`.
    pub fn format(&self, root: &str) -> String {
        let mut out = String::new();
        for frame in self.traceback.iter().filter(|f| f.file.starts_with(root)) {
            out.push_str(&format!(
                "  File \"{}\", line {}, in {}\n",
                frame.file, frame.line, frame.function
            ));
            if !frame.code.is_empty() {
                out.push_str(&format!("    {}\n", frame.code));
            }
        }
        out.push_str(&format!("{}: {}", self.class, self.message));
        out
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_keeps_user_frames() {
        let failure = Failure::user("ValueError", "bad input")
            .with_frame("/usr/lib/beat/backend/executor.py", 120, "process", "self.algo.process()")
            .with_frame("/tmp/x/prefix/algorithms/user/echo/1.py", 7, "process", "raise ValueError('bad input')");

        assert_eq!(
            failure.format("/tmp/x/prefix/algorithms"),
            "  File \"/tmp/x/prefix/algorithms/user/echo/1.py\", line 7, in process\n    \
             raise ValueError('bad input')\nValueError: bad input"
        );
    }

    #[test]
    fn test_format_without_frames() {
        let failure = Failure::system("RuntimeError", "boom");
        assert_eq!(failure.format("/anything"), "RuntimeError: boom");
    }

    #[test]
    fn test_parse_payloads() {
        let failure = Failure::user("KeyError", "'x'");
        assert_eq!(Failure::parse(failure.to_json().as_bytes()), failure);

        let raw = Failure::parse(b"segmentation fault\n");
        assert_eq!(raw.kind, FailureKind::System);
        assert_eq!(raw.message, "segmentation fault");
    }
}
