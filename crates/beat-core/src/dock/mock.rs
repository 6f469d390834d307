// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scripted command executor for testing.
//!
//! Replies to runtime CLI invocations from a list of rules matched on the
//! argument prefix, and records every invocation.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::command::{CommandExecutor, ExecOutput};

#[derive(Debug, Clone)]
struct Rule {
    prefix: Vec<String>,
    /// `None` when the runtime cannot be started at all
    output: Option<ExecOutput>,
    remaining: Option<usize>,
}

/// Executor replying from scripted rules.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Vec<String>>>,
}

impl ScriptedExecutor {
    /// Create an executor with no rules.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reply with `output` to every command starting with `prefix`.
    pub fn on(&self, prefix: &[&str], output: ExecOutput) -> &Self {
        self.push(prefix, Some(output), None)
    }

    /// Fail to spawn every command starting with `prefix`.
    pub fn unavailable(&self, prefix: &[&str]) -> &Self {
        self.push(prefix, None, None)
    }

    /// Reply with `output` to the next command starting with `prefix` only.
    ///
    /// One-shot rules are consulted before permanent ones.
    pub fn once(&self, prefix: &[&str], output: ExecOutput) -> &Self {
        self.push(prefix, Some(output), Some(1))
    }

    fn push(&self, prefix: &[&str], output: Option<ExecOutput>, remaining: Option<usize>) -> &Self {
        self.rules.lock().push(Rule {
            prefix: prefix.iter().map(|s| s.to_string()).collect(),
            output,
            remaining,
        });
        self
    }

    /// Every recorded invocation (arguments only).
    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    /// Recorded invocations starting with `prefix`.
    pub fn calls_matching(&self, prefix: &[&str]) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .iter()
            .filter(|call| starts_with(call, prefix))
            .cloned()
            .collect()
    }
}

fn starts_with<S: AsRef<str>>(args: &[String], prefix: &[S]) -> bool {
    args.len() >= prefix.len()
        && args
            .iter()
            .zip(prefix)
            .all(|(arg, expected)| arg == expected.as_ref())
}

#[async_trait]
impl CommandExecutor for ScriptedExecutor {
    async fn exec(
        &self,
        _program: &str,
        args: &[String],
        _timeout: Option<Duration>,
    ) -> std::io::Result<ExecOutput> {
        self.calls.lock().push(args.to_vec());

        let mut rules = self.rules.lock();
        let one_shot = rules
            .iter()
            .position(|r| r.remaining.is_some_and(|n| n > 0) && starts_with(args, &r.prefix));
        let index = one_shot.or_else(|| {
            rules
                .iter()
                .position(|r| r.remaining.is_none() && starts_with(args, &r.prefix))
        });

        match index {
            Some(i) => {
                let rule = &mut rules[i];
                if let Some(n) = rule.remaining.as_mut() {
                    *n -= 1;
                }
                rule.output.clone().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, "container runtime not found")
                })
            }
            None => Ok(ExecOutput::failed(
                1,
                format!("unexpected command: {}", args.join(" ")),
            )),
        }
    }
}
