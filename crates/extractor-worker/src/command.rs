// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process routine backed by an external command.
//!
//! The command receives the staged local paths as trailing arguments and the
//! resource identity in the environment:
//!
//! | Variable | Value |
//! |----------|-------|
//! | `EXTRACTOR_RESOURCE_ID` | resource ID |
//! | `EXTRACTOR_RESOURCE_KIND` | `file`, `dataset` or `metadata` |
//! | `EXTRACTOR_RESOURCE_NAME` | display name |
//! | `EXTRACTOR_RESOURCE_EXT` | extension with leading dot |
//! | `EXTRACTOR_RESOURCE_PARENT_ID` | parent ID, when there is one |
//! | `EXTRACTOR_HOST` | repository base URL, after any host override |
//! | `EXTRACTOR_SECRET_KEY` | repository key |
//!
//! Exit code 0 is success. Any other exit code is a subprocess failure.
//! Termination by SIGINT, SIGTERM or SIGHUP counts as an interrupt; other
//! signals are reported as exit code `128 + signal`.

use std::process::{Command, ExitStatus, Stdio};

use tracing::{debug, info};

use crate::descriptor::JobDescriptor;
use crate::resource::Resource;
use crate::retry::ProcessError;

/// Bytes of standard error kept in a failure report.
const STDERR_TAIL: usize = 4096;

/// Runs a fixed command line for every job.
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    program: String,
    args: Vec<String>,
}

impl CommandProcessor {
    /// Build from a command line split into words. `None` when empty.
    pub fn new(command: Vec<String>) -> Option<Self> {
        let mut words = command.into_iter();
        let program = words.next()?;
        Some(Self {
            program,
            args: words.collect(),
        })
    }

    /// Command line without the per-job arguments.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run the command for one job. Blocks until it exits.
    ///
    /// `EXTRACTOR_HOST` is taken from `descriptor.host`, which the handler
    /// sets to the host its own repository calls use.
    pub fn run(&self, resource: &Resource, descriptor: &JobDescriptor) -> Result<(), ProcessError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .args(&resource.local_paths)
            .env("EXTRACTOR_RESOURCE_ID", &resource.id)
            .env("EXTRACTOR_RESOURCE_KIND", resource.kind.as_str())
            .env("EXTRACTOR_RESOURCE_NAME", &resource.name)
            .env("EXTRACTOR_RESOURCE_EXT", &resource.file_ext)
            .env("EXTRACTOR_HOST", &descriptor.host)
            .env("EXTRACTOR_SECRET_KEY", &descriptor.secret_key)
            .stdin(Stdio::null());
        if let Some(parent) = &resource.parent {
            command.env("EXTRACTOR_RESOURCE_PARENT_ID", &parent.id);
        }

        info!(
            command = %self.command_line(),
            id = %resource.id,
            inputs = resource.local_paths.len(),
            "Running extractor command"
        );
        let output = command.output().map_err(|e| {
            ProcessError::Other(anyhow::anyhow!(
                "cannot run `{}`: {}",
                self.command_line(),
                e
            ))
        })?;
        debug!(stdout = %String::from_utf8_lossy(&output.stdout), "Command output");

        if output.status.success() {
            return Ok(());
        }
        match exit_code(output.status) {
            Some(code) => Err(ProcessError::Subprocess {
                command: self.command_line(),
                code,
                stderr: tail(&output.stderr),
            }),
            None => Err(ProcessError::Interrupted(format!(
                "`{}` was stopped by a signal",
                self.command_line()
            ))),
        }
    }
}

/// Exit code, or `None` when the command was interrupted.
#[cfg(unix)]
fn exit_code(status: ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;

    const SIGHUP: i32 = 1;
    const SIGINT: i32 = 2;
    const SIGTERM: i32 = 15;

    match (status.code(), status.signal()) {
        (Some(code), _) => Some(code),
        (None, Some(SIGHUP | SIGINT | SIGTERM)) => None,
        (None, Some(signal)) => Some(128 + signal),
        (None, None) => None,
    }
}

#[cfg(not(unix))]
fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code()
}

fn tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(STDERR_TAIL);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}
