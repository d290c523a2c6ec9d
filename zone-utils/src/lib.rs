// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wrappers around Solaris zone administration commands.

pub mod archive;
pub mod backoff;
pub mod executor;
pub mod kstat;
pub mod storage;
pub mod svc;
pub mod transaction;
pub mod zone;
pub mod zoneadm;
pub mod zonecfg;

pub mod fakes;

pub const ARCHIVEADM: &str = "/usr/sbin/archiveadm";
pub const CP: &str = "/usr/bin/cp";
pub const FCINFO: &str = "/usr/sbin/fcinfo";
pub const ISCSIADM: &str = "/usr/sbin/iscsiadm";
pub const KSTAT: &str = "/usr/bin/kstat";
pub const SURIADM: &str = "/usr/sbin/suriadm";
pub const SVCADM: &str = "/usr/sbin/svcadm";
pub const SVCCFG: &str = "/usr/sbin/svccfg";
pub const SVCS: &str = "/usr/bin/svcs";
pub const ZLOGIN: &str = "/usr/sbin/zlogin";
pub const ZONEADM: &str = "/usr/sbin/zoneadm";
pub const ZONECFG: &str = "/usr/sbin/zonecfg";

#[derive(Debug)]
pub struct CommandFailureInfo {
    command: String,
    status: std::process::ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl std::fmt::Display for CommandFailureInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Command [{}] executed and failed with status: {}",
            self.command, self.status
        )?;
        write!(f, "  stdout: {}", self.stdout)?;
        write!(f, "  stderr: {}", self.stderr)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    #[error("Failed to start execution of [{command}]: {err}")]
    ExecutionStart { command: String, err: std::io::Error },

    #[error("{0}")]
    CommandFailure(Box<CommandFailureInfo>),

    #[error("Failed to parse command output: {0}")]
    ParseFailure(String),
}

impl ExecutionError {
    /// Returns the captured stderr of a command which ran and failed.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ExecutionError::CommandFailure(info) => Some(&info.stderr),
            _ => None,
        }
    }
}

pub(crate) fn command_to_string(command: &std::process::Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|s| s.to_string_lossy().into())
        .collect::<Vec<String>>()
        .join(" ")
}

pub fn output_to_exec_error(
    command: &std::process::Command,
    output: &std::process::Output,
) -> ExecutionError {
    ExecutionError::CommandFailure(Box::new(CommandFailureInfo {
        command: command_to_string(command),
        status: output.status,
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }))
}

/// Returns a logger suitable for unit tests.
///
/// Output goes through the test harness writer so it is only shown for
/// failing tests.
pub fn test_log(test_name: &str) -> slog::Logger {
    use slog::Drain;

    let decorator =
        slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog::LevelFilter::new(drain, slog::Level::Debug).fuse();
    slog::Logger::root(drain, slog::o!("test" => test_name.to_string()))
}
