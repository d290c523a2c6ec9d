// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Runs host commands, with a fake for tests.

use crate::{command_to_string, output_to_exec_error, ExecutionError};

use async_trait::async_trait;
use slog::{debug, info, Logger};
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus, Output};
use std::str::from_utf8;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

fn log_input(log: &Logger, id: u64, command: &Command) {
    info!(
        log,
        "running command via executor"; "id" => id, "command" => command_to_string(command)
    );
}

fn log_output(log: &Logger, id: u64, output: &Output) {
    info!(
        log,
        "finished running command via executor";
        "id" => id,
        "result" => if output.status.success() { "OK" } else { "ERROR" },
        "status" => output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none".to_string()),
    );
    if !output.stdout.is_empty() {
        debug!(
            log,
            "finished command stdout";
            "id" => id,
            "stdout" => from_utf8(&output.stdout).unwrap_or("<Not valid UTF-8>"),
        );
    }
    if !output.stderr.is_empty() {
        debug!(
            log,
            "finished command stderr";
            "id" => id,
            "stderr" => from_utf8(&output.stderr).unwrap_or("<Not valid UTF-8>"),
        );
    }
}

/// Describes the commonly-used "safe-to-reference" type describing the
/// Executor as a trait object.
pub type BoxedExecutor = Arc<dyn Executor>;

/// Describes an "executor", which can run [Command]s and return a response.
///
/// - In production, this is usually simply a [HostExecutor].
/// - Under test, this can be customized, and a [FakeExecutor] may be used.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Executes a task, waiting for it to complete, and returning output.
    ///
    /// A non-zero exit status is reported as
    /// [ExecutionError::CommandFailure].
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError>;
}

/// Convenience wrapper building a command from a program and arguments.
pub async fn run<I, S>(
    executor: &dyn Executor,
    program: &str,
    args: I,
) -> Result<Output, ExecutionError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut command = tokio::process::Command::new(program);
    command.args(args);
    executor.execute_async(&mut command).await
}

pub struct HostExecutor {
    log: Logger,
    counter: AtomicU64,
}

impl HostExecutor {
    pub fn new(log: Logger) -> Arc<Self> {
        Arc::new(Self { log, counter: AtomicU64::new(0) })
    }

    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for HostExecutor {
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        log_input(&self.log, id, command.as_std());
        let output = command.output().await.map_err(|err| {
            ExecutionError::ExecutionStart {
                command: command_to_string(command.as_std()),
                err,
            }
        })?;
        log_output(&self.log, id, &output);
        if !output.status.success() {
            return Err(output_to_exec_error(command.as_std(), &output));
        }
        Ok(output)
    }
}

/// The program and arguments of a command seen by a [FakeExecutor].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl FakeCommand {
    fn new(command: &Command) -> Self {
        Self {
            program: command.get_program().to_string_lossy().to_string(),
            args: command
                .get_args()
                .map(|a| a.to_string_lossy().to_string())
                .collect(),
        }
    }

    /// Returns the program name without its directory.
    pub fn name(&self) -> &str {
        self.program.rsplit('/').next().unwrap_or(&self.program)
    }

    /// Returns true if the arguments begin with `prefix`.
    pub fn args_start_with(&self, prefix: &[&str]) -> bool {
        self.args.len() >= prefix.len()
            && self.args.iter().zip(prefix).all(|(a, p)| a == p)
    }
}

impl std::fmt::Display for FakeCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Handler called when a fake command runs.
pub type WaitFn = dyn FnMut(&FakeCommand) -> Output + Send + Sync;
pub type BoxedWaitFn = Box<WaitFn>;

/// Builds a successful [Output] with the given stdout.
pub fn output_success(stdout: &str) -> Output {
    Output {
        status: ExitStatus::from_raw(0),
        stdout: stdout.as_bytes().to_vec(),
        stderr: vec![],
    }
}

/// Builds a failed [Output] with the given exit code and stderr.
pub fn output_failure(code: i32, stderr: &str) -> Output {
    Output {
        status: ExitStatus::from_raw(code << 8),
        stdout: vec![],
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// An executor which can expect certain inputs, and respond with specific
/// outputs.
pub struct FakeExecutor {
    log: Logger,
    counter: AtomicU64,
    wait_handler: Mutex<BoxedWaitFn>,
    history: Mutex<Vec<FakeCommand>>,
}

impl FakeExecutor {
    pub fn new(log: Logger) -> Arc<FakeExecutor> {
        Arc::new(Self {
            log,
            counter: AtomicU64::new(0),
            wait_handler: Mutex::new(Box::new(|_cmd| output_success(""))),
            history: Mutex::new(vec![]),
        })
    }

    /// Set the request handler to an arbitrary function.
    pub fn set_wait_handler(&self, f: BoxedWaitFn) {
        *self.wait_handler.lock().unwrap() = f;
    }

    /// Returns every command run so far, in order.
    pub fn history(&self) -> Vec<FakeCommand> {
        self.history.lock().unwrap().clone()
    }

    /// Perform some type coercion to access a commonly-used trait object.
    pub fn as_executor(self: Arc<Self>) -> BoxedExecutor {
        self
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn execute_async(
        &self,
        command: &mut tokio::process::Command,
    ) -> Result<Output, ExecutionError> {
        let command = command.as_std();
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        log_input(&self.log, id, command);

        let fake = FakeCommand::new(command);
        self.history.lock().unwrap().push(fake.clone());
        let output = (self.wait_handler.lock().unwrap())(&fake);
        log_output(&self.log, id, &output);

        if !output.status.success() {
            return Err(output_to_exec_error(command, &output));
        }
        Ok(output)
    }
}
