use core::fmt;
use std::{
    borrow::Cow,
    collections::VecDeque,
    ffi::{OsStr, OsString},
    fmt::Debug,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    str::Utf8Error,
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use stacked_errors::{bail_locationless, Result, StackableErr};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    process::{self, Child},
    sync::Mutex,
    task::{self, JoinHandle},
};
use tracing::warn;

use crate::{acquire_dir_path, next_terminal_color};

// note that most things should use `_locationless`, especially if they are
// expected to be able to error under normal `Command` running circumstances,
// the string info should be enough

/// An OS command, `tokio::process::Command` wrapped with recording of the
/// standard streams and optional forwarding to the streams of this process.
#[derive(Clone, Serialize, Deserialize)]
pub struct Command {
    /// The program to run.
    pub program: OsString,
    /// All the arguments that will be passed to the program
    pub args: Vec<OsString>,
    /// If set, the environment variable map is cleared (before the `envs` are
    /// applied)
    pub env_clear: bool,
    /// Environment variable mappings
    pub envs: Vec<(OsString, OsString)>,
    /// Working directory for the process. `acquire_dir_path` is used on this
    /// in the functions that run the `Command`.
    pub cwd: Option<PathBuf>,
    /// Enables recording of the stdout, accessible from `stdout` in the
    /// command result later. On by default.
    pub stdout_recording: bool,
    /// Enables recording of the stderr. On by default.
    pub stderr_recording: bool,
    /// Forward stdout to the current process stdout
    pub stdout_forward: bool,
    /// Forward stderr to the current process stderr
    pub stderr_forward: bool,
    /// If the default forwarded-line prefix should be overridden
    pub forward_line_prefix: Option<String>,
}

impl Default for Command {
    fn default() -> Self {
        Self {
            program: Default::default(),
            args: Default::default(),
            env_clear: Default::default(),
            envs: Default::default(),
            cwd: Default::default(),
            stdout_recording: true,
            stderr_recording: true,
            stdout_forward: Default::default(),
            stderr_forward: Default::default(),
            forward_line_prefix: None,
        }
    }
}

impl Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "Command {{ program: {:?},",
            self.get_unified_command()
        ))?;
        if self.env_clear {
            f.write_fmt(format_args!(" env_clear: true,"))?;
        }
        if !self.envs.is_empty() {
            f.write_fmt(format_args!(" envs: {:?},", self.envs))?;
        }
        if let Some(cwd) = &self.cwd {
            f.write_fmt(format_args!(" cwd: {cwd:?},"))?;
        }
        f.write_fmt(format_args!(" }}"))
    }
}

impl Command {
    /// Creates a new `Command` for launching the `program`. This has no
    /// preprocessing of the input like [Command::new] does.
    pub fn new_os_str(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().into(),
            ..Default::default()
        }
    }

    /// Creates a `Command` that only sets the `program` and `args` and leaves
    /// other things as their default values. `program_with_args` is separated
    /// by whitespace, the first part becomes the program, and the others are
    /// inserted as args.
    ///
    /// In case an argument has spaces, it should be put into `args` as an
    /// unbroken `&str`.
    pub fn new(program_with_args: impl AsRef<str>) -> Self {
        let mut program = String::new();
        let mut args: Vec<OsString> = vec![];
        for (i, part) in program_with_args.as_ref().split_whitespace().enumerate() {
            if i == 0 {
                part.clone_into(&mut program)
            } else {
                args.push(part.into());
            }
        }
        Self {
            program: program.into(),
            args,
            ..Default::default()
        }
    }

    /// Adds an argument
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().into());
        self
    }

    /// Adds arguments to be passed to the program
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|s| s.as_ref().into()));
        self
    }

    /// Sets `self.cwd`
    pub fn cwd(mut self, cwd: impl AsRef<Path>) -> Self {
        self.cwd = Some(cwd.as_ref().to_owned());
        self
    }

    /// Set if environment variables should be cleared
    pub fn env_clear(mut self, env_clear: bool) -> Self {
        self.env_clear = env_clear;
        self
    }

    /// Adds environment variables
    pub fn envs<I, K, V>(mut self, envs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.envs.extend(
            envs.into_iter()
                .map(|(k, v)| (k.as_ref().into(), v.as_ref().into())),
        );
        self
    }

    /// Sets `stdout_forward` and `stderr_forward` for passing command standard
    /// streams to the standard streams of this process.
    pub fn forward(mut self, std_stream_forward: bool) -> Self {
        self.stdout_forward = std_stream_forward;
        self.stderr_forward = std_stream_forward;
        self
    }

    /// Sets `stdout_recording` and `stderr_recording`
    pub fn recording(mut self, recording: bool) -> Self {
        self.stdout_recording = recording;
        self.stderr_recording = recording;
        self
    }

    /// Changes the forwarded-line prefix. If `None`, then the default of the
    /// command name and process ID is used.
    pub fn forward_line_prefix(mut self, line_prefix: Option<String>) -> Self {
        self.forward_line_prefix = line_prefix;
        self
    }

    /// Gets the program and args interspersed with spaces
    pub(crate) fn get_unified_command(&self) -> String {
        let mut command = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            command += " ";
            command += arg.to_string_lossy().as_ref();
        }
        command
    }

    /// Runs the command with a standard input, returning a `CommandRunner`
    pub async fn run_with_stdin<C: Into<Stdio>>(self, stdin_cfg: C) -> Result<CommandRunner> {
        command_runner(self, stdin_cfg).await
    }

    /// Calls [Command::run_with_stdin] with `Stdio::null()`
    pub async fn run(self) -> Result<CommandRunner> {
        self.run_with_stdin(Stdio::null()).await
    }

    /// Calls [Command::run] and waits for it to complete, returning the
    /// command result
    pub async fn run_to_completion(self) -> Result<CommandResult> {
        self.run()
            .await
            .stack_err_locationless("Command::run_to_completion")?
            .wait_with_output()
            .await
    }
}

/// Used as the engine of the stdout and stderr recording tasks. `unwrap`s and
/// `expect`s only are used in here because it is spawned as a separate task.
async fn recorder<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    mut std_read: BufReader<R>,
    std_record: Option<Arc<Mutex<VecDeque<u8>>>>,
    mut std_forward: Option<(W, String)>,
) {
    const FORWARDING_FAILED: &str = "`stevedore::Command` stream recording failed on write";
    // if the previous write ended with a newline (the prefix goes on line starts)
    let mut previous_newline = true;
    let mut line_buf = Vec::new();
    // 8 KB, like BufReader
    let mut buf = [0u8; 8 * 1024];
    loop {
        match std_read.read(&mut buf).await {
            Ok(0) => break,
            Ok(bytes_read) => {
                let bytes = &buf[..bytes_read];
                if let Some(ref arc) = std_record {
                    let mut deque = arc.lock().await;
                    deque.extend(bytes);
                }
                if let Some((ref mut std_forward, ref prefix)) = std_forward {
                    // `lines_with_terminator` avoids the issue with `lines`
                    // where trailing newline presence is indistinguishable
                    for line in bstr::ByteSlice::lines_with_terminator(bytes) {
                        // write the prefix together with the line, otherwise
                        // stdout running into stderr is too common
                        if previous_newline {
                            line_buf.extend_from_slice(prefix.as_bytes());
                        }
                        previous_newline = line.last() == Some(&b'\n');
                        line_buf.extend_from_slice(line);
                        std_forward
                            .write_all(&line_buf)
                            .await
                            .expect(FORWARDING_FAILED);
                        line_buf.clear();
                    }
                    std_forward.flush().await.expect(FORWARDING_FAILED);
                }
            }
            Err(e) => {
                panic!("`stevedore::Command` stream recording failed on read: {e}")
            }
        }
    }
}

pub(crate) async fn command_runner<C: Into<Stdio>>(
    this: Command,
    stdin_cfg: C,
) -> Result<CommandRunner> {
    let mut cmd = process::Command::new(&this.program);
    if this.env_clear {
        // must happen before the `envs` call
        cmd.env_clear();
    }
    if let Some(ref cwd) = this.cwd {
        let cwd = acquire_dir_path(cwd)
            .await
            .stack_err_with_locationless(|| {
                format!("{this:?}.run() -> failed to acquire current working directory")
            })?;
        cmd.current_dir(cwd);
    }
    let stdout_record = Arc::new(Mutex::new(VecDeque::new()));
    let stderr_record = Arc::new(Mutex::new(VecDeque::new()));
    cmd.args(&this.args)
        .envs(this.envs.iter().map(|x| (&x.0, &x.1)))
        .kill_on_drop(true);
    let mut child = cmd
        .stdin(stdin_cfg)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .stack_err_with_locationless(|| {
            format!("{this:?}.run() -> failed to spawn child process")
        })?;
    let child_id = child.id().unwrap_or(0);
    let program_name = this.program.to_string_lossy();
    let terminal_color = if this.stdout_forward || this.stderr_forward {
        next_terminal_color()
    } else {
        owo_colors::AnsiColors::Default
    };
    let mut handles: Vec<JoinHandle<()>> = vec![];
    if this.stdout_recording || this.stdout_forward {
        let stdout = child.stdout.take().unwrap();
        let forward = this.stdout_forward.then(|| {
            let prefix = this.forward_line_prefix.clone().unwrap_or_else(|| {
                owo_colors::OwoColorize::color(
                    &format!("{program_name} {child_id}  | "),
                    terminal_color,
                )
                .to_string()
            });
            (tokio::io::stdout(), prefix)
        });
        handles.push(task::spawn(recorder(
            BufReader::new(stdout),
            this.stdout_recording.then(|| Arc::clone(&stdout_record)),
            forward,
        )));
    }
    if this.stderr_recording || this.stderr_forward {
        let stderr = child.stderr.take().unwrap();
        let forward = this.stderr_forward.then(|| {
            let prefix = this.forward_line_prefix.clone().unwrap_or_else(|| {
                owo_colors::OwoColorize::color(
                    &format!("{program_name} {child_id} E| "),
                    terminal_color,
                )
                .to_string()
            });
            (tokio::io::stderr(), prefix)
        });
        handles.push(task::spawn(recorder(
            BufReader::new(stderr),
            this.stderr_recording.then(|| Arc::clone(&stderr_record)),
            forward,
        )));
    }
    Ok(CommandRunner {
        command: Some(this),
        child_process: Some(child),
        handles,
        stdout_record,
        stderr_record,
        result: None,
    })
}

/// Detached `Command`s are represented by this struct.
///
/// # Note
///
/// Locks on `stdout_record` and `stderr_record` should only be held long
/// enough to make the needed `VecDeque` operations, because the task
/// recording program outputs needs the lock to progress.
#[must_use]
#[derive(Default)]
pub struct CommandRunner {
    // this information is kept around for failures
    command: Option<Command>,
    /// The handle to the `Child` process. The `ChildStdout` and `ChildStderr`
    /// were taken if there was any kind of recording or forwarding.
    pub child_process: Option<Child>,
    handles: Vec<JoinHandle<()>>,
    /// The stdout of the command is actively pushed to this
    pub stdout_record: Arc<Mutex<VecDeque<u8>>>,
    /// The stderr of the command is actively pushed to this
    pub stderr_record: Arc<Mutex<VecDeque<u8>>>,
    result: Option<CommandResult>,
}

impl Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // don't try to display `stdout` and `stderr`, leave that for the result
        f.debug_struct("CommandRunner")
            .field("command", &self.command)
            .field("child_process", &self.child_process)
            .finish()
    }
}

impl Drop for CommandRunner {
    fn drop(&mut self) {
        // we purposely parenthesize in this way to avoid calling `panicking` in
        // the normal case
        if self.child_process.is_some() && (!std::thread::panicking()) {
            warn!(
                "A `CommandRunner` was dropped without being properly finished, the command was: \
                 {}",
                self.command
                    .as_ref()
                    .map(|c| c.get_unified_command())
                    .unwrap_or_default()
            )
        }
    }
}

impl CommandRunner {
    /// Attempts to force the command to exit, but does not wait for the
    /// request to take effect. This does not set `self.result`.
    pub fn start_terminate(&mut self) -> Result<()> {
        if let Some(child_process) = self.child_process.as_mut() {
            child_process
                .start_kill()
                .stack_err("CommandRunner::start_terminate -> `start_kill` failed")
        } else {
            Ok(())
        }
    }

    /// Finishes the `CommandResult` (or stalls forever if the OS command
    /// does). If this function succeeds, it only means that the OS calls and
    /// stream handling all succeeded, it does not mean that the command
    /// itself had a successful return status, use `assert_success` or check
    /// the `status` on the `CommandResult`.
    pub async fn wait_with_output(mut self) -> Result<CommandResult> {
        let output = self
            .child_process
            .take()
            .stack_err_locationless("`CommandRunner` has already had some termination method called")?
            .wait_with_output()
            .await
            .stack_err_with_locationless(|| {
                format!("{self:?}.wait_with_output() -> failed when waiting on child process")
            })?;
        while let Some(handle) = self.handles.pop() {
            handle.await.stack_err_with_locationless(|| {
                format!("{self:?}.wait_with_output() -> `Command` task panicked")
            })?;
        }
        let stdout = self.stdout_record.lock().await.iter().copied().collect();
        let stderr = self.stderr_record.lock().await.iter().copied().collect();
        Ok(CommandResult {
            command: self.command.take().unwrap(),
            status: Some(output.status),
            stdout,
            stderr,
        })
    }
}

/// The result of a [Command](crate::Command)
#[must_use]
#[derive(Clone, Default)]
pub struct CommandResult {
    // the command information is kept around for failures
    pub command: Command,
    pub status: Option<ExitStatus>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Debug for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!(
            "CommandResult {{\ncommand: {:?},\nstatus: {:?},\n",
            self.command, self.status
        ))?;
        let stdout = self.stdout_as_utf8_lossy();
        if !stdout.is_empty() {
            f.write_fmt(format_args!("stdout: {stdout}\n,"))?;
        }
        let stderr = self.stderr_as_utf8_lossy();
        if !stderr.is_empty() {
            f.write_fmt(format_args!("stderr: {stderr}\n,"))?;
        }
        f.write_fmt(format_args!("}}"))
    }
}

impl CommandResult {
    /// Returns if the command completed (not terminated early) with a
    /// successful return status
    pub fn successful(&self) -> bool {
        if let Some(status) = self.status.as_ref() {
            status.success()
        } else {
            false
        }
    }

    /// Returns a formatted error with relevant information if the command was
    /// not successful
    pub fn assert_success(&self) -> Result<()> {
        if let Some(status) = self.status.as_ref() {
            if status.success() {
                Ok(())
            } else {
                bail_locationless!("{self:#?}.assert_success() -> unsuccessful")
            }
        } else {
            bail_locationless!(
                "{self:#?}.assert_success() -> termination was called before completion"
            )
        }
    }

    /// Returns `str::from_utf8(&self.stdout)`
    pub fn stdout_as_utf8(&self) -> std::result::Result<&str, Utf8Error> {
        std::str::from_utf8(&self.stdout)
    }

    /// Returns `str::from_utf8(&self.stderr)`
    pub fn stderr_as_utf8(&self) -> std::result::Result<&str, Utf8Error> {
        std::str::from_utf8(&self.stderr)
    }

    /// Returns `String::from_utf8_lossy(&self.stdout)`
    pub fn stdout_as_utf8_lossy(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Returns `String::from_utf8_lossy(&self.stderr)`
    pub fn stderr_as_utf8_lossy(&self) -> Cow<str> {
        String::from_utf8_lossy(&self.stderr)
    }
}
