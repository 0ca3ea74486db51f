use std::ffi::{OsStr, OsString};
use std::io::{self, Write};
use std::process::{Command, ExitStatus, Stdio};

use crate::error::Error;
use crate::messenger::Messenger;

/// Full replacement environment for a child process. `None` on a `Cmd`
/// means the child inherits the parent environment untouched.
pub type CommandEnv = Vec<(String, String)>;

/// One command line, carried as a value so executors can be swapped for
/// an in-memory recorder in tests.
#[derive(Debug, Clone)]
pub struct Cmd {
    argv: Vec<OsString>,
    env: Option<CommandEnv>,
    stdin: Option<Vec<u8>>,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Cmd {
            argv: vec![program.as_ref().to_os_string()],
            env: None,
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.argv.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.argv.push(arg.as_ref().to_os_string());
        }
        self
    }

    /// Replace the child's environment instead of inheriting it.
    pub fn env(mut self, env: CommandEnv) -> Self {
        self.env = Some(env);
        self
    }

    /// Feed these bytes to the child on a piped stdin.
    pub fn stdin_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.stdin = Some(bytes);
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.argv[0]
    }

    pub fn argv(&self) -> &[OsString] {
        &self.argv
    }

    pub fn replacement_env(&self) -> Option<&CommandEnv> {
        self.env.as_ref()
    }

    pub fn stdin_payload(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    /// Single-line rendering for announcements and error messages.
    pub fn rendered(&self) -> String {
        self.argv
            .iter()
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Spawns host commands. The orchestrator never forks on its own; every
/// child process goes through one of these two calls.
pub trait Executor {
    /// Run to completion with inherited stdio; non-zero exit is an error.
    fn run(&self, cmd: &Cmd) -> Result<(), Error>;

    /// Like `run`, but capture stdout.
    fn capture(&self, cmd: &Cmd) -> Result<String, Error>;
}

/// Executor that actually spawns processes, announcing each command
/// line through the messenger first.
pub struct HostExecutor<'a> {
    messenger: &'a dyn Messenger,
}

impl<'a> HostExecutor<'a> {
    pub fn new(messenger: &'a dyn Messenger) -> Self {
        Self { messenger }
    }

    fn command(&self, cmd: &Cmd) -> Command {
        let mut command = Command::new(cmd.program());
        command.args(&cmd.argv()[1..]);
        if let Some(env) = cmd.replacement_env() {
            command.env_clear();
            command.envs(env.iter().map(|(key, value)| (key, value)));
        }
        command
    }
}

impl Executor for HostExecutor<'_> {
    fn run(&self, cmd: &Cmd) -> Result<(), Error> {
        self.messenger.announce_command(cmd);
        let mut command = self.command(cmd);

        let status = if let Some(payload) = cmd.stdin_payload() {
            command.stdin(Stdio::piped());
            let mut child = command.spawn().map_err(|e| spawn_error(cmd, e))?;
            {
                let mut stdin = child.stdin.take().expect("child stdin was piped");
                stdin.write_all(payload).map_err(|e| spawn_error(cmd, e))?;
            }
            child.wait().map_err(|e| spawn_error(cmd, e))?
        } else {
            command
                .spawn()
                .map_err(|e| spawn_error(cmd, e))?
                .wait()
                .map_err(|e| spawn_error(cmd, e))?
        };

        check_status(cmd, status)
    }

    fn capture(&self, cmd: &Cmd) -> Result<String, Error> {
        self.messenger.announce_command(cmd);
        let output = self
            .command(cmd)
            .stderr(Stdio::inherit())
            .output()
            .map_err(|e| spawn_error(cmd, e))?;
        check_status(cmd, output.status)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn spawn_error(cmd: &Cmd, source: io::Error) -> Error {
    Error::SpawnFailed {
        command: cmd.rendered(),
        source,
    }
}

fn check_status(cmd: &Cmd, status: ExitStatus) -> Result<(), Error> {
    if status.success() {
        Ok(())
    } else {
        Err(Error::CommandFailed {
            command: cmd.rendered(),
            code: status.code(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger::testing::RecordingMessenger;

    #[test]
    fn test_rendered_joins_argv() {
        let cmd = Cmd::new("parted")
            .args(["--script", "/dev/sda"])
            .args(["mklabel", "msdos"]);
        assert_eq!(cmd.rendered(), "parted --script /dev/sda mklabel msdos");
    }

    #[test]
    fn test_run_reports_exit_code() {
        let messenger = RecordingMessenger::default();
        let executor = HostExecutor::new(&messenger);
        let err = executor
            .run(&Cmd::new("/bin/sh").args(["-c", "exit 3"]))
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(3));
        assert_eq!(messenger.announced.borrow().len(), 1);
    }

    #[test]
    fn test_capture_returns_stdout() {
        let messenger = RecordingMessenger::default();
        let executor = HostExecutor::new(&messenger);
        let output = executor
            .capture(&Cmd::new("/bin/sh").args(["-c", "echo hello"]))
            .unwrap();
        assert_eq!(output, "hello\n");
    }

    #[test]
    fn test_replacement_env_is_exclusive() {
        let messenger = RecordingMessenger::default();
        let executor = HostExecutor::new(&messenger);
        let output = executor
            .capture(
                &Cmd::new("/bin/sh")
                    .args(["-c", "echo \"$MARKER:$PATH\""])
                    .env(vec![("MARKER".to_string(), "set".to_string())]),
            )
            .unwrap();
        assert_eq!(output, "set:\n");
    }

    #[test]
    fn test_stdin_bytes_are_piped() {
        let messenger = RecordingMessenger::default();
        let executor = HostExecutor::new(&messenger);
        executor
            .run(
                &Cmd::new("/bin/sh")
                    .args(["-c", "test \"$(cat)\" = root:secret"])
                    .stdin_bytes(b"root:secret".to_vec()),
            )
            .unwrap();
    }

    #[test]
    fn test_spawn_failure_is_not_command_failed() {
        let messenger = RecordingMessenger::default();
        let executor = HostExecutor::new(&messenger);
        let err = executor
            .run(&Cmd::new("/nonexistent/blockstrap-test-binary"))
            .unwrap_err();
        assert!(matches!(err, Error::SpawnFailed { .. }));
        assert_eq!(err.exit_code(), None);
    }
}
