use std::io;
use std::path::PathBuf;

use nix::errno::Errno;

/// Failure classes surfaced by the bootstrap pipeline.
///
/// `CommandFailed` carries the child's exit code so the settling-retry
/// policy can tell a shell-level "command not found" (exit 127) from an
/// ordinary failure.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("command \"{0}\" not found in PATH")]
    MissingCommand(String),

    #[error("file \"{}\" not found", .0.display())]
    MissingFile(PathBuf),

    #[error("not a block device: \"{}\"", .0.display())]
    NotABlockDevice(PathBuf),

    #[error("scripts directory \"{}\" {reason}", .dir.display())]
    UntrustedScriptsDir { dir: PathBuf, reason: String },

    #[error("permission denied, file \"{}\" not executable", .0.display())]
    ScriptNotExecutable(PathBuf),

    #[error(
        "\"{}\" is GRUB legacy while GRUB 2 is needed; \
         please install GRUB 2 or pass --grub2-install on the command line",
        .0.display()
    )]
    GrubLegacyDetected(PathBuf),

    #[error("unsharing mount and UTS namespaces failed: {0}")]
    NamespaceSetupFailed(Errno),

    #[error("setting hostname failed: {0}")]
    HostnameSetFailed(Errno),

    #[cfg(not(target_os = "linux"))]
    #[error("mount and UTS namespaces are only supported on Linux")]
    NotSupported,

    #[error("command `{command}` exited with {}", exit_display(.code))]
    CommandFailed {
        command: String,
        code: Option<i32>,
    },

    #[error("failed to spawn `{command}`: {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("no such block device file: \"{}\"", .0.display())]
    PartitionDeviceMissing(PathBuf),

    #[error("\"{0}\" is not a valid UUID")]
    InvalidUuid(String),

    #[error("cannot search PATH for \"{name}\": {source}")]
    CommandLookupFailed {
        name: String,
        #[source]
        source: which::Error,
    },
}

impl Error {
    /// Exit code of the failed child, if this is a `CommandFailed`.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::CommandFailed { code, .. } => *code,
            _ => None,
        }
    }
}

fn exit_display(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}
