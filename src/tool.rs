use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::error::Error;
use crate::process::{Cmd, Executor};

/// GRUB legacy identifies itself like "GRUB GRUB 0.97" on --version.
const GRUB_LEGACY_MARKER: &str = "GRUB GRUB 0.";

/// Locates host executables for the pipeline.
pub struct CommandResolver {
    path: OsString,
}

impl CommandResolver {
    /// Resolver over the current process environment's PATH.
    pub fn from_env() -> Self {
        Self {
            path: env::var_os("PATH").unwrap_or_default(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_path(path: impl Into<OsString>) -> Self {
        Self { path: path.into() }
    }

    /// An already absolute name only has to exist; everything else is
    /// looked up on PATH.
    pub fn resolve(&self, name: &str) -> Result<PathBuf, Error> {
        let candidate = Path::new(name);
        if candidate.is_absolute() {
            if candidate.exists() {
                return Ok(candidate.to_path_buf());
            }
            return Err(Error::MissingCommand(name.to_string()));
        }

        match which::which_in(name, Some(&self.path), "/") {
            Ok(abs_path) => Ok(abs_path),
            Err(which::Error::CannotFindBinaryPath) => Err(Error::MissingCommand(name.to_string())),
            Err(source) => Err(Error::CommandLookupFailed {
                name: name.to_string(),
                source,
            }),
        }
    }
}

/// Probe a grub-install candidate for being GRUB legacy rather than
/// GRUB 2.
pub fn is_grub_legacy(executor: &dyn Executor, grub_install: &Path) -> Result<bool, Error> {
    let output = executor.capture(&Cmd::new(grub_install).arg("--version"))?;
    Ok(output.contains(GRUB_LEGACY_MARKER))
}
