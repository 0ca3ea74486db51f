use std::collections::HashSet;
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use nix::unistd::{AccessFlags, access};

use crate::error::Error;

/// Hidden files and editor backups are skipped in every script phase.
pub fn should_run(basename: &str) -> bool {
    !basename.starts_with('.') && !basename.ends_with('~')
}

/// Eligible scripts of a directory, sorted by basename.
pub fn eligible_scripts(dir: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut scripts = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("unable to list \"{}\"", dir.display()))?
    {
        let entry = entry?;
        if should_run(&entry.file_name().to_string_lossy()) {
            scripts.push(entry.path());
        }
    }
    scripts.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
    Ok(scripts)
}

/// The directory itself must be a true directory, writable only by its
/// owner, and owned by one of `trusted_uids`.
pub fn check_directory_trust(dir: &Path, trusted_uids: &HashSet<u32>) -> anyhow::Result<()> {
    let untrusted = |reason: String| Error::UntrustedScriptsDir {
        dir: dir.to_path_buf(),
        reason,
    };

    let props = fs::symlink_metadata(dir)
        .with_context(|| format!("unable to stat \"{}\"", dir.display()))?;

    if props.file_type().is_symlink() {
        return Err(untrusted("is a symlink; only true directories are supported".to_string()).into());
    }
    if !props.file_type().is_dir() {
        return Err(untrusted("is not a directory".to_string()).into());
    }
    if props.mode() & 0o022 != 0 {
        return Err(untrusted("is writable to users other than its owner".to_string()).into());
    }
    if !trusted_uids.contains(&props.uid()) {
        let mut uids: Vec<String> = trusted_uids.iter().map(u32::to_string).collect();
        uids.sort();
        return Err(untrusted(format!("is not owned by uid {}", uids.join(" or "))).into());
    }
    Ok(())
}

/// Every eligible script must carry the executable bit for the current
/// user.
pub fn check_executability(dir: &Path) -> anyhow::Result<()> {
    for script in eligible_scripts(dir)? {
        if access(&script, AccessFlags::X_OK).is_err() {
            return Err(Error::ScriptNotExecutable(script).into());
        }
    }
    Ok(())
}
