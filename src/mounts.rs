use std::ffi::OsString;
use std::fs;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

use anyhow::Context;

const MOUNTINFO: &str = "/proc/self/mountinfo";

/// Snapshot of the mount table, in the order the kernel lists it.
pub struct MountFinder {
    mount_points: Vec<PathBuf>,
}

impl MountFinder {
    pub fn load() -> anyhow::Result<Self> {
        let text =
            fs::read_to_string(MOUNTINFO).with_context(|| format!("unable to read {MOUNTINFO}"))?;
        Ok(Self::parse(&text))
    }

    fn parse(text: &str) -> Self {
        // mountinfo field 5 is the mount point, octal-escaped
        let mount_points = text
            .lines()
            .filter_map(|line| line.split_whitespace().nth(4))
            .map(unescape_mount_point)
            .collect();
        Self { mount_points }
    }

    /// Mountpoints strictly below `root`, in mount order. Reverse the
    /// result to obtain a safe unmount order.
    pub fn below<'a>(&'a self, root: &'a Path) -> impl Iterator<Item = &'a Path> {
        self.mount_points
            .iter()
            .map(PathBuf::as_path)
            .filter(move |mount_point| mount_point.starts_with(root) && *mount_point != root)
    }
}

/// The kernel escapes space, tab, newline and backslash in mount points
/// as three-digit octal sequences.
fn unescape_mount_point(field: &str) -> PathBuf {
    let bytes = field.as_bytes();
    let mut unescaped = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            if let Some(value) = octal_triplet(&bytes[i + 1..i + 4]) {
                unescaped.push(value);
                i += 4;
                continue;
            }
        }
        unescaped.push(bytes[i]);
        i += 1;
    }
    PathBuf::from(OsString::from_vec(unescaped))
}

fn octal_triplet(digits: &[u8]) -> Option<u8> {
    let mut value: u32 = 0;
    for &digit in digits {
        if !digit.is_ascii_digit() || digit > b'7' {
            return None;
        }
        value = value * 8 + u32::from(digit - b'0');
    }
    u8::try_from(value).ok()
}
