use std::path::PathBuf;

use anyhow::{Context, anyhow};
use clap::Parser;

use crate::config::{BootloaderApproach, BootstrapConfig, DiskId, require_valid_uuid};

/// Parse a 4-byte MBR disk identifier, e.g. 0x2448b5d1.
fn parse_disk_id(src: &str) -> anyhow::Result<DiskId> {
    src.parse()
}

/// Accept only the canonical 8-4-4-4-12 UUID form.
fn parse_uuid(src: &str) -> anyhow::Result<String> {
    require_valid_uuid(src)?;
    Ok(src.to_string())
}

fn parse_hostname(src: &str) -> anyhow::Result<String> {
    if src.is_empty() {
        return Err(anyhow!("hostname must not be empty"));
    }
    Ok(src.to_string())
}

#[derive(Parser)]
#[clap(
    name = "blockstrap",
    about = "Creates a minimal bootable Debian system on a block device",
    version
)]
pub struct App {
    /// Verbose output
    #[clap(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Block device (disk, loop or LVM volume) to turn into a bootable disk
    #[clap()]
    pub target: PathBuf,

    /// Hostname of the new system
    #[clap(long = "hostname", value_parser = parse_hostname)]
    pub hostname: String,

    /// Architecture to bootstrap, e.g. amd64
    #[clap(long = "arch", default_value = "amd64")]
    pub architecture: String,

    /// Debian release to bootstrap
    #[clap(long = "release", default_value = "bookworm")]
    pub release: String,

    /// Debian mirror to bootstrap from
    #[clap(long = "mirror")]
    pub mirror: Option<String>,

    /// Root password (consider --password-file instead)
    #[clap(long = "password", conflicts_with = "password_file")]
    pub password: Option<String>,

    /// File whose first line is used as the root password
    #[clap(long = "password-file", value_name = "FILE")]
    pub password_file: Option<PathBuf>,

    /// resolv.conf whose nameserver lines are copied into the target
    #[clap(long = "resolv-conf", default_value = "/etc/resolv.conf")]
    pub resolv_conf: PathBuf,

    /// Four-byte MBR disk identifier, e.g. 0x2448b5d1
    #[clap(long = "disk-id", value_parser = parse_disk_id)]
    pub disk_id: Option<DiskId>,

    /// UUID to impose on the first partition's filesystem
    #[clap(long = "first-partition-uuid", value_parser = parse_uuid)]
    pub first_partition_uuid: Option<String>,

    /// Directory of scripts to run before entering the chroot
    #[clap(long = "scripts-pre", value_name = "DIR")]
    pub scripts_dir_pre: Option<PathBuf>,

    /// Directory of scripts to copy into and run inside the chroot
    #[clap(long = "scripts-chroot", value_name = "DIR")]
    pub scripts_dir_chroot: Option<PathBuf>,

    /// Directory of scripts to run after leaving the chroot
    #[clap(long = "scripts-post", value_name = "DIR")]
    pub scripts_dir_post: Option<PathBuf>,

    /// grub2-install command to use (absolute path or basename)
    #[clap(long = "grub2-install", value_name = "COMMAND")]
    pub grub2_install: Option<String>,

    /// How and where to install the bootloader
    #[clap(long = "bootloader", value_enum, default_value_t = BootloaderApproach::Auto)]
    pub bootloader_approach: BootloaderApproach,

    /// Pass --force to grub2-install
    #[clap(long = "bootloader-force")]
    pub bootloader_force: bool,
}

impl App {
    /// Resolve relative paths against the current directory and build
    /// the immutable engine configuration.
    pub fn into_config(self) -> anyhow::Result<BootstrapConfig> {
        Ok(BootstrapConfig {
            hostname: self.hostname,
            architecture: self.architecture,
            root_password: self.password,
            root_password_file: absolutize_opt(self.password_file)?,
            etc_resolv_conf_source: absolutize(self.resolv_conf)?,
            disk_id: self.disk_id,
            first_partition_uuid: self.first_partition_uuid,
            scripts_dir_pre: absolutize_opt(self.scripts_dir_pre)?,
            scripts_dir_chroot: absolutize_opt(self.scripts_dir_chroot)?,
            scripts_dir_post: absolutize_opt(self.scripts_dir_post)?,
            target_path: absolutize(self.target)?,
            grub2_install_command: self.grub2_install,
            bootloader_approach: self.bootloader_approach,
            bootloader_force: self.bootloader_force,
        })
    }
}

fn absolutize(path: PathBuf) -> anyhow::Result<PathBuf> {
    std::path::absolute(&path)
        .with_context(|| format!("unable to make \"{}\" absolute", path.display()))
}

fn absolutize_opt(path: Option<PathBuf>) -> anyhow::Result<Option<PathBuf>> {
    path.map(absolutize).transpose()
}
