mod debian;

pub use debian::Debian;

use std::path::Path;

use crate::config::BootloaderApproach;
use crate::process::CommandEnv;

/// Per-distribution extension points, consulted by the engine at fixed
/// places in the pipeline. Drivers never drive the pipeline themselves.
pub trait Distro {
    /// Preflight: is the configured release something this driver can
    /// unpack?
    fn check_release(&self) -> anyhow::Result<()>;

    /// Preflight: reject architecture/machine pairs known not to work.
    fn check_architecture(&self, architecture: &str) -> anyhow::Result<()>;

    /// Bootloader approach to use when the user asked for `auto`.
    fn select_bootloader(&self) -> BootloaderApproach;

    /// Host commands (bare names) or absolute files the driver needs.
    fn commands_to_check_for(&self) -> Vec<String>;

    /// Unpack a root filesystem into `mountpoint`.
    fn run_directory_bootstrap(
        &self,
        mountpoint: &Path,
        architecture: &str,
        approach: BootloaderApproach,
    ) -> anyhow::Result<()>;

    fn create_network_configuration(&self, mountpoint: &Path) -> anyhow::Result<()>;

    /// Basename of grub2-install inside the chroot.
    fn chroot_command_grub2_install(&self) -> &str;

    fn generate_grub_cfg_from_inside_chroot(
        &self,
        mountpoint: &Path,
        env: &CommandEnv,
    ) -> anyhow::Result<()>;

    fn generate_initramfs_from_inside_chroot(
        &self,
        mountpoint: &Path,
        env: &CommandEnv,
    ) -> anyhow::Result<()>;

    fn perform_post_chroot_clean_up(&self, mountpoint: &Path) -> anyhow::Result<()>;
}
