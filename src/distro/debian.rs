use std::ffi::OsStr;
use std::fs;
use std::path::Path;

use anyhow::{Context, bail};

use super::Distro;
use crate::config::BootloaderApproach;
use crate::engine::COMMAND_CHROOT;
use crate::messenger::Messenger;
use crate::process::{Cmd, CommandEnv, Executor};

const DEBOOTSTRAP: &str = "debootstrap";
const DEBOOTSTRAP_SCRIPTS_DIR: &str = "/usr/share/debootstrap/scripts";
const DEFAULT_MIRROR: &str = "http://deb.debian.org/debian";

/// Debian driver: debootstrap for the unpack step, ifupdown-style
/// network configuration, grub-pc and update-initramfs inside the
/// chroot.
pub struct Debian<'a> {
    suite: String,
    mirror: String,
    executor: &'a dyn Executor,
    messenger: &'a dyn Messenger,
}

impl<'a> Debian<'a> {
    pub fn new(
        suite: String,
        mirror: Option<String>,
        executor: &'a dyn Executor,
        messenger: &'a dyn Messenger,
    ) -> Self {
        Self {
            suite,
            mirror: mirror.unwrap_or_else(|| DEFAULT_MIRROR.to_string()),
            executor,
            messenger,
        }
    }

    fn kernel_package(architecture: &str) -> Option<&'static str> {
        match architecture {
            "amd64" => Some("linux-image-amd64"),
            "i386" => Some("linux-image-686-pae"),
            "arm64" => Some("linux-image-arm64"),
            "armhf" => Some("linux-image-armmp"),
            _ => None,
        }
    }
}

impl Distro for Debian<'_> {
    fn check_release(&self) -> anyhow::Result<()> {
        let scripts_dir = Path::new(DEBOOTSTRAP_SCRIPTS_DIR);
        if !scripts_dir.is_dir() {
            // debootstrap itself missing is reported by the commands check
            return Ok(());
        }
        if !scripts_dir.join(&self.suite).exists() {
            bail!("debootstrap has no script for release \"{}\"", self.suite);
        }
        Ok(())
    }

    fn check_architecture(&self, architecture: &str) -> anyhow::Result<()> {
        if Self::kernel_package(architecture).is_none() {
            bail!("architecture \"{architecture}\" is not supported for Debian");
        }
        Ok(())
    }

    fn select_bootloader(&self) -> BootloaderApproach {
        // grub-pc is installed into the chroot, so run its grub-install
        BootloaderApproach::ChrootGrub2Drive
    }

    fn commands_to_check_for(&self) -> Vec<String> {
        vec![DEBOOTSTRAP.to_string()]
    }

    fn run_directory_bootstrap(
        &self,
        mountpoint: &Path,
        architecture: &str,
        approach: BootloaderApproach,
    ) -> anyhow::Result<()> {
        self.messenger.info(&format!(
            "Bootstrapping Debian \"{}\" into \"{}\"...",
            self.suite,
            mountpoint.display()
        ));

        let mut include = Vec::new();
        if let Some(kernel) = Self::kernel_package(architecture) {
            include.push(kernel);
        }
        if approach.uses_chroot() {
            include.push("grub-pc");
        }

        let mut cmd = Cmd::new(DEBOOTSTRAP).arg(format!("--arch={architecture}"));
        if !include.is_empty() {
            cmd = cmd.arg(format!("--include={}", include.join(",")));
        }
        cmd = cmd.arg(&self.suite).arg(mountpoint).arg(&self.mirror);
        self.executor.run(&cmd)?;
        Ok(())
    }

    fn create_network_configuration(&self, mountpoint: &Path) -> anyhow::Result<()> {
        let network_dir = mountpoint.join("etc/network");
        fs::create_dir_all(&network_dir)
            .with_context(|| format!("unable to create \"{}\"", network_dir.display()))?;
        let interfaces = network_dir.join("interfaces");
        self.messenger
            .info(&format!("Writing file \"{}\"...", interfaces.display()));
        fs::write(
            &interfaces,
            "auto lo\niface lo inet loopback\n\nallow-hotplug eth0\niface eth0 inet dhcp\n",
        )
        .with_context(|| format!("unable to write \"{}\"", interfaces.display()))?;
        Ok(())
    }

    fn chroot_command_grub2_install(&self) -> &str {
        "grub-install"
    }

    fn generate_grub_cfg_from_inside_chroot(
        &self,
        mountpoint: &Path,
        env: &CommandEnv,
    ) -> anyhow::Result<()> {
        self.executor.run(
            &Cmd::new(COMMAND_CHROOT)
                .arg(mountpoint)
                .args(["grub-mkconfig", "-o", "/boot/grub/grub.cfg"])
                .env(env.clone()),
        )?;
        Ok(())
    }

    fn generate_initramfs_from_inside_chroot(
        &self,
        mountpoint: &Path,
        env: &CommandEnv,
    ) -> anyhow::Result<()> {
        self.executor.run(
            &Cmd::new(COMMAND_CHROOT)
                .arg(mountpoint)
                .args(["update-initramfs", "-u", "-k", "all"])
                .env(env.clone()),
        )?;
        Ok(())
    }

    fn perform_post_chroot_clean_up(&self, mountpoint: &Path) -> anyhow::Result<()> {
        let archives = mountpoint.join("var/cache/apt/archives");
        if !archives.is_dir() {
            return Ok(());
        }
        self.messenger
            .info("Cleaning up downloaded package archives...");
        for entry in fs::read_dir(&archives)? {
            let entry = entry?;
            if entry.path().extension() == Some(OsStr::new("deb")) {
                fs::remove_file(entry.path())
                    .with_context(|| format!("unable to remove \"{}\"", entry.path().display()))?;
            }
        }
        Ok(())
    }
}
