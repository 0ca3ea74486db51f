use std::collections::{BTreeSet, HashSet};
use std::env;
use std::fs::{self, DirBuilder, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::{DirBuilderExt, FileTypeExt};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, anyhow};

use crate::config::{BootloaderApproach, BootstrapConfig, require_valid_uuid};
use crate::distro::Distro;
use crate::error::Error;
use crate::messenger::Messenger;
use crate::mounts::MountFinder;
use crate::namespaces::Isolator;
use crate::process::{Cmd, CommandEnv, Executor};
use crate::retry::{SETTLE_ATTEMPTS, SETTLE_DELAY, with_settling_retries};
use crate::scripts;
use crate::tool::{self, CommandResolver};

const MOUNTPOINT_PARENT_DIR: &str = "/mnt";
const CHROOT_SCRIPT_TARGET_DIR: &str = "root/chroot-scripts";

const DISK_ID_OFFSET: u64 = 440;

/// Partition suffix passed to kpartx. Keep at "p" to not break LVM
/// device-mapper naming.
const PARTITION_DELIMITER: &str = "p";

const GRUB_DRIVE: &str = "(hd0)";

const COMMAND_BLKID: &str = "blkid";
const COMMAND_CHMOD: &str = "chmod";
pub const COMMAND_CHROOT: &str = "chroot";
const COMMAND_CP: &str = "cp";
const COMMAND_KPARTX: &str = "kpartx";
const COMMAND_MKDIR: &str = "mkdir";
const COMMAND_MKFS_EXT4: &str = "mkfs.ext4";
const COMMAND_MOUNT: &str = "mount";
const COMMAND_PARTED: &str = "parted";
const COMMAND_PARTPROBE: &str = "partprobe";
const COMMAND_RM: &str = "rm";
const COMMAND_RMDIR: &str = "rmdir";
const COMMAND_SED: &str = "sed";
const COMMAND_TUNE2FS: &str = "tune2fs";
const COMMAND_UMOUNT: &str = "umount";

/// Mounts the chroot needs beyond the disk itself, in mount order:
/// (mount source, mount options, target relative to the mountpoint).
/// "PROC" is a placeholder source for the fresh proc filesystem.
const NON_DISK_MOUNT_TASKS: &[(&str, &[&str], &str)] = &[
    ("/dev", &["-o", "bind"], "dev"),
    ("/dev/pts", &["-o", "bind"], "dev/pts"),
    ("PROC", &["-t", "proc"], "proc"),
    ("/sys", &["-o", "bind"], "sys"),
];

/// The bootstrap pipeline: preflight checks, then a strictly ordered
/// sequence of privileged steps whose acquired resources are released
/// in reverse order on every exit path.
pub struct BootstrapEngine<'a> {
    config: BootstrapConfig,
    messenger: &'a dyn Messenger,
    executor: &'a dyn Executor,
    distro: &'a dyn Distro,
    isolator: &'a dyn Isolator,
    resolver: CommandResolver,
    mountpoint_parent: PathBuf,
    device_probe: Box<dyn Fn(&Path) -> bool + 'a>,
    sleep: Box<dyn Fn(Duration) + 'a>,

    // runtime state, owned by the pipeline alone
    bootloader_approach: BootloaderApproach,
    grub2_install_command: Option<String>,
    root_password: Option<String>,
    first_partition_uuid: Option<String>,
    first_partition_device: Option<PathBuf>,
    mountpoint: Option<PathBuf>,
    nondisk_mounts: Vec<PathBuf>,
}

impl<'a> BootstrapEngine<'a> {
    pub fn new(
        config: BootstrapConfig,
        messenger: &'a dyn Messenger,
        executor: &'a dyn Executor,
        distro: &'a dyn Distro,
        isolator: &'a dyn Isolator,
    ) -> Self {
        let bootloader_approach = config.bootloader_approach;
        let grub2_install_command = config.grub2_install_command.clone();
        let root_password = config.root_password.clone();
        let first_partition_uuid = config.first_partition_uuid.clone();
        Self {
            config,
            messenger,
            executor,
            distro,
            isolator,
            resolver: CommandResolver::from_env(),
            mountpoint_parent: PathBuf::from(MOUNTPOINT_PARENT_DIR),
            device_probe: Box::new(|path: &Path| path.exists()),
            sleep: Box::new(std::thread::sleep),
            bootloader_approach,
            grub2_install_command,
            root_password,
            first_partition_uuid,
            first_partition_device: None,
            mountpoint: None,
            nondisk_mounts: Vec::new(),
        }
    }

    // ----- preflight -------------------------------------------------

    /// Every check that must pass before the host is touched.
    pub fn preflight(&mut self) -> anyhow::Result<()> {
        self.distro.check_release()?;
        self.select_bootloader();
        self.detect_grub2_install()?;
        self.check_for_commands()?;
        self.check_target_block_device()?;
        self.check_architecture()?;
        self.check_script_permissions()?;
        self.process_root_password()?;
        Ok(())
    }

    fn select_bootloader(&mut self) {
        if self.bootloader_approach == BootloaderApproach::Auto {
            self.bootloader_approach = self.distro.select_bootloader();
            self.messenger.info(&format!(
                "Selected approach \"{}\" for bootloader installation.",
                self.bootloader_approach
            ));
        }
    }

    /// Prefer grub2-install, fall back to grub-install. A missing
    /// fallback is only recorded here; the commands check reports it.
    /// A grub-install that answers --version as GRUB 0.x is refused.
    fn detect_grub2_install(&mut self) -> anyhow::Result<()> {
        if self.grub2_install_command.is_some() {
            return Ok(());
        }
        if !self.bootloader_approach.uses_host_grub2_install() {
            return Ok(());
        }

        match self.resolver.resolve("grub2-install") {
            Ok(_) => {
                self.grub2_install_command = Some("grub2-install".to_string());
                return Ok(());
            }
            Err(Error::MissingCommand(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.grub2_install_command = Some("grub-install".to_string());
        match self.resolver.resolve("grub-install") {
            Ok(abs_path) => {
                if tool::is_grub_legacy(self.executor, &abs_path)? {
                    return Err(Error::GrubLegacyDetected(abs_path).into());
                }
            }
            Err(Error::MissingCommand(_)) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn commands_to_check_for(&self) -> Vec<String> {
        let mut commands = self.distro.commands_to_check_for();
        commands.extend(
            [
                COMMAND_BLKID,
                COMMAND_CHMOD,
                COMMAND_CHROOT,
                COMMAND_CP,
                COMMAND_KPARTX,
                COMMAND_MKDIR,
                COMMAND_MKFS_EXT4,
                COMMAND_MOUNT,
                COMMAND_PARTED,
                COMMAND_PARTPROBE,
                COMMAND_RM,
                COMMAND_RMDIR,
                COMMAND_SED,
                COMMAND_TUNE2FS,
                COMMAND_UMOUNT,
            ]
            .iter()
            .map(|command| command.to_string()),
        );
        if let Some(grub2_install) = &self.grub2_install_command {
            commands.push(grub2_install.clone());
        }
        commands
    }

    fn check_for_commands(&self) -> anyhow::Result<()> {
        let mut infos_produced = false;
        let mut missing_files: Vec<PathBuf> = Vec::new();
        let mut missing_commands: Vec<String> = Vec::new();

        for command in self.commands_to_check_for().into_iter().collect::<BTreeSet<_>>() {
            if command.starts_with('/') {
                if !Path::new(&command).exists() {
                    missing_files.push(PathBuf::from(command));
                }
                continue;
            }
            match self.resolver.resolve(&command) {
                Ok(abs_path) => {
                    self.messenger
                        .info(&format!("Checking for {}... {}", command, abs_path.display()));
                    infos_produced = true;
                }
                Err(Error::MissingCommand(_)) => {
                    self.messenger
                        .error(&format!("Checking for {command}... NOT FOUND"));
                    missing_commands.push(command);
                }
                Err(e) => return Err(e.into()),
            }
        }

        if let Some(first) = missing_files.into_iter().next() {
            return Err(Error::MissingFile(first).into());
        }
        if let Some(first) = missing_commands.into_iter().next() {
            return Err(Error::MissingCommand(first).into());
        }
        if infos_produced {
            self.messenger.info_gap();
        }
        Ok(())
    }

    fn check_target_block_device(&self) -> anyhow::Result<()> {
        let target = &self.config.target_path;
        self.messenger
            .info(&format!("Checking if \"{}\" is a block device...", target.display()));
        let props = fs::metadata(target)
            .with_context(|| format!("unable to stat \"{}\"", target.display()))?;
        if !props.file_type().is_block_device() {
            return Err(Error::NotABlockDevice(target.clone()).into());
        }
        Ok(())
    }

    fn check_architecture(&self) -> anyhow::Result<()> {
        self.messenger
            .info("Checking for known unsupported architecture/machine combination...");
        self.distro.check_architecture(&self.config.architecture)
    }

    fn trusted_uids() -> HashSet<u32> {
        let mut uids = HashSet::new();
        uids.insert(nix::unistd::geteuid().as_raw());
        if let Some(sudo_uid) = env::var("SUDO_UID").ok().and_then(|value| value.parse().ok()) {
            uids.insert(sudo_uid);
        }
        uids
    }

    fn check_script_permissions(&self) -> anyhow::Result<()> {
        let mut infos_produced = false;
        let trusted = Self::trusted_uids();

        for (category, dir) in [
            ("pre-chroot", &self.config.scripts_dir_pre),
            ("chroot", &self.config.scripts_dir_chroot),
            ("post-chroot", &self.config.scripts_dir_post),
        ] {
            let Some(dir) = dir else { continue };

            self.messenger
                .info(&format!("Checking {category} scripts directory permissions..."));
            scripts::check_directory_trust(dir, &trusted)?;

            self.messenger
                .info(&format!("Checking {category} scripts for executability..."));
            scripts::check_executability(dir)?;
            infos_produced = true;
        }

        if infos_produced {
            self.messenger.info_gap();
        }
        Ok(())
    }

    fn process_root_password(&mut self) -> anyhow::Result<()> {
        if let Some(file) = &self.config.root_password_file {
            self.messenger
                .info(&format!("Reading root password from file \"{}\"...", file.display()));
            let content = fs::read_to_string(file)
                .with_context(|| format!("unable to read \"{}\"", file.display()))?;
            self.root_password = Some(content.lines().next().unwrap_or_default().to_string());
        } else if self.root_password.is_some() {
            self.messenger.warn(
                "Using --password PASSWORD is a security risk more often than not; \
                 please consider using --password-file FILE, instead.",
            );
        }
        Ok(())
    }

    // ----- pipeline --------------------------------------------------

    /// The privileged pipeline. Call after `preflight` has passed.
    pub fn run(&mut self) -> anyhow::Result<()> {
        self.messenger
            .info("Unsharing Linux namespaces (mount, UTS/hostname)...");
        self.isolator.isolate(&self.config.hostname)?;

        self.partition_device()?;
        self.set_disk_id_in_mbr()?;
        let forward = self.activate_and_run();
        let cleanup = self.deactivate_partition_devices();
        self.reconcile(forward, cleanup)
    }

    /// Activation and deactivation bracket one scope: even a partially
    /// failed activation leaves mappings worth tearing down.
    fn activate_and_run(&mut self) -> anyhow::Result<()> {
        self.activate_partition_devices()?;
        self.run_with_partitions_activated()
    }

    /// The forward error wins over the cleanup error; a masked cleanup
    /// failure is still reported through the messenger.
    fn reconcile(
        &self,
        forward: anyhow::Result<()>,
        cleanup: anyhow::Result<()>,
    ) -> anyhow::Result<()> {
        match (forward, cleanup) {
            (Ok(()), cleanup) => cleanup,
            (forward @ Err(_), Ok(())) => forward,
            (Err(forward), Err(cleanup)) => {
                self.messenger.error(&format!("Cleanup failed: {cleanup:#}"));
                Err(forward)
            }
        }
    }

    fn partition_device(&self) -> anyhow::Result<()> {
        let target = &self.config.target_path;
        self.messenger
            .info(&format!("Partitioning \"{}\"...", target.display()));
        self.executor.run(
            &Cmd::new(COMMAND_PARTED)
                .arg("--script")
                .arg(target)
                .args(["mklabel", "msdos"]),
        )?;
        self.executor.run(
            &Cmd::new(COMMAND_PARTED)
                .args(["--align", "optimal", "--script"])
                .arg(target)
                .args(["mkpart", "primary", "ext4", "1", "100%"]),
        )?;

        // The boot flag races against kernel device settling, so it is
        // best-effort under the retry policy (see with_settling_retries).
        let cmd_boot_flag = Cmd::new(COMMAND_PARTED)
            .arg("--script")
            .arg(target)
            .args(["set", "1", "boot", "on"]);
        (self.sleep)(SETTLE_DELAY);
        with_settling_retries(&*self.sleep, || self.executor.run(&cmd_boot_flag))?;
        Ok(())
    }

    /// parted rewrites the MBR, so the identifier patch must land after
    /// partitioning and before partition-device activation. This is a
    /// literal byte patch of [440, 444).
    fn set_disk_id_in_mbr(&self) -> anyhow::Result<()> {
        let Some(disk_id) = self.config.disk_id else {
            return Ok(());
        };

        self.messenger
            .info(&format!("Setting MBR disk identifier to {disk_id} (4 bytes)..."));
        let target = &self.config.target_path;
        let mut file = OpenOptions::new()
            .write(true)
            .open(target)
            .with_context(|| format!("unable to open \"{}\" for writing", target.display()))?;
        file.seek(SeekFrom::Start(DISK_ID_OFFSET))?;
        file.write_all(&disk_id.bytes())?;
        file.sync_all()?;
        Ok(())
    }

    fn activate_partition_devices(&mut self) -> anyhow::Result<()> {
        self.messenger.info("Activating partition devices...");
        let target = self.config.target_path.clone();
        let listing = self.executor.capture(
            &Cmd::new(COMMAND_KPARTX)
                .args(["-l", "-p", PARTITION_DELIMITER])
                .arg(&target),
        )?;
        let device_name = listing
            .lines()
            .next()
            .unwrap_or_default()
            .split(" : ")
            .next()
            .unwrap_or_default()
            .to_string();
        if device_name.is_empty() {
            return Err(anyhow!(
                "kpartx did not report any partition for \"{}\"",
                target.display()
            ));
        }
        let device = Path::new("/dev/mapper").join(&device_name);
        self.first_partition_device = Some(device.clone());

        if device_name.starts_with("loop") {
            // the kernel does not create mapper nodes for loop devices on
            // its own; a pre-existing node is stale state from an earlier run
            if (self.device_probe)(&device) {
                return Err(anyhow!("file exists: \"{}\"", device.display()));
            }
            self.executor.run(
                &Cmd::new(COMMAND_KPARTX)
                    .args(["-a", "-p", PARTITION_DELIMITER, "-s"])
                    .arg(&target),
            )?;
        } else {
            let cmd_refresh_table = Cmd::new(COMMAND_PARTPROBE).arg(&target);
            (self.sleep)(SETTLE_DELAY);
            with_settling_retries(&*self.sleep, || self.executor.run(&cmd_refresh_table))?;
        }

        for _ in 0..SETTLE_ATTEMPTS {
            if (self.device_probe)(&device) {
                return Ok(());
            }
            (self.sleep)(SETTLE_DELAY);
        }
        Err(Error::PartitionDeviceMissing(device).into())
    }

    fn deactivate_partition_devices(&self) -> anyhow::Result<()> {
        self.messenger.info("Deactivating partition devices...");
        let cmd = Cmd::new(COMMAND_KPARTX)
            .args(["-d", "-p", PARTITION_DELIMITER])
            .arg(&self.config.target_path);
        with_settling_retries(&*self.sleep, || self.executor.run(&cmd))?;
        Ok(())
    }

    fn run_with_partitions_activated(&mut self) -> anyhow::Result<()> {
        self.format_partition()?;
        if self.first_partition_uuid.is_some() {
            self.set_first_partition_uuid()?;
        } else {
            self.gather_first_partition_uuid()?;
        }
        self.create_mountpoint()?;
        let forward = self.run_with_mountpoint_directory();
        let cleanup = self.remove_mountpoint();
        self.reconcile(forward, cleanup)
    }

    fn format_partition(&self) -> anyhow::Result<()> {
        let device = self.first_partition_device();
        self.messenger
            .info(&format!("Creating file system on \"{}\"...", device.display()));
        self.executor
            .run(&Cmd::new(COMMAND_MKFS_EXT4).arg("-F").arg(device))?;
        Ok(())
    }

    fn set_first_partition_uuid(&self) -> anyhow::Result<()> {
        let uuid = self.first_partition_uuid();
        self.messenger
            .info(&format!("Setting first partition UUID to {uuid}..."));
        self.executor.run(
            &Cmd::new(COMMAND_TUNE2FS)
                .args(["-U", uuid])
                .arg(self.first_partition_device()),
        )?;
        Ok(())
    }

    fn gather_first_partition_uuid(&mut self) -> anyhow::Result<()> {
        let output = self.executor.capture(
            &Cmd::new(COMMAND_BLKID)
                .args(["-o", "value", "-s", "UUID"])
                .arg(self.first_partition_device()),
        )?;
        let uuid = output.trim_end().to_string();
        require_valid_uuid(&uuid)?;
        self.first_partition_uuid = Some(uuid);
        Ok(())
    }

    fn create_mountpoint(&mut self) -> anyhow::Result<()> {
        let dir = tempfile::Builder::new()
            .prefix("blockstrap-")
            .tempdir_in(&self.mountpoint_parent)
            .with_context(|| {
                format!(
                    "error creating a mountpoint directory under \"{}\"",
                    self.mountpoint_parent.display()
                )
            })?;
        let mountpoint = dir.keep();
        self.messenger
            .info(&format!("Creating directory \"{}\"...", mountpoint.display()));
        self.mountpoint = Some(mountpoint);
        Ok(())
    }

    fn remove_mountpoint(&mut self) -> anyhow::Result<()> {
        let mountpoint = self.mountpoint.take().expect("mountpoint has not been created");
        self.messenger
            .info(&format!("Removing directory \"{}\"...", mountpoint.display()));
        // the kernel may report the directory busy briefly after umount
        let mut attempt = 0;
        loop {
            attempt += 1;
            match fs::remove_dir(&mountpoint) {
                Ok(()) => return Ok(()),
                Err(e)
                    if attempt < SETTLE_ATTEMPTS
                        && e.raw_os_error() == Some(nix::errno::Errno::EBUSY as i32) =>
                {
                    (self.sleep)(SETTLE_DELAY);
                }
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("unable to remove directory \"{}\"", mountpoint.display())
                    });
                }
            }
        }
    }

    fn run_with_mountpoint_directory(&mut self) -> anyhow::Result<()> {
        self.mount_partition()?;
        let forward = self.run_with_partition_mounted();
        let cleanup = self.unmount_partition();
        self.reconcile(forward, cleanup)
    }

    fn mount_partition(&self) -> anyhow::Result<()> {
        self.messenger.info("Mounting partitions...");
        self.executor.run(
            &Cmd::new(COMMAND_MOUNT)
                .arg(self.first_partition_device())
                .arg(self.mountpoint()),
        )?;
        Ok(())
    }

    fn unmount_partition(&self) -> anyhow::Result<()> {
        self.messenger.info("Unmounting partitions...");
        self.try_unmounting(self.mountpoint())
    }

    fn run_with_partition_mounted(&mut self) -> anyhow::Result<()> {
        self.create_etc_directory()?;
        // provisional copies so the unpack step sees a sane environment
        self.create_etc_hostname()?;
        self.create_etc_resolv_conf()?;

        let forward = self.distro.run_directory_bootstrap(
            self.mountpoint(),
            &self.config.architecture,
            self.bootloader_approach,
        );
        // a crashed unpack step must not strand foreign mounts under the target
        let cleanup = self.unmount_directory_bootstrap_leftovers();
        self.reconcile(forward, cleanup)?;

        // the unpack step may have replaced both files
        self.create_etc_hostname()?;
        self.create_etc_resolv_conf()?;
        self.create_etc_fstab()?;
        self.distro.create_network_configuration(self.mountpoint())?;
        self.run_pre_scripts()?;

        if self.bootloader_approach.uses_host_grub2_install() {
            self.install_bootloader_grub2()?;
        }

        let forward = match self.mount_nondisk_chroot_mounts() {
            Ok(()) => self.run_inside_nondisk_mounts(),
            Err(e) => Err(e),
        };
        let cleanup = self.unmount_nondisk_chroot_mounts();
        self.reconcile(forward, cleanup)?;

        self.distro.perform_post_chroot_clean_up(self.mountpoint())?;
        self.run_post_scripts()
    }

    fn run_inside_nondisk_mounts(&mut self) -> anyhow::Result<()> {
        self.set_root_password_inside_chroot()?;

        if self.bootloader_approach.uses_chroot() {
            self.install_bootloader_grub2()?;
        }
        if self.bootloader_approach != BootloaderApproach::None {
            self.messenger.info("Generating GRUB configuration...");
            self.distro
                .generate_grub_cfg_from_inside_chroot(self.mountpoint(), &self.make_environment(false))?;
            self.fix_grub_cfg_root_device()?;
        }

        self.messenger.info("Generating initramfs...");
        self.distro
            .generate_initramfs_from_inside_chroot(self.mountpoint(), &self.make_environment(false))?;

        if self.config.scripts_dir_chroot.is_some() {
            self.copy_chroot_scripts()?;
            let forward = self.run_chroot_scripts();
            let cleanup = self.remove_chroot_scripts();
            self.reconcile(forward, cleanup)?;
        }
        Ok(())
    }

    // ----- /etc files ------------------------------------------------

    fn create_etc_directory(&self) -> anyhow::Result<()> {
        let dir = self.mountpoint().join("etc");
        self.messenger
            .info(&format!("Creating directory \"{}\"...", dir.display()));
        DirBuilder::new()
            .mode(0o755)
            .create(&dir)
            .with_context(|| format!("unable to create \"{}\"", dir.display()))?;
        Ok(())
    }

    fn create_etc_hostname(&self) -> anyhow::Result<()> {
        let filename = self.mountpoint().join("etc/hostname");
        self.messenger
            .info(&format!("Writing file \"{}\"...", filename.display()));
        fs::write(&filename, format!("{}\n", self.config.hostname))
            .with_context(|| format!("unable to write \"{}\"", filename.display()))?;
        Ok(())
    }

    /// Only the nameserver lines of the source resolv.conf are carried
    /// over, with trailing whitespace stripped.
    fn create_etc_resolv_conf(&self) -> anyhow::Result<()> {
        let filename = self.mountpoint().join("etc/resolv.conf");
        let source = &self.config.etc_resolv_conf_source;
        self.messenger.info(&format!(
            "Writing file \"{}\" (based on file \"{}\")...",
            filename.display(),
            source.display()
        ));
        let input = fs::read_to_string(source)
            .with_context(|| format!("unable to read \"{}\"", source.display()))?;
        let mut output = String::new();
        for line in input.lines() {
            let line = line.trim_end();
            if line.starts_with("nameserver") {
                output.push_str(line);
                output.push('\n');
            }
        }
        fs::write(&filename, output)
            .with_context(|| format!("unable to write \"{}\"", filename.display()))?;
        Ok(())
    }

    fn create_etc_fstab(&self) -> anyhow::Result<()> {
        let filename = self.mountpoint().join("etc/fstab");
        self.messenger
            .info(&format!("Writing file \"{}\"...", filename.display()));
        fs::write(
            &filename,
            format!(
                "/dev/disk/by-uuid/{} / auto defaults 0 1\n",
                self.first_partition_uuid()
            ),
        )
        .with_context(|| format!("unable to write \"{}\"", filename.display()))?;
        Ok(())
    }

    // ----- bootstrap leftovers and password --------------------------

    fn unmount_directory_bootstrap_leftovers(&self) -> anyhow::Result<()> {
        let mounts = MountFinder::load()?;
        let leftovers: Vec<PathBuf> = mounts
            .below(self.mountpoint())
            .map(Path::to_path_buf)
            .collect();
        let mut first_failure = Ok(());
        for mount_point in leftovers.iter().rev() {
            if let Err(e) = self.try_unmounting(mount_point) {
                self.messenger
                    .error(&format!("Unable to unmount \"{}\": {e:#}", mount_point.display()));
                if first_failure.is_ok() {
                    first_failure = Err(e);
                }
            }
        }
        first_failure
    }

    fn set_root_password_inside_chroot(&self) -> anyhow::Result<()> {
        let Some(password) = &self.root_password else {
            return Ok(());
        };

        self.messenger.info("Setting root password...");
        self.executor.run(
            &Cmd::new(COMMAND_CHROOT)
                .arg(self.mountpoint())
                .arg("chpasswd")
                .env(self.make_environment(false))
                .stdin_bytes(format!("root:{password}").into_bytes()),
        )?;
        Ok(())
    }

    // ----- bootloader ------------------------------------------------

    fn install_bootloader_grub2(&self) -> anyhow::Result<()> {
        let target = &self.config.target_path;
        let real_target = fs::canonicalize(target)
            .with_context(|| format!("unable to resolve \"{}\"", target.display()))?;

        let use_chroot = self.bootloader_approach.uses_chroot();
        let use_device_map = self.bootloader_approach.uses_device_map();

        let device_map = self.mountpoint().join("boot/grub/device.map");
        if use_device_map {
            // written just so grub-install can be pointed at "(hd0)"
            self.messenger.info(&format!(
                "Writing device map to \"{}\" (mapping \"{}\" to \"{}\")...",
                device_map.display(),
                GRUB_DRIVE,
                real_target.display()
            ));
            fs::write(&device_map, format!("{GRUB_DRIVE}\t{}\n", real_target.display()))
                .with_context(|| format!("unable to write \"{}\"", device_map.display()))?;
        }

        self.messenger.info(&self.bootloader_install_message(&real_target));

        let mut cmd = if use_chroot {
            Cmd::new(COMMAND_CHROOT)
                .arg(self.mountpoint())
                .arg(self.distro.chroot_command_grub2_install())
                .env(self.make_environment(false))
        } else {
            let grub2_install = self
                .grub2_install_command
                .as_deref()
                .expect("grub2-install has not been resolved");
            Cmd::new(grub2_install)
                .arg("--boot-directory")
                .arg(self.mountpoint().join("boot"))
        };
        if self.config.bootloader_force {
            cmd = cmd.arg("--force");
        }
        cmd = if use_device_map {
            cmd.arg(GRUB_DRIVE)
        } else {
            cmd.arg(target)
        };
        self.executor.run(&cmd)?;

        if use_device_map {
            fs::remove_file(&device_map)
                .with_context(|| format!("unable to remove \"{}\"", device_map.display()))?;
        }
        Ok(())
    }

    fn bootloader_install_message(&self, real_target: &Path) -> String {
        let mut hints = Vec::new();
        if real_target != self.config.target_path {
            hints.push(format!("actually \"{}\"", real_target.display()));
        }
        hints.push(format!("approach \"{}\"", self.bootloader_approach));
        format!(
            "Installing bootloader to device \"{}\" ({})...",
            self.config.target_path.display(),
            hints.join(", ")
        )
    }

    fn fix_grub_cfg_root_device(&self) -> anyhow::Result<()> {
        self.messenger.info("Post-processing GRUB config...");
        self.executor.run(
            &Cmd::new(COMMAND_SED)
                .arg(format!(
                    "s,root=[^ ]\\+,root=UUID={},g",
                    self.first_partition_uuid()
                ))
                .arg("-i")
                .arg(self.mountpoint().join("boot/grub/grub.cfg")),
        )?;
        Ok(())
    }

    // ----- non-disk chroot mounts ------------------------------------

    fn mount_nondisk_chroot_mounts(&mut self) -> anyhow::Result<()> {
        self.messenger.info("Mounting non-disk file systems...");
        for (source, options, target) in NON_DISK_MOUNT_TASKS {
            let abs_target = self.mountpoint().join(target);
            self.executor.run(
                &Cmd::new(COMMAND_MOUNT)
                    .arg(source)
                    .args(*options)
                    .arg(&abs_target),
            )?;
            self.nondisk_mounts.push(abs_target);
        }
        Ok(())
    }

    /// Unmounts whatever actually got mounted, in reverse order. Keeps
    /// going past failures and reports the first one.
    fn unmount_nondisk_chroot_mounts(&mut self) -> anyhow::Result<()> {
        self.messenger.info("Unmounting non-disk file systems...");
        let mut first_failure = Ok(());
        while let Some(mount_point) = self.nondisk_mounts.pop() {
            if let Err(e) = self.try_unmounting(&mount_point) {
                self.messenger
                    .error(&format!("Unable to unmount \"{}\": {e:#}", mount_point.display()));
                if first_failure.is_ok() {
                    first_failure = Err(e);
                }
            }
        }
        first_failure
    }

    fn try_unmounting(&self, path: &Path) -> anyhow::Result<()> {
        let cmd = Cmd::new(COMMAND_UMOUNT).arg(path);
        with_settling_retries(&*self.sleep, || self.executor.run(&cmd))?;
        Ok(())
    }

    // ----- scripts ---------------------------------------------------

    fn make_environment(&self, tell_mountpoint: bool) -> CommandEnv {
        const OVERRIDDEN: &[&str] = &[
            "LANG",
            "LANGUAGE",
            "HOSTNAME",
            "IB_HOSTNAME",
            "LC_ALL",
            "IB_ROOT",
            "MNTPOINT",
        ];
        let mut environment: CommandEnv = env::vars()
            .filter(|(key, _)| !OVERRIDDEN.contains(&key.as_str()))
            .collect();
        environment.push(("HOSTNAME".to_string(), self.config.hostname.clone()));
        environment.push(("IB_HOSTNAME".to_string(), self.config.hostname.clone()));
        environment.push(("LC_ALL".to_string(), "C".to_string()));
        if tell_mountpoint {
            let mountpoint = self.mountpoint().display().to_string();
            environment.push(("IB_ROOT".to_string(), mountpoint.clone()));
            environment.push(("MNTPOINT".to_string(), mountpoint));
        }
        environment
    }

    fn run_scripts_from(&self, dir: &Path, environment: &CommandEnv) -> anyhow::Result<()> {
        for script in scripts::eligible_scripts(dir)? {
            self.executor
                .run(&Cmd::new(&script).env(environment.clone()))?;
        }
        Ok(())
    }

    fn run_pre_scripts(&self) -> anyhow::Result<()> {
        let Some(dir) = &self.config.scripts_dir_pre else {
            return Ok(());
        };
        self.messenger.info("Running pre-chroot scripts...");
        self.run_scripts_from(dir, &self.make_environment(true))
    }

    fn run_post_scripts(&self) -> anyhow::Result<()> {
        let Some(dir) = &self.config.scripts_dir_post else {
            return Ok(());
        };
        self.messenger.info("Running post-chroot scripts...");
        self.run_scripts_from(dir, &self.make_environment(true))
    }

    fn chroot_scripts_dir(&self) -> &Path {
        self.config
            .scripts_dir_chroot
            .as_deref()
            .expect("chroot scripts directory is not configured")
    }

    fn copy_chroot_scripts(&self) -> anyhow::Result<()> {
        self.messenger.info("Copying chroot scripts into chroot...");
        let target_parent = self.mountpoint().join(CHROOT_SCRIPT_TARGET_DIR);
        self.executor.run(&Cmd::new(COMMAND_MKDIR).arg(&target_parent))?;
        for script in scripts::eligible_scripts(self.chroot_scripts_dir())? {
            let basename = script.file_name().expect("script path has no file name");
            let target = target_parent.join(basename);
            self.executor.run(&Cmd::new(COMMAND_CP).arg(&script).arg(&target))?;
            self.executor.run(&Cmd::new(COMMAND_CHMOD).arg("a+x").arg(&target))?;
        }
        Ok(())
    }

    fn run_chroot_scripts(&self) -> anyhow::Result<()> {
        self.messenger.info("Running chroot scripts...");
        let environment = self.make_environment(false);
        for script in scripts::eligible_scripts(self.chroot_scripts_dir())? {
            let basename = script.file_name().expect("script path has no file name");
            let in_chroot = Path::new("/").join(CHROOT_SCRIPT_TARGET_DIR).join(basename);
            self.executor.run(
                &Cmd::new(COMMAND_CHROOT)
                    .arg(self.mountpoint())
                    .arg(&in_chroot)
                    .env(environment.clone()),
            )?;
        }
        Ok(())
    }

    fn remove_chroot_scripts(&self) -> anyhow::Result<()> {
        self.messenger.info("Removing chroot scripts...");
        let target_parent = self.mountpoint().join(CHROOT_SCRIPT_TARGET_DIR);
        for script in scripts::eligible_scripts(self.chroot_scripts_dir())? {
            let basename = script.file_name().expect("script path has no file name");
            self.executor
                .run(&Cmd::new(COMMAND_RM).arg(target_parent.join(basename)))?;
        }
        self.executor.run(&Cmd::new(COMMAND_RMDIR).arg(&target_parent))?;
        Ok(())
    }

    // ----- state accessors -------------------------------------------

    fn mountpoint(&self) -> &Path {
        self.mountpoint
            .as_deref()
            .expect("mountpoint has not been created")
    }

    fn first_partition_device(&self) -> &Path {
        self.first_partition_device
            .as_deref()
            .expect("partition devices have not been activated")
    }

    fn first_partition_uuid(&self) -> &str {
        self.first_partition_uuid
            .as_deref()
            .expect("first partition UUID has not been resolved")
    }
}
