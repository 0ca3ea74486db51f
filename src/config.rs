use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::anyhow;
use uuid::Uuid;

use crate::error::Error;

/// Where grub2-install runs (host or chroot) crossed with what it is
/// pointed at (the device path or a device-map drive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum BootloaderApproach {
    /// Let the distribution driver decide.
    Auto,
    ChrootGrub2Device,
    ChrootGrub2Drive,
    HostGrub2Device,
    HostGrub2Drive,
    /// Skip bootloader installation entirely.
    None,
}

impl BootloaderApproach {
    pub fn uses_chroot(self) -> bool {
        matches!(self, Self::ChrootGrub2Device | Self::ChrootGrub2Drive)
    }

    pub fn uses_host_grub2_install(self) -> bool {
        matches!(self, Self::HostGrub2Device | Self::HostGrub2Drive)
    }

    pub fn uses_device_map(self) -> bool {
        matches!(self, Self::ChrootGrub2Drive | Self::HostGrub2Drive)
    }
}

/// Four-byte MBR disk identifier, written little-endian at offset 440.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskId(u32);

impl DiskId {
    pub fn bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl FromStr for DiskId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if hex.len() != 8 {
            return Err(anyhow!(
                "disk identifier must be four bytes of hex, e.g. 0x2448b5d1"
            ));
        }
        let value = u32::from_str_radix(hex, 16)
            .map_err(|_| anyhow!("disk identifier must be four bytes of hex, e.g. 0x2448b5d1"))?;
        Ok(DiskId(value))
    }
}

impl fmt::Display for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Accepts only the canonical 8-4-4-4-12 hyphenated form; the braced,
/// URN and bare-hex spellings the uuid crate would otherwise take are
/// rejected by the length check.
pub fn require_valid_uuid(s: &str) -> Result<(), Error> {
    if s.len() == 36 && Uuid::try_parse(s).is_ok() {
        Ok(())
    } else {
        Err(Error::InvalidUuid(s.to_string()))
    }
}

/// Immutable run parameters, fully resolved before the engine starts.
#[derive(Debug)]
pub struct BootstrapConfig {
    pub hostname: String,
    pub architecture: String,
    pub root_password: Option<String>,
    pub root_password_file: Option<PathBuf>,
    pub etc_resolv_conf_source: PathBuf,
    pub disk_id: Option<DiskId>,
    pub first_partition_uuid: Option<String>,
    pub scripts_dir_pre: Option<PathBuf>,
    pub scripts_dir_chroot: Option<PathBuf>,
    pub scripts_dir_post: Option<PathBuf>,
    pub target_path: PathBuf,
    pub grub2_install_command: Option<String>,
    pub bootloader_approach: BootloaderApproach,
    pub bootloader_force: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disk_id_parses_prefixed_hex() {
        let id: DiskId = "0xdeadbeef".parse().unwrap();
        assert_eq!(id.bytes(), [0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(id.to_string(), "0xdeadbeef");
    }

    #[test]
    fn test_disk_id_parses_bare_hex() {
        let id: DiskId = "2448B5D1".parse().unwrap();
        assert_eq!(id.to_string(), "0x2448b5d1");
    }

    #[test]
    fn test_disk_id_rejects_wrong_width() {
        assert!("0x123".parse::<DiskId>().is_err());
        assert!("0x123456789".parse::<DiskId>().is_err());
        assert!("xyzxyzxy".parse::<DiskId>().is_err());
    }

    #[test]
    fn test_uuid_accepts_canonical_form() {
        require_valid_uuid("11111111-2222-3333-4444-555555555555").unwrap();
        require_valid_uuid("2e9a8428-a707-4cf4-9c80-54d5d3089b57").unwrap();
    }

    #[test]
    fn test_uuid_rejects_everything_else() {
        for bad in [
            "",
            "garbage",
            "2e9a8428a7074cf49c8054d5d3089b57",
            "{2e9a8428-a707-4cf4-9c80-54d5d3089b57}",
            "2e9a8428-a707-4cf4-9c80-54d5d3089b5x",
        ] {
            assert!(
                matches!(require_valid_uuid(bad), Err(Error::InvalidUuid(_))),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_bootloader_approach_matrix() {
        use BootloaderApproach::*;
        assert!(ChrootGrub2Device.uses_chroot() && !ChrootGrub2Device.uses_device_map());
        assert!(ChrootGrub2Drive.uses_chroot() && ChrootGrub2Drive.uses_device_map());
        assert!(!HostGrub2Device.uses_chroot() && !HostGrub2Device.uses_device_map());
        assert!(!HostGrub2Drive.uses_chroot() && HostGrub2Drive.uses_device_map());
        assert!(HostGrub2Device.uses_host_grub2_install());
        assert!(!ChrootGrub2Drive.uses_host_grub2_install());
        assert_eq!(ChrootGrub2Drive.to_string(), "chroot-grub2-drive");
        assert_eq!(BootloaderApproach::None.to_string(), "none");
    }
}
