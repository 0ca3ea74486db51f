use crate::error::Error;

/// Detaches the process from the host's view of the mount table and
/// hostname before the pipeline starts mutating either.
pub trait Isolator {
    fn isolate(&self, hostname: &str) -> Result<(), Error>;
}

/// unshare(2) with CLONE_NEWNS | CLONE_NEWUTS, then sethostname(2)
/// inside the fresh UTS namespace.
pub struct LinuxIsolator;

#[cfg(target_os = "linux")]
impl Isolator for LinuxIsolator {
    fn isolate(&self, hostname: &str) -> Result<(), Error> {
        use nix::sched::{CloneFlags, unshare};

        unshare(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUTS)
            .map_err(Error::NamespaceSetupFailed)?;
        nix::unistd::sethostname(hostname).map_err(Error::HostnameSetFailed)?;
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl Isolator for LinuxIsolator {
    fn isolate(&self, _hostname: &str) -> Result<(), Error> {
        Err(Error::NotSupported)
    }
}
