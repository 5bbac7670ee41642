//! Shedding elevated privileges.
//!
//! On Linux a single capability is removed from the effective and permitted
//! sets. Elsewhere the only lever is the user id. Either way a setuid-root
//! binary run by an ordinary user switches its effective uid back down.

use std::io;

use log::info;
use rustix::process::{geteuid, getuid};

use super::error::PrivilegeError;

/// Capabilities the server cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Needed to chroot into a jail.
    SysChroot,
    /// Needed to link template files owned by someone else.
    Fowner,
}

impl Capability {
    pub fn name(self) -> &'static str {
        match self {
            Self::SysChroot => "CAP_SYS_CHROOT",
            Self::Fowner => "CAP_FOWNER",
        }
    }
}

/// Settings for pretending to be unprivileged while running as root.
///
/// Only honoured in debug builds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugIdentity {
    pub simulate_non_root: bool,
    /// Uid to switch to; defaults to `nobody`.
    pub uid: Option<u32>,
}

/// Removes privileges from the calling thread.
pub trait PrivilegeController: Send + Sync {
    /// Clear `capability` so it can never be regained, then give up any
    /// setuid-root identity.
    fn drop_privileges(&self, capability: Capability) -> Result<(), PrivilegeError>;
}

/// Controller for the current platform.
pub fn platform_controller(debug: DebugIdentity) -> Box<dyn PrivilegeController> {
    #[cfg(target_os = "linux")]
    {
        Box::new(LinuxCapabilities::new(debug))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(UidController::new(debug))
    }
}

/// Capability-based controller.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone, Copy)]
pub struct LinuxCapabilities {
    #[cfg_attr(not(debug_assertions), allow(dead_code))]
    debug: DebugIdentity,
}

#[cfg(target_os = "linux")]
impl LinuxCapabilities {
    pub fn new(debug: DebugIdentity) -> Self {
        Self { debug }
    }

    fn flag(capability: Capability) -> rustix::thread::CapabilitySet {
        use rustix::thread::CapabilitySet;
        match capability {
            Capability::SysChroot => CapabilitySet::SYS_CHROOT,
            Capability::Fowner => CapabilitySet::FOWNER,
        }
    }
}

#[cfg(target_os = "linux")]
impl PrivilegeController for LinuxCapabilities {
    fn drop_privileges(&self, capability: Capability) -> Result<(), PrivilegeError> {
        use rustix::thread::{capabilities, set_capabilities};

        let flag = Self::flag(capability);
        let mut sets = capabilities(None).map_err(|e| PrivilegeError::Query(e.into()))?;
        sets.effective.remove(flag);
        sets.permitted.remove(flag);
        set_capabilities(None, sets).map_err(|e| PrivilegeError::Apply(e.into()))?;

        let now = capabilities(None).map_err(|e| PrivilegeError::Query(e.into()))?;
        if now.effective.contains(flag) || now.permitted.contains(flag) {
            return Err(PrivilegeError::StillHeld(capability.name()));
        }
        info!(
            "Dropped {}; effective {:?}, permitted {:?}",
            capability.name(),
            now.effective,
            now.permitted
        );

        leave_setuid_root()?;
        #[cfg(debug_assertions)]
        simulate_non_root(self.debug, capability)?;
        Ok(())
    }
}

/// Uid-only controller for platforms without capabilities.
#[cfg(not(target_os = "linux"))]
#[derive(Debug, Clone, Copy)]
pub struct UidController {
    debug: DebugIdentity,
}

#[cfg(not(target_os = "linux"))]
impl UidController {
    pub fn new(debug: DebugIdentity) -> Self {
        Self { debug }
    }
}

#[cfg(not(target_os = "linux"))]
impl PrivilegeController for UidController {
    fn drop_privileges(&self, capability: Capability) -> Result<(), PrivilegeError> {
        leave_setuid_root()?;
        #[cfg(debug_assertions)]
        simulate_non_root(self.debug, capability)?;
        #[cfg(not(debug_assertions))]
        let _ = (self.debug, capability);
        Ok(())
    }
}

/// Switch to the real uid when running setuid-root.
fn leave_setuid_root() -> Result<(), PrivilegeError> {
    let real = getuid();
    if geteuid().is_root() && !real.is_root() {
        set_uid(real.as_raw())?;
        info!("Switched effective uid to {}", real.as_raw());
    }
    Ok(())
}

/// Become an ordinary user while really running as root, to exercise the
/// unprivileged code paths. The owner-override capability is left alone.
#[cfg(debug_assertions)]
fn simulate_non_root(debug: DebugIdentity, capability: Capability) -> Result<(), PrivilegeError> {
    if !debug.simulate_non_root || capability == Capability::Fowner {
        return Ok(());
    }
    if !(getuid().is_root() && geteuid().is_root()) {
        return Ok(());
    }
    let uid = debug.uid.unwrap_or_else(nobody_uid);
    set_uid(uid)?;
    log::warn!("Running as uid {} to simulate an unprivileged server", uid);
    Ok(())
}

#[cfg(debug_assertions)]
fn nobody_uid() -> u32 {
    const FALLBACK: u32 = 65534;
    // SAFETY: getpwnam is given a NUL-terminated literal; the returned entry
    // is read immediately, before any other passwd lookup.
    unsafe {
        let entry = libc::getpwnam(c"nobody".as_ptr());
        if entry.is_null() {
            FALLBACK
        } else {
            (*entry).pw_uid
        }
    }
}

fn set_uid(uid: u32) -> Result<(), PrivilegeError> {
    // SAFETY: setuid has no memory-safety preconditions.
    if unsafe { libc::setuid(uid as libc::uid_t) } != 0 {
        return Err(PrivilegeError::SetUid {
            uid,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_names() {
        assert_eq!(Capability::SysChroot.name(), "CAP_SYS_CHROOT");
        assert_eq!(Capability::Fowner.name(), "CAP_FOWNER");
    }

    #[test]
    fn test_debug_identity_disabled_by_default() {
        let debug = DebugIdentity::default();
        assert!(!debug.simulate_non_root);
        assert_eq!(debug.uid, None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_dropped_capability_cannot_be_regained() {
        use rustix::thread::{CapabilitySet, capabilities, set_capabilities};

        // Capabilities are per thread; keep the change off the test harness.
        std::thread::spawn(|| {
            let controller = platform_controller(DebugIdentity::default());
            controller
                .drop_privileges(Capability::SysChroot)
                .expect("dropping a capability succeeds with or without it");

            let mut sets = capabilities(None).unwrap();
            assert!(!sets.effective.contains(CapabilitySet::SYS_CHROOT));
            assert!(!sets.permitted.contains(CapabilitySet::SYS_CHROOT));

            sets.permitted.insert(CapabilitySet::SYS_CHROOT);
            sets.effective.insert(CapabilitySet::SYS_CHROOT);
            assert!(set_capabilities(None, sets).is_err());
        })
        .join()
        .unwrap();
    }
}
