#[cfg(windows)]
use std::process::{Command, Stdio};

/// Answers whether the current process holds administrative rights.
pub trait PrivilegeProbe: Send + Sync {
    fn is_elevated(&self) -> bool;
}

/// Asks the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPrivileges;

impl PrivilegeProbe for SystemPrivileges {
    #[cfg(unix)]
    fn is_elevated(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    // `net session` only succeeds from an elevated token.
    #[cfg(windows)]
    fn is_elevated(&self) -> bool {
        Command::new("net")
            .arg("session")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    #[cfg(not(any(unix, windows)))]
    fn is_elevated(&self) -> bool {
        false
    }
}

/// A probe with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct FixedPrivileges(pub bool);

impl PrivilegeProbe for FixedPrivileges {
    fn is_elevated(&self) -> bool {
        self.0
    }
}
