use std::{
    ffi::OsStr,
    path::Path,
    process::Command,
};

/// Privilege-sensitive mount operations. Kept behind a trait so tests can
/// substitute a recording fake instead of touching the real kernel mount
/// table.
pub trait MountDriver {
    fn mount(&self, source: &str, target: &Path, fstype: &str, options: &str)
        -> Result<(), DriverError>;
    fn unmount(&self, target: &Path) -> Result<(), DriverError>;
    fn remount(&self, target: &Path, fstype: &str, options: &str) -> Result<(), DriverError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("mount operation requires elevated privileges")]
    PermissionDenied,
    #[error("mount helper exited with code {exit_code:?}: {stderr}")]
    Other { exit_code: Option<i32>, stderr: String },
}

/// Exit code convention used by the non-interactive sudo wrapper this driver
/// shells out through: 1 means the privilege escalation itself was refused,
/// as opposed to the mount primitive failing for some other reason.
const SUDO_PERMISSION_DENIED_EXIT_CODE: i32 = 1;

/// Real [`MountDriver`] that invokes `mount`/`umount` as subprocesses.
///
/// We shell out rather than call `libc::mount` directly (as `nix::mount`
/// would let us do for simple bind mounts) because aufs takes its entire
/// branch stack as a single `-o` option string that can be arbitrarily long
/// and whose syntax (`br:...`, `remount,mod:...`) is aufs-specific; the
/// `mount(8)` CLI already knows how to marshal that correctly for the
/// `mount(2)` syscall.
pub struct ProcessMountDriver {
    sudo: bool,
}

impl ProcessMountDriver {
    /// Creates a driver that invokes `mount`/`umount` directly.
    pub fn new() -> Self {
        Self { sudo: false }
    }

    /// Creates a driver that invokes `mount`/`umount` through `sudo -n`,
    /// matching the non-interactive-sudo convention the permission-denied
    /// exit code check below assumes.
    pub fn with_sudo() -> Self {
        Self { sudo: true }
    }

    fn command(&self, program: &str) -> Command {
        if self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(program);
            cmd
        } else {
            Command::new(program)
        }
    }

    fn run(&self, mut cmd: Command) -> Result<(), DriverError> {
        let output = cmd
            .output()
            .map_err(|err| DriverError::Other {
                exit_code: None,
                stderr: err.to_string(),
            })?;
        if output.status.success() {
            return Ok(());
        }
        if output.status.code() == Some(SUDO_PERMISSION_DENIED_EXIT_CODE) && self.sudo {
            return Err(DriverError::PermissionDenied);
        }
        Err(DriverError::Other {
            exit_code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl Default for ProcessMountDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MountDriver for ProcessMountDriver {
    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        options: &str,
    ) -> Result<(), DriverError> {
        tracing::debug!(source, target = %target.display(), fstype, options, "mount");
        let mut cmd = self.command("mount");
        cmd.arg("-t")
            .arg(fstype)
            .arg(source)
            .arg(target.as_os_str())
            .arg("-o")
            .arg(options);
        self.run(cmd)
    }

    fn unmount(&self, target: &Path) -> Result<(), DriverError> {
        tracing::debug!(target = %target.display(), "unmount");
        let mut cmd = self.command("umount");
        cmd.arg(target.as_os_str() as &OsStr);
        self.run(cmd)
    }

    fn remount(&self, target: &Path, fstype: &str, options: &str) -> Result<(), DriverError> {
        tracing::debug!(target = %target.display(), fstype, options, "remount");
        let mut cmd = self.command("mount");
        cmd.arg("-t")
            .arg(fstype)
            .arg("none")
            .arg(target.as_os_str())
            .arg("-o")
            .arg(format!("remount,{options}"));
        self.run(cmd)
    }
}

/// A single recorded invocation, used by [`RecordingMountDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Mount {
        source: String,
        target: std::path::PathBuf,
        fstype: String,
        options: String,
    },
    Unmount {
        target: std::path::PathBuf,
    },
    Remount {
        target: std::path::PathBuf,
        fstype: String,
        options: String,
    },
}

/// In-memory [`MountDriver`] fake that just records what it was asked to do.
/// Used in tests so the orchestrator's logic can be exercised without
/// touching the real kernel.
#[derive(Default)]
pub struct RecordingMountDriver {
    pub calls: std::sync::Mutex<Vec<DriverCall>>,
}

impl RecordingMountDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MountDriver for RecordingMountDriver {
    fn mount(
        &self,
        source: &str,
        target: &Path,
        fstype: &str,
        options: &str,
    ) -> Result<(), DriverError> {
        self.calls.lock().unwrap().push(DriverCall::Mount {
            source: source.to_string(),
            target: target.to_path_buf(),
            fstype: fstype.to_string(),
            options: options.to_string(),
        });
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<(), DriverError> {
        self.calls.lock().unwrap().push(DriverCall::Unmount {
            target: target.to_path_buf(),
        });
        Ok(())
    }

    fn remount(&self, target: &Path, fstype: &str, options: &str) -> Result<(), DriverError> {
        self.calls.lock().unwrap().push(DriverCall::Remount {
            target: target.to_path_buf(),
            fstype: fstype.to_string(),
            options: options.to_string(),
        });
        Ok(())
    }
}
