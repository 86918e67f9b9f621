//! Daemon process file handling

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::{Error, Result};

/// Mode a process file must carry
pub const PID_FILE_MODE: u32 = 0o600;

/// Check if a process with the given pid is alive
pub fn is_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let pids = [Pid::from_u32(pid)];
    sys.refresh_processes(ProcessesToUpdate::Some(&pids), true);
    sys.process(Pid::from_u32(pid)).is_some()
}

/// Read the pid recorded in a process file
pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse().ok())
}

/// Verify an existing process file is a regular file with mode 0600.
/// A missing file passes.
pub fn check_pid_file(path: &Path) -> Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };

    if !meta.is_file() {
        return Err(Error::PermissionDenied(format!(
            "{} exists but is not a regular file",
            path.display()
        )));
    }

    let mode = meta.permissions().mode() & 0o777;
    if mode != PID_FILE_MODE {
        return Err(Error::PermissionDenied(format!(
            "{} has permissions {:o}, requires {:o}",
            path.display(),
            mode,
            PID_FILE_MODE
        )));
    }

    Ok(())
}

/// Record `pid` in a process file, owner read/write only
pub fn write_pid(path: &Path, pid: u32) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(PID_FILE_MODE)
        .open(path)?;
    writeln!(file, "{}", pid)?;
    Ok(())
}

/// Remove a process file, ignoring a missing one
pub fn remove_pid(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
