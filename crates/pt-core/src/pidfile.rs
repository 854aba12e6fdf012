//! Single-instance lock per privilege level
//!
//! Each privilege level runs at most one daemon. The pid file under the data
//! directory records the owner; a second launch that finds a live pid there
//! refuses to start.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Pid file location for one daemon
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Recorded pid; `None` when there is no file
    pub fn read(&self) -> io::Result<Option<u32>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        contents
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Recorded pid if that process is still running
    pub fn live_pid(&self) -> io::Result<Option<u32>> {
        Ok(self.read()?.filter(|pid| is_process_alive(*pid)))
    }

    /// Claim the file for `pid`
    ///
    /// Fails with `AlreadyExists` while another live process holds it. A
    /// stale or unreadable file is overwritten.
    pub fn acquire(self, pid: u32) -> io::Result<PidFileGuard> {
        match self.live_pid() {
            Ok(Some(owner)) if owner != pid => {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("held by running process {}", owner),
                ));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                tracing::warn!("Replacing malformed pid file {:?}", self.path);
            }
            Err(e) => return Err(e),
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, format!("{}\n", pid))?;
        Ok(PidFileGuard { file: self, pid })
    }
}

/// Held pid file; released on drop
#[derive(Debug)]
pub struct PidFileGuard {
    file: PidFile,
    pid: u32,
}

impl PidFileGuard {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for PidFileGuard {
    fn drop(&mut self) {
        // A newer daemon may have taken the file over
        match self.file.read() {
            Ok(Some(pid)) if pid == self.pid => {
                if let Err(e) = fs::remove_file(&self.file.path) {
                    tracing::warn!("Failed to remove PID file {:?}: {}", self.file.path, e);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to read PID file {:?}: {}", self.file.path, e),
        }
    }
}

/// Check if a process with the given PID is still alive
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    // EPERM: alive, owned by another user
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    result == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub fn is_process_alive(pid: u32) -> bool {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{OpenProcess, PROCESS_QUERY_LIMITED_INFORMATION};

    let handle = unsafe { OpenProcess(PROCESS_QUERY_LIMITED_INFORMATION, 0, pid) };
    if handle == 0 {
        return false;
    }
    unsafe { CloseHandle(handle) };
    true
}

/// Whether the current process runs with elevated permissions
#[cfg(unix)]
pub fn is_privileged_user() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(windows)]
pub fn is_privileged_user() -> bool {
    // Elevation is checked by the installer on Windows
    true
}
