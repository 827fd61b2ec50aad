//! OS process helpers: PID and port files, liveness, signal delivery,
//! run-as identity and best-effort cleanup bookkeeping.

use crate::config::RunAsConfig;
use crate::error::ProcessError;
use std::ffi::CString;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Signals the supervisor sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
    Hangup,
    User1,
}

impl Signal {
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
            Signal::Hangup => libc::SIGHUP,
            Signal::User1 => libc::SIGUSR1,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Terminate => "SIGTERM",
            Signal::Kill => "SIGKILL",
            Signal::Hangup => "SIGHUP",
            Signal::User1 => "SIGUSR1",
        };
        f.write_str(name)
    }
}

/// Read a file holding one decimal number. A missing file is `Ok(None)`.
pub fn read_number_file(path: &Path) -> Result<Option<u32>, ProcessError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ProcessError::ReadFile {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let trimmed = content.trim();
    trimmed
        .parse::<u32>()
        .map(Some)
        .map_err(|_| ProcessError::InvalidNumber {
            path: path.to_path_buf(),
            content: trimmed.to_string(),
        })
}

/// Write a number and fsync it, so a reader never sees a partial value
pub fn write_number_file(path: &Path, value: u32) -> Result<(), ProcessError> {
    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", value)?;
        file.sync_all()
    };
    write().map_err(|source| ProcessError::WriteFile {
        path: path.to_path_buf(),
        source,
    })
}

/// True if a process with this PID exists (including one we may not signal)
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// PID named by a PID file, if that process is alive. Unreadable or stale
/// files are logged and reported as "not running".
pub fn live_pid(path: &Path) -> Option<u32> {
    match read_number_file(path) {
        Ok(Some(pid)) if is_pid_alive(pid) => Some(pid),
        Ok(Some(pid)) => {
            debug!(path = %path.display(), pid, "Stale PID file");
            None
        }
        Ok(None) => None,
        Err(e) => {
            warn!(error = %e, "Unreadable PID file");
            None
        }
    }
}

pub fn send_signal(pid: u32, signal: Signal) -> Result<(), ProcessError> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(ProcessError::NotRunning { pid });
    }
    let result = unsafe { libc::kill(pid as libc::pid_t, signal.as_raw()) };
    if result == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Err(ProcessError::NotRunning { pid });
    }
    Err(ProcessError::Signal { pid, source: err })
}

/// Signal the process named by a PID file. Returns the PID signalled, or
/// `None` when there is no PID file.
pub fn signal_pid_file(path: &Path, signal: Signal) -> Result<Option<u32>, ProcessError> {
    match read_number_file(path)? {
        Some(pid) => {
            send_signal(pid, signal)?;
            debug!(path = %path.display(), pid, %signal, "Signalled process");
            Ok(Some(pid))
        }
        None => Ok(None),
    }
}

/// One cleanup step that did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupFailure {
    pub step: String,
    pub error: String,
}

/// Collects failures from a sequence of best-effort cleanup steps.
/// Every step runs regardless of earlier failures.
#[derive(Debug, Default)]
pub struct CleanupReport {
    failures: Vec<CleanupFailure>,
}

impl CleanupReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record<E: fmt::Display>(&mut self, step: impl Into<String>, result: Result<(), E>) {
        if let Err(e) = result {
            let failure = CleanupFailure {
                step: step.into(),
                error: e.to_string(),
            };
            warn!(step = %failure.step, error = %failure.error, "Cleanup step failed");
            self.failures.push(failure);
        }
    }

    /// Remove a file; a file that is already gone is not a failure
    pub fn remove_file(&mut self, path: &Path) {
        let result = match std::fs::remove_file(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        };
        self.record(format!("remove {}", path.display()), result);
    }

    pub fn remove_dir_all(&mut self, path: &Path) {
        let result = match std::fs::remove_dir_all(path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        };
        self.record(format!("remove {}", path.display()), result);
    }

    pub fn merge(&mut self, other: CleanupReport) {
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[CleanupFailure] {
        &self.failures
    }
}

/// Resolved worker identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
}

/// Resolve the configured worker user/group. Only meaningful when the
/// daemon runs as root; otherwise workers inherit the daemon's identity.
pub fn resolve_run_as(config: &RunAsConfig) -> Result<Option<RunAs>, ProcessError> {
    let Some(user) = config.user.as_deref() else {
        return Ok(None);
    };
    if unsafe { libc::geteuid() } != 0 {
        debug!(user, "Not running as root, ignoring run_as");
        return Ok(None);
    }

    let (uid, primary_gid) = lookup_user(user)?;
    let gid = match config.group.as_deref() {
        Some(group) => lookup_group(group)?,
        None => primary_gid,
    };
    Ok(Some(RunAs { uid, gid }))
}

fn lookup_user(name: &str) -> Result<(u32, u32), ProcessError> {
    let c_name = CString::new(name).map_err(|_| ProcessError::UnknownUser(name.to_string()))?;
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    let mut buf = vec![0 as libc::c_char; 16 * 1024];

    let rc = unsafe {
        libc::getpwnam_r(
            c_name.as_ptr(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return Err(ProcessError::UnknownUser(name.to_string()));
    }
    Ok((pwd.pw_uid, pwd.pw_gid))
}

fn lookup_group(name: &str) -> Result<u32, ProcessError> {
    let c_name = CString::new(name).map_err(|_| ProcessError::UnknownGroup(name.to_string()))?;
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::group = std::ptr::null_mut();
    let mut buf = vec![0 as libc::c_char; 16 * 1024];

    let rc = unsafe {
        libc::getgrnam_r(
            c_name.as_ptr(),
            &mut grp,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() {
        return Err(ProcessError::UnknownGroup(name.to_string()));
    }
    Ok(grp.gr_gid)
}

/// Exclusive lock on the daemon's PID file, held for the process lifetime
pub struct PidLock {
    path: PathBuf,
    _file: std::fs::File,
}

impl PidLock {
    pub fn acquire(path: &Path) -> Result<Self, ProcessError> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|source| ProcessError::WriteFile {
                path: path.to_path_buf(),
                source,
            })?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Err(ProcessError::Locked(path.to_path_buf()));
            }
            return Err(ProcessError::WriteFile {
                path: path.to_path_buf(),
                source: err,
            });
        }

        let write = || -> std::io::Result<()> {
            file.set_len(0)?;
            writeln!(&file, "{}", std::process::id())?;
            file.sync_all()
        };
        write().map_err(|source| ProcessError::WriteFile {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self {
            path: path.to_path_buf(),
            _file: file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the PID file and drop the lock
    pub fn release(self) -> CleanupReport {
        let mut report = CleanupReport::new();
        report.remove_file(&self.path);
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_number_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.pid");

        assert_eq!(read_number_file(&path).unwrap(), None);
        write_number_file(&path, 4242).unwrap();
        assert_eq!(read_number_file(&path).unwrap(), Some(4242));
    }

    #[test]
    fn test_garbage_number_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.port");
        std::fs::write(&path, "not-a-port\n").unwrap();

        let err = read_number_file(&path).unwrap_err();
        assert!(matches!(err, ProcessError::InvalidNumber { .. }));
        assert_eq!(live_pid(&path), None);
    }

    #[test]
    fn test_liveness() {
        assert!(is_pid_alive(std::process::id()));
        assert!(!is_pid_alive(0));
        assert!(!is_pid_alive(u32::MAX));
    }

    #[test]
    fn test_stale_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.pid");

        // Spawn and reap a short-lived process so its PID is known dead
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        write_number_file(&path, pid).unwrap();

        assert_eq!(live_pid(&path), None);
        assert!(matches!(
            signal_pid_file(&path, Signal::Terminate),
            Err(ProcessError::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_signal_pid_file_terminates_process() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sleep.pid");

        let mut child = tokio::process::Command::new("sleep")
            .arg("60")
            .spawn()
            .unwrap();
        write_number_file(&path, child.id().unwrap()).unwrap();
        assert!(live_pid(&path).is_some());

        let pid = signal_pid_file(&path, Signal::Terminate).unwrap();
        assert_eq!(pid, child.id());

        let status = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("process should exit after SIGTERM")
            .unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_missing_pid_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = signal_pid_file(&dir.path().join("none.pid"), Signal::Terminate).unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn test_cleanup_report_continues_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.pid");
        std::fs::write(&file, "1").unwrap();
        let not_a_dir = dir.path().join("a.pid/child");

        let mut report = CleanupReport::new();
        report.record("signal", Err::<(), _>("no such process"));
        report.remove_dir_all(&not_a_dir);
        report.remove_file(&file);
        report.remove_file(&dir.path().join("already-gone"));

        assert!(!file.exists());
        assert_eq!(report.failures().len(), 2);
        assert_eq!(report.failures()[0].step, "signal");
        assert!(!report.is_clean());
    }

    #[test]
    fn test_run_as_without_user() {
        assert_eq!(resolve_run_as(&RunAsConfig::default()).unwrap(), None);
    }

    #[test]
    fn test_pid_lock_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slugway.pid");

        let lock = PidLock::acquire(&path).unwrap();
        assert_eq!(read_number_file(&path).unwrap(), Some(std::process::id()));
        assert!(matches!(
            PidLock::acquire(&path),
            Err(ProcessError::Locked(_))
        ));

        let report = lock.release();
        assert!(report.is_clean());
        assert!(!path.exists());
    }
}
