#[derive(Debug, thiserror::Error)]
pub enum SignalError {
    #[error("no such process: {0}")]
    NoSuchProcess(u32),
    #[error("not permitted to signal process {0}")]
    PermissionDenied(u32),
    /// 0 and values past `i32::MAX` would address process groups.
    #[error("refusing to signal pid {0}")]
    InvalidPid(u32),
    #[error("signal process {pid}: {source}")]
    Os {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

/// Ask `pid` to shut down gracefully (SIGTERM).
#[cfg(unix)]
pub fn terminate(pid: u32) -> Result<(), SignalError> {
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return Err(SignalError::InvalidPid(pid)),
    };

    let rc = unsafe { libc::kill(raw, libc::SIGTERM) };
    if rc == 0 {
        return Ok(());
    }

    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ESRCH) => Err(SignalError::NoSuchProcess(pid)),
        Some(libc::EPERM) => Err(SignalError::PermissionDenied(pid)),
        _ => Err(SignalError::Os { pid, source: err }),
    }
}

/// Whether `pid` names a live process (ours or not). Signal 0 only checks.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let raw = match i32::try_from(pid) {
        Ok(raw) if raw > 0 => raw,
        _ => return false,
    };
    if unsafe { libc::kill(raw, 0) } == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(not(unix))]
pub fn terminate(pid: u32) -> Result<(), SignalError> {
    Err(SignalError::Os {
        pid,
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "signals are only supported on unix",
        ),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn rejects_group_addressing_pids() {
        assert!(matches!(terminate(0), Err(SignalError::InvalidPid(0))));
        assert!(matches!(
            terminate(u32::MAX),
            Err(SignalError::InvalidPid(u32::MAX))
        ));
    }

    #[test]
    fn terminates_a_live_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        terminate(child.id()).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn reaped_child_is_no_such_process() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(matches!(
            terminate(pid),
            Err(SignalError::NoSuchProcess(p)) if p == pid
        ));
    }

    #[test]
    fn liveness_tracks_child_lifetime() {
        assert!(!is_alive(0));
        assert!(!is_alive(u32::MAX));

        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();
        assert!(is_alive(pid));
        child.kill().unwrap();
        child.wait().unwrap();
        assert!(!is_alive(pid));
    }
}
