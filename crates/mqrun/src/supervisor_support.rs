use std::path::PathBuf;

pub(crate) fn parse_u64(raw: Option<&str>) -> Option<u64> {
    raw.map(str::trim).and_then(|v| v.parse::<u64>().ok())
}

pub(crate) fn parse_u32(raw: Option<&str>) -> Option<u32> {
    raw.map(str::trim).and_then(|v| v.parse::<u32>().ok())
}

pub(crate) fn non_empty(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub(crate) fn format_error_chain(err: &anyhow::Error) -> String {
    let mut parts = Vec::<String>::new();
    for cause in err.chain() {
        let s = cause.to_string();
        if s.is_empty() {
            continue;
        }
        if parts.last() == Some(&s) {
            continue;
        }
        parts.push(s);
    }
    if parts.is_empty() {
        "unknown error".to_string()
    } else {
        parts.join(": ")
    }
}

/// Directory holding the running executable; falls back to the cwd.
pub(crate) fn executable_dir() -> PathBuf {
    let cwd = || std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let Ok(exe) = std::env::current_exe() else {
        return cwd();
    };
    let exe = std::fs::canonicalize(&exe).unwrap_or(exe);
    exe.parent().map(PathBuf::from).unwrap_or_else(cwd)
}

/// Detach the child from the supervisor's session and controlling terminal.
#[cfg(unix)]
pub(crate) fn detach_from_session() -> std::io::Result<()> {
    let rc = unsafe { libc::setsid() };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn now_unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
pub(crate) fn temp_dir_for(test_name: &str) -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};

    static COUNTER: AtomicU64 = AtomicU64::new(1);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut dir = std::env::temp_dir();
    dir.push(format!(
        "mqrun-{test_name}-{}-{n}-{}",
        std::process::id(),
        now_unix_ms()
    ));
    dir
}
