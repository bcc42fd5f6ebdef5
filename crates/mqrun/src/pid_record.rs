use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;

use crate::file_lock::FileLock;

/// What a PID record file contained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedPid {
    Pid(u32),
    /// Body that is not a decimal process id.
    Corrupt(String),
}

/// `<cache>/pid-<port>`: decimal pid of the last process launched for a port.
#[derive(Debug, Clone)]
pub struct PidRecord {
    path: PathBuf,
}

impl PidRecord {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    pub fn write(&self, pid: u32) -> anyhow::Result<()> {
        let tmp = self.path.with_extension("tmp");
        let res = (|| -> std::io::Result<()> {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(pid.to_string().as_bytes())?;
            f.sync_all()?;
            fs::rename(&tmp, &self.path)
        })();
        if res.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        res.with_context(|| format!("write pid record {}", self.path.display()))
    }

    pub fn read(&self) -> anyhow::Result<Option<RecordedPid>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("read pid record {}", self.path.display()));
            }
        };
        Ok(Some(match raw.trim().parse::<u32>() {
            Ok(pid) => RecordedPid::Pid(pid),
            Err(_) => RecordedPid::Corrupt(raw),
        }))
    }

    /// Returns whether a record was there to remove.
    pub fn remove(&self) -> anyhow::Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("remove pid record {}", self.path.display()))
            }
        }
    }

    /// Blocks until no other supervisor holds the record for this port.
    pub fn lock(&self) -> anyhow::Result<FileLock> {
        FileLock::acquire(&self.lock_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor_support::temp_dir_for;

    fn record_in(test_name: &str) -> (PathBuf, PidRecord) {
        let dir = temp_dir_for(test_name);
        fs::create_dir_all(&dir).unwrap();
        let record = PidRecord::new(dir.join("pid-9324"));
        (dir, record)
    }

    #[test]
    fn write_then_read_back() {
        let (dir, record) = record_in("pid-write-read");
        assert_eq!(record.read().unwrap(), None);

        record.write(4242).unwrap();
        assert_eq!(fs::read_to_string(record.path()).unwrap(), "4242");
        assert_eq!(record.read().unwrap(), Some(RecordedPid::Pid(4242)));
        assert!(!dir.join("pid-9324.tmp").exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn whitespace_is_tolerated_and_garbage_is_corrupt() {
        let (dir, record) = record_in("pid-corrupt");
        fs::write(record.path(), "  77\n").unwrap();
        assert_eq!(record.read().unwrap(), Some(RecordedPid::Pid(77)));

        fs::write(record.path(), "not-a-pid").unwrap();
        assert_eq!(
            record.read().unwrap(),
            Some(RecordedPid::Corrupt("not-a-pid".to_string()))
        );

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn remove_reports_whether_record_existed() {
        let (dir, record) = record_in("pid-remove");
        assert!(!record.remove().unwrap());
        record.write(1).unwrap();
        assert!(record.remove().unwrap());
        assert!(!record.path().exists());

        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn lock_can_be_reacquired_after_drop() {
        let (dir, record) = record_in("pid-lock");
        let guard = record.lock().unwrap();
        assert!(dir.join("pid-9324.lock").exists());
        drop(guard);
        let _again = record.lock().unwrap();

        let _ = fs::remove_dir_all(&dir);
    }
}
