//! Rotating log files for task output

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread;

use log::{debug, warn};

use crate::errors::{DriverError, Result};

/// Writes a stream into `<dir>/<base>.<n>`, starting a new file once the
/// current one reaches `max_size` bytes and keeping at most `max_files`.
#[derive(Debug)]
pub struct FileRotator {
    dir: PathBuf,
    base: String,
    max_files: u32,
    max_size: u64,
    index: u32,
    written: u64,
    file: File,
}

impl FileRotator {
    /// Open the rotator, resuming at the highest existing index
    pub fn new(dir: impl AsRef<Path>, base: impl Into<String>, max_files: u32, max_size: u64) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let base = base.into();
        if max_files == 0 || max_size == 0 {
            return Err(DriverError::InvalidConfig(format!(
                "log rotation for {} needs at least one file of at least one byte",
                base
            )));
        }

        let index = existing_indexes(&dir, &base)?.into_iter().max().unwrap_or(0);
        let path = dir.join(format!("{}.{}", base, index));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let written = file.metadata()?.len();

        let rotator = Self {
            dir,
            base,
            max_files,
            max_size,
            index,
            written,
            file,
        };
        rotator.purge();
        Ok(rotator)
    }

    /// Index of the file currently written to
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn current_path(&self) -> PathBuf {
        self.path_for(self.index)
    }

    fn path_for(&self, index: u32) -> PathBuf {
        self.dir.join(format!("{}.{}", self.base, index))
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.index += 1;
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.path_for(self.index))?;
        self.written = 0;
        debug!("Rotated log to {}", self.current_path().display());
        self.purge();
        Ok(())
    }

    fn purge(&self) {
        let Ok(indexes) = existing_indexes(&self.dir, &self.base) else {
            return;
        };
        let keep_from = (self.index + 1).saturating_sub(self.max_files);
        for index in indexes.into_iter().filter(|i| *i < keep_from) {
            if let Err(e) = fs::remove_file(self.path_for(index)) {
                warn!("Failed to purge old log {}: {}", self.path_for(index).display(), e);
            }
        }
    }
}

impl Write for FileRotator {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.written >= self.max_size {
            self.rotate()?;
        }
        let room = usize::try_from(self.max_size - self.written).unwrap_or(usize::MAX);
        let n = self.file.write(&buf[..buf.len().min(room)])?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Copy `reader` into `rotator` on a dedicated thread until EOF
pub fn spawn_log_copier<R>(mut reader: R, mut rotator: FileRotator) -> Result<thread::JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    let name = format!("log-{}", rotator.base);
    let handle = thread::Builder::new().name(name).spawn(move || {
        if let Err(e) = io::copy(&mut reader, &mut rotator) {
            warn!("Log copier for {} stopped: {}", rotator.base, e);
        }
        let _ = rotator.flush();
    })?;
    Ok(handle)
}

fn existing_indexes(dir: &Path, base: &str) -> Result<Vec<u32>> {
    let prefix = format!("{}.", base);
    let mut indexes = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Some(index) = name.strip_prefix(&prefix).and_then(|s| s.parse::<u32>().ok()) {
            indexes.push(index);
        }
    }
    Ok(indexes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn read(dir: &Path, name: &str) -> String {
        fs::read_to_string(dir.join(name)).unwrap()
    }

    #[test]
    fn test_writes_to_first_file() {
        let tmp = tempdir().unwrap();
        let mut rotator = FileRotator::new(tmp.path(), "web.stdout", 3, 1024).unwrap();
        rotator.write_all(b"hello\n").unwrap();
        assert_eq!(read(tmp.path(), "web.stdout.0"), "hello\n");
        assert_eq!(rotator.index(), 0);
    }

    #[test]
    fn test_rotates_at_size_limit() {
        let tmp = tempdir().unwrap();
        let mut rotator = FileRotator::new(tmp.path(), "web.stdout", 5, 4).unwrap();
        rotator.write_all(b"abcdefghij").unwrap();

        assert_eq!(read(tmp.path(), "web.stdout.0"), "abcd");
        assert_eq!(read(tmp.path(), "web.stdout.1"), "efgh");
        assert_eq!(read(tmp.path(), "web.stdout.2"), "ij");
        assert_eq!(rotator.current_path(), tmp.path().join("web.stdout.2"));
    }

    #[test]
    fn test_purges_files_beyond_max() {
        let tmp = tempdir().unwrap();
        let mut rotator = FileRotator::new(tmp.path(), "web.stderr", 2, 2).unwrap();
        rotator.write_all(b"aabbccdd").unwrap();

        assert!(!tmp.path().join("web.stderr.0").exists());
        assert!(!tmp.path().join("web.stderr.1").exists());
        assert_eq!(read(tmp.path(), "web.stderr.2"), "cc");
        assert_eq!(read(tmp.path(), "web.stderr.3"), "dd");
    }

    #[test]
    fn test_resumes_at_highest_index() {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("web.stdout.0"), "old").unwrap();
        fs::write(tmp.path().join("web.stdout.4"), "xy").unwrap();
        fs::write(tmp.path().join("web.stdout.notes"), "ignored").unwrap();

        let mut rotator = FileRotator::new(tmp.path(), "web.stdout", 10, 4).unwrap();
        assert_eq!(rotator.index(), 4);
        rotator.write_all(b"zzz").unwrap();

        assert_eq!(read(tmp.path(), "web.stdout.4"), "xyzz");
        assert_eq!(read(tmp.path(), "web.stdout.5"), "z");
    }

    #[test]
    fn test_rejects_empty_policy() {
        let tmp = tempdir().unwrap();
        assert!(FileRotator::new(tmp.path(), "web.stdout", 0, 10).is_err());
        assert!(FileRotator::new(tmp.path(), "web.stdout", 1, 0).is_err());
    }

    #[test]
    fn test_log_copier_drains_reader() {
        let tmp = tempdir().unwrap();
        let rotator = FileRotator::new(tmp.path(), "job.stdout", 2, 1024).unwrap();
        let handle = spawn_log_copier(io::Cursor::new(b"line one\nline two\n".to_vec()), rotator).unwrap();
        handle.join().unwrap();
        assert_eq!(read(tmp.path(), "job.stdout.0"), "line one\nline two\n");
    }
}
