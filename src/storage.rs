//! # Local Storage Primitives
//!
//! Append-only JSON Lines files and atomic whole-file replacement.
//!
//! Every appended record is written as one line and synced before the call
//! returns. A crash mid-write can only leave a torn final line, which
//! [`read_jsonl`] drops. Whole files are replaced by writing a temp file in
//! the same directory and renaming it over the target.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::warn;

/// Storage failures
#[derive(Debug, Error)]
pub enum StorageError {
    /// A record before the final line could not be parsed
    #[error("corrupt record at {path}:{line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Append handle for a JSON Lines file
#[derive(Debug)]
pub struct JsonlWriter {
    file: File,
    path: PathBuf,
}

impl JsonlWriter {
    /// Opens (or creates) `path` for appending, creating parent directories.
    ///
    /// A torn final line is cut off first so the next record starts on a
    /// fresh line.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;
        repair_tail(&mut file, &path)?;
        Ok(Self { file, path })
    }

    /// Serializes `record` as one line and syncs it to disk.
    pub fn append<T: Serialize>(&mut self, record: &T) -> Result<(), StorageError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        self.file.write_all(&line)?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Makes sure the file ends on a line boundary.
///
/// An unterminated tail that parses is kept and terminated, matching what
/// [`read_jsonl`] returns for it. Anything else is truncated away.
fn repair_tail(file: &mut File, path: &Path) -> Result<(), StorageError> {
    let mut contents = Vec::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_end(&mut contents)?;
    if contents.is_empty() || contents.ends_with(b"\n") {
        return Ok(());
    }

    let line_start = contents
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos + 1);
    let tail = &contents[line_start..];

    if serde_json::from_slice::<serde_json::Value>(tail).is_ok() {
        file.write_all(b"\n")?;
    } else {
        warn!(
            "Truncating {} torn bytes at end of {}",
            tail.len(),
            path.display()
        );
        file.set_len(line_start as u64)?;
    }
    file.sync_data()?;
    Ok(())
}

/// Reads every record of a JSON Lines file.
///
/// A missing file reads as empty. An unparseable final line is treated as a
/// torn write and skipped; an unparseable line anywhere else is corruption.
pub fn read_jsonl<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<Vec<T>, StorageError> {
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<std::result::Result<_, _>>()?;
    let last = lines.len();

    let mut records = Vec::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(e) if idx + 1 == last => {
                warn!("Dropping torn record at end of {}: {}", path.display(), e);
            }
            Err(e) => {
                return Err(StorageError::Corrupt {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    reason: e.to_string(),
                });
            }
        }
    }

    Ok(records)
}

/// Atomically replaces `path` with the given JSON Lines records.
pub fn rewrite_jsonl<T: Serialize, P: AsRef<Path>>(path: P, records: &[T]) -> Result<(), StorageError> {
    let mut contents = Vec::new();
    for record in records {
        serde_json::to_writer(&mut contents, record)?;
        contents.push(b'\n');
    }
    write_atomic(path, &contents)
}

/// Atomically replaces `path` with `contents`.
pub fn write_atomic<P: AsRef<Path>>(path: P, contents: &[u8]) -> Result<(), StorageError> {
    let path = path.as_ref();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| StorageError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        n: u32,
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        let rows: Vec<Row> = read_jsonl(dir.path().join("absent.jsonl")).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_append_then_read() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/rows.jsonl");
        let mut writer = JsonlWriter::open(&path).unwrap();
        writer.append(&Row { n: 1 }).unwrap();
        writer.append(&Row { n: 2 }).unwrap();

        let rows: Vec<Row> = read_jsonl(&path).unwrap();
        assert_eq!(rows, vec![Row { n: 1 }, Row { n: 2 }]);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        fs::write(&path, "{\"n\":1}\n{\"n\":2}\n{\"n\":").unwrap();

        let rows: Vec<Row> = read_jsonl(&path).unwrap();
        assert_eq!(rows, vec![Row { n: 1 }, Row { n: 2 }]);
    }

    #[test]
    fn test_append_after_torn_tail_starts_fresh_line() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        fs::write(&path, "{\"n\":1}\n{\"n\":").unwrap();

        let mut writer = JsonlWriter::open(&path).unwrap();
        writer.append(&Row { n: 2 }).unwrap();
        writer.append(&Row { n: 3 }).unwrap();

        let rows: Vec<Row> = read_jsonl(&path).unwrap();
        assert_eq!(rows, vec![Row { n: 1 }, Row { n: 2 }, Row { n: 3 }]);
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"n\":1}\n{\"n\":2}\n{\"n\":3}\n");
    }

    #[test]
    fn test_unterminated_complete_record_is_kept() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        fs::write(&path, "{\"n\":1}").unwrap();

        let mut writer = JsonlWriter::open(&path).unwrap();
        writer.append(&Row { n: 2 }).unwrap();

        let rows: Vec<Row> = read_jsonl(&path).unwrap();
        assert_eq!(rows, vec![Row { n: 1 }, Row { n: 2 }]);
    }

    #[test]
    fn test_corrupt_middle_line_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        fs::write(&path, "{\"n\":1}\ngarbage\n{\"n\":3}\n").unwrap();

        let result: Result<Vec<Row>, _> = read_jsonl(&path);
        match result {
            Err(StorageError::Corrupt { line, .. }) => assert_eq!(line, 2),
            other => panic!("Expected Corrupt error, got: {:?}", other),
        }
    }

    #[test]
    fn test_rewrite_replaces_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");
        let mut writer = JsonlWriter::open(&path).unwrap();
        for n in 0..5 {
            writer.append(&Row { n }).unwrap();
        }

        rewrite_jsonl(&path, &[Row { n: 9 }]).unwrap();
        let rows: Vec<Row> = read_jsonl(&path).unwrap();
        assert_eq!(rows, vec![Row { n: 9 }]);
    }
}
