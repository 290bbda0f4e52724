//! Incremental reading of one append-only source file.
//!
//! The tailer keeps the byte offset up to which the source has been consumed, and on
//! every poll reads the complete lines written after it. The file is opened for the
//! duration of a single poll only.

use std::fmt;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, warn};

use crate::error::TailError;

/// A byte position in the source file.
pub type Offset = u64;

/// Stable key of one source file for checkpointing: the node name and the absolute
/// path of the file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceIdentity(String);

impl SourceIdentity {
    pub fn new(nodename: &str, path: &Path) -> std::io::Result<Self> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        Ok(SourceIdentity(format!("{}-{}", nodename, absolute.display())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for SourceIdentity {
    fn from(value: String) -> Self {
        SourceIdentity(value)
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One complete line, without its terminator, and the offset just past the terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TailedLine {
    pub bytes: Vec<u8>,
    pub end_offset: Offset,
}

impl TailedLine {
    pub fn is_blank(&self) -> bool {
        self.bytes.iter().all(u8::is_ascii_whitespace)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum TailPoll {
    /// The source file does not exist (yet).
    Unavailable,
    /// The complete lines available since the current offset, in file order.
    Lines {
        lines: Vec<TailedLine>,
        rotated: bool,
    },
}

pub struct FileTailer {
    identity: SourceIdentity,
    path: PathBuf,
    offset: Offset,
    /// Maximum number of lines returned by one poll, 0 for no limit.
    max_lines: usize,
    /// Identifier of the file observed on the previous poll, where the platform has one.
    file_id: Option<u64>,
}

impl FileTailer {
    pub fn new(identity: SourceIdentity, path: impl Into<PathBuf>, offset: Offset) -> Self {
        Self {
            identity,
            path: path.into(),
            offset,
            max_lines: 0,
            file_id: None,
        }
    }

    pub fn with_max_lines(mut self, max_lines: usize) -> Self {
        self.max_lines = max_lines;
        self
    }

    pub fn identity(&self) -> &SourceIdentity {
        &self.identity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }

    /// Moves the read position forward once lines up to `offset` have been consumed.
    pub fn advance(&mut self, offset: Offset) {
        self.offset = offset;
    }

    /// Reads the complete lines written since the current offset.
    ///
    /// Polling does not move the offset past the returned lines, that is up to the caller
    /// through [`FileTailer::advance`]. It only resets the offset to 0 when the file looks
    /// rotated: it is shorter than the offset, or it is a different file than on the previous
    /// poll. A shorter file can also mean it was truncated in place, the two cases can't be
    /// told apart.
    pub async fn poll_lines(&mut self) -> Result<TailPoll, TailError> {
        // Size and identity come from the handle that is read, not from the path
        let mut file = match fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(TailPoll::Unavailable),
            Err(e) => return Err(self.io_error(e)),
        };
        let metadata = file.metadata().await.map_err(|e| self.io_error(e))?;

        let length = metadata.len();
        let replaced = self.observe_file_id(&metadata);
        let rotated = length < self.offset || replaced;
        if rotated {
            warn!(
                source = %self.identity,
                previous_offset = self.offset,
                current_size = length,
                "source appears to have been rotated, setting offset to 0"
            );
            metrics::counter!("json_source_rotations_total").increment(1);
            self.offset = 0;
        }

        file.seek(SeekFrom::Start(self.offset))
            .await
            .map_err(|e| self.io_error(e))?;

        let mut reader = BufReader::new(file);
        let mut lines = Vec::new();
        let mut position = self.offset;
        let mut buffer = Vec::new();

        while self.max_lines == 0 || lines.len() < self.max_lines {
            buffer.clear();
            let read = reader
                .read_until(b'\n', &mut buffer)
                .await
                .map_err(|e| self.io_error(e))?;

            // A line without terminator is still being written, leave it for the next poll
            if read == 0 || buffer.last() != Some(&b'\n') {
                break;
            }

            position += read as u64;
            buffer.pop();
            if buffer.last() == Some(&b'\r') {
                buffer.pop();
            }
            lines.push(TailedLine {
                bytes: buffer.clone(),
                end_offset: position,
            });
        }

        debug!(
            source = %self.identity,
            offset = self.offset,
            lines = lines.len(),
            "polled source"
        );

        Ok(TailPoll::Lines { lines, rotated })
    }

    fn observe_file_id(&mut self, metadata: &std::fs::Metadata) -> bool {
        let current = file_id(metadata);
        let replaced = matches!((self.file_id, current), (Some(previous), Some(current)) if previous != current);
        self.file_id = current;
        replaced
    }

    fn io_error(&self, error: std::io::Error) -> TailError {
        TailError::Io {
            path: self.path.display().to_string(),
            error,
        }
    }
}

#[cfg(unix)]
fn file_id(metadata: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn file_id(_metadata: &std::fs::Metadata) -> Option<u64> {
    None
}
