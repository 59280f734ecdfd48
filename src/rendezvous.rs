//! The rendezvous PID file shared by two overlapping generations.
//!
//! The file holds the decimal PID of the generation currently serving and
//! waiting to be replaced. A missing file is the normal state before the very
//! first generation has started. No file locking is used: the signal ordering
//! of the protocol guarantees a single writer at a time.
use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    os::unix::fs::OpenOptionsExt,
    path::{Path, PathBuf},
};

use crate::{constants::RENDEZVOUS_FILE_MODE, error::RendezvousError};

/// Handle on the rendezvous PID file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendezvous {
    path: PathBuf,
}

impl Rendezvous {
    /// Creates a handle for the file at `path`. Nothing is touched on disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the PID file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the PID stored in the file, or `None` if the file does not exist.
    pub fn read(&self) -> Result<Option<i32>, RendezvousError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(self.io_error(source)),
        };

        let trimmed = contents.trim();
        trimmed
            .parse::<i32>()
            .ok()
            .filter(|pid| *pid > 0)
            .map(Some)
            .ok_or_else(|| RendezvousError::InvalidPid(trimmed.to_string()))
    }

    /// Replaces the file content with `pid`.
    pub fn write(&self, pid: i32) -> Result<(), RendezvousError> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(RENDEZVOUS_FILE_MODE)
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        file.write_all(pid.to_string().as_bytes())
            .map_err(|source| self.io_error(source))
    }

    /// Removes the file. Removing a file that is already gone succeeds.
    pub fn delete(&self) -> Result<(), RendezvousError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn io_error(&self, source: io::Error) -> RendezvousError {
        RendezvousError::Io {
            path: self.path.clone(),
            source,
        }
    }
}
