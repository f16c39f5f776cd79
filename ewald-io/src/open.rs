//! Contended file opening.
//!
//! The backing file is shared by the writer and by readers that may reopen it
//! at any time, so a failed open is retried for a while before giving up.

use crate::Result;
use hdf5::File;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// Default number of open attempts.
pub const DEFAULT_TRIES: usize = 100;

/// Pause between open attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// How the backing file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only; the file must exist.
    Read,
    /// Read-write; the file must exist.
    ReadWrite,
    /// Read-write, creating the file if needed.
    Append,
    /// Create, truncating any existing file.
    Create,
}

/// Opens `path`, retrying up to `tries` times with [`RETRY_INTERVAL`] between
/// attempts.
///
/// # Errors
/// Returns the last open error once every attempt has failed.
pub fn safe_open<P: AsRef<Path>>(path: P, mode: OpenMode, tries: usize) -> Result<File> {
    let path = path.as_ref();
    let tries = tries.max(1);
    let mut attempt = 1;
    loop {
        let opened = match mode {
            OpenMode::Read => File::open(path),
            OpenMode::ReadWrite => File::open_rw(path),
            OpenMode::Append => File::append(path),
            OpenMode::Create => File::create(path),
        };
        match opened {
            Ok(file) => return Ok(file),
            Err(e) if attempt < tries => {
                log::debug!(
                    "open {} ({mode:?}) failed, attempt {attempt}/{tries}: {e}",
                    path.display()
                );
                attempt += 1;
                thread::sleep(RETRY_INTERVAL);
            }
            Err(e) => return Err(e.into()),
        }
    }
}
