//! All-or-nothing file writes.
//!
//! Content is written to a tempfile in the destination directory and then renamed over the
//! target, so a reader sees either the previous file or the complete new one.

use snafu::{ResultExt, Snafu};
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

#[derive(Debug, Snafu)]
pub(crate) enum Error {
    #[snafu(display("'{}' has no parent directory", path.display()))]
    NoParent { path: PathBuf },

    #[snafu(display("Failed to create directory '{}': {}", dir.display(), source))]
    Mkdir {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to create tempfile in '{}': {}", dir.display(), source))]
    CreateTempfile {
        dir: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to write contents for '{}': {}", path.display(), source))]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to set permissions for '{}': {}", path.display(), source))]
    SetPermissions {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to move tempfile into place at '{}': {}", path.display(), source))]
    Persist {
        path: PathBuf,
        source: tempfile::PersistError,
    },

    #[snafu(display("Failed to read '{}': {}", path.display(), source))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Failed to remove '{}': {}", path.display(), source))]
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub(crate) type Result<T> = std::result::Result<T, Error>;

/// Atomically replaces `path` with `contents`, creating parent directories as needed.
pub(crate) fn write_atomic<P, C>(path: P, contents: C, mode: u32) -> Result<()>
where
    P: AsRef<Path>,
    C: AsRef<[u8]>,
{
    let path = path.as_ref();
    let dir = path.parent().ok_or_else(|| Error::NoParent {
        path: path.to_path_buf(),
    })?;
    fs::create_dir_all(dir).context(MkdirSnafu { dir })?;

    let mut tempfile = NamedTempFile::new_in(dir).context(CreateTempfileSnafu { dir })?;
    tempfile
        .write_all(contents.as_ref())
        .context(WriteSnafu { path })?;
    tempfile
        .as_file()
        .set_permissions(fs::Permissions::from_mode(mode))
        .context(SetPermissionsSnafu { path })?;

    trace!("Moving tempfile into place at '{}'", path.display());
    tempfile.persist(path).context(PersistSnafu { path })?;
    Ok(())
}

/// Appends each of `lines` that `path` doesn't already contain. The file is rewritten as a whole
/// so the append is all-or-nothing; an existing file keeps its permissions. Returns whether the
/// file changed.
pub(crate) fn append_missing_lines<P, S>(path: P, lines: &[S], mode: u32) -> Result<bool>
where
    P: AsRef<Path>,
    S: AsRef<str>,
{
    let path = path.as_ref();
    let (mut contents, mode) = match fs::read_to_string(path) {
        Ok(contents) => {
            let mode = fs::metadata(path)
                .map(|m| m.permissions().mode() & 0o7777)
                .unwrap_or(mode);
            (contents, mode)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => (String::new(), mode),
        Err(e) => return Err(e).context(ReadSnafu { path }),
    };

    let missing: Vec<&str> = lines
        .iter()
        .map(AsRef::as_ref)
        .filter(|line| !contents.lines().any(|existing| existing == *line))
        .collect();
    if missing.is_empty() {
        debug!("'{}' already has every line, leaving it alone", path.display());
        return Ok(false);
    }

    if !contents.is_empty() && !contents.ends_with('\n') {
        contents.push('\n');
    }
    for line in missing {
        contents.push_str(line);
        contents.push('\n');
    }
    write_atomic(path, contents, mode)?;
    Ok(true)
}

/// Removes `path` if it exists. Returns whether anything was removed.
pub(crate) fn remove_if_exists<P>(path: P) -> Result<bool>
where
    P: AsRef<Path>,
{
    let path = path.as_ref();
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).context(RemoveSnafu { path }),
    }
}
