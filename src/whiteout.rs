use std::fs;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::error::{Result, UnionError};

/// `.wh.<name>` in a branch hides `<name>` in every lower branch.
pub const WH_PREFIX: &str = ".wh.";
/// Marks a directory opaque: its lower copies are hidden.
pub const WH_OPQ: &str = ".wh..wh..opq";
/// Longest name a whiteout can still be made for.
pub const MAX_NAMELEN: usize = 255 - WH_PREFIX.len();

pub fn wh_name(name: &str) -> String {
    format!("{}{}", WH_PREFIX, name)
}

pub fn is_wh_name(name: &str) -> bool {
    name.starts_with(WH_PREFIX)
}

/// Reject names the union cannot represent.
pub fn check_name(name: &str) -> Result<()> {
    if name.len() > MAX_NAMELEN {
        return Err(UnionError::NameTooLong(name.to_string()));
    }
    if is_wh_name(name) {
        return Err(UnionError::NotPermitted(format!(
            "'{}' uses the reserved whiteout prefix",
            name
        )));
    }
    Ok(())
}

pub fn is_whiteouted(dir: &Path, name: &str) -> bool {
    fs::symlink_metadata(dir.join(wh_name(name))).is_ok()
}

pub fn is_opaque(dir: &Path) -> bool {
    fs::symlink_metadata(dir.join(WH_OPQ)).is_ok()
}

fn touch(path: &Path) -> io::Result<()> {
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o444)
        .open(path)
    {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// Place a whiteout for `name` in `dir`. The caller holds `dir` locked.
pub fn create_wh(dir: &Path, name: &str) -> Result<()> {
    log::debug!("whiteout {:?}/{}", dir, name);
    touch(&dir.join(wh_name(name)))?;
    Ok(())
}

/// Remove the whiteout for `name` in `dir`, if there is one.
pub fn remove_wh(dir: &Path, name: &str) -> Result<bool> {
    match fs::remove_file(dir.join(wh_name(name))) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub fn make_opaque(dir: &Path) -> Result<()> {
    touch(&dir.join(WH_OPQ))?;
    Ok(())
}

/// Delete every whiteout and the opaque marker in `dir`, leaving real entries.
pub fn clear_whiteouts(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if is_wh_name(&name.to_string_lossy()) {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
