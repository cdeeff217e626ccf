use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::sys::stat::{mknod as nix_mknod, Mode, SFlag};
use nix::unistd::geteuid;

use crate::dentry::RealEntry;
use crate::error::{Result, UnionError};
use crate::permission::Cred;
use crate::pin::{Pin, PinPair};
use crate::wkq::Wkq;

fn settle(path: PathBuf) -> Result<RealEntry> {
    RealEntry::probe(path.clone())?
        .ok_or_else(|| UnionError::Stale(format!("{} vanished after creation", path.display())))
}

/// Hand a new object to the requesting user when running privileged.
fn own(path: &Path, cred: &Cred) -> Result<()> {
    if geteuid().is_root() && !cred.is_root() {
        std::os::unix::fs::lchown(path, Some(cred.uid), Some(cred.gid))?;
    }
    Ok(())
}

pub fn create(pin: &Pin, mode: u32, cred: &Cred) -> Result<RealEntry> {
    let path = pin.h_path();
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode & 0o7777)
        .open(&path)?;
    own(&path, cred)?;
    settle(path)
}

pub fn mkdir(pin: &Pin, mode: u32, cred: &Cred) -> Result<RealEntry> {
    let path = pin.h_path();
    mkdir_at(&path, mode)?;
    own(&path, cred)?;
    settle(path)
}

/// `mkdir` with an explicit mode; the umask would otherwise narrow it.
pub(crate) fn mkdir_at(path: &Path, mode: u32) -> Result<()> {
    fs::create_dir(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

pub fn symlink(pin: &Pin, target: &Path, cred: &Cred) -> Result<RealEntry> {
    let path = pin.h_path();
    std::os::unix::fs::symlink(target, &path)?;
    own(&path, cred)?;
    settle(path)
}

pub fn mknod(pin: &Pin, mode: u32, rdev: u64, cred: &Cred) -> Result<RealEntry> {
    let path = pin.h_path();
    mknod_at(&path, mode, rdev)?;
    own(&path, cred)?;
    settle(path)
}

pub(crate) fn mknod_at(path: &Path, mode: u32, rdev: u64) -> Result<()> {
    let kind = SFlag::from_bits_truncate(mode & libc::S_IFMT);
    let perm = Mode::from_bits_truncate(mode & 0o7777);
    nix_mknod(path, kind, perm, rdev as libc::dev_t)?;
    Ok(())
}

/// Remove a non-directory. Unlinks on branches that need it run on the work
/// queue, away from the caller's locks.
pub fn unlink(pin: &Pin, wkq: &Wkq, force_wkq: bool) -> Result<()> {
    let path = pin.h_path();
    if pin.branch().nfs || force_wkq {
        log::debug!("deferring unlink of {}", path.display());
        wkq.run_with_retry(move || fs::remove_file(&path).map_err(UnionError::from))
    } else {
        fs::remove_file(&path)?;
        Ok(())
    }
}

pub fn rmdir(pin: &Pin) -> Result<()> {
    fs::remove_dir(pin.h_path())?;
    Ok(())
}

/// Hard-link `src` to the destination of `pair`.
pub fn link(pair: &PinPair) -> Result<RealEntry> {
    let dst = pair.dst_path();
    fs::hard_link(pair.src_path(), &dst)?;
    settle(dst)
}

pub fn rename(pair: &PinPair) -> Result<RealEntry> {
    let dst = pair.dst_path();
    fs::rename(pair.src_path(), &dst)?;
    settle(dst)
}

/// Open an unnamed regular file in the pinned directory.
pub fn tmpfile(pin: &Pin, mode: u32) -> Result<File> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .mode(mode & 0o7777)
        .custom_flags(libc::O_TMPFILE)
        .open(pin.h_dir_path())?;
    Ok(file)
}

pub fn read_at(h: &RealEntry, buf: &mut [u8], offset: u64) -> Result<usize> {
    let file = File::open(&h.path)?;
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(done)
}

pub fn write_at(h: &RealEntry, data: &[u8], offset: u64) -> Result<usize> {
    let file = OpenOptions::new().write(true).open(&h.path)?;
    file.write_all_at(data, offset)?;
    Ok(data.len())
}

pub fn truncate(h: &RealEntry, size: u64) -> Result<()> {
    OpenOptions::new().write(true).open(&h.path)?.set_len(size)?;
    Ok(())
}
