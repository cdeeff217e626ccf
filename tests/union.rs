use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use tempfile::TempDir;
use unionfs::config::{BranchSpec, MountConfig};
use unionfs::lock::LockSubclass;
use unionfs::permission::Cred;
use unionfs::whiteout::WH_OPQ;
use unionfs::{
    materialize_ancestors, pin_acquire, resolve_write_dir, BranchPerm, PinFlags, UnionError,
    UnionFs, WrDirFlags,
};

struct Layers {
    dirs: Vec<TempDir>,
    fs: UnionFs,
}

impl Layers {
    fn root(&self, bindex: usize) -> &Path {
        self.dirs[bindex].path()
    }
}

fn layers(perms: &[BranchPerm]) -> Layers {
    let dirs: Vec<TempDir> = perms.iter().map(|_| tempfile::tempdir().unwrap()).collect();
    let fs = UnionFs::with_branches(
        dirs.iter()
            .zip(perms)
            .map(|(d, p)| BranchSpec::new(d.path(), *p))
            .collect(),
    )
    .unwrap();
    Layers { dirs, fs }
}

fn rw_over_ro() -> Layers {
    layers(&[BranchPerm::Rw, BranchPerm::Ro])
}

fn cred() -> Cred {
    Cred::current()
}

fn names(l: &Layers, path: &str) -> Vec<String> {
    let mut names: Vec<_> = l
        .fs
        .readdir(path)
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    names
}

fn range(l: &Layers, path: &str) -> (usize, usize) {
    let d = l.fs.lookup(path).unwrap();
    let info = d.info.read();
    (info.btop, info.bbot)
}

#[test]
fn simple_create_lands_in_the_top_branch() {
    let l = rw_over_ro();
    let d = l.fs.create("/foo", 0o644, &cred()).unwrap();
    {
        let info = d.info.read();
        assert_eq!((info.btop, info.bbot), (0, 0));
    }
    assert!(l.root(0).join("foo").is_file());
    assert!(!l.root(1).join("foo").exists());
    assert_eq!(names(&l, "/"), vec!["foo"]);
}

#[test]
fn create_under_a_lower_directory_copies_the_parent_up() {
    let l = rw_over_ro();
    fs::create_dir(l.root(1).join("dir")).unwrap();
    assert_eq!(range(&l, "/dir"), (1, 1));

    l.fs.create("/dir/file", 0o644, &cred()).unwrap();
    assert!(l.root(0).join("dir").is_dir());
    assert!(l.root(0).join("dir/file").is_file());
    assert_eq!(range(&l, "/dir/file"), (0, 0));
    assert_eq!(range(&l, "/dir"), (0, 1));
}

#[test]
fn writing_a_lower_file_copies_up_its_ancestors() {
    let l = rw_over_ro();
    fs::create_dir_all(l.root(1).join("dir")).unwrap();
    fs::write(l.root(1).join("dir/file"), b"lower").unwrap();
    assert_eq!(range(&l, "/dir/file"), (1, 1));

    l.fs.write("/dir/file", 5, b"+upper").unwrap();
    assert_eq!(fs::read(l.root(0).join("dir/file")).unwrap(), b"lower+upper");
    assert_eq!(fs::read(l.root(1).join("dir/file")).unwrap(), b"lower");
    assert_eq!(range(&l, "/dir/file").0, 0);
}

#[test]
fn materialize_ancestors_is_idempotent() {
    let l = rw_over_ro();
    fs::create_dir_all(l.root(1).join("a/b")).unwrap();

    let si = l.fs.si();
    let c = l.fs.lookup_at(&si, "/a/b/c").unwrap();
    materialize_ancestors(l.fs.hi_locks(), &si, &c, 0).unwrap();
    assert!(l.root(0).join("a/b").is_dir());
    materialize_ancestors(l.fs.hi_locks(), &si, &c, 0).unwrap();

    let b = c.parent().unwrap();
    let info = b.info.read();
    assert_eq!((info.btop, info.bbot), (0, 1));
}

#[test]
fn copy_up_only_moves_the_top_upward() {
    let l = layers(&[BranchPerm::Rw, BranchPerm::Ro, BranchPerm::Ro]);
    fs::write(l.root(2).join("f"), b"x").unwrap();
    let (btop, _) = range(&l, "/f");
    assert_eq!(btop, 2);

    l.fs.write("/f", 1, b"y").unwrap();
    let d = l.fs.lookup("/f").unwrap();
    let info = d.info.read();
    assert!(info.btop <= btop);
    assert!(info.h(info.btop).is_some());
    assert!(info.h(info.bbot).is_some());
    assert_eq!((info.btop, info.bbot), (0, 2));
}

#[test]
fn create_on_a_read_only_union_is_erofs() {
    let l = layers(&[BranchPerm::Ro]);
    let err = l.fs.create("/nope", 0o644, &cred()).unwrap_err();
    assert!(matches!(err, UnionError::ReadOnly(_)), "{:?}", err);
    assert_eq!(err.errno(), libc::EROFS);
}

#[test]
fn removed_real_parent_makes_the_next_pin_stale() {
    let l = layers(&[BranchPerm::Rw]);
    l.fs.mkdir("/d", 0o755, &cred()).unwrap();

    {
        let si = l.fs.si();
        let f = l.fs.lookup_at(&si, "/d/f").unwrap();
        let pin = pin_acquire(
            l.fs.hi_locks(),
            &si,
            &f,
            0,
            LockSubclass::IParent,
            PinFlags::write(),
        )
        .unwrap();
        assert!(pin.is_locked());
        drop(pin);

        fs::remove_dir(l.root(0).join("d")).unwrap();
        let err = pin_acquire(
            l.fs.hi_locks(),
            &si,
            &f,
            0,
            LockSubclass::IParent,
            PinFlags::write(),
        )
        .unwrap_err();
        assert!(err.is_stale(), "{:?}", err);
    }

    let err = l.fs.create("/d/f", 0o644, &cred()).unwrap_err();
    assert_eq!(err.errno(), libc::ESTALE);
    // the stale linkage was dropped; the next call sees the real state
    let err = l.fs.create("/d/f", 0o644, &cred()).unwrap_err();
    assert!(matches!(err, UnionError::NotFound(_)), "{:?}", err);
}

#[test]
fn unlinking_a_lower_file_leaves_a_whiteout() {
    let l = rw_over_ro();
    fs::write(l.root(1).join("f"), b"lower").unwrap();

    l.fs.unlink("/f").unwrap();
    assert!(l.root(0).join(".wh.f").exists());
    assert!(l.root(1).join("f").exists());
    assert!(!l.fs.lookup("/f").unwrap().info.read().is_positive());
    assert!(names(&l, "/").is_empty());

    l.fs.create("/f", 0o644, &cred()).unwrap();
    assert!(!l.root(0).join(".wh.f").exists());
    assert_eq!(l.fs.read("/f", 0, 64).unwrap(), b"");
}

#[test]
fn unlinking_an_upper_only_file_needs_no_whiteout() {
    let l = rw_over_ro();
    l.fs.create("/f", 0o644, &cred()).unwrap();
    l.fs.unlink("/f").unwrap();
    assert!(!l.root(0).join("f").exists());
    assert!(!l.root(0).join(".wh.f").exists());
}

#[test]
fn mkdir_over_a_whiteout_is_opaque() {
    let l = rw_over_ro();
    fs::create_dir(l.root(1).join("d")).unwrap();

    l.fs.rmdir("/d").unwrap();
    assert!(l.root(0).join(".wh.d").exists());
    assert!(names(&l, "/").is_empty());

    fs::write(l.root(1).join("d/late"), b"hidden").unwrap();
    l.fs.mkdir("/d", 0o755, &cred()).unwrap();
    assert!(l.root(0).join("d").join(WH_OPQ).exists());
    assert!(!l.root(0).join(".wh.d").exists());
    assert!(names(&l, "/d").is_empty());
}

#[test]
fn rmdir_refuses_a_logically_non_empty_directory() {
    let l = rw_over_ro();
    fs::create_dir(l.root(0).join("d")).unwrap();
    fs::create_dir(l.root(1).join("d")).unwrap();
    fs::write(l.root(1).join("d/x"), b"").unwrap();

    let err = l.fs.rmdir("/d").unwrap_err();
    assert_eq!(err.errno(), libc::ENOTEMPTY);

    l.fs.unlink("/d/x").unwrap();
    l.fs.rmdir("/d").unwrap();
    assert!(!l.root(0).join("d").exists());
    assert!(l.root(0).join(".wh.d").exists());
}

#[test]
fn rename_copies_a_lower_file_up() {
    let l = rw_over_ro();
    fs::write(l.root(1).join("a"), b"content").unwrap();

    l.fs.rename("/a", "/b").unwrap();
    assert_eq!(fs::read(l.root(0).join("b")).unwrap(), b"content");
    assert!(l.root(0).join(".wh.a").exists());
    assert_eq!(names(&l, "/"), vec!["b"]);
}

#[test]
fn rename_of_a_spanning_directory_is_exdev() {
    let l = rw_over_ro();
    fs::create_dir(l.root(1).join("d")).unwrap();
    let err = l.fs.rename("/d", "/e").unwrap_err();
    assert_eq!(err.errno(), libc::EXDEV);
}

#[test]
fn rename_moves_an_upper_directory_with_its_children() {
    let l = rw_over_ro();
    l.fs.mkdir("/x", 0o755, &cred()).unwrap();
    l.fs.create("/x/f", 0o644, &cred()).unwrap();

    l.fs.rename("/x", "/y").unwrap();
    assert_eq!(names(&l, "/y"), vec!["f"]);
    assert!(!l.fs.lookup("/x").unwrap().info.read().is_positive());
    assert!(matches!(l.fs.rename("/y", "/y/z"), Err(UnionError::Invalid(_))));
}

#[test]
fn rename_type_mismatches() {
    let l = layers(&[BranchPerm::Rw]);
    l.fs.mkdir("/d", 0o755, &cred()).unwrap();
    l.fs.create("/f", 0o644, &cred()).unwrap();
    assert_eq!(l.fs.rename("/f", "/d").unwrap_err().errno(), libc::EISDIR);
    assert_eq!(l.fs.rename("/d", "/f").unwrap_err().errno(), libc::ENOTDIR);
}

#[test]
fn link_copies_the_source_up_first() {
    let l = rw_over_ro();
    fs::write(l.root(1).join("f"), b"data").unwrap();

    l.fs.link("/f", "/g").unwrap();
    let f = fs::metadata(l.root(0).join("f")).unwrap();
    let g = fs::metadata(l.root(0).join("g")).unwrap();
    assert_eq!(f.ino(), g.ino());
    assert_eq!(l.fs.read("/g", 0, 16).unwrap(), b"data");
}

#[test]
fn nolink_branches_get_a_copy() {
    let l = layers(&[BranchPerm::RwNoLink]);
    l.fs.create("/f", 0o644, &cred()).unwrap();
    l.fs.write("/f", 0, b"x").unwrap();

    l.fs.link("/f", "/g").unwrap();
    let f = fs::metadata(l.root(0).join("f")).unwrap();
    let g = fs::metadata(l.root(0).join("g")).unwrap();
    assert_ne!(f.ino(), g.ino());
    assert_eq!(fs::read(l.root(0).join("g")).unwrap(), b"x");
}

#[test]
fn symlinks_and_fifos() {
    let l = layers(&[BranchPerm::Rw]);
    l.fs.symlink("/ln", Path::new("target"), &cred()).unwrap();
    assert_eq!(l.fs.readlink("/ln").unwrap(), Path::new("target"));

    l.fs.mknod("/fifo", libc::S_IFIFO | 0o600, 0, &cred()).unwrap();
    let meta = fs::symlink_metadata(l.root(0).join("fifo")).unwrap();
    assert_eq!(meta.mode() & libc::S_IFMT, libc::S_IFIFO);
}

#[test]
fn whiteout_names_cannot_be_created() {
    let l = layers(&[BranchPerm::Rw]);
    let err = l.fs.create("/.wh.x", 0o644, &cred()).unwrap_err();
    assert_eq!(err.errno(), libc::EPERM);
    let long = format!("/{}", "n".repeat(252));
    let err = l.fs.create(&long, 0o644, &cred()).unwrap_err();
    assert_eq!(err.errno(), libc::ENAMETOOLONG);
}

#[test]
fn tmpfile_materializes_its_directory() {
    let l = rw_over_ro();
    fs::create_dir(l.root(1).join("d")).unwrap();
    // O_TMPFILE support depends on the filesystem under the branch
    match l.fs.tmpfile("/d", 0o600) {
        Ok(_) => {}
        Err(e) => assert!(
            [libc::EOPNOTSUPP, libc::EISDIR, libc::EINVAL].contains(&e.errno()),
            "{:?}",
            e
        ),
    }
    assert!(l.root(0).join("d").is_dir());
}

#[test]
fn unlink_through_the_work_queue() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = MountConfig::new("/unused", vec![BranchSpec::new(dir.path(), BranchPerm::Rw)]);
    config.force_wkq_unlink = true;
    let fs = UnionFs::new(&config).unwrap();

    fs.create("/f", 0o644, &cred()).unwrap();
    fs.unlink("/f").unwrap();
    assert!(!dir.path().join("f").exists());
}

#[test]
fn branch_changes_invalidate_cached_linkage() {
    let l = layers(&[BranchPerm::Rw]);
    let extra = tempfile::tempdir().unwrap();
    fs::write(extra.path().join("extra"), b"!").unwrap();

    assert!(!l.fs.lookup("/extra").unwrap().info.read().is_positive());
    let gen = l.fs.generation();

    l.fs.add_branch(1, extra.path(), BranchPerm::Rw).unwrap();
    assert_eq!(l.fs.generation(), gen + 1);
    assert_eq!(names(&l, "/"), vec!["extra"]);
    assert_eq!(range(&l, "/extra"), (1, 1));

    let branch = Arc::clone(l.fs.si().table.get(1).unwrap());
    let lease = branch.want_write().unwrap();
    let err = l.fs.del_branch(extra.path()).unwrap_err();
    assert_eq!(err.errno(), libc::EBUSY);
    let err = l.fs.set_branch_perm(extra.path(), BranchPerm::Ro).unwrap_err();
    assert_eq!(err.errno(), libc::EBUSY);
    drop(lease);

    l.fs.del_branch(extra.path()).unwrap();
    assert_eq!(l.fs.generation(), gen + 2);
    assert!(!l.fs.lookup("/extra").unwrap().info.read().is_positive());
    assert!(names(&l, "/").is_empty());
}

#[test]
fn read_only_perm_change_redirects_writes() {
    let l = layers(&[BranchPerm::Rw, BranchPerm::Rw]);
    fs::write(l.root(1).join("f"), b"1").unwrap();
    l.fs.write("/f", 0, b"2").unwrap();
    assert_eq!(fs::read(l.root(1).join("f")).unwrap(), b"2");

    l.fs.set_branch_perm(l.root(1), BranchPerm::Ro).unwrap();
    l.fs.write("/f", 0, b"3").unwrap();
    assert_eq!(fs::read(l.root(0).join("f")).unwrap(), b"3");
    assert_eq!(fs::read(l.root(1).join("f")).unwrap(), b"2");
}

#[test]
#[should_panic(expected = "is read-only")]
fn forcing_a_read_only_write_branch_aborts() {
    let l = rw_over_ro();
    let si = l.fs.si();
    let d = l.fs.lookup_at(&si, "/x").unwrap();
    let flags = WrDirFlags {
        add_entry: true,
        force_btgt: Some(1),
        ..Default::default()
    };
    let _ = resolve_write_dir(l.fs.hi_locks(), &si, l.fs.wbr(), &d, None, flags);
}

#[test]
fn create_through_ancestors_with_gaps() {
    let l = layers(&[BranchPerm::Ro, BranchPerm::Rw, BranchPerm::Ro]);
    fs::create_dir(l.root(0).join("p")).unwrap();
    fs::create_dir_all(l.root(2).join("p/q")).unwrap();
    assert_eq!(range(&l, "/p"), (0, 2));
    assert_eq!(range(&l, "/p/q"), (2, 2));

    l.fs.create("/p/q/r", 0o644, &cred()).unwrap();
    assert!(l.root(1).join("p/q/r").is_file());
    assert!(!l.root(0).join("p/q").exists());
    assert_eq!(range(&l, "/p/q/r"), (1, 1));
    assert_eq!(range(&l, "/p/q"), (1, 2));
    assert!(l.fs.lookup("/p").unwrap().info.read().h(1).is_some());
}

#[test]
fn opposite_renames_do_not_deadlock() {
    let l = layers(&[BranchPerm::Rw]);
    l.fs.mkdir("/a", 0o755, &cred()).unwrap();
    l.fs.mkdir("/b", 0o755, &cred()).unwrap();
    l.fs.create("/a/x", 0o644, &cred()).unwrap();
    l.fs.create("/b/y", 0o644, &cred()).unwrap();

    let Layers { dirs, fs: union } = l;
    let union = Arc::new(union);
    let workers: Vec<_> = [("/a/x", "/b/x"), ("/b/y", "/a/y")]
        .into_iter()
        .map(|(from, to)| {
            let union = Arc::clone(&union);
            thread::spawn(move || {
                for _ in 0..200 {
                    union.rename(from, to).unwrap();
                    union.rename(to, from).unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    assert!(dirs[0].path().join("a/x").is_file());
    assert!(dirs[0].path().join("b/y").is_file());
}
