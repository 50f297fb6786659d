//! Filesystem helpers shared by the client and the daemon.

use std::fs::{self, File, Metadata};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use filetime::FileTime;
use thiserror::Error;

use crate::protocol::CHUNK_SIZE;

/// Rejection of an externally-supplied path that would land outside the
/// sync root.
#[derive(Debug, Error)]
#[error("path escapes the sync root: {path}")]
pub struct PathError {
    pub path: String,
}

/// Joins an untrusted relative path onto `root`, lexically resolving `.` and
/// `..` segments first. Absolute inputs are re-rooted; a `..` that would climb
/// above `root` is rejected. Every path that crosses the trust boundary goes
/// through here.
pub fn secure_join(root: &Path, untrusted: &str) -> Result<PathBuf, PathError> {
    let mut clean = PathBuf::new();
    for comp in Path::new(untrusted).components() {
        match comp {
            Component::Normal(part) => clean.push(part),
            Component::ParentDir => {
                if !clean.pop() {
                    return Err(PathError {
                        path: untrusted.to_string(),
                    });
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(root.join(clean))
}

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;

/// Whether a wire-carried mode word names a directory.
pub fn mode_is_dir(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

#[cfg(unix)]
pub fn file_mode(md: &Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    md.mode()
}

#[cfg(not(unix))]
pub fn file_mode(md: &Metadata) -> u32 {
    if md.is_dir() {
        0o040755
    } else {
        0o100644
    }
}

/// Modification time in whole seconds since the epoch.
pub fn mod_time(md: &Metadata) -> i64 {
    match md.modified() {
        Ok(t) => match t.duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        },
        Err(_) => 0,
    }
}

/// Streams `src` into `dst` with a fixed-size buffer, creating parent
/// directories as needed. Returns the number of bytes copied.
pub fn copy_file(src: &Path, dst: &Path) -> Result<u64> {
    let mut reader =
        File::open(src).with_context(|| format!("opening {}", src.display()))?;
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut writer =
        File::create(dst).with_context(|| format!("creating {}", dst.display()))?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok(total)
}

/// Restores mtime and permission bits after a write.
pub fn apply_attributes(path: &Path, mode: u32, mod_time: i64) -> Result<()> {
    if mod_time > 0 {
        let ft = FileTime::from_unix_time(mod_time, 0);
        filetime::set_file_mtime(path, ft)
            .with_context(|| format!("setting mtime on {}", path.display()))?;
    }
    #[cfg(unix)]
    if mode > 0 {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
            .with_context(|| format!("setting mode on {}", path.display()))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

/// Non-recursive unlink: removes a file, or a directory only when empty.
pub fn remove_entry(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(_) if path.is_dir() => fs::remove_dir(path),
        Err(err) => Err(err),
    }
}

/// Recursive removal for local targets, where extraneous directories may be
/// non-empty.
pub fn remove_tree(path: &Path) -> std::io::Result<()> {
    let md = fs::symlink_metadata(path)?;
    if md.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secure_join_plain_paths() {
        let root = Path::new("/srv/data");
        assert_eq!(
            secure_join(root, "a/b.txt").unwrap(),
            PathBuf::from("/srv/data/a/b.txt")
        );
        assert_eq!(secure_join(root, "").unwrap(), PathBuf::from("/srv/data"));
    }

    #[test]
    fn secure_join_resolves_inner_dots() {
        let root = Path::new("/srv/data");
        assert_eq!(
            secure_join(root, "a/./b/../c").unwrap(),
            PathBuf::from("/srv/data/a/c")
        );
    }

    #[test]
    fn secure_join_rejects_traversal() {
        let root = Path::new("/srv/data");
        assert!(secure_join(root, "../etc/passwd").is_err());
        assert!(secure_join(root, "a/../../etc").is_err());
    }

    #[test]
    fn secure_join_reroots_absolute_input() {
        let root = Path::new("/srv/data");
        assert_eq!(
            secure_join(root, "/etc/passwd").unwrap(),
            PathBuf::from("/srv/data/etc/passwd")
        );
    }

    #[test]
    fn secure_join_result_stays_under_root() {
        let root = Path::new("/srv/data");
        for input in ["x", "x/y/z", "./x", "x/..", "deep/../../"] {
            if let Ok(joined) = secure_join(root, input) {
                assert!(
                    joined.strip_prefix(root).is_ok(),
                    "{input:?} escaped to {joined:?}"
                );
            }
        }
    }

    #[test]
    fn mode_dir_bit() {
        assert!(mode_is_dir(0o040755));
        assert!(!mode_is_dir(0o100644));
        assert!(!mode_is_dir(0o120777));
    }

    #[test]
    fn copy_file_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("sub/dst.bin");
        fs::write(&src, b"hello fleetsync").unwrap();
        let n = copy_file(&src, &dst).unwrap();
        assert_eq!(n, 15);
        assert_eq!(fs::read(&dst).unwrap(), b"hello fleetsync");
    }

    #[test]
    fn remove_entry_leaves_non_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("keep");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("inner.txt"), b"x").unwrap();
        assert!(remove_entry(&sub).is_err());
        assert!(sub.exists());
        fs::remove_file(sub.join("inner.txt")).unwrap();
        remove_entry(&sub).unwrap();
        assert!(!sub.exists());
    }
}
