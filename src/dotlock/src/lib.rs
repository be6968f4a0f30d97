//! Dot-locking: a cross-host advisory file lock protocol.
//!
//! Safe on network filesystems because it relies only on O_EXCL creation and
//! the atomicity of link(2): the taker creates `F.xenlk`, hardlinks it to a
//! name carrying its host and uuid, and confirms ownership by inode
//! equality. Held locks persist as `F.xenlk.<host>.<uuid>.f{r|w}` files whose
//! mtime doubles as a lease heartbeat; `lock_delta` measures staleness
//! against a freshly created probe file so clock skew between hosts cancels
//! out.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

/// Lease duration; a steal sleeps this long, and holders staler than this
/// are considered dead.
pub const LEASE_TIME_SECS: u64 = 30;

const RETRY_MAX: u32 = 16;
const LOCK_POSTFIX: &str = ".xenlk";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock held by another holder")]
    HeldByOther,

    #[error("could not establish lock after {RETRY_MAX} attempts")]
    RetriesExhausted,

    #[error("no lock files present")]
    NotLocked,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LockError {
    pub fn errno(&self) -> nix::errno::Errno {
        match self {
            LockError::HeldByOther | LockError::RetriesExhausted => nix::errno::Errno::EBUSY,
            LockError::NotLocked => nix::errno::Errno::ENOENT,
            LockError::Io(e) => e
                .raw_os_error()
                .map(nix::errno::Errno::from_raw)
                .unwrap_or(nix::errno::Errno::EIO),
        }
    }
}

pub type Result<T> = std::result::Result<T, LockError>;

fn hostname() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".into())
}

fn lockfile_path(target: &Path) -> PathBuf {
    let mut os = target.as_os_str().to_os_string();
    os.push(LOCK_POSTFIX);
    PathBuf::from(os)
}

fn link_path(target: &Path, uuid: &str, kind: char, readonly: bool) -> PathBuf {
    let mut os = target.as_os_str().to_os_string();
    os.push(format!(
        "{LOCK_POSTFIX}.{}.{uuid}.{kind}{}",
        hostname(),
        if readonly { 'r' } else { 'w' }
    ));
    PathBuf::from(os)
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Does this persistent lock name belong to a writer?
fn is_writer(name: &str) -> bool {
    name.ends_with('w')
}

fn is_reader(name: &str) -> bool {
    name.ends_with('r')
}

/// Scan the lock directory for foreign lock files on `target`.
///
/// Returns true when a conflicting holder exists. Under `force` every
/// foreign lock is unlinked instead and `stole` is set.
fn scan_holders(
    target: &Path,
    lockfile: &Path,
    our_flink: &Path,
    force: bool,
    readonly: bool,
    stole: &mut bool,
) -> Result<bool> {
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let target_name = basename(target);
    let lockfile_name = basename(lockfile);
    let flink_name = basename(our_flink);

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();

        if name == target_name || name == lockfile_name || name == flink_name {
            continue;
        }
        if !name.starts_with(&format!("{target_name}{LOCK_POSTFIX}.")) {
            continue;
        }

        if force {
            if let Err(e) = fs::remove_file(entry.path()) {
                warn!(lock = %entry.path().display(), "failed to unlink foreign lock: {e}");
            }
            *stole = true;
            continue;
        }

        if is_writer(&name) || (is_reader(&name) && !readonly) {
            debug!(holder = %name, "lock held");
            return Ok(true);
        }
    }

    Ok(false)
}

/// Acquire (or re-assert) the lock on `target` for the identity `uuid`.
///
/// Readers coexist; a writer excludes everyone. Under `force`, foreign locks
/// are stolen, after which the caller is held back one full lease so the
/// previous owner can notice.
pub fn lock(target: &Path, uuid: &str, force: bool, readonly: bool) -> Result<()> {
    lock_with_lease(target, uuid, force, readonly, LEASE_TIME_SECS)
}

pub fn lock_with_lease(
    target: &Path,
    uuid: &str,
    force: bool,
    readonly: bool,
    lease_secs: u64,
) -> Result<()> {
    let lockfile = lockfile_path(target);
    let xlink = link_path(target, uuid, 'x', readonly);
    let flink = link_path(target, uuid, 'f', readonly);
    let identity = xlink.to_string_lossy().into_owned();

    let mut attempts = 0u32;
    let mut stole = false;

    'acquire: loop {
        attempts += 1;
        if attempts > RETRY_MAX {
            return Err(LockError::RetriesExhausted);
        }

        let mut fd = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lockfile)
        {
            Ok(fd) => fd,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if force {
                    // The caller knows when forcing is necessary.
                    if let Err(e) = fs::remove_file(&lockfile) {
                        warn!(lock = %lockfile.display(), "forced unlink failed: {e}");
                    }
                    continue 'acquire;
                }

                // Ours already? The temp lock records its taker's identity.
                let Ok(mut fd) = OpenOptions::new().read(true).write(true).open(&lockfile)
                else {
                    return Err(LockError::HeldByOther);
                };

                let mut buf = String::new();
                if fd.read_to_string(&mut buf).is_err() {
                    continue 'acquire;
                }

                // Identity comparison ignores the trailing r/w marker so a
                // holder may re-assert in either mode.
                if buf.len() + 1 >= identity.len()
                    && buf.as_bytes()[..identity.len() - 1] == identity.as_bytes()[..identity.len() - 1]
                {
                    debug!(lock = %lockfile.display(), "re-asserting our own lock");
                    fd.seek(SeekFrom::Start(0))?;
                    fd
                } else {
                    return Err(LockError::HeldByOther);
                }
            }
            Err(e) => return Err(e.into()),
        };

        if fd.write_all(identity.as_bytes()).is_err() {
            attempts = 0;
            continue 'acquire;
        }
        drop(fd);

        // Hardlink handshake: inode equality proves we won the race even on
        // filesystems where link(2) reports spurious errors.
        for _ in 0..RETRY_MAX {
            let _ = fs::hard_link(&lockfile, &xlink);

            let Ok(st_lock) = fs::symlink_metadata(&lockfile) else {
                return Err(LockError::RetriesExhausted);
            };
            let Ok(st_link) = fs::symlink_metadata(&xlink) else {
                return Err(LockError::RetriesExhausted);
            };

            use std::os::unix::fs::MetadataExt;
            if st_lock.ino() == st_link.ino() {
                let _ = fs::remove_file(&xlink);
                break;
            }

            let _ = fs::remove_file(&lockfile);
            let _ = fs::remove_file(&xlink);
            attempts = 0;
            continue 'acquire;
        }

        // We hold the exclusive temp lock. Fast path: our persistent lock
        // already exists, this is a re-assert.
        let reassert = flink.symlink_metadata().is_ok();

        if !reassert {
            let writer_held = scan_holders(target, &lockfile, &flink, force, readonly, &mut stole)?;
            if writer_held {
                let _ = fs::remove_file(&lockfile);
                return Err(LockError::HeldByOther);
            }

            if OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&flink)
                .is_err()
            {
                let _ = fs::remove_file(&lockfile);
                return Err(LockError::HeldByOther);
            }
        }

        // Rewrite the persistent lock; the mtime bump is the lease heartbeat.
        let mut fd = OpenOptions::new().write(true).create(true).truncate(true).open(&flink)?;
        fd.write_all(flink.to_string_lossy().as_bytes())?;
        drop(fd);

        if force && stole {
            // Quiet time: let the previous holder observe the theft.
            std::thread::sleep(Duration::from_secs(lease_secs));
        }

        let _ = fs::remove_file(&lockfile);

        debug!(target = %target.display(), uuid, readonly, "lock acquired");
        return Ok(());
    }
}

/// Drop the persistent lock.
pub fn unlock(target: &Path, uuid: &str, readonly: bool) -> Result<()> {
    let flink = link_path(target, uuid, 'f', readonly);
    fs::remove_file(&flink)?;
    debug!(target = %target.display(), uuid, "lock released");
    Ok(())
}

/// Age in seconds of the freshest lock on `target`, measured against a probe
/// file created on the same filesystem (so only the server's clock counts).
/// Clamped to zero for locks touched concurrently with the probe.
pub fn lock_delta(target: &Path) -> Result<u64> {
    use std::os::unix::fs::MetadataExt;

    let uniq: u32 = rand::thread_rng().gen_range(0..0x0100_0000);
    let mut probe_os = target.as_os_str().to_os_string();
    probe_os.push(format!(".xen{uniq:08}.tmp"));
    let probe = PathBuf::from(probe_os);

    drop(File::create(&probe)?);
    let probe_mtime = match fs::symlink_metadata(&probe) {
        Ok(meta) => meta.mtime(),
        Err(e) => {
            let _ = fs::remove_file(&probe);
            return Err(e.into());
        }
    };
    let _ = fs::remove_file(&probe);

    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let target_name = basename(target);

    let mut result: Option<u64> = None;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();

        if name == target_name || !name.starts_with(&format!("{target_name}{LOCK_POSTFIX}.")) {
            continue;
        }

        if let Ok(meta) = fs::symlink_metadata(entry.path()) {
            let diff = (probe_mtime - meta.mtime()).max(0) as u64;
            result = Some(result.map_or(diff, |r| r.min(diff)));
        }
    }

    result.ok_or(LockError::NotLocked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn target(dir: &Path) -> PathBuf {
        let path = dir.join("disk.vhd");
        fs::write(&path, b"image").unwrap();
        path
    }

    #[test]
    fn writer_lock_excludes_other_writers() {
        let dir = tempdir().unwrap();
        let f = target(dir.path());

        lock_with_lease(&f, "aaaa", false, false, 0).unwrap();
        assert!(matches!(
            lock_with_lease(&f, "bbbb", false, false, 0),
            Err(LockError::HeldByOther)
        ));

        unlock(&f, "aaaa", false).unwrap();
        lock_with_lease(&f, "bbbb", false, false, 0).unwrap();
        unlock(&f, "bbbb", false).unwrap();
    }

    #[test]
    fn reassert_succeeds_and_refreshes() {
        let dir = tempdir().unwrap();
        let f = target(dir.path());

        lock_with_lease(&f, "aaaa", false, false, 0).unwrap();
        // Same identity acquires again without conflict.
        lock_with_lease(&f, "aaaa", false, false, 0).unwrap();

        let flink = link_path(&f, "aaaa", 'f', false);
        let contents = fs::read_to_string(&flink).unwrap();
        assert!(contents.contains("aaaa"));

        unlock(&f, "aaaa", false).unwrap();
    }

    #[test]
    fn readers_coexist_but_writer_is_excluded() {
        let dir = tempdir().unwrap();
        let f = target(dir.path());

        lock_with_lease(&f, "r1", false, true, 0).unwrap();
        lock_with_lease(&f, "r2", false, true, 0).unwrap();

        assert!(matches!(
            lock_with_lease(&f, "w1", false, false, 0),
            Err(LockError::HeldByOther)
        ));

        // Another reader is fine while only readers hold the lock.
        lock_with_lease(&f, "r3", false, true, 0).unwrap();

        unlock(&f, "r1", false).unwrap_err(); // wrong mode
        unlock(&f, "r1", true).unwrap();
        unlock(&f, "r2", true).unwrap();
        unlock(&f, "r3", true).unwrap();
    }

    #[test]
    fn force_steals_and_leaves_stealers_identity() {
        let dir = tempdir().unwrap();
        let f = target(dir.path());

        lock_with_lease(&f, "victim", false, false, 0).unwrap();
        lock_with_lease(&f, "thief", true, false, 0).unwrap();

        let victim_flink = link_path(&f, "victim", 'f', false);
        let thief_flink = link_path(&f, "thief", 'f', false);
        assert!(!victim_flink.exists());
        let contents = fs::read_to_string(&thief_flink).unwrap();
        assert!(contents.contains("thief"));

        unlock(&f, "thief", false).unwrap();
    }

    #[test]
    fn lock_delta_reports_staleness() {
        let dir = tempdir().unwrap();
        let f = target(dir.path());

        assert!(matches!(lock_delta(&f), Err(LockError::NotLocked)));

        lock_with_lease(&f, "aaaa", false, false, 0).unwrap();
        let delta = lock_delta(&f).unwrap();
        // Just taken: staleness is (about) zero and never negative.
        assert!(delta <= 1);

        unlock(&f, "aaaa", false).unwrap();
    }
}
