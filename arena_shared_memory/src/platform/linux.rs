//! POSIX shared memory, mapping and advisory locking

use crate::error::{ArenaError, ArenaResult};
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::getpid;
use std::fs::{File, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use tracing::warn;

/// Create a new shared memory object of `size` bytes.
///
/// Returns `Ok(None)` if the name is already taken.
pub fn shm_create_exclusive(name: &str, size: usize, mode: u32) -> ArenaResult<Option<File>> {
    let fd = match shm_open(
        name,
        OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
        Mode::from_bits_truncate(mode as libc::mode_t),
    ) {
        Ok(fd) => fd,
        Err(Errno::EEXIST) => return Ok(None),
        Err(e) => return Err(ArenaError::system("shm_open", name, e)),
    };
    let file = File::from(fd);

    // shm_open applies the umask; force the configured bits.
    let sized = file
        .set_permissions(Permissions::from_mode(mode))
        .and_then(|()| file.set_len(size as u64));
    if let Err(e) = sized {
        if let Err(unlink_err) = shm_unlink(name) {
            warn!("Failed to unlink half-created {}: {}", name, unlink_err);
        }
        return Err(e.into());
    }
    Ok(Some(file))
}

/// Open an existing shared memory object read-write.
///
/// Returns `Ok(None)` if it does not exist.
pub fn shm_open_existing(name: &str) -> ArenaResult<Option<File>> {
    match shm_open(name, OFlag::O_RDWR, Mode::empty()) {
        Ok(fd) => Ok(Some(File::from(fd))),
        Err(Errno::ENOENT) => Ok(None),
        Err(e) => Err(ArenaError::system("shm_open", name, e)),
    }
}

/// Remove a shared memory object name. Returns `false` if it was already gone.
pub fn shm_remove(name: &str) -> ArenaResult<bool> {
    match shm_unlink(name) {
        Ok(()) => Ok(true),
        Err(Errno::ENOENT) => Ok(false),
        Err(e) => Err(ArenaError::system("shm_unlink", name, e)),
    }
}

/// Check whether a shared memory object name exists.
pub fn shm_exists(name: &str) -> ArenaResult<bool> {
    match shm_open(name, OFlag::O_RDONLY, Mode::empty()) {
        Ok(_) => Ok(true),
        Err(Errno::ENOENT) => Ok(false),
        Err(e) => Err(ArenaError::system("shm_open", name, e)),
    }
}

/// Current size of an open object.
pub fn object_len(file: &File) -> ArenaResult<usize> {
    Ok(file.metadata()?.len() as usize)
}

/// Map the first `len` bytes of `file` read-write and shared.
pub fn map_shared(file: &File, len: usize) -> ArenaResult<MmapMut> {
    // SAFETY: the object is only resized at creation, before anyone maps it.
    let mmap = unsafe { MmapOptions::new().len(len).map_mut(file)? };
    Ok(mmap)
}

/// Take an exclusive advisory lock, blocking until it is granted.
pub fn lock_exclusive(fd: RawFd) -> ArenaResult<()> {
    flock(fd, libc::LOCK_EX)
}

/// Release an advisory lock taken with [`lock_exclusive`].
pub fn unlock(fd: RawFd) -> ArenaResult<()> {
    flock(fd, libc::LOCK_UN)
}

fn flock(fd: RawFd, operation: libc::c_int) -> ArenaResult<()> {
    loop {
        // SAFETY: plain syscall on a descriptor owned by the caller.
        let rc = unsafe { libc::flock(fd, operation) };
        if rc == 0 {
            return Ok(());
        }
        match Errno::last() {
            Errno::EINTR => continue,
            e => return Err(ArenaError::system("flock", format!("fd {fd}"), e)),
        }
    }
}

/// Raw descriptor of an open object.
pub fn raw_fd(file: &File) -> RawFd {
    file.as_raw_fd()
}

/// Get current process ID
pub fn get_current_pid() -> u32 {
    getpid().as_raw() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/arena_platform_{tag}_{}", std::process::id())
    }

    #[test]
    fn test_create_exclusive_then_collide() {
        let name = unique_name("collide");
        let _ = shm_remove(&name);

        let file = shm_create_exclusive(&name, 4096, 0o600)
            .unwrap()
            .expect("name should be free");
        assert_eq!(object_len(&file).unwrap(), 4096);
        assert!(shm_create_exclusive(&name, 4096, 0o600).unwrap().is_none());
        assert!(shm_exists(&name).unwrap());

        assert!(shm_remove(&name).unwrap());
        assert!(!shm_remove(&name).unwrap());
        assert!(shm_open_existing(&name).unwrap().is_none());
    }

    #[test]
    fn test_failed_sizing_leaves_no_object() {
        let name = unique_name("oversize");
        let _ = shm_remove(&name);

        assert!(shm_create_exclusive(&name, usize::MAX, 0o600).is_err());
        assert!(!shm_exists(&name).unwrap());
        // The name is free again.
        let file = shm_create_exclusive(&name, 64, 0o600).unwrap();
        assert!(file.is_some());
        shm_remove(&name).unwrap();
    }

    #[test]
    fn test_mapping_is_shared_between_opens() {
        let name = unique_name("shared");
        let _ = shm_remove(&name);

        let a = shm_create_exclusive(&name, 64, 0o600).unwrap().unwrap();
        let b = shm_open_existing(&name).unwrap().unwrap();
        let mut map_a = map_shared(&a, 64).unwrap();
        let map_b = map_shared(&b, 64).unwrap();
        map_a[10] = 0x5A;
        assert_eq!(map_b[10], 0x5A);

        shm_remove(&name).unwrap();
    }

    #[test]
    fn test_flock_roundtrip() {
        let file = tempfile::tempfile().unwrap();
        lock_exclusive(raw_fd(&file)).unwrap();
        unlock(raw_fd(&file)).unwrap();
    }
}
