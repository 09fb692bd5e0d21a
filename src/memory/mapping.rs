//! Thin wrappers over the mapping system calls the engine relies on.
//!
//! Three kinds of mappings exist:
//!
//! - **Anonymous read-write** memory for arena chunks.
//! - **Reservations**: inaccessible, unbacked address space that holds a
//!   lane's blocks or a text pool's buffers at stable addresses.
//! - **File windows**: page runs of a stream file mapped `MAP_FIXED` over a
//!   piece of a reservation. The file is extended with a single trailing
//!   write first so the window never covers a hole past end-of-file.
//!
//! Everything that can block on disk takes `&SignalsBlocked`.

use crate::error::{Error, Result};
use crate::signal::SignalsBlocked;
use rustix::fd::{AsFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use rustix::mm::{MapFlags, ProtFlags};
use std::path::Path;
use std::ptr::NonNull;

/// System page size.
#[inline]
pub fn page_size() -> usize {
    rustix::param::page_size()
}

/// Map `len` bytes of zeroed, read-write anonymous memory.
pub fn map_anonymous(len: usize, _sig: &SignalsBlocked) -> Result<NonNull<u8>> {
    if len == 0 {
        return Err(Error::AllocationFailed("size must be greater than 0"));
    }
    // SAFETY: a fresh mapping at a kernel-chosen address aliases nothing.
    let ptr = unsafe {
        rustix::mm::mmap_anonymous(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::PRIVATE,
        )?
    };
    NonNull::new(ptr.cast::<u8>()).ok_or(Error::AllocationFailed("mmap returned null"))
}

/// Reserve `len` bytes of inaccessible address space.
///
/// Nothing is committed until file windows are mapped over it.
pub fn reserve(len: usize, _sig: &SignalsBlocked) -> Result<NonNull<u8>> {
    if len == 0 {
        return Err(Error::AllocationFailed("size must be greater than 0"));
    }
    // SAFETY: as above; PROT_NONE pages cannot be touched by anyone.
    let ptr = unsafe {
        rustix::mm::mmap_anonymous(
            std::ptr::null_mut(),
            len,
            ProtFlags::empty(),
            MapFlags::PRIVATE | MapFlags::NORESERVE,
        )?
    };
    NonNull::new(ptr.cast::<u8>()).ok_or(Error::AllocationFailed("mmap returned null"))
}

/// Unmap `len` bytes at `addr`.
///
/// # Safety
///
/// `addr..addr + len` must be a range this module mapped, and nothing may
/// access it afterwards.
pub unsafe fn unmap(addr: NonNull<u8>, len: usize) -> Result<()> {
    // SAFETY: guaranteed by the caller.
    unsafe { rustix::mm::munmap(addr.as_ptr().cast(), len)? };
    Ok(())
}

/// Create a stream file, failing if it already exists.
///
/// Exclusive creation is the stale-experiment guard: two sessions can never
/// append to the same file.
pub fn create_exclusive(path: &Path) -> Result<OwnedFd> {
    let fd = rustix::fs::open(
        path,
        OFlags::RDWR | OFlags::CREATE | OFlags::EXCL | OFlags::CLOEXEC,
        Mode::from_raw_mode(0o644),
    )?;
    Ok(fd)
}

/// Map the file range `offset..offset + len` read-write over `addr`.
///
/// The file is first extended to `offset + len` by writing one zero byte at
/// its last position, so the window is fully backed and reads as zeros.
///
/// # Safety
///
/// `addr..addr + len` must lie inside a reservation owned by the caller, and
/// no other thread may be accessing that range.
pub unsafe fn map_file_window(
    fd: impl AsFd,
    addr: NonNull<u8>,
    len: usize,
    offset: u64,
    _sig: &SignalsBlocked,
) -> Result<()> {
    let fd = fd.as_fd();
    let end = offset + len as u64;
    let written = rustix::io::pwrite(fd, &[0u8], end - 1)?;
    if written != 1 {
        return Err(Error::System(rustix::io::Errno::IO));
    }
    // SAFETY: MAP_FIXED replaces pages of the caller's reservation only.
    unsafe {
        rustix::mm::mmap(
            addr.as_ptr().cast(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::SHARED | MapFlags::FIXED,
            fd,
            offset,
        )?;
    }
    Ok(())
}

/// Detach a file window, leaving the range reserved but inaccessible.
///
/// # Safety
///
/// `addr..addr + len` must lie inside a reservation owned by the caller, and
/// nothing may access it afterwards.
pub unsafe fn release_window(addr: NonNull<u8>, len: usize, _sig: &SignalsBlocked) -> Result<()> {
    // SAFETY: MAP_FIXED replaces pages of the caller's reservation only.
    unsafe {
        rustix::mm::mmap_anonymous(
            addr.as_ptr().cast(),
            len,
            ProtFlags::empty(),
            MapFlags::PRIVATE | MapFlags::FIXED | MapFlags::NORESERVE,
        )?;
    }
    Ok(())
}

/// Truncate a stream file to `len` bytes.
pub fn truncate(fd: impl AsFd, len: u64, _sig: &SignalsBlocked) -> Result<()> {
    rustix::fs::ftruncate(fd, len)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anonymous_is_zeroed() {
        let sig = SignalsBlocked::enter();
        let len = page_size();
        let ptr = map_anonymous(len, &sig).unwrap();
        let data = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) };
        assert!(data.iter().all(|&b| b == 0));
        unsafe { unmap(ptr, len).unwrap() };
    }

    #[test]
    fn test_zero_size_fails() {
        let sig = SignalsBlocked::enter();
        assert!(map_anonymous(0, &sig).is_err());
        assert!(reserve(0, &sig).is_err());
    }

    #[test]
    fn test_exclusive_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile");
        let _fd = create_exclusive(&path).unwrap();
        assert!(create_exclusive(&path).is_err());
    }

    #[test]
    fn test_file_window_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("window");
        let fd = create_exclusive(&path).unwrap();
        let sig = SignalsBlocked::enter();
        let page = page_size();

        let base = reserve(2 * page, &sig).unwrap();
        let second = unsafe { NonNull::new_unchecked(base.as_ptr().add(page)) };
        unsafe {
            map_file_window(&fd, second, page, page as u64, &sig).unwrap();
            std::ptr::copy_nonoverlapping(b"hello".as_ptr(), second.as_ptr(), 5);
            unmap(base, 2 * page).unwrap();
        }

        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 2 * page);
        assert!(contents[..page].iter().all(|&b| b == 0));
        assert_eq!(&contents[page..page + 5], b"hello");
    }

    #[test]
    fn test_released_window_keeps_file_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("released");
        let fd = create_exclusive(&path).unwrap();
        let sig = SignalsBlocked::enter();
        let page = page_size();

        let base = reserve(page, &sig).unwrap();
        unsafe {
            map_file_window(&fd, base, page, 0, &sig).unwrap();
            *base.as_ptr() = 7;
            release_window(base, page, &sig).unwrap();
            unmap(base, page).unwrap();
        }
        truncate(&fd, 1, &sig).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), vec![7]);
    }

    #[test]
    fn test_window_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offsets");
        let fd = create_exclusive(&path).unwrap();
        let sig = SignalsBlocked::enter();
        let page = page_size();
        let base = reserve(page, &sig).unwrap();
        unsafe {
            map_file_window(&fd, base, page, 3 * page as u64, &sig).unwrap();
            unmap(base, page).unwrap();
        }
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents.len(), 4 * page);
        assert!(contents.iter().all(|&b| b == 0));
    }
}
