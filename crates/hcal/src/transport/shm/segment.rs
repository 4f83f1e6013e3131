// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! POSIX shared memory segments (`shm_open` + `ftruncate` + `mmap`).
//!
//! Names start with `/` and contain no other `/`. A mapping is released on
//! drop; unlinking the name is an explicit, separate step so that existing
//! mappings stay valid after a segment is replaced.

use super::{Result, ShmError};
use std::ffi::CString;
use std::io;
use std::ptr;

/// A mapped shared memory object.
pub struct ShmSegment {
    ptr: *mut u8,
    size: usize,
    name: String,
}

// SAFETY: the mapping is plain shared memory; every structure placed in it
// synchronizes through atomics.
unsafe impl Send for ShmSegment {}
unsafe impl Sync for ShmSegment {}

/// Result of [`ShmSegment::open_or_create`].
pub enum Opened {
    /// This call created the object (zero-filled)
    Created(ShmSegment),
    /// The object already existed
    Existing(ShmSegment),
}

impl ShmSegment {
    /// Create a new object, failing with `AlreadyExists` if the name is taken.
    pub fn create(name: &str, size: usize) -> Result<Self> {
        let c_name = c_name(name)?;
        // SAFETY:
        // - c_name is a valid NUL-terminated string
        // - O_CREAT|O_EXCL|O_RDWR with mode 0o600 is a valid flag set
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600,
            )
        };
        if fd < 0 {
            return Err(ShmError::SegmentCreate(io::Error::last_os_error()));
        }

        // SAFETY: fd is a valid descriptor returned by shm_open above
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and closed exactly once on this error path;
            // c_name is still a valid string for the unlink
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(ShmError::SegmentCreate(err));
        }

        let ptr = match map_fd(fd, size) {
            Ok(ptr) => ptr,
            Err(err) => {
                // SAFETY: c_name is a valid string; the object was created by us
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(ShmError::Mmap(err));
            }
        };

        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Unlink any object with this name, then create it.
    pub fn create_replacing(name: &str, size: usize) -> Result<Self> {
        Self::unlink(name)?;
        Self::create(name, size)
    }

    /// Map an existing object in full. The size is taken from the object.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = c_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string; mode is ignored without O_CREAT
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::NotFound {
                return Err(ShmError::NotFound(name.to_string()));
            }
            return Err(ShmError::SegmentOpen(err));
        }

        // SAFETY: stat is plain old data, zero is a valid bit pattern
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        // SAFETY: fd is valid; stat points to a writable libc::stat
        if unsafe { libc::fstat(fd, &mut stat) } < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: fd is valid and closed once
            unsafe { libc::close(fd) };
            return Err(ShmError::SegmentOpen(err));
        }
        let size = stat.st_size as usize;
        if size == 0 {
            // Creator has not sized it yet
            // SAFETY: fd is valid and closed once
            unsafe { libc::close(fd) };
            return Err(ShmError::NotFound(name.to_string()));
        }

        let ptr = map_fd(fd, size).map_err(ShmError::Mmap)?;
        Ok(Self {
            ptr,
            size,
            name: name.to_string(),
        })
    }

    /// Check `name` against the shm naming rules without touching the system.
    pub fn validate_name(name: &str) -> Result<()> {
        c_name(name).map(|_| ())
    }

    /// Open the object, creating it with `size` bytes if it does not exist.
    pub fn open_or_create(name: &str, size: usize) -> Result<Opened> {
        match Self::create(name, size) {
            Ok(segment) => Ok(Opened::Created(segment)),
            Err(ShmError::SegmentCreate(e)) if e.kind() == io::ErrorKind::AlreadyExists => {
                // Another creator may still be inside ftruncate; retry briefly.
                let mut attempts = 0;
                loop {
                    match Self::open(name) {
                        Ok(segment) if segment.size() >= size => {
                            return Ok(Opened::Existing(segment))
                        }
                        Ok(segment) => {
                            return Err(ShmError::SizeMismatch {
                                expected: size,
                                actual: segment.size(),
                            })
                        }
                        Err(ShmError::NotFound(_)) if attempts < 100 => {
                            attempts += 1;
                            std::thread::sleep(std::time::Duration::from_micros(100));
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Remove a name. Missing names are not an error.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = c_name(name)?;
        // SAFETY: c_name is a valid NUL-terminated string
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::NotFound {
                return Err(ShmError::SegmentOpen(err));
            }
        }
        Ok(())
    }

    /// True if an object with this name exists.
    #[must_use]
    pub fn exists(name: &str) -> bool {
        let Ok(c_name) = CString::new(name) else {
            return false;
        };
        // SAFETY: c_name is a valid NUL-terminated string
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDONLY, 0) };
        if fd >= 0 {
            // SAFETY: fd is valid and closed once
            unsafe { libc::close(fd) };
            true
        } else {
            false
        }
    }

    #[inline]
    #[must_use]
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ShmSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/size come from a successful mmap and are unmapped once
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.size);
        }
    }
}

fn c_name(name: &str) -> Result<CString> {
    if !name.starts_with('/') || name[1..].contains('/') || name.len() > 255 || name.len() < 2 {
        return Err(ShmError::InvalidName(name.to_string()));
    }
    CString::new(name).map_err(|_| ShmError::InvalidName(name.to_string()))
}

/// Map `size` bytes of `fd` read/write shared, then close `fd`.
fn map_fd(fd: libc::c_int, size: usize) -> io::Result<*mut u8> {
    // SAFETY:
    // - null hint lets the kernel choose the address
    // - fd is a valid shm descriptor sized to at least `size` bytes
    // - MAP_SHARED makes writes visible to other processes
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    let result = if ptr == libc::MAP_FAILED {
        Err(io::Error::last_os_error())
    } else {
        Ok(ptr.cast::<u8>())
    };
    // SAFETY: the mapping (if any) keeps its own reference; fd is closed once
    unsafe { libc::close(fd) };
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name() -> String {
        format!("/hcal_test_seg_{:016x}", fastrand::u64(..))
    }

    #[test]
    fn test_invalid_names() {
        assert!(matches!(
            ShmSegment::open("no_slash"),
            Err(ShmError::InvalidName(_))
        ));
        assert!(matches!(
            ShmSegment::open("/a/b"),
            Err(ShmError::InvalidName(_))
        ));
        let long = format!("/{}", "x".repeat(300));
        assert!(matches!(
            ShmSegment::create(&long, 64),
            Err(ShmError::InvalidName(_))
        ));
    }

    #[test]
    fn test_create_is_zeroed_and_shared() {
        let name = unique_name();
        let a = ShmSegment::create(&name, 4096).expect("create");
        // SAFETY: the segment is 4096 bytes long
        unsafe {
            assert_eq!(*a.as_ptr().add(100), 0);
            *a.as_ptr().add(100) = 0x5A;
        }

        let b = ShmSegment::open(&name).expect("open");
        assert_eq!(b.size(), 4096);
        // SAFETY: same object, same size
        unsafe { assert_eq!(*b.as_ptr().add(100), 0x5A) };

        ShmSegment::unlink(&name).expect("unlink");
    }

    #[test]
    fn test_create_twice_fails() {
        let name = unique_name();
        let _a = ShmSegment::create(&name, 128).expect("create");
        assert!(matches!(
            ShmSegment::create(&name, 128),
            Err(ShmError::SegmentCreate(_))
        ));
        ShmSegment::unlink(&name).expect("unlink");
    }

    #[test]
    fn test_open_or_create() {
        let name = unique_name();
        let first = ShmSegment::open_or_create(&name, 256).expect("first");
        assert!(matches!(first, Opened::Created(_)));
        let second = ShmSegment::open_or_create(&name, 256).expect("second");
        assert!(matches!(second, Opened::Existing(_)));
        ShmSegment::unlink(&name).expect("unlink");
    }

    #[test]
    fn test_open_missing() {
        assert!(matches!(
            ShmSegment::open(&unique_name()),
            Err(ShmError::NotFound(_))
        ));
    }

    #[test]
    fn test_unlink_keeps_mapping_alive() {
        let name = unique_name();
        let seg = ShmSegment::create(&name, 64).expect("create");
        ShmSegment::unlink(&name).expect("unlink");
        assert!(!ShmSegment::exists(&name));
        // SAFETY: mapping is still valid after unlink
        unsafe { *seg.as_ptr() = 1 };
        assert!(ShmSegment::unlink(&name).is_ok());
    }
}
