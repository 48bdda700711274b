//! Sealed memfd regions for locally produced frames

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use bytes::Bytes;
use memmap2::{Mmap, MmapMut};

use crate::error::{CaptureError, Result};

const REGION_NAME: &[u8] = b"vdocap.frame\0";

/// Anonymous shared memory, close-on-exec, sealed against resizing.
///
/// Writable only inside the fill callback passed to [`SharedRegion::allocate`].
/// Afterwards the mapping is read-only and the memfd carries
/// `F_SEAL_FUTURE_WRITE | F_SEAL_SEAL`, so holders of the fd cannot write either.
#[derive(Debug)]
pub struct SharedRegion {
    file: File,
    map: Mmap,
    len: usize,
}

impl SharedRegion {
    /// Allocate `len` bytes rounded up to the page size and fill them
    pub fn allocate<F>(len: usize, fill: F) -> Result<Self>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        let capacity = page_aligned(len).ok_or_else(|| CaptureError::Allocation {
            what: "cannot size region",
            source: io::Error::new(io::ErrorKind::InvalidInput, format!("{len} bytes")),
        })?;

        // SAFETY: REGION_NAME is NUL terminated and the flags are valid for memfd_create
        let raw = unsafe {
            libc::memfd_create(
                REGION_NAME.as_ptr().cast(),
                libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING,
            )
        };
        if raw < 0 {
            return Err(CaptureError::allocation("memfd_create failed"));
        }
        // SAFETY: raw is a freshly created descriptor nobody else owns
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        // SAFETY: fd is a valid memfd
        if unsafe { libc::ftruncate(fd.as_raw_fd(), capacity as libc::off_t) } < 0 {
            return Err(CaptureError::allocation("cannot commit region"));
        }

        add_seals(&fd, libc::F_SEAL_SHRINK | libc::F_SEAL_GROW)?;

        let file = File::from(fd);
        // SAFETY: the memfd is private to this process and sealed against shrinking
        let mut map = unsafe { MmapMut::map_mut(&file) }.map_err(|source| CaptureError::Allocation {
            what: "cannot map region",
            source,
        })?;

        fill(&mut map[..len])?;

        // The writable mapping above survives FUTURE_WRITE; new writers do not
        add_seals(&file, libc::F_SEAL_FUTURE_WRITE | libc::F_SEAL_SEAL)?;

        let map = map.make_read_only().map_err(|source| CaptureError::Allocation {
            what: "cannot freeze region",
            source,
        })?;

        Ok(Self { file, map, len })
    }

    /// Bytes written by the fill callback
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Committed size, a whole number of pages
    pub fn capacity(&self) -> usize {
        self.map.len()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    /// Zero-copy view that keeps the region alive
    pub fn bytes(region: &Arc<SharedRegion>) -> Bytes {
        Bytes::from_owner(RegionView(Arc::clone(region)))
    }
}

impl AsRef<[u8]> for SharedRegion {
    fn as_ref(&self) -> &[u8] {
        &self.map[..self.len]
    }
}

struct RegionView(Arc<SharedRegion>);

impl AsRef<[u8]> for RegionView {
    fn as_ref(&self) -> &[u8] {
        let region: &SharedRegion = &self.0;
        region.as_ref()
    }
}

fn add_seals(fd: &impl AsRawFd, seals: libc::c_int) -> Result<()> {
    // SAFETY: fd is a valid memfd created with MFD_ALLOW_SEALING
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_ADD_SEALS, seals) } < 0 {
        return Err(CaptureError::allocation("cannot seal region"));
    }
    Ok(())
}

fn page_aligned(len: usize) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let page = page_size::get();
    len.div_ceil(page).checked_mul(page)
}
