//! Shared-memory buffers
//!
//! A [`Buffer`] is an anonymous file in the runtime directory, mapped
//! read/write and shared, plus the upstream `wl_buffer` that covers it.
//! The three live and die together: dropping the buffer destroys the
//! upstream object, unmaps the memory and closes the file, in that order.

use std::cell::Cell;
use std::ffi::CString;
use std::fs::{self, File};
use std::io;
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;
use std::rc::Rc;

use log::{debug, warn};
use memmap2::{MmapMut, MmapOptions};

use crate::config::ShmConfig;
use crate::error::AllocError;
use crate::format::{to_shm_format, BYTES_PER_PIXEL};
use crate::upstream::{BufferHandle, Upstream};

/// What the embedder learns about a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Embedder fourcc, as requested.
    pub format: u32,
    pub width: u32,
    pub height: u32,
    pub stride: u32,
    /// Start of the mapping; valid for `height * stride` bytes while the
    /// buffer lives.
    pub data: *mut u8,
}

pub struct Buffer {
    upstream: Rc<dyn Upstream>,
    handle: Option<BufferHandle>,
    // Field order is drop order: unmap before close.
    map: MmapMut,
    file: File,

    size: usize,
    format: u32,
    width: u32,
    height: u32,
    stride: u32,
    released: Rc<Cell<bool>>,
}

impl Buffer {
    /// Allocates a `width` x `height` buffer in the embedder's `format`.
    pub fn allocate(
        upstream: Rc<dyn Upstream>,
        config: &ShmConfig,
        format: u32,
        width: u32,
        height: u32,
    ) -> Result<Self, AllocError> {
        if !upstream.globals().shm {
            return Err(AllocError::NoShm);
        }
        if width == 0 || height == 0 {
            return Err(AllocError::EmptyBuffer { width, height });
        }

        let (stride, size) = width
            .checked_mul(BYTES_PER_PIXEL)
            .and_then(|stride| Some((stride, stride.checked_mul(height)?)))
            .filter(|(_, size)| i32::try_from(*size).is_ok())
            .ok_or(AllocError::TooLarge { width, height })?;
        let size = size as usize;

        let runtime_dir = std::env::var_os(&config.runtime_dir_var)
            .ok_or_else(|| AllocError::NoRuntimeDir(config.runtime_dir_var.clone()))?;
        let template = PathBuf::from(runtime_dir).join(format!("{}XXXXXX", config.file_prefix));

        let (file, path) = create_anonymous_file(template)?;
        if let Err(e) = fs::remove_file(&path) {
            warn!("Failed to unlink {}: {}", path.display(), e);
        }

        file.set_len(size as u64)
            .map_err(|source| AllocError::Truncate { size, source })?;

        // Nothing else maps or truncates this file.
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|source| AllocError::Map { size, source })?;

        let handle = upstream.create_shm_buffer(
            file.as_fd(),
            size as i32,
            width as i32,
            height as i32,
            stride as i32,
            to_shm_format(format),
        )?;
        debug!(
            "Allocated {}x{} shm buffer {:?} ({} bytes, format {:#010x})",
            width, height, handle, size, format
        );

        Ok(Self {
            upstream,
            handle: Some(handle),
            map,
            file,
            size,
            format,
            width,
            height,
            stride,
            released: Rc::new(Cell::new(true)),
        })
    }

    pub fn handle(&self) -> Option<BufferHandle> {
        self.handle
    }

    pub fn format(&self) -> u32 {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn info(&self) -> BufferInfo {
        BufferInfo {
            format: self.format,
            width: self.width,
            height: self.height,
            stride: self.stride,
            data: self.map.as_ptr().cast_mut(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.map
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// The backing file, for handing to another process.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Whether the compositor has let go of the buffer since it was
    /// last attached.
    pub fn is_released(&self) -> bool {
        self.released.get()
    }

    pub(crate) fn mark_busy(&self) {
        self.released.set(false);
    }

    pub(crate) fn release_flag(&self) -> &Rc<Cell<bool>> {
        &self.released
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.upstream.destroy_buffer(handle);
        }
    }
}

/// `mkostemp` on `template`, which must end in `XXXXXX`. Returns the open
/// file and the name it got.
fn create_anonymous_file(template: PathBuf) -> Result<(File, PathBuf), AllocError> {
    let c_template = CString::new(template.as_os_str().as_bytes()).map_err(|e| {
        AllocError::TempFile {
            path: template.clone(),
            source: io::Error::new(io::ErrorKind::InvalidInput, e),
        }
    })?;
    let mut bytes = c_template.into_bytes_with_nul();

    let fd = unsafe { libc::mkostemp(bytes.as_mut_ptr().cast(), libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(AllocError::TempFile {
            path: template,
            source: io::Error::last_os_error(),
        });
    }
    // Sole owner of a descriptor mkostemp just opened.
    let file = File::from(unsafe { OwnedFd::from_raw_fd(fd) });

    bytes.pop();
    let path = PathBuf::from(std::ffi::OsString::from_vec(bytes));
    Ok((file, path))
}
