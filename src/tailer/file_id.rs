// SPDX-License-Identifier: Apache-2.0

//! File identity that survives renames: device + inode on Unix, volume serial
//! + file index on Windows.
//!
//! A log stream compares the identity of the file currently at its path with
//! the identity of the handle it holds. A mismatch means the path was rotated.

use std::fs::File;
use std::io;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    /// Device ID (Unix) or volume serial number (Windows)
    dev: u64,
    /// Inode number (Unix) or file index (Windows)
    ino: u64,
}

/// Identity and size of whatever file is at a path right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PathStat {
    pub id: FileId,
    pub len: u64,
}

impl FileId {
    #[cfg(test)]
    pub(crate) fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    #[cfg(unix)]
    fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    /// Identity of an open file handle.
    #[cfg(unix)]
    pub fn from_file(file: &File) -> io::Result<Self> {
        Ok(Self::from_metadata(&file.metadata()?))
    }

    /// Identity of an open file handle.
    #[cfg(windows)]
    pub fn from_file(file: &File) -> io::Result<Self> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Foundation::HANDLE;
        use windows_sys::Win32::Storage::FileSystem::{
            BY_HANDLE_FILE_INFORMATION, GetFileInformationByHandle,
        };

        let handle = file.as_raw_handle() as HANDLE;
        let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };

        let result = unsafe { GetFileInformationByHandle(handle, &mut info) };
        if result == 0 {
            return Err(io::Error::last_os_error());
        }

        let file_index = ((info.nFileIndexHigh as u64) << 32) | (info.nFileIndexLow as u64);

        Ok(Self {
            dev: info.dwVolumeSerialNumber as u64,
            ino: file_index,
        })
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

/// Stat the file at `path`. `Ok(None)` when nothing is there.
#[cfg(unix)]
pub fn stat_path(path: &Path) -> io::Result<Option<PathStat>> {
    match std::fs::metadata(path) {
        Ok(m) => Ok(Some(PathStat {
            id: FileId::from_metadata(&m),
            len: m.len(),
        })),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Stat the file at `path`. `Ok(None)` when nothing is there.
#[cfg(windows)]
pub fn stat_path(path: &Path) -> io::Result<Option<PathStat>> {
    // The file index is only reachable through a handle.
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(Some(PathStat {
        id: FileId::from_file(&file)?,
        len: file.metadata()?.len(),
    }))
}

/// Current path of an open file handle. Used to report where a rotated file went.
#[cfg(target_os = "linux")]
pub fn get_path_from_file(file: &File) -> io::Result<std::path::PathBuf> {
    use std::os::unix::io::AsRawFd;

    let link_path = format!("/proc/self/fd/{}", file.as_raw_fd());
    std::fs::read_link(&link_path)
}

/// Current path of an open file handle. Used to report where a rotated file went.
#[cfg(target_os = "macos")]
pub fn get_path_from_file(file: &File) -> io::Result<std::path::PathBuf> {
    use std::os::unix::io::AsRawFd;

    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let result = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETPATH, buf.as_mut_ptr()) };
    if result == -1 {
        return Err(io::Error::last_os_error());
    }

    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let path_str = std::str::from_utf8(&buf[..len])
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    Ok(std::path::PathBuf::from(path_str))
}

/// Current path of an open file handle. Used to report where a rotated file went.
#[cfg(windows)]
pub fn get_path_from_file(file: &File) -> io::Result<std::path::PathBuf> {
    use std::os::windows::io::AsRawHandle;
    use windows_sys::Win32::Foundation::HANDLE;
    use windows_sys::Win32::Storage::FileSystem::{
        FILE_NAME_NORMALIZED, GetFinalPathNameByHandleW,
    };

    let handle = file.as_raw_handle() as HANDLE;

    let size =
        unsafe { GetFinalPathNameByHandleW(handle, std::ptr::null_mut(), 0, FILE_NAME_NORMALIZED) };
    if size == 0 {
        return Err(io::Error::last_os_error());
    }

    let mut buf: Vec<u16> = vec![0; size as usize];
    let result = unsafe {
        GetFinalPathNameByHandleW(
            handle,
            buf.as_mut_ptr(),
            buf.len() as u32,
            FILE_NAME_NORMALIZED,
        )
    };
    if result == 0 {
        return Err(io::Error::last_os_error());
    }

    let path = String::from_utf16_lossy(&buf[..result as usize]);
    let path = path.strip_prefix(r"\\?\").unwrap_or(&path);
    Ok(std::path::PathBuf::from(path))
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
pub fn get_path_from_file(_file: &File) -> io::Result<std::path::PathBuf> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "resolving a path from a handle is not supported on this platform",
    ))
}
