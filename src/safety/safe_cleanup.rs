//! Recursive removal that never follows symlinks or crosses filesystems.
//!
//! Sandboxed code controls the contents of its workspace, so a plain
//! `remove_dir_all` could be steered outside it. Every step here works
//! relative to an already-opened directory fd.

use crate::config::types::{Result, SandboxError};
use std::ffi::CStr;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

struct FdGuard(RawFd);

impl FdGuard {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for FdGuard {
    fn drop(&mut self) {
        if self.0 >= 0 {
            // SAFETY: fd was returned by open/openat and is owned by this guard.
            unsafe {
                libc::close(self.0);
            }
        }
    }
}

fn last_error(what: &str, name: &CStr) -> SandboxError {
    SandboxError::Filesystem(format!(
        "{} failed for {:?}: {}",
        what,
        name,
        std::io::Error::last_os_error()
    ))
}

fn open_dir_nofollow(path: &Path) -> Result<FdGuard> {
    let path_c = std::ffi::CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        SandboxError::Filesystem(format!("Path contains NUL byte: {}", path.display()))
    })?;

    // SAFETY: path_c is a valid NUL-terminated string.
    let fd = unsafe {
        libc::open(
            path_c.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
        )
    };
    if fd < 0 {
        return Err(last_error("open directory", &path_c));
    }
    Ok(FdGuard(fd))
}

fn fstatat_nofollow(parent_fd: RawFd, name: &CStr) -> Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    // SAFETY: st points to writable memory large enough for a stat struct.
    let rc = unsafe {
        libc::fstatat(
            parent_fd,
            name.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(last_error("fstatat", name));
    }
    // SAFETY: fstatat succeeded and initialized the struct.
    Ok(unsafe { st.assume_init() })
}

fn remove_entry_at(parent_fd: RawFd, name: &CStr, flags: i32) -> Result<()> {
    // SAFETY: name is NUL-terminated and parent_fd is an open directory.
    let rc = unsafe { libc::unlinkat(parent_fd, name.as_ptr(), flags) };
    if rc != 0 {
        return Err(last_error("unlinkat", name));
    }
    Ok(())
}

fn recurse_remove_dir(parent_fd: RawFd, name: &CStr, root_dev: libc::dev_t) -> Result<()> {
    // SAFETY: name is NUL-terminated and parent_fd is an open directory.
    let child_fd = unsafe {
        libc::openat(
            parent_fd,
            name.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
        )
    };
    if child_fd < 0 {
        return Err(last_error("openat", name));
    }
    let child = FdGuard(child_fd);

    // Read-only workspaces are chmod'ed 0555; entries cannot be unlinked
    // until the owner write bit is back.
    // SAFETY: child fd is an open directory owned by the guard.
    unsafe {
        libc::fchmod(child.as_raw_fd(), 0o700);
    }

    remove_dir_contents_fd(child.as_raw_fd(), root_dev)?;
    remove_entry_at(parent_fd, name, libc::AT_REMOVEDIR)
}

fn remove_dir_contents_fd(dir_fd: RawFd, root_dev: libc::dev_t) -> Result<()> {
    // SAFETY: dir_fd is an open directory; the duplicate is owned by the DIR stream.
    let iter_fd = unsafe { libc::dup(dir_fd) };
    if iter_fd < 0 {
        return Err(SandboxError::Filesystem(format!(
            "dup for directory iteration failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    // SAFETY: iter_fd is a valid directory fd; ownership moves to the stream.
    let dir = unsafe { libc::fdopendir(iter_fd) };
    if dir.is_null() {
        // SAFETY: fdopendir failed so iter_fd is still ours to close.
        unsafe {
            libc::close(iter_fd);
        }
        return Err(SandboxError::Filesystem(format!(
            "fdopendir failed: {}",
            std::io::Error::last_os_error()
        )));
    }

    // Collect first so unlinking cannot disturb the directory stream.
    let mut names = Vec::new();
    loop {
        // SAFETY: errno is thread-local.
        unsafe {
            *libc::__errno_location() = 0;
        }
        // SAFETY: dir is a valid, open DIR stream.
        let entry = unsafe { libc::readdir(dir) };
        if entry.is_null() {
            // SAFETY: errno is thread-local.
            let errno = unsafe { *libc::__errno_location() };
            // SAFETY: dir is open and closed exactly once here.
            unsafe {
                libc::closedir(dir);
            }
            if errno != 0 {
                return Err(SandboxError::Filesystem(format!(
                    "readdir failed: {}",
                    std::io::Error::from_raw_os_error(errno)
                )));
            }
            break;
        }

        // SAFETY: d_name is NUL-terminated for the lifetime of the entry.
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        let bytes = name.to_bytes();
        if bytes == b"." || bytes == b".." {
            continue;
        }
        names.push(name.to_owned());
    }

    for name in names {
        let st = fstatat_nofollow(dir_fd, &name)?;
        if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
            if st.st_dev != root_dev {
                return Err(SandboxError::Filesystem(format!(
                    "Refusing to cross filesystem boundary at directory {:?}",
                    name
                )));
            }
            recurse_remove_dir(dir_fd, &name, root_dev)?;
        } else {
            remove_entry_at(dir_fd, &name, 0)?;
        }
    }

    Ok(())
}

/// Remove a tree without following symlinks, using openat/fstatat/unlinkat.
/// Missing paths are not an error, so repeated calls are harmless.
pub fn remove_tree_secure(path: &Path) -> Result<()> {
    if std::fs::symlink_metadata(path).is_err() {
        return Ok(());
    }

    let parent = path.parent().ok_or_else(|| {
        SandboxError::Filesystem(format!("Cannot remove path without parent: {}", path.display()))
    })?;
    let name_os = path.file_name().ok_or_else(|| {
        SandboxError::Filesystem(format!(
            "Cannot remove path without file name: {}",
            path.display()
        ))
    })?;
    let name_c = std::ffi::CString::new(name_os.as_bytes()).map_err(|_| {
        SandboxError::Filesystem(format!("Path contains NUL byte: {}", path.display()))
    })?;

    let parent_fd = open_dir_nofollow(parent)?;
    let st = fstatat_nofollow(parent_fd.as_raw_fd(), &name_c)?;

    if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
        recurse_remove_dir(parent_fd.as_raw_fd(), &name_c, st.st_dev)
    } else {
        remove_entry_at(parent_fd.as_raw_fd(), &name_c, 0)
    }
}
