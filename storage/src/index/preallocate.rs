use std::io;
use tokio::fs::File;

/// Reserve `len` bytes of disk for `file` without changing its logical length.
///
/// Filesystems (and platforms) that cannot reserve space are treated as a successful no-op.
#[cfg(target_os = "linux")]
pub(super) fn preallocate(file: &File, len: u64) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    if len == 0 {
        return Ok(());
    }
    let len = libc::off_t::try_from(len)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "preallocation too large"))?;

    // SAFETY: the descriptor is owned by `file` and stays open for the duration of the call.
    let ret = unsafe { libc::fallocate(file.as_raw_fd(), libc::FALLOC_FL_KEEP_SIZE, 0, len) };
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EOPNOTSUPP) | Some(libc::ENOSYS) | Some(libc::ENODEV) => Ok(()),
        _ => Err(err),
    }
}

#[cfg(not(target_os = "linux"))]
pub(super) fn preallocate(_file: &File, _len: u64) -> io::Result<()> {
    Ok(())
}
