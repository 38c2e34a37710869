//! Thin wrappers over the filesystem calls the block manager depends on:
//! hole punching, block-size probing, sparse-range queries, and the kernel
//! capability probe that decides whether per-container block limits are
//! needed at all.

use std::fs::File;
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Fallback when the filesystem block size cannot be probed.
pub const DEFAULT_FS_BLOCK_SIZE: u64 = 4096;

/// Known-good upper bounds on blocks per container for kernels whose hole
/// punching corrupts files past a per-filesystem-block-size threshold,
/// keyed by filesystem block size.
const PER_FS_BLOCK_SIZE_BLOCK_LIMITS: [(u64, u64); 3] = [(1024, 673), (2048, 1353), (4096, 2712)];

/// Rounds `value` up to the next multiple of `align`.
pub fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align > 0);
    value.div_ceil(align) * align
}

/// Rounds `value` down to a multiple of `align`.
pub fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align > 0);
    value / align * align
}

/// Returns the block limit for the given filesystem block size: the entry
/// with the largest key not exceeding `fs_block_size`, or the smallest
/// recorded limit if the block size is below every key.
pub fn lookup_block_limit(fs_block_size: u64) -> u64 {
    PER_FS_BLOCK_SIZE_BLOCK_LIMITS
        .iter()
        .rev()
        .find(|(size, _)| *size <= fs_block_size)
        .map(|(_, limit)| *limit)
        .unwrap_or(PER_FS_BLOCK_SIZE_BLOCK_LIMITS[0].1)
}

/// Returns the block size of the filesystem containing `path`.
#[cfg(unix)]
pub fn fs_block_size(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.f_bsize as u64)
}

#[cfg(not(unix))]
pub fn fs_block_size(_path: &Path) -> io::Result<u64> {
    Ok(DEFAULT_FS_BLOCK_SIZE)
}

/// Deallocates `[offset, offset + length)` of `file` without changing its
/// length. The caller is responsible for rounding the range to filesystem
/// block boundaries so the space is actually released.
#[cfg(target_os = "linux")]
pub fn punch_hole(file: &File, offset: u64, length: u64) -> io::Result<()> {
    if length == 0 {
        return Ok(());
    }
    let rc = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            length as libc::off_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn punch_hole(_file: &File, _offset: u64, _length: u64) -> io::Result<()> {
    // No portable deallocation call; the range stays as reclaimable garbage.
    Ok(())
}

/// Returns whether any byte of `[start, end)` is backed by allocated data,
/// i.e. the range is not already a hole. Filesystems without sparse-file
/// queries report true, so callers re-punch unnecessarily but harmlessly.
#[cfg(target_os = "linux")]
pub fn range_has_data(file: &File, start: u64, end: u64) -> io::Result<bool> {
    if start >= end {
        return Ok(false);
    }
    let off = unsafe { libc::lseek(file.as_raw_fd(), start as libc::off_t, libc::SEEK_DATA) };
    if off < 0 {
        let err = io::Error::last_os_error();
        // ENXIO: no data at or beyond start.
        if err.raw_os_error() == Some(libc::ENXIO) {
            return Ok(false);
        }
        return Err(err);
    }
    Ok((off as u64) < end)
}

#[cfg(not(target_os = "linux"))]
pub fn range_has_data(_file: &File, start: u64, end: u64) -> io::Result<bool> {
    Ok(start < end)
}

/// Syncs a directory so that entries created or renamed within it survive a
/// crash.
pub fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

/// Returns the running kernel's release string, e.g. "5.15.0-91-generic".
#[cfg(unix)]
pub fn kernel_release() -> Option<String> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return None;
    }
    let release = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) };
    release.to_str().ok().map(|s| s.to_string())
}

#[cfg(not(unix))]
pub fn kernel_release() -> Option<String> {
    None
}

/// Returns whether the given kernel release has the el6 hole-punching bug:
/// el6 kernels older than 2.6.32-674 corrupt a file once hole punching
/// crosses a block-count threshold that depends on the filesystem block
/// size.
pub fn is_buggy_el6_kernel(release: &str) -> bool {
    release.contains(".el6.") && natural_lt(release, "2.6.32-674")
}

/// Compares two release strings treating digit runs as numbers, so that
/// "2.6.32-99" sorts before "2.6.32-674".
fn natural_lt(a: &str, b: &str) -> bool {
    let mut ai = a.as_bytes().iter().peekable();
    let mut bi = b.as_bytes().iter().peekable();

    loop {
        match (ai.peek(), bi.peek()) {
            (None, None) => return false,
            (None, Some(_)) => return true,
            (Some(_), None) => return false,
            (Some(&&ac), Some(&&bc)) => {
                if ac.is_ascii_digit() && bc.is_ascii_digit() {
                    let an = take_number(&mut ai);
                    let bn = take_number(&mut bi);
                    if an != bn {
                        return an < bn;
                    }
                } else {
                    if ac != bc {
                        return ac < bc;
                    }
                    ai.next();
                    bi.next();
                }
            }
        }
    }
}

fn take_number<'a, I: Iterator<Item = &'a u8>>(iter: &mut std::iter::Peekable<I>) -> u64 {
    let mut n: u64 = 0;
    while let Some(&&c) = iter.peek() {
        if !c.is_ascii_digit() {
            break;
        }
        n = n.saturating_mul(10).saturating_add((c - b'0') as u64);
        iter.next();
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_align() {
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(align_down(4097, 4096), 4096);
        assert_eq!(align_down(4095, 4096), 0);
    }

    #[test]
    fn test_lookup_block_limit() {
        assert_eq!(lookup_block_limit(1024), 673);
        assert_eq!(lookup_block_limit(2048), 1353);
        assert_eq!(lookup_block_limit(4096), 2712);
        // Between entries: floor.
        assert_eq!(lookup_block_limit(3000), 1353);
        // Above the largest entry: floor is the largest.
        assert_eq!(lookup_block_limit(65536), 2712);
        // Below the smallest entry: smallest recorded limit.
        assert_eq!(lookup_block_limit(512), 673);
    }

    #[test]
    fn test_buggy_el6_kernel_detection() {
        assert!(is_buggy_el6_kernel("2.6.32-123.0.0.el6.x86_64"));
        assert!(is_buggy_el6_kernel("2.6.32-673.0.0.el6.x86_64"));
        // The fix landed in 2.6.32-674.
        assert!(!is_buggy_el6_kernel("2.6.32-674.0.0.el6.x86_64"));
        assert!(!is_buggy_el6_kernel("2.6.33-100.0.0.el6.x86_64"));
        // Numeric compare, not lexicographic: 99 < 674.
        assert!(is_buggy_el6_kernel("2.6.32-99.0.0.el6.x86_64"));
        // Not an el6 kernel.
        assert!(!is_buggy_el6_kernel("3.10.0-123.el7.x86_64"));
        assert!(!is_buggy_el6_kernel("5.15.0-91-generic"));
    }

    #[test]
    fn test_fs_block_size_probe() {
        let dir = tempfile::tempdir().expect("tempdir");
        let size = fs_block_size(dir.path()).expect("statvfs");
        assert!(size >= 512);
        assert!(size.is_power_of_two());
    }

    #[test]
    fn test_punch_hole_keeps_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sparse");
        let mut file = std::fs::File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .expect("open");
        file.write_all(&vec![0xABu8; 16384]).expect("write");
        file.sync_all().expect("sync");

        punch_hole(&file, 4096, 8192).expect("punch");
        assert_eq!(file.metadata().expect("metadata").len(), 16384);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_range_has_data() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sparse");
        let mut file = std::fs::File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .expect("open");
        file.write_all(&vec![0xCDu8; 8192]).expect("write");
        file.sync_all().expect("sync");

        assert!(range_has_data(&file, 0, 8192).expect("query"));
        punch_hole(&file, 0, 8192).expect("punch");
        assert!(!range_has_data(&file, 0, 8192).expect("query"));
    }
}
