//! Utility functions for file names, paths, disk space and formatting

use std::path::{Component, Path, PathBuf};

/// Characters rejected by at least one common filesystem
const ILLEGAL_FILENAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Default maximum length of a sanitized file name stem
pub const DEFAULT_MAX_FILENAME_LEN: usize = 200;

/// Replace characters that are illegal on common filesystems and cap the length
///
/// Illegal characters and ASCII control characters become `_`. Truncation counts
/// characters, not bytes, so multi-byte names are never split mid-character.
///
/// # Examples
///
/// ```
/// use ripstream_dl::utils::sanitize_file_name;
///
/// assert_eq!(sanitize_file_name("AC/DC: Live?", 200), "AC_DC_ Live_");
/// assert_eq!(sanitize_file_name("abcdef", 3), "abc");
/// ```
#[must_use]
pub fn sanitize_file_name(name: &str, max_len: usize) -> String {
    name.chars()
        .map(|c| {
            if ILLEGAL_FILENAME_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .take(max_len)
        .collect()
}

/// Lexically normalize a path into an absolute form
///
/// Relative paths are resolved against the current directory, `.` components are
/// dropped and `..` pops the previous component. Symlinks are not resolved, so the
/// target does not need to exist.
pub fn normalize_path(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = std::path::absolute(path)?;
    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

/// Format a byte count with a binary unit (B, KB, MB, GB)
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    let size = bytes as f64;
    if size < KB {
        format!("{bytes} B")
    } else if size < KB * KB {
        format!("{:.1} KB", size / KB)
    } else if size < KB * KB * KB {
        format!("{:.1} MB", size / (KB * KB))
    } else {
        format!("{:.1} GB", size / (KB * KB * KB))
    }
}

/// Format a throughput in bytes per second
#[must_use]
pub fn format_speed(bytes_per_second: f64) -> String {
    const KB: f64 = 1024.0;
    let speed = bytes_per_second;
    if speed < KB {
        format!("{speed:.1} B/s")
    } else if speed < KB * KB {
        format!("{:.1} KB/s", speed / KB)
    } else if speed < KB * KB * KB {
        format!("{:.1} MB/s", speed / (KB * KB))
    } else {
        format!("{:.1} GB/s", speed / (KB * KB * KB))
    }
}

/// Get available disk space for a given path
///
/// Uses platform-specific APIs to query filesystem statistics:
/// - Linux / macOS: statvfs
/// - Windows: GetDiskFreeSpaceExW
///
/// Returns the space available to unprivileged users, in bytes.
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid NUL-terminated string, stat is zero-initialized
        // and only read after statvfs reports success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            // f_bavail: blocks available to unprivileged users; f_frsize: fragment size
            #[allow(clippy::unnecessary_cast)]
            let available_bytes = (stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64);
            Ok(available_bytes)
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is NUL-terminated and all out-pointers reference live u64s.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut total_bytes: u64 = 0;
            let mut total_free_bytes: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut total_bytes as *mut u64 as *mut _,
                &mut total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = path;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "Disk space checking is not supported on this platform",
        ))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sanitize_replaces_every_illegal_character() {
        assert_eq!(
            sanitize_file_name(r#"a<b>c:d"e/f\g|h?i*j"#, 200),
            "a_b_c_d_e_f_g_h_i_j"
        );
    }

    #[test]
    fn sanitize_replaces_control_characters() {
        assert_eq!(sanitize_file_name("tab\there\n", 200), "tab_here_");
    }

    #[test]
    fn sanitize_truncates_by_characters() {
        let name = "é".repeat(300);
        let sanitized = sanitize_file_name(&name, 200);
        assert_eq!(sanitized.chars().count(), 200);
    }

    #[test]
    fn normalize_resolves_dot_segments() {
        let temp_dir = TempDir::new().unwrap();
        let messy = temp_dir.path().join("a").join(".").join("b").join("..").join("c");
        let normalized = normalize_path(&messy).unwrap();
        assert_eq!(normalized, temp_dir.path().join("a").join("c"));
    }

    #[test]
    fn normalize_makes_relative_paths_absolute() {
        let normalized = normalize_path(Path::new("covers/cover.jpg")).unwrap();
        assert!(normalized.is_absolute());
        assert!(normalized.ends_with("covers/cover.jpg"));
    }

    #[test]
    fn format_bytes_units() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn format_speed_units() {
        assert_eq!(format_speed(100.0), "100.0 B/s");
        assert_eq!(format_speed(1536.0), "1.5 KB/s");
        assert_eq!(format_speed(2.0 * 1024.0 * 1024.0), "2.0 MB/s");
    }

    #[test]
    fn test_get_available_space_valid_path() {
        let temp_dir = TempDir::new().unwrap();
        let space = get_available_space(temp_dir.path()).unwrap();
        assert!(space > 0, "temp volume should report free space");
    }

    #[test]
    fn test_get_available_space_nonexistent_path() {
        let result = get_available_space(Path::new("/definitely/not/a/real/path/xyz"));
        assert!(result.is_err());
    }
}
