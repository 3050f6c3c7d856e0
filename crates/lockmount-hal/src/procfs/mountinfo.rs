//! Parsing helpers for `/proc/self/mountinfo` (and similar mountinfo files).

use crate::HalResult;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountInfo {
    pub mount_point: PathBuf,
    pub source: String,
}

pub fn parse_mountinfo(content: &str) -> Vec<MountInfo> {
    content
        .lines()
        .filter_map(|line| {
            // mountinfo format:
            //   <pre fields...> <mount point> <...> - <fstype> <source> <superopts>
            let (pre, post) = line.split_once(" - ")?;
            let pre_fields: Vec<&str> = pre.split_whitespace().collect();
            if pre_fields.len() < 5 {
                return None;
            }
            let source = unescape_mount_path(post.split_whitespace().nth(1)?);
            Some(MountInfo {
                mount_point: PathBuf::from(unescape_mount_path(pre_fields[4])),
                source,
            })
        })
        .collect()
}

/// Find the entry mounted at `path`. When the same path is stacked the last
/// (topmost) entry wins.
pub fn find_mount<'a>(path: &Path, entries: &'a [MountInfo]) -> Option<&'a MountInfo> {
    let target = normalize_path(path);
    entries
        .iter()
        .rev()
        .find(|entry| normalize_path(&entry.mount_point) == target)
}

pub fn read_mountinfo(path: &Path) -> HalResult<Vec<MountInfo>> {
    let content = fs::read_to_string(path)?;
    Ok(parse_mountinfo(&content))
}

pub fn unescape_mount_path(raw: &str) -> String {
    raw.replace("\\040", " ")
        .replace("\\011", "\t")
        .replace("\\012", "\n")
        .replace("\\134", "\\")
}

fn normalize_path(path: &Path) -> String {
    let s = path.to_string_lossy();
    if s.len() > 1 && s.ends_with('/') {
        s.trim_end_matches('/').to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_mountinfo_extracts_mountpoints() {
        let sample = "36 28 0:31 / / rw,relatime - ext4 /dev/sda3 rw\n".to_string()
            + "37 28 0:32 / /run/media/ana/USB rw,relatime - vfat /dev/sdb1 rw\n";
        let entries = parse_mountinfo(&sample);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].mount_point, PathBuf::from("/"));
        assert_eq!(entries[1].mount_point, PathBuf::from("/run/media/ana/USB"));
        assert_eq!(entries[1].source, "/dev/sdb1");
    }

    #[test]
    fn optional_fields_do_not_shift_source() {
        let sample =
            "90 28 8:17 / /media/backup rw,nosuid shared:45 master:1 - exfat /dev/sdb1 rw\n";
        let entries = parse_mountinfo(sample);
        assert_eq!(entries[0].mount_point, PathBuf::from("/media/backup"));
        assert_eq!(entries[0].source, "/dev/sdb1");
    }

    #[test]
    fn lines_without_separator_are_skipped() {
        let sample = "garbage line\n36 28 0:31 / / rw,relatime - ext4 /dev/sda3 rw\n";
        assert_eq!(parse_mountinfo(sample).len(), 1);
    }

    #[test]
    fn find_mount_ignores_trailing_slash() {
        let sample = "36 28 0:31 / /media/usb rw,relatime - ext4 /dev/sdc1 rw\n";
        let entries = parse_mountinfo(sample);
        assert!(find_mount(Path::new("/media/usb/"), &entries).is_some());
        assert!(find_mount(Path::new("/media"), &entries).is_none());
    }

    #[test]
    fn read_mountinfo_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mountinfo");
        fs::write(&path, "37 28 0:32 / /media/USB rw - vfat /dev/sdb1 rw\n").unwrap();
        let entries = read_mountinfo(&path).unwrap();
        assert_eq!(entries[0].source, "/dev/sdb1");

        assert!(read_mountinfo(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn find_mount_prefers_topmost_entry() {
        let sample = "36 28 0:31 / /media/usb rw - ext4 /dev/sdc1 rw\n\
                      37 36 0:32 / /media/usb rw - vfat /dev/sdd1 rw\n";
        let entries = parse_mountinfo(sample);
        let found = find_mount(Path::new("/media/usb"), &entries).unwrap();
        assert_eq!(found.source, "/dev/sdd1");
    }

    #[test]
    fn mountinfo_unescapes_paths() {
        let sample = "36 28 0:31 / /media/My\\040Disk rw,relatime - ext4 /dev/sda3 rw\n";
        let entries = parse_mountinfo(sample);
        assert_eq!(entries[0].mount_point, PathBuf::from("/media/My Disk"));
    }
}
