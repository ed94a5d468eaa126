/// File identity helpers. Rotation is detected by comparing the inode a
/// path currently resolves to against the inode a reader has open.
use std::os::unix::fs::MetadataExt;
use std::path::Path;

/// Inode the path currently resolves to, or `None` if it does not exist.
pub fn inode_of(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.ino())
}

/// Inode of an already-open file.
pub fn inode_of_file(file: &std::fs::File) -> std::io::Result<u64> {
    Ok(file.metadata()?.ino())
}

/// Returns true when `path` no longer resolves to `inode`.
pub fn moved(path: &Path, inode: u64) -> bool {
    inode_of(path) != Some(inode)
}

/// Current length of the file at `path`.
pub fn file_len(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|m| m.len())
}
