//! 迁移共享的文件系统工具
//!
//! - 目录条目错误的记录与跳过
//! - 目录大小统计与磁盘可用空间查询（迁移前空间预检）
//! - 原子写入（临时文件 + fsync + rename）
//! - 带 fsync 的文件复制（blob 搬迁）

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

/// 记录并跳过迭代中的错误，避免 `.flatten()` 静默丢弃
///
/// 适用于 `read_dir` / `WalkDir` 等迭代场景。
pub fn log_and_skip_entry_err<T, E: std::fmt::Display>(
    result: std::result::Result<T, E>,
) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("[FsCommon] Directory entry read error (skipped): {}", e);
            None
        }
    }
}

/// 递归统计目录下所有常规文件的字节数（不跟随符号链接）
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .follow_links(false)
        .into_iter()
        .filter_map(log_and_skip_entry_err)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// 获取路径所在磁盘的可用空间（字节）
///
/// 路径不存在时向上查找最近的已存在祖先目录。
pub fn get_available_disk_space(path: &Path) -> io::Result<u64> {
    let check_path = path
        .ancestors()
        .find(|p| p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));

    #[cfg(unix)]
    {
        get_disk_space_statvfs(&check_path)
    }

    #[cfg(not(unix))]
    {
        tracing::warn!(
            "[FsCommon] 当前平台不支持磁盘空间查询，跳过检查: {}",
            check_path.display()
        );
        Ok(u64::MAX)
    }
}

/// Unix: 使用 libc::statvfs 系统调用获取磁盘可用空间
///
/// f_bavail * f_frsize = 非特权用户可用的字节数。
#[cfg(unix)]
fn get_disk_space_statvfs(path: &Path) -> io::Result<u64> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("路径包含空字节，无法传递给 statvfs: {}", e),
        )
    })?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };

    if ret == 0 {
        #[allow(clippy::unnecessary_cast)]
        let available = stat.f_bavail as u64 * stat.f_frsize as u64;
        tracing::debug!(
            "[FsCommon] statvfs 成功: path={}, available={} bytes",
            path.display(),
            available
        );
        Ok(available)
    } else {
        Err(io::Error::last_os_error())
    }
}

/// fsync 目录，确保目录条目更新持久化（防止断电后目录项丢失）
pub fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}

/// 原子写入：先写临时文件并 fsync，再 rename 替换
pub fn atomic_write(target: &Path, content: &[u8]) -> io::Result<()> {
    let tmp = tmp_sibling(target);

    {
        let mut file = File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
    }

    if let Err(e) = fs::rename(&tmp, target) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    if let Some(parent) = target.parent() {
        sync_dir(parent);
    }
    Ok(())
}

/// 复制文件并刷盘：写入目标旁的临时文件后 rename，中途被杀不会留下半截文件
pub fn copy_file_synced(src: &Path, dst: &Path) -> io::Result<u64> {
    let tmp = tmp_sibling(dst);
    let copied = match fs::copy(src, &tmp) {
        Ok(n) => n,
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
    };

    File::open(&tmp)?.sync_all()?;

    if let Err(e) = fs::rename(&tmp, dst) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(copied)
}

fn tmp_sibling(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_replaces_content_and_leaves_no_tmp() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("state.json");
        atomic_write(&target, b"one").unwrap();
        atomic_write(&target, b"two").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"two");
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[test]
    fn copy_file_synced_preserves_bytes() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.bin");
        let dst = dir.path().join("b.bin");
        fs::write(&src, [0u8, 1, 2, 255]).unwrap();
        assert_eq!(copy_file_synced(&src, &dst).unwrap(), 4);
        assert_eq!(fs::read(&dst).unwrap(), [0u8, 1, 2, 255]);
        assert!(src.exists());
    }

    #[test]
    fn dir_size_counts_nested_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/one"), [0u8; 10]).unwrap();
        fs::write(dir.path().join("a/b/two"), [0u8; 5]).unwrap();
        assert_eq!(dir_size(dir.path()), 15);
    }

    #[test]
    fn available_space_for_missing_path_uses_ancestor() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("not/yet/created");
        assert!(get_available_disk_space(&missing).unwrap() > 0);
    }
}
