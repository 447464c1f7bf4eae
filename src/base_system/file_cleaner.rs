//! 缓存与临时文件清理。

use std::fs;
use std::io;
use std::path::Path;

use tracing::debug;

pub fn is_empty_dir(path: impl AsRef<Path>) -> io::Result<bool> {
    let path = path.as_ref();
    let mut entries = fs::read_dir(path)?;
    Ok(entries.next().is_none())
}

/// 删除整个目录；目录不存在视为成功。
pub fn remove_dir_quietly(path: impl AsRef<Path>) -> io::Result<()> {
    let path = path.as_ref();
    match fs::remove_dir_all(path) {
        Ok(()) => {
            debug!("已清理: {}", path.display());
            Ok(())
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// 目录为空时删除它（用于 `.staging` 根目录）。
pub fn prune_if_empty(path: impl AsRef<Path>) {
    let path = path.as_ref();
    if matches!(is_empty_dir(path), Ok(true)) {
        let _ = fs::remove_dir(path);
    }
}
