//! 文件持久化的键值偏好存储（prefs.json）。
//!
//! 并发模型：
//! - 读取方拿到的是整份快照（`Arc<BTreeMap>`），不会看到写了一半的状态
//! - 写入方串行化：复制快照 → 修改 → 原子落盘（临时文件 + rename）→ 替换快照
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use uuid::Uuid;

type Entries = BTreeMap<String, String>;

/// 键值偏好存储。
pub struct PrefsStore {
    path: PathBuf,
    entries: RwLock<Arc<Entries>>,
    write_gate: Mutex<()>,
}

impl PrefsStore {
    /// 打开（或新建）偏好文件。
    ///
    /// 异常处理：
    /// - 文件存在但无法读取或不是合法 JSON 对象时返回错误
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("解析偏好文件失败: {}", path.display()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Entries::new(),
            Err(e) => return Err(e).with_context(|| format!("读取偏好文件失败: {}", path.display())),
        };
        Ok(Self {
            path,
            entries: RwLock::new(Arc::new(entries)),
            write_gate: Mutex::new(()),
        })
    }

    /// 当前快照。
    pub fn snapshot(&self) -> Arc<Entries> {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.snapshot().get(key).cloned()
    }

    /// 以一次原子替换的方式修改多个键。
    ///
    /// 说明：
    /// - 落盘失败时内存快照保持不变
    pub async fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Entries),
    {
        let _gate = self.write_gate.lock().await;
        let mut next = (*self.snapshot()).clone();
        mutate(&mut next);
        let bytes = serde_json::to_vec_pretty(&next).context("序列化偏好失败")?;
        write_atomic(&self.path, &bytes)
            .await
            .with_context(|| format!("写入偏好文件失败: {}", self.path.display()))?;
        *self.entries.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(next);
        Ok(())
    }
}

/// 原子写文件：先写同目录临时文件，再 rename 覆盖目标。
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "data".to_string());
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn updates_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prefs.json");
        let prefs = PrefsStore::open(&path).await.unwrap();
        assert!(prefs.get("a").is_none());

        prefs
            .update(|m| {
                m.insert("a".into(), "1".into());
                m.insert("b".into(), "2".into());
            })
            .await
            .unwrap();
        let reopened = PrefsStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("a").as_deref(), Some("1"));
        assert_eq!(reopened.get("b").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn snapshot_taken_before_update_is_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let prefs = PrefsStore::open(dir.path().join("prefs.json")).await.unwrap();
        prefs
            .update(|m| {
                m.insert("k".into(), "v".into());
            })
            .await
            .unwrap();
        let before = prefs.snapshot();
        prefs.update(|m| m.clear()).await.unwrap();
        assert_eq!(before.get("k").map(String::as_str), Some("v"));
        assert!(prefs.snapshot().is_empty());
    }

    #[tokio::test]
    async fn atomic_write_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        write_atomic(&path, b"{}").await.unwrap();
        write_atomic(&path, b"{\"x\":1}").await.unwrap();
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["state.json".to_string()]);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"x\":1}");
    }
}
