//! 小程序包仓库：安装、卸载与磁盘布局。
//!
//! 职责：
//! - 从内置资源目录批量安装（`<app_id>.zip` 或含 manifest.json 的目录）
//! - 从远程目录服务下载的压缩包安装
//! - 读取已安装包的清单、图标与桥接脚本
//!
//! 原子性约定：
//! - 所有解压/复制都先落到 `<install_root>/.staging/`，校验通过后再 rename 到位
//! - 覆盖安装时旧目录先移入暂存区再删除，扫描方不会看到半成品目录
//! - 替换与卸载持有布局写锁，[`PackageSource`] 的读取持有读锁；
//!   覆盖安装两次 rename 之间包目录短暂缺失的窗口对读取方不可见
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::cmp::Ordering;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use miniwallet_core::error::MiniAppError;
use miniwallet_core::manifest::{compare_versions, MiniAppManifest, MiniAppType};
use miniwallet_core::paths;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zip::ZipArchive;

/// 已安装包的只读访问接口（扫描器依赖此接口，便于测试替换）。
#[async_trait]
pub trait PackageSource: Send + Sync {
    /// 枚举已安装的 app_id；空列表是合法结果。
    async fn list_installed_ids(&self) -> Result<Vec<String>, MiniAppError>;
    /// 读取并校验单个包的清单。
    async fn load_manifest(&self, app_id: &str) -> Result<MiniAppManifest, MiniAppError>;
    /// 约定位置的图标（不存在时为 `None`）。
    async fn icon_path(&self, app_id: &str) -> Option<PathBuf>;
}

/// 远程目录服务返回的条目。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogEntry {
    pub app_id: String,
    pub file_name: String,
    #[serde(rename = "type")]
    pub app_type: MiniAppType,
    pub created_at: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub icon_url: Option<String>,
}

/// 远程目录服务客户端（浏览/下载界面在宿主核心之外实现）。
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn fetch_entry(&self, app_id: &str) -> Result<CatalogEntry>;
    /// 下载压缩包到本地，返回文件路径。
    async fn download(&self, entry: &CatalogEntry) -> Result<PathBuf>;
}

/// 单个包的安装失败记录。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallFailure {
    pub app_id: String,
    pub reason: String,
}

/// 批量安装结果。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReport {
    pub installed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<InstallFailure>,
}

impl InstallReport {
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty() && !(self.installed.is_empty() && self.skipped.is_empty())
    }
}

/// 内置资源目录中的一个候选包。
#[derive(Debug, Clone)]
enum BundledPackage {
    Archive(PathBuf),
    Directory(PathBuf),
}

/// 小程序包仓库。
#[derive(Debug, Clone)]
pub struct PackageStore {
    install_root: PathBuf,
    layout: Arc<RwLock<()>>,
}

impl PackageStore {
    pub fn new(install_root: impl Into<PathBuf>) -> Self {
        Self {
            install_root: install_root.into(),
            layout: Arc::new(RwLock::new(())),
        }
    }

    pub fn install_root(&self) -> &Path {
        &self.install_root
    }

    /// 包目录（不检查是否存在）。
    pub fn package_dir(&self, app_id: &str) -> PathBuf {
        paths::package_dir(&self.install_root, app_id)
    }

    /// 从内置资源目录批量安装。
    ///
    /// 参数：
    /// - `bundle_dir`：内置资源目录，包含 `<app_id>.zip` 或 `<app_id>/manifest.json`
    ///
    /// 规则：
    /// - 已安装且内置版本不高于已安装版本：跳过
    /// - 内置版本更高：覆盖安装（原子替换）
    /// - 单个包失败只记录到报告，不影响其他包
    ///
    /// 异常处理：
    /// - 资源目录无法读取：[`MiniAppError::InstallFailed`]
    /// - 存在候选包但全部失败：返回第一个失败（其余已记录日志）
    pub async fn install_from_bundled_assets(&self, bundle_dir: &Path) -> Result<InstallReport, MiniAppError> {
        let candidates = list_bundled(bundle_dir)
            .map_err(|e| MiniAppError::install_failed(bundle_dir.display().to_string(), format!("{e:#}")))?;
        info!(count = candidates.len(), dir = %bundle_dir.display(), "开始安装内置小程序");

        let mut report = InstallReport::default();
        let mut first_error = None;
        for (app_id, package) in candidates {
            match self.install_bundled_one(&app_id, package).await {
                Ok(true) => report.installed.push(app_id),
                Ok(false) => report.skipped.push(app_id),
                Err(e) => {
                    warn!(app_id = %app_id, error = %e, "内置小程序安装失败，继续处理其他包");
                    report.failed.push(InstallFailure {
                        app_id,
                        reason: e.to_string(),
                    });
                    first_error.get_or_insert(e);
                }
            }
        }

        if report.installed.is_empty() && report.skipped.is_empty() {
            if let Some(e) = first_error {
                return Err(e);
            }
        }
        info!(
            installed = report.installed.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            "内置小程序安装结束"
        );
        Ok(report)
    }

    async fn install_bundled_one(&self, app_id: &str, package: BundledPackage) -> Result<bool, MiniAppError> {
        if !paths::is_valid_app_id(app_id) {
            return Err(MiniAppError::install_failed(app_id, "非法的 app_id"));
        }
        let installed = match self.load_manifest(app_id).await {
            Ok(manifest) => Some(manifest),
            Err(MiniAppError::ManifestNotFound(_)) => None,
            Err(e) => {
                warn!(app_id = %app_id, error = %e, "已安装清单无效，将重新安装");
                None
            }
        };

        let root = self.install_root.clone();
        let layout = self.layout.clone();
        let id = app_id.to_string();
        run_blocking(app_id, move || {
            let bundled = match &package {
                BundledPackage::Archive(path) => read_archive_manifest(path)?,
                BundledPackage::Directory(dir) => read_manifest_file(&dir.join(paths::MANIFEST_FILE_NAME))?,
            };
            if let Some(current) = &installed {
                if compare_versions(&bundled.version, &current.version) != Ordering::Greater {
                    debug!(app_id = %id, version = %current.version, "已安装相同或更高版本，跳过");
                    return Ok(false);
                }
                info!(app_id = %id, from = %current.version, to = %bundled.version, "升级内置小程序");
            }
            match &package {
                BundledPackage::Archive(path) => extract_and_swap(&root, &id, path, &layout)?,
                BundledPackage::Directory(dir) => copy_and_swap(&root, &id, dir, &layout)?,
            };
            Ok(true)
        })
        .await
    }

    /// 从本地压缩包安装（远程目录服务下载结果）。
    ///
    /// 异常处理：
    /// - 压缩包损坏、缺少清单、清单 app_id 与目标不符、IO 失败：[`MiniAppError::InstallFailed`]
    pub async fn install_from_archive(&self, app_id: &str, archive: &Path) -> Result<MiniAppManifest, MiniAppError> {
        if !paths::is_valid_app_id(app_id) {
            return Err(MiniAppError::install_failed(app_id, "非法的 app_id"));
        }
        let root = self.install_root.clone();
        let layout = self.layout.clone();
        let id = app_id.to_string();
        let archive = archive.to_path_buf();
        let manifest =
            run_blocking(app_id, move || extract_and_swap(&root, &id, &archive, &layout)).await?;
        info!(app_id = %app_id, version = %manifest.version, "小程序安装完成");
        Ok(manifest)
    }

    /// 通过目录服务下载并安装。
    pub async fn install_from_remote(
        &self,
        app_id: &str,
        client: &dyn CatalogClient,
    ) -> Result<MiniAppManifest, MiniAppError> {
        let entry = client
            .fetch_entry(app_id)
            .await
            .map_err(|e| MiniAppError::install_failed(app_id, format!("查询目录服务失败: {e:#}")))?;
        if entry.app_id != app_id {
            return Err(MiniAppError::install_failed(
                app_id,
                format!("目录服务返回了其他小程序: {}", entry.app_id),
            ));
        }
        if !entry.file_name.ends_with(paths::ZIP_EXTENSION) {
            warn!(app_id = %app_id, file = %entry.file_name, "目录条目文件名不是 .zip，仍按压缩包处理");
        }
        let archive = client
            .download(&entry)
            .await
            .map_err(|e| MiniAppError::install_failed(app_id, format!("下载失败: {e:#}")))?;
        self.install_from_archive(app_id, &archive).await
    }

    /// 卸载（幂等）。
    ///
    /// 返回值：
    /// - `true`：删除了包目录
    /// - `false`：包本就不存在
    pub async fn uninstall(&self, app_id: &str) -> Result<bool, MiniAppError> {
        if !paths::is_valid_app_id(app_id) {
            return Ok(false);
        }
        let dir = self.package_dir(app_id);
        let _layout = self.layout.write().await;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(app_id = %app_id, "小程序已卸载");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(MiniAppError::UninstallFailed {
                app_id: app_id.to_string(),
                source,
            }),
        }
    }

    /// 读取清单声明的桥接脚本（未声明时为 `None`）。
    pub async fn load_bridge_script(&self, app_id: &str) -> Result<Option<String>, MiniAppError> {
        let manifest = self.load_manifest(app_id).await?;
        let Some(bridge) = manifest.bridge else {
            return Ok(None);
        };
        let path = paths::resolve_within(&self.package_dir(app_id), &bridge.script)
            .map_err(|e| MiniAppError::ManifestInvalid(format!("bridge.script 无效: {e}")))?;
        match tokio::fs::read_to_string(&path).await {
            Ok(script) => Ok(Some(script)),
            Err(e) => Err(MiniAppError::ManifestInvalid(format!(
                "读取桥接脚本失败 {}: {e}",
                path.display()
            ))),
        }
    }
}

#[async_trait]
impl PackageSource for PackageStore {
    async fn list_installed_ids(&self) -> Result<Vec<String>, MiniAppError> {
        let _layout = self.layout.read().await;
        let mut entries = match tokio::fs::read_dir(&self.install_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MiniAppError::ScanFailed(e)),
        };
        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(MiniAppError::ScanFailed)? {
            let file_type = entry.file_type().await.map_err(MiniAppError::ScanFailed)?;
            if !file_type.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if paths::is_valid_app_id(&name) {
                ids.push(name);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn load_manifest(&self, app_id: &str) -> Result<MiniAppManifest, MiniAppError> {
        if !paths::is_valid_app_id(app_id) {
            return Err(MiniAppError::ManifestNotFound(app_id.to_string()));
        }
        let path = self.package_dir(app_id).join(paths::MANIFEST_FILE_NAME);
        let _layout = self.layout.read().await;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(MiniAppError::ManifestNotFound(app_id.to_string()))
            }
            Err(e) => {
                return Err(MiniAppError::ManifestInvalid(format!(
                    "读取 {} 失败: {e}",
                    path.display()
                )))
            }
        };
        MiniAppManifest::parse(&bytes)
    }

    async fn icon_path(&self, app_id: &str) -> Option<PathBuf> {
        let path = paths::resolve_within(&self.package_dir(app_id), paths::ICON_PATH).ok()?;
        let _layout = self.layout.read().await;
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Some(path),
            _ => None,
        }
    }
}

async fn run_blocking<T, F>(app_id: &str, work: F) -> Result<T, MiniAppError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(MiniAppError::install_failed(app_id, format!("{e:#}"))),
        Err(e) => Err(MiniAppError::install_failed(app_id, format!("安装任务异常退出: {e}"))),
    }
}

/// 列出内置资源目录中的候选包（按 app_id 排序）。
fn list_bundled(bundle_dir: &Path) -> Result<Vec<(String, BundledPackage)>> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(bundle_dir).with_context(|| format!("读取目录失败: {}", bundle_dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type()?.is_dir() {
            if path.join(paths::MANIFEST_FILE_NAME).is_file() {
                out.push((name, BundledPackage::Directory(path)));
            }
        } else if let Some(stem) = name.strip_suffix(paths::ZIP_EXTENSION) {
            out.push((stem.to_string(), BundledPackage::Archive(path)));
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// macOS 打包时夹带的元数据条目。
fn is_mac_metadata(name: &str) -> bool {
    name.starts_with("__MACOSX/") || name.contains("/__MACOSX/") || name.rsplit('/').next() == Some(".DS_Store")
}

fn read_manifest_file(path: &Path) -> Result<MiniAppManifest> {
    let bytes = std::fs::read(path).with_context(|| format!("读取清单失败: {}", path.display()))?;
    Ok(MiniAppManifest::parse(&bytes)?)
}

fn open_archive(path: &Path) -> Result<ZipArchive<File>> {
    let file = File::open(path).with_context(|| format!("打开压缩包失败: {}", path.display()))?;
    ZipArchive::new(file).with_context(|| format!("不是合法的 zip 压缩包: {}", path.display()))
}

/// 不解压整个包，直接读取压缩包中的清单（根目录或唯一顶层目录下）。
fn read_archive_manifest(path: &Path) -> Result<MiniAppManifest> {
    let mut archive = open_archive(path)?;
    let candidate = archive
        .file_names()
        .filter(|name| !is_mac_metadata(name))
        .filter(|name| {
            *name == paths::MANIFEST_FILE_NAME
                || name
                    .strip_suffix(paths::MANIFEST_FILE_NAME)
                    .is_some_and(|prefix| prefix.ends_with('/') && prefix.matches('/').count() == 1)
        })
        .min_by_key(|name| name.len())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("压缩包中缺少 {}", paths::MANIFEST_FILE_NAME))?;
    let mut entry = archive.by_name(&candidate)?;
    let mut bytes = Vec::new();
    entry.read_to_end(&mut bytes)?;
    Ok(MiniAppManifest::parse(&bytes)?)
}

/// 暂存目录守卫：离开作用域时删除。
struct StagingDir(PathBuf);

impl StagingDir {
    fn create(install_root: &Path, app_id: &str) -> Result<Self> {
        let dir = paths::staging_root(install_root).join(format!("{app_id}-{}", Uuid::new_v4()));
        paths::ensure_dir(&dir)?;
        Ok(Self(dir))
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// 校验压缩包 → 解压到暂存区 → 校验清单 → 原子替换。
fn extract_and_swap(
    install_root: &Path,
    app_id: &str,
    archive_path: &Path,
    layout: &RwLock<()>,
) -> Result<MiniAppManifest> {
    let mut archive = open_archive(archive_path)?;
    let staging = StagingDir::create(install_root, app_id)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let name = entry.name().to_string();
        if is_mac_metadata(&name) {
            continue;
        }
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| anyhow!("压缩包条目路径越界: {name}"))?;
        let out_path = staging.0.join(relative);
        if entry.is_dir() {
            paths::ensure_dir(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            paths::ensure_dir(parent)?;
        }
        let mut out = File::create(&out_path).with_context(|| format!("创建文件失败: {}", out_path.display()))?;
        io::copy(&mut entry, &mut out).with_context(|| format!("解压条目失败: {name}"))?;
    }

    let package_root = locate_package_root(&staging.0)?;
    let manifest = read_manifest_file(&package_root.join(paths::MANIFEST_FILE_NAME))?;
    if manifest.app_id != app_id {
        return Err(anyhow!("清单 app_id 不一致: 期望 {app_id}，实际 {}", manifest.app_id));
    }
    swap_into_place(install_root, app_id, &package_root, layout)?;
    Ok(manifest)
}

/// 复制内置目录到暂存区后原子替换。
fn copy_and_swap(
    install_root: &Path,
    app_id: &str,
    src: &Path,
    layout: &RwLock<()>,
) -> Result<MiniAppManifest> {
    let staging = StagingDir::create(install_root, app_id)?;
    let package_root = staging.0.join(app_id);
    copy_recursively(src, &package_root)?;
    let manifest = read_manifest_file(&package_root.join(paths::MANIFEST_FILE_NAME))?;
    if manifest.app_id != app_id {
        return Err(anyhow!("清单 app_id 不一致: 期望 {app_id}，实际 {}", manifest.app_id));
    }
    swap_into_place(install_root, app_id, &package_root, layout)?;
    Ok(manifest)
}

fn copy_recursively(src: &Path, dst: &Path) -> Result<()> {
    paths::ensure_dir(dst)?;
    for entry in std::fs::read_dir(src).with_context(|| format!("读取目录失败: {}", src.display()))? {
        let entry = entry?;
        let name = entry.file_name();
        if name == ".DS_Store" || name == "__MACOSX" {
            continue;
        }
        let from = entry.path();
        let to = dst.join(&name);
        if entry.file_type()?.is_dir() {
            copy_recursively(&from, &to)?;
        } else {
            std::fs::copy(&from, &to).with_context(|| format!("复制文件失败: {} -> {}", from.display(), to.display()))?;
        }
    }
    Ok(())
}

/// 清单位于解压根目录，或位于唯一的顶层子目录中。
fn locate_package_root(staging: &Path) -> Result<PathBuf> {
    if staging.join(paths::MANIFEST_FILE_NAME).is_file() {
        return Ok(staging.to_path_buf());
    }
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(staging)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    match dirs.as_slice() {
        [single] if single.join(paths::MANIFEST_FILE_NAME).is_file() => Ok(single.clone()),
        _ => Err(anyhow!("压缩包中缺少 {}", paths::MANIFEST_FILE_NAME)),
    }
}

/// 将准备好的包目录原子替换到 `<install_root>/<app_id>`。
///
/// 覆盖安装：旧目录先 rename 到暂存区，新目录 rename 到位后再删除旧目录；
/// 第二步失败时把旧目录移回。两次 rename 都在布局写锁内完成。
///
/// 只能在阻塞线程中调用。
fn swap_into_place(
    install_root: &Path,
    app_id: &str,
    prepared: &Path,
    layout: &RwLock<()>,
) -> Result<()> {
    let _layout = layout.blocking_write();
    let target = paths::package_dir(install_root, app_id);
    if !target.exists() {
        std::fs::rename(prepared, &target)
            .with_context(|| format!("移动安装目录失败: {} -> {}", prepared.display(), target.display()))?;
        return Ok(());
    }

    let retired = paths::staging_root(install_root).join(format!("{app_id}-old-{}", Uuid::new_v4()));
    std::fs::rename(&target, &retired).with_context(|| format!("移走旧版本失败: {}", target.display()))?;
    if let Err(e) = std::fs::rename(prepared, &target) {
        let _ = std::fs::rename(&retired, &target);
        return Err(e).with_context(|| format!("替换安装目录失败: {}", target.display()));
    }
    if let Err(e) = std::fs::remove_dir_all(&retired) {
        warn!(app_id = %app_id, error = %e, "清理旧版本目录失败");
    }
    Ok(())
}
