//! 统一路径与目录约定。
//!
//! 目标：
//! - 将落盘路径集中管理，避免散落在各模块中
//! - 统一小程序安装根目录、暂存目录、偏好设置与配置文件的位置
//!
//! 目录布局（`<home>` 默认 `$HOME/.miniwallet`）：
//! - `<home>/miniapps/<app_id>/manifest.json`
//! - `<home>/miniapps/.staging/`：解压暂存区（扫描时忽略）
//! - `<home>/prefs.json`：安全状态等键值偏好
//! - `<home>/active-engine.json`：当前激活引擎
//! - `<home>/host-config.json`：宿主配置（可选）
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};

/// 用户目录下的产品目录名。
pub const VENDOR_DIR: &str = ".miniwallet";

/// 覆盖数据根目录的环境变量名。
pub const HOME_ENV: &str = "MINIWALLET_HOME";

/// 小程序安装根目录名。
pub const MINIAPP_INSTALL_DIR: &str = "miniapps";

/// 每个包根目录下的清单文件名。
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

/// 图标相对包根目录的约定路径（经 [`resolve_within`] 解析）。
pub const ICON_PATH: &str = "/assets/icons/app_icon.png";

/// 小程序压缩包扩展名。
pub const ZIP_EXTENSION: &str = ".zip";

/// 安装根目录下的解压暂存目录名（以 `.` 开头，扫描时忽略）。
pub const STAGING_DIR: &str = ".staging";

/// 获取数据根目录。
///
/// 返回值：
/// - 设置了 `MINIWALLET_HOME`：直接使用
/// - 否则：`$HOME/.miniwallet`
///
/// 异常处理：
/// - 两个环境变量都不存在时返回错误。
pub fn home_dir() -> Result<PathBuf> {
    if let Some(custom) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(custom));
    }
    let home = std::env::var_os("HOME").context("读取 HOME 环境变量失败")?;
    Ok(PathBuf::from(home).join(VENDOR_DIR))
}

/// 确保目录存在（不存在则递归创建）。
///
/// 异常处理：
/// - 目录创建失败（权限、路径非法等）会返回错误。
pub fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).with_context(|| format!("创建目录失败: {}", path.display()))?;
    Ok(())
}

/// 小程序安装根目录：`<home>/miniapps`。
pub fn install_root(home: &Path) -> PathBuf {
    home.join(MINIAPP_INSTALL_DIR)
}

/// 单个小程序的包目录：`<install_root>/<app_id>`。
pub fn package_dir(install_root: &Path, app_id: &str) -> PathBuf {
    install_root.join(app_id)
}

/// 解压暂存目录：`<install_root>/.staging`。
pub fn staging_root(install_root: &Path) -> PathBuf {
    install_root.join(STAGING_DIR)
}

/// 偏好设置文件：`<home>/prefs.json`。
pub fn prefs_file(home: &Path) -> PathBuf {
    home.join("prefs.json")
}

/// 当前激活引擎落盘文件：`<home>/active-engine.json`。
pub fn active_engine_file(home: &Path) -> PathBuf {
    home.join("active-engine.json")
}

/// 宿主配置文件：`<home>/host-config.json`。
pub fn config_file(home: &Path) -> PathBuf {
    home.join("host-config.json")
}

/// 判断 app_id 能否安全地作为单级目录名。
///
/// 规则：
/// - 非空，且不以 `.` 开头（`.staging` 等内部目录保留）
/// - 仅允许 ASCII 字母、数字以及 `.`、`-`、`_`
pub fn is_valid_app_id(app_id: &str) -> bool {
    !app_id.is_empty()
        && !app_id.starts_with('.')
        && app_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

/// 将清单中的相对路径解析为包目录内的实际路径。
///
/// 参数：
/// - `base`：包根目录
/// - `raw`：清单中的路径字符串（允许以 `/` 开头，视为相对包根）
///
/// 异常处理：
/// - `raw` 为空，或包含 `..` 等越出 `base` 的路径成分时返回错误。
pub fn resolve_within(base: &Path, raw: &str) -> Result<PathBuf> {
    let trimmed = raw.trim().trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(anyhow!("空路径"));
    }
    let mut resolved = base.to_path_buf();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return Err(anyhow!("路径越出包目录: {raw}")),
        }
    }
    Ok(resolved)
}
