//! 小程序清单（manifest.json）模型与解析。
//!
//! 该模块描述每个小程序包根目录下的 `manifest.json`：
//! - 基本信息（app_id/name/version/type）
//! - 页面列表与可选的显式入口页（main_page）
//! - 权限声明（仅做声明记录，不做能力强制）
//! - 可选的桥接脚本声明（bridge.script）
//!
//! 约定：
//! - 该模块仅定义数据结构与纯函数，不执行任何 IO
//! - 入口页解析是全函数：任何合法清单都能得到非空路径
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::MiniAppError;

/// 默认入口页（清单既没有 `main_page` 也没有 `pages` 时使用）。
pub const DEFAULT_ENTRY_PAGE: &str = "index.html";

/// 页面文件后缀。
pub const PAGE_SUFFIX: &str = ".html";

/// 区块链类小程序在引擎返回余额前展示的占位余额。
pub const PLACEHOLDER_BALANCE: &str = "0 ETH";

/// 小程序类型。
///
/// 序列化格式：
/// - `"blockchain"`：区块链钱包（由引擎进程承载业务）
/// - `"app"`：普通 Web 小程序
///
/// 未知取值在反序列化时直接报错，不做静默降级。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MiniAppType {
    Blockchain,
    App,
}

/// 桥接脚本声明（`bridge.script`，相对包根目录）。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeManifest {
    pub script: String,
}

/// 小程序清单根对象（对应 `manifest.json`）。
///
/// 字段说明：
/// - `app_id`：全局唯一标识，同时作为安装目录名
/// - `app_type`：JSON 字段名为 `type`
/// - `main_page`：显式入口页（可选）
/// - `pages`：有序页面列表；入口页缺省时取第一项
/// - `permissions`：能力声明集合
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiniAppManifest {
    pub app_id: String,
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub app_type: MiniAppType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_page: Option<String>,
    #[serde(default)]
    pub pages: Vec<String>,
    #[serde(default)]
    pub permissions: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bridge: Option<BridgeManifest>,
}

impl MiniAppManifest {
    /// 从原始字节解析并校验清单。
    ///
    /// 参数：
    /// - `bytes`：`manifest.json` 的原始内容
    ///
    /// 返回值：
    /// - 成功：返回 [`MiniAppManifest`]
    ///
    /// 异常处理：
    /// - JSON 格式错误、缺少必填字段、`type` 取值未知：[`MiniAppError::ManifestInvalid`]
    /// - 必填字符串字段为空白：[`MiniAppError::ManifestInvalid`]
    pub fn parse(bytes: &[u8]) -> Result<Self, MiniAppError> {
        let manifest: MiniAppManifest = serde_json::from_slice(bytes)
            .map_err(|e| MiniAppError::ManifestInvalid(e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), MiniAppError> {
        for (field, value) in [
            ("app_id", &self.app_id),
            ("name", &self.name),
            ("version", &self.version),
        ] {
            if value.trim().is_empty() {
                return Err(MiniAppError::ManifestInvalid(format!("字段 {field} 不能为空")));
            }
        }
        Ok(())
    }

    /// 解析入口页。
    ///
    /// 优先级：
    /// 1) 非空白的 `main_page`（原样返回）
    /// 2) `pages` 的第一项（缺少 `.html` 后缀时补齐）
    /// 3) [`DEFAULT_ENTRY_PAGE`]
    pub fn resolve_entry_point(&self) -> String {
        if let Some(main) = self.main_page.as_deref().filter(|p| !p.trim().is_empty()) {
            return main.to_string();
        }
        match self.pages.first() {
            Some(first) if first.ends_with(PAGE_SUFFIX) => first.clone(),
            Some(first) => format!("{first}{PAGE_SUFFIX}"),
            None => DEFAULT_ENTRY_PAGE.to_string(),
        }
    }

    /// 判断页面是否在清单声明范围内（入口页或 `pages` 中的页面，后缀可省略）。
    pub fn allows_page(&self, page: &str) -> bool {
        let page = page.trim_start_matches('/');
        if page == self.resolve_entry_point() {
            return true;
        }
        self.pages.iter().any(|declared| {
            declared == page
                || declared.strip_suffix(PAGE_SUFFIX) == Some(page)
                || page.strip_suffix(PAGE_SUFFIX) == Some(declared.as_str())
        })
    }
}

/// 按“点分数字”比较两个版本号。
///
/// 规则：
/// - 逐段比较数字部分，缺失段视为 0（`1.0` == `1.0.0`）
/// - 某段不是纯数字时，该段按字符串比较
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left: Vec<&str> = a.trim().split('.').collect();
    let right: Vec<&str> = b.trim().split('.').collect();
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or("0");
        let r = right.get(i).copied().unwrap_or("0");
        let ord = match (l.parse::<u64>(), r.parse::<u64>()) {
            (Ok(l), Ok(r)) => l.cmp(&r),
            _ => l.cmp(r),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

/// 扫描得到的小程序运行时记录。
///
/// 说明：
/// - 每次重新扫描都会生成新记录，不在原记录上修改
/// - `balance` 仅区块链类型有值（引擎返回前为占位值）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MiniApp {
    pub app_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub app_type: MiniAppType,
    pub version: String,
    #[serde(default)]
    pub icon_path: Option<PathBuf>,
    #[serde(default)]
    pub balance: Option<String>,
    pub entry_point: String,
}

impl MiniApp {
    /// 由清单与磁盘上探测到的图标路径构造运行时记录。
    pub fn from_manifest(manifest: &MiniAppManifest, icon_path: Option<PathBuf>) -> Self {
        let balance = match manifest.app_type {
            MiniAppType::Blockchain => Some(PLACEHOLDER_BALANCE.to_string()),
            MiniAppType::App => None,
        };
        Self {
            app_id: manifest.app_id.clone(),
            name: manifest.name.clone(),
            app_type: manifest.app_type,
            version: manifest.version.clone(),
            icon_path,
            balance,
            entry_point: manifest.resolve_entry_point(),
        }
    }
}
