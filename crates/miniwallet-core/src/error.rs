//! 错误类型定义。
//!
//! 分类：
//! - [`MiniAppError`]：清单解析、包安装与扫描相关错误
//! - [`BridgeError`]：桥接路由与引擎通道相关错误
//! - [`SecurityError`]：密码与密钥库相关错误
//!
//! 约束：
//! - 错误消息中不得包含密码、私钥或派生密钥等敏感内容
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::io;

use thiserror::Error;

/// 小程序清单、安装与扫描错误。
#[derive(Debug, Error)]
pub enum MiniAppError {
    /// 清单 JSON 格式错误或缺少必填字段（app_id/name/version/type）。
    #[error("小程序清单无效: {0}")]
    ManifestInvalid(String),
    /// 指定小程序的 manifest.json 不存在。
    #[error("未找到小程序清单: {0}")]
    ManifestNotFound(String),
    /// 单个小程序安装失败。
    #[error("小程序安装失败 ({app_id}): {source}")]
    InstallFailed {
        app_id: String,
        #[source]
        source: io::Error,
    },
    /// 删除包目录失败（目录本就不存在不算失败）。
    #[error("小程序卸载失败 ({app_id}): {source}")]
    UninstallFailed {
        app_id: String,
        #[source]
        source: io::Error,
    },
    /// 枚举安装根目录失败。
    #[error("扫描已安装小程序失败: {0}")]
    ScanFailed(#[source] io::Error),
    /// 安装根目录中没有任何小程序（区别于扫描失败）。
    #[error("尚未安装任何小程序")]
    NoAppsInstalled,
}

impl MiniAppError {
    /// 以任意错误构造 [`MiniAppError::InstallFailed`]。
    ///
    /// 说明：
    /// - 非 IO 错误（压缩包损坏、清单不一致等）统一包装为 `InvalidData` 类型的 IO 错误
    pub fn install_failed<E>(app_id: impl Into<String>, cause: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::InstallFailed {
            app_id: app_id.into(),
            source: io::Error::new(io::ErrorKind::InvalidData, cause),
        }
    }
}

/// 桥接路由错误。
///
/// 用途：
/// - 以类型化结果返回给调用方，而不是跨进程边界抛出异常
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// 引擎未连接，或连接在请求完成前断开。
    #[error("区块链引擎服务未连接")]
    ServiceDisconnected,
    /// 引擎响应无法解析为 JSON。
    #[error("响应解析失败: {0}")]
    Parse(String),
    /// 同一请求 ID 仍有未完成的请求（调用方错误）。
    #[error("请求 ID 仍在处理中: {0}")]
    DuplicateRequestId(String),
}

/// 密码与密钥库错误。
///
/// 说明：
/// - [`SecurityError::Authentication`] 专指“密码错误”（MAC 校验失败或哈希不匹配），
///   界面据此提示“密码错误”而不是笼统的“出错了”
#[derive(Debug, Error)]
pub enum SecurityError {
    /// 不支持的加密算法。
    #[error("不支持的加密算法: {0}")]
    Cipher(String),
    /// 密钥库文件结构或参数无效。
    #[error("密钥库文件无效: {0}")]
    Keystore(String),
    /// 密码错误。
    #[error("密码错误")]
    Authentication,
    /// 尚未设置应用密码。
    #[error("尚未设置应用密码")]
    NoPasswordSet,
    /// 安全状态读写失败。
    #[error("安全存储读写失败: {0}")]
    Storage(String),
}
