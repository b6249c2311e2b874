//! 宿主配置（host-config.json + 环境变量覆盖）。
//!
//! 加载顺序（后者覆盖前者）：
//! 1) 内置默认值
//! 2) `<home>/host-config.json`（可选，缺失字段取默认值）
//! 3) 环境变量 `MINIWALLET_SCAN_TTL_SECS` / `MINIWALLET_KDF_PROFILE`
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use miniwallet_core::auth::ScryptParams;
use miniwallet_core::paths;
use serde::{Deserialize, Serialize};

/// 扫描缓存有效期的环境变量名。
pub const SCAN_TTL_ENV: &str = "MINIWALLET_SCAN_TTL_SECS";
/// KDF 强度档位的环境变量名。
pub const KDF_PROFILE_ENV: &str = "MINIWALLET_KDF_PROFILE";

/// scrypt 强度档位。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KdfProfile {
    #[default]
    Standard,
    Light,
}

impl KdfProfile {
    pub fn params(self) -> ScryptParams {
        match self {
            KdfProfile::Standard => ScryptParams::STANDARD,
            KdfProfile::Light => ScryptParams::LIGHT,
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(KdfProfile::Standard),
            "light" => Ok(KdfProfile::Light),
            other => Err(anyhow!("未知的 KDF 档位: {other}（可选 standard/light）")),
        }
    }
}

/// 引擎断线后的重连策略。
///
/// 字段说明：
/// - `max_attempts`：每轮绑定的最大尝试次数
/// - `delay_ms`：两次尝试之间的等待时间
/// - `auto_reconnect`：引擎进程死亡后是否自动重新绑定
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub auto_reconnect: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 500,
            auto_reconnect: true,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// 宿主配置。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// 扫描缓存有效期（秒），默认 5 分钟。
    pub scan_ttl_secs: u64,
    pub kdf_profile: KdfProfile,
    /// 传给 [`crate::engine::EngineConnection::new`]；命令行工具不连接引擎，不读取此项。
    pub reconnect: ReconnectPolicy,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            scan_ttl_secs: 5 * 60,
            kdf_profile: KdfProfile::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl HostConfig {
    /// 从数据根目录加载配置，并应用环境变量覆盖。
    ///
    /// 异常处理：
    /// - 配置文件存在但读取/解析失败：返回错误
    /// - 环境变量取值非法：返回错误
    pub fn load(home: &Path) -> Result<Self> {
        let path = paths::config_file(home);
        let mut config = if path.exists() {
            let bytes = std::fs::read(&path).with_context(|| format!("读取配置失败: {}", path.display()))?;
            serde_json::from_slice(&bytes).with_context(|| format!("解析配置 JSON 失败: {}", path.display()))?
        } else {
            HostConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// 应用环境变量覆盖（`lookup` 便于测试注入）。
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(SCAN_TTL_ENV) {
            self.scan_ttl_secs = raw
                .trim()
                .parse()
                .with_context(|| format!("{SCAN_TTL_ENV} 不是合法的秒数: {raw}"))?;
        }
        if let Some(raw) = lookup(KDF_PROFILE_ENV) {
            self.kdf_profile = KdfProfile::parse(&raw)?;
        }
        Ok(())
    }

    pub fn scan_ttl(&self) -> Duration {
        Duration::from_secs(self.scan_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = HostConfig::default();
        assert_eq!(config.scan_ttl(), Duration::from_secs(300));
        assert_eq!(config.kdf_profile.params(), ScryptParams::STANDARD);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.delay(), Duration::from_millis(500));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(paths::config_file(dir.path()), r#"{"reconnect":{"delay_ms":50}}"#).unwrap();
        let mut config: HostConfig =
            serde_json::from_slice(&std::fs::read(paths::config_file(dir.path())).unwrap()).unwrap();
        config.apply_overrides(|_| None).unwrap();
        assert_eq!(config.reconnect.delay_ms, 50);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.scan_ttl_secs, 300);
    }

    #[test]
    fn env_overrides_apply_and_validate() {
        let mut config = HostConfig::default();
        config
            .apply_overrides(|key| match key {
                SCAN_TTL_ENV => Some("10".into()),
                KDF_PROFILE_ENV => Some("Light".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.scan_ttl_secs, 10);
        assert_eq!(config.kdf_profile, KdfProfile::Light);

        let bad = HostConfig::default().apply_overrides(|key| (key == KDF_PROFILE_ENV).then(|| "fast".to_string()));
        assert!(bad.is_err());
    }
}
