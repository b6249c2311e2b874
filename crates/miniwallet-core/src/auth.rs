//! 应用密码：scrypt 哈希记录与解锁会话。
//!
//! 落盘格式（键值偏好，键名固定）：
//! - `app_password_hash`：base64(scrypt(password, salt))
//! - `app_password_salt`：base64(salt)
//! - `scrypt_params`：JSON 序列化的 [`ScryptParams`]
//!
//! 设计目标：
//! - 参数随记录落盘，调整 scrypt 成本后旧哈希仍可校验
//! - 明文密码只存在于 [`Session`] 中，并在会话结束时清零
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::SecurityError;

/// 密码哈希的偏好键名。
pub const KEY_PASSWORD_HASH: &str = "app_password_hash";
/// 盐值的偏好键名。
pub const KEY_PASSWORD_SALT: &str = "app_password_salt";
/// scrypt 参数的偏好键名。
pub const KEY_SCRYPT_PARAMS: &str = "scrypt_params";

/// 全部安全状态键（清空时整体移除）。
pub const SECURITY_KEYS: [&str; 3] = [KEY_PASSWORD_HASH, KEY_PASSWORD_SALT, KEY_SCRYPT_PARAMS];

/// 盐值长度（字节）。
pub const SALT_LEN: usize = 32;
/// 派生长度（字节）。
pub const DERIVED_LEN: usize = 32;

/// scrypt 允许的最大内存占用（1 GiB，对应 N=2^20、r=8）。
pub const SCRYPT_MAX_MEMORY: u64 = 1 << 30;
/// scrypt 允许的最大并行度。
pub const SCRYPT_MAX_P: u32 = 16;

/// scrypt 成本参数。
///
/// 字段说明：
/// - `n`：CPU/内存成本，必须是大于 1 的 2 的幂
/// - `r`：块大小
/// - `p`：并行度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScryptParams {
    pub n: u32,
    pub r: u32,
    pub p: u32,
}

impl ScryptParams {
    /// 标准参数（N=16384, r=8, p=1）。
    pub const STANDARD: ScryptParams = ScryptParams { n: 16384, r: 8, p: 1 };
    /// 低端设备参数（N=4096, r=8, p=1）。
    pub const LIGHT: ScryptParams = ScryptParams { n: 4096, r: 8, p: 1 };

    /// 检查参数是否可安全执行。
    ///
    /// 说明：
    /// - 参数可能来自外部文件，内存占用（128·r·N 字节）和并行度必须有上限，
    ///   否则构造的参数会让进程在分配内存时直接中止
    ///
    /// 异常处理：
    /// - `n` 不是大于 1 的 2 的幂、`r`/`p` 为 0 或超出上限：[`SecurityError::Keystore`]
    pub fn validate(&self) -> Result<(), SecurityError> {
        if self.n < 2 || !self.n.is_power_of_two() {
            return Err(SecurityError::Keystore(format!(
                "scrypt 参数 n 必须是 2 的幂: {}",
                self.n
            )));
        }
        if self.r == 0 || self.p == 0 || self.p > SCRYPT_MAX_P {
            return Err(SecurityError::Keystore(format!(
                "scrypt 参数越界: r={}, p={}",
                self.r, self.p
            )));
        }
        let memory = 128u128 * u128::from(self.r) * u128::from(self.n);
        if memory > u128::from(SCRYPT_MAX_MEMORY) {
            return Err(SecurityError::Keystore(format!(
                "scrypt 内存需求过大: n={}, r={}",
                self.n, self.r
            )));
        }
        Ok(())
    }

    /// 以当前参数执行 scrypt 派生。
    ///
    /// 参数：
    /// - `password`：口令字节
    /// - `salt`：盐值
    /// - `out_len`：派生长度
    ///
    /// 异常处理：
    /// - 参数非法（见 [`ScryptParams::validate`]）返回 [`SecurityError::Keystore`]
    pub fn derive(
        &self,
        password: &[u8],
        salt: &[u8],
        out_len: usize,
    ) -> Result<Zeroizing<Vec<u8>>, SecurityError> {
        self.validate()?;
        let log_n = self.n.trailing_zeros() as u8;
        let params = scrypt::Params::new(log_n, self.r, self.p, out_len)
            .map_err(|e| SecurityError::Keystore(format!("scrypt 参数无效: {e}")))?;
        let mut out = Zeroizing::new(vec![0u8; out_len]);
        scrypt::scrypt(password, salt, &params, &mut out)
            .map_err(|e| SecurityError::Keystore(format!("scrypt 派生失败: {e}")))?;
        Ok(out)
    }
}

impl Default for ScryptParams {
    fn default() -> Self {
        Self::STANDARD
    }
}

/// 生成指定长度的随机字节。
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// 已落盘的密码记录（不含明文）。
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordRecord {
    pub hash: Vec<u8>,
    pub salt: Vec<u8>,
    pub params: ScryptParams,
}

impl std::fmt::Debug for PasswordRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordRecord").field("params", &self.params).finish_non_exhaustive()
    }
}

impl PasswordRecord {
    /// 以新随机盐值为密码生成记录。
    ///
    /// 说明：
    /// - scrypt 计算刻意较慢，异步调用方应放到阻塞线程池执行
    pub fn create(password: &str, params: ScryptParams) -> Result<Self, SecurityError> {
        let salt = random_bytes(SALT_LEN);
        let hash = params.derive(password.as_bytes(), &salt, DERIVED_LEN)?;
        Ok(Self {
            hash: hash.to_vec(),
            salt,
            params,
        })
    }

    /// 使用记录中的盐值与参数重新计算并以常量时间比较。
    ///
    /// 异常处理：
    /// - 不匹配：[`SecurityError::Authentication`]
    pub fn verify(&self, password: &str) -> Result<(), SecurityError> {
        let candidate = self.params.derive(password.as_bytes(), &self.salt, self.hash.len())?;
        if bool::from(candidate.as_slice().ct_eq(&self.hash)) {
            Ok(())
        } else {
            Err(SecurityError::Authentication)
        }
    }

    /// 编码为固定键名的偏好条目。
    pub fn to_entries(&self) -> Result<Vec<(&'static str, String)>, SecurityError> {
        let params = serde_json::to_string(&self.params)
            .map_err(|e| SecurityError::Storage(format!("序列化 scrypt 参数失败: {e}")))?;
        Ok(vec![
            (KEY_PASSWORD_HASH, STANDARD.encode(&self.hash)),
            (KEY_PASSWORD_SALT, STANDARD.encode(&self.salt)),
            (KEY_SCRYPT_PARAMS, params),
        ])
    }

    /// 从偏好条目解码记录。
    ///
    /// 返回值：
    /// - 未设置哈希：`Ok(None)`（合法状态）
    /// - 缺少参数：按 [`ScryptParams::STANDARD`] 处理
    ///
    /// 异常处理：
    /// - 有哈希但缺少盐值，或 base64/JSON 解码失败：[`SecurityError::Storage`]
    pub fn from_entries(
        hash: Option<&str>,
        salt: Option<&str>,
        params: Option<&str>,
    ) -> Result<Option<Self>, SecurityError> {
        let Some(hash) = hash else {
            return Ok(None);
        };
        let salt = salt.ok_or_else(|| SecurityError::Storage("密码记录缺少盐值".into()))?;
        let hash = STANDARD
            .decode(hash)
            .map_err(|_| SecurityError::Storage("密码哈希解码失败".into()))?;
        let salt = STANDARD
            .decode(salt)
            .map_err(|_| SecurityError::Storage("盐值解码失败".into()))?;
        let params = match params {
            Some(raw) => serde_json::from_str(raw)
                .map_err(|e| SecurityError::Storage(format!("scrypt 参数解析失败: {e}")))?,
            None => ScryptParams::STANDARD,
        };
        Ok(Some(Self { hash, salt, params }))
    }
}

/// 解锁会话。
///
/// 生命周期：
/// - 由密码校验成功后创建（见 host 的 `CredentialVault::unlock`）
/// - 调用 [`Session::lock`] 或离开作用域即销毁，明文密码随之清零
///
/// 安全注意：
/// - `Debug` 输出不包含密码
pub struct Session {
    id: Uuid,
    password: Zeroizing<String>,
    unlocked_at: OffsetDateTime,
}

impl Session {
    /// 以已校验的密码创建会话。
    pub fn new(password: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            password: Zeroizing::new(password.to_string()),
            unlocked_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// 会话内的密码（用于解密密钥库）。
    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn unlocked_at(&self) -> OffsetDateTime {
        self.unlocked_at
    }

    /// 结束会话。
    pub fn lock(self) {
        tracing::debug!(session_id = %self.id, "会话已锁定");
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("unlocked_at", &self.unlocked_at)
            .finish_non_exhaustive()
    }
}
