//! 凭据保险库：应用密码与 V3 密钥库。
//!
//! 说明：
//! - 密码只以 scrypt 哈希 + 盐值 + 参数的形式保存在偏好存储中
//! - KDF 计算在阻塞线程池执行，不占用异步工作线程
//! - 解锁得到 [`Session`]，由调用方显式持有和销毁
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::path::{Path, PathBuf};
use std::sync::Arc;

use miniwallet_core::auth::{
    PasswordRecord, ScryptParams, Session, KEY_PASSWORD_HASH, KEY_PASSWORD_SALT, KEY_SCRYPT_PARAMS, SECURITY_KEYS,
};
use miniwallet_core::error::SecurityError;
use miniwallet_core::keystore::{self, Credentials, KdfParams, KeystoreFile, PBKDF2_DEFAULT_ITERATIONS};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::prefs::{write_atomic, PrefsStore};

/// 加密密钥库时使用的 KDF。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeystoreKdf {
    #[default]
    Scrypt,
    Pbkdf2,
}

/// 凭据保险库。
pub struct CredentialVault {
    prefs: Arc<PrefsStore>,
    params: ScryptParams,
    pbkdf2_iterations: u32,
}

impl CredentialVault {
    /// 参数：
    /// - `params`：新密码与 scrypt 密钥库使用的 scrypt 参数
    pub fn new(prefs: Arc<PrefsStore>, params: ScryptParams) -> Self {
        Self {
            prefs,
            params,
            pbkdf2_iterations: PBKDF2_DEFAULT_ITERATIONS,
        }
    }

    pub fn with_pbkdf2_iterations(mut self, iterations: u32) -> Self {
        self.pbkdf2_iterations = iterations;
        self
    }

    /// 是否已设置应用密码（未设置是合法状态）。
    pub fn has_password(&self) -> bool {
        self.prefs.get(KEY_PASSWORD_HASH).is_some()
    }

    /// 设置（或覆盖）应用密码。
    pub async fn set_password(&self, password: &str) -> Result<(), SecurityError> {
        let password = Zeroizing::new(password.to_string());
        let params = self.params;
        let record = run_blocking(move || PasswordRecord::create(&password, params)).await?;
        let entries = record.to_entries()?;
        self.prefs
            .update(|map| {
                for (key, value) in entries {
                    map.insert(key.to_string(), value);
                }
            })
            .await
            .map_err(storage_error)?;
        info!(n = params.n, "应用密码已更新");
        Ok(())
    }

    /// 校验应用密码。
    ///
    /// 异常处理：
    /// - 未设置密码：[`SecurityError::NoPasswordSet`]
    /// - 密码错误：[`SecurityError::Authentication`]
    pub async fn verify_password(&self, password: &str) -> Result<(), SecurityError> {
        let record = self.load_record()?.ok_or(SecurityError::NoPasswordSet)?;
        let password = Zeroizing::new(password.to_string());
        let result = run_blocking(move || record.verify(&password)).await;
        if matches!(result, Err(SecurityError::Authentication)) {
            warn!("应用密码校验失败");
        }
        result
    }

    /// 校验密码并开启会话。
    pub async fn unlock(&self, password: &str) -> Result<Session, SecurityError> {
        self.verify_password(password).await?;
        let session = Session::new(password);
        info!(session_id = %session.id(), "会话已解锁");
        Ok(session)
    }

    /// 一次性清除全部安全状态（单次原子替换）。
    pub async fn clear_all(&self) -> Result<(), SecurityError> {
        self.prefs
            .update(|map| {
                for key in SECURITY_KEYS {
                    map.remove(key);
                }
            })
            .await
            .map_err(storage_error)?;
        info!("安全状态已清除");
        Ok(())
    }

    /// 加密私钥为 V3 密钥库。
    pub async fn encrypt_keystore(
        &self,
        private_key: &[u8],
        password: &str,
        address: &str,
        kdf: KeystoreKdf,
    ) -> Result<KeystoreFile, SecurityError> {
        let params = match kdf {
            KeystoreKdf::Scrypt => KdfParams::new_scrypt(self.params),
            KeystoreKdf::Pbkdf2 => KdfParams::new_pbkdf2(self.pbkdf2_iterations),
        };
        let private_key = Zeroizing::new(private_key.to_vec());
        let password = Zeroizing::new(password.to_string());
        let address = address.to_string();
        run_blocking(move || keystore::encrypt(&private_key, &password, &address, params)).await
    }

    /// 使用密码解密密钥库。
    ///
    /// 异常处理：
    /// - 密码错误（MAC 不匹配）：[`SecurityError::Authentication`]
    pub async fn decrypt_keystore(&self, file: &KeystoreFile, password: &str) -> Result<Credentials, SecurityError> {
        let file = file.clone();
        let password = Zeroizing::new(password.to_string());
        run_blocking(move || keystore::decrypt(&file, &password)).await
    }

    /// 使用会话中的密码解密密钥库。
    pub async fn decrypt_with_session(&self, file: &KeystoreFile, session: &Session) -> Result<Credentials, SecurityError> {
        self.decrypt_keystore(file, session.password()).await
    }

    /// 以约定文件名把密钥库写入目录。
    pub async fn write_keystore(&self, dir: &Path, file: &KeystoreFile) -> Result<PathBuf, SecurityError> {
        let path = dir.join(file.file_name(OffsetDateTime::now_utc()));
        let json = file.to_json_pretty()?;
        write_atomic(&path, json.as_bytes())
            .await
            .map_err(|e| SecurityError::Storage(format!("写入密钥库失败: {e}")))?;
        info!(path = %path.display(), "密钥库已保存");
        Ok(path)
    }

    /// 从文件读取密钥库。
    pub async fn read_keystore(&self, path: &Path) -> Result<KeystoreFile, SecurityError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| SecurityError::Storage(format!("读取密钥库失败 ({}): {e}", path.display())))?;
        KeystoreFile::from_json(&bytes)
    }

    fn load_record(&self) -> Result<Option<PasswordRecord>, SecurityError> {
        let snapshot = self.prefs.snapshot();
        PasswordRecord::from_entries(
            snapshot.get(KEY_PASSWORD_HASH).map(String::as_str),
            snapshot.get(KEY_PASSWORD_SALT).map(String::as_str),
            snapshot.get(KEY_SCRYPT_PARAMS).map(String::as_str),
        )
    }
}

fn storage_error(e: anyhow::Error) -> SecurityError {
    SecurityError::Storage(format!("{e:#}"))
}

async fn run_blocking<T, F>(job: F) -> Result<T, SecurityError>
where
    F: FnOnce() -> Result<T, SecurityError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| SecurityError::Storage(format!("后台计算任务异常退出: {e}")))?
}
