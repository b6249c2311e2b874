//! Web3 Secret Storage V3 密钥库：加密、解密与文件结构。
//!
//! 文件结构（字段名与嵌套固定，需与其他钱包互通）：
//! ```text
//! { "address", "crypto": { "cipher", "ciphertext", "cipherparams": { "iv" },
//!   "kdf", "kdfparams", "mac" }, "id", "version": 3 }
//! ```
//!
//! 算法：
//! - KDF：scrypt（`{dklen,salt,n,p,r}`）或 pbkdf2（`{dklen,salt,c,prf}`，prf 仅支持 hmac-sha256）
//! - 加密：AES-128-CTR，密钥为派生结果前 16 字节
//! - MAC：keccak256(派生结果后 16 字节 ++ 密文)
//!
//! 异常处理：
//! - MAC 不匹配：[`SecurityError::Authentication`]（即“密码错误”）
//! - 不支持的 cipher：[`SecurityError::Cipher`]
//! - 未知 kdf、字段缺失或参数非法：[`SecurityError::Keystore`]
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::Hmac;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use sha3::{Digest, Keccak256};
use subtle::ConstantTimeEq;
use time::macros::format_description;
use time::OffsetDateTime;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::auth::{random_bytes, ScryptParams};
use crate::error::SecurityError;

type Aes128Ctr = ctr::Ctr128BE<aes::Aes128>;

/// 密钥库格式版本。
pub const KEYSTORE_VERSION: u32 = 3;
/// 唯一支持的对称加密算法。
pub const CIPHER_AES_128_CTR: &str = "aes-128-ctr";
/// pbkdf2 唯一支持的 PRF。
pub const PBKDF2_PRF: &str = "hmac-sha256";
/// pbkdf2 默认迭代次数。
pub const PBKDF2_DEFAULT_ITERATIONS: u32 = 262_144;
/// 读取外部密钥库时允许的最大 pbkdf2 迭代次数。
pub const PBKDF2_MAX_ITERATIONS: u32 = 10_000_000;

const DKLEN: usize = 32;
const KDF_SALT_LEN: usize = 32;
const IV_LEN: usize = 16;

/// 密钥库文件根对象。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoreFile {
    #[serde(default)]
    pub address: String,
    #[serde(alias = "Crypto")]
    pub crypto: CryptoSection,
    pub id: String,
    pub version: u32,
}

/// `crypto` 段。
///
/// 说明：
/// - `kdf` 与 `kdfparams` 在 JSON 中是两个并列字段，内存中合并为 [`KdfParams`]
/// - 反序列化时按 `kdf` 取值严格匹配参数结构，未知 kdf 直接拒绝
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawCrypto", into = "RawCrypto")]
pub struct CryptoSection {
    pub cipher: String,
    pub ciphertext: String,
    pub cipherparams: CipherParams,
    pub kdf: KdfParams,
    pub mac: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipherParams {
    pub iv: String,
}

/// KDF 参数（每种算法一个变体）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KdfParams {
    Scrypt(ScryptKdfParams),
    Pbkdf2(Pbkdf2KdfParams),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScryptKdfParams {
    pub dklen: u32,
    pub salt: String,
    pub n: u32,
    pub p: u32,
    pub r: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pbkdf2KdfParams {
    pub dklen: u32,
    pub salt: String,
    pub c: u32,
    pub prf: String,
}

/// `crypto` 段的线上形态。
#[derive(Serialize, Deserialize)]
struct RawCrypto {
    cipher: String,
    ciphertext: String,
    cipherparams: CipherParams,
    kdf: String,
    kdfparams: Value,
    mac: String,
}

impl TryFrom<RawCrypto> for CryptoSection {
    type Error = String;

    fn try_from(raw: RawCrypto) -> Result<Self, Self::Error> {
        let kdf = match raw.kdf.as_str() {
            "scrypt" => KdfParams::Scrypt(
                serde_json::from_value(raw.kdfparams)
                    .map_err(|e| format!("scrypt kdfparams 无效: {e}"))?,
            ),
            "pbkdf2" => KdfParams::Pbkdf2(
                serde_json::from_value(raw.kdfparams)
                    .map_err(|e| format!("pbkdf2 kdfparams 无效: {e}"))?,
            ),
            other => return Err(format!("不支持的 kdf: {other}")),
        };
        kdf.validate().map_err(|e| e.to_string())?;
        Ok(Self {
            cipher: raw.cipher,
            ciphertext: raw.ciphertext,
            cipherparams: raw.cipherparams,
            kdf,
            mac: raw.mac,
        })
    }
}

impl From<CryptoSection> for RawCrypto {
    fn from(section: CryptoSection) -> Self {
        let (kdf, kdfparams) = match section.kdf {
            KdfParams::Scrypt(p) => (
                "scrypt",
                serde_json::json!({ "dklen": p.dklen, "salt": p.salt, "n": p.n, "p": p.p, "r": p.r }),
            ),
            KdfParams::Pbkdf2(p) => (
                "pbkdf2",
                serde_json::json!({ "dklen": p.dklen, "salt": p.salt, "c": p.c, "prf": p.prf }),
            ),
        };
        Self {
            cipher: section.cipher,
            ciphertext: section.ciphertext,
            cipherparams: section.cipherparams,
            kdf: kdf.to_string(),
            kdfparams,
            mac: section.mac,
        }
    }
}

impl KdfParams {
    /// 加密时选择的 KDF（盐值自动生成）。
    pub fn new_scrypt(params: ScryptParams) -> Self {
        KdfParams::Scrypt(ScryptKdfParams {
            dklen: DKLEN as u32,
            salt: hex::encode(random_bytes(KDF_SALT_LEN)),
            n: params.n,
            p: params.p,
            r: params.r,
        })
    }

    pub fn new_pbkdf2(iterations: u32) -> Self {
        KdfParams::Pbkdf2(Pbkdf2KdfParams {
            dklen: DKLEN as u32,
            salt: hex::encode(random_bytes(KDF_SALT_LEN)),
            c: iterations,
            prf: PBKDF2_PRF.to_string(),
        })
    }

    /// kdf 名称（写入 `crypto.kdf`）。
    pub fn name(&self) -> &'static str {
        match self {
            KdfParams::Scrypt(_) => "scrypt",
            KdfParams::Pbkdf2(_) => "pbkdf2",
        }
    }

    /// 检查参数是否在可接受范围内（读取外部文件时即调用）。
    ///
    /// 异常处理：
    /// - `dklen` 不是 32、prf 不受支持、成本参数越界：[`SecurityError::Keystore`]
    pub fn validate(&self) -> Result<(), SecurityError> {
        match self {
            KdfParams::Scrypt(p) => {
                check_dklen(p.dklen)?;
                ScryptParams { n: p.n, r: p.r, p: p.p }.validate()
            }
            KdfParams::Pbkdf2(p) => {
                check_dklen(p.dklen)?;
                if p.prf != PBKDF2_PRF {
                    return Err(SecurityError::Keystore(format!("不支持的 prf: {}", p.prf)));
                }
                if p.c == 0 || p.c > PBKDF2_MAX_ITERATIONS {
                    return Err(SecurityError::Keystore(format!("pbkdf2 迭代次数越界: {}", p.c)));
                }
                Ok(())
            }
        }
    }

    fn derive(&self, password: &[u8]) -> Result<Zeroizing<Vec<u8>>, SecurityError> {
        self.validate()?;
        match self {
            KdfParams::Scrypt(p) => {
                let salt = decode_hex("salt", &p.salt)?;
                ScryptParams { n: p.n, r: p.r, p: p.p }.derive(password, &salt, DKLEN)
            }
            KdfParams::Pbkdf2(p) => {
                let salt = decode_hex("salt", &p.salt)?;
                let mut out = Zeroizing::new(vec![0u8; DKLEN]);
                pbkdf2::pbkdf2::<Hmac<Sha256>>(password, &salt, p.c, &mut out)
                    .map_err(|e| SecurityError::Keystore(format!("pbkdf2 派生失败: {e}")))?;
                Ok(out)
            }
        }
    }
}

fn check_dklen(dklen: u32) -> Result<(), SecurityError> {
    if dklen as usize != DKLEN {
        return Err(SecurityError::Keystore(format!("不支持的 dklen: {dklen}")));
    }
    Ok(())
}

fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>, SecurityError> {
    hex::decode(value.trim_start_matches("0x"))
        .map_err(|_| SecurityError::Keystore(format!("字段 {field} 不是合法的十六进制")))
}

fn compute_mac(derived: &[u8], ciphertext: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(&derived[16..32]);
    hasher.update(ciphertext);
    hasher.finalize().into()
}

fn apply_aes_ctr(key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<(), SecurityError> {
    let mut cipher = Aes128Ctr::new_from_slices(key, iv)
        .map_err(|_| SecurityError::Cipher(format!("{CIPHER_AES_128_CTR} 密钥或 IV 长度无效")))?;
    cipher.apply_keystream(data);
    Ok(())
}

/// 解密得到的账户凭据。
///
/// 安全注意：
/// - 私钥在离开作用域时清零；`Debug` 不输出私钥
pub struct Credentials {
    pub address: String,
    pub private_key: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials").field("address", &self.address).finish_non_exhaustive()
    }
}

/// 规范化地址：去掉 `0x` 前缀并转为小写。
pub fn normalize_address(address: &str) -> String {
    address.trim().trim_start_matches("0x").to_ascii_lowercase()
}

/// 使用密码加密私钥，生成 V3 密钥库。
///
/// 参数：
/// - `private_key`：私钥原始字节
/// - `password`：加密口令
/// - `address`：账户地址（写入文件，不做推导校验）
/// - `kdf`：KDF 选择（见 [`KdfParams::new_scrypt`] / [`KdfParams::new_pbkdf2`]）
///
/// 说明：
/// - KDF 计算刻意较慢，异步调用方应放到阻塞线程池执行
pub fn encrypt(
    private_key: &[u8],
    password: &str,
    address: &str,
    kdf: KdfParams,
) -> Result<KeystoreFile, SecurityError> {
    let derived = kdf.derive(password.as_bytes())?;
    let iv = random_bytes(IV_LEN);
    let mut ciphertext = private_key.to_vec();
    apply_aes_ctr(&derived[..16], &iv, &mut ciphertext)?;
    let mac = compute_mac(&derived, &ciphertext);
    Ok(KeystoreFile {
        address: normalize_address(address),
        crypto: CryptoSection {
            cipher: CIPHER_AES_128_CTR.to_string(),
            ciphertext: hex::encode(&ciphertext),
            cipherparams: CipherParams { iv: hex::encode(&iv) },
            kdf,
            mac: hex::encode(mac),
        },
        id: Uuid::new_v4().to_string(),
        version: KEYSTORE_VERSION,
    })
}

/// 使用密码解密 V3 密钥库。
///
/// 异常处理：
/// - `version` 不是 3、字段非法：[`SecurityError::Keystore`]
/// - `cipher` 不是 aes-128-ctr：[`SecurityError::Cipher`]
/// - MAC 校验失败：[`SecurityError::Authentication`]，不会返回错误的私钥字节
pub fn decrypt(file: &KeystoreFile, password: &str) -> Result<Credentials, SecurityError> {
    if file.version != KEYSTORE_VERSION {
        return Err(SecurityError::Keystore(format!("不支持的密钥库版本: {}", file.version)));
    }
    let crypto = &file.crypto;
    if crypto.cipher != CIPHER_AES_128_CTR {
        return Err(SecurityError::Cipher(crypto.cipher.clone()));
    }
    let ciphertext = decode_hex("ciphertext", &crypto.ciphertext)?;
    let expected_mac = decode_hex("mac", &crypto.mac)?;
    let iv = decode_hex("iv", &crypto.cipherparams.iv)?;
    if iv.len() != IV_LEN {
        return Err(SecurityError::Keystore(format!("IV 长度无效: {}", iv.len())));
    }

    let derived = crypto.kdf.derive(password.as_bytes())?;
    let mac = compute_mac(&derived, &ciphertext);
    if !bool::from(mac.as_slice().ct_eq(&expected_mac)) {
        return Err(SecurityError::Authentication);
    }

    let mut plain = Zeroizing::new(ciphertext);
    apply_aes_ctr(&derived[..16], &iv, &mut plain)?;
    Ok(Credentials {
        address: file.address.clone(),
        private_key: plain,
    })
}

impl KeystoreFile {
    /// 从 JSON 字节解析。
    ///
    /// 异常处理：
    /// - 任意结构错误（含未知 kdf）返回 [`SecurityError::Keystore`]
    pub fn from_json(bytes: &[u8]) -> Result<Self, SecurityError> {
        serde_json::from_slice(bytes).map_err(|e| SecurityError::Keystore(e.to_string()))
    }

    pub fn to_json_pretty(&self) -> Result<String, SecurityError> {
        serde_json::to_string_pretty(self).map_err(|e| SecurityError::Keystore(e.to_string()))
    }

    /// 约定文件名：`UTC--<时间戳>--<地址>.json`。
    pub fn file_name(&self, created_at: OffsetDateTime) -> String {
        let format = format_description!("[year]-[month]-[day]T[hour]-[minute]-[second].[subsecond digits:9]Z");
        let stamp = created_at
            .format(format)
            .unwrap_or_else(|_| created_at.unix_timestamp().to_string());
        format!("UTC--{stamp}--{}.json", self.address)
    }
}
