//! 迷你钱包命令行工具（miniwallet）。
//!
//! 职责：
//! - 小程序包的批量安装、单包安装、卸载与扫描
//! - 应用密码的设置、校验与清除
//! - V3 密钥库的加密与解密
//!
//! 输出约定：
//! - 结果以 JSON 行写到标准输出，日志写到标准错误
//! - 密码错误以退出码 2 结束，其余失败为 1
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use miniwallet_core::error::{MiniAppError, SecurityError};
use miniwallet_core::paths;
use miniwallet_host::config::HostConfig;
use miniwallet_host::prefs::PrefsStore;
use miniwallet_host::scanner::AppScanner;
use miniwallet_host::store::{PackageSource, PackageStore};
use miniwallet_host::vault::{CredentialVault, KeystoreKdf};
use serde_json::json;
use tracing::{error, warn};
use tracing_subscriber::filter::LevelFilter;
use zeroize::Zeroizing;

/// 未通过 `--password` 提供密码时读取的环境变量。
const PASSWORD_ENV: &str = "MINIWALLET_PASSWORD";

/// 密码错误时的退出码。
const EXIT_WRONG_PASSWORD: u8 = 2;

/// 命令行参数。
///
/// 说明：
/// - `home` 覆盖数据根目录（默认 `MINIWALLET_HOME` 或 `$HOME/.miniwallet`）
/// - `silent` 只输出警告及以上级别的日志
#[derive(Debug, Parser)]
#[command(name = "miniwallet", version)]
struct Cli {
    #[arg(long)]
    home: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    silent: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// 从内置资源目录批量安装（已安装且版本不低的包会跳过）。
    InstallBundled {
        #[arg(long)]
        from: PathBuf,
    },
    /// 从压缩包安装单个小程序。
    Install {
        app_id: String,
        #[arg(long)]
        archive: PathBuf,
    },
    /// 列出已安装的小程序标识。
    List,
    /// 扫描已安装小程序并输出记录。
    Scan {
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// 卸载（幂等）。
    Uninstall { app_id: String },
    /// 应用密码管理。
    Password {
        #[command(subcommand)]
        action: PasswordAction,
    },
    /// 密钥库加解密。
    Keystore {
        #[command(subcommand)]
        action: KeystoreAction,
    },
}

#[derive(Debug, Subcommand)]
enum PasswordAction {
    Set {
        #[arg(long)]
        password: Option<String>,
    },
    Verify {
        #[arg(long)]
        password: Option<String>,
    },
    Status,
    /// 清除全部安全状态。
    Clear,
}

#[derive(Debug, Subcommand)]
enum KeystoreAction {
    Encrypt {
        #[arg(long)]
        address: String,
        /// 十六进制私钥（可带 0x 前缀）。
        #[arg(long)]
        private_key: String,
        #[arg(long, value_enum, default_value_t = KdfArg::Scrypt)]
        kdf: KdfArg,
        /// 输出目录（默认 `<home>/keystore`）。
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        password: Option<String>,
    },
    Decrypt {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        password: Option<String>,
        /// 输出私钥（默认只输出地址）。
        #[arg(long, default_value_t = false)]
        reveal: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KdfArg {
    Scrypt,
    Pbkdf2,
}

impl From<KdfArg> for KeystoreKdf {
    fn from(arg: KdfArg) -> Self {
        match arg {
            KdfArg::Scrypt => KeystoreKdf::Scrypt,
            KdfArg::Pbkdf2 => KeystoreKdf::Pbkdf2,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let level = if cli.silent { LevelFilter::WARN } else { LevelFilter::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            if matches!(e.downcast_ref::<SecurityError>(), Some(SecurityError::Authentication)) {
                eprintln!("密码错误");
                return ExitCode::from(EXIT_WRONG_PASSWORD);
            }
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// 分发子命令。
async fn run(cli: Cli) -> Result<ExitCode> {
    let home = match cli.home {
        Some(home) => home,
        None => paths::home_dir()?,
    };
    paths::ensure_dir(&home)?;
    let config = HostConfig::load(&home)?;
    let install_root = paths::install_root(&home);
    let store = Arc::new(PackageStore::new(&install_root));
    let scanner = AppScanner::new(store.clone(), config.scan_ttl());

    match cli.command {
        Commands::InstallBundled { from } => {
            paths::ensure_dir(&install_root)?;
            let report = store.install_from_bundled_assets(&from).await?;
            if report.is_partial() {
                warn!(failed = report.failed.len(), "部分小程序安装失败");
            }
            if !report.installed.is_empty() {
                scanner.clear_cache();
            }
            println!("{}", serde_json::to_string(&report)?);
        }
        Commands::Install { app_id, archive } => {
            paths::ensure_dir(&install_root)?;
            let manifest = store.install_from_archive(&app_id, &archive).await?;
            scanner.clear_cache();
            println!("{}", json!({ "app_id": manifest.app_id, "version": manifest.version }));
        }
        Commands::List => {
            for id in store.list_installed_ids().await? {
                println!("{id}");
            }
        }
        Commands::Scan { force } => {
            match scanner.scan(force).await {
                Ok(apps) => {
                    for app in apps.iter() {
                        println!("{}", serde_json::to_string(app)?);
                    }
                }
                Err(MiniAppError::NoAppsInstalled) => println!("尚未安装任何小程序"),
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Uninstall { app_id } => {
            let removed = store.uninstall(&app_id).await?;
            if removed {
                scanner.clear_cache();
            }
            println!("{}", json!({ "app_id": app_id, "removed": removed }));
        }
        Commands::Password { action } => {
            let vault = open_vault(&home, &config).await?;
            match action {
                PasswordAction::Set { password } => {
                    let password = resolve_password(password)?;
                    vault.set_password(&password).await?;
                    println!("{}", json!({ "password_set": true }));
                }
                PasswordAction::Verify { password } => {
                    let password = resolve_password(password)?;
                    vault.verify_password(&password).await?;
                    println!("{}", json!({ "verified": true }));
                }
                PasswordAction::Status => {
                    println!("{}", json!({ "has_password": vault.has_password() }));
                }
                PasswordAction::Clear => {
                    vault.clear_all().await?;
                    println!("{}", json!({ "cleared": true }));
                }
            }
        }
        Commands::Keystore { action } => {
            let vault = open_vault(&home, &config).await?;
            match action {
                KeystoreAction::Encrypt {
                    address,
                    private_key,
                    kdf,
                    out,
                    password,
                } => {
                    let password = resolve_password(password)?;
                    let key = Zeroizing::new(
                        hex::decode(private_key.trim().trim_start_matches("0x"))
                            .context("私钥不是合法的十六进制")?,
                    );
                    let file = vault
                        .encrypt_keystore(&key, &password, &address, kdf.into())
                        .await?;
                    let dir = out.unwrap_or_else(|| home.join("keystore"));
                    let path = vault.write_keystore(&dir, &file).await?;
                    println!("{}", json!({ "path": path, "address": file.address }));
                }
                KeystoreAction::Decrypt { file, password, reveal } => {
                    let password = resolve_password(password)?;
                    let keystore = vault.read_keystore(&file).await?;
                    let credentials = vault.decrypt_keystore(&keystore, &password).await?;
                    let mut out = json!({ "address": credentials.address });
                    if reveal {
                        out["private_key"] = json!(hex::encode(credentials.private_key.as_slice()));
                    }
                    println!("{out}");
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn open_vault(home: &std::path::Path, config: &HostConfig) -> Result<CredentialVault> {
    let prefs = PrefsStore::open(paths::prefs_file(home)).await?;
    Ok(CredentialVault::new(Arc::new(prefs), config.kdf_profile.params()))
}

fn resolve_password(arg: Option<String>) -> Result<Zeroizing<String>> {
    arg.or_else(|| std::env::var(PASSWORD_ENV).ok())
        .map(Zeroizing::new)
        .ok_or_else(|| anyhow!("需要通过 --password 或 {PASSWORD_ENV} 提供密码"))
}
