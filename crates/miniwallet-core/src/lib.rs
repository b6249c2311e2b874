//! 迷你钱包宿主核心库（与运行时/平台无关）。
//!
//! 功能：
//! - 定义小程序清单（manifest.json）模型与入口页解析规则
//! - 定义安装目录布局与路径约定（miniapps 根目录、图标、压缩包扩展名）
//! - 定义宿主与区块链引擎之间的消息协议，以及桥接响应的信封解包/脚本转义
//! - 提供密码哈希（scrypt）记录与 Web3 Secret Storage V3 密钥库加解密
//! - 定义引擎连接状态与当前激活引擎的落盘模型
//!
//! 约定：
//! - 本库不依赖异步运行时；所有 IO 编排由 `miniwallet-host` 负责
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

pub mod auth;
pub mod error;
pub mod ipc;
pub mod keystore;
pub mod manifest;
pub mod paths;
pub mod state;
