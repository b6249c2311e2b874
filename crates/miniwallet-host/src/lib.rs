//! 迷你钱包宿主运行时。
//!
//! 模块：
//! - [`store`] / [`scanner`]：小程序包安装与扫描
//! - [`engine`] / [`router`] / [`switch`]：区块链引擎连接、桥接路由与引擎切换
//! - [`vault`] / [`prefs`]：应用密码、密钥库与本地偏好存储
//! - [`config`]：宿主配置
//!
//! 作者：迷你钱包项目组
//! 创建时间：2026-10-18
//! 修改时间：2026-10-18

pub mod config;
pub mod engine;
pub mod prefs;
pub mod router;
pub mod scanner;
pub mod store;
pub mod switch;
pub mod vault;
