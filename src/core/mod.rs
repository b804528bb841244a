//! 核心功能模块
//!
//! 与具体图形 API 无关的基础服务：日志系统、配置管理和错误处理。
//!
//! - `log`：日志系统，提供结构化的日志记录功能
//! - `config`：配置管理，支持从配置文件加载设置
//! - `error`：错误处理，定义统一的错误类型

pub mod config;
pub mod error;
pub mod log;

pub use config::Config;
pub use error::{CoreError, Result};
