//! 错误处理模块
//!
//! 定义了帧管线核心中使用的统一错误类型，使用 `thiserror` 派生 `Error` 和 `Display`。
//!
//! # 错误分类
//!
//! - **致命设备错误**：设备创建失败、设备丢失、fence/队列/堆创建失败，不可恢复
//! - **容量错误**：描述符堆耗尽或容量超出硬件限制，属于配置问题，不重试
//! - **同步超时**：`Wait` 超过调用方给定的超时，可恢复，由调用方决定如何处理
//!
//! 本模块中的任何操作都不会自动重试。

use std::time::Duration;

use thiserror::Error;

/// 统一的 Result 类型
pub type Result<T> = std::result::Result<T, CoreError>;

/// 核心错误类型
#[derive(Debug, Error)]
pub enum CoreError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// 图形 API 错误
    #[error("Graphics error: {0}")]
    Graphics(#[from] GraphicsError),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 初始化错误
    #[error("Initialization error: {0}")]
    Initialization(String),

    /// 运行时错误（调用顺序错误等）
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// 描述符堆已满
    #[error("{heap} descriptor heap exhausted (capacity {capacity})")]
    DescriptorHeapExhausted { heap: &'static str, capacity: u32 },

    /// 描述符堆容量非法
    #[error("Invalid capacity {capacity} for {heap} descriptor heap (limit {limit})")]
    InvalidDescriptorCapacity {
        heap: &'static str,
        capacity: u32,
        limit: u32,
    },

    /// 等待 fence 超时
    #[error("Timed out after {timeout:?} waiting for fence value {value}")]
    FenceTimeout { value: u64, timeout: Duration },
}

/// 配置相关的错误
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 配置文件未找到
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    /// 配置文件解析失败
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    /// 配置值无效
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// 图形 API 相关的错误
#[derive(Debug, Error)]
pub enum GraphicsError {
    /// 设备创建失败
    #[error("Device creation failed: {0}")]
    DeviceCreation(String),

    /// 没有满足最低特性级别的适配器
    #[error("No adapter supports feature level {0}")]
    NoSuitableAdapter(String),

    /// 设备丢失
    #[error("Device lost: {0}")]
    DeviceLost(String),

    /// Fence 创建、signal 或等待失败
    #[error("Fence operation failed: {0}")]
    FenceFailure(String),

    /// 队列提交失败
    #[error("Queue submission failed: {0}")]
    QueueSubmission(String),

    /// 命令列表操作失败
    #[error("Command execution failed: {0}")]
    CommandExecution(String),

    /// 描述符堆创建失败
    #[error("Descriptor heap creation failed: {0}")]
    DescriptorHeapCreation(String),

    /// 资源创建失败
    #[error("Resource creation failed: {0}")]
    ResourceCreation(String),

    /// 交换链错误
    #[error("Swapchain error: {0}")]
    SwapchainError(String),
}

impl CoreError {
    /// 是否为致命错误
    ///
    /// 只有 fence 等待超时是可恢复的，其余错误都应当让调用方有序关闭。
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CoreError::FenceTimeout { .. })
    }

    /// 是否由设备丢失引起
    pub fn is_device_lost(&self) -> bool {
        matches!(self, CoreError::Graphics(GraphicsError::DeviceLost(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::DescriptorHeapExhausted {
            heap: "RTV",
            capacity: 4,
        };
        assert_eq!(err.to_string(), "RTV descriptor heap exhausted (capacity 4)");

        let err: CoreError = GraphicsError::DeviceLost("removed".to_string()).into();
        assert_eq!(err.to_string(), "Graphics error: Device lost: removed");
    }

    #[test]
    fn test_error_classification() {
        let timeout = CoreError::FenceTimeout {
            value: 3,
            timeout: Duration::from_millis(5),
        };
        assert!(!timeout.is_fatal());

        let lost: CoreError = GraphicsError::DeviceLost("hung".to_string()).into();
        assert!(lost.is_fatal());
        assert!(lost.is_device_lost());

        let full = CoreError::DescriptorHeapExhausted {
            heap: "SRV",
            capacity: 1,
        };
        assert!(full.is_fatal());
        assert!(!full.is_device_lost());
    }

    #[test]
    fn test_config_error_conversion() {
        let err: CoreError = ConfigError::FileNotFound("config.toml".to_string()).into();
        assert!(matches!(err, CoreError::Config(ConfigError::FileNotFound(_))));
    }
}
