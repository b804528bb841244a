//! 配置管理模块
//!
//! 提供帧管线核心配置的加载、解析和管理功能。
//! 支持从 TOML 配置文件加载，也支持命令行参数覆盖。
//!
//! # 配置文件格式 (config.toml)
//!
//! ```toml
//! [window]
//! width = 1280
//! height = 720
//! title = "GPU Frame Core"
//! resizable = true
//!
//! [graphics]
//! backend = "headless"  # 或 "dx12"
//! vsync = true
//! fullscreen = false
//! use_warp = false
//! debug_layer = false
//! video_memory_reservation_mb = 0
//! clear_color = [0.1, 0.1, 0.15, 1.0]
//!
//! [descriptors]
//! render_target = 512
//! depth_stencil = 512
//! shader_resource = 4096
//! unordered_access = 512
//!
//! [headless]
//! completion = "threaded"  # 或 "immediate"
//! latency_ms = 2
//!
//! [logging]
//! level = "info"      # trace, debug, info, warn, error
//! file_output = false
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use super::error::{ConfigError, Result};
use crate::renderer::descriptor::DescriptorHeapType;

/// 全局配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// 窗口配置
    #[serde(default)]
    pub window: WindowConfig,

    /// 图形配置
    #[serde(default)]
    pub graphics: GraphicsConfig,

    /// 描述符堆容量
    #[serde(default)]
    pub descriptors: DescriptorConfig,

    /// 模拟 GPU 配置
    #[serde(default)]
    pub headless: HeadlessConfig,

    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// 窗口配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    #[serde(default = "default_title")]
    pub title: String,

    #[serde(default = "default_resizable")]
    pub resizable: bool,
}

/// 图形配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphicsConfig {
    /// 图形后端选择
    #[serde(default = "default_backend")]
    pub backend: GraphicsBackend,

    /// 垂直同步
    #[serde(default = "default_vsync")]
    pub vsync: bool,

    /// 启动时全屏
    #[serde(default)]
    pub fullscreen: bool,

    /// 使用 WARP 软件适配器
    #[serde(default)]
    pub use_warp: bool,

    /// 启用 D3D12 调试层
    #[serde(default)]
    pub debug_layer: bool,

    /// 预留显存（MB），0 表示不预留
    #[serde(default)]
    pub video_memory_reservation_mb: u64,

    /// 每帧清屏颜色，缺省表示不清屏
    #[serde(default = "default_clear_color")]
    pub clear_color: Option<[f32; 4]>,

    /// BeginFrame 等待 fence 的超时（毫秒），缺省表示无限等待
    #[serde(default)]
    pub frame_wait_timeout_ms: Option<u64>,
}

/// 图形后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphicsBackend {
    /// 软件模拟的 GPU，所有平台可用
    Headless,
    /// DirectX 12 后端
    Dx12,
}

/// 四个描述符堆的容量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescriptorConfig {
    #[serde(default = "default_render_target")]
    pub render_target: u32,

    #[serde(default = "default_depth_stencil")]
    pub depth_stencil: u32,

    #[serde(default = "default_shader_resource")]
    pub shader_resource: u32,

    #[serde(default = "default_unordered_access")]
    pub unordered_access: u32,
}

/// 模拟 GPU 的完成方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadlessCompletion {
    /// 提交即完成
    Immediate,
    /// 后台线程按延迟完成
    Threaded,
}

/// 模拟 GPU 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeadlessConfig {
    #[serde(default = "default_completion")]
    pub completion: HeadlessCompletion,

    /// 每个命令列表的模拟执行时间
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,

    #[serde(default = "default_file_output")]
    pub file_output: bool,

    #[serde(default = "default_log_file")]
    pub log_file: String,
}

/// 日志级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

// 默认值函数
fn default_width() -> u32 { 1280 }
fn default_height() -> u32 { 720 }
fn default_title() -> String { "GPU Frame Core".to_string() }
fn default_resizable() -> bool { true }
fn default_backend() -> GraphicsBackend {
    if cfg!(target_os = "windows") {
        GraphicsBackend::Dx12
    } else {
        GraphicsBackend::Headless
    }
}
fn default_vsync() -> bool { true }
fn default_clear_color() -> Option<[f32; 4]> { Some([0.1, 0.1, 0.15, 1.0]) }
fn default_render_target() -> u32 { 512 }
fn default_depth_stencil() -> u32 { 512 }
fn default_shader_resource() -> u32 { 4096 }
fn default_unordered_access() -> u32 { 512 }
fn default_completion() -> HeadlessCompletion { HeadlessCompletion::Threaded }
fn default_latency_ms() -> u64 { 2 }
fn default_log_level() -> LogLevel { LogLevel::Info }
fn default_file_output() -> bool { false }
fn default_log_file() -> String { "gpu_frame_core.log".to_string() }

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            title: default_title(),
            resizable: default_resizable(),
        }
    }
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            vsync: default_vsync(),
            fullscreen: false,
            use_warp: false,
            debug_layer: false,
            video_memory_reservation_mb: 0,
            clear_color: default_clear_color(),
            frame_wait_timeout_ms: None,
        }
    }
}

impl Default for DescriptorConfig {
    fn default() -> Self {
        Self {
            render_target: default_render_target(),
            depth_stencil: default_depth_stencil(),
            shader_resource: default_shader_resource(),
            unordered_access: default_unordered_access(),
        }
    }
}

impl DescriptorConfig {
    /// 指定堆类型的容量，采样器堆不由核心管理
    pub fn capacity(&self, heap_type: DescriptorHeapType) -> Option<u32> {
        match heap_type {
            DescriptorHeapType::RenderTarget => Some(self.render_target),
            DescriptorHeapType::DepthStencil => Some(self.depth_stencil),
            DescriptorHeapType::ShaderResource => Some(self.shader_resource),
            DescriptorHeapType::UnorderedAccess => Some(self.unordered_access),
            DescriptorHeapType::Sampler => None,
        }
    }
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            completion: default_completion(),
            latency_ms: default_latency_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file_output: default_file_output(),
            log_file: default_log_file(),
        }
    }
}

impl Config {
    /// 从配置文件加载
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let contents = std::fs::read_to_string(path)
            .map_err(|_| ConfigError::FileNotFound(path_str.clone()))?;

        Self::from_toml(&contents)
    }

    /// 从 TOML 文本解析
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// 从配置文件加载，如果文件不存在则使用默认配置
    pub fn from_file_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::from_file(path).unwrap_or_default()
    }

    /// 保存配置到文件
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        std::fs::write(path, contents)?;
        Ok(())
    }

    /// 从命令行参数覆盖配置
    ///
    /// 支持的参数：
    /// - `--dx12` / `--headless`: 选择后端
    /// - `--width <value>` / `--height <value>`: 设置窗口尺寸
    /// - `--no-vsync`: 关闭垂直同步
    /// - `--warp`: 使用 WARP 适配器
    pub fn apply_args<I>(&mut self, args: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();

        if args.iter().any(|a| a == "--dx12") {
            self.graphics.backend = GraphicsBackend::Dx12;
        }

        if args.iter().any(|a| a == "--headless") {
            self.graphics.backend = GraphicsBackend::Headless;
        }

        if args.iter().any(|a| a == "--no-vsync") {
            self.graphics.vsync = false;
        }

        if args.iter().any(|a| a == "--warp") {
            self.graphics.use_warp = true;
        }

        if let Some(idx) = args.iter().position(|a| a == "--width") {
            if let Some(width_str) = args.get(idx + 1) {
                if let Ok(width) = width_str.parse() {
                    self.window.width = width;
                }
            }
        }

        if let Some(idx) = args.iter().position(|a| a == "--height") {
            if let Some(height_str) = args.get(idx + 1) {
                if let Ok(height) = height_str.parse() {
                    self.window.height = height;
                }
            }
        }
    }

    /// 验证配置的有效性
    pub fn validate(&self) -> Result<()> {
        if self.window.width == 0 || self.window.height == 0 {
            return Err(ConfigError::InvalidValue {
                field: "window.width/height".to_string(),
                reason: "Window dimensions must be greater than 0".to_string(),
            }
            .into());
        }

        for heap_type in DescriptorHeapType::MANAGED {
            let Some(capacity) = self.descriptors.capacity(heap_type) else {
                continue;
            };
            let limit = heap_type.max_capacity(heap_type.default_shader_visible());
            if capacity == 0 || capacity > limit {
                return Err(ConfigError::InvalidValue {
                    field: format!("descriptors.{}", heap_type.config_key()),
                    reason: format!("Capacity must be within 1..={}", limit),
                }
                .into());
            }
        }

        if let Some(color) = self.graphics.clear_color {
            if color.iter().any(|c| !c.is_finite()) {
                return Err(ConfigError::InvalidValue {
                    field: "graphics.clear_color".to_string(),
                    reason: "Clear color components must be finite".to_string(),
                }
                .into());
            }
        }

        Ok(())
    }
}

impl GraphicsBackend {
    /// 获取后端名称
    pub fn name(&self) -> &'static str {
        match self {
            GraphicsBackend::Headless => "Headless",
            GraphicsBackend::Dx12 => "DirectX 12",
        }
    }
}
