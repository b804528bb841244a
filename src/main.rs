//! gpu_frame_core 演示程序
//!
//! 打开一个窗口，每帧清屏并呈现。
//!
//! ```bash
//! # 使用配置文件
//! cargo run
//!
//! # 命令行覆盖
//! cargo run -- --headless --no-vsync
//! ```
//!
//! 按键：F11 切换全屏，V 切换垂直同步。

use anyhow::Context;
use gpu_frame_core::core::{log, Config};
use gpu_frame_core::gfx::SurfaceTarget;
use gpu_frame_core::renderer::Renderer;
use gpu_frame_core::{app_error, app_info};
use tracing::{debug, info, warn};
use winit::dpi::LogicalSize;
use winit::event::{ElementState, Event, KeyEvent, WindowEvent};
use winit::event_loop::{ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::raw_window_handle::HasWindowHandle;
use winit::window::WindowBuilder;

fn main() -> anyhow::Result<()> {
    // 1. 加载配置（在初始化日志之前）
    let mut config = Config::from_file_or_default("config.toml");
    config.apply_args(std::env::args().skip(1));
    config.validate().context("invalid configuration")?;

    // 2. 初始化日志系统
    let log_file = config
        .logging
        .file_output
        .then_some(config.logging.log_file.as_str());
    log::init_logger(config.logging.level, config.logging.file_output, log_file);
    app_info!(version = env!("CARGO_PKG_VERSION"), "gpu_frame_core starting");
    info!(
        backend = config.graphics.backend.name(),
        width = config.window.width,
        height = config.window.height,
        vsync = config.graphics.vsync,
        "Graphics configuration"
    );

    // 3. 创建窗口
    let event_loop = EventLoop::new()?;
    let window = WindowBuilder::new()
        .with_title(format!("{} [{}]", config.window.title, config.graphics.backend.name()))
        .with_inner_size(LogicalSize::new(config.window.width, config.window.height))
        .with_resizable(config.window.resizable)
        .build(&event_loop)?;
    let surface = SurfaceTarget::Window(window.window_handle()?.as_raw());

    // 4. 创建渲染器
    let mut renderer = Some(Renderer::new(&config, surface).context("failed to initialize renderer")?);
    info!("Renderer initialized, entering main loop");

    event_loop.set_control_flow(ControlFlow::Poll);
    event_loop.run(move |event, elwt| match event {
        Event::WindowEvent { event, .. } => {
            let Some(active) = renderer.as_mut() else {
                return;
            };
            match event {
                WindowEvent::CloseRequested => {
                    info!("Close requested, shutting down...");
                    elwt.exit();
                }
                WindowEvent::Resized(size) => {
                    debug!(width = size.width, height = size.height, "Window resized");
                    if let Err(e) = active.resize(size.width, size.height) {
                        app_error!("Resize failed: {}", e);
                        elwt.exit();
                    }
                }
                WindowEvent::KeyboardInput {
                    event:
                        KeyEvent {
                            physical_key: PhysicalKey::Code(code),
                            state: ElementState::Pressed,
                            repeat: false,
                            ..
                        },
                    ..
                } => match code {
                    KeyCode::F11 => {
                        let fullscreen = !active.is_fullscreen();
                        active.set_fullscreen(fullscreen);
                    }
                    KeyCode::KeyV => {
                        let vsync = active.toggle_vsync();
                        info!(vsync, "VSync toggled");
                    }
                    _ => {}
                },
                WindowEvent::RedrawRequested => {
                    if let Err(e) = active.render_frame() {
                        if e.is_fatal() {
                            app_error!("Frame failed: {}", e);
                            elwt.exit();
                        } else {
                            warn!("Frame skipped: {}", e);
                        }
                    }
                }
                _ => {}
            }
        }
        Event::AboutToWait => window.request_redraw(),
        Event::LoopExiting => {
            if let Some(renderer) = renderer.take() {
                let frames = renderer.frame_number();
                match renderer.shutdown() {
                    Ok(()) => app_info!(frames, "Renderer shut down"),
                    Err(e) => app_error!("Shutdown failed: {}", e),
                }
            }
        }
        _ => {}
    })?;

    Ok(())
}
