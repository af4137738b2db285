//! # gamecomp
//!
//! Compositing window manager for game sessions. Shows the most recently
//! active game (or the session shell) scaled to the output, with overlays
//! on top and a cross-fade on every focus change.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use gamecomp::config::expand_home;
use gamecomp::protocol::headless::HeadlessDisplay;
use gamecomp::renderer::SoftwareRenderer;
use gamecomp::{Compositor, CompositorError, DisplayServer, GameCompConfig, Renderer};

/// Output size of the in-memory display used by `--headless`
const HEADLESS_OUTPUT: (u32, u32) = (1280, 720);

#[derive(Parser, Debug)]
#[command(name = "gamecomp")]
#[command(about = "A compositing window manager for fullscreen game sessions")]
#[command(version, disable_version_flag = true)]
struct Cli {
    /// Display to connect to
    #[arg(short = 'd', long)]
    display: Option<String>,

    /// Manage focus but never paint
    #[arg(short = 'n', long)]
    no_render: bool,

    /// Synchronous protocol requests (debugging)
    #[arg(short = 'S', long)]
    synchronous: bool,

    /// Draw the debug overlay
    #[arg(short = 'v', long)]
    debug_overlay: bool,

    /// Log every inbound notification
    #[arg(short = 'V', long)]
    debug_events: bool,

    /// Allow scan-out bypass for unscaled fullscreen games
    #[arg(short = 'u', long)]
    allow_unredirect: bool,

    /// Path to configuration file
    #[arg(short, long, default_value = "~/.config/gamecomp/gamecomp.toml")]
    config: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Run against an in-memory display instead of a real one
    #[arg(long)]
    headless: bool,

    /// Print version
    #[arg(long, action = clap::ArgAction::Version)]
    version: Option<bool>,
}

impl Cli {
    /// Loaded configuration with command-line flags applied on top
    fn apply(&self, mut config: GameCompConfig) -> GameCompConfig {
        if self.no_render {
            config.general.render = false;
        }
        if self.synchronous {
            config.general.synchronous = true;
        }
        if self.debug_overlay {
            config.general.debug_overlay = true;
        }
        if self.debug_events {
            config.general.debug_events = true;
        }
        if self.allow_unredirect {
            config.general.allow_unredirect = true;
        }
        if let Some(display) = &self.display {
            config.general.display = Some(display.clone());
        }
        config
    }
}

fn load_config(path: &str) -> GameCompConfig {
    let path = PathBuf::from(path);
    let exists = expand_home(&path).map(|p| p.exists()).unwrap_or(false);
    if !exists {
        info!("📝 No configuration at {}, using defaults", path.display());
        return GameCompConfig::default();
    }

    match GameCompConfig::load(&path) {
        Ok(config) => {
            info!("✅ Configuration loaded from: {}", path.display());
            config
        }
        Err(e) => {
            error!("❌ Failed to load configuration: {:#}", e);
            info!("📝 Using default configuration");
            GameCompConfig::default()
        }
    }
}

fn run_compositor<D: DisplayServer, R: Renderer>(
    display: D,
    renderer: R,
    config: GameCompConfig,
    shutdown: &AtomicBool,
) -> Result<()> {
    let mut compositor = Compositor::new(display, renderer, config);
    compositor.initialize()?;
    info!("✨ gamecomp is ready");
    compositor.run(shutdown)
}

fn run_blocking(config: GameCompConfig, headless: bool, shutdown: &AtomicBool) -> Result<()> {
    if headless {
        info!("🖥️ Headless mode: compositing an in-memory display");
        let display = HeadlessDisplay::new(HEADLESS_OUTPUT.0, HEADLESS_OUTPUT.1);
        return run_compositor(display, SoftwareRenderer::new(), config, shutdown);
    }

    #[cfg(feature = "x11")]
    {
        use gamecomp::protocol::x11::X11Display;

        let display = X11Display::connect(
            config.general.display.as_deref(),
            config.general.synchronous,
            config.general.render,
        )?;
        let renderer = SoftwareRenderer::with_sink(display.frame_sink()?);
        run_compositor(display, renderer, config, shutdown)
    }

    #[cfg(not(feature = "x11"))]
    {
        Err(CompositorError::Connection(
            "built without the x11 feature; use --headless".to_string(),
        )
        .into())
    }
}

async fn wait_for_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.context("Failed to listen for SIGINT")?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    if cli.debug {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug")).init();
    } else {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    }

    info!("🚀 Starting gamecomp");
    info!("📄 Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        "🔧 Built {} for {} from {}",
        env!("BUILD_DATE"),
        env!("TARGET_TRIPLE"),
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    );

    let config = cli.apply(load_config(&cli.config));
    let headless = cli.headless;

    let shutdown = Arc::new(AtomicBool::new(false));
    let loop_shutdown = Arc::clone(&shutdown);
    let mut compositor = tokio::task::spawn_blocking(move || run_blocking(config, headless, &loop_shutdown));

    let result = tokio::select! {
        joined = &mut compositor => joined,
        signal = wait_for_signal() => {
            signal?;
            info!("🛑 Shutdown requested");
            shutdown.store(true, Ordering::Relaxed);
            compositor.await
        }
    };

    match result.context("Compositor task panicked")? {
        Ok(()) => {
            info!("👋 gamecomp shutting down");
            Ok(())
        }
        Err(e) => {
            match e.downcast_ref::<CompositorError>() {
                Some(CompositorError::AnotherCompositor(_)) => {
                    error!("❌ Another compositing manager is already running")
                }
                _ => error!("❌ {:#}", e),
            }
            std::process::exit(1);
        }
    }
}
