//! # gamecomp
//!
//! A compositing window manager for a single fullscreen game session.
//!
//! One game (or the session shell) is shown at a time, scaled and
//! letterboxed to the output, with overlay and notification surfaces
//! layered on top and a short cross-fade whenever the focus changes.
//!
//! ## Architecture
//!
//! - `compositor`: the context object, event handling and the main loop
//! - `focus`: picks the focus, overlay and notification surfaces
//! - `surface`: per-surface state and the stacking-ordered registry
//! - `renderer`: damage tracking, resource lifecycle and frame painting
//! - `effects`: the focus cross-fade
//! - `input`: cursor visibility, confinement and software cursor
//! - `protocol`: the display-server seam and its backends
//! - `config`: TOML configuration
//! - `error`: fatal errors and protocol error classification
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::atomic::AtomicBool;
//! use gamecomp::protocol::headless::HeadlessDisplay;
//! use gamecomp::renderer::SoftwareRenderer;
//! use gamecomp::{Compositor, GameCompConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let display = HeadlessDisplay::new(1920, 1080);
//!     let mut compositor = Compositor::new(display, SoftwareRenderer::new(), GameCompConfig::default());
//!     compositor.initialize()?;
//!     compositor.run(&AtomicBool::new(false))
//! }
//! ```

pub mod clock;
pub mod compositor;
pub mod config;
pub mod effects;
pub mod error;
pub mod focus;
pub mod input;
pub mod protocol;
pub mod renderer;
pub mod surface;

// Re-export main types for easy access
pub use compositor::{Compositor, Session};
pub use config::GameCompConfig;
pub use error::CompositorError;
pub use protocol::DisplayServer;
pub use renderer::Renderer;
pub use surface::{Surface, SurfaceId, SurfaceRegistry};

pub use anyhow::{Context, Error, Result};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
