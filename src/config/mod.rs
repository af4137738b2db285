//! Configuration management for gamecomp
//!
//! Settings are loaded from a TOML file; every section and key is optional
//! and falls back to its default. Command-line flags are applied on top of
//! the loaded values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration struct containing all compositor settings
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct GameCompConfig {
    /// Run-mode toggles
    #[serde(default)]
    pub general: GeneralConfig,

    /// Focus cross-fade
    #[serde(default)]
    pub fade: FadeConfig,

    /// Cursor auto-hide and warp suppression
    #[serde(default)]
    pub cursor: CursorConfig,

    /// Focus and overlay arbitration
    #[serde(default)]
    pub focus: FocusConfig,

    /// Frame statistics
    #[serde(default)]
    pub frame: FrameConfig,
}

/// Run-mode toggles, each also settable from the command line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneralConfig {
    /// Composite and present frames; when off only focus is managed
    pub render: bool,

    /// Synchronous protocol mode (every request round-trips)
    pub synchronous: bool,

    /// Draw the debug overlay
    pub debug_overlay: bool,

    /// Log every inbound notification
    pub debug_events: bool,

    /// Allow handing a lone fullscreen surface directly to the display
    pub allow_unredirect: bool,

    /// Display to connect to; `None` uses the environment
    pub display: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FadeConfig {
    /// Cross-fade duration in milliseconds
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CursorConfig {
    /// Idle time before the cursor hides, in milliseconds
    pub hide_timeout_ms: u64,

    /// Pointer position changes ignored after a focus change
    pub ignored_warps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FocusConfig {
    /// Width an overlay surface must have to be chosen as the main overlay
    pub overlay_reference_width: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FrameConfig {
    /// Presented frames between frame-rate samples
    pub fps_sample_frames: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            render: true,
            synchronous: false,
            debug_overlay: false,
            debug_events: false,
            allow_unredirect: false,
            display: None,
        }
    }
}

impl Default for FadeConfig {
    fn default() -> Self {
        Self { duration_ms: 200 }
    }
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            hide_timeout_ms: 10_000,
            ignored_warps: 3,
        }
    }
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            overlay_reference_width: 1920,
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            fps_sample_frames: 5,
        }
    }
}

impl FadeConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

impl CursorConfig {
    pub fn hide_timeout(&self) -> Duration {
        Duration::from_millis(self.hide_timeout_ms)
    }
}

impl GameCompConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let expanded_path = expand_home(path.as_ref())?;

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: GameCompConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.fade.duration_ms == 0 || self.fade.duration_ms > 10_000 {
            anyhow::bail!("Invalid fade duration_ms: must be between 1 and 10000");
        }

        if self.cursor.hide_timeout_ms == 0 {
            anyhow::bail!("Invalid cursor hide_timeout_ms: must be greater than 0");
        }

        if self.frame.fps_sample_frames == 0 {
            anyhow::bail!("Invalid fps_sample_frames: must be greater than 0");
        }

        if self.focus.overlay_reference_width == 0 {
            anyhow::bail!("Invalid overlay_reference_width: must be greater than 0");
        }

        Ok(())
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            Ok(Path::new(&home).join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}
