//! Shared fixtures for the integration tests
//!
//! A `Harness` drives a compositor over an in-memory display with a
//! manually advanced clock.

#![allow(dead_code)]

use gamecomp::clock::ManualClock;
use gamecomp::protocol::headless::HeadlessDisplay;
use gamecomp::protocol::{PixelImage, PropertyKey};
use gamecomp::renderer::SoftwareRenderer;
use gamecomp::surface::Geometry;
use gamecomp::{Compositor, GameCompConfig, SurfaceId};

pub const RED: u32 = 0xffff_0000;
pub const BLUE: u32 = 0xff00_00ff;
pub const GREEN: u32 = 0xff00_ff00;

pub struct Harness {
    pub compositor: Compositor<HeadlessDisplay, SoftwareRenderer>,
    pub clock: ManualClock,
}

impl Harness {
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_config(width, height, GameCompConfig::default())
    }

    pub fn with_config(width: u32, height: u32, config: GameCompConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();

        let clock = ManualClock::new();
        let mut compositor = Compositor::with_clock(
            HeadlessDisplay::new(width, height),
            SoftwareRenderer::new(),
            config,
            Box::new(clock.clone()),
        );
        compositor.initialize().expect("initialize");
        Self { compositor, clock }
    }

    pub fn display(&mut self) -> &mut HeadlessDisplay {
        self.compositor.display_mut()
    }

    pub fn step(&mut self) {
        self.compositor.step().expect("step");
    }

    /// Step until the display stops reporting changes
    pub fn settle(&mut self) {
        for _ in 0..8 {
            self.step();
            if self.compositor.display().pending_events() == 0 {
                return;
            }
        }
    }

    /// Create and map a game window filled with `color`
    pub fn game(&mut self, width: u32, height: u32, game_id: u32, color: u32) -> SurfaceId {
        let display = self.display();
        let id = display.create_window(Geometry::new(0, 0, width, height), false);
        display.set_contents(id, PixelImage::solid(width, height, color));
        display.set_property(id, PropertyKey::GameId, game_id);
        display.map_window(id);
        id
    }

    /// Create and map the session shell
    pub fn shell(&mut self, width: u32, height: u32, color: u32) -> SurfaceId {
        let display = self.display();
        let id = display.create_window(Geometry::new(0, 0, width, height), false);
        display.set_contents(id, PixelImage::solid(width, height, color));
        display.set_property(id, PropertyKey::Shell, 1);
        display.map_window(id);
        id
    }

    /// Create and map an overlay at the given opacity
    pub fn overlay(&mut self, width: u32, height: u32, opacity: u32, color: u32) -> SurfaceId {
        let display = self.display();
        let id = display.create_window(Geometry::new(0, 0, width, height), true);
        display.set_contents(id, PixelImage::solid(width, height, color));
        display.set_property(id, PropertyKey::Overlay, 1);
        display.set_property(id, PropertyKey::Opacity, opacity);
        display.map_window(id);
        id
    }

    /// Report new contents on `id` and process the notification
    pub fn damage(&mut self, id: SurfaceId) {
        self.display().damage(id);
        self.step();
    }

    pub fn clock_now(&self) -> std::time::Instant {
        use gamecomp::clock::Clock;
        self.clock.now()
    }

    pub fn focus(&self) -> Option<SurfaceId> {
        self.compositor.session().focus
    }

    pub fn frames(&self) -> u64 {
        self.compositor.renderer().frames_presented()
    }

    /// RGB of a pixel in the last composited frame
    pub fn pixel(&self, x: u32, y: u32) -> (u8, u8, u8) {
        let p = self
            .compositor
            .renderer()
            .frame()
            .and_then(|f| f.pixel(x, y))
            .expect("pixel in frame");
        (p.red(), p.green(), p.blue())
    }
}
