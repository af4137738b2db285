//! Per-surface buffer and texture lifecycle, and the scan-out bypass
//!
//! A surface's compositing resources are created lazily the first time it
//! is painted and released on unmap, on destroy, or when the surface is
//! handed to the display directly. Invariant: `buffer.is_some()` iff
//! `texture.is_some()`.

use anyhow::Result;
use log::{debug, info, trace};

use super::{Renderer, TextureFormat};
use crate::protocol::DisplayServer;
use crate::surface::{Surface, SurfaceId, SurfaceRegistry};

/// Bind a backing buffer and texture for `surface` if it has none.
///
/// A surface without a known pixel format cannot be bound and is skipped.
pub fn ensure<D, R>(display: &mut D, renderer: &mut R, surface: &mut Surface) -> Result<()>
where
    D: DisplayServer + ?Sized,
    R: Renderer + ?Sized,
{
    if surface.buffer.is_some() || surface.format.is_none() {
        return Ok(());
    }

    let Some(buffer) = display.name_buffer(surface.id)? else {
        trace!("No backing buffer for {} yet", surface.id);
        return Ok(());
    };

    let format = if surface.is_overlay {
        TextureFormat::Alpha
    } else {
        TextureFormat::Opaque
    };
    let (width, height) = surface.geometry.outer_size();

    let texture = match renderer.create_texture(width, height, format) {
        Ok(texture) => texture,
        Err(e) => {
            display.free_buffer(buffer)?;
            return Err(e);
        }
    };

    surface.buffer = Some(buffer);
    surface.texture = Some(texture);
    surface.upload_pending = true;
    trace!("Bound {:?} resources for {}", format, surface.id);
    Ok(())
}

/// Release `surface`'s buffer and texture and forget its damage state
pub fn teardown<D, R>(display: &mut D, renderer: &mut R, surface: &mut Surface) -> Result<()>
where
    D: DisplayServer + ?Sized,
    R: Renderer + ?Sized,
{
    release(display, renderer, surface)?;
    surface.damaged = false;
    surface.valid_contents = false;
    Ok(())
}

/// Drop a buffer that no longer matches the surface size, keeping its
/// damage state; the next paint binds a fresh one.
pub fn drop_stale_buffer<D, R>(display: &mut D, renderer: &mut R, surface: &mut Surface) -> Result<()>
where
    D: DisplayServer + ?Sized,
    R: Renderer + ?Sized,
{
    release(display, renderer, surface)
}

fn release<D, R>(display: &mut D, renderer: &mut R, surface: &mut Surface) -> Result<()>
where
    D: DisplayServer + ?Sized,
    R: Renderer + ?Sized,
{
    if let Some(texture) = surface.texture.take() {
        renderer.destroy_texture(texture);
    }
    if let Some(buffer) = surface.buffer.take() {
        display.free_buffer(buffer)?;
    }
    surface.upload_pending = false;
    Ok(())
}

/// Copy the current buffer contents into the surface's texture.
///
/// Returns `false` if the surface has no resources or its buffer could not
/// be read.
pub fn refresh<D, R>(display: &mut D, renderer: &mut R, surface: &mut Surface) -> Result<bool>
where
    D: DisplayServer + ?Sized,
    R: Renderer + ?Sized,
{
    let (Some(buffer), Some(texture)) = (surface.buffer, surface.texture) else {
        return Ok(false);
    };

    match display.read_buffer(buffer)? {
        Some(image) => {
            renderer.upload_texture(texture, &image)?;
            surface.upload_pending = false;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// The surface currently handed to the display instead of composited
#[derive(Debug, Default)]
pub struct ScanoutBypass {
    active: Option<SurfaceId>,
}

impl ScanoutBypass {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active(&self) -> Option<SurfaceId> {
        self.active
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Stop compositing `surface`: release its resources and unredirect it
    pub fn engage<D, R>(&mut self, display: &mut D, renderer: &mut R, surface: &mut Surface) -> Result<()>
    where
        D: DisplayServer + ?Sized,
        R: Renderer + ?Sized,
    {
        teardown(display, renderer, surface)?;
        display.unredirect(surface.id)?;
        self.active = Some(surface.id);
        info!("⚡ Scan-out bypass engaged for {}", surface.id);
        Ok(())
    }

    /// Re-enroll the bypassed surface, if any, and rebind its resources.
    ///
    /// Returns the surface that was re-enrolled.
    pub fn reverse<D, R>(
        &mut self,
        display: &mut D,
        renderer: &mut R,
        registry: &mut SurfaceRegistry,
    ) -> Result<Option<SurfaceId>>
    where
        D: DisplayServer + ?Sized,
        R: Renderer + ?Sized,
    {
        let Some(id) = self.active.take() else {
            return Ok(None);
        };

        display.redirect(id)?;
        if let Some(surface) = registry.get_mut(id) {
            ensure(display, renderer, surface)?;
        }
        debug!("Scan-out bypass reversed for {}", id);
        Ok(Some(id))
    }

    /// Forget a bypassed surface that no longer exists
    pub fn forget(&mut self, id: SurfaceId) {
        if self.active == Some(id) {
            self.active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::headless::{HeadlessDisplay, Request};
    use crate::protocol::PixelImage;
    use crate::renderer::SoftwareRenderer;
    use crate::surface::Geometry;

    fn setup() -> (HeadlessDisplay, SoftwareRenderer, Surface) {
        let mut display = HeadlessDisplay::new(1920, 1080);
        let id = display.create_window(Geometry::new(0, 0, 640, 480), false);
        display.set_contents(id, PixelImage::solid(640, 480, 0x0080_8080));
        let attributes = display.attributes_of(id).expect("window exists");
        let surface = Surface::new(id, &attributes);
        (display, SoftwareRenderer::new(), surface)
    }

    #[test]
    fn test_ensure_binds_once() {
        let (mut display, mut renderer, mut surface) = setup();

        ensure(&mut display, &mut renderer, &mut surface).unwrap();
        let texture = surface.texture;
        assert!(surface.has_resources());
        assert!(surface.upload_pending);

        ensure(&mut display, &mut renderer, &mut surface).unwrap();
        assert_eq!(surface.texture, texture);
        assert_eq!(renderer.texture_count(), 1);
    }

    #[test]
    fn test_ensure_without_format_is_noop() {
        let (mut display, mut renderer, mut surface) = setup();
        surface.format = None;

        ensure(&mut display, &mut renderer, &mut surface).unwrap();
        assert!(!surface.has_resources());
        assert_eq!(renderer.texture_count(), 0);
    }

    #[test]
    fn test_teardown_releases_everything() {
        let (mut display, mut renderer, mut surface) = setup();
        ensure(&mut display, &mut renderer, &mut surface).unwrap();
        assert!(refresh(&mut display, &mut renderer, &mut surface).unwrap());
        assert!(!surface.upload_pending);
        surface.damaged = true;
        surface.valid_contents = true;

        teardown(&mut display, &mut renderer, &mut surface).unwrap();

        assert!(surface.buffer.is_none() && surface.texture.is_none());
        assert!(!surface.damaged && !surface.valid_contents);
        assert_eq!(renderer.texture_count(), 0);
        assert_eq!(display.live_buffers(), 0);
    }

    #[test]
    fn test_stale_buffer_keeps_damage_state() {
        let (mut display, mut renderer, mut surface) = setup();
        ensure(&mut display, &mut renderer, &mut surface).unwrap();
        surface.damaged = true;
        surface.valid_contents = true;

        drop_stale_buffer(&mut display, &mut renderer, &mut surface).unwrap();

        assert!(!surface.has_resources());
        assert!(surface.damaged && surface.valid_contents);
    }

    #[test]
    fn test_bypass_round_trip() {
        let (mut display, mut renderer, surface) = setup();
        let id = surface.id;
        let mut registry = SurfaceRegistry::new();
        registry.insert(surface, None);

        let mut bypass = ScanoutBypass::new();
        {
            let surface = registry.get_mut(id).unwrap();
            ensure(&mut display, &mut renderer, surface).unwrap();
            bypass.engage(&mut display, &mut renderer, surface).unwrap();
        }
        assert_eq!(bypass.active(), Some(id));
        assert!(!registry.get(id).unwrap().has_resources());
        assert!(display.requests().contains(&Request::Unredirect(id)));

        let reversed = bypass.reverse(&mut display, &mut renderer, &mut registry).unwrap();
        assert_eq!(reversed, Some(id));
        assert!(!bypass.is_active());
        assert!(registry.get(id).unwrap().has_resources());
        assert!(display.requests().contains(&Request::Redirect(id)));

        assert_eq!(bypass.reverse(&mut display, &mut renderer, &mut registry).unwrap(), None);
    }
}
