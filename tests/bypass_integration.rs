//! Scan-out bypass for unscaled fullscreen games

mod common;

use common::{Harness, BLUE, GREEN, RED};
use gamecomp::protocol::PropertyKey;
use gamecomp::surface::OPAQUE;
use gamecomp::GameCompConfig;

fn bypassing() -> (Harness, gamecomp::SurfaceId) {
    let mut config = GameCompConfig::default();
    config.general.allow_unredirect = true;

    let mut h = Harness::with_config(1920, 1080, config);
    let game = h.game(1920, 1080, 1, RED);
    h.settle();
    h.damage(game);

    assert_eq!(h.compositor.bypass().active(), Some(game));
    assert!(!h.compositor.display().is_redirected(game));
    (h, game)
}

#[test]
fn test_bypass_disabled_by_default() {
    let mut h = Harness::new(1920, 1080);
    let game = h.game(1920, 1080, 1, RED);
    h.settle();
    h.damage(game);

    assert_eq!(h.compositor.bypass().active(), None);
    assert!(h.compositor.display().is_redirected(game));
}

#[test]
fn test_bypassed_game_is_not_composited() {
    let (mut h, game) = bypassing();
    let frames = h.frames();
    let surface = h.compositor.surface(game).expect("tracked");
    assert!(surface.buffer.is_none());
    assert!(surface.texture.is_none());

    h.damage(game);
    h.damage(game);
    assert_eq!(h.frames(), frames);
    assert!(!h.compositor.display().is_redirected(game));
}

#[test]
fn test_scaled_game_is_never_bypassed() {
    let mut config = GameCompConfig::default();
    config.general.allow_unredirect = true;

    let mut h = Harness::with_config(1920, 1080, config);
    let game = h.game(1280, 720, 1, RED);
    h.settle();
    h.damage(game);

    assert_eq!(h.compositor.bypass().active(), None);
    assert!(h.compositor.display().is_redirected(game));
}

#[test]
fn test_visible_overlay_reverses_bypass() {
    let (mut h, game) = bypassing();
    let frames = h.frames();

    h.display().set_global(PropertyKey::GamesRunning, 1);
    h.overlay(1920, 1080, OPAQUE, GREEN);
    h.settle();

    assert_eq!(h.compositor.bypass().active(), None);
    assert!(h.compositor.display().is_redirected(game));
    assert!(h.frames() > frames, "reversal paints in the same pass");
    assert_eq!(h.pixel(960, 540), (0, 255, 0));
}

#[test]
fn test_screen_scale_change_reverses_bypass() {
    let (mut h, game) = bypassing();

    h.display()
        .set_global(PropertyKey::ScreenScale, (u32::MAX as u64 * 2 / 3) as u32);
    h.step();

    assert_eq!(h.compositor.bypass().active(), None);
    assert!(h.compositor.display().is_redirected(game));
    assert!(h.compositor.session().focus_needs_scale);
    assert_eq!(h.pixel(960, 540), (255, 0, 0));
    assert_eq!(h.pixel(100, 100), (0, 0, 0));
}

#[test]
fn test_focus_change_reverses_bypass_and_fades() {
    let (mut h, game) = bypassing();
    let other = h.game(1920, 1080, 2, BLUE);
    h.settle();
    h.damage(other);

    assert_eq!(h.focus(), Some(other));
    assert!(h.compositor.display().is_redirected(game));
    assert!(h.compositor.fade().is_active());
    assert_eq!(h.compositor.bypass().active(), None);

    // Bypass resumes once the fade is over
    h.clock.advance_ms(200);
    h.step();
    assert!(!h.compositor.fade().is_active());
    assert_eq!(h.compositor.bypass().active(), Some(other));
}

#[test]
fn test_destroying_bypassed_game_clears_bypass() {
    let (mut h, game) = bypassing();
    h.display().destroy_window(game);
    h.step();

    assert_eq!(h.compositor.bypass().active(), None);
    assert_eq!(h.compositor.display().live_buffers(), 0);
}
