//! Frame composition: letterboxing, global scale, overlays and the
//! debug overlay

mod common;

use common::{Harness, GREEN, RED};
use gamecomp::protocol::PropertyKey;
use gamecomp::surface::{OPAQUE, TRANSLUCENT};
use gamecomp::GameCompConfig;

const BLACK: (u8, u8, u8) = (0, 0, 0);

#[test]
fn test_pillarboxed_game() {
    let mut h = Harness::new(1920, 1080);
    let game = h.game(1280, 1024, 1, RED);
    h.settle();
    h.damage(game);

    let (offset_x, offset_y) = h.compositor.session().letterbox_offset;
    assert_eq!(offset_x.round(), 285.0);
    assert_eq!(offset_y, 0.0);

    assert_eq!(h.pixel(100, 540), BLACK);
    assert_eq!(h.pixel(1820, 540), BLACK);
    assert_eq!(h.pixel(960, 540), (255, 0, 0));
    assert_eq!(h.pixel(300, 10), (255, 0, 0));
}

#[test]
fn test_upscaled_game_fills_output() {
    let mut h = Harness::new(1920, 1080);
    let game = h.game(1280, 720, 1, RED);
    h.settle();
    h.damage(game);

    assert!((h.compositor.session().fit_ratio - 1.5).abs() < 1e-6);
    assert_eq!(h.pixel(20, 20), (255, 0, 0));
    assert_eq!(h.pixel(1900, 1060), (255, 0, 0));
}

#[test]
fn test_global_scale_shrinks_and_centers() {
    let mut h = Harness::new(1920, 1080);
    let game = h.game(1920, 1080, 1, RED);
    h.display()
        .set_global(PropertyKey::ScreenScale, (u32::MAX as u64 * 2 / 3) as u32);
    h.settle();
    h.damage(game);

    let (offset_x, offset_y) = h.compositor.session().letterbox_offset;
    assert_eq!((offset_x.round(), offset_y.round()), (320.0, 180.0));
    assert_eq!(h.pixel(100, 100), BLACK);
    assert_eq!(h.pixel(310, 540), BLACK);
    assert_eq!(h.pixel(330, 190), (255, 0, 0));
    assert_eq!(h.pixel(960, 540), (255, 0, 0));
}

#[test]
fn test_overlay_blended_at_its_opacity() {
    let mut h = Harness::new(1920, 1080);
    let game = h.game(1920, 1080, 1, RED);
    h.display().set_global(PropertyKey::GamesRunning, 1);
    h.overlay(1920, 1080, OPAQUE / 2, GREEN);
    h.settle();
    h.damage(game);

    let (r, g, b) = h.pixel(960, 540);
    assert!((120..=136).contains(&r), "red {r}");
    assert!((120..=136).contains(&g), "green {g}");
    assert_eq!(b, 0);
}

#[test]
fn test_overlay_skipped_without_running_games() {
    let mut h = Harness::new(1920, 1080);
    let game = h.game(1920, 1080, 1, RED);
    h.overlay(1920, 1080, OPAQUE, GREEN);
    h.settle();
    h.damage(game);

    assert_eq!(h.pixel(960, 540), (255, 0, 0));
}

#[test]
fn test_notification_without_main_overlay_is_not_drawn() {
    let mut h = Harness::new(1920, 1080);
    let game = h.game(1920, 1080, 1, RED);
    h.display().set_global(PropertyKey::GamesRunning, 1);
    let notification = h.overlay(400, 200, OPAQUE, GREEN);
    h.settle();
    h.damage(notification);
    h.damage(game);

    assert!(h.compositor.session().overlay.is_none());
    assert_eq!(h.compositor.session().notification, Some(notification));
    assert_eq!(h.pixel(1900, 1060), (255, 0, 0));
    assert_eq!(h.pixel(960, 540), (255, 0, 0));
}

#[test]
fn test_notification_sits_bottom_right_of_main_overlay() {
    let mut h = Harness::new(1920, 1080);
    let game = h.game(1920, 1080, 1, RED);
    h.display().set_global(PropertyKey::GamesRunning, 1);
    let overlay = h.overlay(1920, 1080, TRANSLUCENT, GREEN);
    let notification = h.overlay(400, 200, OPAQUE, GREEN);
    h.settle();
    h.damage(overlay);
    h.damage(notification);
    h.damage(game);

    assert_eq!(h.compositor.session().overlay, Some(overlay));
    assert_eq!(h.compositor.session().notification, Some(notification));
    assert_eq!(h.pixel(1900, 1060), (0, 255, 0));
    assert_eq!(h.pixel(1500, 1060), (255, 0, 0));
    assert_eq!(h.pixel(960, 540), (255, 0, 0));
}

#[test]
fn test_overlay_damage_alone_repaints() {
    let mut h = Harness::new(1920, 1080);
    let game = h.game(1920, 1080, 1, RED);
    h.display().set_global(PropertyKey::GamesRunning, 1);
    let overlay = h.overlay(1920, 1080, OPAQUE, GREEN);
    h.settle();
    h.damage(game);

    let frames = h.frames();
    h.damage(overlay);
    assert_eq!(h.frames(), frames + 1);
}

#[test]
fn test_undamaged_focus_is_not_repainted() {
    let mut h = Harness::new(1920, 1080);
    let game = h.game(1920, 1080, 1, RED);
    h.settle();
    h.damage(game);

    let frames = h.frames();
    h.step();
    h.step();
    assert_eq!(h.frames(), frames);
}

#[test]
fn test_no_render_mode_manages_focus_only() {
    let mut config = GameCompConfig::default();
    config.general.render = false;

    let mut h = Harness::with_config(1920, 1080, config);
    let game = h.game(1920, 1080, 1, RED);
    h.settle();
    h.damage(game);

    assert_eq!(h.focus(), Some(game));
    assert_eq!(h.frames(), 0);
    assert_eq!(h.compositor.display().live_buffers(), 0);
}

#[test]
fn test_debug_overlay_lists_state() {
    let mut config = GameCompConfig::default();
    config.general.debug_overlay = true;

    let mut h = Harness::with_config(1920, 1080, config);
    let game = h.game(1920, 1080, 1, RED);
    h.settle();
    h.damage(game);

    let lines = h.compositor.renderer().debug_lines();
    assert!(!lines.is_empty());
    assert!(lines.iter().any(|line| line.text.contains(&game.to_string())));
}
