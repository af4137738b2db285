//! End-to-end focus arbitration over the headless display

mod common;

use common::{Harness, BLUE, GREEN, RED};
use gamecomp::protocol::headless::Request;
use gamecomp::protocol::{FullscreenAction, PropertyKey, SizeHints};
use gamecomp::surface::Geometry;

#[test]
fn test_most_recently_damaged_game_takes_focus() {
    let mut h = Harness::new(1920, 1080);
    let a = h.game(1920, 1080, 1, RED);
    let b = h.game(1920, 1080, 2, BLUE);
    h.settle();

    h.damage(a);
    h.damage(b);
    h.settle();
    assert_eq!(h.focus(), Some(b));
    assert!(h.compositor.session().game_focused);
    assert_eq!(h.compositor.display().input_focus(), Some(b));

    // A overtakes B again
    h.damage(a);
    h.settle();
    assert_eq!(h.focus(), Some(a));
    assert_eq!(h.compositor.display().stacking().last(), Some(&a));
}

#[test]
fn test_shell_is_focused_without_games() {
    let mut h = Harness::new(1920, 1080);
    let shell = h.shell(1920, 1080, GREEN);
    h.settle();
    assert_eq!(h.focus(), Some(shell));
    assert!(!h.compositor.session().game_focused);

    let game = h.game(1920, 1080, 4, RED);
    h.damage(game);
    h.settle();
    assert_eq!(h.focus(), Some(game));

    h.display().destroy_window(game);
    h.settle();
    assert_eq!(h.focus(), Some(shell));
    assert!(h.compositor.surface(game).is_none());
}

#[test]
fn test_unmapped_games_lose_focus() {
    let mut h = Harness::new(1920, 1080);
    let a = h.game(1920, 1080, 1, RED);
    let b = h.game(1920, 1080, 2, BLUE);
    h.settle();
    h.damage(a);
    h.damage(b);
    h.settle();
    assert_eq!(h.focus(), Some(b));

    h.display().unmap_window(b);
    h.settle();
    assert_eq!(h.focus(), Some(a));
}

#[test]
fn test_focus_is_nudged_to_the_origin_once() {
    let mut h = Harness::new(1920, 1080);
    let game = h.game(1920, 1080, 1, RED);
    h.settle();
    assert_eq!(h.focus(), Some(game));

    let moves: Vec<_> = h
        .compositor
        .display()
        .requests()
        .iter()
        .filter(|r| matches!(r, Request::Move(id, _, _) if *id == game))
        .cloned()
        .collect();
    assert_eq!(moves, vec![Request::Move(game, 1, 1), Request::Move(game, 0, 0)]);
    assert!(h.compositor.surface(game).unwrap().nudged);
}

#[test]
fn test_fixed_size_hints_resize_the_focus() {
    let mut h = Harness::new(1920, 1080);
    let game = h.game(1920, 1080, 1, RED);
    h.settle();

    h.display().set_size_hints(
        game,
        SizeHints {
            min_size: Some((1280, 720)),
            max_size: Some((1280, 720)),
        },
    );
    h.settle();

    assert_eq!(
        h.compositor.display().geometry_of(game).map(|g| (g.width, g.height)),
        Some((1280, 720))
    );
    let session = h.compositor.session();
    assert!(session.focus_needs_scale);
    assert!((session.fit_ratio - 1.5).abs() < 1e-4);
}

#[test]
fn test_fullscreen_focus_is_stretched_to_the_output() {
    let mut h = Harness::new(1920, 1080);
    let game = h.game(800, 600, 1, RED);
    h.settle();
    assert!(h.compositor.session().focus_needs_scale);

    h.display().request_fullscreen(game, FullscreenAction::Add);
    h.settle();
    assert!(h.compositor.surface(game).unwrap().is_fullscreen);
    assert_eq!(
        h.compositor.display().geometry_of(game).map(|g| (g.width, g.height)),
        Some((1920, 1080))
    );
    assert!(!h.compositor.session().focus_needs_scale);
}

#[test]
fn test_overlay_and_notification_are_classified_by_width() {
    let mut h = Harness::new(1920, 1080);
    h.display().set_global(PropertyKey::GamesRunning, 1);
    let game = h.game(1920, 1080, 1, RED);
    let overlay = h.overlay(1920, 1080, 0, BLUE);
    let notification = h.overlay(400, 120, 0, GREEN);
    h.settle();

    let session = h.compositor.session();
    assert_eq!(session.focus, Some(game));
    assert_eq!(session.overlay, Some(overlay));
    assert_eq!(session.notification, Some(notification));
    assert_eq!(session.games_running, 1);
}

#[test]
fn test_motion_is_selected_on_all_descendants_of_the_focus() {
    let mut h = Harness::new(1920, 1080);
    let display = h.display();
    let game = display.create_window(Geometry::new(0, 0, 1920, 1080), false);
    let child = display.create_child(game, Geometry::new(0, 0, 1920, 1080), false);
    let grandchild = display.create_child(child, Geometry::new(0, 0, 640, 480), false);
    display.set_property(game, PropertyKey::GameId, 3);
    display.map_window(game);
    h.settle();

    assert_eq!(h.focus(), Some(game));
    let display = h.compositor.display();
    assert_eq!(
        display.selection_of(child),
        Some(gamecomp::protocol::InputSelection::PointerMotion)
    );
    assert_eq!(
        display.selection_of(grandchild),
        Some(gamecomp::protocol::InputSelection::PointerMotion)
    );
}
