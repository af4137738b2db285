//! Pointer input handling

pub mod cursor;

pub use cursor::{Confinement, CursorManager, CursorPlacement, Motion};
