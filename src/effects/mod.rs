//! Visual transitions
//!
//! Currently only the focus cross-fade.

pub mod fade;

pub use fade::{FadeController, FadeState, FinishedFade};
