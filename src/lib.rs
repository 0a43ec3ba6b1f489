//! See README.md for more

mod command;
mod container;
mod dockerfile;
mod engine;
mod misc;
mod paths;
mod tarball;

/// Layered filesystem change computation used by the commit/build path
pub mod changes;
/// The engine-mode (`-e`) op surface, run as a subprocess inside a container
pub mod engine_mode;
/// Pre/post event hook dispatch
pub mod hooks;
/// Request and reply framing for the control socket
pub mod wire;

pub use command::*;
pub use container::*;
pub use dockerfile::*;
pub use engine::*;
pub use hooks::{HookMode, HookRegistry};
pub use misc::*;
pub use paths::*;
pub use tarball::*;
