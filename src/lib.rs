#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
compile_error!("inline-hook only supports x86 and x86-64 targets");

pub mod alloc;
pub mod code;
pub mod error;
pub mod hook;
pub mod host;
pub mod patcher;
pub mod registry;
pub mod scan;

pub use error::HookError;
pub use hook::inline::InlineHook;
pub use hook::settings::HookSettings;
pub use hook::Function;
pub use host::{Host, System};
