//! # apkpatch
//!
//! Injects a `System.loadLibrary` call into the launcher activity of an Android package and
//! rebuilds it as an aligned, signed APK.
//!
//! ```no_run
//!  use apkpatch::{Patcher, PatcherConfig, Toolchain};
//!  use std::path::Path;
//!
//!  let config = PatcherConfig::default();
//!  let toolchain = Toolchain::from_config(&config.tools, config.api_level);
//!  let patcher = Patcher::new(config, toolchain).unwrap();
//!  let artifact = patcher.run(Path::new("app.apk"), Path::new("app-patched.apk")).unwrap();
//!  println!("{artifact}");
//! ```
pub mod android;
pub mod config;
pub mod error;
pub mod events;
pub mod patcher;
pub mod smali_inject;
pub mod smali_locate;
pub mod smali_parse;
pub mod tools;
pub mod types;
pub mod units;
pub mod workspace;

#[cfg(test)]
mod tests;

pub use config::PatcherConfig;
pub use error::{PatchError, PatchResult};
pub use events::{EventSink, PatchEvent, PatchState};
pub use patcher::{CancelToken, PatchedWorkspace, Patcher};
pub use tools::{Assembler, Disassembler, Signer, ToolError, Toolchain};
pub use types::{Artifact, EntryPoint, InjectionSpec, InjectionTarget};
