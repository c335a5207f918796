//! # burrow-settings
//!
//! Configuration for the Burrow tunnel.
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`BurrowSettings::default()`]
//! 2. **Settings file**: `$BURROW_CONFIG` or `~/.burrow/settings.json`,
//!    overlaid on the defaults
//! 3. **Environment variables**: `BURROW_*` overrides
//!
//! The binary applies its command-line flags on top and reads the result
//! once at start-up.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    load_settings, load_settings_from_file, load_settings_from_path, overlay, settings_path,
    split_host_port, validate,
};
pub use types::*;
