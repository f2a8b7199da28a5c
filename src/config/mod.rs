#[cfg(feature = "cli")]
pub mod cli;
pub mod lake_config;

#[cfg(feature = "cli")]
pub use cli::{Cli, Command};
pub use lake_config::LakeConfig;
