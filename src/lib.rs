pub mod adapters;
pub mod app;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

pub use adapters::{EmbryoscopeClient, LakeDb, LocalStorage};
pub use config::LakeConfig;
pub use core::{EtlEngine, StageSequence};
pub use utils::error::{EtlError, Result};
