// Domain layer: models and ports. No I/O here.

pub mod model;
pub mod ports;

pub use model::{Record, StageContext, StageReport, Table};
pub use ports::{ClinisysSource, EmbryoscopeApi, Stage, Storage};
