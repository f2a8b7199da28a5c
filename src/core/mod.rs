pub mod casting;
pub mod etl;
pub mod features;
pub mod flatten;
pub mod hashing;
pub mod matching;
pub mod patient_id;
pub mod sequence;
pub mod text;

pub use crate::domain::model::{Record, StageContext, StageReport, Table};
pub use crate::domain::ports::{ClinisysSource, EmbryoscopeApi, Stage, Storage};
pub use crate::utils::error::Result;
pub use etl::EtlEngine;
pub use sequence::StageSequence;
