//! 外部系統的實作：本機檔案、Embryoscope API、Clinisys 來源與 SQLite 湖泊

pub mod clinisys_csv;
#[cfg(feature = "mysql")]
pub mod clinisys_mysql;
pub mod embryoscope_client;
pub mod lake_db;
pub mod local_storage;

use crate::config::lake_config::ClinisysSettings;
use crate::domain::ports::ClinisysSource;
use crate::utils::error::{EtlError, Result};

pub use clinisys_csv::CsvClinisysSource;
#[cfg(feature = "mysql")]
pub use clinisys_mysql::MySqlClinisysSource;
pub use embryoscope_client::EmbryoscopeClient;
pub use lake_db::LakeDb;
pub use local_storage::LocalStorage;

/// 依 `clinisys.source` 建立來源
pub async fn open_clinisys_source(settings: &ClinisysSettings) -> Result<Box<dyn ClinisysSource>> {
    match settings.source.to_lowercase().as_str() {
        "csv" => {
            let dir = settings
                .csv_dir
                .as_ref()
                .ok_or_else(|| EtlError::MissingConfigError {
                    field: "clinisys.csv_dir".to_string(),
                })?;
            Ok(Box::new(CsvClinisysSource::new(dir)))
        }
        #[cfg(feature = "mysql")]
        "mysql" => {
            let connection_string = settings.connection_string.as_ref().ok_or_else(|| {
                EtlError::MissingConfigError {
                    field: "clinisys.connection_string".to_string(),
                }
            })?;
            Ok(Box::new(MySqlClinisysSource::connect(connection_string).await?))
        }
        other => Err(EtlError::InvalidConfigValueError {
            field: "clinisys.source".to_string(),
            value: other.to_string(),
            reason: "Unsupported source (is the `mysql` feature enabled?)".to_string(),
        }),
    }
}
