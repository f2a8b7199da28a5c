use crate::core::casting::ColumnRules;
use crate::core::text::clinic_slug;
use crate::utils::error::{EtlError, Result};
use crate::utils::validation::{
    validate_identifier, validate_non_empty_string, validate_one_of, validate_path,
    validate_positive_number, validate_range, validate_required_field, validate_url, Validate,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `lake.toml` 的完整內容
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LakeConfig {
    #[serde(default)]
    pub lake: LakeSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default)]
    pub extraction: ExtractionSettings,
    #[serde(default)]
    pub embryoscope: Vec<ClinicConfig>,
    #[serde(default)]
    pub clinisys: ClinisysSettings,
    #[serde(default)]
    pub silver: SilverSettings,
    #[serde(default)]
    pub combine: CombineSettings,
    #[serde(default)]
    pub export: ExportSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LakeSettings {
    pub root: String,
    pub export_dir: String,
    pub central_db: String,
    pub clinisys_db: String,
}

impl Default for LakeSettings {
    fn default() -> Self {
        Self {
            root: "database".to_string(),
            export_dir: "exports".to_string(),
            central_db: "huntington_data_lake.db".to_string(),
            clinisys_db: "clinisys_all.db".to_string(),
        }
    }
}

impl LakeSettings {
    pub fn root_path(&self) -> PathBuf {
        PathBuf::from(&self.root)
    }

    pub fn central_db_path(&self) -> PathBuf {
        self.root_path().join(&self.central_db)
    }

    pub fn clinisys_db_path(&self) -> PathBuf {
        self.root_path().join(&self.clinisys_db)
    }

    /// 每個診所一個 DB：`embryoscope_{slug}.db`
    pub fn clinic_db_path(&self, clinic: &str) -> PathBuf {
        self.root_path()
            .join(format!("embryoscope_{}.db", clinic_slug(clinic)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub log_dir: String,
    pub file_logging: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            log_dir: "logs".to_string(),
            file_logging: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    pub rate_limit_delay_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub timeout_seconds: u64,
    pub max_workers: usize,
    pub token_refresh_patients: usize,
    pub token_refresh_treatments: usize,
    pub parallel_clinics: bool,
    pub batch_size: usize,
    pub show_progress: bool,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            rate_limit_delay_ms: 100,
            max_retries: 3,
            retry_backoff_ms: 1000,
            timeout_seconds: 30,
            max_workers: 3,
            token_refresh_patients: 50,
            token_refresh_treatments: 100,
            parallel_clinics: true,
            batch_size: 1000,
            show_progress: true,
        }
    }
}

impl ExtractionSettings {
    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_millis(self.rate_limit_delay_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// 一台 Embryoscope 儀器
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClinicConfig {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub login: String,
    pub password: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ClinicConfig {
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.ip, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClinisysTable {
    pub name: String,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub primary_key: Option<String>,
}

impl ClinisysTable {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            query: None,
            primary_key: None,
        }
    }

    pub fn query(&self) -> String {
        self.query
            .clone()
            .unwrap_or_else(|| format!("SELECT * FROM {}", self.name))
    }
}

pub const DEFAULT_CLINISYS_TABLES: [&str; 13] = [
    "view_congelamentos_embrioes",
    "view_congelamentos_ovulos",
    "view_descongelamentos_embrioes",
    "view_descongelamentos_ovulos",
    "view_embrioes_congelados",
    "view_extrato_atendimentos_central",
    "view_medicamentos",
    "view_medicamentos_prescricoes",
    "view_micromanipulacao",
    "view_micromanipulacao_oocitos",
    "view_pacientes",
    "view_tratamentos",
    "view_unidades",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClinisysSettings {
    pub source: String,
    pub connection_string: Option<String>,
    pub csv_dir: Option<String>,
    pub tables: Vec<ClinisysTable>,
    pub columns: ColumnRules,
}

impl Default for ClinisysSettings {
    fn default() -> Self {
        Self {
            source: "csv".to_string(),
            connection_string: None,
            csv_dir: Some("clinisys_csv".to_string()),
            tables: DEFAULT_CLINISYS_TABLES
                .iter()
                .map(|name| ClinisysTable::named(name))
                .collect(),
            columns: ColumnRules::default(),
        }
    }
}

impl ClinisysSettings {
    pub fn table(&self, name: &str) -> Option<&ClinisysTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// 設定檔的 primary_key 優先，否則用各 view 的預設主鍵
    pub fn primary_key(&self, table: &str) -> String {
        if let Some(key) = self.table(table).and_then(|t| t.primary_key.clone()) {
            return key;
        }
        match table {
            "view_micromanipulacao" => "codigo_ficha",
            "view_micromanipulacao_oocitos" => "id",
            "view_pacientes" => "codigo",
            "view_extrato_atendimentos_central" => "agendamento_id",
            _ => "id",
        }
        .to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SilverSettings {
    /// 空值比例超過此百分比的欄位會被移除
    pub null_rate_threshold: f64,
}

impl Default for SilverSettings {
    fn default() -> Self {
        Self {
            null_rate_threshold: 90.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CombineSettings {
    pub strategy: String,
    pub tolerance_days: i64,
    pub join_type: String,
}

impl Default for CombineSettings {
    fn default() -> Self {
        Self {
            strategy: "best".to_string(),
            tolerance_days: 1,
            join_type: "left".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportTarget {
    pub name: String,
    pub table: String,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub file_stem: Option<String>,
    #[serde(default = "default_formats")]
    pub formats: Vec<String>,
    #[serde(default)]
    pub bundle: bool,
}

fn default_formats() -> Vec<String> {
    vec!["xlsx".to_string()]
}

impl ExportTarget {
    pub fn file_stem(&self) -> &str {
        self.file_stem.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportSettings {
    #[serde(default)]
    pub targets: Vec<ExportTarget>,
}

impl LakeConfig {
    /// 從 TOML 檔案載入配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(EtlError::IoError)?;
        Self::from_toml_str(&content)
    }

    /// 從 TOML 字串解析配置
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed = substitute_env_vars(content)?;
        toml::from_str(&processed).map_err(|e| EtlError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    pub fn enabled_clinics(&self) -> impl Iterator<Item = &ClinicConfig> {
        self.embryoscope.iter().filter(|c| c.enabled)
    }

    pub fn clinic(&self, name: &str) -> Option<&ClinicConfig> {
        self.embryoscope
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn export_target(&self, name: &str) -> Option<&ExportTarget> {
        self.export.targets.iter().find(|t| t.name == name)
    }
}

/// 替換環境變數 (例如 ${EMBRYOSCOPE_PASSWORD})；未定義的保持原樣
pub fn substitute_env_vars(content: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").map_err(|e| EtlError::ConfigError {
        message: format!("invalid placeholder pattern: {}", e),
    })?;

    let result = re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
    });

    Ok(result.to_string())
}

impl Validate for LakeConfig {
    fn validate(&self) -> Result<()> {
        validate_path("lake.root", &self.lake.root)?;
        validate_path("lake.export_dir", &self.lake.export_dir)?;
        validate_path("lake.central_db", &self.lake.central_db)?;
        validate_path("lake.clinisys_db", &self.lake.clinisys_db)?;
        validate_one_of(
            "logging.level",
            &self.logging.level,
            &["trace", "debug", "info", "warn", "error"],
        )?;

        let ex = &self.extraction;
        validate_positive_number("extraction.max_workers", ex.max_workers, 1)?;
        validate_positive_number("extraction.max_retries", ex.max_retries as usize, 1)?;
        validate_positive_number("extraction.timeout_seconds", ex.timeout_seconds as usize, 1)?;
        validate_positive_number(
            "extraction.token_refresh_patients",
            ex.token_refresh_patients,
            1,
        )?;
        validate_positive_number(
            "extraction.token_refresh_treatments",
            ex.token_refresh_treatments,
            1,
        )?;
        validate_positive_number("extraction.batch_size", ex.batch_size, 1)?;

        for (i, clinic) in self.embryoscope.iter().enumerate() {
            let field = |name: &str| format!("embryoscope[{}].{}", i, name);
            validate_non_empty_string(&field("name"), &clinic.name)?;
            validate_non_empty_string(&field("login"), &clinic.login)?;
            validate_range(&field("port"), clinic.port as i64, 1, 65535)?;
            validate_url(&field("ip"), &clinic.base_url())?;
        }

        let cs = &self.clinisys;
        validate_one_of("clinisys.source", &cs.source, &["mysql", "csv"])?;
        match cs.source.to_lowercase().as_str() {
            "mysql" => {
                validate_required_field("clinisys.connection_string", &cs.connection_string)?;
            }
            _ => {
                validate_required_field("clinisys.csv_dir", &cs.csv_dir)?;
            }
        }
        for table in &cs.tables {
            validate_identifier("clinisys.tables.name", &table.name)?;
            if let Some(key) = &table.primary_key {
                validate_identifier("clinisys.tables.primary_key", key)?;
            }
        }

        if !(0.0..=100.0).contains(&self.silver.null_rate_threshold) {
            return Err(EtlError::InvalidConfigValueError {
                field: "silver.null_rate_threshold".to_string(),
                value: self.silver.null_rate_threshold.to_string(),
                reason: "Must be a percentage between 0 and 100".to_string(),
            });
        }

        validate_one_of(
            "combine.strategy",
            &self.combine.strategy,
            &["exact", "tolerance", "best"],
        )?;
        validate_one_of("combine.join_type", &self.combine.join_type, &["left", "full"])?;
        validate_range("combine.tolerance_days", self.combine.tolerance_days, 0, 7)?;

        for target in &self.export.targets {
            validate_non_empty_string("export.targets.name", &target.name)?;
            validate_identifier("export.targets.table", &target.table)?;
            if target.formats.is_empty() {
                return Err(EtlError::MissingConfigError {
                    field: format!("export.targets[{}].formats", target.name),
                });
            }
            for format in &target.formats {
                validate_one_of("export.targets.formats", format, &["xlsx", "csv"])?;
            }
        }

        Ok(())
    }
}
