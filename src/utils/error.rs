use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("Zip operation failed: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("API request failed: {0}")]
    ApiError(#[from] reqwest::Error),

    #[error("API returned status {status} for {endpoint}")]
    ApiStatusError { endpoint: String, status: u16 },

    #[error("Authentication failed: {message}")]
    AuthenticationError { message: String },

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Source database error: {message}")]
    SourceError { message: String },

    #[error("Excel export error: {message}")]
    ExcelError { message: String },

    #[error("Configuration error: {message}")]
    ConfigError { message: String },

    #[error("Configuration validation failed for '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Stage '{stage}' failed: {details}")]
    TransformationError { stage: String, details: String },
}

/// 錯誤分類，用於日誌與退出碼
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Network,
    Api,
    Authentication,
    Configuration,
    Data,
    Storage,
    Io,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl EtlError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            EtlError::ApiError(_) => ErrorCategory::Network,
            EtlError::ApiStatusError { .. } => ErrorCategory::Api,
            EtlError::AuthenticationError { .. } => ErrorCategory::Authentication,
            EtlError::ConfigError { .. }
            | EtlError::ConfigValidationError { .. }
            | EtlError::InvalidConfigValueError { .. }
            | EtlError::MissingConfigError { .. } => ErrorCategory::Configuration,
            EtlError::CsvError(_)
            | EtlError::SerializationError(_)
            | EtlError::ProcessingError { .. }
            | EtlError::ValidationError { .. } => ErrorCategory::Data,
            EtlError::DatabaseError(_) | EtlError::SourceError { .. } => ErrorCategory::Storage,
            EtlError::IoError(_) | EtlError::ZipError(_) | EtlError::ExcelError { .. } => {
                ErrorCategory::Io
            }
            EtlError::TransformationError { .. } => ErrorCategory::Internal,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self.category() {
            ErrorCategory::Network | ErrorCategory::Api => ErrorSeverity::Medium,
            ErrorCategory::Authentication | ErrorCategory::Configuration => ErrorSeverity::Critical,
            ErrorCategory::Data | ErrorCategory::Internal => ErrorSeverity::High,
            ErrorCategory::Storage | ErrorCategory::Io => ErrorSeverity::Critical,
        }
    }

    /// 暫時性錯誤才值得重試
    pub fn is_retryable(&self) -> bool {
        match self {
            EtlError::ApiError(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            EtlError::ApiStatusError { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Network => "檢查網路連線與 Embryoscope 伺服器 IP/port，稍後重新執行此步驟",
            ErrorCategory::Api => "API 回應異常，確認伺服器狀態後重新執行",
            ErrorCategory::Authentication => "確認設定檔中的 login/password 是否正確",
            ErrorCategory::Configuration => "檢查 lake.toml 設定與環境變數",
            ErrorCategory::Data => "檢查來源資料格式，必要時重新執行前一個階段",
            ErrorCategory::Storage => "確認資料庫檔案存在且未被其他程式鎖定",
            ErrorCategory::Io => "確認輸出目錄存在且有寫入權限",
            ErrorCategory::Internal => "查看日誌以找出失敗的階段後重新執行",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            EtlError::ApiError(_) => "無法連線到 Embryoscope API".to_string(),
            EtlError::ApiStatusError { endpoint, status } => {
                format!("API {} 回傳 HTTP {}", endpoint, status)
            }
            EtlError::AuthenticationError { .. } => "Embryoscope 登入失敗".to_string(),
            EtlError::MissingConfigError { field } => format!("缺少必要設定: {}", field),
            EtlError::InvalidConfigValueError { field, value, .. } => {
                format!("設定 {} 的值 '{}' 無效", field, value)
            }
            EtlError::TransformationError { stage, .. } => format!("階段 {} 執行失敗", stage),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
