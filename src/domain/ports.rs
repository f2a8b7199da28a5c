use crate::domain::model::{StageContext, StageReport, Table};
use crate::utils::error::Result;
use async_trait::async_trait;
use serde_json::Value;

pub trait Storage: Send + Sync {
    fn read_file(&self, path: &str) -> impl std::future::Future<Output = Result<Vec<u8>>> + Send;
    fn write_file(
        &self,
        path: &str,
        data: &[u8],
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Embryoscope API 中萃取流程需要的部分
///
/// 所有方法回傳 `Ok(None)` 代表伺服器回應空內容。
#[async_trait]
pub trait EmbryoscopeApi: Send + Sync {
    fn location(&self) -> &str;
    async fn get_patients(&self) -> Result<Option<Value>>;
    async fn get_ongoing_patients(&self) -> Result<Option<Value>>;
    async fn get_treatments(&self, patient_idx: &str) -> Result<Option<Value>>;
    async fn get_embryo_data(&self, patient_idx: &str, treatment_name: &str)
        -> Result<Option<Value>>;
    async fn get_idascore(&self) -> Result<Option<Value>>;
    async fn refresh_token(&self) -> Result<()>;
}

/// Clinisys 來源 (MySQL 或 CSV 匯出)
#[async_trait]
pub trait ClinisysSource: Send + Sync {
    async fn fetch_table(&self, name: &str, query: &str) -> Result<Table>;
}

/// 管線中的一個階段
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn should_execute(&self, _context: &StageContext) -> bool {
        true
    }

    async fn run(&self, context: &StageContext) -> Result<StageReport>;
}
