use crate::domain::model::{StageContext, StageReport};
use crate::domain::ports::Stage;
use crate::utils::error::{EtlError, Result};
use crate::utils::monitor::SystemMonitor;
use serde_json::{Map, Value};
use std::time::Instant;

/// 依序執行多個階段，共用同一個 StageContext
pub struct StageSequence {
    stages: Vec<Box<dyn Stage>>,
    monitor: Option<SystemMonitor>,
    execution_id: String,
}

impl StageSequence {
    pub fn new(execution_id: impl Into<String>) -> Self {
        Self {
            stages: Vec::new(),
            monitor: None,
            execution_id: execution_id.into(),
        }
    }

    /// 啟用或禁用系統監控
    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        self.monitor = enabled.then(|| SystemMonitor::new(true));
        self
    }

    pub fn add_stage(&mut self, stage: Box<dyn Stage>) {
        self.stages.push(stage);
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// 執行所有階段；第一個失敗就停止
    pub async fn execute_all(&self) -> Result<Vec<StageReport>> {
        let mut context = StageContext::new(self.execution_id.clone());
        let mut reports = Vec::new();

        if let Some(monitor) = &self.monitor {
            monitor.log_stats("Sequence started");
        }

        for stage in &self.stages {
            if !stage.should_execute(&context) {
                tracing::info!("⏭️ Skipping stage: {} (condition not met)", stage.name());
                continue;
            }

            tracing::info!("🚀 [{}] Running stage: {}", self.execution_id, stage.name());
            let start = Instant::now();
            match stage.run(&context).await {
                Ok(mut report) => {
                    report.duration_ms = start.elapsed().as_millis() as u64;
                    tracing::info!(
                        "✅ Stage executed: {} (read: {}, written: {}, duration: {}ms)",
                        report.stage,
                        report.rows_read,
                        report.rows_written,
                        report.duration_ms
                    );
                    if let Some(monitor) = &self.monitor {
                        monitor.log_stats(&format!("After {}", report.stage));
                    }
                    context.previous_reports.push(report.clone());
                    reports.push(report);
                }
                Err(e) => {
                    tracing::error!("❌ Stage {} failed: {}", stage.name(), e);
                    return Err(EtlError::TransformationError {
                        stage: stage.name().to_string(),
                        details: format!("Stage execution failed: {}", e),
                    });
                }
            }
        }

        if let Some(monitor) = &self.monitor {
            monitor.log_final_stats();
        }

        Ok(reports)
    }

    /// 執行摘要
    pub fn execution_summary(reports: &[StageReport]) -> Map<String, Value> {
        let mut summary = Map::new();
        let rows_read: usize = reports.iter().map(|r| r.rows_read).sum();
        let rows_written: usize = reports.iter().map(|r| r.rows_written).sum();
        let duration: u64 = reports.iter().map(|r| r.duration_ms).sum();

        summary.insert("total_stages".to_string(), Value::from(reports.len()));
        summary.insert("total_rows_read".to_string(), Value::from(rows_read));
        summary.insert("total_rows_written".to_string(), Value::from(rows_written));
        summary.insert("total_duration_ms".to_string(), Value::from(duration));
        summary.insert(
            "executed_stages".to_string(),
            Value::Array(reports.iter().map(|r| Value::from(r.stage.clone())).collect()),
        );
        summary.insert(
            "outputs".to_string(),
            Value::Array(
                reports
                    .iter()
                    .flat_map(|r| r.outputs.iter().cloned().map(Value::from))
                    .collect(),
            ),
        );
        summary
    }
}
