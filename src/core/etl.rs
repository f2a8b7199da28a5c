use crate::domain::model::{StageContext, StageReport};
use crate::domain::ports::Stage;
use crate::utils::error::{EtlError, Result};
use crate::utils::monitor::SystemMonitor;
use std::time::Instant;

/// 在 blocking 執行緒上跑同步的資料庫工作
///
/// rusqlite 連線不是 `Sync`，不能跨 `.await` 持有，所以各階段把 DB 存取包在這裡。
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EtlError::ProcessingError {
            message: format!("blocking task failed: {}", e),
        })?
}

/// 單一階段的執行器
pub struct EtlEngine<S: Stage> {
    stage: S,
    monitor: SystemMonitor,
}

impl<S: Stage> EtlEngine<S> {
    pub fn new(stage: S) -> Self {
        Self {
            stage,
            monitor: SystemMonitor::new(false),
        }
    }

    pub fn with_monitoring(mut self, enabled: bool) -> Self {
        self.monitor = SystemMonitor::new(enabled);
        self
    }

    pub async fn run(&self) -> Result<StageReport> {
        let context = StageContext::new(uuid::Uuid::new_v4().to_string());
        let name = self.stage.name().to_string();

        if !self.stage.should_execute(&context) {
            tracing::info!("⏭️ Skipping stage: {} (condition not met)", name);
            return Ok(StageReport::new(name));
        }

        tracing::info!("🚀 Starting stage: {}", name);
        self.monitor.log_stats(&format!("{} started", name));

        let start = Instant::now();
        let mut report = self.stage.run(&context).await?;
        report.duration_ms = start.elapsed().as_millis() as u64;

        tracing::info!(
            "✅ Stage {} finished: read={}, written={}, duration={}ms",
            name,
            report.rows_read,
            report.rows_written,
            report.duration_ms
        );
        for output in &report.outputs {
            tracing::info!("💾 Output: {}", output);
        }
        self.monitor.log_stats(&format!("{} completed", name));
        self.monitor.log_final_stats();

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct CountingStage {
        rows: usize,
        fail: bool,
    }

    #[async_trait]
    impl Stage for CountingStage {
        fn name(&self) -> &str {
            "counting"
        }

        async fn run(&self, _context: &StageContext) -> Result<StageReport> {
            if self.fail {
                return Err(EtlError::ProcessingError {
                    message: "boom".to_string(),
                });
            }
            let mut report = StageReport::new("counting");
            report.rows_read = self.rows;
            report.rows_written = self.rows;
            Ok(report)
        }
    }

    #[tokio::test]
    async fn test_engine_runs_stage() {
        let engine = EtlEngine::new(CountingStage { rows: 4, fail: false });
        let report = engine.run().await.unwrap();
        assert_eq!(report.stage, "counting");
        assert_eq!(report.rows_written, 4);
    }

    #[tokio::test]
    async fn test_engine_propagates_error() {
        let engine = EtlEngine::new(CountingStage { rows: 0, fail: true });
        let err = engine.run().await.unwrap_err();
        assert!(matches!(err, EtlError::ProcessingError { .. }));
    }

    #[tokio::test]
    async fn test_blocking_returns_value() {
        let value = blocking(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
    }
}
