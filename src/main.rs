use clap::Parser;
use clinic_lake_etl::app::pipelines::{
    ClinisysBronzeStage, ClinisysGoldStage, ClinisysSilverStage, CombinedGoldStage,
    EmbryoscopeConsolidateStage, EmbryoscopeExtractStage, EmbryoscopeGoldStage,
    EmbryoscopeSilverStage, ExportStage, PrescriptionGoldStage,
};
use clinic_lake_etl::config::{Cli, Command};
use clinic_lake_etl::domain::model::StageReport;
use clinic_lake_etl::domain::ports::Stage;
use clinic_lake_etl::utils::error::ErrorSeverity;
use clinic_lake_etl::utils::{logger, validation::Validate};
use clinic_lake_etl::{EtlEngine, EtlError, LakeConfig, LocalStorage, Result, StageSequence};
use std::sync::Arc;

async fn run_single<S: Stage>(stage: S, monitor: bool) -> Result<Vec<StageReport>> {
    let report = EtlEngine::new(stage).with_monitoring(monitor).run().await?;
    Ok(vec![report])
}

fn full_sequence(config: &Arc<LakeConfig>, skip_extract: bool, monitor: bool) -> Result<StageSequence> {
    let execution_id = format!("run_all_{}", chrono::Local::now().format("%Y%m%d_%H%M%S"));
    let mut sequence = StageSequence::new(execution_id).with_monitoring(monitor);

    sequence.add_stage(Box::new(ClinisysBronzeStage::new(config.clone(), None)));
    sequence.add_stage(Box::new(ClinisysSilverStage::new(config.clone())));
    if skip_extract {
        tracing::info!("⏭️ Embryoscope extraction skipped (--skip-extract)");
    } else {
        sequence.add_stage(Box::new(EmbryoscopeExtractStage::new(config.clone(), None, false)?));
    }
    sequence.add_stage(Box::new(EmbryoscopeSilverStage::new(config.clone(), None)));
    sequence.add_stage(Box::new(EmbryoscopeConsolidateStage::new(config.clone())));
    sequence.add_stage(Box::new(EmbryoscopeGoldStage::new(config.clone())));
    sequence.add_stage(Box::new(ClinisysGoldStage::new(config.clone())));
    sequence.add_stage(Box::new(CombinedGoldStage::new(config.clone())));
    sequence.add_stage(Box::new(PrescriptionGoldStage::new(config.clone())));
    sequence.add_stage(Box::new(ExportStage::new(
        config.clone(),
        LocalStorage::new(&config.lake.export_dir),
        None,
    )));
    Ok(sequence)
}

async fn dispatch(cli: &Cli, config: Arc<LakeConfig>) -> Result<Vec<StageReport>> {
    let monitor = cli.monitor;
    match &cli.command {
        Command::Extract {
            clinic,
            sequential,
            patients,
        } => {
            let stage = EmbryoscopeExtractStage::new(config, clinic.as_deref(), *sequential)?
                .with_patients(patients.clone());
            run_single(stage, monitor).await
        }
        Command::EmbryoscopeSilver { clinic } => {
            run_single(EmbryoscopeSilverStage::new(config, clinic.clone()), monitor).await
        }
        Command::Consolidate => run_single(EmbryoscopeConsolidateStage::new(config), monitor).await,
        Command::EmbryoscopeGold => run_single(EmbryoscopeGoldStage::new(config), monitor).await,
        Command::ClinisysBronze { tables } => {
            let tables = (!tables.is_empty()).then(|| tables.clone());
            run_single(ClinisysBronzeStage::new(config, tables), monitor).await
        }
        Command::ClinisysSilver => run_single(ClinisysSilverStage::new(config), monitor).await,
        Command::ClinisysGold => run_single(ClinisysGoldStage::new(config), monitor).await,
        Command::Combine => run_single(CombinedGoldStage::new(config), monitor).await,
        Command::Prescriptions => run_single(PrescriptionGoldStage::new(config), monitor).await,
        Command::Export { target } => {
            let storage = LocalStorage::new(&config.lake.export_dir);
            run_single(ExportStage::new(config.clone(), storage, target.clone()), monitor).await
        }
        Command::RunAll { skip_extract } => {
            let sequence = full_sequence(&config, *skip_extract, monitor)?;
            tracing::info!("📊 Running {} stages", sequence.len());
            let reports = sequence.execute_all().await?;
            let summary = StageSequence::execution_summary(&reports);
            tracing::info!(
                "📊 Summary: {}",
                serde_json::to_string_pretty(&summary).unwrap_or_default()
            );
            Ok(reports)
        }
    }
}

fn exit_code(e: &EtlError) -> i32 {
    match e.severity() {
        ErrorSeverity::Low => 0,
        ErrorSeverity::Medium => 2,
        ErrorSeverity::High => 1,
        ErrorSeverity::Critical => 3,
    }
}

/// 記錄錯誤並回傳退出碼
fn report_failure(e: &EtlError) -> i32 {
    tracing::error!(
        "❌ ETL process failed: {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    tracing::error!("💡 Recovery suggestion: {}", e.recovery_suggestion());
    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 建議: {}", e.recovery_suggestion());
    exit_code(e)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match LakeConfig::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            logger::init_cli_logger(cli.verbose);
            std::process::exit(report_failure(&e).max(1));
        }
    };
    let guard = logger::init_logging(&config.logging, cli.verbose);

    tracing::info!("🚀 Starting clinic-lake-etl ({})", cli.config.display());
    if cli.verbose {
        tracing::debug!("CLI: {:?}", cli);
    }

    let code = match config.validate() {
        Err(e) => {
            tracing::error!("❌ Configuration validation failed: {}", e);
            report_failure(&e).max(1)
        }
        Ok(()) => {
            if cli.monitor {
                tracing::info!("🔍 System monitoring enabled");
            }
            match dispatch(&cli, Arc::new(config)).await {
                Ok(reports) => {
                    for report in &reports {
                        println!(
                            "✅ {}: read={}, written={}, {}ms",
                            report.stage, report.rows_read, report.rows_written, report.duration_ms
                        );
                        for output in &report.outputs {
                            println!("📁 {}", output);
                        }
                    }
                    0
                }
                Err(e) => report_failure(&e),
            }
        }
    };

    // 先 flush 檔案日誌再離開
    drop(guard);
    if code > 0 {
        std::process::exit(code);
    }
}
