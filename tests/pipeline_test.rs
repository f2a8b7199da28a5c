use async_trait::async_trait;
use clinic_lake_etl::app::pipelines::clinisys_gold::GOLD_CLINISYS;
use clinic_lake_etl::app::pipelines::combined_gold::GOLD_COMBINED;
use clinic_lake_etl::app::pipelines::embryoscope_gold::GOLD_EMBRYOSCOPE;
use clinic_lake_etl::app::pipelines::{
    ClinisysBronzeStage, ClinisysGoldStage, ClinisysSilverStage, CombinedGoldStage,
    EmbryoscopeConsolidateStage, EmbryoscopeExtractStage, EmbryoscopeGoldStage,
    EmbryoscopeSilverStage, ExportStage,
};
use clinic_lake_etl::config::lake_config::{ClinicConfig, ExportTarget};
use clinic_lake_etl::domain::ports::EmbryoscopeApi;
use clinic_lake_etl::{LakeConfig, LakeDb, LocalStorage, Result, StageSequence};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// 固定回應的 Embryoscope
struct FakeEmbryoscope {
    embryo_calls: AtomicUsize,
}

impl FakeEmbryoscope {
    fn new() -> Self {
        Self {
            embryo_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbryoscopeApi for FakeEmbryoscope {
    fn location(&self) -> &str {
        "Ibirapuera"
    }

    async fn get_patients(&self) -> Result<Option<Value>> {
        Ok(Some(json!({
            "Patients": [
                {"PatientIDx": "P1", "PatientID": "520124", "FirstName": "ANA", "LastName": "LIMA", "DateOfBirth": "1985.03.02"},
                {"PatientIDx": "P2", "PatientID": "777", "FirstName": "BEA", "LastName": "SOUZA", "DateOfBirth": "1990.07.20"}
            ]
        })))
    }

    async fn get_ongoing_patients(&self) -> Result<Option<Value>> {
        Ok(Some(json!({ "Patients": [{"PatientIDx": "P2"}] })))
    }

    async fn get_treatments(&self, patient_idx: &str) -> Result<Option<Value>> {
        Ok(Some(match patient_idx {
            "P1" => json!({ "TreatmentList": ["T1"] }),
            _ => json!({ "TreatmentList": ["T9"] }),
        }))
    }

    async fn get_embryo_data(&self, patient_idx: &str, treatment_name: &str) -> Result<Option<Value>> {
        self.embryo_calls.fetch_add(1, Ordering::SeqCst);
        if (patient_idx, treatment_name) != ("P1", "T1") {
            return Ok(None);
        }
        Ok(Some(json!({
            "EmbryoDataList": [
                {
                    "EmbryoID": "D2024.01.11_S0001_I3027_P-2",
                    "FertilizationTime": "2024-01-11T09:00:00",
                    "WellNumber": 2,
                    "AnnotationList": [{"Name": "t2", "Time": "25.1", "Value": "", "Timestamp": "2024-01-12T10:00:00"}]
                },
                {
                    "EmbryoID": "D2024.01.11_S0001_I3027_P-1",
                    "FertilizationTime": "2024-01-11T09:00:00",
                    "WellNumber": 1,
                    "AnnotationList": [{"Name": "t2", "Time": "24.8", "Value": "", "Timestamp": "2024-01-12T09:40:00"}]
                }
            ]
        })))
    }

    async fn get_idascore(&self) -> Result<Option<Value>> {
        Ok(Some(json!({
            "Scores": [{"EmbryoID": "D2024.01.11_S0001_I3027_P-1", "Viability": 7.5}]
        })))
    }

    async fn refresh_token(&self) -> Result<()> {
        Ok(())
    }
}

fn write_clinisys_csv(dir: &std::path::Path) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(
        dir.join("view_pacientes.csv"),
        "codigo,prontuario_esposa,esposa_nome,marido_nome,inativo\n100,520124,Ana Lima,Joao Lima,0\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("view_micromanipulacao.csv"),
        "codigo_ficha,prontuario,numero_caso,Data_DL\n7,100,1,2024-01-10\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("view_micromanipulacao_oocitos.csv"),
        "id,id_micromanipulacao,InseminacaoOocito,TCD\n1,7,ICSI,Transferido\n2,7,ICSI,Descartado\n3,7,,Descartado\n",
    )
    .unwrap();
}

fn lake_config(dir: &TempDir) -> LakeConfig {
    let mut config = LakeConfig::default();
    config.lake.root = dir.path().join("database").to_string_lossy().to_string();
    config.lake.export_dir = dir.path().join("exports").to_string_lossy().to_string();
    config.extraction.show_progress = false;
    config.extraction.rate_limit_delay_ms = 0;
    config.embryoscope = vec![ClinicConfig {
        name: "Ibirapuera".to_string(),
        ip: "127.0.0.1".to_string(),
        port: 4000,
        login: "lab".to_string(),
        password: "secret".to_string(),
        enabled: true,
    }];
    config.clinisys.source = "csv".to_string();
    config.clinisys.csv_dir = Some(dir.path().join("clinisys_csv").to_string_lossy().to_string());
    config.export.targets = vec![ExportTarget {
        name: "combined".to_string(),
        table: GOLD_COMBINED.to_string(),
        filter: None,
        file_stem: None,
        formats: vec!["csv".to_string()],
        bundle: false,
    }];
    config
}

#[tokio::test]
async fn test_full_lake_from_sources_to_export() {
    let dir = TempDir::new().unwrap();
    write_clinisys_csv(&dir.path().join("clinisys_csv"));
    let config = Arc::new(lake_config(&dir));
    let api = Arc::new(FakeEmbryoscope::new());

    let tables = vec![
        "view_pacientes".to_string(),
        "view_micromanipulacao".to_string(),
        "view_micromanipulacao_oocitos".to_string(),
    ];
    let mut sequence = StageSequence::new("integration");
    sequence.add_stage(Box::new(ClinisysBronzeStage::new(config.clone(), Some(tables))));
    sequence.add_stage(Box::new(ClinisysSilverStage::new(config.clone())));
    sequence.add_stage(Box::new(EmbryoscopeExtractStage::with_apis(
        config.clone(),
        vec![api.clone() as Arc<dyn EmbryoscopeApi>],
    )));
    sequence.add_stage(Box::new(EmbryoscopeSilverStage::new(config.clone(), None)));
    sequence.add_stage(Box::new(EmbryoscopeConsolidateStage::new(config.clone())));
    sequence.add_stage(Box::new(EmbryoscopeGoldStage::new(config.clone())));
    sequence.add_stage(Box::new(ClinisysGoldStage::new(config.clone())));
    sequence.add_stage(Box::new(CombinedGoldStage::new(config.clone())));
    sequence.add_stage(Box::new(ExportStage::new(
        config.clone(),
        LocalStorage::new(&config.lake.export_dir),
        None,
    )));

    let reports = tokio_test::assert_ok!(sequence.execute_all().await);
    assert_eq!(reports.len(), 9);
    assert_eq!(api.embryo_calls.load(Ordering::SeqCst), 2);

    let central = LakeDb::open(config.lake.central_db_path()).unwrap();
    assert_eq!(central.count(GOLD_EMBRYOSCOPE).unwrap(), 2);
    assert_eq!(central.count(GOLD_CLINISYS).unwrap(), 3);

    let patients = central
        .query_records(
            "SELECT PatientIDx, prontuario FROM silver_embryoscope_patients ORDER BY PatientIDx",
            &[],
        )
        .unwrap();
    assert_eq!(patients[0].int("prontuario"), Some(100));
    assert_eq!(patients[1].int("prontuario"), Some(-1));

    let numbers = central
        .query_records(
            "SELECT embryo_EmbryoID, embryo_embryo_number FROM gold_embryoscope_embrioes ORDER BY embryo_embryo_number",
            &[],
        )
        .unwrap();
    assert_eq!(
        numbers[0].text("embryo_EmbryoID").as_deref(),
        Some("D2024.01.11_S0001_I3027_P-1")
    );

    let combine = reports.iter().find(|r| r.stage == "combine").unwrap();
    let stats = &combine.metadata["join_statistics"];
    assert_eq!(stats["tolerance_days"], json!(1));
    assert_eq!(stats["flagged_embryos"], json!(2));
    assert_eq!(stats["matched_rows"], json!(2));

    let export = reports.iter().find(|r| r.stage == "export").unwrap();
    assert_eq!(export.outputs.len(), 1);
    assert!(export.outputs[0].starts_with("combined_"));
    let csv = std::fs::read_to_string(dir.path().join("exports").join(&export.outputs[0])).unwrap();
    assert_eq!(csv.lines().count(), 4);
    assert!(csv.lines().next().unwrap().contains("oocito_id"));
}

#[tokio::test]
async fn test_second_extraction_inserts_nothing() {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(lake_config(&dir));
    let api = Arc::new(FakeEmbryoscope::new());
    let stage = EmbryoscopeExtractStage::with_apis(
        config.clone(),
        vec![api.clone() as Arc<dyn EmbryoscopeApi>],
    );

    let first = stage.run_locations().await;
    let first = first["Ibirapuera"].as_ref().unwrap();
    assert_eq!(first.inserted["patients"], 2);
    assert_eq!(first.inserted["embryo_data"], 2);
    assert_eq!(first.inserted["idascore"], 1);

    let second = stage.run_locations().await;
    let second = second["Ibirapuera"].as_ref().unwrap();
    assert_eq!(second.total_inserted(), 0);
    // P2/T9 has no embryo data yet and is asked again
    assert_eq!(second.new_pairs, 1);
    assert_eq!(api.embryo_calls.load(Ordering::SeqCst), 3);

    let db = LakeDb::open(config.lake.clinic_db_path("Ibirapuera")).unwrap();
    assert_eq!(db.count("data_embryo_data").unwrap(), 2);
    assert_eq!(db.count("bronze_raw_patients").unwrap(), 2);
    assert_eq!(db.count("incremental_runs").unwrap(), 2);
    let methods = db
        .text_set("SELECT DISTINCT change_detection_method FROM view_metadata", &[])
        .unwrap();
    assert!(methods.contains("hash_based"));
}
