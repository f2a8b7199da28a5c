//! 對每個啟用的診所呼叫所有 Embryoscope 端點，列出成功/失敗
//!
//! 用法: probe_endpoints [lake.toml]

use anyhow::Context;
use clinic_lake_etl::app::pipelines::embryoscope_extract::{list_under, patient_idx, treatment_names};
use clinic_lake_etl::domain::model::value_to_text;
use clinic_lake_etl::domain::ports::EmbryoscopeApi;
use clinic_lake_etl::utils::logger;
use clinic_lake_etl::{EmbryoscopeClient, LakeConfig};
use serde_json::Value;
use std::time::Instant;

struct Probe {
    endpoint: &'static str,
    outcome: std::result::Result<String, String>,
    elapsed_ms: u128,
}

fn describe(body: &Option<Value>) -> String {
    match body {
        None => "empty".to_string(),
        Some(Value::Object(map)) => {
            let keys: Vec<_> = map.keys().take(4).cloned().collect();
            format!("keys: {}", keys.join(", "))
        }
        Some(Value::Array(items)) => format!("{} items", items.len()),
        Some(other) => other.to_string().chars().take(40).collect(),
    }
}

async fn timed<F>(endpoint: &'static str, fut: F) -> (Probe, Option<Value>)
where
    F: std::future::Future<Output = clinic_lake_etl::Result<Option<Value>>>,
{
    let start = Instant::now();
    let result = fut.await;
    let elapsed_ms = start.elapsed().as_millis();
    match result {
        Ok(body) => (
            Probe {
                endpoint,
                outcome: Ok(describe(&body)),
                elapsed_ms,
            },
            body,
        ),
        Err(e) => (
            Probe {
                endpoint,
                outcome: Err(e.to_string()),
                elapsed_ms,
            },
            None,
        ),
    }
}

async fn probe_clinic(client: &EmbryoscopeClient) -> Vec<Probe> {
    let mut probes = Vec::new();

    let (probe, patients) = timed("GET/patients", client.get_patients()).await;
    probes.push(probe);
    probes.push(timed("GET/ongoingpatients", client.get_ongoing_patients()).await.0);
    probes.push(timed("GET/IDASCORE", client.get_idascore()).await.0);

    // 第一個病人/療程/胚胎帶動後續需要參數的端點
    let patient = patients
        .as_ref()
        .and_then(|body| list_under(body, "Patients").into_iter().find_map(patient_idx));
    let Some(patient) = patient else {
        println!("  ⚠️ No patient returned, parameterized endpoints skipped");
        return probes;
    };

    let (probe, treatments) = timed("GET/TREATMENT", client.get_treatments(&patient)).await;
    probes.push(probe);
    probes.push(timed("GET/transfers", client.get_transfers(&patient)).await.0);

    let Some(treatment) = treatments.as_ref().and_then(|b| treatment_names(b).into_iter().next()) else {
        println!("  ⚠️ Patient {} has no treatment, embryo endpoints skipped", patient);
        return probes;
    };

    let (probe, embryos) = timed("GET/embryodata", client.get_embryo_data(&patient, &treatment)).await;
    probes.push(probe);
    probes.push(timed("GET/embryoID", client.get_embryo_ids(&patient, &treatment)).await.0);

    let embryo = embryos.as_ref().and_then(|body| {
        list_under(body, "EmbryoDataList")
            .into_iter()
            .find_map(|e| e.get("EmbryoID").and_then(value_to_text))
    });
    let Some(embryo) = embryo else {
        println!("  ⚠️ Treatment {} has no embryo, per-embryo endpoints skipped", treatment);
        return probes;
    };

    probes.push(timed("GET/fertilizationtime", client.get_fertilization_time(&embryo)).await.0);
    probes.push(timed("GET/imageruns", client.get_image_runs(&embryo)).await.0);
    probes.push(timed("GET/evaluation", client.get_evaluation(&embryo)).await.0);
    probes.push(timed("GET/embryofate", client.get_embryo_fate(&embryo)).await.0);
    probes.push(timed("GET/embryodetails", client.get_embryo_details(&embryo)).await.0);
    probes
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logger::init_cli_logger(false);

    let path = std::env::args().nth(1).unwrap_or_else(|| "lake.toml".to_string());
    let config = LakeConfig::from_file(&path).with_context(|| format!("loading {}", path))?;

    let mut failures = 0;
    for clinic in config.enabled_clinics() {
        println!("🔍 {} ({})", clinic.name, clinic.base_url());
        let client = EmbryoscopeClient::new(clinic, &config.extraction)
            .with_context(|| format!("building client for {}", clinic.name))?;

        for probe in probe_clinic(&client).await {
            match &probe.outcome {
                Ok(summary) => println!("  ✅ {:<22} {:>6}ms  {}", probe.endpoint, probe.elapsed_ms, summary),
                Err(e) => {
                    failures += 1;
                    println!("  ❌ {:<22} {:>6}ms  {}", probe.endpoint, probe.elapsed_ms, e);
                }
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("{} endpoint calls failed", failures);
    }
    println!("✅ All endpoints responded");
    Ok(())
}
