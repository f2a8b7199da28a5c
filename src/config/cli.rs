use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "clinic-lake-etl")]
#[command(about = "Embryoscope + Clinisys data lake ETL")]
pub struct Cli {
    #[arg(long, global = true, default_value = "lake.toml")]
    pub config: PathBuf,

    #[arg(long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Log CPU/memory at stage boundaries")]
    pub monitor: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Embryoscope API → bronze/data (incremental)
    Extract {
        #[arg(long)]
        clinic: Option<String>,
        #[arg(long, help = "Run clinics one after another")]
        sequential: bool,
        #[arg(long, value_delimiter = ',', help = "Only these PatientIDx values")]
        patients: Vec<String>,
    },
    /// bronze → silver per clinic, with prontuario matching
    EmbryoscopeSilver {
        #[arg(long)]
        clinic: Option<String>,
    },
    /// Per-clinic silver → central silver_embryoscope_*
    Consolidate,
    /// Central silver → gold_embryoscope_embrioes
    EmbryoscopeGold,
    /// Clinisys source → bronze_*
    ClinisysBronze {
        #[arg(long, value_delimiter = ',')]
        tables: Vec<String>,
    },
    /// bronze_* → silver_* (typing, features, prontuario cleaning)
    ClinisysSilver,
    /// silver_* → gold_clinisys_embrioes
    ClinisysGold,
    /// Join Clinisys and Embryoscope gold tables
    Combine,
    /// Transferred embryos × prescriptions (long and wide gold tables)
    Prescriptions,
    /// Export configured tables to xlsx/csv
    Export {
        #[arg(long)]
        target: Option<String>,
    },
    /// Every stage in order
    RunAll {
        #[arg(long)]
        skip_extract: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subcommands() {
        let cli = Cli::parse_from(["clinic-lake-etl", "--verbose", "extract", "--clinic", "Ibirapuera"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from("lake.toml"));
        match cli.command {
            Command::Extract {
                clinic,
                sequential,
                patients,
            } => {
                assert_eq!(clinic.as_deref(), Some("Ibirapuera"));
                assert!(!sequential);
                assert!(patients.is_empty());
            }
            other => panic!("unexpected command: {:?}", other),
        }

        let cli = Cli::parse_from(["clinic-lake-etl", "extract", "--patients", "PC1,PC7"]);
        match cli.command {
            Command::Extract { patients, .. } => assert_eq!(patients, vec!["PC1", "PC7"]),
            other => panic!("unexpected command: {:?}", other),
        }

        let cli = Cli::parse_from([
            "clinic-lake-etl",
            "clinisys-bronze",
            "--tables",
            "view_pacientes,view_tratamentos",
            "--config",
            "/etc/lake.toml",
        ]);
        assert_eq!(cli.config, PathBuf::from("/etc/lake.toml"));
        match cli.command {
            Command::ClinisysBronze { tables } => assert_eq!(tables.len(), 2),
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
