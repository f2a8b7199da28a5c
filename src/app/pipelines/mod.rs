//! 各個 ETL 階段：Clinisys 與 Embryoscope 兩條線，最後合併與匯出

pub mod clinisys_bronze;
pub mod clinisys_gold;
pub mod clinisys_silver;
pub mod combined_gold;
pub mod embryoscope_consolidate;
pub mod embryoscope_extract;
pub mod embryoscope_gold;
pub mod embryoscope_silver;
pub mod export;
pub mod prescription_gold;

pub use clinisys_bronze::ClinisysBronzeStage;
pub use clinisys_gold::ClinisysGoldStage;
pub use clinisys_silver::ClinisysSilverStage;
pub use combined_gold::CombinedGoldStage;
pub use embryoscope_consolidate::EmbryoscopeConsolidateStage;
pub use embryoscope_extract::EmbryoscopeExtractStage;
pub use embryoscope_gold::EmbryoscopeGoldStage;
pub use embryoscope_silver::EmbryoscopeSilverStage;
pub use export::ExportStage;
pub use prescription_gold::PrescriptionGoldStage;
