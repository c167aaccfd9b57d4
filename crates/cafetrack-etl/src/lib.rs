//! ETL driver: line-delimited JSON in, idempotent Postgres rows out.
//!
//! A pass is resumable by construction: every record is inserted through the
//! store's identity constraint, so rerunning over identical or overlapping
//! input inserts nothing twice and raises nothing on the second pass.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cafetrack_core::RawRecord;
use cafetrack_storage::StoreConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cafetrack-etl";

pub const DEFAULT_INPUT_PATH: &str = "data/llm_extend_applicant_data.jsonl";

#[derive(Debug, Clone)]
pub struct EtlConfig {
    pub input_path: PathBuf,
    pub store: StoreConfig,
}

impl EtlConfig {
    pub fn from_env() -> Self {
        Self {
            input_path: std::env::var("CAFETRACK_INPUT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_INPUT_PATH)),
            store: StoreConfig::from_env(),
        }
    }
}

/// Outcome of one load pass.
#[derive(Debug, Clone, Serialize)]
pub struct LoadSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Well-formed records read from the input.
    pub read: usize,
    /// Rows newly inserted this pass.
    pub inserted: usize,
    /// Records whose identity was already present (the idempotent path).
    pub skipped: usize,
    /// Input lines that failed to parse and were dropped.
    pub malformed_lines: usize,
}

/// Parse line-delimited JSON. Blank lines are ignored; malformed lines are
/// dropped with a warning and never abort the batch.
pub fn parse_jsonl(text: &str) -> (Vec<RawRecord>, usize) {
    let mut records = Vec::new();
    let mut malformed = 0usize;
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<RawRecord>(line) {
            Ok(record) => records.push(record),
            Err(err) => {
                malformed += 1;
                warn!(line = idx + 1, %err, "skipping malformed input line");
            }
        }
    }
    (records, malformed)
}

/// Normalize and load a batch of raw records. A store failure is fatal for
/// the pass; data-quality problems never are (the extractor is total and
/// duplicate identities are expected no-ops).
pub async fn load_records(pool: &PgPool, records: &[RawRecord]) -> Result<LoadSummary> {
    load_records_inner(pool, records, 0).await
}

async fn load_records_inner(
    pool: &PgPool,
    records: &[RawRecord],
    malformed_lines: usize,
) -> Result<LoadSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    cafetrack_storage::ensure_schema(pool)
        .await
        .context("preparing store schema")?;

    let mut inserted = 0usize;
    for raw in records {
        let record = cafetrack_extract::normalize(raw);
        if cafetrack_storage::insert_if_absent(pool, &record).await? {
            inserted += 1;
        }
    }

    let summary = LoadSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        read: records.len(),
        inserted,
        skipped: records.len() - inserted,
        malformed_lines,
    };
    info!(
        run_id = %summary.run_id,
        read = summary.read,
        inserted = summary.inserted,
        skipped = summary.skipped,
        malformed = summary.malformed_lines,
        "load pass finished"
    );
    Ok(summary)
}

/// Load one JSONL file from disk.
pub async fn run_load_from_path(pool: &PgPool, path: &Path) -> Result<LoadSummary> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let (records, malformed_lines) = parse_jsonl(&text);
    load_records_inner(pool, &records, malformed_lines).await
}

/// Full env-driven pass: connect, read the configured drop, load it.
pub async fn run_once_from_env() -> Result<LoadSummary> {
    let config = EtlConfig::from_env();
    let pool = config.store.connect().await?;
    run_load_from_path(&pool, &config.input_path).await
}
