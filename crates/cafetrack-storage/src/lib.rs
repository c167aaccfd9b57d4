//! Postgres-backed store: identity signatures, idempotent inserts, and the
//! fixed analytics query catalog.

use anyhow::{Context, Result};
use cafetrack_core::NormalizedRecord;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "cafetrack-storage";

pub const DEFAULT_TARGET_TERM: &str = "Fall 2026";

/// Hard cap on rows returned by any list-shaped catalog query.
pub const MAX_LIST_ROWS: i64 = 100;

/// Connection settings for the store, resolved from the environment.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub database_url: String,
    pub target_term: String,
}

impl StoreConfig {
    /// `DATABASE_URL` wins outright; otherwise the URL is assembled from the
    /// conventional `PG*` parts. Everything but the credential has a default.
    pub fn from_env() -> Self {
        let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            database_url_from_parts(
                &std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string()),
                &std::env::var("PGPORT").unwrap_or_else(|_| "5432".to_string()),
                &std::env::var("PGDATABASE").unwrap_or_else(|_| "gradcafe".to_string()),
                &std::env::var("PGUSER").unwrap_or_else(|_| "postgres".to_string()),
                std::env::var("PGPASSWORD").ok().as_deref(),
            )
        });
        let target_term =
            std::env::var("CAFETRACK_TERM").unwrap_or_else(|_| DEFAULT_TARGET_TERM.to_string());
        Self {
            database_url,
            target_term,
        }
    }

    pub async fn connect(&self) -> Result<PgPool> {
        PgPool::connect(&self.database_url)
            .await
            .with_context(|| format!("connecting to {}", redact_url(&self.database_url)))
    }

    /// Pool that defers its first connection to first use. The web layer
    /// uses this so the dashboard can come up before the store does.
    pub fn connect_lazy(&self) -> Result<PgPool> {
        PgPoolOptions::new()
            .connect_lazy(&self.database_url)
            .with_context(|| format!("parsing {}", redact_url(&self.database_url)))
    }
}

pub fn database_url_from_parts(
    host: &str,
    port: &str,
    database: &str,
    user: &str,
    password: Option<&str>,
) -> String {
    match password {
        Some(password) if !password.is_empty() => {
            format!("postgres://{user}:{password}@{host}:{port}/{database}")
        }
        _ => format!("postgres://{user}@{host}:{port}/{database}"),
    }
}

fn redact_url(url: &str) -> String {
    // Keep credentials out of error messages and logs.
    match url.split_once('@') {
        Some((_, tail)) => format!("postgres://…@{tail}"),
        None => url.to_string(),
    }
}

/// Null-safe dedup signature over the identity triple. Absent fields map to
/// the empty marker, so two records missing the same field the same way
/// still collide. That permissive identity is what the loader relies on.
pub fn signature(url: Option<&str>, program: Option<&str>, comments: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.unwrap_or("").as_bytes());
    hasher.update([0x1f]);
    hasher.update(program.unwrap_or("").as_bytes());
    hasher.update([0x1f]);
    hasher.update(comments.unwrap_or("").as_bytes());
    hex::encode(hasher.finalize())
}

pub fn record_signature(record: &NormalizedRecord) -> String {
    signature(
        record.url.as_deref(),
        record.program.as_deref(),
        record.comments.as_deref(),
    )
}

/// Create the applicants table and its signature uniqueness constraint.
/// Safe to call repeatedly.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS applicants (
            p_id                     SERIAL PRIMARY KEY,
            sig                      TEXT NOT NULL,
            program                  TEXT,
            comments                 TEXT,
            date_added               DATE,
            url                      TEXT,
            status                   TEXT NOT NULL,
            term                     TEXT NOT NULL,
            us_or_international      TEXT NOT NULL,
            gpa                      DOUBLE PRECISION,
            gre                      DOUBLE PRECISION,
            gre_v                    DOUBLE PRECISION,
            gre_aw                   DOUBLE PRECISION,
            degree                   TEXT NOT NULL,
            llm_generated_program    TEXT,
            llm_generated_university TEXT
        )
        "#,
    )
    .execute(pool)
    .await
    .context("creating applicants table")?;

    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS applicants_sig_unique ON applicants (sig)",
    )
    .execute(pool)
    .await
    .context("creating applicants signature index")?;

    Ok(())
}

/// Insert one normalized record unless its identity is already present.
/// Returns whether a row actually landed; the conflict path is the expected
/// idempotent-rerun outcome, not an error.
pub async fn insert_if_absent(pool: &PgPool, record: &NormalizedRecord) -> Result<bool> {
    let sig = record_signature(record);
    let result = sqlx::query(
        r#"
        INSERT INTO applicants (
            sig, program, comments, date_added, url,
            status, term, us_or_international,
            gpa, gre, gre_v, gre_aw,
            degree, llm_generated_program, llm_generated_university
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        ON CONFLICT (sig) DO NOTHING
        "#,
    )
    .bind(&sig)
    .bind(&record.program)
    .bind(&record.comments)
    .bind(record.date_added)
    .bind(&record.url)
    .bind(record.status.as_str())
    .bind(&record.term)
    .bind(record.nationality.as_str())
    .bind(record.gpa)
    .bind(record.gre_quant)
    .bind(record.gre_verbal)
    .bind(record.gre_aw)
    .bind(record.degree.as_str())
    .bind(&record.llm_program)
    .bind(&record.llm_university)
    .execute(pool)
    .await
    .context("inserting applicant row")?;

    Ok(result.rows_affected() > 0)
}

#[derive(Debug, Error)]
pub enum QueryError {
    /// Identifier-parameterized query asked for a column outside the
    /// whitelist. Names are never interpolated from caller input directly.
    #[error("unknown metric column: {0}")]
    UnknownColumn(String),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

/// Numeric metric columns whose averages the catalog may request.
pub const METRIC_COLUMNS: &[&str] = &["gpa", "gre", "gre_v", "gre_aw"];

/// Double-quote an SQL identifier, escaping embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn clamp_limit(limit: Option<i64>) -> i64 {
    limit.unwrap_or(MAX_LIST_ROWS).clamp(1, MAX_LIST_ROWS)
}

fn metric_average_sql(column: &str) -> Result<String, QueryError> {
    if !METRIC_COLUMNS.contains(&column) {
        return Err(QueryError::UnknownColumn(column.to_string()));
    }
    let ident = quote_ident(column);
    Ok(format!(
        "SELECT AVG({ident}) FROM applicants WHERE {ident} IS NOT NULL"
    ))
}

/// Average of one whitelisted metric column over rows that reported it.
pub async fn average_metric(pool: &PgPool, column: &str) -> Result<Option<f64>, QueryError> {
    let sql = metric_average_sql(column)?;
    let value: Option<f64> = sqlx::query_scalar(&sql).fetch_one(pool).await?;
    Ok(value)
}

/// One full pass over the report catalog.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Metrics {
    pub target_term: String,
    pub total: i64,
    pub term_count: i64,
    pub pct_international: Option<f64>,
    pub avg_gpa: Option<f64>,
    pub avg_gre_quant: Option<f64>,
    pub avg_gre_verbal: Option<f64>,
    pub avg_gre_aw: Option<f64>,
    pub avg_gpa_american: Option<f64>,
    pub acceptance_pct: Option<f64>,
    pub avg_gpa_accepted: Option<f64>,
    pub term_distribution: Vec<(String, i64)>,
    pub decision_distribution: Vec<(String, i64)>,
    pub top_universities: Vec<(String, i64)>,
}

/// Run the whole catalog against the store for one target term.
pub async fn fetch_metrics(pool: &PgPool, target_term: &str) -> Result<Metrics, QueryError> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM applicants")
        .fetch_one(pool)
        .await?;

    let term_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM applicants WHERE term = $1")
        .bind(target_term)
        .fetch_one(pool)
        .await?;

    // Percent International among rows with a known nationality.
    let pct_international: Option<f64> = sqlx::query_scalar(
        r#"
        SELECT (100.0 * SUM(CASE WHEN us_or_international = 'International' THEN 1 ELSE 0 END)
                / NULLIF(SUM(CASE WHEN us_or_international <> 'Unknown' THEN 1 ELSE 0 END), 0)
               )::float8
        FROM applicants
        "#,
    )
    .fetch_one(pool)
    .await?;

    let avg_gpa = average_metric(pool, "gpa").await?;
    let avg_gre_quant = average_metric(pool, "gre").await?;
    let avg_gre_verbal = average_metric(pool, "gre_v").await?;
    let avg_gre_aw = average_metric(pool, "gre_aw").await?;

    let avg_gpa_american: Option<f64> = sqlx::query_scalar(
        r#"
        SELECT AVG(gpa) FROM applicants
        WHERE term = $1 AND us_or_international = 'American' AND gpa IS NOT NULL
        "#,
    )
    .bind(target_term)
    .fetch_one(pool)
    .await?;

    // Acceptance percent among decided rows only; unclassified posts carry
    // no decision signal and are excluded from the denominator.
    let acceptance_pct: Option<f64> = sqlx::query_scalar(
        r#"
        SELECT (100.0 * SUM(CASE WHEN status = 'Accepted' THEN 1 ELSE 0 END)
                / NULLIF(SUM(CASE WHEN status <> 'Unclassified' THEN 1 ELSE 0 END), 0)
               )::float8
        FROM applicants
        WHERE term = $1
        "#,
    )
    .bind(target_term)
    .fetch_one(pool)
    .await?;

    let avg_gpa_accepted: Option<f64> = sqlx::query_scalar(
        r#"
        SELECT AVG(gpa) FROM applicants
        WHERE term = $1 AND status = 'Accepted' AND gpa IS NOT NULL
        "#,
    )
    .bind(target_term)
    .fetch_one(pool)
    .await?;

    let term_distribution = ranked_counts(pool, "term", Some(10)).await?;
    let decision_distribution = ranked_counts(pool, "status", Some(10)).await?;

    let top_universities: Vec<(String, i64)> = sqlx::query_as(
        r#"
        SELECT COALESCE(NULLIF(llm_generated_university, ''), 'Unknown') AS university,
               COUNT(*)
        FROM applicants
        WHERE term = $1
        GROUP BY 1
        ORDER BY COUNT(*) DESC, university
        LIMIT $2
        "#,
    )
    .bind(target_term)
    .bind(clamp_limit(Some(5)))
    .fetch_all(pool)
    .await?;

    info!(total, term_count, target_term, "fetched metrics catalog");

    Ok(Metrics {
        target_term: target_term.to_string(),
        total,
        term_count,
        pct_international,
        avg_gpa,
        avg_gre_quant,
        avg_gre_verbal,
        avg_gre_aw,
        avg_gpa_american,
        acceptance_pct,
        avg_gpa_accepted,
        term_distribution,
        decision_distribution,
        top_universities,
    })
}

/// Top-N value counts for one whitelisted grouping column.
async fn ranked_counts(
    pool: &PgPool,
    column: &str,
    limit: Option<i64>,
) -> Result<Vec<(String, i64)>, QueryError> {
    const GROUPING_COLUMNS: &[&str] = &["term", "status", "degree", "us_or_international"];
    if !GROUPING_COLUMNS.contains(&column) {
        return Err(QueryError::UnknownColumn(column.to_string()));
    }
    let ident = quote_ident(column);
    let sql = format!(
        "SELECT {ident}, COUNT(*) FROM applicants \
         GROUP BY {ident} ORDER BY COUNT(*) DESC, {ident} LIMIT $1"
    );
    let rows = sqlx::query_as(&sql)
        .bind(clamp_limit(limit))
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cafetrack_core::{Decision, DegreeLevel, Nationality};

    fn record(url: Option<&str>, program: Option<&str>, comments: Option<&str>) -> NormalizedRecord {
        NormalizedRecord {
            program: program.map(str::to_string),
            comments: comments.map(str::to_string),
            date_added: None,
            url: url.map(str::to_string),
            status: Decision::Unclassified,
            term: cafetrack_core::NO_TERM_DETECTED.to_string(),
            nationality: Nationality::Unknown,
            degree: DegreeLevel::Unknown,
            gpa: None,
            gre_quant: None,
            gre_verbal: None,
            gre_aw: None,
            llm_program: None,
            llm_university: None,
        }
    }

    #[test]
    fn signature_is_deterministic() {
        let a = signature(Some("u1"), Some("JHU CS"), Some("Accepted!"));
        let b = signature(Some("u1"), Some("JHU CS"), Some("Accepted!"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn signature_differs_on_any_identity_field() {
        let base = signature(Some("u1"), Some("p"), Some("c"));
        assert_ne!(base, signature(Some("u2"), Some("p"), Some("c")));
        assert_ne!(base, signature(Some("u1"), Some("q"), Some("c")));
        assert_ne!(base, signature(Some("u1"), Some("p"), Some("d")));
    }

    #[test]
    fn absent_fields_collapse_like_empty_markers() {
        // Two records both missing the URL the same way share an identity.
        assert_eq!(
            signature(None, Some("p"), Some("c")),
            signature(None, Some("p"), Some("c"))
        );
        assert_eq!(
            signature(None, Some("p"), Some("c")),
            signature(Some(""), Some("p"), Some("c"))
        );
    }

    #[test]
    fn field_shift_does_not_collide() {
        // The separator keeps "ab" + "c" distinct from "a" + "bc".
        assert_ne!(
            signature(Some("ab"), Some("c"), None),
            signature(Some("a"), Some("bc"), None)
        );
    }

    #[test]
    fn record_signature_ignores_non_identity_fields() {
        let mut a = record(Some("u1"), Some("JHU CS"), Some("Accepted! Fall 2026"));
        let mut b = record(Some("u1"), Some("JHU CS"), Some("Accepted! Fall 2026"));
        a.status = Decision::Accepted;
        b.status = Decision::Rejected;
        a.gpa = Some(3.9);
        b.date_added = chrono::NaiveDate::from_ymd_opt(2026, 2, 1);
        assert_eq!(record_signature(&a), record_signature(&b));
    }

    #[test]
    fn quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident("gpa"), "\"gpa\"");
        assert_eq!(quote_ident("evil\"col"), "\"evil\"\"col\"");
    }

    #[test]
    fn metric_average_rejects_unlisted_columns() {
        assert!(metric_average_sql("gpa").is_ok());
        let err = metric_average_sql("p_id; DROP TABLE applicants").unwrap_err();
        assert!(matches!(err, QueryError::UnknownColumn(_)));
    }

    #[test]
    fn limits_are_clamped_to_the_cap() {
        assert_eq!(clamp_limit(None), MAX_LIST_ROWS);
        assert_eq!(clamp_limit(Some(0)), 1);
        assert_eq!(clamp_limit(Some(-5)), 1);
        assert_eq!(clamp_limit(Some(10)), 10);
        assert_eq!(clamp_limit(Some(10_000)), MAX_LIST_ROWS);
    }

    #[test]
    fn database_url_assembly() {
        assert_eq!(
            database_url_from_parts("localhost", "5432", "gradcafe", "postgres", None),
            "postgres://postgres@localhost:5432/gradcafe"
        );
        assert_eq!(
            database_url_from_parts("db", "5401", "cafe", "app", Some("hunter2")),
            "postgres://app:hunter2@db:5401/cafe"
        );
    }

    #[test]
    fn redacted_urls_drop_credentials() {
        assert_eq!(
            redact_url("postgres://app:hunter2@db:5432/cafe"),
            "postgres://…@db:5432/cafe"
        );
        assert_eq!(redact_url("postgres://db/cafe"), "postgres://db/cafe");
    }
}
