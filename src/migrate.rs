//! Baseline schema for a fresh install.
//!
//! Creates the current-schema entity tables the enrichment modules write to,
//! plus the retrieval store tables. Older deployments may carry different
//! column sets; the pipeline copes with that through the schema probe, so
//! nothing here alters existing tables.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const ENTITY_TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS companies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT,
        website TEXT,
        industry TEXT,
        sector TEXT,
        stage TEXT,
        founded_year INTEGER,
        employees_count INTEGER,
        headquarters TEXT,
        country TEXT,
        funding_stage TEXT,
        total_funding REAL,
        last_funding_date TEXT,
        investors TEXT,
        products TEXT,
        markets TEXT,
        achievements TEXT,
        created_at TEXT,
        updated_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS deals (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        company_id INTEGER,
        company_name TEXT NOT NULL,
        deal_type TEXT,
        amount REAL,
        valuation REAL,
        lead_investor TEXT,
        participants TEXT,
        deal_date TEXT,
        status TEXT,
        sector TEXT,
        country TEXT,
        description TEXT,
        created_at TEXT,
        updated_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS investors (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        description TEXT,
        type TEXT,
        headquarters TEXT,
        founded_year INTEGER,
        assets_under_management REAL,
        website TEXT,
        focus_sectors TEXT,
        investment_stages TEXT,
        countries TEXT,
        team_size INTEGER,
        contact_email TEXT,
        created_at TEXT,
        updated_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS grants (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        description TEXT,
        funding_agency TEXT,
        amount REAL,
        grant_type TEXT,
        application_deadline TEXT,
        status TEXT,
        country TEXT,
        sector TEXT,
        duration_months INTEGER,
        funders TEXT,
        eligibility_criteria TEXT,
        requirements TEXT,
        created_at TEXT,
        updated_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS clinical_trials (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        title TEXT NOT NULL,
        description TEXT,
        phase TEXT,
        medical_condition TEXT,
        indication TEXT,
        intervention TEXT,
        sponsor TEXT,
        location TEXT,
        country TEXT,
        start_date TEXT,
        end_date TEXT,
        status TEXT,
        nct_number TEXT,
        company_id INTEGER,
        created_at TEXT,
        updated_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS regulatory_bodies (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        country TEXT,
        abbreviation TEXT,
        website TEXT,
        description TEXT,
        jurisdiction TEXT,
        created_at TEXT,
        updated_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS clinical_centers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        country TEXT,
        city TEXT,
        address TEXT,
        website TEXT,
        description TEXT,
        specialties TEXT,
        phases_supported TEXT,
        capacity_patients INTEGER,
        established_year INTEGER,
        created_at TEXT,
        updated_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS investigators (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        title TEXT,
        institution TEXT,
        country TEXT,
        city TEXT,
        email TEXT,
        phone TEXT,
        specialties TEXT,
        therapeutic_areas TEXT,
        experience_years INTEGER,
        education TEXT,
        certifications TEXT,
        created_at TEXT,
        updated_at TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS market_indicators (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        country TEXT NOT NULL,
        data_type TEXT,
        metric_name TEXT NOT NULL,
        metric_value REAL,
        metric_unit TEXT,
        year INTEGER NOT NULL,
        source TEXT,
        created_at TEXT,
        updated_at TEXT
    )
    "#,
];

const INDEXES: &[&str] = &[
    // Conflict target for the market indicator upsert.
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_market_indicators_key ON market_indicators(country, metric_name, year)",
    "CREATE INDEX IF NOT EXISTS idx_companies_name ON companies(name)",
    "CREATE INDEX IF NOT EXISTS idx_companies_updated_at ON companies(updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_deals_company_id ON deals(company_id)",
];

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index that does not exist yet.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for ddl in ENTITY_TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }
    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS context_documents (
            id TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='context_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE context_fts USING fts5(
                doc_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    Ok(())
}
