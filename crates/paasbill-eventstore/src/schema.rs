//! Database schema
//!
//! Every statement is idempotent so `apply` can run on each start.

use sqlx::SqliteConnection;
use tracing::{debug, info};

use crate::db::storage_error;
use paasbill_common::Result;

/// Bumped whenever a statement below changes shape
pub const SCHEMA_VERSION: i64 = 1;

/// Tables rebuilt from raw events on every refresh
pub const DERIVED_TABLES: [&str; 2] = ["billable_event_components", "events"];

/// Tables replaced from configuration on every refresh
pub const REFERENCE_TABLES: [&str; 4] = [
    "pricing_plan_components",
    "pricing_plans",
    "vat_rates",
    "currency_rates",
];

const STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS schema_migrations (
        version INTEGER PRIMARY KEY,
        applied_at INTEGER NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS app_usage_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        guid TEXT NOT NULL UNIQUE,
        created_at INTEGER NOT NULL,
        raw_message TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS service_usage_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        guid TEXT NOT NULL UNIQUE,
        created_at INTEGER NOT NULL,
        raw_message TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS compose_audit_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        guid TEXT NOT NULL UNIQUE,
        created_at INTEGER NOT NULL,
        raw_message TEXT NOT NULL
    )"#,
    "CREATE INDEX IF NOT EXISTS app_usage_events_created_at_idx ON app_usage_events (created_at)",
    "CREATE INDEX IF NOT EXISTS service_usage_events_created_at_idx ON service_usage_events (created_at)",
    "CREATE INDEX IF NOT EXISTS compose_audit_events_created_at_idx ON compose_audit_events (created_at)",
    r#"CREATE TABLE IF NOT EXISTS pricing_plans (
        plan_guid TEXT NOT NULL,
        valid_from INTEGER NOT NULL,
        name TEXT NOT NULL,
        memory_in_mb INTEGER NOT NULL DEFAULT 0 CHECK (memory_in_mb >= 0),
        storage_in_mb INTEGER NOT NULL DEFAULT 0 CHECK (storage_in_mb >= 0),
        number_of_nodes INTEGER NOT NULL DEFAULT 0 CHECK (number_of_nodes >= 0),
        PRIMARY KEY (plan_guid, valid_from)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS pricing_plan_components (
        plan_guid TEXT NOT NULL,
        valid_from INTEGER NOT NULL,
        name TEXT NOT NULL,
        formula TEXT NOT NULL,
        vat_code TEXT NOT NULL CHECK (vat_code IN ('Standard', 'Reduced', 'Zero')),
        currency_code TEXT NOT NULL CHECK (currency_code IN ('GBP', 'USD', 'EUR')),
        PRIMARY KEY (plan_guid, valid_from, name),
        FOREIGN KEY (plan_guid, valid_from) REFERENCES pricing_plans (plan_guid, valid_from)
            ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS vat_rates (
        code TEXT NOT NULL CHECK (code IN ('Standard', 'Reduced', 'Zero')),
        valid_from INTEGER NOT NULL,
        rate TEXT NOT NULL,
        PRIMARY KEY (code, valid_from)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS currency_rates (
        code TEXT NOT NULL CHECK (code IN ('GBP', 'USD', 'EUR')),
        valid_from INTEGER NOT NULL,
        rate TEXT NOT NULL,
        PRIMARY KEY (code, valid_from)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS events (
        event_guid TEXT NOT NULL,
        resource_guid TEXT NOT NULL,
        resource_name TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        org_guid TEXT NOT NULL,
        org_name TEXT NOT NULL,
        space_guid TEXT NOT NULL,
        space_name TEXT NOT NULL,
        plan_guid TEXT NOT NULL,
        plan_name TEXT NOT NULL,
        service_guid TEXT,
        service_name TEXT,
        number_of_nodes INTEGER CHECK (number_of_nodes >= 0),
        memory_in_mb INTEGER CHECK (memory_in_mb >= 0),
        storage_in_mb INTEGER CHECK (storage_in_mb >= 0),
        duration_lo INTEGER NOT NULL,
        duration_hi INTEGER,
        CHECK (duration_hi IS NULL OR duration_hi > duration_lo)
    )"#,
    "CREATE INDEX IF NOT EXISTS events_event_guid_idx ON events (event_guid)",
    "CREATE INDEX IF NOT EXISTS events_org_guid_idx ON events (org_guid)",
    "CREATE INDEX IF NOT EXISTS events_duration_idx ON events (duration_lo, duration_hi)",
    r#"CREATE TABLE IF NOT EXISTS billable_event_components (
        event_guid TEXT NOT NULL,
        resource_guid TEXT NOT NULL,
        resource_name TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        org_guid TEXT NOT NULL,
        org_name TEXT NOT NULL,
        space_guid TEXT NOT NULL,
        space_name TEXT NOT NULL,
        plan_guid TEXT NOT NULL,
        plan_name TEXT NOT NULL,
        event_plan_name TEXT NOT NULL,
        plan_valid_from INTEGER NOT NULL,
        component_name TEXT NOT NULL,
        component_formula TEXT NOT NULL,
        vat_code TEXT NOT NULL,
        vat_rate TEXT NOT NULL,
        currency_code TEXT NOT NULL,
        currency_rate TEXT NOT NULL,
        number_of_nodes INTEGER NOT NULL,
        memory_in_mb INTEGER NOT NULL,
        storage_in_mb INTEGER NOT NULL,
        duration_lo INTEGER NOT NULL,
        duration_hi INTEGER
    )"#,
    "CREATE INDEX IF NOT EXISTS billable_event_components_event_idx ON billable_event_components (event_guid, duration_lo)",
    "CREATE INDEX IF NOT EXISTS billable_event_components_org_idx ON billable_event_components (org_guid)",
    r#"CREATE TABLE IF NOT EXISTS consolidation_history (
        range_lo INTEGER NOT NULL,
        range_hi INTEGER NOT NULL,
        created_at INTEGER NOT NULL,
        UNIQUE (range_lo, range_hi)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS consolidated_billable_events (
        range_lo INTEGER NOT NULL,
        range_hi INTEGER NOT NULL,
        event_guid TEXT NOT NULL,
        event_start INTEGER NOT NULL,
        event_stop INTEGER NOT NULL,
        resource_guid TEXT NOT NULL,
        resource_name TEXT NOT NULL,
        resource_type TEXT NOT NULL,
        org_guid TEXT NOT NULL,
        org_name TEXT NOT NULL,
        space_guid TEXT NOT NULL,
        space_name TEXT NOT NULL,
        plan_guid TEXT NOT NULL,
        plan_name TEXT NOT NULL,
        number_of_nodes INTEGER NOT NULL,
        memory_in_mb INTEGER NOT NULL,
        storage_in_mb INTEGER NOT NULL,
        price TEXT NOT NULL,
        PRIMARY KEY (range_lo, range_hi, event_guid),
        FOREIGN KEY (range_lo, range_hi) REFERENCES consolidation_history (range_lo, range_hi)
    )"#,
    "CREATE INDEX IF NOT EXISTS consolidated_billable_events_org_idx ON consolidated_billable_events (range_lo, org_guid)",
];

/// Creates every table and index that does not exist yet and records the
/// schema version
pub async fn apply(conn: &mut SqliteConnection) -> Result<()> {
    for statement in STATEMENTS {
        sqlx::query(statement)
            .execute(&mut *conn)
            .await
            .map_err(storage_error)?;
    }

    let inserted = sqlx::query(
        "INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?) ON CONFLICT (version) DO NOTHING",
    )
    .bind(SCHEMA_VERSION)
    .bind(chrono::Utc::now().timestamp_micros())
    .execute(&mut *conn)
    .await
    .map_err(storage_error)?
    .rows_affected();

    if inserted > 0 {
        info!(version = SCHEMA_VERSION, "Applied schema");
    } else {
        debug!(version = SCHEMA_VERSION, "Schema already up to date");
    }
    Ok(())
}

/// Names of all user tables, sorted
pub async fn table_names(conn: &mut SqliteConnection) -> Result<Vec<String>> {
    sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )
    .fetch_all(&mut *conn)
    .await
    .map_err(storage_error)
}
