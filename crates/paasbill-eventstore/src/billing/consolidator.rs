//! Consolidator
//!
//! Finalised months are priced once and written to an append-only snapshot
//! together with a history row. A month is consolidated at most once.
//! Events are priced and written in pages of event GUIDs so a month is never
//! held in memory as a whole.

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use paasbill_common::types::range::format_instant;
use paasbill_common::{BillableEvent, BillingError, EventFilter, Result, ValidationError};
use sqlx::sqlite::SqliteRow;
use sqlx::SqliteConnection;
use tracing::{debug, info};

use super::Aggregator;
use crate::db::{
    self, get_i64, get_instant, get_string, get_uuid, is_unique_violation, storage_error,
};
use crate::pricing::composer::{paged_components_sql, slice_from_row, NEXT_EVENT_PAGE_SQL};
use crate::pricing::FormulaCache;
use crate::rows::RowSink;

/// Consolidation only accepts a whole single month for every organisation
pub fn validate_filter(filter: &EventFilter) -> Result<()> {
    filter.validate()?;
    if filter.has_org_filter() {
        return Err(ValidationError::InvalidRange(
            "consolidate must be called without an organisations filter".to_string(),
        )
        .into());
    }
    if !filter.is_month_aligned() || !filter.is_single_month() {
        return Err(ValidationError::InvalidRange(format!(
            "consolidate range must be exactly one calendar month, got [{}, {})",
            format_instant(&filter.range_start),
            format_instant(&filter.range_stop)
        ))
        .into());
    }
    Ok(())
}

/// Whole months between `start` and `end`, both truncated to month starts
pub fn full_months(start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<EventFilter> {
    EventFilter::new(start, end).truncate_month().split_by_month()
}

pub(crate) async fn is_consolidated(conn: &mut SqliteConnection, filter: &EventFilter) -> Result<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM consolidation_history WHERE range_lo = ? AND range_hi = ?",
    )
    .bind(db::micros(filter.range_start))
    .bind(db::micros(filter.range_stop))
    .fetch_one(&mut *conn)
    .await
    .map_err(storage_error)?;
    Ok(count > 0)
}

async fn insert_history(
    conn: &mut SqliteConnection,
    filter: &EventFilter,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query("INSERT INTO consolidation_history (range_lo, range_hi, created_at) VALUES (?, ?, ?)")
        .bind(db::micros(filter.range_start))
        .bind(db::micros(filter.range_stop))
        .bind(db::micros(now))
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                BillingError::AlreadyConsolidated(format!(
                    "[{}, {})",
                    format_instant(&filter.range_start),
                    format_instant(&filter.range_stop)
                ))
            } else {
                storage_error(e)
            }
        })?;
    Ok(())
}

async fn insert_event(
    conn: &mut SqliteConnection,
    filter: &EventFilter,
    event: &BillableEvent,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO consolidated_billable_events (range_lo, range_hi, event_guid, event_start, \
         event_stop, resource_guid, resource_name, resource_type, org_guid, org_name, space_guid, \
         space_name, plan_guid, plan_name, number_of_nodes, memory_in_mb, storage_in_mb, price) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(db::micros(filter.range_start))
    .bind(db::micros(filter.range_stop))
    .bind(db::guid_text(&event.event_guid))
    .bind(db::micros(event.event_start))
    .bind(db::micros(event.event_stop))
    .bind(db::guid_text(&event.resource_guid))
    .bind(&event.resource_name)
    .bind(&event.resource_type)
    .bind(db::guid_text(&event.org_guid))
    .bind(&event.org_name)
    .bind(db::guid_text(&event.space_guid))
    .bind(&event.space_name)
    .bind(db::guid_text(&event.plan_guid))
    .bind(&event.plan_name)
    .bind(event.number_of_nodes)
    .bind(event.memory_in_mb)
    .bind(event.storage_in_mb)
    .bind(serde_json::to_string(&event.price)?)
    .execute(&mut *conn)
    .await
    .map_err(storage_error)?;
    Ok(())
}

/// Prices the live slices of events in `(after, last]`
async fn priced_page(
    conn: &mut SqliteConnection,
    filter: &EventFilter,
    now: DateTime<Utc>,
    formulas: &FormulaCache,
    after: &str,
    last: &str,
) -> Result<Vec<BillableEvent>> {
    let statement = paged_components_sql();
    let mut rows = sqlx::query(&statement)
        .bind(db::micros(filter.range_start))
        .bind(db::micros(filter.range_stop))
        .bind(after)
        .bind(last)
        .fetch(&mut *conn);

    let mut aggregator = Aggregator::new(filter.time_range(), now, formulas);
    let mut events = Vec::new();
    while let Some(row) = rows.try_next().await.map_err(storage_error)? {
        if let Some(event) = aggregator.push(&slice_from_row(&row)?)? {
            events.push(event);
        }
    }
    events.extend(aggregator.finish());
    Ok(events)
}

/// Records `filter` as consolidated and snapshots its live billable events,
/// `page_size` events at a time. The caller owns the transaction.
pub(crate) async fn consolidate_range(
    conn: &mut SqliteConnection,
    filter: &EventFilter,
    now: DateTime<Utc>,
    formulas: &FormulaCache,
    page_size: usize,
) -> Result<usize> {
    validate_filter(filter)?;
    insert_history(conn, filter, now).await?;

    let limit = i64::try_from(page_size.max(1)).unwrap_or(i64::MAX);
    let mut after = String::new();
    let mut total = 0usize;
    loop {
        let guids: Vec<String> = sqlx::query_scalar(NEXT_EVENT_PAGE_SQL)
            .bind(db::micros(filter.range_start))
            .bind(db::micros(filter.range_stop))
            .bind(&after)
            .bind(limit)
            .fetch_all(&mut *conn)
            .await
            .map_err(storage_error)?;
        let Some(last) = guids.last().cloned() else {
            break;
        };

        // the page read holds the connection, so it is drained before writing
        let events = priced_page(conn, filter, now, formulas, &after, &last).await?;
        for event in &events {
            insert_event(conn, filter, event).await?;
        }
        debug!(events = events.len(), last = %last, "Consolidated page");
        total += events.len();
        after = last;
    }
    info!(
        range_start = %format_instant(&filter.range_start),
        events = total,
        "Consolidated billable events"
    );
    Ok(total)
}

fn consolidated_from_row(row: &SqliteRow) -> Result<BillableEvent> {
    Ok(BillableEvent {
        event_guid: get_uuid(row, "event_guid")?,
        event_start: get_instant(row, "event_start")?,
        event_stop: get_instant(row, "event_stop")?,
        resource_guid: get_uuid(row, "resource_guid")?,
        resource_name: get_string(row, "resource_name")?,
        resource_type: get_string(row, "resource_type")?,
        org_guid: get_uuid(row, "org_guid")?,
        org_name: get_string(row, "org_name")?,
        space_guid: get_uuid(row, "space_guid")?,
        space_name: get_string(row, "space_name")?,
        plan_guid: get_uuid(row, "plan_guid")?,
        plan_name: get_string(row, "plan_name")?,
        number_of_nodes: get_i64(row, "number_of_nodes")?,
        memory_in_mb: get_i64(row, "memory_in_mb")?,
        storage_in_mb: get_i64(row, "storage_in_mb")?,
        price: serde_json::from_str(&get_string(row, "price")?)?,
    })
}

/// Streams the snapshot of a consolidated month in event GUID order
pub(crate) async fn consolidated_billable_events(
    conn: &mut SqliteConnection,
    filter: &EventFilter,
    sink: &mut RowSink<BillableEvent>,
) -> Result<()> {
    let mut statement = String::from(
        "SELECT event_guid, event_start, event_stop, resource_guid, resource_name, resource_type, \
         org_guid, org_name, space_guid, space_name, plan_guid, plan_name, number_of_nodes, \
         memory_in_mb, storage_in_mb, price FROM consolidated_billable_events \
         WHERE range_lo = ? AND range_hi = ?",
    );
    if filter.has_org_filter() {
        let placeholders = vec!["?"; filter.org_guids.len()].join(", ");
        statement.push_str(&format!(" AND org_guid IN ({placeholders})"));
    }
    statement.push_str(" ORDER BY event_guid");

    let mut query = sqlx::query(&statement)
        .bind(db::micros(filter.range_start))
        .bind(db::micros(filter.range_stop));
    for org in &filter.org_guids {
        query = query.bind(db::guid_text(org));
    }

    let mut rows = query.fetch(&mut *conn);
    let mut count = 0usize;
    while let Some(row) = rows.try_next().await.map_err(storage_error)? {
        sink.push(consolidated_from_row(&row)?).await?;
        count += 1;
    }
    debug!(count, "Read consolidated billable events");
    Ok(())
}
