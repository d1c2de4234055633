//! Billing: priced views over the composed slices
//!
//! - [`aggregator`]: grouping of slices into billable events
//! - [`consolidator`]: immutable monthly snapshots
//! - [`forecast`]: pricing of hypothetical usage
//! - [`totals`]: accumulated cost per plan

pub mod aggregator;
pub mod consolidator;
pub mod forecast;
pub mod totals;

pub use aggregator::{aggregate, Aggregator};

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use paasbill_common::{BillableEvent, EventFilter, Result};
use sqlx::SqliteConnection;

use crate::db::{self, storage_error};
use crate::pricing::composer::{overlapping_components_sql, slice_from_row};
use crate::pricing::FormulaCache;
use crate::rows::RowSink;

/// Computes billable events for `filter` from the live slices and pushes them
/// to `sink` in event GUID order
pub(crate) async fn live_billable_events(
    conn: &mut SqliteConnection,
    filter: &EventFilter,
    now: DateTime<Utc>,
    formulas: &FormulaCache,
    sink: &mut RowSink<BillableEvent>,
) -> Result<()> {
    let statement = overlapping_components_sql(filter.org_guids.len());
    let mut query = sqlx::query(&statement)
        .bind(db::micros(filter.range_start))
        .bind(db::micros(filter.range_stop));
    for org in &filter.org_guids {
        query = query.bind(db::guid_text(org));
    }

    let mut aggregator = Aggregator::new(filter.time_range(), now, formulas);
    let mut rows = query.fetch(&mut *conn);
    while let Some(row) = rows.try_next().await.map_err(storage_error)? {
        let slice = slice_from_row(&row)?;
        if let Some(event) = aggregator.push(&slice)? {
            sink.push(event).await?;
        }
    }
    if let Some(event) = aggregator.finish() {
        sink.push(event).await?;
    }
    Ok(())
}

/// Billable events for `filter`: consolidated months are read from the
/// snapshot, everything else is computed live. Segments come out in
/// chronological order.
pub(crate) async fn auto_billable_events(
    conn: &mut SqliteConnection,
    filter: &EventFilter,
    now: DateTime<Utc>,
    formulas: &FormulaCache,
    sink: &mut RowSink<BillableEvent>,
) -> Result<()> {
    for segment in filter.split_by_month() {
        if segment.is_month_aligned()
            && consolidator::is_consolidated(conn, &segment).await?
        {
            consolidator::consolidated_billable_events(conn, &segment, sink).await?;
        } else {
            live_billable_events(conn, &segment, now, formulas, sink).await?;
        }
    }
    Ok(())
}
