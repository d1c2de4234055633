//! Raw event storage
//!
//! One append-only table per [`EventKind`]. Inserts are idempotent on the
//! event GUID and reads follow insertion order.

use futures::TryStreamExt;
use paasbill_common::{EventKind, RawEvent, RawEventFilter, Result};
use sqlx::sqlite::SqliteRow;
use sqlx::SqliteConnection;
use tracing::debug;

use crate::db::{self, get_i64, get_instant, get_string, storage_error};
use crate::rows::RowSink;
use paasbill_common::BillingError;

pub(crate) fn table_name(kind: EventKind) -> &'static str {
    match kind {
        EventKind::App => "app_usage_events",
        EventKind::Service => "service_usage_events",
        EventKind::Compose => "compose_audit_events",
    }
}

/// Inserts a batch, ignoring events already stored. Every event is validated
/// before anything is written. Returns the number of new rows.
pub(crate) async fn insert_events(conn: &mut SqliteConnection, events: &[RawEvent]) -> Result<u64> {
    for event in events {
        event.validate()?;
    }

    let mut inserted = 0;
    for event in events {
        let statement = format!(
            "INSERT INTO {} (guid, created_at, raw_message) VALUES (?, ?, ?) ON CONFLICT (guid) DO NOTHING",
            table_name(event.kind)
        );
        inserted += sqlx::query(&statement)
            .bind(&event.guid)
            .bind(db::micros(event.created_at))
            .bind(serde_json::to_string(&event.raw_message)?)
            .execute(&mut *conn)
            .await
            .map_err(storage_error)?
            .rows_affected();
    }
    debug!(received = events.len(), inserted, "Stored raw events");
    Ok(inserted)
}

pub(crate) fn select_sql(filter: &RawEventFilter) -> String {
    let order = if filter.reverse { "ASC" } else { "DESC" };
    let mut statement = format!(
        "SELECT guid, created_at, raw_message FROM {} ORDER BY id {order}",
        table_name(filter.kind)
    );
    if filter.effective_limit().is_some() {
        statement.push_str(" LIMIT ?");
    }
    statement
}

pub(crate) fn raw_event_from_row(row: &SqliteRow, kind: EventKind) -> Result<RawEvent> {
    let raw_message = get_string(row, "raw_message")?;
    Ok(RawEvent {
        guid: get_string(row, "guid")?,
        kind,
        raw_message: serde_json::from_str(&raw_message)?,
        created_at: get_instant(row, "created_at")?,
    })
}

/// Pushes the stored events selected by `filter` to `sink`
pub(crate) async fn stream_events(
    conn: &mut SqliteConnection,
    filter: &RawEventFilter,
    sink: &mut RowSink<RawEvent>,
) -> Result<()> {
    let statement = select_sql(filter);
    let mut query = sqlx::query(&statement);
    if let Some(limit) = filter.effective_limit() {
        query = query.bind(limit);
    }
    let mut rows = query.fetch(&mut *conn);
    while let Some(row) = rows.try_next().await.map_err(storage_error)? {
        sink.push(raw_event_from_row(&row, filter.kind)?).await?;
    }
    Ok(())
}

pub(crate) async fn select_events(
    conn: &mut SqliteConnection,
    filter: &RawEventFilter,
) -> Result<Vec<RawEvent>> {
    let mut sink = RowSink::collect();
    stream_events(conn, filter, &mut sink).await?;
    Ok(sink.into_vec())
}

const REPLAY_SQL: &str = r#"
    SELECT 0 AS kind_rank, id, guid, created_at, raw_message FROM app_usage_events
    UNION ALL
    SELECT 1 AS kind_rank, id, guid, created_at, raw_message FROM service_usage_events
    UNION ALL
    SELECT 2 AS kind_rank, id, guid, created_at, raw_message FROM compose_audit_events
    ORDER BY created_at, kind_rank, id
"#;

fn kind_from_rank(rank: i64) -> Result<EventKind> {
    EventKind::ALL
        .into_iter()
        .find(|kind| i64::from(kind.rank()) == rank)
        .ok_or_else(|| BillingError::Storage(format!("unknown event kind rank {rank}")))
}

/// Feeds every stored raw event to `visit` in replay order: creation time,
/// then kind (app, service, compose), then insertion order
pub(crate) async fn replay<F>(conn: &mut SqliteConnection, mut visit: F) -> Result<usize>
where
    F: FnMut(RawEvent),
{
    let mut rows = sqlx::query(REPLAY_SQL).fetch(&mut *conn);
    let mut count = 0;
    while let Some(row) = rows.try_next().await.map_err(storage_error)? {
        let kind = kind_from_rank(get_i64(&row, "kind_rank")?)?;
        visit(raw_event_from_row(&row, kind)?);
        count += 1;
    }
    Ok(count)
}
