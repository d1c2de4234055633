//! Metering: raw event ingest and derivation of resource usage intervals
//!
//! - [`raw`]: append-only storage of platform events
//! - [`payload`]: typed views over the stored payloads
//! - [`normaliser`]: lifecycle state machines producing [`UsageInterval`]s

pub mod normaliser;
pub mod payload;
pub mod raw;

use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use paasbill_common::{
    EventFilter, Result, TimeRange, UsageEvent, DUMMY_ORG_NAME, DUMMY_SPACE_NAME,
    FORECAST_PLAN_NAME,
};
use sqlx::sqlite::SqliteRow;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::db::{
    self, get_opt_i64, get_opt_string, get_opt_uuid, get_range, get_string, get_uuid,
    storage_error,
};
use crate::rows::RowSink;

/// One row of the `events` relation: a resource running on one plan with
/// fixed sizing for a half-open duration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageInterval {
    pub event_guid: Uuid,
    pub resource_guid: Uuid,
    pub resource_name: String,
    pub resource_type: String,
    pub org_guid: Uuid,
    pub org_name: String,
    pub space_guid: Uuid,
    pub space_name: String,
    pub plan_guid: Uuid,
    pub plan_name: String,
    pub service_guid: Option<Uuid>,
    pub service_name: Option<String>,
    /// `None` falls back to the plan's default
    pub number_of_nodes: Option<i64>,
    pub memory_in_mb: Option<i64>,
    pub storage_in_mb: Option<i64>,
    pub duration: TimeRange,
}

impl UsageInterval {
    /// Usage view of this interval clipped to `window`. Open intervals end at
    /// `min(now, window.hi)`. Returns `None` when nothing remains.
    pub fn to_usage_event(&self, window: &TimeRange, now: DateTime<Utc>) -> Option<UsageEvent> {
        let ceiling = match window.hi {
            Some(hi) => hi.min(now),
            None => now,
        };
        let clipped = self.duration.close_at(ceiling).intersect(window)?;
        let event_stop = clipped.hi?;
        Some(UsageEvent {
            event_guid: self.event_guid,
            event_start: clipped.lo,
            event_stop,
            resource_guid: self.resource_guid,
            resource_name: self.resource_name.clone(),
            resource_type: self.resource_type.clone(),
            org_guid: self.org_guid,
            space_guid: self.space_guid,
            plan_guid: self.plan_guid,
            plan_name: self.plan_name.clone(),
            service_guid: self.service_guid,
            service_name: self.service_name.clone(),
            number_of_nodes: self.number_of_nodes.unwrap_or(0),
            memory_in_mb: self.memory_in_mb.unwrap_or(0),
            storage_in_mb: self.storage_in_mb.unwrap_or(0),
        })
    }

    /// Interval for a forecast input. Forecast inputs always belong to the
    /// dummy org and space and carry explicit sizing.
    pub fn from_forecast_input(event: &UsageEvent) -> Self {
        Self {
            event_guid: event.event_guid,
            resource_guid: event.resource_guid,
            resource_name: event.resource_name.clone(),
            resource_type: event.resource_type.clone(),
            org_guid: event.org_guid,
            org_name: DUMMY_ORG_NAME.to_string(),
            space_guid: event.space_guid,
            space_name: DUMMY_SPACE_NAME.to_string(),
            plan_guid: event.plan_guid,
            plan_name: FORECAST_PLAN_NAME.to_string(),
            service_guid: event.service_guid,
            service_name: event.service_name.clone(),
            number_of_nodes: Some(event.number_of_nodes),
            memory_in_mb: Some(event.memory_in_mb),
            storage_in_mb: Some(event.storage_in_mb),
            duration: event.duration(),
        }
    }
}

const EVENT_COLUMNS: &str = "event_guid, resource_guid, resource_name, resource_type, \
     org_guid, org_name, space_guid, space_name, plan_guid, plan_name, service_guid, \
     service_name, number_of_nodes, memory_in_mb, storage_in_mb, duration_lo, duration_hi";

pub(crate) fn interval_from_row(row: &SqliteRow) -> Result<UsageInterval> {
    Ok(UsageInterval {
        event_guid: get_uuid(row, "event_guid")?,
        resource_guid: get_uuid(row, "resource_guid")?,
        resource_name: get_string(row, "resource_name")?,
        resource_type: get_string(row, "resource_type")?,
        org_guid: get_uuid(row, "org_guid")?,
        org_name: get_string(row, "org_name")?,
        space_guid: get_uuid(row, "space_guid")?,
        space_name: get_string(row, "space_name")?,
        plan_guid: get_uuid(row, "plan_guid")?,
        plan_name: get_string(row, "plan_name")?,
        service_guid: get_opt_uuid(row, "service_guid")?,
        service_name: get_opt_string(row, "service_name")?,
        number_of_nodes: get_opt_i64(row, "number_of_nodes")?,
        memory_in_mb: get_opt_i64(row, "memory_in_mb")?,
        storage_in_mb: get_opt_i64(row, "storage_in_mb")?,
        duration: get_range(row, "duration")?,
    })
}

/// Replaces the `events` relation
pub(crate) async fn replace_intervals(
    conn: &mut SqliteConnection,
    intervals: &[UsageInterval],
) -> Result<()> {
    sqlx::query("DELETE FROM events")
        .execute(&mut *conn)
        .await
        .map_err(storage_error)?;

    let statement = format!(
        "INSERT INTO events ({EVENT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    for interval in intervals {
        sqlx::query(&statement)
            .bind(db::guid_text(&interval.event_guid))
            .bind(db::guid_text(&interval.resource_guid))
            .bind(&interval.resource_name)
            .bind(&interval.resource_type)
            .bind(db::guid_text(&interval.org_guid))
            .bind(&interval.org_name)
            .bind(db::guid_text(&interval.space_guid))
            .bind(&interval.space_name)
            .bind(db::guid_text(&interval.plan_guid))
            .bind(&interval.plan_name)
            .bind(interval.service_guid.as_ref().map(db::guid_text))
            .bind(&interval.service_name)
            .bind(interval.number_of_nodes)
            .bind(interval.memory_in_mb)
            .bind(interval.storage_in_mb)
            .bind(db::micros(interval.duration.lo))
            .bind(db::opt_micros(interval.duration.hi))
            .execute(&mut *conn)
            .await
            .map_err(storage_error)?;
    }
    Ok(())
}

/// All intervals in deterministic order
pub(crate) async fn load_intervals(conn: &mut SqliteConnection) -> Result<Vec<UsageInterval>> {
    let statement =
        format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY duration_lo, event_guid");
    let rows = sqlx::query(&statement)
        .fetch_all(&mut *conn)
        .await
        .map_err(storage_error)?;
    rows.iter().map(interval_from_row).collect()
}

/// SQL selecting intervals overlapping `[?, ?)` with `org_count` org
/// placeholders, ordered by clipped start. The range start is bound once more
/// after the orgs.
pub(crate) fn overlapping_intervals_sql(org_count: usize) -> String {
    let mut statement = format!(
        "SELECT {EVENT_COLUMNS} FROM events \
         WHERE (duration_hi IS NULL OR duration_hi > ?) AND duration_lo < ?"
    );
    if org_count > 0 {
        let placeholders = vec!["?"; org_count].join(", ");
        statement.push_str(&format!(" AND org_guid IN ({placeholders})"));
    }
    statement.push_str(" ORDER BY max(duration_lo, ?), event_guid");
    statement
}

/// Pushes the usage events of `filter` to `sink`, clipped to the range and
/// ordered by start time then event GUID
pub(crate) async fn usage_events(
    conn: &mut SqliteConnection,
    filter: &EventFilter,
    now: DateTime<Utc>,
    sink: &mut RowSink<UsageEvent>,
) -> Result<()> {
    let statement = overlapping_intervals_sql(filter.org_guids.len());
    let mut query = sqlx::query(&statement)
        .bind(db::micros(filter.range_start))
        .bind(db::micros(filter.range_stop));
    for org in &filter.org_guids {
        query = query.bind(db::guid_text(org));
    }
    query = query.bind(db::micros(filter.range_start));

    let window = filter.time_range();
    let mut rows = query.fetch(&mut *conn);
    while let Some(row) = rows.try_next().await.map_err(storage_error)? {
        if let Some(event) = interval_from_row(&row)?.to_usage_event(&window, now) {
            sink.push(event).await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use paasbill_common::types::range::parse_instant;

    fn at(s: &str) -> DateTime<Utc> {
        parse_instant(s).unwrap()
    }

    fn interval(duration: TimeRange) -> UsageInterval {
        UsageInterval {
            event_guid: Uuid::new_v4(),
            resource_guid: Uuid::new_v4(),
            resource_name: "web".to_string(),
            resource_type: "app".to_string(),
            org_guid: Uuid::new_v4(),
            org_name: "org".to_string(),
            space_guid: Uuid::new_v4(),
            space_name: "space".to_string(),
            plan_guid: Uuid::new_v4(),
            plan_name: "app".to_string(),
            service_guid: None,
            service_name: None,
            number_of_nodes: Some(2),
            memory_in_mb: None,
            storage_in_mb: Some(0),
            duration,
        }
    }

    #[test]
    fn test_usage_event_clipped_to_window() {
        let i = interval(TimeRange::new(at("2021-06-20"), at("2021-07-10")));
        let window = TimeRange::new(at("2021-07-01"), at("2021-08-01"));
        let usage = i.to_usage_event(&window, at("2022-01-01")).unwrap();
        assert_eq!(usage.event_start, at("2021-07-01"));
        assert_eq!(usage.event_stop, at("2021-07-10"));
        assert_eq!(usage.memory_in_mb, 0);
        assert_eq!(usage.number_of_nodes, 2);
    }

    #[test]
    fn test_open_usage_event_ends_now() {
        let i = interval(TimeRange::open(at("2021-07-01")));
        let window = TimeRange::new(at("2021-07-01"), at("2021-08-01"));
        let usage = i.to_usage_event(&window, at("2021-07-15")).unwrap();
        assert_eq!(usage.event_stop, at("2021-07-15"));

        // nothing to report when the window starts after now
        let future = TimeRange::new(at("2021-07-20"), at("2021-08-01"));
        assert!(i.to_usage_event(&future, at("2021-07-15")).is_none());
    }

    #[test]
    fn test_overlap_sql_placeholders() {
        assert!(!overlapping_intervals_sql(0).contains("org_guid IN"));
        assert!(overlapping_intervals_sql(2).contains("org_guid IN (?, ?)"));
    }

    #[tokio::test]
    async fn test_usage_events_ordered_by_clipped_start() {
        use crate::schema;
        use sqlx::Connection;

        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        schema::apply(&mut conn).await.unwrap();

        let mut early = interval(TimeRange::new(at("2021-06-10"), at("2021-07-05")));
        early.event_guid = Uuid::from_u128(2);
        let mut earlier = interval(TimeRange::new(at("2021-06-01"), at("2021-07-05")));
        earlier.event_guid = Uuid::from_u128(3);
        let mut inside = interval(TimeRange::open(at("2021-07-02")));
        inside.event_guid = Uuid::from_u128(1);
        let outside = interval(TimeRange::new(at("2021-05-01"), at("2021-06-01")));
        replace_intervals(&mut conn, &[inside, early, earlier, outside])
            .await
            .unwrap();

        let filter = EventFilter::new(at("2021-07-01"), at("2021-08-01"));
        let mut sink = RowSink::collect();
        usage_events(&mut conn, &filter, at("2021-07-03"), &mut sink)
            .await
            .unwrap();
        let events = sink.into_vec();

        let guids: Vec<_> = events.iter().map(|e| e.event_guid.as_u128()).collect();
        assert_eq!(guids, vec![2, 3, 1]);
        assert_eq!(events[0].event_start, at("2021-07-01"));
        assert_eq!(events[2].event_stop, at("2021-07-03"));
    }
}
