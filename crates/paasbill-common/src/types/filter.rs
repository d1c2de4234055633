//! Read filters for raw, usage and billable event queries

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::events::EventKind;
use super::range::{self, TimeRange};
use crate::error::{Result, ValidationError};

/// Filter over normalised events: a `[range_start, range_stop)` window and an
/// optional set of organisations (empty means every organisation)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    #[serde(with = "range::instant_format")]
    pub range_start: DateTime<Utc>,
    #[serde(with = "range::instant_format")]
    pub range_stop: DateTime<Utc>,
    #[serde(default)]
    pub org_guids: Vec<Uuid>,
}

impl EventFilter {
    pub fn new(range_start: DateTime<Utc>, range_stop: DateTime<Utc>) -> Self {
        Self {
            range_start,
            range_stop,
            org_guids: Vec::new(),
        }
    }

    pub fn with_orgs(mut self, org_guids: Vec<Uuid>) -> Self {
        self.org_guids = org_guids;
        self
    }

    /// Builds a filter from request parameters.
    ///
    /// Both bounds are required and must be `YYYY-MM-DD` or RFC 3339. Org GUIDs
    /// must be valid UUIDs.
    pub fn parse<S: AsRef<str>>(
        range_start: Option<&str>,
        range_stop: Option<&str>,
        org_guids: &[S],
    ) -> Result<Self> {
        let range_start = parse_bound("range_start", range_start)?;
        let range_stop = parse_bound("range_stop", range_stop)?;
        let org_guids = org_guids
            .iter()
            .map(|guid| {
                Uuid::parse_str(guid.as_ref()).map_err(|_| ValidationError::InvalidField {
                    field: "org_guid".to_string(),
                    reason: format!("'{}' is not a valid GUID", guid.as_ref()),
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let filter = Self {
            range_start,
            range_stop,
            org_guids,
        };
        filter.validate()?;
        Ok(filter)
    }

    /// Rejects a reversed range; an empty range is valid and selects nothing
    pub fn validate(&self) -> Result<()> {
        if self.range_stop < self.range_start {
            return Err(ValidationError::InvalidRange(format!(
                "range_stop '{}' is before range_start '{}'",
                range::format_instant(&self.range_stop),
                range::format_instant(&self.range_start)
            ))
            .into());
        }
        Ok(())
    }

    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.range_start, self.range_stop)
    }

    pub fn has_org_filter(&self) -> bool {
        !self.org_guids.is_empty()
    }

    pub fn matches_org(&self, org_guid: &Uuid) -> bool {
        self.org_guids.is_empty() || self.org_guids.contains(org_guid)
    }

    /// Splits the range at every UTC month start. Inner segments are whole
    /// months; the first and last may be partial. Empty or reversed ranges give
    /// no segments.
    pub fn split_by_month(&self) -> Vec<EventFilter> {
        let mut segments = Vec::new();
        let mut cursor = self.range_start;
        while cursor < self.range_stop {
            let next = range::next_month_start(cursor);
            let stop = next.min(self.range_stop);
            segments.push(EventFilter {
                range_start: cursor,
                range_stop: stop,
                org_guids: self.org_guids.clone(),
            });
            cursor = next;
        }
        segments
    }

    /// Moves both bounds down to the first instant of their month
    pub fn truncate_month(&self) -> EventFilter {
        EventFilter {
            range_start: range::month_start(self.range_start),
            range_stop: range::month_start(self.range_stop),
            org_guids: self.org_guids.clone(),
        }
    }

    pub fn is_month_aligned(&self) -> bool {
        range::is_month_start(self.range_start) && range::is_month_start(self.range_stop)
    }

    /// True when the filter covers exactly one calendar month
    pub fn is_single_month(&self) -> bool {
        range::is_month_start(self.range_start)
            && range::next_month_start(self.range_start) == self.range_stop
    }
}

fn parse_bound(name: &str, value: Option<&str>) -> Result<DateTime<Utc>> {
    let value = value.unwrap_or_default();
    range::parse_instant(value)
        .filter(|_| !value.eq_ignore_ascii_case("epoch"))
        .ok_or_else(|| {
            ValidationError::InvalidRangeValue {
                name: name.to_string(),
                value: value.to_string(),
            }
            .into()
        })
}

/// Window for reference data reads (plans, VAT, currency)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeFilter {
    #[serde(with = "range::instant_format")]
    pub range_start: DateTime<Utc>,
    #[serde(with = "range::instant_format")]
    pub range_stop: DateTime<Utc>,
}

impl RangeFilter {
    pub fn parse(range_start: Option<&str>, range_stop: Option<&str>) -> Result<Self> {
        let filter = EventFilter::parse::<&str>(range_start, range_stop, &[])?;
        Ok(Self {
            range_start: filter.range_start,
            range_stop: filter.range_stop,
        })
    }

    pub fn time_range(&self) -> TimeRange {
        TimeRange::new(self.range_start, self.range_stop)
    }
}

/// Filter over the raw event tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEventFilter {
    pub kind: EventKind,
    /// Maximum rows returned; `None` or `0` is unlimited
    pub limit: Option<u32>,
    /// Oldest first when set, newest first otherwise
    pub reverse: bool,
}

impl RawEventFilter {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            limit: None,
            reverse: false,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn reversed(mut self) -> Self {
        self.reverse = true;
        self
    }

    /// Effective SQL limit, `None` when unlimited
    pub fn effective_limit(&self) -> Option<i64> {
        self.limit.filter(|l| *l > 0).map(i64::from)
    }
}
