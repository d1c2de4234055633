//! Billable aggregator
//!
//! Folds priced component slices into [`BillableEvent`]s in a single pass.
//! Input must be ordered by event GUID, then slice start.

use chrono::{DateTime, Utc};
use paasbill_common::{BillableEvent, Price, PriceComponent, Result, TimeRange};

use crate::pricing::{ComponentSlice, FormulaCache};

struct Pending {
    event: BillableEvent,
    details: Vec<PriceComponent>,
}

impl Pending {
    fn start(slice: &ComponentSlice, detail: PriceComponent) -> Self {
        Self {
            event: BillableEvent {
                event_guid: slice.event_guid,
                event_start: detail.start,
                event_stop: detail.stop,
                resource_guid: slice.resource_guid,
                resource_name: slice.resource_name.clone(),
                resource_type: slice.resource_type.clone(),
                org_guid: slice.org_guid,
                org_name: slice.org_name.clone(),
                space_guid: slice.space_guid,
                space_name: slice.space_name.clone(),
                plan_guid: slice.plan_guid,
                plan_name: slice.event_plan_name.clone(),
                number_of_nodes: slice.number_of_nodes,
                memory_in_mb: slice.memory_in_mb,
                storage_in_mb: slice.storage_in_mb,
                price: Price::default(),
            },
            details: vec![detail],
        }
    }

    /// Same event and same resolved attributes
    fn matches(&self, slice: &ComponentSlice) -> bool {
        let e = &self.event;
        e.event_guid == slice.event_guid
            && e.resource_guid == slice.resource_guid
            && e.resource_name == slice.resource_name
            && e.resource_type == slice.resource_type
            && e.org_guid == slice.org_guid
            && e.org_name == slice.org_name
            && e.space_guid == slice.space_guid
            && e.space_name == slice.space_name
            && e.plan_guid == slice.plan_guid
            && e.plan_name == slice.event_plan_name
            && e.number_of_nodes == slice.number_of_nodes
            && e.memory_in_mb == slice.memory_in_mb
            && e.storage_in_mb == slice.storage_in_mb
    }

    fn add(&mut self, detail: PriceComponent) {
        self.event.event_start = self.event.event_start.min(detail.start);
        self.event.event_stop = self.event.event_stop.max(detail.stop);
        self.details.push(detail);
    }

    fn finish(mut self) -> BillableEvent {
        self.details.sort_by_key(|d| d.start);
        self.event.price = Price::from_details(self.details);
        self.event
    }
}

/// Streaming grouper of component slices priced over one read window
pub struct Aggregator<'a> {
    window: TimeRange,
    now: DateTime<Utc>,
    formulas: &'a FormulaCache,
    pending: Option<Pending>,
}

impl<'a> Aggregator<'a> {
    pub fn new(window: TimeRange, now: DateTime<Utc>, formulas: &'a FormulaCache) -> Self {
        Self {
            window,
            now,
            formulas,
            pending: None,
        }
    }

    /// Adds a slice; returns the previous event once a slice of a different
    /// event arrives
    pub fn push(&mut self, slice: &ComponentSlice) -> Result<Option<BillableEvent>> {
        let Some(detail) = slice.price(&self.window, self.now, self.formulas)? else {
            return Ok(None);
        };
        if let Some(pending) = self.pending.as_mut() {
            if pending.matches(slice) {
                pending.add(detail);
                return Ok(None);
            }
        }
        let done = self.pending.replace(Pending::start(slice, detail));
        Ok(done.map(Pending::finish))
    }

    /// The last event, if any
    pub fn finish(self) -> Option<BillableEvent> {
        self.pending.map(Pending::finish)
    }
}

/// Aggregates slices held in memory. Slices may be in any order.
pub fn aggregate(
    slices: &[ComponentSlice],
    window: TimeRange,
    now: DateTime<Utc>,
    formulas: &FormulaCache,
) -> Result<Vec<BillableEvent>> {
    let mut ordered: Vec<&ComponentSlice> = slices.iter().collect();
    ordered.sort_by_key(|s| (s.event_guid, s.duration.lo));

    let mut aggregator = Aggregator::new(window, now, formulas);
    let mut events = Vec::new();
    for slice in ordered {
        if let Some(event) = aggregator.push(slice)? {
            events.push(event);
        }
    }
    events.extend(aggregator.finish());
    Ok(events)
}
