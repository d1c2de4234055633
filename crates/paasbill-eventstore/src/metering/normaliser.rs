//! Lifecycle normaliser
//!
//! Replays raw events in order and pairs start/stop style events into
//! [`UsageInterval`]s. Each resource kind has its own small state machine:
//!
//! - apps: `STARTED` opens, a `STARTED` with different instance count or
//!   memory splits, `STOPPED` closes
//! - tasks: `TASK_STARTED` / `TASK_STOPPED` per task
//! - staging: `STAGING_STARTED` / `STAGING_STOPPED` per (app, task)
//! - services: `CREATED` opens, `UPDATED` splits, `DELETED` closes
//! - compose audit events resize the matching service instance; a scale
//!   seen before any service event opens an interval that takes its
//!   metadata from the next service event for that instance
//!
//! Intervals still open after the last event stay open (`hi == None`).
//! Zero-length intervals are dropped.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use paasbill_common::{EventKind, RawEvent, TimeRange};
use tracing::{debug, warn};
use uuid::Uuid;

use super::payload::{
    AppState, AppUsagePayload, ComposeAuditPayload, ServiceState, ServiceUsagePayload,
};
use super::UsageInterval;
use crate::WellKnownPlans;

/// Counts reported after a rebuild
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormaliseSummary {
    pub raw_events: usize,
    pub intervals: usize,
    /// Events skipped because their payload could not be read
    pub malformed: BTreeMap<EventKind, usize>,
}

/// Sizing overrides received from compose audit events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Sizing {
    memory_in_mb: Option<i64>,
    storage_in_mb: Option<i64>,
}

/// Compose scale received before the instance had any service event
#[derive(Debug, Clone, Copy)]
struct PendingScale {
    event_guid: Uuid,
    start: DateTime<Utc>,
    sizing: Sizing,
}

/// Event GUID for a raw event: the GUID itself when it is a UUID, otherwise a
/// stable name-based UUID
pub fn event_guid_for(raw_guid: &str) -> Uuid {
    Uuid::parse_str(raw_guid)
        .unwrap_or_else(|_| Uuid::new_v5(&Uuid::NAMESPACE_URL, raw_guid.as_bytes()))
}

pub struct Normaliser {
    plans: WellKnownPlans,
    apps: HashMap<Uuid, UsageInterval>,
    tasks: HashMap<Uuid, UsageInterval>,
    staging: HashMap<(Uuid, Uuid), UsageInterval>,
    services: HashMap<Uuid, UsageInterval>,
    compose_sizing: HashMap<Uuid, Sizing>,
    pending_scales: HashMap<Uuid, Vec<PendingScale>>,
    known_services: HashSet<Uuid>,
    closed: Vec<UsageInterval>,
    summary: NormaliseSummary,
}

impl Normaliser {
    pub fn new(plans: WellKnownPlans) -> Self {
        Self {
            plans,
            apps: HashMap::new(),
            tasks: HashMap::new(),
            staging: HashMap::new(),
            services: HashMap::new(),
            compose_sizing: HashMap::new(),
            pending_scales: HashMap::new(),
            known_services: HashSet::new(),
            closed: Vec::new(),
            summary: NormaliseSummary::default(),
        }
    }

    /// Feeds one raw event. Events must arrive in replay order.
    pub fn push(&mut self, event: &RawEvent) {
        self.summary.raw_events += 1;
        let parsed = match event.kind {
            EventKind::App => serde_json::from_value::<AppUsagePayload>(event.raw_message.clone())
                .map(|payload| self.on_app(event, &payload)),
            EventKind::Service => {
                serde_json::from_value::<ServiceUsagePayload>(event.raw_message.clone())
                    .map(|payload| self.on_service(event, &payload))
            }
            EventKind::Compose => {
                serde_json::from_value::<ComposeAuditPayload>(event.raw_message.clone())
                    .map(|payload| self.on_compose(event, &payload))
            }
        };
        if let Err(e) = parsed {
            self.malformed(event, &e.to_string());
        }
    }

    /// Closes nothing further; returns every interval ordered by start time
    pub fn finish(mut self) -> (Vec<UsageInterval>, NormaliseSummary) {
        let open = self
            .apps
            .drain()
            .map(|(_, i)| i)
            .chain(self.tasks.drain().map(|(_, i)| i))
            .chain(self.staging.drain().map(|(_, i)| i))
            .chain(self.services.drain().map(|(_, i)| i));
        for (instance, pending) in self.pending_scales.drain() {
            debug!(%instance, scales = pending.len(), "Dropping compose scales with no service event");
        }
        self.closed.extend(open);
        self.closed
            .sort_by(|a, b| (a.duration.lo, a.event_guid).cmp(&(b.duration.lo, b.event_guid)));
        self.summary.intervals = self.closed.len();
        (self.closed, self.summary)
    }

    fn malformed(&mut self, event: &RawEvent, reason: &str) {
        warn!(kind = %event.kind, guid = %event.guid, reason, "Skipping malformed event payload");
        *self.summary.malformed.entry(event.kind).or_default() += 1;
    }

    fn close(&mut self, mut interval: UsageInterval, at: DateTime<Utc>) {
        if at <= interval.duration.lo {
            debug!(event_guid = %interval.event_guid, "Dropping zero-length interval");
            return;
        }
        interval.duration.hi = Some(at);
        self.closed.push(interval);
    }

    fn on_app(&mut self, event: &RawEvent, payload: &AppUsagePayload) {
        let at = event.created_at;
        match payload.app_state() {
            AppState::Started => {
                let Some(app_guid) = payload.app_guid else {
                    return self.malformed(event, "app event without app_guid");
                };
                if let Some(open) = self.apps.get(&app_guid) {
                    let unchanged = open.number_of_nodes == Some(payload.instance_count)
                        && open.memory_in_mb == Some(payload.memory_in_mb_per_instance);
                    if unchanged {
                        return;
                    }
                }
                if let Some(previous) = self.apps.remove(&app_guid) {
                    self.close(previous, at);
                }
                let interval = self.app_interval(event, payload, app_guid);
                self.apps.insert(app_guid, interval);
            }
            AppState::Stopped => {
                if let Some(open) = payload.app_guid.and_then(|guid| self.apps.remove(&guid)) {
                    self.close(open, at);
                }
            }
            AppState::TaskStarted => {
                let Some(task_guid) = payload.task_guid else {
                    return self.malformed(event, "task event without task_guid");
                };
                if self.tasks.contains_key(&task_guid) {
                    return;
                }
                let name = payload
                    .task_name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .or_else(|| payload.parent_app_name.clone())
                    .unwrap_or_else(|| payload.app_name.clone());
                let interval = self.compute_interval(
                    event,
                    payload,
                    task_guid,
                    name,
                    "task",
                    self.plans.task_plan_guid,
                );
                self.tasks.insert(task_guid, interval);
            }
            AppState::TaskStopped => {
                if let Some(open) = payload.task_guid.and_then(|guid| self.tasks.remove(&guid)) {
                    self.close(open, at);
                }
            }
            AppState::StagingStarted => {
                let Some(key) = staging_key(payload) else {
                    return self.malformed(event, "staging event without app guid");
                };
                if self.staging.contains_key(&key) {
                    return;
                }
                let name = payload
                    .parent_app_name
                    .clone()
                    .filter(|n| !n.is_empty())
                    .unwrap_or_else(|| payload.app_name.clone());
                let interval = self.compute_interval(
                    event,
                    payload,
                    key.0,
                    name,
                    "staging",
                    self.plans.staging_plan_guid,
                );
                self.staging.insert(key, interval);
            }
            AppState::StagingStopped => {
                if let Some(open) = staging_key(payload).and_then(|key| self.staging.remove(&key)) {
                    self.close(open, at);
                }
            }
            AppState::Other => {}
        }
    }

    fn app_interval(&self, event: &RawEvent, payload: &AppUsagePayload, app_guid: Uuid) -> UsageInterval {
        let mut interval = self.compute_interval(
            event,
            payload,
            app_guid,
            payload.app_name.clone(),
            "app",
            self.plans.compute_plan_guid,
        );
        interval.number_of_nodes = Some(payload.instance_count);
        interval
    }

    fn compute_interval(
        &self,
        event: &RawEvent,
        payload: &AppUsagePayload,
        resource_guid: Uuid,
        resource_name: String,
        resource_type: &str,
        plan_guid: Uuid,
    ) -> UsageInterval {
        UsageInterval {
            event_guid: event_guid_for(&event.guid),
            resource_guid,
            resource_name,
            resource_type: resource_type.to_string(),
            org_guid: payload.org_guid,
            org_name: payload.org_guid.to_string(),
            space_guid: payload.space_guid,
            space_name: payload.space_name.clone(),
            plan_guid,
            plan_name: resource_type.to_string(),
            service_guid: Some(self.plans.compute_service_guid),
            service_name: Some(resource_type.to_string()),
            number_of_nodes: Some(1),
            memory_in_mb: Some(payload.memory_in_mb_per_instance),
            storage_in_mb: Some(0),
            duration: TimeRange::open(event.created_at),
        }
    }

    fn service_interval(
        &self,
        event_guid: Uuid,
        payload: &ServiceUsagePayload,
        sizing: Sizing,
        start: DateTime<Utc>,
    ) -> UsageInterval {
        UsageInterval {
            event_guid,
            resource_guid: payload.service_instance_guid,
            resource_name: payload.service_instance_name.clone(),
            resource_type: payload.service_label.clone(),
            org_guid: payload.org_guid,
            org_name: payload.org_guid.to_string(),
            space_guid: payload.space_guid,
            space_name: payload.space_name.clone(),
            plan_guid: payload.service_plan_guid,
            plan_name: payload.service_plan_name.clone(),
            service_guid: payload.service_guid,
            service_name: Some(payload.service_label.clone()),
            number_of_nodes: None,
            memory_in_mb: sizing.memory_in_mb,
            storage_in_mb: sizing.storage_in_mb,
            duration: TimeRange::open(start),
        }
    }

    fn on_service(&mut self, event: &RawEvent, payload: &ServiceUsagePayload) {
        if !payload.is_managed() {
            return;
        }
        let instance = payload.service_instance_guid;
        let at = event.created_at;
        self.known_services.insert(instance);

        // Each pending scale runs until the next one, the last until this event
        if let Some(pending) = self.pending_scales.remove(&instance) {
            let stops: Vec<_> = pending.iter().skip(1).map(|p| p.start).chain([at]).collect();
            for (scale, stop) in pending.into_iter().zip(stops) {
                let interval = self.service_interval(scale.event_guid, payload, scale.sizing, scale.start);
                self.close(interval, stop);
            }
        }

        match payload.service_state() {
            ServiceState::Created | ServiceState::Updated => {
                if let Some(previous) = self.services.remove(&instance) {
                    self.close(previous, at);
                }
                let sizing = self.compose_sizing.get(&instance).copied().unwrap_or_default();
                let interval = self.service_interval(event_guid_for(&event.guid), payload, sizing, at);
                self.services.insert(instance, interval);
            }
            ServiceState::Deleted => {
                if let Some(open) = self.services.remove(&instance) {
                    self.close(open, at);
                }
            }
            ServiceState::Other => {}
        }
    }

    fn on_compose(&mut self, event: &RawEvent, payload: &ComposeAuditPayload) {
        if !payload.is_scale() {
            return;
        }
        let Some(instance) = payload.service_instance_guid() else {
            return self.malformed(event, "deployment name does not end in a service instance guid");
        };
        let previous = self.compose_sizing.get(&instance).copied().unwrap_or_default();
        let sizing = Sizing {
            memory_in_mb: payload.memory_in_mb().or(previous.memory_in_mb),
            storage_in_mb: payload.storage_in_mb().or(previous.storage_in_mb),
        };
        self.compose_sizing.insert(instance, sizing);

        let at = event.created_at;
        let event_guid = Uuid::new_v5(&Uuid::NAMESPACE_URL, payload.id.as_bytes());
        let Some(open) = self.services.remove(&instance) else {
            if !self.known_services.contains(&instance) {
                self.pending_scales
                    .entry(instance)
                    .or_default()
                    .push(PendingScale { event_guid, start: at, sizing });
            }
            return;
        };
        let mut resized = open.clone();
        resized.event_guid = event_guid;
        resized.memory_in_mb = sizing.memory_in_mb;
        resized.storage_in_mb = sizing.storage_in_mb;
        resized.duration = TimeRange::open(at.max(open.duration.lo));
        self.close(open, at);
        self.services.insert(instance, resized);
    }
}

fn staging_key(payload: &AppUsagePayload) -> Option<(Uuid, Uuid)> {
    let app = payload.parent_app_guid.or(payload.app_guid)?;
    Some((app, payload.task_guid.unwrap_or(app)))
}

/// Runs the normaliser over an ordered sequence of raw events
pub fn normalise<'a, I>(plans: WellKnownPlans, events: I) -> (Vec<UsageInterval>, NormaliseSummary)
where
    I: IntoIterator<Item = &'a RawEvent>,
{
    let mut normaliser = Normaliser::new(plans);
    for event in events {
        normaliser.push(event);
    }
    normaliser.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use paasbill_common::types::range::parse_instant;
    use serde_json::{json, Value};

    const ORG: &str = "51ba75ef-edc0-47ad-a633-a8f6e8770944";
    const SPACE: &str = "276f4886-ac40-492d-a8cd-b2646637ba76";
    const APP: &str = "c85e98f0-6d1b-4f45-9368-ea58263165a0";
    const INSTANCE: &str = "aaaaaaaa-0000-0000-0000-000000000001";
    const PLAN: &str = "efb5f1ce-0a8a-435d-a8b2-6b2b61c6dbe5";

    fn at(s: &str) -> DateTime<Utc> {
        parse_instant(s).unwrap()
    }

    fn app_event(guid: &str, time: &str, state: &str, instances: i64, memory: i64) -> RawEvent {
        RawEvent::new(
            guid,
            EventKind::App,
            at(time),
            json!({
                "state": state,
                "app_guid": APP,
                "app_name": "web",
                "org_guid": ORG,
                "space_guid": SPACE,
                "space_name": "sandbox",
                "instance_count": instances,
                "memory_in_mb_per_instance": memory,
            }),
        )
    }

    fn service_event(guid: &str, time: &str, state: &str, name: &str) -> RawEvent {
        RawEvent::new(
            guid,
            EventKind::Service,
            at(time),
            json!({
                "state": state,
                "org_guid": ORG,
                "space_guid": SPACE,
                "space_name": "sandbox",
                "service_guid": "efadb775-58c4-4e17-8087-6d0f4febc489",
                "service_label": "compose-db",
                "service_plan_guid": PLAN,
                "service_plan_name": "PLAN1",
                "service_instance_guid": INSTANCE,
                "service_instance_name": name,
                "service_instance_type": "managed_service_instance",
            }),
        )
    }

    fn compose_event(id: &str, time: &str) -> RawEvent {
        RawEvent::new(
            id,
            EventKind::Compose,
            at(time),
            json!({
                "id": id,
                "event": "deployment.scale.members",
                "data": {"memory": "2 GB", "storage": "4 GB", "deployment": format!("prod-{INSTANCE}")},
            }),
        )
    }

    fn run(events: &[RawEvent]) -> Vec<UsageInterval> {
        normalise(WellKnownPlans::default(), events).0
    }

    #[test]
    fn test_app_scale_splits_interval() {
        let events = vec![
            app_event("00000000-0000-0000-0000-000000000001", "2001-01-01T00:00Z", "STARTED", 1, 1024),
            app_event("00000000-0000-0000-0000-000000000002", "2001-01-01T01:00Z", "STARTED", 2, 1024),
            app_event("00000000-0000-0000-0000-000000000003", "2001-01-01T02:00Z", "STOPPED", 2, 1024),
        ];
        let intervals = run(&events);
        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].number_of_nodes, Some(1));
        assert_eq!(intervals[0].duration, TimeRange::new(at("2001-01-01T00:00Z"), at("2001-01-01T01:00Z")));
        assert_eq!(intervals[1].number_of_nodes, Some(2));
        assert_eq!(intervals[1].event_guid.to_string(), "00000000-0000-0000-0000-000000000002");
        assert_eq!(intervals[1].plan_guid, WellKnownPlans::default().compute_plan_guid);
        assert_eq!(intervals[1].org_name, ORG);
    }

    #[test]
    fn test_repeated_start_without_change_is_ignored() {
        let events = vec![
            app_event("a", "2001-01-01T00:00Z", "STARTED", 1, 1024),
            app_event("b", "2001-01-01T01:00Z", "STARTED", 1, 1024),
            app_event("c", "2001-01-01T01:30Z", "BUILDPACK_SET", 1, 1024),
        ];
        let intervals = run(&events);
        assert_eq!(intervals.len(), 1);
        assert!(intervals[0].duration.hi.is_none());
        assert_eq!(intervals[0].event_guid, event_guid_for("a"));
    }

    #[test]
    fn test_zero_length_interval_dropped() {
        let events = vec![
            app_event("a", "2001-01-01T00:00Z", "STARTED", 1, 1024),
            app_event("b", "2001-01-01T00:00Z", "STOPPED", 1, 1024),
        ];
        assert!(run(&events).is_empty());
    }

    #[test]
    fn test_task_interval() {
        let mut start = app_event("t1", "2001-01-01T00:00Z", "TASK_STARTED", 1, 256);
        start.raw_message["task_guid"] = Value::from("11111111-0000-0000-0000-000000000001");
        start.raw_message["task_name"] = Value::from("migrate");
        let mut stop = app_event("t2", "2001-01-01T00:10Z", "TASK_STOPPED", 1, 256);
        stop.raw_message["task_guid"] = Value::from("11111111-0000-0000-0000-000000000001");

        let intervals = run(&[start, stop]);
        assert_eq!(intervals.len(), 1);
        let task = &intervals[0];
        assert_eq!(task.resource_type, "task");
        assert_eq!(task.resource_name, "migrate");
        assert_eq!(task.resource_guid.to_string(), "11111111-0000-0000-0000-000000000001");
        assert_eq!(task.plan_guid, WellKnownPlans::default().task_plan_guid);
        assert_eq!(task.memory_in_mb, Some(256));
    }

    #[test]
    fn test_staging_interval_uses_parent_app() {
        let mut start = app_event("s1", "2001-01-01T00:00Z", "STAGING_STARTED", 1, 1024);
        start.raw_message["parent_app_guid"] = Value::from(APP);
        start.raw_message["parent_app_name"] = Value::from("web-parent");
        start.raw_message["task_guid"] = Value::from("22222222-0000-0000-0000-000000000001");
        let mut stop = start.clone();
        stop.guid = "s2".to_string();
        stop.created_at = at("2001-01-01T00:05Z");
        stop.raw_message["state"] = Value::from("STAGING_STOPPED");

        let intervals = run(&[start, stop]);
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].resource_type, "staging");
        assert_eq!(intervals[0].resource_name, "web-parent");
        assert_eq!(intervals[0].resource_guid.to_string(), APP);
    }

    #[test]
    fn test_service_updates_and_compose_scale() {
        let events = vec![
            service_event("00000000-0000-0000-0000-000000000001", "2001-01-01T00:00Z", "CREATED", "db1"),
            service_event("00000000-0000-0000-0000-000000000002", "2001-01-01T01:00Z", "UPDATED", "db1-renamed"),
            compose_event("audit-id-000000000003", "2001-01-01T02:00Z"),
            service_event("00000000-0000-0000-0000-000000000004", "2001-01-01T03:00Z", "UPDATED", "db1-renamed-again"),
            service_event("00000000-0000-0000-0000-000000000005", "2001-01-01T04:00Z", "DELETED", "db1-renamed-again"),
        ];
        let intervals = run(&events);
        assert_eq!(intervals.len(), 4);

        assert_eq!(intervals[0].resource_name, "db1");
        assert_eq!(intervals[0].memory_in_mb, None);
        assert_eq!(intervals[1].resource_name, "db1-renamed");
        assert_eq!(intervals[1].duration.hi, Some(at("2001-01-01T02:00Z")));

        assert_eq!(intervals[2].resource_name, "db1-renamed");
        assert_eq!(intervals[2].memory_in_mb, Some(2048));
        assert_eq!(intervals[2].storage_in_mb, Some(4096));
        assert_eq!(
            intervals[2].event_guid,
            Uuid::new_v5(&Uuid::NAMESPACE_URL, b"audit-id-000000000003")
        );

        assert_eq!(intervals[3].resource_name, "db1-renamed-again");
        assert_eq!(intervals[3].memory_in_mb, Some(2048));
        assert_eq!(intervals[3].duration.hi, Some(at("2001-01-01T04:00Z")));
        assert!(intervals.iter().all(|i| i.resource_type == "compose-db"));
    }

    #[test]
    fn test_compose_before_create_opens_interval() {
        let events = vec![
            compose_event("audit-id-000000000003", "2001-01-01T00:00Z"),
            service_event("00000000-0000-0000-0000-000000000001", "2001-01-01T01:00Z", "CREATED", "db1"),
            service_event("00000000-0000-0000-0000-000000000005", "2001-01-01T02:00Z", "DELETED", "db1"),
        ];
        let intervals = run(&events);
        assert_eq!(intervals.len(), 2);

        let scaled = &intervals[0];
        assert_eq!(scaled.event_guid, Uuid::new_v5(&Uuid::NAMESPACE_URL, b"audit-id-000000000003"));
        assert_eq!(scaled.duration, TimeRange::new(at("2001-01-01T00:00Z"), at("2001-01-01T01:00Z")));
        assert_eq!(scaled.resource_guid.to_string(), INSTANCE);
        assert_eq!(scaled.resource_name, "db1");
        assert_eq!(scaled.org_guid.to_string(), ORG);
        assert_eq!(scaled.space_guid.to_string(), SPACE);
        assert_eq!(scaled.plan_guid.to_string(), PLAN);
        assert_eq!(scaled.plan_name, "PLAN1");
        assert_eq!(scaled.service_name.as_deref(), Some("compose-db"));
        assert_eq!(scaled.memory_in_mb, Some(2048));
        assert_eq!(scaled.storage_in_mb, Some(4096));

        let created = &intervals[1];
        assert_eq!(created.event_guid.to_string(), "00000000-0000-0000-0000-000000000001");
        assert_eq!(created.duration, TimeRange::new(at("2001-01-01T01:00Z"), at("2001-01-01T02:00Z")));
        assert_eq!(created.memory_in_mb, Some(2048));
        assert_eq!(created.storage_in_mb, Some(4096));
    }

    #[test]
    fn test_repeated_compose_before_create_splits() {
        let events = vec![
            compose_event("audit-1", "2001-01-01T00:00Z"),
            compose_event("audit-2", "2001-01-01T00:30Z"),
            service_event("00000000-0000-0000-0000-000000000001", "2001-01-01T01:00Z", "CREATED", "db1"),
        ];
        let intervals = run(&events);
        assert_eq!(intervals.len(), 3);
        assert_eq!(intervals[0].duration.hi, Some(at("2001-01-01T00:30Z")));
        assert_eq!(intervals[1].duration, TimeRange::new(at("2001-01-01T00:30Z"), at("2001-01-01T01:00Z")));
        assert!(intervals[2].duration.hi.is_none());
    }

    #[test]
    fn test_compose_after_delete_does_not_reopen() {
        let events = vec![
            service_event("00000000-0000-0000-0000-000000000001", "2001-01-01T00:00Z", "CREATED", "db1"),
            service_event("00000000-0000-0000-0000-000000000005", "2001-01-01T01:00Z", "DELETED", "db1"),
            compose_event("audit-id-000000000003", "2001-01-01T02:00Z"),
        ];
        let intervals = run(&events);
        assert_eq!(intervals.len(), 1);
        assert_eq!(intervals[0].duration.hi, Some(at("2001-01-01T01:00Z")));
    }

    #[test]
    fn test_compose_without_service_event_is_dropped() {
        assert!(run(&[compose_event("audit-id-000000000003", "2001-01-01T00:00Z")]).is_empty());
    }

    #[test]
    fn test_unmanaged_and_malformed_events() {
        let mut user_provided = service_event("u1", "2001-01-01T00:00Z", "CREATED", "ups");
        user_provided.raw_message["service_instance_type"] = Value::from("user_provided_service_instance");
        let broken = RawEvent::new("b1", EventKind::App, at("2001-01-01T00:00Z"), json!({"state": "STARTED"}));

        let (intervals, summary) = normalise(WellKnownPlans::default(), &[user_provided, broken]);
        assert!(intervals.is_empty());
        assert_eq!(summary.raw_events, 2);
        assert_eq!(summary.malformed.get(&EventKind::App), Some(&1));
        assert_eq!(summary.malformed.get(&EventKind::Service), None);
    }
}
