//! HTTP API tests against a temporary SQLite database

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use axum::Router;
use paasbill_api::auth::StaticAuthenticator;
use paasbill_api::{router, AppState};
use paasbill_common::types::range::parse_instant;
use paasbill_common::{
    BillableEvent, Config, CurrencyCode, CurrencyRate, EventKind, PricingPlan, PricingPlanComponent,
    RawEvent, TotalCost, UsageEvent, VatCode, VatRate, DEFAULT_COMPUTE_PLAN_GUID,
};
use paasbill_eventstore::{EngineConfig, EventStore, StoreMetrics};
use rust_decimal_macros::dec;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;

const ORG: &str = "51ba75ef-edc0-47ad-a633-a8f6e8770944";
const OTHER_ORG: &str = "6f1b4c3a-1d8a-4c0b-9e7e-2b5f0c1d9a01";
const DUMMY_ORG: &str = "00000001-0000-0000-0000-000000000000";
const DB_PLAN: &str = "8f7d5d4c-5b0a-4b1e-9f0c-2d3e4f5a6b7c";
const MARCH: &str = "range_start=2021-03-01&range_stop=2021-04-01";

struct TestApp {
    _dir: TempDir,
    router: Router,
}

fn plan(plan_guid: Uuid, name: &str, formula: &str) -> PricingPlan {
    PricingPlan {
        plan_guid,
        valid_from: parse_instant("2017-01-01").unwrap(),
        name: name.to_string(),
        memory_in_mb: 0,
        storage_in_mb: 0,
        number_of_nodes: 1,
        components: vec![PricingPlanComponent {
            name: name.to_string(),
            formula: formula.to_string(),
            vat_code: VatCode::Standard,
            currency_code: CurrencyCode::Gbp,
        }],
    }
}

fn reference() -> Config {
    let mut config = Config::default();
    config.add_vat_rate(VatRate {
        code: VatCode::Standard,
        valid_from: parse_instant("2017-01-01").unwrap(),
        rate: dec!(0.2),
    });
    config.add_currency_rate(CurrencyRate {
        code: CurrencyCode::Gbp,
        valid_from: parse_instant("2017-01-01").unwrap(),
        rate: dec!(1),
    });
    config.add_plan(plan(
        DEFAULT_COMPUTE_PLAN_GUID,
        "app",
        "$number_of_nodes * ceil($time_in_seconds / 3600) * 0.01",
    ));
    config.add_plan(plan(
        Uuid::parse_str(DB_PLAN).unwrap(),
        "postgres small",
        "$number_of_nodes * ceil($time_in_seconds / 3600) * 0.1",
    ));
    config
}

fn app_event(guid: &str, org: &str, state: &str, created_at: &str) -> RawEvent {
    RawEvent::new(
        guid,
        EventKind::App,
        parse_instant(created_at).unwrap(),
        json!({
            "state": state,
            "app_guid": "c85e98f0-6d1b-4f45-9368-ea58263165a0",
            "app_name": "web",
            "org_guid": org,
            "space_guid": "276f4886-ac40-492d-a8cd-b2646637ba76",
            "space_name": "dev",
            "instance_count": 1,
            "memory_in_mb_per_instance": 1024
        }),
    )
}

impl TestApp {
    /// One app in ORG running for the first day of March 2021
    async fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}", dir.path().join("billing.db").display());
        let registry = prometheus::Registry::new();
        let metrics = StoreMetrics::new().unwrap();
        metrics.register(&registry).unwrap();
        let store = EventStore::connect(EngineConfig::default().with_database_url(url), reference(), metrics)
            .await
            .unwrap();
        store.init().await.unwrap();
        store
            .store_events(&[
                app_event("0ae1c4ab-6aed-4e3d-a4b7-2cc0b3c9fa01", ORG, "STARTED", "2021-03-01"),
                app_event("0ae1c4ab-6aed-4e3d-a4b7-2cc0b3c9fa02", ORG, "STOPPED", "2021-03-02"),
            ])
            .await
            .unwrap();
        store.refresh().await.unwrap();

        let authenticator = StaticAuthenticator::new()
            .with_admin("admin-token")
            .with_billing_manager("manager-token", [Uuid::parse_str(ORG).unwrap()]);
        let router = router(AppState::new(store, Arc::new(authenticator), registry));
        Self { _dir: dir, router }
    }

    async fn get(&self, uri: &str, token: Option<&str>) -> Response {
        let mut request = Request::builder().uri(uri);
        if let Some(token) = token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        self.router
            .clone()
            .oneshot(request.body(Body::empty()).unwrap())
            .await
            .unwrap()
    }
}

async fn body_bytes(response: Response) -> Vec<u8> {
    to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec()
}

async fn body_json(response: Response) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

#[cfg(test)]
mod status_tests {
    use super::*;

    #[tokio::test]
    async fn test_status_is_ok_and_uncached() {
        let app = TestApp::new().await;
        let response = app.get("/", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CACHE_CONTROL], "no-store");
        assert_eq!(body_json(response).await, json!({"ok": true}));
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let app = TestApp::new().await;
        let response = app.get("/metrics", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let text = String::from_utf8(body_bytes(response).await).unwrap();
        assert!(text.contains("paas_billing_eventstore_vat_configured_rate"));
    }

    #[tokio::test]
    async fn test_totals() {
        let app = TestApp::new().await;
        let response = app.get("/totals", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let totals: Vec<TotalCost> = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].plan_guid, DEFAULT_COMPUTE_PLAN_GUID);
        assert_eq!(totals[0].cost, dec!(0.24));
    }
}

#[cfg(test)]
mod reference_tests {
    use super::*;

    #[tokio::test]
    async fn test_reference_data_in_range() {
        let app = TestApp::new().await;
        for path in ["/pricing_plans", "/vat_rates", "/currency_rates"] {
            let response = app.get(&format!("{path}?{MARCH}"), None).await;
            assert_eq!(response.status(), StatusCode::OK, "{path}");
            let body = body_json(response).await;
            assert!(!body.as_array().unwrap().is_empty(), "{path}");
        }
    }

    #[tokio::test]
    async fn test_missing_range_is_bad_request() {
        let app = TestApp::new().await;
        let response = app.get("/pricing_plans?range_start=2021-03-01", None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("range_stop"));
    }
}

#[cfg(test)]
mod event_tests {
    use super::*;

    #[tokio::test]
    async fn test_admin_reads_billable_events() {
        let app = TestApp::new().await;
        let response = app.get(&format!("/billable_events?{MARCH}"), Some("admin-token")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let events: Vec<BillableEvent> = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(events.len(), 1);
        // 24 instance hours at 0.01
        assert_eq!(events[0].price.ex_vat, dec!(0.24));
        assert_eq!(events[0].price.inc_vat, dec!(0.288));
    }

    #[tokio::test]
    async fn test_billing_manager_reads_own_org() {
        let app = TestApp::new().await;
        let response = app
            .get(&format!("/usage_events?{MARCH}&org_guid={ORG}"), Some("manager-token"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let events: Vec<UsageEvent> = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].org_guid.to_string(), ORG);
    }

    #[tokio::test]
    async fn test_empty_result_is_empty_array() {
        let app = TestApp::new().await;
        let response = app
            .get("/usage_events?range_start=2020-01-01&range_stop=2020-02-01", Some("admin-token"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!([]));
    }

    #[tokio::test]
    async fn test_unauthorized_requests() {
        let app = TestApp::new().await;
        let cases = [
            (format!("/usage_events?{MARCH}&org_guid={ORG}"), None),
            (format!("/usage_events?{MARCH}&org_guid={ORG}"), Some("unknown-token")),
            (format!("/billable_events?{MARCH}"), Some("manager-token")),
            (format!("/billable_events?{MARCH}&org_guid={ORG}&org_guid={OTHER_ORG}"), Some("manager-token")),
        ];
        for (uri, token) in cases {
            let response = app.get(&uri, token).await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{uri}");
            assert_eq!(
                body_json(response).await,
                json!({"error": "you need to be billing_manager or an administrator to retrieve the billing data"})
            );
        }
    }

    #[tokio::test]
    async fn test_reversed_range_is_bad_request() {
        let app = TestApp::new().await;
        let response = app
            .get("/billable_events?range_start=2021-04-01&range_stop=2021-03-01", Some("admin-token"))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}

#[cfg(test)]
mod forecast_tests {
    use super::*;

    fn forecast_uri(params: &[(&str, &str)]) -> String {
        let url = reqwest::Url::parse_with_params("http://localhost/forecast_events", params).unwrap();
        format!("{}?{}", url.path(), url.query().unwrap_or_default())
    }

    fn input_events(org: &str) -> String {
        json!([{
            "event_guid": "aa30fa3c-725d-4272-9052-c7186d4968a6",
            "event_start": "2021-03-01T00:00:00+00:00",
            "event_stop": "2021-03-02T00:00:00+00:00",
            "resource_guid": "c85e98f0-6d1b-4f45-9368-ea58263165a0",
            "resource_name": "db",
            "resource_type": "postgres",
            "org_guid": org,
            "space_guid": "00000001-0001-0000-0000-000000000000",
            "plan_guid": DB_PLAN,
            "number_of_nodes": 1,
            "memory_in_mb": 2048,
            "storage_in_mb": 10240
        }])
        .to_string()
    }

    #[tokio::test]
    async fn test_forecast_prices_without_storing() {
        let app = TestApp::new().await;
        let events = input_events(DUMMY_ORG);
        let uri = forecast_uri(&[
            ("range_start", "2021-03-01"),
            ("range_stop", "2021-04-01"),
            ("org_guid", DUMMY_ORG),
            ("events", &events),
        ]);
        let response = app.get(&uri, None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let priced: Vec<BillableEvent> = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(priced.len(), 1);
        assert_eq!(priced[0].price.ex_vat, dec!(2.4));

        // the stored totals only know the real app
        let totals: Vec<TotalCost> = serde_json::from_slice(&body_bytes(app.get("/totals", None).await).await).unwrap();
        assert_eq!(totals.len(), 1);
    }

    #[tokio::test]
    async fn test_forecast_for_real_org_is_forbidden() {
        let app = TestApp::new().await;
        let events = input_events(DUMMY_ORG);
        let uri = forecast_uri(&[
            ("range_start", "2021-03-01"),
            ("range_stop", "2021-04-01"),
            ("org_guid", ORG),
            ("events", &events),
        ]);
        assert_eq!(app.get(&uri, None).await.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_forecast_requires_events() {
        let app = TestApp::new().await;
        let response = app.get(&format!("/forecast_events?{MARCH}"), None).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await, json!({"error": "events param is required"}));

        let uri = forecast_uri(&[("range_start", "2021-03-01"), ("range_stop", "2021-04-01"), ("events", "[{")]);
        assert_eq!(app.get(&uri, None).await.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_forecast_input_for_other_org_is_rejected() {
        let app = TestApp::new().await;
        let events = input_events(ORG);
        let uri = forecast_uri(&[("range_start", "2021-03-01"), ("range_stop", "2021-04-01"), ("events", &events)]);
        assert_eq!(app.get(&uri, None).await.status(), StatusCode::BAD_REQUEST);
    }
}
