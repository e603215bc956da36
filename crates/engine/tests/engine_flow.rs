//! End-to-end dispatcher tests against a mocked CRM.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use clinicsync_core::config::{CrmApiConfig, SyncConfig};
use clinicsync_core::domain::event::WebhookEnvelope;
use clinicsync_core::{EntityKind, EntityMapping, EventLink, ExternalService, MappingTable};
use clinicsync_db::repositories::{
    InMemoryLinkRepository, InMemorySyncLogRepository, LinkRepository, SyncLogRepository,
};
use clinicsync_engine::{CircuitBreaker, CrmClient, SyncService};

struct Harness {
    server: MockServer,
    service: SyncService,
    links: Arc<InMemoryLinkRepository>,
    sync_log: Arc<InMemorySyncLogRepository>,
}

async fn harness() -> Harness {
    let server = MockServer::start().await;

    let crm_config = CrmApiConfig {
        base_url: server.uri(),
        api_token: "test-token".to_string().into(),
        location_id: "loc-1".to_string(),
        api_version: "2021-07-28".to_string(),
        timeout_secs: 5,
    };
    let sync_config = SyncConfig {
        max_retries: 0,
        base_delay_ms: 1,
        max_delay_ms: 5,
        backoff_base: 2,
        breaker_threshold: 100,
        breaker_cooldown_secs: 60,
        batch_chunk_size: 2000,
    };
    let breaker =
        Arc::new(CircuitBreaker::new(ExternalService::Crm, 100, Duration::from_secs(60)));
    let crm = CrmClient::new(reqwest::Client::new(), &crm_config, &sync_config, breaker);

    let mappings = Arc::new(RwLock::new(MappingTable::from_mappings(&[
        EntityMapping::new(EntityKind::Service, "S1").with_calendar("C1"),
        EntityMapping::new(EntityKind::Doctor, "D1").with_assigned_user("U1"),
    ])));
    let links = Arc::new(InMemoryLinkRepository::default());
    let sync_log = Arc::new(InMemorySyncLogRepository::default());

    let service = SyncService::new(
        crm,
        mappings,
        links.clone() as Arc<dyn LinkRepository>,
        sync_log.clone() as Arc<dyn SyncLogRepository>,
    );

    Harness { server, service, links, sync_log }
}

fn booking_envelope(event_type: &str) -> WebhookEnvelope {
    WebhookEnvelope {
        event_type: event_type.to_owned(),
        timestamp: Some("2025-12-01T09:00:00Z".to_owned()),
        data: json!({
            "booking_id": "B1",
            "start": "2025-12-03 14:00",
            "service": { "id": "S1", "name": "Checkup" },
            "site": { "id": "X1" },
            "doctor": { "id": "D1" },
            "patient": { "first_name": "Ada", "last_name": "Rossi", "email": "a@b.com" }
        }),
    }
}

async fn mock_contact_search_miss(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/contacts/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "contacts": [] })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

async fn mock_contact_create(server: &MockServer, contact_id: &str, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/contacts/"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "contact": { "id": contact_id } })),
        )
        .expect(expected_calls)
        .mount(server)
        .await;
}

#[tokio::test]
async fn booking_created_end_to_end() {
    let harness = harness().await;

    mock_contact_search_miss(&harness.server, 1).await;
    mock_contact_create(&harness.server, "K-1", 1).await;
    Mock::given(method("POST"))
        .and(path("/calendars/events/appointments"))
        .and(body_partial_json(json!({
            "calendarId": "C1",
            "assignedUserId": "U1",
            "contactId": "K-1",
            "startTime": "2025-12-03T14:00:00.000Z",
            "endTime": "2025-12-03T14:30:00.000Z",
            "title": "Checkup"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "EVT-1" })))
        .expect(1)
        .mount(&harness.server)
        .await;

    let result = harness.service.handle(&booking_envelope("booking.created")).await;

    assert!(result.success, "expected success, got {:?}", result.error);
    assert_eq!(result.event_id.as_deref(), Some("EVT-1"));
    assert_eq!(result.contact_id.as_deref(), Some("K-1"));
    assert_eq!(result.contact_created, Some(true));
    assert_eq!(result.event_created, Some(true));

    let link = harness.links.find_by_booking("B1").await.expect("repo ok").expect("link saved");
    assert_eq!(link.event_id, "EVT-1");
    assert_eq!(link.calendar_id.as_deref(), Some("C1"));

    let log = harness.sync_log.recent(10).await.expect("log ok");
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].event_type, "booking.created");
    assert_eq!(log[0].entity_id, "B1");
}

#[tokio::test]
async fn duplicate_booking_created_produces_exactly_one_event() {
    let harness = harness().await;

    mock_contact_search_miss(&harness.server, 1).await;
    mock_contact_create(&harness.server, "K-1", 1).await;
    Mock::given(method("POST"))
        .and(path("/calendars/events/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "EVT-1" })))
        .expect(1)
        .mount(&harness.server)
        .await;

    let first = harness.service.handle(&booking_envelope("booking.created")).await;
    let second = harness.service.handle(&booking_envelope("booking.created")).await;

    assert!(first.success);
    assert_eq!(first.event_created, Some(true));

    assert!(second.success);
    assert_eq!(second.event_created, Some(false));
    assert_eq!(second.event_id.as_deref(), Some("EVT-1"));
}

#[tokio::test]
async fn booking_updated_without_link_falls_back_to_create() {
    let harness = harness().await;

    mock_contact_search_miss(&harness.server, 1).await;
    mock_contact_create(&harness.server, "K-1", 1).await;
    Mock::given(method("POST"))
        .and(path("/calendars/events/appointments"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "EVT-2" })))
        .expect(1)
        .mount(&harness.server)
        .await;

    let result = harness.service.handle(&booking_envelope("booking.updated")).await;

    assert!(result.success, "expected success, got {:?}", result.error);
    assert_eq!(result.event_type, "booking.updated");
    assert_eq!(result.event_created, Some(true));
    assert!(harness.links.find_by_booking("B1").await.expect("repo ok").is_some());
}

#[tokio::test]
async fn booking_updated_with_link_updates_the_existing_event() {
    let harness = harness().await;
    harness
        .links
        .save(EventLink::new("B1", "EVT-9", Some("C1".to_owned())))
        .await
        .expect("seed link");

    Mock::given(method("POST"))
        .and(path("/contacts/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "contacts": [{ "id": "K-7", "email": "a@b.com" }]
        })))
        .expect(1)
        .mount(&harness.server)
        .await;
    mock_contact_create(&harness.server, "never", 0).await;
    Mock::given(method("PUT"))
        .and(path("/calendars/events/EVT-9"))
        .and(body_partial_json(json!({ "startTime": "2025-12-03T14:00:00.000Z" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&harness.server)
        .await;

    let result = harness.service.handle(&booking_envelope("booking.updated")).await;

    assert!(result.success, "expected success, got {:?}", result.error);
    assert_eq!(result.event_updated, Some(true));
    assert_eq!(result.event_id.as_deref(), Some("EVT-9"));
    assert_eq!(result.contact_created, Some(false));
}

#[tokio::test]
async fn booking_cancelled_without_link_is_a_successful_no_op() {
    let harness = harness().await;

    let envelope = WebhookEnvelope {
        event_type: "booking.cancelled".to_owned(),
        timestamp: None,
        data: json!({ "booking_id": "B-unknown" }),
    };
    let result = harness.service.handle(&envelope).await;

    assert!(result.success);
    assert_eq!(result.event_deleted, Some(false));
    assert!(result.error.is_none());
}

#[tokio::test]
async fn booking_cancelled_with_link_deletes_event_and_link() {
    let harness = harness().await;
    harness.links.save(EventLink::new("B1", "EVT-9", None)).await.expect("seed link");

    Mock::given(method("DELETE"))
        .and(path("/calendars/events/EVT-9"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&harness.server)
        .await;

    let envelope = WebhookEnvelope {
        event_type: "booking.cancelled".to_owned(),
        timestamp: None,
        data: json!({ "booking_id": "B1" }),
    };
    let result = harness.service.handle(&envelope).await;

    assert!(result.success, "expected success, got {:?}", result.error);
    assert_eq!(result.event_deleted, Some(true));
    assert!(harness.links.find_by_booking("B1").await.expect("repo ok").is_none());
}

#[tokio::test]
async fn unmapped_service_is_a_terminal_failure() {
    let harness = harness().await;
    mock_contact_create(&harness.server, "never", 0).await;

    let envelope = WebhookEnvelope {
        event_type: "booking.created".to_owned(),
        timestamp: None,
        data: json!({
            "booking_id": "B2",
            "start": "2025-12-03 14:00",
            "service": { "id": "S-unmapped", "name": "Dental" },
            "site": { "id": "X-unmapped" },
            "doctor": { "id": "D1" },
            "patient": { "first_name": "Ada", "email": "a@b.com" }
        }),
    };
    let result = harness.service.handle(&envelope).await;

    assert!(!result.success);
    assert!(
        result.error.as_deref().is_some_and(|error| error.contains("S-unmapped")),
        "error should name the unmapped entity: {:?}",
        result.error
    );
}

#[tokio::test]
async fn unrecognized_event_type_fails_and_names_the_value() {
    let harness = harness().await;

    let envelope = WebhookEnvelope {
        event_type: "booking.rescheduled".to_owned(),
        timestamp: None,
        data: json!({}),
    };
    let result = harness.service.handle(&envelope).await;

    assert!(!result.success);
    assert!(result.error.as_deref().is_some_and(|error| error.contains("booking.rescheduled")));

    let log = harness.sync_log.recent(10).await.expect("log ok");
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].status.as_str(), "error");
}

#[tokio::test]
async fn email_match_short_circuits_before_phone_and_create() {
    let harness = harness().await;

    Mock::given(method("POST"))
        .and(path("/contacts/search"))
        .and(body_partial_json(json!({ "filters": [{ "field": "email" }] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "contacts": [{ "id": "K-11", "email": "a@b.com" }]
        })))
        .expect(1)
        .mount(&harness.server)
        .await;
    mock_contact_create(&harness.server, "never", 0).await;

    let envelope = WebhookEnvelope {
        event_type: "contact.created".to_owned(),
        timestamp: None,
        data: json!({ "first_name": "Ada", "email": "a@b.com", "phone": "+390001" }),
    };
    let result = harness.service.handle(&envelope).await;

    assert!(result.success);
    assert_eq!(result.contact_id.as_deref(), Some("K-11"));
    assert_eq!(result.contact_created, Some(false));
}

#[tokio::test]
async fn failed_fiscal_code_search_degrades_to_create() {
    let harness = harness().await;

    Mock::given(method("POST"))
        .and(path("/contacts/search"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "message": "unknown filter field"
        })))
        .expect(1)
        .mount(&harness.server)
        .await;
    mock_contact_create(&harness.server, "K-12", 1).await;

    let envelope = WebhookEnvelope {
        event_type: "contact.created".to_owned(),
        timestamp: None,
        data: json!({ "first_name": "Ada", "fiscal_code": "RSSDAA80A41H501X" }),
    };
    let result = harness.service.handle(&envelope).await;

    assert!(result.success, "expected success, got {:?}", result.error);
    assert_eq!(result.contact_created, Some(true));
}

#[tokio::test]
async fn contact_updated_applies_replacement_channels_to_found_contact() {
    let harness = harness().await;

    Mock::given(method("POST"))
        .and(path("/contacts/search"))
        .and(body_partial_json(json!({ "filters": [{ "field": "email", "value": "a@b.com" }] })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "contacts": [{ "id": "K-20", "email": "a@b.com" }]
        })))
        .expect(1)
        .mount(&harness.server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/contacts/K-20"))
        .and(body_partial_json(json!({ "email": "a-new@b.com" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&harness.server)
        .await;

    let envelope = WebhookEnvelope {
        event_type: "contact.updated".to_owned(),
        timestamp: None,
        data: json!({
            "first_name": "Ada",
            "email": "a@b.com",
            "new_email": "a-new@b.com"
        }),
    };
    let result = harness.service.handle(&envelope).await;

    assert!(result.success, "expected success, got {:?}", result.error);
    assert_eq!(result.contact_updated, Some(true));
    assert_eq!(result.contact_id.as_deref(), Some("K-20"));
}

#[tokio::test]
async fn contact_updated_without_match_creates_with_replacement_channels() {
    let harness = harness().await;

    mock_contact_search_miss(&harness.server, 2).await;
    Mock::given(method("POST"))
        .and(path("/contacts/"))
        .and(body_partial_json(json!({ "email": "a-new@b.com" })))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "contact": { "id": "K-21" } })),
        )
        .expect(1)
        .mount(&harness.server)
        .await;

    let envelope = WebhookEnvelope {
        event_type: "contact.updated".to_owned(),
        timestamp: None,
        data: json!({
            "first_name": "Ada",
            "email": "a@b.com",
            "new_email": "a-new@b.com"
        }),
    };
    let result = harness.service.handle(&envelope).await;

    assert!(result.success, "expected success, got {:?}", result.error);
    assert_eq!(result.contact_created, Some(true));
}
