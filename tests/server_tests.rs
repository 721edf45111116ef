mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use common::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use dte_transmitter::infra::StaticCredentials;
use dte_transmitter::server::{create_server, ApiContext};

fn app(h: &Harness) -> Router {
    let credentials = StaticCredentials::new(HashMap::from([(
        ISSUER_NIT.to_string(),
        "s3cret".to_string(),
    )]));
    create_server(ApiContext {
        engine: h.engine.clone(),
        credentials: Arc::new(credentials),
    })
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let body = match body {
        Some(json) => Body::from(json.to_string()),
        None => Body::empty(),
    };
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body)
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn create(app: &Router) -> String {
    let (status, doc) = send(
        app,
        Method::POST,
        "/documents",
        Some(json!({
            "document_type": "01",
            "environment": "TEST",
            "content": invoice_content(),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(doc["status"], "CREATED");
    doc["id"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn health_reports_the_service() {
    let h = harness();
    let (status, body) = send(&app(&h), Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn create_then_transmit_synchronously() {
    let h = harness();
    let app = app(&h);
    let id = create(&app).await;

    let (status, result) = send(
        &app,
        Method::POST,
        &format!("/documents/{}/transmit", id),
        Some(json!({"identity": ISSUER_NIT, "secret": "s3cret", "mode": "sync"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["success"], true);
    assert_eq!(result["status"], "PROCESSED");
    assert_eq!(result["receipt_stamp"], "S1");

    let (status, doc) = send(&app, Method::GET, &format!("/documents/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["receipt_stamp"], "S1");

    let (status, events) = send(&app, Method::GET, &format!("/documents/{}/events", id), None).await;
    assert_eq!(status, StatusCode::OK);
    let actions: Vec<&str> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["action"].as_str().unwrap())
        .collect();
    assert_eq!(actions, vec!["SIGN", "TRANSMIT", "RESPONSE"]);
}

#[tokio::test]
async fn async_transmission_is_accepted_with_a_job() {
    let h = harness();
    let app = app(&h);
    let id = create(&app).await;

    // The secret comes from the server's configured credentials.
    let (status, submission) = send(
        &app,
        Method::POST,
        &format!("/documents/{}/transmit", id),
        Some(json!({"identity": ISSUER_NIT, "mode": "async"})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(submission["mode"], "queued");
    assert_eq!(submission["existing"], false);
    let job_id = submission["job_id"].as_str().unwrap().to_string();

    let (status, job) = send(&app, Method::GET, &format!("/jobs/{}", job_id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["attempts"], 0);
    assert_eq!(job["document_id"], id.as_str());
    assert_eq!(h.authority.submits(), 0);
}

#[tokio::test]
async fn annulling_a_created_document_conflicts() {
    let h = harness();
    let app = app(&h);
    let id = create(&app).await;

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/documents/{}/annul", id),
        Some(json!({"identity": ISSUER_NIT, "secret": "s3cret", "reason": "wrong customer"})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "INVALID_STATE_TRANSITION");
    assert_eq!(h.authority.cancels(), 0);
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let h = harness();
    let app = app(&h);
    let missing = Uuid::new_v4();

    let (status, body) = send(&app, Method::GET, &format!("/documents/{}", missing), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");

    let (status, _) = send(
        &app,
        Method::POST,
        &format!("/documents/{}/transmit", missing),
        Some(json!({"identity": ISSUER_NIT, "secret": "s3cret"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, Method::GET, &format!("/jobs/{}", missing), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_identity_without_secret_is_unauthorized() {
    let h = harness();
    let app = app(&h);
    let id = create(&app).await;

    let (status, body) = send(
        &app,
        Method::POST,
        &format!("/documents/{}/transmit", id),
        Some(json!({"identity": "99999999999999"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "MISSING_CREDENTIALS");
}

#[tokio::test]
async fn rejected_document_is_reopened_and_deleted() {
    let h = harness();
    h.authority
        .script([Decision::Reject(vec!["NIT invalido".to_string()])]);
    let app = app(&h);
    let id = create(&app).await;

    let (status, result) = send(
        &app,
        Method::POST,
        &format!("/documents/{}/transmit", id),
        Some(json!({"identity": ISSUER_NIT, "secret": "s3cret"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["status"], "REJECTED");

    let (status, doc) = send(
        &app,
        Method::POST,
        &format!("/documents/{}/reopen", id),
        Some(json!({"note": "receiver corrected"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["status"], "PENDING_RETRY");

    let (status, _) = send(&app, Method::DELETE, &format!("/documents/{}", id), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&app, Method::GET, &format!("/documents/{}", id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn authority_status_is_queried_for_the_requested_environment() {
    let h = harness();
    h.authority
        .answer_query(dte_transmitter::app::ports::AuthorityState::Processed, Some("S9"));
    let app = app(&h);

    let (status, body) = send(
        &app,
        Method::POST,
        "/authority/status",
        Some(json!({
            "identity": ISSUER_NIT,
            "secret": "s3cret",
            "generation_code": "G-1",
            "environment": "TEST",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["receipt_stamp"], "S9");
    assert_eq!(h.authority.queries(), 1);
}
