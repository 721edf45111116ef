use axum::{
    extract::Path,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Form, Json, Router,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener};

use dte_transmitter::app::ports::{
    AuthToken, AuthorityApi, AuthorityCredentials, AuthorityState, CancelRequest, Signer, SubmitRequest,
};
use dte_transmitter::config::{AuthorityConfig, SignerConfig};
use dte_transmitter::domain::Environment;
use dte_transmitter::error::EngineError;
use dte_transmitter::infra::{MhClient, SigningServiceClient};

const TOKEN: &str = "Bearer tok-1";

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map_or(false, |v| v == TOKEN)
}

async fn auth(Form(form): Form<HashMap<String, String>>) -> impl IntoResponse {
    if form.get("user").map(String::as_str) == Some("06140101001010")
        && form.get("pwd").map(String::as_str) == Some("s3cret")
    {
        (StatusCode::OK, Json(json!({"status": "OK", "body": {"token": TOKEN}})))
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"status": "ERROR", "body": {"descripcionMsg": "credenciales invalidas"}})),
        )
    }
}

async fn reception(headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({})));
    }
    match body["codigoGeneracion"].as_str().unwrap_or_default() {
        "REJECT" => (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "estado": "RECHAZADO",
                "descripcionMsg": "[identificacion.nit] invalido",
                "observaciones": ["NIT invalido"]
            })),
        ),
        "DOWN" => (StatusCode::SERVICE_UNAVAILABLE, Json(json!({"error": "mantenimiento"}))),
        _ => (
            StatusCode::OK,
            Json(json!({
                "estado": "PROCESADO",
                "selloRecibido": "S1",
                "fhProcesamiento": "18/10/2026 10:15:30",
                "observaciones": ["campo opcional omitido"],
                "tipoDte": body["tipoDte"],
                "ambiente": body["ambiente"]
            })),
        ),
    }
}

async fn query(headers: HeaderMap, Path(code): Path<String>) -> impl IntoResponse {
    if !authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, Json(json!({})));
    }
    if code == "MISSING" {
        return (StatusCode::NOT_FOUND, Json(json!({})));
    }
    (
        StatusCode::OK,
        Json(json!({"estado": "PROCESADO", "selloRecibido": "S-OLD", "codigoGeneracion": code})),
    )
}

async fn annul(headers: HeaderMap, Json(body): Json<Value>) -> impl IntoResponse {
    if !authorized(&headers) || body["documento"].as_str().is_none() {
        return (StatusCode::BAD_REQUEST, Json(json!({"estado": "RECHAZADO"})));
    }
    (
        StatusCode::OK,
        Json(json!({"estado": "PROCESADO", "selloRecibido": "A1"})),
    )
}

async fn sign(Json(body): Json<Value>) -> impl IntoResponse {
    if body["passwordPri"] != "pk" {
        return Json(json!({"status": "ERROR", "body": {"codigo": "809", "mensaje": "clave invalida"}}));
    }
    Json(json!({"status": "OK", "body": "eyJhbGciOiJSUzUxMiJ9.payload.sig"}))
}

fn spawn_mock() -> SocketAddr {
    let app = Router::new()
        .route("/seguridad/auth", post(auth))
        .route("/fesv/recepciondte", post(reception))
        .route("/fesv/recepcion/consultadte/:code", get(query))
        .route("/fesv/anulardte", post(annul))
        .route("/firmardocumento/", post(sign));
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::Server::from_tcp(listener)
            .unwrap()
            .serve(app.into_make_service())
            .await
            .unwrap();
    });
    addr
}

fn client(addr: SocketAddr) -> MhClient {
    MhClient::new(AuthorityConfig {
        test_base_url: format!("http://{}", addr),
        request_timeout_secs: 5,
        ..AuthorityConfig::default()
    })
    .unwrap()
}

fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

fn creds(secret: &str) -> AuthorityCredentials {
    AuthorityCredentials::new("06140101001010", secret, Environment::Test)
}

fn token() -> AuthToken {
    AuthToken::new(TOKEN, Environment::Test)
}

fn submit_request(code: &str) -> SubmitRequest {
    SubmitRequest {
        ambiente: "00".to_string(),
        id_envio: 1,
        version: 1,
        tipo_dte: "01".to_string(),
        documento: "eyJ.a.b".to_string(),
        codigo_generacion: code.to_string(),
    }
}

#[tokio::test]
async fn token_is_obtained_with_form_credentials() {
    let mh = client(spawn_mock());
    let token = mh.get_token(&creds("s3cret")).await.unwrap();
    assert_eq!(token.value, TOKEN);
    assert_eq!(token.environment, Environment::Test);

    let err = mh.get_token(&creds("wrong")).await.unwrap_err();
    assert!(matches!(err, EngineError::TokenUnavailable(_)));
}

#[tokio::test]
async fn accepted_submission_returns_receipt() {
    let mh = client(spawn_mock());
    let receipt = mh.submit(&token(), &submit_request("G1")).await.unwrap();
    assert_eq!(receipt.receipt_stamp, "S1");
    assert_eq!(receipt.processed_at.as_deref(), Some("18/10/2026 10:15:30"));
    assert_eq!(receipt.observations, vec!["campo opcional omitido".to_string()]);
}

#[tokio::test]
async fn business_rejection_is_not_retryable() {
    let mh = client(spawn_mock());
    let err = mh.submit(&token(), &submit_request("REJECT")).await.unwrap_err();
    match &err {
        EngineError::AuthorityRejected { observations } => {
            assert!(observations.contains(&"NIT invalido".to_string()));
        }
        other => panic!("expected rejection, got {}", other),
    }
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn unavailable_authority_is_retryable() {
    let mh = client(spawn_mock());
    let err = mh.submit(&token(), &submit_request("DOWN")).await.unwrap_err();
    assert!(matches!(err, EngineError::AuthorityUnavailable(_)));
    assert!(err.is_retryable());

    let stale = AuthToken::new("Bearer stale", Environment::Test);
    let err = mh.submit(&stale, &submit_request("G1")).await.unwrap_err();
    assert!(matches!(err, EngineError::TokenUnavailable(_)));
}

#[tokio::test]
async fn unreachable_authority_is_retryable() {
    let err = client(unused_addr())
        .submit(&token(), &submit_request("G1"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AuthorityUnavailable(_)));
}

#[tokio::test]
async fn query_distinguishes_known_and_unknown_codes() {
    let mh = client(spawn_mock());
    let known = mh.query(&token(), "G1").await.unwrap();
    assert_eq!(known.state, AuthorityState::Processed);
    assert_eq!(known.receipt_stamp.as_deref(), Some("S-OLD"));

    let missing = mh.query(&token(), "MISSING").await.unwrap();
    assert_eq!(missing.state, AuthorityState::NotFound);
    assert!(missing.receipt_stamp.is_none());
}

#[tokio::test]
async fn annulment_returns_its_own_stamp() {
    let mh = client(spawn_mock());
    let receipt = mh
        .cancel(
            &token(),
            &CancelRequest {
                ambiente: "00".to_string(),
                id_envio: 2,
                version: 2,
                documento: "eyJ.anul.sig".to_string(),
            },
        )
        .await
        .unwrap();
    assert_eq!(receipt.receipt_stamp, "A1");
}

#[tokio::test]
async fn production_calls_go_to_the_production_host() {
    let mh = MhClient::new(AuthorityConfig {
        test_base_url: format!("http://{}", unused_addr()),
        production_base_url: format!("http://{}", spawn_mock()),
        request_timeout_secs: 5,
        ..AuthorityConfig::default()
    })
    .unwrap();

    let production = AuthorityCredentials::new("06140101001010", "s3cret", Environment::Production);
    let issued = mh.get_token(&production).await.unwrap();
    assert_eq!(issued.environment, Environment::Production);
    let receipt = mh.submit(&issued, &submit_request("G1")).await.unwrap();
    assert_eq!(receipt.receipt_stamp, "S1");

    // The test host is down, so test-environment calls fail.
    let err = mh.get_token(&creds("s3cret")).await.unwrap_err();
    assert!(matches!(err, EngineError::TokenUnavailable(_)));
    let err = mh.submit(&token(), &submit_request("G1")).await.unwrap_err();
    assert!(matches!(err, EngineError::AuthorityUnavailable(_)));
}

#[tokio::test]
async fn signing_service_round_trip() {
    let addr = spawn_mock();
    let signer = |password: &str| {
        SigningServiceClient::new(SignerConfig {
            url: format!("http://{}/firmardocumento/", addr),
            nit: Some("06140101001010".to_string()),
            private_key_password: Some(password.to_string()),
            request_timeout_secs: 5,
        })
        .unwrap()
    };

    let envelope = signer("pk").sign(&json!({"identificacion": {}})).await.unwrap();
    assert_eq!(envelope, "eyJhbGciOiJSUzUxMiJ9.payload.sig");

    let err = signer("bad").sign(&json!({})).await.unwrap_err();
    match err {
        EngineError::SigningFailed(msg) => assert_eq!(msg, "clave invalida"),
        other => panic!("expected signing failure, got {}", other),
    }
}
