//! REST surface for calls, driven through the actix test harness

use actix_web::{http::StatusCode, test, web, App};
use realtime_chat_service::config::Config;
use realtime_chat_service::middleware::Claims;
use realtime_chat_service::routes;
use realtime_chat_service::services::{InMemoryChatStore, TokenRoomProvider};
use realtime_chat_service::state::AppState;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

async fn test_state() -> (AppState, Arc<TokenRoomProvider>) {
    let config = Config::test_defaults();
    let provider = Arc::new(TokenRoomProvider::new(config.provider.clone()));
    let state = AppState::with_collaborators(
        config,
        Arc::new(InMemoryChatStore::new()),
        provider.clone(),
    )
    .await;
    (state, provider)
}

fn bearer(state: &AppState, user: Uuid, device: &str) -> (&'static str, String) {
    let now = chrono::Utc::now().timestamp();
    let token = state
        .jwt
        .sign(&Claims {
            sub: user.to_string(),
            exp: (now + 3600) as usize,
            iat: Some(now as usize),
            device_id: Some(device.to_string()),
        })
        .unwrap();
    ("Authorization", format!("Bearer {token}"))
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state.clone()))
                .configure(routes::configure),
        )
        .await
    };
}

#[actix_web::test]
async fn health_is_public() {
    let (state, _) = test_state().await;
    let app = app!(state);
    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn missing_token_is_rejected_with_envelope() {
    let (state, _) = test_state().await;
    let app = app!(state);
    let req = test::TestRequest::post()
        .uri("/api/v1/calls")
        .set_json(json!({ "participant_ids": [Uuid::new_v4()] }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "unauthorized");
}

#[actix_web::test]
async fn start_join_and_end_call() {
    let (state, _) = test_state().await;
    let app = app!(state);
    let (u1, u2) = (Uuid::new_v4(), Uuid::new_v4());

    let req = test::TestRequest::post()
        .uri("/api/v1/calls")
        .insert_header(bearer(&state, u1, "phone"))
        .set_json(json!({ "participant_ids": [u2], "call_type": "audio" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["data"]["call"]["state"], "ringing");
    let call_id = body["data"]["call"]["call_id"].as_str().unwrap().to_string();
    assert!(body["data"]["token"]["room_id"]
        .as_str()
        .unwrap()
        .starts_with("call-"));

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/calls/{call_id}/join"))
        .insert_header(bearer(&state, u2, "laptop"))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["data"]["call"]["state"], "connecting");

    let req = test::TestRequest::get()
        .uri("/api/v1/calls/active")
        .insert_header(bearer(&state, u2, "laptop"))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    for _ in 0..2 {
        let req = test::TestRequest::post()
            .uri(&format!("/api/v1/calls/{call_id}/end"))
            .insert_header(bearer(&state, u1, "phone"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["data"]["state"], "ended");
        assert_eq!(body["data"]["end_reason"], "hangup");
    }

    let req = test::TestRequest::get()
        .uri("/api/v1/calls/history?limit=5")
        .insert_header(bearer(&state, u2, "laptop"))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[actix_web::test]
async fn uninvited_join_and_oversized_roster_are_rejected() {
    let (state, _) = test_state().await;
    let app = app!(state);
    let u1 = Uuid::new_v4();

    let crowd: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();
    let req = test::TestRequest::post()
        .uri("/api/v1/calls")
        .insert_header(bearer(&state, u1, "phone"))
        .set_json(json!({ "participant_ids": crowd }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "too_many_participants");

    let req = test::TestRequest::post()
        .uri("/api/v1/calls")
        .insert_header(bearer(&state, u1, "phone"))
        .set_json(json!({ "participant_ids": [Uuid::new_v4()] }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    let call_id = body["data"]["call"]["call_id"].as_str().unwrap().to_string();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/calls/{call_id}/join"))
        .insert_header(bearer(&state, Uuid::new_v4(), "phone"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], "not_invited");
}

#[actix_web::test]
async fn provider_outage_is_retryable() {
    let (state, provider) = test_state().await;
    let app = app!(state);
    provider.set_available(false);

    let req = test::TestRequest::post()
        .uri("/api/v1/calls")
        .insert_header(bearer(&state, Uuid::new_v4(), "phone"))
        .set_json(json!({ "participant_ids": [Uuid::new_v4()] }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["retryable"], true);
}

#[actix_web::test]
async fn metrics_are_exposed() {
    let (state, _) = test_state().await;
    let app = app!(state);
    let req = test::TestRequest::get().uri("/metrics").to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::OK);
}
