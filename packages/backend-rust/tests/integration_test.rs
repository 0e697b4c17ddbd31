use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::json;
use tower::ServiceExt;

mod common;

use common::{create_test_app, json_body, request};

#[tokio::test]
async fn test_health_root() {
    let app = create_test_app().await;

    let response = app
        .router
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["store"], "memory");
    assert_eq!(body["database"], "not_configured");
}

#[tokio::test]
async fn test_health_live() {
    let app = create_test_app().await;

    let response = app
        .router
        .oneshot(Request::builder().uri("/health/live").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_route_is_json_404() {
    let app = create_test_app().await;

    let response = app
        .router
        .oneshot(request("GET", "/api/nope", Some("u1"), None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = json_body(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_missing_identity_is_unauthorized() {
    let app = create_test_app().await;

    let response = app
        .router
        .oneshot(request("GET", "/api/review/settings?languageId=en", None, None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_missing_capability_is_forbidden() {
    let app = create_test_app().await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .uri("/api/weak-words?languageId=en")
                .header("x-user-id", "u1")
                .header("x-user-permissions", "REVIEW")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["code"], "FORBIDDEN");
}

#[tokio::test]
async fn test_settings_defaults_and_update() {
    let app = create_test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(request("GET", "/api/review/settings?languageId=en", Some("u1"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["dailyNewLimit"], 10);
    assert_eq!(body["data"]["dailyReviewLimit"], 50);

    let response = app
        .router
        .clone()
        .oneshot(request(
            "PUT",
            "/api/review/settings",
            Some("u1"),
            Some(json!({ "languageId": "en", "dailyNewLimit": 5 })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["data"]["dailyNewLimit"], 5);

    let response = app
        .router
        .oneshot(request(
            "PUT",
            "/api/review/settings",
            Some("u1"),
            Some(json!({ "languageId": "en", "dailyReviewLimit": 501 })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_malformed_body_is_validation_error() {
    let app = create_test_app().await;

    let response = app
        .router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/review/sessions")
                .header("x-user-id", "u1")
                .header("x-user-permissions", common::ALL_PERMISSIONS)
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_typing_session_flow() {
    let app = create_test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/review/sessions",
            Some("u1"),
            Some(json!({ "languageId": "en", "domain": "VOCABULARY", "mode": "TYPING", "limit": 2 })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let session = json_body(response).await["data"].clone();
    let items = session["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["itemId"], "lx-apple");
    assert!(!items[0]["prompt"].to_string().contains("\"apple\""));

    let session_id = session["sessionId"].as_str().unwrap().to_string();
    let response = app
        .router
        .clone()
        .oneshot(request(
            "POST",
            &format!("/api/review/sessions/{session_id}/submit"),
            Some("u1"),
            Some(json!({
                "languageId": "en",
                "domain": "VOCABULARY",
                "mode": "TYPING",
                "answers": [{ "itemId": "lx-apple", "answer": { "kind": "TEXT", "text": "apple" } }]
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let results = json_body(response).await["data"].clone();
    assert_eq!(results[0]["isCorrect"], true);
    assert_eq!(results[0]["state"]["repetition"], 1);
    assert_eq!(results[0]["state"]["intervalDays"], 1);

    let response = app
        .router
        .oneshot(request("GET", "/api/review/stats?languageId=en", Some("u1"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let stats = json_body(response).await["data"].clone();
    assert_eq!(stats["scheduledTotal"], 1);
    assert_eq!(stats["reviewed7d"], 1);
}

#[tokio::test]
async fn test_submit_unknown_item_is_rejected() {
    let app = create_test_app().await;

    let response = app
        .router
        .oneshot(request(
            "POST",
            "/api/review/sessions/s-1/submit",
            Some("u1"),
            Some(json!({
                "languageId": "en",
                "domain": "VOCABULARY",
                "answers": [{ "itemId": "lx-missing", "answer": { "kind": "SELF_REPORT", "know": true } }]
            })),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "UNKNOWN_ITEM");
    assert!(app.memory.review_attempts("u1").is_empty());
}

#[tokio::test]
async fn test_invalid_rating_rejects_whole_batch() {
    let app = create_test_app().await;

    let response = app
        .router
        .oneshot(request(
            "POST",
            "/api/review/ratings",
            Some("u1"),
            Some(json!({
                "languageId": "en",
                "domain": "VOCABULARY",
                "ratings": [
                    { "itemId": "lx-apple", "rating": 4 },
                    { "itemId": "lx-river", "rating": 6 }
                ]
            })),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "INVALID_RATING");
    assert!(app.memory.review_attempts("u1").is_empty());
}

#[tokio::test]
async fn test_explicit_rating_returns_state() {
    let app = create_test_app().await;

    let response = app
        .router
        .oneshot(request(
            "POST",
            "/api/review/ratings",
            Some("u1"),
            Some(json!({
                "languageId": "en",
                "ratings": [{ "itemId": "lx-river", "rating": 5 }]
            })),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let rated = json_body(response).await["data"].clone();
    assert_eq!(rated[0]["rating"], 5);
    assert_eq!(rated[0]["state"]["repetition"], 1);
    assert!(rated[0]["state"]["nextReviewAt"].is_string());
}

#[tokio::test]
async fn test_speaking_attempt_submit_is_accepted() {
    let app = create_test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/speaking/attempts",
            Some("u1"),
            Some(json!({ "languageId": "en", "taskId": "task-read" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let attempt = json_body(response).await["data"].clone();
    assert_eq!(attempt["status"], "STARTED");
    let attempt_id = attempt["id"].as_str().unwrap().to_string();

    let submit = json!({
        "items": [{ "itemId": "task-read-1", "audioBase64": "UklGRiQAAABXQVZF", "mimeType": "audio/wav" }]
    });
    let response = app
        .router
        .clone()
        .oneshot(request(
            "POST",
            &format!("/api/speaking/attempts/{attempt_id}/submit"),
            Some("u1"),
            Some(submit.clone()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    assert_eq!(body["data"]["status"], "PENDING_AI");
    assert_eq!(body["data"]["items"][0]["hasAudio"], true);
    assert!(!body.to_string().contains("UklGRiQAAABXQVZF"));
    assert_eq!(app.queue.ready_len(), 1);

    let response = app
        .router
        .clone()
        .oneshot(request(
            "POST",
            &format!("/api/speaking/attempts/{attempt_id}/submit"),
            Some("u1"),
            Some(submit),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "ATTEMPT_NOT_ACTIVE");

    let response = app
        .router
        .oneshot(request(
            "GET",
            &format!("/api/speaking/attempts/{attempt_id}"),
            Some("u2"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_speaking_submit_without_audio() {
    let app = create_test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/speaking/attempts",
            Some("u1"),
            Some(json!({ "languageId": "en", "taskId": "task-read" })),
        ))
        .await
        .unwrap();
    let attempt_id = json_body(response).await["data"]["id"].as_str().unwrap().to_string();

    let response = app
        .router
        .oneshot(request(
            "POST",
            &format!("/api/speaking/attempts/{attempt_id}/submit"),
            Some("u1"),
            Some(json!({ "items": [{ "itemId": "task-read-1" }] })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["code"], "MISSING_AUDIO");
    assert_eq!(app.queue.ready_len(), 0);
}

#[tokio::test]
async fn test_unknown_task_is_not_found() {
    let app = create_test_app().await;

    let response = app
        .router
        .oneshot(request(
            "POST",
            "/api/speaking/attempts",
            Some("u1"),
            Some(json!({ "languageId": "en", "taskId": "missing" })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["code"], "TASK_NOT_FOUND");
}

#[tokio::test]
async fn test_weak_word_ingest_and_list() {
    let app = create_test_app().await;

    let response = app
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/weak-words/ingest",
            Some("u1"),
            Some(json!({
                "languageId": "en",
                "source": "SPEAKING",
                "words": [
                    { "word": "Receive,", "severity": "BAD" },
                    { "word": "river", "severity": "GOOD" },
                    { "word": "zebra", "severity": "BAD" }
                ]
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let summary = json_body(response).await["data"].clone();
    assert_eq!(summary["matched"], 1);
    assert_eq!(summary["skipped"], 1);
    assert_eq!(summary["ignored"], 1);

    let response = app
        .router
        .clone()
        .oneshot(request("GET", "/api/weak-words?languageId=en&limit=10", Some("u1"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let words = json_body(response).await["data"].clone();
    assert_eq!(words.as_array().unwrap().len(), 1);
    assert_eq!(words[0]["lemma"], "receive");

    let response = app
        .router
        .oneshot(request("GET", "/api/weak-words?languageId=en&limit=0", Some("u1"), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
