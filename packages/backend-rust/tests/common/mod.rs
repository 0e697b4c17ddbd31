#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;

use lingo_review_backend::config::Config;
use lingo_review_backend::core::job_queue::MemoryJobQueue;
use lingo_review_backend::core::JobQueue;
use lingo_review_backend::create_app_with;
use lingo_review_backend::state::AppState;
use lingo_review_backend::store::{
    Domain, ItemContent, LexemeContent, MemoryStore, ReviewStore, ReviewableItem, SpeakingTask,
    SpeakingTaskItem, SpeakingTaskType,
};

pub const ALL_PERMISSIONS: &str = "REVIEW,SPEAKING_ATTEMPT,WEAK_WORDS";

pub struct TestApp {
    pub router: Router,
    pub memory: Arc<MemoryStore>,
    pub queue: Arc<MemoryJobQueue>,
}

pub fn lexeme(id: &str, lemma: &str, difficulty: i32) -> ReviewableItem {
    ReviewableItem {
        id: id.to_string(),
        domain: Domain::Vocabulary,
        language_id: "en".to_string(),
        natural_key: lemma.to_string(),
        difficulty,
        active: true,
        content: ItemContent::Lexeme(LexemeContent {
            lemma: lemma.to_string(),
            definition: Some(format!("meaning of {lemma}")),
            translations: vec![],
            part_of_speech: Some("noun".to_string()),
            examples: vec![],
            audio_url: None,
            phonetic: None,
        }),
    }
}

pub fn speaking_task(id: &str, task_type: SpeakingTaskType, reference: Option<&str>) -> SpeakingTask {
    SpeakingTask {
        id: id.to_string(),
        language_id: "en".to_string(),
        task_type,
        title: format!("task {id}"),
        active: true,
        items: vec![SpeakingTaskItem {
            id: format!("{id}-1"),
            prompt_text: Some("Say it".to_string()),
            reference_text: reference.map(str::to_string),
            picture_url: None,
            prompt_audio_url: None,
        }],
    }
}

pub async fn create_test_app() -> TestApp {
    std::env::set_var("APP_ENV", "test");

    let (store, memory) = ReviewStore::memory();
    memory.insert_item(lexeme("lx-apple", "apple", 1));
    memory.insert_item(lexeme("lx-receive", "receive", 2));
    memory.insert_item(lexeme("lx-river", "river", 3));
    memory.insert_speaking_task(speaking_task(
        "task-read",
        SpeakingTaskType::ReadAloud,
        Some("the river is wide"),
    ));

    let (queue, pending) = JobQueue::memory();
    let mut config = Config::from_env();
    config.database_url = None;
    config.redis_url = None;
    let state = AppState::new(store, queue, config, None);

    TestApp {
        router: create_app_with(state),
        memory,
        queue: pending,
    }
}

pub fn request(method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user) = user {
        builder = builder
            .header("x-user-id", user)
            .header("x-user-permissions", ALL_PERMISSIONS);
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
