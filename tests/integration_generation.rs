use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde_json::{Value, json};

use soragen::generation::{GenerationClient, GenerationError};
use soragen::task::dispatch::{self, SubmitRequest};
use soragen::task::model::{EndpointConfig, TaskStatus};
use soragen::task::storage::SnapshotStorage;
use soragen::task::store::TaskStore;

const KEY: &str = "Bearer sk-test";

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    format!("http://{addr}/v1/chat/completions")
}

fn endpoint(url: String) -> EndpointConfig {
    EndpointConfig {
        api_url: url,
        api_key: KEY.to_owned(),
    }
}

fn completion(content: &str) -> Json<Value> {
    Json(json!({
        "id": "chatcmpl-1",
        "choices": [{ "message": { "role": "assistant", "content": content } }]
    }))
}

async fn reply_with(content: &'static str) -> String {
    serve(Router::new().route(
        "/v1/chat/completions",
        post(move || async move { completion(content) }),
    ))
    .await
}

#[tokio::test]
async fn markdown_link_is_returned() {
    let url = reply_with("Here you go: [download video](https://cdn.example.com/out.mp4)").await;
    let client = GenerationClient::new("sora-2").unwrap();

    let got = client
        .generate(&endpoint(url), "a cat surfing", None)
        .await
        .unwrap();
    assert_eq!(got, "https://cdn.example.com/out.mp4");
}

#[tokio::test]
async fn bare_url_content_is_returned() {
    let url = reply_with("https://cdn.example.com/out.mp4").await;
    let client = GenerationClient::new("sora-2").unwrap();

    let got = client.generate(&endpoint(url), "x", None).await.unwrap();
    assert_eq!(got, "https://cdn.example.com/out.mp4");
}

#[tokio::test]
async fn content_without_link_is_a_parse_error() {
    let url = reply_with("no link here").await;
    let client = GenerationClient::new("sora-2").unwrap();

    let err = client.generate(&endpoint(url), "x", None).await.unwrap_err();
    match err {
        GenerationError::Parse { content } => assert_eq!(content, "no link here"),
        other => panic!("expected parse error, got {other:?}"),
    }
}

#[tokio::test]
async fn server_error_carries_status_and_body() {
    let url = serve(Router::new().route(
        "/v1/chat/completions",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "server overloaded") }),
    ))
    .await;
    let client = GenerationClient::new("sora-2").unwrap();

    let err = client.generate(&endpoint(url), "x", None).await.unwrap_err();
    assert!(matches!(
        &err,
        GenerationError::Remote { status: 500, body } if body == "server overloaded"
    ));
    let msg = err.to_string();
    assert!(msg.contains("500"));
    assert!(msg.contains("server overloaded"));
}

#[tokio::test]
async fn request_carries_key_model_and_image() {
    async fn check(headers: HeaderMap, Json(body): Json<Value>) -> Response {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let content_type = headers
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        let expected = json!({
            "model": "sora-2",
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "noir rain on neon"},
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}}
                ]
            }]
        });
        if auth != KEY || content_type != "application/json" || body != expected {
            return (StatusCode::BAD_REQUEST, format!("{auth} {content_type} {body}"))
                .into_response();
        }
        completion("[v](https://cdn.example.com/ok.mp4)").into_response()
    }

    let url = serve(Router::new().route("/v1/chat/completions", post(check))).await;
    let client = GenerationClient::new("sora-2").unwrap();

    let got = client
        .generate(
            &endpoint(url),
            "noir rain on neon",
            Some("data:image/png;base64,AAAA"),
        )
        .await
        .unwrap();
    assert_eq!(got, "https://cdn.example.com/ok.mp4");
}

#[tokio::test]
async fn batch_settles_each_task_independently() {
    // Every other request fails, so one batch holds both outcomes.
    async fn alternate(State(hits): State<Arc<AtomicUsize>>) -> Response {
        let n = hits.fetch_add(1, Ordering::SeqCst);
        if n % 2 == 0 {
            completion(&format!("[video](https://cdn.example.com/{n}.mp4)")).into_response()
        } else {
            (StatusCode::SERVICE_UNAVAILABLE, "busy").into_response()
        }
    }

    let hits = Arc::new(AtomicUsize::new(0));
    let url = serve(
        Router::new()
            .route("/v1/chat/completions", post(alternate))
            .with_state(Arc::clone(&hits)),
    )
    .await;

    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = TaskStore::load(SnapshotStorage::new(dir.path().to_path_buf())).unwrap();
    store.save_configuration(endpoint(url)).unwrap();
    let client = GenerationClient::new("sora-2").unwrap();

    let request = SubmitRequest {
        prefix: "anime".to_owned(),
        body: "a paper boat".to_owned(),
        suffix: String::new(),
        image: None,
        count: 4,
    };
    let mut batch = dispatch::dispatch(&mut store, &client, &request).unwrap();
    assert_eq!(batch.tasks().len(), 4);

    let mut settled = 0;
    while let Some(done) = batch.next_completion().await {
        dispatch::settle(&mut store, done).unwrap();
        settled += 1;
    }
    assert_eq!(settled, 4);
    assert_eq!(hits.load(Ordering::SeqCst), 4);

    let reloaded = TaskStore::load(SnapshotStorage::new(dir.path().to_path_buf())).unwrap();
    let counts = reloaded.counts();
    assert_eq!(counts.get(&TaskStatus::Success), Some(&2));
    assert_eq!(counts.get(&TaskStatus::Failed), Some(&2));
    assert_eq!(counts.get(&TaskStatus::Processing), None);

    for task in reloaded.tasks() {
        match task.status {
            TaskStatus::Success => {
                assert!(task.video_url.as_deref().unwrap().ends_with(".mp4"));
                assert!(task.error_message.is_none());
            }
            TaskStatus::Failed => {
                let msg = task.error_message.as_deref().unwrap();
                assert!(msg.contains("503") && msg.contains("busy"));
                assert!(task.video_url.is_none());
            }
            other => panic!("unexpected status {other:?}"),
        }
    }
    assert_eq!(reloaded.gallery().len(), 2);
}

async fn serve_video(body: &'static [u8]) -> String {
    let url = serve(
        Router::new()
            .route("/files/out.mp4", get(move || async move { body }))
            .route(
                "/files/gone.mp4",
                get(|| async { (StatusCode::NOT_FOUND, "gone") }),
            ),
    )
    .await;
    url.replace("/v1/chat/completions", "/files")
}

#[tokio::test]
async fn finished_video_downloads_to_file() {
    let body: &'static [u8] = b"\x00\x00\x00\x18ftypmp42";
    let base = serve_video(body).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let dest = dir.path().join("clips").join("fox.mp4");
    let client = GenerationClient::new("sora-2").unwrap();

    let written = client
        .download(&format!("{base}/out.mp4"), &dest)
        .await
        .unwrap();
    assert_eq!(written, body.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), body);
    assert!(!dir.path().join("clips").join("fox.mp4.part").exists());
}

#[tokio::test]
async fn refused_download_leaves_no_file() {
    let base = serve_video(b"unused").await;
    let dir = tempfile::tempdir().expect("tempdir");
    let dest = dir.path().join("gone.mp4");
    let client = GenerationClient::new("sora-2").unwrap();

    let err = client
        .download(&format!("{base}/gone.mp4"), &dest)
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("404"));
    assert!(!dest.exists());
    assert!(!dir.path().join("gone.mp4.part").exists());
}
