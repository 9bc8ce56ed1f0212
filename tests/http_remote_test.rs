use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};

use feedsync::db::models::AttachmentKind;
use feedsync::remote::{HttpRemote, RemoteError, RemoteSource};

#[derive(Clone, Default)]
struct Backend {
    seen_auth: Arc<Mutex<Vec<String>>>,
    seen_counts: Arc<Mutex<Vec<String>>>,
}

fn wire_post(id: i64) -> Value {
    json!({
        "id": id,
        "authorId": 7,
        "author": "Netology",
        "authorAvatar": "netology.jpg",
        "content": format!("post {id}"),
        "published": 1_700_000_000 + id,
        "likedByMe": false,
        "likes": 3,
        "attachment": { "url": "cat.png", "type": "IMAGE" },
        "ownedByMe": false
    })
}

async fn latest(
    State(backend): State<Backend>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Json<Value> {
    if let Some(auth) = headers.get("authorization") {
        backend
            .seen_auth
            .lock()
            .unwrap()
            .push(auth.to_str().unwrap().to_string());
    }
    if let Some(count) = query.get("count") {
        backend.seen_counts.lock().unwrap().push(count.clone());
    }
    Json(json!([wire_post(3), wire_post(2)]))
}

async fn before(Path(id): Path<i64>) -> Json<Value> {
    Json(Value::Array((1..id).rev().map(wire_post).collect()))
}

async fn like(Path(_id): Path<i64>) -> (StatusCode, &'static str) {
    (StatusCode::CONFLICT, "already liked")
}

async fn unlike(Path(_id): Path<i64>) -> StatusCode {
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn remove(Path(_id): Path<i64>) -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn newer(Path(_id): Path<i64>) -> &'static str {
    "definitely not json"
}

async fn save(Json(body): Json<Value>) -> Json<Value> {
    let mut created = wire_post(42);
    created["content"] = body["content"].clone();
    Json(created)
}

async fn media(mut multipart: Multipart) -> (StatusCode, Json<Value>) {
    while let Some(field) = multipart.next_field().await.unwrap() {
        if field.name() == Some("file") {
            let name = field.file_name().unwrap_or_default().to_string();
            let mime = field.content_type().unwrap_or_default().to_string();
            let data = field.bytes().await.unwrap();
            let id = format!("{}:{}:{}", name, mime, data.len());
            return (StatusCode::OK, Json(json!({ "id": id })));
        }
    }
    (StatusCode::BAD_REQUEST, Json(json!({})))
}

async fn serve(backend: Backend) -> String {
    let app = Router::new()
        .route("/api/posts/latest", get(latest))
        .route("/api/posts/{id}/before", get(before))
        .route("/api/posts/{id}/newer", get(newer))
        .route("/api/posts/{id}/likes", post(like).delete(unlike))
        .route("/api/posts/{id}", axum::routing::delete(remove))
        .route("/api/posts", post(save))
        .route("/api/media", post(media))
        .with_state(backend);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    // No trailing slash on purpose
    format!("http://{}/api", addr)
}

fn client(base_url: &str) -> HttpRemote {
    HttpRemote::new(
        base_url,
        Some("secret-token".to_string()),
        Duration::from_secs(5),
    )
    .expect("Failed to build client")
}

#[tokio::test]
async fn test_fetch_latest_decodes_wire_format() {
    let backend = Backend::default();
    let remote = client(&serve(backend.clone()).await);

    let posts = remote.fetch_latest(25).await.unwrap();
    assert_eq!(posts.iter().map(|p| p.id).collect::<Vec<_>>(), vec![3, 2]);
    assert_eq!(posts[0].author_id, 7);
    assert_eq!(posts[0].like_count, 3);
    assert_eq!(posts[0].published_at.timestamp(), 1_700_000_003);
    assert_eq!(
        posts[0].attachment.as_ref().map(|a| a.kind),
        Some(AttachmentKind::Image)
    );

    assert_eq!(*backend.seen_counts.lock().unwrap(), vec!["25".to_string()]);
    assert_eq!(
        *backend.seen_auth.lock().unwrap(),
        vec!["secret-token".to_string()]
    );
}

#[tokio::test]
async fn test_fetch_before_uses_anchor_path() {
    let remote = client(&serve(Backend::default()).await);

    let posts = remote.fetch_before(4, 25).await.unwrap();
    assert_eq!(posts.iter().map(|p| p.id).collect::<Vec<_>>(), vec![3, 2, 1]);
}

#[tokio::test]
async fn test_non_success_status_is_api_error() {
    let remote = client(&serve(Backend::default()).await);

    let err = remote.like(1).await.unwrap_err();
    assert_eq!(
        err,
        RemoteError::Api {
            status: 409,
            message: "already liked".to_string()
        }
    );

    // Empty body falls back to the status reason
    let err = remote.unlike(1).await.unwrap_err();
    assert_eq!(
        err,
        RemoteError::Api {
            status: 500,
            message: "Internal Server Error".to_string()
        }
    );
}

#[tokio::test]
async fn test_undecodable_body_is_unknown() {
    let remote = client(&serve(Backend::default()).await);

    let err = remote.fetch_newer(1).await.unwrap_err();
    assert!(matches!(err, RemoteError::Unknown(_)), "got {err:?}");
}

#[tokio::test]
async fn test_closed_port_is_network_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let remote = client(&format!("http://{}/api/", addr));
    let err = remote.fetch_latest(5).await.unwrap_err();
    assert!(matches!(err, RemoteError::Network(_)), "got {err:?}");
}

#[tokio::test]
async fn test_delete_accepts_empty_response() {
    let remote = client(&serve(Backend::default()).await);
    remote.delete(9).await.unwrap();
}

#[tokio::test]
async fn test_create_posts_json_and_returns_saved_post() {
    let remote = client(&serve(Backend::default()).await);

    let mut draft = feedsync::testing::post(0, 1_700_000_000);
    draft.content = "hello there".to_string();
    let saved = remote.create(draft).await.unwrap();
    assert_eq!(saved.id, 42);
    assert_eq!(saved.content, "hello there");
}

#[tokio::test]
async fn test_upload_sends_multipart_file_field() {
    let remote = client(&serve(Backend::default()).await);

    let media = remote
        .upload_attachment(Bytes::from_static(b"\x89PNG...."), "cat.png")
        .await
        .unwrap();
    assert_eq!(media.id, "cat.png:image/png:8");
}
