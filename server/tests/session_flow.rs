//! End-to-end tests driving the real HTTP surface against a live PTY
//! (spec.md §8's create-write-read and multi-viewer scenarios).

use std::time::Duration;

use termcast_core::config;

async fn spawn_server() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = config::ensure_loaded();
    tokio::spawn(termcast_server::serve(listener, config));
    // Give the listener a moment to start accepting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("http://{addr}")
}

#[tokio::test]
async fn healthz_reports_ok() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();
    let resp = client.get(format!("{base}/healthz")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn create_list_and_delete_session() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(format!("{base}/api/sessions"))
        .json(&serde_json::json!({ "command": ["/bin/cat"] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let list: Vec<serde_json::Value> = client
        .get(format!("{base}/api/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(list.iter().any(|s| s["id"] == id));

    let resp = client
        .delete(format!("{base}/api/sessions/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = client
        .get(format!("{base}/api/sessions/{id}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn write_input_and_read_back_over_text_stream() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();

    let created: serde_json::Value = client
        .post(format!("{base}/api/sessions"))
        .json(&serde_json::json!({ "command": ["/bin/cat"] }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let stream_url = format!("{base}/api/sessions/{id}/stream");
    let stream_handle = tokio::spawn(async move {
        let client = reqwest::Client::new();
        let resp = client.get(&stream_url).send().await.unwrap();
        let mut body = resp.bytes_stream();
        use futures_util::StreamExt;
        let mut collected = Vec::new();
        loop {
            let next = match tokio::time::timeout(Duration::from_secs(3), body.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                _ => break,
            };
            collected.extend_from_slice(&next);
            if String::from_utf8_lossy(&collected).contains("round-trip-marker") {
                break;
            }
        }
        collected
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    client
        .post(format!("{base}/api/sessions/{id}/input"))
        .json(&serde_json::json!({ "data": "round-trip-marker\n" }))
        .send()
        .await
        .unwrap();

    let collected = tokio::time::timeout(Duration::from_secs(5), stream_handle)
        .await
        .unwrap()
        .unwrap();
    let text = String::from_utf8_lossy(&collected);
    assert!(text.contains("round-trip-marker"));
}

#[tokio::test]
async fn resize_rejects_unknown_session() {
    let base = spawn_server().await;
    let client = reqwest::Client::new();
    let fake_id = uuid::Uuid::new_v4();
    let resp = client
        .post(format!("{base}/api/sessions/{fake_id}/resize"))
        .json(&serde_json::json!({ "cols": 100, "rows": 40 }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
