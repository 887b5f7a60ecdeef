use axum::{
    http::{header, StatusCode},
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use std::net::SocketAddr;

async fn serve(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

/// One server for both collaborators: target pages and an OpenAI-compatible endpoint.
///
/// The fake model answers `grounded` when the prompt carries the page, `plain:<prompt>` otherwise.
async fn fixture() -> SocketAddr {
    async fn completions(Json(body): Json<serde_json::Value>) -> axum::response::Response {
        let prompt = body["messages"][1]["content"].as_str().unwrap_or("").to_string();
        let answer = if prompt.contains("Title: Contract Page") && prompt.contains("USER QUESTION: summarize") {
            "grounded".to_string()
        } else {
            format!("plain:{prompt}")
        };
        if body["stream"].as_bool() == Some(true) {
            let mut sse = String::new();
            for part in answer.split_inclusive(':') {
                let ev = serde_json::json!({ "choices": [{ "delta": { "content": part } }] });
                sse.push_str(&format!("data: {ev}\n\n"));
            }
            sse.push_str("data: [DONE]\n\n");
            return ([(header::CONTENT_TYPE, "text/event-stream")], sse).into_response();
        }
        Json(serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": answer } }]
        }))
        .into_response()
    }

    let app = Router::new()
        .route(
            "/a",
            get(|| async {
                Html(format!(
                    "<html><head><title>Contract Page</title></head><body><nav>menu</nav><article>{}</article></body></html>",
                    "A page long enough to ground an answer on. ".repeat(5)
                ))
            }),
        )
        .route("/down", get(|| async { StatusCode::BAD_GATEWAY }))
        .route("/v1/chat/completions", post(completions));
    serve(app).await
}

async fn webground(addr: SocketAddr, args: &[&str]) -> (i32, serde_json::Value, String) {
    let bin = assert_cmd::cargo::cargo_bin!("webground");
    let out = tokio::process::Command::new(bin)
        .args(args)
        .env("WEBGROUND_CACHE", "memory")
        .env("WEBGROUND_RENDER_DISABLE", "1")
        .env("WEBGROUND_LLM_PROVIDER", "openai_compat")
        .env("WEBGROUND_LLM_BASE_URL", format!("http://{addr}"))
        .env("WEBGROUND_LLM_API_KEY", "test-key")
        .env_remove("WEBGROUND_ENV_FILE")
        .env_remove("WEBGROUND_LLM_MODEL")
        .output()
        .await
        .expect("run webground");
    let stdout = String::from_utf8_lossy(&out.stdout).to_string();
    let json = stdout
        .lines()
        .rev()
        .find_map(|l| serde_json::from_str::<serde_json::Value>(l).ok())
        .unwrap_or(serde_json::Value::Null);
    (out.status.code().unwrap_or(-1), json, stdout)
}

#[tokio::test(flavor = "multi_thread")]
async fn ask_with_url_is_grounded_on_the_page() {
    let addr = fixture().await;
    let url = format!("http://{addr}/a");
    let (code, v, _) = webground(addr, &["ask", "summarize", &url]).await;

    assert_eq!(code, 0, "{v}");
    assert_eq!(v["success"], true);
    assert_eq!(v["ai"], "grounded");
    assert_eq!(v["has_url"], true);
    assert_eq!(v["url"].as_str(), Some(url.as_str()));
    assert_eq!(v["extraction_method"], "static");
    assert_eq!(v["user"].as_str(), Some(format!("summarize {url}").as_str()));
}

#[tokio::test(flavor = "multi_thread")]
async fn ask_without_url_sends_the_message_unmodified() {
    let addr = fixture().await;
    let (code, v, _) = webground(addr, &["ask", "hello"]).await;
    assert_eq!(code, 0, "{v}");
    assert_eq!(v["ai"], "plain:hello");
    assert_eq!(v["has_url"], false);
    assert!(v["url"].is_null());
}

#[tokio::test(flavor = "multi_thread")]
async fn ask_rejects_non_string_messages_as_client_errors() {
    let addr = fixture().await;
    let (code, v, _) = webground(addr, &["ask", "--json", r#"{"message": 42}"#]).await;
    assert_eq!(code, 2, "{v}");
    assert_eq!(v["success"], false);
    assert_eq!(v["status"], 400);
    assert_eq!(v["error"], "invalid-input");
}

#[tokio::test(flavor = "multi_thread")]
async fn unreadable_pages_are_reported_as_scrape_failures() {
    let addr = fixture().await;
    let (code, v, _) = webground(addr, &["ask", &format!("what is on http://{addr}/down")]).await;
    assert_eq!(code, 1, "{v}");
    assert_eq!(v["error"], "scrape-failed");
    assert_eq!(v["status"], 500);
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_writes_fragments_to_stdout() {
    let addr = fixture().await;
    let (code, _, stdout) = webground(addr, &["ask", "--stream", "hello"]).await;
    assert_eq!(code, 0, "{stdout}");
    assert_eq!(stdout.trim_end(), "plain:hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn fetch_prints_the_extracted_record() {
    let addr = fixture().await;
    let url = format!("http://{addr}/a");
    let (code, v, _) = webground(addr, &["fetch", &url]).await;
    assert_eq!(code, 0, "{v}");
    assert_eq!(v["title"], "Contract Page");
    assert_eq!(v["extraction_method"], "static");
    assert!(!v["main_content"].as_str().unwrap_or("").contains("menu"));
    assert!(v["word_count"].as_u64().unwrap_or(0) > 20);
}
