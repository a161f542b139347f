//! Large media goes through the Files API once and is referenced by URI.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use gemcord_core::media::{MediaBlob, Provenance};
use gemcord_core::message::{ModelTurn, Turn, UserTurn};
use gemcord_core::provider::{HarmBlockThreshold, ModelReply, ModelRequest, Provider};
use gemcord_providers::GeminiProvider;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Request line and body of every request the fake API saw.
type Log = Arc<Mutex<Vec<(String, String)>>>;

async fn read_request(socket: &mut TcpStream) -> (String, String) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed mid-request");
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .map(|(_, value)| value.trim().parse::<usize>().unwrap())
        .unwrap_or(0);
    while buf.len() < header_end + content_length {
        let n = socket.read(&mut chunk).await.unwrap();
        assert!(n > 0, "connection closed mid-body");
        buf.extend_from_slice(&chunk[..n]);
    }

    let request_line = head.lines().next().unwrap_or_default().to_string();
    let body = String::from_utf8_lossy(&buf[header_end..header_end + content_length]).to_string();
    (request_line, body)
}

/// Serve a minimal Files API and generateContent endpoint.
async fn fake_api() -> (String, Log) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let server_base = base.clone();
    let server_log = log.clone();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            let (request_line, body) = read_request(&mut socket).await;
            server_log.lock().unwrap().push((request_line.clone(), body));

            let file = |state: &str| {
                format!(
                    r#"{{"name":"files/abc","uri":"{server_base}/v1beta/files/abc","mimeType":"video/mp4","state":"{state}"}}"#
                )
            };
            let (extra_headers, body) = if request_line.starts_with("POST /upload/v1beta/files") {
                (format!("x-goog-upload-url: {server_base}/upload-session/1\r\n"), "{}".to_string())
            } else if request_line.starts_with("POST /upload-session/1") {
                (String::new(), format!(r#"{{"file":{}}}"#, file("PROCESSING")))
            } else if request_line.starts_with("GET /v1beta/files/abc") {
                (String::new(), file("ACTIVE"))
            } else {
                (
                    String::new(),
                    r#"{"candidates":[{"content":{"parts":[{"text":"A short clip."}]},"finishReason":"STOP"}]}"#
                        .to_string(),
                )
            };

            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n{extra_headers}Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        }
    });

    (base, log)
}

fn request(history: Vec<Turn>, new_turns: Vec<Turn>) -> ModelRequest {
    ModelRequest {
        model: "gemini-2.5-flash".into(),
        system_prompt: None,
        history,
        new_turns,
        tools: vec![],
        safety_threshold: HarmBlockThreshold::BlockMediumAndAbove,
        temperature: 1.0,
    }
}

fn count(log: &Log, prefix: &str) -> usize {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(line, _)| line.starts_with(prefix))
        .count()
}

#[tokio::test]
async fn large_media_is_uploaded_once_and_referenced() {
    let (base, log) = fake_api().await;
    let provider = GeminiProvider::with_base_url("test-key", base.as_str())
        .with_inline_limit(16)
        .with_poll_interval(Duration::from_millis(10));

    let video = MediaBlob::new(vec![7u8; 64], "video/mp4", Provenance::ResolvedLink, "clip.mp4");
    let icon = MediaBlob::new(vec![1u8, 2, 3], "image/png", Provenance::Attachment, "icon.png");
    let mut first = UserTurn::new("42", "what is in this video?");
    first.media = vec![video, icon];

    let response = provider
        .complete(request(vec![], vec![Turn::User(first.clone())]))
        .await
        .unwrap();
    assert!(matches!(response.reply, ModelReply::Final { ref text, .. } if text == "A short clip."));

    // The same video replayed from history is not uploaded again.
    provider
        .complete(request(
            vec![
                Turn::User(first),
                Turn::Model(ModelTurn::answer("A short clip.", vec![])),
            ],
            vec![Turn::User(UserTurn::new("42", "and the colors?"))],
        ))
        .await
        .unwrap();

    assert_eq!(count(&log, "POST /upload/v1beta/files"), 1);
    assert_eq!(count(&log, "POST /upload-session/1"), 1);
    assert_eq!(count(&log, "GET /v1beta/files/abc"), 1);

    let generate: Vec<serde_json::Value> = log
        .lock()
        .unwrap()
        .iter()
        .filter(|(line, _)| line.contains(":generateContent"))
        .map(|(_, body)| serde_json::from_str(body).unwrap())
        .collect();
    assert_eq!(generate.len(), 2);
    for body in &generate {
        let parts = &body["contents"][0]["parts"];
        assert_eq!(parts[1]["fileData"]["fileUri"], format!("{base}/v1beta/files/abc"));
        assert!(parts[1].get("inlineData").is_none());
        assert_eq!(parts[2]["inlineData"]["data"], "AQID");
    }
}
