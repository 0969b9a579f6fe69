use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use writer_adapters::{
    create_generation_service, AdapterError, ChatCompletionRequest, Config, ServiceConfig,
    Transport, TransportClient,
};
use writer_core::{CancellationToken, ChatMessage, ErrorKind, GenerateRequest, WritingAssistant};

struct CapturedRequest {
    request_line: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl CapturedRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn json(&self) -> Value {
        serde_json::from_str(&self.body).expect("request body is JSON")
    }
}

/// Serves one canned response per connection and reports what it received.
fn stub_server(responses: Vec<(u16, &'static str)>) -> (String, mpsc::Receiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub server");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = mpsc::channel();

    thread::spawn(move || {
        for (status, body) in responses {
            let (mut stream, _) = match listener.accept() {
                Ok(conn) => conn,
                Err(_) => return,
            };
            let captured = read_request(&mut stream);
            let response = format!(
                "HTTP/1.1 {status} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes());
            let _ = stream.flush();
            let _ = tx.send(captured);
        }
    });

    (format!("http://{addr}/v1/chat/completions"), rx)
}

fn read_request(stream: &mut impl Read) -> CapturedRequest {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        let read = stream.read(&mut chunk).expect("read request");
        if read == 0 {
            panic!("connection closed before headers were complete");
        }
        buf.extend_from_slice(&chunk[..read]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(0);

    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let read = stream.read(&mut chunk).expect("read body");
        if read == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..read]);
    }

    CapturedRequest {
        request_line,
        headers,
        body: String::from_utf8_lossy(&body).to_string(),
    }
}

/// Accepts one connection, reads nothing and never answers.
fn silent_server(hold: Duration) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind silent server");
    let addr = listener.local_addr().expect("local addr");
    thread::spawn(move || {
        if let Ok((stream, _)) = listener.accept() {
            thread::sleep(hold);
            drop(stream);
        }
    });
    format!("http://{addr}/v1/chat/completions")
}

fn client_for(url: &str, key: &str) -> TransportClient {
    TransportClient::new(
        ServiceConfig::new(key)
            .with_endpoint(url)
            .with_model("test-model")
            .with_timeout(Duration::from_secs(5)),
    )
    .expect("client")
}

fn request(max_tokens: Option<u32>) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: "test-model".into(),
        messages: vec![ChatMessage::user("Write a short poem")],
        max_tokens,
    }
}

#[test]
fn sends_normalized_bearer_header_and_json_body() {
    let (url, rx) = stub_server(vec![(
        200,
        r#"{"choices":[{"message":{"role":"assistant","content":"hi"}}]}"#,
    )]);
    let client = client_for(&url, "Bearer sk-ABC ");

    let value = client
        .send(&request(Some(150)), &CancellationToken::new())
        .expect("send");
    assert_eq!(value["choices"][0]["message"]["content"], "hi");

    let captured = rx.recv_timeout(Duration::from_secs(5)).expect("captured");
    assert!(captured.request_line.starts_with("POST /v1/chat/completions"));
    assert_eq!(captured.header("authorization"), Some("Bearer sk-ABC"));
    assert!(captured
        .header("content-type")
        .unwrap_or_default()
        .starts_with("application/json"));
    assert_eq!(
        captured.json(),
        json!({
            "model": "test-model",
            "messages": [{"role": "user", "content": "Write a short poem"}],
            "max_tokens": 150
        })
    );
}

#[test]
fn body_without_token_limit_omits_max_tokens() {
    let (url, rx) = stub_server(vec![(200, r#"{"choices":[]}"#)]);
    let client = client_for(&url, "sk-ABC");
    client
        .send(&request(None), &CancellationToken::new())
        .expect("send");

    let body = rx.recv_timeout(Duration::from_secs(5)).expect("captured").json();
    assert!(body.get("max_tokens").is_none());
}

#[test]
fn error_status_carries_service_message() {
    let (url, _rx) = stub_server(vec![(
        401,
        r#"{"error":{"message":"Invalid API key","type":"auth_error"}}"#,
    )]);
    let client = client_for(&url, "sk-bad");

    let err = client
        .send(&request(None), &CancellationToken::new())
        .unwrap_err();
    match &err {
        AdapterError::HttpStatus {
            status,
            message,
            error_type,
        } => {
            assert_eq!(status.as_u16(), 401);
            assert_eq!(message, "Invalid API key");
            assert_eq!(error_type, "auth_error");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!err.is_retryable());
}

#[test]
fn non_json_error_body_uses_unknown_error() {
    let (url, _rx) = stub_server(vec![(502, "<html>Bad Gateway</html>")]);
    let client = client_for(&url, "sk-ABC");

    let err = client
        .send(&request(None), &CancellationToken::new())
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(err.kind(), ErrorKind::Http { status: 502 });
    assert!(err.to_string().contains("unknown error"));
}

#[test]
fn non_json_success_body_is_malformed() {
    let (url, _rx) = stub_server(vec![(200, "definitely not json")]);
    let client = client_for(&url, "sk-ABC");

    let err = client
        .send(&request(None), &CancellationToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MalformedResponse);
    assert!(!err.is_retryable());
}

#[test]
fn refused_connection_is_retryable() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);

    let client = client_for(&format!("http://{addr}/v1/chat/completions"), "sk-ABC");
    let err = client
        .send(&request(None), &CancellationToken::new())
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConnectionFailure);
    assert!(err.is_retryable());
}

#[test]
fn cancelled_token_short_circuits_send() {
    let client = client_for("http://127.0.0.1:9/v1/chat/completions", "sk-ABC");
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        client.send(&request(None), &cancel),
        Err(AdapterError::Cancelled)
    ));
}

#[test]
fn full_stack_generation_against_stub_server() {
    let (url, rx) = stub_server(vec![
        (503, r#"{"error":{"message":"overloaded"}}"#),
        (
            200,
            r#"{"choices":[{"message":{"role":"assistant","content":"  Roses are red.  "}}]}"#,
        ),
    ]);

    let mut config = Config::default();
    config.service.api_key = "Bearer sk-ABC".into();
    config.service.endpoint_url = url;
    config.service.retry_delay = 0;

    let service = create_generation_service(&config).expect("service");
    let outcome = service.generate_content(
        &GenerateRequest::new("Write a short poem").with_max_tokens(150),
        &CancellationToken::new(),
    );
    assert_eq!(outcome.text(), Some("Roses are red."));

    let first = rx.recv_timeout(Duration::from_secs(5)).expect("first");
    let second = rx.recv_timeout(Duration::from_secs(5)).expect("second");
    assert_eq!(first.body, second.body);
    assert_eq!(second.header("authorization"), Some("Bearer sk-ABC"));
    assert_eq!(second.json()["model"], "Pro/deepseek-ai/DeepSeek-R1");
}

#[test]
fn unanswered_request_times_out_as_retryable() {
    let url = silent_server(Duration::from_secs(5));
    let client = TransportClient::new(
        ServiceConfig::new("sk-ABC")
            .with_endpoint(url)
            .with_timeout(Duration::from_secs(1)),
    )
    .expect("client");

    let started = Instant::now();
    let err = client
        .send(&request(None), &CancellationToken::new())
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert!(err.is_retryable());
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn cancelling_in_flight_request_returns_promptly() {
    let url = silent_server(Duration::from_secs(10));
    let client = TransportClient::new(
        ServiceConfig::new("sk-ABC")
            .with_endpoint(url)
            .with_timeout(Duration::from_secs(5)),
    )
    .expect("client");

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(300));
        trigger.cancel();
    });

    let started = Instant::now();
    let result = client.send(&request(None), &cancel);

    assert!(matches!(result, Err(AdapterError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(2));
}
