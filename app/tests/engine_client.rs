//! HTTP client against a minimal in-process responder.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use easel_lib::clients::{ClientConfig, ClientError, HttpEngineClient, RemoteEngineClient};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

#[derive(Debug, Clone)]
struct Recorded {
    method: String,
    path: String,
    body: String,
}

/// Answers every request with the response registered for its path, or 404.
async fn serve(
    routes: Vec<(&'static str, u16, &'static str)>,
) -> (Url, Arc<Mutex<Vec<Recorded>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    let recorded = log.clone();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let routes = routes.clone();
            let recorded = recorded.clone();
            tokio::spawn(async move {
                let request = read_request(&mut socket).await;
                let (status, body) = routes
                    .iter()
                    .find(|(path, _, _)| *path == request.path)
                    .map(|(_, status, body)| (*status, *body))
                    .unwrap_or((404, ""));
                recorded.lock().unwrap().push(request);

                if status == 0 {
                    // Never answer
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    return;
                }
                let response = format!(
                    "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (base, log)
}

async fn read_request(socket: &mut tokio::net::TcpStream) -> Recorded {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];
    let header_end = loop {
        let n = socket.read(&mut chunk).await.unwrap();
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        if n == 0 {
            break buffer.len();
        }
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let mut first = head.lines().next().unwrap_or_default().split_whitespace();
    let method = first.next().unwrap_or_default().to_string();
    let path = first.next().unwrap_or_default().to_string();
    let length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);

    while buffer.len() < header_end + length {
        let n = socket.read(&mut chunk).await.unwrap();
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
    let body = String::from_utf8_lossy(&buffer[header_end..]).to_string();
    Recorded { method, path, body }
}

fn client() -> HttpEngineClient {
    HttpEngineClient::new(ClientConfig {
        request_timeout: Duration::from_millis(500),
        load_timeout: Duration::from_millis(500),
        credentials: None,
    })
    .unwrap()
}

#[tokio::test]
async fn test_list_and_refresh_checkpoints() {
    let (base, log) = serve(vec![
        ("/sdapi/v1/refresh-checkpoints", 200, ""),
        (
            "/sdapi/v1/sd-models",
            200,
            r#"[{"title":"a.safetensors [abc]","model_name":"a","hash":"abc","sha256":null,"filename":"/m/a.safetensors","config":null}]"#,
        ),
    ])
    .await;
    let client = client();

    client.refresh_checkpoints(&base).await.unwrap();
    let list = client.list_checkpoints(&base).await.unwrap();

    assert_eq!(list.len(), 1);
    assert_eq!(list[0].title, "a.safetensors [abc]");
    assert_eq!(list[0].hash.as_deref(), Some("abc"));
    let log = log.lock().unwrap();
    assert_eq!(log[0].method, "POST");
    assert_eq!(log[1].method, "GET");
}

#[tokio::test]
async fn test_malformed_list_is_decode_error() {
    let (base, _) = serve(vec![("/sdapi/v1/sd-models", 200, r#"{"not":"a list"}"#)]).await;
    let result = client().list_checkpoints(&base).await;
    assert!(matches!(result, Err(ClientError::Decode(_))));
}

#[tokio::test]
async fn test_loaded_checkpoint_from_options() {
    let (base, _) = serve(vec![(
        "/sdapi/v1/options",
        200,
        r#"{"sd_model_checkpoint":"a.safetensors [abc]","samples_format":"png"}"#,
    )])
    .await;
    let title = client().loaded_checkpoint(&base).await.unwrap();
    assert_eq!(title.as_deref(), Some("a.safetensors [abc]"));
}

#[tokio::test]
async fn test_set_checkpoint_posts_title() {
    let (base, log) = serve(vec![("/sdapi/v1/options", 200, "")]).await;
    client()
        .set_loaded_checkpoint(&base, "b.safetensors [def]")
        .await
        .unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log[0].method, "POST");
    let body: serde_json::Value = serde_json::from_str(&log[0].body).unwrap();
    assert_eq!(body["sd_model_checkpoint"], "b.safetensors [def]");
}

#[tokio::test]
async fn test_unprocessable_entity_is_validation_error() {
    let (base, _) = serve(vec![(
        "/sdapi/v1/options",
        422,
        r#"{"detail":[{"msg":"field required","loc":["body","sd_model_checkpoint"],"type":"value_error.missing"}]}"#,
    )])
    .await;
    let result = client().set_loaded_checkpoint(&base, "x").await;
    match result {
        Err(ClientError::Validation(detail)) => {
            assert_eq!(detail, "body.sd_model_checkpoint: field required")
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_error_is_status_error() {
    let (base, _) = serve(vec![("/sdapi/v1/refresh-checkpoints", 500, "boom")]).await;
    let result = client().refresh_checkpoints(&base).await;
    assert!(matches!(result, Err(ClientError::Status { status: 500, .. })));
}

#[tokio::test]
async fn test_unresponsive_engine_times_out() {
    let (base, _) = serve(vec![("/sdapi/v1/sd-models", 0, "")]).await;
    let result = client().list_checkpoints(&base).await;
    assert!(matches!(result, Err(ClientError::Timeout)));
}

#[tokio::test]
async fn test_samplers_catalog() {
    let (base, _) = serve(vec![(
        "/sdapi/v1/samplers",
        200,
        r#"[{"name":"Euler a","aliases":["k_euler_a"],"options":{}}]"#,
    )])
    .await;
    let samplers = client().list_samplers(&base).await.unwrap();
    assert_eq!(samplers[0].name, "Euler a");
}
