//! In-process HTTP server standing in for DigitaltMuseum and Commons in tests.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub received_at: Instant,
}

impl RecordedRequest {
    pub fn path(&self) -> &str { self.target.split('?').next().unwrap_or("") }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        let query = self.target.split_once('?').map(|(_, q)| q).unwrap_or("");
        url::form_urlencoded::parse(query.as_bytes()).find(|(k, _)| k == name).map(|(_, v)| v.into_owned())
    }

    /// Query parameter, else url-encoded body field.
    pub fn param(&self, name: &str) -> Option<String> {
        self.query_param(name).or_else(|| {
            let is_form = self.header("content-type").is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
            is_form
                .then(|| url::form_urlencoded::parse(&self.body).find(|(k, _)| k == name).map(|(_, v)| v.into_owned()))
                .flatten()
        })
    }

    pub fn is_multipart(&self) -> bool {
        self.header("content-type").is_some_and(|ct| ct.starts_with("multipart/form-data"))
    }

    pub fn body_text(&self) -> String { String::from_utf8_lossy(&self.body).into_owned() }
}

#[derive(Debug, Clone)]
pub(crate) struct MockResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
}

impl MockResponse {
    pub fn json(status: u16, value: serde_json::Value) -> Self {
        Self { status, content_type: "application/json".into(), body: value.to_string().into_bytes() }
    }

    pub fn bytes(status: u16, content_type: &str, body: &[u8]) -> Self {
        Self { status, content_type: content_type.into(), body: body.to_vec() }
    }
}

type Handler = Arc<dyn Fn(&RecordedRequest) -> MockResponse + Send + Sync>;

pub(crate) struct MockServer {
    base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&RecordedRequest) -> MockResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("failed to bind mock server");
        let port = listener.local_addr().unwrap().port();
        let base_url = format!("http://127.0.0.1:{port}");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Handler = Arc::new(handler);

        let recorded = requests.clone();
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                let handler = handler.clone();
                let recorded = recorded.clone();
                tokio::spawn(async move {
                    let _ = read_request(stream, handler, recorded).await;
                });
            }
        });
        Self { base_url, requests, task }
    }

    pub fn url(&self) -> &str { &self.base_url }

    pub fn requests(&self) -> Vec<RecordedRequest> { self.requests.lock().unwrap().clone() }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests().into_iter().filter(|r| r.path() == path).collect()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) { self.task.abort(); }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

async fn read_request(
    mut stream: TcpStream,
    handler: Handler,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
) -> Option<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    let header_end = loop {
        if let Some(pos) = find(&buf, b"\r\n\r\n") { break pos; }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 { return None; }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_ascii_lowercase(), v.trim().to_string()))
        .collect();

    let mut body = buf[header_end + 4..].to_vec();
    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok());
    let chunked = headers.iter().any(|(k, v)| k == "transfer-encoding" && v.contains("chunked"));
    if let Some(len) = content_length {
        while body.len() < len {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 { break; }
            body.extend_from_slice(&chunk[..n]);
        }
    } else if chunked {
        // Raw chunked framing is kept; tests only search the body.
        while find(&body, b"0\r\n\r\n").is_none() {
            let n = stream.read(&mut chunk).await.ok()?;
            if n == 0 { break; }
            body.extend_from_slice(&chunk[..n]);
        }
    }

    let req = RecordedRequest { method, target, headers, body, received_at: Instant::now() };
    let resp = handler(&req);
    recorded.lock().unwrap().push(req);

    let head = format!(
        "HTTP/1.1 {} OK\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        resp.status,
        resp.content_type,
        resp.body.len()
    );
    stream.write_all(head.as_bytes()).await.ok()?;
    stream.write_all(&resp.body).await.ok()?;
    stream.shutdown().await.ok()?;
    Some(())
}
