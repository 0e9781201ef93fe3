//! In-process stand-in for the inference backend.
//!
//! Every accepted connection consumes the next scripted [`Reply`]; once the
//! script runs out the last reply is repeated. Requests are recorded so tests
//! can inspect what the client actually sent.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub enum Reply {
    /// Plain response with a Content-Length.
    Status { status: u16, body: String },
    /// `text/event-stream` body written chunk by chunk, `delay` apart.
    /// With `hold_open` the connection is never closed afterwards.
    Sse { chunks: Vec<Vec<u8>>, delay: Duration, hold_open: bool },
    /// Chunked `text/event-stream` body whose socket is closed after the
    /// last chunk without the terminating zero-length chunk.
    Truncated { chunks: Vec<Vec<u8>> },
    /// Read the request and never answer.
    Hang,
}

impl Reply {
    pub fn json(status: u16, body: Value) -> Self {
        Reply::Status { status, body: body.to_string() }
    }

    /// SSE body closed normally after the last chunk.
    pub fn sse<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        Reply::Sse {
            chunks: chunks.into_iter().map(Into::into).collect(),
            delay: Duration::from_millis(5),
            hold_open: false,
        }
    }

    /// SSE body that stalls after the last chunk.
    pub fn sse_then_hang<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        match Reply::sse(chunks) {
            Reply::Sse { chunks, delay, .. } => Reply::Sse { chunks, delay, hold_open: true },
            other => other,
        }
    }

    /// Chunked SSE body cut off mid-transfer.
    pub fn truncated<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Vec<u8>>,
    {
        Reply::Truncated { chunks: chunks.into_iter().map(Into::into).collect() }
    }
}

/// One `data:` frame carrying `content` as the delta.
pub fn delta(content: &str) -> String {
    let chunk = serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion.chunk",
        "choices": [{ "index": 0, "delta": { "content": content } }]
    });
    format!("data: {chunk}\n\n")
}

pub const DONE: &str = "data: [DONE]\n\n";

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).expect("request body is JSON")
    }
}

pub struct MockBackend {
    pub base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: JoinHandle<()>,
}

impl MockBackend {
    pub async fn start(replies: Vec<Reply>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock backend");
        let addr = listener.local_addr().expect("local addr");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(Mutex::new(VecDeque::from(replies)));

        let recorded = Arc::clone(&requests);
        let handle = tokio::spawn(async move {
            let mut last: Option<Reply> = None;
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let reply = {
                    let mut script = script.lock().expect("script lock");
                    match script.pop_front() {
                        Some(r) => {
                            last = Some(r.clone());
                            r
                        }
                        None => last.clone().unwrap_or(Reply::Status {
                            status: 500,
                            body: "no scripted reply".into(),
                        }),
                    }
                };
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let _ = handle_connection(stream, reply, recorded).await;
                });
            }
        });

        Self { base_url: format!("http://{addr}"), requests, handle }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    reply: Reply,
    recorded: Arc<Mutex<Vec<RecordedRequest>>>,
) -> std::io::Result<()> {
    let request = read_request(&mut stream).await?;
    recorded.lock().expect("requests lock").push(request);

    match reply {
        Reply::Status { status, body } => {
            let response = format!(
                "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                reason(status),
                body.len(),
            );
            stream.write_all(response.as_bytes()).await?;
            stream.shutdown().await?;
        }
        Reply::Sse { chunks, delay, hold_open } => {
            let headers = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nConnection: close\r\n\r\n";
            stream.write_all(headers.as_bytes()).await?;
            stream.flush().await?;
            for chunk in chunks {
                tokio::time::sleep(delay).await;
                stream.write_all(&chunk).await?;
                stream.flush().await?;
            }
            if hold_open {
                std::future::pending::<()>().await;
            }
            stream.shutdown().await?;
        }
        Reply::Truncated { chunks } => {
            let headers = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nTransfer-Encoding: chunked\r\n\r\n";
            stream.write_all(headers.as_bytes()).await?;
            for chunk in chunks {
                stream.write_all(format!("{:x}\r\n", chunk.len()).as_bytes()).await?;
                stream.write_all(&chunk).await?;
                stream.write_all(b"\r\n").await?;
                stream.flush().await?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            // No `0\r\n\r\n`: the body ends early.
            stream.shutdown().await?;
        }
        Reply::Hang => std::future::pending::<()>().await,
    }
    Ok(())
}

async fn read_request(stream: &mut TcpStream) -> std::io::Result<RecordedRequest> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        let httparse::Status::Complete(head_len) = req
            .parse(&buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        else {
            continue;
        };

        let content_length = req
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("content-length"))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let method = req.method.unwrap_or_default().to_string();
        let path = req.path.unwrap_or_default().to_string();

        while buf.len() < head_len + content_length {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let end = buf.len().min(head_len + content_length);
        return Ok(RecordedRequest { method, path, body: buf[head_len..end].to_vec() });
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Status",
    }
}
