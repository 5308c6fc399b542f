//! Local HTTP callback server for the authorization code flow.
//!
//! Listens on the redirect URI for a single OAuth callback, hands its query
//! parameters to a handler, renders a result page for the browser and
//! delivers the handler's result over a one-shot channel.
//!
//! The listener lives inside a task owned by [`CallbackServer`]. Dropping the
//! server aborts the task; [`CallbackServer::shutdown`] also waits for it, so
//! the port is free again when it returns.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use url::Url;

use crate::error::AuthError;

/// Time allowed for a browser to send its request line and headers.
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Query parameters of an OAuth redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Parse the query string of a request target such as `/callback?code=..&state=..`.
    pub fn from_target(target: &str) -> Option<Self> {
        let url = Url::parse(&format!("http://localhost{}", target)).ok()?;
        let params: HashMap<_, _> = url.query_pairs().into_owned().collect();

        Some(Self {
            code: params.get("code").cloned(),
            state: params.get("state").cloned(),
            error: params.get("error").cloned(),
            error_description: params.get("error_description").cloned(),
        })
    }
}

/// Bind a listener for the host and port of `redirect_uri`.
pub async fn bind(redirect_uri: &Url) -> Result<TcpListener, AuthError> {
    let host = match redirect_uri.host_str() {
        Some("localhost") | None => "127.0.0.1",
        Some(host) => host,
    };
    let port = redirect_uri.port_or_known_default().unwrap_or(80);
    let addr = format!("{}:{}", host, port);

    TcpListener::bind(&addr).await.map_err(|e| {
        error!("Failed to bind callback server to {}: {}", addr, e);
        AuthError::CallbackServer(format!("failed to start server on {}: {}", addr, e))
    })
}

/// A running callback server.
pub struct CallbackServer {
    local_addr: Option<SocketAddr>,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl CallbackServer {
    /// Start serving `path` on `listener`.
    ///
    /// `handler` runs once, for the first request to `path`. Requests to other
    /// paths get an error response and the server keeps listening.
    pub fn start<T, F, Fut>(
        listener: TcpListener,
        path: impl Into<String>,
        handler: F,
    ) -> (Self, oneshot::Receiver<Result<T, AuthError>>)
    where
        T: Send + 'static,
        F: FnOnce(CallbackParams) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, AuthError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let stop = CancellationToken::new();
        let local_addr = listener.local_addr().ok();
        let path = path.into();

        if let Some(addr) = local_addr {
            info!("OAuth callback server listening on {}", addr);
        }

        let task_stop = stop.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = serve(listener, &path, handler, tx) => {}
                _ = task_stop.cancelled() => debug!("Callback server stopped"),
            }
        });

        let server = Self {
            local_addr,
            stop,
            handle: Some(handle),
        };
        (server, rx)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop the server and wait until the listening socket is closed.
    pub async fn shutdown(mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for CallbackServer {
    fn drop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn serve<T, F, Fut>(
    listener: TcpListener,
    path: &str,
    handler: F,
    tx: oneshot::Sender<Result<T, AuthError>>,
) where
    F: FnOnce(CallbackParams) -> Fut,
    Fut: Future<Output = Result<T, AuthError>>,
{
    loop {
        let mut stream = match listener.accept().await {
            Ok((stream, peer_addr)) => {
                debug!("Connection from {}", peer_addr);
                stream
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                let _ = tx.send(Err(AuthError::CallbackServer(format!(
                    "connection error: {}",
                    e
                ))));
                return;
            }
        };

        let Some(params) = read_callback(&mut stream, path).await else {
            continue;
        };

        info!("OAuth callback received");
        let result = handler(params).await;
        match &result {
            Ok(_) => send_success_page(&mut stream).await,
            Err(e) => send_error_page(&mut stream, &e.to_string()).await,
        }
        let _ = tx.send(result);
        return;
    }
}

/// Read one request; returns the callback parameters if it targets `path`.
async fn read_callback(stream: &mut TcpStream, path: &str) -> Option<CallbackParams> {
    let mut buffer = [0; 4096];
    let bytes_read = match tokio::time::timeout(READ_TIMEOUT, stream.read(&mut buffer)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            debug!("Failed to read request: {}", e);
            return None;
        }
        Err(_) => {
            debug!("Timed out reading request");
            return None;
        }
    };

    let request = String::from_utf8_lossy(&buffer[..bytes_read]);
    let request_line = request.lines().next().unwrap_or("");
    debug!("Received request: {}", request_line);

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 2 {
        send_error_response(stream, 400, "Bad Request").await;
        return None;
    }

    let (method, target) = (parts[0], parts[1]);

    if method != "GET" {
        send_error_response(stream, 405, "Method Not Allowed").await;
        return None;
    }

    let request_path = target.split('?').next().unwrap_or("");
    if request_path != path {
        send_error_response(stream, 404, "Not Found").await;
        return None;
    }

    match CallbackParams::from_target(target) {
        Some(params) => Some(params),
        None => {
            send_error_response(stream, 400, "Bad Request").await;
            None
        }
    }
}

async fn send_success_page(stream: &mut TcpStream) {
    let html = page(
        "Authentication Successful",
        "#10B981",
        "You have successfully signed in.",
        "You can close this window now.",
    );
    send_html(stream, &html).await;
}

async fn send_error_page(stream: &mut TcpStream, message: &str) {
    let html = page(
        "Authentication Failed",
        "#EF4444",
        &escape_html(message),
        "You can close this window and try again.",
    );
    send_html(stream, &html).await;
}

fn page(title: &str, color: &str, message: &str, hint: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{title}</title>
    <style>
        body {{
            font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif;
            display: flex;
            align-items: center;
            justify-content: center;
            min-height: 100vh;
            margin: 0;
        }}
        .container {{ text-align: center; max-width: 420px; }}
        h1 {{ color: {color}; font-size: 1.5rem; }}
        .hint {{ color: #9CA3AF; font-size: 0.875rem; }}
    </style>
</head>
<body>
    <div class="container">
        <h1>{title}</h1>
        <p>{message}</p>
        <p class="hint">{hint}</p>
    </div>
</body>
</html>"#
    )
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

async fn send_html(stream: &mut TcpStream, html: &str) {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        html.len(),
        html
    );
    write_response(stream, &response).await;
}

async fn send_error_response(stream: &mut TcpStream, status: u16, message: &str) {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        message,
        message.len(),
        message
    );
    write_response(stream, &response).await;
}

async fn write_response(stream: &mut TcpStream, response: &str) {
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.flush().await;
    let _ = stream.shutdown().await;
}
