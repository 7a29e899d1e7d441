//! Development server: serves the destination directory and pushes reload
//! events to connected browsers over Server-Sent Events.

use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Result, anyhow};
use hyper::body::Bytes;
use hyper::header::{CACHE_CONTROL, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, StatusCode};
use once_cell::sync::Lazy;
use tokio::sync::{broadcast, mpsc as async_mpsc, oneshot, watch};
use tracing::{debug, error, info};

pub const RELOAD_ENDPOINT: &str = "/__sitepipe/livereload";

static RELOAD_SCRIPT: Lazy<String> = Lazy::new(|| {
    format!(
        "<script>(function(){{var s=new EventSource(\"{RELOAD_ENDPOINT}\");\
         s.addEventListener(\"reload\",function(){{location.reload();}});}})();</script>"
    )
});

/// Something that can ask connected clients to refresh.
pub trait ReloadNotifier: Send + Sync {
    fn notify_reload(&self);
}

/// Cloneable handle used by the watcher to request a browser reload.
/// Requests arriving within the debounce window collapse into one event.
#[derive(Clone)]
pub struct ReloadHandle {
    tx: async_mpsc::UnboundedSender<()>,
    sent: Arc<AtomicU64>,
}

impl ReloadHandle {
    pub fn notify_reload(&self) {
        if self.tx.send(()).is_err() {
            debug!("Reload requested after the dev server stopped");
        }
    }

    /// Number of reload events broadcast so far.
    pub fn reloads_sent(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }
}

impl ReloadNotifier for ReloadHandle {
    fn notify_reload(&self) {
        ReloadHandle::notify_reload(self);
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub root: PathBuf,
    pub listen: SocketAddr,
    pub debounce: Duration,
}

pub struct DevServer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    address: SocketAddr,
    reload: ReloadHandle,
}

struct ServeState {
    root: PathBuf,
    events: broadcast::Sender<u64>,
    closing: watch::Receiver<bool>,
}

impl DevServer {
    pub fn start(options: ServerOptions) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (addr_tx, addr_rx) = mpsc::channel::<Result<SocketAddr, String>>();
        let (reload_tx, reload_rx) = async_mpsc::unbounded_channel();
        let sent = Arc::new(AtomicU64::new(0));
        let reload = ReloadHandle {
            tx: reload_tx,
            sent: sent.clone(),
        };

        let ServerOptions {
            root,
            listen,
            debounce,
        } = options;

        let thread = std::thread::spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    let _ = addr_tx.send(Err(format!("failed to build server runtime: {err}")));
                    return;
                }
            };

            runtime.block_on(async move {
                let (events, _) = broadcast::channel(16);
                let (closing_tx, closing_rx) = watch::channel(false);
                tokio::spawn(coalesce_reloads(reload_rx, events.clone(), debounce, sent));

                let state = Arc::new(ServeState {
                    root,
                    events,
                    closing: closing_rx,
                });
                let make_svc = make_service_fn(move |_| {
                    let state = state.clone();
                    async move {
                        Ok::<_, hyper::Error>(service_fn(move |req| {
                            let state = state.clone();
                            async move { handle_request(req, state).await }
                        }))
                    }
                });

                let builder = match hyper::Server::try_bind(&listen) {
                    Ok(builder) => builder,
                    Err(err) => {
                        let _ = addr_tx.send(Err(format!("failed to bind {listen}: {err}")));
                        return;
                    }
                };
                let server = builder.serve(make_svc);
                let _ = addr_tx.send(Ok(server.local_addr()));
                let graceful = server.with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                    let _ = closing_tx.send(true);
                });

                if let Err(err) = graceful.await {
                    error!(error = %err, "Dev server error");
                }
            });
        });

        let address = match addr_rx.recv() {
            Ok(Ok(address)) => address,
            Ok(Err(message)) => {
                let _ = thread.join();
                return Err(anyhow!(message));
            }
            Err(_) => {
                let _ = thread.join();
                return Err(anyhow!("dev server thread exited before binding"));
            }
        };
        info!(address = %address, "Dev server listening");

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
            address,
            reload,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn reload_handle(&self) -> ReloadHandle {
        self.reload.clone()
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            info!("Dev server stopped");
        }
    }
}

impl Drop for DevServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn coalesce_reloads(
    mut requests: async_mpsc::UnboundedReceiver<()>,
    events: broadcast::Sender<u64>,
    window: Duration,
    sent: Arc<AtomicU64>,
) {
    while requests.recv().await.is_some() {
        tokio::time::sleep(window).await;
        let mut coalesced = 1;
        while requests.try_recv().is_ok() {
            coalesced += 1;
        }
        let sequence = sent.fetch_add(1, Ordering::SeqCst) + 1;
        // No subscribers is fine: nobody has the page open.
        let _ = events.send(sequence);
        debug!(sequence, coalesced, "Reload broadcast");
    }
}

async fn handle_request(
    req: Request<Body>,
    state: Arc<ServeState>,
) -> Result<Response<Body>, hyper::Error> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return Ok(status(StatusCode::METHOD_NOT_ALLOWED));
    }
    let path = req.uri().path();
    if path == RELOAD_ENDPOINT {
        return Ok(event_stream(&state));
    }

    let Some(mut file) = resolve_request_path(&state.root, path) else {
        return Ok(status(StatusCode::NOT_FOUND));
    };
    if tokio::fs::metadata(&file)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
    {
        file.push("index.html");
    }

    match tokio::fs::read(&file).await {
        Ok(bytes) => {
            let content_type = content_type(&file);
            let body = if content_type.starts_with("text/html") {
                inject_reload_script(&String::from_utf8_lossy(&bytes)).into_bytes()
            } else {
                bytes
            };
            let body = if req.method() == Method::HEAD {
                Body::empty()
            } else {
                Body::from(body)
            };
            Ok(Response::builder()
                .header(CONTENT_TYPE, content_type)
                .header(CACHE_CONTROL, "no-cache")
                .body(body)
                .unwrap_or_else(|_| status(StatusCode::INTERNAL_SERVER_ERROR)))
        }
        Err(_) => Ok(status(StatusCode::NOT_FOUND)),
    }
}

fn event_stream(state: &ServeState) -> Response<Body> {
    let (mut sender, body) = Body::channel();
    let mut events = state.events.subscribe();
    let mut closing = state.closing.clone();

    tokio::spawn(async move {
        if sender
            .send_data(Bytes::from_static(b": connected\n\n"))
            .await
            .is_err()
        {
            return;
        }
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        let frame = Bytes::from_static(b"event: reload\ndata: reload\n\n");
                        if sender.send_data(frame).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = closing.changed() => break,
            }
        }
    });

    Response::builder()
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap_or_else(|_| status(StatusCode::INTERNAL_SERVER_ERROR))
}

fn status(code: StatusCode) -> Response<Body> {
    let mut response = Response::new(Body::from(
        code.canonical_reason().unwrap_or("Error").to_string(),
    ));
    *response.status_mut() = code;
    response
}

/// Maps a request path onto the served directory; `None` for anything that
/// would escape it.
fn resolve_request_path(root: &Path, uri_path: &str) -> Option<PathBuf> {
    let decoded = percent_decode(uri_path)?;
    let mut resolved = root.to_path_buf();
    for component in Path::new(decoded.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(resolved)
}

fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        if bytes[idx] == b'%' {
            let hex = input.get(idx + 1..idx + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            idx += 3;
        } else {
            out.push(bytes[idx]);
            idx += 1;
        }
    }
    String::from_utf8(out).ok()
}

fn inject_reload_script(html: &str) -> String {
    let script = RELOAD_SCRIPT.as_str();
    match html.to_ascii_lowercase().rfind("</body>") {
        Some(idx) => format!("{}{}{}", &html[..idx], script, &html[idx..]),
        None => format!("{html}{script}"),
    }
}

fn content_type(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" | "mjs" => "application/javascript; charset=utf-8",
        "json" | "map" => "application/json",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "eot" => "application/vnd.ms-fontobject",
        "txt" => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
