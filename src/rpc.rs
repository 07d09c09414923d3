use std::io::Read;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use serde_json::{json, Map, Value};
use tiny_http::{Header, Method, Response, Server};
use url::Url;

use crate::backend::{server_timestamp, single_segment, KvBackend};
use crate::comic::PageFetcher;
use crate::comments::CommentThreadStore;
use crate::dates;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcStatus {
    InvalidArgument,
    NotFound,
    Internal,
}

impl RpcStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RpcStatus::InvalidArgument => "INVALID_ARGUMENT",
            RpcStatus::NotFound => "NOT_FOUND",
            RpcStatus::Internal => "INTERNAL",
        }
    }

    pub fn http_code(self) -> u16 {
        match self {
            RpcStatus::InvalidArgument => 400,
            RpcStatus::NotFound => 404,
            RpcStatus::Internal => 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub status: RpcStatus,
    pub message: String,
}

impl RpcError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: RpcStatus::InvalidArgument,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: RpcStatus::Internal,
            message: message.into(),
        }
    }

    /// Validation problems are the caller's; everything else is hidden behind `failure`.
    fn from_store(err: Error, failure: &str) -> Self {
        match err {
            Error::Validation(message) => Self::invalid(message),
            other => {
                error!("rpc: {failure} {other}");
                Self::internal(failure)
            }
        }
    }
}

const MISSING: &str = "Missing required parameters.";

/// Server-side procedures over the shared store.
pub struct Procedures {
    backend: Arc<dyn KvBackend>,
    comments: Arc<CommentThreadStore>,
}

impl Procedures {
    pub fn new(backend: Arc<dyn KvBackend>, comments: Arc<CommentThreadStore>) -> Self {
        Self { backend, comments }
    }

    pub fn call(&self, name: &str, data: &Value) -> Result<Value, RpcError> {
        debug!("rpc: call {name}");
        match name {
            "helloWorld" => Ok(json!({"message": "Hello from comic-daily!"})),
            "addComment" => self.add_comment(data),
            "getComments" => self.get_comments(data),
            "addFavorite" => self.add_favorite(data),
            "getFavorites" => self.get_favorites(data),
            "removeFavorite" => self.remove_favorite(data),
            other => Err(RpcError {
                status: RpcStatus::NotFound,
                message: format!("Unknown procedure {other}."),
            }),
        }
    }

    fn add_comment(&self, data: &Value) -> Result<Value, RpcError> {
        let (Some(date), Some(text), Some(username)) = (
            field(data, "comicDate"),
            field(data, "commentText"),
            field(data, "username"),
        ) else {
            return Err(RpcError::invalid(MISSING));
        };
        let parent = field(data, "parentId");
        let comment = self
            .comments
            .add_as(username, date, text, parent)
            .map_err(|err| RpcError::from_store(err, "Failed to add comment."))?;
        Ok(json!({"success": true, "commentId": comment.id}))
    }

    fn get_comments(&self, data: &Value) -> Result<Value, RpcError> {
        let Some(date) = field(data, "comicDate") else {
            return Err(RpcError::invalid("Missing comicDate parameter."));
        };
        let comments = self
            .comments
            .fetch(date)
            .map_err(|err| RpcError::from_store(err, "Failed to get comments."))?;
        let comments: Vec<Value> = comments
            .into_iter()
            .map(|c| {
                let mut entry = json!({
                    "id": c.id,
                    "username": c.author_name,
                    "text": c.text,
                    "timestamp": c.created_at.timestamp_millis(),
                });
                if let Some(parent) = c.parent_id {
                    entry["parentId"] = Value::String(parent);
                }
                entry
            })
            .collect();
        Ok(json!({"success": true, "comments": comments}))
    }

    fn add_favorite(&self, data: &Value) -> Result<Value, RpcError> {
        let comic = data.get("comicData");
        let (Some(comic), Some(username)) = (comic, field(data, "username")) else {
            return Err(RpcError::invalid(MISSING));
        };
        let username = user_key(username)?;
        let (Some(date), Some(src)) = (field(comic, "date"), field(comic, "src")) else {
            return Err(RpcError::invalid(MISSING));
        };
        let key = dates::storage_key(date)
            .ok_or_else(|| RpcError::invalid(format!("Invalid date {date:?}.")))?;

        let record = json!({"date": key, "src": src, "added": server_timestamp()});
        self.backend
            .set(&format!("favorites/{username}/{key}"), &record)
            .map_err(|err| RpcError::from_store(err.into(), "Failed to add favorite."))?;
        Ok(json!({"success": true}))
    }

    fn get_favorites(&self, data: &Value) -> Result<Value, RpcError> {
        let Some(username) = field(data, "username") else {
            return Err(RpcError::invalid("Missing username parameter."));
        };
        let username = user_key(username)?;
        let value = self
            .backend
            .get(&format!("favorites/{username}"))
            .map_err(|err| RpcError::from_store(err.into(), "Failed to get favorites."))?;
        Ok(value.unwrap_or_else(|| Value::Object(Map::new())))
    }

    fn remove_favorite(&self, data: &Value) -> Result<Value, RpcError> {
        let (Some(date), Some(username)) = (field(data, "comicDate"), field(data, "username"))
        else {
            return Err(RpcError::invalid(MISSING));
        };
        let username = user_key(username)?;
        let key = dates::storage_key(date)
            .ok_or_else(|| RpcError::invalid(format!("Invalid date {date:?}.")))?;
        self.backend
            .remove(&format!("favorites/{username}/{key}"))
            .map_err(|err| RpcError::from_store(err.into(), "Failed to remove favorite."))?;
        Ok(json!({"success": true}))
    }
}

fn user_key(username: &str) -> Result<&str, RpcError> {
    single_segment(username)
        .map_err(|_| RpcError::invalid(format!("Invalid username {username:?}.")))
}

fn field<'a>(data: &'a Value, name: &str) -> Option<&'a str> {
    data.get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Relays upstream pages for the first-party transport, restricted to the comic site.
pub struct PageProxy {
    site_host: String,
    fetcher: Arc<dyn PageFetcher>,
}

impl PageProxy {
    pub fn new(site: &str, fetcher: Arc<dyn PageFetcher>) -> Result<Self> {
        let site = Url::parse(site)?;
        let host = site
            .host_str()
            .ok_or_else(|| anyhow!("rpc: site {site} has no host"))?;
        Ok(Self {
            site_host: bare_host(host).to_string(),
            fetcher,
        })
    }

    fn relay(&self, target: &str) -> Reply {
        let allowed = Url::parse(target)
            .ok()
            .filter(|url| matches!(url.scheme(), "http" | "https"))
            .and_then(|url| url.host_str().map(|h| bare_host(h) == self.site_host))
            .unwrap_or(false);
        if !allowed {
            warn!("rpc: proxy refused {target}");
            return Reply::text(403, "host not allowed");
        }
        match self.fetcher.fetch(target) {
            Ok(page) if (200..300).contains(&page.status) => Reply {
                status: 200,
                content_type: "text/html; charset=utf-8",
                body: page.body,
            },
            Ok(page) => Reply::text(502, format!("upstream returned {}", page.status)),
            Err(err) => {
                warn!("rpc: proxy fetch {target} failed: {err:#}");
                Reply::text(502, "upstream unreachable")
            }
        }
    }
}

fn bare_host(host: &str) -> &str {
    host.strip_prefix("www.").unwrap_or(host)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl Reply {
    fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain; charset=utf-8",
            body: body.into(),
        }
    }

    fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    fn rpc_error(err: RpcError) -> Self {
        Self::json(
            err.status.http_code(),
            json!({"error": {"status": err.status.as_str(), "message": err.message}}),
        )
    }
}

pub struct Router {
    procedures: Procedures,
    proxy: PageProxy,
}

impl Router {
    pub fn new(procedures: Procedures, proxy: PageProxy) -> Self {
        Self { procedures, proxy }
    }

    pub fn dispatch(&self, method: &Method, raw_url: &str, body: &str) -> Reply {
        let url = match Url::parse(&format!("http://localhost{raw_url}")) {
            Ok(url) => url,
            Err(_) => return Reply::text(400, "bad request"),
        };
        let path = url.path().trim_start_matches('/');

        if path == "proxy" {
            if method != &Method::Get {
                return Reply::text(405, "method not allowed");
            }
            return match url.query_pairs().find(|(k, _)| k == "url") {
                Some((_, target)) => self.proxy.relay(&target),
                None => Reply::text(400, "url parameter missing"),
            };
        }

        if method != &Method::Post {
            return Reply::text(405, "method not allowed");
        }
        let data = if body.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            match serde_json::from_str::<Value>(body) {
                Ok(mut envelope) => envelope
                    .get_mut("data")
                    .map(Value::take)
                    .unwrap_or_else(|| Value::Object(Map::new())),
                Err(_) => {
                    return Reply::rpc_error(RpcError::invalid("Request body must be JSON."))
                }
            }
        };
        match self.procedures.call(path, &data) {
            Ok(result) => Reply::json(200, json!({ "result": result })),
            Err(err) => Reply::rpc_error(err),
        }
    }
}

pub struct RpcServer {
    server: Arc<Server>,
    addr: String,
    worker: Option<JoinHandle<()>>,
}

impl RpcServer {
    pub fn start(listen: &str, router: Router) -> Result<Self> {
        let server =
            Arc::new(Server::http(listen).map_err(|err| anyhow!("rpc: listen on {listen}: {err}"))?);
        let addr = server.server_addr().to_string();
        info!("rpc: listening on {addr}");

        let incoming = Arc::clone(&server);
        let worker = thread::spawn(move || {
            for request in incoming.incoming_requests() {
                handle(&router, request);
            }
            debug!("rpc: request loop finished");
        });

        Ok(Self {
            server,
            addr,
            worker: Some(worker),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Blocks until the request loop ends.
    pub fn wait(mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.server.unblock();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn handle(router: &Router, mut request: tiny_http::Request) {
    let mut body = String::new();
    if let Err(err) = request.as_reader().read_to_string(&mut body) {
        let _ = request.respond(Response::from_string("unreadable body").with_status_code(400));
        debug!("rpc: read body failed: {err}");
        return;
    }
    let reply = router.dispatch(request.method(), request.url(), &body);
    let mut response = Response::from_string(reply.body).with_status_code(reply.status);
    if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], reply.content_type.as_bytes()) {
        response = response.with_header(header);
    }
    if let Ok(header) = Header::from_bytes(&b"Access-Control-Allow-Origin"[..], &b"*"[..]) {
        response = response.with_header(header);
    }
    let _ = request.respond(response);
}
