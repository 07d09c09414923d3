//! Hierarchical key-value store holding favorites, comments and profiles.
//!
//! Paths are slash separated (`favorites/{user}/{date}`) and values are JSON.
//! The hosted store is addressed over its REST surface; `MemoryBackend` keeps
//! the same tree in process for offline use and tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use url::Url;

const PUSH_ALPHABET: &[u8] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";

pub trait KvBackend: Send + Sync {
    /// Value at `path`, `None` when nothing is stored there.
    fn get(&self, path: &str) -> Result<Option<Value>>;
    fn set(&self, path: &str, value: &Value) -> Result<()>;
    /// Stores `value` under a freshly generated child key of `path` and returns the key.
    fn push(&self, path: &str, value: &Value) -> Result<String>;
    fn remove(&self, path: &str) -> Result<()>;
}

/// Placeholder the backend replaces with its own clock, in epoch milliseconds.
pub fn server_timestamp() -> Value {
    json!({ ".sv": "timestamp" })
}

fn is_server_timestamp(value: &Value) -> bool {
    value
        .as_object()
        .map(|obj| obj.len() == 1 && obj.get(".sv").and_then(Value::as_str) == Some("timestamp"))
        .unwrap_or(false)
}

const RESERVED: &[char] = &['/', '.', '#', '$', '[', ']', '?', '%'];

/// Checks that caller supplied text names exactly one child node.
pub fn single_segment(value: &str) -> Result<&str> {
    if value.is_empty() {
        bail!("backend: empty key");
    }
    if value.contains(RESERVED) {
        bail!("backend: invalid key {value:?}");
    }
    Ok(value)
}

/// Splits `path` into node names. The empty path is the root; any other
/// empty segment is rejected so a malformed path never lands on a parent.
fn segments(path: &str) -> Result<Vec<&str>> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    path.split('/')
        .map(|part| {
            if part.is_empty() {
                bail!("backend: empty segment in {path:?}");
            }
            single_segment(part)
        })
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct RestConfig {
    pub base_url: String,
    pub auth: Option<String>,
    pub timeout: Option<Duration>,
    pub http_client: Option<HttpClient>,
}

pub struct RestBackend {
    http: HttpClient,
    base_url: Url,
    auth: Option<String>,
}

#[derive(Deserialize)]
struct PushResponse {
    name: String,
}

impl RestBackend {
    pub fn new(config: RestConfig) -> Result<Self> {
        let base = config.base_url.trim();
        if base.is_empty() {
            bail!("backend: base url required");
        }
        let mut base_url = Url::parse(base).context("backend: parse base url")?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let http = match config.http_client {
            Some(client) => client,
            None => HttpClient::builder()
                .timeout(config.timeout.unwrap_or(Duration::from_secs(20)))
                .build()
                .context("backend: build http client")?,
        };

        Ok(Self {
            http,
            base_url,
            auth: config.auth.filter(|a| !a.is_empty()),
        })
    }

    fn url(&self, path: &str) -> Result<Url> {
        let joined = format!("{}.json", segments(path)?.join("/"));
        let mut url = self.base_url.join(&joined)?;
        if let Some(auth) = &self.auth {
            url.query_pairs_mut().append_pair("auth", auth);
        }
        Ok(url)
    }

    fn check(resp: reqwest::blocking::Response, op: &str) -> Result<reqwest::blocking::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().unwrap_or_default();
        match status.as_u16() {
            401 | 403 => Err(anyhow!("backend: {op} denied: {}", body.trim())),
            _ => Err(anyhow!("backend: {op} failed {}: {}", status, body.trim())),
        }
    }
}

impl KvBackend for RestBackend {
    fn get(&self, path: &str) -> Result<Option<Value>> {
        let resp = self
            .http
            .get(self.url(path)?)
            .send()
            .with_context(|| format!("backend: read {path}"))?;
        let value: Value = Self::check(resp, "read")?
            .json()
            .with_context(|| format!("backend: decode {path}"))?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    fn set(&self, path: &str, value: &Value) -> Result<()> {
        let resp = self
            .http
            .put(self.url(path)?)
            .header(CONTENT_TYPE, "application/json")
            .json(value)
            .send()
            .with_context(|| format!("backend: write {path}"))?;
        Self::check(resp, "write")?;
        Ok(())
    }

    fn push(&self, path: &str, value: &Value) -> Result<String> {
        let resp = self
            .http
            .post(self.url(path)?)
            .header(CONTENT_TYPE, "application/json")
            .json(value)
            .send()
            .with_context(|| format!("backend: push {path}"))?;
        let created: PushResponse = Self::check(resp, "push")?
            .json()
            .context("backend: decode push response")?;
        Ok(created.name)
    }

    fn remove(&self, path: &str) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(path)?)
            .send()
            .with_context(|| format!("backend: delete {path}"))?;
        Self::check(resp, "delete")?;
        Ok(())
    }
}

#[derive(Default)]
struct Tree {
    root: Map<String, Value>,
    last_timestamp: i64,
    last_push: Option<(i64, [u8; 12])>,
}

/// In-process tree with the hosted store's semantics: empty objects vanish,
/// server timestamps strictly increase, push keys sort chronologically.
#[derive(Default)]
pub struct MemoryBackend {
    tree: Mutex<Tree>,
    offline: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// While offline every operation fails, as if the network were down.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn ensure_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            bail!("backend: store unreachable");
        }
        Ok(())
    }
}

impl Tree {
    fn now_millis(&mut self) -> i64 {
        let now = Utc::now().timestamp_millis().max(self.last_timestamp + 1);
        self.last_timestamp = now;
        now
    }

    fn resolve(&mut self, value: &Value) -> Option<Value> {
        if is_server_timestamp(value) {
            return Some(Value::from(self.now_millis()));
        }
        match value {
            Value::Null => None,
            Value::Object(map) => {
                let resolved: Map<String, Value> = map
                    .iter()
                    .filter_map(|(k, v)| self.resolve(v).map(|v| (k.clone(), v)))
                    .collect();
                if resolved.is_empty() {
                    None
                } else {
                    Some(Value::Object(resolved))
                }
            }
            other => Some(other.clone()),
        }
    }

    fn get(&self, parts: &[&str]) -> Option<&Value> {
        let (first, rest) = parts.split_first()?;
        let mut node = self.root.get(*first)?;
        for part in rest {
            node = node.as_object()?.get(*part)?;
        }
        Some(node)
    }

    fn set(&mut self, parts: &[&str], value: Option<Value>) {
        let Some((last, parents)) = parts.split_last() else {
            if let Some(Value::Object(map)) = value {
                self.root = map;
            } else {
                self.root.clear();
            }
            return;
        };
        set_in(&mut self.root, parents, last, value);
    }

    fn push_key(&mut self) -> String {
        let now = Utc::now().timestamp_millis();
        let random = match self.last_push {
            Some((at, mut prev)) if at == now => {
                for byte in prev.iter_mut().rev() {
                    if *byte < 63 {
                        *byte += 1;
                        break;
                    }
                    *byte = 0;
                }
                prev
            }
            _ => {
                let mut rng = rand::thread_rng();
                let mut fresh = [0u8; 12];
                for byte in fresh.iter_mut() {
                    *byte = rng.gen_range(0..64);
                }
                fresh
            }
        };
        self.last_push = Some((now, random));

        let mut key = Vec::with_capacity(20);
        let mut ts = now;
        let mut time_chars = [0u8; 8];
        for slot in time_chars.iter_mut().rev() {
            *slot = PUSH_ALPHABET[(ts % 64) as usize];
            ts /= 64;
        }
        key.extend_from_slice(&time_chars);
        key.extend(random.iter().map(|&b| PUSH_ALPHABET[b as usize]));
        String::from_utf8_lossy(&key).into_owned()
    }
}

fn set_in(node: &mut Map<String, Value>, parents: &[&str], last: &str, value: Option<Value>) {
    match parents.split_first() {
        None => match value {
            Some(value) => {
                node.insert(last.to_string(), value);
            }
            None => {
                node.remove(last);
            }
        },
        Some((head, rest)) => {
            if value.is_none() && !node.contains_key(*head) {
                return;
            }
            let child = node
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            if let Value::Object(map) = child {
                set_in(map, rest, last, value);
                if map.is_empty() {
                    node.remove(*head);
                }
            }
        }
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, path: &str) -> Result<Option<Value>> {
        self.ensure_online()?;
        let parts = segments(path)?;
        let tree = self.tree.lock();
        if parts.is_empty() {
            return Ok(Some(Value::Object(tree.root.clone())).filter(|v| !is_empty_object(v)));
        }
        Ok(tree.get(&parts).cloned())
    }

    fn set(&self, path: &str, value: &Value) -> Result<()> {
        self.ensure_online()?;
        let parts = segments(path)?;
        let mut tree = self.tree.lock();
        let resolved = tree.resolve(value);
        tree.set(&parts, resolved);
        Ok(())
    }

    fn push(&self, path: &str, value: &Value) -> Result<String> {
        self.ensure_online()?;
        segments(path)?;
        let mut tree = self.tree.lock();
        let key = tree.push_key();
        let full = format!("{path}/{key}");
        let resolved = tree.resolve(value);
        tree.set(&segments(&full)?, resolved);
        Ok(key)
    }

    fn remove(&self, path: &str) -> Result<()> {
        self.ensure_online()?;
        let parts = segments(path)?;
        self.tree.lock().set(&parts, None);
        Ok(())
    }
}

fn is_empty_object(value: &Value) -> bool {
    value.as_object().map(Map::is_empty).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_set_get_remove() {
        let backend = MemoryBackend::new();
        backend
            .set("favorites/u1/2023-01-15", &json!({"date": "2023-01-15", "src": "a"}))
            .unwrap();
        assert_eq!(
            backend.get("favorites/u1/2023-01-15/src").unwrap(),
            Some(json!("a"))
        );
        assert!(backend.get("favorites/u1").unwrap().unwrap().is_object());

        backend.remove("favorites/u1/2023-01-15").unwrap();
        assert_eq!(backend.get("favorites/u1").unwrap(), None);
        assert_eq!(backend.get("favorites").unwrap(), None);
        backend.remove("favorites/nobody/2023-01-01").unwrap();
    }

    #[test]
    fn push_keys_sort_and_timestamps_increase() {
        let backend = MemoryBackend::new();
        let mut keys = Vec::new();
        for n in 0..20 {
            keys.push(
                backend
                    .push("comments/2023-01-15", &json!({"n": n, "timestamp": server_timestamp()}))
                    .unwrap(),
            );
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
        assert!(keys.iter().all(|k| k.len() == 20));

        let stamps: Vec<i64> = keys
            .iter()
            .map(|k| {
                backend
                    .get(&format!("comments/2023-01-15/{k}/timestamp"))
                    .unwrap()
                    .and_then(|v| v.as_i64())
                    .unwrap()
            })
            .collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn offline_fails_every_operation() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);
        assert!(backend.get("users").is_err());
        assert!(backend.set("users/u1", &json!({"username": "x"})).is_err());
        assert!(backend.remove("users/u1").is_err());
        backend.set_offline(false);
        assert!(backend.get("users").unwrap().is_none());
    }

    #[test]
    fn rejects_reserved_characters() {
        let backend = MemoryBackend::new();
        assert!(backend.set("favorites/a.b", &json!(1)).is_err());
        assert!(backend.set("users/a?b", &json!(1)).is_err());
        assert!(backend.set("users/a%2F", &json!(1)).is_err());
    }

    #[test]
    fn empty_segments_never_reach_the_parent() {
        let backend = MemoryBackend::new();
        backend.set("favorites/u1/2023-01-15", &json!({"src": "a"})).unwrap();
        backend.set("favorites/u2/2023-01-16", &json!({"src": "b"})).unwrap();

        assert!(backend.remove("favorites/u1//").is_err());
        assert!(backend.remove("favorites//2023-01-15").is_err());
        assert!(backend.remove("favorites/u1/").is_err());
        assert!(backend.get("/favorites").is_err());

        assert!(backend.get("favorites/u1/2023-01-15").unwrap().is_some());
        assert!(backend.get("favorites/u2/2023-01-16").unwrap().is_some());
    }

    #[test]
    fn single_segment_checks_keys() {
        assert_eq!(single_segment("user_0a1b").unwrap(), "user_0a1b");
        assert_eq!(single_segment("-NxYz_09").unwrap(), "-NxYz_09");
        for bad in ["", "/", "a/b", "a?auth=x", "50%", "a.b", "#", "$x", "[0]"] {
            assert!(single_segment(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn rest_urls_carry_auth() {
        let backend = RestBackend::new(RestConfig {
            base_url: "https://db.example.test/root".into(),
            auth: Some("secret".into()),
            ..Default::default()
        })
        .unwrap();
        let url = backend.url("comments/2023-01-15").unwrap();
        assert_eq!(
            url.as_str(),
            "https://db.example.test/root/comments/2023-01-15.json?auth=secret"
        );
    }
}
