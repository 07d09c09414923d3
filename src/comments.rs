use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::backend::{server_timestamp, single_segment, KvBackend};
use crate::dates;
use crate::error::{Error, Result};
use crate::identity::CurrentUser;

pub const MAX_COMMENT_CHARS: usize = 1000;
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub date_key: String,
    pub author_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommentRecord {
    #[serde(default)]
    username: String,
    #[serde(default)]
    text: String,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    parent_id: Option<String>,
}

impl CommentRecord {
    fn into_comment(self, id: String, date_key: &str) -> Comment {
        Comment {
            id,
            date_key: date_key.to_string(),
            author_name: self.username,
            text: self.text,
            created_at: self
                .timestamp
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
                .unwrap_or_default(),
            parent_id: self.parent_id.filter(|p| !p.is_empty()),
        }
    }
}

struct CommentCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, Vec<Comment>)>>,
}

impl CommentCache {
    fn fresh(&self, date_key: &str) -> Option<Vec<Comment>> {
        let entries = self.entries.lock();
        match entries.get(date_key) {
            Some((at, comments)) if at.elapsed() < self.ttl => Some(comments.clone()),
            _ => None,
        }
    }

    fn store(&self, date_key: &str, comments: Vec<Comment>) {
        self.entries
            .lock()
            .insert(date_key.to_string(), (Instant::now(), comments));
    }

    fn invalidate(&self, date_key: &str) {
        self.entries.lock().remove(date_key);
    }
}

pub struct CommentThreadStore {
    backend: Arc<dyn KvBackend>,
    user: CurrentUser,
    cache: CommentCache,
}

impl CommentThreadStore {
    pub fn new(backend: Arc<dyn KvBackend>, user: CurrentUser, cache_ttl: Duration) -> Self {
        Self {
            backend,
            user,
            cache: CommentCache {
                ttl: cache_ttl.min(MAX_CACHE_TTL),
                entries: Mutex::new(HashMap::new()),
            },
        }
    }

    /// Comments for the day, oldest first. Empty when the store is unreachable.
    pub fn list(&self, date_key: &str) -> Vec<Comment> {
        let Some(key) = dates::storage_key(date_key) else {
            warn!("comments: ignoring list for malformed date {date_key:?}");
            return Vec::new();
        };
        if let Some(comments) = self.cache.fresh(&key) {
            return comments;
        }
        match self.fetch(&key) {
            Ok(comments) => {
                self.cache.store(&key, comments.clone());
                comments
            }
            Err(err) => {
                warn!("comments: list for {key} failed: {err}");
                Vec::new()
            }
        }
    }

    /// Uncached read that reports backend failures.
    pub fn fetch(&self, date_key: &str) -> Result<Vec<Comment>> {
        let key = storage_key(date_key)?;
        let value = self
            .backend
            .get(&format!("comments/{key}"))
            .with_context(|| format!("comments: read {key}"))?;
        Ok(decode_thread(value, &key))
    }

    /// Posts as the current display name.
    pub fn add(&self, date_key: &str, text: &str, parent_id: Option<&str>) -> Result<Comment> {
        self.add_as(&self.user.display_name(), date_key, text, parent_id)
    }

    pub fn add_as(
        &self,
        author_name: &str,
        date_key: &str,
        text: &str,
        parent_id: Option<&str>,
    ) -> Result<Comment> {
        let text = text.trim();
        if text.is_empty() {
            return Err(Error::validation("comment must not be empty"));
        }
        if text.chars().count() > MAX_COMMENT_CHARS {
            return Err(Error::validation(format!(
                "comment exceeds {MAX_COMMENT_CHARS} characters"
            )));
        }
        let key = storage_key(date_key)?;
        let parent_id = parent_id.map(str::trim).filter(|p| !p.is_empty());

        let mut record = json!({
            "username": author_name,
            "text": text,
            "timestamp": server_timestamp(),
        });
        if let Some(parent) = parent_id {
            record["parentId"] = Value::String(parent.to_string());
        }

        let path = format!("comments/{key}");
        let id = self
            .backend
            .push(&path, &record)
            .with_context(|| format!("comments: post to {key}"))?;
        self.cache.invalidate(&key);

        // The server fills in the timestamp, so read the stored record back.
        let stored = self.backend.get(&format!("{path}/{id}")).ok().flatten();
        let comment = match stored.map(serde_json::from_value::<CommentRecord>) {
            Some(Ok(record)) => record.into_comment(id, &key),
            _ => {
                debug!("comments: could not read back {key}/{id}, using local clock");
                Comment {
                    id,
                    date_key: key,
                    author_name: author_name.to_string(),
                    text: text.to_string(),
                    created_at: Utc::now(),
                    parent_id: parent_id.map(str::to_string),
                }
            }
        };
        Ok(comment)
    }

    /// Deletes unconditionally. Authorship is only checked by callers via `can_delete`.
    pub fn remove(&self, date_key: &str, comment_id: &str) -> Result<()> {
        let key = storage_key(date_key)?;
        let comment_id = single_segment(comment_id.trim())
            .map_err(|_| Error::validation(format!("malformed comment id {comment_id:?}")))?;
        let result = self
            .backend
            .remove(&format!("comments/{key}/{comment_id}"))
            .with_context(|| format!("comments: delete {key}/{comment_id}"));
        self.cache.invalidate(&key);
        result?;
        Ok(())
    }

    pub fn can_delete(&self, comment: &Comment) -> bool {
        is_authored_by(comment, &self.user.display_name())
    }
}

fn storage_key(date_key: &str) -> Result<String> {
    dates::storage_key(date_key)
        .ok_or_else(|| Error::validation(format!("unrecognised date {date_key:?}")))
}

fn decode_thread(value: Option<Value>, date_key: &str) -> Vec<Comment> {
    let Some(Value::Object(entries)) = value else {
        return Vec::new();
    };
    let mut comments: Vec<Comment> = entries
        .into_iter()
        .filter_map(
            |(id, raw)| match serde_json::from_value::<CommentRecord>(raw) {
                Ok(record) => Some(record.into_comment(id, date_key)),
                Err(err) => {
                    debug!("comments: skipping malformed {date_key}/{id}: {err}");
                    None
                }
            },
        )
        .collect();
    comments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    comments
}

pub fn is_authored_by(comment: &Comment, display_name: &str) -> bool {
    !display_name.is_empty() && comment.author_name == display_name
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Thread {
    pub root: Comment,
    pub replies: Vec<Comment>,
}

/// Groups a day's comments under their top-level ancestor. Replies to
/// replies land flat in the root's list; an unknown parent makes a root.
pub fn build_threads(comments: &[Comment]) -> Vec<Thread> {
    let by_id: HashMap<&str, &Comment> = comments.iter().map(|c| (c.id.as_str(), c)).collect();

    let root_of = |comment: &Comment| -> Option<String> {
        let mut seen = HashSet::new();
        seen.insert(comment.id.as_str());
        let mut current = comment;
        while let Some(parent) = current.parent_id.as_deref().and_then(|p| by_id.get(p).copied()) {
            if !seen.insert(parent.id.as_str()) {
                return None;
            }
            current = parent;
        }
        (current.id != comment.id).then(|| current.id.clone())
    };

    let mut threads: Vec<Thread> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut pending: Vec<(String, Comment)> = Vec::new();

    for comment in comments {
        match root_of(comment) {
            Some(root) => pending.push((root, comment.clone())),
            None => {
                index.insert(comment.id.clone(), threads.len());
                threads.push(Thread {
                    root: comment.clone(),
                    replies: Vec::new(),
                });
            }
        }
    }
    for (root, reply) in pending {
        match index.get(&root) {
            Some(&i) => threads[i].replies.push(reply),
            None => {
                index.insert(reply.id.clone(), threads.len());
                threads.push(Thread {
                    root: reply,
                    replies: Vec::new(),
                });
            }
        }
    }
    threads
}

/// The newest `n` comments, still oldest first.
pub fn recent(comments: &[Comment], n: usize) -> &[Comment] {
    &comments[comments.len().saturating_sub(n)..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::identity::Profile;

    fn store(backend: Arc<MemoryBackend>, name: &str) -> CommentThreadStore {
        let user = CurrentUser::new(Profile::new("user_1", name, None));
        CommentThreadStore::new(backend, user, Duration::from_secs(30))
    }

    fn comment(id: &str, parent: Option<&str>) -> Comment {
        Comment {
            id: id.into(),
            date_key: "2023-01-15".into(),
            author_name: "Jon".into(),
            text: id.into(),
            created_at: DateTime::<Utc>::default(),
            parent_id: parent.map(str::to_string),
        }
    }

    #[test]
    fn text_limits() {
        let comments = store(Arc::new(MemoryBackend::new()), "Jon");
        assert!(comments
            .add("2023-01-15", "   ", None)
            .unwrap_err()
            .is_validation());
        assert!(comments
            .add("2023-01-15", &"a".repeat(1001), None)
            .unwrap_err()
            .is_validation());
        let ok = comments.add("2023-01-15", &"a".repeat(1000), None).unwrap();
        assert_eq!(ok.text.len(), 1000);
        assert!(comments.add("not a date", "hi", None).unwrap_err().is_validation());
    }

    #[test]
    fn add_then_list_in_server_order() {
        let backend = Arc::new(MemoryBackend::new());
        let comments = store(backend.clone(), "Jon");
        let first = comments.add("01/15/2023", " first ", None).unwrap();
        let reply = comments
            .add("2023/01/15", "second", Some(&first.id))
            .unwrap();
        assert_eq!(first.text, "first");
        assert_eq!(first.date_key, "2023-01-15");
        assert!(reply.created_at > first.created_at);
        assert_eq!(reply.parent_id.as_deref(), Some(first.id.as_str()));

        let listed = comments.list("2023-01-15");
        assert_eq!(listed, vec![first.clone(), reply]);
        assert!(comments.can_delete(&first));

        let raw = backend
            .get(&format!("comments/2023-01-15/{}", first.id))
            .unwrap()
            .unwrap();
        assert_eq!(raw["username"], json!("Jon"));
        assert!(raw["timestamp"].is_number());
    }

    #[test]
    fn list_is_cached_until_a_local_write() {
        let backend = Arc::new(MemoryBackend::new());
        let comments = store(backend.clone(), "Jon");
        comments.add("2023-01-15", "one", None).unwrap();
        assert_eq!(comments.list("2023-01-15").len(), 1);

        backend
            .push(
                "comments/2023-01-15",
                &json!({"username": "Liz", "text": "elsewhere", "timestamp": 1}),
            )
            .unwrap();
        assert_eq!(comments.list("2023-01-15").len(), 1);

        let mine = comments.add("2023-01-15", "two", None).unwrap();
        assert_eq!(comments.list("2023-01-15").len(), 3);

        comments.remove("2023-01-15", &mine.id).unwrap();
        assert_eq!(comments.list("2023-01-15").len(), 2);
    }

    #[test]
    fn outages_degrade_reads_and_fail_writes() {
        let backend = Arc::new(MemoryBackend::new());
        let comments = store(backend.clone(), "Jon");
        backend.set_offline(true);
        assert!(comments.list("2023-01-15").is_empty());
        assert!(comments.fetch("2023-01-15").unwrap_err().is_storage());
        assert!(comments.add("2023-01-15", "hi", None).unwrap_err().is_storage());
        assert!(comments.remove("2023-01-15", "abc").unwrap_err().is_storage());
    }

    #[test]
    fn remove_rejects_ids_that_are_not_one_key() {
        let backend = Arc::new(MemoryBackend::new());
        let comments = store(backend.clone(), "Jon");
        let first = comments.add("2023-01-15", "one", None).unwrap();
        comments.add("2023-01-15", "two", None).unwrap();

        let field = format!("{}/text", first.id);
        for bad in ["/", "", "  ", field.as_str(), "a.b"] {
            assert!(
                comments.remove("2023-01-15", bad).unwrap_err().is_validation(),
                "{bad:?} accepted"
            );
        }
        let listed = comments.fetch("2023-01-15").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].text, "one");
    }

    #[test]
    fn aged_cache_entries_are_refetched() {
        let backend = Arc::new(MemoryBackend::new());
        let user = CurrentUser::new(Profile::new("user_1", "Jon", None));
        let comments = CommentThreadStore::new(backend.clone(), user, Duration::from_millis(50));
        comments.add("2023-01-15", "one", None).unwrap();
        assert_eq!(comments.list("2023-01-15").len(), 1);

        backend
            .push(
                "comments/2023-01-15",
                &json!({"username": "Liz", "text": "elsewhere", "timestamp": server_timestamp()}),
            )
            .unwrap();
        assert_eq!(comments.list("2023-01-15").len(), 1);

        std::thread::sleep(Duration::from_millis(120));
        let listed = comments.list("2023-01-15");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].author_name, "Liz");
    }

    #[test]
    fn ttl_is_capped() {
        let user = CurrentUser::new(Profile::new("u", "n", None));
        let comments =
            CommentThreadStore::new(Arc::new(MemoryBackend::new()), user, Duration::from_secs(600));
        assert_eq!(comments.cache.ttl, MAX_CACHE_TTL);
    }

    #[test]
    fn authorship_follows_display_name() {
        let c = comment("a", None);
        assert!(is_authored_by(&c, "Jon"));
        assert!(!is_authored_by(&c, "Liz"));
        assert!(!is_authored_by(&comment("b", None), ""));
    }

    #[test]
    fn broken_parent_becomes_root() {
        let list = vec![comment("a", None), comment("b", Some("missing"))];
        let threads = build_threads(&list);
        assert_eq!(threads.len(), 2);
        assert_eq!(threads[1].root.id, "b");
    }

    #[test]
    fn nested_replies_flatten_under_root() {
        let list = vec![
            comment("a", None),
            comment("b", Some("a")),
            comment("c", Some("b")),
            comment("d", None),
        ];
        let threads = build_threads(&list);
        assert_eq!(threads.len(), 2);
        let replies: Vec<_> = threads[0].replies.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(replies, vec!["b", "c"]);
        assert!(threads[1].replies.is_empty());
    }

    #[test]
    fn parent_cycles_are_not_dropped() {
        let list = vec![comment("a", Some("b")), comment("b", Some("a"))];
        let threads = build_threads(&list);
        let total: usize = threads.iter().map(|t| 1 + t.replies.len()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn recent_keeps_tail() {
        let list: Vec<_> = ["a", "b", "c"].iter().map(|id| comment(id, None)).collect();
        let ids: Vec<_> = recent(&list, 2).iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(recent(&list, 10).len(), 3);
    }
}
