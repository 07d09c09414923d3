use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::{single_segment, KvBackend};
use crate::dates;
use crate::error::{Error, Result};
use crate::identity::CurrentUser;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Favorite {
    pub date_key: String,
    pub image_url: String,
    pub added_at: Option<DateTime<Utc>>,
}

/// Clients write ISO-8601 strings, the server procedures write epoch millis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum AddedAt {
    Millis(i64),
    Text(String),
}

impl AddedAt {
    fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            AddedAt::Millis(ms) => Utc.timestamp_millis_opt(*ms).single(),
            AddedAt::Text(text) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|dt| dt.with_timezone(&Utc)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FavoriteRecord {
    #[serde(default)]
    date: String,
    #[serde(default)]
    src: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    added: Option<AddedAt>,
}

impl FavoriteRecord {
    fn into_favorite(self, key: &str) -> Favorite {
        Favorite {
            date_key: key.to_string(),
            image_url: self.src,
            added_at: self.added.as_ref().and_then(AddedAt::to_datetime),
        }
    }
}

struct CountCache {
    ttl: Duration,
    tally: Mutex<Option<(Instant, HashMap<String, u64>)>>,
}

impl CountCache {
    fn fresh(&self) -> Option<HashMap<String, u64>> {
        let tally = self.tally.lock();
        match tally.as_ref() {
            Some((at, counts)) if at.elapsed() < self.ttl => Some(counts.clone()),
            _ => None,
        }
    }

    fn store(&self, counts: HashMap<String, u64>) {
        *self.tally.lock() = Some((Instant::now(), counts));
    }

    fn invalidate(&self) {
        self.tally.lock().take();
    }
}

pub struct FavoritesStore {
    backend: Arc<dyn KvBackend>,
    user: CurrentUser,
    counts: CountCache,
}

impl FavoritesStore {
    pub fn new(backend: Arc<dyn KvBackend>, user: CurrentUser, count_ttl: Duration) -> Self {
        Self {
            backend,
            user,
            counts: CountCache {
                ttl: count_ttl,
                tally: Mutex::new(None),
            },
        }
    }

    fn user_path(user_id: &str) -> String {
        format!("favorites/{user_id}")
    }

    /// Favorites of the current identity keyed by date key. Empty when the store is unreachable.
    pub fn list(&self) -> BTreeMap<String, Favorite> {
        let user_id = self.user.user_id();
        match self.fetch_user(&user_id) {
            Ok(favorites) => favorites,
            Err(err) => {
                warn!("favorites: list for {user_id} failed: {err:#}");
                BTreeMap::new()
            }
        }
    }

    fn fetch_user(&self, user_id: &str) -> anyhow::Result<BTreeMap<String, Favorite>> {
        let value = self
            .backend
            .get(&Self::user_path(user_id))
            .context("favorites: read collection")?;
        Ok(decode_collection(value))
    }

    pub fn is_favorite(&self, date_key: &str) -> bool {
        let Some(key) = dates::storage_key(date_key) else {
            return false;
        };
        let path = format!("{}/{key}", Self::user_path(&self.user.user_id()));
        match self.backend.get(&path) {
            Ok(value) => value.is_some(),
            Err(err) => {
                warn!("favorites: lookup of {key} failed: {err:#}");
                false
            }
        }
    }

    /// Records `image_url` as a favorite for the day. Failures reach the caller.
    pub fn add(&self, date_key: &str, image_url: &str) -> Result<Favorite> {
        let key = dates::storage_key(date_key)
            .ok_or_else(|| Error::validation(format!("unrecognised date {date_key:?}")))?;
        let image_url = image_url.trim();
        if image_url.is_empty() {
            return Err(Error::validation("favorite needs an image url"));
        }

        let added_at = Utc::now();
        let record = FavoriteRecord {
            date: key.clone(),
            src: image_url.to_string(),
            added: Some(AddedAt::Text(
                added_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
        };
        let value = serde_json::to_value(&record).context("favorites: encode record")?;
        let path = format!("{}/{key}", Self::user_path(&self.user.user_id()));
        self.backend
            .set(&path, &value)
            .with_context(|| format!("favorites: write {key}"))?;
        self.counts.invalidate();

        Ok(Favorite {
            date_key: key,
            image_url: image_url.to_string(),
            added_at: Some(added_at),
        })
    }

    /// `false` when nothing was stored under the key or the delete failed.
    pub fn remove(&self, date_key: &str) -> bool {
        let Some(key) = dates::storage_key(date_key) else {
            return false;
        };
        let path = format!("{}/{key}", Self::user_path(&self.user.user_id()));

        let removed = self
            .backend
            .get(&path)
            .and_then(|existing| match existing {
                Some(_) => self.backend.remove(&path).map(|_| true),
                None => Ok(false),
            });
        match removed {
            Ok(removed) => {
                if removed {
                    self.counts.invalidate();
                }
                removed
            }
            Err(err) => {
                warn!("favorites: remove {key} failed: {err:#}");
                false
            }
        }
    }

    /// Number of identities that favorited the day. Reads every user's
    /// collection, so the tally is kept until it ages out or `force_refresh`.
    pub fn count_for_date(&self, date_key: &str, force_refresh: bool) -> u64 {
        let Some(key) = dates::storage_key(date_key) else {
            return 0;
        };
        if !force_refresh {
            if let Some(counts) = self.counts.fresh() {
                return counts.get(&key).copied().unwrap_or(0);
            }
        }

        match self.backend.get("favorites") {
            Ok(value) => {
                let counts = tally(value);
                let count = counts.get(&key).copied().unwrap_or(0);
                self.counts.store(counts);
                count
            }
            Err(err) => {
                warn!("favorites: count for {key} failed: {err:#}");
                0
            }
        }
    }

    /// Copies every favorite of `old_user_id` into `new_user_id`, keeping
    /// entries the new identity already has. The old collection is left alone.
    pub fn migrate(&self, old_user_id: &str, new_user_id: &str) -> Result<usize> {
        for user_id in [old_user_id, new_user_id] {
            single_segment(user_id).map_err(|err| Error::validation(err.to_string()))?;
        }
        if old_user_id == new_user_id {
            return Ok(0);
        }
        let source = self.fetch_user(old_user_id)?;
        let existing = self.fetch_user(new_user_id)?;

        let mut copied = 0;
        for (key, favorite) in source {
            if existing.contains_key(&key) {
                continue;
            }
            let record = FavoriteRecord {
                date: key.clone(),
                src: favorite.image_url,
                added: favorite
                    .added_at
                    .map(|at| AddedAt::Text(at.to_rfc3339_opts(SecondsFormat::Millis, true))),
            };
            let value = serde_json::to_value(&record).context("favorites: encode record")?;
            self.backend
                .set(&format!("{}/{key}", Self::user_path(new_user_id)), &value)
                .with_context(|| format!("favorites: copy {key}"))?;
            copied += 1;
        }
        if copied > 0 {
            self.counts.invalidate();
        }
        debug!("favorites: migrated {copied} entries {old_user_id} -> {new_user_id}");
        Ok(copied)
    }
}

fn decode_collection(value: Option<Value>) -> BTreeMap<String, Favorite> {
    let Some(Value::Object(entries)) = value else {
        return BTreeMap::new();
    };
    entries
        .into_iter()
        .filter_map(|(key, raw)| match serde_json::from_value::<FavoriteRecord>(raw) {
            Ok(record) => Some((key.clone(), record.into_favorite(&key))),
            Err(err) => {
                debug!("favorites: skipping malformed entry {key}: {err}");
                None
            }
        })
        .collect()
}

fn tally(value: Option<Value>) -> HashMap<String, u64> {
    let mut counts = HashMap::new();
    let Some(Value::Object(users)) = value else {
        return counts;
    };
    for (_, favorites) in users {
        if let Value::Object(entries) = favorites {
            for key in entries.keys() {
                *counts.entry(key.clone()).or_insert(0) += 1;
            }
        }
    }
    counts
}

/// Display order: entries keyed by a real date first, most recently added first.
pub fn display_order(favorites: &BTreeMap<String, Favorite>) -> Vec<Favorite> {
    let mut sorted: Vec<Favorite> = favorites.values().cloned().collect();
    sorted.sort_by(|a, b| {
        let a_valid = dates::parse(&a.date_key).is_some();
        let b_valid = dates::parse(&b.date_key).is_some();
        match (a_valid, b_valid) {
            (false, true) => Ordering::Greater,
            (true, false) => Ordering::Less,
            _ => b.added_at.cmp(&a.added_at),
        }
    });
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::identity::Profile;
    use serde_json::json;

    fn store_for(backend: Arc<MemoryBackend>, user_id: &str) -> FavoritesStore {
        let user = CurrentUser::new(Profile::new(user_id, "LazyCat1", None));
        FavoritesStore::new(backend, user, Duration::from_secs(300))
    }

    #[test]
    fn add_list_remove() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_for(backend.clone(), "u1");

        let fav = store.add("01/15/2023", "https://x/img.png").unwrap();
        assert_eq!(fav.date_key, "2023-01-15");
        assert!(store.is_favorite("2023/01/15"));

        let listed = store.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed["2023-01-15"].image_url, "https://x/img.png");
        assert!(listed["2023-01-15"].added_at.is_some());

        assert!(store.remove("2023-01-15"));
        assert!(store.list().is_empty());
    }

    #[test]
    fn remove_missing_key_is_false() {
        let store = store_for(Arc::new(MemoryBackend::new()), "u1");
        assert!(!store.remove("1999-12-31"));
        assert!(!store.remove(""));
    }

    #[test]
    fn remove_ignores_keys_that_are_not_dates() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_for(backend.clone(), "u1");
        store.add("2023-01-15", "https://x/a").unwrap();
        store.add("2023-01-16", "https://x/b").unwrap();

        for bad in ["/", "//", "2023-01-15/src", "junk"] {
            assert!(!store.remove(bad), "{bad:?} removed something");
        }
        let listed = store.list();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed["2023-01-15"].image_url, "https://x/a");
    }

    #[test]
    fn migrate_rejects_malformed_ids() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_for(backend.clone(), "u1");
        store.add("2023-01-15", "https://x/a").unwrap();
        assert!(store.migrate("u1", "").unwrap_err().is_validation());
        assert!(store.migrate("/", "u1").unwrap_err().is_validation());
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn add_rejects_bad_input_and_propagates_outage() {
        let backend = Arc::new(MemoryBackend::new());
        let store = store_for(backend.clone(), "u1");
        assert!(store.add("someday", "https://x").unwrap_err().is_validation());
        assert!(store.add("2023-01-15", "  ").unwrap_err().is_validation());

        backend.set_offline(true);
        assert!(store.add("2023-01-15", "https://x").unwrap_err().is_storage());
        assert!(store.list().is_empty());
        assert!(!store.remove("2023-01-15"));
        assert_eq!(store.count_for_date("2023-01-15", true), 0);
    }

    #[test]
    fn count_spans_users_and_is_cached() {
        let backend = Arc::new(MemoryBackend::new());
        store_for(backend.clone(), "a").add("2023-01-15", "https://x").unwrap();
        store_for(backend.clone(), "b").add("2023-01-15", "https://x").unwrap();
        let viewer = store_for(backend.clone(), "c");

        assert_eq!(viewer.count_for_date("2023-01-15", false), 2);
        assert_eq!(viewer.count_for_date("2023-01-16", false), 0);

        backend
            .set("favorites/d/2023-01-15", &json!({"date": "2023-01-15", "src": "y"}))
            .unwrap();
        assert_eq!(viewer.count_for_date("2023-01-15", false), 2);
        assert_eq!(viewer.count_for_date("2023-01-15", true), 3);
    }

    #[test]
    fn aged_tally_is_recounted() {
        let backend = Arc::new(MemoryBackend::new());
        store_for(backend.clone(), "a").add("2023-01-15", "https://x").unwrap();
        let user = CurrentUser::new(Profile::new("c", "LazyCat1", None));
        let viewer = FavoritesStore::new(backend.clone(), user, Duration::from_millis(50));
        assert_eq!(viewer.count_for_date("2023-01-15", false), 1);

        backend
            .set("favorites/d/2023-01-15", &json!({"date": "2023-01-15", "src": "y"}))
            .unwrap();
        assert_eq!(viewer.count_for_date("2023-01-15", false), 1);

        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(viewer.count_for_date("2023-01-15", false), 2);
    }

    #[test]
    fn server_written_millis_are_understood() {
        let backend = Arc::new(MemoryBackend::new());
        backend
            .set(
                "favorites/u1/2020-05-05",
                &json!({"date": "2020-05-05", "src": "s", "added": 1588636800000i64}),
            )
            .unwrap();
        let listed = store_for(backend, "u1").list();
        assert_eq!(
            listed["2020-05-05"].added_at,
            Utc.timestamp_millis_opt(1588636800000).single()
        );
    }

    #[test]
    fn migrate_merges_without_deleting() {
        let backend = Arc::new(MemoryBackend::new());
        let old = store_for(backend.clone(), "old");
        old.add("2023-01-15", "https://x/a").unwrap();
        old.add("2023-01-16", "https://x/b").unwrap();
        let new = store_for(backend.clone(), "new");
        new.add("2023-01-16", "https://x/kept").unwrap();

        assert_eq!(new.migrate("old", "new").unwrap(), 1);
        let merged = new.list();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged["2023-01-16"].image_url, "https://x/kept");
        assert_eq!(old.list().len(), 2);
    }

    #[test]
    fn display_order_puts_invalid_keys_last() {
        let at = |ms| Utc.timestamp_millis_opt(ms).single();
        let mut favs = BTreeMap::new();
        for (key, added) in [("2020-01-01", 1), ("junk", 5), ("2021-01-01", 3)] {
            favs.insert(
                key.to_string(),
                Favorite {
                    date_key: key.into(),
                    image_url: String::new(),
                    added_at: at(added),
                },
            );
        }
        let keys: Vec<_> = display_order(&favs).into_iter().map(|f| f.date_key).collect();
        assert_eq!(keys, vec!["2021-01-01", "2020-01-01", "junk"]);
    }
}
