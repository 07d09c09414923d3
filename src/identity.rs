use std::sync::Arc;

use anyhow::Context;
use log::{info, warn};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::backend::{server_timestamp, single_segment, KvBackend};
use crate::error::{Error, Result};
use crate::favorites::FavoritesStore;
use crate::storage::{IdentityFields, IdentityRecord, Store};

const NAME_ADJECTIVES: &[&str] = &[
    "Lazy", "Hungry", "Sleepy", "Grumpy", "Happy", "Silly", "Fluffy", "Orange",
];
const NAME_NOUNS: &[&str] = &[
    "Cat", "Lasagna", "Napper", "Monday-Hater", "Friend", "Garfield", "Paws",
];

const CODE_ADJECTIVES: &[&str] = &[
    "lazy", "hungry", "sleepy", "grumpy", "happy", "silly", "fluffy", "orange", "sunny", "quiet",
    "clever", "brave", "cozy", "witty", "jolly", "sneaky",
];
const CODE_NOUNS: &[&str] = &[
    "cat", "lasagna", "napper", "dog", "coffee", "monday", "pizza", "donut", "spider", "mailman",
    "blanket", "teddy", "cookie", "pillow", "diet", "scale",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub user_id: String,
    pub display_name: String,
    pub recovery_code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

impl Profile {
    pub fn new(user_id: &str, display_name: &str, email: Option<String>) -> Self {
        Self {
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
            recovery_code: recovery_code(user_id),
            email,
        }
    }

    fn from_record(record: IdentityRecord) -> Self {
        Self {
            user_id: record.user_id,
            display_name: record.display_name,
            recovery_code: record.recovery_code,
            email: record.email,
        }
    }

    fn to_fields(&self) -> IdentityFields {
        IdentityFields {
            user_id: self.user_id.clone(),
            display_name: self.display_name.clone(),
            recovery_code: self.recovery_code.clone(),
            email: self.email.clone(),
        }
    }
}

/// Shared handle to the identity every store acts on behalf of.
#[derive(Debug, Clone)]
pub struct CurrentUser(Arc<RwLock<Profile>>);

impl CurrentUser {
    pub fn new(profile: Profile) -> Self {
        Self(Arc::new(RwLock::new(profile)))
    }

    pub fn profile(&self) -> Profile {
        self.0.read().clone()
    }

    pub fn user_id(&self) -> String {
        self.0.read().user_id.clone()
    }

    pub fn display_name(&self) -> String {
        self.0.read().display_name.clone()
    }

    pub(crate) fn replace(&self, profile: Profile) {
        *self.0.write() = profile;
    }
}

/// Record kept at `users/{userId}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserRecord {
    #[serde(default)]
    username: String,
    #[serde(default)]
    recovery_code: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreOutcome {
    pub success: bool,
    /// False when no backend record carried the code and a new identity was made for it.
    pub matched: bool,
    pub profile: Profile,
}

/// Hash-derived word pair, a two digit number and the tail of the id.
pub fn recovery_code(user_id: &str) -> String {
    let digest = Sha256::digest(user_id.as_bytes());
    let adjective = CODE_ADJECTIVES[digest[0] as usize % CODE_ADJECTIVES.len()];
    let noun = CODE_NOUNS[digest[1] as usize % CODE_NOUNS.len()];
    let number = u16::from_be_bytes([digest[2], digest[3]]) % 100;

    let alnum: Vec<char> = user_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let fragment: String = if alnum.len() >= 4 {
        alnum[alnum.len() - 4..].iter().collect()
    } else {
        hex::encode(&digest[4..6])
    };
    format!("{adjective}-{noun}-{number:02}-{fragment}")
}

pub fn random_display_name<R: Rng>(rng: &mut R) -> String {
    let adjective = NAME_ADJECTIVES[rng.gen_range(0..NAME_ADJECTIVES.len())];
    let noun = NAME_NOUNS[rng.gen_range(0..NAME_NOUNS.len())];
    format!("{adjective}{noun}{}", rng.gen_range(0..1000))
}

pub fn generate_user_id<R: Rng>(rng: &mut R) -> String {
    let mut bytes = [0u8; 8];
    rng.fill(&mut bytes);
    format!("user_{}", hex::encode(bytes))
}

/// Loads the device identity, creating and persisting a fresh one on first run.
pub fn load_or_create(store: &Store) -> Result<Profile> {
    if let Some(record) = store.load_identity()? {
        return Ok(Profile::from_record(record));
    }
    let mut rng = rand::thread_rng();
    let user_id = generate_user_id(&mut rng);
    let profile = Profile::new(&user_id, &random_display_name(&mut rng), None);
    store.save_identity(&profile.to_fields())?;
    info!("identity: created {} as {}", profile.user_id, profile.display_name);
    Ok(profile)
}

pub struct IdentityOptions {
    /// Refuse unknown recovery codes instead of making a new identity for them.
    pub strict_recovery: bool,
}

pub struct UserIdentity {
    store: Store,
    backend: Arc<dyn KvBackend>,
    favorites: Arc<FavoritesStore>,
    user: CurrentUser,
    options: IdentityOptions,
}

impl UserIdentity {
    pub fn new(
        store: Store,
        backend: Arc<dyn KvBackend>,
        favorites: Arc<FavoritesStore>,
        user: CurrentUser,
        options: IdentityOptions,
    ) -> Self {
        Self {
            store,
            backend,
            favorites,
            user,
            options,
        }
    }

    pub fn current(&self) -> Profile {
        self.user.profile()
    }

    /// Moves this device onto `new_user_id`, carrying favorites across.
    pub fn rebind(&self, new_user_id: &str) -> Result<Profile> {
        let new_user_id = single_segment(new_user_id.trim())
            .map_err(|_| Error::validation(format!("malformed user id {new_user_id:?}")))?;
        let old = self.user.profile();
        let profile = Profile::new(new_user_id, &old.display_name, old.email.clone());
        self.persist(&profile)?;

        if let Err(err) = self.favorites.migrate(&old.user_id, new_user_id) {
            warn!(
                "identity: favorites migration {} -> {new_user_id} failed: {err}",
                old.user_id
            );
        }
        self.sync_remote_logged(&profile);
        info!("identity: rebound {} -> {new_user_id}", old.user_id);
        Ok(profile)
    }

    pub fn set_display_name(&self, name: &str) -> Result<Profile> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::validation("display name must not be empty"));
        }
        let mut profile = self.user.profile();
        profile.display_name = name.to_string();
        self.persist(&profile)?;
        self.sync_remote_logged(&profile);
        Ok(profile)
    }

    /// Sets or clears the optional contact address.
    pub fn set_email(&self, email: Option<&str>) -> Result<Profile> {
        let email = email.map(str::trim).filter(|e| !e.is_empty());
        if let Some(address) = email {
            if !address.contains('@') {
                return Err(Error::validation(format!("{address:?} is not an email address")));
            }
        }
        let mut profile = self.user.profile();
        profile.email = email.map(str::to_string);
        self.persist(&profile)?;
        self.sync_remote_logged(&profile);
        Ok(profile)
    }

    /// Looks the code up in `users`. An unknown code still yields a new
    /// identity bound to it unless strict recovery is configured.
    pub fn restore_from_recovery_code(&self, code: &str) -> Result<RestoreOutcome> {
        let code = code.trim();
        if code.is_empty() {
            return Err(Error::validation("recovery code must not be empty"));
        }

        let users = self
            .backend
            .get("users")
            .context("identity: read user index")?;
        if let Some((user_id, record)) = find_by_code(users, code) {
            let profile = Profile {
                user_id,
                display_name: record.username,
                recovery_code: record.recovery_code,
                email: record.email,
            };
            self.persist(&profile)?;
            info!("identity: restored {} from recovery code", profile.user_id);
            return Ok(RestoreOutcome {
                success: true,
                matched: true,
                profile,
            });
        }

        if self.options.strict_recovery {
            return Err(Error::validation(format!("unknown recovery code {code:?}")));
        }

        let mut rng = rand::thread_rng();
        let profile = Profile {
            user_id: generate_user_id(&mut rng),
            display_name: random_display_name(&mut rng),
            recovery_code: code.to_string(),
            email: None,
        };
        self.persist(&profile)?;
        self.sync_remote_logged(&profile);
        warn!(
            "identity: recovery code {code:?} matched nobody, created {}",
            profile.user_id
        );
        Ok(RestoreOutcome {
            success: true,
            matched: false,
            profile,
        })
    }

    fn persist(&self, profile: &Profile) -> Result<()> {
        self.store.save_identity(&profile.to_fields())?;
        self.user.replace(profile.clone());
        Ok(())
    }

    fn sync_remote_logged(&self, profile: &Profile) {
        if let Err(err) = self.sync_remote(profile) {
            warn!("identity: profile sync for {} failed: {err:#}", profile.user_id);
        }
    }

    fn sync_remote(&self, profile: &Profile) -> anyhow::Result<()> {
        let mut record = json!({
            "username": profile.display_name,
            "recoveryCode": profile.recovery_code,
            "updated": server_timestamp(),
        });
        if let Some(email) = &profile.email {
            record["email"] = Value::String(email.clone());
        }
        self.backend
            .set(&format!("users/{}", profile.user_id), &record)
    }
}

fn find_by_code(users: Option<Value>, code: &str) -> Option<(String, UserRecord)> {
    let Some(Value::Object(users)) = users else {
        return None;
    };
    users.into_iter().find_map(|(user_id, raw)| {
        let record: UserRecord = serde_json::from_value(raw).ok()?;
        record
            .recovery_code
            .eq_ignore_ascii_case(code)
            .then_some((user_id, record))
    })
}
