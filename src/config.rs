use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::comic::{Envelope, Transport};

const DEFAULT_ENV_PREFIX: &str = "COMIC_DAILY";
const MAX_COMMENT_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub comic: ComicConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComicConfig {
    #[serde(default = "default_site")]
    pub site: String,
    #[serde(default = "default_strip")]
    pub strip: String,
    #[serde(default = "default_brand_token")]
    pub brand_token: String,
    #[serde(default = "default_asset_hosts")]
    pub asset_hosts: Vec<String>,
    #[serde(default = "default_first_date")]
    pub first_date: NaiveDate,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    #[serde(default = "default_true")]
    pub prefetch: bool,
    #[serde(default = "default_prefetch_delay", with = "humantime_serde")]
    pub prefetch_delay: Duration,
    #[serde(default = "default_first_party_proxy")]
    pub first_party_proxy: String,
    /// Replaces the built-in relay list when non-empty.
    #[serde(default)]
    pub transports: Vec<Transport>,
}

impl Default for ComicConfig {
    fn default() -> Self {
        Self {
            site: default_site(),
            strip: default_strip(),
            brand_token: default_brand_token(),
            asset_hosts: default_asset_hosts(),
            first_date: default_first_date(),
            user_agent: default_user_agent(),
            timeout: default_http_timeout(),
            prefetch: true,
            prefetch_delay: default_prefetch_delay(),
            first_party_proxy: default_first_party_proxy(),
            transports: Vec::new(),
        }
    }
}

impl ComicConfig {
    /// First-party proxy followed by the public relays, in the order they are tried.
    pub fn effective_transports(&self) -> Vec<Transport> {
        if !self.transports.is_empty() {
            return self.transports.clone();
        }
        let mut transports = Vec::new();
        if !self.first_party_proxy.trim().is_empty() {
            transports.push(Transport::new(
                "first-party",
                self.first_party_proxy.trim(),
                Envelope::RawHtml,
            ));
        }
        transports.extend([
            Transport::new("corsproxy", "https://corsproxy.io/?{url}", Envelope::RawHtml),
            Transport::new(
                "allorigins",
                "https://api.allorigins.win/get?url={url}",
                Envelope::JsonContents,
            ),
            Transport::new(
                "cors-anywhere",
                "https://cors-anywhere.herokuapp.com/{raw_url}",
                Envelope::RawHtml,
            ),
            Transport::new(
                "codetabs",
                "https://api.codetabs.com/v1/proxy?quest={raw_url}",
                Envelope::RawHtml,
            ),
        ]);
        transports
    }
}

fn default_site() -> String {
    "https://www.gocomics.com".into()
}

fn default_strip() -> String {
    "garfield".into()
}

fn default_brand_token() -> String {
    "garfield".into()
}

fn default_asset_hosts() -> Vec<String> {
    vec!["assets.amuniversal".into()]
}

fn default_first_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1978, 6, 19).unwrap_or_default()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 Comic Reader App".into()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_true() -> bool {
    true
}

fn default_prefetch_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_first_party_proxy() -> String {
    format!("http://{}/proxy?url={{url}}", default_listen())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendConfig {
    /// Root of the hosted store; empty keeps everything in process memory.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default = "default_http_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            auth: None,
            timeout: default_http_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    #[serde(default = "default_comment_ttl", with = "humantime_serde")]
    pub comment_ttl: Duration,
    #[serde(default = "default_favorite_count_ttl", with = "humantime_serde")]
    pub favorite_count_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            comment_ttl: default_comment_ttl(),
            favorite_count_ttl: default_favorite_count_ttl(),
        }
    }
}

fn default_comment_ttl() -> Duration {
    MAX_COMMENT_TTL
}

fn default_favorite_count_ttl() -> Duration {
    Duration::from_secs(5 * 60)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct IdentityConfig {
    #[serde(default)]
    pub strict_recovery: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8788".into()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_config_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    apply_env(&mut cfg, prefix);

    if cfg.cache.comment_ttl > MAX_COMMENT_TTL {
        log::warn!(
            "config: cache.comment_ttl {} exceeds 30s, clamping",
            humantime::format_duration(cfg.cache.comment_ttl)
        );
        cfg.cache.comment_ttl = MAX_COMMENT_TTL;
    }

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    let defaults = ComicConfig::default();
    if !other.comic.site.is_empty() {
        base.comic.site = other.comic.site;
    }
    if !other.comic.strip.is_empty() {
        base.comic.strip = other.comic.strip;
    }
    if !other.comic.brand_token.is_empty() {
        base.comic.brand_token = other.comic.brand_token;
    }
    if !other.comic.asset_hosts.is_empty() {
        base.comic.asset_hosts = other.comic.asset_hosts;
    }
    if other.comic.first_date != defaults.first_date {
        base.comic.first_date = other.comic.first_date;
    }
    if !other.comic.user_agent.is_empty() {
        base.comic.user_agent = other.comic.user_agent;
    }
    base.comic.timeout = other.comic.timeout;
    base.comic.prefetch = other.comic.prefetch;
    base.comic.prefetch_delay = other.comic.prefetch_delay;
    base.comic.first_party_proxy = other.comic.first_party_proxy;
    if !other.comic.transports.is_empty() {
        base.comic.transports = other.comic.transports;
    }

    if !other.backend.url.is_empty() {
        base.backend.url = other.backend.url;
    }
    if other.backend.auth.is_some() {
        base.backend.auth = other.backend.auth;
    }
    base.backend.timeout = other.backend.timeout;

    base.cache = other.cache;
    base.identity = other.identity;

    if !other.rpc.listen.is_empty() {
        base.rpc.listen = other.rpc.listen;
    }
    if other.storage.path.is_some() {
        base.storage.path = other.storage.path;
    }

    base
}

fn apply_env(cfg: &mut Config, prefix: &str) {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(cfg, &key, value);
    }
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "comic.site" => cfg.comic.site = value,
        "comic.strip" => cfg.comic.strip = value,
        "comic.brand_token" => cfg.comic.brand_token = value,
        "comic.asset_hosts" => cfg.comic.asset_hosts = split_list(&value),
        "comic.first_date" => {
            if let Some(date) = crate::dates::parse(&value) {
                cfg.comic.first_date = date;
            }
        }
        "comic.user_agent" => cfg.comic.user_agent = value,
        "comic.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.comic.timeout = duration;
            }
        }
        "comic.prefetch" => cfg.comic.prefetch = parse_bool(&value),
        "comic.prefetch_delay" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.comic.prefetch_delay = duration;
            }
        }
        "comic.first_party_proxy" => cfg.comic.first_party_proxy = value,
        "backend.url" => cfg.backend.url = value,
        "backend.auth" => cfg.backend.auth = Some(value).filter(|v| !v.is_empty()),
        "backend.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.backend.timeout = duration;
            }
        }
        "cache.comment_ttl" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.cache.comment_ttl = duration;
            }
        }
        "cache.favorite_count_ttl" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.cache.favorite_count_ttl = duration;
            }
        }
        "identity.strict_recovery" => cfg.identity.strict_recovery = parse_bool(&value),
        "rpc.listen" => cfg.rpc.listen = value,
        "storage.path" => cfg.storage.path = Some(PathBuf::from(value)),
        _ => {}
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "TRUE" | "True")
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("comic-daily").join("config.yaml"))
}
