use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDate;
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, info, warn};
use parking_lot::Mutex;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::{CACHE_CONTROL, USER_AGENT};
use serde::{Deserialize, Serialize};

use crate::config::ComicConfig;
use crate::dates::{self, DateRange};
use crate::error::Error;
use crate::html::{Document, Element, Selector};

/// Same set `encodeURIComponent` leaves alone.
const URL_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

const RICH_ATTRS: &[&str] = &["data-srcset", "data-src", "data-image", "srcset"];

/// How a relay hands back the page it fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Envelope {
    #[default]
    RawHtml,
    /// `{"contents": "<html>..."}`
    JsonContents,
}

impl Envelope {
    pub fn unwrap_body(&self, body: String) -> Result<String> {
        match self {
            Envelope::RawHtml => Ok(body),
            Envelope::JsonContents => {
                #[derive(Deserialize)]
                struct Wrapped {
                    #[serde(default)]
                    contents: Option<String>,
                }
                let wrapped: Wrapped =
                    serde_json::from_str(&body).context("comic: decode relay envelope")?;
                match wrapped.contents {
                    Some(contents) if !contents.trim().is_empty() => Ok(contents),
                    _ => bail!("comic: relay envelope has no contents"),
                }
            }
        }
    }
}

/// One relay path to the upstream page. `template` carries `{url}` for the
/// percent-encoded target or `{raw_url}` for the target as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transport {
    pub name: String,
    pub template: String,
    #[serde(default)]
    pub envelope: Envelope,
}

impl Transport {
    pub fn new(name: &str, template: &str, envelope: Envelope) -> Self {
        Self {
            name: name.to_string(),
            template: template.to_string(),
            envelope,
        }
    }

    pub fn request_url(&self, target: &str) -> String {
        let encoded = utf8_percent_encode(target, URL_COMPONENT).to_string();
        self.template
            .replace("{url}", &encoded)
            .replace("{raw_url}", target)
    }
}

#[derive(Debug, Clone)]
pub struct Page {
    pub status: u16,
    pub body: String,
}

pub trait PageFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Page>;
}

pub struct HttpFetcher {
    http: HttpClient,
    user_agent: String,
}

impl HttpFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        if user_agent.trim().is_empty() {
            bail!("comic: user agent required");
        }
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .context("comic: build http client")?;
        Ok(Self {
            http,
            user_agent: user_agent.to_string(),
        })
    }
}

impl PageFetcher for HttpFetcher {
    fn fetch(&self, url: &str) -> Result<Page> {
        let resp = self
            .http
            .get(url)
            .header(USER_AGENT, &self.user_agent)
            .header(CACHE_CONTROL, "no-store")
            .send()
            .with_context(|| format!("comic: request {url}"))?;
        let status = resp.status().as_u16();
        let body = resp.text().context("comic: read body")?;
        Ok(Page { status, body })
    }
}

/// Lookup key → image URL. Entries live as long as the cache does.
#[derive(Debug, Default)]
pub struct ComicCache {
    entries: Mutex<HashMap<String, String>>,
}

impl ComicCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, lookup_key: &str) -> Option<String> {
        self.entries.lock().get(lookup_key).cloned()
    }

    pub fn contains(&self, lookup_key: &str) -> bool {
        self.entries.lock().contains_key(lookup_key)
    }

    pub fn insert(&self, lookup_key: String, image_url: String) {
        self.entries.lock().insert(lookup_key, image_url);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComicRef {
    pub date: NaiveDate,
    pub image_url: String,
}

/// Finds the strip image in a fetched page.
#[derive(Debug, Clone)]
pub struct ImageExtractor {
    selectors: Vec<Selector>,
    brand_token: String,
    asset_hosts: Vec<String>,
}

impl ImageExtractor {
    pub fn new(brand_token: &str, asset_hosts: &[String]) -> Result<Self> {
        let brand = brand_token.trim().to_lowercase();
        if brand.is_empty() {
            bail!("comic: brand token required");
        }
        let title = capitalize(&brand);
        let sources = [
            "picture.item-comic-image img".to_string(),
            ".item-comic-image img".to_string(),
            ".comic__image img".to_string(),
            ".js-item-comic-link img".to_string(),
            "img.lazyload[data-srcset]".to_string(),
            "img.lazyload".to_string(),
            ".js-comic-container img".to_string(),
            ".comic img".to_string(),
            format!(r#"img.img-fluid[alt*="{title}"]"#),
            format!(r#"img[alt*="{title}"]"#),
            ".comic-item img".to_string(),
            "img.gc-lazy".to_string(),
            "img.comic".to_string(),
            ".comic-panel img".to_string(),
            ".panel-comic-image img".to_string(),
            ".image-wrapper img".to_string(),
            r#"div[data-feature-name="comics"] img"#.to_string(),
        ];
        let selectors = sources
            .iter()
            .map(|source| Selector::parse(source))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            selectors,
            brand_token: brand,
            asset_hosts: asset_hosts.to_vec(),
        })
    }

    pub fn extract(&self, html: &str) -> Option<String> {
        let doc = Document::parse(html);

        for selector in &self.selectors {
            let matches: Vec<&Element> = doc.select(selector).collect();
            if matches.is_empty() {
                continue;
            }
            if let Some(url) = self.pick(&matches) {
                debug!("comic: selector {:?} matched {}", selector.as_str(), url);
                return Some(url);
            }
        }

        let fallback = doc.images().find(|img| {
            let src = img.attr("src").unwrap_or("");
            let alt = img.attr("alt").unwrap_or("").to_lowercase();
            (!src.is_empty()
                && (src.contains(&self.brand_token)
                    || src.contains("comic")
                    || self.asset_hosts.iter().any(|host| src.contains(host.as_str()))))
                || alt.contains(&self.brand_token)
        });
        let url = fallback.and_then(|img| non_empty(img.attr("src")))?;
        debug!("comic: fallback image scan matched {}", url);
        Some(url)
    }

    fn pick(&self, matches: &[&Element]) -> Option<String> {
        let branded_rich = matches
            .iter()
            .filter_map(|el| rich_source(el))
            .find(|url| url.contains(&self.brand_token));
        if branded_rich.is_some() {
            return branded_rich;
        }

        for el in matches {
            if let Some(rich) = rich_source(el) {
                return Some(rich);
            }
            if let Some(src) = non_empty(el.attr("src")) {
                if src.contains(&self.brand_token) {
                    return Some(src);
                }
            }
        }

        matches.iter().find_map(|el| non_empty(el.attr("src")))
    }
}

fn rich_source(element: &Element) -> Option<String> {
    RICH_ATTRS.iter().find_map(|name| {
        element
            .attr(name)
            .and_then(|value| value.split_whitespace().next())
            .map(|first| first.trim_end_matches(',').to_string())
            .filter(|first| !first.is_empty())
    })
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    pub site: String,
    pub strip: String,
    pub first_date: NaiveDate,
    pub brand_token: String,
    pub asset_hosts: Vec<String>,
    pub transports: Vec<Transport>,
    pub prefetch: bool,
    pub prefetch_delay: Duration,
}

impl From<&ComicConfig> for ResolverConfig {
    fn from(cfg: &ComicConfig) -> Self {
        Self {
            site: cfg.site.clone(),
            strip: cfg.strip.clone(),
            first_date: cfg.first_date,
            brand_token: cfg.brand_token.clone(),
            asset_hosts: cfg.asset_hosts.clone(),
            transports: cfg.effective_transports(),
            prefetch: cfg.prefetch,
            prefetch_delay: cfg.prefetch_delay,
        }
    }
}

struct Inner {
    site: String,
    strip: String,
    first_date: NaiveDate,
    transports: Vec<Transport>,
    extractor: ImageExtractor,
    fetcher: Arc<dyn PageFetcher>,
    cache: Arc<ComicCache>,
}

#[derive(Debug, Clone)]
pub struct PrefetchOutcome {
    pub date: NaiveDate,
    pub image_url: Option<String>,
}

struct PrefetchJob {
    date: NaiveDate,
    tx: Sender<PrefetchOutcome>,
}

struct Prefetcher {
    jobs: Sender<PrefetchJob>,
    stop: Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

pub struct ComicResolver {
    inner: Arc<Inner>,
    prefetcher: Option<Prefetcher>,
}

impl ComicResolver {
    pub fn new(
        cfg: ResolverConfig,
        fetcher: Arc<dyn PageFetcher>,
        cache: Arc<ComicCache>,
    ) -> Result<Self> {
        if cfg.transports.is_empty() {
            bail!("comic: at least one transport required");
        }
        if cfg.site.trim().is_empty() || cfg.strip.trim().is_empty() {
            bail!("comic: site and strip required");
        }

        let inner = Arc::new(Inner {
            site: cfg.site.trim_end_matches('/').to_string(),
            strip: cfg.strip.trim_matches('/').to_string(),
            first_date: cfg.first_date,
            transports: cfg.transports,
            extractor: ImageExtractor::new(&cfg.brand_token, &cfg.asset_hosts)?,
            fetcher,
            cache,
        });

        let prefetcher = if cfg.prefetch {
            Some(Prefetcher::start(inner.clone(), cfg.prefetch_delay))
        } else {
            None
        };

        Ok(Self { inner, prefetcher })
    }

    pub fn cache(&self) -> &Arc<ComicCache> {
        &self.inner.cache
    }

    pub fn range(&self) -> DateRange {
        DateRange::until_today(self.inner.first_date)
    }

    /// Upstream page for `date`.
    pub fn source_url(&self, date: NaiveDate) -> String {
        self.inner.source_url(date)
    }

    /// Image for `date`, clamped into the published range first.
    pub fn resolve(&self, date: NaiveDate) -> Result<ComicRef, Error> {
        let date = self.range().clamp(date);
        let image_url = self.inner.resolve(date)?;
        if self.prefetcher.is_some() {
            self.prefetch_next(date);
        }
        Ok(ComicRef { date, image_url })
    }

    pub fn resolve_str(&self, text: &str) -> Result<ComicRef, Error> {
        let date = dates::parse(text)
            .ok_or_else(|| Error::validation(format!("unrecognised date {text:?}")))?;
        self.resolve(date)
    }

    /// Queues the day after `date` for background resolution. Returns `None`
    /// when that day is in the future, already cached, or prefetch is off.
    pub fn prefetch_next(&self, date: NaiveDate) -> Option<Receiver<PrefetchOutcome>> {
        let prefetcher = self.prefetcher.as_ref()?;
        let next = date.succ_opt()?;
        if next > dates::today() || self.inner.cache.contains(&dates::format_lookup(next)) {
            return None;
        }
        let (tx, rx) = unbounded();
        prefetcher.jobs.send(PrefetchJob { date: next, tx }).ok()?;
        Some(rx)
    }
}

impl Inner {
    fn source_url(&self, date: NaiveDate) -> String {
        format!("{}/{}/{}", self.site, self.strip, dates::format_lookup(date))
    }

    fn resolve(&self, date: NaiveDate) -> Result<String, Error> {
        let key = dates::format_lookup(date);
        if let Some(url) = self.cache.get(&key) {
            debug!("comic: cache hit for {key}");
            return Ok(url);
        }

        let target = self.source_url(date);
        let mut failures = Vec::new();
        for transport in &self.transports {
            match self.attempt(transport, &target) {
                Ok(url) => {
                    info!("comic: {key} resolved via {}", transport.name);
                    self.cache.insert(key, url.clone());
                    return Ok(url);
                }
                Err(err) => {
                    debug!("comic: {} failed for {key}: {err:#}", transport.name);
                    failures.push(format!("{}: {err}", transport.name));
                }
            }
        }

        warn!("comic: every transport failed for {key}");
        Err(Error::Resolution(format!(
            "could not load the {key} strip through any proxy ({})",
            failures.join("; ")
        )))
    }

    fn attempt(&self, transport: &Transport, target: &str) -> Result<String> {
        let request = transport.request_url(target);
        debug!("comic: trying {} -> {}", transport.name, request);
        let page = self.fetcher.fetch(&request)?;
        if !(200..300).contains(&page.status) {
            return Err(anyhow!("status {}", page.status));
        }
        let html = transport.envelope.unwrap_body(page.body)?;
        self.extractor
            .extract(&html)
            .ok_or_else(|| anyhow!("no comic image in page"))
    }
}

impl Prefetcher {
    fn start(inner: Arc<Inner>, delay: Duration) -> Self {
        let (job_tx, job_rx) = unbounded::<PrefetchJob>();
        let (stop_tx, stop_rx) = unbounded::<()>();
        let handle = thread::spawn(move || prefetch_worker(inner, delay, job_rx, stop_rx));
        Self {
            jobs: job_tx,
            stop: stop_tx,
            handle: Some(handle),
        }
    }
}

impl Drop for Prefetcher {
    fn drop(&mut self) {
        let _ = self.stop.send(());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn prefetch_worker(
    inner: Arc<Inner>,
    delay: Duration,
    jobs: Receiver<PrefetchJob>,
    stop: Receiver<()>,
) {
    loop {
        let job = crossbeam_channel::select! {
            recv(stop) -> _ => break,
            recv(jobs) -> msg => match msg {
                Ok(job) => job,
                Err(_) => break,
            },
        };

        if !delay.is_zero() && stop.recv_timeout(delay).is_ok() {
            break;
        }

        let image_url = match inner.resolve(job.date) {
            Ok(url) => Some(url),
            Err(err) => {
                warn!("comic: prefetch of {} failed: {err}", job.date);
                None
            }
        };
        let _ = job.tx.send(PrefetchOutcome {
            date: job.date,
            image_url,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers by URL prefix; anything unscripted is a network error.
    #[derive(Default)]
    struct ScriptedFetcher {
        routes: Vec<(String, u16, String)>,
        calls: AtomicUsize,
        seen: Mutex<Vec<String>>,
    }

    impl ScriptedFetcher {
        fn route(mut self, prefix: &str, status: u16, body: &str) -> Self {
            self.routes.push((prefix.into(), status, body.into()));
            self
        }
    }

    impl PageFetcher for ScriptedFetcher {
        fn fetch(&self, url: &str) -> Result<Page> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(url.to_string());
            self.routes
                .iter()
                .find(|(prefix, _, _)| url.starts_with(prefix.as_str()))
                .map(|(_, status, body)| Page {
                    status: *status,
                    body: body.clone(),
                })
                .ok_or_else(|| anyhow!("connection refused"))
        }
    }

    fn config(transports: Vec<Transport>) -> ResolverConfig {
        ResolverConfig {
            site: "https://www.gocomics.com".into(),
            strip: "garfield".into(),
            first_date: NaiveDate::from_ymd_opt(1978, 6, 19).unwrap(),
            brand_token: "garfield".into(),
            asset_hosts: vec!["assets.amuniversal".into()],
            transports,
            prefetch: false,
            prefetch_delay: Duration::ZERO,
        }
    }

    fn two_relays() -> Vec<Transport> {
        vec![
            Transport::new("one", "https://one.test/?{url}", Envelope::RawHtml),
            Transport::new("two", "https://two.test/?{url}", Envelope::RawHtml),
        ]
    }

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn falls_through_failed_transport_and_caches() {
        let fetcher = Arc::new(
            ScriptedFetcher::default()
                .route("https://one.test/", 500, "oops")
                .route(
                    "https://two.test/",
                    200,
                    r#"<html><body><img class="lazyload" data-src="https://x/img.png"></body></html>"#,
                ),
        );
        let cache = Arc::new(ComicCache::new());
        let resolver =
            ComicResolver::new(config(two_relays()), fetcher.clone(), cache.clone()).unwrap();

        let comic = resolver.resolve_str("2023-01-15").unwrap();
        assert_eq!(comic.image_url, "https://x/img.png");
        assert_eq!(cache.get("2023/01/15").as_deref(), Some("https://x/img.png"));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            fetcher.seen.lock()[0],
            "https://one.test/?https%3A%2F%2Fwww.gocomics.com%2Fgarfield%2F2023%2F01%2F15"
        );
    }

    #[test]
    fn second_resolve_is_served_from_cache() {
        let fetcher = Arc::new(ScriptedFetcher::default().route(
            "https://one.test/",
            200,
            r#"<picture class="item-comic-image"><img src="https://assets.amuniversal.com/garfield1"></picture>"#,
        ));
        let resolver = ComicResolver::new(
            config(two_relays()),
            fetcher.clone(),
            Arc::new(ComicCache::new()),
        )
        .unwrap();

        let first = resolver.resolve(ymd(2023, 1, 15)).unwrap();
        let second = resolver.resolve(ymd(2023, 1, 15)).unwrap();
        assert_eq!(first, second);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn json_envelope_is_unwrapped() {
        let body = serde_json::json!({
            "contents": r#"<div class="comic__image"><img srcset="https://assets.amuniversal.com/abc 900w, https://assets.amuniversal.com/abc-small 450w"></div>"#
        })
        .to_string();
        let fetcher = Arc::new(ScriptedFetcher::default().route("https://wrapped.test/", 200, &body));
        let transports = vec![Transport::new(
            "wrapped",
            "https://wrapped.test/get?url={url}",
            Envelope::JsonContents,
        )];
        let resolver =
            ComicResolver::new(config(transports), fetcher, Arc::new(ComicCache::new())).unwrap();
        let comic = resolver.resolve(ymd(2001, 9, 10)).unwrap();
        assert_eq!(comic.image_url, "https://assets.amuniversal.com/abc");
    }

    #[test]
    fn exhausted_transports_are_a_resolution_error() {
        let fetcher = Arc::new(
            ScriptedFetcher::default().route("https://one.test/", 200, "<html><p>nothing</p></html>"),
        );
        let cache = Arc::new(ComicCache::new());
        let resolver = ComicResolver::new(config(two_relays()), fetcher, cache.clone()).unwrap();
        let err = resolver.resolve(ymd(2023, 1, 15)).unwrap_err();
        assert!(matches!(err, Error::Resolution(_)));
        assert!(err.to_string().contains("one: no comic image in page"));
        assert!(cache.is_empty());
    }

    #[test]
    fn out_of_range_dates_are_clamped() {
        let fetcher = Arc::new(ScriptedFetcher::default().route(
            "https://one.test/",
            200,
            r#"<img src="https://assets.amuniversal.com/first" alt="Garfield">"#,
        ));
        let resolver = ComicResolver::new(
            config(two_relays()),
            fetcher.clone(),
            Arc::new(ComicCache::new()),
        )
        .unwrap();
        let comic = resolver.resolve(ymd(1950, 1, 1)).unwrap();
        assert_eq!(comic.date, ymd(1978, 6, 19));
        assert!(fetcher.seen.lock()[0].contains("1978%2F06%2F19"));
        assert!(resolver.cache().contains("1978/06/19"));
    }

    #[test]
    fn invalid_text_is_a_validation_error() {
        let resolver = ComicResolver::new(
            config(two_relays()),
            Arc::new(ScriptedFetcher::default()),
            Arc::new(ComicCache::new()),
        )
        .unwrap();
        assert!(resolver.resolve_str("15th of never").unwrap_err().is_validation());
    }

    #[test]
    fn prefetch_fills_cache_for_next_day() {
        let fetcher = Arc::new(ScriptedFetcher::default().route(
            "https://one.test/",
            200,
            r#"<img class="gc-lazy" data-image="https://assets.amuniversal.com/next">"#,
        ));
        let mut cfg = config(two_relays());
        cfg.prefetch = true;
        let cache = Arc::new(ComicCache::new());
        let resolver = ComicResolver::new(cfg, fetcher, cache.clone()).unwrap();

        let rx = resolver.prefetch_next(ymd(2020, 2, 28)).expect("scheduled");
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(outcome.date, ymd(2020, 2, 29));
        assert!(outcome.image_url.is_some());
        assert!(cache.contains("2020/02/29"));

        assert!(resolver.prefetch_next(ymd(2020, 2, 28)).is_none());
        assert!(resolver.prefetch_next(dates::today()).is_none());
    }

    #[test]
    fn prefetch_failures_are_swallowed() {
        let mut cfg = config(two_relays());
        cfg.prefetch = true;
        let resolver = ComicResolver::new(
            cfg,
            Arc::new(ScriptedFetcher::default()),
            Arc::new(ComicCache::new()),
        )
        .unwrap();
        let rx = resolver.prefetch_next(ymd(2010, 5, 5)).unwrap();
        let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(outcome.image_url.is_none());
    }

    #[test]
    fn extractor_prefers_branded_rich_attribute() {
        let extractor = ImageExtractor::new("garfield", &[]).unwrap();
        let html = r#"
<div class="comic">
  <img data-src="https://cdn.test/ad.png">
  <img data-src="https://cdn.test/garfield-strip.png">
</div>"#;
        assert_eq!(
            extractor.extract(html).as_deref(),
            Some("https://cdn.test/garfield-strip.png")
        );
    }

    #[test]
    fn extractor_falls_back_to_any_branded_image() {
        let extractor = ImageExtractor::new("garfield", &["assets.amuniversal".into()]).unwrap();
        let html = r#"<img src="/logo.svg"><span><img src="https://assets.amuniversal.com/xyz"></span>"#;
        assert_eq!(
            extractor.extract(html).as_deref(),
            Some("https://assets.amuniversal.com/xyz")
        );
        assert_eq!(extractor.extract(r#"<img src="/logo.svg">"#), None);
    }
}
