#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use gbooru_ingest::error::{IngestError, Result};
use gbooru_ingest::fetch::{Fetcher, HttpRequest, HttpResponse, HttpTransport};
use gbooru_ingest::strategy::google_image::GoogleImageMode;
use gbooru_ingest::strategy::{Mode, Registry};
use gbooru_ingest::{Config, Orchestrator};
use url::Url;

pub const META: &str = r#"{"ou":"http://x/1.jpg","ow":100,"oh":80,"tu":"http://x/1_thumb.jpg","tw":50,"th":40,"pt":"cat"}"#;

/// An in-process web: canned responses keyed by request URL.
#[derive(Default)]
pub struct FakeWeb {
    pages: Mutex<HashMap<String, HttpResponse>>,
    failures: AtomicUsize,
    calls: AtomicUsize,
}

impl FakeWeb {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn page(&self, url: &str, body: &str) {
        self.page_at(url, url, body);
    }

    /// Serves `body` for `url` as if redirected to `final_url`.
    pub fn page_at(&self, url: &str, final_url: &str, body: &str) {
        self.respond(
            url,
            HttpResponse {
                status: 200,
                final_url: Url::parse(final_url).unwrap(),
                body: body.to_string(),
                headers: Vec::new(),
            },
        );
    }

    pub fn redirect(&self, url: &str, location: &str) {
        self.respond(
            url,
            HttpResponse {
                status: 302,
                final_url: Url::parse(url).unwrap(),
                body: String::new(),
                headers: vec![("Location".to_string(), location.to_string())],
            },
        );
    }

    pub fn respond(&self, url: &str, response: HttpResponse) {
        let key = Url::parse(url).unwrap().to_string();
        self.pages.lock().unwrap().insert(key, response);
    }

    /// The next `count` requests fail with a transport error.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl HttpTransport for FakeWeb {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(IngestError::FetchTransport {
                url: request.url.to_string(),
                message: "connection reset".to_string(),
            });
        }
        self.pages
            .lock()
            .unwrap()
            .get(request.url.as_str())
            .cloned()
            .ok_or_else(|| IngestError::FetchTransport {
                url: request.url.to_string(),
                message: "no such page".to_string(),
            })
    }
}

pub fn test_config() -> Config {
    let mut config = Config::default();
    config.fetch.retries = 0;
    config.fetch.retry_backoff_ms = 1;
    config
}

pub fn orchestrator(web: Arc<FakeWeb>) -> Orchestrator {
    orchestrator_with(web, test_config())
}

pub fn orchestrator_with(web: Arc<FakeWeb>, config: Config) -> Orchestrator {
    let fetcher = Fetcher::with_transport(web, &config.fetch);
    let registry = Registry::with_defaults(&config.tags);
    Orchestrator::with_parts(config, registry, fetcher)
}

pub fn search_url(term: &str, page: u32) -> String {
    GoogleImageMode.build_request(term, page).unwrap().to_string()
}

pub fn block(href: &str, meta: &str) -> String {
    format!(r#"<div class="rg_bx"><a href="{href}"><img src="t.jpg"></a><div class="rg_meta">{meta}</div></div>"#)
}

/// A JSON chunk response wrapping `html`.
pub fn chunk(html: &str) -> String {
    serde_json::to_string(&serde_json::json!([0, ["rg_s", html]])).unwrap()
}

pub fn visible_tags(record: &gbooru_ingest::database::models::UrlRecord) -> Vec<String> {
    record.sorted_tags().iter().map(|tag| tag.as_string()).collect()
}
