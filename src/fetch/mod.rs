pub mod browser;
pub mod transport;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use crate::database::repo::Store;
use crate::error::{IngestError, Result};
use crate::ingest::hasher;
use crate::media::mimetype;
use crate::utils::config::FetchConfig;

pub use browser::{BrowserRenderer, HeadlessBrowser};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, Method, ReqwestTransport, Upload};

pub const UPLOAD_ENDPOINT: &str = "http://www.google.com/searchbyimage/upload";
const BLOCK_HOST: &str = "ipv4.google.com";
const BLOCK_PATH: &str = "/sorry/index";
const UNUSUAL_TRAFFIC: &str = "unusual traffic";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchTarget {
    Url(Url),
    /// A local image posted to the reverse-image upload endpoint.
    Upload(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub body: String,
    pub final_url: Url,
    pub status: u16,
    /// Response headers as served; empty for browser renders.
    pub headers: Vec<(String, String)>,
    pub from_cache: bool,
    /// Body came from the headless browser after a bot-block.
    pub rendered: bool,
}

/// Whether `url` is the search engine's anti-automation interstitial.
pub fn is_block_page(url: &Url) -> bool {
    url.host_str() == Some(BLOCK_HOST) && url.path() == BLOCK_PATH
}

/// The page a block interstitial would continue to once solved.
fn continue_target(block_url: &Url) -> Result<Url> {
    block_url
        .query_pairs()
        .find(|(key, _)| key == "continue")
        .and_then(|(_, value)| Url::parse(&value).ok())
        .ok_or_else(|| IngestError::BotBlocked {
            url: block_url.to_string(),
            reason: "block page has no continue target".to_string(),
        })
}

/// Fetches pages and upload redirects, memoised in the `responses` table.
///
/// The Fetcher never retries; timeouts and transport errors go back to the
/// caller.
pub struct Fetcher {
    transport: Arc<dyn HttpTransport>,
    browser: Option<Arc<dyn BrowserRenderer>>,
    user_agent: String,
    timeout: Duration,
}

impl Fetcher {
    /// A reqwest-backed fetcher, with the headless browser fallback when one
    /// is configured.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let fetcher = Self::with_transport(Arc::new(ReqwestTransport::new(config)?), config);
        Ok(match HeadlessBrowser::from_config(config) {
            Some(browser) => fetcher.with_browser(Arc::new(browser)),
            None => fetcher,
        })
    }

    pub fn with_transport(transport: Arc<dyn HttpTransport>, config: &FetchConfig) -> Self {
        Self {
            transport,
            browser: None,
            user_agent: config.user_agent.clone(),
            timeout: config.timeout(),
        }
    }

    pub fn with_browser(mut self, browser: Arc<dyn BrowserRenderer>) -> Self {
        self.browser = Some(browser);
        self
    }

    pub fn has_browser(&self) -> bool {
        self.browser.is_some()
    }

    pub fn fetch(&self, store: &mut Store, target: &FetchTarget, force: bool) -> Result<FetchOutcome> {
        match target {
            FetchTarget::Url(url) => self.fetch_url(store, url, force),
            FetchTarget::Upload(path) => {
                let search_url = self.upload(store, path, force)?;
                self.fetch_url(store, &search_url, force)
            }
        }
    }

    /// Cache key for GET requests: the headers this fetcher sends.
    fn get_kwargs(&self) -> String {
        json!({ "headers": { "User-Agent": self.user_agent } }).to_string()
    }

    fn fetch_url(&self, store: &mut Store, url: &Url, force: bool) -> Result<FetchOutcome> {
        let kwargs = self.get_kwargs();
        if !force {
            if let Some(cached) = store.find_response(url.as_str(), Method::Get.as_str(), &kwargs)? {
                if let Ok(final_url) = Url::parse(&cached.final_url) {
                    return Ok(FetchOutcome {
                        body: cached.text,
                        final_url,
                        status: cached.status,
                        headers: cached.headers,
                        from_cache: true,
                        rendered: false,
                    });
                }
            }
        }

        let outcome = if is_block_page(url) {
            self.render_past_block(url)?
        } else {
            let mut request = HttpRequest::get(url.clone(), self.timeout);
            request.headers.push(("User-Agent".to_string(), self.user_agent.clone()));
            let response = self.transport.execute(&request)?;
            self.check_block(url, response)?
        };

        let mut session = store.session()?;
        session.store_response(
            url.as_str(),
            Method::Get.as_str(),
            &kwargs,
            outcome.status,
            outcome.final_url.as_str(),
            &outcome.body,
            &outcome.headers,
        )?;
        session.commit()?;
        debug!(url = %url, status = outcome.status, rendered = outcome.rendered, "fetched");
        Ok(outcome)
    }

    /// Turns a live response into an outcome, recovering from a bot-block
    /// through the browser when possible.
    fn check_block(&self, requested: &Url, response: HttpResponse) -> Result<FetchOutcome> {
        if is_block_page(&response.final_url) {
            return self.render_past_block(&response.final_url);
        }
        if response.body.contains(UNUSUAL_TRAFFIC) {
            return Err(IngestError::BotBlocked {
                url: requested.to_string(),
                reason: "unusual traffic page served".to_string(),
            });
        }
        if response.status >= 400 {
            return Err(IngestError::FetchTransport {
                url: requested.to_string(),
                message: format!("HTTP status {}", response.status),
            });
        }
        Ok(FetchOutcome {
            body: response.body,
            final_url: response.final_url,
            status: response.status,
            headers: response.headers,
            from_cache: false,
            rendered: false,
        })
    }

    fn render_past_block(&self, block_url: &Url) -> Result<FetchOutcome> {
        let Some(browser) = &self.browser else {
            warn!(url = %block_url, "bot-block page and no browser fallback");
            return Err(IngestError::BotBlocked {
                url: block_url.to_string(),
                reason: "redirected to block page".to_string(),
            });
        };
        let target = continue_target(block_url)?;
        info!(url = %target, "bot-block page, rendering with headless browser");
        let body = browser.render(&target)?;
        if body.contains(UNUSUAL_TRAFFIC) {
            return Err(IngestError::BotBlocked {
                url: target.to_string(),
                reason: "browser render was blocked too".to_string(),
            });
        }
        Ok(FetchOutcome {
            body,
            final_url: target,
            status: 200,
            headers: Vec::new(),
            from_cache: false,
            rendered: true,
        })
    }

    /// Posts `path` to the upload endpoint and returns the search URL the
    /// endpoint redirects to.
    pub fn upload(&self, store: &mut Store, path: &Path, force: bool) -> Result<Url> {
        let endpoint = Url::parse(UPLOAD_ENDPOINT)
            .map_err(|err| IngestError::invalid(format!("bad upload endpoint: {err}")))?;
        let checksum = hasher::calculate_hash(path)?;
        let kwargs = json!({ "checksum": checksum }).to_string();

        if !force {
            if let Some(cached) = store.find_response(UPLOAD_ENDPOINT, Method::Post.as_str(), &kwargs)? {
                if let Some(location) = location_of(&endpoint, &cached.headers) {
                    debug!(path = %path.display(), "upload redirect from cache");
                    return Ok(location);
                }
            }
        }

        let bytes = fs::read(path)?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{checksum}.img"));
        let request = HttpRequest {
            method: Method::Post,
            url: endpoint.clone(),
            headers: vec![("User-Agent".to_string(), self.user_agent.clone())],
            timeout: self.timeout,
            follow_redirects: false,
            form: vec![("image_content".to_string(), String::new())],
            upload: Some(Upload {
                field: "encoded_image".to_string(),
                file_name,
                mime: mimetype::detect_mimetype(path)?,
                bytes,
            }),
        };
        let response = self.transport.execute(&request)?;
        let location = location_of(&endpoint, &response.headers).ok_or_else(|| IngestError::FetchTransport {
            url: UPLOAD_ENDPOINT.to_string(),
            message: format!("upload answered {} without a Location header", response.status),
        })?;

        let mut session = store.session()?;
        session.store_response(
            UPLOAD_ENDPOINT,
            Method::Post.as_str(),
            &kwargs,
            response.status,
            response.final_url.as_str(),
            &response.body,
            &response.headers,
        )?;
        session.commit()?;
        info!(path = %path.display(), search_url = %location, "image uploaded");
        Ok(location)
    }
}

fn location_of(endpoint: &Url, headers: &[(String, String)]) -> Option<Url> {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("location"))
        .and_then(|(_, value)| endpoint.join(value).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Answers every request with the next queued response.
    struct Scripted {
        responses: Mutex<Vec<HttpResponse>>,
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl Scripted {
        fn new(mut responses: Vec<HttpResponse>) -> Arc<Self> {
            responses.reverse();
            Arc::new(Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    impl HttpTransport for Scripted {
        fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
            self.requests.lock().unwrap().push(request.clone());
            self.responses.lock().unwrap().pop().ok_or_else(|| IngestError::FetchTransport {
                url: request.url.to_string(),
                message: "no scripted response".into(),
            })
        }
    }

    struct Echo;

    impl BrowserRenderer for Echo {
        fn render(&self, url: &Url) -> Result<String> {
            Ok(format!("<html>rendered {url}</html>"))
        }
    }

    fn response(url: &str, status: u16, body: &str) -> HttpResponse {
        HttpResponse {
            status,
            final_url: Url::parse(url).unwrap(),
            body: body.to_string(),
            headers: Vec::new(),
        }
    }

    const BLOCK: &str = "https://ipv4.google.com/sorry/index?continue=https://www.google.com/search%3Fq%3Dcat";

    fn target(url: &str) -> FetchTarget {
        FetchTarget::Url(Url::parse(url).unwrap())
    }

    #[test]
    fn responses_are_cached_until_forced() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        let mut first = response("http://x/page", 200, "first");
        first.headers.push(("Content-Type".into(), "text/html; charset=UTF-8".into()));
        let transport = Scripted::new(vec![first, response("http://x/page", 200, "second")]);
        let fetcher = Fetcher::with_transport(transport.clone(), &FetchConfig::default());

        let first = fetcher.fetch(&mut store, &target("http://x/page"), false)?;
        let cached = fetcher.fetch(&mut store, &target("http://x/page"), false)?;
        assert_eq!(cached.body, "first");
        assert!(cached.from_cache && !first.from_cache);
        assert_eq!(
            cached.headers,
            vec![("Content-Type".to_string(), "text/html; charset=UTF-8".to_string())]
        );
        assert_eq!(transport.calls(), 1);

        let forced = fetcher.fetch(&mut store, &target("http://x/page"), true)?;
        assert_eq!(forced.body, "second");
        assert!(forced.headers.is_empty());
        assert_eq!(store.count_rows("responses")?, 1);
        let stored = store
            .find_response("http://x/page", Method::Get.as_str(), &fetcher.get_kwargs())?
            .unwrap();
        assert_eq!(stored.text, "second");
        assert!(stored.headers.is_empty());
        Ok(())
    }

    #[test]
    fn block_redirect_without_browser_fails() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        let transport = Scripted::new(vec![response(BLOCK, 200, "<html>sorry</html>")]);
        let fetcher = Fetcher::with_transport(transport, &FetchConfig::default());
        let err = fetcher.fetch(&mut store, &target("https://www.google.com/search?q=cat"), false);
        assert!(matches!(err, Err(IngestError::BotBlocked { .. })));
        assert_eq!(store.count_rows("responses")?, 0);
        Ok(())
    }

    #[test]
    fn block_redirect_renders_continue_target() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        let transport = Scripted::new(vec![response(BLOCK, 200, "<html>sorry</html>")]);
        let fetcher =
            Fetcher::with_transport(transport, &FetchConfig::default()).with_browser(Arc::new(Echo));
        let outcome = fetcher.fetch(&mut store, &target("https://www.google.com/search?q=cat"), false)?;
        assert!(outcome.rendered);
        assert_eq!(outcome.final_url.as_str(), "https://www.google.com/search?q=cat");
        assert!(outcome.body.contains("rendered"));
        Ok(())
    }

    #[test]
    fn unusual_traffic_marker_is_blocked() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        let body = "Our systems have detected unusual traffic from your computer network.";
        let transport = Scripted::new(vec![response("https://www.google.com/search?q=cat", 200, body)]);
        let fetcher =
            Fetcher::with_transport(transport, &FetchConfig::default()).with_browser(Arc::new(Echo));
        let err = fetcher.fetch(&mut store, &target("https://www.google.com/search?q=cat"), false);
        assert!(matches!(err, Err(IngestError::BotBlocked { .. })));
        Ok(())
    }

    #[test]
    fn error_status_is_transport_error_and_not_cached() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        let transport = Scripted::new(vec![response("http://x/gone", 503, "busy")]);
        let fetcher = Fetcher::with_transport(transport, &FetchConfig::default());
        let err = fetcher.fetch(&mut store, &target("http://x/gone"), false);
        assert!(matches!(&err, Err(e) if e.is_retryable()));
        assert_eq!(store.count_rows("responses")?, 0);
        Ok(())
    }

    #[test]
    fn upload_follows_location_and_caches_redirect() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("cat.png");
        fs::write(&path, b"\x89PNG\r\n\x1a\nrest")?;

        let mut redirect = response(UPLOAD_ENDPOINT, 302, "");
        redirect.headers.push(("Location".into(), "/search?tbs=sbi:abc".into()));
        let transport = Scripted::new(vec![
            redirect,
            response("http://www.google.com/search?tbs=sbi:abc", 200, "<html>results</html>"),
        ]);
        let fetcher = Fetcher::with_transport(transport.clone(), &FetchConfig::default());
        let mut store = Store::open_in_memory()?;

        let outcome = fetcher.fetch(&mut store, &FetchTarget::Upload(path.clone()), false)?;
        assert_eq!(outcome.body, "<html>results</html>");
        {
            let requests = transport.requests.lock().unwrap();
            let upload = requests[0].upload.as_ref().unwrap();
            assert_eq!(upload.field, "encoded_image");
            assert_eq!(upload.mime, "image/png");
            assert!(!requests[0].follow_redirects);
        }

        let again = fetcher.fetch(&mut store, &FetchTarget::Upload(path), false)?;
        assert!(again.from_cache);
        assert_eq!(transport.calls(), 2);
        Ok(())
    }

    #[test]
    fn block_page_detection() {
        assert!(is_block_page(&Url::parse(BLOCK).unwrap()));
        assert!(!is_block_page(&Url::parse("https://ipv4.google.com/search").unwrap()));
        let target = continue_target(&Url::parse(BLOCK).unwrap()).unwrap();
        assert_eq!(target.as_str(), "https://www.google.com/search?q=cat");
    }
}
