//! Ingestion orchestration: fetch → extract → resolve, one state machine per
//! run, each run committed in one session or not at all.

pub mod state;

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::thread;

use tracing::{debug, info, info_span, warn};
use url::Url;

use crate::database::models::{SearchImagePageRecord, SearchQueryRecord, SearchType};
use crate::database::repo::Store;
use crate::database::session::{IdentityKey, Session};
use crate::error::{IngestError, Result};
use crate::fetch::{FetchOutcome, FetchTarget, Fetcher};
use crate::ingest::image_file::{self, ImageInfo};
use crate::resolve::{resolve_entry, resolve_extraction};
use crate::strategy::search_image::{parse_search_image_page, SearchImageParse};
use crate::strategy::{Extraction, RawTag, Registry, Role, StrategyInfo};
use crate::utils::config::Config;

pub use state::{CancelToken, PipelineRun, PipelineState};

const SEARCH_BY_URL_ENDPOINT: &str = "https://www.google.com/searchbyimage";
/// Parser for the similar/size result pages of a reverse-image search.
const RESULT_PAGE_PARSER: &str = "google-image";

/// The image a reverse-image search starts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageInput {
    File(PathBuf),
    Url(Url),
}

impl ImageInput {
    /// Exactly one of `file` and `url` must be given.
    pub fn from_parts(file: Option<PathBuf>, url: Option<String>) -> Result<Self> {
        match (file, url) {
            (Some(_), Some(_)) => Err(IngestError::invalid(
                "give either an image file or an image url, not both",
            )),
            (None, None) => Err(IngestError::invalid("an image file or an image url is required")),
            (Some(path), None) => {
                if !path.is_file() {
                    return Err(IngestError::invalid(format!("{} is not a file", path.display())));
                }
                Ok(ImageInput::File(path))
            }
            (None, Some(raw)) => {
                let url = Url::parse(raw.trim())
                    .map_err(|err| IngestError::invalid(format!("bad image url {raw:?}: {err}")))?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(IngestError::invalid(format!("image url must be http(s): {url}")));
                }
                Ok(ImageInput::Url(url))
            }
        }
    }
}

impl fmt::Display for ImageInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageInput::File(path) => write!(f, "{}", path.display()),
            ImageInput::Url(url) => write!(f, "{url}"),
        }
    }
}

fn search_by_url(image_url: &Url) -> Result<Url> {
    Url::parse_with_params(
        SEARCH_BY_URL_ENDPOINT,
        &[("image_url", image_url.as_str()), ("safe", "off")],
    )
    .map_err(|err| IngestError::invalid(format!("bad search url for {image_url}: {err}")))
}

pub struct Orchestrator {
    registry: Registry,
    fetcher: Fetcher,
    config: Config,
    cancel: CancelToken,
}

impl Orchestrator {
    /// Built-in strategies and a live fetcher.
    pub fn new(config: Config) -> Result<Self> {
        let registry = Registry::with_defaults(&config.tags);
        let fetcher = Fetcher::new(&config.fetch)?;
        Ok(Self::with_parts(config, registry, fetcher))
    }

    pub fn with_parts(config: Config, registry: Registry, fetcher: Fetcher) -> Self {
        Self {
            registry,
            fetcher,
            config,
            cancel: CancelToken::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Cancelling the token stops every run of this orchestrator at its next
    /// stage boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Seeds hidden namespaces and aliases from the config.
    pub fn prepare_store(&self, store: &mut Store) -> Result<()> {
        store.apply_tag_config(&self.config.tags)
    }

    pub fn list_strategies(&self, role: Role) -> Vec<StrategyInfo> {
        self.registry.list(role)
    }

    pub fn run_tag_preprocessor(&self, tags: Vec<RawTag>) -> Vec<RawTag> {
        self.registry.preprocess(tags)
    }

    /// Fetches, extracts and persists one page of results for `term`. A
    /// previously completed query is served from the store unless
    /// `force_refresh` is set.
    pub fn resolve_search_query(
        &self,
        store: &mut Store,
        term: &str,
        page: u32,
        mode: &str,
        force_refresh: bool,
    ) -> Result<SearchQueryRecord> {
        let span = info_span!("search_query", term, page, mode);
        let _enter = span.enter();

        let mut run = PipelineRun::new(self.cancel.clone());
        let result = self
            .search_query(&mut run, store, term, page, mode, force_refresh)
            .and_then(|id| store.load_search_query(id));
        if let Err(err) = &result {
            warn!(error = %err, stage = %run.state(), "search query failed");
            run.fail();
        }
        result
    }

    fn search_query(
        &self,
        run: &mut PipelineRun,
        store: &mut Store,
        term: &str,
        page: u32,
        mode_name: &str,
        force_refresh: bool,
    ) -> Result<i64> {
        let term = term.trim();
        if term.is_empty() {
            return Err(IngestError::invalid("search term is empty"));
        }
        if page == 0 {
            return Err(IngestError::invalid("pages start at 1"));
        }
        let mode = self.registry.mode(mode_name)?;
        let parser = self.registry.parser(mode.parser())?;
        let request = mode.build_request(term, page)?;

        if !force_refresh {
            if let Some(id) = store.find_search_query(term, page, mode_name)? {
                run.advance(PipelineState::Done)?;
                info!(search_query = id, "served from store");
                return Ok(id);
            }
        }

        run.advance(PipelineState::Fetching)?;
        let outcome = self.fetch(store, &FetchTarget::Url(request), force_refresh)?;

        run.advance(PipelineState::Extracting)?;
        let mut extraction = parser.parse(&outcome.body, Some(&outcome.final_url))?;
        extraction.map_tags(|tags| self.registry.preprocess(tags));
        extraction.global_tags.extend(mode.global_tags(term));
        log_extraction(&extraction);

        run.advance(PipelineState::Resolving)?;
        let mut session = store.session()?;
        let term_id = session.search_term(term)?;
        let (query_id, created) = session.search_query(term_id, page, mode_name)?;
        let resolution = resolve_extraction(&mut session, &extraction)?;
        for match_result_id in &resolution.match_results {
            session.link_search_query_match_result(query_id, *match_result_id)?;
        }
        session.commit()?;

        run.advance(PipelineState::Done)?;
        info!(
            search_query = query_id,
            new = created,
            match_results = resolution.match_results.len(),
            "search query resolved"
        );
        Ok(query_id)
    }

    /// Runs a reverse-image search for `input` and persists the requested
    /// result page. Only page 1 exists for these searches.
    pub fn resolve_search_image(
        &self,
        store: &mut Store,
        input: &ImageInput,
        search_type: SearchType,
        page: u32,
        force_refresh: bool,
    ) -> Result<SearchImagePageRecord> {
        let span = info_span!("search_image", input = %input, %search_type);
        let _enter = span.enter();

        if page != 1 {
            return Err(IngestError::invalid(format!(
                "reverse-image searches have a single page, got page {page}"
            )));
        }

        let mut root_run = PipelineRun::new(self.cancel.clone());
        let search_image_id = match self.search_image(&mut root_run, store, input, force_refresh) {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %err, stage = %root_run.state(), "reverse-image search failed");
                root_run.fail();
                return Err(err);
            }
        };

        let mut page_run = PipelineRun::new(self.cancel.clone());
        let result = self
            .search_image_page(&mut page_run, store, search_image_id, search_type, page, force_refresh)
            .and_then(|id| store.load_search_image_page(id));
        if let Err(err) = &result {
            warn!(error = %err, stage = %page_run.state(), "search image page failed");
            page_run.fail();
        }
        result
    }

    /// The SearchImage root: reused when it already carries a search url,
    /// otherwise fetched and parsed.
    fn search_image(
        &self,
        run: &mut PipelineRun,
        store: &mut Store,
        input: &ImageInput,
        force_refresh: bool,
    ) -> Result<i64> {
        let info = match input {
            ImageInput::File(path) => Some(image_file::inspect(path)?),
            ImageInput::Url(_) => None,
        };
        let key = match (input, &info) {
            (ImageInput::Url(url), _) => store
                .find(&IdentityKey::Url(url.to_string()))?
                .map(IdentityKey::SearchImageByUrl),
            (ImageInput::File(_), info) => info
                .as_ref()
                .map(|info| IdentityKey::SearchImageByChecksum(info.checksum.clone())),
        };
        if !force_refresh {
            if let Some(key) = &key {
                if let Some(id) = store.find(key)? {
                    if store.load_search_image(id)?.search_url.is_some() {
                        run.advance(PipelineState::Done)?;
                        info!(search_image = id, "served from store");
                        return Ok(id);
                    }
                }
            }
        }

        run.advance(PipelineState::Fetching)?;
        let target = match input {
            ImageInput::File(path) => FetchTarget::Upload(path.clone()),
            ImageInput::Url(url) => FetchTarget::Url(search_by_url(url)?),
        };
        let outcome = self.fetch(store, &target, force_refresh)?;

        run.advance(PipelineState::Extracting)?;
        let parsed = parse_search_image_page(&outcome.body, &outcome.final_url);
        let thumbnail = match (input, &self.config.thumb_folder) {
            (ImageInput::File(path), Some(folder)) => Some((image_file::render_thumbnail(path)?, folder)),
            _ => None,
        };

        run.advance(PipelineState::Resolving)?;
        let mut session = store.session()?;
        let key = match input {
            ImageInput::File(path) => {
                let info = info
                    .as_ref()
                    .ok_or_else(|| IngestError::invalid(format!("{} was not inspected", path.display())))?;
                let file_id = record_image_file(&mut session, info)?;
                if let Some((thumb, _)) = &thumbnail {
                    let thumb_id = record_image_file(&mut session, &thumb.info)?;
                    session.set_image_thumbnail(file_id, thumb_id)?;
                }
                IdentityKey::SearchImageByChecksum(info.checksum.clone())
            }
            ImageInput::Url(url) => {
                let (url_id, _) = session.url(url.as_str(), None, None)?;
                IdentityKey::SearchImageByUrl(url_id)
            }
        };
        let (search_image_id, _) = session.search_image(key)?;
        record_search_image(&mut session, search_image_id, &outcome, &parsed)?;
        // The thumbnail reaches disk only once its rows are written, and is
        // removed again if they do not commit.
        let saved = match &thumbnail {
            Some((thumb, folder)) => Some(thumb.save(folder)?),
            None => None,
        };
        if let Err(err) = session.commit() {
            if let Some((path, true)) = &saved {
                if let Err(remove_err) = fs::remove_file(path) {
                    warn!(path = %path.display(), error = %remove_err, "orphan thumbnail left on disk");
                }
            }
            return Err(err);
        }

        run.advance(PipelineState::Done)?;
        info!(
            search_image = search_image_id,
            text_matches = parsed.text_matches.len(),
            similar = parsed.similar_search_url.is_some(),
            size = parsed.size_search_url.is_some(),
            "reverse-image search resolved"
        );
        Ok(search_image_id)
    }

    fn search_image_page(
        &self,
        run: &mut PipelineRun,
        store: &mut Store,
        search_image_id: i64,
        search_type: SearchType,
        page: u32,
        force_refresh: bool,
    ) -> Result<i64> {
        if !force_refresh {
            let key = IdentityKey::SearchImagePage {
                search_image_id,
                search_type,
                page,
            };
            if let Some(id) = store.find(&key)? {
                run.advance(PipelineState::Done)?;
                info!(search_image_page = id, "served from store");
                return Ok(id);
            }
        }

        let root = store.load_search_image(search_image_id)?;
        let target = match search_type {
            SearchType::Similar => root.similar_search_url,
            SearchType::Size => root.size_search_url,
        }
        .ok_or_else(|| IngestError::NoResultFound(search_type.to_string()))?;
        let target = Url::parse(&target)
            .map_err(|err| IngestError::malformed(format!("stored {search_type} url {target:?}: {err}")))?;
        let parser = self.registry.parser(RESULT_PAGE_PARSER)?;

        run.advance(PipelineState::Fetching)?;
        let outcome = self.fetch(store, &FetchTarget::Url(target), force_refresh)?;

        run.advance(PipelineState::Extracting)?;
        let mut extraction = parser.parse(&outcome.body, Some(&outcome.final_url))?;
        extraction.map_tags(|tags| self.registry.preprocess(tags));
        log_extraction(&extraction);

        run.advance(PipelineState::Resolving)?;
        let mut session = store.session()?;
        let (page_id, _) = session.search_image_page(search_image_id, search_type, page)?;
        let resolution = resolve_extraction(&mut session, &extraction)?;
        for match_result_id in &resolution.match_results {
            session.link_search_image_page_match_result(page_id, *match_result_id)?;
        }
        session.commit()?;

        run.advance(PipelineState::Done)?;
        info!(
            search_image_page = page_id,
            match_results = resolution.match_results.len(),
            "search image page resolved"
        );
        Ok(page_id)
    }

    /// Fetches with the configured retry budget. Only timeouts and transport
    /// errors are retried, with a linearly growing pause between attempts.
    fn fetch(&self, store: &mut Store, target: &FetchTarget, force_refresh: bool) -> Result<FetchOutcome> {
        let attempts = self.config.fetch.retries.saturating_add(1);
        let mut attempt = 1;
        loop {
            match self.fetcher.fetch(store, target, force_refresh) {
                Err(err) if err.is_retryable() && attempt < attempts => {
                    let pause = self.config.fetch.retry_backoff() * attempt;
                    warn!(error = %err, attempt, ?pause, "fetch failed, retrying");
                    thread::sleep(pause);
                    if self.cancel.is_cancelled() {
                        return Err(IngestError::Cancelled(PipelineState::Fetching));
                    }
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

fn log_extraction(extraction: &Extraction) {
    debug!(
        entries = extraction.len(),
        skipped = extraction.skipped.len(),
        malformed = extraction.malformed,
        "page extracted"
    );
}

fn record_image_file(session: &mut Session<'_>, info: &ImageInfo) -> Result<i64> {
    let (id, _) = session.image_file(
        &info.checksum,
        Some(info.width),
        Some(info.height),
        info.format.as_deref(),
        Some(info.size),
    )?;
    Ok(id)
}

/// Writes the parsed landing page onto the search image: its urls, guess,
/// main similar results and text matches. Text-match images become match
/// results tagged with what the match said about them.
fn record_search_image(
    session: &mut Session<'_>,
    search_image_id: i64,
    outcome: &FetchOutcome,
    parsed: &SearchImageParse,
) -> Result<()> {
    session.update_search_image(
        search_image_id,
        outcome.final_url.as_str(),
        parsed.similar_search_url.as_deref(),
        parsed.size_search_url.as_deref(),
        parsed.img_guess.as_deref(),
    )?;
    for similar in &parsed.main_similar_results {
        session.main_similar_result(search_image_id, similar.title.as_deref(), &similar.search_url)?;
    }
    for text_match in &parsed.text_matches {
        let image = text_match.image.as_ref();
        let (text_match_id, _) = session.text_match(
            search_image_id,
            &text_match.title,
            &text_match.url,
            text_match.url_text.as_deref(),
            text_match.text.as_deref(),
            image.map(|i| i.imgres_url.as_str()),
            image.and_then(|i| i.imgref_url.as_deref()),
        )?;
        if let Some(entry) = text_match.image_entry() {
            let (_, match_results) = resolve_entry(session, &entry, &[])?;
            if let Some(match_result_id) = match_results.first() {
                session.set_text_match_result(text_match_id, *match_result_id)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_input_needs_exactly_one_source() {
        assert!(matches!(
            ImageInput::from_parts(None, None),
            Err(IngestError::InvalidInput(_))
        ));
        assert!(matches!(
            ImageInput::from_parts(Some("a.png".into()), Some("http://x/a.png".into())),
            Err(IngestError::InvalidInput(_))
        ));
    }

    #[test]
    fn image_input_checks_its_source() {
        assert!(matches!(
            ImageInput::from_parts(Some("/definitely/not/here.png".into()), None),
            Err(IngestError::InvalidInput(_))
        ));
        assert!(matches!(
            ImageInput::from_parts(None, Some("ftp://x/a.png".into())),
            Err(IngestError::InvalidInput(_))
        ));
        let input = ImageInput::from_parts(None, Some(" http://x/a.png ".into())).unwrap();
        assert_eq!(input, ImageInput::Url(Url::parse("http://x/a.png").unwrap()));
    }

    #[test]
    fn search_by_url_encodes_the_image_url() {
        let url = search_by_url(&Url::parse("http://x/a b.png?s=1").unwrap()).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            pairs,
            vec![
                ("image_url".to_string(), "http://x/a%20b.png?s=1".to_string()),
                ("safe".to_string(), "off".to_string()),
            ]
        );
    }
}
