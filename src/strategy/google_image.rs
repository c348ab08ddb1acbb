use scraper::{ElementRef, Html};
use serde_json::{Map, Value};
use tracing::{debug, warn};
use url::Url;

use crate::error::{IngestError, Result};
use crate::strategy::extraction::{all_matches, query_params, selectors, Extraction, ImageRef, RawTag};
use crate::strategy::{Mode, Parser};

const SEARCH_ENDPOINT: &str = "https://www.google.com/search";
const RESULTS_PER_PAGE: u64 = 100;
const XSSI_PREFIX: &str = ")]}'";

/// Reads google image result blocks (`.rg_bx`) and their `.rg_meta` JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct GoogleImageParser;

impl Parser for GoogleImageParser {
    fn name(&self) -> &str {
        "google-image"
    }

    fn description(&self) -> &str {
        "google image result blocks with their metadata JSON"
    }

    fn parse(&self, body: &str, source: Option<&Url>) -> Result<Extraction> {
        let html = chunk_html(body)?;
        let document = Html::parse_document(&html);
        let blocks = selectors(&[".rg_bx"]);
        let mut extraction = Extraction::new();
        for block in all_matches(document.root_element(), &blocks) {
            match parse_block(block, source, &mut extraction) {
                Ok(()) => {}
                Err(IngestError::MalformedPage(reason)) => {
                    warn!(%reason, "skipping malformed result block");
                    extraction.malformed += 1;
                }
                Err(other) => return Err(other),
            }
        }
        debug!(
            results = extraction.len(),
            malformed = extraction.malformed,
            "google image page parsed"
        );
        Ok(extraction)
    }
}

/// HTML payload of a search response: the JSON chunk's `[1][1]` string,
/// or for a plain HTML body everything from the first `<style>`.
fn chunk_html(body: &str) -> Result<String> {
    let trimmed = body.trim_start();
    let json_text = trimmed.strip_prefix(XSSI_PREFIX).unwrap_or(trimmed);
    if let Ok(value) = serde_json::from_str::<Value>(json_text) {
        return value
            .get(1)
            .and_then(|v| v.get(1))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| IngestError::malformed("JSON response has no HTML chunk at [1][1]"));
    }
    Ok(match body.find("<style>") {
        Some(start) => body[start..].to_string(),
        None => body.to_string(),
    })
}

fn parse_block(block: ElementRef<'_>, source: Option<&Url>, extraction: &mut Extraction) -> Result<()> {
    let anchor_selector = selectors(&["a[href]"]);
    let meta_selector = selectors(&[".rg_meta"]);

    let href = anchor_selector
        .iter()
        .find_map(|s| block.select(s).next())
        .and_then(|a| a.value().attr("href"))
        .map(str::to_string);
    let meta = meta_selector
        .iter()
        .find_map(|s| block.select(s).next())
        .ok_or_else(|| IngestError::malformed("block without .rg_meta"))?;
    let json: Value = serde_json::from_str(&meta.text().collect::<String>())
        .map_err(|err| IngestError::malformed(format!("invalid .rg_meta JSON: {err}")))?;
    let fields = json
        .as_object()
        .ok_or_else(|| IngestError::malformed(".rg_meta is not a JSON object"))?;

    let mut tags: Vec<RawTag> = Vec::new();
    let params = href.as_deref().map(query_params).unwrap_or_default();
    if let Some(href) = &href {
        let imgres = extraction.link(href, source).unwrap_or_else(|| href.clone());
        tags.push((Some("imgres url".to_string()), imgres));
    }
    if let Some(imgref) = params.get("imgrefurl") {
        tags.push((Some("imgref url".to_string()), imgref.clone()));
    }
    tags.extend(
        fields
            .iter()
            .map(|(key, value)| (Some(key.clone()), value_text(value))),
    );

    // The anchor's own imgurl/w/h beat the same fields in the JSON blob.
    let from_anchor = match (
        params.get("imgurl"),
        params.get("w").and_then(|w| w.parse().ok()),
        params.get("h").and_then(|h| h.parse().ok()),
    ) {
        (Some(url), Some(width), Some(height)) => Some(ImageRef::sized(url.clone(), Some(width), Some(height))),
        _ => None,
    };
    let image = match from_anchor {
        Some(image) => image,
        None => ImageRef::sized(
            required_str(fields, "ou")?,
            dimension(fields.get("ow")),
            dimension(fields.get("oh")),
        ),
    };
    let thumbnail = ImageRef::sized(
        required_str(fields, "tu")?,
        dimension(fields.get("tw")),
        dimension(fields.get("th")),
    );

    let Some(image_url) = extraction.link(&image.value, source) else {
        return Ok(());
    };
    let thumbnail_url = extraction.link(&thumbnail.value, source);

    let entry = extraction.entry(ImageRef::sized(image_url, image.width, image.height));
    if let Some(thumbnail_url) = thumbnail_url {
        entry.add_thumbnail(ImageRef::sized(thumbnail_url, thumbnail.width, thumbnail.height));
    }
    entry.tags.extend(tags);
    entry.add_provenance(json.clone());
    Ok(())
}

fn required_str(fields: &Map<String, Value>, key: &str) -> Result<String> {
    fields
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .map(str::to_string)
        .ok_or_else(|| IngestError::malformed(format!("metadata lacks required key {key}")))
}

fn dimension(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Google image search through the `ichunk` endpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct GoogleImageMode;

impl Mode for GoogleImageMode {
    fn name(&self) -> &str {
        "google-image"
    }

    fn description(&self) -> &str {
        "google image search, 100 results per page"
    }

    fn build_request(&self, term: &str, page: u32) -> Result<Url> {
        if term.trim().is_empty() {
            return Err(IngestError::invalid("search term is empty"));
        }
        if page == 0 {
            return Err(IngestError::invalid("pages start at 1"));
        }
        let index = page - 1;
        let ijn = index.to_string();
        let start = (u64::from(index) * RESULTS_PER_PAGE).to_string();
        Url::parse_with_params(
            SEARCH_ENDPOINT,
            &[
                ("asearch", "ichunk"),
                ("async", "_id:rg_s,_pms:s,_fmt:pc"),
                ("ijn", ijn.as_str()),
                ("q", term),
                ("start", start.as_str()),
                ("tbm", "isch"),
                ("yv", "3"),
            ],
        )
        .map_err(|err| IngestError::invalid(format!("cannot build search url: {err}")))
    }

    fn parser(&self) -> &str {
        "google-image"
    }
}
