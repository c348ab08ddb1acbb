use scraper::Html;
use url::Url;

use crate::error::Result;
use crate::strategy::anchor::PageLinksMode;
use crate::strategy::extraction::{resolve_link, selectors, Extraction, ImageRef};
use crate::strategy::Parser;

/// Every distinct absolute link on the page. In-page fragments are not
/// links, and fragments are stripped so `a.html#x` and `a.html#y` are one
/// result.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbsoluteLinksParser;

impl Parser for AbsoluteLinksParser {
    fn name(&self) -> &str {
        "absolute-links"
    }

    fn description(&self) -> &str {
        "distinct absolute links on the page"
    }

    fn parse(&self, body: &str, source: Option<&Url>) -> Result<Extraction> {
        let document = Html::parse_document(body);
        let mut extraction = Extraction::new();
        let base = base_href(&document, source);

        for anchor in selectors(&["a[href]"]).iter().flat_map(|s| document.select(s)) {
            let Some(href) = anchor.value().attr("href").map(str::trim) else {
                continue;
            };
            if href.starts_with('#') {
                continue;
            }
            let Some(link) = extraction.link(href, base.as_ref()) else {
                continue;
            };
            let Ok(mut url) = Url::parse(&link) else {
                continue;
            };
            url.set_fragment(None);
            extraction.entry(ImageRef::new(url.as_str()));
        }
        Ok(extraction)
    }
}

/// `<base href>` when the page declares one, else the page's own URL.
fn base_href(document: &Html, source: Option<&Url>) -> Option<Url> {
    let declared = selectors(&["base[href]"])
        .iter()
        .find_map(|s| document.select(s).next())
        .and_then(|base| base.value().attr("href"))
        .and_then(|href| resolve_link(href, source))
        .and_then(|href| Url::parse(&href).ok());
    declared.or_else(|| source.cloned())
}

pub fn absolute_links_mode() -> PageLinksMode {
    PageLinksMode::new(
        "absolute-links",
        "distinct absolute links on the page at the given URL",
        "absolute-links",
    )
}
