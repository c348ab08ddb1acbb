use scraper::Html;
use url::Url;

use crate::error::{IngestError, Result};
use crate::strategy::extraction::{resolve_link, selectors, Extraction, ImageRef};
use crate::strategy::{Mode, Parser};

/// Anchors wrapping an image: the href is the result, each `img` inside is
/// one of its thumbnails.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnchorImageParser;

impl Parser for AnchorImageParser {
    fn name(&self) -> &str {
        "a-tag-on-img-tag"
    }

    fn description(&self) -> &str {
        "links that wrap an image, with the image as thumbnail"
    }

    fn parse(&self, body: &str, source: Option<&Url>) -> Result<Extraction> {
        let document = Html::parse_document(body);
        let anchors = selectors(&["a[href]"]);
        let images = selectors(&["img[src]"]);
        let mut extraction = Extraction::new();

        for anchor in anchors.iter().flat_map(|s| document.select(s)) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            let sources: Vec<&str> = images
                .iter()
                .flat_map(|s| anchor.select(s))
                .filter_map(|img| img.value().attr("src"))
                .collect();
            if sources.is_empty() {
                continue;
            }
            let Some(url) = extraction.link(href, source) else {
                continue;
            };
            let thumbnails: Vec<String> = sources
                .into_iter()
                .filter_map(|src| extraction.link(src, source))
                .collect();
            if thumbnails.is_empty() {
                continue;
            }
            let entry = extraction.entry(ImageRef::new(url));
            for thumbnail in thumbnails {
                entry.add_thumbnail(ImageRef::new(thumbnail));
            }
        }
        Ok(extraction)
    }
}

/// Every anchor on the page. Anchors wrapping images are read by
/// [`AnchorImageParser`] first; every href it did not take becomes a result
/// without a thumbnail.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnchorParser {
    images: AnchorImageParser,
}

impl Parser for AnchorParser {
    fn name(&self) -> &str {
        "a-tag"
    }

    fn description(&self) -> &str {
        "every link on the page"
    }

    fn parse(&self, body: &str, source: Option<&Url>) -> Result<Extraction> {
        let mut extraction = self.images.parse(body, source)?;

        let document = Html::parse_document(body);
        let anchors = selectors(&["a[href]"]);
        let images = selectors(&["img[src]"]);
        for anchor in anchors.iter().flat_map(|s| document.select(s)) {
            let Some(href) = anchor.value().attr("href") else {
                continue;
            };
            // The image pass already recorded unresolvable hrefs of anchors
            // wrapping an image.
            let wraps_image = images.iter().any(|s| anchor.select(s).next().is_some());
            let url = if wraps_image {
                resolve_link(href, source)
            } else {
                extraction.link(href, source)
            };
            let Some(url) = url else {
                continue;
            };
            if extraction.get(&url).is_none() {
                extraction.entry(ImageRef::new(url));
            }
        }
        Ok(extraction)
    }
}

/// A mode that fetches one page given by its URL and hands it to `parser`.
#[derive(Debug, Clone)]
pub struct PageLinksMode {
    name: &'static str,
    description: &'static str,
    parser: &'static str,
}

impl PageLinksMode {
    pub const fn new(name: &'static str, description: &'static str, parser: &'static str) -> Self {
        Self {
            name,
            description,
            parser,
        }
    }
}

impl Mode for PageLinksMode {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.description
    }

    fn build_request(&self, term: &str, page: u32) -> Result<Url> {
        if page != 1 {
            return Err(IngestError::invalid(format!("{} only supports page 1", self.name)));
        }
        let url = Url::parse(term.trim())
            .map_err(|err| IngestError::invalid(format!("{term:?} is not a URL: {err}")))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            scheme => Err(IngestError::invalid(format!("unsupported URL scheme: {scheme}"))),
        }
    }

    fn parser(&self) -> &str {
        self.parser
    }
}

pub fn a_tag_mode() -> PageLinksMode {
    PageLinksMode::new("a-tag", "every link on the page at the given URL", "a-tag")
}

pub fn a_tag_on_img_tag_mode() -> PageLinksMode {
    PageLinksMode::new(
        "a-tag-on-img-tag",
        "image links on the page at the given URL",
        "a-tag-on-img-tag",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r##"
        <a href="/full/1.jpg"><img src="/thumb/1.jpg"></a>
        <a href="http://other.com/2.jpg"><img src="http://other.com/t2.jpg"><img src="http://other.com/t2b.jpg"></a>
        <a href="#top">top</a>
        <a href="about.html">about</a>
        <a href="javascript:void(0)">js</a>
        <a>no href</a>
    "##;

    fn source() -> Url {
        Url::parse("http://example.com/gallery/").unwrap()
    }

    #[test]
    fn image_anchors_carry_thumbnails() {
        let extraction = AnchorImageParser.parse(PAGE, Some(&source())).unwrap();
        assert_eq!(extraction.len(), 2);
        let first = extraction.get("http://example.com/full/1.jpg").unwrap();
        assert_eq!(first.thumbnails, vec![ImageRef::new("http://example.com/thumb/1.jpg")]);
        assert_eq!(extraction.get("http://other.com/2.jpg").unwrap().thumbnails.len(), 2);
    }

    #[test]
    fn a_tag_adds_plain_links_after_image_links() {
        let extraction = AnchorParser::default().parse(PAGE, Some(&source())).unwrap();
        let urls: Vec<&str> = extraction.entries().iter().map(|e| e.url.value.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "http://example.com/full/1.jpg",
                "http://other.com/2.jpg",
                "http://example.com/gallery/#top",
                "http://example.com/gallery/about.html",
            ]
        );
        assert!(extraction.get("http://example.com/gallery/#top").unwrap().thumbnails.is_empty());
        assert_eq!(extraction.skipped, vec!["javascript:void(0)".to_string()]);
    }

    #[test]
    fn relative_links_without_source_create_nothing() {
        let extraction = AnchorParser::default().parse(PAGE, None).unwrap();
        let urls: Vec<&str> = extraction.entries().iter().map(|e| e.url.value.as_str()).collect();
        assert_eq!(urls, vec!["http://other.com/2.jpg"]);
        assert!(extraction.skipped.contains(&"#top".to_string()));
        assert!(extraction.skipped.contains(&"/full/1.jpg".to_string()));
    }

    #[test]
    fn image_anchor_with_unresolvable_thumbnail_keeps_its_href() {
        let page = r#"<a href="http://x/page"><img src="/thumb.jpg"></a>"#;

        let images = AnchorImageParser.parse(page, None).unwrap();
        assert!(images.is_empty());

        let extraction = AnchorParser::default().parse(page, None).unwrap();
        let urls: Vec<&str> = extraction.entries().iter().map(|e| e.url.value.as_str()).collect();
        assert_eq!(urls, vec!["http://x/page"]);
        assert!(extraction.get("http://x/page").unwrap().thumbnails.is_empty());
        assert_eq!(extraction.skipped, vec!["/thumb.jpg".to_string()]);
    }

    #[test]
    fn page_modes_take_one_http_page() {
        let mode = a_tag_mode();
        assert_eq!(
            mode.build_request("http://example.com/", 1).unwrap().as_str(),
            "http://example.com/"
        );
        assert!(mode.build_request("http://example.com/", 2).is_err());
        assert!(mode.build_request("ftp://example.com/", 1).is_err());
        assert!(mode.build_request("cat", 1).is_err());
        assert_eq!(mode.parser(), "a-tag");
    }
}
