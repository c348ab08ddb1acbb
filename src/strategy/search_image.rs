//! Reverse-image search result page.
//!
//! Markup on these pages changes often, so each field is located through an
//! ordered list of selectors and is simply absent when none match.

use scraper::{ElementRef, Html};
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::strategy::extraction::{
    all_matches, first_match, query_params, resolve_link, selectors, text_of, ImageRef, RawTag, UrlEntry,
};

const SIZE_SEARCH: &[&str] = &["._v6 .gl a", r#".card-section span > a[href^="/search"]"#];
const SIMILAR_SEARCH: &[&str] = &["h3._DM a", r#"h3 a[href^="/search"]"#];
const IMAGE_GUESS: &[&str] = &["._hUb a", ".card-section > div > a"];
const MAIN_SIMILAR: &[&str] = &[".rg_ul .rg_el"];
const TEXT_MATCHES: &[&str] = &["._NId > .srg > .g", ".srg > .g"];

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchImageParse {
    pub size_search_url: Option<String>,
    pub similar_search_url: Option<String>,
    pub img_guess: Option<String>,
    pub main_similar_results: Vec<MainSimilar>,
    pub text_matches: Vec<TextMatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MainSimilar {
    pub title: Option<String>,
    pub search_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextMatch {
    pub title: String,
    pub url: String,
    pub url_text: Option<String>,
    pub text: Option<String>,
    pub image: Option<TextMatchImage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TextMatchImage {
    pub imgres_url: String,
    pub imgref_url: Option<String>,
    pub url: ImageRef,
    pub thumbnail: ImageRef,
}

impl TextMatch {
    /// Tags for the matched image's Url.
    pub fn image_tags(&self) -> Vec<RawTag> {
        let Some(image) = &self.image else {
            return Vec::new();
        };
        let mut tags = vec![(Some("imgres url".to_string()), image.imgres_url.clone())];
        if let Some(imgref) = &image.imgref_url {
            tags.push((Some("page url".to_string()), imgref.clone()));
            tags.push((Some("imgref url".to_string()), imgref.clone()));
        }
        tags.push((Some("page url".to_string()), self.url.clone()));
        tags.push((Some("title".to_string()), self.title.clone()));
        if let Some(url_text) = &self.url_text {
            tags.push((Some("page url text".to_string()), url_text.clone()));
        }
        tags.retain(|(_, value)| !value.trim().is_empty());
        tags
    }

    /// The matched image as a result entry, thumbnail and tags included.
    pub fn image_entry(&self) -> Option<UrlEntry> {
        let image = self.image.as_ref()?;
        let mut entry = UrlEntry::new(image.url.clone());
        entry.add_thumbnail(image.thumbnail.clone());
        entry.tags = self.image_tags();
        Some(entry)
    }
}

/// Parses the landing page of a reverse-image search. `base` is the page's
/// URL; links on it are site-relative.
pub fn parse_search_image_page(body: &str, base: &Url) -> SearchImageParse {
    let document = Html::parse_document(body);
    let root = document.root_element();

    let link_of = |list: &[&str]| {
        first_match(root, &selectors(list))
            .and_then(|a| a.value().attr("href"))
            .and_then(|href| resolve_link(href, Some(base)))
    };
    let size_search_url = link_of(SIZE_SEARCH);
    let similar_search_url = link_of(SIMILAR_SEARCH);
    let img_guess = first_match(root, &selectors(IMAGE_GUESS))
        .map(text_of)
        .filter(|text| !text.is_empty());

    let main_similar_results = all_matches(root, &selectors(MAIN_SIMILAR))
        .into_iter()
        .filter_map(|el| main_similar(el, base))
        .collect();

    let mut text_matches = Vec::new();
    for el in all_matches(root, &selectors(TEXT_MATCHES)) {
        match text_match(el, base) {
            Some(found) => text_matches.push(found),
            None => warn!("skipping text match without a title link"),
        }
    }

    let parsed = SearchImageParse {
        size_search_url,
        similar_search_url,
        img_guess,
        main_similar_results,
        text_matches,
    };
    debug!(
        similar = parsed.similar_search_url.is_some(),
        size = parsed.size_search_url.is_some(),
        text_matches = parsed.text_matches.len(),
        "search image page parsed"
    );
    parsed
}

fn main_similar(el: ElementRef<'_>, base: &Url) -> Option<MainSimilar> {
    let search_url = first_match(el, &selectors(&["a[href]"]))
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| resolve_link(href, Some(base)))?;
    let title = first_match(el, &selectors(&["img[title]"]))
        .and_then(|img| img.value().attr("title"))
        .map(str::to_string);
    Some(MainSimilar { title, search_url })
}

fn text_match(el: ElementRef<'_>, base: &Url) -> Option<TextMatch> {
    let title = first_match(el, &selectors(&["h3"])).map(text_of)?;
    let url = first_match(el, &selectors(&["h3 a[href]"]))
        .and_then(|a| a.value().attr("href"))
        .and_then(|href| resolve_link(href, Some(base)))?;
    let optional_text = |list: &[&str]| {
        first_match(el, &selectors(list))
            .map(text_of)
            .filter(|text| !text.is_empty())
    };
    let url_text = optional_text(&[".f cite"]);
    let text = optional_text(&[".st"]);
    let image = first_match(el, &selectors(&["img"])).and_then(|img| text_match_image(img, base));
    Some(TextMatch {
        title,
        url,
        url_text,
        text,
        image,
    })
}

fn text_match_image(img: ElementRef<'_>, base: &Url) -> Option<TextMatchImage> {
    let anchor = img
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| el.value().name() == "a")?;
    let imgres_url = resolve_link(anchor.value().attr("href")?, Some(base))?;
    let params = query_params(&imgres_url);
    let dimension = |key: &str| params.get(key).and_then(|v| v.parse().ok());
    let url = resolve_link(params.get("imgurl")?, None)?;
    let thumbnail = resolve_link(img.value().attr("src")?, Some(base))?;
    Some(TextMatchImage {
        imgref_url: params.get("imgrefurl").cloned(),
        url: ImageRef::sized(url, dimension("w"), dimension("h")),
        thumbnail: ImageRef::sized(thumbnail, dimension("tbnw"), dimension("tbnh")),
        imgres_url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://www.google.com/search?tbs=sbi:abc").unwrap()
    }

    const PRIMARY: &str = r#"
        <div class="_v6"><span class="gl"><a href="/search?tbs=simg:size">All sizes</a></span></div>
        <h3 class="_DM"><a href="/search?tbs=simg:similar">Visually similar images</a></h3>
        <div class="_hUb"><a href="/search?q=cat">cat</a></div>
        <div class="rg_ul"><div class="rg_el"><a href="/imgres?a=1"><img title="one" src="x.jpg"></a></div></div>
        <div class="_NId"><div class="srg">
          <div class="g">
            <h3><a href="http://site.com/page">Cat page</a></h3>
            <div class="f"><cite>site.com/page</cite></div>
            <span class="st">About cats</span>
            <div><a href="/imgres?imgurl=http://site.com/cat.jpg&amp;imgrefurl=http://site.com/page&amp;w=800&amp;h=600&amp;tbnw=120&amp;tbnh=90"><g-img><img src="data:image/jpeg;base64,AAAA"></g-img></a></div>
          </div>
          <div class="g"><span class="st">no title</span></div>
        </div></div>
    "#;

    #[test]
    fn primary_selectors() {
        let parsed = parse_search_image_page(PRIMARY, &base());
        assert_eq!(
            parsed.size_search_url.as_deref(),
            Some("https://www.google.com/search?tbs=simg:size")
        );
        assert_eq!(
            parsed.similar_search_url.as_deref(),
            Some("https://www.google.com/search?tbs=simg:similar")
        );
        assert_eq!(parsed.img_guess.as_deref(), Some("cat"));
        assert_eq!(
            parsed.main_similar_results,
            vec![MainSimilar {
                title: Some("one".into()),
                search_url: "https://www.google.com/imgres?a=1".into()
            }]
        );

        assert_eq!(parsed.text_matches.len(), 1);
        let tm = &parsed.text_matches[0];
        assert_eq!(tm.title, "Cat page");
        assert_eq!(tm.url_text.as_deref(), Some("site.com/page"));
        let image = tm.image.as_ref().unwrap();
        assert_eq!(image.url, ImageRef::sized("http://site.com/cat.jpg", Some(800), Some(600)));
        assert_eq!(image.thumbnail.width, Some(120));
        assert_eq!(image.imgref_url.as_deref(), Some("http://site.com/page"));
        let tags = tm.image_tags();
        assert!(tags.contains(&(Some("page url text".into()), "site.com/page".into())));
        assert!(tags.contains(&(Some("imgref url".into()), "http://site.com/page".into())));
        let entry = tm.image_entry().unwrap();
        assert_eq!(entry.thumbnails.len(), 1);
        assert_eq!(entry.tags, tags);
    }

    #[test]
    fn fallback_selectors() {
        let page = r#"
            <div class="card-section"><span><a href="/search?tbs=size2">sizes</a></span></div>
            <h3><a href="/search?tbs=similar2">similar</a></h3>
            <div class="card-section"><div><a href="/search?q=dog">dog</a></div></div>
            <div class="srg"><div class="g"><h3><a href="http://d.com/">Dog</a></h3></div></div>
        "#;
        let parsed = parse_search_image_page(page, &base());
        assert_eq!(
            parsed.size_search_url.as_deref(),
            Some("https://www.google.com/search?tbs=size2")
        );
        assert_eq!(
            parsed.similar_search_url.as_deref(),
            Some("https://www.google.com/search?tbs=similar2")
        );
        assert_eq!(parsed.img_guess.as_deref(), Some("dog"));
        assert_eq!(parsed.text_matches.len(), 1);
        assert!(parsed.text_matches[0].image.is_none());
        assert!(parsed.text_matches[0].image_tags().is_empty());
        assert!(parsed.text_matches[0].image_entry().is_none());
    }

    #[test]
    fn missing_fields_are_absent() {
        let parsed = parse_search_image_page("<html><body><p>nothing</p></body></html>", &base());
        assert_eq!(parsed, SearchImageParse::default());
    }
}
