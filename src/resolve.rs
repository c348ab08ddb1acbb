//! Identity resolution: intermediate extraction → persisted entities.

use tracing::debug;

use crate::database::session::Session;
use crate::error::Result;
use crate::strategy::{Extraction, RawTag, UrlEntry};

/// What one extraction resolved to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    /// MatchResult ids in page order, without repeats.
    pub match_results: Vec<i64>,
    pub urls: Vec<i64>,
}

/// Resolves every entry of `extraction` inside `session`. Nothing is
/// committed here; the caller decides.
pub fn resolve_extraction(session: &mut Session<'_>, extraction: &Extraction) -> Result<Resolution> {
    let mut resolution = Resolution::default();
    for entry in extraction.entries() {
        let (url_id, match_results) = resolve_entry(session, entry, &extraction.global_tags)?;
        resolution.urls.push(url_id);
        for id in match_results {
            if !resolution.match_results.contains(&id) {
                resolution.match_results.push(id);
            }
        }
    }
    debug!(
        urls = resolution.urls.len(),
        match_results = resolution.match_results.len(),
        created = session.created_count(),
        "extraction resolved"
    );
    Ok(resolution)
}

/// Resolves one result URL: its Url row, its tags (plus `global_tags`), one
/// MatchResult per thumbnail (or one without a thumbnail), and provenance.
/// Returns the Url id and the MatchResult ids.
pub fn resolve_entry(
    session: &mut Session<'_>,
    entry: &UrlEntry,
    global_tags: &[RawTag],
) -> Result<(i64, Vec<i64>)> {
    let (url_id, _) = session.url(&entry.url.value, entry.url.width, entry.url.height)?;
    attach_tags(session, url_id, entry.tags.iter().chain(global_tags))?;

    let mut json_ids = Vec::with_capacity(entry.provenance.len());
    for blob in &entry.provenance {
        json_ids.push(session.json_data(blob)?);
    }

    let mut thumbnails = Vec::with_capacity(entry.thumbnails.len());
    for thumbnail in &entry.thumbnails {
        let (id, _) = session.url(&thumbnail.value, thumbnail.width, thumbnail.height)?;
        thumbnails.push(Some(id));
    }
    if thumbnails.is_empty() {
        thumbnails.push(None);
    }

    let mut match_results = Vec::with_capacity(thumbnails.len());
    for thumbnail_id in thumbnails {
        let (match_result_id, created) = session.match_result(url_id, thumbnail_id)?;
        if created {
            debug!(url = %entry.url.value, ?thumbnail_id, "new match result");
        }
        for json_id in &json_ids {
            session.link_match_result_json(match_result_id, *json_id)?;
        }
        match_results.push(match_result_id);
    }
    Ok((url_id, match_results))
}

pub fn attach_tags<'t>(
    session: &mut Session<'_>,
    url_id: i64,
    tags: impl IntoIterator<Item = &'t RawTag>,
) -> Result<()> {
    for (namespace, value) in tags {
        let (tag_id, _) = session.tag(namespace.as_deref(), value)?;
        session.link_url_tag(url_id, tag_id)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repo::Store;
    use crate::strategy::ImageRef;
    use serde_json::json;

    fn extraction() -> Extraction {
        let mut extraction = Extraction::new();
        let entry = extraction.entry(ImageRef::sized("http://x/1.jpg", Some(100), Some(80)));
        entry.add_thumbnail(ImageRef::sized("http://x/1_thumb.jpg", Some(50), Some(40)));
        entry.tags.push((Some("picture title".into()), "cat".into()));
        entry.add_provenance(json!({"ou": "http://x/1.jpg"}));
        extraction.entry(ImageRef::new("http://x/page.html"));
        extraction.global_tags.push((Some("query".into()), "cat".into()));
        extraction
    }

    #[test]
    fn entries_become_urls_tags_and_match_results() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        let mut session = store.session()?;
        let resolution = resolve_extraction(&mut session, &extraction())?;
        session.commit()?;

        assert_eq!(resolution.match_results.len(), 2);
        assert_eq!(store.count_rows("urls")?, 3);

        let with_thumb = store.load_match_result(resolution.match_results[0])?;
        assert_eq!(with_thumb.url.value, "http://x/1.jpg");
        assert_eq!((with_thumb.url.width, with_thumb.url.height), (Some(100), Some(80)));
        assert_eq!(with_thumb.thumbnail.as_ref().map(|t| t.value.as_str()), Some("http://x/1_thumb.jpg"));
        assert_eq!(with_thumb.json_data, vec![json!({"ou": "http://x/1.jpg"})]);
        let tags: Vec<String> = with_thumb.url.sorted_tags().iter().map(|t| t.as_string()).collect();
        assert_eq!(tags, vec!["picture title:cat", "query:cat"]);

        let plain = store.load_match_result(resolution.match_results[1])?;
        assert!(plain.thumbnail.is_none());
        Ok(())
    }

    #[test]
    fn resolving_twice_creates_nothing_new() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        let mut session = store.session()?;
        let first = resolve_extraction(&mut session, &extraction())?;
        session.commit()?;
        let tags_before = store.count_rows("tags")?;

        let mut session = store.session()?;
        let second = resolve_extraction(&mut session, &extraction())?;
        assert_eq!(session.created_count(), 0);
        session.commit()?;

        assert_eq!(first, second);
        assert_eq!(store.count_rows("tags")?, tags_before);
        assert_eq!(store.count_rows("match_results")?, 2);
        assert_eq!(store.count_rows("json_data")?, 1);
        Ok(())
    }

    #[test]
    fn duplicate_tags_within_one_entry_collapse() -> Result<()> {
        let mut extraction = Extraction::new();
        let entry = extraction.entry(ImageRef::new("http://x/1.jpg"));
        entry.tags.push((None, "cat".into()));
        entry.tags.push((None, "cat".into()));
        entry.tags.push((Some("site".into()), "cat".into()));

        let mut store = Store::open_in_memory()?;
        let mut session = store.session()?;
        resolve_extraction(&mut session, &extraction)?;
        session.commit()?;

        assert_eq!(store.count_rows("tags")?, 2);
        assert_eq!(store.count_rows("url_tags")?, 2);
        Ok(())
    }
}
