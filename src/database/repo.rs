use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;
use tracing::debug;

use crate::database::models::{
    ImageFileRecord, MainSimilarResultRecord, MatchResultRecord, ResponseRecord, SearchImagePageRecord,
    SearchImageRecord, SearchQueryRecord, SearchType, TagRecord, TextMatchRecord, UrlRecord,
};
use crate::database::schema::SCHEMA;
use crate::database::session::{IdentityKey, Session};
use crate::error::{IngestError, Result};
use crate::utils::config::TagConfig;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Tables that can be counted through [`Store::count_rows`].
const COUNTABLE: &[&str] = &[
    "netlocs",
    "urls",
    "namespaces",
    "tags",
    "url_tags",
    "json_data",
    "match_results",
    "search_terms",
    "search_queries",
    "search_query_match_results",
    "image_files",
    "search_images",
    "text_matches",
    "main_similar_results",
    "search_image_pages",
    "search_image_page_match_results",
    "responses",
];

/// A connection to the ingestion database.
///
/// Each concurrently running pipeline owns its own `Store`; writers are
/// serialised by SQLite's write lock.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Opens a write session. The write lock is taken immediately so two
    /// ingestions touching the same keys queue up instead of racing.
    pub fn session(&mut self) -> Result<Session<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(Session::new(tx))
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Seeds namespace display settings (hidden flags, aliases).
    pub fn apply_tag_config(&mut self, config: &TagConfig) -> Result<()> {
        let mut session = self.session()?;
        for namespace in &config.hidden_namespaces {
            let alias = config.namespace_aliases.get(namespace).map(String::as_str);
            session.configure_namespace(namespace, true, alias)?;
        }
        for (namespace, alias) in &config.namespace_aliases {
            if !config.hidden_namespaces.contains(namespace) {
                session.configure_namespace(namespace, false, Some(alias))?;
            }
        }
        session.commit()
    }

    /// Read-side lookup of any natural key.
    pub fn find(&self, key: &IdentityKey) -> Result<Option<i64>> {
        Ok(key.lookup(&self.conn)?)
    }

    pub fn count_rows(&self, table: &str) -> Result<usize> {
        if !COUNTABLE.contains(&table) {
            return Err(IngestError::invalid(format!("unknown table: {table}")));
        }
        let count: i64 = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn find_search_query(&self, term: &str, page: u32, mode: &str) -> Result<Option<i64>> {
        let term_id = match self.find(&IdentityKey::SearchTerm(term.to_string()))? {
            Some(id) => id,
            None => return Ok(None),
        };
        self.find(&IdentityKey::SearchQuery {
            term_id,
            page,
            mode: mode.to_string(),
        })
    }

    pub fn load_search_query(&self, id: i64) -> Result<SearchQueryRecord> {
        let (search_term, page, mode) = self.conn.query_row(
            "SELECT st.value, sq.page, sq.mode FROM search_queries sq
             JOIN search_terms st ON st.id = sq.search_term_id
             WHERE sq.id = ?1",
            params![id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?, row.get::<_, String>(2)?)),
        )?;
        let match_results = self.load_linked_match_results(
            "SELECT match_result_id FROM search_query_match_results
             WHERE search_query_id = ?1 ORDER BY match_result_id",
            id,
        )?;
        Ok(SearchQueryRecord {
            id,
            search_term,
            page,
            mode,
            match_results,
        })
    }

    fn load_linked_match_results(&self, sql: &str, parent_id: i64) -> Result<Vec<MatchResultRecord>> {
        let ids = {
            let mut stmt = self.conn.prepare_cached(sql)?;
            let rows = stmt.query_map(params![parent_id], |row| row.get::<_, i64>(0))?;
            rows.collect::<rusqlite::Result<Vec<i64>>>()?
        };
        ids.into_iter().map(|id| self.load_match_result(id)).collect()
    }

    pub fn load_match_result(&self, id: i64) -> Result<MatchResultRecord> {
        let (url_id, thumbnail_id) = self.conn.query_row(
            "SELECT url_id, thumbnail_url_id FROM match_results WHERE id = ?1",
            params![id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)),
        )?;
        let json_data = {
            let mut stmt = self.conn.prepare_cached(
                "SELECT jd.value FROM json_data jd
                 JOIN match_result_json_data mj ON mj.json_data_id = jd.id
                 WHERE mj.match_result_id = ?1 ORDER BY jd.id",
            )?;
            let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
            let mut values = Vec::new();
            for text in rows {
                values.push(serde_json::from_str::<Value>(&text?)?);
            }
            values
        };
        Ok(MatchResultRecord {
            id,
            url: self.load_url(url_id)?,
            thumbnail: thumbnail_id.map(|id| self.load_url(id)).transpose()?,
            json_data,
        })
    }

    pub fn load_url(&self, id: i64) -> Result<UrlRecord> {
        let mut url = self.conn.query_row(
            "SELECT u.id, u.value, u.width, u.height, n.value FROM urls u
             LEFT JOIN netlocs n ON n.id = u.netloc_id
             WHERE u.id = ?1",
            params![id],
            url_from_row,
        )?;
        url.tags = self.load_url_tags(id)?;
        Ok(url)
    }

    pub fn find_url(&self, value: &str) -> Result<Option<UrlRecord>> {
        self.find(&IdentityKey::Url(value.to_string()))?
            .map(|id| self.load_url(id))
            .transpose()
    }

    fn load_url_tags(&self, url_id: i64) -> Result<Vec<TagRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT t.id, n.value, n.alias, COALESCE(n.hidden, 0), t.value FROM tags t
             JOIN url_tags ut ON ut.tag_id = t.id
             LEFT JOIN namespaces n ON n.id = t.namespace_id
             WHERE ut.url_id = ?1 ORDER BY t.id",
        )?;
        let rows = stmt.query_map(params![url_id], tag_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Every tag row, in creation order.
    pub fn tags(&self) -> Result<Vec<TagRecord>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT t.id, n.value, n.alias, COALESCE(n.hidden, 0), t.value FROM tags t
             LEFT JOIN namespaces n ON n.id = t.namespace_id
             ORDER BY t.id",
        )?;
        let rows = stmt.query_map([], tag_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn load_image_file(&self, checksum: &str) -> Result<Option<ImageFileRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, checksum, width, height, img_format, size, thumbnail_id
                 FROM image_files WHERE checksum = ?1",
                params![checksum],
                |row| {
                    Ok(ImageFileRecord {
                        id: row.get(0)?,
                        checksum: row.get(1)?,
                        width: row.get(2)?,
                        height: row.get(3)?,
                        img_format: row.get(4)?,
                        size: row.get(5)?,
                        thumbnail_id: row.get(6)?,
                    })
                },
            )
            .optional()?)
    }

    pub fn load_search_image(&self, id: i64) -> Result<SearchImageRecord> {
        let mut record = self.conn.query_row(
            "SELECT si.id, si.img_checksum, u.value, si.search_url, si.similar_search_url,
                    si.size_search_url, si.img_guess
             FROM search_images si LEFT JOIN urls u ON u.id = si.img_url_id
             WHERE si.id = ?1",
            params![id],
            |row| {
                Ok(SearchImageRecord {
                    id: row.get(0)?,
                    img_checksum: row.get(1)?,
                    img_url: row.get(2)?,
                    search_url: row.get(3)?,
                    similar_search_url: row.get(4)?,
                    size_search_url: row.get(5)?,
                    img_guess: row.get(6)?,
                    text_matches: Vec::new(),
                    main_similar_results: Vec::new(),
                })
            },
        )?;

        let mut stmt = self.conn.prepare_cached(
            "SELECT id, title, url, url_text, text, imgres_url, imgref_url, match_result_id
             FROM text_matches WHERE search_image_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(TextMatchRecord {
                id: row.get(0)?,
                title: row.get(1)?,
                url: row.get(2)?,
                url_text: row.get(3)?,
                text: row.get(4)?,
                imgres_url: row.get(5)?,
                imgref_url: row.get(6)?,
                match_result_id: row.get(7)?,
            })
        })?;
        record.text_matches = rows.collect::<rusqlite::Result<Vec<_>>>()?;

        let mut stmt = self.conn.prepare_cached(
            "SELECT id, title, search_url FROM main_similar_results
             WHERE search_image_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![id], |row| {
            Ok(MainSimilarResultRecord {
                id: row.get(0)?,
                title: row.get(1)?,
                search_url: row.get(2)?,
            })
        })?;
        record.main_similar_results = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(record)
    }

    pub fn load_search_image_page(&self, id: i64) -> Result<SearchImagePageRecord> {
        let (search_image_id, search_type, page) = self.conn.query_row(
            "SELECT search_image_id, search_type, page FROM search_image_pages WHERE id = ?1",
            params![id],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, u32>(2)?)),
        )?;
        let match_results = self.load_linked_match_results(
            "SELECT match_result_id FROM search_image_page_match_results
             WHERE search_image_page_id = ?1 ORDER BY match_result_id",
            id,
        )?;
        Ok(SearchImagePageRecord {
            id,
            search_image: self.load_search_image(search_image_id)?,
            search_type: search_type.parse::<SearchType>()?,
            page,
            match_results,
        })
    }

    /// The cached response for one `(url, method, kwargs)` invocation.
    pub fn find_response(&self, url: &str, method: &str, kwargs: &str) -> Result<Option<ResponseRecord>> {
        let row = self
            .conn
            .query_row(
                "SELECT id, status, final_url, text, json, headers FROM responses
                 WHERE url = ?1 AND method = ?2 AND kwargs = ?3",
                params![url, method, kwargs],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, u16>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, status, final_url, text, json, headers)) = row else {
            return Ok(None);
        };
        debug!(url, method, "response cache hit");
        Ok(Some(ResponseRecord {
            id,
            url: url.to_string(),
            method: method.to_string(),
            kwargs: kwargs.to_string(),
            status,
            final_url,
            text,
            json: json.map(|j| serde_json::from_str(&j)).transpose()?,
            headers: serde_json::from_str(&headers)?,
        }))
    }
}

fn url_from_row(row: &Row<'_>) -> rusqlite::Result<UrlRecord> {
    Ok(UrlRecord {
        id: row.get(0)?,
        value: row.get(1)?,
        width: row.get(2)?,
        height: row.get(3)?,
        netloc: row.get(4)?,
        tags: Vec::new(),
    })
}

fn tag_from_row(row: &Row<'_>) -> rusqlite::Result<TagRecord> {
    Ok(TagRecord {
        id: row.get(0)?,
        namespace: row.get(1)?,
        namespace_alias: row.get(2)?,
        hidden: row.get(3)?,
        value: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_config_seeds_hidden_namespaces() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        let mut config = TagConfig::default();
        config
            .namespace_aliases
            .insert("pt".to_string(), "picture title".to_string());
        store.apply_tag_config(&config)?;
        store.apply_tag_config(&config)?;

        assert_eq!(store.count_rows("namespaces")?, 4);
        let mut session = store.session()?;
        let (url_id, _) = session.url("http://x/1.jpg", None, None)?;
        let (hidden, _) = session.tag(Some("imgres url"), "http://x/imgres")?;
        let (shown, _) = session.tag(Some("pt"), "cat")?;
        session.link_url_tag(url_id, hidden)?;
        session.link_url_tag(url_id, shown)?;
        session.commit()?;

        let url = store.load_url(url_id)?;
        let visible: Vec<String> = url.sorted_tags().iter().map(|t| t.as_string()).collect();
        assert_eq!(visible, vec!["picture title:cat".to_string()]);
        Ok(())
    }

    #[test]
    fn sorted_tags_put_namespaced_first() -> Result<()> {
        let mut store = Store::open_in_memory()?;
        let mut session = store.session()?;
        let (url_id, _) = session.url("http://x/1.jpg", None, None)?;
        for (ns, value) in [(None, "zebra"), (Some("site"), "x.com"), (None, "apple"), (Some("query"), "cat")] {
            let (tag_id, _) = session.tag(ns, value)?;
            session.link_url_tag(url_id, tag_id)?;
        }
        session.commit()?;

        let url = store.load_url(url_id)?;
        let order: Vec<String> = url.sorted_tags().iter().map(|t| t.as_string()).collect();
        assert_eq!(order, vec!["query:cat", "site:x.com", "apple", "zebra"]);
        Ok(())
    }

    #[test]
    fn count_rows_rejects_unknown_tables() -> Result<()> {
        let store = Store::open_in_memory()?;
        assert!(store.count_rows("sqlite_master; DROP TABLE urls").is_err());
        Ok(())
    }
}
