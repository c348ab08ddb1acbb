use std::collections::HashMap;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Params, Transaction};
use serde_json::Value;
use tracing::debug;

use crate::database::models::SearchType;
use crate::error::{IngestError, Result};

/// Natural identity of every persisted entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdentityKey {
    Netloc(String),
    Url(String),
    Namespace(String),
    Tag { namespace_id: Option<i64>, value: String },
    JsonData(String),
    MatchResult { url_id: i64, thumbnail_id: Option<i64> },
    SearchTerm(String),
    SearchQuery { term_id: i64, page: u32, mode: String },
    ImageFile(String),
    SearchImageByChecksum(String),
    SearchImageByUrl(i64),
    SearchImagePage { search_image_id: i64, search_type: SearchType, page: u32 },
    TextMatch { search_image_id: i64, url: String, title: String },
    MainSimilarResult { search_image_id: i64, search_url: String },
    Response { url: String, method: String, kwargs: String },
}

fn lookup_id<P: Params>(conn: &Connection, sql: &str, params: P) -> rusqlite::Result<Option<i64>> {
    conn.prepare_cached(sql)?
        .query_row(params, |row| row.get(0))
        .optional()
}

impl IdentityKey {
    /// Finds the row id for this key, if the row exists.
    pub fn lookup(&self, conn: &Connection) -> rusqlite::Result<Option<i64>> {
        match self {
            IdentityKey::Netloc(value) => {
                lookup_id(conn, "SELECT id FROM netlocs WHERE value = ?1", params![value])
            }
            IdentityKey::Url(value) => {
                lookup_id(conn, "SELECT id FROM urls WHERE value = ?1", params![value])
            }
            IdentityKey::Namespace(value) => {
                lookup_id(conn, "SELECT id FROM namespaces WHERE value = ?1", params![value])
            }
            IdentityKey::Tag { namespace_id, value } => lookup_id(
                conn,
                "SELECT id FROM tags WHERE namespace_id IS ?1 AND value = ?2",
                params![namespace_id, value],
            ),
            IdentityKey::JsonData(value) => {
                lookup_id(conn, "SELECT id FROM json_data WHERE value = ?1", params![value])
            }
            IdentityKey::MatchResult { url_id, thumbnail_id } => lookup_id(
                conn,
                "SELECT id FROM match_results WHERE url_id = ?1 AND thumbnail_url_id IS ?2",
                params![url_id, thumbnail_id],
            ),
            IdentityKey::SearchTerm(value) => {
                lookup_id(conn, "SELECT id FROM search_terms WHERE value = ?1", params![value])
            }
            IdentityKey::SearchQuery { term_id, page, mode } => lookup_id(
                conn,
                "SELECT id FROM search_queries WHERE search_term_id = ?1 AND page = ?2 AND mode = ?3",
                params![term_id, page, mode],
            ),
            IdentityKey::ImageFile(checksum) => {
                lookup_id(conn, "SELECT id FROM image_files WHERE checksum = ?1", params![checksum])
            }
            IdentityKey::SearchImageByChecksum(checksum) => lookup_id(
                conn,
                "SELECT id FROM search_images WHERE img_checksum = ?1",
                params![checksum],
            ),
            IdentityKey::SearchImageByUrl(url_id) => lookup_id(
                conn,
                "SELECT id FROM search_images WHERE img_url_id = ?1",
                params![url_id],
            ),
            IdentityKey::SearchImagePage { search_image_id, search_type, page } => lookup_id(
                conn,
                "SELECT id FROM search_image_pages
                 WHERE search_image_id = ?1 AND search_type = ?2 AND page = ?3",
                params![search_image_id, search_type.as_str(), page],
            ),
            IdentityKey::TextMatch { search_image_id, url, title } => lookup_id(
                conn,
                "SELECT id FROM text_matches WHERE search_image_id = ?1 AND url = ?2 AND title = ?3",
                params![search_image_id, url, title],
            ),
            IdentityKey::MainSimilarResult { search_image_id, search_url } => lookup_id(
                conn,
                "SELECT id FROM main_similar_results WHERE search_image_id = ?1 AND search_url = ?2",
                params![search_image_id, search_url],
            ),
            IdentityKey::Response { url, method, kwargs } => lookup_id(
                conn,
                "SELECT id FROM responses WHERE url = ?1 AND method = ?2 AND kwargs = ?3",
                params![url, method, kwargs],
            ),
        }
    }
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

/// One ingestion's write transaction.
///
/// Every entity is created through [`Session::get_or_create`], which keeps a
/// key → id map for the life of the session so resolving the same key twice
/// yields the same row. Nothing is visible to other connections until
/// [`Session::commit`]; dropping the session rolls back.
pub struct Session<'conn> {
    tx: Transaction<'conn>,
    identities: HashMap<IdentityKey, i64>,
    created: usize,
}

impl<'conn> Session<'conn> {
    pub(crate) fn new(tx: Transaction<'conn>) -> Self {
        Self {
            tx,
            identities: HashMap::new(),
            created: 0,
        }
    }

    pub fn conn(&self) -> &Connection {
        &self.tx
    }

    /// Rows inserted so far in this session.
    pub fn created_count(&self) -> usize {
        self.created
    }

    /// Returns `(id, created)` for `key`, running `insert` only when no row
    /// exists yet. A unique-constraint violation on insert means another
    /// writer got there first, so the row is looked up again.
    pub fn get_or_create<F>(&mut self, key: IdentityKey, insert: F) -> Result<(i64, bool)>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<i64>,
    {
        if let Some(id) = self.identities.get(&key) {
            return Ok((*id, false));
        }
        let (id, created) = match key.lookup(&self.tx)? {
            Some(id) => (id, false),
            None => match insert(&self.tx) {
                Ok(id) => (id, true),
                Err(err) if is_unique_violation(&err) => {
                    debug!(?key, "identity conflict on insert, retrying as lookup");
                    let id = key
                        .lookup(&self.tx)?
                        .ok_or_else(|| IngestError::IdentityConflict(format!("{key:?}")))?;
                    (id, false)
                }
                Err(err) => return Err(err.into()),
            },
        };
        if created {
            self.created += 1;
        }
        self.identities.insert(key, id);
        Ok((id, created))
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }

    pub fn rollback(self) -> Result<()> {
        self.tx.rollback()?;
        Ok(())
    }

    pub fn netloc(&mut self, value: &str) -> Result<i64> {
        let key = IdentityKey::Netloc(value.to_string());
        let (id, _) = self.get_or_create(key, |conn| {
            conn.execute("INSERT INTO netlocs (value) VALUES (?1)", params![value])?;
            Ok(conn.last_insert_rowid())
        })?;
        Ok(id)
    }

    /// Get-or-create a Url. Width and height only fill columns that are
    /// still unset; an existing size is never overwritten.
    pub fn url(&mut self, value: &str, width: Option<u32>, height: Option<u32>) -> Result<(i64, bool)> {
        let netloc_id = match url::Url::parse(value).ok().and_then(|u| u.host_str().map(str::to_string)) {
            Some(host) => Some(self.netloc(&host)?),
            None => None,
        };
        let key = IdentityKey::Url(value.to_string());
        let (id, created) = self.get_or_create(key, |conn| {
            conn.execute(
                "INSERT INTO urls (value, width, height, netloc_id) VALUES (?1, ?2, ?3, ?4)",
                params![value, width, height, netloc_id],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        if !created && (width.is_some() || height.is_some()) {
            self.tx.execute(
                "UPDATE urls SET width = COALESCE(width, ?2), height = COALESCE(height, ?3) WHERE id = ?1",
                params![id, width, height],
            )?;
        }
        Ok((id, created))
    }

    pub fn namespace(&mut self, value: &str) -> Result<i64> {
        let key = IdentityKey::Namespace(value.to_string());
        let (id, _) = self.get_or_create(key, |conn| {
            conn.execute("INSERT INTO namespaces (value) VALUES (?1)", params![value])?;
            Ok(conn.last_insert_rowid())
        })?;
        Ok(id)
    }

    /// Marks a namespace hidden and/or sets its display alias.
    pub fn configure_namespace(&mut self, value: &str, hidden: bool, alias: Option<&str>) -> Result<i64> {
        let id = self.namespace(value)?;
        self.tx.execute(
            "UPDATE namespaces SET hidden = ?2, alias = COALESCE(?3, alias) WHERE id = ?1",
            params![id, hidden, alias],
        )?;
        Ok(id)
    }

    /// Get-or-create a tag. A `None` namespace produces a bare tag.
    pub fn tag(&mut self, namespace: Option<&str>, value: &str) -> Result<(i64, bool)> {
        let namespace_id = match namespace {
            Some(ns) => Some(self.namespace(ns)?),
            None => None,
        };
        let key = IdentityKey::Tag {
            namespace_id,
            value: value.to_string(),
        };
        self.get_or_create(key, |conn| {
            conn.execute(
                "INSERT INTO tags (namespace_id, value) VALUES (?1, ?2)",
                params![namespace_id, value],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn json_data(&mut self, value: &Value) -> Result<i64> {
        let text = serde_json::to_string(value)?;
        let key = IdentityKey::JsonData(text.clone());
        let (id, _) = self.get_or_create(key, |conn| {
            conn.execute("INSERT INTO json_data (value) VALUES (?1)", params![text])?;
            Ok(conn.last_insert_rowid())
        })?;
        Ok(id)
    }

    /// Get-or-create the MatchResult for a `(url, thumbnail)` pair.
    pub fn match_result(&mut self, url_id: i64, thumbnail_id: Option<i64>) -> Result<(i64, bool)> {
        let key = IdentityKey::MatchResult { url_id, thumbnail_id };
        self.get_or_create(key, |conn| {
            conn.execute(
                "INSERT INTO match_results (url_id, thumbnail_url_id) VALUES (?1, ?2)",
                params![url_id, thumbnail_id],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn search_term(&mut self, value: &str) -> Result<i64> {
        let key = IdentityKey::SearchTerm(value.to_string());
        let (id, _) = self.get_or_create(key, |conn| {
            conn.execute("INSERT INTO search_terms (value) VALUES (?1)", params![value])?;
            Ok(conn.last_insert_rowid())
        })?;
        Ok(id)
    }

    pub fn search_query(&mut self, term_id: i64, page: u32, mode: &str) -> Result<(i64, bool)> {
        let key = IdentityKey::SearchQuery {
            term_id,
            page,
            mode: mode.to_string(),
        };
        self.get_or_create(key, |conn| {
            conn.execute(
                "INSERT INTO search_queries (search_term_id, page, mode) VALUES (?1, ?2, ?3)",
                params![term_id, page, mode],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn image_file(
        &mut self,
        checksum: &str,
        width: Option<u32>,
        height: Option<u32>,
        img_format: Option<&str>,
        size: Option<u64>,
    ) -> Result<(i64, bool)> {
        let key = IdentityKey::ImageFile(checksum.to_string());
        let (id, created) = self.get_or_create(key, |conn| {
            conn.execute(
                "INSERT INTO image_files (checksum, width, height, img_format, size)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![checksum, width, height, img_format, size],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        if !created {
            self.tx.execute(
                "UPDATE image_files SET width = ?2, height = ?3, img_format = ?4, size = ?5 WHERE id = ?1",
                params![id, width, height, img_format, size],
            )?;
        }
        Ok((id, created))
    }

    pub fn set_image_thumbnail(&mut self, image_file_id: i64, thumbnail_id: i64) -> Result<()> {
        self.tx.execute(
            "UPDATE image_files SET thumbnail_id = ?2 WHERE id = ?1",
            params![image_file_id, thumbnail_id],
        )?;
        Ok(())
    }

    /// Get-or-create a SearchImage keyed by upload checksum or image url id.
    pub fn search_image(&mut self, key: IdentityKey) -> Result<(i64, bool)> {
        let (checksum, img_url_id) = match &key {
            IdentityKey::SearchImageByChecksum(checksum) => (Some(checksum.clone()), None),
            IdentityKey::SearchImageByUrl(url_id) => (None, Some(*url_id)),
            other => {
                return Err(IngestError::invalid(format!(
                    "{other:?} does not identify a search image"
                )))
            }
        };
        self.get_or_create(key, |conn| {
            conn.execute(
                "INSERT INTO search_images (img_checksum, img_url_id) VALUES (?1, ?2)",
                params![checksum, img_url_id],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Overwrites the parsed fields of a search image with the latest fetch.
    pub fn update_search_image(
        &mut self,
        id: i64,
        search_url: &str,
        similar_search_url: Option<&str>,
        size_search_url: Option<&str>,
        img_guess: Option<&str>,
    ) -> Result<()> {
        self.tx.execute(
            "UPDATE search_images
             SET search_url = ?2, similar_search_url = ?3, size_search_url = ?4, img_guess = ?5
             WHERE id = ?1",
            params![id, search_url, similar_search_url, size_search_url, img_guess],
        )?;
        Ok(())
    }

    pub fn search_image_page(
        &mut self,
        search_image_id: i64,
        search_type: SearchType,
        page: u32,
    ) -> Result<(i64, bool)> {
        let key = IdentityKey::SearchImagePage {
            search_image_id,
            search_type,
            page,
        };
        self.get_or_create(key, |conn| {
            conn.execute(
                "INSERT INTO search_image_pages (search_image_id, search_type, page) VALUES (?1, ?2, ?3)",
                params![search_image_id, search_type.as_str(), page],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn text_match(
        &mut self,
        search_image_id: i64,
        title: &str,
        url: &str,
        url_text: Option<&str>,
        text: Option<&str>,
        imgres_url: Option<&str>,
        imgref_url: Option<&str>,
    ) -> Result<(i64, bool)> {
        let key = IdentityKey::TextMatch {
            search_image_id,
            url: url.to_string(),
            title: title.to_string(),
        };
        self.get_or_create(key, |conn| {
            conn.execute(
                "INSERT INTO text_matches
                 (search_image_id, title, url, url_text, text, imgres_url, imgref_url)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![search_image_id, title, url, url_text, text, imgres_url, imgref_url],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn set_text_match_result(&mut self, text_match_id: i64, match_result_id: i64) -> Result<()> {
        self.tx.execute(
            "UPDATE text_matches SET match_result_id = ?2 WHERE id = ?1",
            params![text_match_id, match_result_id],
        )?;
        Ok(())
    }

    pub fn main_similar_result(
        &mut self,
        search_image_id: i64,
        title: Option<&str>,
        search_url: &str,
    ) -> Result<(i64, bool)> {
        let key = IdentityKey::MainSimilarResult {
            search_image_id,
            search_url: search_url.to_string(),
        };
        self.get_or_create(key, |conn| {
            conn.execute(
                "INSERT INTO main_similar_results (search_image_id, title, search_url) VALUES (?1, ?2, ?3)",
                params![search_image_id, title, search_url],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Stores (or refreshes) the cached response for one HTTP invocation.
    #[allow(clippy::too_many_arguments)]
    pub fn store_response(
        &mut self,
        url: &str,
        method: &str,
        kwargs: &str,
        status: u16,
        final_url: &str,
        text: &str,
        headers: &[(String, String)],
    ) -> Result<i64> {
        let json = serde_json::from_str::<Value>(text).ok().map(|v| v.to_string());
        let headers = serde_json::to_string(headers)?;
        let key = IdentityKey::Response {
            url: url.to_string(),
            method: method.to_string(),
            kwargs: kwargs.to_string(),
        };
        let (id, created) = self.get_or_create(key, |conn| {
            conn.execute(
                "INSERT INTO responses (url, method, kwargs, status, final_url, text, json, headers)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![url, method, kwargs, status, final_url, text, json, headers],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        if !created {
            self.tx.execute(
                "UPDATE responses SET status = ?2, final_url = ?3, text = ?4, json = ?5, headers = ?6
                 WHERE id = ?1",
                params![id, status, final_url, text, json, headers],
            )?;
        }
        Ok(id)
    }

    pub fn link_url_tag(&mut self, url_id: i64, tag_id: i64) -> Result<()> {
        self.link("INSERT OR IGNORE INTO url_tags (url_id, tag_id) VALUES (?1, ?2)", url_id, tag_id)
    }

    pub fn link_match_result_json(&mut self, match_result_id: i64, json_data_id: i64) -> Result<()> {
        self.link(
            "INSERT OR IGNORE INTO match_result_json_data (match_result_id, json_data_id) VALUES (?1, ?2)",
            match_result_id,
            json_data_id,
        )
    }

    pub fn link_search_query_match_result(&mut self, search_query_id: i64, match_result_id: i64) -> Result<()> {
        self.link(
            "INSERT OR IGNORE INTO search_query_match_results (search_query_id, match_result_id)
             VALUES (?1, ?2)",
            search_query_id,
            match_result_id,
        )
    }

    pub fn link_search_image_page_match_result(&mut self, page_id: i64, match_result_id: i64) -> Result<()> {
        self.link(
            "INSERT OR IGNORE INTO search_image_page_match_results (search_image_page_id, match_result_id)
             VALUES (?1, ?2)",
            page_id,
            match_result_id,
        )
    }

    fn link(&mut self, sql: &str, left: i64, right: i64) -> Result<()> {
        self.tx.prepare_cached(sql)?.execute(params![left, right])?;
        Ok(())
    }
}
