use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::Value;

use crate::error::IngestError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagRecord {
    pub id: i64,
    pub namespace: Option<String>,
    /// Display alias of the namespace, when one is configured.
    pub namespace_alias: Option<String>,
    pub hidden: bool,
    pub value: String,
}

impl TagRecord {
    /// `namespace:value`, or the bare value.
    pub fn as_string(&self) -> String {
        match self.namespace_alias.as_ref().or(self.namespace.as_ref()) {
            Some(ns) => format!("{}:{}", ns, self.value),
            None => self.value.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UrlRecord {
    pub id: i64,
    pub value: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub netloc: Option<String>,
    pub tags: Vec<TagRecord>,
}

impl UrlRecord {
    /// Namespaced tags ordered by namespace then value, followed by bare
    /// tags ordered by value. Hidden namespaces are left out.
    pub fn sorted_tags(&self) -> Vec<&TagRecord> {
        let (mut namespaced, mut bare): (Vec<&TagRecord>, Vec<&TagRecord>) = self
            .tags
            .iter()
            .filter(|tag| !tag.hidden)
            .partition(|tag| tag.namespace.is_some());
        namespaced.sort_by(|a, b| (&a.namespace, &a.value).cmp(&(&b.namespace, &b.value)));
        bare.sort_by(|a, b| a.value.cmp(&b.value));
        namespaced.extend(bare);
        namespaced
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResultRecord {
    pub id: i64,
    pub url: UrlRecord,
    pub thumbnail: Option<UrlRecord>,
    /// Metadata blobs the result was extracted from.
    pub json_data: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchQueryRecord {
    pub id: i64,
    pub search_term: String,
    pub page: u32,
    pub mode: String,
    pub match_results: Vec<MatchResultRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SearchType {
    Similar,
    Size,
}

impl SearchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SearchType::Similar => "similar",
            SearchType::Size => "size",
        }
    }
}

impl fmt::Display for SearchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SearchType {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "similar" | "1" => Ok(SearchType::Similar),
            "size" | "2" => Ok(SearchType::Size),
            other => Err(IngestError::invalid(format!("unknown search type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextMatchRecord {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub url_text: Option<String>,
    pub text: Option<String>,
    pub imgres_url: Option<String>,
    pub imgref_url: Option<String>,
    pub match_result_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MainSimilarResultRecord {
    pub id: i64,
    pub title: Option<String>,
    pub search_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageFileRecord {
    pub id: i64,
    pub checksum: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub img_format: Option<String>,
    pub size: Option<u64>,
    pub thumbnail_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchImageRecord {
    pub id: i64,
    pub img_checksum: Option<String>,
    pub img_url: Option<String>,
    pub search_url: Option<String>,
    pub similar_search_url: Option<String>,
    pub size_search_url: Option<String>,
    pub img_guess: Option<String>,
    pub text_matches: Vec<TextMatchRecord>,
    pub main_similar_results: Vec<MainSimilarResultRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchImagePageRecord {
    pub id: i64,
    pub search_image: SearchImageRecord,
    pub search_type: SearchType,
    pub page: u32,
    pub match_results: Vec<MatchResultRecord>,
}

/// A cached HTTP invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseRecord {
    pub id: i64,
    pub url: String,
    pub method: String,
    pub kwargs: String,
    pub status: u16,
    pub final_url: String,
    pub text: String,
    pub json: Option<Value>,
    pub headers: Vec<(String, String)>,
}
