use std::time::Duration;

use anyhow::Context;
use reqwest::blocking::{multipart, Client};
use reqwest::redirect::Policy;
use url::Url;

use crate::error::{IngestError, Result};
use crate::utils::config::FetchConfig;

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "get",
            Method::Post => "post",
        }
    }
}

/// A file sent as one multipart field.
#[derive(Debug, Clone)]
pub struct Upload {
    pub field: String,
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
    pub follow_redirects: bool,
    /// Plain multipart text fields, sent alongside `upload`.
    pub form: Vec<(String, String)>,
    pub upload: Option<Upload>,
}

impl HttpRequest {
    pub fn get(url: Url, timeout: Duration) -> Self {
        Self {
            method: Method::Get,
            url,
            headers: Vec::new(),
            timeout,
            follow_redirects: true,
            form: Vec::new(),
            upload: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    /// URL after redirects.
    pub final_url: Url,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Blocking HTTP. Requests are not cancellable once sent; the timeout bounds
/// the wait.
pub trait HttpTransport: Send + Sync {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse>;
}

pub struct ReqwestTransport {
    follow: Client,
    no_follow: Client,
}

impl ReqwestTransport {
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let build = |policy: Policy| {
            Client::builder()
                .user_agent(config.user_agent.as_str())
                .timeout(config.timeout())
                .redirect(policy)
                .build()
                .context("Failed to build HTTP client")
        };
        Ok(Self {
            follow: build(Policy::limited(MAX_REDIRECTS))?,
            no_follow: build(Policy::none())?,
        })
    }
}

impl HttpTransport for ReqwestTransport {
    fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let client = if request.follow_redirects {
            &self.follow
        } else {
            &self.no_follow
        };
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };
        let mut builder = client
            .request(method, request.url.clone())
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if request.upload.is_some() || !request.form.is_empty() {
            let mut form = multipart::Form::new();
            for (name, value) in &request.form {
                form = form.text(name.clone(), value.clone());
            }
            if let Some(upload) = &request.upload {
                let part = multipart::Part::bytes(upload.bytes.clone())
                    .file_name(upload.file_name.clone())
                    .mime_str(&upload.mime)
                    .map_err(|err| transport_error(request, &err))?;
                form = form.part(upload.field.clone(), part);
            }
            builder = builder.multipart(form);
        }

        let response = builder.send().map_err(|err| transport_error(request, &err))?;
        let status = response.status().as_u16();
        let final_url = response.url().clone();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.text().map_err(|err| transport_error(request, &err))?;
        Ok(HttpResponse {
            status,
            final_url,
            body,
            headers,
        })
    }
}

fn transport_error(request: &HttpRequest, err: &reqwest::Error) -> IngestError {
    if err.is_timeout() {
        IngestError::FetchTimeout {
            url: request.url.to_string(),
            timeout: request.timeout,
        }
    } else {
        IngestError::FetchTransport {
            url: request.url.to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_ignores_case() {
        let response = HttpResponse {
            status: 302,
            final_url: Url::parse("http://x/").unwrap(),
            body: String::new(),
            headers: vec![("location".into(), "/search?tbs=sbi".into())],
        };
        assert_eq!(response.header("Location"), Some("/search?tbs=sbi"));
        assert_eq!(response.header("content-type"), None);
    }

    #[test]
    fn client_builds_from_config() {
        assert!(ReqwestTransport::new(&FetchConfig::default()).is_ok());
    }
}
