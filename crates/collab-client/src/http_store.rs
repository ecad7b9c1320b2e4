//! REST-backed document store.
//!
//! Notes live at `{api}/notes/{id}`, boards at `{api}/canvas/boards/{id}/state`.
//! `GET` returns the full document and `PUT` replaces it.

use crate::config::rest_url;
use async_trait::async_trait;
use collab_core::store::{DocumentStore, Result, StoreError};
use collab_core::{Document, DocumentId};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpDocumentStore {
    http: reqwest::Client,
    base_url: String,
}

impl HttpDocumentStore {
    pub fn new(base_url: impl Into<String>, token: Option<&str>) -> std::result::Result<Self, HttpStoreError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    fn url<D: Document>(&self, id: &DocumentId) -> Result<reqwest::Url> {
        rest_url(&self.base_url, D::KIND, id).map_err(|e| StoreError::Request(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HttpStoreError {
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] reqwest::header::InvalidHeaderValue),

    #[error("http client setup failed: {0}")]
    Client(#[from] reqwest::Error),
}

fn request_error(e: reqwest::Error) -> StoreError {
    StoreError::Request(e.to_string())
}

async fn check_status(response: reqwest::Response, id: &DocumentId) -> Result<reqwest::Response> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Err(StoreError::NotFound(id.to_string()));
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(StoreError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response)
}

#[async_trait]
impl<D: Document> DocumentStore<D> for HttpDocumentStore {
    async fn load(&self, id: &DocumentId) -> Result<D> {
        let url = self.url::<D>(id)?;
        debug!("GET {}", url);
        let response = self.http.get(url).send().await.map_err(request_error)?;
        let response = check_status(response, id).await?;
        response
            .json::<D>()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))
    }

    async fn save(&self, id: &DocumentId, document: &D) -> Result<()> {
        let url = self.url::<D>(id)?;
        debug!("PUT {}", url);
        let response = self
            .http
            .put(url)
            .json(document)
            .send()
            .await
            .map_err(request_error)?;
        check_status(response, id).await?;
        Ok(())
    }
}
