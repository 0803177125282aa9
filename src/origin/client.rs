use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use url::Url;

use super::signer::{RequestSigner, SignedHeaders};
use super::{xml, ByteStream, Entry, ListOptions, ListPage, OriginError, OriginStore};
use crate::types::OriginScheme;

const DIR_ACTION: &str = "version=1&action=dir&format=xml&encoding=utf-8";

/// Signed HTTP client for a NetStorage origin host.
pub struct NetStorageClient {
    http: Client,
    base: Url,
    signer: RequestSigner,
}

impl std::fmt::Debug for NetStorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetStorageClient")
            .field("base", &self.base.as_str())
            .field("signer", &self.signer)
            .finish_non_exhaustive()
    }
}

impl NetStorageClient {
    pub fn new(
        scheme: OriginScheme,
        host: &str,
        signer: RequestSigner,
    ) -> Result<Self, OriginError> {
        let base = Url::parse(&format!("{}://{}", scheme.as_str(), host))?;
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| OriginError::Http {
                path: host.to_string(),
                source: e,
            })?;
        Ok(Self { http, base, signer })
    }

    /// Absolute URL for an origin path; the path component comes back
    /// percent-encoded and is what gets signed.
    fn url_for(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        url
    }

    async fn signed_get(&self, path: &str, action: &str) -> Result<reqwest::Response, OriginError> {
        let url = self.url_for(path);
        let headers = self.signer.sign_action(url.path(), action);
        self.send(url, headers, path).await
    }

    async fn send(
        &self,
        url: Url,
        headers: SignedHeaders,
        path: &str,
    ) -> Result<reqwest::Response, OriginError> {
        let mut request = self.http.get(url);
        for (name, value) in headers.pairs() {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| OriginError::Http {
            path: path.to_string(),
            source: e,
        })?;

        if !response.status().is_success() {
            return Err(OriginError::HttpStatus {
                status: response.status().as_u16(),
                path: path.to_string(),
            });
        }
        Ok(response)
    }

    async fn signed_get_text(&self, path: &str, action: &str) -> Result<String, OriginError> {
        self.signed_get(path, action)
            .await?
            .text()
            .await
            .map_err(|e| OriginError::Http {
                path: path.to_string(),
                source: e,
            })
    }
}

fn list_action(options: &ListOptions) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("encoding", "utf-8");
    query.append_pair("max_entries", &options.max_entries.to_string());
    if let Some(end) = &options.end {
        query.append_pair("end", end);
    }
    format!("version=1&action=list&format=xml&{}", query.finish())
}

#[async_trait]
impl OriginStore for NetStorageClient {
    async fn list(&self, path: &str, options: &ListOptions) -> Result<ListPage, OriginError> {
        let body = self.signed_get_text(path, &list_action(options)).await?;
        xml::parse_list(path, &body)
    }

    async fn dir(&self, path: &str) -> Result<Vec<Entry>, OriginError> {
        let body = self.signed_get_text(path, DIR_ACTION).await?;
        xml::parse_dir(path, &body)
    }

    async fn open_read(&self, path: &str) -> Result<ByteStream, OriginError> {
        let url = self.url_for(path);
        let headers = self.signer.sign(url.path());
        let response = self.send(url, headers, path).await?;
        let owned_path = path.to_string();
        let stream = response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| OriginError::Http {
                path: owned_path.clone(),
                source: e,
            })
        });
        Ok(stream.boxed())
    }
}
