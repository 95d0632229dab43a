//! Repository contents API client.
//!
//! The document lives at `{repo}/{path}` on `{branch}`. Its blob sha is the
//! version token: reads send it as `If-None-Match`, writes send it as `sha`
//! and are rejected when it is stale.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, IF_NONE_MATCH};
use reqwest::{RequestBuilder, Response, StatusCode};
use roster_core::model::ConnectionSettings;
use roster_core::remote::{Fetched, RemoteError, RemoteStore, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

const ACCEPT_JSON: &str = "application/vnd.github+json";

#[derive(Deserialize)]
struct ContentsFile {
    content: String,
    sha: String,
}

#[derive(Serialize)]
struct WriteRequest<'a> {
    message: &'a str,
    content: &'a str,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Deserialize)]
struct WriteResponse {
    content: WrittenFile,
}

#[derive(Deserialize)]
struct WrittenFile {
    sha: String,
}

pub struct ContentsClient {
    http: reqwest::Client,
    api_base: String,
}

impl ContentsClient {
    pub fn new(api_base: &str, user_agent: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| RemoteError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, settings: &ConnectionSettings) -> String {
        format!(
            "{}/repos/{}/contents/{}",
            self.api_base,
            settings.repo.trim_matches('/'),
            settings.path.trim_start_matches('/')
        )
    }

    fn authorized(&self, request: RequestBuilder, settings: &ConnectionSettings) -> RequestBuilder {
        request
            .header(AUTHORIZATION, format!("token {}", settings.token))
            .header(ACCEPT, ACCEPT_JSON)
    }
}

fn transport(e: reqwest::Error) -> RemoteError {
    RemoteError::Transport(e.to_string())
}

async fn unexpected(response: Response) -> RemoteError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    RemoteError::Status { status, message }
}

#[async_trait]
impl RemoteStore for ContentsClient {
    async fn fetch(&self, settings: &ConnectionSettings, if_none_match: Option<&str>) -> Result<Fetched> {
        let mut request = self
            .authorized(self.http.get(self.url(settings)), settings)
            .query(&[("ref", settings.branch.as_str())]);
        if let Some(token) = if_none_match {
            request = request.header(IF_NONE_MATCH, format!("\"{}\"", token));
        }

        let response = request.send().await.map_err(transport)?;
        debug!("GET {} -> {}", settings.path, response.status());

        match response.status() {
            StatusCode::NOT_MODIFIED => Ok(Fetched::Unchanged),
            StatusCode::NOT_FOUND => Ok(Fetched::Missing),
            status if status.is_success() => {
                let file: ContentsFile = response
                    .json()
                    .await
                    .map_err(|e| RemoteError::Malformed(e.to_string()))?;
                Ok(Fetched::Document {
                    content: file.content,
                    token: file.sha,
                })
            }
            _ => Err(unexpected(response).await),
        }
    }

    async fn write(
        &self,
        settings: &ConnectionSettings,
        content: &str,
        expected: Option<&str>,
        message: &str,
    ) -> Result<String> {
        let body = WriteRequest {
            message,
            content,
            branch: &settings.branch,
            sha: expected,
        };

        let response = self
            .authorized(self.http.put(self.url(settings)), settings)
            .json(&body)
            .send()
            .await
            .map_err(transport)?;
        debug!("PUT {} -> {}", settings.path, response.status());

        match response.status() {
            StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => Err(RemoteError::Conflict {
                expected: expected.map(str::to_string),
            }),
            status if status.is_success() => {
                let written: WriteResponse = response
                    .json()
                    .await
                    .map_err(|e| RemoteError::Malformed(e.to_string()))?;
                Ok(written.content.sha)
            }
            _ => Err(unexpected(response).await),
        }
    }
}
