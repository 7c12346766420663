//! HTTP client wrapper for the Flux REST API (spec.md §6.1).

use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("server unreachable: {0}")]
    Unreachable(reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

pub struct Client {
    base_url: String,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http: reqwest::Client::new(),
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).send().await.map_err(ClientError::Unreachable)?;
        self.handle_response(response).await
    }

    pub async fn post<T: DeserializeOwned, B: Serialize>(&self, path: &str, body: &B) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).json(body).send().await.map_err(ClientError::Unreachable)?;
        self.handle_response(response).await
    }

    pub async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).send().await.map_err(ClientError::Unreachable)?;
        self.handle_response(response).await
    }

    pub async fn delete(&self, path: &str) -> Result<(), ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.delete(&url).send().await.map_err(ClientError::Unreachable)?;
        if response.status() == StatusCode::OK || response.status() == StatusCode::NO_CONTENT {
            return Ok(());
        }
        self.error_for(response).await
    }

    /// POST a JSON body to an endpoint that returns only a status code
    /// (spec.md's `/admin/secrets` CRUD — no response body on success).
    pub async fn post_no_body<B: Serialize>(&self, path: &str, body: &B) -> Result<(), ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).json(body).send().await.map_err(ClientError::Unreachable)?;
        if response.status().is_success() {
            return Ok(());
        }
        self.error_for(response).await
    }

    pub async fn post_multipart<T: DeserializeOwned>(&self, path: &str, form: reqwest::multipart::Form) -> Result<T, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.post(&url).multipart(form).send().await.map_err(ClientError::Unreachable)?;
        self.handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(ClientError::Unreachable);
        }
        self.error_for(response).await
    }

    async fn error_for<T>(&self, response: reqwest::Response) -> Result<T, ClientError> {
        let status = response.status();
        let message = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(ClientError::NotFound);
        }
        if status == StatusCode::CONFLICT {
            return Err(ClientError::Conflict(message));
        }
        Err(ClientError::Api { status: status.as_u16(), message })
    }
}
