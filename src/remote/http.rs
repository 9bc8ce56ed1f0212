use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use url::Url;

use super::{RemoteError, RemoteResult, RemoteSource};
use crate::db::models::{MediaRef, Post};

/// `RemoteSource` over the backend's JSON HTTP API.
pub struct HttpRemote {
    client: Client,
    base_url: Url,
    auth_token: Option<String>,
}

impl HttpRemote {
    pub fn new(base_url: &str, auth_token: Option<String>, timeout: Duration) -> RemoteResult<Self> {
        // Url::join drops the last segment unless the base ends with '/'
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{base_url}/")
        };
        let base_url = Url::parse(&normalized)
            .map_err(|e| RemoteError::Unknown(format!("Invalid base url: {e}")))?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Unknown(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            auth_token,
        })
    }

    fn url(&self, path: &str) -> RemoteResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| RemoteError::Unknown(format!("Invalid path {path}: {e}")))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth_token {
            Some(token) => request.header(reqwest::header::AUTHORIZATION, token),
            None => request,
        }
    }

    async fn execute(&self, request: RequestBuilder) -> RemoteResult<Response> {
        let response = self.authorize(request).send().await.map_err(classify)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = if body.trim().is_empty() {
            status.canonical_reason().unwrap_or("").to_string()
        } else {
            body
        };
        Err(RemoteError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> RemoteResult<T> {
        let response = self.execute(request).await?;
        response.json::<T>().await.map_err(classify)
    }

    async fn get_posts(&self, path: &str, count: Option<usize>) -> RemoteResult<Vec<Post>> {
        let mut request = self.client.get(self.url(path)?);
        if let Some(count) = count {
            request = request.query(&[("count", count)]);
        }
        let posts: Vec<Post> = self.send(request).await?;
        tracing::debug!("GET {} -> {} posts", path, posts.len());
        Ok(posts)
    }
}

fn classify(err: reqwest::Error) -> RemoteError {
    if err.is_decode() {
        RemoteError::Unknown(err.to_string())
    } else if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() {
        RemoteError::Network(err.to_string())
    } else {
        RemoteError::Unknown(err.to_string())
    }
}

#[async_trait]
impl RemoteSource for HttpRemote {
    async fn fetch_all(&self) -> RemoteResult<Vec<Post>> {
        self.get_posts("posts", None).await
    }

    async fn fetch_latest(&self, count: usize) -> RemoteResult<Vec<Post>> {
        self.get_posts("posts/latest", Some(count)).await
    }

    async fn fetch_before(&self, id: i64, count: usize) -> RemoteResult<Vec<Post>> {
        self.get_posts(&format!("posts/{id}/before"), Some(count))
            .await
    }

    async fn fetch_after(&self, id: i64, count: usize) -> RemoteResult<Vec<Post>> {
        self.get_posts(&format!("posts/{id}/after"), Some(count))
            .await
    }

    async fn fetch_newer(&self, id: i64) -> RemoteResult<Vec<Post>> {
        self.get_posts(&format!("posts/{id}/newer"), None).await
    }

    async fn create(&self, post: Post) -> RemoteResult<Post> {
        let request = self.client.post(self.url("posts")?).json(&post);
        self.send(request).await
    }

    async fn delete(&self, id: i64) -> RemoteResult<()> {
        let request = self.client.delete(self.url(&format!("posts/{id}"))?);
        self.execute(request).await?;
        Ok(())
    }

    async fn like(&self, id: i64) -> RemoteResult<Post> {
        let request = self.client.post(self.url(&format!("posts/{id}/likes"))?);
        self.send(request).await
    }

    async fn unlike(&self, id: i64) -> RemoteResult<Post> {
        let request = self.client.delete(self.url(&format!("posts/{id}/likes"))?);
        self.send(request).await
    }

    async fn upload_attachment(&self, bytes: Bytes, filename: &str) -> RemoteResult<MediaRef> {
        let mime = mime_guess::from_path(filename).first_or_octet_stream();
        let part = Part::bytes(bytes.to_vec())
            .file_name(filename.to_string())
            .mime_str(mime.as_ref())
            .map_err(|e| RemoteError::Unknown(e.to_string()))?;
        let form = Form::new().part("file", part);

        let request = self.client.post(self.url("media")?).multipart(form);
        let media: MediaRef = self.send(request).await?;
        tracing::info!("Uploaded {} as media {}", filename, media.id);
        Ok(media)
    }
}
