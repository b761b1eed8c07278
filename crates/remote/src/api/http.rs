//! Cloud Drive v1 REST provider.
//!
//! Credentials and endpoint discovery live in the auth directory:
//! `oauth_data` holds the bearer token and `endpoint_data` caches the
//! account's metadata and content URLs. Both are read lazily, on the first
//! call that needs them. Token refresh is left to whoever writes
//! `oauth_data`.

use super::{ByteStream, ChangeStream, RemoteApi, parse_change_log};
use crate::error::{ErrorKind, Result};
use crate::models::{Checkpoint, Node, RawNode};
use async_trait::async_trait;
use exn::{OptionExt, ResultExt};
use futures::TryStreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::io::ReaderStream;

const ACCOUNT_ENDPOINT: &str = "https://drive.amazonaws.com/drive/v1/account/endpoint";
const OAUTH_FILE: &str = "oauth_data";
const ENDPOINT_FILE: &str = "endpoint_data";

#[derive(Debug, Deserialize)]
struct OAuthData {
    access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Endpoints {
    metadata_url: String,
    content_url: String,
}

#[derive(Debug)]
struct Session {
    token: String,
    endpoints: Endpoints,
}

/// Connection settings for [`HttpApi`].
#[derive(Debug, Clone)]
pub struct HttpOptions {
    /// Overrides the discovered metadata endpoint.
    pub metadata_url: Option<String>,
    /// Overrides the discovered content endpoint.
    pub content_url: Option<String>,
    /// Upper bound for metadata calls. Content transfers and the change
    /// log are not bounded.
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            metadata_url: None,
            content_url: None,
            timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// [`RemoteApi`] over HTTPS.
pub struct HttpApi {
    auth_path: PathBuf,
    options: HttpOptions,
    http: reqwest::Client,
    session: OnceCell<Session>,
}

impl HttpApi {
    pub fn new(auth_path: impl Into<PathBuf>, options: HttpOptions) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .user_agent(concat!("nimbus/", env!("CARGO_PKG_VERSION")))
            .build()
            .or_raise(|| ErrorKind::Request("failed to build HTTP client".into()))?;
        Ok(Self {
            auth_path: auth_path.into(),
            options,
            http,
            session: OnceCell::new(),
        })
    }

    async fn session(&self) -> Result<&Session> {
        self.session.get_or_try_init(|| self.open_session()).await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(auth_path = %self.auth_path.display()))]
    async fn open_session(&self) -> Result<Session> {
        let oauth_path = self.auth_path.join(OAUTH_FILE);
        let raw = tokio::fs::read(&oauth_path)
            .await
            .or_raise(|| ErrorKind::Auth(format!("cannot read {}", oauth_path.display())))?;
        let oauth: OAuthData = serde_json::from_slice(&raw)
            .or_raise(|| ErrorKind::Auth(format!("malformed {}", oauth_path.display())))?;
        let endpoints = self.endpoints(&oauth.access_token).await?;
        tracing::debug!(metadata = %endpoints.metadata_url, content = %endpoints.content_url, "session ready");
        Ok(Session {
            token: oauth.access_token,
            endpoints,
        })
    }

    async fn endpoints(&self, token: &str) -> Result<Endpoints> {
        if let (Some(metadata_url), Some(content_url)) = (&self.options.metadata_url, &self.options.content_url) {
            return Ok(Endpoints {
                metadata_url: metadata_url.clone(),
                content_url: content_url.clone(),
            });
        }
        let cache_path = self.auth_path.join(ENDPOINT_FILE);
        let cached = match tokio::fs::read(&cache_path).await {
            Ok(raw) => match serde_json::from_slice::<Endpoints>(&raw) {
                Ok(endpoints) => Some(endpoints),
                Err(error) => {
                    tracing::warn!(path = %cache_path.display(), %error, "ignoring malformed endpoint cache");
                    None
                },
            },
            Err(_) => None,
        };
        let mut endpoints = match cached {
            Some(endpoints) => endpoints,
            None => {
                let request = self.http.get(ACCOUNT_ENDPOINT).bearer_auth(token).timeout(self.options.timeout);
                let endpoints: Endpoints = send(request)
                    .await?
                    .json()
                    .await
                    .or_raise(|| ErrorKind::InvalidResponse("account endpoint".into()))?;
                if let Err(error) = write_endpoint_cache(&cache_path, &endpoints).await {
                    tracing::warn!(path = %cache_path.display(), %error, "could not cache endpoints");
                }
                endpoints
            },
        };
        if let Some(url) = &self.options.metadata_url {
            endpoints.metadata_url = url.clone();
        }
        if let Some(url) = &self.options.content_url {
            endpoints.content_url = url.clone();
        }
        Ok(endpoints)
    }

    async fn metadata_request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let session = self.session().await?;
        let url = format!("{}{path}", session.endpoints.metadata_url);
        Ok(self.http.request(method, url).bearer_auth(&session.token).timeout(self.options.timeout))
    }

    async fn content_request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let session = self.session().await?;
        let url = format!("{}{path}", session.endpoints.content_url);
        Ok(self.http.request(method, url).bearer_auth(&session.token))
    }
}

async fn write_endpoint_cache(path: &Path, endpoints: &Endpoints) -> std::io::Result<()> {
    let json = serde_json::to_vec_pretty(endpoints)?;
    tokio::fs::write(path, json).await
}

/// Send a request, turning transport failures and non-success statuses
/// into request errors.
async fn send(request: RequestBuilder) -> Result<Response> {
    let response = request.send().await.or_raise(|| ErrorKind::Request("transport failure".into()))?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    exn::bail!(ErrorKind::Request(format!("{}: {}", status.as_u16(), body.trim())))
}

async fn decode_node(response: Response) -> Result<Node> {
    let raw: RawNode = response.json().await.or_raise(|| ErrorKind::InvalidResponse("node".into()))?;
    Node::try_from(raw)
}

#[async_trait]
impl RemoteApi for HttpApi {
    fn name(&self) -> &str {
        "acd"
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get_changes(&self, checkpoint: Option<&Checkpoint>, include_purged: bool) -> Result<ChangeStream> {
        let include_purged = if include_purged { "true" } else { "false" };
        let mut body = json!({ "includePurged": include_purged });
        if let Some(checkpoint) = checkpoint {
            body["checkpoint"] = json!(checkpoint.as_str());
        }
        // The change log can take far longer than a metadata call to
        // stream, so it gets no overall timeout.
        let session = self.session().await?;
        let request = self
            .http
            .post(format!("{}changes", session.endpoints.metadata_url))
            .bearer_auth(&session.token)
            .json(&body);
        let response = send(request).await?;
        let bytes = response
            .bytes_stream()
            .map_err(|error| exn::Exn::from(ErrorKind::Request(format!("change log interrupted: {error}"))));
        Ok(parse_change_log(bytes))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn create_folder(&self, parent_id: &str, name: &str) -> Result<Node> {
        let request = self
            .metadata_request(Method::POST, "nodes")
            .await?
            .json(&json!({ "kind": "FOLDER", "name": name, "parents": [parent_id] }));
        decode_node(send(request).await?).await
    }

    #[tracing::instrument(level = "debug", skip(self, local_path), fields(local_path = %local_path.display()))]
    async fn upload_file(&self, parent_id: &str, local_path: &Path) -> Result<Node> {
        let name = local_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_raise(|| ErrorKind::LocalIo(local_path.to_path_buf()))?
            .to_string();
        let file = tokio::fs::File::open(local_path).await.or_raise(|| ErrorKind::LocalIo(local_path.to_path_buf()))?;
        let length = file.metadata().await.or_raise(|| ErrorKind::LocalIo(local_path.to_path_buf()))?.len();
        let metadata = json!({ "kind": "FILE", "name": &name, "parents": [parent_id] });
        let content = Part::stream_with_length(Body::wrap_stream(ReaderStream::new(file)), length).file_name(name);
        let form = Form::new().text("metadata", metadata.to_string()).part("content", content);
        let request = self
            .content_request(Method::POST, "nodes")
            .await?
            .query(&[("suppress", "deduplication")])
            .multipart(form);
        decode_node(send(request).await?).await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn download(&self, node_id: &str) -> Result<ByteStream> {
        let request = self.content_request(Method::GET, &format!("nodes/{node_id}/content")).await?;
        let response = send(request).await?;
        Ok(Box::pin(response.bytes_stream().map_err(|error| {
            exn::Exn::from(ErrorKind::Request(format!("download interrupted: {error}")))
        })))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn move_to_trash(&self, node_id: &str) -> Result<Node> {
        let request = self.metadata_request(Method::PUT, &format!("trash/{node_id}")).await?;
        decode_node(send(request).await?).await
    }
}
