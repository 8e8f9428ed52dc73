use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use kvx_core::{KvPair, StoreError};
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument};

use crate::config::ConsulConfig;
use crate::error::{store_closed, ConsulError};

/// Header carrying the Raft index of the returned data.
const INDEX_HEADER: &str = "X-Consul-Index";

/// Header carrying the ACL token.
const TOKEN_HEADER: &str = "X-Consul-Token";

/// A KV entry as returned by `GET /v1/kv/:key`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct KvEntry {
    pub key: String,
    /// Base64 encoded value, `null` for an empty value.
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub flags: u64,
    #[serde(default)]
    pub create_index: u64,
    #[serde(default)]
    pub modify_index: u64,
    #[serde(default)]
    pub lock_index: u64,
    /// Session holding the key, if any.
    #[serde(default)]
    pub session: Option<String>,
}

impl KvEntry {
    /// Decode into the backend-neutral pair.
    pub fn into_pair(self) -> Result<KvPair, ConsulError> {
        let value = match self.value {
            Some(encoded) => Some(Bytes::from(BASE64.decode(encoded.as_bytes()).map_err(
                |e| ConsulError::Decode(format!("value of {} is not base64: {}", self.key, e)),
            )?)),
            None => None,
        };
        Ok(KvPair::new(self.key, value, self.modify_index))
    }
}

/// Parameters of a KV read.
#[derive(Debug, Clone, Default)]
pub struct KvQuery {
    /// Return every key under the prefix.
    pub recurse: bool,
    /// Block until the index moves past this value.
    pub index: Option<u64>,
}

/// Result of a KV read. `entries` is empty when nothing matched.
#[derive(Debug, Clone)]
pub struct KvResponse {
    pub entries: Vec<KvEntry>,
    pub index: u64,
}

/// Parameters of a KV write.
#[derive(Debug, Clone, Default)]
pub struct WriteParams {
    pub flags: Option<u64>,
    /// Only write if the modify index equals this value (0 = create only).
    pub cas: Option<u64>,
    /// Acquire the key for this session.
    pub acquire: Option<String>,
    /// Release the key held by this session.
    pub release: Option<String>,
}

/// How Consul treats keys held by a session once it is invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionBehavior {
    /// Keys are released but kept.
    Release,
    /// Keys are deleted.
    Delete,
}

/// Body of `PUT /v1/session/create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SessionRequest {
    pub name: String,
    #[serde(rename = "TTL")]
    pub ttl: String,
    pub behavior: SessionBehavior,
    pub lock_delay: String,
}

#[derive(Debug, Deserialize)]
struct SessionCreated {
    #[serde(rename = "ID")]
    id: String,
}

/// Consul HTTP API client.
///
/// One connection pool shared by every operation of a store. Closing the
/// client aborts in-flight requests and rejects new ones.
pub struct ConsulClient {
    http_client: HttpClient,
    base_url: String,
    token: Option<String>,
    datacenter: Option<String>,
    wait: Duration,
    closed: watch::Sender<bool>,
}

impl ConsulClient {
    /// Create a new Consul client.
    pub fn new(config: &ConsulConfig) -> Result<Self, ConsulError> {
        let http_client = HttpClient::builder().build()?;
        let (closed, _) = watch::channel(false);
        Ok(Self {
            http_client,
            base_url: config.base_url(),
            token: config.token.clone(),
            datacenter: config.datacenter.clone(),
            wait: config.wait(),
            closed,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// URL for a key. Segments are encoded individually so separators survive.
    fn kv_url(&self, key: &str) -> String {
        let encoded: Vec<_> = key.split('/').map(urlencoding::encode).collect();
        format!("{}/v1/kv/{}", self.base_url, encoded.join("/"))
    }

    fn session_url(&self, action: &str, id: Option<&str>) -> String {
        match id {
            Some(id) => format!(
                "{}/v1/session/{}/{}",
                self.base_url,
                action,
                urlencoding::encode(id)
            ),
            None => format!("{}/v1/session/{}", self.base_url, action),
        }
    }

    /// Apply token and datacenter to a request.
    fn decorate(&self, mut request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }
        if let Some(dc) = &self.datacenter {
            request = request.query(&[("dc", dc)]);
        }
        request
    }

    /// Send a request unless the client is closed; closing aborts it.
    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return Err(store_closed());
        }
        let request = self.decorate(request);
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => Err(store_closed()),
            result = request.send() => result.map_err(|e| StoreError::from(ConsulError::Http(e))),
        }
    }

    /// Turn a non-success status into an error.
    async fn check_status(response: Response) -> Result<Response, StoreError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ConsulError::Status {
            status: status.as_u16(),
            body,
        }
        .into())
    }

    /// Read a `true`/`false` body as returned by KV writes and deletes.
    async fn read_bool(response: Response) -> Result<bool, StoreError> {
        let response = Self::check_status(response).await?;
        let text = response.text().await.map_err(ConsulError::Http)?;
        match text.trim() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(StoreError::from(ConsulError::Decode(format!(
                "expected boolean, got {:?}",
                other
            )))),
        }
    }

    fn read_index(response: &Response) -> u64 {
        response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    /// Read a key or, with `recurse`, every key under a prefix.
    ///
    /// With `index` set this is a blocking query that returns once the index
    /// moves past it or the configured wait elapses.
    #[instrument(skip(self), level = "debug")]
    pub async fn kv_get(&self, key: &str, query: KvQuery) -> Result<KvResponse, StoreError> {
        let mut request = self.http_client.get(self.kv_url(key));
        if query.recurse {
            request = request.query(&[("recurse", "true")]);
        }
        if let Some(index) = query.index {
            request = request.query(&[
                ("index", index.to_string()),
                ("wait", format!("{}s", self.wait.as_secs())),
            ]);
        }

        let response = self.send(request).await?;
        let index = Self::read_index(&response);

        if response.status() == StatusCode::NOT_FOUND {
            debug!("KV key not found: {}", key);
            return Ok(KvResponse {
                entries: Vec::new(),
                index,
            });
        }

        let response = Self::check_status(response).await?;
        let entries: Vec<KvEntry> = response
            .json()
            .await
            .map_err(|e| ConsulError::Decode(format!("KV GET {}: {}", key, e)))?;

        debug!("KV GET {} ({} entries, index {})", key, entries.len(), index);
        Ok(KvResponse { entries, index })
    }

    /// Write a key. Returns whether Consul applied the write.
    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    pub async fn kv_put(
        &self,
        key: &str,
        value: &[u8],
        params: &WriteParams,
    ) -> Result<bool, StoreError> {
        let mut request = self
            .http_client
            .put(self.kv_url(key))
            .body(value.to_vec());
        if let Some(flags) = params.flags {
            request = request.query(&[("flags", flags.to_string())]);
        }
        if let Some(cas) = params.cas {
            request = request.query(&[("cas", cas.to_string())]);
        }
        if let Some(session) = &params.acquire {
            request = request.query(&[("acquire", session)]);
        }
        if let Some(session) = &params.release {
            request = request.query(&[("release", session)]);
        }

        let response = self.send(request).await?;
        let applied = Self::read_bool(response).await?;
        debug!("KV PUT {} ({} bytes) -> {}", key, value.len(), applied);
        Ok(applied)
    }

    /// Delete a key or, with `recurse`, every key under a prefix.
    #[instrument(skip(self), level = "debug")]
    pub async fn kv_delete(
        &self,
        key: &str,
        recurse: bool,
        cas: Option<u64>,
    ) -> Result<bool, StoreError> {
        let mut request = self.http_client.delete(self.kv_url(key));
        if recurse {
            request = request.query(&[("recurse", "true")]);
        }
        if let Some(cas) = cas {
            request = request.query(&[("cas", cas.to_string())]);
        }

        let response = self.send(request).await?;
        let applied = Self::read_bool(response).await?;
        debug!("KV DELETE {} (recurse: {}) -> {}", key, recurse, applied);
        Ok(applied)
    }

    /// Create a session and return its id.
    #[instrument(skip(self), level = "debug")]
    pub async fn session_create(&self, session: &SessionRequest) -> Result<String, StoreError> {
        let request = self
            .http_client
            .put(self.session_url("create", None))
            .json(session);
        let response = Self::check_status(self.send(request).await?).await?;
        let created: SessionCreated = response
            .json()
            .await
            .map_err(|e| ConsulError::Decode(format!("session create: {}", e)))?;
        debug!("Created session {} (ttl {})", created.id, session.ttl);
        Ok(created.id)
    }

    /// Renew a session. Returns `false` if Consul no longer knows it.
    #[instrument(skip(self), level = "debug")]
    pub async fn session_renew(&self, id: &str) -> Result<bool, StoreError> {
        let request = self.http_client.put(self.session_url("renew", Some(id)));
        let response = self.send(request).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("Session {} not found for renewal", id);
            return Ok(false);
        }
        Self::check_status(response).await?;
        Ok(true)
    }

    /// Destroy a session, invalidating everything it holds.
    #[instrument(skip(self), level = "debug")]
    pub async fn session_destroy(&self, id: &str) -> Result<bool, StoreError> {
        let request = self.http_client.put(self.session_url("destroy", Some(id)));
        let response = self.send(request).await?;
        Self::read_bool(response).await
    }

    /// Close the client. In-flight requests fail with `NotReachable`.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}
