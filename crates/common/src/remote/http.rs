use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use url::Url;

use super::api::{ListedObject, ManifestEntry, ObjectMutation, ObjectStoreApi, PartDescriptor};
use super::listing::DEFAULT_LISTING_TTL;
use crate::error::{RemoteError, Result};
use crate::upload::Chunk;

/// Protocol version we announce to the server
pub const API_VERSION: &str = "0.1.18";

/// Production endpoint of the object store
pub const DEFAULT_API_URL: &str = "https://api.copy.com";

/// Listings are requested unpaginated
const LIST_MAX_ITEMS: u64 = 1_000_000;

const AUTH_HEADER: &str = "x-authorization";
const SUCCESS: &str = "success";

/// Connection and cache settings for the remote client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL every endpoint is resolved against
    pub api_url: Url,
    /// How long a directory listing is served from cache
    pub listing_ttl: Duration,
    /// Maximum number of requests in flight (and idle pooled connections)
    pub pool_size: usize,
    /// Whole-request timeout, including body transfer
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: Url::parse(DEFAULT_API_URL).expect("hardcoded URL must parse"),
            listing_ttl: DEFAULT_LISTING_TTL,
            pool_size: 8,
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Token handed out by `/auth_user`.
///
/// Empty until login succeeds. There is no refresh: the token is used for
/// the lifetime of the process.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct AuthSession {
    token: String,
}

impl AuthSession {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_authenticated(&self) -> bool {
        !self.token.is_empty()
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

#[derive(Serialize)]
struct Credentials<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct PathRequest<'a> {
    path: &'a str,
}

#[derive(Serialize)]
struct ListRequest<'a> {
    path: &'a str,
    max_items: u64,
}

#[derive(Serialize)]
struct UpdateRequest<'a> {
    meta: Vec<MetaEntry<'a>>,
}

/// Wire form of an [`ObjectMutation`]
#[derive(Serialize)]
struct MetaEntry<'a> {
    action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    object_type: Option<&'static str>,
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_path: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parts: Option<&'a [ManifestEntry]>,
}

impl<'a> From<&'a ObjectMutation> for MetaEntry<'a> {
    fn from(mutation: &'a ObjectMutation) -> Self {
        let mut entry = MetaEntry {
            action: mutation.action(),
            object_type: None,
            path: mutation.path(),
            new_path: None,
            size: None,
            parts: None,
        };
        match mutation {
            ObjectMutation::CreateFile { size, parts, .. } => {
                entry.object_type = Some("file");
                entry.size = Some(*size);
                entry.parts = Some(parts.as_slice());
            }
            ObjectMutation::CreateDir { .. } => entry.object_type = Some("dir"),
            ObjectMutation::Rename { new_path, .. } => entry.new_path = Some(new_path.as_str()),
            ObjectMutation::Remove { .. } => {}
        }
        entry
    }
}

#[derive(Deserialize)]
struct AuthResponse {
    auth_token: Option<String>,
}

#[derive(Deserialize)]
struct ListResponse {
    children: Option<Vec<ListedObject>>,
}

#[derive(Deserialize)]
struct HasPartsResponse {
    send_parts: Option<Vec<PartDescriptor>>,
}

#[derive(Deserialize)]
struct ResultResponse {
    result: Option<String>,
}

impl ResultResponse {
    fn ensure_success(self, endpoint: &str) -> Result<()> {
        match self.result.as_deref() {
            Some(SUCCESS) => Ok(()),
            Some(other) => Err(RemoteError::unavailable(format!(
                "{} returned result `{}`",
                endpoint, other
            ))),
            None => Err(RemoteError::missing_field(endpoint, "result")),
        }
    }
}

/// HTTP implementation of [`ObjectStoreApi`].
///
/// Owns a pooled `reqwest` client. The pool keeps up to `pool_size` idle
/// connections and a semaphore with the same number of permits bounds the
/// number of requests in flight, so concurrent filesystem operations share
/// a fixed set of connections instead of queueing on one.
#[derive(Debug)]
pub struct HttpApi {
    base: Url,
    client: Client,
    session: AuthSession,
    permits: Arc<Semaphore>,
}

impl HttpApi {
    /// Build an unauthenticated client
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut default_headers = HeaderMap::new();
        default_headers.insert("x-client-type", HeaderValue::from_static("api"));
        default_headers.insert("x-api-version", HeaderValue::from_static(API_VERSION));
        default_headers.insert(ACCEPT, HeaderValue::from_static("text/plain"));

        let pool_size = config.pool_size.max(1);
        let client = Client::builder()
            .default_headers(default_headers)
            .pool_max_idle_per_host(pool_size)
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;

        Ok(Self {
            base: with_trailing_slash(&config.api_url),
            client,
            session: AuthSession::default(),
            permits: Arc::new(Semaphore::new(pool_size)),
        })
    }

    /// Build a client and log in with it
    pub async fn login(config: &ClientConfig, username: &str, password: &str) -> Result<Self> {
        let mut api = Self::new(config)?;
        api.authenticate(username, password).await?;
        Ok(api)
    }

    /// Exchange credentials for a session token.
    ///
    /// Fails with [`RemoteError::PermissionDenied`] when the server answers
    /// without a token.
    pub async fn authenticate(&mut self, username: &str, password: &str) -> Result<AuthSession> {
        let builder = self.form_request("/auth_user", &Credentials { username, password })?;
        let (status, body) = self.exchange("/auth_user", builder).await?;

        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(RemoteError::PermissionDenied(format!(
                "login for {} rejected with {}",
                username, status
            )));
        }

        let response: AuthResponse = serde_json::from_slice(&body)?;
        match response.auth_token {
            Some(token) if !token.is_empty() => {
                self.session = AuthSession::new(token);
                tracing::info!("authenticated as {}", username);
                Ok(self.session.clone())
            }
            _ => Err(RemoteError::PermissionDenied(format!(
                "no auth token issued for {}",
                username
            ))),
        }
    }

    pub fn session(&self) -> &AuthSession {
        &self.session
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Endpoints resolve below the base URL, keeping any path prefix it has
    fn endpoint_url(&self, endpoint: &str) -> Result<Url> {
        Ok(self.base.join(endpoint.trim_start_matches('/'))?)
    }

    fn request(&self, endpoint: &str) -> Result<RequestBuilder> {
        let mut builder = self.client.post(self.endpoint_url(endpoint)?);
        if self.session.is_authenticated() {
            builder = builder.header(AUTH_HEADER, self.session.token());
        }
        Ok(builder)
    }

    /// A request whose body is the form field `data` holding `payload` as JSON
    fn form_request<T: Serialize>(&self, endpoint: &str, payload: &T) -> Result<RequestBuilder> {
        let data = serde_json::to_string(payload)?;
        Ok(self.request(endpoint)?.form(&[("data", data)]))
    }

    /// Send a request while holding a pool permit and read the whole body
    async fn exchange(
        &self,
        endpoint: &str,
        builder: RequestBuilder,
    ) -> Result<(StatusCode, Bytes)> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| RemoteError::unavailable("connection pool closed"))?;

        tracing::trace!("POST {}", endpoint);
        let response = builder.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        Ok((status, body))
    }

    /// Exchange and require a 2xx status
    async fn call(&self, endpoint: &str, builder: RequestBuilder) -> Result<Bytes> {
        let (status, body) = self.exchange(endpoint, builder).await?;
        if !status.is_success() {
            return Err(RemoteError::unavailable(format!(
                "{} failed with HTTP {}",
                endpoint, status
            )));
        }
        Ok(body)
    }

    async fn call_json<R: DeserializeOwned>(
        &self,
        endpoint: &str,
        builder: RequestBuilder,
    ) -> Result<R> {
        let body = self.call(endpoint, builder).await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

fn with_trailing_slash(url: &Url) -> Url {
    let mut url = url.clone();
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

/// Per-part headers: a total count plus fingerprint, size and share flag
/// for every part, numbered from 1.
pub(crate) fn part_headers<'a>(
    parts: impl ExactSizeIterator<Item = &'a PartDescriptor>,
) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert("x-part-count", HeaderValue::from(parts.len()));

    for (i, part) in parts.enumerate() {
        let n = i + 1;
        let fingerprint = HeaderValue::from_str(&part.fingerprint).map_err(|_| {
            RemoteError::ProtocolInvariant(format!("fingerprint {} is not a header value", n))
        })?;
        headers.insert(header_name("X-Part-Fingerprint", n)?, fingerprint);
        headers.insert(header_name("X-Part-Size", n)?, HeaderValue::from(part.size));
        headers.insert(header_name("X-Part-Share", n)?, HeaderValue::from(0u32));
    }

    Ok(headers)
}

fn header_name(prefix: &str, n: usize) -> Result<HeaderName> {
    HeaderName::from_bytes(format!("{}-{}", prefix, n).as_bytes())
        .map_err(|e| RemoteError::ProtocolInvariant(e.to_string()))
}

#[async_trait]
impl ObjectStoreApi for HttpApi {
    async fn list_objects(&self, path: &str) -> Result<Vec<ListedObject>> {
        let builder = self.form_request(
            "/list_objects",
            &ListRequest {
                path,
                max_items: LIST_MAX_ITEMS,
            },
        )?;
        let response: ListResponse = self.call_json("/list_objects", builder).await?;
        response
            .children
            .ok_or_else(|| RemoteError::missing_field("/list_objects", "children"))
    }

    async fn download_object(&self, path: &str) -> Result<Bytes> {
        let builder = self.form_request("/download_object", &PathRequest { path })?;
        self.call("/download_object", builder).await
    }

    async fn has_parts(&self, parts: &[PartDescriptor]) -> Result<Vec<PartDescriptor>> {
        let builder = self
            .form_request("/has_parts", &serde_json::Value::Null)?
            .headers(part_headers(parts.iter())?);
        let response: HasPartsResponse = self.call_json("/has_parts", builder).await?;
        response
            .send_parts
            .ok_or_else(|| RemoteError::missing_field("/has_parts", "send_parts"))
    }

    async fn send_parts(&self, parts: &[Chunk]) -> Result<()> {
        let total: usize = parts.iter().map(|p| p.size as usize).sum();
        let mut payload = BytesMut::with_capacity(total);
        for part in parts {
            let data = part.payload.as_ref().ok_or_else(|| {
                RemoteError::ProtocolInvariant(format!(
                    "chunk at offset {} has no payload left to send",
                    part.offset
                ))
            })?;
            payload.extend_from_slice(data);
        }

        let descriptors: Vec<PartDescriptor> = parts.iter().map(Chunk::descriptor).collect();
        let builder = self
            .request("/send_parts")?
            .headers(part_headers(descriptors.iter())?)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(payload.freeze());
        let response: ResultResponse = self.call_json("/send_parts", builder).await?;
        response.ensure_success("/send_parts")
    }

    async fn update_objects(&self, mutations: &[ObjectMutation]) -> Result<()> {
        let request = UpdateRequest {
            meta: mutations.iter().map(MetaEntry::from).collect(),
        };
        let builder = self.form_request("/update_objects", &request)?;
        let response: ResultResponse = self.call_json("/update_objects", builder).await?;
        response.ensure_success("/update_objects")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoints_keep_base_path_prefix() {
        for base in ["https://host.example/api", "https://host.example/api/"] {
            let config = ClientConfig {
                api_url: Url::parse(base).unwrap(),
                ..ClientConfig::default()
            };
            let api = HttpApi::new(&config).unwrap();
            assert_eq!(
                api.endpoint_url("/auth_user").unwrap().as_str(),
                "https://host.example/api/auth_user"
            );
        }

        let api = HttpApi::new(&ClientConfig::default()).unwrap();
        assert_eq!(
            api.endpoint_url("/list_objects").unwrap().path(),
            "/list_objects"
        );
    }

    #[test]
    fn test_part_headers_are_one_based() {
        let parts = vec![
            PartDescriptor {
                fingerprint: "aa".into(),
                size: 3,
            },
            PartDescriptor {
                fingerprint: "bb".into(),
                size: 4,
            },
        ];
        let headers = part_headers(parts.iter()).unwrap();
        assert_eq!(headers["X-Part-Count"], "2");
        assert_eq!(headers["X-Part-Fingerprint-1"], "aa");
        assert_eq!(headers["X-Part-Size-2"], "4");
        assert_eq!(headers["X-Part-Share-2"], "0");
        assert!(headers.get("X-Part-Fingerprint-0").is_none());
    }

    #[test]
    fn test_rename_meta_entry() {
        let mutation = ObjectMutation::Rename {
            path: "/a".into(),
            new_path: "/b".into(),
        };
        let json = serde_json::to_value(MetaEntry::from(&mutation)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"action": "rename", "path": "/a", "new_path": "/b"})
        );
    }

    #[test]
    fn test_session_debug_hides_token() {
        let session = AuthSession::new("secret-token");
        assert!(!format!("{:?}", session).contains("secret-token"));
    }
}
