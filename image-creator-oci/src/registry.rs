use std::collections::HashMap;
use std::time::Duration;

use futures_util::TryStreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::credentials::{DockerCredentials, RegistryAuth};
use crate::error::{OciError, Result};
use crate::manifest::{
    self, sha256_digest, ImageIndex, Platform, ResolvedManifest, MEDIA_TYPE_DOCKER_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
use crate::reference::ImageRef;
use crate::transport::BlobReader;

// ---------------------------------------------------------------------------
// RegistryClient
// ---------------------------------------------------------------------------

/// Low-level OCI Distribution HTTP client.
pub struct RegistryClient {
    client: reqwest::Client,
    credentials: DockerCredentials,
    /// Bearer tokens keyed by `registry/repository`.
    tokens: Mutex<HashMap<String, String>>,
}

/// Return the base URL scheme for a registry host.
/// Localhost and loopback registries default to HTTP; everything else to HTTPS.
fn registry_scheme(registry: &str) -> &'static str {
    let host = if registry.starts_with('[') {
        registry
            .split(']')
            .next()
            .unwrap_or(registry)
            .trim_start_matches('[')
    } else {
        registry.split(':').next().unwrap_or(registry)
    };
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        "http"
    } else {
        "https"
    }
}

enum Authorization {
    Bearer(String),
    Basic(RegistryAuth),
}

impl RegistryClient {
    pub fn new(credentials: DockerCredentials) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("image-creator/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            credentials,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// A client without credentials.
    pub fn anonymous() -> Result<Self> {
        Self::new(DockerCredentials::anonymous())
    }

    // -- public API ---------------------------------------------------------

    /// Fetch the manifest (or image index) for `image_ref`.
    ///
    /// When the registry returns an image index the caller receives
    /// `ManifestResponse::Index`; for a single manifest it receives
    /// `ManifestResponse::Manifest`.
    pub async fn fetch_manifest(&self, image_ref: &ImageRef) -> Result<ManifestResponse> {
        let accept = [
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_MANIFEST_LIST,
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST,
        ]
        .join(", ");

        let (body, content_type) = self
            .fetch_manifest_bytes(image_ref, image_ref.reference(), &accept)
            .await?;
        if let Some(digest) = &image_ref.digest {
            verify_digest(digest, &body)?;
        }

        // Peek at the response to decide which type to deserialize.
        let raw: serde_json::Value = serde_json::from_slice(&body)?;
        let media_type = raw
            .get("mediaType")
            .and_then(|v| v.as_str())
            .or(content_type.as_deref())
            .unwrap_or("");

        if manifest::is_index_media_type(media_type) || raw.get("manifests").is_some() {
            let idx: ImageIndex = serde_json::from_value(raw)?;
            Ok(ManifestResponse::Index(idx))
        } else {
            let m = ResolvedManifest::from_raw(body, content_type.as_deref())?;
            Ok(ManifestResponse::Manifest(m))
        }
    }

    /// Fetch a single manifest by its digest (used after resolving an index).
    pub async fn fetch_manifest_by_digest(
        &self,
        image_ref: &ImageRef,
        digest: &str,
    ) -> Result<ResolvedManifest> {
        let accept = [MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST].join(", ");
        let (body, content_type) = self.fetch_manifest_bytes(image_ref, digest, &accept).await?;
        verify_digest(digest, &body)?;
        ResolvedManifest::from_raw(body, content_type.as_deref())
    }

    /// Resolve an image reference to a concrete manifest by first fetching
    /// the manifest (which may be an index) and selecting the
    /// platform-appropriate entry if needed.
    pub async fn resolve_manifest(
        &self,
        image_ref: &ImageRef,
        platform: &Platform,
    ) -> Result<ResolvedManifest> {
        match self.fetch_manifest(image_ref).await? {
            ManifestResponse::Manifest(m) => Ok(m),
            ManifestResponse::Index(idx) => {
                let desc = idx.select_platform(platform)?;
                info!(
                    digest = %desc.digest,
                    "resolved platform {}/{}",
                    platform.os,
                    platform.architecture,
                );
                self.fetch_manifest_by_digest(image_ref, &desc.digest).await
            }
        }
    }

    /// Open a streaming download of a blob.  The caller verifies the digest
    /// while consuming the stream.
    pub async fn blob_reader(&self, image_ref: &ImageRef, digest: &str) -> Result<BlobReader> {
        let scheme = registry_scheme(&image_ref.registry);
        let url = format!(
            "{}://{}/v2/{}/blobs/{}",
            scheme, image_ref.registry, image_ref.repository, digest,
        );

        debug!(digest, "downloading blob");
        let resp = self.authenticated_get(&url, image_ref, None).await?;
        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::pin(StreamReader::new(stream)))
    }

    // -- internals ----------------------------------------------------------

    async fn fetch_manifest_bytes(
        &self,
        image_ref: &ImageRef,
        reference: &str,
        accept: &str,
    ) -> Result<(Vec<u8>, Option<String>)> {
        let scheme = registry_scheme(&image_ref.registry);
        let url = format!(
            "{}://{}/v2/{}/manifests/{}",
            scheme, image_ref.registry, image_ref.repository, reference,
        );

        let resp = self.authenticated_get(&url, image_ref, Some(accept)).await?;
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
        let body = resp.bytes().await?.to_vec();
        Ok((body, content_type))
    }

    /// Perform a GET, answering a 401 challenge with a bearer token (anonymous
    /// or credentialed) or Basic auth, then retrying once.
    async fn authenticated_get(
        &self,
        url: &str,
        image_ref: &ImageRef,
        accept: Option<&str>,
    ) -> Result<Response> {
        let key = token_key(image_ref);
        let cached = self.tokens.lock().await.get(&key).cloned();
        let auth = cached.map(Authorization::Bearer);

        let resp = self.request(url, accept, auth.as_ref()).send().await?;

        let resp = if resp.status() == StatusCode::UNAUTHORIZED {
            let www_auth = resp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            let auth = self.authorize(&www_auth, image_ref).await?;
            self.request(url, accept, Some(&auth)).send().await?
        } else {
            resp
        };

        check_status(url, resp).await
    }

    fn request(
        &self,
        url: &str,
        accept: Option<&str>,
        auth: Option<&Authorization>,
    ) -> reqwest::RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(a) = accept {
            req = req.header(ACCEPT, a);
        }
        match auth {
            Some(Authorization::Bearer(token)) => req.bearer_auth(token),
            Some(Authorization::Basic(c)) => req.basic_auth(&c.username, Some(&c.password)),
            None => req,
        }
    }

    async fn authorize(&self, www_auth: &str, image_ref: &ImageRef) -> Result<Authorization> {
        if www_auth.to_ascii_lowercase().starts_with("basic") {
            return self
                .credentials
                .get(&image_ref.registry)
                .cloned()
                .map(Authorization::Basic)
                .ok_or_else(|| {
                    OciError::Registry(format!(
                        "registry {} requires credentials",
                        image_ref.registry
                    ))
                });
        }

        let token = self.fetch_bearer_token(www_auth, image_ref).await?;
        self.tokens
            .lock()
            .await
            .insert(token_key(image_ref), token.clone());
        Ok(Authorization::Bearer(token))
    }

    /// Parse a `www-authenticate: Bearer realm="…",service="…",scope="…"`
    /// header and fetch a token, using stored credentials when present.
    async fn fetch_bearer_token(&self, www_auth: &str, image_ref: &ImageRef) -> Result<String> {
        let realm = extract_param(www_auth, "realm").unwrap_or_default();
        let service = extract_param(www_auth, "service");
        let scope = extract_param(www_auth, "scope")
            .unwrap_or_else(|| format!("repository:{}:pull", image_ref.repository));

        if realm.is_empty() {
            return Err(OciError::Registry(
                "www-authenticate header missing realm".to_string(),
            ));
        }

        let mut query = vec![("scope", scope)];
        if let Some(service) = service {
            query.push(("service", service));
        }
        debug!(%realm, "fetching bearer token");

        let mut req = self.client.get(&realm).query(&query);
        if let Some(c) = self.credentials.get(&image_ref.registry) {
            req = req.basic_auth(&c.username, Some(&c.password));
        }
        let resp = req.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(OciError::Registry(format!(
                "token endpoint returned {}: {}",
                status, body
            )));
        }

        let body: serde_json::Value = resp.json().await?;
        let token = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| OciError::Registry("token response missing token field".to_string()))?;

        Ok(token.to_string())
    }
}

// ---------------------------------------------------------------------------
// ManifestResponse
// ---------------------------------------------------------------------------

/// The result of fetching a manifest endpoint: either a single manifest or
/// an image index that must be further resolved.
pub enum ManifestResponse {
    Manifest(ResolvedManifest),
    Index(ImageIndex),
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn token_key(image_ref: &ImageRef) -> String {
    format!("{}/{}", image_ref.registry, image_ref.repository)
}

async fn check_status(url: &str, resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else if status == StatusCode::NOT_FOUND {
        Err(OciError::NotFound(url.to_string()))
    } else {
        let body = resp.text().await.unwrap_or_default();
        Err(OciError::Registry(format!(
            "GET {} returned {}: {}",
            url, status, body
        )))
    }
}

fn verify_digest(expected: &str, data: &[u8]) -> Result<()> {
    let actual = sha256_digest(data);
    if actual != expected {
        return Err(OciError::DigestMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}

/// Extract a parameter value from a `www-authenticate` header.
/// E.g. `extract_param(header, "realm")` returns the value of `realm="…"`.
fn extract_param(header: &str, param: &str) -> Option<String> {
    let search = format!("{}=\"", param);
    if let Some(start) = header.find(&search) {
        let value_start = start + search.len();
        if let Some(end) = header[value_start..].find('"') {
            return Some(header[value_start..value_start + end].to_string());
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
