//! Registry transports.
//!
//! [`RegistryTransport`] is the seam between the registry client and the
//! wire. [`DistributionTransport`] talks to real registries: blobs and
//! pushes go through the `oci-distribution` crate, manifest reads go
//! straight to the distribution API so the body can be streamed into the
//! caller's bounded buffer instead of being read whole.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::OciDescriptor;
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference as OciReference, RegistryOperation};
use parking_lot::Mutex;
use reqwest::header::{
    HeaderMap, ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, WWW_AUTHENTICATE,
};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use skillpack_core::error::{PackError, Result};

use super::validate::{BoundedBuffer, DEFAULT_MAX_MANIFEST_SIZE};
use crate::oci::credentials::CredentialStore;
use crate::oci::digest::Digest;
use crate::oci::image::{
    media_type_of, Descriptor, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_IMAGE_INDEX, MEDIA_TYPE_IMAGE_MANIFEST,
};
use crate::oci::reference::Reference;

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
/// Ceiling for a token endpoint response.
const MAX_TOKEN_RESPONSE_SIZE: u64 = 64 * 1024;

/// Manifest media types requested from registries.
const ACCEPTED_MANIFEST_TYPES: &[&str] = &[
    MEDIA_TYPE_IMAGE_INDEX,
    MEDIA_TYPE_IMAGE_MANIFEST,
    MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_DOCKER_MANIFEST,
];

/// Environment variable holding a registry username.
pub const REGISTRY_USERNAME_ENV: &str = "REGISTRY_USERNAME";
/// Environment variable holding a registry password.
pub const REGISTRY_PASSWORD_ENV: &str = "REGISTRY_PASSWORD";

/// Wire access to a remote registry.
///
/// Fetches write into a [`BoundedBuffer`] owned by the caller so that a
/// transport cannot deliver more than the caller's ceiling.
#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Resolve a tag or digest reference to the descriptor of its root manifest.
    async fn resolve(&self, reference: &Reference) -> Result<Descriptor>;

    /// Fetch a manifest or index by descriptor.
    async fn fetch_manifest(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        out: &mut BoundedBuffer,
    ) -> Result<()>;

    /// Fetch a config or layer blob by descriptor.
    async fn fetch_blob(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        out: &mut BoundedBuffer,
    ) -> Result<()>;

    /// Upload a blob. Returns `AlreadyExists` if the registry already has it.
    async fn push_blob(&self, reference: &Reference, descriptor: &Descriptor, data: &[u8]) -> Result<()>;

    /// Upload a manifest under the reference's tag, or its digest when untagged.
    async fn push_manifest(&self, target: &Reference, media_type: &str, data: &[u8]) -> Result<()>;
}

/// Authentication credentials for a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    /// Anonymous access.
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    /// Basic authentication with username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Credentials from `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`, else anonymous.
    pub fn from_env() -> Self {
        let username = std::env::var(REGISTRY_USERNAME_ENV).ok();
        let password = std::env::var(REGISTRY_PASSWORD_ENV).ok();

        match (username, password) {
            (Some(u), Some(p)) if !u.is_empty() => Self::basic(u, p),
            _ => Self::anonymous(),
        }
    }

    /// Credentials from the credential store, then the environment, then anonymous.
    pub fn from_credential_store(store: &CredentialStore, registry: &str) -> Self {
        match store.get(registry) {
            Ok(Some(credential)) => Self::basic(credential.username, credential.password),
            Ok(None) => Self::from_env(),
            Err(e) => {
                tracing::warn!(registry, error = %e, "Ignoring unreadable credential store");
                Self::from_env()
            }
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_none()
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

/// Authorization for manifest reads in one repository.
#[derive(Debug, Clone)]
enum PullAuth {
    Basic,
    Bearer(String),
}

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Challenge {
    Basic,
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Transport backed by `oci-distribution` and the distribution HTTP API.
pub struct DistributionTransport {
    client: Client,
    http: reqwest::Client,
    auth: RegistryAuth,
    insecure: bool,
    /// Ceiling for a manifest body read while resolving
    max_manifest_size: u64,
    /// Manifest read authorization per `registry/repository`
    pull_auth: Mutex<HashMap<String, PullAuth>>,
    /// `repository/operation` pairs already authenticated
    authenticated: tokio::sync::Mutex<HashSet<String>>,
}

impl DistributionTransport {
    /// Transport using HTTPS.
    pub fn new(auth: RegistryAuth) -> Self {
        Self::with_protocol(auth, false)
    }

    /// Transport using plain HTTP when `insecure` is set.
    pub fn with_protocol(auth: RegistryAuth, insecure: bool) -> Self {
        let config = ClientConfig {
            protocol: if insecure {
                ClientProtocol::Http
            } else {
                ClientProtocol::Https
            },
            ..Default::default()
        };
        Self {
            client: Client::new(config),
            http: reqwest::Client::new(),
            auth,
            insecure,
            max_manifest_size: DEFAULT_MAX_MANIFEST_SIZE,
            pull_auth: Mutex::new(HashMap::new()),
            authenticated: tokio::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Cap the manifest body read when a registry's `HEAD` response does
    /// not describe the manifest.
    pub fn with_max_manifest_size(mut self, max: u64) -> Self {
        self.max_manifest_size = max;
        self
    }

    fn manifest_url(&self, reference: &Reference, target: &str) -> String {
        let scheme = if self.insecure { "http" } else { "https" };
        let host = match reference.registry.as_str() {
            "docker.io" => "registry-1.docker.io",
            other => other,
        };
        format!(
            "{}://{}/v2/{}/manifests/{}",
            scheme, host, reference.repository, target
        )
    }

    /// Send a manifest request, answering one auth challenge if needed.
    async fn manifest_request(
        &self,
        method: Method,
        reference: &Reference,
        target: &str,
        op: &str,
    ) -> Result<reqwest::Response> {
        let url = self.manifest_url(reference, target);
        let key = reference.repository_name();
        let mut challenged = false;

        loop {
            let mut request = self
                .http
                .request(method.clone(), &url)
                .header(ACCEPT, ACCEPTED_MANIFEST_TYPES.join(", "));
            let auth = self.pull_auth.lock().get(&key).cloned();
            request = match (auth, &self.auth.username, &self.auth.password) {
                (Some(PullAuth::Bearer(token)), _, _) => request.bearer_auth(token),
                (Some(PullAuth::Basic), Some(u), p) => request.basic_auth(u, p.as_ref()),
                _ => request,
            };

            let response = request
                .send()
                .await
                .map_err(|e| registry_error(op, reference, e))?;

            match response.status() {
                StatusCode::UNAUTHORIZED if !challenged => {
                    let challenge = header_str(response.headers(), WWW_AUTHENTICATE.as_str())
                        .ok_or_else(|| {
                            registry_error(op, reference, "401 without WWW-Authenticate challenge")
                        })?
                        .to_string();
                    let auth = self.authorize(reference, &challenge).await?;
                    self.pull_auth.lock().insert(key.clone(), auth);
                    challenged = true;
                }
                StatusCode::NOT_FOUND => {
                    return Err(PackError::NotFound(format!("manifest {}", reference)))
                }
                status if status.is_success() => return Ok(response),
                status => {
                    return Err(registry_error(
                        op,
                        reference,
                        format!("{} {} returned {}", method, url, status),
                    ))
                }
            }
        }
    }

    async fn authorize(&self, reference: &Reference, challenge: &str) -> Result<PullAuth> {
        match parse_challenge(challenge) {
            Some(Challenge::Basic) if !self.auth.is_anonymous() => Ok(PullAuth::Basic),
            Some(Challenge::Basic) => Err(registry_error(
                "authenticate",
                reference,
                "registry requires credentials",
            )),
            Some(Challenge::Bearer {
                realm,
                service,
                scope,
            }) => {
                let scope =
                    scope.unwrap_or_else(|| format!("repository:{}:pull", reference.repository));
                let mut request = self.http.get(&realm).query(&[("scope", scope.as_str())]);
                if let Some(ref service) = service {
                    request = request.query(&[("service", service.as_str())]);
                }
                if let (Some(u), p) = (&self.auth.username, &self.auth.password) {
                    request = request.basic_auth(u, p.as_ref());
                }

                let response = request
                    .send()
                    .await
                    .map_err(|e| registry_error("authenticate", reference, e))?;
                if !response.status().is_success() {
                    return Err(registry_error(
                        "authenticate",
                        reference,
                        format!("token endpoint returned {}", response.status()),
                    ));
                }

                let mut body = BoundedBuffer::new(MAX_TOKEN_RESPONSE_SIZE);
                read_body(response, &mut body, "authenticate", reference).await?;
                let token: TokenResponse = serde_json::from_slice(&body.into_inner())?;
                token
                    .token
                    .or(token.access_token)
                    .filter(|t| !t.is_empty())
                    .map(PullAuth::Bearer)
                    .ok_or_else(|| {
                        registry_error("authenticate", reference, "token endpoint returned no token")
                    })
            }
            None => Err(registry_error(
                "authenticate",
                reference,
                format!("unsupported challenge '{}'", challenge),
            )),
        }
    }

    async fn ensure_auth(&self, target: &OciReference, reference: &Reference, operation: RegistryOperation) -> Result<()> {
        let key = format!(
            "{}/{}",
            reference.repository_name(),
            match operation {
                RegistryOperation::Push => "push",
                RegistryOperation::Pull => "pull",
            }
        );
        let mut authenticated = self.authenticated.lock().await;
        if authenticated.contains(&key) {
            return Ok(());
        }
        self.client
            .auth(target, &self.auth.to_oci_auth(), operation)
            .await
            .map_err(|e| registry_error("authenticate", reference, e))?;
        authenticated.insert(key);
        Ok(())
    }
}

/// Convert to an `oci-distribution` reference, preferring the digest.
fn to_oci_reference(reference: &Reference) -> Result<OciReference> {
    let ref_str = match (&reference.digest, &reference.tag) {
        (Some(digest), _) => format!("{}@{}", reference.repository_name(), digest),
        (None, Some(tag)) => format!("{}:{}", reference.repository_name(), tag),
        (None, None) => {
            return Err(PackError::InvalidInput(format!(
                "Reference '{}' must include a tag or digest",
                reference
            )))
        }
    };

    ref_str.parse::<OciReference>().map_err(|e| {
        PackError::InvalidInput(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}

fn to_oci_descriptor(descriptor: &Descriptor) -> OciDescriptor {
    OciDescriptor {
        media_type: descriptor.media_type.clone(),
        digest: descriptor.digest.to_string(),
        size: descriptor.size,
        ..Default::default()
    }
}

fn registry_error(op: &str, reference: &Reference, e: impl std::fmt::Display) -> PackError {
    PackError::RegistryError {
        registry: reference.registry.clone(),
        message: format!("{} {}: {}", op, reference, e),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Stream a response body into `out`, stopping as soon as it is full.
///
/// A declared `Content-Length` past the buffer's limit is refused before
/// any of the body is read.
async fn read_body(
    mut response: reqwest::Response,
    out: &mut BoundedBuffer,
    op: &str,
    reference: &Reference,
) -> Result<()> {
    let declared = header_str(response.headers(), CONTENT_LENGTH.as_str())
        .and_then(|v| v.parse::<u64>().ok());
    if let Some(size) = declared {
        if size > out.limit() {
            return Err(PackError::SizeLimitExceeded {
                what: format!("{} {}", op, reference),
                size,
                limit: out.limit(),
            });
        }
    }

    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| registry_error(op, reference, e))?
    {
        out.write_bytes(&chunk)
            .map_err(|e| registry_error(op, reference, e))?;
    }
    Ok(())
}

/// Parse a `WWW-Authenticate` header value.
fn parse_challenge(header: &str) -> Option<Challenge> {
    let header = header.trim();
    let (scheme, params) = header.split_once(' ').unwrap_or((header, ""));
    if scheme.eq_ignore_ascii_case("basic") {
        return Some(Challenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let (mut realm, mut service, mut scope) = (None, None, None);
    let mut rest = params.trim();
    while let Some((key, after)) = rest.split_once('=') {
        let key = key.trim().trim_start_matches(',').trim();
        let after = after.trim_start();
        // Quoted values may contain commas, e.g. "repository:a:pull,push".
        let (value, remainder) = match after.strip_prefix('"') {
            Some(quoted) => match quoted.find('"') {
                Some(end) => (&quoted[..end], &quoted[end + 1..]),
                None => (quoted, ""),
            },
            None => match after.find(',') {
                Some(end) => (&after[..end], &after[end..]),
                None => (after, ""),
            },
        };
        match key.to_ascii_lowercase().as_str() {
            "realm" => realm = Some(value.to_string()),
            "service" => service = Some(value.to_string()),
            "scope" => scope = Some(value.to_string()),
            _ => {}
        }
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }

    Some(Challenge::Bearer {
        realm: realm?,
        service,
        scope,
    })
}

#[async_trait]
impl RegistryTransport for DistributionTransport {
    async fn resolve(&self, reference: &Reference) -> Result<Descriptor> {
        let target = match (&reference.digest, &reference.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => {
                return Err(PackError::InvalidInput(format!(
                    "Reference '{}' must include a tag or digest",
                    reference
                )))
            }
        };

        let response = self
            .manifest_request(Method::HEAD, reference, &target, "resolve")
            .await?;
        let headers = response.headers();
        let claimed = match header_str(headers, DOCKER_CONTENT_DIGEST) {
            Some(d) => Some(Digest::parse(d).map_err(|e| registry_error("resolve", reference, e))?),
            None => reference.digest.clone(),
        };
        let size = header_str(headers, CONTENT_LENGTH.as_str()).and_then(|v| v.parse::<i64>().ok());
        let media_type = header_str(headers, CONTENT_TYPE.as_str())
            .and_then(|v| v.split(';').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        // The registry's claims are kept as-is; validation checks them
        // against the bytes when the manifest is fetched.
        let descriptor = match (claimed, size, media_type) {
            (Some(digest), Some(size), Some(media_type)) => Descriptor {
                media_type,
                digest,
                size,
                platform: None,
                artifact_type: None,
                annotations: Default::default(),
            },
            (claimed, _, _) => {
                tracing::debug!(
                    reference = %reference,
                    "Registry HEAD response incomplete, reading manifest body"
                );
                let response = self
                    .manifest_request(Method::GET, reference, &target, "resolve")
                    .await?;
                let claimed = match header_str(response.headers(), DOCKER_CONTENT_DIGEST) {
                    Some(d) => Some(
                        Digest::parse(d).map_err(|e| registry_error("resolve", reference, e))?,
                    ),
                    None => claimed,
                };
                let mut body = BoundedBuffer::new(self.max_manifest_size);
                let read = read_body(response, &mut body, "resolve", reference).await;
                if body.exceeded() {
                    return Err(PackError::SizeLimitExceeded {
                        what: format!("manifest {}", reference),
                        size: body.len() as u64,
                        limit: self.max_manifest_size,
                    });
                }
                read?;
                let data = body.into_inner();
                Descriptor {
                    media_type: media_type_of(&data)?,
                    digest: claimed.unwrap_or_else(|| Digest::of(&data)),
                    size: data.len() as i64,
                    platform: None,
                    artifact_type: None,
                    annotations: Default::default(),
                }
            }
        };

        tracing::debug!(
            reference = %reference,
            digest = %descriptor.digest,
            size = descriptor.size,
            "Resolved reference"
        );
        Ok(descriptor)
    }

    async fn fetch_manifest(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        out: &mut BoundedBuffer,
    ) -> Result<()> {
        let pinned = reference.at_digest(descriptor.digest.clone());
        let response = self
            .manifest_request(
                Method::GET,
                &pinned,
                &descriptor.digest.to_string(),
                "fetch manifest",
            )
            .await?;
        read_body(response, out, "fetch manifest", &pinned).await
    }

    async fn fetch_blob(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
        out: &mut BoundedBuffer,
    ) -> Result<()> {
        let target = to_oci_reference(reference)?;
        self.ensure_auth(&target, reference, RegistryOperation::Pull).await?;
        self.client
            .pull_blob(&target, &to_oci_descriptor(descriptor), out)
            .await
            .map_err(|e| registry_error(&format!("fetch blob {}", descriptor.digest), reference, e))
    }

    async fn push_blob(&self, reference: &Reference, descriptor: &Descriptor, data: &[u8]) -> Result<()> {
        let target = to_oci_reference(reference)?;
        self.ensure_auth(&target, reference, RegistryOperation::Push).await?;
        self.client
            .push_blob(&target, data, &descriptor.digest.to_string())
            .await
            .map_err(|e| registry_error(&format!("push blob {}", descriptor.digest), reference, e))?;
        Ok(())
    }

    async fn push_manifest(&self, target: &Reference, media_type: &str, data: &[u8]) -> Result<()> {
        let oci_target = to_oci_reference(target)?;
        self.ensure_auth(&oci_target, target, RegistryOperation::Push).await?;
        let content_type = http::HeaderValue::from_str(media_type).map_err(|e| {
            PackError::InvalidInput(format!("Invalid media type '{}': {}", media_type, e))
        })?;
        self.client
            .push_manifest_raw(&oci_target, data.to_vec(), content_type)
            .await
            .map_err(|e| registry_error("push manifest", target, e))?;
        Ok(())
    }
}
