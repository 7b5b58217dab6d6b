//! OCI distribution API (v2) client.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use ociref::{Digest, ImageManifest, ImageReference, ACCEPTED_MANIFEST_TYPES};
use reqwest::header::{ACCEPT, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::registry::{Image, RegistryClient, RegistryError};
use crate::repo_store::Repository;

pub struct HttpRegistry {
    verified: Client,
    insecure: Client,
    /// Bearer tokens keyed by `registry/name:actions`.
    tokens: Mutex<HashMap<String, String>>,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl HttpRegistry {
    pub fn new() -> reqwest::Result<Self> {
        let agent = concat!("imagebuilder/", env!("CARGO_PKG_VERSION"));
        Ok(Self {
            verified: Client::builder().user_agent(agent).build()?,
            insecure: Client::builder()
                .user_agent(agent)
                .danger_accept_invalid_certs(true)
                .build()?,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn client(&self, repo: &Repository) -> &Client {
        if repo.skip_server_verification {
            &self.insecure
        } else {
            &self.verified
        }
    }

    /// Sends a request, answering a bearer challenge once if the registry asks.
    async fn send<F>(&self, repo: &Repository, name: &str, actions: &str, make: F) -> Result<Response, String>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let client = self.client(repo);
        let token_key = format!("{}/{}:{}", repo.registry, name, actions);

        let cached = self.tokens.lock().await.get(&token_key).cloned();
        let first = match &cached {
            Some(token) => make(client).bearer_auth(token),
            None => with_basic(make(client), repo),
        };
        let resp = first.send().await.map_err(|e| e.to_string())?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return Ok(resp);
        }

        let Some(challenge) = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge)
        else {
            return Ok(resp);
        };

        let scope = format!("repository:{name}:{actions}");
        let token = self.fetch_token(client, repo, &challenge, &scope).await?;
        self.tokens.lock().await.insert(token_key, token.clone());
        make(client).bearer_auth(token).send().await.map_err(|e| e.to_string())
    }

    async fn fetch_token(
        &self,
        client: &Client,
        repo: &Repository,
        challenge: &HashMap<String, String>,
        scope: &str,
    ) -> Result<String, String> {
        let realm = challenge
            .get("realm")
            .ok_or_else(|| "auth challenge without realm".to_string())?;
        let mut url = Url::parse(realm).map_err(|e| format!("invalid auth realm {realm:?}: {e}"))?;
        {
            let mut q = url.query_pairs_mut();
            if let Some(service) = challenge.get("service") {
                q.append_pair("service", service);
            }
            q.append_pair("scope", scope);
        }
        debug!(registry = %repo.registry, %scope, "requesting registry token");
        let resp = with_basic(client.get(url), repo)
            .send()
            .await
            .map_err(|e| format!("token request failed: {e}"))?;
        if !resp.status().is_success() {
            return Err(format!("token request rejected: {}", resp.status()));
        }
        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| format!("invalid token response: {e}"))?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| "token response without token".to_string())
    }

    async fn get_blob(
        &self,
        repo: &Repository,
        reference: &ImageReference,
        digest: &Digest,
    ) -> Result<Bytes, RegistryError> {
        let url = format!("{}/v2/{}/blobs/{}", repo.base_url(), reference.name(), digest);
        let resp = self
            .send(repo, reference.name(), "pull", |c| c.get(&url))
            .await
            .map_err(|e| RegistryError::pull(reference, e))?;
        if !resp.status().is_success() {
            return Err(RegistryError::pull(
                reference,
                format!("blob {digest}: {}", describe_status(resp.status())),
            ));
        }
        let body = resp
            .bytes()
            .await
            .map_err(|e| RegistryError::pull(reference, format!("blob {digest}: {e}")))?;
        if !digest.matches(&body) {
            return Err(RegistryError::pull(reference, format!("blob {digest}: digest mismatch")));
        }
        Ok(body)
    }

    async fn put_blob(
        &self,
        repo: &Repository,
        reference: &ImageReference,
        digest: &Digest,
        body: &Bytes,
    ) -> Result<(), RegistryError> {
        let base = repo.base_url();
        let name = reference.name();

        let head_url = format!("{base}/v2/{name}/blobs/{digest}");
        let exists = self
            .send(repo, name, "pull,push", |c| c.head(&head_url))
            .await
            .map_err(|e| RegistryError::push(reference, e))?;
        if exists.status().is_success() {
            debug!(%digest, "blob already present");
            return Ok(());
        }

        let start_url = format!("{base}/v2/{name}/blobs/uploads/");
        let started = self
            .send(repo, name, "pull,push", |c| c.post(&start_url))
            .await
            .map_err(|e| RegistryError::push(reference, e))?;
        if started.status() != StatusCode::ACCEPTED {
            return Err(RegistryError::push(
                reference,
                format!("starting upload: {}", describe_status(started.status())),
            ));
        }
        let location = started
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| RegistryError::push(reference, "upload session without Location"))?;
        let mut upload_url = Url::parse(&base)
            .and_then(|b| b.join(location))
            .map_err(|e| RegistryError::push(reference, format!("bad upload location: {e}")))?;
        upload_url.query_pairs_mut().append_pair("digest", digest.as_str());

        let done = self
            .send(repo, name, "pull,push", |c| {
                c.put(upload_url.clone())
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .body(body.clone())
            })
            .await
            .map_err(|e| RegistryError::push(reference, e))?;
        if !done.status().is_success() {
            return Err(RegistryError::push(
                reference,
                format!("blob {digest}: {}", describe_status(done.status())),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryClient for HttpRegistry {
    // TODO: stream layer blobs from source to destination instead of buffering them.
    async fn pull(&self, repo: &Repository, reference: &ImageReference) -> Result<Image, RegistryError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            repo.base_url(),
            reference.name(),
            reference.tag()
        );
        let accept = ACCEPTED_MANIFEST_TYPES.join(", ");
        let resp = self
            .send(repo, reference.name(), "pull", |c| c.get(&url).header(ACCEPT, &accept))
            .await
            .map_err(|e| RegistryError::pull(reference, e))?;

        match resp.status() {
            s if s.is_success() => {}
            StatusCode::NOT_FOUND => return Err(RegistryError::pull(reference, "manifest unknown")),
            s => return Err(RegistryError::pull(reference, describe_status(s))),
        }

        let manifest_bytes = resp
            .bytes()
            .await
            .map_err(|e| RegistryError::manifest(reference, e.to_string()))?;
        let manifest =
            ImageManifest::from_slice(&manifest_bytes).map_err(|e| RegistryError::manifest(reference, e))?;

        let mut blobs = HashMap::new();
        for desc in manifest.blobs() {
            let blob = self.get_blob(repo, reference, &desc.digest).await?;
            blobs.insert(desc.digest.clone(), blob);
        }
        Ok(Image { manifest, manifest_bytes, blobs })
    }

    async fn push(
        &self,
        repo: &Repository,
        reference: &ImageReference,
        image: &Image,
    ) -> Result<Digest, RegistryError> {
        for desc in image.manifest.blobs() {
            let body = image
                .blobs
                .get(&desc.digest)
                .ok_or_else(|| RegistryError::push(reference, format!("missing blob {}", desc.digest)))?;
            self.put_blob(repo, reference, &desc.digest, body).await?;
        }

        let url = format!(
            "{}/v2/{}/manifests/{}",
            repo.base_url(),
            reference.name(),
            reference.tag()
        );
        let content_type = image.manifest.content_type().to_string();
        let resp = self
            .send(repo, reference.name(), "pull,push", |c| {
                c.put(&url)
                    .header(CONTENT_TYPE, &content_type)
                    .body(image.manifest_bytes.clone())
            })
            .await
            .map_err(|e| RegistryError::push(reference, e))?;
        if !resp.status().is_success() {
            return Err(RegistryError::push(
                reference,
                format!("manifest: {}", describe_status(resp.status())),
            ));
        }

        let digest = resp
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Digest>().ok())
            .unwrap_or_else(|| image.digest());
        Ok(digest)
    }
}

fn with_basic(req: RequestBuilder, repo: &Repository) -> RequestBuilder {
    match &repo.credentials {
        Some(c) => req.basic_auth(&c.username, Some(&c.password)),
        None => req,
    }
}

fn describe_status(status: StatusCode) -> String {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => format!("unauthorized ({status})"),
        StatusCode::NOT_FOUND => format!("not found ({status})"),
        s => format!("registry returned {s}"),
    }
}

/// Parses `Bearer realm="...",service="...",scope="..."`. Values may hold commas.
fn parse_bearer_challenge(header: &str) -> Option<HashMap<String, String>> {
    let rest = header.strip_prefix("Bearer ")?;
    let mut params = HashMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        while matches!(chars.peek(), Some(' ') | Some(',')) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }
        let value: String = if chars.peek() == Some(&'"') {
            chars.next();
            chars.by_ref().take_while(|c| *c != '"').collect()
        } else {
            chars.by_ref().take_while(|c| *c != ',').collect()
        };
        params.insert(key.trim().to_ascii_lowercase(), value);
    }
    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_challenge_with_commas_in_scope() {
        let h = r#"Bearer realm="https://auth.example.com/token",service="registry.example.com",scope="repository:os:pull,push""#;
        let p = parse_bearer_challenge(h).unwrap();
        assert_eq!(p["realm"], "https://auth.example.com/token");
        assert_eq!(p["service"], "registry.example.com");
        assert_eq!(p["scope"], "repository:os:pull,push");
    }

    #[test]
    fn basic_challenge_is_not_bearer() {
        assert!(parse_bearer_challenge(r#"Basic realm="x""#).is_none());
    }

    #[test]
    fn status_descriptions() {
        assert!(describe_status(StatusCode::FORBIDDEN).starts_with("unauthorized"));
        assert!(describe_status(StatusCode::BAD_GATEWAY).contains("502"));
    }
}
