use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{error, info, trace, warn};
use moka::{Expiry, future::Cache};
use oci_spec::{
    distribution::Reference,
    image::{Descriptor, Digest, ImageManifest},
};
use reqwest::{Method, Response, StatusCode, header};
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::RwLock;

use crate::auth::{Auth, AuthMap};
use crate::digest::{check_data_matches_digest, check_data_matches_size_and_digest, digest_from_data};
use crate::wwwauth::{self, BearerRealmService};
use crate::{Error, ManifestResponse};

const DOCKER_CONTENT_DIGEST_HEADER: &str = "docker-content-digest";
const OCI_IMAGE_MANIFEST_V1: &str = "application/vnd.oci.image.manifest.v1+json";
const DOCKER_IMAGE_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
const ACCEPTED_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json, application/vnd.docker.distribution.manifest.v2+json";

// default from https://distribution.github.io/distribution/spec/auth/token/#token-response-fields
const DEFAULT_TOKEN_EXPIRES_IN: u64 = 60;
const DEFAULT_RATELIMIT_RESET: u64 = 60;

#[derive(PartialEq, Eq, Hash, Debug, Clone)]
struct TokenCacheKey(String);

impl From<&Reference> for TokenCacheKey {
    fn from(reference: &Reference) -> Self {
        Self(format!(
            "{}/{}",
            reference.resolve_registry(),
            reference.repository()
        ))
    }
}

#[derive(Clone)]
struct Token {
    token: String,
    expires_in: Duration,
}

#[derive(Default)]
struct ExpireToken;

impl Expiry<TokenCacheKey, Token> for ExpireToken {
    fn expire_after_create(
        &self,
        key: &TokenCacheKey,
        value: &Token,
        _current_time: Instant,
    ) -> Option<Duration> {
        trace!("{key:?} expires in {:?}", value.expires_in);
        Some(value.expires_in)
    }
}

type UtcInstant = DateTime<Utc>;
type RatelimitMap = std::collections::BTreeMap<String, UtcInstant>;

/// Registry client with a bearer-token cache and a retry-once-unauthenticated ratelimit guard.
///
/// Clone is cheap: every field is either `Arc`-backed or (like `moka::Cache`) internally
/// reference counted, so a `Client` can be shared across tasks the same way the token cache
/// and auth map are shared.
#[derive(Clone)]
pub struct Client {
    client: reqwest::Client,
    token_cache: Cache<TokenCacheKey, Token>,
    auth_store: Arc<ArcSwap<AuthMap>>,
    ratelimit: Arc<RwLock<RatelimitMap>>,
}

enum TagOrDigest<'a> {
    Tag(&'a str),
    Digest(&'a str),
}

impl<'a> TagOrDigest<'a> {
    fn try_from(r: &'a Reference) -> Result<Self, Error> {
        match (r.tag(), r.digest()) {
            (Some(tag), None) => Ok(TagOrDigest::Tag(tag)),
            // both present: only one of tag/digest can be sent to the registry, digest wins
            (Some(_), Some(digest)) | (None, Some(digest)) => Ok(TagOrDigest::Digest(digest)),
            (None, None) => Err(Error::NoTagOrDigest),
        }
    }
    fn as_str(&'a self) -> &'a str {
        match self {
            Self::Tag(s) => s,
            Self::Digest(s) => s,
        }
    }
}

impl Client {
    pub fn new() -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(2))
            .https_only(true)
            .build()?;

        let token_cache = Cache::builder()
            .max_capacity(10_000_000)
            .weigher(|k: &TokenCacheKey, v: &Token| {
                (k.0.len() + v.token.len()).try_into().unwrap_or(u32::MAX)
            })
            .eviction_listener(move |k, _v, reason| {
                trace!("token eviction {k:?} {reason:?}");
            })
            .expire_after(ExpireToken)
            .build();

        Ok(Client {
            client,
            token_cache,
            auth_store: Arc::new(ArcSwap::from_pointee(AuthMap::new())),
            ratelimit: Arc::new(RwLock::new(RatelimitMap::new())),
        })
    }

    pub fn set_auth(&self, auth: AuthMap) {
        self.auth_store.store(auth.into());
    }

    /// Overrides (or adds) the credentials used for `registry` alone, leaving every other
    /// entry in the auth map untouched. Used to apply a per-conversion credential override
    /// (`ImageRef::auth`) on top of whatever `set_auth` configured globally.
    pub fn set_auth_for(&self, registry: impl Into<String>, auth: Auth) {
        let mut map = {
            let guard = self.auth_store.load();
            (*guard).clone()
        };
        map.insert(registry.into(), auth);
        self.auth_store.store(map.into());
    }

    pub async fn get_image_manifest(
        &self,
        reference: &Reference,
    ) -> Result<Option<ManifestResponse>, Error> {
        self.get_manifest_bytes(reference, ACCEPTED_IMAGE_MANIFEST)
            .await?
            .map(|(content_type, digest, data)| {
                if content_type != OCI_IMAGE_MANIFEST_V1 && content_type != DOCKER_IMAGE_MANIFEST_V2
                {
                    Err(Error::MalformedResponse(format!(
                        "unexpected manifest content-type {content_type}"
                    )))
                } else {
                    let digest = digest.unwrap_or_else(|| digest_from_data(&data));
                    Ok(ManifestResponse { data, digest })
                }
            })
            .transpose()
    }

    pub async fn get_blob(&self, reference: &Reference, descriptor: &Descriptor) -> Result<Option<Bytes>, Error> {
        let response = self.request_blob(reference, descriptor).await?;
        match response.status() {
            StatusCode::OK => {
                let data = response.bytes().await?;
                check_data_matches_size_and_digest(descriptor.size(), descriptor.digest(), &data)?;
                Ok(Some(data))
            }
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED => Err(Error::AuthDenied),
            _ => Err(status_not_ok(response).await),
        }
    }

    /// Opens a blob for chunked, incrementally-hashed reading without buffering the whole
    /// thing in memory. The caller is responsible for verifying the received byte count and
    /// digest against `descriptor` as it streams (see `ducc_convert::download`).
    pub async fn open_blob(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
    ) -> Result<Option<reqwest::Response>, Error> {
        let response = self.request_blob(reference, descriptor).await?;
        match response.status() {
            StatusCode::OK => Ok(Some(response)),
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED => Err(Error::AuthDenied),
            _ => Err(status_not_ok(response).await),
        }
    }

    async fn get_manifest_bytes(
        &self,
        reference: &Reference,
        accept: &str,
    ) -> Result<Option<(String, Option<Digest>, Bytes)>, Error> {
        let domain = reference.resolve_registry();
        let repo = reference.repository();
        let td = TagOrDigest::try_from(reference)?;

        let url = format!("https://{domain}/v2/{repo}/manifests/{}", td.as_str());

        trace!("GET {url}");
        let request = self
            .client
            .request(Method::GET, &url)
            .header(header::ACCEPT, accept);

        let response = self.auth_and_retry(reference, request).await?;

        match response.status() {
            StatusCode::OK => {
                let digest = if let TagOrDigest::Digest(s) = td {
                    Some(s.parse().map_err(|_| Error::BadDigest)?)
                } else {
                    get_docker_content_digest(&response)?
                };
                let content_type = response
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .map(|x| x.to_str().unwrap_or("").to_string())
                    .unwrap_or_default();
                let data = response.bytes().await?;
                check_data_matches_digest(digest.as_ref(), &data)?;
                Ok(Some((content_type, digest, data)))
            }
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::UNAUTHORIZED => Err(Error::AuthDenied),
            _ => Err(status_not_ok(response).await),
        }
    }

    async fn request_blob(
        &self,
        reference: &Reference,
        descriptor: &Descriptor,
    ) -> Result<reqwest::Response, Error> {
        let domain = reference.resolve_registry();
        let repo = reference.repository();
        let url = format!(
            "https://{domain}/v2/{repo}/blobs/{}:{}",
            descriptor.digest().algorithm().as_ref(),
            descriptor.digest().digest()
        );
        trace!("GET {url}");
        self.auth_and_retry(reference, self.client.request(Method::GET, &url))
            .await
    }

    // spec.md §4.1 step 2/(c): the realm GET happens unconditionally. Credentials, when
    // configured, are added as `offline_token`+basic auth on top of it; a credentialed
    // attempt that fails is retried once anonymously (`firstRequestForAuth_internal`'s
    // fallback), and no credentials configured goes straight to the anonymous attempt.
    async fn get_token_for(
        &self,
        reference: &Reference,
        www_auth: &BearerRealmService<'_>,
    ) -> Result<Token, Error> {
        let registry = reference.resolve_registry();
        let creds = {
            let guard = self.auth_store.load();
            guard.get(registry).and_then(|a| match a {
                Auth::None => None,
                Auth::UserPass(u, p) => Some((u.clone(), p.clone())),
            })
        };

        if let Some((user, pass)) = creds {
            let entry = self
                .token_cache
                .entry(reference.into())
                .or_try_insert_with(retrieve_token(
                    self.client.clone(),
                    reference,
                    www_auth,
                    Some(&user),
                    Some(&pass),
                ))
                .await;
            match entry {
                Ok(entry) => {
                    if entry.is_fresh() {
                        trace!("got new token for {}", entry.key().0);
                    }
                    return Ok(entry.into_value());
                }
                Err(e) => {
                    warn!("authenticated token fetch failed, retrying anonymously: {e:?}");
                }
            }
        }

        let token = retrieve_token(self.client.clone(), reference, www_auth, None, None)
            .await
            .map_err(|e| {
                error!("error fetching bearer token: {e:?}");
                Error::AuthRequired
            })?;
        self.token_cache.insert(reference.into(), token.clone()).await;
        Ok(token)
    }

    // checks the token cache, sends the request, and on a 401 parses WWW-Authenticate,
    // fetches a token from the realm (anonymous if no credentials are configured, retrying
    // anonymously once if a credentialed attempt fails) and retries exactly once
    async fn auth_and_retry(
        &self,
        reference: &Reference,
        mut req: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, Error> {
        self.check_ratelimit(reference).await?;

        let req_copy = req.try_clone().expect("GET requests are always clonable");

        if let Some(token) = self.token_cache.get(&reference.into()).await {
            req = req.bearer_auth(token.token);
        }

        let res = req.send().await?;
        self.handle_ratelimit(reference, &res).await?;

        if res.status() != StatusCode::UNAUTHORIZED {
            return Ok(res);
        }

        let www_auth = res
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(wwwauth::parse_header)
            .ok_or(Error::AuthRequired)?;

        let token = self.get_token_for(reference, &www_auth).await?;
        let res = req_copy.bearer_auth(token.token).send().await?;
        self.handle_ratelimit(reference, &res).await?;
        Ok(res)
    }

    async fn check_ratelimit(&self, reference: &Reference) -> Result<(), Error> {
        let registry = reference.resolve_registry();
        let mut remove = false;
        if let Some(ratelimit_end) = self.ratelimit.read().await.get(registry) {
            if Utc::now() < *ratelimit_end {
                warn!("still in ratelimit reset period for {registry}");
                return Err(Error::RatelimitExceeded);
            }
            remove = true;
        }
        if remove {
            self.ratelimit.write().await.remove(registry);
        }
        Ok(())
    }

    async fn handle_ratelimit(&self, reference: &Reference, res: &Response) -> Result<(), Error> {
        if !matches!(
            res.status(),
            StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
        ) {
            return Ok(());
        }

        let registry = reference.resolve_registry();
        let end: UtcInstant = if let Some(reset) = get_ratelimit_reset_header(res.headers()) {
            let now = Utc::now();
            let time = reset
                .try_into()
                .ok()
                .and_then(|x| DateTime::<Utc>::from_timestamp(x, 0))
                .unwrap_or_else(|| now + Duration::from_secs(DEFAULT_RATELIMIT_RESET));
            if now > time {
                now + Duration::from_secs(reset)
            } else {
                time
            }
        } else {
            warn!(
                "got res status {} from {} but no ratelimit-reset header",
                res.status(),
                registry
            );
            Utc::now() + Duration::from_secs(DEFAULT_RATELIMIT_RESET)
        };

        warn!("hit ratelimit registry={registry} url={}", res.url());
        self.ratelimit
            .write()
            .await
            .insert(registry.to_string(), end);

        Err(Error::RatelimitExceeded)
    }
}

async fn status_not_ok(res: Response) -> Error {
    let status = res.status();
    if log::log_enabled!(log::Level::Trace) {
        match res.text().await {
            Ok(body) => trace!("status={status}, body={body}"),
            Err(e) => trace!("unhandled error reading body, status={status}, error={e:?}"),
        }
    }
    match status {
        StatusCode::NOT_FOUND => Error::NotFound,
        StatusCode::UNAUTHORIZED => Error::AuthRequired,
        StatusCode::FORBIDDEN => Error::AuthDenied,
        _ => Error::StatusNotOk(status.as_u16()),
    }
}

// spec.md §4.1 step 2: `GET realm?scope=...&service=...`, expecting a JSON `{"token": ...}`.
// When credentials are supplied, `offline_token=true` is added and the request is basic-auth'd
// (`requestAuthToken` in original_source/ducc/lib/image.go); with no credentials the same GET
// runs anonymously, which is how public images authenticate against Docker Hub/GHCR/Quay.
async fn retrieve_token(
    client: reqwest::Client,
    reference: &Reference,
    www_auth: &BearerRealmService<'_>,
    user: Option<&str>,
    pass: Option<&str>,
) -> Result<Token, Error> {
    #[derive(Deserialize)]
    struct JsonToken {
        token: String,
        expires_in: Option<u64>,
    }

    let scope = format!("repository:{}:pull", reference.repository());

    let mut request = client
        .request(Method::GET, www_auth.realm)
        .query(&[("scope", scope.as_str()), ("service", www_auth.service)]);
    if let (Some(user), Some(pass)) = (user, pass) {
        request = request
            .query(&[("offline_token", "true")])
            .basic_auth(user, Some(pass));
    }

    let token = request.send().await?.json::<JsonToken>().await?;

    let expires_in = Duration::from_secs(token.expires_in.unwrap_or(DEFAULT_TOKEN_EXPIRES_IN));
    Ok(Token {
        token: token.token,
        expires_in,
    })
}

fn get_docker_content_digest(response: &reqwest::Response) -> Result<Option<Digest>, Error> {
    response
        .headers()
        .get(DOCKER_CONTENT_DIGEST_HEADER)
        .map(|header_value| -> Result<Digest, Error> {
            header_value
                .to_str()
                .map_err(|_| Error::BadDigest)?
                .try_into()
                .map_err(|_| Error::BadDigest)
        })
        .transpose()
}

fn get_ratelimit_reset_header(map: &reqwest::header::HeaderMap) -> Option<u64> {
    map.get("ratelimit-reset")
        .or_else(|| map.get("x-ratelimit-reset"))
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

impl ManifestResponse {
    pub fn parse(&self) -> Result<ImageManifest, Error> {
        Ok(ImageManifest::from_reader(Cursor::new(&self.data))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_new_client_https_only() {
        let client = Client::new().unwrap();
        client.set_auth(AuthMap::new());
    }
}
