//! OAuth2 discovery and authorization for the Granola MCP service.
//!
//! Authentication is challenge-driven: an unauthenticated `initialize` call
//! yields a 401 whose challenge header points at the protected-resource
//! metadata, which in turn names the authorization server. From there the
//! flow optionally registers a client dynamically, runs an authorization-code
//! exchange with PKCE, and persists the resulting credential.
//!
//! The flow is modeled as an explicit step machine so every fatal exit is an
//! enumerable value: [`OAuthFlow::authenticate`] loops over a transition
//! function that either produces the next [`Step`] or a structured
//! [`AuthFailure`] naming the stage that gave up. Nothing in this module
//! panics or unwinds across the caller.

use base64::Engine as _;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::warn;

use crate::core::credentials::{current_epoch_ms, AccessCredential, TokenStore};
use crate::mcp::client_initialize_params;
use crate::mcp::transport::{RpcOutcome, RpcTransport};

const WELL_KNOWN_AUTH_SERVER_PATH: &str = ".well-known/oauth-authorization-server";
const AUTHORIZATION_SCOPE: &str = "openid";
const REGISTRATION_SCOPE: &str = "openid profile email offline_access";
const DEFAULT_TOKEN_LIFETIME_S: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStage {
    Init,
    DiscoverResource,
    DiscoverAuthServer,
    EnsureClient,
    Authorize,
    Exchange,
    Persist,
}

#[derive(Debug)]
pub struct AuthFailure {
    pub stage: AuthStage,
    pub message: String,
}

impl AuthFailure {
    fn new(stage: AuthStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthServerMetadata {
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<AuthorizationServerRef>,
}

/// The resource metadata lists its authorization servers either as bare URL
/// strings or as descriptor objects; both forms appear in the wild.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AuthorizationServerRef {
    Url(String),
    Descriptor(AuthorizationServerDescriptor),
}

#[derive(Debug, Deserialize)]
struct AuthorizationServerDescriptor {
    #[serde(default)]
    authorization_server_url: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    issuer: Option<String>,
}

impl AuthorizationServerRef {
    fn server_url(&self) -> Option<String> {
        match self {
            Self::Url(url) => Some(url.clone()),
            Self::Descriptor(descriptor) => descriptor
                .authorization_server_url
                .clone()
                .or_else(|| descriptor.url.clone())
                .or_else(|| descriptor.issuer.clone()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientRegistrationResponse {
    client_id: String,
}

/// Interactive authorization redirect, kept behind a trait so the flow can be
/// exercised in tests without a real browser. `authorize` suspends until the
/// user completes or cancels the external flow; cancellation surfaces as an
/// error message, not a distinct type.
#[async_trait::async_trait]
pub trait AuthorizationBrowser: Send + Sync {
    fn redirect_uri(&self) -> String;
    async fn authorize(&self, authorization_url: &str) -> Result<String, String>;
}

/// Production implementation: a loopback listener plus the system browser.
pub struct LoopbackBrowser {
    listener: TcpListener,
    port: u16,
}

impl LoopbackBrowser {
    pub async fn bind() -> Result<Self, String> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|err| format!("failed to bind loopback listener: {err}"))?;
        let port = listener
            .local_addr()
            .map_err(|err| err.to_string())?
            .port();
        Ok(Self { listener, port })
    }
}

#[async_trait::async_trait]
impl AuthorizationBrowser for LoopbackBrowser {
    fn redirect_uri(&self) -> String {
        format!("http://127.0.0.1:{}/callback", self.port)
    }

    async fn authorize(&self, authorization_url: &str) -> Result<String, String> {
        open::that(authorization_url)
            .map_err(|err| format!("failed to launch browser: {err}"))?;

        let (mut stream, _) = self
            .listener
            .accept()
            .await
            .map_err(|err| err.to_string())?;
        let mut buffer = vec![0_u8; 16 * 1024];
        let bytes_read = stream.read(&mut buffer).await.map_err(|err| err.to_string())?;
        if bytes_read == 0 {
            return Err("authorization callback received no data".to_string());
        }
        let request = String::from_utf8_lossy(&buffer[..bytes_read]);
        let first_line = request
            .lines()
            .next()
            .ok_or_else(|| "authorization callback request line missing".to_string())?;
        let target = first_line
            .split_whitespace()
            .nth(1)
            .ok_or_else(|| "authorization callback target missing".to_string())?;
        let redirect_url = format!("http://127.0.0.1:{}{}", self.port, target);

        let page = "<html><body><p>Authorization received. \
                    You can close this tab and return to notula.</p></body></html>";
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{}",
            page.len(),
            page
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.flush().await;
        Ok(redirect_url)
    }
}

enum Step {
    Init,
    DiscoverResource {
        challenge_header: Option<String>,
    },
    DiscoverAuthServer {
        authorization_server: String,
    },
    EnsureClient {
        metadata: AuthServerMetadata,
    },
    Authorize {
        metadata: AuthServerMetadata,
        client_id: String,
    },
    Exchange {
        token_endpoint: String,
        client_id: String,
        code: String,
        verifier: String,
    },
    Persist {
        token: TokenResponse,
    },
    Done,
}

pub struct OAuthFlow<'a> {
    transport: &'a dyn RpcTransport,
    tokens: &'a TokenStore,
    http: reqwest::Client,
    /// Resource indicator naming the MCP service origin, carried through the
    /// authorization request and the token exchange.
    resource: String,
}

impl<'a> OAuthFlow<'a> {
    pub fn new(
        transport: &'a dyn RpcTransport,
        tokens: &'a TokenStore,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            tokens,
            http: reqwest::Client::new(),
            resource: resource.into(),
        }
    }

    pub async fn authenticate(
        &self,
        browser: &dyn AuthorizationBrowser,
    ) -> Result<(), AuthFailure> {
        let mut step = Step::Init;
        loop {
            step = self.advance(step, browser).await?;
            if matches!(step, Step::Done) {
                return Ok(());
            }
        }
    }

    async fn advance(
        &self,
        step: Step,
        browser: &dyn AuthorizationBrowser,
    ) -> Result<Step, AuthFailure> {
        match step {
            Step::Init => self.begin().await,
            Step::DiscoverResource { challenge_header } => {
                self.discover_resource(challenge_header).await
            }
            Step::DiscoverAuthServer {
                authorization_server,
            } => self.discover_auth_server(&authorization_server).await,
            Step::EnsureClient { metadata } => self.ensure_client(metadata, browser).await,
            Step::Authorize {
                metadata,
                client_id,
            } => self.authorize(metadata, client_id, browser).await,
            Step::Exchange {
                token_endpoint,
                client_id,
                code,
                verifier,
            } => {
                self.exchange(&token_endpoint, &client_id, &code, &verifier, browser)
                    .await
            }
            Step::Persist { token } => self.persist(token),
            Step::Done => Ok(Step::Done),
        }
    }

    /// The flow is only entered when authentication is known to be required,
    /// so anything other than a challenge is a failure.
    async fn begin(&self) -> Result<Step, AuthFailure> {
        let outcome = self
            .transport
            .send("initialize", client_initialize_params(), None)
            .await
            .map_err(|message| AuthFailure::new(AuthStage::Init, message))?;
        match outcome {
            RpcOutcome::AuthRequired(challenge) => Ok(Step::DiscoverResource {
                challenge_header: challenge.www_authenticate,
            }),
            RpcOutcome::Result(_) => Err(AuthFailure::new(
                AuthStage::Init,
                "Already authenticated or unexpected response",
            )),
        }
    }

    async fn discover_resource(
        &self,
        challenge_header: Option<String>,
    ) -> Result<Step, AuthFailure> {
        let metadata_url = challenge_header
            .as_deref()
            .and_then(challenge_metadata_url)
            .ok_or_else(|| {
                AuthFailure::new(
                    AuthStage::DiscoverResource,
                    "Could not discover OAuth endpoints from 401 response",
                )
            })?;
        let response = self
            .http
            .get(&metadata_url)
            .send()
            .await
            .map_err(|err| AuthFailure::new(AuthStage::DiscoverResource, err.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthFailure::new(
                AuthStage::DiscoverResource,
                "Failed to fetch resource metadata",
            ));
        }
        let metadata = response
            .json::<ResourceMetadata>()
            .await
            .map_err(|err| AuthFailure::new(AuthStage::DiscoverResource, err.to_string()))?;
        let authorization_server = metadata
            .authorization_servers
            .first()
            .and_then(AuthorizationServerRef::server_url)
            .ok_or_else(|| {
                AuthFailure::new(AuthStage::DiscoverResource, "No authorization servers found")
            })?;
        Ok(Step::DiscoverAuthServer {
            authorization_server,
        })
    }

    async fn discover_auth_server(
        &self,
        authorization_server: &str,
    ) -> Result<Step, AuthFailure> {
        let metadata_url = auth_server_metadata_url(authorization_server);
        let response = self
            .http
            .get(&metadata_url)
            .send()
            .await
            .map_err(|err| AuthFailure::new(AuthStage::DiscoverAuthServer, err.to_string()))?;
        if !response.status().is_success() {
            return Err(AuthFailure::new(
                AuthStage::DiscoverAuthServer,
                "Failed to fetch auth server metadata",
            ));
        }
        let metadata = response
            .json::<AuthServerMetadata>()
            .await
            .map_err(|err| AuthFailure::new(AuthStage::DiscoverAuthServer, err.to_string()))?;
        if metadata.authorization_endpoint.is_none() || metadata.token_endpoint.is_none() {
            return Err(AuthFailure::new(
                AuthStage::DiscoverAuthServer,
                "Invalid auth server metadata",
            ));
        }
        Ok(Step::EnsureClient { metadata })
    }

    async fn ensure_client(
        &self,
        metadata: AuthServerMetadata,
        browser: &dyn AuthorizationBrowser,
    ) -> Result<Step, AuthFailure> {
        let mut client_id = metadata.client_id.clone();
        if client_id.is_none() {
            if let Some(registration_endpoint) = metadata.registration_endpoint.as_deref() {
                client_id = self
                    .register_client(registration_endpoint, &browser.redirect_uri())
                    .await;
            }
        }
        let client_id = client_id.ok_or_else(|| {
            AuthFailure::new(
                AuthStage::EnsureClient,
                "No client_id available. Granola may require pre-registered OAuth apps.",
            )
        })?;
        Ok(Step::Authorize {
            metadata,
            client_id,
        })
    }

    /// Registration failure is non-fatal here; it only matters if no client
    /// id is available afterwards.
    async fn register_client(
        &self,
        registration_endpoint: &str,
        redirect_uri: &str,
    ) -> Option<String> {
        let payload = json!({
            "redirect_uris": [redirect_uri],
            "token_endpoint_auth_method": "none",
            "grant_types": ["authorization_code"],
            "response_types": ["code"],
            "scope": REGISTRATION_SCOPE,
            "client_name": "notula",
            "software_id": "notula-cli",
        });
        match self
            .http
            .post(registration_endpoint)
            .json(&payload)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => response
                .json::<ClientRegistrationResponse>()
                .await
                .ok()
                .map(|data| data.client_id),
            Ok(response) => {
                warn!(status = %response.status(), "dynamic client registration failed");
                None
            }
            Err(err) => {
                warn!(error = %err, "dynamic client registration failed");
                None
            }
        }
    }

    async fn authorize(
        &self,
        metadata: AuthServerMetadata,
        client_id: String,
        browser: &dyn AuthorizationBrowser,
    ) -> Result<Step, AuthFailure> {
        let authorization_endpoint = metadata.authorization_endpoint.as_deref().unwrap_or("");
        let token_endpoint = metadata.token_endpoint.clone().unwrap_or_default();
        let pkce = generate_pkce();
        let state = random_urlsafe(16);
        let redirect_uri = browser.redirect_uri();

        let authorization_url = build_authorization_url(AuthorizationUrlParams {
            authorization_endpoint,
            client_id: &client_id,
            redirect_uri: &redirect_uri,
            state: &state,
            code_challenge: &pkce.challenge,
            scope: AUTHORIZATION_SCOPE,
            resource: &self.resource,
        })
        .map_err(|message| AuthFailure::new(AuthStage::Authorize, message))?;

        let redirect_url = browser
            .authorize(authorization_url.as_str())
            .await
            .map_err(|message| AuthFailure::new(AuthStage::Authorize, message))?;

        let code = parse_authorization_redirect(&redirect_url, &state)
            .map_err(|message| AuthFailure::new(AuthStage::Authorize, message))?;

        Ok(Step::Exchange {
            token_endpoint,
            client_id,
            code,
            verifier: pkce.verifier,
        })
    }

    async fn exchange(
        &self,
        token_endpoint: &str,
        client_id: &str,
        code: &str,
        verifier: &str,
        browser: &dyn AuthorizationBrowser,
    ) -> Result<Step, AuthFailure> {
        let redirect_uri = browser.redirect_uri();
        let form_fields = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri.as_str()),
            ("code_verifier", verifier),
            ("client_id", client_id),
            ("resource", self.resource.as_str()),
        ];
        let response = self
            .http
            .post(token_endpoint)
            .form(&form_fields)
            .send()
            .await
            .map_err(|err| AuthFailure::new(AuthStage::Exchange, err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<TokenErrorBody>(&text)
                .ok()
                .and_then(|body| body.error_description.or(body.error))
                .unwrap_or_else(|| {
                    if text.is_empty() {
                        format!("Token exchange failed: {}", status.as_u16())
                    } else {
                        text
                    }
                });
            return Err(AuthFailure::new(AuthStage::Exchange, message));
        }
        let token = response
            .json::<TokenResponse>()
            .await
            .map_err(|err| AuthFailure::new(AuthStage::Exchange, err.to_string()))?;
        Ok(Step::Persist { token })
    }

    fn persist(&self, token: TokenResponse) -> Result<Step, AuthFailure> {
        let lifetime_s = token.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_S);
        let credential = AccessCredential {
            access_token: token.access_token,
            refresh_token: token.refresh_token.unwrap_or_default(),
            expires_at_epoch_ms: current_epoch_ms() + lifetime_s * 1000,
        };
        self.tokens
            .store(&credential)
            .map_err(|message| AuthFailure::new(AuthStage::Persist, message))?;
        Ok(Step::Done)
    }
}

/// Extracts the resource metadata URL from a challenge header. Granola uses
/// `resource_metadata`; RFC 9728 names it `resource_server_metadata_uri`.
pub fn challenge_metadata_url(header: &str) -> Option<String> {
    for pattern in [
        r#"resource_metadata="([^"]+)""#,
        r#"resource_server_metadata_uri="([^"]+)""#,
    ] {
        let Ok(regex) = Regex::new(pattern) else {
            continue;
        };
        if let Some(captures) = regex.captures(header) {
            if let Some(url) = captures.get(1) {
                return Some(url.as_str().to_string());
            }
        }
    }
    None
}

pub fn auth_server_metadata_url(authorization_server: &str) -> String {
    format!(
        "{}/{WELL_KNOWN_AUTH_SERVER_PATH}",
        authorization_server.trim_end_matches('/')
    )
}

/// Origin of the MCP endpoint, used as the OAuth resource indicator.
pub fn resource_origin(endpoint: &str) -> String {
    reqwest::Url::parse(endpoint)
        .ok()
        .and_then(|url| {
            let scheme = url.scheme().to_string();
            url.host_str().map(|host| match url.port() {
                Some(port) => format!("{scheme}://{host}:{port}"),
                None => format!("{scheme}://{host}"),
            })
        })
        .unwrap_or_else(|| endpoint.trim_end_matches('/').to_string())
}

pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

pub fn generate_pkce() -> PkcePair {
    let verifier = random_urlsafe(32);
    let challenge = pkce_s256_challenge(&verifier);
    PkcePair {
        verifier,
        challenge,
    }
}

pub fn pkce_s256_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest)
}

pub fn random_urlsafe(bytes_len: usize) -> String {
    let mut bytes = vec![0_u8; bytes_len];
    fill_random(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

fn fill_random(bytes: &mut [u8]) {
    if getrandom::fill(bytes).is_ok() {
        return;
    }
    // Last-resort xorshift seeded from the clock and pid.
    let mut state = (current_epoch_ms() as u64) ^ ((std::process::id() as u64) << 32) ^ 1;
    for byte in bytes {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        *byte = (state & 0xff) as u8;
    }
}

pub struct AuthorizationUrlParams<'a> {
    pub authorization_endpoint: &'a str,
    pub client_id: &'a str,
    pub redirect_uri: &'a str,
    pub state: &'a str,
    pub code_challenge: &'a str,
    pub scope: &'a str,
    pub resource: &'a str,
}

pub fn build_authorization_url(
    params: AuthorizationUrlParams<'_>,
) -> Result<reqwest::Url, String> {
    let mut url =
        reqwest::Url::parse(params.authorization_endpoint).map_err(|err| err.to_string())?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("response_type", "code");
        query.append_pair("client_id", params.client_id);
        query.append_pair("redirect_uri", params.redirect_uri);
        query.append_pair("scope", params.scope);
        query.append_pair("state", params.state);
        query.append_pair("code_challenge", params.code_challenge);
        query.append_pair("code_challenge_method", "S256");
        query.append_pair("resource", params.resource);
    }
    Ok(url)
}

/// Pulls the authorization code out of the final redirect URL. The state
/// comparison is a mandatory anti-forgery check; a mismatch aborts the flow
/// before anything touches the token endpoint.
pub fn parse_authorization_redirect(
    redirect_url: &str,
    expected_state: &str,
) -> Result<String, String> {
    let url = reqwest::Url::parse(redirect_url).map_err(|err| err.to_string())?;
    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.to_string()),
            "state" => state = Some(value.to_string()),
            "error" => error = Some(value.to_string()),
            _ => {}
        }
    }
    let Some(code) = code else {
        return Err(error.unwrap_or_else(|| "No authorization code received".to_string()));
    };
    if state.as_deref() != Some(expected_state) {
        return Err("State mismatch - possible CSRF".to_string());
    }
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::InMemoryStore;
    use crate::mcp::transport::testing::ScriptedTransport;
    use std::sync::Arc;

    struct CannedBrowser {
        redirect: String,
    }

    #[async_trait::async_trait]
    impl AuthorizationBrowser for CannedBrowser {
        fn redirect_uri(&self) -> String {
            "http://127.0.0.1:7777/callback".to_string()
        }

        async fn authorize(&self, _authorization_url: &str) -> Result<String, String> {
            Ok(self.redirect.clone())
        }
    }

    #[test]
    fn challenge_metadata_url_prefers_vendor_pattern() {
        let header = r#"Bearer resource_metadata="https://x/meta""#;
        assert_eq!(
            challenge_metadata_url(header).as_deref(),
            Some("https://x/meta")
        );
    }

    #[test]
    fn challenge_metadata_url_falls_back_to_rfc_pattern() {
        let header = r#"Bearer resource_server_metadata_uri="https://y/meta""#;
        assert_eq!(
            challenge_metadata_url(header).as_deref(),
            Some("https://y/meta")
        );
    }

    #[test]
    fn challenge_metadata_url_without_known_attribute_is_none() {
        assert_eq!(challenge_metadata_url("Bearer realm=\"granola\""), None);
    }

    #[test]
    fn auth_server_metadata_url_handles_trailing_slash() {
        assert_eq!(
            auth_server_metadata_url("https://auth.example.com/"),
            "https://auth.example.com/.well-known/oauth-authorization-server"
        );
        assert_eq!(
            auth_server_metadata_url("https://auth.example.com"),
            "https://auth.example.com/.well-known/oauth-authorization-server"
        );
    }

    #[test]
    fn resource_origin_strips_path() {
        assert_eq!(
            resource_origin("https://mcp.granola.ai/mcp"),
            "https://mcp.granola.ai"
        );
        assert_eq!(
            resource_origin("https://mcp.example.com:8443/rpc"),
            "https://mcp.example.com:8443"
        );
    }

    #[test]
    fn pkce_s256_matches_rfc_example() {
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            pkce_s256_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn random_urlsafe_is_urlsafe() {
        let token = random_urlsafe(32);
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_'));
    }

    #[test]
    fn authorization_url_carries_pkce_and_resource() {
        let url = build_authorization_url(AuthorizationUrlParams {
            authorization_endpoint: "https://auth.example.com/authorize",
            client_id: "client-1",
            redirect_uri: "http://127.0.0.1:7777/callback",
            state: "state123",
            code_challenge: "challenge123",
            scope: "openid",
            resource: "https://mcp.granola.ai",
        })
        .expect("authorization URL should build");
        let params: std::collections::HashMap<String, String> =
            url.query_pairs().into_owned().collect();
        assert_eq!(params.get("response_type"), Some(&"code".to_string()));
        assert_eq!(params.get("client_id"), Some(&"client-1".to_string()));
        assert_eq!(params.get("code_challenge"), Some(&"challenge123".to_string()));
        assert_eq!(
            params.get("code_challenge_method"),
            Some(&"S256".to_string())
        );
        assert_eq!(
            params.get("resource"),
            Some(&"https://mcp.granola.ai".to_string())
        );
    }

    #[test]
    fn redirect_with_matching_state_yields_code() {
        let code = parse_authorization_redirect(
            "http://127.0.0.1:7777/callback?code=abc123&state=xyz",
            "xyz",
        )
        .expect("code should parse");
        assert_eq!(code, "abc123");
    }

    #[test]
    fn redirect_with_mismatched_state_is_rejected() {
        let err = parse_authorization_redirect(
            "http://127.0.0.1:7777/callback?code=abc123&state=xyz",
            "abc",
        )
        .expect_err("state mismatch should fail");
        assert!(err.contains("CSRF"));
    }

    #[test]
    fn redirect_without_code_surfaces_error_parameter() {
        let err = parse_authorization_redirect(
            "http://127.0.0.1:7777/callback?error=access_denied&state=xyz",
            "xyz",
        )
        .expect_err("missing code should fail");
        assert_eq!(err, "access_denied");
    }

    #[test]
    fn redirect_without_code_or_error_has_generic_message() {
        let err = parse_authorization_redirect("http://127.0.0.1:7777/callback?state=xyz", "xyz")
            .expect_err("missing code should fail");
        assert_eq!(err, "No authorization code received");
    }

    #[test]
    fn first_authorization_server_accepts_both_forms() {
        let string_form: ResourceMetadata = serde_json::from_value(serde_json::json!({
            "authorization_servers": ["https://auth.example.com"]
        }))
        .expect("string form should parse");
        assert_eq!(
            string_form
                .authorization_servers
                .first()
                .and_then(AuthorizationServerRef::server_url)
                .as_deref(),
            Some("https://auth.example.com")
        );

        let object_form: ResourceMetadata = serde_json::from_value(serde_json::json!({
            "authorization_servers": [{"issuer": "https://issuer.example.com"}]
        }))
        .expect("object form should parse");
        assert_eq!(
            object_form
                .authorization_servers
                .first()
                .and_then(AuthorizationServerRef::server_url)
                .as_deref(),
            Some("https://issuer.example.com")
        );
    }

    #[tokio::test]
    async fn flow_rejects_an_already_authenticated_endpoint() {
        let transport = ScriptedTransport::new();
        transport.push_result(serde_json::json!({"capabilities": {}}));
        let tokens = TokenStore::new(Arc::new(InMemoryStore::new()));
        let flow = OAuthFlow::new(&transport, &tokens, "https://mcp.granola.ai");
        let browser = CannedBrowser {
            redirect: "http://127.0.0.1:7777/callback?code=x&state=y".to_string(),
        };

        let failure = flow
            .authenticate(&browser)
            .await
            .expect_err("flow should fail");
        assert_eq!(failure.stage, AuthStage::Init);
        assert_eq!(failure.message, "Already authenticated or unexpected response");
        assert!(tokens.access_token().is_none());
    }

    #[tokio::test]
    async fn flow_fails_when_challenge_has_no_metadata_url() {
        let transport = ScriptedTransport::new();
        transport.push_auth_required(Some("Bearer realm=\"granola\""));
        let tokens = TokenStore::new(Arc::new(InMemoryStore::new()));
        let flow = OAuthFlow::new(&transport, &tokens, "https://mcp.granola.ai");
        let browser = CannedBrowser {
            redirect: "http://127.0.0.1:7777/callback?code=x&state=y".to_string(),
        };

        let failure = flow
            .authenticate(&browser)
            .await
            .expect_err("flow should fail");
        assert_eq!(failure.stage, AuthStage::DiscoverResource);
        assert_eq!(
            failure.message,
            "Could not discover OAuth endpoints from 401 response"
        );
        assert!(tokens.access_token().is_none());
    }

    #[tokio::test]
    async fn flow_fails_when_challenge_header_is_absent() {
        let transport = ScriptedTransport::new();
        transport.push_auth_required(None);
        let tokens = TokenStore::new(Arc::new(InMemoryStore::new()));
        let flow = OAuthFlow::new(&transport, &tokens, "https://mcp.granola.ai");
        let browser = CannedBrowser {
            redirect: "http://127.0.0.1:7777/callback?code=x&state=y".to_string(),
        };

        let failure = flow
            .authenticate(&browser)
            .await
            .expect_err("flow should fail");
        assert_eq!(failure.stage, AuthStage::DiscoverResource);
    }
}
