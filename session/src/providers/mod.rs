//! Identity provider contract and shared OAuth2 plumbing.
//!
//! A [`Provider`] drives the session state machine against one identity
//! provider:
//!
//! ```text
//! NoSession --redeem--> Valid --time passes--> Expired
//!                         ^                       |
//!                         +---- refresh ok -------+
//!                                                 |
//! NoSession <----------- refresh failed ----------+
//! ```
//!
//! [`ProviderData`] holds the endpoints and client settings every provider
//! shares. The helpers in this module (bearer headers, token endpoint calls,
//! login URL construction) are reused by the concrete providers.
//!
//! All network I/O goes through an injected [`reqwest::Client`]. Dropping a
//! returned future cancels the call; sessions are only mutated after a full
//! upstream response has been parsed.

pub mod azure;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error};
use url::Url;

use crate::session::SessionState;

pub use azure::AzureProvider;

/// Default timeout for provider HTTP requests.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Legacy prompt value sent when no `prompt` is configured.
pub const DEFAULT_APPROVAL_PROMPT: &str = "force";

/// Errors that can occur while talking to an identity provider.
///
/// [`ProviderError::Transport`] and [`ProviderError::Timeout`] are transient.
/// Every other variant means the session cannot be established or renewed
/// and the user must log in again.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The provider could not be reached.
    #[error("provider unavailable: {0}")]
    Transport(String),

    /// The request did not complete in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The provider answered with a non-success status.
    #[error("got {status} from {url}")]
    UpstreamStatus {
        /// HTTP status code.
        status: u16,
        /// URL that was requested, without query string.
        url: String,
    },

    /// The authorization code was rejected.
    #[error("redeem failed: {0}")]
    Redeem(String),

    /// The refresh token was rejected.
    #[error("refresh failed: {0}")]
    Refresh(String),

    /// The provider's response could not be parsed.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// An expected string attribute had another type or was absent.
    #[error("type assertion to string failed")]
    TypeAssertion,

    /// The provider is misconfigured.
    #[error("provider configuration error: {0}")]
    Configuration(String),
}

impl ProviderError {
    /// Returns true if retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

/// Endpoints and client settings shared by all providers.
#[derive(Debug, Clone)]
pub struct ProviderData {
    /// Display name.
    pub name: String,
    /// Authorization endpoint the browser is sent to.
    pub login_url: Url,
    /// Token endpoint for code and refresh token exchange.
    pub redeem_url: Url,
    /// Profile endpoint queried for the email address.
    pub profile_url: Url,
    /// Endpoint used to check that an access token is still accepted.
    pub validate_url: Url,
    /// Resource the access token is requested for. `None` omits the
    /// `resource` parameter entirely.
    pub protected_resource: Option<Url>,
    /// Requested scope.
    pub scope: String,
    /// Optional `acr_values`.
    pub acr_values: String,
    /// Optional `prompt`. When empty, `approval_prompt` is sent instead.
    pub prompt: String,
    /// Legacy prompt parameter.
    pub approval_prompt: String,
    /// OAuth2 client id.
    pub client_id: String,
    /// OAuth2 client secret.
    pub client_secret: String,
    /// Groups allowed through [`Provider::authorize`]. Empty allows everyone.
    pub allowed_groups: BTreeSet<String>,
}

impl ProviderData {
    /// Creates provider data with the given endpoints and empty settings.
    pub fn new(
        name: impl Into<String>,
        login_url: Url,
        redeem_url: Url,
        profile_url: Url,
        validate_url: Url,
    ) -> Self {
        Self {
            name: name.into(),
            login_url,
            redeem_url,
            profile_url,
            validate_url,
            protected_resource: None,
            scope: String::new(),
            acr_values: String::new(),
            prompt: String::new(),
            approval_prompt: DEFAULT_APPROVAL_PROMPT.to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            allowed_groups: BTreeSet::new(),
        }
    }

    /// Replaces the allowed groups.
    pub fn set_allowed_groups<I, S>(&mut self, groups: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_groups = groups.into_iter().map(Into::into).collect();
    }

    /// The configured protected resource rendered as a parameter value.
    pub fn resource_param(&self) -> Option<String> {
        self.protected_resource.as_ref().map(render_resource)
    }

    /// Builds the authorization URL.
    ///
    /// Starts from the query already present on `login_url`. Single-valued
    /// parameters replace existing values, the others are appended. The
    /// result is form-urlencoded with keys in sorted order.
    pub fn login_url_for(
        &self,
        redirect_uri: &str,
        state: &str,
        extra_params: &[(String, String)],
    ) -> Url {
        let mut url = self.login_url.clone();
        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (key, value) in url.query_pairs() {
            params
                .entry(key.into_owned())
                .or_default()
                .push(value.into_owned());
        }

        let set = |params: &mut BTreeMap<String, Vec<String>>, key: &str, value: &str| {
            params.insert(key.to_string(), vec![value.to_string()]);
        };
        let add = |params: &mut BTreeMap<String, Vec<String>>, key: &str, value: &str| {
            params
                .entry(key.to_string())
                .or_default()
                .push(value.to_string());
        };

        set(&mut params, "redirect_uri", redirect_uri);
        if !self.acr_values.is_empty() {
            add(&mut params, "acr_values", &self.acr_values);
        }
        if self.prompt.is_empty() {
            set(&mut params, "approval_prompt", &self.approval_prompt);
        } else {
            set(&mut params, "prompt", &self.prompt);
        }
        add(&mut params, "scope", &self.scope);
        set(&mut params, "client_id", &self.client_id);
        set(&mut params, "response_type", "code");
        set(&mut params, "response_mode", "query");
        add(&mut params, "state", state);
        if let Some(resource) = self.resource_param() {
            add(&mut params, "resource", &resource);
        }
        for (key, value) in extra_params {
            add(&mut params, key, value);
        }

        url.set_query(None);
        {
            let mut query = url.query_pairs_mut();
            for (key, values) in &params {
                for value in values {
                    query.append_pair(key, value);
                }
            }
        }
        url
    }
}

/// Renders a resource URL the way it was configured, without the root
/// slash the URL parser adds to bare origins.
fn render_resource(url: &Url) -> String {
    let rendered = url.as_str();
    if url.path() == "/" && url.query().is_none() && url.fragment().is_none() {
        rendered.trim_end_matches('/').to_string()
    } else {
        rendered.to_string()
    }
}

/// Identity provider operations used by the gatekeeper.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Shared endpoint and client settings.
    fn data(&self) -> &ProviderData;

    /// Exchanges an authorization code for a new session.
    async fn redeem(&self, redirect_url: &str, code: &str) -> Result<SessionState, ProviderError>;

    /// Refreshes `session` if it is expired and carries a refresh token.
    ///
    /// Returns `Ok(false)` without any network I/O when no refresh is needed
    /// or possible. On `Ok(true)` the tokens and expiry were replaced
    /// together; on error `session` is untouched.
    async fn refresh_session_if_needed(
        &self,
        session: &mut SessionState,
    ) -> Result<bool, ProviderError>;

    /// Looks up the email address for the session's access token.
    async fn get_email_address(&self, session: &SessionState) -> Result<String, ProviderError>;

    /// Checks that the session's access token is still accepted upstream.
    async fn validate_session(&self, session: &SessionState) -> bool;

    /// Fills in attributes not carried by the token response.
    async fn enrich_session(&self, session: &mut SessionState) -> Result<(), ProviderError>;

    /// Provider display name.
    fn name(&self) -> &str {
        &self.data().name
    }

    /// Builds the URL the browser is redirected to for login.
    fn get_login_url(
        &self,
        redirect_uri: &str,
        state: &str,
        extra_params: &[(String, String)],
    ) -> Url {
        self.data().login_url_for(redirect_uri, state, extra_params)
    }

    /// Returns true if the session may access protected resources.
    ///
    /// With no allowed groups configured every session is authorized.
    fn authorize(&self, session: &SessionState) -> bool {
        let allowed = &self.data().allowed_groups;
        allowed.is_empty() || session.groups.iter().any(|group| allowed.contains(group))
    }
}

// ==================== HTTP helpers ====================

/// Builds the default HTTP client used by providers.
pub(crate) fn default_http_client() -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| ProviderError::Configuration(format!("failed to create HTTP client: {e}")))
}

/// Headers for an authenticated JSON request.
pub(crate) fn bearer_headers(access_token: &str) -> Result<HeaderMap, ProviderError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    let mut auth = HeaderValue::from_str(&format!("Bearer {access_token}"))
        .map_err(|_| ProviderError::InvalidResponse("access token is not a valid header value".to_string()))?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);
    Ok(headers)
}

/// Sends a request, mapping transport failures.
pub(crate) async fn send(request: RequestBuilder) -> Result<Response, ProviderError> {
    request.send().await.map_err(|e| {
        if e.is_timeout() {
            ProviderError::Timeout(REQUEST_TIMEOUT)
        } else if e.is_connect() {
            ProviderError::Transport(format!("connection failed: {}", e.without_url()))
        } else {
            ProviderError::Transport(format!("request failed: {}", e.without_url()))
        }
    })
}

/// URL with the query stripped, for logs and error messages.
pub(crate) fn redacted(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}

/// GETs `url` with a bearer token and parses the JSON body.
pub(crate) async fn get_json<T>(
    client: &Client,
    url: &Url,
    access_token: &str,
) -> Result<T, ProviderError>
where
    T: for<'de> Deserialize<'de>,
{
    let response = send(client.get(url.clone()).headers(bearer_headers(access_token)?)).await?;
    let status = response.status();
    if !status.is_success() {
        debug!(url = %redacted(url), status = %status, "Provider request rejected");
        return Err(ProviderError::UpstreamStatus {
            status: status.as_u16(),
            url: redacted(url),
        });
    }

    response
        .json()
        .await
        .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse response body: {e}")))
}

/// Token endpoint response.
///
/// Deliberately has no `Debug`: every field but the expiry is a secret.
#[derive(Deserialize)]
pub(crate) struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub id_token: String,
    #[serde(default)]
    pub expires_on: Option<Value>,
    #[serde(default)]
    pub expires_in: Option<Value>,
}

impl TokenResponse {
    /// Absolute expiry of the issued tokens.
    ///
    /// `expires_on` (unix seconds, string or number) wins; otherwise
    /// `expires_in` seconds are added to `now`.
    ///
    /// # Errors
    ///
    /// [`ProviderError::InvalidResponse`] when the value is outside the
    /// representable date range.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>, ProviderError> {
        if let Some(secs) = self.expires_on.as_ref().and_then(json_seconds) {
            return DateTime::from_timestamp(secs, 0).map(Some).ok_or_else(|| {
                ProviderError::InvalidResponse(format!("expires_on out of range: {secs}"))
            });
        }

        let Some(secs) = self.expires_in.as_ref().and_then(json_seconds) else {
            return Ok(None);
        };
        TimeDelta::try_seconds(secs)
            .and_then(|delta| now.checked_add_signed(delta))
            .map(Some)
            .ok_or_else(|| ProviderError::InvalidResponse(format!("expires_in out of range: {secs}")))
    }
}

fn json_seconds(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// POSTs a form to a token endpoint.
///
/// Non-success statuses come back as [`ProviderError::UpstreamStatus`] so the
/// caller can classify them as a redeem or refresh rejection.
pub(crate) async fn post_token_form(
    client: &Client,
    url: &Url,
    form: &[(&str, &str)],
) -> Result<TokenResponse, ProviderError> {
    let request = client
        .post(url.clone())
        .header(ACCEPT, "application/json")
        .form(form);
    let response = send(request).await?;
    let status = response.status();

    if !status.is_success() {
        error!(url = %redacted(url), status = %status, "Token endpoint rejected request");
        return Err(ProviderError::UpstreamStatus {
            status: status.as_u16(),
            url: redacted(url),
        });
    }

    response
        .json()
        .await
        .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse token response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn data() -> ProviderData {
        ProviderData::new(
            "Test",
            Url::parse("https://idp.example.com/oauth/authorize").unwrap(),
            Url::parse("https://idp.example.com/oauth/token").unwrap(),
            Url::parse("https://idp.example.com/me").unwrap(),
            Url::parse("https://idp.example.com/me").unwrap(),
        )
    }

    fn query(url: &Url) -> Vec<(String, String)> {
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    struct StaticProvider {
        data: ProviderData,
    }

    #[async_trait]
    impl Provider for StaticProvider {
        fn data(&self) -> &ProviderData {
            &self.data
        }

        async fn redeem(&self, _: &str, _: &str) -> Result<SessionState, ProviderError> {
            Err(ProviderError::Redeem("unsupported".into()))
        }

        async fn refresh_session_if_needed(
            &self,
            _: &mut SessionState,
        ) -> Result<bool, ProviderError> {
            Ok(false)
        }

        async fn get_email_address(&self, _: &SessionState) -> Result<String, ProviderError> {
            Ok(String::new())
        }

        async fn validate_session(&self, _: &SessionState) -> bool {
            true
        }

        async fn enrich_session(&self, _: &mut SessionState) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    // ==================== login URL tests ====================

    #[test]
    fn login_url_sets_code_flow_params_in_sorted_order() {
        let mut data = data();
        data.client_id = "cid".to_string();
        data.scope = "openid".to_string();

        let url = data.login_url_for("http://redirect/url", "state", &[]);
        assert_eq!(
            url.as_str(),
            "https://idp.example.com/oauth/authorize?approval_prompt=force&client_id=cid\
             &redirect_uri=http%3A%2F%2Fredirect%2Furl&response_mode=query\
             &response_type=code&scope=openid&state=state"
        );
    }

    #[test]
    fn login_url_prefers_prompt_over_approval_prompt() {
        let mut data = data();
        data.prompt = "select_account".to_string();

        let params = query(&data.login_url_for("https://app/cb", "s", &[]));
        assert!(params.contains(&("prompt".into(), "select_account".into())));
        assert!(!params.iter().any(|(k, _)| k == "approval_prompt"));
    }

    #[test]
    fn login_url_adds_acr_values_only_when_configured() {
        let mut data = data();
        let params = query(&data.login_url_for("https://app/cb", "s", &[]));
        assert!(!params.iter().any(|(k, _)| k == "acr_values"));

        data.acr_values = "mfa".to_string();
        let params = query(&data.login_url_for("https://app/cb", "s", &[]));
        assert!(params.contains(&("acr_values".into(), "mfa".into())));
    }

    #[test]
    fn login_url_omits_resource_when_unset() {
        let url = data().login_url_for("https://app/cb", "s", &[]);
        assert!(!url.as_str().contains("resource="));
    }

    #[test]
    fn login_url_includes_encoded_resource_when_set() {
        let mut data = data();
        data.protected_resource = Some(Url::parse("http://my.resource.test").unwrap());

        let url = data.login_url_for("https://my.test.app/oauth", "", &[]);
        assert!(url
            .as_str()
            .contains("resource=http%3A%2F%2Fmy.resource.test"));
    }

    #[test]
    fn login_url_keeps_existing_query_and_appends_extras() {
        let mut data = data();
        data.login_url = Url::parse("https://idp.example.com/authorize?p=b2c_signin&client_id=old").unwrap();
        data.client_id = "new".to_string();

        let extras = vec![("login_hint".to_string(), "jane@example.com".to_string())];
        let params = query(&data.login_url_for("https://app/cb", "s", &extras));

        assert!(params.contains(&("p".into(), "b2c_signin".into())));
        assert!(params.contains(&("client_id".into(), "new".into())));
        assert!(!params.contains(&("client_id".into(), "old".into())));
        assert!(params.contains(&("login_hint".into(), "jane@example.com".into())));
    }

    #[test]
    fn resource_param_drops_root_slash_only() {
        assert_eq!(
            render_resource(&Url::parse("https://graph.microsoft.com").unwrap()),
            "https://graph.microsoft.com"
        );
        assert_eq!(
            render_resource(&Url::parse("https://api.example.com/app/").unwrap()),
            "https://api.example.com/app/"
        );
    }

    // ==================== authorize tests ====================

    #[test]
    fn authorize_allows_everyone_without_allowed_groups() {
        let provider = StaticProvider { data: data() };
        let mut session = SessionState::default();
        session.groups = vec!["no one".into(), "cares".into()];
        assert!(provider.authorize(&session));
        assert!(provider.authorize(&SessionState::default()));
    }

    #[test]
    fn authorize_requires_intersection() {
        let mut data = data();
        data.set_allowed_groups(["test-group-1", "test-group-2"]);
        let provider = StaticProvider { data };

        let mut allowed = SessionState::default();
        allowed.groups = vec!["cares".into(), "test-group-2".into()];
        let mut denied = SessionState::default();
        denied.groups = vec!["no one".into(), "test-group-3".into()];
        assert!(provider.authorize(&allowed));
        assert!(!provider.authorize(&denied));
        assert!(!provider.authorize(&SessionState::default()));
    }

    #[test]
    fn provider_name_and_login_url_default_to_data() {
        let provider = StaticProvider { data: data() };
        assert_eq!(provider.name(), "Test");
        let url = provider.get_login_url("https://app/cb", "xyz", &[]);
        assert!(url.as_str().contains("state=xyz"));
    }

    // ==================== token response tests ====================

    #[test]
    fn expires_on_accepts_string_and_number() {
        let expected = Utc.with_ymd_and_hms(2006, 1, 2, 22, 4, 5).unwrap();
        for body in [
            r#"{"expires_on": "1136239445"}"#,
            r#"{"expires_on": 1136239445}"#,
        ] {
            let response: TokenResponse = serde_json::from_str(body).unwrap();
            assert_eq!(response.expires_at(Utc::now()), Ok(Some(expected)));
        }
    }

    #[test]
    fn expires_in_is_relative_to_now() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let response: TokenResponse =
            serde_json::from_str(r#"{"access_token": "a", "expires_in": 3600}"#).unwrap();
        assert_eq!(
            response.expires_at(now),
            Ok(Some(now + chrono::Duration::hours(1)))
        );
    }

    #[test]
    fn out_of_range_expiry_is_invalid_response() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        for body in [
            r#"{"expires_in": 9000000000000}"#,
            r#"{"expires_in": 9223372036854775807}"#,
            r#"{"expires_in": -9223372036854775808}"#,
            r#"{"expires_on": 9223372036854775807}"#,
        ] {
            let response: TokenResponse = serde_json::from_str(body).unwrap();
            assert!(
                matches!(response.expires_at(now), Err(ProviderError::InvalidResponse(_))),
                "{body}"
            );
        }
    }

    #[test]
    fn missing_expiry_is_none() {
        let response: TokenResponse = serde_json::from_str(r#"{"access_token": "a"}"#).unwrap();
        assert_eq!(response.expires_at(Utc::now()), Ok(None));
        assert_eq!(response.access_token, "a");
        assert_eq!(response.refresh_token, "");
    }

    // ==================== helper tests ====================

    #[test]
    fn bearer_headers_set_accept_and_authorization() {
        let headers = bearer_headers("abc").unwrap();
        assert_eq!(headers.get(ACCEPT).unwrap(), "application/json");
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer abc");
        assert!(headers.get(AUTHORIZATION).unwrap().is_sensitive());
    }

    #[test]
    fn redacted_strips_query() {
        let url = Url::parse("https://graph.microsoft.com/v1.0/me/memberOf?$skiptoken=abc").unwrap();
        assert_eq!(redacted(&url), "https://graph.microsoft.com/v1.0/me/memberOf");
    }

    #[test]
    fn provider_error_display() {
        assert_eq!(
            ProviderError::TypeAssertion.to_string(),
            "type assertion to string failed"
        );
        assert_eq!(
            ProviderError::UpstreamStatus {
                status: 403,
                url: "https://graph.microsoft.com/v1.0/me".into()
            }
            .to_string(),
            "got 403 from https://graph.microsoft.com/v1.0/me"
        );
        assert_eq!(
            ProviderError::Timeout(Duration::from_secs(5)).to_string(),
            "request timed out after 5s"
        );
    }

    #[test]
    fn only_transport_errors_are_retryable() {
        assert!(ProviderError::Transport("x".into()).is_retryable());
        assert!(ProviderError::Timeout(REQUEST_TIMEOUT).is_retryable());
        assert!(!ProviderError::Refresh("x".into()).is_retryable());
        assert!(!ProviderError::TypeAssertion.is_retryable());
    }
}
