//! Azure AD provider.
//!
//! Talks to the Azure v1 token endpoint and Microsoft Graph:
//!
//! - code redemption and refresh against
//!   `https://login.microsoftonline.com/<tenant>/oauth2/token`
//! - email lookup from `GET /v1.0/me`, trying `mail`, then the first of
//!   `otherMails`, then `userPrincipalName`
//! - group enumeration from `GET /v1.0/me/memberOf?$select=displayName`,
//!   following `@odata.nextLink` until the last page
//!
//! # Example
//!
//! ```rust
//! use gatekeeper_session::providers::{AzureProvider, Provider};
//!
//! let mut provider = AzureProvider::new().unwrap();
//! provider.configure("contoso");
//! provider.data_mut().client_id = "my-client".to_string();
//!
//! let url = provider.get_login_url("https://app.example.com/oauth2/callback", "state", &[]);
//! assert!(url.as_str().starts_with("https://login.microsoftonline.com/contoso/oauth2/authorize?"));
//! assert!(url.as_str().contains("resource=https%3A%2F%2Fgraph.microsoft.com"));
//! ```

use std::collections::HashSet;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::{
    bearer_headers, default_http_client, get_json, post_token_form, redacted, send, Provider,
    ProviderData, ProviderError,
};
use crate::session::SessionState;

/// Provider display name.
pub const AZURE_PROVIDER_NAME: &str = "Azure";

/// Tenant used when none is configured.
pub const DEFAULT_TENANT: &str = "common";

const DEFAULT_LOGIN_URL: &str = "https://login.microsoftonline.com/common/oauth2/authorize";
const DEFAULT_REDEEM_URL: &str = "https://login.microsoftonline.com/common/oauth2/token";
const DEFAULT_PROFILE_URL: &str = "https://graph.microsoft.com/v1.0/me";
const DEFAULT_PROTECTED_RESOURCE: &str = "https://graph.microsoft.com";
const DEFAULT_GROUPS_URL: &str = "https://graph.microsoft.com/v1.0/me/memberOf";
const DEFAULT_SCOPE: &str = "openid";

/// Separator used when joining group names.
pub const GROUP_DELIMITER: &str = "|";

/// Upper bound on `memberOf` pages fetched for one listing.
pub const MAX_GROUP_PAGES: usize = 100;

/// One page of a `memberOf` listing.
#[derive(Debug, Deserialize)]
struct GroupsPage {
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
    #[serde(default)]
    value: Vec<GroupEntry>,
}

#[derive(Debug, Deserialize)]
struct GroupEntry {
    #[serde(rename = "displayName", default)]
    display_name: Option<String>,
}

/// Azure AD identity provider.
#[derive(Debug, Clone)]
pub struct AzureProvider {
    data: ProviderData,
    tenant: String,
    groups_url: Url,
    group_filter: String,
    http_client: Client,
}

fn parse_default(url: &str) -> Result<Url, ProviderError> {
    Url::parse(url).map_err(|e| ProviderError::Configuration(format!("invalid URL {url}: {e}")))
}

impl AzureProvider {
    /// Creates a provider with the public Azure endpoints and the `common`
    /// tenant.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Configuration`] if the HTTP client cannot be
    /// created.
    pub fn new() -> Result<Self, ProviderError> {
        let mut data = ProviderData::new(
            AZURE_PROVIDER_NAME,
            parse_default(DEFAULT_LOGIN_URL)?,
            parse_default(DEFAULT_REDEEM_URL)?,
            parse_default(DEFAULT_PROFILE_URL)?,
            parse_default(DEFAULT_PROFILE_URL)?,
        );
        data.protected_resource = Some(parse_default(DEFAULT_PROTECTED_RESOURCE)?);
        data.scope = DEFAULT_SCOPE.to_string();

        Ok(Self {
            data,
            tenant: DEFAULT_TENANT.to_string(),
            groups_url: parse_default(DEFAULT_GROUPS_URL)?,
            group_filter: String::new(),
            http_client: default_http_client()?,
        })
    }

    /// Uses `client` for all upstream requests.
    #[must_use]
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http_client = client;
        self
    }

    /// Overrides the group listing endpoint.
    #[must_use]
    pub fn with_groups_url(mut self, url: Url) -> Self {
        self.groups_url = url;
        self
    }

    /// Sets the OData `$filter` applied when enriching sessions with groups.
    #[must_use]
    pub fn with_group_filter(mut self, filter: impl Into<String>) -> Self {
        self.group_filter = filter.into();
        self
    }

    /// Mutable access to endpoints and client settings.
    pub fn data_mut(&mut self) -> &mut ProviderData {
        &mut self.data
    }

    /// The configured tenant.
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// The group listing endpoint.
    pub fn groups_url(&self) -> &Url {
        &self.groups_url
    }

    /// Scopes the login and redeem endpoints to `tenant`.
    ///
    /// The tenant path segment (`/common/` by default) is replaced. Endpoints
    /// that do not start with the current tenant segment are left alone, as
    /// are the profile, validate and resource URLs. An empty tenant means
    /// `common`.
    pub fn configure(&mut self, tenant: &str) {
        let tenant = if tenant.is_empty() { DEFAULT_TENANT } else { tenant };
        let current = format!("/{}/", self.tenant);
        let next = format!("/{tenant}/");

        for url in [&mut self.data.login_url, &mut self.data.redeem_url] {
            if let Some(rest) = url.path().strip_prefix(&current) {
                let path = format!("{next}{rest}");
                url.set_path(&path);
            }
        }

        debug!(tenant = %tenant, "Configured Azure tenant");
        self.tenant = tenant.to_string();
    }

    /// Lists the display names of the groups the session's user belongs to,
    /// joined with `|`.
    ///
    /// See [`AzureProvider::list_groups`] for paging and failure rules.
    pub async fn get_groups(
        &self,
        session: &SessionState,
        filter: &str,
    ) -> Result<String, ProviderError> {
        Ok(self.list_groups(session, filter).await?.join(GROUP_DELIMITER))
    }

    /// Lists the display names of the groups the session's user belongs to,
    /// in page order.
    ///
    /// Follows `@odata.nextLink` verbatim until a page has none. A rejected
    /// request on any page fails the whole listing, as does a next link that
    /// was already visited or more than [`MAX_GROUP_PAGES`] pages.
    pub async fn list_groups(
        &self,
        session: &SessionState,
        filter: &str,
    ) -> Result<Vec<String>, ProviderError> {
        let first = self.groups_request_url(filter);
        let mut visited: HashSet<String> = HashSet::from([first.to_string()]);
        let mut next = Some(first);
        let mut names: Vec<String> = Vec::new();
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            if pages == MAX_GROUP_PAGES {
                return Err(ProviderError::InvalidResponse(format!(
                    "group listing exceeded {MAX_GROUP_PAGES} pages"
                )));
            }

            let page: GroupsPage = get_json(&self.http_client, &url, &session.access_token).await?;
            pages += 1;

            names.extend(page.value.into_iter().filter_map(|entry| entry.display_name));

            if let Some(link) = page.next_link {
                let url = Url::parse(&link).map_err(|e| {
                    ProviderError::InvalidResponse(format!("invalid @odata.nextLink: {e}"))
                })?;
                if !visited.insert(url.to_string()) {
                    return Err(ProviderError::InvalidResponse(format!(
                        "@odata.nextLink repeats {}",
                        redacted(&url)
                    )));
                }
                next = Some(url);
            }
        }

        debug!(pages, groups = names.len(), "Listed Azure group memberships");
        Ok(names)
    }

    fn groups_request_url(&self, filter: &str) -> Url {
        let mut url = self.groups_url.clone();
        let mut query = String::from("$select=displayName");
        if !filter.is_empty() {
            let encoded: String = url::form_urlencoded::byte_serialize(filter.as_bytes()).collect();
            query.push_str("&$filter=");
            query.push_str(&encoded);
        }
        url.set_query(Some(&query));
        url
    }
}

/// Picks the email address from a Graph profile.
fn email_from_profile(profile: &Value) -> Result<String, ProviderError> {
    if let Some(mail) = profile.get("mail").and_then(Value::as_str) {
        if !mail.is_empty() {
            return Ok(mail.to_string());
        }
    }

    if let Some(first) = profile
        .get("otherMails")
        .and_then(Value::as_array)
        .and_then(|mails| mails.first())
    {
        let first = first.as_str().ok_or(ProviderError::TypeAssertion)?;
        if !first.is_empty() {
            return Ok(first.to_string());
        }
    }

    profile
        .get("userPrincipalName")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(ProviderError::TypeAssertion)
}

#[async_trait]
impl Provider for AzureProvider {
    fn data(&self) -> &ProviderData {
        &self.data
    }

    async fn redeem(&self, redirect_url: &str, code: &str) -> Result<SessionState, ProviderError> {
        let resource = self.data.resource_param();
        let mut form = vec![
            ("client_id", self.data.client_id.as_str()),
            ("client_secret", self.data.client_secret.as_str()),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_url),
        ];
        if let Some(resource) = resource.as_deref() {
            form.push(("resource", resource));
        }

        debug!(url = %redacted(&self.data.redeem_url), "Redeeming authorization code");
        let response = post_token_form(&self.http_client, &self.data.redeem_url, &form)
            .await
            .map_err(|e| match e {
                ProviderError::UpstreamStatus { status, url } => {
                    ProviderError::Redeem(format!("got {status} from {url}"))
                }
                other => other,
            })?;

        let mut session = SessionState::default();
        session.access_token = response.access_token.clone();
        session.id_token = response.id_token.clone();
        session.refresh_token = response.refresh_token.clone();
        session.created_at_now();
        match response.expires_at(session.clock().now())? {
            Some(at) => session.set_expires_on(at),
            None => warn!("Token response carried no expiry"),
        }

        info!(
            has_refresh_token = !session.refresh_token.is_empty(),
            "Redeemed authorization code"
        );
        Ok(session)
    }

    async fn refresh_session_if_needed(
        &self,
        session: &mut SessionState,
    ) -> Result<bool, ProviderError> {
        if !session.is_expired() || session.refresh_token.is_empty() {
            return Ok(false);
        }

        let resource = self.data.resource_param();
        let mut form = vec![
            ("client_id", self.data.client_id.as_str()),
            ("client_secret", self.data.client_secret.as_str()),
            ("refresh_token", session.refresh_token.as_str()),
            ("grant_type", "refresh_token"),
        ];
        if let Some(resource) = resource.as_deref() {
            form.push(("resource", resource));
        }

        debug!(user = %session.user_or_email(), "Refreshing expired session");
        let response = post_token_form(&self.http_client, &self.data.redeem_url, &form)
            .await
            .map_err(|e| match e {
                ProviderError::UpstreamStatus { status, url } => {
                    ProviderError::Refresh(format!("got {status} from {url}"))
                }
                other => other,
            })?;

        let now = session.clock().now();
        let expires_on = response.expires_at(now)?;
        if expires_on.is_none() {
            warn!("Refresh response carried no expiry");
        }

        // Tokens missing from the response keep their previous values.
        if response.access_token.is_empty() {
            warn!("Refresh response carried no access_token, keeping the previous one");
        } else {
            session.access_token = response.access_token;
        }
        if !response.id_token.is_empty() {
            session.id_token = response.id_token;
        }
        if !response.refresh_token.is_empty() {
            session.refresh_token = response.refresh_token;
        }
        session.created_at = Some(now);
        session.expires_on = expires_on;

        info!(user = %session.user_or_email(), "Refreshed session");
        Ok(true)
    }

    async fn get_email_address(&self, session: &SessionState) -> Result<String, ProviderError> {
        let profile: Value =
            get_json(&self.http_client, &self.data.profile_url, &session.access_token).await?;
        email_from_profile(&profile)
    }

    async fn validate_session(&self, session: &SessionState) -> bool {
        let headers = match bearer_headers(&session.access_token) {
            Ok(headers) => headers,
            Err(_) => return false,
        };

        let request = self
            .http_client
            .get(self.data.validate_url.clone())
            .headers(headers);
        match send(request).await {
            Ok(response) => {
                let ok = response.status().is_success();
                debug!(status = %response.status(), valid = ok, "Validated session token");
                ok
            }
            Err(e) => {
                debug!(error = %e, "Session validation request failed");
                false
            }
        }
    }

    async fn enrich_session(&self, session: &mut SessionState) -> Result<(), ProviderError> {
        let email = if session.email.is_empty() {
            Some(self.get_email_address(session).await?)
        } else {
            None
        };
        let groups = self.list_groups(session, &self.group_filter).await?;

        if let Some(email) = email.filter(|email| !email.is_empty()) {
            session.email = email;
        }
        session.groups = groups;
        Ok(())
    }
}
