//! Realm authenticators and the password-authentication dispatcher.
//!
//! The dispatcher parses the SSH user field into a [`RealmAddress`], gates on
//! the per-realm enable flags, and hands off to the matching authenticator.
//! A successful authentication yields a [`TargetDescriptor`] telling the
//! bridge where to dial and which host key to expect. Every failure collapses
//! to the same client-visible outcome: a rejected handshake.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::apps::{AppAccessError, AppSshAccessClient};
use crate::cluster::{ClusterError, ClusterStateClient};
use crate::config::ProxyConfig;
use crate::realm::{AddressParseError, Realm, RealmAddress};
use crate::tokens::{TokenError, TokenExchangeClient};

const USER_AGENT: &str = concat!("fleet-ssh-proxy/", env!("CARGO_PKG_VERSION"));

/// Where the bridge should dial after a successful authentication.
///
/// Owned by the connection once the handshake completes; dropped with it.
#[derive(Debug, Clone)]
pub struct TargetDescriptor {
    /// `host:port` of the in-container SSH daemon.
    pub address: String,
    /// Expected MD5 colon-hex fingerprint of the daemon's host key.
    pub host_fingerprint: String,
    /// Login name for the second hop.
    pub user: String,
    /// Private key (PEM/OpenSSH) authenticating the second hop.
    pub private_key: String,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed user field")]
    Parse(#[from] AddressParseError),
    #[error("realm is not enabled")]
    Disabled,
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error(transparent)]
    AppAccess(#[from] AppAccessError),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("no port mapping for the ssh container port")]
    NoPortMapping,
}

impl AuthError {
    /// Internal error kind recorded alongside `authentication-failed`.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::Parse(_) => "parse",
            AuthError::Disabled => "disabled",
            AuthError::Cluster(ClusterError::NotFound) => "not-found",
            AuthError::Cluster(ClusterError::Unreachable(_)) => "unreachable",
            AuthError::Cluster(ClusterError::Malformed) => "malformed",
            AuthError::AppAccess(AppAccessError::Forbidden) => "forbidden",
            AuthError::AppAccess(AppAccessError::NotFound) => "not-found",
            AuthError::AppAccess(AppAccessError::Unreachable(_)) => "unreachable",
            AuthError::AppAccess(AppAccessError::Malformed) => "malformed",
            AuthError::Token(TokenError::InvalidCredentials) => "invalid-credentials",
            AuthError::Token(TokenError::Unreachable(_)) => "unreachable",
            AuthError::Token(TokenError::Malformed) => "malformed",
            AuthError::NoPortMapping => "malformed",
        }
    }
}

/// One authentication strategy, selected by the parsed realm.
///
/// Adding a realm means adding an implementation; existing authenticators
/// stay untouched.
#[async_trait]
pub trait RealmAuthenticator: Send + Sync {
    /// Identifying token of this realm.
    fn realm(&self) -> &'static str;

    /// Validate the address/password pair and resolve the target.
    async fn authenticate(
        &self,
        address: &RealmAddress,
        password: &str,
    ) -> Result<TargetDescriptor, AuthError>;
}

/// Direct access by process guid. The password is ignored; knowledge of the
/// process guid is the credential.
pub struct DiegoAuthenticator {
    cluster: Arc<ClusterStateClient>,
    container_user: String,
}

impl DiegoAuthenticator {
    pub fn new(cluster: Arc<ClusterStateClient>, container_user: impl Into<String>) -> Self {
        Self {
            cluster,
            container_user: container_user.into(),
        }
    }

    /// Resolve a process instance to a target descriptor: desired lookup for
    /// the SSH route, actual lookup for the instance address, then the port
    /// mapping selected by the route's container port.
    pub async fn resolve(
        &self,
        process_guid: &str,
        index: u32,
    ) -> Result<TargetDescriptor, AuthError> {
        let route = self.cluster.desired_ssh_route(process_guid).await?;
        let instance = self.cluster.actual_instance(process_guid, index).await?;

        let host_port = instance
            .host_port_for(route.container_port)
            .ok_or(AuthError::NoPortMapping)?;

        debug!(
            process_guid,
            index,
            address = %instance.address,
            host_port,
            "resolved target instance"
        );

        Ok(TargetDescriptor {
            address: format!("{}:{}", instance.address, host_port),
            host_fingerprint: route.host_fingerprint,
            user: self.container_user.clone(),
            private_key: route.private_key,
        })
    }
}

#[async_trait]
impl RealmAuthenticator for DiegoAuthenticator {
    fn realm(&self) -> &'static str {
        "diego"
    }

    async fn authenticate(
        &self,
        address: &RealmAddress,
        _password: &str,
    ) -> Result<TargetDescriptor, AuthError> {
        self.resolve(&address.principal, address.index).await
    }
}

/// App access with a pre-obtained bearer token. The password carries the
/// `Authorization` header value; the authorization service maps the app guid
/// to its process guid, after which resolution follows the direct path.
pub struct CfAuthenticator {
    apps: Arc<AppSshAccessClient>,
    resolver: Arc<DiegoAuthenticator>,
}

impl CfAuthenticator {
    pub fn new(apps: Arc<AppSshAccessClient>, resolver: Arc<DiegoAuthenticator>) -> Self {
        Self { apps, resolver }
    }
}

#[async_trait]
impl RealmAuthenticator for CfAuthenticator {
    fn realm(&self) -> &'static str {
        "cf"
    }

    async fn authenticate(
        &self,
        address: &RealmAddress,
        password: &str,
    ) -> Result<TargetDescriptor, AuthError> {
        let response = self
            .apps
            .check_ssh_access(&address.principal, password)
            .await?;
        self.resolver
            .resolve(&response.process_guid, address.index)
            .await
    }
}

/// App access with platform user credentials: exchange them for a bearer
/// token, then proceed exactly as the token-carrying realm.
pub struct UserCredentialsAuthenticator {
    tokens: Arc<TokenExchangeClient>,
    cf: Arc<CfAuthenticator>,
}

impl UserCredentialsAuthenticator {
    pub fn new(tokens: Arc<TokenExchangeClient>, cf: Arc<CfAuthenticator>) -> Self {
        Self { tokens, cf }
    }
}

#[async_trait]
impl RealmAuthenticator for UserCredentialsAuthenticator {
    fn realm(&self) -> &'static str {
        "user"
    }

    async fn authenticate(
        &self,
        address: &RealmAddress,
        password: &str,
    ) -> Result<TargetDescriptor, AuthError> {
        let Realm::UserCredentials { user } = &address.realm else {
            return Err(AuthError::Disabled);
        };

        let token = self.tokens.exchange_credentials(user, password).await?;
        self.cf
            .authenticate(address, &token.auth_header())
            .await
    }
}

/// A successful authentication: the parsed address plus the resolved target.
#[derive(Debug)]
pub struct Authenticated {
    pub address: RealmAddress,
    pub descriptor: TargetDescriptor,
}

/// Password-authentication entry point. Chooses the realm authenticator from
/// the parsed user field; realms whose enable flag is off (or whose required
/// service URLs are absent) hold no authenticator and fail without any
/// network traffic.
pub struct AuthDispatcher {
    diego: Option<Arc<DiegoAuthenticator>>,
    cf: Option<Arc<CfAuthenticator>>,
    user_credentials: Option<Arc<UserCredentialsAuthenticator>>,
}

impl AuthDispatcher {
    pub fn new(
        diego: Option<Arc<DiegoAuthenticator>>,
        cf: Option<Arc<CfAuthenticator>>,
        user_credentials: Option<Arc<UserCredentialsAuthenticator>>,
    ) -> Self {
        Self {
            diego,
            cf,
            user_credentials,
        }
    }

    /// Authenticate a (user, password) pair from the SSH handshake.
    pub async fn authenticate(
        &self,
        user: &str,
        password: &str,
    ) -> Result<Authenticated, AuthError> {
        let address = RealmAddress::parse(user)?;

        let authenticator: &dyn RealmAuthenticator = match &address.realm {
            Realm::Diego => self.diego.as_deref().ok_or(AuthError::Disabled)?,
            Realm::Cf => self.cf.as_deref().ok_or(AuthError::Disabled)?,
            Realm::UserCredentials { .. } => self
                .user_credentials
                .as_deref()
                .ok_or(AuthError::Disabled)?,
        };

        let descriptor = authenticator.authenticate(&address, password).await?;
        Ok(Authenticated {
            address,
            descriptor,
        })
    }
}

/// Assemble the dispatcher from a validated configuration. Realms whose
/// flag is off or whose service URLs are absent get no authenticator, so a
/// matching login fails before any network traffic.
pub fn build_dispatcher(config: &ProxyConfig) -> Result<AuthDispatcher> {
    let state_http = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .build()
        .context("failed to build cluster state HTTP client")?;

    let diego_api_url = config
        .diego_api_url
        .as_deref()
        .context("diegoAPIURL is required")?;
    let cluster = Arc::new(ClusterStateClient::new(diego_api_url, state_http));
    let resolver = Arc::new(DiegoAuthenticator::new(
        cluster,
        config.container_user.as_str(),
    ));

    let diego = config.enable_diego_auth.then(|| resolver.clone());

    let platform_http = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .danger_accept_invalid_certs(config.skip_cert_verify)
        .build()
        .context("failed to build platform HTTP client")?;

    let cf = match config.cc_api_url.as_deref() {
        Some(cc_api_url) if config.enable_cf_auth && !cc_api_url.is_empty() => {
            let apps = Arc::new(AppSshAccessClient::new(cc_api_url, platform_http.clone()));
            Some(Arc::new(CfAuthenticator::new(apps, resolver)))
        }
        _ => None,
    };

    let user_credentials = match (config.uaa_url.as_deref(), &cf) {
        (Some(uaa_url), Some(cf)) if !uaa_url.is_empty() => {
            let uaa_url = Url::parse(uaa_url).context("failed-to-parse-uaa-url")?;
            let tokens = Arc::new(TokenExchangeClient::new(&uaa_url, platform_http));
            Some(Arc::new(UserCredentialsAuthenticator::new(
                tokens,
                cf.clone(),
            )))
        }
        _ => None,
    };

    Ok(AuthDispatcher::new(diego, cf, user_credentials))
}
