//! The external OAuth authority that mints access credentials for the publishing API.
//!
//! Two flows are supported: the interactive authorization-code grant that connects an account
//! in the first place ([`GoogleOAuth::authorize`]), and the refresh exchange the
//! [`TokenBroker`](crate::broker::TokenBroker) performs before every publish.

use crate::config::Config;
use crate::error::{Error, ExchangeFailure, Result};
use crate::model::{AccessCredential, AccountId};
use async_trait::async_trait;
use eyre::Context;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response, body};
use jiff::{SignedDuration, Timestamp};
use oauth2::basic::{BasicClient, BasicErrorResponseType, BasicTokenResponse};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    RedirectUrl, RefreshToken, RequestTokenError, Scope, TokenResponse, TokenUrl,
};
use std::future::Future;
use std::time::Duration;

/// Scope needed to insert videos on the authorizing account's channel.
const UPLOAD_SCOPE: &str = "https://www.googleapis.com/auth/youtube.upload";

const AUTHORIZED_HTML: &str = "<!doctype html><html><body>\
    <p>Your channel is connected. You can close this tab.</p>\
    </body></html>";

/// What a successful exchange with the authority yields.
#[derive(Debug, Clone)]
pub struct AccessGrant {
    pub access: AccessCredential,
    /// Present on an initial grant, and on a refresh when the authority rotates the credential.
    pub refresh: Option<RefreshToken>,
}

impl AccessGrant {
    fn from_token_response(token: &BasicTokenResponse) -> Self {
        Self {
            access: AccessCredential {
                token: token.access_token().clone(),
                expires_at: expiry_after(token.expires_in()),
            },
            refresh: token.refresh_token().cloned(),
        }
    }
}

fn expiry_after(expires_in: Option<Duration>) -> Option<Timestamp> {
    let lifetime = SignedDuration::try_from(expires_in?).ok()?;
    Timestamp::now().checked_add(lifetime).ok()
}

/// Token endpoint of an OAuth authority.
#[async_trait]
pub trait OAuthAuthority: Send + Sync {
    /// Exchanges `refresh` for a new access credential.
    ///
    /// Failures are reported as [`Error::AuthExchangeFailed`], with
    /// [`ExchangeFailure::RevokedGrant`] when the authority no longer honours the grant.
    async fn refresh(&self, account: &AccountId, refresh: &RefreshToken) -> Result<AccessGrant>;
}

/// Google's OAuth 2.0 endpoints, configured for YouTube uploads.
#[derive(Debug, Clone)]
pub struct GoogleOAuth {
    client_id: ClientId,
    client_secret: Option<ClientSecret>,
    auth_url: AuthUrl,
    token_url: TokenUrl,
    http: reqwest::Client,
}

impl GoogleOAuth {
    pub fn new(config: &Config) -> eyre::Result<Self> {
        let http = reqwest::ClientBuilder::new()
            // SSRF no thank you.
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build OAuth HTTP client")?;
        Ok(Self {
            client_id: ClientId::new(config.oauth_client_id.clone()),
            client_secret: config.oauth_client_secret.clone(),
            auth_url: AuthUrl::new(config.auth_url.clone()).context("parse authorization URL")?,
            token_url: TokenUrl::new(config.token_url.clone()).context("parse token URL")?,
            http,
        })
    }

    /// Runs the interactive authorization-code flow with PKCE.
    ///
    /// Opens the user's browser on the consent page, waits on a loopback redirect for the
    /// authorization code, and exchanges it. Offline access is requested so that the grant
    /// includes a refresh credential.
    pub async fn authorize(&self) -> eyre::Result<AccessGrant> {
        let csrf = CsrfToken::new_random();
        let (redirect_url, eventually_authorization_code) = setup_redirect(csrf.clone())
            .await
            .context("set up redirect endpoint")?;

        let mut client = BasicClient::new(self.client_id.clone())
            .set_auth_uri(self.auth_url.clone())
            .set_token_uri(self.token_url.clone())
            .set_redirect_uri(redirect_url);
        if let Some(secret) = &self.client_secret {
            client = client.set_client_secret(secret.clone());
        }

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let (auth_url, _csrf_token) = client
            // We never re-use the CSRF since we only go through the flow exactly once.
            .authorize_url(move || csrf.clone())
            .add_scope(Scope::new(UPLOAD_SCOPE.to_string()))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .set_pkce_challenge(pkce_challenge)
            .url();

        tracing::info!(url = %auth_url, "asking user to follow OAuth flow");
        webbrowser::open(auth_url.as_ref()).context("open user's browser")?;
        let authorization_code = eventually_authorization_code
            .await
            .context("await user authorization code")?;

        let token = client
            .exchange_code(authorization_code)
            .set_pkce_verifier(pkce_verifier)
            .request_async(&self.http)
            .await
            .context("exchange authorization code for tokens")?;

        let grant = AccessGrant::from_token_response(&token);
        if grant.refresh.is_none() {
            eyre::bail!("authority did not issue a refresh credential; revoke the app's access and retry");
        }
        Ok(grant)
    }
}

#[async_trait]
impl OAuthAuthority for GoogleOAuth {
    #[tracing::instrument(skip(self, refresh))]
    async fn refresh(&self, account: &AccountId, refresh: &RefreshToken) -> Result<AccessGrant> {
        tracing::debug!("attempting to refresh OAuth token");

        let mut client =
            BasicClient::new(self.client_id.clone()).set_token_uri(self.token_url.clone());
        if let Some(secret) = &self.client_secret {
            client = client.set_client_secret(secret.clone());
        }

        match client
            .exchange_refresh_token(refresh)
            .request_async(&self.http)
            .await
        {
            Ok(token) => {
                tracing::debug!("successfully refreshed OAuth token");
                Ok(AccessGrant::from_token_response(&token))
            }
            Err(RequestTokenError::ServerResponse(ref sr))
                if matches!(sr.error(), BasicErrorResponseType::InvalidGrant) =>
            {
                tracing::warn!(%sr, "OAuth refresh token considered invalid grant");
                Err(Error::AuthExchangeFailed {
                    account: account.clone(),
                    kind: ExchangeFailure::RevokedGrant,
                    detail: sr.to_string(),
                })
            }
            Err(e) => {
                tracing::warn!(error = %e, "OAuth refresh exchange failed");
                Err(Error::AuthExchangeFailed {
                    account: account.clone(),
                    kind: ExchangeFailure::Transient,
                    detail: e.to_string(),
                })
            }
        }
    }
}

/// Sets up a loopback HTTP server to receive the OAuth authorization callback.
///
/// Returns the redirect URL to hand to the authority and a future that resolves to the
/// authorization code once the browser comes back with a matching `state`.
async fn setup_redirect(
    csrf: CsrfToken,
) -> eyre::Result<(
    RedirectUrl,
    impl Future<Output = eyre::Result<AuthorizationCode>>,
)> {
    let socket = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .context("bind to localhost")?;
    let addr = socket.local_addr().context("get local address")?;
    let url = RedirectUrl::new(format!("http://{}:{}", addr.ip(), addr.port()))
        .context("construct redirect url")?;
    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let r = async move {
            let (conn, _) = socket.accept().await.context("accept")?;
            let conn = hyper_util::rt::TokioIo::new(conn);
            let (got, mut gotten) = tokio::sync::mpsc::channel(1);
            let service = service_fn(move |req: Request<body::Incoming>| {
                let csrf = csrf.clone();
                let got = got.clone();
                async move {
                    let mut presented_state = None;
                    let mut presented_code = None;
                    for (k, v) in
                        form_urlencoded::parse(req.uri().query().unwrap_or("").as_bytes())
                    {
                        match &*k {
                            "state" => presented_state = Some(v),
                            "code" => presented_code = Some(v),
                            _ => {}
                        }
                    }
                    if presented_state.as_deref() != Some(csrf.secret().as_str()) {
                        return Err("invalid csrf token");
                    }
                    let Some(code) = presented_code else {
                        return Err("no authorization code found");
                    };
                    if got
                        .send(AuthorizationCode::new(code.into_owned()))
                        .await
                        .is_err()
                    {
                        return Err("authorization already completed");
                    }
                    Ok(Response::new(Full::<Bytes>::from(AUTHORIZED_HTML)))
                }
            });
            let mut serve = std::pin::pin!(
                hyper::server::conn::http1::Builder::new().serve_connection(conn, service)
            );

            tokio::select! {
                exit = &mut serve => {
                    if let Err(e) = exit {
                        Err(e).context("redirect server got bad request")
                    } else {
                        eyre::bail!("redirect server exit prematurely");
                    }
                }
                code = gotten.recv() => {
                    serve.as_mut().graceful_shutdown();
                    // let the browser receive the confirmation page
                    let _ = serve.await;
                    code.ok_or_else(|| eyre::eyre!("redirect handler went away"))
                }
            }
        };
        let _ = tx.send(r.await);
    });
    Ok((url, async move {
        rx.await.context("redirect future dropped prematurely")?
    }))
}
