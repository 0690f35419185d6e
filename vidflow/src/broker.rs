//! Hands out access credentials for the publishing API.
//!
//! The broker is the only component that touches raw credentials. It never trusts a stored
//! access credential's expiry bookkeeping: every request for a credential performs a fresh
//! refresh exchange, and the result is written back to the store in the background so other
//! readers can see the latest credential. A rotated refresh credential is written before the
//! access credential is handed out.

use crate::error::{Error, Result};
use crate::model::{AccessCredential, AccountId, CredentialSet};
use crate::oauth::{AccessGrant, OAuthAuthority};
use crate::store::CredentialStore;
use jiff::Timestamp;
use oauth2::RefreshToken;
use std::sync::Arc;
use tracing::instrument;

#[derive(Clone)]
pub struct TokenBroker {
    store: Arc<dyn CredentialStore>,
    authority: Arc<dyn OAuthAuthority>,
}

impl std::fmt::Debug for TokenBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBroker").finish_non_exhaustive()
    }
}

impl TokenBroker {
    pub fn new(store: Arc<dyn CredentialStore>, authority: Arc<dyn OAuthAuthority>) -> Self {
        Self { store, authority }
    }

    /// Records a completed authorization, replacing whatever the account held before.
    #[instrument(skip(self, refresh, access))]
    pub async fn store_grant(
        &self,
        account: &AccountId,
        refresh: RefreshToken,
        access: Option<AccessCredential>,
    ) -> Result<()> {
        if refresh.secret().trim().is_empty() {
            return Err(Error::CredentialMissing(account.clone()));
        }
        self.store
            .put(CredentialSet {
                account: account.clone(),
                refresh: Some(refresh),
                access,
                updated_at: Timestamp::now(),
            })
            .await?;
        tracing::info!("stored new publishing grant");
        Ok(())
    }

    /// Whether `account` holds a refresh credential it could publish with.
    pub async fn has_publish_credential(&self, account: &AccountId) -> Result<bool> {
        Ok(self
            .store
            .get(account)
            .await?
            .is_some_and(|set| set.usable_refresh().is_some()))
    }

    /// Obtains an access credential for `account` through a fresh refresh exchange.
    ///
    /// Fails with `CredentialMissing` when the account has no usable refresh credential and with
    /// `AuthExchangeFailed` when the authority refuses or cannot be reached. A failed exchange
    /// never clears the stored refresh credential.
    #[instrument(skip(self))]
    pub async fn valid_access_credential(&self, account: &AccountId) -> Result<AccessCredential> {
        let refresh = self
            .store
            .get(account)
            .await?
            .and_then(|set| set.usable_refresh().cloned())
            .ok_or_else(|| Error::CredentialMissing(account.clone()))?;

        let AccessGrant {
            access,
            refresh: rotated,
        } = self.authority.refresh(account, &refresh).await?;
        tracing::debug!(expires_at = ?access.expires_at, "obtained access credential");

        let rotating = rotated.is_some();
        let write = write_through(
            Arc::clone(&self.store),
            account.clone(),
            refresh,
            access.clone(),
            rotated,
        );
        if rotating {
            // the old refresh credential may already be dead, so the new one must land first
            write.await?;
        } else {
            tokio::spawn(async move {
                if let Err(e) = write.await {
                    tracing::error!(error = %e, "failed to cache access credential");
                }
            });
        }

        Ok(access)
    }
}

/// Records a refreshed access credential, unless the grant it came from was replaced meanwhile.
async fn write_through(
    store: Arc<dyn CredentialStore>,
    account: AccountId,
    refresh: RefreshToken,
    access: AccessCredential,
    rotated: Option<RefreshToken>,
) -> Result<()> {
    if store
        .replace_access(&account, &refresh, access, rotated)
        .await?
    {
        tracing::trace!(%account, "cached refreshed access credential");
    } else {
        tracing::debug!(
            %account,
            "grant replaced during refresh, not caching derived access credential"
        );
    }
    Ok(())
}
