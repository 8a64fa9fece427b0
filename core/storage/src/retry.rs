//! Remote client wrapper that recovers from rejected credentials.
//!
//! Every remote call runs through [`RetryingClient::execute`]: on an
//! authentication failure it performs one refresh-token exchange and retries
//! the call exactly once. Other errors propagate untouched.

use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use lexideck_common::{ContainerId, Error, FileId, Result};

use crate::credentials::{CredentialState, CredentialStore, TokenRefresher};
use crate::remote::{ByteStream, DriveAbout, DriveApi, DriveFile, FileQuery};

/// Drive client that injects the current access token and refreshes it once
/// when the remote rejects it.
pub struct RetryingClient {
    api: Arc<dyn DriveApi>,
    credentials: Arc<CredentialStore>,
    refresher: Arc<dyn TokenRefresher>,
}

impl RetryingClient {
    pub fn new(
        api: Arc<dyn DriveApi>,
        credentials: Arc<CredentialStore>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self {
            api,
            credentials,
            refresher,
        }
    }

    /// Get the credential store.
    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    /// Name of the wrapped backend.
    pub fn backend_name(&self) -> &str {
        self.api.name()
    }

    /// Run `call` with the current access token.
    ///
    /// On an authentication failure the token is refreshed and the call is
    /// retried once. A failed refresh, or a second rejection, yields
    /// [`Error::ReauthorizationRequired`].
    pub async fn execute<T, F, Fut>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let refreshed_up_front =
            self.credentials.state().await == CredentialState::Uninitialized;
        if refreshed_up_front {
            debug!("No access token yet; refreshing before {}", operation);
            self.refresh_replacing("").await?;
        }

        let token = self.credentials.access_token().await;

        let err = match call(token.clone()).await {
            Ok(result) => return Ok(result),
            Err(err) if err.is_auth_failure() => err,
            Err(err) => return Err(err),
        };

        // The up-front refresh was this call's one refresh.
        if refreshed_up_front {
            return Err(self.reauthorization_required(err).await);
        }

        warn!("{} rejected credentials: {}. Refreshing token", operation, err);
        let fresh = self.refresh_replacing(&token).await?;

        match call(fresh).await {
            Ok(result) => {
                debug!("{} succeeded after token refresh", operation);
                Ok(result)
            }
            Err(err) if err.is_auth_failure() => Err(self.reauthorization_required(err).await),
            Err(err) => Err(err),
        }
    }

    async fn reauthorization_required(&self, err: Error) -> Error {
        self.credentials.set_state(CredentialState::Failed).await;
        Error::ReauthorizationRequired {
            reason: err.to_string(),
            url: self.refresher.reauthorization_url(),
        }
    }

    /// Refresh unless another task already replaced `stale`.
    async fn refresh_replacing(&self, stale: &str) -> Result<String> {
        let _guard = self.credentials.refresh_guard().await;

        let current = self.credentials.access_token().await;
        if !current.is_empty()
            && current != stale
            && self.credentials.state().await == CredentialState::Initialized
        {
            debug!("Token already refreshed by a concurrent request");
            return Ok(current);
        }

        self.credentials.set_state(CredentialState::Refreshing).await;
        let refresh_token = self.credentials.refresh_token().await;

        match self.refresher.refresh(&refresh_token).await {
            Ok(tokens) => {
                let access = tokens.access_token.clone();
                self.credentials.apply(tokens).await;
                info!("Access token refreshed");
                Ok(access)
            }
            Err(e) => {
                self.credentials.set_state(CredentialState::Failed).await;
                Err(Error::ReauthorizationRequired {
                    reason: e.to_string(),
                    url: self.refresher.reauthorization_url(),
                })
            }
        }
    }

    pub async fn list(&self, query: &FileQuery) -> Result<Vec<DriveFile>> {
        self.execute("list", |token| async move { self.api.list(&token, query).await })
            .await
    }

    pub async fn create_folder(&self, name: &str, parent: &ContainerId) -> Result<DriveFile> {
        self.execute("create_folder", |token| async move {
            self.api.create_folder(&token, name, parent).await
        })
        .await
    }

    pub async fn create_file(
        &self,
        name: &str,
        parent: &ContainerId,
        data: Vec<u8>,
        mime_type: &str,
    ) -> Result<DriveFile> {
        self.execute("create_file", |token| {
            let data = data.clone();
            async move {
                self.api
                    .create_file(&token, name, parent, data, mime_type)
                    .await
            }
        })
        .await
    }

    pub async fn download(&self, file_id: &FileId) -> Result<Vec<u8>> {
        self.execute("download", |token| async move {
            self.api.download(&token, file_id).await
        })
        .await
    }

    /// Open a download stream. Only opening the stream is retried; errors
    /// while reading arrive on the stream itself.
    pub async fn download_stream(&self, file_id: &FileId) -> Result<ByteStream> {
        self.execute("download_stream", |token| async move {
            self.api.download_stream(&token, file_id).await
        })
        .await
    }

    pub async fn delete(&self, file_id: &FileId) -> Result<()> {
        self.execute("delete", |token| async move { self.api.delete(&token, file_id).await })
            .await
    }

    pub async fn about(&self) -> Result<DriveAbout> {
        self.execute("about", |token| async move { self.api.about(&token).await })
            .await
    }
}
