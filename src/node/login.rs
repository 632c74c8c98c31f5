//! Login collaborator deciding who a connecting peer is.

use crate::protocol::{LoginArgs, Role};
use crate::utils::FedError;

use async_trait::async_trait;

/// Identity established for an admitted peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub role: Role,
    pub identity: String,
    pub site: String,
}

/// Authenticates a peer's login request.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(
        &self,
        login: &LoginArgs,
    ) -> Result<Admitted, FedError>;
}

/// Accepts every login at face value.
#[derive(Debug, Default)]
pub struct TrustingAuthenticator;

#[async_trait]
impl Authenticator for TrustingAuthenticator {
    async fn authenticate(
        &self,
        login: &LoginArgs,
    ) -> Result<Admitted, FedError> {
        if login.identity.is_empty() {
            return Err(FedError::msg("login without identity"));
        }
        Ok(Admitted {
            role: login.role,
            identity: login.identity.clone(),
            site: login.site.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn trusting_echoes() -> Result<(), FedError> {
        let mut login = LoginArgs {
            role: Role::Server,
            identity: "d:srv1:1094".into(),
            site: "west".into(),
            port: 1094,
            mode: 0,
            exports: vec![],
            load: 0,
            free_mb: 0,
            credentials: vec![],
        };
        let admitted = TrustingAuthenticator.authenticate(&login).await?;
        assert_eq!(admitted.role, Role::Server);
        assert_eq!(admitted.site, "west");
        login.identity.clear();
        assert!(TrustingAuthenticator.authenticate(&login).await.is_err());
        Ok(())
    }
}
