//! Process-wide security context, built once at startup.

use std::sync::Arc;

use crate::auth::{
    RefreshTokenStore, RequestAuthenticator, SessionService, TokenCodec, UserDirectory,
};
use crate::gate::SecurityGate;
use crate::nonce::NonceGuard;
use crate::ratelimit::RateLimiter;
use crate::settings::SecuritySettings;
use crate::store::{KvStore, SharedStore, StoreError};

/// Every security collaborator, wired to one store and one signing key.
pub struct SecurityContext {
    pub settings: SecuritySettings,
    pub store: Arc<SharedStore>,
    pub gate: SecurityGate,
    pub limiter: RateLimiter,
    pub codec: Arc<TokenCodec>,
    pub authenticator: RequestAuthenticator,
    pub sessions: SessionService,
}

impl SecurityContext {
    pub fn new(
        settings: SecuritySettings,
        store: Arc<SharedStore>,
        users: Arc<dyn UserDirectory>,
        tokens: Arc<dyn RefreshTokenStore>,
    ) -> Self {
        let kv: Arc<dyn KvStore> = store.clone();
        let codec = Arc::new(TokenCodec::new(&settings.jwt));
        let gate = SecurityGate::new(
            settings.gate.clone(),
            settings.environment,
            NonceGuard::new(kv.clone()),
        );
        let limiter = RateLimiter::new(kv, &settings.rate_limit);
        let authenticator = RequestAuthenticator::new(codec.clone(), users.clone());
        let sessions = SessionService::new(codec.clone(), users, tokens);

        Self {
            settings,
            store,
            gate,
            limiter,
            codec,
            authenticator,
            sessions,
        }
    }

    /// Build the shared store from `settings.store`, then everything else.
    pub fn from_settings(
        settings: SecuritySettings,
        users: Arc<dyn UserDirectory>,
        tokens: Arc<dyn RefreshTokenStore>,
    ) -> Result<Self, StoreError> {
        let store = Arc::new(SharedStore::from_settings(&settings.store)?);
        Ok(Self::new(settings, store, users, tokens))
    }
}
