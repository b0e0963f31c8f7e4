use super::{CredentialBroker, ExternalError, RetryPolicy, ScopeCredentials, ServiceScope, with_retry};
use crate::models::AccountContext;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Credentials this close to expiry are refreshed before use.
const REFRESH_MARGIN_MS: i64 = 60_000;

/// Turns an execution's account context into a call scope, delegating
/// credentials for non-default accounts and caching them until near expiry.
#[derive(Clone)]
pub struct ScopeResolver {
    broker: Arc<dyn CredentialBroker>,
    default_role: String,
    retry: RetryPolicy,
    cache: Arc<Mutex<HashMap<(String, String), ScopeCredentials>>>,
}

impl ScopeResolver {
    pub fn new(broker: Arc<dyn CredentialBroker>, default_role: String, retry: RetryPolicy) -> Self {
        Self {
            broker,
            default_role,
            retry,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn resolve(&self, account: &AccountContext) -> Result<ServiceScope, ExternalError> {
        let Some(account_id) = account.account_id.as_deref() else {
            return Ok(ServiceScope {
                account: account.clone(),
                credentials: None,
            });
        };
        let role_name = account
            .role_name
            .clone()
            .unwrap_or_else(|| self.default_role.clone());
        let key = (account_id.to_string(), role_name.clone());
        let now = Utc::now().timestamp_millis();

        if let Some(cached) = self.cache.lock().await.get(&key) {
            if cached.expires_at - REFRESH_MARGIN_MS > now {
                return Ok(ServiceScope {
                    account: account.clone(),
                    credentials: Some(cached.clone()),
                });
            }
        }

        let credentials = with_retry(&self.retry, "assume_scope", || {
            self.broker.assume_scope(account_id, &role_name)
        })
        .await
        .map_err(|err| {
            tracing::error!(account_id, role_name = %role_name, error = %err, "Credential delegation failed");
            err
        })?;

        self.cache.lock().await.insert(key, credentials.clone());
        Ok(ServiceScope {
            account: account.clone(),
            credentials: Some(credentials),
        })
    }
}
