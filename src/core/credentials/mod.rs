use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::core::catalog::types::{CredentialBinding, ExecutorRecord};
use crate::core::error::InvokeError;
use crate::core::store::Store;
use crate::core::store::types::CredentialRecord;

/// Order usable credentials for one executor.
///
/// When the executor has bindings only bound credentials qualify, by
/// ascending priority. Ties (and unbound executors) fall back to the least
/// used credential, then the lowest id.
pub fn rank_candidates(
    credentials: Vec<CredentialRecord>,
    bindings: &[CredentialBinding],
    now: DateTime<Utc>,
) -> Vec<CredentialRecord> {
    let priority = |id: i64| {
        bindings
            .iter()
            .find(|b| b.credential_id == id)
            .map(|b| b.priority)
    };

    let mut ranked: Vec<(i64, CredentialRecord)> = credentials
        .into_iter()
        .filter(|c| c.is_usable(now))
        .filter_map(|c| {
            if bindings.is_empty() {
                Some((0, c))
            } else {
                priority(c.id).map(|p| (p, c))
            }
        })
        .collect();
    ranked.sort_by_key(|(p, c)| (*p, c.usage_count, c.id));
    ranked.into_iter().map(|(_, c)| c).collect()
}

/// Picks secrets per vendor, rotating away from throttled ones.
#[derive(Clone)]
pub struct CredentialSelector {
    store: Store,
    cooldown: Duration,
    max_attempts: usize,
}

impl CredentialSelector {
    pub fn new(store: Store, cooldown: Duration, max_attempts: usize) -> Self {
        Self {
            store,
            cooldown,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn select(
        &self,
        vendor: &str,
        executor: &ExecutorRecord,
        exclude: &[i64],
    ) -> Result<Option<CredentialRecord>, InvokeError> {
        let credentials = self.store.list_credentials(vendor).await?;
        Ok(rank_candidates(credentials, &executor.bindings, Utc::now())
            .into_iter()
            .find(|c| !exclude.contains(&c.id)))
    }

    pub async fn report_rate_limited(&self, credential_id: i64, retry_after: Option<Duration>) {
        let wait = retry_after.unwrap_or(self.cooldown);
        let until = Utc::now() + chrono::Duration::from_std(wait).unwrap_or(chrono::Duration::zero());
        match self.store.set_credential_cooldown(credential_id, until).await {
            Ok(()) => info!(
                credential_id,
                cooldown_secs = wait.as_secs(),
                "Credential cooling down after rate limit"
            ),
            Err(e) => warn!(credential_id, "Failed to record credential cooldown: {}", e),
        }
    }

    pub async fn record_use(&self, credential_id: i64) {
        if let Err(e) = self.store.record_credential_use(credential_id).await {
            warn!(credential_id, "Failed to record credential usage: {}", e);
        }
    }

    /// Run `attempt` with a selected credential, rotating on rate limits.
    ///
    /// `used` holds the credential of the latest attempt so the caller can
    /// attribute failures. Executors without auth get `None` and no rotation.
    pub async fn run<T, F, Fut>(
        &self,
        vendor: &str,
        executor: &ExecutorRecord,
        used: &mut Option<i64>,
        mut attempt: F,
    ) -> Result<T, InvokeError>
    where
        F: FnMut(Option<CredentialRecord>) -> Fut,
        Fut: Future<Output = Result<T, InvokeError>>,
    {
        if !executor.auth.requires_credential() {
            return attempt(None).await;
        }

        let mut tried = Vec::new();
        let mut last_retry_after = None;
        while tried.len() < self.max_attempts {
            let Some(credential) = self.select(vendor, executor, &tried).await? else {
                break;
            };
            let id = credential.id;
            *used = Some(id);
            tried.push(id);
            debug!(vendor, executor_id = %executor.id, credential_id = id, "Credential selected");

            match attempt(Some(credential)).await {
                Ok(value) => {
                    self.record_use(id).await;
                    return Ok(value);
                }
                Err(InvokeError::RateLimited { retry_after, .. }) => {
                    self.report_rate_limited(id, retry_after).await;
                    last_retry_after = retry_after;
                }
                Err(e) => return Err(e),
            }
        }

        if tried.is_empty() {
            return Err(InvokeError::Config(format!(
                "no usable credential for vendor '{vendor}'"
            )));
        }
        warn!(vendor, attempts = tried.len(), "Every candidate credential was rate limited");
        Err(InvokeError::RateLimited {
            vendor: vendor.to_string(),
            retry_after: last_retry_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::catalog::types::AuthMode;
    use crate::core::store::test_store;
    use crate::core::store::types::{CredentialStatus, NewCredential};
    use crate::core::testing;
    use std::sync::{Arc, Mutex};

    fn record(id: i64, usage: i64) -> CredentialRecord {
        let mut c = testing::credential(id, "acme");
        c.usage_count = usage;
        c
    }

    #[test]
    fn bindings_restrict_and_order_candidates() {
        let now = Utc::now();
        let creds = vec![record(1, 0), record(2, 9), record(3, 1)];
        let bindings = [
            CredentialBinding { credential_id: 2, priority: 0 },
            CredentialBinding { credential_id: 3, priority: 5 },
        ];
        let ranked: Vec<i64> = rank_candidates(creds, &bindings, now)
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ranked, vec![2, 3]);
    }

    #[test]
    fn unbound_candidates_prefer_least_used_then_lowest_id() {
        let now = Utc::now();
        let mut disabled = record(4, 0);
        disabled.status = CredentialStatus::Disabled;
        let creds = vec![record(3, 2), record(2, 1), record(1, 1), disabled];
        let ranked: Vec<i64> = rank_candidates(creds, &[], now)
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ranked, vec![1, 2, 3]);
    }

    async fn seed(store: &Store, n: usize) -> Vec<i64> {
        let mut ids = Vec::new();
        for i in 0..n {
            let id = store
                .insert_credential(&NewCredential {
                    vendor: "acme".into(),
                    secret: format!("key-{i}"),
                    ..Default::default()
                })
                .await
                .unwrap();
            ids.push(id);
        }
        ids
    }

    #[tokio::test]
    async fn rate_limited_credential_is_not_reselected_during_cooldown() {
        let store = test_store();
        let ids = seed(&store, 2).await;
        let selector = CredentialSelector::new(store.clone(), Duration::from_secs(120), 3);
        let executor = testing::http_executor("acme-http", "http://unused");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let throttled = ids[0];

        let mut used = None;
        let result = selector
            .run("acme", &executor, &mut used, |cred| {
                let seen = seen.clone();
                async move {
                    let cred = cred.unwrap();
                    seen.lock().unwrap().push(cred.id);
                    if cred.id == throttled {
                        Err(InvokeError::RateLimited {
                            vendor: "acme".into(),
                            retry_after: None,
                        })
                    } else {
                        Ok(cred.id)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, ids[1]);
        assert_eq!(used, Some(ids[1]));
        assert_eq!(*seen.lock().unwrap(), vec![ids[0], ids[1]]);

        // the first credential is cooling down, so the next run starts elsewhere
        let next = selector.select("acme", &executor, &[]).await.unwrap().unwrap();
        assert_eq!(next.id, ids[1]);
        let cooled = store.get_credential(ids[0]).await.unwrap().unwrap();
        assert!(cooled.cooldown_until.unwrap() > Utc::now());
        let winner = store.get_credential(ids[1]).await.unwrap().unwrap();
        assert_eq!(winner.usage_count, 1);
    }

    #[tokio::test]
    async fn exhausting_every_credential_fails_with_rate_limit() {
        let store = test_store();
        seed(&store, 2).await;
        let selector = CredentialSelector::new(store.clone(), Duration::from_secs(120), 3);
        let executor = testing::http_executor("acme-http", "http://unused");
        let calls = Arc::new(Mutex::new(0));

        let mut used = None;
        let result: Result<(), _> = selector
            .run("acme", &executor, &mut used, |_| {
                let calls = calls.clone();
                async move {
                    *calls.lock().unwrap() += 1;
                    Err(InvokeError::RateLimited {
                        vendor: "acme".into(),
                        retry_after: Some(Duration::from_secs(30)),
                    })
                }
            })
            .await;
        assert!(matches!(result, Err(InvokeError::RateLimited { .. })));
        assert_eq!(*calls.lock().unwrap(), 2);
        assert!(selector.select("acme", &executor, &[]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_credentials_are_a_config_error() {
        let store = test_store();
        let selector = CredentialSelector::new(store, Duration::from_secs(120), 3);
        let executor = testing::http_executor("acme-http", "http://unused");
        let mut used = None;
        let result: Result<(), _> = selector
            .run("acme", &executor, &mut used, |_| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(InvokeError::Config(_))));
    }

    #[tokio::test]
    async fn executors_without_auth_skip_selection() {
        let store = test_store();
        let selector = CredentialSelector::new(store, Duration::from_secs(120), 3);
        let mut executor = testing::graph_executor("comfy", "http://unused");
        executor.auth = AuthMode::None;
        let mut used = None;
        let got = selector
            .run("comfy", &executor, &mut used, |cred| async move { Ok(cred.is_none()) })
            .await
            .unwrap();
        assert!(got);
        assert_eq!(used, None);
    }
}
