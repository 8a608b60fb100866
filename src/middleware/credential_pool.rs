// Credential pool with validity and usage tracking
//
// Holds the named API credentials for one provider. Only credentials with
// is_valid == true participate in scheduling; validity flips via an
// out-of-band adapter validation call (or an auth rejection mid-batch).

use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One API credential. `request_count` and `last_used_at` are display
/// counters mutated by the orchestrator after each attempt; rate-limiting
/// decisions use the rate limiter's own windows, never these.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub secret: String,
    pub display_name: String,
    pub is_valid: bool,
    pub request_count: u64,
    pub last_used_at: Option<Instant>,
}

/// Redacted view for the UI surface: the secret never leaves the pool.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialView {
    pub id: String,
    pub display_name: String,
    pub is_valid: bool,
    pub request_count: u64,
}

pub struct CredentialPool {
    credentials: RwLock<Vec<Credential>>,
    next_id: AtomicUsize,
}

impl CredentialPool {
    pub fn new() -> Self {
        Self {
            credentials: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Seed a pool from operator-supplied secrets, trusted as valid.
    pub async fn seeded(secrets: Vec<String>) -> Self {
        let pool = Self::new();
        for (i, secret) in secrets.into_iter().enumerate() {
            pool.add_trusted(&secret, &format!("key-{}", i + 1)).await;
        }
        pool
    }

    /// Add a credential pending validation.
    pub async fn add(&self, secret: &str, display_name: &str) -> Credential {
        self.insert(secret, display_name, false).await
    }

    /// Add an operator-seeded credential that starts valid.
    pub async fn add_trusted(&self, secret: &str, display_name: &str) -> Credential {
        self.insert(secret, display_name, true).await
    }

    async fn insert(&self, secret: &str, display_name: &str, is_valid: bool) -> Credential {
        let id = format!("cred-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let credential = Credential {
            id: id.clone(),
            secret: secret.to_string(),
            display_name: display_name.to_string(),
            is_valid,
            request_count: 0,
            last_used_at: None,
        };
        self.credentials.write().await.push(credential.clone());
        debug!("Added credential {} ({})", id, display_name);
        credential
    }

    /// Remove a credential. The owning service must also purge the rate
    /// limiter's window state for this id.
    pub async fn remove(&self, id: &str) -> bool {
        let mut credentials = self.credentials.write().await;
        let before = credentials.len();
        credentials.retain(|c| c.id != id);
        let removed = credentials.len() < before;
        if removed {
            info!("Removed credential {}", id);
        }
        removed
    }

    /// Flip validity, e.g. after an adapter validation call or a definitive
    /// auth rejection mid-batch.
    pub async fn set_valid(&self, id: &str, is_valid: bool) -> bool {
        let mut credentials = self.credentials.write().await;
        match credentials.iter_mut().find(|c| c.id == id) {
            Some(c) => {
                if c.is_valid && !is_valid {
                    warn!("Credential {} ({}) marked invalid", c.id, c.display_name);
                }
                c.is_valid = is_valid;
                true
            }
            None => false,
        }
    }

    /// Record one attempted request for UI display.
    pub async fn mark_used(&self, id: &str) {
        let mut credentials = self.credentials.write().await;
        if let Some(c) = credentials.iter_mut().find(|c| c.id == id) {
            c.request_count += 1;
            c.last_used_at = Some(Instant::now());
        }
    }

    /// Valid credentials in insertion order. The order is the round-robin
    /// base sequence for scheduling.
    pub async fn list_valid(&self) -> Vec<Credential> {
        self.credentials
            .read()
            .await
            .iter()
            .filter(|c| c.is_valid)
            .cloned()
            .collect()
    }

    pub async fn get(&self, id: &str) -> Option<Credential> {
        self.credentials
            .read()
            .await
            .iter()
            .find(|c| c.id == id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.credentials.read().await.len()
    }

    pub async fn valid_count(&self) -> usize {
        self.credentials.read().await.iter().filter(|c| c.is_valid).count()
    }

    /// Sum of per-credential request counters.
    pub async fn total_requests(&self) -> u64 {
        self.credentials.read().await.iter().map(|c| c.request_count).sum()
    }

    /// Redacted snapshot for the UI surface.
    pub async fn views(&self) -> Vec<CredentialView> {
        self.credentials
            .read()
            .await
            .iter()
            .map(|c| CredentialView {
                id: c.id.clone(),
                display_name: c.display_name.clone(),
                is_valid: c.is_valid,
                request_count: c.request_count,
            })
            .collect()
    }
}

impl Default for CredentialPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn added_credentials_start_invalid() {
        let pool = CredentialPool::new();
        let c = pool.add("sk-test", "my key").await;

        assert!(!c.is_valid);
        assert_eq!(c.request_count, 0);
        assert!(pool.list_valid().await.is_empty());

        pool.set_valid(&c.id, true).await;
        assert_eq!(pool.list_valid().await.len(), 1);
    }

    #[tokio::test]
    async fn seeded_credentials_are_trusted_and_ordered() {
        let pool = CredentialPool::seeded(vec!["a".into(), "b".into(), "c".into()]).await;

        let valid = pool.list_valid().await;
        assert_eq!(valid.len(), 3);
        // Insertion order defines the round-robin base sequence.
        let secrets: Vec<_> = valid.iter().map(|c| c.secret.as_str()).collect();
        assert_eq!(secrets, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn mark_used_updates_counters() {
        let pool = CredentialPool::seeded(vec!["a".into()]).await;
        let id = pool.list_valid().await[0].id.clone();

        pool.mark_used(&id).await;
        pool.mark_used(&id).await;

        let c = pool.get(&id).await.unwrap();
        assert_eq!(c.request_count, 2);
        assert!(c.last_used_at.is_some());
        assert_eq!(pool.total_requests().await, 2);
    }

    #[tokio::test]
    async fn remove_deletes_the_credential() {
        let pool = CredentialPool::seeded(vec!["a".into(), "b".into()]).await;
        let id = pool.list_valid().await[0].id.clone();

        assert!(pool.remove(&id).await);
        assert!(!pool.remove(&id).await);
        assert_eq!(pool.len().await, 1);
        assert!(pool.get(&id).await.is_none());
    }

    #[tokio::test]
    async fn views_redact_secrets() {
        let pool = CredentialPool::seeded(vec!["super-secret".into()]).await;
        let views = pool.views().await;
        assert_eq!(views.len(), 1);
        let json = serde_json::to_string(&views).unwrap();
        assert!(!json.contains("super-secret"));
    }
}
