use anyhow::Context;
use crowntap_protocol::{UserIdentity, UserInfo, UserRecord};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::cache::BalanceCache;
use crate::config::PlatformUser;
use crate::remote::RemoteAuthority;

static ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// What the authority said about the user while the identity was resolved.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Registration {
    Existing(UserInfo),
    Created,
    /// The authority did not answer; nothing is known.
    #[default]
    Unreachable,
}

/// Resolves the user identity once per process and hands out clones.
///
/// Order: chat-platform account, then the identity persisted for this device,
/// then a freshly generated one (persisted before it is returned). The
/// authority is asked to create the user if it does not know it; that step is
/// best effort so play can start offline.
pub struct IdentityResolver {
    cache: BalanceCache,
    platform_user: Option<PlatformUser>,
    remote: Arc<dyn RemoteAuthority>,
    resolved: OnceCell<(UserIdentity, Registration)>,
}

impl IdentityResolver {
    pub fn new(
        cache: BalanceCache,
        platform_user: Option<PlatformUser>,
        remote: Arc<dyn RemoteAuthority>,
    ) -> Self {
        Self {
            cache,
            platform_user,
            remote,
            resolved: OnceCell::new(),
        }
    }

    pub async fn resolve(&self) -> anyhow::Result<UserIdentity> {
        Ok(self.resolve_with_registration().await?.0)
    }

    /// Also returns the authority's answer, so a session can start without
    /// asking for the same user again.
    pub async fn resolve_with_registration(&self) -> anyhow::Result<(UserIdentity, Registration)> {
        let resolved = self
            .resolved
            .get_or_try_init(|| async {
                let id = self.local_identity()?;
                let registration = self.register(&id).await;
                Ok::<_, anyhow::Error>((id, registration))
            })
            .await?;
        Ok(resolved.clone())
    }

    fn local_identity(&self) -> anyhow::Result<UserIdentity> {
        if let Some(user) = &self.platform_user {
            let id = user.id.trim();
            anyhow::ensure!(!id.is_empty(), "platform user id is empty");
            return Ok(UserIdentity::new(id));
        }
        if let Some(id) = self.cache.load_identity().context("load device identity")? {
            return Ok(id);
        }
        let id = generate_identity();
        self.cache
            .save_identity(&id)
            .context("persist device identity")?;
        info!(user = %id, "generated device identity");
        Ok(id)
    }

    async fn register(&self, id: &UserIdentity) -> Registration {
        match self.remote.fetch_user(id).await {
            Ok(Some(info)) => Registration::Existing(info),
            Ok(None) => {
                let username = self.platform_user.as_ref().and_then(|u| u.username.clone());
                match self.remote.upsert_user(&UserRecord::create(id.clone(), username)).await {
                    Ok(()) => {
                        info!(user = %id, "registered user with authority");
                        Registration::Created
                    }
                    Err(e) => {
                        warn!(user = %id, error = %e, "user registration failed");
                        Registration::Unreachable
                    }
                }
            }
            Err(e) => {
                warn!(user = %id, error = %e, "authority unreachable during identity check");
                Registration::Unreachable
            }
        }
    }
}

fn generate_identity() -> UserIdentity {
    let c = ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    let mut h = Sha256::new();
    h.update(nanos.to_le_bytes());
    h.update(c.to_le_bytes());
    h.update(std::process::id().to_le_bytes());
    let digest = h.finalize();
    UserIdentity::new(format!("dev-{}", hex::encode(&digest[..12])))
}
