//! Aggregated security metrics across both directories.

use crate::audit::{self, AuditOptions, AuditReport, GroupFinding, UserFinding};
use crate::directory::{Directory, MemberRef};
use anyhow::Error;
use async_std::sync::Mutex;
use chrono::{DateTime, Utc};
use futures::try_join;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How long a built dashboard stays fresh.
pub const DEFAULT_TTL: Duration = Duration::from_secs(6 * 60 * 60);

/// The number of findings sampled per metric.
const SAMPLE: usize = 10;

/// A single dashboard metric: the full count plus a small sample of findings.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Metric<T> {
    pub count: usize,
    pub sample: Vec<T>,
}

impl<T> From<AuditReport<T>> for Metric<T> {
    fn from(report: AuditReport<T>) -> Self {
        Self {
            count: report.total,
            sample: report.items,
        }
    }
}

/// Metrics collected from the Entra ID tenant.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EntraMetrics {
    pub privileged_accounts: Metric<MemberRef>,
    pub ownerless_groups: Metric<GroupFinding>,
    pub inactive_owner_groups: Metric<GroupFinding>,
    pub inactive_guests: Metric<UserFinding>,
}

/// Metrics collected from the Active Directory domain.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AdMetrics {
    pub ownerless_groups: Metric<GroupFinding>,
    pub memberless_groups: Metric<GroupFinding>,
    pub inactive_accounts: Metric<UserFinding>,
    pub service_accounts: Metric<UserFinding>,
    pub password_never_expires: Metric<UserFinding>,
    pub locked_out_accounts: Metric<UserFinding>,
}

/// A point-in-time security dashboard.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Dashboard {
    pub entra: EntraMetrics,
    pub ad: AdMetrics,
    pub generated: DateTime<Utc>,
}

impl Dashboard {
    /// Collect all metrics from both directories. Audits against the same directory run
    /// concurrently.
    pub async fn build(entra: &dyn Directory, ad: &dyn Directory) -> Result<Self, Error> {
        let opt = AuditOptions {
            limit: SAMPLE,
            count_only: false,
        };
        let days = audit::DEFAULT_INACTIVE_DAYS;

        let (privileged, ownerless, inactive_owners, guests) = try_join!(
            audit::privileged_accounts(entra, opt),
            audit::ownerless_groups(entra, opt),
            audit::inactive_owner_groups(entra, opt),
            audit::inactive_guests(entra, days, opt),
        )?;
        let (ad_ownerless, memberless, inactive, service, never_expires, locked) = try_join!(
            audit::ownerless_groups(ad, opt),
            audit::memberless_groups(ad, opt),
            audit::inactive_accounts(ad, days, opt),
            audit::service_accounts(ad, opt),
            audit::password_never_expires(ad, opt),
            audit::locked_out_accounts(ad, opt),
        )?;

        Ok(Self {
            entra: EntraMetrics {
                privileged_accounts: privileged.into(),
                ownerless_groups: ownerless.into(),
                inactive_owner_groups: inactive_owners.into(),
                inactive_guests: guests.into(),
            },
            ad: AdMetrics {
                ownerless_groups: ad_ownerless.into(),
                memberless_groups: memberless.into(),
                inactive_accounts: inactive.into(),
                service_accounts: service.into(),
                password_never_expires: never_expires.into(),
                locked_out_accounts: locked.into(),
            },
            generated: Utc::now(),
        })
    }
}

/// A cache which rebuilds the dashboard at most once per TTL.
///
/// Building the dashboard scans every user and group in both directories, so the server keeps one
/// of these and serves the cached copy to repeated readers.
pub struct DashboardCache {
    ttl: Duration,
    cached: Mutex<Option<(Instant, Arc<Dashboard>)>>,
}

impl DashboardCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            cached: Mutex::new(None),
        }
    }

    /// Return the cached dashboard, rebuilding it first if it is missing or stale.
    pub async fn fetch(
        &self,
        entra: &dyn Directory,
        ad: &dyn Directory,
    ) -> Result<Arc<Dashboard>, Error> {
        let mut cached = self.cached.lock().await;
        if let Some((built, dashboard)) = &*cached {
            if built.elapsed() < self.ttl {
                return Ok(dashboard.clone());
            }
        }
        tracing::info!("rebuilding dashboard");
        let dashboard = Arc::new(Dashboard::build(entra, ad).await?);
        *cached = Some((Instant::now(), dashboard.clone()));
        Ok(dashboard)
    }
}

impl Default for DashboardCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::directory::{mock::MockDirectory, Group, User};

    #[async_std::test]
    async fn test_build_collects_both_directories() {
        let entra = MockDirectory::create();
        let admin = entra
            .seed_user(User {
                display_name: "Admin".into(),
                upn: "admin@example.com".into(),
                enabled: true,
                ..Default::default()
            })
            .await;
        entra.seed_privileged(&admin).await;
        entra
            .seed_group(Group {
                display_name: "Ownerless".into(),
                security_enabled: true,
                ..Default::default()
            })
            .await;

        let ad = MockDirectory::create();
        ad.seed_user(User {
            display_name: "svc-backup".into(),
            upn: "svc-backup@corp.example".into(),
            enabled: true,
            service_account: true,
            password_never_expires: true,
            ..Default::default()
        })
        .await;

        let dashboard = Dashboard::build(&entra, &ad).await.unwrap();
        assert_eq!(dashboard.entra.privileged_accounts.count, 1);
        assert_eq!(dashboard.entra.ownerless_groups.count, 1);
        assert_eq!(dashboard.ad.service_accounts.count, 1);
        assert_eq!(dashboard.ad.password_never_expires.count, 1);
        assert_eq!(dashboard.ad.locked_out_accounts.count, 0);
    }

    #[async_std::test]
    async fn test_cache_serves_stale_reads_within_ttl() {
        let entra = MockDirectory::create();
        let ad = MockDirectory::create();
        let cache = DashboardCache::new(Duration::from_secs(3600));

        let first = cache.fetch(&entra, &ad).await.unwrap();
        assert_eq!(first.ad.service_accounts.count, 0);

        // New findings do not appear until the TTL expires.
        ad.seed_user(User {
            display_name: "svc-backup".into(),
            upn: "svc-backup@corp.example".into(),
            enabled: true,
            service_account: true,
            ..Default::default()
        })
        .await;
        let second = cache.fetch(&entra, &ad).await.unwrap();
        assert_eq!(second.ad.service_accounts.count, 0);
        assert_eq!(second.generated, first.generated);

        // A zero-TTL cache rebuilds every time.
        let cache = DashboardCache::new(Duration::from_secs(0));
        cache.fetch(&entra, &ad).await.unwrap();
        let rebuilt = cache.fetch(&entra, &ad).await.unwrap();
        assert_eq!(rebuilt.ad.service_accounts.count, 1);
    }
}
