//! Security audits over an identity directory.
//!
//! Each audit scans the whole directory and reports a total plus a bounded list of findings, so
//! callers always see an accurate count even when they only want a sample.

use crate::directory::{Directory, MemberRef};
use anyhow::Error;
use chrono::{DateTime, Duration, Utc};
use clap::Args;
use serde::{Deserialize, Serialize};

/// The default lookback window for sign-in based audits.
pub const DEFAULT_INACTIVE_DAYS: i64 = 90;

/// Options shared by every audit.
#[derive(Clone, Copy, Debug, Args, Deserialize, Serialize)]
pub struct AuditOptions {
    /// The maximum number of findings to include in the report.
    #[clap(long, default_value = "25")]
    #[serde(default = "default_limit")]
    pub limit: usize,

    /// Report only the total, with no individual findings.
    #[clap(long)]
    #[serde(default)]
    pub count_only: bool,
}

fn default_limit() -> usize {
    25
}

impl Default for AuditOptions {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            count_only: false,
        }
    }
}

/// The result of an audit: the full count, plus up to `limit` findings.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct AuditReport<T> {
    pub total: usize,
    pub items: Vec<T>,
}

impl<T> AuditReport<T> {
    fn new(opt: AuditOptions, mut findings: Vec<T>) -> Self {
        let total = findings.len();
        if opt.count_only {
            findings.clear();
        } else {
            findings.truncate(opt.limit);
        }
        Self {
            total,
            items: findings,
        }
    }
}

/// A group flagged by an audit.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupFinding {
    pub group_id: String,
    pub group_name: String,
}

/// A user account flagged by an audit.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserFinding {
    pub display_name: String,
    pub user_principal_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sign_in: Option<DateTime<Utc>>,
}

impl From<&crate::directory::User> for UserFinding {
    fn from(user: &crate::directory::User) -> Self {
        Self {
            display_name: user.display_name.clone(),
            user_principal_name: user.upn.clone(),
            last_sign_in: user.last_sign_in,
        }
    }
}

impl From<&crate::directory::Group> for GroupFinding {
    fn from(group: &crate::directory::Group) -> Self {
        Self {
            group_id: group.id.clone(),
            group_name: group.display_name.clone(),
        }
    }
}

/// Groups with no owner at all.
pub async fn ownerless_groups(
    dir: &dyn Directory,
    opt: AuditOptions,
) -> Result<AuditReport<GroupFinding>, Error> {
    let mut findings = vec![];
    for group in dir.list_groups(usize::MAX).await? {
        match dir.group_owners(&group.id).await {
            Ok(owners) if owners.is_empty() => findings.push((&group).into()),
            Ok(_) => {}
            // If we cannot fetch owners, assume the group has one rather than flag it falsely.
            Err(err) => {
                tracing::warn!(group = %group.display_name, "skipping group: {err}");
            }
        }
    }
    Ok(AuditReport::new(opt, findings))
}

/// Groups whose owners are all disabled accounts. Ownerless groups are not reported here; they
/// show up in [`ownerless_groups`] instead.
pub async fn inactive_owner_groups(
    dir: &dyn Directory,
    opt: AuditOptions,
) -> Result<AuditReport<GroupFinding>, Error> {
    let mut findings = vec![];
    for group in dir.list_groups(usize::MAX).await? {
        match dir.group_owners(&group.id).await {
            Ok(owners) if !owners.is_empty() && owners.iter().all(|owner| !owner.enabled) => {
                findings.push((&group).into());
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(group = %group.display_name, "skipping group: {err}");
            }
        }
    }
    Ok(AuditReport::new(opt, findings))
}

/// Groups with no members.
pub async fn memberless_groups(
    dir: &dyn Directory,
    opt: AuditOptions,
) -> Result<AuditReport<GroupFinding>, Error> {
    let mut findings = vec![];
    for group in dir.list_groups(usize::MAX).await? {
        match dir.group_members(&group.id).await {
            Ok(members) if members.is_empty() => findings.push((&group).into()),
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(group = %group.display_name, "skipping group: {err}");
            }
        }
    }
    Ok(AuditReport::new(opt, findings))
}

/// Guest accounts with no sign-in in the last `days` days. Guests who have never signed in (or
/// whose sign-in timestamp is missing) count as inactive.
pub async fn inactive_guests(
    dir: &dyn Directory,
    days: i64,
    opt: AuditOptions,
) -> Result<AuditReport<UserFinding>, Error> {
    let cutoff = Utc::now() - Duration::days(days);
    let findings = dir
        .list_users(usize::MAX)
        .await?
        .iter()
        .filter(|user| user.guest && user.last_sign_in.map(|at| at < cutoff).unwrap_or(true))
        .map(UserFinding::from)
        .collect();
    Ok(AuditReport::new(opt, findings))
}

/// Enabled accounts whose last recorded sign-in is older than `days` days. Disabled accounts are
/// already dealt with and are not reported; neither are accounts with no sign-in on record, since
/// a missing timestamp is indistinguishable from an account too new to have replicated one.
pub async fn inactive_accounts(
    dir: &dyn Directory,
    days: i64,
    opt: AuditOptions,
) -> Result<AuditReport<UserFinding>, Error> {
    let cutoff = Utc::now() - Duration::days(days);
    let findings = dir
        .list_users(usize::MAX)
        .await?
        .iter()
        .filter(|user| user.enabled && user.last_sign_in.map(|at| at < cutoff).unwrap_or(false))
        .map(UserFinding::from)
        .collect();
    Ok(AuditReport::new(opt, findings))
}

/// Accounts which exist to run a service.
pub async fn service_accounts(
    dir: &dyn Directory,
    opt: AuditOptions,
) -> Result<AuditReport<UserFinding>, Error> {
    let findings = dir
        .list_users(usize::MAX)
        .await?
        .iter()
        .filter(|user| user.service_account)
        .map(UserFinding::from)
        .collect();
    Ok(AuditReport::new(opt, findings))
}

/// Accounts whose password never expires.
pub async fn password_never_expires(
    dir: &dyn Directory,
    opt: AuditOptions,
) -> Result<AuditReport<UserFinding>, Error> {
    let findings = dir
        .list_users(usize::MAX)
        .await?
        .iter()
        .filter(|user| user.password_never_expires)
        .map(UserFinding::from)
        .collect();
    Ok(AuditReport::new(opt, findings))
}

/// Accounts currently locked out.
pub async fn locked_out_accounts(
    dir: &dyn Directory,
    opt: AuditOptions,
) -> Result<AuditReport<UserFinding>, Error> {
    let findings = dir
        .list_users(usize::MAX)
        .await?
        .iter()
        .filter(|user| user.locked_out)
        .map(UserFinding::from)
        .collect();
    Ok(AuditReport::new(opt, findings))
}

/// Accounts holding a privileged administrative role.
pub async fn privileged_accounts(
    dir: &dyn Directory,
    opt: AuditOptions,
) -> Result<AuditReport<MemberRef>, Error> {
    let findings = dir.privileged_users().await?;
    Ok(AuditReport::new(opt, findings))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::directory::{mock::MockDirectory, Group, User};

    fn user(name: &str, upn: &str) -> User {
        User {
            display_name: name.into(),
            upn: upn.into(),
            enabled: true,
            ..Default::default()
        }
    }

    fn group(name: &str) -> Group {
        Group {
            display_name: name.into(),
            security_enabled: true,
            ..Default::default()
        }
    }

    #[async_std::test]
    async fn test_group_audits() {
        let dir = MockDirectory::create();
        let active = dir.seed_user(user("Active Owner", "owner@example.com")).await;
        let disabled = dir
            .seed_user(User {
                enabled: false,
                ..user("Gone Owner", "gone@example.com")
            })
            .await;

        let ownerless = dir.seed_group(group("Ownerless")).await;
        let stale = dir.seed_group(group("Stale Owner")).await;
        let healthy = dir.seed_group(group("Healthy")).await;
        dir.seed_owner(&disabled, &stale).await;
        dir.seed_owner(&active, &healthy).await;
        dir.seed_membership(&active, &healthy).await;

        let report = ownerless_groups(&dir, AuditOptions::default()).await.unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.items[0].group_id, ownerless);

        let report = inactive_owner_groups(&dir, AuditOptions::default())
            .await
            .unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.items[0].group_name, "Stale Owner");

        // Both the ownerless and the stale-owned group have no members.
        let report = memberless_groups(&dir, AuditOptions::default()).await.unwrap();
        assert_eq!(report.total, 2);
    }

    #[async_std::test]
    async fn test_inactive_guests() {
        let dir = MockDirectory::create();
        dir.seed_user(User {
            guest: true,
            last_sign_in: Some(Utc::now() - Duration::days(120)),
            ..user("Old Guest", "old@partner.com")
        })
        .await;
        dir.seed_user(User {
            guest: true,
            last_sign_in: None,
            ..user("Never Guest", "never@partner.com")
        })
        .await;
        dir.seed_user(User {
            guest: true,
            last_sign_in: Some(Utc::now() - Duration::days(5)),
            ..user("Fresh Guest", "fresh@partner.com")
        })
        .await;
        dir.seed_user(User {
            last_sign_in: Some(Utc::now() - Duration::days(120)),
            ..user("Stale Member", "stale@example.com")
        })
        .await;

        let report = inactive_guests(&dir, DEFAULT_INACTIVE_DAYS, AuditOptions::default())
            .await
            .unwrap();
        assert_eq!(report.total, 2);
        let names = report
            .items
            .iter()
            .map(|finding| finding.display_name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, ["Old Guest", "Never Guest"]);
    }

    #[async_std::test]
    async fn test_inactive_accounts() {
        let dir = MockDirectory::create();
        dir.seed_user(User {
            last_sign_in: Some(Utc::now() - Duration::days(120)),
            ..user("Stale", "stale@example.com")
        })
        .await;
        dir.seed_user(User {
            enabled: false,
            last_sign_in: Some(Utc::now() - Duration::days(120)),
            ..user("Disabled", "disabled@example.com")
        })
        .await;
        // A missing timestamp is not evidence of inactivity; new accounts have none.
        dir.seed_user(User {
            last_sign_in: None,
            ..user("New Hire", "nhire@example.com")
        })
        .await;
        dir.seed_user(User {
            last_sign_in: Some(Utc::now() - Duration::days(5)),
            ..user("Fresh", "fresh@example.com")
        })
        .await;

        let report = inactive_accounts(&dir, DEFAULT_INACTIVE_DAYS, AuditOptions::default())
            .await
            .unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.items[0].display_name, "Stale");
    }

    #[async_std::test]
    async fn test_account_hygiene_audits() {
        let dir = MockDirectory::create();
        dir.seed_user(User {
            service_account: true,
            password_never_expires: true,
            ..user("svc-backup", "svc-backup@example.com")
        })
        .await;
        dir.seed_user(User {
            locked_out: true,
            ..user("Locked", "locked@example.com")
        })
        .await;
        let admin = dir.seed_user(user("Admin", "admin@example.com")).await;
        dir.seed_privileged(&admin).await;

        let report = service_accounts(&dir, AuditOptions::default()).await.unwrap();
        assert_eq!(report.total, 1);
        let report = password_never_expires(&dir, AuditOptions::default())
            .await
            .unwrap();
        assert_eq!(report.total, 1);
        let report = locked_out_accounts(&dir, AuditOptions::default())
            .await
            .unwrap();
        assert_eq!(report.items[0].display_name, "Locked");
        let report = privileged_accounts(&dir, AuditOptions::default())
            .await
            .unwrap();
        assert_eq!(report.items[0].name, "admin@example.com");
    }

    #[async_std::test]
    async fn test_count_only_and_limit() {
        let dir = MockDirectory::create();
        for i in 0..5 {
            dir.seed_user(User {
                locked_out: true,
                ..user(&format!("User {i}"), &format!("user{i}@example.com"))
            })
            .await;
        }

        let report = locked_out_accounts(
            &dir,
            AuditOptions {
                limit: 2,
                count_only: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(report.total, 5);
        assert_eq!(report.items.len(), 2);

        let report = locked_out_accounts(
            &dir,
            AuditOptions {
                limit: 2,
                count_only: true,
            },
        )
        .await
        .unwrap();
        assert_eq!(report.total, 5);
        assert!(report.items.is_empty());
    }
}
