//! An on-premises Active Directory backend, accessed over LDAP.
//!
//! The LDAP client is synchronous, so every operation binds a fresh connection on a blocking
//! task and releases it when the operation completes.

use super::{
    Directory, Group, GroupUpdate, MemberKind, MemberRef, NewGroup, NewUser, User, UserField,
};
use anyhow::Error;
use async_std::task::spawn_blocking;
use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDateTime, TimeZone, Utc};
use clap::Args;
use ldap3::{ldap_escape, LdapConn, Mod, Scope, SearchEntry};
use std::collections::HashSet;

/// `userAccountControl` bit for a disabled account.
const UAC_DISABLED: i64 = 0x2;
/// `userAccountControl` bit for a password that never expires.
const UAC_DONT_EXPIRE_PASSWORD: i64 = 0x10000;
/// `userAccountControl` value for a normal, enabled account.
const UAC_NORMAL_ACCOUNT: &str = "512";

const USER_ATTRS: &[&str] = &[
    "cn",
    "displayName",
    "userPrincipalName",
    "sAMAccountName",
    "mail",
    "department",
    "title",
    "userAccountControl",
    "lastLogonTimestamp",
    "lockoutTime",
    "servicePrincipalName",
    "memberOf",
];
const GROUP_ATTRS: &[&str] = &[
    "cn",
    "description",
    "sAMAccountName",
    "member",
    "managedBy",
    "whenCreated",
];
const REF_ATTRS: &[&str] = &[
    "cn",
    "displayName",
    "userPrincipalName",
    "sAMAccountName",
    "userAccountControl",
    "objectClass",
];

/// Active Directory connection options.
#[derive(Clone, Debug, Args)]
pub struct Options {
    /// URL of the domain controller (ldap:// or ldaps://).
    #[clap(long, env = "IAM_AD_SERVER")]
    pub ad_server: String,

    /// DN or UPN to bind as.
    #[clap(long, env = "IAM_AD_USER")]
    pub ad_user: String,

    /// Password for the bind user.
    #[clap(long, env = "IAM_AD_PASSWORD")]
    pub ad_password: String,

    /// Base DN under which users and groups are searched.
    #[clap(long, env = "IAM_AD_BASE_DN")]
    pub ad_base_dn: String,

    /// RDN of the OU, relative to the base DN, where new entries are created.
    #[clap(long, env = "IAM_AD_OU", default_value = "OU=TestUsers")]
    pub ad_ou: String,
}

/// An Active Directory domain, accessed over LDAP.
pub struct AdDirectory {
    opt: Options,
}

impl AdDirectory {
    /// Create a handle for the configured domain. Connections are opened per operation.
    pub fn new(opt: Options) -> Self {
        Self { opt }
    }

    /// Run `f` with a bound connection on a blocking task.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut LdapConn, &Options) -> Result<T, Error> + Send + 'static,
    {
        let opt = self.opt.clone();
        spawn_blocking(move || {
            let mut conn = LdapConn::new(&opt.ad_server)?;
            conn.simple_bind(&opt.ad_user, &opt.ad_password)?.success()?;
            let out = f(&mut conn, &opt);
            let _ = conn.unbind();
            out
        })
        .await
    }
}

#[async_trait]
impl Directory for AdDirectory {
    async fn list_users(&self, max: usize) -> Result<Vec<User>, Error> {
        self.with_conn(move |conn, opt| {
            let entries = search(
                conn,
                &opt.ad_base_dn,
                "(&(objectClass=user)(objectCategory=person))",
                USER_ATTRS,
            )?;
            Ok(entries.iter().take(max).map(user_from_entry).collect())
        })
        .await
    }

    async fn get_user(&self, id: &str) -> Result<User, Error> {
        let id = id.to_string();
        self.with_conn(move |conn, opt| {
            let entry = find_user(conn, opt, &id)?;
            Ok(user_from_entry(&entry))
        })
        .await
    }

    async fn create_user(&self, user: NewUser) -> Result<User, Error> {
        self.with_conn(move |conn, opt| {
            let dn = format!(
                "CN={},{},{}",
                user.display_name, opt.ad_ou, opt.ad_base_dn
            );
            let attr =
                |name: &str, value: &str| (name.to_string(), HashSet::from([value.to_string()]));
            let classes = (
                "objectClass".to_string(),
                ["top", "person", "organizationalPerson", "user"]
                    .into_iter()
                    .map(String::from)
                    .collect::<HashSet<_>>(),
            );
            conn.add(
                &dn,
                vec![
                    classes,
                    attr("cn", &user.display_name),
                    attr("displayName", &user.display_name),
                    attr("userPrincipalName", &user.upn),
                    attr("sAMAccountName", user.nickname()),
                    attr("mail", &user.upn),
                    attr("userPassword", &user.password),
                ],
            )?
            .success()?;
            // The entry is created disabled; flip it to a normal enabled account.
            conn.modify(
                &dn,
                vec![Mod::Replace(
                    "userAccountControl".to_string(),
                    HashSet::from([UAC_NORMAL_ACCOUNT.to_string()]),
                )],
            )?
            .success()?;
            tracing::info!(%dn, "created user");
            Ok(User {
                id: dn,
                display_name: user.display_name,
                upn: user.upn,
                enabled: true,
                ..Default::default()
            })
        })
        .await
    }

    async fn update_user(&self, id: &str, field: UserField, value: &str) -> Result<(), Error> {
        let (id, value) = (id.to_string(), value.to_string());
        let attribute = match field {
            UserField::DisplayName => "displayName",
            UserField::Department => "department",
            UserField::Title => "title",
            UserField::Mail => "mail",
        };
        self.with_conn(move |conn, opt| {
            let entry = find_user(conn, opt, &id)?;
            conn.modify(
                &entry.dn,
                vec![Mod::Replace(
                    attribute.to_string(),
                    HashSet::from([value]),
                )],
            )?
            .success()?;
            Ok(())
        })
        .await
    }

    async fn delete_user(&self, id: &str) -> Result<(), Error> {
        let id = id.to_string();
        self.with_conn(move |conn, opt| {
            let entry = find_user(conn, opt, &id)?;
            conn.delete(&entry.dn)?.success()?;
            tracing::info!(dn = %entry.dn, "deleted user");
            Ok(())
        })
        .await
    }

    async fn list_groups(&self, max: usize) -> Result<Vec<Group>, Error> {
        self.with_conn(move |conn, opt| {
            let entries = search(conn, &opt.ad_base_dn, "(objectClass=group)", GROUP_ATTRS)?;
            Ok(entries.iter().take(max).map(group_from_entry).collect())
        })
        .await
    }

    async fn get_group(&self, id: &str) -> Result<Group, Error> {
        let id = id.to_string();
        self.with_conn(move |conn, opt| {
            let entry = find_group(conn, opt, &id)?;
            Ok(group_from_entry(&entry))
        })
        .await
    }

    async fn create_group(&self, group: NewGroup) -> Result<Group, Error> {
        self.with_conn(move |conn, opt| {
            let dn = format!(
                "CN={},{},{}",
                group.display_name, opt.ad_ou, opt.ad_base_dn
            );
            let mut attrs = vec![
                (
                    "objectClass".to_string(),
                    ["top", "group"].into_iter().map(String::from).collect(),
                ),
                (
                    "cn".to_string(),
                    HashSet::from([group.display_name.clone()]),
                ),
                (
                    "sAMAccountName".to_string(),
                    HashSet::from([group.mail_nickname.clone()]),
                ),
            ];
            if let Some(description) = &group.description {
                attrs.push((
                    "description".to_string(),
                    HashSet::from([description.clone()]),
                ));
            }
            conn.add(&dn, attrs)?.success()?;
            tracing::info!(%dn, "created group");
            Ok(Group {
                id: dn,
                display_name: group.display_name,
                description: group.description,
                mail_nickname: Some(group.mail_nickname),
                security_enabled: true,
                created: None,
            })
        })
        .await
    }

    async fn update_group(&self, id: &str, update: GroupUpdate) -> Result<(), Error> {
        let id = id.to_string();
        self.with_conn(move |conn, opt| {
            let entry = find_group(conn, opt, &id)?;
            if let Some(description) = update.description {
                conn.modify(
                    &entry.dn,
                    vec![Mod::Replace(
                        "description".to_string(),
                        HashSet::from([description]),
                    )],
                )?
                .success()?;
            }
            if let Some(owner) = update.owner {
                let owner = find_user(conn, opt, &owner)?;
                conn.modify(
                    &entry.dn,
                    vec![Mod::Replace(
                        "managedBy".to_string(),
                        HashSet::from([owner.dn]),
                    )],
                )?
                .success()?;
            }
            // Renaming changes the DN, so do it after attribute updates.
            if let Some(name) = update.display_name {
                conn.modifydn(&entry.dn, &format!("CN={name}"), true, None)?
                    .success()?;
            }
            Ok(())
        })
        .await
    }

    async fn delete_group(&self, id: &str) -> Result<(), Error> {
        let id = id.to_string();
        self.with_conn(move |conn, opt| {
            let entry = find_group(conn, opt, &id)?;
            conn.delete(&entry.dn)?.success()?;
            tracing::info!(dn = %entry.dn, "deleted group");
            Ok(())
        })
        .await
    }

    async fn group_members(&self, group: &str) -> Result<Vec<MemberRef>, Error> {
        let group = group.to_string();
        self.with_conn(move |conn, opt| {
            let entry = find_group(conn, opt, &group)?;
            let members = entry.attrs.get("member").cloned().unwrap_or_default();
            Ok(members
                .iter()
                .map(|dn| resolve_ref(conn, dn))
                .collect())
        })
        .await
    }

    async fn group_owners(&self, group: &str) -> Result<Vec<MemberRef>, Error> {
        let group = group.to_string();
        self.with_conn(move |conn, opt| {
            let entry = find_group(conn, opt, &group)?;
            Ok(attr(&entry, "managedBy")
                .map(|dn| resolve_ref(conn, &dn))
                .into_iter()
                .collect())
        })
        .await
    }

    async fn add_member(&self, user: &str, group: &str) -> Result<(), Error> {
        let (user, group) = (user.to_string(), group.to_string());
        self.with_conn(move |conn, opt| {
            let group = find_group(conn, opt, &group)?;
            let user = find_user(conn, opt, &user)?;
            conn.modify(
                &group.dn,
                vec![Mod::Add("member".to_string(), HashSet::from([user.dn]))],
            )?
            .success()?;
            Ok(())
        })
        .await
    }

    async fn remove_member(&self, user: &str, group: &str) -> Result<(), Error> {
        let (user, group) = (user.to_string(), group.to_string());
        self.with_conn(move |conn, opt| {
            let group = find_group(conn, opt, &group)?;
            let user = find_user(conn, opt, &user)?;
            conn.modify(
                &group.dn,
                vec![Mod::Delete("member".to_string(), HashSet::from([user.dn]))],
            )?
            .success()?;
            Ok(())
        })
        .await
    }

    async fn assign_owner(&self, owner: &str, group: &str) -> Result<(), Error> {
        self.update_group(
            group,
            GroupUpdate {
                owner: Some(owner.to_string()),
                ..Default::default()
            },
        )
        .await
    }

    async fn privileged_users(&self) -> Result<Vec<MemberRef>, Error> {
        self.with_conn(move |conn, opt| {
            let entries = search(
                conn,
                &opt.ad_base_dn,
                "(&(objectClass=user)(objectCategory=person)(adminCount>=1))",
                REF_ATTRS,
            )?;
            Ok(entries.iter().map(ref_from_entry).collect())
        })
        .await
    }
}

fn search(
    conn: &mut LdapConn,
    base: &str,
    filter: &str,
    attrs: &[&str],
) -> Result<Vec<SearchEntry>, Error> {
    let (entries, _) = conn.search(base, Scope::Subtree, filter, attrs)?.success()?;
    Ok(entries.into_iter().map(SearchEntry::construct).collect())
}

/// Find a user by DN or common name.
fn find_user(conn: &mut LdapConn, opt: &Options, id: &str) -> Result<SearchEntry, Error> {
    find_entry(conn, opt, "person", id, USER_ATTRS)
        .ok_or_else(|| Error::msg(format!("no user found with '{id}'")))
}

/// Find a group by DN or common name.
fn find_group(conn: &mut LdapConn, opt: &Options, id: &str) -> Result<SearchEntry, Error> {
    find_entry(conn, opt, "group", id, GROUP_ATTRS)
        .ok_or_else(|| Error::msg(format!("no group found with '{id}'")))
}

fn find_entry(
    conn: &mut LdapConn,
    opt: &Options,
    class: &str,
    id: &str,
    attrs: &[&str],
) -> Option<SearchEntry> {
    // Identifiers containing '=' are taken to be DNs; anything else is a common name.
    let found = if id.contains('=') {
        search(conn, id, &format!("(objectClass={class})"), attrs)
    } else {
        search(
            conn,
            &opt.ad_base_dn,
            &format!("(&(objectClass={class})(cn={}))", ldap_escape(id)),
            attrs,
        )
    };
    match found {
        Ok(entries) => entries.into_iter().next(),
        Err(err) => {
            tracing::warn!(%id, "lookup failed: {err}");
            None
        }
    }
}

/// Resolve a DN referenced from `member` or `managedBy` into a [`MemberRef`].
///
/// Dangling references stay in the list with the DN as their display name, so membership counts
/// remain accurate.
fn resolve_ref(conn: &mut LdapConn, dn: &str) -> MemberRef {
    match search(conn, dn, "(objectClass=*)", REF_ATTRS) {
        Ok(entries) if !entries.is_empty() => ref_from_entry(&entries[0]),
        _ => {
            tracing::warn!(%dn, "unresolvable membership reference");
            MemberRef {
                id: dn.to_string(),
                display_name: dn.to_string(),
                name: String::new(),
                kind: MemberKind::User,
                enabled: true,
            }
        }
    }
}

fn attr(entry: &SearchEntry, name: &str) -> Option<String> {
    entry.attrs.get(name).and_then(|values| values.first()).cloned()
}

fn uac(entry: &SearchEntry) -> i64 {
    attr(entry, "userAccountControl")
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

fn user_from_entry(entry: &SearchEntry) -> User {
    let uac = uac(entry);
    User {
        id: entry.dn.clone(),
        display_name: attr(entry, "displayName")
            .or_else(|| attr(entry, "cn"))
            .unwrap_or_default(),
        upn: attr(entry, "userPrincipalName")
            .or_else(|| attr(entry, "mail"))
            .or_else(|| attr(entry, "sAMAccountName"))
            .unwrap_or_default(),
        enabled: uac & UAC_DISABLED == 0,
        department: attr(entry, "department"),
        title: attr(entry, "title"),
        guest: false,
        last_sign_in: attr(entry, "lastLogonTimestamp")
            .and_then(|value| value.parse().ok())
            .and_then(filetime_to_utc),
        password_never_expires: uac & UAC_DONT_EXPIRE_PASSWORD != 0,
        locked_out: attr(entry, "lockoutTime")
            .and_then(|value| value.parse::<i64>().ok())
            .map(|lockout| lockout >= 1)
            .unwrap_or(false),
        service_account: entry
            .attrs
            .get("servicePrincipalName")
            .map(|values| !values.is_empty())
            .unwrap_or(false),
        member_of: entry.attrs.get("memberOf").cloned().unwrap_or_default(),
    }
}

fn group_from_entry(entry: &SearchEntry) -> Group {
    Group {
        id: entry.dn.clone(),
        display_name: attr(entry, "cn").unwrap_or_default(),
        description: attr(entry, "description"),
        mail_nickname: attr(entry, "sAMAccountName"),
        security_enabled: true,
        created: attr(entry, "whenCreated").and_then(|value| parse_generalized_time(&value)),
    }
}

fn ref_from_entry(entry: &SearchEntry) -> MemberRef {
    let kind = if entry
        .attrs
        .get("objectClass")
        .map(|classes| classes.iter().any(|class| class == "group"))
        .unwrap_or(false)
    {
        MemberKind::Group
    } else {
        MemberKind::User
    };
    MemberRef {
        id: entry.dn.clone(),
        display_name: attr(entry, "displayName")
            .or_else(|| attr(entry, "cn"))
            .unwrap_or_default(),
        name: attr(entry, "userPrincipalName")
            .or_else(|| attr(entry, "sAMAccountName"))
            .unwrap_or_default(),
        kind,
        enabled: uac(entry) & UAC_DISABLED == 0,
    }
}

/// Convert a Windows FileTime (100 ns ticks since 1601-01-01 UTC) to a UTC timestamp.
fn filetime_to_utc(ticks: i64) -> Option<DateTime<Utc>> {
    if ticks <= 0 {
        return None;
    }
    let epoch = Utc.with_ymd_and_hms(1601, 1, 1, 0, 0, 0).single()?;
    epoch.checked_add_signed(Duration::microseconds(ticks / 10))
}

/// Parse an LDAP generalized time value like `20240115083000.0Z`.
fn parse_generalized_time(value: &str) -> Option<DateTime<Utc>> {
    if value.len() < 14 {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(&value[..14], "%Y%m%d%H%M%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap;

    fn entry(dn: &str, attrs: &[(&str, &[&str])]) -> SearchEntry {
        SearchEntry {
            dn: dn.into(),
            attrs: attrs
                .iter()
                .map(|(name, values)| {
                    (
                        name.to_string(),
                        values.iter().map(|value| value.to_string()).collect(),
                    )
                })
                .collect(),
            bin_attrs: HashMap::new(),
        }
    }

    #[test]
    fn test_filetime_conversion() {
        // 2024-01-01T00:00:00Z in FileTime ticks.
        let ticks = 133_485_408_000_000_000i64;
        let time = filetime_to_utc(ticks).unwrap();
        assert_eq!(time.to_rfc3339(), "2024-01-01T00:00:00+00:00");

        // AD uses 0 for "never logged on".
        assert_eq!(filetime_to_utc(0), None);
    }

    #[test]
    fn test_generalized_time() {
        let time = parse_generalized_time("20240115083000.0Z").unwrap();
        assert_eq!(time.to_rfc3339(), "2024-01-15T08:30:00+00:00");
        assert_eq!(parse_generalized_time("bogus"), None);
    }

    #[test]
    fn test_user_flags_from_uac() {
        let user = user_from_entry(&entry(
            "CN=svc-backup,OU=Accounts,DC=corp,DC=example",
            &[
                ("cn", &["svc-backup"]),
                ("userAccountControl", &["66050"]), // disabled + don't expire password
                ("servicePrincipalName", &["backup/corp.example"]),
                ("lockoutTime", &["133485408000000000"]),
            ],
        ));
        assert!(!user.enabled);
        assert!(user.password_never_expires);
        assert!(user.service_account);
        assert!(user.locked_out);
        assert_eq!(user.display_name, "svc-backup");
    }

    #[test]
    fn test_ref_kind_from_object_class() {
        let group = ref_from_entry(&entry(
            "CN=Engineering,DC=corp,DC=example",
            &[
                ("cn", &["Engineering"]),
                ("objectClass", &["top", "group"]),
                ("sAMAccountName", &["eng"]),
            ],
        ));
        assert_eq!(group.kind, MemberKind::Group);
        assert_eq!(group.name, "eng");
    }
}
