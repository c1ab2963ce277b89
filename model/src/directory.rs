//! Abstraction over the identity directories that the agents provision against.
//!
//! The orchestrator and audits are written against the [`Directory`] trait, with one
//! implementation per backing store: Entra ID via the Microsoft Graph API, on-premises Active
//! Directory via LDAP, and an in-memory mock for testing.

use anyhow::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

pub mod entra;
pub mod ldap;
pub mod mock;

pub use entra::EntraDirectory;
pub use ldap::AdDirectory;

/// A user account in an identity directory.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct User {
    /// The backend's unique identifier: an object ID in Entra ID, a DN in Active Directory.
    pub id: String,
    pub display_name: String,
    /// The user principal name (or mail address, for directories without UPNs).
    pub upn: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Whether this is a guest account rather than a member of the tenant.
    #[serde(default)]
    pub guest: bool,
    /// The most recent interactive sign-in, if the directory tracks one.
    #[serde(default)]
    pub last_sign_in: Option<DateTime<Utc>>,
    #[serde(default)]
    pub password_never_expires: bool,
    #[serde(default)]
    pub locked_out: bool,
    /// Whether the account exists to run a service (e.g. has service principal names attached).
    #[serde(default)]
    pub service_account: bool,
    /// Names or DNs of the groups this user belongs to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub member_of: Vec<String>,
}

/// A group in an identity directory.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Group {
    /// The backend's unique identifier: an object ID in Entra ID, a DN in Active Directory.
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mail_nickname: Option<String>,
    pub security_enabled: bool,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

/// The kind of object referenced from a membership or ownership list.
#[derive(
    Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum MemberKind {
    User,
    Group,
}

impl Default for MemberKind {
    fn default() -> Self {
        Self::User
    }
}

/// A reference to a directory object appearing in a membership or ownership list.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct MemberRef {
    pub id: String,
    pub display_name: String,
    /// The UPN for users, or the mail nickname for groups.
    pub name: String,
    #[serde(default)]
    pub kind: MemberKind,
    /// Whether the referenced account is enabled. Groups are always considered enabled.
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

/// The attributes needed to create a new user.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NewUser {
    pub display_name: String,
    pub upn: String,
    /// The initial password. The account is created with forced password change on first sign-in.
    pub password: String,
}

impl NewUser {
    /// The mail nickname (or SAM account name) derived from the UPN.
    pub fn nickname(&self) -> &str {
        self.upn.split('@').next().unwrap_or(&self.upn)
    }
}

/// The attributes needed to create a new security group.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct NewGroup {
    pub display_name: String,
    pub mail_nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A partial update to an existing group. Fields left [`None`] are unchanged.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct GroupUpdate {
    pub display_name: Option<String>,
    pub description: Option<String>,
    /// Identifier of a user to install as the group's owner.
    pub owner: Option<String>,
}

/// A user attribute which can be updated in place.
#[derive(
    Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UserField {
    DisplayName,
    Department,
    Title,
    Mail,
}

/// An identity directory.
///
/// Identifiers passed to the lookup and mutation operations are interpreted by the backend: Entra
/// ID accepts object IDs and UPNs, Active Directory accepts DNs and common names. Operations on
/// identifiers which do not resolve fail with an error naming the identifier.
#[async_trait]
pub trait Directory: Send + Sync + 'static {
    /// List up to `max` users.
    async fn list_users(&self, max: usize) -> Result<Vec<User>, Error>;

    /// Get details for a specific user.
    async fn get_user(&self, id: &str) -> Result<User, Error>;

    /// Create a new, enabled user account.
    async fn create_user(&self, user: NewUser) -> Result<User, Error>;

    /// Update a single attribute of an existing user.
    async fn update_user(&self, id: &str, field: UserField, value: &str) -> Result<(), Error>;

    /// Delete a user account.
    async fn delete_user(&self, id: &str) -> Result<(), Error>;

    /// List up to `max` groups.
    async fn list_groups(&self, max: usize) -> Result<Vec<Group>, Error>;

    /// Get details for a specific group.
    async fn get_group(&self, id: &str) -> Result<Group, Error>;

    /// Create a new security group.
    async fn create_group(&self, group: NewGroup) -> Result<Group, Error>;

    /// Apply a partial update to an existing group.
    async fn update_group(&self, id: &str, update: GroupUpdate) -> Result<(), Error>;

    /// Delete a group.
    async fn delete_group(&self, id: &str) -> Result<(), Error>;

    /// The members of a group.
    async fn group_members(&self, group: &str) -> Result<Vec<MemberRef>, Error>;

    /// The owners of a group.
    async fn group_owners(&self, group: &str) -> Result<Vec<MemberRef>, Error>;

    /// Add a user to a group.
    async fn add_member(&self, user: &str, group: &str) -> Result<(), Error>;

    /// Remove a user from a group.
    async fn remove_member(&self, user: &str, group: &str) -> Result<(), Error>;

    /// Install a user as an owner of a group.
    async fn assign_owner(&self, owner: &str, group: &str) -> Result<(), Error>;

    /// Accounts holding a privileged administrative role.
    async fn privileged_users(&self) -> Result<Vec<MemberRef>, Error>;
}

impl MemberRef {
    /// A reference to a user account.
    pub fn user(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            display_name: user.display_name.clone(),
            name: user.upn.clone(),
            kind: MemberKind::User,
            enabled: user.enabled,
        }
    }

    /// A reference to a nested group.
    pub fn group(group: &Group) -> Self {
        Self {
            id: group.id.clone(),
            display_name: group.display_name.clone(),
            name: group.mail_nickname.clone().unwrap_or_default(),
            kind: MemberKind::Group,
            enabled: true,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_user_field_parsing() {
        assert_eq!("display_name".parse(), Ok(UserField::DisplayName));
        assert_eq!("title".parse(), Ok(UserField::Title));
        assert!("password".parse::<UserField>().is_err());
    }

    #[test]
    fn test_new_user_nickname() {
        let user = NewUser {
            display_name: "Jane Doe".into(),
            upn: "jdoe@example.com".into(),
            password: "hunter2!".into(),
        };
        assert_eq!(user.nickname(), "jdoe");

        let no_domain = NewUser {
            upn: "jdoe".into(),
            ..user
        };
        assert_eq!(no_domain.nickname(), "jdoe");
    }
}
