//! Mock instantiation of the abstract [`Directory`](super::Directory) interface.
//!
//! This instantiation is built on a simple in-memory store. It is useful for testing the
//! orchestrator, audits and server in isolation from an actual tenant or domain.
#![cfg(any(test, feature = "testing"))]

use super::{
    Directory, Group, GroupUpdate, MemberRef, NewGroup, NewUser, User, UserField,
};
use anyhow::{bail, Error};
use async_std::sync::{Arc, RwLock};
use async_trait::async_trait;
use std::collections::HashMap;

/// The in-memory directory state.
#[derive(Debug, Default)]
struct State {
    users: Vec<User>,
    groups: Vec<Group>,
    /// Group ID to member user IDs.
    members: HashMap<String, Vec<String>>,
    /// Group ID to owner user IDs.
    owners: HashMap<String, Vec<String>>,
    /// User IDs holding a privileged role.
    privileged: Vec<String>,
    next_id: usize,
}

impl State {
    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    /// Resolve an identifier the way real backends do: by ID, principal name or display name.
    fn user(&self, id: &str) -> Result<usize, Error> {
        self.users
            .iter()
            .position(|user| user.id == id || user.upn == id || user.display_name == id)
            .ok_or_else(|| Error::msg(format!("no user found with '{id}'")))
    }

    fn group(&self, id: &str) -> Result<usize, Error> {
        self.groups
            .iter()
            .position(|group| {
                group.id == id
                    || group.display_name == id
                    || group.mail_nickname.as_deref() == Some(id)
            })
            .ok_or_else(|| Error::msg(format!("no group found with '{id}'")))
    }
}

/// A connection to an in-memory directory.
///
/// Cloning yields another handle on the same directory, so a test can seed state through one
/// handle and exercise an agent holding another.
#[derive(Clone, Debug, Default)]
pub struct MockDirectory(Arc<RwLock<State>>);

impl MockDirectory {
    /// Create a fresh, empty directory.
    pub fn create() -> Self {
        Self::default()
    }

    /// Insert a user directly, bypassing the creation flow. Returns the assigned ID.
    pub async fn seed_user(&self, mut user: User) -> String {
        let mut state = self.0.write().await;
        if user.id.is_empty() {
            user.id = state.fresh_id("user");
        }
        let id = user.id.clone();
        state.users.push(user);
        id
    }

    /// Insert a group directly, bypassing the creation flow. Returns the assigned ID.
    pub async fn seed_group(&self, mut group: Group) -> String {
        let mut state = self.0.write().await;
        if group.id.is_empty() {
            group.id = state.fresh_id("group");
        }
        let id = group.id.clone();
        state.groups.push(group);
        id
    }

    /// Record a membership without going through [`add_member`](Directory::add_member).
    pub async fn seed_membership(&self, user: &str, group: &str) {
        let mut state = self.0.write().await;
        state
            .members
            .entry(group.to_string())
            .or_default()
            .push(user.to_string());
    }

    /// Record a group owner.
    pub async fn seed_owner(&self, owner: &str, group: &str) {
        let mut state = self.0.write().await;
        state
            .owners
            .entry(group.to_string())
            .or_default()
            .push(owner.to_string());
    }

    /// Mark a user as holding a privileged role.
    pub async fn seed_privileged(&self, user: &str) {
        let mut state = self.0.write().await;
        state.privileged.push(user.to_string());
    }
}

#[async_trait]
impl Directory for MockDirectory {
    async fn list_users(&self, max: usize) -> Result<Vec<User>, Error> {
        let state = self.0.read().await;
        Ok(state.users.iter().take(max).cloned().collect())
    }

    async fn get_user(&self, id: &str) -> Result<User, Error> {
        let state = self.0.read().await;
        let index = state.user(id)?;
        Ok(state.users[index].clone())
    }

    async fn create_user(&self, user: NewUser) -> Result<User, Error> {
        let mut state = self.0.write().await;
        if state.users.iter().any(|existing| existing.upn == user.upn) {
            bail!("a user with principal name '{}' already exists", user.upn);
        }
        let id = state.fresh_id("user");
        let user = User {
            id,
            display_name: user.display_name,
            upn: user.upn,
            enabled: true,
            ..Default::default()
        };
        state.users.push(user.clone());
        Ok(user)
    }

    async fn update_user(&self, id: &str, field: UserField, value: &str) -> Result<(), Error> {
        let mut state = self.0.write().await;
        let index = state.user(id)?;
        let user = &mut state.users[index];
        match field {
            UserField::DisplayName => user.display_name = value.to_string(),
            UserField::Department => user.department = Some(value.to_string()),
            UserField::Title => user.title = Some(value.to_string()),
            UserField::Mail => user.upn = value.to_string(),
        }
        Ok(())
    }

    async fn delete_user(&self, id: &str) -> Result<(), Error> {
        let mut state = self.0.write().await;
        let index = state.user(id)?;
        let user = state.users.remove(index);
        for members in state.members.values_mut() {
            members.retain(|member| *member != user.id);
        }
        Ok(())
    }

    async fn list_groups(&self, max: usize) -> Result<Vec<Group>, Error> {
        let state = self.0.read().await;
        Ok(state.groups.iter().take(max).cloned().collect())
    }

    async fn get_group(&self, id: &str) -> Result<Group, Error> {
        let state = self.0.read().await;
        let index = state.group(id)?;
        Ok(state.groups[index].clone())
    }

    async fn create_group(&self, group: NewGroup) -> Result<Group, Error> {
        let mut state = self.0.write().await;
        let id = state.fresh_id("group");
        let group = Group {
            id,
            display_name: group.display_name,
            description: group.description,
            mail_nickname: Some(group.mail_nickname),
            security_enabled: true,
            created: None,
        };
        state.groups.push(group.clone());
        Ok(group)
    }

    async fn update_group(&self, id: &str, update: GroupUpdate) -> Result<(), Error> {
        let mut state = self.0.write().await;
        let index = state.group(id)?;
        if let Some(owner) = update.owner {
            let owner_index = state.user(&owner)?;
            let owner_id = state.users[owner_index].id.clone();
            let group_id = state.groups[index].id.clone();
            state.owners.entry(group_id).or_default().push(owner_id);
        }
        let group = &mut state.groups[index];
        if let Some(name) = update.display_name {
            group.display_name = name;
        }
        if let Some(description) = update.description {
            group.description = Some(description);
        }
        Ok(())
    }

    async fn delete_group(&self, id: &str) -> Result<(), Error> {
        let mut state = self.0.write().await;
        let index = state.group(id)?;
        let group = state.groups.remove(index);
        state.members.remove(&group.id);
        state.owners.remove(&group.id);
        Ok(())
    }

    async fn group_members(&self, group: &str) -> Result<Vec<MemberRef>, Error> {
        let state = self.0.read().await;
        let index = state.group(group)?;
        let members = state
            .members
            .get(&state.groups[index].id)
            .cloned()
            .unwrap_or_default();
        Ok(members
            .iter()
            .filter_map(|id| state.user(id).ok())
            .map(|index| MemberRef::user(&state.users[index]))
            .collect())
    }

    async fn group_owners(&self, group: &str) -> Result<Vec<MemberRef>, Error> {
        let state = self.0.read().await;
        let index = state.group(group)?;
        let owners = state
            .owners
            .get(&state.groups[index].id)
            .cloned()
            .unwrap_or_default();
        Ok(owners
            .iter()
            .filter_map(|id| state.user(id).ok())
            .map(|index| MemberRef::user(&state.users[index]))
            .collect())
    }

    async fn add_member(&self, user: &str, group: &str) -> Result<(), Error> {
        let mut state = self.0.write().await;
        let user_index = state.user(user)?;
        let group_index = state.group(group)?;
        let user_id = state.users[user_index].id.clone();
        let group_id = state.groups[group_index].id.clone();
        let members = state.members.entry(group_id).or_default();
        if !members.contains(&user_id) {
            members.push(user_id);
        }
        Ok(())
    }

    async fn remove_member(&self, user: &str, group: &str) -> Result<(), Error> {
        let mut state = self.0.write().await;
        let user_index = state.user(user)?;
        let group_index = state.group(group)?;
        let user_id = state.users[user_index].id.clone();
        let group_id = state.groups[group_index].id.clone();
        if let Some(members) = state.members.get_mut(&group_id) {
            members.retain(|member| *member != user_id);
        }
        Ok(())
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
        let state = self.0.read().await;
        Ok(state
            .privileged
            .iter()
            .filter_map(|id| state.user(id).ok())
            .map(|index| MemberRef::user(&state.users[index]))
            .collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[async_std::test]
    async fn test_lookup_by_any_identifier() {
        let dir = MockDirectory::create();
        let id = dir
            .seed_user(User {
                display_name: "Jane Doe".into(),
                upn: "jdoe@example.com".into(),
                enabled: true,
                ..Default::default()
            })
            .await;

        for key in [id.as_str(), "jdoe@example.com", "Jane Doe"] {
            assert_eq!(dir.get_user(key).await.unwrap().id, id);
        }
        let err = dir.get_user("nobody").await.unwrap_err();
        assert!(err.to_string().contains("nobody"), "{err}");
    }

    #[async_std::test]
    async fn test_listing_respects_the_bound() {
        let dir = MockDirectory::create();
        for i in 0..3 {
            dir.seed_user(User {
                display_name: format!("User {i}"),
                upn: format!("user{i}@example.com"),
                enabled: true,
                ..Default::default()
            })
            .await;
            dir.seed_group(Group {
                display_name: format!("Group {i}"),
                security_enabled: true,
                ..Default::default()
            })
            .await;
        }

        assert_eq!(dir.list_users(2).await.unwrap().len(), 2);
        assert_eq!(dir.list_groups(2).await.unwrap().len(), 2);
        assert_eq!(dir.list_users(10).await.unwrap().len(), 3);
        assert!(dir.list_users(0).await.unwrap().is_empty());
        assert!(dir.list_groups(0).await.unwrap().is_empty());
    }

    #[async_std::test]
    async fn test_empty_update_of_missing_group_is_an_error() {
        let dir = MockDirectory::create();
        let err = dir
            .update_group("no-such-group", GroupUpdate::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no-such-group"), "{err}");
    }

    #[async_std::test]
    async fn test_membership_lifecycle() {
        let dir = MockDirectory::create();
        let user = dir
            .create_user(NewUser {
                display_name: "Jane Doe".into(),
                upn: "jdoe@example.com".into(),
                password: "hunter2!".into(),
            })
            .await
            .unwrap();
        let group = dir
            .create_group(NewGroup {
                display_name: "Engineering".into(),
                mail_nickname: "eng".into(),
                description: None,
            })
            .await
            .unwrap();

        dir.add_member(&user.upn, "Engineering").await.unwrap();
        // Adding twice is idempotent.
        dir.add_member(&user.id, &group.id).await.unwrap();
        let members = dir.group_members("eng").await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, user.id);

        dir.remove_member(&user.id, &group.id).await.unwrap();
        assert!(dir.group_members(&group.id).await.unwrap().is_empty());
    }

    #[async_std::test]
    async fn test_deleting_user_clears_memberships() {
        let dir = MockDirectory::create();
        let user = dir
            .create_user(NewUser {
                display_name: "Jane Doe".into(),
                upn: "jdoe@example.com".into(),
                password: "hunter2!".into(),
            })
            .await
            .unwrap();
        let group = dir
            .create_group(NewGroup {
                display_name: "Engineering".into(),
                mail_nickname: "eng".into(),
                description: None,
            })
            .await
            .unwrap();
        dir.add_member(&user.id, &group.id).await.unwrap();

        dir.delete_user(&user.id).await.unwrap();
        assert!(dir.group_members(&group.id).await.unwrap().is_empty());
    }
}
