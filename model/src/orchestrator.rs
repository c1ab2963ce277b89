//! Routing of provisioning requests to a directory backend.
//!
//! A request names a target directory and a command; the router dispatches it, records
//! observability events along the way, and wraps the result in the response envelope the clients
//! expect. Destructive commands are held until the caller explicitly confirms them.

use crate::audit::{self, AuditOptions};
use crate::directory::{Directory, GroupUpdate, NewGroup, NewUser, UserField};
use crate::events::{Observer, TraceSummary};
use anyhow::Error;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum::{Display, EnumString};

/// The directory a request is aimed at.
#[derive(
    Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Target {
    Entra,
    Ad,
}

impl Target {
    /// The `action` tag used in response envelopes.
    pub fn action(&self) -> &'static str {
        match self {
            Self::Entra => "provision",
            Self::Ad => "ad_provision",
        }
    }

    fn system(&self) -> &'static str {
        match self {
            Self::Entra => "Entra ID",
            Self::Ad => "Active Directory",
        }
    }
}

/// An audit to run against a directory.
#[derive(
    Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Deserialize, Serialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditKind {
    OwnerlessGroups,
    InactiveOwnerGroups,
    InactiveGuests,
    MemberlessGroups,
    InactiveAccounts,
    ServiceAccounts,
    PasswordNeverExpires,
    LockedOutAccounts,
    PrivilegedAccounts,
}

/// A directory operation.
///
/// The same enum backs the HTTP API (via the serde derives, tagged by `command`) and the operator
/// CLI (via the clap derive).
#[derive(Clone, Debug, Deserialize, Serialize, Subcommand)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// List user accounts.
    ListUsers {
        #[clap(long, default_value = "25")]
        #[serde(default = "default_limit")]
        limit: usize,
    },
    /// Show a single user.
    GetUser {
        #[clap(long)]
        user: String,
    },
    /// Create a new user account.
    CreateUser {
        #[clap(long)]
        display_name: String,
        #[clap(long)]
        upn: String,
        #[clap(long)]
        password: String,
    },
    /// Update one attribute of a user.
    UpdateUser {
        #[clap(long)]
        user: String,
        #[clap(long)]
        field: UserField,
        #[clap(long)]
        value: String,
    },
    /// Delete a user account.
    DeleteUser {
        #[clap(long)]
        user: String,
    },
    /// List groups.
    ListGroups {
        #[clap(long, default_value = "25")]
        #[serde(default = "default_limit")]
        limit: usize,
    },
    /// Show a single group.
    GetGroup {
        #[clap(long)]
        group: String,
    },
    /// Create a new security group.
    CreateGroup {
        #[clap(long)]
        display_name: String,
        #[clap(long)]
        mail_nickname: String,
        #[clap(long)]
        #[serde(default)]
        description: Option<String>,
    },
    /// Update a group's name, description or owner.
    UpdateGroup {
        #[clap(long)]
        group: String,
        #[clap(long)]
        #[serde(default)]
        display_name: Option<String>,
        #[clap(long)]
        #[serde(default)]
        description: Option<String>,
        #[clap(long)]
        #[serde(default)]
        owner: Option<String>,
    },
    /// Delete a group.
    DeleteGroup {
        #[clap(long)]
        group: String,
    },
    /// List the members of a group.
    ListMembers {
        #[clap(long)]
        group: String,
    },
    /// List the owners of a group.
    ListOwners {
        #[clap(long)]
        group: String,
    },
    /// Add a user to a group.
    AddMember {
        #[clap(long)]
        user: String,
        #[clap(long)]
        group: String,
    },
    /// Remove a user from a group.
    RemoveMember {
        #[clap(long)]
        user: String,
        #[clap(long)]
        group: String,
    },
    /// Install a user as a group owner.
    AssignOwner {
        #[clap(long)]
        owner: String,
        #[clap(long)]
        group: String,
    },
    /// Run a security audit.
    Audit {
        #[clap(long)]
        kind: AuditKind,
        /// Lookback window for sign-in based audits.
        #[clap(long, default_value = "90")]
        #[serde(default = "default_days")]
        days: i64,
        #[clap(flatten)]
        #[serde(flatten)]
        opt: AuditOptions,
    },
}

fn default_limit() -> usize {
    25
}

fn default_days() -> i64 {
    audit::DEFAULT_INACTIVE_DAYS
}

impl Command {
    /// Whether this command destroys state and requires confirmation.
    pub fn destructive(&self) -> bool {
        matches!(
            self,
            Self::DeleteUser { .. } | Self::DeleteGroup { .. } | Self::RemoveMember { .. }
        )
    }

    /// The wire name of the command, for event logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ListUsers { .. } => "list_users",
            Self::GetUser { .. } => "get_user",
            Self::CreateUser { .. } => "create_user",
            Self::UpdateUser { .. } => "update_user",
            Self::DeleteUser { .. } => "delete_user",
            Self::ListGroups { .. } => "list_groups",
            Self::GetGroup { .. } => "get_group",
            Self::CreateGroup { .. } => "create_group",
            Self::UpdateGroup { .. } => "update_group",
            Self::DeleteGroup { .. } => "delete_group",
            Self::ListMembers { .. } => "list_members",
            Self::ListOwners { .. } => "list_owners",
            Self::AddMember { .. } => "add_member",
            Self::RemoveMember { .. } => "remove_member",
            Self::AssignOwner { .. } => "assign_owner",
            Self::Audit { .. } => "audit",
        }
    }
}

/// A provisioning request as submitted to the API.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProvisionRequest {
    pub target: Target,
    #[serde(flatten)]
    pub command: Command,
    /// Must be set for destructive commands.
    #[serde(default)]
    pub confirm: bool,
}

/// Execute a single command against a directory.
///
/// This is the unguarded entry point used by the CLI, where the operator has already expressed
/// intent by typing the command. The API goes through [`Router::dispatch`], which adds the
/// confirmation gate and event logging.
pub async fn run(dir: &dyn Directory, command: Command) -> Result<Value, Error> {
    Ok(match command {
        Command::ListUsers { limit } => serde_json::to_value(dir.list_users(limit).await?)?,
        Command::GetUser { user } => serde_json::to_value(dir.get_user(&user).await?)?,
        Command::CreateUser {
            display_name,
            upn,
            password,
        } => serde_json::to_value(
            dir.create_user(NewUser {
                display_name,
                upn,
                password,
            })
            .await?,
        )?,
        Command::UpdateUser { user, field, value } => {
            dir.update_user(&user, field, &value).await?;
            json!({ "status": "ok", "message": format!("updated {field} of '{user}'") })
        }
        Command::DeleteUser { user } => {
            dir.delete_user(&user).await?;
            json!({ "status": "ok", "message": format!("deleted user '{user}'") })
        }
        Command::ListGroups { limit } => serde_json::to_value(dir.list_groups(limit).await?)?,
        Command::GetGroup { group } => serde_json::to_value(dir.get_group(&group).await?)?,
        Command::CreateGroup {
            display_name,
            mail_nickname,
            description,
        } => serde_json::to_value(
            dir.create_group(NewGroup {
                display_name,
                mail_nickname,
                description,
            })
            .await?,
        )?,
        Command::UpdateGroup {
            group,
            display_name,
            description,
            owner,
        } => {
            dir.update_group(
                &group,
                GroupUpdate {
                    display_name,
                    description,
                    owner,
                },
            )
            .await?;
            json!({ "status": "ok", "message": format!("updated group '{group}'") })
        }
        Command::DeleteGroup { group } => {
            dir.delete_group(&group).await?;
            json!({ "status": "ok", "message": format!("deleted group '{group}'") })
        }
        Command::ListMembers { group } => {
            serde_json::to_value(dir.group_members(&group).await?)?
        }
        Command::ListOwners { group } => serde_json::to_value(dir.group_owners(&group).await?)?,
        Command::AddMember { user, group } => {
            dir.add_member(&user, &group).await?;
            json!({ "status": "ok", "message": format!("added '{user}' to '{group}'") })
        }
        Command::RemoveMember { user, group } => {
            dir.remove_member(&user, &group).await?;
            json!({ "status": "ok", "message": format!("removed '{user}' from '{group}'") })
        }
        Command::AssignOwner { owner, group } => {
            dir.assign_owner(&owner, &group).await?;
            json!({ "status": "ok", "message": format!("made '{owner}' an owner of '{group}'") })
        }
        Command::Audit { kind, days, opt } => match kind {
            AuditKind::OwnerlessGroups => {
                serde_json::to_value(audit::ownerless_groups(dir, opt).await?)?
            }
            AuditKind::InactiveOwnerGroups => {
                serde_json::to_value(audit::inactive_owner_groups(dir, opt).await?)?
            }
            AuditKind::InactiveGuests => {
                serde_json::to_value(audit::inactive_guests(dir, days, opt).await?)?
            }
            AuditKind::MemberlessGroups => {
                serde_json::to_value(audit::memberless_groups(dir, opt).await?)?
            }
            AuditKind::InactiveAccounts => {
                serde_json::to_value(audit::inactive_accounts(dir, days, opt).await?)?
            }
            AuditKind::ServiceAccounts => {
                serde_json::to_value(audit::service_accounts(dir, opt).await?)?
            }
            AuditKind::PasswordNeverExpires => {
                serde_json::to_value(audit::password_never_expires(dir, opt).await?)?
            }
            AuditKind::LockedOutAccounts => {
                serde_json::to_value(audit::locked_out_accounts(dir, opt).await?)?
            }
            AuditKind::PrivilegedAccounts => {
                serde_json::to_value(audit::privileged_accounts(dir, opt).await?)?
            }
        },
    })
}

/// The request router.
#[derive(Clone, Default)]
pub struct Router {
    events: Observer,
}

impl Router {
    pub fn new(events: Observer) -> Self {
        Self { events }
    }

    /// Dispatch a request, wrapping the result in the response envelope.
    ///
    /// Destructive commands without `confirm` are not executed; the caller gets a
    /// `needs_confirmation` result and must resubmit with `confirm` set.
    pub async fn dispatch(
        &self,
        dir: &dyn Directory,
        request: ProvisionRequest,
    ) -> Result<Value, Error> {
        let operation = request.command.name();
        self.events.trace(TraceSummary {
            intent: "provisioning_request".into(),
            system: request.target.system().into(),
            agent: "orchestrator".into(),
            operation: operation.into(),
        });

        if request.command.destructive() && !request.confirm {
            self.events.step_detail("needs_confirmation", operation);
            return Ok(json!({
                "action": request.target.action(),
                "result": {
                    "status": "needs_confirmation",
                    "message": format!(
                        "'{operation}' is destructive; resubmit with confirm set to proceed"
                    ),
                },
            }));
        }

        match run(dir, request.command).await {
            Ok(result) => {
                self.events.step_detail("completed", operation);
                Ok(json!({ "action": request.target.action(), "result": result }))
            }
            Err(err) => {
                self.events
                    .step_detail("failed", format!("{operation}: {err}"));
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::directory::{mock::MockDirectory, User};

    fn request(body: Value) -> ProvisionRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_request_parsing() {
        let req = request(json!({
            "target": "entra",
            "command": "create_user",
            "display_name": "Jane Doe",
            "upn": "jdoe@example.com",
            "password": "hunter2!",
        }));
        assert_eq!(req.target, Target::Entra);
        assert!(!req.confirm);
        assert!(matches!(req.command, Command::CreateUser { .. }));

        // Limits default when omitted.
        let req = request(json!({ "target": "ad", "command": "list_users" }));
        assert!(matches!(req.command, Command::ListUsers { limit: 25 }));

        // Audit options flatten into the same object.
        let req = request(json!({
            "target": "ad",
            "command": "audit",
            "kind": "locked_out_accounts",
            "count_only": true,
        }));
        let Command::Audit { kind, days, opt } = req.command else {
            panic!("expected an audit");
        };
        assert_eq!(kind, AuditKind::LockedOutAccounts);
        assert_eq!(days, 90);
        assert!(opt.count_only);
    }

    #[async_std::test]
    async fn test_destructive_commands_require_confirmation() {
        let dir = MockDirectory::create();
        let id = dir
            .seed_user(User {
                display_name: "Jane Doe".into(),
                upn: "jdoe@example.com".into(),
                enabled: true,
                ..Default::default()
            })
            .await;
        let router = Router::default();

        let reply = router
            .dispatch(
                &dir,
                request(json!({ "target": "entra", "command": "delete_user", "user": id })),
            )
            .await
            .unwrap();
        assert_eq!(reply["result"]["status"], "needs_confirmation");
        assert!(dir.get_user(&id).await.is_ok(), "user was deleted anyway");

        let reply = router
            .dispatch(
                &dir,
                request(json!({
                    "target": "entra",
                    "command": "delete_user",
                    "user": id,
                    "confirm": true,
                })),
            )
            .await
            .unwrap();
        assert_eq!(reply["action"], "provision");
        assert_eq!(reply["result"]["status"], "ok");
        assert!(dir.get_user(&id).await.is_err());
    }

    #[async_std::test]
    async fn test_dispatch_wraps_results_in_the_envelope() {
        let dir = MockDirectory::create();
        let events = Observer::new();
        let router = Router::new(events.clone());

        let reply = router
            .dispatch(
                &dir,
                request(json!({
                    "target": "ad",
                    "command": "create_group",
                    "display_name": "Engineering",
                    "mail_nickname": "eng",
                })),
            )
            .await
            .unwrap();
        assert_eq!(reply["action"], "ad_provision");
        assert_eq!(reply["result"]["display_name"], "Engineering");

        let recorded = events.snapshot();
        assert!(recorded
            .iter()
            .any(|event| event.detail.as_deref() == Some("create_group")));
    }

    #[async_std::test]
    async fn test_errors_propagate_and_are_logged() {
        let dir = MockDirectory::create();
        let events = Observer::new();
        let router = Router::new(events.clone());

        let err = router
            .dispatch(
                &dir,
                request(json!({ "target": "entra", "command": "get_user", "user": "nobody" })),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nobody"), "{err}");
        assert!(events
            .snapshot()
            .iter()
            .any(|event| event.operation == "failed"));
    }

    #[async_std::test]
    async fn test_run_audit_command() {
        let dir = MockDirectory::create();
        dir.seed_user(User {
            display_name: "Locked".into(),
            upn: "locked@example.com".into(),
            enabled: true,
            locked_out: true,
            ..Default::default()
        })
        .await;

        let result = run(
            &dir,
            Command::Audit {
                kind: AuditKind::LockedOutAccounts,
                days: 90,
                opt: AuditOptions::default(),
            },
        )
        .await
        .unwrap();
        assert_eq!(result["total"], 1);
        assert_eq!(result["items"][0]["displayName"], "Locked");
    }
}
