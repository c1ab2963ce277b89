//! An Entra ID directory backed by the Microsoft Graph API.

use super::{
    Directory, Group, GroupUpdate, MemberKind, MemberRef, NewGroup, NewUser, User, UserField,
};
use anyhow::Error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::Args;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use surf::Url;

/// Well-known object ID of the Global Administrator directory role.
const GLOBAL_ADMIN_ROLE: &str = "bbda4080-69bb-4b2d-bbaf-f0526515c6b9";

/// The largest page size the Graph API will serve.
const MAX_PAGE: usize = 999;

const USER_SELECT: &str =
    "id,displayName,userPrincipalName,accountEnabled,department,jobTitle,userType,signInActivity";
const GROUP_SELECT: &str =
    "id,displayName,description,mailNickname,securityEnabled,createdDateTime";
const MEMBER_SELECT: &str = "id,displayName,userPrincipalName,mailNickname,accountEnabled";

/// Entra ID connection options.
#[derive(Clone, Debug, Args)]
pub struct Options {
    /// The tenant to authenticate against.
    #[clap(long, env = "IAM_TENANT_ID")]
    pub tenant_id: String,

    /// The application (client) ID used for client-credentials authentication.
    #[clap(long, env = "IAM_CLIENT_ID")]
    pub client_id: String,

    /// The client secret used for client-credentials authentication.
    #[clap(long, env = "IAM_CLIENT_SECRET")]
    pub client_secret: String,

    /// Base URL of the Microsoft Graph API.
    #[clap(
        long,
        env = "IAM_GRAPH_URL",
        default_value = "https://graph.microsoft.com/v1.0/"
    )]
    pub graph_url: Url,

    /// Base URL of the identity platform token endpoint.
    #[clap(
        long,
        env = "IAM_LOGIN_URL",
        default_value = "https://login.microsoftonline.com/"
    )]
    pub login_url: Url,
}

impl Options {
    /// Acquire a token and connect to the Graph API.
    pub async fn connect(&self) -> Result<EntraDirectory, Error> {
        EntraDirectory::connect(self.clone()).await
    }
}

/// An Entra ID tenant, accessed through the Microsoft Graph API.
pub struct EntraDirectory {
    client: surf::Client,
    graph_url: Url,
    auth: String,
}

impl EntraDirectory {
    /// Connect to the Graph API, acquiring a bearer token for the configured application.
    pub async fn connect(opt: Options) -> Result<Self, Error> {
        let token_url = opt
            .login_url
            .join(&format!("{}/oauth2/v2.0/token", opt.tenant_id))?;
        let form = TokenForm {
            client_id: &opt.client_id,
            client_secret: &opt.client_secret,
            scope: "https://graph.microsoft.com/.default",
            grant_type: "client_credentials",
        };
        let body = surf::Body::from_form(&form).map_err(Error::msg)?;
        let token: TokenResponse = surf::post(token_url.as_str())
            .body(body)
            .recv_json()
            .await
            .map_err(Error::msg)?;
        tracing::info!(tenant = %opt.tenant_id, "acquired Graph API token");

        let client: surf::Client = surf::Config::default()
            .set_base_url(opt.graph_url.clone())
            .try_into()
            .map_err(Error::msg)?;
        Ok(Self {
            client,
            graph_url: opt.graph_url,
            auth: format!("Bearer {}", token.access_token),
        })
    }

    fn get(&self, path: &str) -> surf::RequestBuilder {
        self.client.get(path).header("Authorization", &*self.auth)
    }

    fn post(&self, path: &str) -> surf::RequestBuilder {
        self.client.post(path).header("Authorization", &*self.auth)
    }

    fn patch(&self, path: &str) -> surf::RequestBuilder {
        self.client.patch(path).header("Authorization", &*self.auth)
    }

    fn delete(&self, path: &str) -> surf::RequestBuilder {
        self.client.delete(path).header("Authorization", &*self.auth)
    }

    /// Send a request and parse a JSON response, surfacing Graph error bodies.
    async fn body<T: DeserializeOwned>(&self, req: surf::RequestBuilder) -> Result<T, Error> {
        let mut res = req.await.map_err(Error::msg)?;
        if !res.status().is_success() {
            return Err(graph_error(&mut res).await);
        }
        res.body_json().await.map_err(Error::msg)
    }

    /// Send a request expecting an empty success response (204 from mutations).
    async fn expect_ok(&self, req: surf::RequestBuilder) -> Result<(), Error> {
        let mut res = req.await.map_err(Error::msg)?;
        if !res.status().is_success() {
            return Err(graph_error(&mut res).await);
        }
        Ok(())
    }

    /// Fetch up to `max` objects from a collection endpoint, following `@odata.nextLink` pages.
    async fn collect<T: DeserializeOwned>(
        &self,
        path: &str,
        select: &str,
        max: usize,
    ) -> Result<Vec<T>, Error> {
        let mut items = Vec::new();
        if max == 0 {
            return Ok(items);
        }

        let params = [
            ("$select", select.to_string()),
            ("$top", max.min(MAX_PAGE).to_string()),
        ];
        let req = self.get(path).query(&params).map_err(Error::msg)?;
        let mut page: Page<T> = self.body(req).await?;
        loop {
            for item in page.value {
                items.push(item);
                if items.len() >= max {
                    return Ok(items);
                }
            }
            match page.next {
                // Next links are absolute URLs carrying the original query.
                Some(next) => page = self.body(self.get(&next)).await?,
                None => return Ok(items),
            }
        }
    }

    /// The absolute Graph URL of an object, as used in `@odata.id` references.
    fn object_url(&self, path: &str) -> Result<Url, Error> {
        Ok(self.graph_url.join(path)?)
    }
}

#[async_trait]
impl Directory for EntraDirectory {
    async fn list_users(&self, max: usize) -> Result<Vec<User>, Error> {
        let users: Vec<GraphUser> = self.collect("users", USER_SELECT, max).await?;
        Ok(users.into_iter().map(User::from).collect())
    }

    async fn get_user(&self, id: &str) -> Result<User, Error> {
        let params = [("$select", USER_SELECT)];
        let req = self
            .get(&format!("users/{id}"))
            .query(&params)
            .map_err(Error::msg)?;
        let user: GraphUser = self.body(req).await?;
        Ok(user.into())
    }

    async fn create_user(&self, user: NewUser) -> Result<User, Error> {
        let payload = json!({
            "accountEnabled": true,
            "displayName": user.display_name,
            "mailNickname": user.nickname(),
            "userPrincipalName": user.upn,
            "passwordProfile": {
                "forceChangePasswordNextSignIn": true,
                "password": user.password,
            },
        });
        let req = self.post("users").body_json(&payload).map_err(Error::msg)?;
        let created: GraphUser = self.body(req).await?;
        tracing::info!(upn = %created.user_principal_name.as_deref().unwrap_or(""), "created user");
        Ok(created.into())
    }

    async fn update_user(&self, id: &str, field: UserField, value: &str) -> Result<(), Error> {
        let attribute = match field {
            UserField::DisplayName => "displayName",
            UserField::Department => "department",
            UserField::Title => "jobTitle",
            UserField::Mail => "mail",
        };
        let req = self
            .patch(&format!("users/{id}"))
            .body_json(&json!({ attribute: value }))
            .map_err(Error::msg)?;
        self.expect_ok(req).await
    }

    async fn delete_user(&self, id: &str) -> Result<(), Error> {
        self.expect_ok(self.delete(&format!("users/{id}"))).await
    }

    async fn list_groups(&self, max: usize) -> Result<Vec<Group>, Error> {
        let groups: Vec<GraphGroup> = self.collect("groups", GROUP_SELECT, max).await?;
        Ok(groups.into_iter().map(Group::from).collect())
    }

    async fn get_group(&self, id: &str) -> Result<Group, Error> {
        let params = [("$select", GROUP_SELECT)];
        let req = self
            .get(&format!("groups/{id}"))
            .query(&params)
            .map_err(Error::msg)?;
        let group: GraphGroup = self.body(req).await?;
        Ok(group.into())
    }

    async fn create_group(&self, group: NewGroup) -> Result<Group, Error> {
        let mut payload = json!({
            "displayName": group.display_name,
            "mailEnabled": false,
            "mailNickname": group.mail_nickname,
            "securityEnabled": true,
            "groupTypes": [],
        });
        if let Some(description) = &group.description {
            payload["description"] = json!(description);
        }
        let req = self
            .post("groups")
            .body_json(&payload)
            .map_err(Error::msg)?;
        let created: GraphGroup = self.body(req).await?;
        tracing::info!(name = %created.display_name.as_deref().unwrap_or(""), "created group");
        Ok(created.into())
    }

    async fn update_group(&self, id: &str, update: GroupUpdate) -> Result<(), Error> {
        let GroupUpdate {
            display_name,
            description,
            owner,
        } = update;
        let mut patch = serde_json::Map::new();
        if let Some(name) = display_name {
            patch.insert("displayName".into(), json!(name));
        }
        if let Some(description) = description {
            patch.insert("description".into(), json!(description));
        }
        // An update with nothing to change still validates the identifier, so a bad ID fails the
        // same way it does with fields set.
        if patch.is_empty() && owner.is_none() {
            self.get_group(id).await?;
            return Ok(());
        }
        if !patch.is_empty() {
            let req = self
                .patch(&format!("groups/{id}"))
                .body_json(&patch)
                .map_err(Error::msg)?;
            self.expect_ok(req).await?;
        }
        if let Some(owner) = owner {
            self.assign_owner(&owner, id).await?;
        }
        Ok(())
    }

    async fn delete_group(&self, id: &str) -> Result<(), Error> {
        self.expect_ok(self.delete(&format!("groups/{id}"))).await
    }

    async fn group_members(&self, group: &str) -> Result<Vec<MemberRef>, Error> {
        let members: Vec<DirectoryObject> = self
            .collect(&format!("groups/{group}/members"), MEMBER_SELECT, usize::MAX)
            .await?;
        Ok(members.into_iter().map(MemberRef::from).collect())
    }

    async fn group_owners(&self, group: &str) -> Result<Vec<MemberRef>, Error> {
        let owners: Vec<DirectoryObject> = self
            .collect(&format!("groups/{group}/owners"), MEMBER_SELECT, usize::MAX)
            .await?;
        Ok(owners.into_iter().map(MemberRef::from).collect())
    }

    async fn add_member(&self, user: &str, group: &str) -> Result<(), Error> {
        let payload = json!({ "@odata.id": self.object_url(&format!("users/{user}"))? });
        let req = self
            .post(&format!("groups/{group}/members/$ref"))
            .body_json(&payload)
            .map_err(Error::msg)?;
        self.expect_ok(req).await
    }

    async fn remove_member(&self, user: &str, group: &str) -> Result<(), Error> {
        self.expect_ok(self.delete(&format!("groups/{group}/members/{user}/$ref")))
            .await
    }

    async fn assign_owner(&self, owner: &str, group: &str) -> Result<(), Error> {
        let payload = json!({ "@odata.id": self.object_url(&format!("users/{owner}"))? });
        let req = self
            .post(&format!("groups/{group}/owners/$ref"))
            .body_json(&payload)
            .map_err(Error::msg)?;
        self.expect_ok(req).await
    }

    async fn privileged_users(&self) -> Result<Vec<MemberRef>, Error> {
        let members: Vec<DirectoryObject> = self
            .collect(
                &format!("directoryRoles/{GLOBAL_ADMIN_ROLE}/members"),
                MEMBER_SELECT,
                usize::MAX,
            )
            .await?;
        Ok(members.into_iter().map(MemberRef::from).collect())
    }
}

/// Extract an error from a failed Graph response.
async fn graph_error(res: &mut surf::Response) -> Error {
    let status = res.status();
    let message = match res.body_json::<GraphErrorBody>().await {
        Ok(body) => format!("{}: {}", body.error.code, body.error.message),
        Err(_) => "unreadable error body".into(),
    };
    Error::msg(format!("Graph API error ({status}): {message}"))
}

#[derive(Serialize)]
struct TokenForm<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    scope: &'a str,
    grant_type: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// One page of a Graph collection response.
#[derive(Clone, Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next: Option<String>,
}

/// The body of a failed Graph response.
#[derive(Clone, Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphErrorDetail,
}

#[derive(Clone, Debug, Deserialize)]
struct GraphErrorDetail {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// A user as returned by the `users` endpoints.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphUser {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    user_principal_name: Option<String>,
    #[serde(default)]
    account_enabled: Option<bool>,
    #[serde(default)]
    department: Option<String>,
    #[serde(default)]
    job_title: Option<String>,
    #[serde(default)]
    user_type: Option<String>,
    #[serde(default)]
    sign_in_activity: Option<SignInActivity>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignInActivity {
    #[serde(default)]
    last_sign_in_date_time: Option<DateTime<Utc>>,
}

impl From<GraphUser> for User {
    fn from(user: GraphUser) -> Self {
        Self {
            id: user.id,
            display_name: user.display_name.unwrap_or_default(),
            upn: user.user_principal_name.unwrap_or_default(),
            // Graph omits accountEnabled for callers without the directory read grant; treat
            // those accounts as enabled rather than flagging them in audits.
            enabled: user.account_enabled.unwrap_or(true),
            department: user.department,
            title: user.job_title,
            guest: user.user_type.as_deref() == Some("Guest"),
            last_sign_in: user
                .sign_in_activity
                .and_then(|activity| activity.last_sign_in_date_time),
            password_never_expires: false,
            locked_out: false,
            service_account: false,
            member_of: vec![],
        }
    }
}

/// A group as returned by the `groups` endpoints.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct GraphGroup {
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    mail_nickname: Option<String>,
    #[serde(default)]
    security_enabled: Option<bool>,
    #[serde(default)]
    created_date_time: Option<DateTime<Utc>>,
}

impl From<GraphGroup> for Group {
    fn from(group: GraphGroup) -> Self {
        Self {
            id: group.id,
            display_name: group.display_name.unwrap_or_default(),
            description: group.description,
            mail_nickname: group.mail_nickname,
            security_enabled: group.security_enabled.unwrap_or(false),
            created: group.created_date_time,
        }
    }
}

/// A directory object appearing in membership and ownership lists.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct DirectoryObject {
    #[serde(rename = "@odata.type", default)]
    odata_type: Option<String>,
    id: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    user_principal_name: Option<String>,
    #[serde(default)]
    mail_nickname: Option<String>,
    #[serde(default)]
    account_enabled: Option<bool>,
}

impl From<DirectoryObject> for MemberRef {
    fn from(object: DirectoryObject) -> Self {
        let kind = match object.odata_type.as_deref() {
            Some(ty) if ty.ends_with(".group") => MemberKind::Group,
            _ => MemberKind::User,
        };
        Self {
            id: object.id,
            display_name: object.display_name.unwrap_or_default(),
            name: object
                .user_principal_name
                .or(object.mail_nickname)
                .unwrap_or_default(),
            kind,
            enabled: object.account_enabled.unwrap_or(true),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_user() {
        let user: GraphUser = serde_json::from_value(serde_json::json!({
            "id": "5ab91b2d",
            "displayName": "Jane Doe",
            "userPrincipalName": "jdoe@contoso.com",
            "accountEnabled": true,
            "userType": "Guest",
            "signInActivity": { "lastSignInDateTime": "2024-01-15T08:30:00Z" },
        }))
        .unwrap();
        let user = User::from(user);
        assert_eq!(user.display_name, "Jane Doe");
        assert!(user.guest);
        assert!(user.enabled);
        assert_eq!(
            user.last_sign_in.unwrap().to_rfc3339(),
            "2024-01-15T08:30:00+00:00"
        );
    }

    #[test]
    fn test_parse_page_with_next_link() {
        let page: Page<GraphGroup> = serde_json::from_value(serde_json::json!({
            "value": [
                { "id": "g1", "displayName": "Engineering", "securityEnabled": true },
            ],
            "@odata.nextLink": "https://graph.microsoft.com/v1.0/groups?$skiptoken=abc",
        }))
        .unwrap();
        assert_eq!(page.value.len(), 1);
        assert!(page.next.is_some());
    }

    #[test]
    fn test_member_kind_from_odata_type() {
        let member: DirectoryObject = serde_json::from_value(serde_json::json!({
            "@odata.type": "#microsoft.graph.group",
            "id": "g2",
            "mailNickname": "eng",
        }))
        .unwrap();
        let member = MemberRef::from(member);
        assert_eq!(member.kind, MemberKind::Group);
        assert_eq!(member.name, "eng");
        assert!(member.enabled);
    }
}
