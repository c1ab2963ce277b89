#![cfg(test)]

//! End-to-end tests for the JSON API.
//!
//! This runner seeds a pair of in-memory directories, starts a server against them, and walks
//! through a scripted sequence of API calls with a real HTTP client. The cases run in order,
//! since later cases depend on state (and events) left behind by earlier ones.

use crate::api::{self, App};
use ansi_term::Color;
use anyhow::{ensure, Error};
use async_std::task::{sleep, spawn};
use futures::future::BoxFuture;
use futures::FutureExt;
use model::{
    assistant::{DocStore, REFUSAL},
    directory::{mock::MockDirectory, Group, User},
};
use portpicker::pick_unused_port;
use serde_json::{json, Value};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use surf::{http::StatusCode, Client};

#[async_std::test]
async fn api_test_cases() -> Result<(), Error> {
    model::init_logging();

    // Seed the directories.
    let entra = MockDirectory::create();
    let jane = entra
        .seed_user(User {
            display_name: "Jane Doe".into(),
            upn: "jdoe@example.com".into(),
            enabled: true,
            ..Default::default()
        })
        .await;
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

    let mut docs = DocStore::default();
    docs.insert(
        "mfa.md",
        "To require multi-factor authentication, create a conditional access policy targeting \
         all users.",
    );

    // Start the server.
    let port = pick_unused_port().unwrap();
    let app = App::new(
        Arc::new(entra),
        Arc::new(ad),
        docs,
        Duration::from_secs(3600),
    );
    spawn(async move {
        api::serve(app, port).await.unwrap();
        tracing::warn!("server exited");
    });

    // Connect a client.
    let client: Client = surf::Config::default()
        .set_base_url(format!("http://localhost:{port}").parse().unwrap())
        .try_into()
        .unwrap();
    wait_for_server(&client).await?;

    let cases: Vec<(&str, BoxFuture<Result<(), Error>>)> = vec![
        ("readiness", readiness(&client).boxed()),
        ("create_user", create_user(&client).boxed()),
        (
            "delete_needs_confirmation",
            delete_needs_confirmation(&client, &jane).boxed(),
        ),
        ("delete_confirmed", delete_confirmed(&client, &jane).boxed()),
        ("unknown_user", unknown_user(&client).boxed()),
        ("assistant", assistant(&client).boxed()),
        ("dashboard", dashboard(&client).boxed()),
        ("events", events(&client).boxed()),
    ];

    let mut results = vec![];
    for (name, case) in cases {
        results.push(TestResult {
            name,
            failure: case.await.err(),
        });
    }
    for result in &results {
        println!("{}", result);
    }
    if results.iter().any(TestResult::failed) {
        Err(Error::msg(format!("{}", Color::Red.paint("tests failed"))))
    } else {
        println!("All test cases passed.");
        Ok(())
    }
}

async fn readiness(client: &Client) -> Result<(), Error> {
    let res = client.get("/").await.map_err(Error::msg)?;
    ensure!(res.status() == StatusCode::Ok, "status {}", res.status());
    Ok(())
}

async fn create_user(client: &Client) -> Result<(), Error> {
    let reply = provision(
        client,
        json!({
            "target": "entra",
            "command": "create_user",
            "display_name": "New Hire",
            "upn": "nhire@example.com",
            "password": "hunter2!",
        }),
    )
    .await?;
    ensure!(reply["action"] == "provision", "reply: {reply}");
    ensure!(
        reply["result"]["display_name"] == "New Hire",
        "reply: {reply}"
    );
    Ok(())
}

async fn delete_needs_confirmation(client: &Client, user: &str) -> Result<(), Error> {
    let reply = provision(
        client,
        json!({ "target": "entra", "command": "delete_user", "user": user }),
    )
    .await?;
    ensure!(
        reply["result"]["status"] == "needs_confirmation",
        "reply: {reply}"
    );

    // The user must not have been deleted.
    let reply = provision(
        client,
        json!({ "target": "entra", "command": "get_user", "user": user }),
    )
    .await?;
    ensure!(reply["result"]["id"] == user, "reply: {reply}");
    Ok(())
}

async fn delete_confirmed(client: &Client, user: &str) -> Result<(), Error> {
    let reply = provision(
        client,
        json!({
            "target": "entra",
            "command": "delete_user",
            "user": user,
            "confirm": true,
        }),
    )
    .await?;
    ensure!(reply["result"]["status"] == "ok", "reply: {reply}");
    Ok(())
}

async fn unknown_user(client: &Client) -> Result<(), Error> {
    let mut res = client
        .post("/api/provision")
        .body_json(&json!({ "target": "entra", "command": "get_user", "user": "nobody" }))
        .map_err(Error::msg)?
        .send()
        .await
        .map_err(Error::msg)?;
    ensure!(
        res.status() == StatusCode::BadRequest,
        "status {}",
        res.status()
    );
    let body: Value = res.body_json().await.map_err(Error::msg)?;
    ensure!(body["status"] == "error", "body: {body}");
    ensure!(
        body["message"].as_str().unwrap_or_default().contains("nobody"),
        "body: {body}"
    );
    Ok(())
}

async fn assistant(client: &Client) -> Result<(), Error> {
    let mut res = client
        .post("/api/assistant")
        .body_json(&json!({ "question": "How do I set up conditional access?" }))
        .map_err(Error::msg)?
        .send()
        .await
        .map_err(Error::msg)?;
    let body: Value = res.body_json().await.map_err(Error::msg)?;
    ensure!(body["action"] == "iam_query", "body: {body}");
    ensure!(
        body["result"]["sources"] == json!(["mfa.md"]),
        "body: {body}"
    );

    let mut res = client
        .post("/api/assistant")
        .body_json(&json!({ "question": "favorite pizza toppings?" }))
        .map_err(Error::msg)?
        .send()
        .await
        .map_err(Error::msg)?;
    let body: Value = res.body_json().await.map_err(Error::msg)?;
    ensure!(body["result"]["response"] == REFUSAL, "body: {body}");
    Ok(())
}

async fn dashboard(client: &Client) -> Result<(), Error> {
    let mut res = client.get("/api/dashboard").await.map_err(Error::msg)?;
    let body: Value = res.body_json().await.map_err(Error::msg)?;
    ensure!(
        body["entra"]["privileged_accounts"]["count"] == 1,
        "body: {body}"
    );
    ensure!(
        body["entra"]["ownerless_groups"]["count"] == 1,
        "body: {body}"
    );
    ensure!(
        body["ad"]["service_accounts"]["count"] == 1,
        "body: {body}"
    );
    Ok(())
}

async fn events(client: &Client) -> Result<(), Error> {
    let mut res = client.get("/api/events").await.map_err(Error::msg)?;
    let body: Value = res.body_json().await.map_err(Error::msg)?;
    let drained = body.as_array().cloned().unwrap_or_default();
    ensure!(!drained.is_empty(), "no events recorded");
    ensure!(
        drained
            .iter()
            .any(|event| event["operation"] == "needs_confirmation"),
        "missing confirmation event: {body}"
    );

    // Draining empties the stream.
    let mut res = client.get("/api/events").await.map_err(Error::msg)?;
    let body: Value = res.body_json().await.map_err(Error::msg)?;
    ensure!(body == json!([]), "stream not drained: {body}");
    Ok(())
}

async fn provision(client: &Client, body: Value) -> Result<Value, Error> {
    let mut res = client
        .post("/api/provision")
        .body_json(&body)
        .map_err(Error::msg)?
        .send()
        .await
        .map_err(Error::msg)?;
    ensure!(res.status() == StatusCode::Ok, "status {}", res.status());
    res.body_json().await.map_err(Error::msg)
}

struct TestResult {
    name: &'static str,
    failure: Option<Error>,
}

impl TestResult {
    fn failed(&self) -> bool {
        self.failure.is_some()
    }
}

impl Display for TestResult {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}...", self.name)?;
        if let Some(err) = &self.failure {
            writeln!(f, "{}", Color::Red.paint("FAILED"))?;
            write!(f, "{err}")?;
        } else {
            write!(f, "{}", Color::Green.paint("OK"))?;
        }
        Ok(())
    }
}

async fn wait_for_server(client: &Client) -> Result<(), Error> {
    const MAX_CONNECT_RETRIES: usize = 60;

    for _ in 0..MAX_CONNECT_RETRIES {
        match client.get("/").await {
            Ok(_) => return Ok(()),
            Err(err) => {
                tracing::warn!("waiting for server to start: {err}");
                sleep(Duration::from_secs(1)).await;
            }
        }
    }

    Err(Error::msg("timed out waiting for server"))
}
