//! The JSON API exposed by the server.

use anyhow::Error;
use model::{
    assistant::{Assistant, DocStore},
    dashboard::DashboardCache,
    directory::Directory,
    events::Observer,
    orchestrator::{ProvisionRequest, Router, Target},
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tide::{Body, Request, Response, StatusCode};

/// Shared state for the API handlers.
#[derive(Clone)]
pub struct App {
    entra: Arc<dyn Directory>,
    ad: Arc<dyn Directory>,
    router: Router,
    assistant: Assistant,
    dashboard: Arc<DashboardCache>,
    events: Observer,
}

impl App {
    pub fn new(
        entra: Arc<dyn Directory>,
        ad: Arc<dyn Directory>,
        docs: DocStore,
        dashboard_ttl: Duration,
    ) -> Self {
        let events = Observer::new();
        Self {
            entra,
            ad,
            router: Router::new(events.clone()),
            assistant: Assistant::new(docs, events.clone()),
            dashboard: Arc::new(DashboardCache::new(dashboard_ttl)),
            events,
        }
    }

    fn target(&self, target: Target) -> &dyn Directory {
        match target {
            Target::Entra => &*self.entra,
            Target::Ad => &*self.ad,
        }
    }
}

/// Serve the API on the given port until the process exits.
pub async fn serve(app: App, port: u16) -> Result<(), Error> {
    let mut server = tide::with_state(app);
    server.at("/").get(health);
    server.at("/api/provision").post(provision);
    server.at("/api/assistant").post(assistant);
    server.at("/api/dashboard").get(dashboard);
    server.at("/api/events").get(events);
    tracing::info!(port, "serving IAM agents API");
    server.listen(format!("0.0.0.0:{port}")).await?;
    Ok(())
}

async fn health(_req: Request<App>) -> tide::Result<String> {
    Ok("IAM agents are running".into())
}

async fn provision(mut req: Request<App>) -> tide::Result {
    let request: ProvisionRequest = match req.body_json().await {
        Ok(request) => request,
        Err(err) => return error(StatusCode::UnprocessableEntity, err),
    };
    let app = req.state();
    let target = request.target;
    match app.router.dispatch(app.target(target), request).await {
        Ok(reply) => Ok(Body::from_json(&reply)?.into()),
        Err(err) => error(StatusCode::BadRequest, err),
    }
}

#[derive(Deserialize)]
struct Question {
    question: String,
}

async fn assistant(mut req: Request<App>) -> tide::Result {
    let Question { question } = match req.body_json().await {
        Ok(question) => question,
        Err(err) => return error(StatusCode::UnprocessableEntity, err),
    };
    let answer = req.state().assistant.ask(&question);
    Ok(Body::from_json(&json!({ "action": "iam_query", "result": answer }))?.into())
}

async fn dashboard(req: Request<App>) -> tide::Result {
    let app = req.state();
    match app.dashboard.fetch(&*app.entra, &*app.ad).await {
        Ok(dashboard) => Ok(Body::from_json(&*dashboard)?.into()),
        Err(err) => error(StatusCode::InternalServerError, err),
    }
}

async fn events(req: Request<App>) -> tide::Result {
    Ok(Body::from_json(&req.state().events.drain())?.into())
}

fn error(status: StatusCode, err: impl std::fmt::Display) -> tide::Result {
    let mut res = Response::new(status);
    res.set_body(Body::from_json(&json!({
        "status": "error",
        "message": err.to_string(),
    }))?);
    Ok(res)
}
