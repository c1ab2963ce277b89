use anyhow::Error;
use clap::Parser;
use model::{
    assistant::DocStore,
    directory::{entra, ldap, AdDirectory},
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

mod api;
mod test_runner;

/// Start the IAM agents server.
#[derive(Clone, Debug, Parser)]
struct Options {
    /// The port where the API should be served.
    #[clap(short, long, env = "IAM_PORT", default_value = "8000")]
    port: u16,

    /// The directory of IAM documentation for the assistant.
    #[clap(long, env = "IAM_DOCS_DIR", default_value = "docs")]
    docs: PathBuf,

    /// How long the dashboard cache stays fresh, in seconds.
    #[clap(long, env = "IAM_DASHBOARD_TTL", default_value = "21600")]
    dashboard_ttl: u64,

    #[clap(flatten)]
    entra: entra::Options,

    #[clap(flatten)]
    ad: ldap::Options,
}

impl Options {
    async fn serve(self) -> Result<(), Error> {
        let entra = self.entra.connect().await?;
        let ad = AdDirectory::new(self.ad);
        let docs = DocStore::open(&self.docs)?;
        let app = api::App::new(
            Arc::new(entra),
            Arc::new(ad),
            docs,
            Duration::from_secs(self.dashboard_ttl),
        );
        api::serve(app, self.port).await
    }
}

#[async_std::main]
async fn main() -> Result<(), Error> {
    model::init_logging();
    Options::parse().serve().await
}
