use clap::Parser;
use model::{
    assistant::{Assistant, DocStore},
    dashboard::Dashboard,
    directory::{entra, ldap, AdDirectory},
    events::Observer,
    init_logging, orchestrator,
};
use std::path::PathBuf;

/// Operate on the identity directories from the command line.
#[derive(Parser)]
enum Command {
    /// Run an operation against the Entra ID tenant.
    Entra {
        #[clap(flatten)]
        opt: entra::Options,

        #[clap(subcommand)]
        op: orchestrator::Command,
    },
    /// Run an operation against the Active Directory domain.
    Ad {
        #[clap(flatten)]
        opt: ldap::Options,

        #[clap(subcommand)]
        op: orchestrator::Command,
    },
    /// Collect the security dashboard from both directories.
    Dashboard {
        #[clap(flatten)]
        entra: entra::Options,

        #[clap(flatten)]
        ad: ldap::Options,
    },
    /// Ask the documentation assistant a question.
    Ask {
        /// The directory of IAM documentation to answer from.
        #[clap(short, long, env = "IAM_DOCS_DIR", default_value = "docs")]
        docs: PathBuf,

        question: String,
    },
}

#[async_std::main]
async fn main() -> Result<(), anyhow::Error> {
    init_logging();

    let output = match Command::parse() {
        Command::Entra { opt, op } => {
            let dir = opt.connect().await?;
            orchestrator::run(&dir, op).await?
        }
        Command::Ad { opt, op } => {
            let dir = AdDirectory::new(opt);
            orchestrator::run(&dir, op).await?
        }
        Command::Dashboard { entra, ad } => {
            let entra = entra.connect().await?;
            let ad = AdDirectory::new(ad);
            serde_json::to_value(Dashboard::build(&entra, &ad).await?)?
        }
        Command::Ask { docs, question } => {
            let assistant = Assistant::new(DocStore::open(docs)?, Observer::new());
            serde_json::to_value(assistant.ask(&question))?
        }
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    Ok(())
}
