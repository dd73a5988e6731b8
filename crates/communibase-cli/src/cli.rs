//! Exposes the command line application.
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use communibase_connector::config::Config;
use communibase_connector::{Connector, DocumentReference, Params, metrics};
use futures::TryStreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::logging;

/// Communibase commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch a single object.
    Get {
        entity_type: String,
        object_id: String,
        /// Fetch this historic version instead of the current one.
        #[arg(long)]
        version: Option<String>,
        #[command(flatten)]
        query: QueryArgs,
    },

    /// Search objects with a JSON selector.
    Search {
        entity_type: String,
        /// The selector, e.g. `{"firstName": "Henk"}`. Omit to list all objects.
        selector: Option<String>,
        /// Only print the ids of the matching objects.
        #[arg(long)]
        ids: bool,
        /// Include the paging metadata in the output.
        #[arg(long, conflicts_with = "ids")]
        metadata: bool,
        #[command(flatten)]
        query: QueryArgs,
    },

    /// Run an aggregation pipeline.
    Aggregate {
        entity_type: String,
        /// The pipeline as a JSON array of stages.
        pipeline: String,
    },

    /// Create or update an object from a JSON document.
    Save { entity_type: String, document: String },

    /// Delete an object.
    Destroy {
        entity_type: String,
        object_id: String,
    },

    /// Restore a deleted object.
    Undelete {
        entity_type: String,
        object_id: String,
    },

    /// List the versions of an object.
    History {
        entity_type: String,
        object_id: String,
    },

    /// Resolve a JSON document reference.
    Resolve { reference: String },

    /// Finalize an invoice.
    Finalize { invoice_id: String },

    /// Download a stored file.
    Download {
        file_id: String,
        /// Write the file here instead of to `stdout`.
        #[arg(long, short, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Args)]
struct QueryArgs {
    /// Space separated fields to return, e.g. `"firstName lastName"`.
    #[arg(long)]
    fields: Option<String>,
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long)]
    page: Option<u32>,
    /// Sort specification, e.g. `lastName` or `-lastName`.
    #[arg(long)]
    sort: Option<String>,
}

impl QueryArgs {
    fn params(&self) -> Option<Params> {
        let mut params = Params::new();
        if let Some(fields) = &self.fields {
            params.insert("fields", fields);
        }
        if let Some(limit) = self.limit {
            params.insert("limit", limit);
        }
        if let Some(page) = self.page {
            params.insert("page", page);
        }
        if let Some(sort) = &self.sort {
            params.insert("sort", sort);
        }
        (!params.is_empty()).then_some(params)
    }
}

/// Command line interface parser.
///
/// The API key is read from the configuration file or the `COMMUNIBASE_KEY` environment
/// variable.
#[derive(Debug, Parser)]
#[command(name = "communibase", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Authenticate with this access token in addition to the API key.
    #[arg(long, global = true)]
    access_token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config()).context("failed loading config")?;
    config
        .apply_env_overrides()
        .context("failed applying environment overrides")?;
    if cli.access_token.is_some() {
        config.access_token = cli.access_token.clone();
    }

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    logging::init_logging(&config);
    if let Some(ref statsd) = config.metrics.statsd {
        let host_tag = config.service_url.host_str().map(str::to_owned);
        metrics::configure_statsd(&config.metrics.prefix, statsd, host_tag)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("communibase")
        .enable_all()
        .build()
        .context("failed to create the runtime")?;
    let connector = Connector::new(config, runtime.handle().clone())?;

    runtime.block_on(run(connector, cli.command))
}

async fn run(connector: Connector, command: Command) -> Result<()> {
    let output = match command {
        Command::Get {
            entity_type,
            object_id,
            version,
            query,
        } => {
            let params = query.params();
            connector
                .get_by_id(entity_type, &object_id, params.as_ref(), version.as_deref())
                .await?
        }
        Command::Search {
            entity_type,
            selector,
            ids,
            metadata,
            query,
        } => {
            let selector = match selector {
                Some(selector) => parse_json(&selector, "selector")?,
                None => Value::Object(Default::default()),
            };
            let params = query.params();
            if ids {
                Value::from(
                    connector
                        .get_ids(entity_type, &selector, params.as_ref())
                        .await?,
                )
            } else if metadata {
                let page = connector
                    .search_page(entity_type, &selector, params.as_ref())
                    .await?;
                serde_json::json!({"metadata": page.metadata, "records": page.records})
            } else {
                Value::Array(
                    connector
                        .search(entity_type, &selector, params.as_ref())
                        .await?,
                )
            }
        }
        Command::Aggregate {
            entity_type,
            pipeline,
        } => {
            let pipeline = parse_json(&pipeline, "pipeline")?;
            connector.aggregate(entity_type, &pipeline).await?
        }
        Command::Save {
            entity_type,
            document,
        } => {
            let document = parse_json(&document, "document")?;
            connector.update(entity_type, document).await?
        }
        Command::Destroy {
            entity_type,
            object_id,
        } => connector.destroy(entity_type, &object_id).await?,
        Command::Undelete {
            entity_type,
            object_id,
        } => connector.undelete(entity_type, &object_id).await?,
        Command::History {
            entity_type,
            object_id,
        } => Value::Array(connector.get_history(entity_type, &object_id).await?),
        Command::Resolve { reference } => {
            let reference: DocumentReference =
                serde_json::from_str(&reference).context("invalid document reference")?;
            connector.get_by_ref(&reference, None).await?
        }
        Command::Finalize { invoice_id } => connector.finalize_invoice(&invoice_id).await?,
        Command::Download { file_id, output } => {
            return download(&connector, &file_id, output.as_deref()).await;
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn download(connector: &Connector, file_id: &str, output: Option<&Path>) -> Result<()> {
    let mut writer: Box<dyn tokio::io::AsyncWrite + Unpin> = match output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("failed to create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let mut chunks = connector.read_file(file_id);
    let mut written = 0;
    while let Some(chunk) = chunks.try_next().await? {
        writer.write_all(&chunk).await?;
        written += chunk.len();
    }
    writer.flush().await?;

    tracing::info!(file_id, bytes = written, "Downloaded file");
    Ok(())
}

fn parse_json(input: &str, what: &str) -> Result<Value> {
    serde_json::from_str(input).with_context(|| format!("invalid JSON {what}"))
}
