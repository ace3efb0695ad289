use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Url;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use ngo_desk::blood::{self, BloodDesk};
use ngo_desk::config::{self, BackendKind, Config};
use ngo_desk::gateway::{Gateway, RestGateway, SqliteGateway};
use ngo_desk::model::RequestStatus;
use ngo_desk::notice::{Confirm, ConfirmPrompt};
use ngo_desk::outbox::{self, RetryPolicy};
use ngo_desk::resource::ResourceClient;
use ngo_desk::sender::{ChannelRouter, EmailApiSender, LogSender};
use ngo_desk::settings;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Deliver queued notifications
    Dispatch {
        /// Drain what is due and exit instead of polling forever
        #[arg(long)]
        once: bool,
    },
    /// Blood requests
    #[command(subcommand)]
    Requests(RequestsCmd),
    /// Blood donors
    #[command(subcommand)]
    Donors(DonorsCmd),
    /// Site settings
    #[command(subcommand)]
    Settings(SettingsCmd),
    /// Any backend table
    #[command(subcommand)]
    Records(RecordsCmd),
}

#[derive(Debug, Subcommand)]
enum RequestsCmd {
    List {
        #[arg(long)]
        status: Option<String>,
    },
    Approve { id: String },
    Reject { id: String },
    Fulfil { id: String },
    Cancel { id: String },
}

#[derive(Debug, Subcommand)]
enum DonorsCmd {
    List {
        /// Show only what public pages may show
        #[arg(long)]
        public: bool,
    },
    Available {
        id: String,
        #[arg(action = clap::ArgAction::Set)]
        available: bool,
    },
}

#[derive(Debug, Subcommand)]
enum SettingsCmd {
    Show,
    Set { key: String, value: String },
}

#[derive(Debug, Subcommand)]
enum RecordsCmd {
    List {
        table: String,
        /// Column to sort by, newest first (default: created_at)
        #[arg(long)]
        order: Option<String>,
        /// Sort ascending instead
        #[arg(long)]
        asc: bool,
    },
    Remove {
        table: String,
        id: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

/// Numeric ids stay numbers; anything else (uuids) is a string.
fn parse_id(raw: &str) -> Value {
    raw.parse::<i64>()
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_status(raw: &str) -> Result<RequestStatus> {
    serde_json::from_value(Value::String(raw.trim().to_ascii_lowercase()))
        .with_context(|| format!("unknown request status '{}'", raw))
}

async fn connect(cfg: &Config) -> Result<Arc<dyn Gateway>> {
    match cfg.backend.kind {
        BackendKind::Rest => {
            let url = Url::parse(&cfg.backend.url)?;
            Ok(Arc::new(RestGateway::new(url, cfg.backend.api_key.clone())?))
        }
        BackendKind::Sqlite => {
            let gateway = SqliteGateway::connect(&cfg.database_url()).await?;
            gateway.migrate().await?;
            Ok(Arc::new(gateway))
        }
    }
}

fn build_router(cfg: &Config) -> Result<ChannelRouter> {
    let mut router = ChannelRouter {
        sms: Some(Arc::new(LogSender)),
        push: Some(Arc::new(LogSender)),
        ..Default::default()
    };
    if let Some(email) = &cfg.email {
        let sender = EmailApiSender::new(
            Url::parse(&email.api_url)?,
            email.api_key.clone(),
            email.from.clone(),
        )?;
        router.email = Some(Arc::new(sender));
    }
    Ok(router)
}

struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&self, prompt: &ConfirmPrompt) -> bool {
        eprint!("{} {} [y/N] ", prompt.title, prompt.description);
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).is_ok()
            && matches!(line.trim(), "y" | "Y" | "yes")
    }
}

async fn dispatch(cfg: &Config, gateway: Arc<dyn Gateway>, once: bool) -> Result<()> {
    let router = build_router(cfg)?;
    let policy = RetryPolicy {
        max_attempts: i64::from(cfg.app.max_attempts),
        max_backoff_secs: cfg.app.max_backoff_seconds as i64,
    };
    if once {
        let processed = outbox::drain(gateway.as_ref(), &router, policy).await?;
        info!(processed, "notification queue drained");
        return Ok(());
    }

    let poll_sleep = Duration::from_millis(cfg.app.poll_interval_ms);
    info!("starting notification dispatcher");
    loop {
        match outbox::process_next(gateway.as_ref(), &router, policy).await {
            Ok(processed) => {
                if !processed {
                    tokio::time::sleep(poll_sleep).await;
                }
            }
            Err(err) => {
                error!(?err, "dispatcher error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn requests(cfg: &Config, gateway: Arc<dyn Gateway>, cmd: RequestsCmd) -> Result<()> {
    let desk = BloodDesk::new(gateway, cfg.admin.email.clone());
    match cmd {
        RequestsCmd::List { status } => {
            let status = status.as_deref().map(parse_status).transpose()?;
            for r in desk.list_requests(status).await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    r.id,
                    r.status,
                    r.blood_group,
                    r.patient_name,
                    r.hospital.as_deref().unwrap_or("-")
                );
            }
        }
        RequestsCmd::Approve { id } => {
            let request = desk.get_request(&parse_id(&id)).await?;
            let report = desk.approve_request(&request).await?;
            println!("{}", report.summary());
            if let Some(err) = report.enqueue_error {
                println!("warning: donor notifications were not queued: {}", err);
            }
        }
        RequestsCmd::Reject { id } => {
            let request = desk.get_request(&parse_id(&id)).await?;
            desk.reject_request(&request).await?;
        }
        RequestsCmd::Fulfil { id } => {
            let request = desk.get_request(&parse_id(&id)).await?;
            desk.fulfil_request(&request).await?;
        }
        RequestsCmd::Cancel { id } => {
            let request = desk.get_request(&parse_id(&id)).await?;
            desk.cancel_request(&request).await?;
        }
    }
    Ok(())
}

async fn donors(cfg: &Config, gateway: Arc<dyn Gateway>, cmd: DonorsCmd) -> Result<()> {
    let desk = BloodDesk::new(gateway, cfg.admin.email.clone());
    match cmd {
        DonorsCmd::List { public: true } => {
            let donors = desk.list_donors().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&blood::public_donors(&donors))?
            );
        }
        DonorsCmd::List { public: false } => {
            for d in desk.list_donors().await? {
                let availability = if d.is_unavailable() { "unavailable" } else { "available" };
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    d.id,
                    d.blood_group,
                    d.full_name,
                    d.phone().unwrap_or("-"),
                    availability
                );
            }
        }
        DonorsCmd::Available { id, available } => {
            desk.set_donor_availability(&parse_id(&id), available).await?;
        }
    }
    Ok(())
}

async fn settings_cmd(gateway: Arc<dyn Gateway>, cmd: SettingsCmd) -> Result<()> {
    match cmd {
        SettingsCmd::Show => {
            let current = settings::load(gateway.as_ref()).await?;
            println!("{}", serde_json::to_string_pretty(&current)?);
        }
        SettingsCmd::Set { key, value } => {
            settings::save(gateway.as_ref(), &key, &value).await?;
            info!(key = %settings::canonical_key(&key), "setting saved");
        }
    }
    Ok(())
}

async fn records(gateway: Arc<dyn Gateway>, cmd: RecordsCmd) -> Result<()> {
    match cmd {
        RecordsCmd::List { table, order, asc } => {
            let mut client = ResourceClient::new(gateway, table);
            if let Some(column) = order {
                client = client.order_by(&column, asc);
            }
            for row in client.list().await? {
                println!("{}", Value::Object(row.clone()));
            }
        }
        RecordsCmd::Remove { table, id, yes } => {
            let mut client = ResourceClient::new(gateway, table);
            let confirm: Box<dyn Confirm> = if yes {
                Box::new(ngo_desk::notice::AutoConfirm(true))
            } else {
                Box::new(StdinConfirm)
            };
            let token = client
                .remove(&parse_id(&id), &ConfirmPrompt::default(), confirm.as_ref())
                .await?;
            if let Some(token) = token {
                println!("deleted: {}", Value::Object(token.record().clone()));
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;
    let gateway = connect(&cfg).await?;

    match args.command {
        Command::Dispatch { once } => dispatch(&cfg, gateway, once).await,
        Command::Requests(cmd) => requests(&cfg, gateway, cmd).await,
        Command::Donors(cmd) => donors(&cfg, gateway, cmd).await,
        Command::Settings(cmd) => settings_cmd(gateway, cmd).await,
        Command::Records(cmd) => records(gateway, cmd).await,
    }
}
