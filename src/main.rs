// Declare modules before use
mod batch;
mod config;
mod email_sender;
mod logging;

use anyhow::{Context, Result};
use batch::{Batch, ConsolePacer, EmlArchive, Options};
use clap::{ArgAction, Parser};
use crate::config::{Campaign, SmtpConfig};
use email_sender::template::EmailTemplate;
use email_sender::SmtpDeliverer;
use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "xmailgun",
    about = "Send one templated mail per recipient over SMTP",
    version,
    disable_version_flag = true
)]
struct Cli {
    /// Configuration file for the smtp connection (json or toml)
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// Task file (json or toml)
    #[arg(long, value_name = "FILE")]
    task: PathBuf,

    /// Output directory for storing .eml files
    #[arg(long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Do not actually send mails
    #[arg(long = "dryrun", visible_alias = "dry-run")]
    dry_run: bool,

    /// Append-only debug log
    #[arg(long, value_name = "FILE", default_value = "xmailgun.log")]
    log_file: PathBuf,

    /// Print version and exit
    #[arg(short = 'v', long, action = ArgAction::Version)]
    version: Option<bool>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // --- Load .env file before any config is read ---
    let dotenv = dotenvy::dotenv();

    if let Err(e) = logging::init(Some(&cli.log_file)) {
        eprintln!("Error: {e:#}");
        return ExitCode::FAILURE;
    }

    match dotenv {
        Ok(path) => log::debug!("Loaded .env file from: {:?}", path),
        Err(_) => log::debug!("No .env file loaded, relying on config files and environment"),
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    log::debug!("Starting the application...");

    // Everything is loaded and checked before the first mail goes out.
    let smtp = SmtpConfig::load(&cli.config)?;
    let campaign = Campaign::load(&cli.task)?;
    let recipients = crate::config::load_recipients(&campaign.recipient_file)?;
    let template = EmailTemplate::load(&campaign.body_template)?;
    let pacing = campaign.pacing(cli.dry_run);

    let archive = cli
        .output
        .as_deref()
        .map(EmlArchive::create)
        .transpose()
        .with_context(|| format!("output directory {:?} is not usable", cli.output))?;

    let deliverer = SmtpDeliverer::new(smtp)?;
    let mails = batch::expand(&campaign, &recipients, &template)?;

    let mut pacer = ConsolePacer;
    let options = Options {
        dry_run: cli.dry_run,
        archive,
        pacing,
    };
    let processed = Batch::new(&deliverer, &mut pacer, io::stdout(), options)
        .run(&campaign, &mails)
        .await?;

    log::info!(
        "Task \"{}\" finished: {} mail(s) {}",
        campaign.name,
        processed,
        if cli.dry_run { "rendered" } else { "sent" }
    );
    Ok(())
}
