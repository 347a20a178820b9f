mod actions;
mod config;
mod error;
mod icloud_client;
mod library;
mod model;
mod prompt;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use git_version::git_version;

use crate::actions::{DeleteOptions, delete_before, download_before};
use crate::config::Config;
use crate::icloud_client::ICloudClient;
use crate::library::Cutoff;
use crate::prompt::StdPrompt;

pub const GIT_VERSION: &str = git_version!(fallback = "unknown");

/// Download or delete iCloud photos from a given date back to the earliest item.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML config file with iCloud credentials
    #[clap(long, default_value = "config.yaml")]
    config: PathBuf,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download all photos taken on or before a given date.
    Download {
        /// The date (YYYY-MM-DD). Downloads photos taken on or before this date.
        #[clap(long)]
        date: Cutoff,

        /// Directory to store downloaded photos
        #[clap(long, default_value = "downloads")]
        output_dir: PathBuf,
    },
    /// Delete all photos taken on or before a given date.
    Delete {
        /// The date (YYYY-MM-DD). Deletes photos taken on or before this date.
        #[clap(long)]
        date: Cutoff,

        /// Do not ask for confirmation
        #[clap(short, long)]
        yes: bool,

        /// List the photos that would be deleted without deleting them
        #[clap(long)]
        dry_run: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    println!("iCloud Photos Cleaner");
    println!("{GIT_VERSION}");

    let config = Config::load(&args.config)?;
    let mut prompt = StdPrompt;
    let mut client = ICloudClient::new(&config.icloud)?;
    client
        .login(&mut prompt)
        .await
        .context("Could not log in to iCloud")?;

    match args.command {
        Command::Download { date, output_dir } => {
            println!("Listing library. This may take several minutes...");
            download_before(&client, date, &output_dir).await?;
        }
        Command::Delete { date, yes, dry_run } => {
            let options = DeleteOptions {
                assume_yes: yes,
                dry_run,
            };
            delete_before(&client, date, options, &mut prompt).await?;
        }
    }
    Ok(())
}
