use std::path::PathBuf;
use std::sync::atomic::Ordering;

use clap::{Parser, Subcommand};
use env_logger::Env;

use korgalore::config::{load_config, xdg_config_dir, xdg_data_dir};
use korgalore::error::{Error, Result};
use korgalore::feed::search;
use korgalore::pipeline::{Pipeline, PullOptions};
use korgalore::targets::Target;
use korgalore::tracking::{track_id_for_msgid, TrackingManifest};
use korgalore::{bozofilter, tracking};

#[derive(Parser)]
#[command(name = "korgalore", version, about = "Deliver public-inbox archives into your mailboxes")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long)]
    cfgfile: Option<PathBuf>,

    /// Increase log verbosity (-v: debug, -vv: trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Pull messages from configured feeds into their targets.
    Pull {
        /// Only run this delivery.
        delivery: Option<String>,
        /// Skip feed updates (useful with --force).
        #[arg(short = 'n', long)]
        no_update: bool,
        /// Run deliveries even if no apparent updates.
        #[arg(short, long)]
        force: bool,
    },
    /// Run interactive authentication for OAuth targets.
    Auth {
        /// Target to authenticate; all OAuth targets when omitted.
        target: Option<String>,
    },
    /// List labels or mailboxes available on a target.
    Labels { target: String },
    /// Manage tracked threads.
    #[command(subcommand)]
    Track(TrackCommand),
    /// Show or extend the bozofilter.
    Bozofilter {
        /// Addresses to add; lists the filter when omitted.
        addresses: Vec<String>,
        /// Reason recorded alongside new entries.
        #[arg(long)]
        reason: Option<String>,
    },
}

#[derive(Subcommand)]
enum TrackCommand {
    /// Start tracking a thread by message id.
    Add {
        /// Message id, with or without angle brackets, or a lore URL.
        msgid: String,
        /// Target to deliver the thread to.
        #[arg(short, long)]
        target: String,
        /// Labels to apply.
        #[arg(short, long)]
        labels: Vec<String>,
    },
    /// List tracked threads.
    List {
        /// Include inactive and paused threads.
        #[arg(long)]
        inactive: bool,
    },
    /// Stop tracking a thread.
    Stop {
        track_id: String,
        /// Also forget the lei search and delete its data.
        #[arg(long)]
        delete: bool,
    },
    /// Pause a tracked thread.
    Pause { track_id: String },
    /// Resume a paused or inactive thread.
    Resume { track_id: String },
}

/// Accept a bare message id, `<id>`, or a lore.kernel.org URL.
fn extract_msgid(input: &str) -> String {
    let input = input.trim();
    if let Some(rest) = input
        .strip_prefix("https://lore.kernel.org/")
        .or_else(|| input.strip_prefix("http://lore.kernel.org/"))
    {
        let parts: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
        if let Some(last) = parts.last() {
            if !last.is_empty() && last.contains('@') {
                return last.to_string();
            }
        }
        if parts.len() >= 2 {
            return parts[1].to_string();
        }
    }
    input.trim_matches(|c| c == '<' || c == '>').to_string()
}

async fn run(cli: Cli) -> Result<()> {
    let config_dir = xdg_config_dir();
    let data_dir = xdg_data_dir();
    let cfgfile = cli
        .cfgfile
        .clone()
        .unwrap_or_else(|| config_dir.join("korgalore.toml"));

    match cli.command {
        Command::Pull {
            delivery,
            no_update,
            force,
        } => {
            let config = load_config(&cfgfile)?;
            let mut pipeline = Pipeline::new(config, config_dir, data_dir.clone(), true)?;

            let cancel = pipeline.cancel_flag();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("interrupt received, finishing current message");
                    cancel.store(true, Ordering::Relaxed);
                }
            });

            let outcome = pipeline
                .perform_pull(&PullOptions {
                    no_update,
                    force,
                    delivery: delivery.clone(),
                })
                .await?;

            if outcome.changes.is_empty() {
                log::info!("pull complete with no updates");
            } else {
                log::info!("pull complete with updates:");
                let tracked: Vec<String> = if delivery.is_none() {
                    TrackingManifest::load(&data_dir)
                        .all_threads()
                        .map(|t| t.track_id.clone())
                        .collect()
                } else {
                    Vec::new()
                };
                for (name, count) in &outcome.changes {
                    if tracked.contains(name) {
                        log::info!("  {} (tracked): {}", name, count);
                    } else {
                        log::info!("  {}: {}", name, count);
                    }
                }
            }
        }

        Command::Auth { target } => {
            let config = load_config(&cfgfile)?;
            let explicit = target.is_some();
            let names: Vec<String> = match target {
                Some(name) => vec![name],
                None => config.targets.keys().cloned().collect(),
            };
            for name in names {
                let Some(cfg) = config.targets.get(&name) else {
                    return Err(Error::Configuration(format!(
                        "target \"{}\" not found in configuration",
                        name
                    )));
                };
                // When sweeping every target, quietly pass over the
                // ones that have no OAuth flow to run.
                let uses_oauth = matches!(
                    cfg,
                    korgalore::config::TargetConfig::Gmail { .. }
                        | korgalore::config::TargetConfig::Imap { .. }
                );
                if !explicit && !uses_oauth {
                    continue;
                }
                let mut target = Target::from_config(&name, cfg, &config_dir, true)?;
                match target.reauthenticate().await {
                    Ok(()) => log::info!("authentication complete for {}", name),
                    Err(Error::Configuration(msg)) if !explicit => {
                        log::debug!("skipping {}: {}", name, msg)
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        Command::Labels { target } => {
            let config = load_config(&cfgfile)?;
            let Some(cfg) = config.targets.get(&target) else {
                return Err(Error::Configuration(format!(
                    "target \"{}\" not found in configuration",
                    target
                )));
            };
            let built = Target::from_config(&target, cfg, &config_dir, true)?;
            match built {
                Target::Gmail(mut gmail) => {
                    for label in gmail.list_labels().await? {
                        if let Some(name) = label.get("name").and_then(|v| v.as_str()) {
                            println!("{}", name);
                        }
                    }
                }
                Target::Jmap(mut jmap) => {
                    jmap.connect().await?;
                    for mailbox in jmap.list_mailboxes().await? {
                        let name = mailbox
                            .get("name")
                            .and_then(|v| v.as_str())
                            .unwrap_or("(unnamed)");
                        let role = mailbox.get("role").and_then(|v| v.as_str()).unwrap_or("");
                        if role.is_empty() {
                            println!("{}", name);
                        } else {
                            println!("{} (role: {})", name, role);
                        }
                    }
                }
                _ => {
                    return Err(Error::Configuration(format!(
                        "target \"{}\" does not have labels or mailboxes",
                        target
                    )));
                }
            }
        }

        Command::Track(cmd) => {
            run_track_command(cmd, &cfgfile, &data_dir).await?;
        }

        Command::Bozofilter { addresses, reason } => {
            if addresses.is_empty() {
                let filter = bozofilter::Bozofilter::load(&config_dir);
                if filter.is_empty() {
                    println!("bozofilter is empty");
                } else {
                    let mut listed: Vec<&str> = filter.addresses().collect();
                    listed.sort_unstable();
                    for addr in listed {
                        println!("{}", addr);
                    }
                }
            } else {
                let added =
                    bozofilter::add_addresses(&config_dir, &addresses, reason.as_deref())?;
                log::info!("added {} new addresses to the bozofilter", added);
            }
        }
    }

    Ok(())
}

async fn run_track_command(
    cmd: TrackCommand,
    cfgfile: &PathBuf,
    data_dir: &PathBuf,
) -> Result<()> {
    match cmd {
        TrackCommand::Add {
            msgid,
            target,
            labels,
        } => {
            let config = load_config(cfgfile)?;
            if !config.targets.contains_key(&target) {
                return Err(Error::Configuration(format!(
                    "target \"{}\" not found in configuration",
                    target
                )));
            }

            let msgid = extract_msgid(&msgid);
            let mut manifest = TrackingManifest::load(data_dir);
            let bracketed = format!("<{}>", msgid);
            if let Some(existing) = manifest.get_thread_by_msgid(&bracketed) {
                return Err(Error::Configuration(format!(
                    "thread is already tracked as {}",
                    existing.track_id
                )));
            }

            let track_id = track_id_for_msgid(&msgid);
            let lei_path = manifest.lei_path_for(&track_id);
            search::create_thread_search(&msgid, &lei_path).await?;

            manifest.add_thread(
                &track_id,
                &bracketed,
                "(subject pending first pull)",
                &target,
                labels,
                lei_path,
            )?;
            println!("tracking {} as {}", bracketed, track_id);
        }

        TrackCommand::List { inactive } => {
            let manifest = TrackingManifest::load(data_dir);
            let mut any = false;
            for thread in manifest.all_threads() {
                let show = inactive || thread.status == tracking::TrackStatus::Active;
                if !show {
                    continue;
                }
                any = true;
                println!(
                    "{}  [{:?}]  {} ({} messages, last activity {})",
                    thread.track_id,
                    thread.status,
                    thread.subject,
                    thread.message_count,
                    thread.last_new_message.date_naive()
                );
            }
            if !any {
                println!("no tracked threads");
            }
        }

        TrackCommand::Stop { track_id, delete } => {
            let mut manifest = TrackingManifest::load(data_dir);
            let thread = manifest.remove_thread(&track_id)?;
            if delete {
                if let Err(e) = search::forget_search(&thread.lei_path).await {
                    log::warn!("failed to forget lei search: {}", e);
                }
                if thread.lei_path.exists() {
                    std::fs::remove_dir_all(&thread.lei_path)?;
                }
            }
            println!("stopped tracking {}", track_id);
        }

        TrackCommand::Pause { track_id } => {
            let mut manifest = TrackingManifest::load(data_dir);
            manifest.pause_thread(&track_id)?;
            println!("paused {}", track_id);
        }

        TrackCommand::Resume { track_id } => {
            let mut manifest = TrackingManifest::load(data_dir);
            manifest.resume_thread(&track_id)?;
            println!("resumed {}", track_id);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_filter)).init();

    if let Err(e) = run(cli).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
