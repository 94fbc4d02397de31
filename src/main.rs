//! jsui-pubsub - Profile inspection tool
//!
//! Builds the application's settings topics on a PubSub engine, loads the
//! saved profiles the way the application does at startup, and exposes the
//! profile API on the command line.

use anyhow::{bail, Context};
use clap::{CommandFactory, Parser, Subcommand};
use jsui_pubsub::{
    config::{LoggingConfig, PubSubConfig},
    Capability, DType, Flag, Metadata, OptionEntry, ProfileManager, PubSub, RegisterRequest,
    Value,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "jsui-pubsub", version, about = "Inspect and manage saved PubSub profiles")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List saved profiles
    List,
    /// Print the values stored in a profile
    Show { profile: String },
    /// Print topics with their current values
    Topics {
        /// Subtree to print (all topics when omitted)
        #[arg(default_value = "")]
        root: String,
    },
    /// Load a profile, publish a value, save it
    Set {
        profile: String,
        topic: String,
        /// JSON value; bare words are taken as strings
        value: String,
    },
    /// Save the startup state as a profile
    Save {
        profile: String,
        #[arg(default_value = "")]
        description: String,
    },
    /// Restore a previous version of a profile
    Revert {
        profile: String,
        #[arg(default_value_t = 1)]
        count: usize,
    },
    /// Delete a profile and its history
    Remove { profile: String },
    /// Reset the default profile to defaults
    Defaults,
    /// Print the effective configuration
    Config,
}

fn init_logging(
    config: &LoggingConfig,
    log_dir: Option<PathBuf>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let log_dir = log_dir
        .filter(|_| config.log_to_file)
        .filter(|dir| std::fs::create_dir_all(dir).is_ok());
    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "jsui-pubsub.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    guard
}

/// Topics the application defines before loading profiles.
fn declare_app_topics(pubsub: &PubSub, config: &PubSubConfig) -> anyhow::Result<()> {
    let data_dir = jsui_pubsub::config::app_data_dir()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    let common = [
        (
            "common/settings/profile/active",
            Metadata::new(DType::Str, "Active profile name")
                .with_default(config.persistence.default_profile.as_str()),
        ),
        (
            "common/settings/paths/data",
            Metadata::new(DType::Str, "Data directory").with_default(data_dir.as_str()),
        ),
        (
            "common/settings/units/time",
            Metadata::new(DType::Str, "Time units").with_default("s").with_options([
                OptionEntry::labeled("s", "Seconds").with_alias("seconds"),
                OptionEntry::labeled("ms", "Milliseconds").with_alias("milliseconds"),
            ]),
        ),
        (
            "common/settings/software_update_check",
            Metadata::new(DType::Bool, "Check for software updates").with_default(true),
        ),
    ];
    for (topic, meta) in common {
        pubsub
            .topic_add(topic, meta)
            .with_context(|| format!("adding {}", topic))?;
    }

    pubsub.register(
        RegisterRequest::new("app")
            .with_unique_id("app")
            .with_capability(Capability::View)
            .with_setting(
                "theme",
                Metadata::new(DType::Str, "Color theme")
                    .with_default("js1")
                    .with_options([
                        OptionEntry::labeled("js1", "Joulescope"),
                        OptionEntry::labeled("system", "System"),
                    ]),
            )
            .with_setting(
                "font_size",
                Metadata::new(DType::U8, "Font size")
                    .with_default(12)
                    .with_range(6.0, 32.0),
            )
            .with_setting(
                "statistics_frequency",
                Metadata::new(DType::Float, "Statistics update rate")
                    .with_default(2.0)
                    .with_options([
                        OptionEntry::labeled(2.0, "2 Hz"),
                        OptionEntry::labeled(10.0, "10 Hz"),
                    ]),
            )
            .with_setting(
                "window_state",
                Metadata::new(DType::Bytes, "Saved window geometry").with_flag(Flag::Hide),
            )
            .with_setting(
                "device_info",
                Metadata::new(DType::Str, "Connected device description")
                    .with_default("")
                    .with_flag(Flag::ReadOnly),
            ),
    )?;
    Ok(())
}

fn print_values(values: impl IntoIterator<Item = (String, Value)>) {
    for (topic, value) in values {
        println!("{:<48} {}", topic, value);
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = PubSubConfig::load_or_default();
    let _log_guard = init_logging(&config.logging, config.log_dir());

    let Some(command) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let pubsub = PubSub::new(config.clone());
    declare_app_topics(&pubsub, &config)?;
    let profiles = ProfileManager::from_config(pubsub.clone(), &config)?;
    let default_profile = config.persistence.default_profile.as_str();

    match command {
        Command::List => {
            for p in profiles.list()? {
                let saved = p
                    .saved_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "unreadable".to_string());
                println!(
                    "{:<20} {:<20} {:>3} versions  {}",
                    p.name, saved, p.history, p.description
                );
            }
        }
        Command::Show { profile } => {
            let file = jsui_pubsub::profile::read_file(&profiles.path(&profile))?;
            println!("# {} ({}) saved {}", file.name, file.description, file.saved_at);
            print_values(
                file.values
                    .into_iter()
                    .map(|(t, v)| (t, Value::from_json(v).unwrap_or_default())),
            );
        }
        Command::Topics { root } => {
            profiles.startup(default_profile);
            let topics = pubsub.enumerate(&root, true, true)?;
            print_values(
                topics
                    .into_iter()
                    .filter_map(|t| pubsub.query(&t).ok().filter(|v| !v.is_null()).map(|v| (t, v))),
            );
        }
        Command::Set {
            profile,
            topic,
            value,
        } => {
            let json = serde_json::from_str(&value)
                .unwrap_or_else(|_| serde_json::Value::String(value.clone()));
            let value = Value::from_json(json).map_err(anyhow::Error::msg)?;
            profiles.startup(&profile);
            pubsub
                .publish(&topic, value)
                .with_context(|| format!("publishing {}", topic))?;
            if topic.starts_with("common/") {
                profiles.save_common()?;
            } else {
                profiles.save(&profile, "")?;
            }
            println!("{} = {}", topic, pubsub.query(&topic)?);
        }
        Command::Save {
            profile,
            description,
        } => {
            profiles.startup(default_profile);
            let path = profiles.save(&profile, &description)?;
            profiles.save_common()?;
            println!("Saved {}", path.display());
        }
        Command::Revert { profile, count } => {
            if profiles.revert(&profile, count)? {
                println!("Reverted {} by {}", profile, count);
            } else {
                bail!("profile {} has fewer than {} previous versions", profile, count);
            }
        }
        Command::Remove { profile } => {
            profiles.remove(&profile)?;
            println!("Removed {}", profile);
        }
        Command::Defaults => {
            let count = profiles.restore_defaults();
            profiles.save(default_profile, "Defaults")?;
            profiles.save_common()?;
            println!("Restored {} defaults", count);
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    tracing::debug!("Done: {:?}", pubsub);
    Ok(())
}
