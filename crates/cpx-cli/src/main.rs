//! 🚀 cpx-cli: the front door, the bouncer, the maitre d' of cpx.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary loads config, sets up logging, runs the job, prints the report card, and
//! picks an exit code. Like a manager. 🦆
//!
//! Usage: `cpx [config.toml]` or `cpx --options [import|export|copy]`.

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cpx::CommandKind;

/// 📜 `--options`: what a command reads, one key per line.
fn print_options(command: Option<&str>) -> Result<()> {
    let command = match command.unwrap_or("import") {
        "import" => CommandKind::Import,
        "export" => CommandKind::Export,
        "copy" => CommandKind::Copy,
        other => anyhow::bail!("💀 '{other}' is not a command. Try import, export, or copy."),
    };
    for option in command.option_schema() {
        println!("{:<36} {}", option.key, option.help);
    }
    Ok(())
}

/// 🔍 Does anything in the chain smell like an unreachable host?
fn looks_like_connectivity(err: &anyhow::Error) -> bool {
    err.chain().skip(1).any(|cause| {
        let cause_str = cause.to_string();
        cause_str.contains("error sending request")
            || cause_str.contains("connection refused")
            || cause_str.contains("Connection refused")
            || cause_str.contains("tcp connect error")
            || cause_str.contains("dns error")
    })
}

/// 🚀 main(), where it all begins. The "I pressed F5 and held my breath" moment.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("--options") {
        return print_options(args.get(2).map(String::as_str));
    }
    let path_arg = args.get(1).map(String::as_str).unwrap_or("cpx.toml");

    // 🔒 Missing file is fine (env vars only); an unreadable location is not
    let config_file = std::path::Path::new(path_arg);
    let config_file = match config_file.try_exists().with_context(|| {
        format!(
            "💀 Couldn't check whether the configuration file exists. If it's a relative path, \
             try an absolute one. Was checking here: '{}'",
            config_file.display()
        )
    })? {
        true => Some(config_file),
        false => None,
    };

    let app_config = cpx::load_config(config_file)
        .context("💀 Couldn't load the configuration. Take a look at the file and the CPX_* variables.")?;

    match cpx::run(app_config).await {
        Ok(report) => {
            println!("{}", report.render());
            if !report.is_success() {
                error!(failed = report.failed_units.len(), "💀 some units failed; see the report above");
                std::process::exit(1);
            }
            info!("✅ all units finished");
            Ok(())
        }
        Err(err) => {
            error!("💀 error: {}", err);
            for cause in err.chain().skip(1) {
                error!("⚠️  cause: {}", cause);
            }
            if cpx::is_configuration_error(&err) {
                error!("🔧 hint: this is a configuration problem. Nothing was written.");
            } else if looks_like_connectivity(&err) {
                error!(
                    "🔧 hint: looks like a store isn't reachable. Double-check that the destination \
                     (or source) hosts are up and the URLs are right. Even servers need a nudge sometimes. ☕"
                );
            }
            std::process::exit(1);
        }
    }
}
