//! FocusFlow CLI
//!
//! CLI tool for checking URLs against a blocklist, exercising the sync
//! protocol in a simulated browser, and generating bindings.

use std::fs;
use std::path::Path;

use clap::{Parser, Subcommand};
use env_logger::{Builder, Env, Target};
use log::info;

use ff_core::{blocked_page, decide, normalize_domain, FocusConfig, RuleSet};

#[cfg(feature = "e2e")]
mod e2e;
mod simulate;

#[derive(Parser)]
#[command(name = "ff-cli")]
#[command(about = "FocusFlow site blocker tools")]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a verdict per URL as JSON lines
    Check {
        /// Rule set file (`{"domains": [...], "enabled": bool}`)
        #[arg(short, long)]
        rules: String,

        /// URLs to evaluate
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Print the normalized form of each domain entry
    Normalize {
        #[arg(required = true)]
        inputs: Vec<String>,
    },

    /// Print the blocked page for a domain
    BlockedPage { domain: String },

    /// Open tabs in a simulated browser, then disable blocking from the popup
    Simulate {
        /// Rule set file
        #[arg(short, long)]
        rules: String,

        /// Config file (defaults apply when missing)
        #[arg(short, long)]
        config: Option<String>,

        /// URLs to open, one tab each
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Write TypeScript bindings for the wire protocol
    #[cfg(feature = "ts")]
    ExportTypes {
        #[arg(short, long, default_value = "bindings")]
        out: String,
    },

    /// Run browser checks against the unpacked extension
    ///
    /// The extension is not part of this workspace. It must ship
    /// `popup.html` with a `#status` element, inject the Bridge into
    /// `--app-url`, read `{domains, enabled}` (or legacy `isActive`) from
    /// `chrome.storage.local`, and render the blocked page from
    /// `ff-wasm`'s `render_blocked_page`.
    #[cfg(feature = "e2e")]
    E2e {
        #[arg(long, default_value = "http://localhost:9515")]
        chromedriver: String,

        /// Unpacked extension directory (manifest.json at its root)
        #[arg(long, default_value = "extension")]
        extension: String,

        /// Page the Bridge is injected into
        #[arg(long, default_value = "http://localhost:5173/blocklist")]
        app_url: String,

        #[arg(long)]
        headless: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    Builder::from_env(Env::default().default_filter_or(level))
        .target(Target::Stderr)
        .init();

    let result = match cli.command {
        Commands::Check { rules, urls } => cmd_check(&rules, &urls),
        Commands::Normalize { inputs } => cmd_normalize(&inputs),
        Commands::BlockedPage { domain } => {
            println!("{}", blocked_page::render(&domain));
            Ok(())
        }
        Commands::Simulate { rules, config, urls } => {
            load_rules(&rules).and_then(|rules| {
                let config = load_config(config.as_deref())?;
                simulate::run(rules, config, &urls)
            })
        }
        #[cfg(feature = "ts")]
        Commands::ExportTypes { out } => cmd_export_types(&out),
        #[cfg(feature = "e2e")]
        Commands::E2e {
            chromedriver,
            extension,
            app_url,
            headless,
        } => e2e::run_e2e(e2e::E2eOptions {
            chromedriver_url: chromedriver,
            extension_path: extension,
            app_url,
            headless,
        }),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Read a rule file. Unlike the extension's storage, the CLI refuses a
/// malformed file instead of falling back to the default.
fn load_rules(path: &str) -> Result<RuleSet, String> {
    let text = fs::read_to_string(path).map_err(|e| format!("Failed to read '{}': {}", path, e))?;
    let value: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| format!("Invalid JSON in '{}': {}", path, e))?;
    RuleSet::from_payload(&value).map_err(|e| format!("Invalid rules in '{}': {}", path, e))
}

fn load_config(path: Option<&str>) -> Result<FocusConfig, String> {
    match path {
        Some(path) if Path::new(path).exists() => FocusConfig::load(path).map_err(|e| e.to_string()),
        Some(path) => {
            info!("Config '{}' not found, using defaults", path);
            Ok(FocusConfig::default())
        }
        None => Ok(FocusConfig::default()),
    }
}

fn cmd_check(rules_path: &str, urls: &[String]) -> Result<(), String> {
    let rules = load_rules(rules_path)?;
    info!("Loaded {} domains, enabled={}", rules.len(), rules.enabled);

    for url in urls {
        let verdict = decide(url, &rules);
        let line = serde_json::json!({
            "url": url,
            "block": verdict.block,
            "matchedDomain": verdict.matched_domain,
        });
        println!("{line}");
    }
    Ok(())
}

fn cmd_normalize(inputs: &[String]) -> Result<(), String> {
    for input in inputs {
        match normalize_domain(input) {
            Some(domain) => println!("{input}\t{domain}"),
            None => println!("{input}\t(invalid)"),
        }
    }
    Ok(())
}

#[cfg(feature = "ts")]
fn cmd_export_types(out: &str) -> Result<(), String> {
    use ts_rs::TS;

    fs::create_dir_all(out).map_err(|e| format!("Failed to create '{}': {}", out, e))?;

    let exports = [
        ff_core::Request::export_all_to(out),
        ff_core::Response::export_all_to(out),
        ff_core::Broadcast::export_all_to(out),
        ff_core::PageMessage::export_all_to(out),
    ];
    for export in exports {
        export.map_err(|e| format!("Failed to export bindings: {}", e))?;
    }

    println!("Wrote TypeScript bindings to '{}'", out);
    Ok(())
}
