//! Command-line front end for the modhost extension runtime.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use modhost_core::config::env_vars;
use modhost_core::extension::ExtensionSummary;
use modhost_core::{Loader, Registries, Runtime, RuntimeConfig};
use serde::Serialize;

/// modhost - Load, inspect and manage daemon extensions.
#[derive(Parser, Debug)]
#[command(name = "modhost")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Runtime configuration file (TOML).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start the configured extensions and list them.
    Modules {
        /// Show versions, flags, hooks and overrides.
        #[arg(long)]
        oper: bool,
        /// Print a JSON report instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Hash a password with an authentication backend.
    Mkpasswd {
        /// Authentication method (crypt, md5, sha1, ...).
        method: String,
        /// Text to hash.
        text: String,
    },
    /// Start the extensions of a configuration file and report every problem.
    Check {
        /// Configuration file to check.
        #[arg(required = true)]
        file: PathBuf,
    },
    /// Validate a single extension file without activating it.
    Validate {
        /// Path to the extension, or a builtin name.
        #[arg(required = true)]
        path: String,
    },
}

#[derive(Serialize)]
struct ModulesReport {
    extensions: Vec<ExtensionSummary>,
    hooks: Vec<u32>,
    overrides: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if args.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .compact()
            .init();
    }

    match args.command {
        Command::Modules { oper, json } => run_modules(load_config(args.config.as_deref())?, oper, json),
        Command::Mkpasswd { method, text } => {
            run_mkpasswd(load_config(args.config.as_deref())?, &method, &text)
        }
        Command::Check { file } => run_check(load_config(Some(&file))?),
        Command::Validate { path } => run_validate(load_config(args.config.as_deref())?, &path),
    }
}

/// Explicit path first, then `MODHOST_CONFIG`, then built-in defaults.
fn load_config(path: Option<&Path>) -> Result<RuntimeConfig> {
    let path = path
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os(env_vars::CONFIG).map(PathBuf::from));
    match path {
        Some(path) => RuntimeConfig::from_file(&path)
            .with_context(|| format!("Failed to read configuration {}", path.display())),
        None => Ok(RuntimeConfig::default()),
    }
}

fn run_modules(config: RuntimeConfig, oper: bool, json: bool) -> Result<()> {
    let mut runtime = Runtime::new(config);
    let failures = runtime.start()?;
    for failure in &failures {
        eprintln!("Warning: {}", failure);
    }

    if json {
        let registries = runtime.registries();
        let report = ModulesReport {
            extensions: runtime.summaries(),
            hooks: registries.hooks.active_types().collect(),
            overrides: registries
                .commands
                .overridden()
                .map(|c| c.name.clone())
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in runtime.listing(oper) {
            println!("{}", line);
        }
    }

    runtime.shutdown();
    Ok(())
}

fn run_mkpasswd(mut config: RuntimeConfig, method: &str, text: &str) -> Result<()> {
    // Every stock backend is available regardless of the configured list.
    config.load = vec![
        "auth_crypt".to_string(),
        "auth_unreal_md5".to_string(),
        "auth_unreal_sha1".to_string(),
        "auth_clientcertfp".to_string(),
        "auth_clientcert".to_string(),
    ];
    config.auth.clear();

    let mut runtime = Runtime::new(config);
    runtime.start()?;
    println!("{}", runtime.mkpasswd(method, text));
    runtime.shutdown();
    Ok(())
}

fn run_check(config: RuntimeConfig) -> Result<()> {
    let mut runtime = Runtime::new(config);
    let failures = match runtime.start() {
        Ok(failures) => failures,
        Err(e) => {
            println!("Configuration check: FAILED");
            println!();
            println!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if failures.is_empty() {
        println!("Configuration check: PASSED");
        println!();
        println!("Extensions:      {}", runtime.loader().len());
        println!("Auth backends:   {}", runtime.registries().auth.names().join(", "));
        runtime.shutdown();
        return Ok(());
    }

    println!("Configuration check: FAILED");
    println!();
    for failure in &failures {
        println!("  - {}", failure);
    }
    runtime.shutdown();
    std::process::exit(1);
}

fn run_validate(config: RuntimeConfig, path: &str) -> Result<()> {
    let mut loader = Loader::new(&config);
    for ext in modhost_core::auth::stock_extensions() {
        loader.register_builtin(ext);
    }
    let mut registries = Registries::new();

    match loader.load(path, &mut registries) {
        Ok(Some(id)) => {
            if let Some(ext) = loader.get(id) {
                println!("Extension Validation: PASSED");
                println!();
                println!("Name:            {}", ext.name());
                println!("Version:         {}", ext.version());
                println!("Description:     {}", ext.description());
                println!("Module system:   {}", ext.header().modversion);
                println!("Dependencies:    {}", ext.header().dependencies.len());
                println!("Path:            {}", ext.path().display());
            }
            loader.shutdown(&mut registries);
            Ok(())
        }
        Ok(None) => {
            println!("Extension Validation: SKIPPED");
            println!();
            println!("An extension with the same name is already loaded.");
            Ok(())
        }
        Err(e) => {
            println!("Extension Validation: FAILED");
            println!();
            println!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
