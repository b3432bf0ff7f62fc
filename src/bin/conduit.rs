//! Command-line access to the MCP connection layer
//!
//! ```text
//! conduit discover servers.toml github --force
//! conduit call servers.toml github search_issues --args '{"query": "is:open"}'
//! conduit test servers.toml github
//! ```
//!
//! Results are printed to stdout as JSON; logs go to stderr (and a rolling
//! file when `MCP_CONDUIT_LOG_DIR` is set).

use anyhow::{anyhow, Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use mcp_conduit::config::{ConduitConfig, ServerConfiguration, ServerSet};
use mcp_conduit::telemetry::{init_logging, LoggingConfig};
use mcp_conduit::{McpManager, Outcome};
use serde::Serialize;
use serde_json::Value;

fn cli() -> Command {
    let config_file = Arg::new("config-file")
        .help("TOML, YAML or JSON file listing server configurations")
        .required(true)
        .index(1);
    let server = Arg::new("server")
        .help("Server id or name within the configuration file")
        .required(true)
        .index(2);

    Command::new("conduit")
        .about("Discover and call tools on MCP servers")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .short('l')
                .global(true)
                .help("Console log level (trace, debug, info, warn, error)")
                .value_parser(["trace", "debug", "info", "warn", "error"]),
        )
        .arg(
            Arg::new("settings")
                .long("settings")
                .short('s')
                .global(true)
                .help("Connection-layer settings file; defaults come from MCP_CONDUIT_* variables"),
        )
        .subcommand(
            Command::new("discover")
                .about("List the tools a server exposes")
                .arg(config_file.clone())
                .arg(server.clone())
                .arg(
                    Arg::new("force")
                        .long("force")
                        .short('f')
                        .help("Bypass the tool cache")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("call")
                .about("Invoke one tool")
                .arg(config_file.clone())
                .arg(server.clone())
                .arg(Arg::new("tool").help("Tool name").required(true).index(3))
                .arg(
                    Arg::new("args")
                        .long("args")
                        .short('a')
                        .help("Tool arguments as a JSON object")
                        .default_value("{}"),
                ),
        )
        .subcommand(
            Command::new("test")
                .about("Connect, handshake and ping a server")
                .arg(config_file)
                .arg(server),
        )
}

fn load_server(matches: &ArgMatches) -> Result<ServerConfiguration> {
    let path = matches
        .get_one::<String>("config-file")
        .ok_or_else(|| anyhow!("missing configuration file"))?;
    let name = matches
        .get_one::<String>("server")
        .ok_or_else(|| anyhow!("missing server"))?;

    let servers = ServerSet::from_file(path).with_context(|| format!("Failed to load {}", path))?;
    servers
        .find(name)
        .cloned()
        .ok_or_else(|| anyhow!("No server '{}' in {}", name, path))
}

fn load_settings(matches: &ArgMatches) -> Result<ConduitConfig> {
    let config = match matches.get_one::<String>("settings") {
        Some(path) => ConduitConfig::from_file(path)
            .with_context(|| format!("Failed to load settings from {}", path))?
            .merge_with_env()?,
        None => ConduitConfig::from_env()?,
    };
    Ok(config)
}

/// Print the outcome and report whether it succeeded
fn print_outcome<T: Serialize>(outcome: &Outcome<T>) -> Result<bool> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    Ok(outcome.is_success())
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    let mut logging = LoggingConfig::from_env();
    if let Some(level) = matches.get_one::<String>("log-level") {
        logging = logging.with_console_level(level.as_str());
    }
    let guard = init_logging(logging)?;

    let manager = McpManager::builder().config(load_settings(&matches)?).build()?;

    let succeeded = match matches.subcommand() {
        Some(("discover", sub)) => {
            let server = load_server(sub)?;
            let force = sub.get_flag("force");
            print_outcome(&manager.discover_tools(&server, force).await)?
        }
        Some(("call", sub)) => {
            let server = load_server(sub)?;
            let tool = sub
                .get_one::<String>("tool")
                .ok_or_else(|| anyhow!("missing tool name"))?;
            let raw_args = sub
                .get_one::<String>("args")
                .map(String::as_str)
                .unwrap_or("{}");
            let arguments: Value =
                serde_json::from_str(raw_args).context("--args must be a JSON object")?;
            if !arguments.is_object() {
                return Err(anyhow!("--args must be a JSON object"));
            }
            print_outcome(&manager.call_tool(&server, tool, arguments).await)?
        }
        Some(("test", sub)) => {
            let server = load_server(sub)?;
            print_outcome(&manager.test_connection(&server).await)?
        }
        Some((other, _)) => return Err(anyhow!("Unknown command '{}'", other)),
        None => return Err(anyhow!("No command given")),
    };

    manager.shutdown().await;
    if !succeeded {
        drop(guard);
        std::process::exit(1);
    }
    Ok(())
}
