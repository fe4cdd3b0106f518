use std::path::PathBuf;

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use tracing::warn;

use rdp_kernel::{audit_load, happy_path, telemetry, Portal, PortalConfig};
use rdp_types::{roles, ActivityStatus, ReviewStatus, WorkflowState};
use rdp_workflow::{matrix, render_grid, Lifecycle};

fn cli() -> Command {
    Command::new("rdp-kernel")
        .version(rdp_kernel::VERSION)
        .about("RDP portal core: workflow engine, tokens, policy and audit")
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("Path to a TOML configuration file"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("transitions")
                .about("Print the workflow, activity and review transition tables")
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(Command::new("scenario").about("Run the workflow happy path in-process"))
        .subcommand(
            Command::new("mint")
                .about("Register a principal and mint a token pair for it")
                .arg(
                    Arg::new("name")
                        .long("name")
                        .default_value("operator")
                        .help("Principal name"),
                )
                .arg(
                    Arg::new("role")
                        .long("role")
                        .default_value(roles::DEFAULT)
                        .value_parser(roles::ALL.to_vec())
                        .help("Principal role"),
                ),
        )
        .subcommand(
            Command::new("audit-load")
                .about("Drive guarded requests against a failing audit store")
                .arg(
                    Arg::new("requests")
                        .long("requests")
                        .default_value("100")
                        .value_parser(value_parser!(usize))
                        .help("Number of requests to send"),
                ),
        )
}

/// File, then environment
fn load_config(matches: &ArgMatches) -> anyhow::Result<PortalConfig> {
    let path = matches.get_one::<PathBuf>("config");
    PortalConfig::load(path.map(PathBuf::as_path))
        .and_then(PortalConfig::apply_env)
        .context("loading configuration")
}

fn lifecycle_json<L: Lifecycle>() -> serde_json::Value {
    serde_json::json!({ "name": L::NAME, "rows": matrix::<L>() })
}

fn print_transitions(json: bool) -> anyhow::Result<()> {
    if json {
        let tables = vec![
            lifecycle_json::<WorkflowState>(),
            lifecycle_json::<ActivityStatus>(),
            lifecycle_json::<ReviewStatus>(),
        ];
        println!("{}", serde_json::to_string_pretty(&tables)?);
    } else {
        println!("{}", render_grid::<WorkflowState>());
        println!("{}", render_grid::<ActivityStatus>());
        println!("{}", render_grid::<ReviewStatus>());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();
    let mut config = load_config(&matches)?;
    // a second subscriber only happens under test harnesses
    let _ = telemetry::init(&config.log);
    if config.auth.jwt_secret.is_empty() {
        warn!("no jwt secret configured, using a throwaway secret for this run");
        config = config.with_secret(hex::encode(rand::random::<[u8; 32]>()));
    }

    match matches.subcommand() {
        Some(("transitions", args)) => print_transitions(args.get_flag("json"))?,
        Some(("scenario", _)) => {
            let portal = Portal::builder(config).build()?;
            let report = happy_path(&portal).await?;
            portal.shutdown().await;
            for step in &report.steps {
                println!("  {step}");
            }
            println!(
                "Workflow {}: state={} progress={}",
                report.workflow.id, report.workflow.state, report.workflow.progress
            );
            println!("Status: {}", if report.passed() { "PASSED" } else { "FAILED" });
            std::process::exit(if report.passed() { 0 } else { 1 });
        }
        Some(("mint", args)) => {
            let name = args.get_one::<String>("name").map_or("operator", String::as_str);
            let role = args.get_one::<String>("role").map_or(roles::DEFAULT, String::as_str);
            let portal = Portal::builder(config).build()?;
            let password = hex::encode(rand::random::<[u8; 16]>());
            let principal = portal.register_principal(name, role, &password)?;
            let pair = portal
                .tokens()
                .mint_pair(principal.id, &principal.name, &principal.role)
                .await?;
            portal.shutdown().await;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "principal": principal,
                    "tokens": pair,
                }))?
            );
        }
        Some(("audit-load", args)) => {
            let requests = args.get_one::<usize>("requests").copied().unwrap_or(100);
            let report = audit_load(config, requests).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            let healthy = report.server_errors == 0 && report.succeeded == report.requests;
            std::process::exit(if healthy { 0 } else { 1 });
        }
        _ => unreachable!("subcommand_required"),
    }
    Ok(())
}
