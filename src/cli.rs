//! CLI argument parsing and subcommand dispatch.
//!
//! `main.rs` parses [`Cli`] and hands it to [`run_command`], which returns the
//! process exit status.

use crate::analysis::fallback;
use crate::auth_codes::spawn_reaper;
use crate::config::{ConfigHandle, ConfigLoader};
use crate::context::InterceptionContext;
use crate::error_codes::GateError;
use crate::evaluator::combine;
use crate::fastpath::{FastPathCache, spawn_sweeper};
use crate::logging::init_logging;
use crate::orchestrator::{InterceptionReport, Interceptor};
use crate::output::{self, Decision, DenialBox};
use crate::redact::{RedactOptions, Redactor};
use crate::router::Router;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::time::Duration;

/// Exit status for usage and configuration errors.
pub const EXIT_USAGE: i32 = 64;

/// Command-line interface for shellgate.
#[derive(Parser, Debug)]
#[command(name = "shellgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Gate a command, then run it if allowed
    #[command(name = "run")]
    Run {
        /// Print a JSON decision object on stdout
        #[arg(long)]
        json: bool,

        /// Command to run
        command: String,

        /// Arguments, passed through literally
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Print the routing decision for a command (JSON)
    #[command(name = "route")]
    Route {
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Route, fast-path, and classify locally without running anything (JSON)
    #[command(name = "check")]
    Check {
        command: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Redact secrets from stdin to stdout
    #[command(name = "redact")]
    Redact {
        /// Keep the first and last four characters of keys
        #[arg(long)]
        mask: bool,

        /// Also redact email addresses
        #[arg(long)]
        email: bool,
    },

    /// Redeem an auth code and run the command it authorizes
    #[command(name = "redeem")]
    Redeem {
        code: String,

        #[arg(long)]
        json: bool,
    },

    /// Print the merged configuration or one nested key
    #[command(name = "config")]
    Config {
        /// Dotted key, e.g. "approval.timeout_secs"
        #[arg(long)]
        path: Option<String>,
    },
}

/// Dispatch `cli` and return the exit status.
pub fn run_command(cli: Cli) -> i32 {
    let handle = match ConfigHandle::load(ConfigLoader::from_process()) {
        Ok(handle) => handle,
        Err(err) => {
            eprintln!("shellgate: {err}");
            return EXIT_USAGE;
        }
    };
    let config = handle.snapshot();
    init_logging(&config.logging);
    let env: BTreeMap<String, String> = std::env::vars().collect();
    output::init(&config.general.color, &env);

    let result = match cli.command {
        Command::Run { json, command, args } => {
            InterceptionContext::capture(command, args).and_then(|ctx| {
                let interceptor = Interceptor::builder((*config).clone()).build()?;
                let report = block_on(async {
                    let sweeper = spawn_sweeper(
                        interceptor.fastpath(),
                        Duration::from_secs(config.cache.sweep_interval_secs),
                    );
                    let reaper = spawn_reaper(
                        interceptor.issuer().clone(),
                        Duration::from_secs(config.auth_codes.reap_interval_secs.max(1)),
                    );
                    let report = interceptor.intercept(ctx).await;
                    sweeper.abort();
                    reaper.abort();
                    report
                })?;
                Ok(emit(&report, json, &config.general.color, &env))
            })
        }
        Command::Redeem { code, json } => {
            InterceptionContext::capture("shellgate", vec!["redeem".into(), code.clone()])
                .and_then(|ctx| {
                    let interceptor = Interceptor::builder((*config).clone()).build()?;
                    let report = block_on(interceptor.redeem(&code, ctx))?;
                    Ok(emit(&report, json, &config.general.color, &env))
                })
        }
        Command::Route { command, args } => InterceptionContext::capture(command, args)
            .map(|ctx| {
                let decision = Router::from_config(&config).route(&ctx.command, &ctx.args, &ctx);
                print_json(&decision);
                0
            }),
        Command::Check { command, args } => {
            InterceptionContext::capture(command, args).map(|ctx| {
                let route = Router::from_config(&config).route(&ctx.command, &ctx.args, &ctx);
                let cache = FastPathCache::from_config(&config.cache)
                    .with_extra_safe(config.lists.safe.clone());
                let analysis = combine(
                    None,
                    fallback::classify(&ctx.command, &ctx.args),
                    route.requires_approval,
                );
                print_json(&CheckReport {
                    fast_path: route.direct && cache.is_eligible(&ctx.command, &ctx.args),
                    route,
                    analysis,
                });
                0
            })
        }
        Command::Redact { mask, email } => {
            let mut input = String::new();
            match io::stdin().read_to_string(&mut input) {
                Ok(_) => Redactor::from_settings(&config.redaction).map(|redactor| {
                    let options = RedactOptions {
                        mask: mask || config.redaction.mask,
                        redact_emails: email || config.redaction.redact_emails,
                    };
                    print!("{}", redactor.redact(&input, &options).redacted);
                    0
                }),
                Err(e) => Err(GateError::io_error("reading stdin", &e.to_string())),
            }
        }
        Command::Config { path } => match path {
            None => {
                print!("{}", config.to_toml_string());
                Ok(0)
            }
            Some(path) => match handle.lookup(&path) {
                Some(toml::Value::String(s)) => {
                    println!("{s}");
                    Ok(0)
                }
                Some(value) => {
                    println!("{value}");
                    Ok(0)
                }
                None => {
                    eprintln!("shellgate: no config key '{path}'");
                    Ok(EXIT_USAGE)
                }
            },
        },
    };

    result.unwrap_or_else(|err| {
        tracing::error!(code = %err.code, error = %err.message, "command failed");
        eprintln!("shellgate: {err}");
        EXIT_USAGE
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckReport {
    route: crate::router::RoutingDecision,
    fast_path: bool,
    analysis: crate::analysis::Analysis,
}

fn block_on<F: std::future::Future>(future: F) -> Result<F::Output, GateError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| GateError::io_error("starting async runtime", &e.to_string()))?;
    Ok(runtime.block_on(future))
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{json}"),
        Err(e) => eprintln!("shellgate: could not encode JSON: {e}"),
    }
}

/// Print the outcome and return its exit status.
fn emit(
    report: &InterceptionReport,
    json: bool,
    color_mode: &str,
    env: &BTreeMap<String, String>,
) -> i32 {
    if json {
        println!("{}", Decision::from_report(report).to_json());
    } else if let Some(denial) = DenialBox::from_report(report) {
        let color = output::should_use_color(color_mode, env);
        eprint!("{}", denial.render(output::terminal_width(env), color));
    }
    report.outcome.exit_code()
}
