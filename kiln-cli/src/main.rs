use anyhow::Result;
use clap::{ArgMatches, Command};
use tracing_subscriber::EnvFilter;

mod cmd;
mod config;

fn cli() -> Command {
    Command::new("kiln")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Static site generator with embedded templates")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(cmd::build::make_subcommand())
        .subcommand(cmd::watch::make_subcommand())
}

fn init_logging(args: &ArgMatches) {
    let flag = |name| args.get_flag(name);
    let filter = if flag("quiet") {
        EnvFilter::new("warn")
    } else if flag("dev") {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = cli().get_matches();

    match matches.subcommand() {
        Some(("build", args)) => {
            init_logging(args);
            cmd::build::execute(args).await
        }
        Some(("watch", args)) => {
            init_logging(args);
            cmd::watch::execute(args).await
        }
        _ => unreachable!("subcommand required"),
    }
}
