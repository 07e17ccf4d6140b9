use super::super::args::*;
use crate::exit_codes::{CONFIG_ERROR, SUCCESS};
use kvprobe_core::ProbeKind;

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let config = match super::settings::resolve(&cli.global, &cli.cmd) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e:#}");
            return Ok(CONFIG_ERROR);
        }
    };
    match cli.cmd {
        Command::Estimate => super::storage::estimate(&cli.global, config).await,
        Command::Persist => super::storage::persist(&cli.global, config).await,
        Command::Clear => super::storage::clear(&cli.global, config).await,
        Command::Capacity(_) => super::probe::run(ProbeKind::Capacity, &cli.global, config).await,
        Command::Size(_) => super::probe::run(ProbeKind::SingleSize, &cli.global, config).await,
        Command::Count(_) => super::probe::run(ProbeKind::Count, &cli.global, config).await,
        Command::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(SUCCESS)
        }
    }
}
