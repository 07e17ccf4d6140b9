//! Effective configuration: file (or defaults), then command-line overrides.

use super::{Command, GlobalArgs};
use crate::cli::confirm::DialoguerConfirmer;
use crate::cli::terminal::{Stream, TerminalSink};
use anyhow::Context;
use kvprobe_core::{AlwaysContinue, Confirmer, ProbeConfig, ProbeSession};
use std::path::Path;
use std::sync::Arc;

pub fn resolve(global: &GlobalArgs, cmd: &Command) -> anyhow::Result<ProbeConfig> {
    let mut config = match &global.config {
        Some(path) => ProbeConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ProbeConfig::load_or_default(Path::new(ProbeConfig::DEFAULT_PATH))?,
    };
    apply_overrides(&mut config, global, cmd);
    config.validate()?;
    Ok(config)
}

fn apply_overrides(config: &mut ProbeConfig, global: &GlobalArgs, cmd: &Command) {
    let backend = &mut config.backend;
    if let Some(kind) = global.backend {
        backend.kind = kind.into();
    }
    if let Some(dir) = &global.dir {
        backend.dir = dir.clone();
    }
    if global.quota_bytes.is_some() {
        backend.quota_bytes = global.quota_bytes;
    }
    if global.max_record_bytes.is_some() {
        backend.max_record_bytes = global.max_record_bytes;
    }
    if global.max_records.is_some() {
        backend.max_records = global.max_records;
    }

    match cmd {
        Command::Capacity(args) => {
            let capacity = &mut config.capacity;
            set(&mut capacity.chunk_mb, args.chunk);
            set(&mut capacity.target_mb, args.target);
            set(&mut capacity.unit_bytes, args.unit_bytes);
            set(&mut capacity.trial_frequency, args.frequency);
        }
        Command::Size(args) => {
            let size = &mut config.size;
            set(&mut size.target_mb, args.target);
            set(&mut size.precision_mb, args.precision);
            set(&mut size.unit_bytes, args.unit_bytes);
            set(&mut size.trial_frequency, args.frequency);
        }
        Command::Count(args) => {
            let count = &mut config.count;
            set(&mut count.target, args.target);
            set(&mut count.safety_multiple, args.safety_multiple);
            set(&mut count.trial_frequency, args.frequency);
            count.stop_at_target |= args.stop_at_target;
        }
        Command::Estimate | Command::Persist | Command::Clear | Command::Config => {}
    }
}

fn set(field: &mut u64, value: Option<u64>) {
    if let Some(value) = value {
        *field = value;
    }
}

pub fn session(global: &GlobalArgs, config: ProbeConfig) -> ProbeSession {
    let stream = if global.json {
        Stream::Stderr
    } else {
        Stream::Stdout
    };
    let sink = Arc::new(TerminalSink::new(stream, global.quiet));
    let confirmer: Arc<dyn Confirmer> = if global.yes {
        Arc::new(AlwaysContinue)
    } else {
        Arc::new(DialoguerConfirmer)
    };
    ProbeSession::from_config(config, sink, confirmer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::args::{BackendArg, Cli};
    use clap::Parser;
    use kvprobe_core::BackendKind;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn flags_override_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.yaml");
        std::fs::write(&path, "capacity:\n  chunk_mb: 5\n  target_mb: 50\n").unwrap();
        let cli = parse(&[
            "kvprobe",
            "--config",
            path.to_str().unwrap(),
            "capacity",
            "--target",
            "20",
            "--backend",
            "memory",
        ]);

        let config = resolve(&cli.global, &cli.cmd).unwrap();

        assert_eq!(config.capacity.chunk_mb, 5);
        assert_eq!(config.capacity.target_mb, 20);
        assert_eq!(config.backend.kind, BackendKind::Memory);
        assert_eq!(cli.global.backend, Some(BackendArg::Memory));
    }

    #[test]
    fn zero_override_fails_validation() {
        let cli = parse(&["kvprobe", "size", "--precision", "0"]);
        assert!(resolve(&cli.global, &cli.cmd).is_err());
    }

    #[test]
    fn missing_explicit_config_is_an_error() {
        let cli = parse(&["kvprobe", "--config", "/nonexistent/kvprobe.yaml", "estimate"]);
        assert!(resolve(&cli.global, &cli.cmd).is_err());
    }
}
