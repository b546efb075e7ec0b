use std::{
    io::{self, BufWriter, Write},
    path::PathBuf,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::sync::{ReaderOptions, SyncReader};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "vmsync-dump",
    author,
    version,
    about = "Dump VM record/replay synchronization traces",
    long_about = None
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print every sync point with its ordinal
    Points(TraceArgs),
    /// Print the reconstructed sync events
    Events(TraceArgs),
    /// Print the data blocks attached to each sync point
    Data(TraceArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct TraceArgs {
    /// Sync point record file
    #[arg(value_name = "PATH")]
    pub record_file: PathBuf,

    /// Companion data file
    #[arg(long = "data", value_name = "PATH")]
    pub data_file: Option<PathBuf>,

    /// Reject register changes in cycles that were not emulated
    #[arg(long)]
    pub strict: bool,

    /// First ordinal to dump
    #[arg(long, value_name = "ORDINAL", default_value_t = 1)]
    pub from: u64,

    /// Maximum number of entries to dump
    #[arg(long, value_name = "N")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpMode {
    Points,
    Events,
    Data,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub mode: DumpMode,
    pub record_file: PathBuf,
    pub data_file: Option<PathBuf>,
    pub options: ReaderOptions,
    pub from: u64,
    pub limit: Option<usize>,
}

impl From<Args> for AppConfig {
    fn from(value: Args) -> Self {
        let (mode, trace) = match value.command {
            Command::Points(trace) => (DumpMode::Points, trace),
            Command::Events(trace) => (DumpMode::Events, trace),
            Command::Data(trace) => (DumpMode::Data, trace),
        };

        Self {
            mode,
            record_file: trace.record_file,
            data_file: trace.data_file,
            options: ReaderOptions {
                strict_verification: trace.strict,
            },
            from: trace.from,
            limit: trace.limit,
        }
    }
}

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

pub fn run(config: AppConfig) -> Result<()> {
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    dump(&config, &mut out)?;
    out.flush().context("failed to flush output")?;
    Ok(())
}

/// Write the dump selected by `config` to `out`.
pub fn dump<W: Write>(config: &AppConfig, out: &mut W) -> Result<()> {
    let mut reader = SyncReader::open(
        &config.record_file,
        config.data_file.as_deref(),
        config.options,
    )
    .with_context(|| format!("failed to load sync file {}", config.record_file.display()))?;

    info!(
        record_file = %config.record_file.display(),
        version = reader.version(),
        sync_points = reader.sync_point_count(),
        "Dumping sync file",
    );

    if config.from > 1 {
        reader.seek(config.from - 1);
    }
    let limit = config.limit.unwrap_or(usize::MAX);

    match config.mode {
        DumpMode::Points => {
            writeln!(out, "Number of sync points: {}", reader.sync_point_count())?;
            for (position, point) in reader.points().take(limit) {
                writeln!(out, "{position:>8}: {point}")?;
            }
        }
        DumpMode::Events => {
            writeln!(out, "Number of sync points: {}", reader.sync_point_count())?;
            for event in reader.events().take(limit) {
                let event = event.context("failed to rebuild sync event")?;
                writeln!(out, "{event}")?;
                writeln!(out)?;
            }
        }
        DumpMode::Data => {
            for (_, point) in reader.points().take(limit) {
                writeln!(out, "TSC={}", point.tsc())?;
                for block in &point.data {
                    writeln!(out, " {block}")?;
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use crate::sync::{
        DataBlock, DataKind, ExitReason, PointKind, RawPoint, SyncFileWriter, WriterConfig,
    };
    use tempfile::TempDir;

    fn point(kind: PointKind, rax: u64, rip: u64, tsc: u64) -> RawPoint {
        let mut point = RawPoint {
            kind,
            rip,
            rflags: 0x202,
            ..Default::default()
        };
        point.context.rax = rax;
        point.context.tsc = tsc;
        point
    }

    fn create_test_trace(dir: &TempDir) -> (PathBuf, PathBuf) {
        let record_path = dir.path().join("sync_points.bin");
        let data_path = dir.path().join("sync_data.bin");

        let mut exit = point(PointKind::VmExit(ExitReason::IoInstruction), 1, 0x1000, 10);
        exit.data.push(DataBlock {
            kind: DataKind::MemoryLogical,
            offset: 0xb8000,
            data: vec![0x41, 0x07],
        });

        let mut writer =
            SyncFileWriter::create(&record_path, &data_path, WriterConfig::default()).unwrap();
        writer.write_point(&exit).unwrap();
        writer
            .write_point(&point(PointKind::VmEnter, 0x61, 0x1001, 11))
            .unwrap();
        writer
            .write_point(&point(PointKind::VmExit(ExitReason::Cpuid), 0x61, 0x1010, 12))
            .unwrap();
        writer
            .write_point(&point(PointKind::VmEnter, 0x756e6547, 0x1012, 13))
            .unwrap();
        writer.finish().unwrap();

        (record_path, data_path)
    }

    fn config(mode: DumpMode, record_file: PathBuf, data_file: Option<PathBuf>) -> AppConfig {
        AppConfig {
            mode,
            record_file,
            data_file,
            options: ReaderOptions::default(),
            from: 1,
            limit: None,
        }
    }

    fn dump_to_string(config: &AppConfig) -> String {
        let mut out = Vec::new();
        dump(config, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn cli_args__events_with_defaults__then_config_uses_expected_values() {
        let args = Args::try_parse_from(["vmsync-dump", "events", "trace.bin"]).unwrap();
        let config = AppConfig::from(args);

        assert_eq!(config.mode, DumpMode::Events);
        assert_eq!(config.record_file, PathBuf::from("trace.bin"));
        assert_eq!(config.data_file, None);
        assert!(!config.options.strict_verification);
        assert_eq!(config.from, 1);
        assert_eq!(config.limit, None);
    }

    #[test]
    fn cli_args__custom_inputs__then_override_defaults() {
        let args = Args::try_parse_from([
            "vmsync-dump",
            "data",
            "trace.bin",
            "--data",
            "trace.data",
            "--strict",
            "--from",
            "40",
            "--limit",
            "5",
        ])
        .unwrap();
        let config = AppConfig::from(args);

        assert_eq!(config.mode, DumpMode::Data);
        assert_eq!(config.data_file, Some(PathBuf::from("trace.data")));
        assert!(config.options.strict_verification);
        assert_eq!(config.from, 40);
        assert_eq!(config.limit, Some(5));
    }

    #[test]
    fn cli_args__missing_record_file__then_parse_error() {
        assert!(Args::try_parse_from(["vmsync-dump", "points"]).is_err());
        assert!(Args::try_parse_from(["vmsync-dump"]).is_err());
    }

    #[test]
    fn dump__points__then_one_line_per_ordinal() {
        let dir = TempDir::new().unwrap();
        let (record_path, data_path) = create_test_trace(&dir);

        let text = dump_to_string(&config(DumpMode::Points, record_path, Some(data_path)));
        let lines: Vec<_> = text.lines().collect();

        assert_eq!(lines[0], "Number of sync points: 4");
        assert_eq!(lines.len(), 5);
        assert!(lines[1].starts_with("       1: "));
        assert!(lines[1].contains("I/O instruction RIP=0000000000001000"));
        assert!(lines[4].starts_with("       4: "));
    }

    #[test]
    fn dump__events__then_prints_each_cycle() {
        let dir = TempDir::new().unwrap();
        let (record_path, data_path) = create_test_trace(&dir);

        let text = dump_to_string(&config(DumpMode::Events, record_path, Some(data_path)));

        assert!(text.contains("Sync Event pos $2 - I/O instruction"));
        assert!(text.contains("Sync Event pos $4 - Guest software attempted to execute CPUID"));
        assert!(text.contains("New context emulated : RAX=00000000756e6547"));
    }

    #[test]
    fn dump__data__then_lists_blocks_under_their_point() {
        let dir = TempDir::new().unwrap();
        let (record_path, data_path) = create_test_trace(&dir);

        let text = dump_to_string(&config(DumpMode::Data, record_path, Some(data_path)));
        let lines: Vec<_> = text.lines().collect();

        assert_eq!(lines[0], "TSC=10");
        assert_eq!(lines[1], " LOGICAL:b8000");
        assert!(lines[2].starts_with("       0: 41 07"));
        assert_eq!(lines[3], "TSC=11");
    }

    #[test]
    fn dump__from_and_limit__then_window_of_points() {
        let dir = TempDir::new().unwrap();
        let (record_path, _) = create_test_trace(&dir);

        let mut config = config(DumpMode::Points, record_path, None);
        config.from = 2;
        config.limit = Some(2);
        let text = dump_to_string(&config);
        let lines: Vec<_> = text.lines().skip(1).collect();

        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("       2: "));
        assert!(lines[1].starts_with("       3: "));
    }

    #[test]
    fn dump__missing_record_file__then_error_with_context() {
        let dir = TempDir::new().unwrap();
        let config = config(DumpMode::Points, dir.path().join("absent.bin"), None);

        let error = dump(&config, &mut Vec::new()).unwrap_err();
        assert!(
            error.to_string().contains("failed to load sync file"),
            "unexpected error: {error}"
        );
    }

    #[test]
    fn init_tracing__called_twice__then_does_not_panic() {
        init_tracing();
        init_tracing();
    }
}
