// vim: tw=80
//! Offline tools for EvenOdd arrays whose units are stored as image files

use std::{
    io::{self, Write},
    path::PathBuf,
    process::exit,
    sync::Arc,
};

use clap::{crate_version, Parser};
use eoraid_core::{
    config::ArrayConfig,
    plog::format,
    raid::VdevRaid,
    types::UnitT,
    vdev_mem::VdevMem,
};
use futures::future;
use thiserror::Error;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    Raid(#[from] eoraid_core::Error),
    #[error("expected {expected} unit images but got {got}")]
    UnitCount { expected: usize, got: usize },
    #[error("{0} stripes have inconsistent redundancy")]
    Inconsistent(usize),
}

type Result<T = ()> = std::result::Result<T, CliError>;

async fn load_config(path: &PathBuf) -> Result<ArrayConfig> {
    let s = tokio::fs::read_to_string(path).await?;
    Ok(ArrayConfig::from_yaml(&s)?)
}

/// Read every unit image, including the parity log's, into memory
async fn load_units(config: &ArrayConfig, paths: &[PathBuf])
    -> Result<VdevMem>
{
    if paths.len() != config.backing_units() {
        return Err(CliError::UnitCount {
            expected: config.backing_units(),
            got: paths.len()
        });
    }
    let images = future::try_join_all(paths.iter().map(tokio::fs::read))
        .await?;
    debug!(units = images.len(), "loaded unit images");
    Ok(VdevMem::from_images(images, config.bytes_per_sector)?)
}

#[derive(Parser, Clone, Debug)]
/// Check that every stripe's redundancy matches its data.
///
/// Anything in the parity log is replayed first, in memory only.
struct Check {
    /// Array configuration file, in YAML
    #[clap(short, long, required(true))]
    config: PathBuf,
    /// Unit images in order, followed by the parity log's if configured
    #[clap(required(true))]
    units:  Vec<PathBuf>,
}

impl Check {
    async fn main(self) -> Result<()> {
        let config = load_config(&self.config).await?;
        let mem = load_units(&config, &self.units).await?;
        let raid = VdevRaid::open(config, Arc::new(mem)).await?;
        let mut bad = Vec::new();
        for s in 0..raid.layout().stripes() {
            if !raid.verify_stripe(s).await? {
                bad.push(s);
            }
        }
        let mut stdout = io::stdout().lock();
        for s in bad.iter() {
            writeln!(stdout, "stripe {s}: inconsistent")?;
        }
        if bad.is_empty() {
            info!(stripes = raid.layout().stripes(), "array is consistent");
            Ok(())
        } else {
            Err(CliError::Inconsistent(bad.len()))
        }
    }
}

#[derive(Parser, Clone, Debug)]
/// Print the records in each region of a parity log image
struct DumpLog {
    /// Array configuration file, in YAML
    #[clap(short, long, required(true))]
    config: PathBuf,
    /// Also print each record's payload length in bytes
    #[clap(short, long)]
    verbose: bool,
    /// The parity log unit's image
    #[clap(required(true))]
    log:    PathBuf,
}

impl DumpLog {
    async fn main(self) -> Result<()> {
        let config = load_config(&self.config).await?;
        let plc = config.parity_log.as_ref()
            .ok_or(eoraid_core::Error::InvalidConfig(
                "parity logging is not configured"))?;
        let image = tokio::fs::read(&self.log).await?;
        let bps = config.bytes_per_sector;
        let region_bytes = plc.region_log_sectors as usize * bps;
        let mut stdout = io::stdout().lock();
        for r in 0..plc.regions {
            let start = r as usize * region_bytes;
            let buf = image.get(start..start + region_bytes)
                .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
            let log = format::parse(Some(r), buf, bps)?;
            writeln!(stdout, "region {r}: generation {}, {} records, tail {}",
                log.header.generation, log.records.len(), log.tail)?;
            for rec in log.records.iter() {
                write!(stdout, "\t{:?}\t{}\t{} sectors", rec.kind, rec.addr,
                    rec.nsectors(bps))?;
                if self.verbose {
                    write!(stdout, "\t{} bytes", rec.payload.len())?;
                }
                writeln!(stdout)?;
            }
        }
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
/// Reconstruct one unit's image from the others
struct Rebuild {
    /// Array configuration file, in YAML
    #[clap(short, long, required(true))]
    config: PathBuf,
    /// Index of the unit to reconstruct.  Its image is overwritten.
    #[clap(short, long, required(true))]
    unit:   UnitT,
    /// Unit images in order, followed by the parity log's if configured
    #[clap(required(true))]
    units:  Vec<PathBuf>,
}

impl Rebuild {
    async fn main(self) -> Result<()> {
        let config = load_config(&self.config).await?;
        let mem = load_units(&config, &self.units).await?;
        let raid = VdevRaid::open(config, Arc::new(mem.clone())).await?;
        raid.fault(self.unit).await?;
        mem.replace_unit(self.unit);
        raid.rebuild(self.unit).await?;
        // Reintegrated redundancy lives on the other units, too
        raid.sync_all().await?;
        for (i, path) in self.units.iter().enumerate() {
            tokio::fs::write(path, mem.image(i as UnitT)).await?;
        }
        info!(unit = self.unit, stripes = raid.layout().stripes(),
              "rebuilt unit image");
        Ok(())
    }
}

#[derive(Parser, Clone, Debug)]
enum SubCommand {
    Check(Check),
    DumpLog(DumpLog),
    Rebuild(Rebuild),
}

#[derive(Parser, Clone, Debug)]
#[clap(version = crate_version!())]
struct Cli {
    #[clap(subcommand)]
    cmd: SubCommand,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let cli: Cli = Cli::parse();
    let r = match cli.cmd {
        SubCommand::Check(check) => check.main().await,
        SubCommand::DumpLog(dump) => dump.main().await,
        SubCommand::Rebuild(rebuild) => rebuild.main().await,
    };
    if let Err(e) = r {
        eprintln!("Error: {e}");
        exit(1);
    }
}

#[cfg(test)]
mod t {
    use clap::error::ErrorKind::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::path::Path;

    use super::*;

    #[rstest]
    #[case(Vec::new())]
    #[case(vec!["eoraid"])]
    #[case(vec!["eoraid", "check"])]
    #[case(vec!["eoraid", "check", "-c", "array.yaml"])]
    #[case(vec!["eoraid", "dump-log", "-c", "array.yaml"])]
    #[case(vec!["eoraid", "rebuild", "-c", "array.yaml", "u0", "u1"])]
    fn missing_arg(#[case] args: Vec<&str>) {
        let e = Cli::try_parse_from(args).unwrap_err();
        assert!(
            e.kind() == MissingRequiredArgument ||
                e.kind() == DisplayHelpOnMissingArgumentOrSubcommand
        );
    }

    #[test]
    fn check() {
        let args = vec!["eoraid", "check", "-c", "array.yaml", "u0", "u1"];
        let cli = Cli::try_parse_from(args).unwrap();
        let SubCommand::Check(check) = cli.cmd else {
            panic!("wrong subcommand");
        };
        assert_eq!(check.config, Path::new("array.yaml"));
        assert_eq!(check.units, vec![PathBuf::from("u0"), "u1".into()]);
    }

    #[test]
    fn dump_log() {
        let args = vec!["eoraid", "dump-log", "-v", "-c", "a.yaml", "log"];
        let cli = Cli::try_parse_from(args).unwrap();
        let SubCommand::DumpLog(dump) = cli.cmd else {
            panic!("wrong subcommand");
        };
        assert!(dump.verbose);
        assert_eq!(dump.log, Path::new("log"));
    }

    #[test]
    fn rebuild() {
        let args = vec!["eoraid", "rebuild", "-c", "a.yaml", "-u", "3", "u0"];
        let cli = Cli::try_parse_from(args).unwrap();
        let SubCommand::Rebuild(rebuild) = cli.cmd else {
            panic!("wrong subcommand");
        };
        assert_eq!(rebuild.unit, 3);
        assert_eq!(rebuild.units.len(), 1);
    }

    #[tokio::test]
    async fn wrong_unit_count() {
        let tempdir = tempfile::Builder::new()
            .prefix("eoraid_cli")
            .tempdir()
            .unwrap();
        let cfg = tempdir.path().join("array.yaml");
        std::fs::write(&cfg, "ndata: 3\nprime: 3\nsectors_per_unit: 2\n\
            bytes_per_sector: 64\nstripes: 4\n").unwrap();
        let config = load_config(&cfg).await.unwrap();
        let u0 = tempdir.path().join("u0");
        std::fs::write(&u0, vec![0u8; 512]).unwrap();
        let e = load_units(&config, &[u0]).await.unwrap_err();
        assert!(matches!(e, CliError::UnitCount{expected: 5, got: 1}));
    }
}
