//! Run logging: a tracing subscriber writing to stdout and the run's
//! `log.txt`, plus a JSONL stream of training scalars.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub const LOG_FILE: &str = "log.txt";
pub const SCALARS_FILE: &str = "scalars.jsonl";

/// Installs a subscriber for the current thread until the returned guard is
/// dropped. `RUST_LOG` overrides the default `info` filter. Runs in the same
/// process each get their own `log.txt`.
pub fn init_logging(log_file: Option<&Path>) -> anyhow::Result<DefaultGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let timer = ChronoLocal::new("%H:%M:%S%.3f".to_string());
    let stdout_layer = fmt::layer()
        .with_target(false)
        .with_timer(timer.clone())
        .with_ansi(std::io::stdout().is_terminal());

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_timer(timer)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    Ok(Registry::default()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .set_default())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarEvent {
    pub tag: String,
    pub value: f64,
    pub step: usize,
    /// Seconds since the Unix epoch.
    pub wall_time: f64,
}

/// Appends one [`ScalarEvent`] per line to `<run>/log/scalars.jsonl`.
pub struct ScalarWriter {
    path: PathBuf,
    out: BufWriter<File>,
}

impl ScalarWriter {
    pub fn create(run_dir: &Path) -> anyhow::Result<Self> {
        let dir = run_dir.join("log");
        fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(SCALARS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn add_scalar(&mut self, tag: &str, value: f64, step: usize) -> anyhow::Result<()> {
        let event = ScalarEvent {
            tag: tag.to_string(),
            value,
            step,
            wall_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        };
        serde_json::to_writer(&mut self.out, &event)?;
        writeln!(self.out)?;
        Ok(())
    }

    pub fn close(mut self) -> anyhow::Result<()> {
        self.out
            .flush()
            .with_context(|| format!("failed to flush {}", self.path.display()))
    }
}

/// Reads back a scalar stream.
pub fn read_scalars(path: &Path) -> anyhow::Result<Vec<ScalarEvent>> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).with_context(|| format!("bad scalar line: {l}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_run_logs_to_its_own_file() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let (a, b) = (tmp.path().join("a.txt"), tmp.path().join("b.txt"));
        {
            let _log = init_logging(Some(&a))?;
            tracing::info!("first run");
        }
        {
            let _log = init_logging(Some(&b))?;
            tracing::info!("second run");
        }
        let (a, b) = (fs::read_to_string(a)?, fs::read_to_string(b)?);
        assert!(a.contains("first run") && !a.contains("second run"));
        assert!(b.contains("second run") && !b.contains("first run"));
        Ok(())
    }

    #[test]
    fn scalars_round_trip_through_jsonl() -> anyhow::Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut writer = ScalarWriter::create(tmp.path())?;
        writer.add_scalar("info/lr", 0.01, 0)?;
        writer.add_scalar("info/total_loss", 1.25, 0)?;
        let path = writer.path().to_path_buf();
        writer.close()?;

        let events = read_scalars(&path)?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].tag, "info/total_loss");
        assert_eq!(events[1].value, 1.25);
        Ok(())
    }
}
