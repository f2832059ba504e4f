//! Tab-separated text writer
//!
//! Saves a [`RunRecord`] as two text files in the output directory:
//!
//! - `<tag>.txt`: axis column plus the four averaged channels
//! - `<tag>_rawdata.txt`: axis column plus one column per channel and sweep,
//!   channel-major (`Ch1 sw1 .. Ch1 swN, Ch2 sw1 ..`), each averaged over
//!   accumulations only
//!
//! Both files start with the parameter snapshot as `# key: value` lines and a
//! `#`-prefixed column header, so they load with any comment-aware reader.
//! Values are written as `%.6e`.
//!
//! # Example
//!
//! ```rust,ignore
//! use daq_storage::TsvWriter;
//!
//! let writer = TsvWriter::new("data/eproc");
//! let path = engine.save(&writer, "").await?;
//! println!("saved to {}", path.display());
//! ```

use anyhow::{Context, Result};
use async_trait::async_trait;
use daq_core::capabilities::PersistenceSink;
use daq_core::data::{RunRecord, CHANNEL_COUNT};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

const ENDING: &str = "txt";

/// Writes runs as tab-separated text files.
#[derive(Debug, Clone)]
pub struct TsvWriter {
    output_dir: PathBuf,
}

impl TsvWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Paths of the averaged and raw files for `tag`.
    pub fn paths(&self, tag: &str) -> (PathBuf, PathBuf) {
        (
            self.output_dir.join(format!("{}.{}", tag, ENDING)),
            self.output_dir.join(format!("{}_rawdata.{}", tag, ENDING)),
        )
    }

    fn write_files(&self, tag: &str, record: &RunRecord) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.output_dir).with_context(|| {
            format!("creating output directory {}", self.output_dir.display())
        })?;
        let (averaged_path, raw_path) = self.paths(tag);

        let mut columns = vec![record.axis.label().to_string()];
        columns.extend((1..=CHANNEL_COUNT).map(|c| format!("Channel {}", c)));
        let rows = record.series.x().iter().zip(record.series.values()).map(|(x, v)| {
            let mut row = Vec::with_capacity(1 + CHANNEL_COUNT);
            row.push(*x);
            row.extend_from_slice(v);
            row
        });
        write_table(&averaged_path, &record.parameters, &columns, rows)?;

        let mut columns = vec![record.axis.label().to_string()];
        for channel in 1..=CHANNEL_COUNT {
            for sweep in 1..=record.repeat_series.len() {
                columns.push(format!("Ch{} sw{}", channel, sweep));
            }
        }
        let rows = record.series.x().iter().enumerate().map(|(point, x)| {
            let mut row = vec![*x];
            for channel in 0..CHANNEL_COUNT {
                row.extend(record.repeat_series.iter().map(|sweep| {
                    sweep
                        .get(point)
                        .and_then(|v| v.get(channel).copied())
                        .unwrap_or(0.0)
                }));
            }
            row
        });
        write_table(&raw_path, &record.parameters, &columns, rows)?;

        Ok(averaged_path)
    }
}

#[async_trait]
impl PersistenceSink for TsvWriter {
    async fn save(&self, tag: &str, record: &RunRecord) -> Result<PathBuf> {
        let tag = if tag.trim().is_empty() {
            default_tag()
        } else {
            tag.to_string()
        };

        let writer = self.clone();
        let record = record.clone();
        let path = tokio::task::spawn_blocking(move || writer.write_files(&tag, &record))
            .await
            .context("storage task panicked")??;

        tracing::info!(path = %path.display(), "Run data written");
        Ok(path)
    }
}

fn write_table<I>(
    path: &Path,
    parameters: &[(String, String)],
    columns: &[String],
    rows: I,
) -> Result<()>
where
    I: Iterator<Item = Vec<f64>>,
{
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for (key, value) in parameters {
        writeln!(out, "# {}: {}", key, value)?;
    }
    writeln!(out, "# {}", columns.join("\t"))?;

    let mut table = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .from_writer(out);
    for row in rows {
        table.write_record(row.iter().map(|v| format_scientific(*v)))?;
    }
    table.flush()?;
    tracing::debug!(path = %path.display(), "Table written");
    Ok(())
}

/// Timestamp tag used when none is given, e.g. `2024-05-01_14-03-59`.
pub fn default_tag() -> String {
    chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

/// Format like C's `%.6e`: six decimals and a signed, two-digit exponent.
pub fn format_scientific(value: f64) -> String {
    let formatted = format!("{:.6e}", value);
    match formatted.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => formatted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_core::capabilities::AxisKind;
    use daq_core::data::{AveragedSeries, SampleCube};

    fn record() -> RunRecord {
        let x = vec![2.8e9, 2.802e9];
        let mut series = AveragedSeries::new(x.clone());
        series.set(0, [1.0, 2.0, 3.0, 4.0]).unwrap();
        series.set(1, [-0.5, 0.25, 0.0, 1e-7]).unwrap();

        let mut sweep1 = AveragedSeries::new(x.clone());
        sweep1.set(0, [10.0, 20.0, 30.0, 40.0]).unwrap();
        let mut sweep2 = AveragedSeries::new(x);
        sweep2.set(0, [11.0, 21.0, 31.0, 41.0]).unwrap();

        RunRecord {
            run_uid: "uid-1".to_string(),
            axis: AxisKind::Frequency,
            series,
            repeat_series: vec![sweep1, sweep2],
            raw: SampleCube::try_new(2, 1, 2).unwrap(),
            parameters: vec![
                ("Magnetic Field (G)".to_string(), "3480".to_string()),
                ("Elapsed Sweeps".to_string(), "2".to_string()),
            ],
        }
    }

    fn data_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| !l.starts_with('#'))
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_format_scientific() {
        assert_eq!(format_scientific(1.0), "1.000000e+00");
        assert_eq!(format_scientific(2.8e9), "2.800000e+09");
        assert_eq!(format_scientific(-1.5e-7), "-1.500000e-07");
        assert_eq!(format_scientific(0.0), "0.000000e+00");
        assert_eq!(format_scientific(1e100), "1.000000e+100");
    }

    #[tokio::test]
    async fn test_writes_averaged_and_raw_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TsvWriter::new(dir.path());

        let path = writer.save("run_a", &record()).await.unwrap();
        assert_eq!(path, dir.path().join("run_a.txt"));

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("# Magnetic Field (G): 3480\n# Elapsed Sweeps: 2\n"));
        assert!(text.contains("# Frequency (Hz)\tChannel 1\tChannel 2\tChannel 3\tChannel 4\n"));
        assert_eq!(
            data_lines(&path),
            vec![
                "2.800000e+09\t1.000000e+00\t2.000000e+00\t3.000000e+00\t4.000000e+00",
                "2.802000e+09\t-5.000000e-01\t2.500000e-01\t0.000000e+00\t1.000000e-07",
            ]
        );

        let raw_path = dir.path().join("run_a_rawdata.txt");
        let raw = std::fs::read_to_string(&raw_path).unwrap();
        assert!(raw.contains("Ch1 sw1\tCh1 sw2\tCh2 sw1"));
        let first = data_lines(&raw_path).remove(0);
        let fields: Vec<&str> = first.split('\t').collect();
        assert_eq!(fields.len(), 1 + 4 * 2);
        assert_eq!(fields[1], "1.000000e+01");
        assert_eq!(fields[2], "1.100000e+01");
        assert_eq!(fields[8], "4.100000e+01");
    }

    #[tokio::test]
    async fn test_empty_tag_uses_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TsvWriter::new(dir.path().join("nested"));

        let path = writer.save("", &record()).await.unwrap();
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        // YYYY-MM-DD_HH-MM-SS.txt
        assert_eq!(name.len(), 23, "{}", name);
        assert!(name.ends_with(".txt"));
        assert_eq!(&name[10..11], "_");
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_unwritable_directory_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let writer = TsvWriter::new(blocker.join("sub"));
        assert!(writer.save("tag", &record()).await.is_err());
    }
}
