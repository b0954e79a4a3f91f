use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::ReportError;
use crate::models::RunResult;

/// Name column of the cross-PID summary row.
pub const SUM_NAME: &str = "SUM";

/// CSV report, opened in append mode so consecutive runs accumulate in one file.
pub struct CsvReport {
    out: BufWriter<File>,
}

impl CsvReport {
    pub fn open(path: &Path) -> Result<Self, ReportError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| ReportError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    pub fn write_run(&mut self, result: &RunResult) -> Result<(), ReportError> {
        for row in rows(result) {
            writeln!(self.out, "{}", csv_line(&row))?;
        }
        self.out.flush()?;
        Ok(())
    }
}

/// One row per observed PID, plus a `SUM` row when more than one PID was observed.
pub fn rows(result: &RunResult) -> Vec<Vec<String>> {
    let prefix = [
        result.timestamp.to_string(),
        format!("{:.2}", result.intended_ticks),
        result.spawn_count.to_string(),
    ];

    let mut rows: Vec<Vec<String>> = result
        .usages
        .iter()
        .map(|usage| {
            let mut row = prefix.to_vec();
            row.extend([
                usage.pid.to_string(),
                usage.name.clone(),
                format!("{:.2}", usage.user),
                format!("{:.2}", usage.system),
                format!("{:.2}", usage.total()),
                format!("{:.3}", usage.user_percent),
                format!("{:.3}", usage.system_percent),
                format!("{:.3}", usage.total_percent()),
            ]);
            row
        })
        .collect();

    if let Some(sum) = result.sum() {
        let mut row = prefix.to_vec();
        row.extend([
            String::new(),
            SUM_NAME.to_string(),
            format!("{:.2}", sum.user),
            format!("{:.2}", sum.system),
            format!("{:.2}", sum.total()),
            format!("{:.3}", sum.user_percent),
            format!("{:.3}", sum.system_percent),
            format!("{:.3}", sum.total_percent()),
        ]);
        rows.push(row);
    }

    rows
}

fn csv_line(fields: &[String]) -> String {
    fields
        .iter()
        .map(|field| {
            if field.contains([',', '"', '\n', '\r']) {
                format!("\"{}\"", field.replace('"', "\"\""))
            } else {
                field.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Logs the per-PID usage and the cross-PID sum.
pub fn log_summary(result: &RunResult) {
    log::info!("{} events generated.", result.spawn_count);

    for usage in &result.usages {
        log::info!(
            "PID {}[{}]: user+sys: {:.02}+{:.02} = {:.02} seconds / {:.3}+{:.3} = {:.03} percent",
            usage.pid,
            usage.name,
            usage.user,
            usage.system,
            usage.total(),
            usage.user_percent,
            usage.system_percent,
            usage.total_percent()
        );
    }

    if let Some(sum) = result.sum() {
        log::info!(
            "SUM: {:.02} seconds / {:.03} percent",
            sum.total(),
            sum.total_percent()
        );
    }
}
