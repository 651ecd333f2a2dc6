//! Result export: model files, predicted data, convergence history and JSON bundles.

use crate::config;
use crate::error::{InversionError, InversionResult};
use crate::inversion::{InversionOutcome, IterationRecord, Phase, StopReason};
use ndarray::{Array1, Array2};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

pub const SCHEMA_VERSION: &str = "1.0.0";

fn create(path: &Path) -> InversionResult<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(BufWriter::new(File::create(path)?))
}

/// One value per line in `{:.17e}` so the file parses back bit-for-bit.
pub fn write_model(path: &Path, model: &Array1<f64>) -> InversionResult<()> {
    let mut w = create(path)?;
    for v in model.iter() {
        writeln!(w, "{:.17e}", v)?;
    }
    w.flush()?;
    Ok(())
}

/// Inverse of [`write_model`]: one float per non-blank line.
pub fn read_model(path: &Path) -> InversionResult<Array1<f64>> {
    let text = fs::read_to_string(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => InversionError::FileNotFound {
            path: path.to_path_buf(),
        },
        _ => InversionError::Io(e),
    })?;
    let mut values = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let v: f64 = line.parse().map_err(|_| InversionError::Format {
            path: path.to_path_buf(),
            line: i + 1,
            message: format!("expected a float, got '{}'", line),
        })?;
        values.push(v);
    }
    Ok(Array1::from(values))
}

/// `x y z value` per datum; receivers repeat once per measured component.
pub fn write_predicted(
    path: &Path,
    locations: &Array2<f64>,
    predicted: &Array1<f64>,
) -> InversionResult<()> {
    let n_rx = locations.nrows();
    if n_rx == 0 || predicted.len() % n_rx != 0 {
        return Err(InversionError::config(format!(
            "{} predicted values do not match {} receivers",
            predicted.len(),
            n_rx
        )));
    }
    let n_comp = predicted.len() / n_rx;
    let mut w = create(path)?;
    for (i, v) in predicted.iter().enumerate() {
        let row = locations.row(i / n_comp);
        writeln!(w, "{:.6} {:.6} {:.6} {:.10e}", row[0], row[1], row[2], v)?;
    }
    w.flush()?;
    Ok(())
}

/// Observation file in the five-column layout read by the data loader.
/// Column 3 is written as zero.
pub fn write_observations(
    path: &Path,
    locations: &Array2<f64>,
    values: &Array1<f64>,
) -> InversionResult<()> {
    if locations.nrows() != values.len() {
        return Err(InversionError::config(format!(
            "{} values for {} receivers",
            values.len(),
            locations.nrows()
        )));
    }
    let mut w = create(path)?;
    writeln!(w, "# x y z unused value")?;
    for (row, v) in locations.rows().into_iter().zip(values.iter()) {
        writeln!(
            w,
            "{:.6} {:.6} {:.6} 0.0 {:.10e}",
            row[0], row[1], row[2], v
        )?;
    }
    w.flush()?;
    Ok(())
}

// ============================================================================
// Convergence history CSV
// ============================================================================

pub struct HistoryWriter {
    w: BufWriter<File>,
}

impl HistoryWriter {
    pub fn create(path: &Path) -> InversionResult<Self> {
        Ok(Self { w: create(path)? })
    }

    pub fn write_header(&mut self) -> InversionResult<()> {
        writeln!(
            self.w,
            "iteration,phase,beta,phi_d,phi_m,phi,p_s,p_x,p_y,p_z,eps_s,eps_grad,cg_iterations,ls_iterations,soft_failures"
        )?;
        Ok(())
    }

    pub fn write_row(&mut self, r: &IterationRecord) -> InversionResult<()> {
        let (eps_s, eps_grad) = match r.epsilon {
            Some([s, g]) => (format!("{:.6e}", s), format!("{:.6e}", g)),
            None => (String::new(), String::new()),
        };
        writeln!(
            self.w,
            "{},{},{:.6e},{:.6e},{:.6e},{:.6e},{:.4},{:.4},{:.4},{:.4},{},{},{},{},{}",
            r.iteration,
            r.phase,
            r.beta,
            r.phi_d,
            r.phi_m,
            r.phi,
            r.norms[0],
            r.norms[1],
            r.norms[2],
            r.norms[3],
            eps_s,
            eps_grad,
            r.cg_iterations,
            r.ls_iterations,
            r.soft_failures
        )?;
        Ok(())
    }

    pub fn flush(&mut self) -> InversionResult<()> {
        self.w.flush()?;
        Ok(())
    }
}

pub fn write_history(path: &Path, history: &[IterationRecord]) -> InversionResult<()> {
    let mut w = HistoryWriter::create(path)?;
    w.write_header()?;
    for r in history {
        w.write_row(r)?;
    }
    w.flush()
}

// ============================================================================
// JSON result bundle
// ============================================================================

#[derive(Serialize)]
pub struct Manifest {
    pub schema_version: String,
    pub solver_version: String,
    pub timestamp_utc: String,
    pub platform: String,
    pub config_hash: String,
    pub config_snapshot: config::Root,
}

#[derive(Serialize)]
pub struct Summary {
    pub phase: Phase,
    pub stop_reason: StopReason,
    pub converged: bool,
    pub iterations: usize,
    pub beta: f64,
    pub phi_d: f64,
    pub phi_m: f64,
    pub target_misfit: f64,
    pub n_data: usize,
    pub n_active: usize,
    pub wall_time_ms: f64,
}

#[derive(Serialize)]
pub struct ResultBundle {
    pub manifest: Manifest,
    pub summary: Summary,
    pub history: Vec<IterationRecord>,
}

impl Manifest {
    pub fn new(cfg: &config::Root, cfg_text: &str) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            solver_version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp_utc: timestamp_utc(),
            platform: std::env::consts::OS.to_string(),
            config_hash: compute_hash(cfg_text),
            config_snapshot: cfg.clone(),
        }
    }
}

impl Summary {
    pub fn new(outcome: &InversionOutcome, target_misfit: f64, wall_time_ms: f64) -> Self {
        Self {
            phase: outcome.phase,
            stop_reason: outcome.stop_reason,
            converged: outcome.phase == Phase::Converged,
            iterations: outcome.iterations,
            beta: outcome.beta,
            phi_d: outcome.phi_d,
            phi_m: outcome.phi_m,
            target_misfit,
            n_data: outcome.predicted.len(),
            n_active: outcome.model.len(),
            wall_time_ms,
        }
    }
}

pub fn write_bundle(path: &Path, bundle: &ResultBundle) -> InversionResult<()> {
    let mut w = create(path)?;
    serde_json::to_writer_pretty(&mut w, bundle)?;
    writeln!(w)?;
    w.flush()?;
    Ok(())
}

pub fn compute_hash(data: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    data.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn timestamp_utc() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format_utc(secs)
}

fn format_utc(secs: u64) -> String {
    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    // Civil date from days since 1970-01-01 (proleptic Gregorian).
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        year,
        month,
        day,
        rem / 3600,
        (rem % 3600) / 60,
        rem % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("maginv_io_{}_{}", std::process::id(), name))
    }

    #[test]
    fn test_model_round_trip_is_exact() {
        let path = temp_path("model.txt");
        let model = array![1e-4, 0.123456789012345678, 0.0, 1.0, 3.3e-17];
        write_model(&path, &model).unwrap();
        let back = read_model(&path).unwrap();
        assert_eq!(back, model);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_read_model_missing_file() {
        let err = read_model(&temp_path("does_not_exist.txt")).unwrap_err();
        assert!(matches!(err, InversionError::FileNotFound { .. }));
    }

    #[test]
    fn test_read_model_reports_bad_line() {
        let path = temp_path("bad_model.txt");
        fs::write(&path, "1.0\n\nabc\n").unwrap();
        match read_model(&path).unwrap_err() {
            InversionError::Format { line, .. } => assert_eq!(line, 3),
            other => panic!("unexpected error {other}"),
        }
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_predicted_rows_repeat_receivers_per_component() {
        let path = temp_path("dpred.txt");
        let locs = array![[0.0, 0.0, 1.0], [1.0, 0.0, 1.0]];
        write_predicted(&path, &locs, &array![1.0, 2.0, 3.0, 4.0]).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[1].starts_with("0.000000 0.000000 1.000000"));
        assert!(lines[2].starts_with("1.000000 0.000000 1.000000"));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_predicted_length_mismatch() {
        let locs = array![[0.0, 0.0, 1.0], [1.0, 0.0, 1.0]];
        assert!(write_predicted(&temp_path("never.txt"), &locs, &array![1.0, 2.0, 3.0]).is_err());
    }

    #[test]
    fn test_history_csv_layout() {
        let path = temp_path("history.csv");
        let record = IterationRecord {
            iteration: 1,
            phase: Phase::L2,
            beta: 10.0,
            phi_d: 5.0,
            phi_m: 0.5,
            phi: 10.0,
            norms: [2.0; 4],
            epsilon: None,
            cg_iterations: 3,
            ls_iterations: 1,
            soft_failures: 0,
        };
        write_history(&path, &[record]).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        let header: Vec<&str> = lines.next().unwrap().split(',').collect();
        let row: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(header.len(), row.len());
        assert_eq!(row[0], "1");
        assert_eq!(row[1], "l2");
        assert_eq!(row[10], "");
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_format_utc() {
        assert_eq!(format_utc(0), "1970-01-01T00:00:00Z");
        assert_eq!(format_utc(951_782_400), "2000-02-29T00:00:00Z");
        assert_eq!(format_utc(1_700_000_000), "2023-11-14T22:13:20Z");
    }

    #[test]
    fn test_hash_is_stable_for_same_input() {
        assert_eq!(compute_hash("a = 1"), compute_hash("a = 1"));
        assert_ne!(compute_hash("a = 1"), compute_hash("a = 2"));
    }
}
