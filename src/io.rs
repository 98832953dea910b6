use crate::profile_scope;
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use crate::analysis::ConditionStatistics;
use crate::error::PersistenceError;
use crate::lfp::LfpRecording;
use crate::pathology::AdStage;
use crate::stim::StimulationProtocol;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Json,
    /// Gzip-compressed bincode.
    Binary,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Binary => "bin.gz",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub condition: String,
    pub description: String,
    pub ad_stage: AdStage,
    pub ad_enabled: bool,
    pub ad_populations: Vec<String>,
    pub protocol: StimulationProtocol,
    pub duration_ms: f64,
    pub recording_dt_ms: f64,
    pub conductivity_s_per_m: f64,
    pub pulse_count: usize,
    pub pulse_amplitude_na: f64,
    pub stimulated_cells: usize,
    pub injections: usize,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub statistics: ConditionStatistics,
}

/// Immutable per-condition record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimulationOutput {
    /// Spike times (ms) keyed by cell id.
    pub spike_times: BTreeMap<u32, Vec<f64>>,
    /// Population of every cell, keyed by cell id.
    pub cell_populations: BTreeMap<u32, String>,
    pub lfp: LfpRecording,
    pub metadata: RecordMetadata,
}

/// Files written for one condition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedPaths {
    pub record: PathBuf,
    pub lfp_csv: PathBuf,
}

pub fn record_path(dir: &Path, condition: &str, format: OutputFormat) -> PathBuf {
    dir.join(format!("{}_data.{}", condition, format.extension()))
}

pub fn lfp_csv_path(dir: &Path, condition: &str) -> PathBuf {
    dir.join(format!("{}_lfp.csv", condition))
}

/// Writes the record and its LFP table into `dir`.
pub fn save_output(
    dir: &Path,
    output: &SimulationOutput,
    format: OutputFormat,
) -> Result<PersistedPaths, PersistenceError> {
    profile_scope!(SaveOutput);
    std::fs::create_dir_all(dir).map_err(|e| PersistenceError::io(dir, e))?;
    let condition = &output.metadata.condition;
    let record = record_path(dir, condition, format);
    write_atomically(&record, |writer| match format {
        OutputFormat::Json => Ok(serde_json::to_writer_pretty(writer, output)?),
        OutputFormat::Binary => {
            let mut encoder = GzEncoder::new(writer, Compression::fast());
            bincode::serialize_into(&mut encoder, output)?;
            let inner = encoder.finish().map_err(|e| PersistenceError::io(&record, e))?;
            inner.flush().map_err(|e| PersistenceError::io(&record, e))?;
            Ok(())
        }
    })?;
    let lfp_csv = lfp_csv_path(dir, condition);
    write_lfp_csv(&lfp_csv, &output.lfp)?;
    Ok(PersistedPaths { record, lfp_csv })
}

/// Writes to `<path>.tmp` first and renames, so an interrupted write never
/// truncates an existing file.
pub(crate) fn write_atomically<F>(path: &Path, write: F) -> Result<(), PersistenceError>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<(), PersistenceError>,
{
    let tmp_path = path.with_extension({
        let mut os = path.extension().map(|e| e.to_os_string()).unwrap_or_default();
        os.push(".tmp");
        os
    });
    {
        let file = File::create(&tmp_path).map_err(|e| PersistenceError::io(&tmp_path, e))?;
        let mut writer = BufWriter::new(file);
        write(&mut writer)?;
        writer.flush().map_err(|e| PersistenceError::io(&tmp_path, e))?;
    }
    std::fs::rename(&tmp_path, path).map_err(|e| PersistenceError::io(path, e))
}

/// `time_ms` followed by one column per electrode, in electrode order.
pub fn write_lfp_csv(path: &Path, lfp: &LfpRecording) -> Result<(), PersistenceError> {
    write_atomically(path, |w| {
        let io = |e| PersistenceError::io(path, e);
        write!(w, "time_ms").map_err(io)?;
        for (i, e) in lfp.electrodes.iter().enumerate() {
            write!(w, ",e{}_{}_{}_{}", i, e.x, e.y, e.z).map_err(io)?;
        }
        writeln!(w).map_err(io)?;
        for sample in 0..lfp.sample_count() {
            write!(w, "{:.4}", lfp.time_ms(sample)).map_err(io)?;
            for trace in &lfp.traces {
                write!(w, ",{:.6e}", trace[sample]).map_err(io)?;
            }
            writeln!(w).map_err(io)?;
        }
        Ok(())
    })
}

/// Reads a record written by [`save_output`] in either format.
pub fn load_output<P: AsRef<Path>>(path: P) -> Result<SimulationOutput, PersistenceError> {
    profile_scope!(LoadOutput);
    let path = path.as_ref();
    let data = std::fs::read(path).map_err(|e| PersistenceError::io(path, e))?;
    match maybe_decompress_gzip(&data).map_err(|e| PersistenceError::io(path, e))? {
        Some(decoded) => Ok(bincode::deserialize(&decoded)?),
        None => Ok(serde_json::from_slice(&data)?),
    }
}

fn maybe_decompress_gzip(data: &[u8]) -> std::io::Result<Option<Vec<u8>>> {
    if data.len() < 2 || data[0] != 0x1f || data[1] != 0x8b {
        return Ok(None);
    }

    let mut decoder = GzDecoder::new(Cursor::new(data));
    let mut decoded = Vec::new();
    decoder.read_to_end(&mut decoded)?;
    Ok(Some(decoded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lfp::ElectrodePosition;

    fn output() -> SimulationOutput {
        let protocol = StimulationProtocol::new(60.0, 30.0, 2.0, 8.0, 1.0, "HL23PYR", None).unwrap();
        SimulationOutput {
            spike_times: BTreeMap::from([(0, vec![1.5, 7.25]), (3, vec![])]),
            cell_populations: BTreeMap::from([(0, "HL23PYR".into()), (3, "HL23PV".into())]),
            lfp: LfpRecording {
                sample_dt_ms: 0.1,
                electrodes: ElectrodePosition::default_array()[..2].to_vec(),
                traces: vec![vec![0.1, -0.2, 0.3], vec![1e-4, 0.0, -1e-4]],
            },
            metadata: RecordMetadata {
                condition: "Healthy_60Vm".into(),
                description: "healthy".into(),
                ad_stage: AdStage::Healthy,
                ad_enabled: false,
                ad_populations: Vec::new(),
                protocol,
                duration_ms: 10.0,
                recording_dt_ms: 0.1,
                conductivity_s_per_m: 0.3,
                pulse_count: 0,
                pulse_amplitude_na: 1.5,
                stimulated_cells: 1,
                injections: 0,
                warnings: vec!["none".into()],
                statistics: ConditionStatistics::default(),
            },
        }
    }

    #[test]
    fn both_formats_reload_identically() {
        let dir = tempfile::tempdir().unwrap();
        for format in [OutputFormat::Json, OutputFormat::Binary] {
            let paths = save_output(dir.path(), &output(), format).unwrap();
            assert!(paths.record.to_string_lossy().ends_with(format.extension()));
            assert_eq!(load_output(&paths.record).unwrap(), output());
        }
    }

    #[test]
    fn lfp_csv_has_one_column_per_electrode() {
        let dir = tempfile::tempdir().unwrap();
        let paths = save_output(dir.path(), &output(), OutputFormat::Json).unwrap();
        let csv = std::fs::read_to_string(paths.lfp_csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("time_ms,e0_"));
        assert!(lines.iter().all(|l| l.split(',').count() == 3));
        assert!(!dir.path().join("Healthy_60Vm_data.json.tmp").exists());
    }
}
