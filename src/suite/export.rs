/// Export suite summaries to JSON and CSV
use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::runner::SuiteSummary;
use crate::condition::ConditionStatus;
use crate::error::PersistenceError;
use crate::io::write_atomically;

#[derive(Clone, Debug, PartialEq)]
pub struct SummaryPaths {
    pub json: PathBuf,
    pub csv: PathBuf,
}

pub fn export_summary(dir: &Path, summary: &SuiteSummary) -> Result<SummaryPaths, PersistenceError> {
    std::fs::create_dir_all(dir).map_err(|e| PersistenceError::io(dir, e))?;

    let json = dir.join(format!("{}_summary.json", summary.study_name));
    write_atomically(&json, |w| Ok(serde_json::to_writer_pretty(w, summary)?))?;

    let csv = dir.join(format!("{}_summary.csv", summary.study_name));
    write_atomically(&csv, |w| {
        write_summary_csv(w, summary).map_err(|e| PersistenceError::io(&csv, e))
    })?;

    println!("📊 Summary saved to: {}", json.display());
    Ok(SummaryPaths { json, csv })
}

/// Quotes a field when it contains a delimiter, quote or newline.
fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn write_summary_csv<W: Write>(file: &mut W, summary: &SuiteSummary) -> std::io::Result<()> {

    // One rate column per population seen in any record
    let populations: BTreeSet<&str> = summary
        .records
        .iter()
        .filter_map(|r| r.metadata.as_ref())
        .flat_map(|m| m.statistics.population_rates.iter().map(|p| p.population.as_str()))
        .collect();

    write!(
        file,
        "condition,description,ad_stage,ad_enabled,status,failed_stage,reason,pulse_count,stimulated_cells,total_spikes"
    )?;
    for pop in &populations {
        write!(file, ",{}_rate_Hz", pop)?;
    }
    writeln!(file)?;

    for record in &summary.records {
        let (stage, reason) = match &record.status {
            ConditionStatus::Failed { stage, reason } => (stage.to_string(), reason.as_str()),
            _ => (String::new(), ""),
        };
        write!(
            file,
            "{},{},{},{},{},{},{}",
            csv_field(&record.name),
            csv_field(&record.description),
            record.ad_stage.number(),
            record.ad_enabled,
            record.status.label(),
            stage,
            csv_field(reason)
        )?;
        match &record.metadata {
            Some(m) => {
                write!(
                    file,
                    ",{},{},{}",
                    m.pulse_count, m.stimulated_cells, m.statistics.total_spikes
                )?;
                for pop in &populations {
                    match m.statistics.rate_of(pop) {
                        Some(rate) => write!(file, ",{:.4}", rate)?,
                        None => write!(file, ",")?,
                    }
                }
            }
            None => {
                write!(file, ",,,")?;
                for _ in &populations {
                    write!(file, ",")?;
                }
            }
        }
        writeln!(file)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::RunStage;
    use crate::pathology::AdStage;
    use crate::suite::runner::{ConditionRecord, SuiteStatus};

    #[test]
    fn reasons_with_commas_are_quoted() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a, b"), "\"a, b\"");
        assert_eq!(csv_field("say \"x\""), "\"say \"\"x\"\"\"");
    }

    #[test]
    fn writes_one_row_per_condition() {
        let dir = tempfile::tempdir().unwrap();
        let summary = SuiteSummary {
            study_name: "s".into(),
            status: SuiteStatus::Aborted,
            records: vec![
                ConditionRecord {
                    name: "Healthy_60Vm".into(),
                    description: "healthy".into(),
                    ad_stage: AdStage::Healthy,
                    ad_enabled: false,
                    status: ConditionStatus::Failed {
                        stage: RunStage::Integrated,
                        reason: "diverged, badly".into(),
                    },
                    record_path: None,
                    metadata: None,
                },
                ConditionRecord {
                    name: "AD1_60Vm".into(),
                    description: "ad1".into(),
                    ad_stage: AdStage::Hyperexcitable,
                    ad_enabled: true,
                    status: ConditionStatus::NotAttempted,
                    record_path: None,
                    metadata: None,
                },
            ],
        };
        let paths = export_summary(dir.path(), &summary).unwrap();
        let csv = std::fs::read_to_string(&paths.csv).unwrap();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("failed,INTEGRATED,\"diverged, badly\""));
        assert!(lines[2].starts_with("AD1_60Vm,ad1,1,true,not_attempted,"));

        let json = std::fs::read_to_string(&paths.json).unwrap();
        let back: SuiteSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back, summary);
    }

    fn empty_summary() -> SuiteSummary {
        SuiteSummary {
            study_name: "s".into(),
            status: SuiteStatus::Complete,
            records: Vec::new(),
        }
    }

    #[test]
    fn leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        export_summary(dir.path(), &empty_summary()).unwrap();
        let mut names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, ["s_summary.csv", "s_summary.json"]);
    }

    #[test]
    fn unwritable_summary_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("s_summary.json")).unwrap();
        assert!(matches!(
            export_summary(dir.path(), &empty_summary()),
            Err(PersistenceError::Io { .. })
        ));
    }
}
