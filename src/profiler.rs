//! Wall-clock accounting for the stages of a condition run.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

/// Timed parts of the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Section {
    Suite,
    Condition,
    EngineCreate,
    Integrate,
    LfpCompute,
    Spectra,
    SaveOutput,
    LoadOutput,
}

impl Section {
    pub fn name(self) -> &'static str {
        match self {
            Section::Suite => "suite",
            Section::Condition => "condition",
            Section::EngineCreate => "engine_create",
            Section::Integrate => "integrate",
            Section::LfpCompute => "lfp_compute",
            Section::Spectra => "spectra",
            Section::SaveOutput => "save_output",
            Section::LoadOutput => "load_output",
        }
    }

    /// Sections nested inside a condition run.
    pub fn is_condition_stage(self) -> bool {
        !matches!(self, Section::Suite | Section::Condition | Section::LoadOutput)
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.name())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SectionTiming {
    pub total: Duration,
    pub calls: u32,
}

impl SectionTiming {
    pub fn mean(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            self.total / self.calls
        }
    }
}

#[derive(Default)]
pub struct Profiler {
    pub timings: BTreeMap<Section, SectionTiming>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, section: Section, elapsed: Duration) {
        let entry = self.timings.entry(section).or_default();
        entry.total += elapsed;
        entry.calls += 1;
    }

    pub fn finish(&mut self, guard: &ProfilerGuard) {
        self.record(guard.section, guard.start.elapsed());
    }

    /// Sections sorted by total time, longest first.
    pub fn report_sorted(&self) -> Vec<(Section, SectionTiming)> {
        let mut v: Vec<_> = self.timings.iter().map(|(s, t)| (*s, *t)).collect();
        v.sort_by(|a, b| b.1.total.cmp(&a.1.total));
        v
    }

    /// Share of total condition time spent in `section` (0..=1).
    pub fn share_of_conditions(&self, section: Section) -> Option<f64> {
        let condition = self.timings.get(&Section::Condition)?.total.as_secs_f64();
        let part = self.timings.get(&section)?.total.as_secs_f64();
        (condition > 0.0).then(|| part / condition)
    }

    pub fn clear(&mut self) {
        self.timings.clear();
    }

    pub fn log_and_clear(&mut self) {
        for (section, timing) in self.report_sorted() {
            match self.share_of_conditions(section).filter(|_| section.is_condition_stage()) {
                Some(share) => tracing::info!(
                    "{:<14} {:>10.3?} over {} calls (mean {:.3?}, {:.1}% of conditions)",
                    section,
                    timing.total,
                    timing.calls,
                    timing.mean(),
                    share * 100.0
                ),
                None => tracing::info!(
                    "{:<14} {:>10.3?} over {} calls",
                    section,
                    timing.total,
                    timing.calls
                ),
            }
        }
        self.clear();
    }
}

pub struct ProfilerGuard {
    section: Section,
    start: Instant,
}

/// Starts timing `section`; the global profiler is updated when the guard drops.
pub fn start(section: Section) -> ProfilerGuard {
    ProfilerGuard {
        section,
        start: Instant::now(),
    }
}

#[cfg(feature = "profiling")]
impl Drop for ProfilerGuard {
    fn drop(&mut self) {
        crate::PROFILER.lock().finish(self);
    }
}

/// Times the rest of the enclosing scope when the `profiling` feature is on.
#[macro_export]
macro_rules! profile_scope {
    ($section:ident) => {
        #[cfg(feature = "profiling")]
        let _guard = $crate::profiler::start($crate::profiler::Section::$section);
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_per_section() {
        let mut p = Profiler::new();
        for _ in 0..3 {
            p.record(Section::LfpCompute, Duration::from_millis(2));
        }
        p.record(Section::Integrate, Duration::from_millis(30));
        p.record(Section::Condition, Duration::from_millis(40));

        let report = p.report_sorted();
        assert_eq!(report.len(), 3);
        assert_eq!(report[0].0, Section::Condition);
        assert_eq!(report[1].0, Section::Integrate);
        let lfp = p.timings[&Section::LfpCompute];
        assert_eq!(lfp.calls, 3);
        assert_eq!(lfp.mean(), Duration::from_millis(2));
        assert!((p.share_of_conditions(Section::Integrate).unwrap() - 0.75).abs() < 1e-9);
        assert_eq!(p.share_of_conditions(Section::SaveOutput), None);
    }

    #[test]
    fn guard_records_its_section() {
        let mut p = Profiler::new();
        let guard = start(Section::SaveOutput);
        p.finish(&guard);
        assert_eq!(p.timings[&Section::SaveOutput].calls, 1);
        p.clear();
        assert!(p.timings.is_empty());
    }
}
