// profiling.rs — Per-stage transfer and kernel timing.
//
// Each stage produces one `StageTiming`: the host↔device transfer time the
// stage incurred (zero-fills, uploads, diagnostic readbacks) and the device
// execution time of its kernel. Execution time is optional because not
// every backend can timestamp kernels; without it the execution line is
// simply left out.

use std::fmt;
use std::time::Duration;

use log::info;

/// Timing of one pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageTiming {
    pub transfer: Duration,
    /// Kernel end minus kernel start, if the backend timestamps kernels.
    pub execution: Option<Duration>,
}

impl StageTiming {
    pub fn transfer_us(&self) -> u128 {
        self.transfer.as_micros()
    }

    pub fn execution_us(&self) -> Option<u128> {
        self.execution.map(|d| d.as_micros())
    }

    /// The lines logged for this stage.
    pub fn lines(&self, label: &str) -> Vec<String> {
        let mut lines = vec![format!("{label} transfer time [us]: {}", self.transfer_us())];
        if let Some(us) = self.execution_us() {
            lines.push(format!("{label} kernel execution time [us]: {us}"));
        }
        lines
    }
}

/// Timings of all stages of one run, in stage order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfilingReport {
    stages: Vec<(String, StageTiming)>,
}

impl ProfilingReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, label: impl Into<String>, timing: StageTiming) {
        self.stages.push((label.into(), timing));
    }

    pub fn stages(&self) -> &[(String, StageTiming)] {
        &self.stages
    }

    pub fn get(&self, label: &str) -> Option<&StageTiming> {
        self.stages.iter().find(|(l, _)| l == label).map(|(_, t)| t)
    }

    pub fn total_transfer(&self) -> Duration {
        self.stages.iter().map(|(_, t)| t.transfer).sum()
    }

    /// Sum of kernel times, or `None` if any stage lacks one.
    pub fn total_execution(&self) -> Option<Duration> {
        self.stages.iter().map(|(_, t)| t.execution).sum()
    }

    /// Emit every stage, then the totals.
    pub fn log(&self) {
        for line in self.to_string().lines() {
            info!("{line}");
        }
    }
}

impl fmt::Display for ProfilingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, timing) in &self.stages {
            for line in timing.lines(label) {
                writeln!(f, "{line}")?;
            }
        }
        write!(f, "total transfer time [us]: {}", self.total_transfer().as_micros())?;
        if let Some(exec) = self.total_execution() {
            write!(f, "\ntotal kernel execution time [us]: {}", exec.as_micros())?;
        }
        Ok(())
    }
}
