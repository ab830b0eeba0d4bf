//! Sampling profiler
//!
//! The watchdog counts elapsed sample periods; whoever next reaches a safe
//! point (the instruction hook or a host callback trampoline) attributes the
//! pending samples to the function it is running.

use std::collections::HashMap;
use std::time::Duration;

use mlua::Debug;

/// Units for [`Profiler::report`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfilerUnits {
    /// Raw sample counts
    Samples,

    /// Samples multiplied by the sample period
    Seconds,

    /// Share of all samples, 0 to 100
    Percent,
}

/// One line of a profiler report: function id and value in the requested units
pub type ProfileEntry = (String, f64);

#[derive(Debug, Default)]
pub(crate) struct Profiler {
    period: Option<Duration>,
    /// Period of the most recent collection, kept after disabling
    last_period: Duration,
    counts: HashMap<String, u64>,
    total: u64,
}

impl Profiler {
    /// Start collecting with the given period, discarding old samples
    pub fn enable(&mut self, period: Duration) {
        self.period = Some(period);
        self.last_period = period;
        self.counts.clear();
        self.total = 0;
    }

    /// Stop collecting; collected samples stay available
    pub fn disable(&mut self) {
        self.period = None;
    }

    pub fn is_enabled(&self) -> bool {
        self.period.is_some()
    }

    pub fn record(&mut self, function: String, samples: u64) {
        if samples == 0 || !self.is_enabled() {
            return;
        }
        *self.counts.entry(function).or_insert(0) += samples;
        self.total += samples;
    }

    pub fn total_samples(&self) -> u64 {
        self.total
    }

    /// Per-function figures, largest first
    pub fn report(&self, units: ProfilerUnits) -> Vec<ProfileEntry> {
        let mut rows: Vec<(&String, u64)> = self.counts.iter().map(|(k, v)| (k, *v)).collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

        let scale = match units {
            ProfilerUnits::Samples => 1.0,
            ProfilerUnits::Seconds => self.last_period.as_secs_f64(),
            ProfilerUnits::Percent if self.total > 0 => 100.0 / self.total as f64,
            ProfilerUnits::Percent => 0.0,
        };
        rows.into_iter()
            .map(|(name, count)| (name.clone(), count as f64 * scale))
            .collect()
    }
}

/// Name a sampled function: `name <src:line>`, `<src:line>`,
/// `[main chunk] <src>`, or just the name for native functions
pub(crate) fn function_id(debug: &Debug) -> String {
    let source = debug.source();
    let names = debug.names();
    let name = names.name.as_ref().map(|n| n.to_string());
    let short_src = source
        .short_src
        .as_ref()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "?".to_string());
    let line_defined = source.line_defined.and_then(|line| u32::try_from(line).ok()).filter(|line| *line > 0);

    if source.what == "main" {
        return format!("[main chunk] <{}>", short_src);
    }
    match (name, line_defined) {
        (Some(name), Some(line)) => format!("{} <{}:{}>", name, short_src, line),
        (Some(name), None) => name,
        (None, Some(line)) => format!("<{}:{}>", short_src, line),
        (None, None) => "?".to_string(),
    }
}
