// Retry plan computation
//
// The plan is computed once at startup: base delays from configuration,
// extended by doubling the last entry until there is one delay per retry
// (max_attempts total attempts including the first try).

use std::time::Duration;

const DEFAULT_DELAYS: [Duration; 3] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    plan: Vec<Duration>,
}

impl RetryPolicy {
    /// `delays_spec` is a list like "500ms,1s,2s". Tokens that fail to
    /// parse are skipped; when nothing parses the hard-coded default ladder
    /// is used.
    pub fn new(enabled: bool, max_attempts: u32, delays_spec: &str) -> Self {
        let base = parse_delays(delays_spec);
        Self {
            enabled,
            max_attempts: max_attempts.max(1),
            plan: build_plan(&base, max_attempts.max(1)),
        }
    }

    /// Delay before retrying after the given 0-based failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.plan
            .get(attempt as usize)
            .or_else(|| self.plan.last())
            .copied()
            .unwrap_or(Duration::from_secs(1))
    }

    #[cfg(test)]
    pub(crate) fn plan(&self) -> &[Duration] {
        &self.plan
    }
}

fn parse_delays(spec: &str) -> Vec<Duration> {
    let parsed: Vec<Duration> = spec
        .split([',', ';', ' '])
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .filter_map(|t| humantime::parse_duration(t).ok())
        .collect();

    if parsed.is_empty() {
        DEFAULT_DELAYS.to_vec()
    } else {
        parsed
    }
}

fn build_plan(base: &[Duration], max_attempts: u32) -> Vec<Duration> {
    let want = max_attempts.saturating_sub(1) as usize;
    let mut plan: Vec<Duration> = base.iter().copied().take(want).collect();
    while plan.len() < want {
        let last = plan.last().copied().unwrap_or(Duration::from_secs(1));
        plan.push(last.saturating_mul(2));
    }
    plan
}
