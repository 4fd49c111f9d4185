// Flexible duration parsing for config values
//
// Accepts humantime strings ("10s", "500ms", "2m"), a bare integer meaning
// seconds, and the `秒` suffix form emitted by some upstream tooling.

use std::time::Duration;

use anyhow::{bail, Context, Result};

pub fn parse_flexible(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        bail!("duration value is empty");
    }

    if let Ok(secs) = trimmed.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    if let Some(head) = trimmed.strip_suffix('秒') {
        let secs: u64 = head
            .trim()
            .parse()
            .with_context(|| format!("invalid duration '{input}'"))?;
        return Ok(Duration::from_secs(secs));
    }

    humantime::parse_duration(trimmed).with_context(|| format!("invalid duration '{input}'"))
}
