//! `bastionctl playback`: replay a session recording.
//!
//! Only `stdout` and `event` records are replayed. The pause before each one
//! is the gap since the previous replayed record, divided by `speed`.
//! Malformed lines are skipped.

use anyhow::{bail, Context, Result};
use bastion_core::audit::{AuditKind, AuditRecord};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

/// One replay step: wait, then write `output` (if any).
#[derive(Debug, PartialEq)]
pub struct Step {
    pub delay: Duration,
    pub output: Option<Vec<u8>>,
}

/// Turn a recording into replay steps.
pub fn plan(content: &str, speed: f64) -> Vec<Step> {
    let mut steps = Vec::new();
    let mut last: Option<i64> = None;
    for line in content.lines() {
        let Ok(record) = AuditRecord::parse_line(line) else {
            continue;
        };
        if !matches!(record.kind, AuditKind::Stdout | AuditKind::Event) {
            continue;
        }
        let gap_ms = last.map(|prev| (record.ts - prev).max(0)).unwrap_or(0);
        last = Some(record.ts);
        let delay = Duration::from_millis(gap_ms as u64).div_f64(speed);
        let output = match record.kind {
            AuditKind::Stdout => match record.decode_bytes() {
                Ok(bytes) => Some(bytes),
                Err(_) => continue,
            },
            _ => None,
        };
        steps.push(Step { delay, output });
    }
    steps
}

pub async fn run(file: &Path, speed: f64) -> Result<()> {
    if !(speed.is_finite() && speed > 0.0) {
        bail!("--speed must be a positive number");
    }
    let content = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("cannot read {}", file.display()))?;

    let mut stdout = std::io::stdout();
    for step in plan(&content, speed) {
        if !step.delay.is_zero() {
            tokio::time::sleep(step.delay).await;
        }
        if let Some(bytes) = step.output {
            stdout.write_all(&bytes)?;
            stdout.flush()?;
        }
    }
    println!("\n-- playback end --");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORDING: &str = r#"{"ts":1000,"type":"meta","v":{"user":"alice"}}
{"ts":1000,"type":"event","v":"session-start"}
{"ts":1200,"type":"stdin","v":"bHMNCg=="}
{"ts":1500,"type":"stdout","v":"ZmlsZS50eHQNCg=="}
not json at all
{"ts":1600,"type":"stdout","v":"%%%"}
{"ts":2500,"type":"event","v":"session-end"}
"#;

    #[test]
    fn replays_stdout_and_events_with_gaps() {
        let steps = plan(RECORDING, 1.0);
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0], Step { delay: Duration::ZERO, output: None });
        assert_eq!(steps[1].delay, Duration::from_millis(500));
        assert_eq!(steps[1].output.as_deref(), Some(&b"file.txt\r\n"[..]));
        // Measured from the last replayed record, the bad payload included.
        assert_eq!(steps[2].delay, Duration::from_millis(900));
        assert_eq!(steps[2].output, None);
    }

    #[test]
    fn speed_scales_delays() {
        let steps = plan(RECORDING, 10.0);
        assert_eq!(steps[1].delay, Duration::from_millis(50));
    }

    #[test]
    fn clock_skew_never_goes_negative() {
        let content = r#"{"ts":2000,"type":"stdout","v":"YQ=="}
{"ts":1000,"type":"stdout","v":"Yg=="}"#;
        let steps = plan(content, 1.0);
        assert_eq!(steps[1].delay, Duration::ZERO);
    }
}
