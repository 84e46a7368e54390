//! Terminal rendering of per-target progress
//!
//! On a terminal every target owns one indicatif row in a shared
//! `MultiProgress`, and each step of its session replaces what that row
//! shows. Without a terminal, steps are printed as plain lines.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use nrfmprog_lib::TargetId;
use nrfmprog_lib::progress::{
    ProgressCallback, ProgressCallbackArc, ProgressId, ProgressInfo, ProgressOperation,
    ProgressStatus, ProgressType,
};
use std::collections::HashMap;
use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SPINNER_TEMPLATE: &str = "{prefix:>12} {spinner} {msg}";
const BAR_TEMPLATE: &str =
    "{prefix:>12} {msg} [{wide_bar}] {bytes}/{total_bytes} {bytes_per_sec}";
const DONE_TEMPLATE: &str = "{prefix:>12} {msg}";

struct ActiveStep {
    target: TargetId,
    operation: ProgressOperation,
}

/// indicatif rendering, one row per target
pub struct IndicatifProgressCallback {
    multi_progress: MultiProgress,
    rows: Mutex<HashMap<TargetId, ProgressBar>>,
    steps: Mutex<HashMap<u64, ActiveStep>>,
    next_id: AtomicU64,
}

impl IndicatifProgressCallback {
    pub fn new() -> Self {
        Self {
            multi_progress: MultiProgress::new(),
            rows: Mutex::new(HashMap::new()),
            steps: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn row(&self, target: &TargetId) -> Option<ProgressBar> {
        let mut rows = self.rows.lock().ok()?;
        let row = rows.entry(target.clone()).or_insert_with(|| {
            let row = self.multi_progress.add(ProgressBar::new_spinner());
            row.set_prefix(target.to_string());
            row
        });
        Some(row.clone())
    }

    fn row_for_step(&self, id: ProgressId) -> Option<ProgressBar> {
        let target = self.steps.lock().ok()?.get(&id.0)?.target.clone();
        self.rows.lock().ok()?.get(&target).cloned()
    }
}

impl Default for IndicatifProgressCallback {
    fn default() -> Self {
        Self::new()
    }
}

fn style(template: &str) -> ProgressStyle {
    ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-")
}

impl ProgressCallback for IndicatifProgressCallback {
    fn start(&self, info: ProgressInfo) -> ProgressId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if let Some(row) = self.row(&info.target) {
            match info.progress_type {
                ProgressType::Spinner => {
                    row.set_style(style(SPINNER_TEMPLATE));
                    row.enable_steady_tick(Duration::from_millis(100));
                }
                ProgressType::Bar { total } => {
                    row.disable_steady_tick();
                    row.set_style(style(BAR_TEMPLATE));
                    row.set_length(total);
                    row.set_position(info.current.unwrap_or(0));
                }
            }
            row.set_message(info.operation.to_string());
        }

        if let Ok(mut steps) = self.steps.lock() {
            steps.insert(
                id,
                ActiveStep {
                    target: info.target,
                    operation: info.operation,
                },
            );
        }
        ProgressId(id)
    }

    fn update_message(&self, id: ProgressId, message: String) {
        if let Some(row) = self.row_for_step(id) {
            row.set_message(message);
        }
    }

    fn increment(&self, id: ProgressId, delta: u64) {
        if let Some(row) = self.row_for_step(id) {
            row.inc(delta);
        }
    }

    fn finish(&self, id: ProgressId, status: ProgressStatus) {
        let Some(row) = self.row_for_step(id) else {
            return;
        };
        let Some(step) = self.steps.lock().ok().and_then(|mut s| s.remove(&id.0)) else {
            return;
        };

        if status == ProgressStatus::Success && step.operation != ProgressOperation::Disconnect {
            // the next step takes over the row
            return;
        }

        row.disable_steady_tick();
        row.set_style(style(DONE_TEMPLATE));
        match status {
            ProgressStatus::Success => row.finish_with_message("Done"),
            ProgressStatus::Failed | ProgressStatus::Aborted => {
                row.abandon_with_message(format!("{}: {}", step.operation, status))
            }
        }
    }
}

/// Plain line output for logs and CI
pub struct LineProgressCallback {
    bars: Mutex<HashMap<u64, LineBar>>,
    next_id: AtomicU64,
}

struct LineBar {
    prefix: String,
    total: u64,
    current: u64,
    last_decile: u64,
}

impl LineProgressCallback {
    pub fn new() -> Self {
        Self {
            bars: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn print_line(prefix: &str, line: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "[{}] {}", prefix, line);
        let _ = stdout.flush();
    }

    fn percent(current: u64, total: u64) -> u64 {
        if total == 0 {
            return 100;
        }
        (current.saturating_mul(100) / total).min(100)
    }
}

impl Default for LineProgressCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressCallback for LineProgressCallback {
    fn start(&self, info: ProgressInfo) -> ProgressId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Self::print_line(&info.prefix, &info.operation.to_string());

        let total = match info.progress_type {
            ProgressType::Bar { total } => total,
            ProgressType::Spinner => 0,
        };
        let current = info.current.unwrap_or(0);
        if let Ok(mut bars) = self.bars.lock() {
            bars.insert(
                id,
                LineBar {
                    prefix: info.prefix,
                    total,
                    current,
                    last_decile: Self::percent(current, total) / 10,
                },
            );
        }
        ProgressId(id)
    }

    fn update_message(&self, id: ProgressId, message: String) {
        let prefix = match self.bars.lock() {
            Ok(bars) => bars.get(&id.0).map(|bar| bar.prefix.clone()),
            Err(_) => None,
        };
        if let Some(prefix) = prefix {
            Self::print_line(&prefix, &message);
        }
    }

    fn increment(&self, id: ProgressId, delta: u64) {
        let mut line = None;
        if let Ok(mut bars) = self.bars.lock()
            && let Some(bar) = bars.get_mut(&id.0)
            && bar.total > 0
        {
            bar.current = bar.current.saturating_add(delta);
            let percent = Self::percent(bar.current, bar.total);
            // one line per 10% step
            if percent / 10 != bar.last_decile {
                bar.last_decile = percent / 10;
                line = Some((bar.prefix.clone(), percent));
            }
        }

        if let Some((prefix, percent)) = line {
            Self::print_line(&prefix, &format!("{}%", percent));
        }
    }

    fn finish(&self, id: ProgressId, status: ProgressStatus) {
        let removed = match self.bars.lock() {
            Ok(mut bars) => bars.remove(&id.0),
            Err(_) => None,
        };
        if let Some(bar) = removed {
            Self::print_line(&bar.prefix, &status.to_string());
        }
    }
}

/// Picks the renderer for the current stdout
pub fn create_progress_callback() -> ProgressCallbackArc {
    if io::stdout().is_terminal() {
        Arc::new(IndicatifProgressCallback::new())
    } else {
        Arc::new(LineProgressCallback::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent() {
        assert_eq!(LineProgressCallback::percent(0, 0), 100);
        assert_eq!(LineProgressCallback::percent(50, 200), 25);
        assert_eq!(LineProgressCallback::percent(300, 200), 100);
    }

    #[test]
    fn test_line_callback_tracks_steps() {
        let callback = LineProgressCallback::new();
        let id = callback.start(ProgressInfo {
            progress_type: ProgressType::Bar { total: 100 },
            target: TargetId::from("1"),
            prefix: "1:0x02".to_string(),
            operation: ProgressOperation::Write {
                address: 0,
                size: 100,
            },
            current: Some(0),
        });

        callback.increment(id, 55);
        {
            let bars = callback.bars.lock().unwrap();
            let bar = bars.get(&id.0).unwrap();
            assert_eq!(bar.current, 55);
            assert_eq!(bar.last_decile, 5);
        }

        callback.finish(id, ProgressStatus::Success);
        assert!(callback.bars.lock().unwrap().is_empty());
    }

    #[test]
    fn test_indicatif_row_is_shared_by_steps_of_a_target() {
        let callback = IndicatifProgressCallback::new();
        let info = |operation: ProgressOperation| ProgressInfo {
            progress_type: ProgressType::Spinner,
            target: TargetId::from("683000001"),
            prefix: String::new(),
            operation,
            current: None,
        };

        let connect = callback.start(info(ProgressOperation::Connect));
        callback.finish(connect, ProgressStatus::Success);
        let disconnect = callback.start(info(ProgressOperation::Disconnect));

        assert_eq!(callback.rows.lock().unwrap().len(), 1);
        assert_eq!(callback.steps.lock().unwrap().len(), 1);
        callback.finish(disconnect, ProgressStatus::Success);
        assert!(callback.steps.lock().unwrap().is_empty());
        let rows = callback.rows.lock().unwrap();
        assert!(rows.values().all(|row| row.is_finished()));
    }
}
