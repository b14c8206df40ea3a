use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use pistrap_core::progress::{Progress, Stage};
use std::cell::RefCell;
use std::collections::HashMap;
use std::time::Duration;

/// Draws one `indicatif` bar per stage. A stage with no known length gets a
/// spinner instead.
#[derive(Default)]
pub struct TerminalProgress {
    bars: RefCell<HashMap<Stage, ProgressBar>>,
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

fn color(stage: Stage) -> &'static str {
    match stage {
        Stage::Download => "cyan",
        Stage::Decompress => "blue",
        Stage::Write => "green",
    }
}

fn bar_style(stage: Stage) -> ProgressStyle {
    let template = format!(
        "{{prefix:12}} [{{elapsed_precise}}] [{{bar:40.{}/black}}] {{bytes}}/{{total_bytes}} ({{bytes_per_sec}}, {{eta}})",
        color(stage)
    );
    ProgressStyle::default_bar()
        .template(&template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("■ ")
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("{prefix:12} [{elapsed_precise}] {spinner} {bytes} ({bytes_per_sec})")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

impl Progress for TerminalProgress {
    fn begin(&self, stage: Stage, total: Option<u64>) {
        let bar = match total {
            Some(len) => ProgressBar::new(len).with_style(bar_style(stage)),
            None => {
                let spinner = ProgressBar::new_spinner().with_style(spinner_style());
                spinner.enable_steady_tick(Duration::from_millis(100));
                spinner
            }
        };
        bar.set_prefix(stage.label());
        if let Some(old) = self.bars.borrow_mut().insert(stage, bar) {
            old.finish_and_clear();
        }
    }

    fn update(&self, stage: Stage, done: u64) {
        if let Some(bar) = self.bars.borrow().get(&stage) {
            bar.set_position(done);
        }
    }

    fn finish(&self, stage: Stage) {
        if let Some(bar) = self.bars.borrow_mut().remove(&stage) {
            bar.finish_with_message(style("done").green().to_string());
        }
    }
}

impl Drop for TerminalProgress {
    fn drop(&mut self) {
        // Bars left over from an interrupted stage.
        for (_, bar) in self.bars.borrow_mut().drain() {
            bar.abandon();
        }
    }
}
