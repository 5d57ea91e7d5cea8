//! Download progress indicators.
//!
//! Thin wrappers around `indicatif` with consistent styling. Every bar is
//! hidden when the `VPNMUPD_NO_PROGRESS` environment variable is set or when
//! progress is disabled explicitly, as the daemon does.

use indicatif::{
    MultiProgress as IndicatifMulti, ProgressBar as IndicatifBar, ProgressStyle as IndicatifStyle,
};
use std::time::Duration;

use crate::constants::NO_PROGRESS_ENV_VAR;

/// Checks if progress bars should be disabled.
fn is_progress_disabled() -> bool {
    std::env::var(NO_PROGRESS_ENV_VAR).is_ok()
}

/// A progress bar for one download.
///
/// The bar starts as a spinner; [`ProgressBar::set_length`] turns it into a
/// byte counter once the content length is known.
#[derive(Clone, Debug)]
pub struct ProgressBar {
    inner: IndicatifBar,
}

impl ProgressBar {
    /// A bar that never draws anything.
    #[must_use]
    pub fn hidden() -> Self {
        Self {
            inner: IndicatifBar::hidden(),
        }
    }

    /// A download bar prefixed with `name`, showing `message`.
    pub fn download(name: &str, message: impl Into<String>) -> Self {
        if is_progress_disabled() {
            return Self::hidden();
        }

        let bar = IndicatifBar::new_spinner();
        bar.set_style(spinner_style());
        bar.set_prefix(name.to_string());
        bar.set_message(message.into());
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { inner: bar }
    }

    /// Switch to a byte bar of the given total length.
    pub fn set_length(&self, len: u64) {
        self.inner.set_length(len);
        self.inner.set_style(bytes_style());
    }

    /// Advance by `delta` bytes.
    pub fn inc(&self, delta: u64) {
        self.inner.inc(delta);
    }

    /// Current position in bytes.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.inner.position()
    }

    /// Replace the message shown after the bar.
    pub fn set_message(&self, msg: impl Into<String>) {
        self.inner.set_message(msg.into());
    }

    /// Stop the bar, leaving `msg` on screen.
    pub fn finish_with_message(&self, msg: impl Into<String>) {
        self.inner.finish_with_message(msg.into());
    }

    /// Stop the bar and remove it from the screen.
    pub fn finish_and_clear(&self) {
        self.inner.finish_and_clear();
    }
}

/// A group of bars drawn together, one per concurrent download.
#[derive(Clone, Debug)]
pub struct MultiProgress {
    inner: Option<IndicatifMulti>,
}

impl MultiProgress {
    /// A group that draws its bars unless progress is disabled by
    /// environment.
    #[must_use]
    pub fn new() -> Self {
        let inner = if is_progress_disabled() {
            None
        } else {
            Some(IndicatifMulti::new())
        };
        Self { inner }
    }

    /// A group whose bars are all hidden.
    #[must_use]
    pub const fn disabled() -> Self {
        Self { inner: None }
    }

    /// Whether bars added to this group are drawn.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Create a download bar and attach it to the group.
    pub fn download_bar(&self, name: &str, message: impl Into<String>) -> ProgressBar {
        match &self.inner {
            Some(multi) => {
                let bar = ProgressBar::download(name, message);
                ProgressBar {
                    inner: multi.add(bar.inner),
                }
            }
            None => ProgressBar::hidden(),
        }
    }
}

impl Default for MultiProgress {
    fn default() -> Self {
        Self::new()
    }
}

fn spinner_style() -> IndicatifStyle {
    IndicatifStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏ ")
        .template("{spinner:.cyan} {prefix:.bold} {bytes} {msg}")
        .unwrap_or_else(|_| IndicatifStyle::default_spinner())
}

fn bytes_style() -> IndicatifStyle {
    IndicatifStyle::default_bar()
        .template("{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")
        .unwrap_or_else(|_| IndicatifStyle::default_bar())
        .progress_chars("=>-")
}
