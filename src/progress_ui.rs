//! Progress bar for the `download` command.

use courier_core::{Listeners, ProgressState};
use indicatif::{ProgressBar, ProgressStyle};

/// Creates the bar shown while a download runs. Hidden when `enabled` is
/// false so the listener wiring stays the same.
pub(crate) fn download_bar(enabled: bool) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{bar:30}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    bar
}

/// Listeners feeding queue admission and transfer progress into `bar`.
pub(crate) fn listeners_for(bar: &ProgressBar) -> Listeners {
    let on_queue = bar.clone();
    let on_progress = bar.clone();
    Listeners::new()
        .on_queue(move |position| on_queue.set_message(format!("slot {position}")))
        .on_progress(move |state| update(&on_progress, state))
}

fn update(bar: &ProgressBar, state: &ProgressState) {
    if let Some(total) = state.total {
        bar.set_length(total);
    }
    bar.set_position(state.transferred);
    bar.set_message(state.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_update_sets_length_and_position() {
        let bar = ProgressBar::hidden();
        update(
            &bar,
            &ProgressState {
                transferred: 512,
                total: Some(2048),
                speed: Some(256.0),
                elapsed: Duration::from_secs(2),
                remaining: Some(Duration::from_secs(6)),
            },
        );
        assert_eq!(bar.position(), 512);
        assert_eq!(bar.length(), Some(2048));
    }

    #[test]
    fn test_unknown_total_keeps_length() {
        let bar = ProgressBar::hidden();
        update(
            &bar,
            &ProgressState {
                transferred: 10,
                total: None,
                speed: None,
                elapsed: Duration::ZERO,
                remaining: None,
            },
        );
        assert_eq!(bar.position(), 10);
    }
}
