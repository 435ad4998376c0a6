//! The periodic metadata pass shared by the TUI and the daemon.

use super::instance::{Instance, Status};
use std::time::Duration;

/// Cadence of the metadata pass. Capturing every pane and re-running the
/// diff is expensive, so this is a deliberate throttle.
pub const METADATA_TICK: Duration = Duration::from_millis(500);

/// Cadence of the preview refresh for the selected instance only.
pub const PREVIEW_TICK: Duration = Duration::from_millis(100);

/// The per-tick status transition. Returns the new status (if it changes)
/// and whether a confirmation prompt should be auto-accepted this tick.
fn next_status(updated: bool, has_prompt: bool, auto_yes: bool) -> (Option<Status>, bool) {
    if updated {
        (Some(Status::Running), false)
    } else if has_prompt {
        // A pending prompt keeps the current status; it is either accepted
        // automatically or left on screen for the operator.
        (None, auto_yes)
    } else {
        (Some(Status::Ready), false)
    }
}

/// Runs one metadata pass over all started, non-paused instances: probe for
/// pane updates, drive the Ready/Running transition, auto-accept prompts for
/// auto-yes instances, refresh cached diff stats. Failures are logged and
/// never interrupt the pass.
pub fn tick_instances(instances: &mut [Instance]) {
    for instance in instances.iter_mut() {
        if !instance.started() || instance.paused() {
            continue;
        }

        let (updated, has_prompt) = instance.has_updated();
        let (status, tap) = next_status(updated, has_prompt, instance.auto_yes());
        if let Some(status) = status {
            instance.set_status(status);
        }
        if tap {
            if let Err(e) = instance.tap_enter() {
                log::warn!("could not auto-accept prompt for '{}': {e}", instance.title());
            }
        }

        if let Err(e) = instance.update_diff_stats() {
            log::warn!("could not update diff stats for '{}': {e}", instance.title());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updated_content_means_running() {
        assert_eq!(next_status(true, false, false), (Some(Status::Running), false));
        // An update wins even when a prompt is also visible.
        assert_eq!(next_status(true, true, true), (Some(Status::Running), false));
    }

    #[test]
    fn quiet_content_means_ready() {
        assert_eq!(next_status(false, false, false), (Some(Status::Ready), false));
        assert_eq!(next_status(false, false, true), (Some(Status::Ready), false));
    }

    #[test]
    fn prompt_is_tapped_only_with_auto_yes() {
        assert_eq!(next_status(false, true, true), (None, true));
        assert_eq!(next_status(false, true, false), (None, false));
    }
}
