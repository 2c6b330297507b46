use debloat_core::app_list::AppEntry;
use debloat_core::runner::{RunFailure, RunOutcome, RunReport};
use debloat_core::{LoadFallback, OptionSpec};
use humantime::format_duration;
use std::time::Duration;

pub fn checkbox(enabled: bool) -> &'static str {
    if enabled { "[x]" } else { "[ ]" }
}

pub fn option_row(spec: &OptionSpec, enabled: bool) -> String {
    let marker = if enabled != spec.default { " *" } else { "" };
    format!("  {} {:<20} {}{marker}", checkbox(enabled), spec.name, spec.label)
}

pub fn app_row(entry: &AppEntry) -> String {
    let verdict = if entry.keep { "keep" } else { "remove" };
    format!("  {:<8} {}", verdict, entry.name)
}

pub fn fallback_notice(fallback: &LoadFallback) -> String {
    match fallback {
        LoadFallback::Missing => "No saved settings found; using defaults.".to_string(),
        LoadFallback::Unreadable(err) => format!("Could not read saved settings ({err}); using defaults."),
        LoadFallback::Invalid(err) => format!("Saved settings are invalid ({err}); using defaults."),
    }
}

/// Elapsed time rounded so the summary stays readable.
pub fn rounded(elapsed: Duration) -> Duration {
    if elapsed >= Duration::from_secs(1) {
        Duration::from_secs(elapsed.as_secs())
    } else {
        Duration::from_millis(elapsed.as_millis() as u64)
    }
}

pub fn outcome_label(outcome: &RunOutcome) -> &'static str {
    match outcome {
        RunOutcome::Success => "success",
        RunOutcome::Cancelled => "cancelled",
        RunOutcome::Failed(_) => "failed",
    }
}

pub fn exit_code_of(outcome: &RunOutcome) -> Option<i32> {
    match outcome {
        RunOutcome::Failed(RunFailure::Exit(code)) => Some(*code),
        _ => None,
    }
}

pub fn run_summary(report: &RunReport) -> String {
    let took = format_duration(rounded(report.elapsed));
    match &report.outcome {
        RunOutcome::Success => format!("Debloat operation completed successfully in {took}."),
        RunOutcome::Cancelled => format!("Operation cancelled by user after {took}."),
        RunOutcome::Failed(RunFailure::Exit(code)) => {
            format!("Debloat operation encountered errors (return code {code}) after {took}.")
        }
        RunOutcome::Failed(RunFailure::Launch(message)) => {
            format!("Could not start the debloat script: {message}")
        }
        RunOutcome::Failed(failure) => format!("Debloat operation failed after {took}: {failure}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use debloat_core::OptionGroup;

    #[test]
    fn summaries_distinguish_cancel_from_failure() {
        let report = |outcome| RunReport {
            run_id: 1,
            outcome,
            elapsed: Duration::from_millis(2_400),
        };
        assert_eq!(
            run_summary(&report(RunOutcome::Success)),
            "Debloat operation completed successfully in 2s."
        );
        assert_eq!(
            run_summary(&report(RunOutcome::Cancelled)),
            "Operation cancelled by user after 2s."
        );
        assert_eq!(
            run_summary(&report(RunOutcome::Failed(RunFailure::Exit(1)))),
            "Debloat operation encountered errors (return code 1) after 2s."
        );
    }

    #[test]
    fn option_rows_flag_changed_defaults() {
        let spec = OptionSpec {
            name: "DisableBing",
            label: "Disable Bing Search/Cortana",
            group: OptionGroup::SystemTweaks,
            default: true,
        };
        assert!(option_row(&spec, true).starts_with("  [x] DisableBing"));
        assert!(option_row(&spec, false).ends_with(" *"));
        assert_eq!(rounded(Duration::from_micros(1_500)), Duration::from_millis(1));
    }
}
