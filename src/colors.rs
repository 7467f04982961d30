//! Terminal color policy.
//!
//! Honors `NO_COLOR` (<https://no-color.org/>) first, then `CLICOLOR_FORCE`,
//! then `CLICOLOR=0`, and otherwise colors only when stdout is a terminal.

use colored::control;
use std::io::IsTerminal;

/// Decide whether to color output from the relevant environment values.
pub fn should_color(
    no_color: Option<&str>,
    clicolor_force: Option<&str>,
    clicolor: Option<&str>,
    is_tty: bool,
) -> bool {
    if no_color.is_some() {
        return false;
    }
    if clicolor_force.is_some_and(|v| v != "0") {
        return true;
    }
    if clicolor == Some("0") {
        return false;
    }
    is_tty
}

/// Apply the policy for this process. Call once, early in `main`.
pub fn init_colors() {
    let var = |name: &str| std::env::var(name).ok();
    let enabled = should_color(
        var("NO_COLOR").as_deref(),
        var("CLICOLOR_FORCE").as_deref(),
        var("CLICOLOR").as_deref(),
        std::io::stdout().is_terminal(),
    );
    control::set_override(enabled);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_color_wins() {
        assert!(!should_color(Some(""), Some("1"), None, true));
    }

    #[test]
    fn test_force_overrides_tty_detection() {
        assert!(should_color(None, Some("1"), Some("0"), false));
        assert!(!should_color(None, Some("0"), None, false));
    }

    #[test]
    fn test_clicolor_zero_and_tty_default() {
        assert!(!should_color(None, None, Some("0"), true));
        assert!(should_color(None, None, None, true));
        assert!(!should_color(None, None, None, false));
    }
}
