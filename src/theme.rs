//! Color styling for CLI output.
//!
//! Colors are disabled by `--no-color` or the `NO_COLOR` environment variable.

use std::sync::atomic::{AtomicBool, Ordering};

use owo_colors::OwoColorize;

static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disable all colors globally. Call early in `main`.
pub fn disable_colors() {
    COLORS_ENABLED.store(false, Ordering::Relaxed);
    owo_colors::set_override(false);
}

pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

/// Semantic styles for compile output.
pub trait Themed: std::fmt::Display + Sized {
    /// Shader file and entry point (cyan).
    fn shader_label(&self) -> String {
        if colors_enabled() {
            self.cyan().to_string()
        } else {
            self.to_string()
        }
    }

    /// Successful compile (green + bold).
    fn success(&self) -> String {
        if colors_enabled() {
            self.green().bold().to_string()
        } else {
            self.to_string()
        }
    }

    /// Failed compile (red + bold).
    fn failure(&self) -> String {
        if colors_enabled() {
            self.red().bold().to_string()
        } else {
            self.to_string()
        }
    }

    /// Warning text (yellow).
    fn warning(&self) -> String {
        if colors_enabled() {
            self.yellow().to_string()
        } else {
            self.to_string()
        }
    }

    /// Secondary details (dimmed).
    fn muted(&self) -> String {
        if colors_enabled() {
            self.dimmed().to_string()
        } else {
            self.to_string()
        }
    }
}

impl Themed for String {}
impl Themed for &str {}
impl Themed for usize {}
impl Themed for u64 {}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_styles_without_colors_are_plain() {
        disable_colors();
        assert!(!colors_enabled());
        assert_eq!("ok".success(), "ok");
        assert_eq!("FAIL".failure(), "FAIL");
        assert_eq!(3usize.muted(), "3");
        COLORS_ENABLED.store(true, Ordering::Relaxed);
        owo_colors::unset_override();
    }

    #[test]
    #[serial]
    fn test_styles_with_colors_wrap_text() {
        COLORS_ENABLED.store(true, Ordering::Relaxed);
        owo_colors::set_override(true);
        let styled = "A.usf:Main".shader_label();
        assert!(styled.contains("A.usf:Main"));
        assert_ne!(styled, "A.usf:Main");
        owo_colors::unset_override();
    }
}
