//! Colors and glyphs shared by every renderer.

use crossterm::style::Color;
use penumbra_schema::{Level, RepoStatus};

#[derive(Debug, Clone, Copy)]
pub struct Colors {
    pub success: Color,
    pub warning: Color,
    pub error: Color,
    pub active: Color,
    pub secondary: Color,
}

#[derive(Debug, Clone, Copy)]
pub struct Icons {
    pub success: &'static str,
    pub warning: &'static str,
    pub error: &'static str,
    pub active: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct Theme {
    pub colors: Colors,
    pub icons: Icons,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            colors: Colors {
                success: Color::Green,
                warning: Color::Yellow,
                error: Color::Red,
                active: Color::Cyan,
                secondary: Color::DarkGrey,
            },
            icons: Icons {
                success: "✓",
                warning: "!",
                error: "✗",
                active: "●",
            },
        }
    }
}

impl Theme {
    pub fn level_color(&self, level: Level) -> Color {
        match level {
            Level::Info => self.colors.secondary,
            Level::Warn => self.colors.warning,
            Level::Error => self.colors.error,
        }
    }

    /// Glyph and color for a repository status.
    pub fn status_style(&self, status: &RepoStatus) -> (&'static str, Color) {
        match status {
            RepoStatus::Done => (self.icons.success, self.colors.success),
            RepoStatus::Failed { .. } => (self.icons.error, self.colors.error),
            RepoStatus::Cancelled => (self.icons.warning, self.colors.warning),
            _ => (self.icons.active, self.colors.active),
        }
    }
}

/// Format bytes as a human-readable size.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }
}
