//! Terminal output.

pub mod reporter;
pub mod table;
pub mod theme;

pub use reporter::ConsoleReporter;
pub use theme::Theme;
