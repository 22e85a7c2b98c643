//! Console output for Shuttle
//!
//! Styled, consistent formatting for the run summary and operator-facing
//! messages. Detailed per-file reporting goes through tracing; this is the
//! human-readable surface.

use console::style;

/// Output handler for consistent CLI formatting
pub struct Output;

impl Output {
    /// Create a new output handler
    pub fn new() -> Self {
        Self
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        println!("{} {}", style("✔").green(), message);
    }

    /// Print an error message
    pub fn error(&self, message: &str) {
        eprintln!("{} {}", style("✖").red(), message);
    }

    /// Print a warning message
    pub fn warning(&self, message: &str) {
        println!("{} {}", style("⚠").yellow(), message);
    }

    /// Print an info message
    pub fn info(&self, message: &str) {
        println!("{} {}", style("ℹ").blue(), message);
    }

    /// Print a header/title
    pub fn header(&self, title: &str) {
        println!("\n{}", style(title).bold().underlined());
    }

    /// Print a table row
    pub fn table_row(&self, key: &str, value: &str) {
        println!("  {:<28} {}", style(key).dim(), value);
    }

    /// Print a list item
    pub fn list_item(&self, item: &str) {
        println!("  • {}", item);
    }

    /// Print a section separator
    pub fn separator(&self) {
        println!("{}", style("─".repeat(50)).dim());
    }

    /// Print blank line
    pub fn blank_line(&self) {
        println!();
    }
}

impl Default for Output {
    fn default() -> Self {
        Self::new()
    }
}
