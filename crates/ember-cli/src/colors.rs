//! ANSI escape codes for terminal output.

pub const BOLD: &str = "\x1b[1m";
pub const CYAN: &str = "\x1b[36m";
pub const GREEN: &str = "\x1b[32m";
pub const RESET: &str = "\x1b[0m";
