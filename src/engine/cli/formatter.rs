//! CLI Output Formatting Module
//! Colorized terminal output for build and update commands

use crate::engine::coordinator::UpdateEvent;
use crate::engine::manifest::BundleEntry;
use colored::{ColoredString, Colorize};
use std::io::Write;

#[derive(Debug, Clone, Copy)]
enum Tone {
    Success,
    Error,
    Warning,
    Info,
}

impl Tone {
    fn mark(self) -> ColoredString {
        match self {
            Tone::Success => "✓".green().bold(),
            Tone::Error => "✗".red().bold(),
            Tone::Warning => "⚠".yellow().bold(),
            Tone::Info => "ℹ".blue().bold(),
        }
    }
}

fn line(tone: Tone, message: &str) {
    match tone {
        Tone::Error => eprintln!("{} {}", tone.mark(), message),
        _ => println!("{} {}", tone.mark(), message),
    }
}

pub struct CliFormatter;

impl CliFormatter {
    pub fn success(message: &str) {
        line(Tone::Success, message);
    }

    pub fn error(message: &str) {
        line(Tone::Error, message);
    }

    pub fn warning(message: &str) {
        line(Tone::Warning, message);
    }

    pub fn info(message: &str) {
        line(Tone::Info, message);
    }

    pub fn header(title: &str) {
        println!("\n{}", title.bright_cyan().bold());
        println!("{}", "─".repeat(title.chars().count()).bright_black());
    }

    pub fn kv(key: &str, value: &str) {
        let label = format!("{:<14}", format!("{}:", key));
        println!("  {} {}", label.bright_white().bold(), value);
    }

    /// One file of a patch archive
    pub fn patch_file(path: &str) {
        println!("  {} {}", "+".bright_green(), path);
    }

    /// One manifest row: name, stored file, size, content hash
    pub fn bundle(entry: &BundleEntry) {
        let file = if entry.file_name == entry.name {
            String::new()
        } else {
            format!(" -> {}", entry.file_name)
        };
        println!(
            "  {}{} {} {}",
            entry.name,
            file.bright_black(),
            format_size(entry.size).bright_white(),
            entry.content_hash.bright_black()
        );
    }

    /// Render a coordinator event for a terminal
    pub fn event(event: &UpdateEvent) {
        match event {
            UpdateEvent::StepChanged { step } => println!("  {} {}", "▶".bright_blue(), step),
            UpdateEvent::DownloadProgress { fraction } => Self::progress(*fraction, "downloading"),
            UpdateEvent::InfoUnavailable { reason } => {
                Self::warning(&format!("Update info unavailable: {}", reason))
            }
            UpdateEvent::Maintenance => Self::warning("Server in maintenance, update skipped"),
            UpdateEvent::ManifestReloadFailed { reason } => {
                Self::warning(&format!("Manifest reload failed: {}", reason))
            }
            UpdateEvent::ModuleMissing { module } => Self::warning(&format!("Module not found: {}", module)),
            UpdateEvent::Completed { version } => Self::success(&format!("Content at version {}", version)),
            UpdateEvent::Failed { code, message } => {
                Self::error(&format!("Update failed ({}): {}", code, message))
            }
        }
    }

    /// Redraw the download bar in place; ends the line at 100%
    pub fn progress(fraction: f32, message: &str) {
        let percentage = (fraction.clamp(0.0, 1.0) * 100.0) as u32;
        print!("\r  [{}] {:>3}% {}", progress_bar(percentage, 20), percentage, message);
        std::io::stdout().flush().ok();
        if percentage >= 100 {
            println!();
        }
    }
}

fn progress_bar(percentage: u32, width: u32) -> String {
    let filled = (percentage.min(100) * width) / 100;
    format!(
        "{}{}",
        "█".repeat(filled as usize).bright_green(),
        "░".repeat((width - filled) as usize).bright_black()
    )
}

/// Bundle sizes in binary units, one decimal above bytes
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut size = bytes as f64 / 1024.0;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", size, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500 B");
        assert_eq!(format_size(1024), "1.0 KiB");
        assert_eq!(format_size(1536), "1.5 KiB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn test_progress_bar_width() {
        colored::control::set_override(false);
        assert_eq!(progress_bar(50, 10), "█████░░░░░");
        assert_eq!(progress_bar(250, 4), "████");
    }
}
