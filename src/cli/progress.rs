//! Progress bars and console output for the CLI
//!
//! Key features:
//! - Byte-level transfer bar that suspends cleanly when logging
//! - Ctrl+C cancellation wired into the transport progress callback
//! - Consistent visual styling across commands

use crate::device::traits::Progress;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ============================================================================
// Styles - Consistent visual appearance
// ============================================================================

/// Get the progress bar style for file transfers
fn transfer_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(
            "  {spinner:.green} [{bar:40.cyan/dim}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━━╾─")
}

/// Get the style for completed transfers
fn completed_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template("  ✓ [{bar:40.green/dim}] {bytes}/{total_bytes} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━━━")
}

// ============================================================================
// Console output helpers
// ============================================================================

/// Print a header section with a box
pub fn print_header(title: &str) {
    let width = 68;
    let title_padded = format!("{:^width$}", title, width = width - 4);
    println!();
    println!("╔{}╗", "═".repeat(width - 2));
    println!("║{}║", title_padded);
    println!("╚{}╝", "═".repeat(width - 2));
    println!();
}

/// Print a success message with checkmark
pub fn print_success(msg: &str) {
    println!("  ✓ {}", msg);
}

/// Print an info message with bullet
pub fn print_info(msg: &str) {
    println!("  • {}", msg);
}

/// Print a warning message
pub fn print_warning(msg: &str) {
    println!("  ⚠ {}", msg);
}

/// Print an error message
pub fn print_error(msg: &str) {
    println!("  ✗ {}", msg);
}

// ============================================================================
// Transfer progress
// ============================================================================

/// Progress display for a single get/send
///
/// `update` is shaped to be used directly as the transport progress callback:
/// it returns `Progress::Cancel` once the shutdown flag is raised.
pub struct TransferProgress {
    bar: Option<ProgressBar>,
    shutdown_flag: Arc<AtomicBool>,
    start_time: Instant,
}

impl TransferProgress {
    /// Create a tracker; `visible = false` only watches for cancellation
    pub fn new(name: &str, visible: bool, shutdown_flag: Arc<AtomicBool>) -> Self {
        let bar = visible.then(|| {
            let bar = ProgressBar::new(0);
            bar.set_style(transfer_style());
            bar.enable_steady_tick(Duration::from_millis(100));
            bar.set_message(name.to_string());
            bar
        });

        Self {
            bar,
            shutdown_flag,
            start_time: Instant::now(),
        }
    }

    /// Record progress and tell the transport whether to keep going
    pub fn update(&self, sent: u64, total: u64) -> Progress {
        if let Some(bar) = &self.bar {
            if bar.length() != Some(total) {
                bar.set_length(total);
            }
            bar.set_position(sent);
        }

        if self.shutdown_flag.load(Ordering::SeqCst) {
            Progress::Cancel
        } else {
            Progress::Continue
        }
    }

    /// Finish the progress display
    pub fn finish(&self, bytes: u64) {
        let elapsed = self.start_time.elapsed();
        if let Some(bar) = &self.bar {
            bar.set_style(completed_style());
            bar.finish_with_message(format!("in {}", format_duration(elapsed)));
        } else {
            print_success(&format!(
                "Transferred {} in {}",
                format_bytes(bytes),
                format_duration(elapsed)
            ));
        }
    }

    /// Finish with an error
    pub fn finish_with_error(&self, msg: &str) {
        if let Some(bar) = &self.bar {
            bar.abandon_with_message(format!("✗ {}", msg));
        }
    }
}

// ============================================================================
// Utility functions
// ============================================================================

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Format duration as human-readable string
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        format!("{}h {}m", hours, mins)
    } else if secs >= 60 {
        let mins = secs / 60;
        let secs = secs % 60;
        format!("{}m {}s", mins, secs)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}

// ============================================================================
// Dual writer for file + console logging
// ============================================================================

/// A writer that writes to both console and file
///
/// Used for logging to both stderr and a log file simultaneously.
pub struct DualWriter {
    pub console: std::io::Stderr,
    pub file: std::fs::File,
}

impl Write for DualWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = self.console.write(buf);
        self.file.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = self.console.flush();
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 bytes");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(4 * 1024 * 1024 * 1024), "4.00 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(75)), "1m 15s");
        assert_eq!(format_duration(Duration::from_secs(7260)), "2h 1m");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
    }

    #[test]
    fn test_transfer_cancels_on_shutdown() {
        let flag = Arc::new(AtomicBool::new(false));
        let progress = TransferProgress::new("song.mp3", false, Arc::clone(&flag));

        assert_eq!(progress.update(10, 100), Progress::Continue);
        flag.store(true, Ordering::SeqCst);
        assert_eq!(progress.update(20, 100), Progress::Cancel);
    }
}
