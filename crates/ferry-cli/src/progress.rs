//! Progress bar for a running batch

use ferry_core::ProgressSnapshot;
use indicatif::{ProgressBar, ProgressStyle};

const BAR_TEMPLATE: &str = "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})";

/// Byte progress of a batch with a file counter in the message
pub struct BatchProgress {
    bar: ProgressBar,
}

impl BatchProgress {
    /// Bar over `total_bytes`
    pub fn new(total_bytes: u64) -> Self {
        let bar = ProgressBar::new(total_bytes);
        if let Ok(style) = ProgressStyle::default_bar().template(BAR_TEMPLATE) {
            bar.set_style(style.progress_chars("#>-"));
        }
        Self { bar }
    }

    /// Hidden bar, for non-interactive output
    pub fn hidden() -> Self {
        Self {
            bar: ProgressBar::hidden(),
        }
    }

    /// Show the counters of `snapshot`
    pub fn update(&self, snapshot: &ProgressSnapshot) {
        self.bar.set_position(snapshot.bytes_transferred);
        self.bar.set_message(format!(
            "{}/{} files",
            snapshot.files_done(),
            snapshot.files_total
        ));
    }

    /// Print above the bar
    pub fn println(&self, line: impl AsRef<str>) {
        self.bar.println(line);
    }

    /// Stop the bar, leaving `message`
    pub fn finish_with_message(&self, message: String) {
        self.bar.finish_with_message(message);
    }
}

/// Human-readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KiB");
        assert_eq!(format_bytes(10 * 1024 * 1024), "10.00 MiB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024 / 2), "1.50 GiB");
    }
}
