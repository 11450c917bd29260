use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::runner::RunSummary;

/// Write-once HTML visualization of the sampled round trips.
///
/// The engine appends one task-rendered fragment per record, in record
/// order; there is no read path.
pub struct HtmlReport {
    writer: BufWriter<File>,
}

impl HtmlReport {
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create HTML report: {}", path.display()))?;
        let mut report = Self {
            writer: BufWriter::new(file),
        };
        report.write(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n\
             <title>Round-trip samples</title>\n</head>\n<body>\n",
        )?;
        Ok(report)
    }

    pub fn append(&mut self, fragment: &str) -> Result<()> {
        self.write(fragment)?;
        self.write("\n")?;
        self.writer.flush().context("Failed to flush HTML report")
    }

    pub fn finish(mut self) -> Result<()> {
        self.write("</body>\n</html>\n")?;
        self.writer.flush().context("Failed to flush HTML report")
    }

    fn write(&mut self, text: &str) -> Result<()> {
        self.writer
            .write_all(text.as_bytes())
            .context("Failed to write HTML report")
    }
}

/// Minimal HTML escaping for code and sample text.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Print the end-of-run accounting so the operator can judge the failure
/// rate without opening the archive.
pub fn print_summary(summary: &RunSummary) {
    println!("=== Round-trip sampling run ===");
    println!(
        "datapoints:      {} ({} duplicates dropped)",
        summary.total_datapoints, summary.duplicate_datapoints
    );
    println!("records written: {}", summary.records_written);
    println!("empty records:   {}", summary.empty_records);
    println!("failed branches: {}", summary.failed_branches);
    if summary.interrupted {
        println!("run was interrupted; the output archive holds a valid prefix");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html("if a < b && c > \"d\""),
            "if a &lt; b &amp;&amp; c &gt; &quot;d&quot;"
        );
        assert_eq!(escape_html("plain"), "plain");
    }

    #[test]
    fn test_report_structure() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("report.html");

        let mut report = HtmlReport::create(&path).unwrap();
        report.append("<h2>one</h2>").unwrap();
        report.append("<h2>two</h2>").unwrap();
        report.finish().unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("<!DOCTYPE html>"));
        assert!(content.ends_with("</body>\n</html>\n"));
        let one = content.find("<h2>one</h2>").unwrap();
        let two = content.find("<h2>two</h2>").unwrap();
        assert!(one < two);
    }

    #[test]
    fn test_print_summary_smoke() {
        print_summary(&RunSummary {
            total_datapoints: 3,
            duplicate_datapoints: 1,
            records_written: 3,
            empty_records: 1,
            failed_branches: 2,
            interrupted: false,
        });
    }
}
