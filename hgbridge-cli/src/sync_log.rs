//! Sync log display for the hgbridge CLI.
//!
//! CLI-friendly wrappers around the core SyncLog, with human-readable
//! output formatting.

use anyhow::Result;
use hgbridge_core::{SyncLog, SyncLogEntry};
use std::io::Write;
use std::path::Path;

/// Format a sync log entry for human-readable display.
pub fn format_entry(entry: &SyncLogEntry) -> String {
    let date = chrono::DateTime::from_timestamp_millis(entry.timestamp_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| entry.timestamp_ms.to_string());

    let status = if entry.success { "OK" } else { "FAILED" };

    format!(
        "[{}] {:<5} | {} changesets, {} objects{} | {}ms | {}{}",
        date,
        entry.direction,
        entry.changesets,
        entry.objects,
        if entry.skipped > 0 {
            format!(", {} skipped", entry.skipped)
        } else {
            String::new()
        },
        entry.duration_ms,
        status,
        entry
            .error
            .as_ref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default(),
    )
}

/// Print all sync log entries for a repository.
pub fn print_sync_log(
    repo_path: &Path,
    limit: Option<usize>,
    writer: &mut dyn Write,
) -> Result<()> {
    let log = SyncLog::new(repo_path);
    let mut entries = log.all()?;
    if let Some(limit) = limit {
        let skip = entries.len().saturating_sub(limit);
        entries.drain(..skip);
    }

    if entries.is_empty() {
        writeln!(writer, "No sync log entries found.")?;
        return Ok(());
    }

    writeln!(writer, "Sync Log ({} entries):", entries.len())?;
    writeln!(writer, "{}", "-".repeat(80))?;
    for entry in &entries {
        writeln!(writer, "  {}", format_entry(entry))?;
    }
    writeln!(writer, "{}", "-".repeat(80))?;

    // Summary
    let total_changesets: u64 = entries.iter().map(|e| e.changesets).sum();
    let total_objects: u64 = entries.iter().map(|e| e.objects).sum();
    let total_ms: u64 = entries.iter().map(|e| e.duration_ms).sum();
    let successes = entries.iter().filter(|e| e.success).count();

    writeln!(
        writer,
        "Summary: {} syncs ({} successful), {} changesets, {} objects, {}ms total",
        entries.len(),
        successes,
        total_changesets,
        total_objects,
        total_ms,
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hgbridge_core::SyncDirection;
    use tempfile::TempDir;

    #[test]
    fn test_format_failed_entry() {
        let mut entry = SyncLogEntry::new(SyncDirection::Push);
        entry.timestamp_ms = 0;
        entry.error = Some("TransportError: refused".to_string());
        let line = format_entry(&entry);
        assert!(line.starts_with("[1970-01-01 00:00:00 UTC] push"));
        assert!(line.ends_with("FAILED (TransportError: refused)"));
    }

    #[test]
    fn test_print_limit_and_summary() {
        let tmp = TempDir::new().unwrap();
        let log = SyncLog::new(tmp.path());
        for i in 0..3 {
            let mut entry = SyncLogEntry::new(SyncDirection::Fetch);
            entry.timestamp_ms = 1_000 + i;
            entry.changesets = 2;
            entry.success = true;
            log.append(&entry).unwrap();
        }

        let mut out = Vec::new();
        print_sync_log(tmp.path(), Some(2), &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Sync Log (2 entries)"));
        assert!(text.contains("2 syncs (2 successful), 4 changesets"));
    }

    #[test]
    fn test_print_empty() {
        let tmp = TempDir::new().unwrap();
        let mut out = Vec::new();
        print_sync_log(tmp.path(), None, &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "No sync log entries found.\n");
    }
}
