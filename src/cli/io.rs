//! File and stdout handling for the CLI
//!
//! - Input log: one JSON `OperationRecord` per line, blank lines ignored
//! - Output: a single JSON object on stdout

use std::fs::File;
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

use serde_json::Value;

use super::errors::{CliError, CliResult};
use crate::oplog::OperationRecord;

/// Read a JSON-lines log file into records, in file order.
pub fn read_log(path: &Path) -> CliResult<Vec<OperationRecord>> {
    let file = File::open(path)
        .map_err(|e| CliError::io_error(format!("failed to open {}: {}", path.display(), e)))?;
    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: OperationRecord =
            serde_json::from_str(&line).map_err(|e| CliError::malformed_log(index + 1, e))?;
        records.push(record);
    }
    Ok(records)
}

/// Write a success response to stdout
pub fn write_response(data: Value) -> CliResult<()> {
    let response = serde_json::json!({
        "status": "ok",
        "data": data
    });

    let mut stdout = io::stdout();
    serde_json::to_writer(&mut stdout, &response)?;
    writeln!(stdout)?;
    stdout.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::errors::CliErrorCode;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_read_log_skips_blank_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ops.jsonl");
        let a = serde_json::to_string(&OperationRecord::insert(1, "app.c", "a")).unwrap();
        let b = serde_json::to_string(&OperationRecord::delete(2, "app.c", "a")).unwrap();
        fs::write(&path, format!("{}\n\n{}\n", a, b)).unwrap();

        let records = read_log(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].seq(), 2);
    }

    #[test]
    fn test_read_log_reports_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ops.jsonl");
        fs::write(&path, "{\"bogus\": true}\n").unwrap();

        let err = read_log(&path).unwrap_err();
        assert_eq!(err.code(), &CliErrorCode::MalformedLog);
        assert!(err.message().starts_with("line 1"));
    }
}
