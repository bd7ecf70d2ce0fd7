//! NDJSON output, used for reject reports.

use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// NDJSON (Newline Delimited JSON) writer
///
/// Writes one JSON object per line.
pub struct NdjsonWriter<W: Write> {
    writer: W,
    written: usize,
}

impl NdjsonWriter<BufWriter<File>> {
    /// Create (or truncate) an NDJSON file
    pub fn create(path: &Path) -> Result<Self, SerializationError> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> NdjsonWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    /// Write a single value as an NDJSON line
    pub fn write<T: Serialize>(&mut self, value: &T) -> Result<(), SerializationError> {
        let json = serde_json::to_string(value)?;
        writeln!(self.writer, "{}", json)?;
        self.written += 1;
        Ok(())
    }

    /// Lines written so far
    pub fn written(&self) -> usize {
        self.written
    }

    /// Flush the underlying writer
    pub fn flush(&mut self) -> Result<(), SerializationError> {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record;
    use crate::Record;

    #[derive(Serialize)]
    struct Reject {
        line: u64,
        cause: String,
        raw: Record,
    }

    #[test]
    fn test_ndjson_writer() {
        let mut buf = Vec::new();
        let mut writer = NdjsonWriter::new(&mut buf);

        writer
            .write(&Reject {
                line: 2,
                cause: "duplicate key".to_string(),
                raw: record! { "name" => "Ann" },
            })
            .unwrap();
        writer
            .write(&Reject {
                line: 7,
                cause: "a value is required".to_string(),
                raw: record! {},
            })
            .unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.written(), 2);

        let output = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = output.lines().collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(
            lines[0],
            r#"{"line":2,"cause":"duplicate key","raw":{"name":"Ann"}}"#
        );
        assert!(lines[1].contains(r#""raw":{}"#));
    }

    #[test]
    fn test_create_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rejects.ndjson");

        let mut writer = NdjsonWriter::create(&path).unwrap();
        writer.write(&serde_json::json!({"line": 1})).unwrap();
        writer.flush().unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"line\":1}\n");
    }
}
