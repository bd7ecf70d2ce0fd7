//! Record sources.
//!
//! Readers yield `(line, Result<Record, ReaderError>)` pairs. A broken row
//! is an item-level error so the loader can log it and carry on with the
//! next one.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::entity::{Record, Value};
use crate::geometry::Geometry;

/// SRID assigned to GeoJSON geometries (RFC 7946 mandates WGS 84).
pub const GEOJSON_SRID: i32 = 4326;

/// Key under which a feature's geometry is placed in its record.
pub const GEOMETRY_KEY: &str = "geometry";

#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read header row: {0}")]
    Header(#[source] csv::Error),

    #[error("malformed row: {0}")]
    Row(#[source] csv::Error),

    #[error("delimiter {0:?} is not an ASCII character")]
    Delimiter(char),

    #[error("invalid GeoJSON: {0}")]
    GeoJson(String),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// One item of a record source.
pub type SourceItem = (u64, Result<Record, ReaderError>);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceFormat {
    #[default]
    Delimited,
    #[serde(rename = "geojson")]
    GeoJson,
}

fn default_delimiter() -> char {
    '\t'
}

/// `reader` section of the load configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReaderConfig {
    #[serde(default)]
    pub format: SourceFormat,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    /// Honor double quotes around values. Off by default: source files
    /// carry literal quote characters.
    #[serde(default)]
    pub quoting: bool,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            format: SourceFormat::Delimited,
            delimiter: default_delimiter(),
            quoting: false,
        }
    }
}

/// Open `path` with the reader the configuration names.
pub fn open(
    path: &Path,
    config: &ReaderConfig,
) -> Result<Box<dyn Iterator<Item = SourceItem>>, ReaderError> {
    match config.format {
        SourceFormat::Delimited => Ok(Box::new(DelimitedReader::open(path, config)?)),
        SourceFormat::GeoJson => Ok(Box::new(GeoJsonReader::open(path)?)),
    }
}

/// Delimited text with a header row.
pub struct DelimitedReader<R: Read> {
    headers: Vec<String>,
    records: csv::StringRecordsIntoIter<R>,
    last_line: u64,
}

impl DelimitedReader<File> {
    pub fn open(path: &Path, config: &ReaderConfig) -> Result<Self, ReaderError> {
        let file = File::open(path).map_err(|source| ReaderError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(file, config)
    }
}

impl<R: Read> DelimitedReader<R> {
    pub fn from_reader(input: R, config: &ReaderConfig) -> Result<Self, ReaderError> {
        if !config.delimiter.is_ascii() {
            return Err(ReaderError::Delimiter(config.delimiter));
        }
        let delimiter = config.delimiter as u8;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(false)
            .quoting(config.quoting)
            .delimiter(delimiter)
            .from_reader(input);

        let headers = reader
            .headers()
            .map_err(ReaderError::Header)?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        Ok(Self {
            headers,
            records: reader.into_records(),
            last_line: 1,
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }
}

impl<R: Read> Iterator for DelimitedReader<R> {
    type Item = SourceItem;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.records.next()?;
        let line = match &row {
            Ok(record) => record.position().map(|p| p.line()),
            Err(err) => err.position().map(|p| p.line()),
        }
        .unwrap_or(self.last_line + 1);
        self.last_line = line;

        let item = row.map_err(ReaderError::Row).map(|fields| {
            self.headers
                .iter()
                .zip(fields.iter())
                .map(|(header, value)| (header.clone(), Value::from(value)))
                .collect()
        });
        Some((line, item))
    }
}

/// Features of a GeoJSON FeatureCollection.
pub struct GeoJsonReader {
    features: std::vec::IntoIter<serde_json::Value>,
    index: u64,
}

impl GeoJsonReader {
    pub fn open(path: &Path) -> Result<Self, ReaderError> {
        let text = fs::read_to_string(path).map_err(|source| ReaderError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> Result<Self, ReaderError> {
        let mut document: serde_json::Value = serde_json::from_str(text)?;
        let features = match document.get_mut("features").map(serde_json::Value::take) {
            Some(serde_json::Value::Array(features)) => features,
            _ => return Err(ReaderError::GeoJson("expected a FeatureCollection".to_string())),
        };
        Ok(Self {
            features: features.into_iter(),
            index: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.len() == 0
    }
}

fn feature_record(mut feature: serde_json::Value) -> Result<Record, ReaderError> {
    let mut record = match feature.get_mut("properties").map(serde_json::Value::take) {
        None | Some(serde_json::Value::Null) => Record::new(),
        Some(properties) => crate::entity::record_from_json(properties)
            .ok_or_else(|| ReaderError::GeoJson("feature properties must be an object".to_string()))?,
    };

    let geometry = match feature.get("geometry") {
        None | Some(serde_json::Value::Null) => Value::Null,
        Some(geometry) => Geometry::from_geojson(geometry)
            .map(|g| Value::Geometry(g.with_srid(Some(GEOJSON_SRID))))
            .map_err(|e| ReaderError::GeoJson(e.to_string()))?,
    };
    record.insert(GEOMETRY_KEY.to_string(), geometry);
    Ok(record)
}

impl Iterator for GeoJsonReader {
    type Item = SourceItem;

    fn next(&mut self) -> Option<Self::Item> {
        let feature = self.features.next()?;
        self.index += 1;
        Some((self.index, feature_record(feature)))
    }
}
