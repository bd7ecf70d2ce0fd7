//! Batch driver.
//!
//! Feeds the records of one source through the transformer and the
//! reconciler, strictly one after the other, one transaction per record.
//! Every rejected record gets a line-numbered entry in the log file and,
//! optionally, in an NDJSON reject file; the batch carries on.

use chrono::{Local, NaiveDate};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::{LoadConfig, DEFAULT_FEEDBACK_SIZE};
use crate::entity::{Record, Value};
use crate::error::EtlError;
use crate::reader::SourceItem;
use crate::reconcile::{Outcome, ReconcileOptions, Reconciler};
use crate::schema::Schema;
use crate::serialization::{NdjsonWriter, SerializationError};
use crate::storage::{Storage, StorageError};
use crate::transform::{TransformError, Transformer};

#[derive(Debug, Error)]
pub enum LoaderError {
    #[error(transparent)]
    Engine(#[from] EtlError),

    #[error("line {line}: {source} => load aborted")]
    Aborted {
        line: u64,
        #[source]
        source: EtlError,
    },

    #[error("invalid transformation: {0}")]
    Transform(#[from] TransformError),

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("failed to write log file {path}: {source}")]
    Log {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write reject file: {0}")]
    Rejects(#[from] SerializationError),
}

/// Stage at which a record was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectKind {
    Reader,
    Transformation,
    Instance,
}

impl fmt::Display for RejectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectKind::Reader => "Text decoding or CSV error",
            RejectKind::Transformation => "Transformation error",
            RejectKind::Instance => "Instance generation error",
        })
    }
}

/// One line of the reject file.
#[derive(Debug, Serialize)]
pub struct RejectEntry<'r> {
    pub line: u64,
    pub kind: RejectKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<&'r str>,
    pub cause: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw: Option<&'r Value>,
}

/// Totals of a load run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LoadSummary {
    pub processed: u64,
    pub created: u64,
    pub updated: u64,
    pub exists: u64,
    pub rejected: u64,
}

/// Running totals plus the timing needed for progress messages.
#[derive(Debug)]
pub struct FeedbackCounter {
    summary: LoadSummary,
    started: Instant,
    last_feedback: Instant,
}

impl Default for FeedbackCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedbackCounter {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            summary: LoadSummary::default(),
            started: now,
            last_feedback: now,
        }
    }

    pub fn use_result(&mut self, outcome: Outcome) {
        self.summary.processed += 1;
        match outcome {
            Outcome::Created => self.summary.created += 1,
            Outcome::Updated => self.summary.updated += 1,
            Outcome::Exists => self.summary.exists += 1,
            Outcome::Rejected => self.summary.rejected += 1,
        }
    }

    pub fn reject(&mut self) {
        self.use_result(Outcome::Rejected);
    }

    pub fn processed(&self) -> u64 {
        self.summary.processed
    }

    pub fn summary(&self) -> LoadSummary {
        self.summary
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Progress message for the last `records` records; restarts the interval clock.
    pub fn feedback(&mut self, source: &str, records: usize) -> String {
        let interval = self.last_feedback.elapsed();
        self.last_feedback = Instant::now();
        let s = &self.summary;
        format!(
            "Extraction from {}:\n {} records processed in {:.1}s, {}: {} created, {} updated, {} rejected.",
            source,
            records,
            interval.as_secs_f64(),
            s.processed,
            s.created,
            s.updated,
            s.rejected
        )
    }

    pub fn finished(&self) -> String {
        let s = &self.summary;
        format!(
            "Data extraction finished {}\n\n{} created\n{} updated\n{} unchanged\n{} rejected",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            s.created,
            s.updated,
            s.exists,
            s.rejected
        )
    }
}

/// Default log file of a source: `<source>.<YYYY-MM-DD>.log` next to it.
pub fn logfile_name(source: &Path, date: NaiveDate) -> PathBuf {
    let file_name = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "etl".to_string());
    source.with_file_name(format!("{}.{}.log", file_name, date.format("%Y-%m-%d")))
}

/// Line-numbered log file. Without a path, messages only go to `tracing`.
struct LoadLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl LoadLog {
    fn open(path: Option<PathBuf>) -> Result<Self, LoaderError> {
        let Some(path) = path else {
            return Ok(Self {
                path: PathBuf::new(),
                writer: None,
            });
        };
        let file = File::create(&path).map_err(|source| LoaderError::Log {
            path: path.clone(),
            source,
        })?;
        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
        })
    }

    fn log(&mut self, message: &str) -> Result<(), LoaderError> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        writeln!(writer, "{}", message).map_err(|source| LoaderError::Log {
            path: self.path.clone(),
            source,
        })
    }

    fn log_reject(&mut self, kind: RejectKind, line: u64, cause: &dyn fmt::Display) -> Result<(), LoaderError> {
        self.log(&format!("{} in line {}: {} => rejected", kind, line, cause))
    }

    fn close(mut self) -> Result<(), LoaderError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush().map_err(|source| LoaderError::Log {
                path: self.path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

type FeedbackHook<'a> = Box<dyn FnMut(&LoadSummary) -> bool + 'a>;

/// Batch driver bound to one storage session.
pub struct Loader<'a, S: Storage + ?Sized> {
    schema: &'a Schema,
    storage: &'a mut S,
    entity: String,
    options: ReconcileOptions,
    transformer: Transformer,
    strict: bool,
    feedback_size: usize,
    slice_begin: Option<u64>,
    slice_end: Option<u64>,
    logfile: Option<PathBuf>,
    reject_file: Option<PathBuf>,
    feedback_hook: Option<FeedbackHook<'a>>,
}

impl<'a, S: Storage + ?Sized> Loader<'a, S> {
    /// Loader for `entity` with default options and no transformation steps.
    pub fn new(schema: &'a Schema, storage: &'a mut S, entity: &str) -> Result<Self, LoaderError> {
        schema.descriptor(entity)?;
        Ok(Self {
            schema,
            storage,
            entity: entity.to_string(),
            options: ReconcileOptions::default(),
            transformer: Transformer::from_config(&Default::default())?,
            strict: false,
            feedback_size: DEFAULT_FEEDBACK_SIZE,
            slice_begin: None,
            slice_end: None,
            logfile: None,
            reject_file: None,
            feedback_hook: None,
        })
    }

    /// Loader configured from a load configuration.
    pub fn from_config(schema: &'a Schema, storage: &'a mut S, config: &LoadConfig) -> Result<Self, LoaderError> {
        let mut loader = Self::new(schema, storage, &config.entity)?;
        loader.options = config.engine.clone();
        loader.transformer = Transformer::from_config(&config.transform)?;
        loader.strict = config.strict;
        loader.feedback_size = config.feedback_size.max(1);
        loader.slice_begin = config.slice_begin;
        loader.slice_end = config.slice_end;
        loader.logfile = config.logfile.clone();
        loader.reject_file = config.reject_file.clone();
        Ok(loader)
    }

    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_transformer(mut self, transformer: Transformer) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_feedback_size(mut self, feedback_size: usize) -> Self {
        self.feedback_size = feedback_size.max(1);
        self
    }

    /// Restrict the load to records `begin..=end` (1-based).
    pub fn with_slice(mut self, begin: Option<u64>, end: Option<u64>) -> Self {
        self.slice_begin = begin;
        self.slice_end = end;
        self
    }

    pub fn with_logfile(mut self, path: impl Into<PathBuf>) -> Self {
        self.logfile = Some(path.into());
        self
    }

    pub fn with_reject_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.reject_file = Some(path.into());
        self
    }

    /// Called every `feedback_size` records; returning `false` stops the load.
    pub fn with_feedback_hook<F>(mut self, hook: F) -> Self
    where
        F: FnMut(&LoadSummary) -> bool + 'a,
    {
        self.feedback_hook = Some(Box::new(hook));
        self
    }

    /// Load every record of `source`.
    ///
    /// `source_name` names the source in messages and places the default
    /// log file next to it.
    pub fn load<I>(&mut self, source: I, source_name: Option<&Path>) -> Result<LoadSummary, LoaderError>
    where
        I: IntoIterator<Item = SourceItem>,
    {
        let display_name = source_name
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<input>".to_string());
        let logfile = self
            .logfile
            .clone()
            .or_else(|| source_name.map(|p| logfile_name(p, Local::now().date_naive())));

        let mut log = LoadLog::open(logfile)?;
        let mut rejects = match &self.reject_file {
            Some(path) => Some(NdjsonWriter::create(path)?),
            None => None,
        };
        let mut counter = FeedbackCounter::new();

        tracing::info!(
            source = %display_name,
            entity = %self.entity,
            slice_begin = ?self.slice_begin,
            slice_end = ?self.slice_end,
            "Data extraction started"
        );
        log.log(&format!(
            "Data extraction started {}\n\nStart line: {}\nEnd line: {}\n",
            Local::now().format("%Y-%m-%d"),
            self.slice_begin.unwrap_or(0),
            self.slice_end.map_or_else(|| "-".to_string(), |end| end.to_string())
        ))?;

        for (index, (line, item)) in source.into_iter().enumerate() {
            let position = index as u64 + 1;
            if self.slice_begin.is_some_and(|begin| position < begin) {
                continue;
            }
            if self.slice_end.is_some_and(|end| position > end) {
                break;
            }

            let result = match item {
                Err(err) => Err(Rejected::new(RejectKind::Reader, &err, None)),
                Ok(raw) => match self.transformer.transform(raw.clone()) {
                    Err(err) => Err(Rejected::new(RejectKind::Transformation, &err, Some(Value::Dict(raw)))),
                    Ok(record) => self.load_record(line, record)?,
                },
            };

            match result {
                Ok(outcome) => counter.use_result(outcome),
                Err(rejected) => {
                    counter.reject();
                    tracing::warn!(
                        line,
                        kind = ?rejected.kind,
                        entity = rejected.entity_type.as_deref().unwrap_or(""),
                        cause = %rejected.cause,
                        "Record rejected"
                    );
                    log.log_reject(rejected.kind, line, &rejected.cause)?;
                    if let Some(writer) = rejects.as_mut() {
                        writer.write(&RejectEntry {
                            line,
                            kind: rejected.kind,
                            entity_type: rejected.entity_type.as_deref(),
                            cause: rejected.cause.clone(),
                            raw: rejected.raw.as_ref(),
                        })?;
                    }
                }
            }

            if counter.processed() % self.feedback_size as u64 == 0 {
                let message = counter.feedback(&display_name, self.feedback_size);
                tracing::info!("{}", message);
                log.log(&message)?;
                if let Some(hook) = self.feedback_hook.as_mut() {
                    if !hook(&counter.summary()) {
                        tracing::info!(processed = counter.processed(), "Load stopped by feedback hook");
                        break;
                    }
                }
            }
        }

        let summary = counter.summary();
        tracing::info!(
            processed = summary.processed,
            created = summary.created,
            updated = summary.updated,
            exists = summary.exists,
            rejected = summary.rejected,
            elapsed_secs = counter.elapsed().as_secs_f64(),
            "Data extraction finished"
        );
        log.log(&counter.finished())?;
        log.close()?;
        if let Some(writer) = rejects.as_mut() {
            writer.flush()?;
        }
        Ok(summary)
    }

    /// Reconcile one transformed record inside its own transaction.
    fn load_record(&mut self, line: u64, record: Record) -> Result<Result<Outcome, Rejected>, LoaderError> {
        self.storage.begin()?;
        let input = Value::Dict(record);
        let result = Reconciler::new(self.schema, &mut *self.storage).get_instance(&self.entity, &input, &self.options);

        match result {
            Ok(reconciled) => match reconciled.rejection {
                Some(rejection) => {
                    self.storage.rollback()?;
                    Ok(Err(Rejected {
                        kind: RejectKind::Instance,
                        cause: rejection.to_string(),
                        entity_type: Some(rejection.entity_type),
                        raw: Some(rejection.raw),
                    }))
                }
                None => {
                    self.storage.commit()?;
                    Ok(Ok(reconciled.outcome))
                }
            },
            Err(err) if self.is_recoverable(&err) => {
                self.storage.rollback()?;
                Ok(Err(Rejected {
                    kind: RejectKind::Instance,
                    cause: err.to_string(),
                    entity_type: err.entity_type().map(str::to_string),
                    raw: Some(input),
                }))
            }
            Err(err) => {
                if let Err(rollback) = self.storage.rollback() {
                    tracing::warn!(line, error = %rollback, "Rollback failed");
                }
                tracing::error!(line, error = %err, "Load aborted");
                Err(LoaderError::Aborted { line, source: err })
            }
        }
    }

    /// Errors that reject the record at hand instead of ending the batch.
    fn is_recoverable(&self, err: &EtlError) -> bool {
        err.is_record_level() || (!self.strict && err.is_data_shape())
    }
}

/// A record the loader could not load.
struct Rejected {
    kind: RejectKind,
    cause: String,
    entity_type: Option<String>,
    raw: Option<Value>,
}

impl Rejected {
    fn new(kind: RejectKind, cause: &dyn fmt::Display, raw: Option<Value>) -> Self {
        Self {
            kind,
            cause: cause.to_string(),
            entity_type: None,
            raw,
        }
    }
}
