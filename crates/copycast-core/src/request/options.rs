//! Typed parsing of the reserved per-field option set.
//!
//! The raw string map on a [`super::RequestNode`] is split into the
//! recognized reserved options (typed here) and the remainder, which the
//! projection compiler offers to its custom-filter registry.

use indexmap::IndexMap;

// ---------------------------------------------------------------------------
// Option values
// ---------------------------------------------------------------------------

/// Numeric suppression threshold: changes smaller than the threshold are
/// not reported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Deadband {
    /// Absolute threshold: `|new - last| < n` is suppressed.
    Abs(f64),
    /// Relative threshold: `|new - last| < n * |last|` is suppressed.
    Rel(f64),
}

/// Timestamp override mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampMode {
    /// Inject current wall-clock time instead of copying the master value.
    Current,
}

/// Strided array sub-range: elements `start, start+incr, start+2*incr, …`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayRange {
    /// First element index.
    pub start: usize,
    /// Stride (≥ 1).
    pub incr: usize,
}

// ---------------------------------------------------------------------------
// OptionError
// ---------------------------------------------------------------------------

/// Error from typed option parsing. These are configuration errors: the
/// whole compile is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionError {
    /// A boolean option had a value other than `true`/`false`.
    #[error("option {name} expects true or false, got {value:?}")]
    BadBool {
        /// Option name.
        name: &'static str,
        /// Offending value.
        value: String,
    },
    /// `queueSize` was not an unsigned integer or was below 2.
    #[error("queueSize must be an integer >= 2, got {value:?}")]
    BadQueueSize {
        /// Offending value.
        value: String,
    },
    /// `deadband` was not `abs:<n>` or `rel:<n>`.
    #[error("deadband must be abs:<n> or rel:<n>, got {value:?}")]
    BadDeadband {
        /// Offending value.
        value: String,
    },
    /// `timestamp` had an unrecognized mode.
    #[error("timestamp must be \"current\", got {value:?}")]
    BadTimestamp {
        /// Offending value.
        value: String,
    },
    /// `array` was not `<start>:<incr>` with incr ≥ 1.
    #[error("array must be <start>:<incr> with incr >= 1, got {value:?}")]
    BadArrayRange {
        /// Offending value.
        value: String,
    },
}

// ---------------------------------------------------------------------------
// PvOptions
// ---------------------------------------------------------------------------

/// The typed reserved options of one request node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PvOptions {
    /// Whether a get/put triggers a database process cycle (acted on by the
    /// RPC layer, carried here).
    pub process: Option<bool>,
    /// Subscriber queue capacity (≥ 2).
    pub queue_size: Option<usize>,
    /// Whether a put waits for completion (RPC layer concern).
    pub block: Option<bool>,
    /// Whether a multi-field get/put is taken under one record lock.
    pub atomic: Option<bool>,
    /// Suppress change notifications for this field and its descendants.
    pub ignore: bool,
    /// Numeric suppression threshold.
    pub deadband: Option<Deadband>,
    /// Timestamp override.
    pub timestamp: Option<TimestampMode>,
    /// Strided array sub-range.
    pub array: Option<ArrayRange>,
}

impl PvOptions {
    /// Splits `raw` into typed reserved options and the unrecognized rest.
    ///
    /// # Errors
    ///
    /// Returns an [`OptionError`] if a reserved option has a malformed
    /// value.
    pub fn parse(
        raw: &IndexMap<String, String>,
    ) -> Result<(Self, IndexMap<String, String>), OptionError> {
        let mut opts = Self::default();
        let mut rest = IndexMap::new();
        for (name, value) in raw {
            match name.as_str() {
                "process" => opts.process = Some(parse_bool("process", value)?),
                "block" => opts.block = Some(parse_bool("block", value)?),
                "atomic" => opts.atomic = Some(parse_bool("atomic", value)?),
                "ignore" => opts.ignore = parse_bool("ignore", value)?,
                "queueSize" => {
                    let n: usize = value.parse().map_err(|_| OptionError::BadQueueSize {
                        value: value.clone(),
                    })?;
                    if n < 2 {
                        return Err(OptionError::BadQueueSize {
                            value: value.clone(),
                        });
                    }
                    opts.queue_size = Some(n);
                }
                "deadband" => opts.deadband = Some(parse_deadband(value)?),
                "timestamp" => {
                    if value != "current" {
                        return Err(OptionError::BadTimestamp {
                            value: value.clone(),
                        });
                    }
                    opts.timestamp = Some(TimestampMode::Current);
                }
                "array" => opts.array = Some(parse_array_range(value)?),
                _ => {
                    rest.insert(name.clone(), value.clone());
                }
            }
        }
        Ok((opts, rest))
    }
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, OptionError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(OptionError::BadBool {
            name,
            value: value.to_string(),
        }),
    }
}

fn parse_deadband(value: &str) -> Result<Deadband, OptionError> {
    let err = || OptionError::BadDeadband {
        value: value.to_string(),
    };
    let (mode, num) = value.split_once(':').ok_or_else(err)?;
    let n: f64 = num.parse().map_err(|_| err())?;
    if !n.is_finite() || n < 0.0 {
        return Err(err());
    }
    match mode {
        "abs" => Ok(Deadband::Abs(n)),
        "rel" => Ok(Deadband::Rel(n)),
        _ => Err(err()),
    }
}

fn parse_array_range(value: &str) -> Result<ArrayRange, OptionError> {
    let err = || OptionError::BadArrayRange {
        value: value.to_string(),
    };
    let (start, incr) = value.split_once(':').ok_or_else(err)?;
    let start: usize = start.parse().map_err(|_| err())?;
    let incr: usize = incr.parse().map_err(|_| err())?;
    if incr == 0 {
        return Err(err());
    }
    Ok(ArrayRange { start, incr })
}

// ===========================================================================
// Tests
// ===========================================================================
