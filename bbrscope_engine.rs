//! # BBRScope Engine - BBR Telemetry Analysis
//!
//! A batch ingestion, normalization, windowed-aggregation, and statistics
//! engine for free-form BBR congestion-control telemetry logs. This is the
//! core that turns raw text dumps into structured, time-ordered samples
//! suitable for comparison, aggregation, and reporting.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          BBRSCOPE RUST ENGINE                            │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  RAW LINES → CLASSIFIER → EXTRACTOR → NORMALIZER → [AGGREGATOR]         │
//! │            → ANOMALY FILTER → STATISTICS → REPORT / AUDIT DUMP          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Multi-Dialect**: periodic state dumps, per-packet events, and a
//!   structured-debug dialect, normalized to one canonical sample shape
//! - **Stateful Deltas**: per-run incremental loss reconstruction from
//!   interleaved acked/lost events
//! - **Windowed Aggregation**: fixed-width time buckets with per-field
//!   reducer policies (single-run and multi-connection profiles)
//! - **Outlier Suppression**: plausibility-bound field nulling that never
//!   drops rows
//! - **Batch Parallelism**: one worker per input file, no shared state
//!
//! ## Author
//!
//! AIOps Team

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// External crate imports organized by functionality.
// ============================================================================

#![allow(dead_code)]
#![allow(unused_imports)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

// ----------------------------------------------------------------------------
// Parallel Batch Processing
// ----------------------------------------------------------------------------
use once_cell::sync::Lazy;
use rayon::prelude::*;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::AHashMap;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::Context as AnyhowContext;
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ----------------------------------------------------------------------------
// Statistics & Math
// ----------------------------------------------------------------------------
use ordered_float::OrderedFloat;

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use memchr::memmem;
use regex::Regex;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Global constants that define the behavior and limits of the engine.
// The anomaly bounds are the documented plausibility limits of the monitored
// network path, not tuning knobs for the algorithms themselves.
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_FULL_NAME: &str = "BBRScope Telemetry Engine";

// ----------------------------------------------------------------------------
// Aggregation Windows
// ----------------------------------------------------------------------------

/// Default aggregation window width in seconds
pub const DEFAULT_WINDOW_SECS: f64 = 0.1;

/// Smallest window width accepted by configuration validation (seconds)
pub const MIN_WINDOW_SECS: f64 = 0.000_1;

// ----------------------------------------------------------------------------
// Anomaly Plausibility Bounds
// ----------------------------------------------------------------------------

/// RTT measurements above this are implausible for the monitored path (ms)
pub const DEFAULT_RTT_MAX_MS: f64 = 1_000.0;

/// Bandwidth-rate fields above this are sensor/parse artifacts (Mbps)
pub const DEFAULT_RATE_MAX_MBPS: f64 = 2_000.0;

// ----------------------------------------------------------------------------
// Unit Conversions
// ----------------------------------------------------------------------------

/// Microseconds per millisecond (RTT is stored in us, presented in ms)
pub const US_PER_MS: f64 = 1_000.0;

/// Bytes per KB (CWND/in-flight stored in bytes, presented in KB)
pub const BYTES_PER_KB: f64 = 1_024.0;

/// Bytes-per-second to Mbps factor for the structured-debug dialect
pub const BPS_TO_MBPS: f64 = 8.0 / 1_000_000.0;

// ----------------------------------------------------------------------------
// Audit Dump Contract
// ----------------------------------------------------------------------------

/// Column header of the sampling-points audit dump. Downstream tooling keys
/// on this exact order; do not reformat.
pub const SAMPLING_POINTS_COLUMNS: &str = "No.,Time(s),PacketNo,Size(B),EstBW(Mbps),PacingRate(Mbps),DeliveryRate(Mbps),RTT(ms),MinRTT(ms),CWND(KB),BytesInFlight(KB),LostPackets,LossRate(%),BBRState,SendDelay(ms),AckDelay(ms),PacingGain,CwndGain";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The canonical data model every dialect is normalized into:
// - BbrState: open-set categorical state label
// - Sample: one telemetry observation at a point in time
// - LossEvent: side-record for one reported packet-loss occurrence
// - AggregatedSample: one time bucket reduced to a Sample + contributor count
// - Run: the full ordered Sample sequence from one input file
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 BBR State Label
// ----------------------------------------------------------------------------

/// Congestion-controller state as reported by the telemetry producer.
///
/// This is an open set: any token the source emits is a valid state. The
/// known variants exist for cheap comparison and canonical spelling; every
/// other token is carried through verbatim in `Other`. The engine never uses
/// the state for correctness logic — transition legality belongs to the
/// producer, not this observer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BbrState {
    Startup,
    Drain,
    ProbeBw,
    ProbeRtt,
    Unknown,
    Other(CompactString),
}

impl BbrState {
    /// Parse a state token. Common spellings of the four BBR states are
    /// folded onto the known variants; anything else is kept verbatim.
    pub fn from_token(token: &str) -> Self {
        match token.to_ascii_uppercase().as_str() {
            "STARTUP" => BbrState::Startup,
            "DRAIN" => BbrState::Drain,
            "PROBE_BW" | "PROBEBW" => BbrState::ProbeBw,
            "PROBE_RTT" | "PROBERTT" => BbrState::ProbeRtt,
            "UNKNOWN" => BbrState::Unknown,
            _ => BbrState::Other(CompactString::from(token)),
        }
    }

    /// Canonical display spelling.
    pub fn as_str(&self) -> &str {
        match self {
            BbrState::Startup => "Startup",
            BbrState::Drain => "Drain",
            BbrState::ProbeBw => "ProbeBW",
            BbrState::ProbeRtt => "ProbeRTT",
            BbrState::Unknown => "Unknown",
            BbrState::Other(s) => s.as_str(),
        }
    }
}

impl Default for BbrState {
    fn default() -> Self {
        BbrState::Unknown
    }
}

impl Display for BbrState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for BbrState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for BbrState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        Ok(BbrState::from_token(&token))
    }
}

// ----------------------------------------------------------------------------
// 3.2 Sample
// ----------------------------------------------------------------------------

/// One normalized telemetry observation at a point in time.
///
/// `time_sec` is the only field guaranteed present: a line without a
/// parseable timestamp is discarded upstream and never materialized. Every
/// other field is `Option`: extraction fills dialect defaults (`Some(0)` /
/// `Some(0.0)` / `Unknown`), and the anomaly filter later nulls individual
/// values to `None` without ever removing the row.
///
/// Canonical units: rates in Mbps, RTT and delays in microseconds, window
/// sizes in bytes. Millisecond and KB views exist only at presentation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    /// Run-relative timestamp in seconds (required)
    pub time_sec: f64,
    /// Packet number for per-packet dialects
    pub packet_number: Option<u64>,
    /// Packet size in bytes for per-packet dialects
    pub packet_size_bytes: Option<u64>,
    /// Application send rate
    pub send_rate_mbps: Option<f64>,
    /// Application receive rate
    pub recv_rate_mbps: Option<f64>,
    /// Combined send + receive rate
    pub total_rate_mbps: Option<f64>,
    /// Bottleneck-bandwidth estimate
    pub estimated_bw_mbps: Option<f64>,
    /// Pacing rate applied by the controller
    pub pacing_rate_mbps: Option<f64>,
    /// Measured delivery rate
    pub delivery_rate_mbps: Option<f64>,
    /// Smoothed round-trip time (microseconds)
    pub rtt_us: Option<u64>,
    /// Running RTT floor (microseconds)
    pub min_rtt_us: Option<u64>,
    /// Congestion window (bytes)
    pub cwnd_bytes: Option<u64>,
    /// Bytes currently in flight
    pub inflight_bytes: Option<u64>,
    /// Running loss total as reported by the source
    pub lost_packets_cumulative: Option<u64>,
    /// Event-local loss delta; only meaningful for loss-kind samples
    pub lost_packets_incremental: Option<u64>,
    /// Loss rate percentage as reported
    pub loss_rate_pct: Option<f64>,
    /// Controller state label (open set)
    pub state: BbrState,
    /// Pacing gain multiplier (dimensionless)
    pub pacing_gain: Option<f64>,
    /// CWND gain multiplier (dimensionless)
    pub cwnd_gain: Option<f64>,
    /// Send-side scheduling delay (microseconds)
    pub send_delay_us: Option<u64>,
    /// Reported ack delay (microseconds)
    pub ack_delay_us: Option<u64>,
    /// True when extraction resolved the core fields without defaulting
    pub is_valid: bool,
    /// Original text line, retained for audit/debug
    pub raw_line: String,
}

impl Sample {
    /// A sample with only the timestamp set; everything else absent.
    pub fn at(time_sec: f64) -> Self {
        Self {
            time_sec,
            packet_number: None,
            packet_size_bytes: None,
            send_rate_mbps: None,
            recv_rate_mbps: None,
            total_rate_mbps: None,
            estimated_bw_mbps: None,
            pacing_rate_mbps: None,
            delivery_rate_mbps: None,
            rtt_us: None,
            min_rtt_us: None,
            cwnd_bytes: None,
            inflight_bytes: None,
            lost_packets_cumulative: None,
            lost_packets_incremental: None,
            loss_rate_pct: None,
            state: BbrState::Unknown,
            pacing_gain: None,
            cwnd_gain: None,
            send_delay_us: None,
            ack_delay_us: None,
            is_valid: false,
            raw_line: String::new(),
        }
    }

    /// Smoothed RTT in milliseconds (presentation unit).
    #[inline]
    pub fn rtt_ms(&self) -> Option<f64> {
        self.rtt_us.map(|v| v as f64 / US_PER_MS)
    }

    /// RTT floor in milliseconds (presentation unit).
    #[inline]
    pub fn min_rtt_ms(&self) -> Option<f64> {
        self.min_rtt_us.map(|v| v as f64 / US_PER_MS)
    }

    /// Congestion window in KB (presentation unit).
    #[inline]
    pub fn cwnd_kb(&self) -> Option<f64> {
        self.cwnd_bytes.map(|v| v as f64 / BYTES_PER_KB)
    }

    /// Bytes in flight in KB (presentation unit).
    #[inline]
    pub fn inflight_kb(&self) -> Option<f64> {
        self.inflight_bytes.map(|v| v as f64 / BYTES_PER_KB)
    }
}

// ----------------------------------------------------------------------------
// 3.3 Loss Event
// ----------------------------------------------------------------------------

/// One reported packet-loss occurrence.
///
/// Loss-kind lines produce both a `Sample` and a `LossEvent`; the event
/// carries the reconstructed per-event loss delta.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LossEvent {
    /// Run-relative timestamp in seconds
    pub time_sec: f64,
    /// Largest packet number reported lost
    pub packet_number: Option<u64>,
    /// Retransmittable bytes attributed to the event
    pub packet_size_bytes: Option<u64>,
    /// Loss delta against the last acknowledgment's running total.
    ///
    /// Always >= 1 by construction: a non-positive delta is clamped to 1.
    /// This masks out-of-order acked/lost interleaving and is a documented
    /// lossy heuristic, not a guaranteed-accurate reconstruction.
    pub lost_packets_incremental: u64,
    /// Running loss total at the event, for reference
    pub lost_packets_cumulative: Option<u64>,
    /// Running sent total at the event
    pub total_sent: Option<u64>,
    /// Loss rate percentage as reported
    pub loss_rate_pct: Option<f64>,
    /// Whether the producer flagged persistent congestion
    pub persistent_congestion: bool,
    /// Pacing gain at the event
    pub pacing_gain: Option<f64>,
    /// CWND gain at the event
    pub cwnd_gain: Option<f64>,
    /// Original text line
    pub raw_line: String,
}

// ----------------------------------------------------------------------------
// 3.4 Aggregated Sample
// ----------------------------------------------------------------------------

/// One time bucket reduced to a single sample.
///
/// Shares the `Sample` field set; each field is the reduction of that field
/// over every contributor in the bucket (see the windowed aggregator for the
/// per-field policy). `sample_count` doubles as a connection-concurrency
/// indicator when multiple logical streams are merged into one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedSample {
    /// The reduced field set
    pub sample: Sample,
    /// Number of source samples that contributed to this bucket
    pub sample_count: usize,
}

// ----------------------------------------------------------------------------
// 3.5 Ingest Diagnostics
// ----------------------------------------------------------------------------

/// Per-kind line counters collected while ingesting one file.
///
/// Unrecognized and timestamp-less lines are dropped, never errors; these
/// counters are the only trace they leave.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestDiagnostics {
    /// Total lines read (including dropped ones)
    pub total_lines: u64,
    /// Periodic state-dump lines
    pub log_lines: u64,
    /// Per-packet sent events
    pub sent_lines: u64,
    /// Per-packet acked events (consumed for loss-delta state only)
    pub acked_lines: u64,
    /// Per-packet lost events
    pub lost_lines: u64,
    /// Structured-debug dialect lines
    pub debug_lines: u64,
    /// Lines matching no dialect marker
    pub unrecognized_lines: u64,
    /// Marker-matched lines discarded for lacking a parseable timestamp
    pub dropped_no_timestamp: u64,
}

impl IngestDiagnostics {
    /// Percentage of total lines, 0.0 when nothing was read.
    pub fn pct(&self, count: u64) -> f64 {
        if self.total_lines == 0 {
            0.0
        } else {
            count as f64 / self.total_lines as f64 * 100.0
        }
    }
}

// ----------------------------------------------------------------------------
// 3.6 Run
// ----------------------------------------------------------------------------

/// The full ordered sample sequence derived from one input log file, plus
/// its loss-event side list and ingest diagnostics.
///
/// Samples are sorted by `time_sec` after ingest. The whole run is held in
/// memory for its lifetime; there is no out-of-core support.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    /// Path the run was ingested from
    pub source: PathBuf,
    /// Time-ordered samples
    pub samples: Vec<Sample>,
    /// Loss events in time order
    pub loss_events: Vec<LossEvent>,
    /// Line-level counters
    pub diagnostics: IngestDiagnostics,
}

impl Run {
    /// Number of samples in the run.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// True when the run holds no samples. Ingest refuses to produce such a
    /// run, but aggregation results can legitimately be empty.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Total packets lost across the loss-event list (incremental sum).
    pub fn packets_lost(&self) -> u64 {
        self.loss_events.iter().map(|e| e.lost_packets_incremental).sum()
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Layered error types per subsystem. Extraction-level issues never reach
// this layer — they are recovered locally as field defaults. Only file-level
// and empty-result conditions surface as explicit failures, and in batch
// mode they fail the affected run without crashing the batch.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Top-Level Engine Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScopeError {
    /// Get the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            ScopeError::Config(_) => "config",
            ScopeError::Ingest(_) => "ingest",
            ScopeError::Processing(_) => "processing",
            ScopeError::Io(_) => "io",
            ScopeError::Internal(_) => "internal",
        }
    }
}

/// Engine result alias.
pub type ScopeResult<T> = Result<T, ScopeError>;

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Ingest Errors
// ----------------------------------------------------------------------------

/// File-level ingest failures. Missing input and empty result are distinct
/// conditions: downstream aggregation and statistics must refuse to run on
/// an empty sequence, and callers report the two differently.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Input file not found: {}", path.display())]
    MissingInput { path: PathBuf },

    #[error("No samples extracted from {}", path.display())]
    EmptyRun { path: PathBuf },

    #[error("Failed reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl IngestError {
    /// Whether a batch over multiple files should continue past this error.
    /// Every ingest error is per-file; none of them poison the batch.
    pub fn is_recoverable(&self) -> bool {
        true
    }
}

// ----------------------------------------------------------------------------
// 4.4 Processing Errors
// ----------------------------------------------------------------------------

/// Errors from aggregation and statistics.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("Statistics require a non-empty sample sequence")]
    EmptyInput,

    #[error("Window width must be positive, got {0}")]
    InvalidWindow(f64),
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML configuration with environment-variable overrides (BBRSCOPE_*).
// Every section has serde defaults so a missing file degrades to the
// documented default behavior.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Engine Configuration Root
// ----------------------------------------------------------------------------

/// Root engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Ingest settings
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Windowed-aggregation settings
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Anomaly-filter plausibility bounds
    #[serde(default)]
    pub filter: FilterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from file with environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("BBRSCOPE_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing).
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.aggregation.window_secs.is_finite()
            || self.aggregation.window_secs < MIN_WINDOW_SECS
        {
            return Err(ConfigError::invalid_value(
                "aggregation.window_secs",
                format!("window width must be at least {}s", MIN_WINDOW_SECS),
            ));
        }

        if self.filter.rtt_max_ms <= 0.0 {
            return Err(ConfigError::invalid_value(
                "filter.rtt_max_ms",
                "RTT plausibility bound must be positive",
            ));
        }

        if self.filter.rate_max_mbps <= 0.0 {
            return Err(ConfigError::invalid_value(
                "filter.rate_max_mbps",
                "rate plausibility bound must be positive",
            ));
        }

        Ok(())
    }

    /// Create a default config file body.
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Ingest Configuration
// ----------------------------------------------------------------------------

/// Ingest settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Stop reading each file after this many lines (None = whole file)
    #[serde(default)]
    pub max_lines: Option<u64>,
}

// ----------------------------------------------------------------------------
// 5.3 Aggregation Configuration
// ----------------------------------------------------------------------------

/// Which reducer family applies to per-connection rate fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum AggregationProfile {
    /// One logical stream per window contributor: rates, CWND, and in-flight
    /// are averaged within the bucket.
    SingleRun,
    /// Multiple connections merged into one window: per-connection rates,
    /// CWND, and in-flight sum across contributors.
    MultiConnection,
}

impl Default for AggregationProfile {
    fn default() -> Self {
        AggregationProfile::SingleRun
    }
}

/// Which timestamp represents a bucket.
///
/// The two historical aggregation call sites disagreed (bucket midpoint vs
/// first contributor); the engine applies exactly one convention, uniformly,
/// selected here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TimestampConvention {
    /// Bucket start + half the window width
    BucketMidpoint,
    /// Timestamp of the first contributing sample
    FirstSample,
}

impl Default for TimestampConvention {
    fn default() -> Self {
        TimestampConvention::BucketMidpoint
    }
}

/// Windowed-aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Bucket width in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: f64,

    /// Reducer profile for rate-class fields
    #[serde(default)]
    pub profile: AggregationProfile,

    /// Representative-timestamp convention
    #[serde(default)]
    pub timestamp_convention: TimestampConvention,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            profile: AggregationProfile::default(),
            timestamp_convention: TimestampConvention::default(),
        }
    }
}

fn default_window_secs() -> f64 {
    DEFAULT_WINDOW_SECS
}

// ----------------------------------------------------------------------------
// 5.4 Anomaly Filter Configuration
// ----------------------------------------------------------------------------

/// Plausibility bounds for the anomaly filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Whether the filter pass runs at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// RTT / min-RTT above this is nulled (milliseconds)
    #[serde(default = "default_rtt_max_ms")]
    pub rtt_max_ms: f64,

    /// Bandwidth-rate fields above this are nulled (Mbps)
    #[serde(default = "default_rate_max_mbps")]
    pub rate_max_mbps: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rtt_max_ms: default_rtt_max_ms(),
            rate_max_mbps: default_rate_max_mbps(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_rtt_max_ms() -> f64 {
    DEFAULT_RTT_MAX_MS
}

fn default_rate_max_mbps() -> f64 {
    DEFAULT_RATE_MAX_MBPS
}

// ----------------------------------------------------------------------------
// 5.5 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: pretty, compact, json
    #[serde(default = "default_log_format")]
    pub format: String,

    /// ANSI colors for terminal output
    #[serde(default = "default_true")]
    pub colors: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration.
pub fn init_logging(config: &LoggingConfig) -> ScopeResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json().with_target(true))
                .try_init()
                .map_err(|e| ScopeError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "pretty" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .pretty()
                        .with_ansi(config.colors)
                        .with_target(true),
                )
                .try_init()
                .map_err(|e| ScopeError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            // Compact format (default)
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_ansi(config.colors)
                        .with_target(true),
                )
                .try_init()
                .map_err(|e| ScopeError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "bbrscope::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: LINE CLASSIFIER
// ============================================================================
// One dispatch step over every input line. Markers are literal substrings;
// the classifier does no field parsing and the emission order in the source
// file is irrelevant to it. Marker hits use precompiled substring searchers
// because classification runs once per line over multi-GB logs.
// ============================================================================

/// Record dialect of one raw line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// Periodic controller state dump
    Log,
    /// Per-packet sent event
    PacketSent,
    /// Per-packet acknowledgment event
    PacketAcked,
    /// Per-packet loss event
    PacketLost,
    /// Structured-debug state dump
    DebugStruct,
    /// No marker matched; line is dropped
    Unrecognized,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Log => "log",
            RecordKind::PacketSent => "sent",
            RecordKind::PacketAcked => "acked",
            RecordKind::PacketLost => "lost",
            RecordKind::DebugStruct => "debug",
            RecordKind::Unrecognized => "unrecognized",
        }
    }
}

static FIND_LOG: Lazy<memmem::Finder<'static>> = Lazy::new(|| memmem::Finder::new("[BBR-LOG]"));
static FIND_SENT: Lazy<memmem::Finder<'static>> =
    Lazy::new(|| memmem::Finder::new("[BBR-PKT-SENT]"));
static FIND_ACKED: Lazy<memmem::Finder<'static>> =
    Lazy::new(|| memmem::Finder::new("[BBR-PKT-ACKED]"));
static FIND_LOST: Lazy<memmem::Finder<'static>> =
    Lazy::new(|| memmem::Finder::new("[BBR-PKT-LOST]"));
static FIND_DEBUG: Lazy<memmem::Finder<'static>> = Lazy::new(|| memmem::Finder::new("=\"{"));

/// Classify one raw line into its record dialect.
///
/// Packet-event markers are checked before the generic log marker so a line
/// carrying both resolves to the more specific kind; the structured-debug
/// marker is checked last because its signature (`="{`) is the loosest.
pub fn classify_line(line: &str) -> RecordKind {
    let bytes = line.as_bytes();
    if FIND_SENT.find(bytes).is_some() {
        RecordKind::PacketSent
    } else if FIND_ACKED.find(bytes).is_some() {
        RecordKind::PacketAcked
    } else if FIND_LOST.find(bytes).is_some() {
        RecordKind::PacketLost
    } else if FIND_LOG.find(bytes).is_some() {
        RecordKind::Log
    } else if FIND_DEBUG.find(bytes).is_some() {
        RecordKind::DebugStruct
    } else {
        RecordKind::Unrecognized
    }
}

// ============================================================================
// SECTION 8: FIELD EXTRACTOR
// ============================================================================
// Pattern-directed extraction of named fields from a classified line. Every
// rule scans the line independently, so field order in the source text is
// irrelevant. A failed rule, or a numeric token that fails to parse, yields
// an absent field rather than an error; extraction is pure and idempotent.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Extraction Rules
// ----------------------------------------------------------------------------
// \b guards keep substring-colliding names apart (RTT vs MinRTT, Lost vs
// TotalLost, rtt vs min_rtt) without depending on field order.

static RE_TIME: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bT=([\d.]+) s").unwrap());
static RE_SEND: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bSend=([\d.]+) Mbps").unwrap());
static RE_RECV: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bRecv=([\d.]+) Mbps").unwrap());
static RE_TOTAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bTotal=([\d.]+) Mbps").unwrap());
static RE_ESTBW: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bEstBW=([\d.]+) Mbps").unwrap());
static RE_PACING_RATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bPacingRate=([\d.]+) Mbps").unwrap());
static RE_DELIVERY_RATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bDeliveryRate=([\d.]+) Mbps").unwrap());
static RE_PACING_GAIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bPacingGain=([\d.]+)x").unwrap());
static RE_CWND_GAIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bCwndGain=([\d.]+)x").unwrap());
static RE_RTT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bRTT=(\d+) us").unwrap());
static RE_MIN_RTT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bMinRTT=(\d+) us").unwrap());
static RE_SEND_DELAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bSendDelay=(\d+) us").unwrap());
static RE_ACK_DELAY: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bAckDelay=(\d+) us").unwrap());
static RE_CWND: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bCWND=(\d+) B").unwrap());
static RE_INFLIGHT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bInFlight=(\d+) B").unwrap());
static RE_LOST: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bLost=(\d+)").unwrap());
static RE_LOSS_PCT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bLoss=([\d.]+)%").unwrap());
static RE_TOTAL_SENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bTotalSent=(\d+)").unwrap());
static RE_TOTAL_LOST: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bTotalLost=(\d+)").unwrap());
static RE_PKT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bPKT=(\d+)").unwrap());
static RE_SIZE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bSize=(\d+) B").unwrap());
static RE_STATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bState=(\w+)").unwrap());
static RE_PKTS_PAIR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bPkts=(\d+)/(\d+)").unwrap());
static RE_BYTES_PAIR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bBytes=(\d+)/(\d+)").unwrap());

// Structured-debug dialect rules. Values are key: value pairs inside a
// braced block, with rates in B/s and RTTs in fractional ms.
static RE_DBG_ABS_TS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+(?:\.\d+)?)\s").unwrap());
static RE_DBG_STATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bstate: (\w+)").unwrap());
static RE_DBG_BTLBW: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bbtlbw: (\d+) B/s").unwrap());
static RE_DBG_PACING: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bpacing_rate: (\d+) B/s").unwrap());
static RE_DBG_DELIVERY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bdelivery_rate: (\d+) B/s").unwrap());
static RE_DBG_RTT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\brtt: ([\d.]+)ms").unwrap());
static RE_DBG_MIN_RTT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bmin_rtt: ([\d.]+)ms").unwrap());
static RE_DBG_PACING_GAIN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bpacing_gain: ([\d.]+)").unwrap());
static RE_DBG_CWND_GAIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bcwnd_gain: ([\d.]+)").unwrap());
static RE_DBG_LOST: Lazy<Regex> = Lazy::new(|| Regex::new(r"\blost: (\d+)").unwrap());
static RE_DBG_CWND: Lazy<Regex> = Lazy::new(|| Regex::new(r"\bcwnd=(\d+)").unwrap());
static RE_DBG_INFLIGHT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\bbytes_in_flight=(\d+)").unwrap());

#[inline]
fn cap_f64(re: &Regex, line: &str) -> Option<f64> {
    re.captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<f64>().ok())
}

#[inline]
fn cap_u64(re: &Regex, line: &str) -> Option<u64> {
    re.captures(line)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
}

#[inline]
fn cap_pair_u64(re: &Regex, line: &str) -> Option<(u64, u64)> {
    let caps = re.captures(line)?;
    let a = caps.get(1)?.as_str().parse::<u64>().ok()?;
    let b = caps.get(2)?.as_str().parse::<u64>().ok()?;
    Some((a, b))
}

// ----------------------------------------------------------------------------
// 8.2 Raw Field Mapping
// ----------------------------------------------------------------------------

/// The flat field mapping extraction produces for one line, before the
/// normalizer applies dialect defaults and stateful delta reconstruction.
/// Absent means the rule did not match, or its numeric token failed to
/// parse. Extraction reads nothing but the line: running it twice on the
/// same text yields identical mappings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawFields {
    pub time_sec: Option<f64>,
    pub packet_number: Option<u64>,
    pub packet_size_bytes: Option<u64>,
    pub send_rate_mbps: Option<f64>,
    pub recv_rate_mbps: Option<f64>,
    pub total_rate_mbps: Option<f64>,
    pub estimated_bw_mbps: Option<f64>,
    pub pacing_rate_mbps: Option<f64>,
    pub delivery_rate_mbps: Option<f64>,
    pub rtt_us: Option<u64>,
    pub min_rtt_us: Option<u64>,
    pub cwnd_bytes: Option<u64>,
    pub inflight_bytes: Option<u64>,
    /// `Lost=` counter of the state-dump dialect
    pub lost: Option<u64>,
    pub loss_rate_pct: Option<f64>,
    pub total_sent: Option<u64>,
    pub total_lost: Option<u64>,
    pub state: Option<BbrState>,
    pub pacing_gain: Option<f64>,
    pub cwnd_gain: Option<f64>,
    pub send_delay_us: Option<u64>,
    pub ack_delay_us: Option<u64>,
    /// Sent/received packet counters (`Pkts=a/b`)
    pub pkts_sent_recv: Option<(u64, u64)>,
    /// Sent/received byte counters (`Bytes=a/b`)
    pub bytes_sent_recv: Option<(u64, u64)>,
    pub persistent_congestion: bool,
}

/// Extract every matching field from one classified line.
///
/// The three text dialects share one rule table; the structured-debug
/// dialect has its own rules plus unit conversion (B/s to Mbps, fractional
/// ms to integer us) so the mapping comes out in canonical units. For that
/// dialect `time_sec` carries the absolute source timestamp; the normalizer
/// rebases it onto the run epoch.
pub fn extract_fields(line: &str, kind: RecordKind) -> RawFields {
    match kind {
        RecordKind::DebugStruct => extract_debug_fields(line),
        RecordKind::Unrecognized => RawFields::default(),
        _ => extract_text_fields(line),
    }
}

fn extract_text_fields(line: &str) -> RawFields {
    RawFields {
        time_sec: cap_f64(&RE_TIME, line),
        packet_number: cap_u64(&RE_PKT, line),
        packet_size_bytes: cap_u64(&RE_SIZE, line),
        send_rate_mbps: cap_f64(&RE_SEND, line),
        recv_rate_mbps: cap_f64(&RE_RECV, line),
        total_rate_mbps: cap_f64(&RE_TOTAL, line),
        estimated_bw_mbps: cap_f64(&RE_ESTBW, line),
        pacing_rate_mbps: cap_f64(&RE_PACING_RATE, line),
        delivery_rate_mbps: cap_f64(&RE_DELIVERY_RATE, line),
        rtt_us: cap_u64(&RE_RTT, line),
        min_rtt_us: cap_u64(&RE_MIN_RTT, line),
        cwnd_bytes: cap_u64(&RE_CWND, line),
        inflight_bytes: cap_u64(&RE_INFLIGHT, line),
        lost: cap_u64(&RE_LOST, line),
        loss_rate_pct: cap_f64(&RE_LOSS_PCT, line),
        total_sent: cap_u64(&RE_TOTAL_SENT, line),
        total_lost: cap_u64(&RE_TOTAL_LOST, line),
        state: RE_STATE
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| BbrState::from_token(m.as_str())),
        pacing_gain: cap_f64(&RE_PACING_GAIN, line),
        cwnd_gain: cap_f64(&RE_CWND_GAIN, line),
        send_delay_us: cap_u64(&RE_SEND_DELAY, line),
        ack_delay_us: cap_u64(&RE_ACK_DELAY, line),
        pkts_sent_recv: cap_pair_u64(&RE_PKTS_PAIR, line),
        bytes_sent_recv: cap_pair_u64(&RE_BYTES_PAIR, line),
        persistent_congestion: line.contains("PersistentCongestion=YES"),
    }
}

fn extract_debug_fields(line: &str) -> RawFields {
    RawFields {
        time_sec: cap_f64(&RE_DBG_ABS_TS, line),
        estimated_bw_mbps: cap_u64(&RE_DBG_BTLBW, line).map(|v| v as f64 * BPS_TO_MBPS),
        pacing_rate_mbps: cap_u64(&RE_DBG_PACING, line).map(|v| v as f64 * BPS_TO_MBPS),
        delivery_rate_mbps: cap_u64(&RE_DBG_DELIVERY, line).map(|v| v as f64 * BPS_TO_MBPS),
        rtt_us: cap_f64(&RE_DBG_RTT, line).map(|ms| (ms * US_PER_MS).round() as u64),
        min_rtt_us: cap_f64(&RE_DBG_MIN_RTT, line).map(|ms| (ms * US_PER_MS).round() as u64),
        cwnd_bytes: cap_u64(&RE_DBG_CWND, line),
        inflight_bytes: cap_u64(&RE_DBG_INFLIGHT, line),
        lost: cap_u64(&RE_DBG_LOST, line),
        state: RE_DBG_STATE
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| BbrState::from_token(m.as_str())),
        pacing_gain: cap_f64(&RE_DBG_PACING_GAIN, line),
        cwnd_gain: cap_f64(&RE_DBG_CWND_GAIN, line),
        ..RawFields::default()
    }
}

// ============================================================================
// SECTION 9: CLASSIFIER & EXTRACTOR TESTS
// ============================================================================


// ============================================================================
// SECTION 10: EVENT NORMALIZER
// ============================================================================
// Turns one classified + extracted line into canonical records, applying
// dialect defaults and the only stateful step in the pipeline: per-run
// reconstruction of incremental loss from interleaved acked/lost events.
// State is injected per run; nothing here touches globals, so concurrent
// runs cannot contaminate each other.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Normalizer State
// ----------------------------------------------------------------------------

/// Mutable per-run normalization state.
#[derive(Debug, Clone, Default)]
pub struct NormalizerState {
    /// Cumulative loss total at the most recent acknowledgment event.
    /// Loss events delta against this; it is only ever advanced by acks.
    last_ack_cumulative_lost: u64,
    /// First absolute timestamp seen in the structured-debug dialect.
    /// All debug timestamps are rebased onto this run epoch.
    debug_epoch: Option<f64>,
}

impl NormalizerState {
    pub fn new() -> Self {
        Self::default()
    }
}

// ----------------------------------------------------------------------------
// 10.2 Normalization Outcome
// ----------------------------------------------------------------------------

/// What one line normalized into.
#[derive(Debug, Clone, PartialEq)]
pub enum Normalized {
    /// A plain observation
    Sample(Sample),
    /// A loss observation: a sample plus its side event record
    Loss { sample: Sample, event: LossEvent },
    /// Acknowledgment consumed for loss-delta state; no sample produced
    AckOnly,
    /// Dropped: unrecognized, or no parseable timestamp
    Skipped,
}

// ----------------------------------------------------------------------------
// 10.3 Normalization
// ----------------------------------------------------------------------------

/// Normalize one line of the given kind.
///
/// Acked lines advance the loss baseline even when their own timestamp is
/// missing. Every other marker-matched line without a parseable timestamp
/// is skipped. Fields a dialect carries default to zero / `Unknown` when
/// their rule fails on the line; fields the dialect never carries stay
/// absent.
pub fn normalize_line(kind: RecordKind, line: &str, state: &mut NormalizerState) -> Normalized {
    if kind == RecordKind::Unrecognized {
        return Normalized::Skipped;
    }

    let fields = extract_fields(line, kind);

    if kind == RecordKind::PacketAcked {
        if let Some(total_lost) = fields.total_lost {
            state.last_ack_cumulative_lost = total_lost;
        }
        return if fields.time_sec.is_some() {
            Normalized::AckOnly
        } else {
            Normalized::Skipped
        };
    }

    let time_sec = match fields.time_sec {
        Some(t) => match kind {
            RecordKind::DebugStruct => {
                let epoch = *state.debug_epoch.get_or_insert(t);
                t - epoch
            }
            _ => t,
        },
        None => {
            trace!(target: "bbrscope::normalize", kind = kind.as_str(), "line without timestamp dropped");
            return Normalized::Skipped;
        }
    };

    // Core-field validity is judged before defaults are applied.
    let is_valid = fields.estimated_bw_mbps.is_some()
        && fields.rtt_us.is_some()
        && fields.cwnd_bytes.is_some()
        && fields.state.is_some();

    let mut sample = Sample::at(time_sec);
    sample.is_valid = is_valid;
    sample.raw_line = line.to_string();

    match kind {
        RecordKind::Log => {
            sample.send_rate_mbps = Some(fields.send_rate_mbps.unwrap_or(0.0));
            sample.recv_rate_mbps = Some(fields.recv_rate_mbps.unwrap_or(0.0));
            sample.total_rate_mbps = Some(fields.total_rate_mbps.unwrap_or(0.0));
            sample.estimated_bw_mbps = Some(fields.estimated_bw_mbps.unwrap_or(0.0));
            sample.pacing_rate_mbps = Some(fields.pacing_rate_mbps.unwrap_or(0.0));
            sample.delivery_rate_mbps = Some(fields.delivery_rate_mbps.unwrap_or(0.0));
            sample.rtt_us = Some(fields.rtt_us.unwrap_or(0));
            sample.min_rtt_us = Some(fields.min_rtt_us.unwrap_or(0));
            sample.cwnd_bytes = Some(fields.cwnd_bytes.unwrap_or(0));
            sample.inflight_bytes = Some(fields.inflight_bytes.unwrap_or(0));
            sample.lost_packets_cumulative = Some(fields.lost.unwrap_or(0));
            sample.state = fields.state.unwrap_or_default();
            sample.pacing_gain = Some(fields.pacing_gain.unwrap_or(0.0));
            sample.cwnd_gain = Some(fields.cwnd_gain.unwrap_or(0.0));
            Normalized::Sample(sample)
        }
        RecordKind::PacketSent => {
            sample.packet_number = Some(fields.packet_number.unwrap_or(0));
            sample.packet_size_bytes = Some(fields.packet_size_bytes.unwrap_or(0));
            sample.estimated_bw_mbps = Some(fields.estimated_bw_mbps.unwrap_or(0.0));
            sample.pacing_rate_mbps = Some(fields.pacing_rate_mbps.unwrap_or(0.0));
            sample.delivery_rate_mbps = Some(fields.delivery_rate_mbps.unwrap_or(0.0));
            sample.rtt_us = Some(fields.rtt_us.unwrap_or(0));
            sample.min_rtt_us = Some(fields.min_rtt_us.unwrap_or(0));
            sample.cwnd_bytes = Some(fields.cwnd_bytes.unwrap_or(0));
            sample.inflight_bytes = Some(fields.inflight_bytes.unwrap_or(0));
            sample.lost_packets_cumulative = Some(fields.total_lost.unwrap_or(0));
            sample.loss_rate_pct = Some(fields.loss_rate_pct.unwrap_or(0.0));
            sample.state = fields.state.unwrap_or_default();
            sample.pacing_gain = Some(fields.pacing_gain.unwrap_or(0.0));
            sample.cwnd_gain = Some(fields.cwnd_gain.unwrap_or(0.0));
            sample.send_delay_us = Some(fields.send_delay_us.unwrap_or(0));
            sample.ack_delay_us = Some(fields.ack_delay_us.unwrap_or(0));
            Normalized::Sample(sample)
        }
        RecordKind::PacketLost => {
            let cumulative = fields.total_lost.unwrap_or(0);
            let delta = cumulative as i64 - state.last_ack_cumulative_lost as i64;
            // Out-of-order ack/lost interleaving can drive the delta to zero
            // or negative; the event is still real, so clamp to one packet.
            let incremental = if delta <= 0 { 1 } else { delta as u64 };

            sample.packet_number = fields.packet_number;
            sample.packet_size_bytes = fields.packet_size_bytes;
            sample.lost_packets_cumulative = Some(cumulative);
            sample.lost_packets_incremental = Some(incremental);
            sample.loss_rate_pct = Some(fields.loss_rate_pct.unwrap_or(0.0));
            sample.pacing_gain = fields.pacing_gain;
            sample.cwnd_gain = fields.cwnd_gain;

            let event = LossEvent {
                time_sec,
                packet_number: fields.packet_number,
                packet_size_bytes: fields.packet_size_bytes,
                lost_packets_incremental: incremental,
                lost_packets_cumulative: Some(cumulative),
                total_sent: fields.total_sent,
                loss_rate_pct: fields.loss_rate_pct,
                persistent_congestion: fields.persistent_congestion,
                pacing_gain: fields.pacing_gain,
                cwnd_gain: fields.cwnd_gain,
                raw_line: line.to_string(),
            };
            Normalized::Loss { sample, event }
        }
        RecordKind::DebugStruct => {
            sample.estimated_bw_mbps = Some(fields.estimated_bw_mbps.unwrap_or(0.0));
            sample.pacing_rate_mbps = Some(fields.pacing_rate_mbps.unwrap_or(0.0));
            sample.delivery_rate_mbps = Some(fields.delivery_rate_mbps.unwrap_or(0.0));
            sample.rtt_us = Some(fields.rtt_us.unwrap_or(0));
            sample.min_rtt_us = Some(fields.min_rtt_us.unwrap_or(0));
            sample.cwnd_bytes = Some(fields.cwnd_bytes.unwrap_or(0));
            sample.inflight_bytes = Some(fields.inflight_bytes.unwrap_or(0));
            sample.lost_packets_cumulative = Some(fields.lost.unwrap_or(0));
            sample.state = fields.state.unwrap_or_default();
            sample.pacing_gain = Some(fields.pacing_gain.unwrap_or(0.0));
            sample.cwnd_gain = Some(fields.cwnd_gain.unwrap_or(0.0));
            Normalized::Sample(sample)
        }
        RecordKind::PacketAcked | RecordKind::Unrecognized => unreachable!("handled above"),
    }
}

// ============================================================================
// SECTION 11: RUN INGESTION
// ============================================================================
// File-to-Run materialization: streams lines through classifier, extractor,
// and normalizer with a fresh per-run state, then time-orders the result.
// Batch mode runs one worker per file over the rayon pool; runs share no
// mutable state, so batch processing of N files equals N independent
// single-file runs.
// ============================================================================

/// Ingest one log file into a `Run`.
///
/// Invalid UTF-8 is replaced, not fatal. `max_lines` caps how much of the
/// file is read. Samples come out sorted by timestamp regardless of the
/// order they appear in the file.
pub fn ingest_file(path: &Path, config: &IngestConfig) -> Result<Run, IngestError> {
    if !path.exists() {
        return Err(IngestError::MissingInput {
            path: path.to_path_buf(),
        });
    }

    let read_err = |source: io::Error| IngestError::Read {
        path: path.to_path_buf(),
        source,
    };

    let file = File::open(path).map_err(read_err)?;
    let mut reader = BufReader::new(file);

    let mut diagnostics = IngestDiagnostics::default();
    let mut samples: Vec<Sample> = Vec::new();
    let mut loss_events: Vec<LossEvent> = Vec::new();
    let mut state = NormalizerState::new();

    let mut buf = Vec::with_capacity(256);
    loop {
        if let Some(cap) = config.max_lines {
            if diagnostics.total_lines >= cap {
                debug!(
                    target: "bbrscope::ingest",
                    cap,
                    path = %path.display(),
                    "line cap reached, truncating ingest"
                );
                break;
            }
        }

        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).map_err(read_err)?;
        if n == 0 {
            break;
        }
        diagnostics.total_lines += 1;

        let decoded = String::from_utf8_lossy(&buf);
        let line = decoded.trim_end_matches(|c| c == '\n' || c == '\r');

        let kind = classify_line(line);
        match kind {
            RecordKind::Log => diagnostics.log_lines += 1,
            RecordKind::PacketSent => diagnostics.sent_lines += 1,
            RecordKind::PacketAcked => diagnostics.acked_lines += 1,
            RecordKind::PacketLost => diagnostics.lost_lines += 1,
            RecordKind::DebugStruct => diagnostics.debug_lines += 1,
            RecordKind::Unrecognized => {
                diagnostics.unrecognized_lines += 1;
                continue;
            }
        }

        match normalize_line(kind, line, &mut state) {
            Normalized::Sample(sample) => samples.push(sample),
            Normalized::Loss { sample, event } => {
                samples.push(sample);
                loss_events.push(event);
            }
            Normalized::AckOnly => {}
            Normalized::Skipped => diagnostics.dropped_no_timestamp += 1,
        }
    }

    if samples.is_empty() {
        return Err(IngestError::EmptyRun {
            path: path.to_path_buf(),
        });
    }

    // Stable time ordering; ties keep file order.
    samples.sort_by(|a, b| a.time_sec.partial_cmp(&b.time_sec).unwrap_or(Ordering::Equal));
    loss_events.sort_by(|a, b| a.time_sec.partial_cmp(&b.time_sec).unwrap_or(Ordering::Equal));

    info!(
        target: "bbrscope::ingest",
        path = %path.display(),
        total_lines = diagnostics.total_lines,
        samples = samples.len(),
        loss_events = loss_events.len(),
        unrecognized = diagnostics.unrecognized_lines,
        "Run ingested"
    );

    Ok(Run {
        source: path.to_path_buf(),
        samples,
        loss_events,
        diagnostics,
    })
}

/// Ingest a batch of files, one rayon worker per file.
///
/// Per-file failures are reported in the result list; they never abort the
/// rest of the batch.
pub fn ingest_files(paths: &[PathBuf], config: &IngestConfig) -> Vec<(PathBuf, Result<Run, IngestError>)> {
    paths
        .par_iter()
        .map(|path| {
            let result = ingest_file(path, config);
            if let Err(ref e) = result {
                if e.is_recoverable() {
                    warn!(target: "bbrscope::ingest", path = %path.display(), error = %e, "run failed, batch continues");
                } else {
                    error!(target: "bbrscope::ingest", path = %path.display(), error = %e, "run failed");
                }
            }
            (path.clone(), result)
        })
        .collect()
}

/// Ingest two files concurrently, for run comparison.
pub fn ingest_pair(
    left: &Path,
    right: &Path,
    config: &IngestConfig,
) -> (Result<Run, IngestError>, Result<Run, IngestError>) {
    rayon::join(|| ingest_file(left, config), || ingest_file(right, config))
}

// ============================================================================
// SECTION 12: NORMALIZER & INGESTION TESTS
// ============================================================================

#[cfg(test)]
mod normalizer_ingest_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write as _;

    fn write_log(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn state_dump_line_normalizes_to_expected_sample() {
        let line = "[BBR-LOG] T=1.500 s, Send=100.00 Mbps, Recv=95.00 Mbps, Total=195.00 Mbps, EstBW=110.00 Mbps, RTT=25000 us, MinRTT=20000 us, CWND=131072 B, InFlight=65536 B, Lost=3, State=ProbeBW";
        let mut state = NormalizerState::new();
        let normalized = normalize_line(RecordKind::Log, line, &mut state);
        match normalized {
            Normalized::Sample(s) => {
                assert_eq!(s.time_sec, 1.5);
                assert_eq!(s.rtt_us, Some(25_000));
                assert_eq!(s.min_rtt_us, Some(20_000));
                assert_eq!(s.cwnd_bytes, Some(131_072));
                assert_eq!(s.state, BbrState::ProbeBw);
                assert_eq!(s.lost_packets_cumulative, Some(3));
                // Fields the dialect carries but the line omits come out zero.
                assert_eq!(s.pacing_rate_mbps, Some(0.0));
                // Fields this dialect never carries stay absent.
                assert_eq!(s.packet_number, None);
                assert!(s.is_valid);
            }
            other => panic!("expected sample, got {:?}", other),
        }
    }

    #[test]
    fn degraded_core_fields_mark_sample_invalid() {
        let line = "[BBR-LOG] T=1.000 s, Send=10.00 Mbps, RTT=9000 us";
        let mut state = NormalizerState::new();
        match normalize_line(RecordKind::Log, line, &mut state) {
            Normalized::Sample(s) => {
                assert!(!s.is_valid);
                assert_eq!(s.estimated_bw_mbps, Some(0.0));
            }
            other => panic!("expected sample, got {:?}", other),
        }
    }

    #[test]
    fn ack_then_loss_reconstructs_incremental_delta() {
        let mut state = NormalizerState::new();
        let ack = "[BBR-PKT-ACKED] T=2.000 s, PKT=500, TotalSent=1000, TotalLost=12";
        assert_eq!(
            normalize_line(RecordKind::PacketAcked, ack, &mut state),
            Normalized::AckOnly
        );

        let lost = "[BBR-PKT-LOST] T=2.100 s, PKT=510, Size=1350 B, TotalLost=15, Loss=1.50%";
        match normalize_line(RecordKind::PacketLost, lost, &mut state) {
            Normalized::Loss { sample, event } => {
                assert_eq!(event.lost_packets_incremental, 3);
                assert_eq!(sample.lost_packets_incremental, Some(3));
                assert_eq!(sample.lost_packets_cumulative, Some(15));
                assert_eq!(event.loss_rate_pct, Some(1.5));
                assert!(!event.persistent_congestion);
            }
            other => panic!("expected loss, got {:?}", other),
        }
    }

    #[test]
    fn non_positive_delta_clamps_to_one() {
        let mut state = NormalizerState::new();
        let ack = "[BBR-PKT-ACKED] T=1.000 s, TotalLost=20";
        normalize_line(RecordKind::PacketAcked, ack, &mut state);

        // Regressed counter (out-of-order interleaving)
        let lost = "[BBR-PKT-LOST] T=1.100 s, TotalLost=15";
        match normalize_line(RecordKind::PacketLost, lost, &mut state) {
            Normalized::Loss { event, .. } => assert_eq!(event.lost_packets_incremental, 1),
            other => panic!("expected loss, got {:?}", other),
        }

        // Unchanged counter
        let lost = "[BBR-PKT-LOST] T=1.200 s, TotalLost=20";
        match normalize_line(RecordKind::PacketLost, lost, &mut state) {
            Normalized::Loss { event, .. } => assert_eq!(event.lost_packets_incremental, 1),
            other => panic!("expected loss, got {:?}", other),
        }
    }

    #[test]
    fn loss_before_any_ack_deltas_against_zero() {
        let mut state = NormalizerState::new();
        let lost = "[BBR-PKT-LOST] T=0.100 s, TotalLost=4";
        match normalize_line(RecordKind::PacketLost, lost, &mut state) {
            Normalized::Loss { event, .. } => assert_eq!(event.lost_packets_incremental, 4),
            other => panic!("expected loss, got {:?}", other),
        }
    }

    #[test]
    fn incremental_loss_is_always_at_least_one() {
        let mut state = NormalizerState::new();
        let totals = [3u64, 3, 2, 10, 10, 50];
        for (i, total) in totals.iter().enumerate() {
            if i % 2 == 0 {
                let ack = format!("[BBR-PKT-ACKED] T={}.000 s, TotalLost={}", i, total);
                normalize_line(RecordKind::PacketAcked, &ack, &mut state);
            }
            let lost = format!("[BBR-PKT-LOST] T={}.500 s, TotalLost={}", i, total);
            match normalize_line(RecordKind::PacketLost, &lost, &mut state) {
                Normalized::Loss { event, .. } => assert!(event.lost_packets_incremental >= 1),
                other => panic!("expected loss, got {:?}", other),
            }
        }
    }

    #[test]
    fn debug_timestamps_rebase_onto_run_epoch() {
        let mut state = NormalizerState::new();
        let first = "1755000000.000 cc=\"{ state: Startup, rtt: 10.0ms }\" cwnd=32768";
        let second = "1755000000.500 cc=\"{ state: Startup, rtt: 11.0ms }\" cwnd=32768";
        match normalize_line(RecordKind::DebugStruct, first, &mut state) {
            Normalized::Sample(s) => assert_eq!(s.time_sec, 0.0),
            other => panic!("expected sample, got {:?}", other),
        }
        match normalize_line(RecordKind::DebugStruct, second, &mut state) {
            Normalized::Sample(s) => assert_eq!(s.time_sec, 0.5),
            other => panic!("expected sample, got {:?}", other),
        }
    }

    #[test]
    fn ingest_end_to_end_with_mixed_dialects() {
        let file = write_log(&[
            "random startup banner",
            "[BBR-PKT-SENT] T=0.100 s, PKT=1, Size=1350 B, EstBW=50.00 Mbps, RTT=10000 us, CWND=32768 B, State=Startup",
            "[BBR-PKT-ACKED] T=0.150 s, PKT=1, TotalSent=10, TotalLost=0",
            "[BBR-LOG] T=0.200 s, Send=40.00 Mbps, EstBW=55.00 Mbps, RTT=11000 us, MinRTT=9000 us, CWND=65536 B, State=Startup",
            "[BBR-PKT-LOST] T=0.300 s, PKT=5, Size=1350 B, TotalLost=2",
            "[BBR-LOG] Send=1.00 Mbps",
        ]);

        let run = ingest_file(file.path(), &IngestConfig::default()).unwrap();
        assert_eq!(run.diagnostics.total_lines, 6);
        assert_eq!(run.diagnostics.unrecognized_lines, 1);
        assert_eq!(run.diagnostics.sent_lines, 1);
        assert_eq!(run.diagnostics.acked_lines, 1);
        assert_eq!(run.diagnostics.log_lines, 2);
        assert_eq!(run.diagnostics.lost_lines, 1);
        assert_eq!(run.diagnostics.dropped_no_timestamp, 1);

        // Acked contributes no sample; the timestamp-less log line is dropped.
        assert_eq!(run.len(), 3);
        assert_eq!(run.loss_events.len(), 1);
        assert_eq!(run.loss_events[0].lost_packets_incremental, 2);
        assert_eq!(run.packets_lost(), 2);
    }

    #[test]
    fn diagnostics_express_counts_as_percentages() {
        let file = write_log(&[
            "[BBR-LOG] T=0.100 s, EstBW=10.00 Mbps, RTT=1000 us, CWND=1024 B, State=Startup",
            "noise",
            "more noise",
            "[BBR-PKT-SENT] T=0.200 s, PKT=1, Size=1350 B",
        ]);
        let run = ingest_file(file.path(), &IngestConfig::default()).unwrap();
        let d = &run.diagnostics;
        assert_eq!(d.pct(d.log_lines), 25.0);
        assert_eq!(d.pct(d.sent_lines), 25.0);
        assert_eq!(d.pct(d.unrecognized_lines), 50.0);
        // No lines read means no percentage, not a division by zero.
        assert_eq!(IngestDiagnostics::default().pct(5), 0.0);
    }

    #[test]
    fn samples_come_out_time_ordered() {
        let file = write_log(&[
            "[BBR-LOG] T=0.300 s, EstBW=10.00 Mbps, RTT=1000 us, CWND=1024 B, State=Drain",
            "[BBR-LOG] T=0.100 s, EstBW=10.00 Mbps, RTT=1000 us, CWND=1024 B, State=Startup",
            "[BBR-LOG] T=0.200 s, EstBW=10.00 Mbps, RTT=1000 us, CWND=1024 B, State=Startup",
        ]);
        let run = ingest_file(file.path(), &IngestConfig::default()).unwrap();
        let times: Vec<f64> = run.samples.iter().map(|s| s.time_sec).collect();
        assert_eq!(times, vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn missing_input_and_empty_run_are_distinct_errors() {
        let missing =
            ingest_file(Path::new("/nonexistent/bbr.log"), &IngestConfig::default()).unwrap_err();
        assert!(matches!(missing, IngestError::MissingInput { .. }));
        assert!(missing.is_recoverable());

        let file = write_log(&["nothing bbr-shaped here", "still nothing"]);
        let empty = ingest_file(file.path(), &IngestConfig::default()).unwrap_err();
        assert!(matches!(empty, IngestError::EmptyRun { .. }));
        assert!(empty.is_recoverable());
    }

    #[test]
    fn batch_continues_past_failed_runs() {
        let good = write_log(&[
            "[BBR-LOG] T=0.100 s, EstBW=10.00 Mbps, RTT=1000 us, CWND=1024 B, State=Startup",
        ]);
        let paths = vec![
            PathBuf::from("/nonexistent/a.log"),
            good.path().to_path_buf(),
        ];
        let results = ingest_files(&paths, &IngestConfig::default());
        assert!(matches!(results[0].1, Err(IngestError::MissingInput { .. })));
        assert!(results[1].1.is_ok());
    }

    #[test]
    fn max_lines_caps_ingest() {
        let file = write_log(&[
            "[BBR-LOG] T=0.100 s, EstBW=10.00 Mbps, RTT=1000 us, CWND=1024 B, State=Startup",
            "[BBR-LOG] T=0.200 s, EstBW=10.00 Mbps, RTT=1000 us, CWND=1024 B, State=Startup",
            "[BBR-LOG] T=0.300 s, EstBW=10.00 Mbps, RTT=1000 us, CWND=1024 B, State=Startup",
        ]);
        let config = IngestConfig {
            max_lines: Some(2),
        };
        let run = ingest_file(file.path(), &config).unwrap();
        assert_eq!(run.diagnostics.total_lines, 2);
        assert_eq!(run.len(), 2);
    }

    #[test]
    fn batch_runs_do_not_share_loss_state() {
        // Each file sets its own ack baseline; deltas must not leak across.
        let a = write_log(&[
            "[BBR-PKT-ACKED] T=0.100 s, TotalLost=10",
            "[BBR-PKT-LOST] T=0.200 s, TotalLost=12",
        ]);
        let b = write_log(&[
            "[BBR-PKT-LOST] T=0.200 s, TotalLost=5",
        ]);
        let paths = vec![a.path().to_path_buf(), b.path().to_path_buf()];
        let results = ingest_files(&paths, &IngestConfig::default());
        assert_eq!(results.len(), 2);

        let run_a = results[0].1.as_ref().unwrap();
        let run_b = results[1].1.as_ref().unwrap();
        assert_eq!(run_a.loss_events[0].lost_packets_incremental, 2);
        // No ack ever seen in run b, so the delta is against zero.
        assert_eq!(run_b.loss_events[0].lost_packets_incremental, 5);
    }
}

// ============================================================================
// SECTION 13: WINDOWED AGGREGATOR
// ============================================================================
// Fixed-width time-bucket reduction. Buckets are half-open intervals
// [t0 + k*w, t0 + (k+1)*w) anchored at the earliest sample; every sample
// lands in exactly one bucket and empty buckets produce no output row.
// Per-field reducer policy:
//   - per-connection rates, CWND, in-flight: profile-dependent (sum for
//     merged multi-connection windows, mean for a single stream)
//   - estimated bandwidth: mean in both profiles (path property, not
//     additive across connections)
//   - RTT, loss rate, gains, delays, packet size: mean
//   - min RTT: min   - loss counters, packet number: max
//   - state: mode, first-encountered value on ties
// Reductions skip absent values; a field absent from every contributor is
// absent from the bucket.
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reduce {
    Sum,
    Mean,
    Min,
    Max,
}

impl Reduce {
    fn apply_f64(&self, values: &[f64]) -> f64 {
        match self {
            Reduce::Sum => values.iter().sum(),
            Reduce::Mean => values.iter().sum::<f64>() / values.len() as f64,
            Reduce::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Reduce::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        }
    }
}

fn reduce_f64(
    group: &[&Sample],
    get: impl Fn(&Sample) -> Option<f64>,
    op: Reduce,
) -> Option<f64> {
    let values: SmallVec<[f64; 16]> = group.iter().filter_map(|s| get(s)).collect();
    if values.is_empty() {
        None
    } else {
        Some(op.apply_f64(&values))
    }
}

fn reduce_u64(
    group: &[&Sample],
    get: impl Fn(&Sample) -> Option<u64>,
    op: Reduce,
) -> Option<u64> {
    let values: SmallVec<[u64; 16]> = group.iter().filter_map(|s| get(s)).collect();
    if values.is_empty() {
        return None;
    }
    Some(match op {
        Reduce::Sum => values.iter().sum(),
        Reduce::Mean => {
            (values.iter().sum::<u64>() as f64 / values.len() as f64).round() as u64
        }
        Reduce::Min => *values.iter().min().unwrap_or(&0),
        Reduce::Max => *values.iter().max().unwrap_or(&0),
    })
}

fn mode_state(group: &[&Sample]) -> BbrState {
    let mut counts: SmallVec<[(BbrState, usize); 8]> = SmallVec::new();
    for s in group {
        match counts.iter_mut().find(|(state, _)| *state == s.state) {
            Some((_, count)) => *count += 1,
            None => counts.push((s.state.clone(), 1)),
        }
    }
    // Strictly-greater keeps the first-encountered state on ties.
    let mut best = 0;
    for (i, (_, count)) in counts.iter().enumerate() {
        if *count > counts[best].1 {
            best = i;
        }
    }
    counts[best].0.clone()
}

/// Reduce a time-ordered sample sequence into fixed-width buckets.
///
/// An empty input yields an empty output; a non-positive or non-finite
/// window width is rejected.
pub fn aggregate_samples(
    samples: &[Sample],
    config: &AggregationConfig,
) -> Result<Vec<AggregatedSample>, ProcessingError> {
    let w = config.window_secs;
    if !w.is_finite() || w <= 0.0 {
        return Err(ProcessingError::InvalidWindow(w));
    }
    if samples.is_empty() {
        return Ok(Vec::new());
    }

    let t0 = samples
        .iter()
        .map(|s| s.time_sec)
        .fold(f64::INFINITY, f64::min);

    // BTreeMap keeps buckets time-ordered; within a bucket, input order is
    // preserved so the mode tie-break and first-sample convention hold.
    let mut buckets: BTreeMap<u64, Vec<&Sample>> = BTreeMap::new();
    for s in samples {
        let k = ((s.time_sec - t0).max(0.0) / w).floor() as u64;
        buckets.entry(k).or_default().push(s);
    }

    let rate_op = match config.profile {
        AggregationProfile::MultiConnection => Reduce::Sum,
        AggregationProfile::SingleRun => Reduce::Mean,
    };

    let mut out = Vec::with_capacity(buckets.len());
    for (k, group) in &buckets {
        let time_sec = match config.timestamp_convention {
            TimestampConvention::BucketMidpoint => t0 + *k as f64 * w + w / 2.0,
            TimestampConvention::FirstSample => group[0].time_sec,
        };

        let sample = Sample {
            time_sec,
            packet_number: reduce_u64(group, |s| s.packet_number, Reduce::Max),
            packet_size_bytes: reduce_u64(group, |s| s.packet_size_bytes, Reduce::Mean),
            send_rate_mbps: reduce_f64(group, |s| s.send_rate_mbps, rate_op),
            recv_rate_mbps: reduce_f64(group, |s| s.recv_rate_mbps, rate_op),
            total_rate_mbps: reduce_f64(group, |s| s.total_rate_mbps, rate_op),
            estimated_bw_mbps: reduce_f64(group, |s| s.estimated_bw_mbps, Reduce::Mean),
            pacing_rate_mbps: reduce_f64(group, |s| s.pacing_rate_mbps, rate_op),
            delivery_rate_mbps: reduce_f64(group, |s| s.delivery_rate_mbps, rate_op),
            rtt_us: reduce_u64(group, |s| s.rtt_us, Reduce::Mean),
            min_rtt_us: reduce_u64(group, |s| s.min_rtt_us, Reduce::Min),
            cwnd_bytes: reduce_u64(group, |s| s.cwnd_bytes, rate_op),
            inflight_bytes: reduce_u64(group, |s| s.inflight_bytes, rate_op),
            lost_packets_cumulative: reduce_u64(group, |s| s.lost_packets_cumulative, Reduce::Max),
            lost_packets_incremental: reduce_u64(group, |s| s.lost_packets_incremental, Reduce::Max),
            loss_rate_pct: reduce_f64(group, |s| s.loss_rate_pct, Reduce::Mean),
            state: mode_state(group),
            pacing_gain: reduce_f64(group, |s| s.pacing_gain, Reduce::Mean),
            cwnd_gain: reduce_f64(group, |s| s.cwnd_gain, Reduce::Mean),
            send_delay_us: reduce_u64(group, |s| s.send_delay_us, Reduce::Mean),
            ack_delay_us: reduce_u64(group, |s| s.ack_delay_us, Reduce::Mean),
            is_valid: group.iter().all(|s| s.is_valid),
            raw_line: String::new(),
        };

        out.push(AggregatedSample {
            sample,
            sample_count: group.len(),
        });
    }

    debug!(
        target: "bbrscope::aggregate",
        input = samples.len(),
        buckets = out.len(),
        window_secs = w,
        profile = ?config.profile,
        "Aggregation complete"
    );

    Ok(out)
}

// ============================================================================
// SECTION 14: ANOMALY FILTER
// ============================================================================
// Plausibility scrub over individual fields. A value outside its bound is
// nulled to absent; the row itself always survives, so the time axis keeps
// its shape for plotting and window alignment. The pass is idempotent by
// construction: an already-nulled field has no value left to test.
// ============================================================================

/// Field-level anomaly filter.
#[derive(Debug, Clone)]
pub struct AnomalyFilter {
    rtt_max_us: u64,
    rate_max_mbps: f64,
}

impl AnomalyFilter {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            rtt_max_us: (config.rtt_max_ms * US_PER_MS) as u64,
            rate_max_mbps: config.rate_max_mbps,
        }
    }

    /// Scrub every sample in place. Returns the number of fields nulled.
    pub fn apply(&self, samples: &mut [Sample]) -> usize {
        let mut nulled = 0;
        for s in samples.iter_mut() {
            nulled += self.scrub(s);
        }
        if nulled > 0 {
            debug!(
                target: "bbrscope::filter",
                rows = samples.len(),
                nulled,
                "anomalous fields suppressed"
            );
        }
        nulled
    }

    /// Scrub aggregated buckets in place.
    pub fn apply_aggregated(&self, buckets: &mut [AggregatedSample]) -> usize {
        let mut nulled = 0;
        for b in buckets.iter_mut() {
            nulled += self.scrub(&mut b.sample);
        }
        nulled
    }

    fn scrub(&self, s: &mut Sample) -> usize {
        let mut nulled = 0;

        // An RTT of zero is an uninitialized reading, not a measurement.
        for rtt in [&mut s.rtt_us, &mut s.min_rtt_us] {
            if let Some(v) = *rtt {
                if v == 0 || v > self.rtt_max_us {
                    *rtt = None;
                    nulled += 1;
                }
            }
        }

        // Only the controller's bandwidth estimates are bounded. Measured
        // send/recv/total rates stay untouched: window-summed totals of a
        // merged multi-connection capture can legitimately exceed the
        // single-path bound.
        for rate in [
            &mut s.estimated_bw_mbps,
            &mut s.pacing_rate_mbps,
            &mut s.delivery_rate_mbps,
        ] {
            if let Some(v) = *rate {
                if v > self.rate_max_mbps {
                    *rate = None;
                    nulled += 1;
                }
            }
        }

        nulled
    }
}

// ============================================================================
// SECTION 15: AGGREGATOR & FILTER TESTS
// ============================================================================

#[cfg(test)]
mod aggregator_filter_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn sample(time_sec: f64) -> Sample {
        Sample::at(time_sec)
    }

    fn rate_sample(time_sec: f64, send: f64) -> Sample {
        let mut s = Sample::at(time_sec);
        s.send_rate_mbps = Some(send);
        s
    }

    #[test]
    fn half_open_buckets_anchor_at_first_sample() {
        let samples = vec![sample(0.01), sample(0.05), sample(0.12)];
        let config = AggregationConfig::default();
        let buckets = aggregate_samples(&samples, &config).unwrap();

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].sample_count, 2);
        assert_eq!(buckets[1].sample_count, 1);
        // Midpoint convention: t0 + k*w + w/2 with t0 = 0.01, w = 0.1
        assert!(approx(buckets[0].sample.time_sec, 0.06));
        assert!(approx(buckets[1].sample.time_sec, 0.16));
    }

    #[test]
    fn every_sample_lands_in_exactly_one_bucket() {
        let samples: Vec<Sample> = (0..57).map(|i| sample(i as f64 * 0.023)).collect();
        let buckets = aggregate_samples(&samples, &AggregationConfig::default()).unwrap();
        let covered: usize = buckets.iter().map(|b| b.sample_count).sum();
        assert_eq!(covered, samples.len());
    }

    #[test]
    fn first_sample_convention_uses_first_contributor_time() {
        let samples = vec![sample(0.01), sample(0.05), sample(0.12)];
        let config = AggregationConfig {
            timestamp_convention: TimestampConvention::FirstSample,
            ..AggregationConfig::default()
        };
        let buckets = aggregate_samples(&samples, &config).unwrap();
        assert!(approx(buckets[0].sample.time_sec, 0.01));
        assert!(approx(buckets[1].sample.time_sec, 0.12));
    }

    #[test]
    fn rates_sum_in_multi_connection_profile() {
        let samples = vec![rate_sample(0.00, 10.0), rate_sample(0.02, 30.0)];
        let config = AggregationConfig {
            profile: AggregationProfile::MultiConnection,
            ..AggregationConfig::default()
        };
        let buckets = aggregate_samples(&samples, &config).unwrap();
        assert_eq!(buckets[0].sample.send_rate_mbps, Some(40.0));
    }

    #[test]
    fn rates_average_in_single_run_profile() {
        let samples = vec![rate_sample(0.00, 10.0), rate_sample(0.02, 30.0)];
        let buckets = aggregate_samples(&samples, &AggregationConfig::default()).unwrap();
        assert_eq!(buckets[0].sample.send_rate_mbps, Some(20.0));
    }

    #[test]
    fn bandwidth_estimate_averages_in_both_profiles() {
        let mut a = sample(0.00);
        a.estimated_bw_mbps = Some(100.0);
        let mut b = sample(0.02);
        b.estimated_bw_mbps = Some(200.0);
        let samples = vec![a, b];

        for profile in [AggregationProfile::SingleRun, AggregationProfile::MultiConnection] {
            let config = AggregationConfig {
                profile,
                ..AggregationConfig::default()
            };
            let buckets = aggregate_samples(&samples, &config).unwrap();
            assert_eq!(buckets[0].sample.estimated_bw_mbps, Some(150.0));
        }
    }

    #[test]
    fn min_rtt_takes_min_and_loss_counters_take_max() {
        let mut a = sample(0.00);
        a.min_rtt_us = Some(9_000);
        a.lost_packets_cumulative = Some(5);
        let mut b = sample(0.02);
        b.min_rtt_us = Some(8_000);
        b.lost_packets_cumulative = Some(7);
        let buckets = aggregate_samples(&[a, b], &AggregationConfig::default()).unwrap();
        assert_eq!(buckets[0].sample.min_rtt_us, Some(8_000));
        assert_eq!(buckets[0].sample.lost_packets_cumulative, Some(7));
    }

    #[test]
    fn state_mode_breaks_ties_toward_first_encountered() {
        let mut a = sample(0.00);
        a.state = BbrState::Startup;
        let mut b = sample(0.01);
        b.state = BbrState::ProbeBw;
        let mut c = sample(0.02);
        c.state = BbrState::ProbeBw;
        let mut d = sample(0.03);
        d.state = BbrState::Startup;

        // 2-2 tie; Startup was seen first.
        let buckets = aggregate_samples(&[a, b, c, d], &AggregationConfig::default()).unwrap();
        assert_eq!(buckets[0].sample.state, BbrState::Startup);
    }

    #[test]
    fn field_absent_from_all_contributors_stays_absent() {
        let samples = vec![sample(0.00), sample(0.02)];
        let buckets = aggregate_samples(&samples, &AggregationConfig::default()).unwrap();
        assert_eq!(buckets[0].sample.rtt_us, None);
        assert_eq!(buckets[0].sample.send_rate_mbps, None);
    }

    #[test]
    fn invalid_window_is_rejected() {
        let samples = vec![sample(0.0)];
        for w in [0.0, -0.5, f64::NAN] {
            let config = AggregationConfig {
                window_secs: w,
                ..AggregationConfig::default()
            };
            assert!(matches!(
                aggregate_samples(&samples, &config),
                Err(ProcessingError::InvalidWindow(_))
            ));
        }
    }

    #[test]
    fn empty_input_aggregates_to_empty_output() {
        let buckets = aggregate_samples(&[], &AggregationConfig::default()).unwrap();
        assert!(buckets.is_empty());
    }

    #[test]
    fn filter_nulls_out_of_bound_fields_but_keeps_rows() {
        let filter = AnomalyFilter::new(&FilterConfig::default());

        let mut zero_rtt = sample(0.0);
        zero_rtt.rtt_us = Some(0);
        let mut huge_rtt = sample(0.1);
        huge_rtt.rtt_us = Some(1_500_000); // 1500 ms
        let mut plausible = sample(0.2);
        plausible.rtt_us = Some(40_000); // 40 ms
        let mut hot_rate = sample(0.3);
        hot_rate.pacing_rate_mbps = Some(2_500.0);

        let mut samples = vec![zero_rtt, huge_rtt, plausible, hot_rate];
        let nulled = filter.apply(&mut samples);

        assert_eq!(nulled, 3);
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0].rtt_us, None);
        assert_eq!(samples[1].rtt_us, None);
        assert_eq!(samples[2].rtt_us, Some(40_000));
        assert_eq!(samples[3].pacing_rate_mbps, None);
    }

    #[test]
    fn measured_rates_are_not_bounded() {
        // A window-summed multi-connection total above the single-path
        // bound is real throughput; only bandwidth estimates are scrubbed.
        let filter = AnomalyFilter::new(&FilterConfig::default());
        let mut s = sample(0.0);
        s.send_rate_mbps = Some(2_500.0);
        s.recv_rate_mbps = Some(2_400.0);
        s.total_rate_mbps = Some(4_900.0);
        s.estimated_bw_mbps = Some(2_500.0);

        let mut samples = vec![s];
        let nulled = filter.apply(&mut samples);

        assert_eq!(nulled, 1);
        assert_eq!(samples[0].send_rate_mbps, Some(2_500.0));
        assert_eq!(samples[0].recv_rate_mbps, Some(2_400.0));
        assert_eq!(samples[0].total_rate_mbps, Some(4_900.0));
        assert_eq!(samples[0].estimated_bw_mbps, None);
    }

    #[test]
    fn filter_is_idempotent() {
        let filter = AnomalyFilter::new(&FilterConfig::default());
        let mut s = sample(0.0);
        s.rtt_us = Some(0);
        s.min_rtt_us = Some(2_000_000);
        s.delivery_rate_mbps = Some(9_999.0);
        s.estimated_bw_mbps = Some(150.0);

        let mut samples = vec![s];
        filter.apply(&mut samples);
        let after_first = samples.clone();
        let nulled_again = filter.apply(&mut samples);

        assert_eq!(nulled_again, 0);
        assert_eq!(samples, after_first);
        assert_eq!(samples[0].estimated_bw_mbps, Some(150.0));
    }

    #[test]
    fn filter_applies_to_aggregated_buckets() {
        let mut s = sample(0.0);
        s.rtt_us = Some(3_000_000);
        let mut buckets = aggregate_samples(&[s], &AggregationConfig::default()).unwrap();
        let filter = AnomalyFilter::new(&FilterConfig::default());
        let nulled = filter.apply_aggregated(&mut buckets);
        assert_eq!(nulled, 1);
        assert_eq!(buckets[0].sample.rtt_us, None);
    }
}

// ============================================================================
// SECTION 16: STATISTICS ENGINE
// ============================================================================
// Descriptive summary statistics over a sample sequence. Reductions skip
// absent values, so running the anomaly filter first changes the population
// these are computed over; that is the intended interaction. Statistics on
// an empty sequence are an explicit error, never a NaN-filled report.
// ============================================================================

// ----------------------------------------------------------------------------
// 16.1 Reduction Helpers
// ----------------------------------------------------------------------------

fn collect_present(samples: &[Sample], get: impl Fn(&Sample) -> Option<f64>) -> Vec<f64> {
    samples.iter().filter_map(get).collect()
}

fn mean_of(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(statistical::mean(values))
    }
}

fn max_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().fold(None, |acc, v| match acc {
        Some(m) => Some(f64::max(m, v)),
        None => Some(v),
    })
}

fn min_of(values: &[f64]) -> Option<f64> {
    values.iter().copied().fold(None, |acc, v| match acc {
        Some(m) => Some(f64::min(m, v)),
        None => Some(v),
    })
}

/// Nearest-rank percentile over an unordered slice; `p` in [0, 1].
/// Returns 0.0 on an empty slice.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by_key(|v| OrderedFloat(*v));
    let idx = (p * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

// ----------------------------------------------------------------------------
// 16.2 Summary Types
// ----------------------------------------------------------------------------

/// Distribution summary of smoothed RTT, in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RttDistribution {
    pub mean_ms: f64,
    pub median_ms: f64,
    pub std_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

impl RttDistribution {
    fn from_values(values_ms: &[f64]) -> Option<Self> {
        if values_ms.is_empty() {
            return None;
        }
        let mean = statistical::mean(values_ms);
        let std = if values_ms.len() >= 2 {
            statistical::standard_deviation(values_ms, Some(mean))
        } else {
            0.0
        };
        Some(Self {
            mean_ms: mean,
            median_ms: statistical::median(values_ms),
            std_ms: std,
            p95_ms: percentile(values_ms, 0.95),
            p99_ms: percentile(values_ms, 0.99),
            min_ms: min_of(values_ms).unwrap_or(0.0),
            max_ms: max_of(values_ms).unwrap_or(0.0),
        })
    }
}

/// Occupancy of one state label across a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateOccupancy {
    pub state: String,
    pub count: usize,
    pub pct: f64,
}

/// Descriptive summary of one run (raw or aggregated samples alike).
///
/// Rates in Mbps, RTT in ms, window sizes in KB; these are presentation
/// units, converted at the boundary from the canonical us/bytes fields.
#[derive(Debug, Clone, Serialize)]
pub struct RunStatistics {
    /// Last timestamp minus first timestamp
    pub duration_sec: f64,
    pub sample_count: usize,
    pub avg_total_rate_mbps: Option<f64>,
    pub max_total_rate_mbps: Option<f64>,
    pub avg_send_rate_mbps: Option<f64>,
    pub avg_recv_rate_mbps: Option<f64>,
    pub avg_estimated_bw_mbps: Option<f64>,
    pub avg_rtt_ms: Option<f64>,
    pub min_rtt_ms: Option<f64>,
    pub avg_min_rtt_ms: Option<f64>,
    pub avg_cwnd_kb: Option<f64>,
    pub max_cwnd_kb: Option<f64>,
    pub avg_inflight_kb: Option<f64>,
    pub max_inflight_kb: Option<f64>,
    /// Sum of per-sample lost counts. Whether that sum is meaningful as a
    /// packet total depends on the source reporting incremental counters;
    /// cumulative sources make it an upper envelope only.
    pub total_lost_packets: u64,
    /// Samples whose lost count is nonzero
    pub loss_sample_count: usize,
    /// Occupancy per state label, largest first
    pub state_occupancy: Vec<StateOccupancy>,
    pub rtt: Option<RttDistribution>,
}

impl RunStatistics {
    /// Compute the summary for a sample sequence.
    pub fn compute(samples: &[Sample]) -> Result<Self, ProcessingError> {
        if samples.is_empty() {
            return Err(ProcessingError::EmptyInput);
        }

        let t_min = samples.iter().map(|s| s.time_sec).fold(f64::INFINITY, f64::min);
        let t_max = samples
            .iter()
            .map(|s| s.time_sec)
            .fold(f64::NEG_INFINITY, f64::max);

        let total_rates = collect_present(samples, |s| s.total_rate_mbps);
        let send_rates = collect_present(samples, |s| s.send_rate_mbps);
        let recv_rates = collect_present(samples, |s| s.recv_rate_mbps);
        let est_bw = collect_present(samples, |s| s.estimated_bw_mbps);
        let rtt_ms = collect_present(samples, |s| s.rtt_ms());
        let min_rtt_ms = collect_present(samples, |s| s.min_rtt_ms());
        let cwnd_kb = collect_present(samples, |s| s.cwnd_kb());
        let inflight_kb = collect_present(samples, |s| s.inflight_kb());

        let mut state_counts: AHashMap<String, usize> = AHashMap::new();
        for s in samples {
            *state_counts.entry(s.state.as_str().to_string()).or_insert(0) += 1;
        }
        let mut state_occupancy: Vec<StateOccupancy> = state_counts
            .into_iter()
            .map(|(state, count)| StateOccupancy {
                state,
                count,
                pct: count as f64 / samples.len() as f64 * 100.0,
            })
            .collect();
        state_occupancy.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.state.cmp(&b.state)));

        Ok(Self {
            duration_sec: t_max - t_min,
            sample_count: samples.len(),
            avg_total_rate_mbps: mean_of(&total_rates),
            max_total_rate_mbps: max_of(&total_rates),
            avg_send_rate_mbps: mean_of(&send_rates),
            avg_recv_rate_mbps: mean_of(&recv_rates),
            avg_estimated_bw_mbps: mean_of(&est_bw),
            avg_rtt_ms: mean_of(&rtt_ms),
            min_rtt_ms: min_of(&min_rtt_ms).or_else(|| min_of(&rtt_ms)),
            avg_min_rtt_ms: mean_of(&min_rtt_ms),
            avg_cwnd_kb: mean_of(&cwnd_kb),
            max_cwnd_kb: max_of(&cwnd_kb),
            avg_inflight_kb: mean_of(&inflight_kb),
            max_inflight_kb: max_of(&inflight_kb),
            total_lost_packets: samples
                .iter()
                .filter_map(|s| s.lost_packets_cumulative)
                .sum(),
            loss_sample_count: samples
                .iter()
                .filter(|s| s.lost_packets_cumulative.unwrap_or(0) > 0)
                .count(),
            state_occupancy,
            rtt: RttDistribution::from_values(&rtt_ms),
        })
    }

    /// Compute the summary over aggregated buckets.
    pub fn compute_aggregated(buckets: &[AggregatedSample]) -> Result<Self, ProcessingError> {
        if buckets.is_empty() {
            return Err(ProcessingError::EmptyInput);
        }
        let samples: Vec<Sample> = buckets.iter().map(|b| b.sample.clone()).collect();
        Self::compute(&samples)
    }
}

// ----------------------------------------------------------------------------
// 16.3 Run Comparison
// ----------------------------------------------------------------------------

/// Head-to-head comparison of two run summaries.
#[derive(Debug, Clone, Serialize)]
pub struct RunComparison {
    pub baseline: RunStatistics,
    pub candidate: RunStatistics,
    /// Candidate vs baseline average total rate, percent
    pub avg_total_rate_delta_pct: Option<f64>,
    /// Candidate vs baseline peak total rate, percent
    pub max_total_rate_delta_pct: Option<f64>,
    /// Candidate vs baseline average RTT, percent
    pub avg_rtt_delta_pct: Option<f64>,
    /// Candidate minus baseline lost-packet totals
    pub lost_packets_delta: i64,
}

fn delta_pct(baseline: Option<f64>, candidate: Option<f64>) -> Option<f64> {
    match (baseline, candidate) {
        (Some(b), Some(c)) if b != 0.0 => Some((c - b) / b * 100.0),
        _ => None,
    }
}

impl RunComparison {
    pub fn between(baseline: RunStatistics, candidate: RunStatistics) -> Self {
        let avg_total_rate_delta_pct =
            delta_pct(baseline.avg_total_rate_mbps, candidate.avg_total_rate_mbps);
        let max_total_rate_delta_pct =
            delta_pct(baseline.max_total_rate_mbps, candidate.max_total_rate_mbps);
        let avg_rtt_delta_pct = delta_pct(baseline.avg_rtt_ms, candidate.avg_rtt_ms);
        let lost_packets_delta =
            candidate.total_lost_packets as i64 - baseline.total_lost_packets as i64;
        Self {
            baseline,
            candidate,
            avg_total_rate_delta_pct,
            max_total_rate_delta_pct,
            avg_rtt_delta_pct,
            lost_packets_delta,
        }
    }
}

// ----------------------------------------------------------------------------
// 16.4 CWND Utilization
// ----------------------------------------------------------------------------

/// How much of the congestion window the sender actually kept in flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CwndUtilization {
    /// Samples carrying both CWND and in-flight
    pub measured_samples: usize,
    /// Samples where in-flight exceeded CWND
    pub over_cwnd_samples: usize,
    pub over_cwnd_pct: f64,
    pub avg_utilization_pct: f64,
    pub max_utilization_pct: f64,
    pub peak_cwnd_bytes: u64,
    pub peak_inflight_bytes: u64,
}

/// Compute CWND utilization, or None when no sample carries both fields.
pub fn cwnd_utilization(samples: &[Sample]) -> Option<CwndUtilization> {
    let mut utilizations: Vec<f64> = Vec::new();
    let mut over = 0usize;
    let mut peak_cwnd = 0u64;
    let mut peak_inflight = 0u64;

    for s in samples {
        let (cwnd, inflight) = match (s.cwnd_bytes, s.inflight_bytes) {
            (Some(c), Some(i)) if c > 0 => (c, i),
            _ => continue,
        };
        utilizations.push(inflight as f64 / cwnd as f64 * 100.0);
        if inflight > cwnd {
            over += 1;
        }
        peak_cwnd = peak_cwnd.max(cwnd);
        peak_inflight = peak_inflight.max(inflight);
    }

    if utilizations.is_empty() {
        return None;
    }

    Some(CwndUtilization {
        measured_samples: utilizations.len(),
        over_cwnd_samples: over,
        over_cwnd_pct: over as f64 / utilizations.len() as f64 * 100.0,
        avg_utilization_pct: statistical::mean(&utilizations),
        max_utilization_pct: max_of(&utilizations).unwrap_or(0.0),
        peak_cwnd_bytes: peak_cwnd,
        peak_inflight_bytes: peak_inflight,
    })
}

// ============================================================================
// SECTION 17: AUDIT DUMP & COLUMNAR EXPORT
// ============================================================================
// Two export surfaces:
//   - the sampling-points audit dump, a fixed-layout text file downstream
//     tooling parses by header and column position
//   - a columnar view of a sample sequence for plotting front-ends
// ============================================================================

// ----------------------------------------------------------------------------
// 17.1 Sampling-Points Audit Dump
// ----------------------------------------------------------------------------

#[inline]
fn nan_or(v: Option<f64>) -> f64 {
    v.unwrap_or(f64::NAN)
}

/// Write the sampling-points audit dump.
///
/// Layout contract: three header lines, a blank line, the column header,
/// one CSV row per sample, a blank line, then every retained raw line.
/// Absent numeric fields print as NaN; absent counters print as 0.
pub fn write_sampling_points<W: Write>(w: &mut W, samples: &[Sample]) -> io::Result<()> {
    writeln!(w, "=== BBR Sampling Points Detailed Data ===")?;
    writeln!(w, "Total sampling points: {}", samples.len())?;
    writeln!(w, "Data sampling method: All SENT events")?;
    writeln!(w)?;
    writeln!(w, "{}", SAMPLING_POINTS_COLUMNS)?;

    for (i, s) in samples.iter().enumerate() {
        writeln!(
            w,
            "{},{:.3},{},{:.0},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{:.2},{},{:.2},{},{:.2},{:.2},{:.2},{:.2}",
            i + 1,
            s.time_sec,
            s.packet_number.unwrap_or(0),
            nan_or(s.packet_size_bytes.map(|v| v as f64)),
            nan_or(s.estimated_bw_mbps),
            nan_or(s.pacing_rate_mbps),
            nan_or(s.delivery_rate_mbps),
            nan_or(s.rtt_ms()),
            nan_or(s.min_rtt_ms()),
            nan_or(s.cwnd_kb()),
            nan_or(s.inflight_kb()),
            s.lost_packets_cumulative.unwrap_or(0),
            nan_or(s.loss_rate_pct),
            s.state,
            nan_or(s.send_delay_us.map(|v| v as f64 / US_PER_MS)),
            nan_or(s.ack_delay_us.map(|v| v as f64 / US_PER_MS)),
            nan_or(s.pacing_gain),
            nan_or(s.cwnd_gain),
        )?;
    }

    writeln!(w)?;
    writeln!(w, "=== Raw Log Lines ===")?;
    for (i, s) in samples.iter().enumerate() {
        writeln!(w, "{}: {}", i + 1, s.raw_line)?;
    }

    Ok(())
}

/// Audit-dump path derived from the input log path: `<stem>_sampling_points.txt`
/// next to the input.
pub fn sampling_points_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bbr".to_string());
    input.with_file_name(format!("{}_sampling_points.txt", stem))
}

/// Write the audit dump to a file.
pub fn dump_sampling_points(samples: &[Sample], out_path: &Path) -> io::Result<()> {
    let file = File::create(out_path)?;
    let mut writer = BufWriter::new(file);
    write_sampling_points(&mut writer, samples)?;
    writer.flush()?;
    info!(
        target: "bbrscope::export",
        path = %out_path.display(),
        rows = samples.len(),
        "sampling-points dump written"
    );
    Ok(())
}

// ----------------------------------------------------------------------------
// 17.2 Columnar Export
// ----------------------------------------------------------------------------

/// Column-major view of a sample sequence. Every column has the same
/// length; `sample_count` is present only for aggregated input.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SampleColumns {
    pub time_sec: Vec<f64>,
    pub send_rate_mbps: Vec<Option<f64>>,
    pub recv_rate_mbps: Vec<Option<f64>>,
    pub total_rate_mbps: Vec<Option<f64>>,
    pub estimated_bw_mbps: Vec<Option<f64>>,
    pub pacing_rate_mbps: Vec<Option<f64>>,
    pub delivery_rate_mbps: Vec<Option<f64>>,
    pub rtt_ms: Vec<Option<f64>>,
    pub min_rtt_ms: Vec<Option<f64>>,
    pub cwnd_kb: Vec<Option<f64>>,
    pub inflight_kb: Vec<Option<f64>>,
    pub lost_packets: Vec<Option<u64>>,
    pub loss_rate_pct: Vec<Option<f64>>,
    pub state: Vec<String>,
    pub pacing_gain: Vec<Option<f64>>,
    pub cwnd_gain: Vec<Option<f64>>,
    pub is_valid: Vec<bool>,
    pub sample_count: Option<Vec<usize>>,
}

impl SampleColumns {
    pub fn from_samples(samples: &[Sample]) -> Self {
        let mut cols = Self::default();
        for s in samples {
            cols.push(s);
        }
        cols
    }

    pub fn from_aggregated(buckets: &[AggregatedSample]) -> Self {
        let mut cols = Self::default();
        let mut counts = Vec::with_capacity(buckets.len());
        for b in buckets {
            cols.push(&b.sample);
            counts.push(b.sample_count);
        }
        cols.sample_count = Some(counts);
        cols
    }

    fn push(&mut self, s: &Sample) {
        self.time_sec.push(s.time_sec);
        self.send_rate_mbps.push(s.send_rate_mbps);
        self.recv_rate_mbps.push(s.recv_rate_mbps);
        self.total_rate_mbps.push(s.total_rate_mbps);
        self.estimated_bw_mbps.push(s.estimated_bw_mbps);
        self.pacing_rate_mbps.push(s.pacing_rate_mbps);
        self.delivery_rate_mbps.push(s.delivery_rate_mbps);
        self.rtt_ms.push(s.rtt_ms());
        self.min_rtt_ms.push(s.min_rtt_ms());
        self.cwnd_kb.push(s.cwnd_kb());
        self.inflight_kb.push(s.inflight_kb());
        self.lost_packets.push(s.lost_packets_cumulative);
        self.loss_rate_pct.push(s.loss_rate_pct);
        self.state.push(s.state.as_str().to_string());
        self.pacing_gain.push(s.pacing_gain);
        self.cwnd_gain.push(s.cwnd_gain);
        self.is_valid.push(s.is_valid);
    }

    pub fn len(&self) -> usize {
        self.time_sec.len()
    }

    pub fn is_empty(&self) -> bool {
        self.time_sec.is_empty()
    }
}

// ============================================================================
// SECTION 18: STATISTICS & EXPORT TESTS
// ============================================================================

#[cfg(test)]
mod statistics_export_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_with(time_sec: f64, total: f64, rtt_us: u64, state: BbrState) -> Sample {
        let mut s = Sample::at(time_sec);
        s.total_rate_mbps = Some(total);
        s.rtt_us = Some(rtt_us);
        s.state = state;
        s
    }

    #[test]
    fn empty_input_is_an_explicit_error() {
        assert!(matches!(
            RunStatistics::compute(&[]),
            Err(ProcessingError::EmptyInput)
        ));
        assert!(matches!(
            RunStatistics::compute_aggregated(&[]),
            Err(ProcessingError::EmptyInput)
        ));
    }

    #[test]
    fn computes_duration_and_rate_summary() {
        let samples = vec![
            sample_with(1.0, 100.0, 20_000, BbrState::Startup),
            sample_with(2.0, 200.0, 30_000, BbrState::ProbeBw),
        ];
        let stats = RunStatistics::compute(&samples).unwrap();
        assert_eq!(stats.duration_sec, 1.0);
        assert_eq!(stats.sample_count, 2);
        assert_eq!(stats.avg_total_rate_mbps, Some(150.0));
        assert_eq!(stats.max_total_rate_mbps, Some(200.0));
        assert_eq!(stats.avg_rtt_ms, Some(25.0));
    }

    #[test]
    fn absent_fields_are_skipped_not_zeroed() {
        let mut a = Sample::at(0.0);
        a.total_rate_mbps = Some(100.0);
        let b = Sample::at(1.0); // no rate at all
        let stats = RunStatistics::compute(&[a, b]).unwrap();
        assert_eq!(stats.avg_total_rate_mbps, Some(100.0));
        assert_eq!(stats.avg_cwnd_kb, None);
        assert_eq!(stats.avg_min_rtt_ms, None);
    }

    #[test]
    fn state_occupancy_percentages_cover_the_run() {
        let samples = vec![
            sample_with(0.0, 1.0, 1_000, BbrState::Startup),
            sample_with(0.1, 1.0, 1_000, BbrState::ProbeBw),
            sample_with(0.2, 1.0, 1_000, BbrState::ProbeBw),
            sample_with(0.3, 1.0, 1_000, BbrState::ProbeBw),
        ];
        let stats = RunStatistics::compute(&samples).unwrap();
        assert_eq!(stats.state_occupancy[0].state, "ProbeBW");
        assert_eq!(stats.state_occupancy[0].count, 3);
        assert_eq!(stats.state_occupancy[0].pct, 75.0);
        let total_pct: f64 = stats.state_occupancy.iter().map(|o| o.pct).sum();
        assert!((total_pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn loss_counters_sum_and_count_nonzero_samples() {
        let mut a = Sample::at(0.0);
        a.lost_packets_cumulative = Some(0);
        let mut b = Sample::at(0.1);
        b.lost_packets_cumulative = Some(3);
        let mut c = Sample::at(0.2);
        c.lost_packets_cumulative = Some(2);
        let stats = RunStatistics::compute(&[a, b, c]).unwrap();
        assert_eq!(stats.total_lost_packets, 5);
        assert_eq!(stats.loss_sample_count, 2);
    }

    #[test]
    fn rtt_distribution_percentiles() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&values, 0.95), 95.0);
        assert_eq!(percentile(&values, 0.0), 1.0);
        assert_eq!(percentile(&values, 1.0), 100.0);
        assert_eq!(percentile(&[], 0.5), 0.0);

        let samples: Vec<Sample> = values
            .iter()
            .map(|v| {
                let mut s = Sample::at(*v);
                s.rtt_us = Some((*v * 1_000.0) as u64);
                s
            })
            .collect();
        let stats = RunStatistics::compute(&samples).unwrap();
        let rtt = stats.rtt.unwrap();
        assert_eq!(rtt.p95_ms, 95.0);
        assert_eq!(rtt.min_ms, 1.0);
        assert_eq!(rtt.max_ms, 100.0);
        assert!((rtt.mean_ms - 50.5).abs() < 1e-9);
    }

    #[test]
    fn comparison_reports_relative_deltas() {
        let baseline = RunStatistics::compute(&[sample_with(0.0, 100.0, 20_000, BbrState::ProbeBw)])
            .unwrap();
        let candidate = RunStatistics::compute(&[sample_with(0.0, 150.0, 10_000, BbrState::ProbeBw)])
            .unwrap();
        let cmp = RunComparison::between(baseline, candidate);
        assert_eq!(cmp.avg_total_rate_delta_pct, Some(50.0));
        assert_eq!(cmp.avg_rtt_delta_pct, Some(-50.0));
        assert_eq!(cmp.lost_packets_delta, 0);
    }

    #[test]
    fn cwnd_utilization_tracks_overshoot() {
        let mut a = Sample::at(0.0);
        a.cwnd_bytes = Some(100_000);
        a.inflight_bytes = Some(50_000);
        let mut b = Sample::at(0.1);
        b.cwnd_bytes = Some(100_000);
        b.inflight_bytes = Some(125_000);
        let c = Sample::at(0.2); // no pair, skipped

        let util = cwnd_utilization(&[a, b, c]).unwrap();
        assert_eq!(util.measured_samples, 2);
        assert_eq!(util.over_cwnd_samples, 1);
        assert_eq!(util.over_cwnd_pct, 50.0);
        assert_eq!(util.avg_utilization_pct, 87.5);
        assert_eq!(util.max_utilization_pct, 125.0);
        assert_eq!(util.peak_inflight_bytes, 125_000);

        assert!(cwnd_utilization(&[Sample::at(0.0)]).is_none());
    }

    #[test]
    fn sampling_points_dump_honors_layout_contract() {
        let mut s = Sample::at(1.5);
        s.packet_number = Some(42);
        s.estimated_bw_mbps = Some(110.0);
        s.rtt_us = Some(25_000);
        s.cwnd_bytes = Some(131_072);
        s.state = BbrState::ProbeBw;
        s.raw_line = "[BBR-PKT-SENT] T=1.500 s, PKT=42".to_string();

        let mut buf: Vec<u8> = Vec::new();
        write_sampling_points(&mut buf, &[s]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[0], "=== BBR Sampling Points Detailed Data ===");
        assert_eq!(lines[1], "Total sampling points: 1");
        assert_eq!(lines[2], "Data sampling method: All SENT events");
        assert_eq!(lines[3], "");
        assert_eq!(lines[4], SAMPLING_POINTS_COLUMNS);
        assert!(lines[5].starts_with("1,1.500,42,"));
        assert!(lines[5].contains(",ProbeBW,"));
        assert!(lines[5].contains("110.00"));
        assert_eq!(lines[6], "");
        assert_eq!(lines[7], "=== Raw Log Lines ===");
        assert_eq!(lines[8], "1: [BBR-PKT-SENT] T=1.500 s, PKT=42");
    }

    #[test]
    fn sampling_points_path_derives_from_stem() {
        let path = sampling_points_path(Path::new("/tmp/run7/bbr_test.log"));
        assert_eq!(path, PathBuf::from("/tmp/run7/bbr_test_sampling_points.txt"));
    }

    #[test]
    fn columnar_export_keeps_columns_aligned() {
        let samples = vec![
            sample_with(0.0, 10.0, 5_000, BbrState::Startup),
            sample_with(0.1, 20.0, 6_000, BbrState::ProbeBw),
            sample_with(0.2, 30.0, 7_000, BbrState::ProbeBw),
        ];
        let cols = SampleColumns::from_samples(&samples);
        assert_eq!(cols.len(), 3);
        assert_eq!(cols.rtt_ms[1], Some(6.0));
        assert_eq!(cols.state[2], "ProbeBW");
        assert!(cols.sample_count.is_none());

        let buckets = aggregate_samples(&samples, &AggregationConfig::default()).unwrap();
        let agg_cols = SampleColumns::from_aggregated(&buckets);
        assert_eq!(
            agg_cols.sample_count.as_ref().map(|c| c.len()),
            Some(agg_cols.len())
        );
    }
}

// ============================================================================
// SECTION 19: ANALYSIS PIPELINE
// ============================================================================
// End-to-end report assembly: ingest output through optional aggregation,
// the anomaly filter, and the statistics engine, into one serializable
// report structure shared by the text and JSON surfaces.
// ============================================================================

/// Loss side-channel summary for one run.
#[derive(Debug, Clone, Serialize)]
pub struct LossSummary {
    /// Number of discrete loss events
    pub event_count: usize,
    /// Incremental packets lost across all events
    pub packets_lost: u64,
    /// Events flagged as persistent congestion
    pub persistent_congestion_events: usize,
}

impl LossSummary {
    fn from_run(run: &Run) -> Self {
        Self {
            event_count: run.loss_events.len(),
            packets_lost: run.packets_lost(),
            persistent_congestion_events: run
                .loss_events
                .iter()
                .filter(|e| e.persistent_congestion)
                .count(),
        }
    }
}

/// Complete analysis of one run.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub source: String,
    /// True when statistics were computed over window buckets
    pub aggregated: bool,
    pub diagnostics: IngestDiagnostics,
    pub statistics: RunStatistics,
    pub loss: LossSummary,
    pub cwnd_utilization: Option<CwndUtilization>,
}

/// Run the full pipeline over one ingested run.
pub fn analyze_run(
    run: &Run,
    config: &EngineConfig,
    aggregate: bool,
) -> Result<AnalysisReport, ProcessingError> {
    let filter = AnomalyFilter::new(&config.filter);

    let statistics = if aggregate {
        let mut buckets = aggregate_samples(&run.samples, &config.aggregation)?;
        if config.filter.enabled {
            filter.apply_aggregated(&mut buckets);
        }
        RunStatistics::compute_aggregated(&buckets)?
    } else {
        let mut samples = run.samples.clone();
        if config.filter.enabled {
            filter.apply(&mut samples);
        }
        RunStatistics::compute(&samples)?
    };

    Ok(AnalysisReport {
        source: run.source.display().to_string(),
        aggregated: aggregate,
        diagnostics: run.diagnostics.clone(),
        statistics,
        loss: LossSummary::from_run(run),
        cwnd_utilization: cwnd_utilization(&run.samples),
    })
}

/// Head-to-head comparison of a raw baseline against a windowed candidate.
///
/// Only the candidate is bucketed, with the configured window and profile,
/// so a merged multi-connection capture meets the baseline on equal terms.
/// The baseline's statistics come from its raw samples; a single-stream
/// baseline emitting several dumps per window is never inflated by window
/// summing.
pub fn compare_runs(
    baseline: &Run,
    candidate: &Run,
    config: &EngineConfig,
) -> Result<RunComparison, ProcessingError> {
    let base = analyze_run(baseline, config, false)?;
    let cand = analyze_run(candidate, config, true)?;
    Ok(RunComparison::between(base.statistics, cand.statistics))
}

// ----------------------------------------------------------------------------
// 19.1 Text Report Rendering
// ----------------------------------------------------------------------------

fn fmt_opt(v: Option<f64>, unit: &str) -> String {
    match v {
        Some(v) => format!("{:.2} {}", v, unit),
        None => "n/a".to_string(),
    }
}

fn print_text_report(report: &AnalysisReport) {
    let stats = &report.statistics;
    println!("{}", "=".repeat(60));
    println!("BBR Telemetry Analysis: {}", report.source);
    println!("{}", "=".repeat(60));
    println!(
        "Duration: {:.2} s over {} samples{}",
        stats.duration_sec,
        stats.sample_count,
        if report.aggregated { " (windowed)" } else { "" }
    );
    println!();
    println!("[Lines]");
    let d = &report.diagnostics;
    println!("  total: {}", d.total_lines);
    for (label, count) in [
        ("log", d.log_lines),
        ("sent", d.sent_lines),
        ("acked", d.acked_lines),
        ("lost", d.lost_lines),
        ("debug", d.debug_lines),
        ("unrecognized", d.unrecognized_lines),
        ("no timestamp", d.dropped_no_timestamp),
    ] {
        println!("  {:<13} {:>9} ({:.1}%)", label, count, d.pct(count));
    }
    println!();
    println!("[Throughput]");
    println!("  avg total: {}", fmt_opt(stats.avg_total_rate_mbps, "Mbps"));
    println!("  max total: {}", fmt_opt(stats.max_total_rate_mbps, "Mbps"));
    println!("  avg send:  {}", fmt_opt(stats.avg_send_rate_mbps, "Mbps"));
    println!("  avg recv:  {}", fmt_opt(stats.avg_recv_rate_mbps, "Mbps"));
    println!("  avg estimated BW: {}", fmt_opt(stats.avg_estimated_bw_mbps, "Mbps"));
    println!();
    println!("[Latency]");
    println!("  avg RTT:     {}", fmt_opt(stats.avg_rtt_ms, "ms"));
    println!("  min RTT:     {}", fmt_opt(stats.min_rtt_ms, "ms"));
    println!("  avg min RTT: {}", fmt_opt(stats.avg_min_rtt_ms, "ms"));
    if let Some(rtt) = &stats.rtt {
        println!(
            "  RTT dist: median={:.2} ms  p95={:.2} ms  p99={:.2} ms  std={:.2} ms",
            rtt.median_ms, rtt.p95_ms, rtt.p99_ms, rtt.std_ms
        );
    }
    println!();
    println!("[Window]");
    println!("  avg CWND: {}", fmt_opt(stats.avg_cwnd_kb, "KB"));
    println!("  max CWND: {}", fmt_opt(stats.max_cwnd_kb, "KB"));
    println!("  avg in-flight: {}", fmt_opt(stats.avg_inflight_kb, "KB"));
    if let Some(util) = &report.cwnd_utilization {
        println!(
            "  utilization: avg={:.1}%  max={:.1}%  over-CWND {}/{} samples ({:.1}%)",
            util.avg_utilization_pct,
            util.max_utilization_pct,
            util.over_cwnd_samples,
            util.measured_samples,
            util.over_cwnd_pct
        );
    }
    println!();
    println!("[Loss]");
    println!(
        "  events: {}  packets lost: {}  persistent congestion: {}",
        report.loss.event_count, report.loss.packets_lost, report.loss.persistent_congestion_events
    );
    println!();
    println!("[States]");
    for occ in &stats.state_occupancy {
        println!("  {:<10} {:>7} samples ({:.1}%)", occ.state, occ.count, occ.pct);
    }
}

fn print_comparison_report(cmp: &RunComparison, baseline: &Path, candidate: &Path) {
    println!("{}", "=".repeat(60));
    println!("BBR Run Comparison");
    println!("  baseline:  {}", baseline.display());
    println!("  candidate: {}", candidate.display());
    println!("{}", "=".repeat(60));
    println!("[Throughput]");
    println!(
        "  avg total: {} -> {}",
        fmt_opt(cmp.baseline.avg_total_rate_mbps, "Mbps"),
        fmt_opt(cmp.candidate.avg_total_rate_mbps, "Mbps")
    );
    if let Some(delta) = cmp.avg_total_rate_delta_pct {
        println!("  avg delta: {:+.1}%", delta);
    }
    println!(
        "  max total: {} -> {}",
        fmt_opt(cmp.baseline.max_total_rate_mbps, "Mbps"),
        fmt_opt(cmp.candidate.max_total_rate_mbps, "Mbps")
    );
    if let Some(delta) = cmp.max_total_rate_delta_pct {
        println!("  max delta: {:+.1}%", delta);
    }
    println!("[Latency]");
    println!(
        "  avg RTT: {} -> {}",
        fmt_opt(cmp.baseline.avg_rtt_ms, "ms"),
        fmt_opt(cmp.candidate.avg_rtt_ms, "ms")
    );
    if let Some(delta) = cmp.avg_rtt_delta_pct {
        println!("  RTT delta: {:+.1}%", delta);
    }
    println!("[Loss]");
    println!(
        "  lost packets: {} -> {} ({:+})",
        cmp.baseline.total_lost_packets, cmp.candidate.total_lost_packets, cmp.lost_packets_delta
    );
    for (label, stats) in [("baseline", &cmp.baseline), ("candidate", &cmp.candidate)] {
        println!("[States: {}]", label);
        for occ in &stats.state_occupancy {
            println!("  {:<10} {:>7} ({:.1}%)", occ.state, occ.count, occ.pct);
        }
    }
}

// ============================================================================
// SECTION 20: CLI INTERFACE
// ============================================================================

/// Output format for analysis reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(
    name = "bbrscope",
    version = ENGINE_VERSION,
    about = "BBR telemetry log ingestion, aggregation and statistics engine",
    long_about = None
)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "bbrscope.toml", env = "BBRSCOPE_CONFIG")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Analyze one log file and print a summary report
    Analyze {
        /// Input telemetry log
        log_file: PathBuf,

        /// Stop reading after this many lines
        #[arg(long)]
        max_lines: Option<u64>,

        /// Reduce samples into fixed-width time buckets first
        #[arg(long)]
        aggregate: bool,

        /// Bucket width in seconds (implies nothing unless --aggregate)
        #[arg(long)]
        window: Option<f64>,

        /// Reducer profile for rate fields
        #[arg(long, value_enum)]
        profile: Option<AggregationProfile>,

        /// Report output format
        #[arg(long, value_enum, default_value = "text")]
        format: ReportFormat,

        /// Also write the sampling-points audit dump next to the input
        #[arg(long)]
        dump: bool,
    },

    /// Compare a baseline run against a candidate run
    Compare {
        baseline: PathBuf,
        candidate: PathBuf,

        /// Bucket width in seconds
        #[arg(long)]
        window: Option<f64>,

        /// Reducer profile for rate fields
        #[arg(long, value_enum)]
        profile: Option<AggregationProfile>,
    },

    /// Write the sampling-points audit dump for a log file
    Dump {
        log_file: PathBuf,

        /// Output path (default: <stem>_sampling_points.txt next to input)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate the configuration file
    Validate,

    /// Generate a default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

// ----------------------------------------------------------------------------
// 20.1 Command Handlers
// ----------------------------------------------------------------------------

fn handle_analyze(
    mut config: EngineConfig,
    log_file: &Path,
    max_lines: Option<u64>,
    aggregate: bool,
    window: Option<f64>,
    profile: Option<AggregationProfile>,
    format: ReportFormat,
    dump: bool,
) -> anyhow::Result<()> {
    if let Some(cap) = max_lines {
        config.ingest.max_lines = Some(cap);
    }
    if let Some(w) = window {
        config.aggregation.window_secs = w;
    }
    if let Some(p) = profile {
        config.aggregation.profile = p;
    }

    let run = ingest_file(log_file, &config.ingest)?;
    let report = analyze_run(&run, &config, aggregate).map_err(ScopeError::from)?;

    match format {
        ReportFormat::Text => print_text_report(&report),
        ReportFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    if dump {
        let out = sampling_points_path(log_file);
        dump_sampling_points(&run.samples, &out)
            .with_context(|| format!("writing audit dump to {}", out.display()))?;
        println!("Audit dump written to {}", out.display());
    }

    Ok(())
}

fn handle_compare(
    mut config: EngineConfig,
    baseline: &Path,
    candidate: &Path,
    window: Option<f64>,
    profile: Option<AggregationProfile>,
) -> anyhow::Result<()> {
    if let Some(w) = window {
        config.aggregation.window_secs = w;
    }
    // The profile governs candidate aggregation only; comparisons usually
    // pit a merged multi-connection capture against a raw baseline.
    config.aggregation.profile = profile.unwrap_or(AggregationProfile::MultiConnection);

    let (base_result, cand_result) = ingest_pair(baseline, candidate, &config.ingest);
    let base_run = base_result?;
    let cand_run = cand_result?;

    let cmp = compare_runs(&base_run, &cand_run, &config).map_err(ScopeError::from)?;
    print_comparison_report(&cmp, baseline, candidate);
    Ok(())
}

fn handle_dump(
    config: EngineConfig,
    log_file: &Path,
    output: Option<PathBuf>,
) -> anyhow::Result<()> {
    let run = ingest_file(log_file, &config.ingest)?;
    let out = output.unwrap_or_else(|| sampling_points_path(log_file));
    dump_sampling_points(&run.samples, &out)
        .with_context(|| format!("writing audit dump to {}", out.display()))?;
    println!(
        "Wrote {} sampling points to {}",
        run.len(),
        out.display()
    );
    Ok(())
}

fn handle_generate_config(output: Option<PathBuf>) -> anyhow::Result<()> {
    let body = EngineConfig::generate_default_config();
    match output {
        Some(path) => {
            fs::write(&path, &body)
                .with_context(|| format!("writing config to {}", path.display()))?;
            println!("Default configuration written to {}", path.display());
        }
        None => print!("{}", body),
    }
    Ok(())
}

// ============================================================================
// SECTION 21: MAIN ENTRY POINT
// ============================================================================

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that must not require a config file or logging.
    match &cli.command {
        Some(Commands::Version) => {
            println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            return handle_generate_config(output.clone());
        }
        _ => {}
    }

    let config = if cli.config.exists() {
        EngineConfig::load(&cli.config)?
    } else {
        EngineConfig::default()
    };

    init_logging(&config.logging)?;
    if !cli.config.exists() {
        debug!(
            target: "bbrscope::init",
            path = %cli.config.display(),
            "no configuration file, using defaults"
        );
    }

    match cli.command {
        Some(Commands::Analyze {
            log_file,
            max_lines,
            aggregate,
            window,
            profile,
            format,
            dump,
        }) => handle_analyze(
            config, &log_file, max_lines, aggregate, window, profile, format, dump,
        ),
        Some(Commands::Compare {
            baseline,
            candidate,
            window,
            profile,
        }) => handle_compare(config, &baseline, &candidate, window, profile),
        Some(Commands::Dump { log_file, output }) => handle_dump(config, &log_file, output),
        Some(Commands::Validate) => {
            // Loading already validated; re-validate explicitly for the
            // not-found case where defaults were substituted.
            if !cli.config.exists() {
                anyhow::bail!(ScopeError::from(ConfigError::FileNotFound {
                    path: cli.config.clone(),
                }));
            }
            config.validate().map_err(ScopeError::from)?;
            println!("Configuration OK: {}", cli.config.display());
            Ok(())
        }
        Some(Commands::Version) | Some(Commands::GenerateConfig { .. }) => unreachable!(),
        None => {
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

// ============================================================================
// SECTION 22: CONFIGURATION & CLI TESTS
// ============================================================================
