//! The external resolver program behind each lookup.
//!
//! The worker does not speak DNS. A [`DnsLookup`] returns whatever the
//! resolver program printed, and [`parse_output`] turns that into records.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::types::RecordType;

/// Default resolver program.
pub const DEFAULT_PROGRAM: &str = "dig";

/// Default bound on one resolver invocation.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Why the resolver program produced no usable output.
#[derive(Debug, Error)]
pub enum LookupError {
    /// The program could not be started or its output could not be read.
    #[error("dig command failed: {0}")]
    Io(#[from] std::io::Error),

    /// The program ran and exited unsuccessfully.
    #[error("dig command failed: {status}{}", stderr_suffix(.stderr))]
    Exit {
        /// Exit status.
        status: ExitStatus,
        /// Trimmed standard error.
        stderr: String,
    },

    /// The program did not finish in time and was killed.
    #[error("dig command timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(": {stderr}")
    }
}

/// Resolves one record type for one domain.
#[async_trait]
pub trait DnsLookup: Send + Sync {
    /// Returns the raw resolver output.
    async fn lookup(&self, domain: &str, record_type: &RecordType) -> Result<String, LookupError>;

    /// Implementation name for diagnostics.
    fn name(&self) -> &'static str;
}

/// Splits resolver output into records: one per line, trimmed, blank lines
/// dropped, order kept.
///
/// ```
/// use dns_worker::resolver::parse_output;
///
/// let records = parse_output("93.184.216.34\n\n  93.184.216.35 \n");
/// assert_eq!(records, vec!["93.184.216.34", "93.184.216.35"]);
/// ```
pub fn parse_output(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Runs `<program> <options...> <domain> <type>` as a child process.
#[derive(Debug, Clone)]
pub struct DigLookup {
    program: String,
    options: Vec<String>,
    timeout: Duration,
}

impl Default for DigLookup {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

impl DigLookup {
    /// Runs `program +short` with the default timeout.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            options: vec!["+short".to_string()],
            timeout: DEFAULT_LOOKUP_TIMEOUT,
        }
    }

    /// Replaces the options placed before the domain (default `+short`).
    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the per-invocation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The program this lookup runs.
    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl DnsLookup for DigLookup {
    async fn lookup(&self, domain: &str, record_type: &RecordType) -> Result<String, LookupError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.options)
            .arg(domain)
            .arg(record_type.as_str())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| LookupError::Timeout(self.timeout))??;

        if !output.status.success() {
            return Err(LookupError::Exit {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn name(&self) -> &'static str {
        "dig"
    }
}
