//! Resolution engine: resolves every requested record type of a task.
//!
//! Each call to [`ResolutionEngine::resolve_all`] picks an
//! [`ExecutionMode`] and, per record type, whether to inject a synthetic
//! failure instead of calling the resolver. All of those draws are taken
//! before the first lookup starts, in request order, so a seeded
//! [`RandomSource`] reproduces the same decisions no matter how the
//! concurrent lookups are scheduled.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use dns_worker::RecordType;
//! use dns_worker::resolver::{ChaosConfig, DigLookup, FixedRandom, ResolutionEngine};
//! use dns_worker::telemetry::{TraceContext, Tracer};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! // Every lookup is replaced by a chaos failure, so the program never runs.
//! let engine = ResolutionEngine::new(
//!     Arc::new(DigLookup::default()),
//!     Arc::new(FixedRandom(0.0)),
//!     Tracer::noop(),
//!     ChaosConfig { sequential_probability: 0.5, error_probability: 1.0 },
//! );
//! let resolution = engine
//!     .resolve_all("example.com", &[RecordType::A], &TraceContext::new_root())
//!     .await;
//! assert!(resolution.records[&RecordType::A].chaos_injected);
//! # }
//! ```

mod chaos;
mod lookup;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinSet;

use crate::telemetry::{SpanStatus, TraceContext, Tracer};
use crate::types::{LookupResult, RecordType};

pub use chaos::{
    is_valid_probability, random_source, ChaosConfig, FixedRandom, RandomSource, SeededRandom,
    SequenceRandom, ThreadRandom,
};
pub use lookup::{
    parse_output, DigLookup, DnsLookup, LookupError, DEFAULT_LOOKUP_TIMEOUT, DEFAULT_PROGRAM,
};

/// How the lookups of one task are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// One lookup at a time, in request order.
    Sequential,
    /// All lookups at once, joined before returning.
    Concurrent,
}

impl ExecutionMode {
    /// Lowercase name, as recorded on spans.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Concurrent => "concurrent",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of [`ResolutionEngine::resolve_all`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The mode that was drawn for this call.
    pub mode: ExecutionMode,
    /// One result per requested record type, in request order.
    pub records: IndexMap<RecordType, LookupResult>,
}

/// Resolves a domain's record types with chaos injection.
#[derive(Clone)]
pub struct ResolutionEngine {
    lookup: Arc<dyn DnsLookup>,
    random: Arc<dyn RandomSource>,
    tracer: Tracer,
    chaos: ChaosConfig,
}

impl fmt::Debug for ResolutionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolutionEngine")
            .field("lookup", &self.lookup.name())
            .field("tracer", &self.tracer)
            .field("chaos", &self.chaos)
            .finish_non_exhaustive()
    }
}

impl ResolutionEngine {
    /// Creates an engine.
    pub fn new(
        lookup: Arc<dyn DnsLookup>,
        random: Arc<dyn RandomSource>,
        tracer: Tracer,
        chaos: ChaosConfig,
    ) -> Self {
        Self {
            lookup,
            random,
            tracer,
            chaos,
        }
    }

    /// The chaos settings in effect.
    pub fn chaos(&self) -> ChaosConfig {
        self.chaos
    }

    /// Resolves every type in `record_types` for `domain`.
    ///
    /// Never fails as a whole: each failure is reported in its own
    /// [`LookupResult`], and the returned map always has exactly one entry
    /// per distinct requested type.
    pub async fn resolve_all(
        &self,
        domain: &str,
        record_types: &[RecordType],
        parent: &TraceContext,
    ) -> Resolution {
        let mode = if self.random.next_f64() < self.chaos.sequential_probability {
            ExecutionMode::Sequential
        } else {
            ExecutionMode::Concurrent
        };
        let mut plan: Vec<(RecordType, bool)> = Vec::with_capacity(record_types.len());
        for record_type in record_types {
            if plan.iter().any(|(planned, _)| planned == record_type) {
                continue;
            }
            let inject = self.random.next_f64() < self.chaos.error_probability;
            plan.push((record_type.clone(), inject));
        }

        let mut span = self.tracer.start("lookup_all_records", Some(parent));
        span.set_attribute("dns.domain", domain);
        span.set_attribute("dns.record_types.count", plan.len());
        span.set_attribute("execution.mode", mode.as_str());
        span.set_attribute(
            "chaos.sequential_probability",
            self.chaos.sequential_probability,
        );
        span.set_attribute("chaos.error_probability", self.chaos.error_probability);

        tracing::debug!(
            domain = %domain,
            mode = %mode,
            record_types = plan.len(),
            trace_id = %parent.short_trace_id(),
            "resolving record types"
        );

        let context = span.context().clone();
        let records = match mode {
            ExecutionMode::Sequential => self.run_sequential(domain, plan, &context).await,
            ExecutionMode::Concurrent => self.run_concurrent(domain, plan, &context).await,
        };

        span.set_attribute("dns.results.count", records.len());
        span.set_status(SpanStatus::Ok);
        span.end();

        Resolution { mode, records }
    }

    async fn run_sequential(
        &self,
        domain: &str,
        plan: Vec<(RecordType, bool)>,
        parent: &TraceContext,
    ) -> IndexMap<RecordType, LookupResult> {
        let mut records = IndexMap::with_capacity(plan.len());
        for (record_type, inject) in plan {
            let result = lookup_one(
                self.lookup.as_ref(),
                &self.tracer,
                domain,
                record_type.clone(),
                inject,
                parent,
            )
            .await;
            records.insert(record_type, result);
        }
        records
    }

    async fn run_concurrent(
        &self,
        domain: &str,
        plan: Vec<(RecordType, bool)>,
        parent: &TraceContext,
    ) -> IndexMap<RecordType, LookupResult> {
        let order: Vec<RecordType> = plan.iter().map(|(rt, _)| rt.clone()).collect();
        let shared: Arc<Mutex<HashMap<RecordType, LookupResult>>> =
            Arc::new(Mutex::new(HashMap::with_capacity(plan.len())));

        let mut units = JoinSet::new();
        for (record_type, inject) in plan {
            let lookup = Arc::clone(&self.lookup);
            let tracer = self.tracer.clone();
            let domain = domain.to_string();
            let parent = parent.clone();
            let shared = Arc::clone(&shared);
            units.spawn(async move {
                let result = lookup_one(
                    lookup.as_ref(),
                    &tracer,
                    &domain,
                    record_type.clone(),
                    inject,
                    &parent,
                )
                .await;
                shared.lock().insert(record_type, result);
            });
        }

        while let Some(joined) = units.join_next().await {
            if let Err(e) = joined {
                tracing::error!(domain = %domain, error = %e, "lookup task did not complete");
            }
        }

        let mut finished = std::mem::take(&mut *shared.lock());
        order
            .into_iter()
            .map(|record_type| {
                let result = finished.remove(&record_type).unwrap_or_else(|| {
                    LookupResult::failure(
                        record_type.clone(),
                        "lookup task did not complete",
                        Duration::ZERO,
                    )
                });
                (record_type, result)
            })
            .collect()
    }
}

/// Performs (or fakes) one lookup inside its own span.
async fn lookup_one(
    lookup: &dyn DnsLookup,
    tracer: &Tracer,
    domain: &str,
    record_type: RecordType,
    inject: bool,
    parent: &TraceContext,
) -> LookupResult {
    let mut span = tracer.start(
        format!(
            "lookup_{}_record",
            record_type.as_str().to_ascii_lowercase()
        ),
        Some(parent),
    );
    span.set_attribute("dns.record_type", record_type.as_str());
    span.set_attribute("dns.domain", domain);

    let started = Instant::now();
    let result = if inject {
        LookupResult::chaos(record_type, started.elapsed())
    } else {
        match lookup.lookup(domain, &record_type).await {
            Ok(output) => {
                LookupResult::success(record_type, parse_output(&output), started.elapsed())
            },
            Err(e) => LookupResult::failure(record_type, e.to_string(), started.elapsed()),
        }
    };

    span.set_attribute("dns.records.count", result.records.len());
    span.set_attribute("dns.duration_ms", result.duration.as_secs_f64() * 1000.0);
    span.set_attribute("chaos.injected_error", result.chaos_injected);
    match &result.error {
        Some(message) => {
            span.set_attribute("error", true);
            span.set_attribute("error.message", message.as_str());
            span.record_error(message.as_str());
            span.set_status(SpanStatus::Error {
                message: message.clone(),
            });
            if result.chaos_injected {
                tracing::debug!(
                    domain = %domain,
                    record_type = %result.record_type,
                    "chaos failure injected"
                );
            } else {
                tracing::warn!(
                    domain = %domain,
                    record_type = %result.record_type,
                    error = %message,
                    "lookup failed"
                );
            }
        },
        None => {
            span.set_attribute("error", false);
            span.set_status(SpanStatus::Ok);
        },
    }
    span.end();
    result
}
