//! Stream field names, default stream names and fixed diagnostic strings.

/// Stream field that carries the serialized record of every envelope.
pub const PAYLOAD_FIELD: &str = "data";

/// Default stream the coordinator publishes tasks to.
pub const DEFAULT_TASKS_STREAM: &str = "dns:tasks";

/// Default stream results are published to.
pub const DEFAULT_RESULTS_STREAM: &str = "dns:results";

/// Default prefix of per-location subscription names (`workers-<location>`).
pub const DEFAULT_SUBSCRIPTION_PREFIX: &str = "workers";

/// Prefix of per-location reader ids (`consumer-<location>`).
pub const READER_PREFIX: &str = "consumer";

/// Error text of a chaos-injected lookup failure.
pub const CHAOS_ERROR_MESSAGE: &str = "chaos engineering: simulated DNS lookup failure";

/// Error text of a task whose lookups all failed.
pub const ALL_LOOKUPS_FAILED: &str = "All DNS lookups failed";

/// Default probability of resolving record types one at a time.
pub const DEFAULT_SEQUENTIAL_PROBABILITY: f64 = 0.3;

/// Default probability of injecting a failure into a single lookup.
pub const DEFAULT_ERROR_PROBABILITY: f64 = 0.1;
