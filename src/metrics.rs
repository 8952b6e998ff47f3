//! Call driver metrics.

use metriken::{Counter, Gauge, metric};

/// Total calls created by channels and transports.
#[metric(name = "calls_created", description = "Total calls created")]
pub static CALLS_CREATED: Counter = Counter::new();

/// Calls with live transport state.
#[metric(name = "calls_active", description = "Calls not yet torn down by their transport")]
pub static CALLS_ACTIVE: Gauge = Gauge::new();

#[metric(name = "batches_submitted", description = "Total operation batches submitted")]
pub static BATCHES_SUBMITTED: Counter = Counter::new();

#[metric(name = "batches_completed", description = "Total operation batches completed")]
pub static BATCHES_COMPLETED: Counter = Counter::new();

/// Batches that completed with `ok == false`.
#[metric(name = "batches_failed", description = "Total operation batches that failed")]
pub static BATCHES_FAILED: Counter = Counter::new();

#[metric(name = "arena_allocations", description = "Total allocations made from call arenas")]
pub static ARENA_ALLOCATIONS: Counter = Counter::new();

/// Messages rejected for exceeding the configured size limit.
#[metric(name = "messages_oversize")]
pub static MESSAGES_OVERSIZE: Counter = Counter::new();
