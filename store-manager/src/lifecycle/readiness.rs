use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::metrics::QUERYABLE;

/// Whether the server accepts query traffic.
///
/// Clones share one flag. The lifecycle manager is the only writer; API
/// handlers read it per request.
#[derive(Debug, Clone, Default)]
pub struct ReadinessGate {
    queryable: Arc<AtomicBool>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.queryable.load(Ordering::Acquire)
    }

    pub fn set(&self, queryable: bool) {
        let previous = self.queryable.swap(queryable, Ordering::AcqRel);
        QUERYABLE.set(i64::from(queryable));
        if previous != queryable {
            info!(queryable, "Query readiness changed");
        }
    }
}
