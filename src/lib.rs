/*! rmeter is a plan-driven HTTP load-generation engine.

A declarative [test plan](plan::TestPlan) describes thread groups of virtual
users, the requests they issue, assertions and extractors applied to every
response, and CSV data sources feeding `${name}` variables. The engine spawns
the virtual users as tokio tasks, honours ramp-up and loop semantics, streams
per-request results and periodic progress to subscribers, and aggregates a
final summary with latency percentiles.

# Concepts

* *Virtual user* - one independent closed-loop task: it issues the next
  request only after the previous one completed.
* *Thread group* - a population of virtual users sharing a ramp-up window,
  loop policy and request list. A scheduler task per group owns its users.
* *Iteration scope* - the innermost variable layer, alive for one pass over
  the request list; it holds the CSV row drawn for the pass and any values
  extracted by earlier requests of the pass. See [`vars`].
* *Aggregator* - a single task folding all result records into live
  statistics and the terminal summary. See [`aggregator`].

# Architecture

```text
          ┌──────────────────────────────────────────────────────┐
          │                      Runner                          │
  start   │  ┌────────────┐   ┌────────────┐                     │
 ───────► │  │ scheduler  │   │ scheduler  │  … one per group    │
  stop    │  └─────┬──────┘   └─────┬──────┘                     │
 ───────► │   ┌────┴────┬────┐      │                            │
          │   │  user   │user│ ...  │    results (bounded mpsc)  │
          │   └────┬────┴──┬─┘      │     ┌────────────┐         │
          │        └───────┴────────┴───► │ aggregator │         │
          └───────────────────────────────┴─────┬──────┴─────────┘
                                                │ events (broadcast)
                                    status / progress / result / complete
```

# Example

```no_run
use rmeter::prelude::*;

#[tokio::main]
async fn main() -> Result<(), EngineError> {
    let plan = TestPlan::from_json(&std::fs::read_to_string("smoke.rmeter").unwrap())?;
    let plan_id = plan.id;

    let runner = Runner::new();
    runner.register_plan(plan)?;

    let mut events = runner.subscribe();
    runner.start_test(plan_id)?;

    while let Ok(event) = events.recv().await {
        if let EngineEvent::Complete(summary) = event {
            println!("{} requests, p95 {} ms", summary.total_requests, summary.p95_response_ms);
            break;
        }
    }
    Ok(())
}
```
*/

pub mod aggregator;
pub mod assertion;
pub mod client;
pub mod data;
pub mod error;
pub mod event;
mod executor;
pub mod extract;
pub mod jsonpath;
pub mod pipeline;
pub mod plan;
pub mod report;
pub mod runner;
mod user;
pub mod vars;

pub mod prelude {
    pub use crate::error::EngineError;
    pub use crate::event::EngineEvent;
    pub use crate::plan::TestPlan;
    pub use crate::report::{ProgressSnapshot, RequestRecord, TestSummary};
    pub use crate::runner::{EngineStatus, Runner};
}

use std::time::Duration;

pub(crate) const CRATE_NAME: &str = env!("CARGO_PKG_NAME");

/// Cadence of `test-progress` events.
pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

/// Capacity of the bounded queue between pipelines and the aggregator. A
/// full queue back-pressures virtual users; results are never dropped.
pub const RESULT_QUEUE_CAPACITY: usize = 4096;

/// Capacity of the broadcast channel carrying [`event::EngineEvent`]s.
pub const EVENT_BUS_CAPACITY: usize = 1024;

/// How long a queue send may block before it counts as one failed attempt.
pub const RESULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Failed attempts tolerated before the run is declared fatally stuck.
pub const RESULT_SEND_RETRIES: u32 = 3;

/// Grace given to an in-flight request after a cooperative stop.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Default per-request timeout, overridable via [`HTTP_TIMEOUT_ENV`].
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Environment variable overriding the dispatcher timeout, in seconds.
pub const HTTP_TIMEOUT_ENV: &str = "RMETER_HTTP_TIMEOUT_SECS";

/// Largest body slice handed to assertions and extractors.
pub const MAX_EVAL_BODY_BYTES: usize = 1024 * 1024;

/// Largest body slice preserved on a result record.
pub const MAX_RECORD_BODY_BYTES: usize = 4096;

/// Sample cap for the exact percentiles of the final summary.
pub const RESERVOIR_CAPACITY: usize = 100_000;

/// Horizon of the progress throughput EWMA, in seconds.
pub const EWMA_HORIZON_SECS: f64 = 2.0;
