//! The virtual-user runtime: one closed-loop task per simulated user.
//!
//! A user repeats passes over its group's enabled requests according to the
//! group's loop policy. Each pass draws fresh CSV bindings, runs the request
//! pipeline in plan order, and carries extracted values forward within the
//! pass only. Cancellation is cooperative: `stop` is honoured at iteration
//! boundaries and between requests, with a bounded grace window for the
//! in-flight request; `kill` drops in-flight work immediately.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};
use uuid::Uuid;

use crate::client::Dispatcher;
use crate::data::CsvFeed;
use crate::pipeline::{self, RequestContext};
use crate::plan::{HttpRequest, LoopCount};
use crate::report::RequestRecord;
use crate::runner::FatalSignal;
use crate::vars::VariableContext;
use crate::{CRATE_NAME, RESULT_SEND_RETRIES, RESULT_SEND_TIMEOUT, STOP_GRACE};

/// Termination rule for one virtual user, fixed at spawn time.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LoopPolicy {
    Finite(u64),
    /// Absolute deadline measured from the group's start, checked at
    /// iteration boundaries only.
    Deadline(Instant),
    Infinite,
}

impl LoopPolicy {
    pub(crate) fn new(loop_count: &LoopCount, group_start: Instant) -> Self {
        match loop_count {
            LoopCount::Finite { count } => Self::Finite(*count),
            LoopCount::Duration { seconds } => {
                Self::Deadline(group_start + std::time::Duration::from_secs(*seconds))
            }
            LoopCount::Infinite => Self::Infinite,
        }
    }

    fn another_iteration(&self, completed: u64) -> bool {
        match self {
            LoopPolicy::Finite(count) => completed < *count,
            LoopPolicy::Deadline(deadline) => Instant::now() < *deadline,
            LoopPolicy::Infinite => true,
        }
    }
}

pub(crate) struct VirtualUser {
    pub index: u32,
    pub plan_id: Uuid,
    pub thread_group: Arc<str>,
    /// Enabled requests only, in plan order.
    pub requests: Arc<[HttpRequest]>,
    pub policy: LoopPolicy,
    pub vars: VariableContext,
    pub feed: CsvFeed,
    pub dispatcher: Dispatcher,
    pub results: mpsc::Sender<RequestRecord>,
    pub stop: CancellationToken,
    pub kill: CancellationToken,
    pub fatal: FatalSignal,
}

impl VirtualUser {
    pub async fn run(mut self) {
        event!(
            target: CRATE_NAME,
            Level::DEBUG,
            group = %self.thread_group,
            user = self.index,
            "virtual user started"
        );

        let mut completed = 0u64;
        while self.policy.another_iteration(completed)
            && !self.stop.is_cancelled()
            && !self.kill.is_cancelled()
        {
            let bindings = self.feed.next_bindings();
            self.vars.begin_iteration(bindings);

            let requests = Arc::clone(&self.requests);
            for request in requests.iter() {
                if self.stop.is_cancelled() || self.kill.is_cancelled() {
                    return;
                }
                if !self.run_one(request).await {
                    return;
                }
            }
            completed += 1;
        }
    }

    // One request, bounded by the cancellation contracts. Returns false when
    // the user must wind down.
    async fn run_one(&mut self, request: &HttpRequest) -> bool {
        let stop = self.stop.clone();
        let kill = self.kill.clone();

        let record = {
            let ctx = RequestContext {
                dispatcher: &self.dispatcher,
                plan_id: self.plan_id,
                thread_group: &self.thread_group,
            };
            let work = pipeline::run_request(request, &mut self.vars, &ctx);
            tokio::pin!(work);

            tokio::select! {
                biased;
                _ = kill.cancelled() => return false,
                record = &mut work => record,
                _ = stop.cancelled() => {
                    // Grace window for the in-flight request; if it does not
                    // finish in time it is dropped without a result event.
                    tokio::select! {
                        _ = kill.cancelled() => return false,
                        record = &mut work => record,
                        _ = tokio::time::sleep(STOP_GRACE) => return false,
                    }
                }
            }
        };

        tokio::select! {
            _ = self.kill.cancelled() => false,
            delivered = self.emit(record) => delivered,
        }
    }

    // Deliver a record to the aggregator queue. The queue is bounded; a full
    // queue back-pressures the user rather than dropping results. Persistent
    // overflow trips the fatal signal.
    async fn emit(&self, record: RequestRecord) -> bool {
        let mut record = record;
        for attempt in 1..=RESULT_SEND_RETRIES {
            match self
                .results
                .send_timeout(record, RESULT_SEND_TIMEOUT)
                .await
            {
                Ok(()) => return true,
                Err(SendTimeoutError::Closed(_)) => return false,
                Err(SendTimeoutError::Timeout(returned)) => {
                    event!(
                        target: CRATE_NAME,
                        Level::WARN,
                        group = %self.thread_group,
                        user = self.index,
                        attempt,
                        "result queue full"
                    );
                    record = returned;
                }
            }
        }
        self.fatal
            .trip("aggregator queue overflow after back-pressure retries");
        false
    }
}
