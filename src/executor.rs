//! The thread-group scheduler: spawns a group's virtual users with ramp-up
//! pacing and owns them until they terminate.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{event, Level};
use uuid::Uuid;

use crate::client::Dispatcher;
use crate::data::{CsvBank, CsvFeed};
use crate::plan::{HttpRequest, ThreadGroup};
use crate::report::RequestRecord;
use crate::runner::FatalSignal;
use crate::user::{LoopPolicy, VirtualUser};
use crate::vars::{ScopeLayers, VariableContext};
use crate::CRATE_NAME;

pub(crate) struct GroupScheduler {
    pub plan_id: Uuid,
    pub group: ThreadGroup,
    pub layers: ScopeLayers,
    pub bank: Arc<CsvBank>,
    pub dispatcher: Dispatcher,
    pub results: mpsc::Sender<RequestRecord>,
    pub stop: CancellationToken,
    pub kill: CancellationToken,
    pub fatal: FatalSignal,
    pub active_vus: Arc<AtomicU32>,
}

impl GroupScheduler {
    /// Run the whole group: user `i` starts `i * ramp_up / num_threads`
    /// after the group start, and duration-mode loops measure from that same
    /// group start. Completes when every user has terminated.
    pub async fn run(self) {
        let requests: Arc<[HttpRequest]> = self
            .group
            .requests
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect::<Vec<_>>()
            .into();
        if requests.is_empty() || self.group.num_threads == 0 {
            return;
        }

        let group_name: Arc<str> = Arc::from(self.group.name.as_str());
        let start = Instant::now();
        let num_threads = self.group.num_threads;
        let stagger = if self.group.ramp_up_seconds > 0 {
            Duration::from_secs_f64(self.group.ramp_up_seconds as f64 / num_threads as f64)
        } else {
            Duration::ZERO
        };

        event!(
            target: CRATE_NAME,
            Level::INFO,
            group = %group_name,
            users = num_threads,
            ramp_up_seconds = self.group.ramp_up_seconds,
            "thread group starting"
        );

        let mut users: JoinSet<()> = JoinSet::new();
        for index in 0..num_threads {
            if !stagger.is_zero() && index > 0 {
                let wake_at = start + stagger * index;
                tokio::select! {
                    _ = tokio::time::sleep_until(wake_at.into()) => {}
                    _ = self.stop.cancelled() => break,
                    _ = self.kill.cancelled() => break,
                }
            }
            if self.stop.is_cancelled() || self.kill.is_cancelled() {
                break;
            }

            let user = VirtualUser {
                index,
                plan_id: self.plan_id,
                thread_group: Arc::clone(&group_name),
                requests: Arc::clone(&requests),
                policy: LoopPolicy::new(&self.group.loop_count, start),
                vars: VariableContext::new(self.layers.clone()),
                feed: CsvFeed::new(Arc::clone(&self.bank)),
                dispatcher: self.dispatcher.clone(),
                results: self.results.clone(),
                stop: self.stop.clone(),
                kill: self.kill.clone(),
                fatal: self.fatal.clone(),
            };

            self.active_vus.fetch_add(1, Ordering::Relaxed);
            let active = Arc::clone(&self.active_vus);
            users.spawn(async move {
                user.run().await;
                active.fetch_sub(1, Ordering::Relaxed);
            });
        }

        while let Some(joined) = users.join_next().await {
            if let Err(e) = joined {
                if e.is_panic() {
                    self.fatal.trip("virtual user task panicked");
                    self.kill.cancel();
                }
            }
        }

        event!(
            target: CRATE_NAME,
            Level::INFO,
            group = %group_name,
            "thread group finished"
        );
    }
}
