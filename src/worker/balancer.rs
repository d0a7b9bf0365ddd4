//! Fair worker assignment across the fleet
//!
//! Each member runs this loop against the shared member list. Everyone first
//! reaches the minimum `⌊W/M⌋` before anyone takes a remainder slot, which
//! keeps an early starter from hoarding workers and starving a late joiner.
//! Convergence: after the loop settles, every member owns `⌊W/M⌋` or
//! `⌈W/M⌉` workers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::membership::{MemberList, MemberResult};
use super::Worker;

pub struct Balancer {
    member: Arc<dyn MemberList>,
    workers: Vec<Arc<dyn Worker>>,
    heartbeat: Duration,
}

impl Balancer {
    /// `workers` order is the tie-break: iteration is stable, so a
    /// partition-range scheme gets deterministic locality.
    pub fn new(
        member: Arc<dyn MemberList>,
        workers: Vec<Arc<dyn Worker>>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            member,
            workers,
            heartbeat,
        }
    }

    /// Balance on every heartbeat until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.heartbeat);
        loop {
            if let Err(e) = self.balance_once(&shutdown).await {
                warn!(error = %e, "error while balancing workers");
            }
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }
        }
    }

    /// One balancing pass: compute this member's target and start or stop
    /// local workers to meet it, then register the claim.
    pub async fn balance_once(&self, shutdown: &CancellationToken) -> MemberResult<()> {
        let members = self.member.list().await?;

        // A member not yet visible in the list (first tick) still counts.
        let present = members.iter().any(|m| m.name == self.member.name());
        let mut member_count = members.len();
        if !present {
            member_count += 1;
        }

        let worker_count = self.workers.len();
        let minimum = worker_count / member_count;

        // Workers claimed by peers are off-limits; whether everyone already
        // has the minimum decides if a remainder slot may be taken.
        let mut all_have_minimum = true;
        let mut workers_in_use: HashSet<String> = HashSet::new();
        for member in &members {
            if member.workers.len() < minimum {
                all_have_minimum = false;
            }
            if member.name != self.member.name() {
                workers_in_use.extend(member.workers.iter().cloned());
            }
        }

        let mut my_running: HashSet<String> = self
            .workers
            .iter()
            .filter(|w| w.is_running())
            .map(|w| w.name().to_string())
            .collect();
        workers_in_use.extend(my_running.iter().cloned());
        if my_running.len() < minimum {
            all_have_minimum = false;
        }

        let mut target = minimum;
        if all_have_minimum && worker_count % member_count != 0 {
            target += 1;
        }
        debug!(
            member = %self.member.name(),
            members = member_count,
            running = my_running.len(),
            target,
            "balancing"
        );

        let mut running = my_running.len();
        if running != target {
            for worker in &self.workers {
                if running > target {
                    if !worker.is_running() {
                        continue;
                    }
                    worker.stop().await;
                    my_running.remove(worker.name());
                    running -= 1;
                } else {
                    if workers_in_use.contains(worker.name()) {
                        continue;
                    }
                    if worker.start(shutdown).await {
                        my_running.insert(worker.name().to_string());
                        running += 1;
                    }
                }
                if running == target {
                    break;
                }
            }
        }

        let mut claim: Vec<String> = my_running.into_iter().collect();
        claim.sort();
        self.member.register(&claim).await
    }
}
