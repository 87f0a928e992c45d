//! Delayed dispatch of normalized webhook output.
//!
//! Hosts serve reads from caches that lag behind their own writes, so every
//! update waits out a quiet period before it is handed to the sink. Each
//! update gets its own one-shot timer; updates are not coalesced.

use bbs_common::config::MAX_HOOK_DELAY_SECS;
use bbs_common::{HeadUpdate, NormalizedEvent, RescanRequest};
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, debug};

/// Receiver of dispatched head events.
pub trait HeadEventSink: Send + Sync + 'static {
    fn head_updated(&self, update: &HeadUpdate);

    fn rescan_requested(&self, request: &RescanRequest);
}

enum Job {
    Update(HeadUpdate),
    Rescan(RescanRequest),
}

impl Job {
    fn deliver(&self, sink: &dyn HeadEventSink) {
        match self {
            Self::Update(update) => sink.head_updated(update),
            Self::Rescan(request) => sink.rescan_requested(request),
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    sink: Arc<dyn HeadEventSink>,
    delay: Duration,
}

impl Dispatcher {
    /// Delays above the configured maximum are clamped.
    pub fn new(sink: Arc<dyn HeadEventSink>, delay: Duration) -> Self {
        let delay = delay.min(Duration::from_secs(u64::from(MAX_HOOK_DELAY_SECS)));
        Self { sink, delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Schedule everything a normalized event produced.
    ///
    /// Returns the number of scheduled jobs. Must be called from within a
    /// Tokio runtime when the delay is non-zero.
    pub fn dispatch(&self, event: NormalizedEvent) -> usize {
        match event {
            // Trust verdicts were merged into the sources during normalization.
            NormalizedEvent::Updates { updates, .. } => {
                let count = updates.len();
                for update in updates {
                    self.schedule(Job::Update(update));
                }
                count
            }
            NormalizedEvent::Rescan(request) => {
                self.schedule(Job::Rescan(request));
                1
            }
            NormalizedEvent::Acknowledge => {
                debug!("Event acknowledged; nothing to dispatch");
                0
            }
            NormalizedEvent::Skip(reason) => {
                debug!(%reason, "Event skipped");
                0
            }
        }
    }

    fn schedule(&self, job: Job) {
        if self.delay.is_zero() {
            job.deliver(self.sink.as_ref());
            return;
        }
        let sink = Arc::clone(&self.sink);
        let delay = self.delay;
        tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                job.deliver(sink.as_ref());
            }
            .in_current_span(),
        );
    }
}
