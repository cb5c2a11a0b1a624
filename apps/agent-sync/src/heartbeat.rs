use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;
use session_bus::{Bus, Subscription, handler};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use upstream_transport::{Upstream, UpstreamMessage, events};

use crate::config::HeartbeatConfig;
use crate::events::{EventBus, LIVENESS_TIMEOUT, SyncEvent};

/// SYN/ACK liveness loop for one connection.
///
/// `start` sends a SYN and arms an ack deadline. Whichever of the ack or
/// the deadline happens first disarms the other and schedules the next SYN
/// after `syn_timeout`; a missed deadline also raises [`LIVENESS_TIMEOUT`].
/// Once started, exactly one of the ack deadline and the deferred restart is
/// armed at any time until [`Heartbeat::stop`].
pub struct Heartbeat {
    inner: Arc<HeartbeatInner>,
}

struct HeartbeatInner {
    connection: String,
    upstream: Arc<dyn Upstream>,
    bus: EventBus,
    syn_timeout: Duration,
    ack_timeout: Duration,
    session: Mutex<LivenessSession>,
}

#[derive(Default)]
struct LivenessSession {
    ack_timer: Option<JoinHandle<()>>,
    syn_timer: Option<JoinHandle<()>>,
    pending_ack: Option<Subscription>,
    syns_sent: u64,
    timeouts: u64,
    stopped: bool,
}

impl Heartbeat {
    pub fn new(
        connection: impl Into<String>,
        upstream: Arc<dyn Upstream>,
        bus: EventBus,
        config: HeartbeatConfig,
    ) -> Self {
        Self {
            inner: Arc::new(HeartbeatInner {
                connection: connection.into(),
                upstream,
                bus,
                syn_timeout: config.syn_timeout(),
                ack_timeout: config.ack_timeout(),
                session: Mutex::new(LivenessSession::default()),
            }),
        }
    }

    pub fn connection(&self) -> &str {
        &self.inner.connection
    }

    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        self.inner.session.lock().stopped = false;
        HeartbeatInner::start(&self.inner);
    }

    /// Schedules the next SYN unless one is already scheduled.
    pub fn defer_start(&self) {
        HeartbeatInner::defer_start(&self.inner);
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub fn is_waiting_for_ack(&self) -> bool {
        self.inner.session.lock().ack_timer.is_some()
    }

    pub fn is_deferred(&self) -> bool {
        self.inner.session.lock().syn_timer.is_some()
    }

    pub fn syns_sent(&self) -> u64 {
        self.inner.session.lock().syns_sent
    }

    pub fn timeouts(&self) -> u64 {
        self.inner.session.lock().timeouts
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl HeartbeatInner {
    fn start(this: &Arc<Self>) {
        let waiter = {
            let weak = Arc::downgrade(this);
            this.upstream.on_upstream(
                events::LIVENESS_ACK,
                handler(move |_msg: &UpstreamMessage, sub: &Subscription| {
                    sub.cancel();
                    if let Some(inner) = weak.upgrade() {
                        HeartbeatInner::on_ack(&inner);
                    }
                }),
            )
        };
        let deadline = {
            let weak: Weak<Self> = Arc::downgrade(this);
            // the deadline is fixed now, not when the task is first polled
            let delay = tokio::time::sleep(this.ack_timeout);
            tokio::spawn(async move {
                delay.await;
                if let Some(inner) = weak.upgrade() {
                    HeartbeatInner::on_deadline(&inner);
                }
            })
        };

        let stale = {
            let mut session = this.session.lock();
            if session.stopped {
                drop(session);
                waiter.cancel();
                deadline.abort();
                return;
            }
            session.syns_sent += 1;
            // an explicit start supersedes a scheduled restart
            let stale_restart = session.syn_timer.take();
            let stale_timer = session.ack_timer.replace(deadline);
            let stale_waiter = session.pending_ack.replace(waiter);
            (stale_timer, stale_restart, stale_waiter)
        };
        for timer in [stale.0, stale.1].into_iter().flatten() {
            timer.abort();
        }
        if let Some(waiter) = stale.2 {
            waiter.cancel();
        }

        // the ack waiter is armed before the SYN leaves so a synchronous
        // ack cannot be missed
        if let Err(err) = this
            .upstream
            .send_upstream(events::LIVENESS_SYN, json!({ "connection": this.connection }))
        {
            warn!(connection = %this.connection, error = %err, "failed to send liveness SYN");
        }
    }

    fn on_ack(this: &Arc<Self>) {
        let (timer, waiter) = {
            let mut session = this.session.lock();
            let Some(waiter) = session.pending_ack.take() else {
                return;
            };
            (session.ack_timer.take(), waiter)
        };
        waiter.cancel();
        if let Some(timer) = timer {
            timer.abort();
        }
        debug!(connection = %this.connection, "liveness ack received");
        Self::defer_start(this);
    }

    fn on_deadline(this: &Arc<Self>) {
        let waiter = {
            let mut session = this.session.lock();
            let Some(waiter) = session.pending_ack.take() else {
                return;
            };
            // this task owns the handle being cleared; dropping it detaches
            session.ack_timer.take();
            session.timeouts += 1;
            waiter
        };
        waiter.cancel();
        warn!(
            connection = %this.connection,
            ack_timeout_ms = this.ack_timeout.as_millis() as u64,
            "liveness ack deadline missed"
        );
        let signal = SyncEvent::LivenessTimeout {
            connection: this.connection.clone(),
        };
        if let Err(err) = this.bus.publish(LIVENESS_TIMEOUT, signal) {
            debug!(connection = %this.connection, error = %err, "liveness timeout not delivered");
        }
        // probing continues whether or not anyone handled the timeout
        Self::defer_start(this);
    }

    fn defer_start(this: &Arc<Self>) {
        let mut session = this.session.lock();
        if session.stopped || session.syn_timer.is_some() {
            return;
        }
        let weak = Arc::downgrade(this);
        let delay = tokio::time::sleep(this.syn_timeout);
        session.syn_timer = Some(tokio::spawn(async move {
            delay.await;
            if let Some(inner) = weak.upgrade() {
                inner.session.lock().syn_timer.take();
                HeartbeatInner::start(&inner);
            }
        }));
    }

    fn stop(&self) {
        let (ack_timer, syn_timer, waiter) = {
            let mut session = self.session.lock();
            session.stopped = true;
            (
                session.ack_timer.take(),
                session.syn_timer.take(),
                session.pending_ack.take(),
            )
        };
        for timer in [ack_timer, syn_timer].into_iter().flatten() {
            timer.abort();
        }
        if let Some(waiter) = waiter {
            waiter.cancel();
        }
    }
}
