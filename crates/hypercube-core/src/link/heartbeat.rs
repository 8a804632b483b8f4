//! Per-link liveness.
//!
//! A repeating tick issues a ping through the caller's pinger and arms a
//! ping-timeout timer when none is pending. Any sign of life from the peer
//! (`on_pong`) cancels that timer; if it fires, the timeout handler runs.

use crate::Result;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Issues one ping. An error counts as a missed pong.
pub type Pinger = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Invoked once per detected timeout. Must not block.
pub type TimeoutHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Timers {
    ticker: Option<JoinHandle<()>>,
    ping_timeout: Option<JoinHandle<()>>,
    closed: bool,
}

struct Inner {
    interval: Duration,
    ping_timeout: Duration,
    pinger: Pinger,
    on_timeout: TimeoutHandler,
    timers: Mutex<Timers>,
}

/// Heartbeat state machine shared between a link's tasks.
#[derive(Clone)]
pub struct HeartbeatMonitor {
    inner: Arc<Inner>,
}

impl HeartbeatMonitor {
    pub fn new(
        interval: Duration,
        ping_timeout: Duration,
        pinger: Pinger,
        on_timeout: TimeoutHandler,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                interval,
                ping_timeout,
                pinger,
                on_timeout,
                timers: Mutex::new(Timers::default()),
            }),
        }
    }

    /// Arm the repeating tick. No-op when already running or closed.
    pub fn start(&self) {
        let mut timers = self.inner.lock();
        if timers.closed || timers.ticker.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.interval;
        timers.ticker = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match weak.upgrade() {
                    Some(inner) => Inner::tick(&inner),
                    None => return,
                }
            }
        }));
    }

    /// Cancel the tick. A pending ping timeout keeps running; only a pong
    /// or `close` clears it.
    pub fn stop(&self) {
        if let Some(handle) = self.inner.lock().ticker.take() {
            handle.abort();
        }
    }

    /// Restart the tick from now. Called after every send.
    pub fn reset(&self) {
        self.stop();
        self.start();
    }

    /// The peer showed it is alive.
    pub fn on_pong(&self) {
        if let Some(handle) = self.inner.lock().ping_timeout.take() {
            handle.abort();
        }
    }

    /// Cancel everything. Idempotent; a closed monitor never restarts.
    pub fn close(&self) {
        let mut timers = self.inner.lock();
        timers.closed = true;
        Inner::cancel(&mut timers);
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().ticker.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl Inner {
    fn lock(&self) -> std::sync::MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(timers: &mut Timers) {
        if let Some(handle) = timers.ticker.take() {
            handle.abort();
        }
        if let Some(handle) = timers.ping_timeout.take() {
            handle.abort();
        }
    }

    fn tick(self: &Arc<Self>) {
        // The ping write runs in its own task so that a reset never cuts a
        // frame in half.
        let ping = (self.pinger)();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            if let Err(e) = ping.await {
                debug!("Heartbeat ping failed: {}", e);
                if let Some(inner) = weak.upgrade() {
                    inner.fire();
                }
            }
        });

        let mut timers = self.lock();
        if timers.closed || timers.ping_timeout.is_some() {
            return;
        }
        let weak: Weak<Inner> = Arc::downgrade(self);
        let wait = self.ping_timeout;
        timers.ping_timeout = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(inner) = weak.upgrade() {
                inner.lock().ping_timeout = None;
                inner.fire();
            }
        }));
    }

    fn fire(&self) {
        if self.lock().closed {
            return;
        }
        (self.on_timeout)();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let timers = self.timers.get_mut().unwrap_or_else(PoisonError::into_inner);
        Inner::cancel(timers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MeshError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counters {
        pings: Arc<AtomicUsize>,
        timeouts: Arc<AtomicUsize>,
    }

    fn monitor(fail_pings: bool) -> (HeartbeatMonitor, Counters) {
        let pings = Arc::new(AtomicUsize::new(0));
        let timeouts = Arc::new(AtomicUsize::new(0));
        let ping_count = pings.clone();
        let timeout_count = timeouts.clone();
        let pinger: Pinger = Arc::new(move || {
            ping_count.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if fail_pings {
                    Err(MeshError::SocketClosed)
                } else {
                    Ok(())
                }
            })
        });
        let on_timeout: TimeoutHandler = Arc::new(move || {
            timeout_count.fetch_add(1, Ordering::SeqCst);
        });
        let monitor = HeartbeatMonitor::new(
            Duration::from_millis(5000),
            Duration::from_millis(15000),
            pinger,
            on_timeout,
        );
        (monitor, Counters { pings, timeouts })
    }

    async fn advance(ms: u64) {
        tokio::time::advance(Duration::from_millis(ms)).await;
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_pong_fires_timeout() {
        let (hb, seen) = monitor(false);
        hb.start();

        advance(5001).await;
        assert_eq!(seen.pings.load(Ordering::SeqCst), 1);

        advance(14000).await;
        assert_eq!(seen.timeouts.load(Ordering::SeqCst), 0);

        advance(1001).await;
        assert_eq!(seen.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_link_alive() {
        let (hb, seen) = monitor(false);
        hb.start();

        for _ in 0..10 {
            advance(5001).await;
            hb.on_pong();
        }

        assert!(seen.pings.load(Ordering::SeqCst) >= 9);
        assert_eq!(seen.timeouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_ping_times_out_immediately() {
        let (hb, seen) = monitor(true);
        hb.start();

        advance(5001).await;
        assert_eq!(seen.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_postpones_ping() {
        let (hb, seen) = monitor(false);
        hb.start();

        advance(4000).await;
        hb.reset();
        advance(4000).await;
        assert_eq!(seen.pings.load(Ordering::SeqCst), 0);

        advance(1001).await;
        assert_eq!(seen.pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_traffic_does_not_hide_a_silent_peer() {
        let (hb, seen) = monitor(false);
        hb.start();

        // The ping at 5s arms the timeout; sends keep postponing the tick.
        advance(5001).await;
        for _ in 0..3 {
            advance(4000).await;
            hb.reset();
        }
        assert_eq!(seen.pings.load(Ordering::SeqCst), 1);
        assert_eq!(seen.timeouts.load(Ordering::SeqCst), 0);

        advance(3000).await;
        assert_eq!(seen.timeouts.load(Ordering::SeqCst), 1);
        assert!(hb.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_monitor_never_restarts() {
        let (hb, seen) = monitor(false);
        hb.start();
        hb.close();
        hb.close();
        hb.start();
        hb.reset();

        assert!(hb.is_closed());
        assert!(!hb.is_running());
        advance(60_000).await;
        assert_eq!(seen.pings.load(Ordering::SeqCst), 0);
        assert_eq!(seen.timeouts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_cancels_pending_timeout() {
        let (hb, seen) = monitor(false);
        hb.start();

        advance(5001).await;
        hb.close();
        advance(30_000).await;

        assert_eq!(seen.timeouts.load(Ordering::SeqCst), 0);
    }
}
