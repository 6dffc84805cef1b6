//! Asynchronous heartbeat timers
//!
//! Both heartbeat timers (the writer and the liveness monitor) tick at a
//! quarter of the negotiated interval. A [`HeartBeat`] built with
//! [`never`](HeartBeat::never) parks forever, which keeps the engine's
//! select arms uniform when heartbeats were negotiated off.

use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use tokio::time::{Interval, MissedTickBehavior};

/// A stream of heartbeat ticks, or silence when disabled
#[derive(Debug)]
pub(crate) struct HeartBeat {
    interval: Option<Interval>,
}

impl HeartBeat {
    /// A heartbeat that never ticks
    pub fn never() -> Self {
        Self { interval: None }
    }

    /// A heartbeat ticking at a quarter of the given interval
    pub fn quartered(heartbeat: Duration) -> Self {
        let mut interval = tokio::time::interval(heartbeat / 4);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            interval: Some(interval),
        }
    }
}

impl Stream for HeartBeat {
    type Item = ();

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        match &mut self.interval {
            Some(interval) => interval.poll_tick(cx).map(|_| Some(())),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn quartered_ticks_at_a_quarter_interval() {
        let mut heartbeat = HeartBeat::quartered(Duration::from_secs(8));
        // the first tick of a tokio interval completes immediately
        heartbeat.next().await;

        let started = tokio::time::Instant::now();
        heartbeat.next().await;
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn never_parks_forever() {
        let mut heartbeat = HeartBeat::never();
        let outcome =
            tokio::time::timeout(Duration::from_secs(3600), heartbeat.next()).await;
        assert!(outcome.is_err());
    }
}
