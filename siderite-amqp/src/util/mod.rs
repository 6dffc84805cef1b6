//! Common utilities

use std::io;
use std::pin::Pin;
use std::task::Poll;
use std::time::Duration;

use futures_util::Future;
use tokio::time::{Instant, Sleep};

#[derive(Debug)]
pub(crate) enum Running {
    Continue,
    Stop,
}

/// A resettable deadline used to detect a silent peer
#[derive(Debug)]
pub(crate) struct IdleTimeout {
    delay: Pin<Box<Sleep>>,
    duration: Duration,
}

impl IdleTimeout {
    pub fn new(duration: Duration) -> Self {
        let delay = Box::pin(tokio::time::sleep(duration));
        Self { delay, duration }
    }

    pub fn reset(&mut self) {
        let next = Instant::now() + self.duration;
        self.delay.as_mut().reset(next);
    }
}

impl Future for IdleTimeout {
    type Output = io::Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        let delay = Pin::new(&mut self.delay);
        delay.poll(cx).map(Ok)
    }
}
