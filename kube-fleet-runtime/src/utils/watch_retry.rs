use backoff::backoff::Backoff;
use futures::{Future, Stream, TryStream};
use pin_project::pin_project;
use std::{
    pin::Pin,
    task::{ready, Context, Poll},
    time::Duration,
};
use tokio::time::{sleep, Instant, Sleep};

/// Paces a watcher stream after it fails
///
/// Every error is passed through, after which the stream is not polled again until the pause chosen
/// by the [`Backoff`] policy is over. Errors matching [`WatchRetry::skip_pause_for`] are recovered
/// from right away. When the policy gives up the stream ends.
///
/// By default the policy starts over after every successful item. With [`WatchRetry::reset_after`]
/// it only starts over once the stream went that long without failing, so a watch that keeps
/// flapping keeps escalating its pauses.
#[pin_project]
pub struct WatchRetry<S: TryStream, B> {
    #[pin]
    stream: S,
    policy: B,
    skip_pause: fn(&S::Error) -> bool,
    reset_after: Option<Duration>,
    last_failure: Option<Instant>,
    #[pin]
    pause: Option<Sleep>,
    exhausted: bool,
}

impl<S: TryStream, B: Backoff> WatchRetry<S, B> {
    /// Wrap `stream`, pausing after failures as `policy` dictates
    #[must_use]
    pub fn new(stream: S, policy: B) -> Self {
        Self {
            stream,
            policy,
            skip_pause: |_| false,
            reset_after: None,
            last_failure: None,
            pause: None,
            exhausted: false,
        }
    }

    /// Recover from errors matching `skip` without pausing
    ///
    /// Meant for errors the watcher handles by doing something else, such as re-listing after its
    /// position expired, rather than by repeating what failed.
    #[must_use]
    pub fn skip_pause_for(mut self, skip: fn(&S::Error) -> bool) -> Self {
        self.skip_pause = skip;
        self
    }

    /// Only start the policy over once the stream has not failed for `healthy`
    #[must_use]
    pub fn reset_after(mut self, healthy: Duration) -> Self {
        self.reset_after = Some(healthy);
        self
    }
}

impl<S: TryStream, B: Backoff> Stream for WatchRetry<S, B> {
    type Item = Result<S::Ok, S::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.exhausted {
            return Poll::Ready(None);
        }
        if let Some(pause) = this.pause.as_mut().as_pin_mut() {
            ready!(pause.poll(cx));
            tracing::debug!("pause over, resuming watch");
            this.pause.set(None);
        }

        let item = ready!(this.stream.try_poll_next(cx));
        match &item {
            Some(Err(err)) if (this.skip_pause)(err) => {
                tracing::debug!("recovering from watch error without pausing");
            }
            Some(Err(_)) => {
                let now = Instant::now();
                if let (Some(healthy), Some(last)) = (*this.reset_after, *this.last_failure) {
                    if now.saturating_duration_since(last) >= healthy {
                        tracing::debug!(?healthy, "watch was healthy for a while, starting retries over");
                        this.policy.reset();
                    }
                }
                *this.last_failure = Some(now);
                match this.policy.next_backoff() {
                    Some(delay) => {
                        tracing::debug!(?delay, "watch failed, pausing");
                        this.pause.set(Some(sleep(delay)));
                    }
                    None => {
                        tracing::debug!("retry policy exhausted, closing watch");
                        *this.exhausted = true;
                    }
                }
            }
            Some(Ok(_)) if this.reset_after.is_none() => this.policy.reset(),
            Some(Ok(_)) | None => {}
        }
        Poll::Ready(item)
    }
}
