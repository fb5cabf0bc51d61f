//! Cancellable wait primitives.
//!
//! Every primitive has the same shape: it takes a [`CancellationToken`], settles with
//! `Ok(())` when its condition holds, and fails with [`Error::Cancelled`] once the
//! token fires. They compose through [`on_first_of`], and any of them can gate a
//! queued service (see [`crate::queue::Predecessor::wait`]).

use crate::host::{ActivityBus, ActivityKind, Clock, IdleScheduler};
use crate::idle::{observe_idle, IdleConfig};
use crate::{Error, ErrorContext, Result};
use futures::future::{self, BoxFuture, FutureExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

pub type WaitFuture = BoxFuture<'static, Result<()>>;

/// A wait that has not started yet; it receives the token it must honor.
pub type WaitTask = Box<dyn FnOnce(CancellationToken) -> WaitFuture + Send>;

/// Box a closure into a [`WaitTask`].
pub fn task<F, Fut>(f: F) -> WaitTask
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Box::new(move |token| f(token).boxed())
}

/// Resolve after `duration`. The timer is dropped as soon as the token fires.
pub async fn after_duration(
    clock: &dyn Clock,
    duration: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        _ = clock.sleep(duration) => Ok(()),
    }
}

/// Race `tasks`; settle with whichever settles first.
///
/// Without an external token the race owns a private one, hands it to every task and
/// cancels it once the race is decided, so the losers are told to stop. An external
/// token is passed through as is and is never cancelled here.
///
/// An empty race settles immediately.
pub async fn on_first_of(tasks: Vec<WaitTask>, external: Option<CancellationToken>) -> Result<()> {
    if tasks.is_empty() {
        return Ok(());
    }

    let (token, _guard) = match external {
        Some(token) => (token, None),
        None => {
            let token = CancellationToken::new();
            let guard = token.clone().drop_guard();
            (token, Some(guard))
        }
    };

    let racers: Vec<WaitFuture> = tasks.into_iter().map(|t| t(token.clone())).collect();
    let (outcome, _index, _losers) = future::select_all(racers).await;
    outcome
}

/// Resolve on the first key press, pointer move, pointer down or wheel event.
///
/// One listener per event kind; each is removed when the race settles or is cancelled.
pub async fn on_user_activity(
    activity: &ActivityBus,
    cancel: Option<CancellationToken>,
) -> Result<()> {
    let tasks = ActivityKind::USER_ACTIVITY
        .iter()
        .map(|&kind| listen_for(activity, kind))
        .collect();
    on_first_of(tasks, cancel).await
}

fn listen_for(activity: &ActivityBus, kind: ActivityKind) -> WaitTask {
    // Subscribe now so events emitted before the first poll are not missed.
    let mut rx = activity.subscribe();
    task(move |cancel: CancellationToken| async move {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                event = rx.recv() => match event {
                    Ok(seen) if seen == kind => return Ok(()),
                    Ok(_) | Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => {
                        return Err(Error::runtime_with_context(
                            "activity source closed",
                            ErrorContext::new().with_source("on_user_activity"),
                        ))
                    }
                },
            }
        }
    })
}

/// Resolve once the page is idle (see [`crate::idle`]).
pub async fn on_idle(
    scheduler: &dyn IdleScheduler,
    clock: &dyn Clock,
    config: IdleConfig,
    cancel: CancellationToken,
) -> Result<()> {
    observe_idle(scheduler, clock, config, &cancel).await.map(|_| ())
}

/// [`WaitTask`] for [`after_duration`].
pub fn duration_task(clock: Arc<dyn Clock>, duration: Duration) -> WaitTask {
    task(move |cancel| async move { after_duration(clock.as_ref(), duration, cancel).await })
}

/// [`WaitTask`] for [`on_idle`].
pub fn idle_task(
    scheduler: Arc<dyn IdleScheduler>,
    clock: Arc<dyn Clock>,
    config: IdleConfig,
) -> WaitTask {
    task(move |cancel| async move {
        on_idle(scheduler.as_ref(), clock.as_ref(), config, cancel).await
    })
}

/// [`WaitTask`] for [`on_user_activity`]; the race inside shares the caller's token.
pub fn user_activity_task(activity: ActivityBus) -> WaitTask {
    task(move |cancel| async move { on_user_activity(&activity, Some(cancel)).await })
}
