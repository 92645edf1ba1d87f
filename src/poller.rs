//! Live data acquisition tasks.
//!
//! Once a session reaches [`SessionState::Polling`], one background task
//! owns the live characteristics: either a fixed-cadence read loop or a
//! notification stream, per [`AcquisitionMode`]. Every sample is checked
//! against the link generation before it is staged, and again before a
//! snapshot is published.
//!
//! [`SessionState::Polling`]: crate::session::SessionState::Polling

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace, warn};

use crate::codec;
use crate::config::AcquisitionMode;
use crate::endpoint::{CodecKind, EndpointDescriptor};
use crate::error::Error;
use crate::session::Shared;
use crate::transport::Transport;

/// Spawn the acquisition task for the given link generation.
pub(crate) fn spawn<T: Transport>(shared: Arc<Shared<T>>, generation: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        match shared.config.acquisition {
            AcquisitionMode::Poll => poll_loop(shared, generation).await,
            AcquisitionMode::Notify => notify_loop(shared, generation).await,
        }
    })
}

/// Read every live endpoint once per poll period and publish a snapshot
/// after each complete cycle.
async fn poll_loop<T: Transport>(shared: Arc<Shared<T>>, generation: u64) {
    let endpoints: Vec<EndpointDescriptor> =
        shared.registry.live_endpoints().copied().collect();
    if endpoints.is_empty() {
        warn!("No live endpoints to poll");
        return;
    }
    debug!(
        "Polling {} endpoints every {:?}",
        endpoints.len(),
        shared.config.poll_period
    );

    let mut ticker = tokio::time::interval(shared.config.poll_period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !run_cycle(&shared, generation, &endpoints).await {
            break;
        }
    }
    debug!("Acquisition task ended");
}

/// Run one poll cycle. Returns `false` once the task should stop.
async fn run_cycle<T: Transport>(
    shared: &Shared<T>,
    generation: u64,
    endpoints: &[EndpointDescriptor],
) -> bool {
    for descriptor in endpoints {
        if !shared.is_generation_live(generation) {
            trace!("Cycle abandoned, link generation moved on");
            return false;
        }
        let data = match shared
            .transport
            .read(descriptor.service, descriptor.characteristic)
            .await
        {
            Ok(data) => data,
            Err(error) => {
                error!("Live read of {} failed: {}", descriptor.signal, error);
                shared
                    .fail_from_poller(Error::PollReadFailed {
                        signal: descriptor.signal,
                        reason: error.to_string(),
                    })
                    .await;
                return false;
            }
        };
        stage_sample(shared, generation, descriptor, &data);
    }
    publish(shared, generation)
}

/// Subscribe to every live endpoint and publish a snapshot per event.
async fn notify_loop<T: Transport>(shared: Arc<Shared<T>>, generation: u64) {
    let endpoints: Vec<EndpointDescriptor> =
        shared.registry.live_endpoints().copied().collect();
    if endpoints.is_empty() {
        warn!("No live endpoints to stream");
        return;
    }

    // Take the receiver before subscribing so no notification can slip
    // between the two.
    let mut notifications = shared.transport.notifications();
    for descriptor in &endpoints {
        if !shared.is_generation_live(generation) {
            return;
        }
        if let Err(error) = shared
            .transport
            .subscribe(descriptor.service, descriptor.characteristic)
            .await
        {
            error!("Failed to subscribe to {}: {}", descriptor.signal, error);
            shared
                .fail_from_poller(Error::PollReadFailed {
                    signal: descriptor.signal,
                    reason: error.to_string(),
                })
                .await;
            return;
        }
        debug!("Subscribed to {}", descriptor.signal);
    }

    loop {
        let notification = match notifications.recv().await {
            Ok(notification) => notification,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Notification stream lagged, {} dropped", missed);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        if !shared.is_generation_live(generation) {
            break;
        }
        let Some(descriptor) = shared
            .registry
            .by_characteristic(notification.characteristic)
        else {
            trace!(
                "Notification from unknown characteristic {}",
                notification.characteristic
            );
            continue;
        };
        if !descriptor.signal.is_live() {
            continue;
        }
        stage_sample(&shared, generation, descriptor, &notification.data);
        if !publish(&shared, generation) {
            break;
        }
    }
    debug!("Streaming task ended");
}

/// Decode one live sample and stage it if the generation still matches.
fn stage_sample<T: Transport>(
    shared: &Shared<T>,
    generation: u64,
    descriptor: &EndpointDescriptor,
    data: &[u8],
) {
    let value = match descriptor.codec {
        CodecKind::Float32Le => match codec::decode_float32_le(data) {
            Ok(value) => value,
            Err(error) => {
                // A short payload means no sample this cycle, not a dead
                // link. The previous reading stays.
                warn!("Discarding {} sample: {}", descriptor.signal, error);
                return;
            }
        },
        other => {
            trace!("No live decode rule for {:?} on {}", other, descriptor.signal);
            return;
        }
    };
    let mut inner = shared.inner.lock();
    if inner.generation != generation {
        return;
    }
    inner.staged.set_value(descriptor.signal, value);
    trace!("{} = {}", descriptor.signal, value);
}

/// Publish the staged snapshot. Returns `false` if the link moved on.
fn publish<T: Transport>(shared: &Shared<T>, generation: u64) -> bool {
    let snapshot = {
        let mut inner = shared.inner.lock();
        if inner.generation != generation || !inner.state.has_link() {
            trace!("Dropping snapshot for a stale link");
            return false;
        }
        inner.staged.captured_at = Utc::now();
        let snapshot = inner.staged.clone();
        inner.last_published = Some(snapshot.clone());
        snapshot
    };
    let _ = shared.snapshot_tx.send(snapshot);
    true
}
