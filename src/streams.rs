//! The stream multiplexer: long-lived HTTP byte streams carrying bus
//! payloads to a single subscriber each.
//!
//! Per connection two tasks cooperate around one shared [`CancellationToken`]:
//! the forwarder copies bus payloads into the response body, the heartbeat
//! writes `{"type":"heartbeat"}` every 30 seconds. Whichever of the two
//! notices the peer is gone cancels the token; the other observes it and
//! stops, and the subscription drops with the forwarder. An index of
//! `(kind, user) -> tokens` lets an admin kick every stream a user holds,
//! and process shutdown cancels the root token all stream tokens are
//! children of.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::mpsc;
use futures::SinkExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Bytes, Frame};
use log::{debug, info, warn};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::entity::{QueueKind, UserId};
use crate::msg::{MessageBus, Topic};
use crate::payloads::{EventMsg, RECORD_SEPARATOR};

/// Heartbeat cadence on every open stream.
const HEARTBEAT_PERIOD: Duration = Duration::from_secs(30);
/// The greeting notice is published this long after subscription, so the
/// subscriber is guaranteed at least one early message on the channel.
const GREETING_DELAY: Duration = Duration::from_millis(200);
/// In-flight frames buffered towards the transport.
const BODY_BUFFER: usize = 16;

type BodySender = mpsc::Sender<Result<Frame<Bytes>, Infallible>>;
type StopIndex = Arc<Mutex<HashMap<(QueueKind, UserId), Vec<(u64, CancellationToken)>>>>;

/// Owner of every live streaming connection.
pub struct StreamHub {
    bus: Arc<MessageBus>,
    index: StopIndex,
    root: CancellationToken,
    next_entry: AtomicU64,
    heartbeat_period: Duration,
}

impl StreamHub {
    #[must_use]
    pub fn new(bus: Arc<MessageBus>) -> Self {
        StreamHub {
            bus,
            index: Arc::new(Mutex::new(HashMap::new())),
            root: CancellationToken::new(),
            next_entry: AtomicU64::new(0),
            heartbeat_period: HEARTBEAT_PERIOD,
        }
    }

    /// Same hub with a faster heartbeat, for tests.
    #[cfg(test)]
    fn with_heartbeat(bus: Arc<MessageBus>, period: Duration) -> Self {
        let mut hub = StreamHub::new(bus);
        hub.heartbeat_period = period;
        hub
    }

    /// Open one streaming response body fed from `topic`, registered under
    /// `(kind, userid)` for administrative kicks.
    #[must_use]
    pub fn open_stream(&self, kind: QueueKind, userid: UserId, topic: Topic) -> BoxBody<Bytes, Infallible> {
        let stop = self.root.child_token();
        let entry = self.next_entry.fetch_add(1, Ordering::Relaxed);
        self
            .index
            .lock()
            .unwrap()
            .entry((kind, userid))
            .or_default()
            .push((entry, stop.clone()));

        info!("New subscription to {topic}");
        let subscription = self.bus.subscribe(&topic);

        // Greeting, so the subscriber can confirm the channel works.
        let bus = self.bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(GREETING_DELAY).await;
            bus.send(
                &topic,
                &EventMsg::ServerNotice {
                    notice: format!("subed to {topic}"),
                },
            );
        });

        let (body_tx, body_rx) = mpsc::channel(BODY_BUFFER);
        tokio::spawn(forwarder(topic, subscription, body_tx.clone(), stop.clone()));
        tokio::spawn(heartbeat(body_tx, stop.clone(), self.heartbeat_period));

        // Bookkeeping: when the stop signal fires, drop this stream from the
        // kick index.
        let index = self.index.clone();
        let watcher = stop.clone();
        tokio::spawn(async move {
            watcher.cancelled().await;
            let mut index = index.lock().unwrap();
            if let Some(entries) = index.get_mut(&(kind, userid)) {
                entries.retain(|(id, _)| *id != entry);
                if entries.is_empty() {
                    index.remove(&(kind, userid));
                }
            }
            debug!("Subscription to {topic} over");
        });

        StreamBody::new(body_rx).boxed()
    }

    /// Cancel every stream of `kind` held by `userid`. Returns how many were
    /// signalled.
    pub fn kick(&self, kind: QueueKind, userid: UserId) -> usize {
        let tokens: Vec<CancellationToken> = self
            .index
            .lock()
            .unwrap()
            .get(&(kind, userid))
            .map(|entries| entries.iter().map(|(_, t)| t.clone()).collect())
            .unwrap_or_default();
        info!("Kicking user {userid} from {} {kind} stream(s)", tokens.len());
        for token in &tokens {
            token.cancel();
        }
        tokens.len()
    }

    /// Live streams currently registered for `(kind, userid)`.
    #[must_use]
    pub fn active_streams(&self, kind: QueueKind, userid: UserId) -> usize {
        self.index.lock().unwrap().get(&(kind, userid)).map_or(0, Vec::len)
    }

    /// Cancel every stream in the process. Called once on shutdown.
    pub fn shutdown_all(&self) {
        info!("Closing all streaming connections...");
        self.root.cancel();
    }
}

fn framed(payload: &[u8]) -> Frame<Bytes> {
    let mut buf = Vec::with_capacity(payload.len() + 1);
    buf.extend_from_slice(payload);
    buf.push(RECORD_SEPARATOR);
    Frame::data(Bytes::from(buf))
}

/// Copy bus payloads into the response body until the stop signal fires or
/// the transport goes away.
async fn forwarder(
    topic: Topic,
    mut subscription: broadcast::Receiver<Bytes>,
    mut body: BodySender,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            received = subscription.recv() => match received {
                Ok(payload) => {
                    debug!("Send message from {topic} to subscriber");
                    if body.send(Ok(framed(&payload))).await.is_err() {
                        debug!("Transport for {topic} closed");
                        stop.cancel();
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Subscriber of {topic} lagged, {missed} message(s) dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    stop.cancel();
                    break;
                }
            },
        }
    }
}

/// Write a heartbeat on a fixed cadence until the stop signal fires or the
/// transport goes away.
async fn heartbeat(mut body: BodySender, stop: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await; // the first tick fires immediately
    loop {
        tokio::select! {
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                if body.send(Ok(framed(EventMsg::Heartbeat.to_json().as_bytes()))).await.is_err() {
                    stop.cancel();
                    break;
                }
            }
        }
    }
}
