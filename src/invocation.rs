//! Correlates outbound requests to inbound responses on a shared channel
//! (spec §4.2, C2).
//!
//! A single [`Channel`] carries traffic for many concurrent invocations
//! multiplexed by `request_id`. Whatever reads frames off the wire calls
//! [`InvocationTracker::complete`] once per received message; whatever
//! issues a request calls [`InvocationTracker::invoke`] and awaits the
//! returned future.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, Ordering};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::codec::Message;
use crate::engine::Channel;
use crate::error::CoreError;

type Pending = HashMap<u16, oneshot::Sender<Result<Bytes, CoreError>>>;

/// Tracks in-flight requests on one channel and resolves each one exactly
/// once, either with the peer's response or with a transport/channel-closed
/// error.
pub struct InvocationTracker {
    next_id: AtomicU16,
    pending: Mutex<Pending>,
}

impl InvocationTracker {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU16::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a fresh request id, wrapping past `u16::MAX` back to `1`
    /// (`0` is reserved as "no correlation").
    fn allocate_id(&self) -> u16 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Stamps `request` with a freshly allocated request id, sends it on
    /// `channel`, and returns the peer's eventual response.
    ///
    /// The id allocated here is written into `request.request_id` before
    /// encoding, so the wire frame's own header always matches the id the
    /// tracker correlates the response against.
    ///
    /// # Errors
    /// Returns [`CoreError::FailedToSend`] if the channel rejects the send,
    /// or [`CoreError::ChannelClosed`] if the tracker is closed (e.g. by
    /// channel teardown) before a response arrives.
    pub async fn invoke(&self, channel: &dyn Channel, mut request: Message) -> Result<Bytes, CoreError> {
        let request_id = self.allocate_id();
        request.request_id = request_id;
        let frame = request.encode();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(request_id, tx);

        if let Err(err) = channel.send(request_id, frame).await {
            self.pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .remove(&request_id);
            return Err(err);
        }

        rx.await.unwrap_or(Err(CoreError::ChannelClosed))
    }

    /// Resolves the pending invocation for `request_id` with `result`.
    ///
    /// Silently drops the result if no invocation is waiting under this id
    /// (a late or duplicate response).
    pub fn complete(&self, request_id: u16, result: Result<Bytes, CoreError>) {
        if let Some(tx) = self
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&request_id)
        {
            let _ = tx.send(result);
        }
    }

    /// Resolves every still-pending invocation with [`CoreError::ChannelClosed`].
    ///
    /// Called when the underlying channel is torn down so no caller is left
    /// waiting forever.
    pub fn close(&self) {
        let pending = std::mem::take(
            &mut *self
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        );
        for (_, tx) in pending {
            let _ = tx.send(Err(CoreError::ChannelClosed));
        }
    }
}

impl Default for InvocationTracker {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
impl InvocationTracker {
    pub(crate) fn pending_ids_for_test(&self) -> Vec<u16> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use url::Url;

    use super::*;

    struct RecordingChannel {
        sent: Mutex<Vec<(u16, Bytes)>>,
        fail: bool,
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        async fn send(&self, request_id: u16, frame: Bytes) -> Result<(), CoreError> {
            if self.fail {
                return Err(CoreError::FailedToSend("boom".to_owned()));
            }
            self.sent
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push((request_id, frame));
            Ok(())
        }

        fn peer_identity_id(&self) -> u32 { 0 }

        fn location(&self) -> &Url {
            static URL: std::sync::OnceLock<Url> = std::sync::OnceLock::new();
            URL.get_or_init(|| Url::parse("remote+test://peer").expect("valid url"))
        }
    }

    #[tokio::test]
    async fn invoke_resolves_once_complete_is_called() {
        let tracker = Arc::new(InvocationTracker::new());
        let channel = RecordingChannel {
            sent: Mutex::new(Vec::new()),
            fail: false,
        };

        let tracker_clone = Arc::clone(&tracker);
        let responder = tokio::spawn(async move {
            loop {
                let id = {
                    let guard = tracker_clone
                        .pending
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    guard.keys().next().copied()
                };
                if let Some(id) = id {
                    tracker_clone.complete(id, Ok(Bytes::from_static(b"pong")));
                    break;
                }
                tokio::task::yield_now().await;
            }
        });

        let response = tracker
            .invoke(&channel, Message::new(0, 1))
            .await
            .expect("response");
        assert_eq!(response, Bytes::from_static(b"pong"));
        responder.await.expect("responder task");
    }

    #[tokio::test]
    async fn invoke_stamps_the_allocated_request_id_into_the_encoded_frame() {
        let tracker = Arc::new(InvocationTracker::new());
        let channel = RecordingChannel {
            sent: Mutex::new(Vec::new()),
            fail: false,
        };

        let tracker_clone = Arc::clone(&tracker);
        let responder = tokio::spawn(async move {
            loop {
                let id = {
                    let guard = tracker_clone
                        .pending
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    guard.keys().next().copied()
                };
                if let Some(id) = id {
                    tracker_clone.complete(id, Ok(Bytes::new()));
                    break;
                }
                tokio::task::yield_now().await;
            }
        });

        // request_id 0 is a placeholder; invoke() must overwrite it with the
        // id it actually allocated before the frame is encoded and sent.
        tracker.invoke(&channel, Message::new(0, 7)).await.expect("response");
        responder.await.expect("responder task");

        let (sent_id, frame) = channel
            .sent
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .first()
            .cloned()
            .expect("one frame sent");
        let decoded = Message::decode(&frame).expect("valid frame");
        assert_eq!(decoded.request_id, sent_id);
        assert_ne!(sent_id, 0, "tracker never allocates id 0");
    }

    #[tokio::test]
    async fn invoke_propagates_send_failure_without_leaking_pending_entry() {
        let tracker = InvocationTracker::new();
        let channel = RecordingChannel {
            sent: Mutex::new(Vec::new()),
            fail: true,
        };

        let err = tracker
            .invoke(&channel, Message::new(0, 1))
            .await
            .expect_err("send should fail");
        assert!(matches!(err, CoreError::FailedToSend(_)));
        assert!(
            tracker
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .is_empty()
        );
    }

    #[tokio::test]
    async fn close_resolves_pending_invocations_with_channel_closed() {
        let tracker = Arc::new(InvocationTracker::new());
        let channel = RecordingChannel {
            sent: Mutex::new(Vec::new()),
            fail: false,
        };

        let tracker_clone = Arc::clone(&tracker);
        let invoker = tokio::spawn(async move { tracker_clone.invoke(&channel, Message::new(0, 1)).await });

        loop {
            let has_pending = !tracker
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .is_empty();
            if has_pending {
                break;
            }
            tokio::task::yield_now().await;
        }
        tracker.close();

        let err = invoker.await.expect("task").expect_err("closed");
        assert!(matches!(err, CoreError::ChannelClosed));
    }
}
