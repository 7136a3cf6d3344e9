//! End-to-end exercises of a remote transaction against a scripted peer.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use url::Url;
use xatx::codec::{self, Message, Param};
use xatx::engine::Channel;
use xatx::error::CoreError;
use xatx::invocation::InvocationTracker;
use xatx::remote_tx::{RemoteTransactionHandle, Status};

/// A channel whose peer replies according to a fixed script, keyed by the
/// opcode of the request it receives.
struct ScriptedPeer {
    tracker: std::sync::Weak<InvocationTracker>,
    script: std::sync::Mutex<Vec<(u8, Message)>>,
}

#[async_trait]
impl Channel for ScriptedPeer {
    async fn send(&self, request_id: u16, frame: Bytes) -> Result<(), CoreError> {
        let request = Message::decode(&frame)?;
        let mut script = self.script.lock().expect("lock");
        let index = script.iter().position(|(opcode, _)| *opcode == request.opcode);
        let (_, mut response) = index.map_or_else(
            || (request.opcode, Message::new(request_id, request.opcode)),
            |i| script.remove(i),
        );
        response.request_id = request_id;
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.complete(request_id, Ok(response.encode()));
        }
        Ok(())
    }

    fn peer_identity_id(&self) -> u32 { 0 }

    fn location(&self) -> &Url {
        static URL: std::sync::OnceLock<Url> = std::sync::OnceLock::new();
        URL.get_or_init(|| Url::parse("remote+test://peer").expect("valid url"))
    }
}

fn handle_with_script(script: Vec<(u8, Message)>) -> Arc<RemoteTransactionHandle> {
    let tracker = Arc::new(InvocationTracker::new());
    let channel: Arc<dyn Channel> = Arc::new(ScriptedPeer {
        tracker: Arc::downgrade(&tracker),
        script: std::sync::Mutex::new(script),
    });
    Arc::new(RemoteTransactionHandle::new(channel, tracker))
}

#[tokio::test]
async fn happy_path_begin_then_commit() {
    let handle = handle_with_script(vec![
        (
            codec::M_UT_BEGIN,
            Message::new(0, codec::M_RESP_UT_BEGIN)
                .with_param(Param { id: codec::P_TXN_CONTEXT, data: Bytes::from_static(b"ctx-1") }),
        ),
        (codec::M_UT_COMMIT, Message::new(0, codec::M_RESP_UT_COMMIT)),
    ]);
    let cancel = CancellationToken::new();

    handle.begin(60, &cancel).await.expect("begin succeeds");
    assert_eq!(handle.status(), Status::Active);

    handle.commit(&cancel).await.expect("commit succeeds");
    assert_eq!(handle.status(), Status::Committed);
}

#[tokio::test]
async fn peer_rollback_during_commit_is_reported_and_leaves_handle_rolled_back() {
    let handle = handle_with_script(vec![
        (
            codec::M_UT_BEGIN,
            Message::new(0, codec::M_RESP_UT_BEGIN)
                .with_param(Param { id: codec::P_TXN_CONTEXT, data: Bytes::from_static(b"ctx-2") }),
        ),
        (
            codec::M_UT_COMMIT,
            Message::new(0, codec::M_RESP_UT_COMMIT)
                .with_param(Param::marker(codec::P_UT_RB_EXC)),
        ),
    ]);
    let cancel = CancellationToken::new();

    handle.begin(60, &cancel).await.expect("begin succeeds");
    let err = handle.commit(&cancel).await.expect_err("peer rolled back");
    assert!(matches!(err, CoreError::TransactionRolledBackByPeer));
    assert_eq!(handle.status(), Status::RolledBack);
}

#[tokio::test]
async fn rollback_only_commit_rolls_back_and_reports_rollback_exception() {
    let handle = handle_with_script(vec![
        (
            codec::M_UT_BEGIN,
            Message::new(0, codec::M_RESP_UT_BEGIN)
                .with_param(Param { id: codec::P_TXN_CONTEXT, data: Bytes::from_static(b"ctx-3") }),
        ),
        (codec::M_UT_ROLLBACK, Message::new(0, codec::M_RESP_UT_ROLLBACK)),
    ]);
    let cancel = CancellationToken::new();

    handle.begin(60, &cancel).await.expect("begin succeeds");
    handle.set_rollback_only().expect("mark rollback-only");

    let err = handle.commit(&cancel).await.expect_err("marked rollback-only");
    assert!(matches!(err, CoreError::RollbackException));
    assert_eq!(handle.status(), Status::RolledBack);
}

#[tokio::test]
async fn interrupted_begin_leaves_status_unknown() {
    let handle = handle_with_script(Vec::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = handle.begin(60, &cancel).await.expect_err("cancelled");
    assert!(matches!(err, CoreError::OperationInterrupted));
    assert_eq!(handle.status(), Status::Unknown);
}
