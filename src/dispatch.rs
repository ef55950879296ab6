use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::engine::Engine;
use crate::errors::{FaceReageError, Result};
use crate::frame::{FrameContext, ProcessingResult};
use crate::session::SessionId;
use crate::traits::{AgingModel, IdentityEncoder};

/// 非同期フレーム投入の抽象化
#[async_trait]
pub trait FrameDispatcher: Send + Sync {
    /// フレームをキューに投入し、処理結果を待つ
    async fn submit(&self, context: FrameContext) -> Result<ProcessingResult>;

    /// キューを閉じ、実行中のタスクの完了を待つ
    async fn shutdown(&self);

    fn is_running(&self) -> bool;
}

struct DispatchJob {
    context: FrameContext,
    reply: oneshot::Sender<ProcessingResult>,
}

/// セッション専用の FIFO 実行キュー
///
/// 1 セッション 1 タスクなので、セッション内のフレーム順序は常に
/// 投入順に保たれる。推論呼び出しはこの専用タスク上でブロックする。
pub struct SessionDispatcher {
    tx: mpsc::Sender<DispatchJob>,
    tracker: TaskTracker,
    cancellation_token: CancellationToken,
    session_id: SessionId,
}

impl SessionDispatcher {
    pub fn spawn<M, I>(
        engine: Arc<Engine<M, I>>,
        session_id: SessionId,
        queue_depth: usize,
    ) -> Self
    where
        M: AgingModel + 'static,
        I: IdentityEncoder + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<DispatchJob>(queue_depth.max(1));
        let tracker = TaskTracker::new();
        let cancellation_token = CancellationToken::new();

        let cancel = cancellation_token.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    job = rx.recv() => {
                        let Some(job) = job else { break };
                        let result = engine.process_frame(&session_id, job.context);
                        if job.reply.send(result).is_err() {
                            debug!(session = %session_id, "dispatch result dropped by caller");
                        }
                    }
                }
            }
        });

        Self {
            tx,
            tracker,
            cancellation_token,
            session_id,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }
}

#[async_trait]
impl FrameDispatcher for SessionDispatcher {
    async fn submit(&self, context: FrameContext) -> Result<ProcessingResult> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(DispatchJob {
                context,
                reply: reply_tx,
            })
            .await
            .map_err(|_| FaceReageError::SessionState {
                reason: format!("dispatcher for session {} is shut down", self.session_id),
            })?;

        reply_rx.await.map_err(|_| FaceReageError::SessionState {
            reason: "dispatcher dropped an in-flight frame".to_string(),
        })
    }

    async fn shutdown(&self) {
        self.cancellation_token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn is_running(&self) -> bool {
        !self.tracker.is_closed()
    }
}
