use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::stabilizer::StabilizerState;

/// セッション識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 1 被写体の連続フレーム列に対応する状態
pub struct Session {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub state: StabilizerState,
}

/// セッション情報のスナップショット
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub created_at: DateTime<Utc>,
    pub frames_seen: u64,
    pub reset_count: u64,
}

/// エンジンが所有するセッション表
///
/// セッション状態へのアクセスは Mutex で排他。アイドルタイムアウトを
/// 超えたセッションは破棄される。
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub fn create(&self) -> SessionId {
        self.evict_idle();

        let id = SessionId::new();
        let session = Session {
            id,
            created_at: Utc::now(),
            state: StabilizerState::new(),
        };
        self.sessions.write().insert(id, Arc::new(Mutex::new(session)));
        debug!(session = %id, "session created");
        id
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn end(&self, id: &SessionId) -> bool {
        let removed = self.sessions.write().remove(id);
        if let Some(session) = &removed {
            let session = session.lock();
            debug!(
                session = %id,
                created_at = %session.created_at,
                frames = session.state.frames_seen(),
                "session ended"
            );
        }
        removed.is_some()
    }

    pub fn active_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn info(&self, id: &SessionId) -> Option<SessionInfo> {
        self.get(id).map(|session| {
            let session = session.lock();
            SessionInfo {
                id: session.id,
                created_at: session.created_at,
                frames_seen: session.state.frames_seen(),
                reset_count: session.state.reset_count(),
            }
        })
    }

    /// アイドルタイムアウトを超えたセッションを破棄する
    pub fn evict_idle(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, session| session.lock().state.last_active.elapsed() < self.idle_timeout);
        let evicted = before - sessions.len();
        if evicted > 0 {
            debug!(evicted, "idle sessions evicted");
        }
        evicted
    }
}
