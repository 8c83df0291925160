//! 会话注册表
//!
//! 每个会话持有：对话状态（放在 tokio Mutex 中，兼作“同一会话同一时刻只有一个轮次”的串行槽）、
//! 事件订阅者列表、创建与最后活跃时间。首次使用时创建；空闲超时且无进行中的轮次、无订阅者时被后台清理任务回收。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::memory::ConversationState;
use crate::planner::PlannerEvent;

/// 会话 ID
pub type SessionId = String;

/// 串行槽：持锁者即当前轮次
pub type SessionSlot = Arc<Mutex<ConversationState>>;

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<PlannerEvent>,
}

struct SessionEntry {
    created_at: Instant,
    last_active: Instant,
    state: SessionSlot,
    subscribers: Vec<Subscriber>,
}

impl SessionEntry {
    fn new(id: &str) -> Self {
        let now = Instant::now();
        Self {
            created_at: now,
            last_active: now,
            state: Arc::new(Mutex::new(ConversationState::new(id))),
            subscribers: Vec::new(),
        }
    }

    /// 空闲：无订阅者、无人持有或等待串行槽、超过空闲窗口
    fn is_idle(&self, idle_timeout: Duration, now: Instant) -> bool {
        self.subscribers.is_empty()
            && Arc::strong_count(&self.state) == 1
            && self.state.try_lock().is_ok()
            && now.saturating_duration_since(self.last_active) >= idle_timeout
    }
}

/// 会话快照（日志与测试使用）
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub age: Duration,
    pub idle_for: Duration,
    pub subscribers: usize,
}

/// 会话注册表
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    next_subscriber_id: AtomicU64,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(1),
            idle_timeout,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 获取或创建会话，返回其串行槽，并刷新活跃时间
    pub fn get_or_create(&self, session_id: &str) -> SessionSlot {
        let mut sessions = self.write();
        let entry = sessions.entry(session_id.to_string()).or_insert_with(|| {
            tracing::debug!(session_id = %session_id, "session created");
            SessionEntry::new(session_id)
        });
        entry.last_active = Instant::now();
        entry.state.clone()
    }

    pub fn touch(&self, session_id: &str) {
        if let Some(entry) = self.write().get_mut(session_id) {
            entry.last_active = Instant::now();
        }
    }

    /// 清空会话的对话状态与动作日志；会话不存在时返回 false。
    /// 若有轮次在执行，等待其结束后再清空。
    pub async fn reset(&self, session_id: &str) -> bool {
        let slot = match self.read().get(session_id) {
            Some(entry) => entry.state.clone(),
            None => return false,
        };
        slot.lock().await.reset();
        self.touch(session_id);
        tracing::info!(session_id = %session_id, "session reset");
        true
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.read().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn info(&self, session_id: &str) -> Option<SessionInfo> {
        let now = Instant::now();
        self.read().get(session_id).map(|e| SessionInfo {
            id: session_id.to_string(),
            age: now.saturating_duration_since(e.created_at),
            idle_for: now.saturating_duration_since(e.last_active),
            subscribers: e.subscribers.len(),
        })
    }

    /// 注册订阅者（会话不存在时创建）；返回订阅者 id 与接收端
    pub fn add_subscriber(&self, session_id: &str) -> (u64, mpsc::UnboundedReceiver<PlannerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let mut sessions = self.write();
        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry::new(session_id));
        entry.subscribers.push(Subscriber { id, tx });
        entry.last_active = Instant::now();
        tracing::debug!(session_id = %session_id, subscriber = id, "subscriber added");
        (id, rx)
    }

    pub fn remove_subscriber(&self, session_id: &str, subscriber_id: u64) {
        if let Some(entry) = self.write().get_mut(session_id) {
            entry.subscribers.retain(|s| s.id != subscriber_id);
            entry.last_active = Instant::now();
            tracing::debug!(session_id = %session_id, subscriber = subscriber_id, "subscriber removed");
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.read().get(session_id).map(|e| e.subscribers.len()).unwrap_or(0)
    }

    /// 向会话的全部订阅者投递事件；发送失败（接收端已关闭）的订阅者被移除。返回成功投递数。
    /// 整个投递过程持有写锁，保证同一会话的发布顺序。
    pub fn broadcast(&self, session_id: &str, event: &PlannerEvent) -> usize {
        let mut sessions = self.write();
        let Some(entry) = sessions.get_mut(session_id) else {
            return 0;
        };
        entry.subscribers.retain(|s| s.tx.send(event.clone()).is_ok());
        entry.subscribers.len()
    }

    /// 回收空闲会话，返回被回收的 id
    pub fn evict_idle(&self) -> Vec<SessionId> {
        let now = Instant::now();
        let mut sessions = self.write();
        let expired: Vec<SessionId> = sessions
            .iter()
            .filter(|(_, e)| e.is_idle(self.idle_timeout, now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired
    }

    /// 启动后台清理任务；token 取消时退出
    pub fn spawn_eviction_loop(
        self: &Arc<Self>,
        sweep_interval: Duration,
        token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(sweep_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = timer.tick() => {
                        let evicted = registry.evict_idle();
                        if !evicted.is_empty() {
                            tracing::info!("Evicted {} idle sessions", evicted.len());
                        }
                    }
                }
            }
            tracing::debug!("session eviction loop stopped");
        })
    }
}
