//! 会话事件流
//!
//! 进程内的发布/订阅：规划器按会话发布 PlannerEvent，当前所有订阅者各收到一份；无订阅者时直接丢弃，不做回放。
//! 订阅流首先产出 ready；之后若在 heartbeat 间隔内没有事件，产出一条 heartbeat。
//! publish 同步且不阻塞（无界通道），发送失败的订阅者被移除。

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;

use crate::core::session::SessionRegistry;
use crate::planner::PlannerEvent;

pub struct SessionEventStream {
    registry: Arc<SessionRegistry>,
    heartbeat: Duration,
}

/// 订阅流被丢弃时注销订阅者
struct SubscriptionGuard {
    registry: Arc<SessionRegistry>,
    session_id: String,
    subscriber_id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.registry
            .remove_subscriber(&self.session_id, self.subscriber_id);
    }
}

struct SubscriptionState {
    rx: mpsc::UnboundedReceiver<PlannerEvent>,
    _guard: SubscriptionGuard,
    session_id: String,
    heartbeat: Duration,
    ready_sent: bool,
}

impl SessionEventStream {
    pub fn new(registry: Arc<SessionRegistry>, heartbeat: Duration) -> Self {
        Self {
            registry,
            heartbeat,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// 发布事件，返回送达的订阅者数
    pub fn publish(&self, session_id: &str, event: PlannerEvent) -> usize {
        let delivered = self.registry.broadcast(session_id, &event);
        tracing::trace!(
            session_id = %session_id,
            event = event.event_type.as_str(),
            delivered,
            "event published"
        );
        delivered
    }

    /// 订阅会话事件；会话不存在时创建
    pub fn subscribe(&self, session_id: &str) -> BoxStream<'static, PlannerEvent> {
        let (subscriber_id, rx) = self.registry.add_subscriber(session_id);
        let state = SubscriptionState {
            rx,
            _guard: SubscriptionGuard {
                registry: Arc::clone(&self.registry),
                session_id: session_id.to_string(),
                subscriber_id,
            },
            session_id: session_id.to_string(),
            heartbeat: self.heartbeat,
            ready_sent: false,
        };

        stream::unfold(state, |mut state| async move {
            if !state.ready_sent {
                state.ready_sent = true;
                let ready = PlannerEvent::ready(&state.session_id);
                return Some((ready, state));
            }
            match tokio::time::timeout(state.heartbeat, state.rx.recv()).await {
                Ok(Some(event)) => Some((event, state)),
                Ok(None) => None,
                Err(_) => {
                    let heartbeat = PlannerEvent::heartbeat(&state.session_id);
                    Some((heartbeat, state))
                }
            }
        })
        .boxed()
    }

    /// 绑定会话的发布句柄
    pub fn emitter(self: &Arc<Self>, session_id: &str) -> SessionEmitter {
        SessionEmitter {
            stream: Arc::clone(self),
            session_id: session_id.to_string(),
        }
    }
}

/// 单个会话的事件发布句柄（规划器与工具调度器使用）
#[derive(Clone)]
pub struct SessionEmitter {
    stream: Arc<SessionEventStream>,
    session_id: String,
}

impl SessionEmitter {
    pub fn emit(&self, event: PlannerEvent) {
        self.stream.publish(&self.session_id, event);
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

/// 可选发布：无句柄时忽略
pub fn send_event(emitter: Option<&SessionEmitter>, event: PlannerEvent) {
    if let Some(e) = emitter {
        e.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::EventType;

    fn stream_with_heartbeat(ms: u64) -> Arc<SessionEventStream> {
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
        Arc::new(SessionEventStream::new(registry, Duration::from_millis(ms)))
    }

    #[tokio::test]
    async fn test_ready_first_then_published_events_in_order() {
        let events = stream_with_heartbeat(5_000);
        let mut sub = events.subscribe("s1");
        assert_eq!(sub.next().await.unwrap().event_type, EventType::Ready);

        events.publish("s1", PlannerEvent::new(EventType::NodeStart).with_node("classify_intent"));
        events.publish("s1", PlannerEvent::new(EventType::NodeEnd).with_node("classify_intent"));
        assert_eq!(sub.next().await.unwrap().event_type, EventType::NodeStart);
        assert_eq!(sub.next().await.unwrap().event_type, EventType::NodeEnd);
    }

    #[tokio::test]
    async fn test_heartbeat_when_idle() {
        let events = stream_with_heartbeat(20);
        let mut sub = events.subscribe("s1");
        assert_eq!(sub.next().await.unwrap().event_type, EventType::Ready);
        assert_eq!(sub.next().await.unwrap().event_type, EventType::Heartbeat);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_dropped() {
        let events = stream_with_heartbeat(5_000);
        assert_eq!(events.publish("s1", PlannerEvent::new(EventType::Message)), 0);

        // 订阅之后不会收到订阅之前的事件
        let mut sub = events.subscribe("s1");
        assert_eq!(sub.next().await.unwrap().event_type, EventType::Ready);
        events.publish("s1", PlannerEvent::new(EventType::Decision));
        assert_eq!(sub.next().await.unwrap().event_type, EventType::Decision);
    }

    #[tokio::test]
    async fn test_dropping_stream_unregisters() {
        let events = stream_with_heartbeat(5_000);
        let sub = events.subscribe("s1");
        assert_eq!(events.registry().subscriber_count("s1"), 1);
        drop(sub);
        assert_eq!(events.registry().subscriber_count("s1"), 0);
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let events = stream_with_heartbeat(5_000);
        let mut a = events.subscribe("s1");
        let mut b = events.subscribe("s1");
        let mut other = events.subscribe("s2");
        a.next().await;
        b.next().await;
        other.next().await;

        events.emitter("s1").emit(PlannerEvent::new(EventType::Message));
        assert_eq!(a.next().await.unwrap().event_type, EventType::Message);
        assert_eq!(b.next().await.unwrap().event_type, EventType::Message);
        let pending = tokio::time::timeout(Duration::from_millis(20), other.next()).await;
        assert!(pending.is_err());
    }
}
