//! 核心编排层：错误、调用预算、会话注册表、事件流、对话服务与组装

pub mod budget;
pub mod builder;
pub mod error;
pub mod event_stream;
pub mod orchestrator;
pub mod session;

pub use budget::{BudgetVerdict, CallBudget};
pub use builder::{create_llm_from_config, ServiceBuilder};
pub use error::{PlannerError, ToolError};
pub use event_stream::{send_event, SessionEmitter, SessionEventStream};
pub use orchestrator::{ChatService, TurnOutcome, TurnRequest};
pub use session::{SessionInfo, SessionRegistry};
