//! 规划器：意图/槽位/决策模型调用、提示词、状态机与过程事件

pub mod events;
pub mod intent;
pub mod machine;
pub mod model;
pub mod prompts;
pub mod slots;
pub mod synthesis;

pub use events::{EventStatus, EventType, PlannerEvent};
pub use intent::{parse_structured, Decision, Intent, Slots};
pub use machine::{PlannerConfig, PlannerStateMachine, Terminal, TurnResult};
pub use model::{ModelOutcome, PlannerModel};
