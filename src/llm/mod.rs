//! LLM 层：客户端抽象与实现（OpenAI 兼容 / 离线启发式 / 脚本化测试桩）以及嵌入

pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

pub use embedding::{cosine_similarity, EmbeddingProvider, HashEmbedder, OpenAiEmbedder};
pub use mock::{HeuristicLlmClient, ScriptedLlmClient};
pub use openai::OpenAiClient;
pub use traits::{LlmClient, LlmError};
