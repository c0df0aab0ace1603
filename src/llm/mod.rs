//! Provider 层：抽象、注册表与实现（OpenAI 兼容 / DeepSeek / Anthropic / Mock）

pub mod anthropic;
pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod registry;
pub mod traits;

pub use anthropic::AnthropicProvider;
pub use deepseek::{deepseek_provider, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use mock::{MockProvider, ScriptedProvider};
pub use openai::OpenAiProvider;
pub use registry::{ProviderHealth, ProviderRegistry, RegisteredProvider};
pub use traits::Provider;
