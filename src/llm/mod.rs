pub mod client;
pub mod escalator;

pub use client::{AnthropicClient, Completion, LlmClient, OpenAiClient, client_for};
pub use escalator::{
    Escalation, FieldState, LlmEscalator, ModelAnswer, SYSTEM_PROMPT, Tier, Transition,
    build_prompt, parse_answers,
};
