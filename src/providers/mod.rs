pub mod echo;
pub mod openai;

pub use echo::EchoProvider;
pub use openai::{OpenAiConfig, OpenAiProvider};
