//! Request-time support: token counting, history trimming, chain context
//! assembly and retry policy.

pub mod context;
pub mod history;
pub mod retry;
pub mod token_service;

pub use context::{ChainContext, ContextBuilder, ContextRequest, MemoryFlags, RetrievedBlock};
pub use history::{HistoryConfig, HistoryManager, HistoryStrategy};
pub use retry::RetryPolicy;
pub use token_service::TokenService;
