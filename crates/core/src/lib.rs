pub mod artifact;
pub mod document;
pub mod engine;
pub mod error;
pub mod export;
pub mod image;
pub mod llm_client;
pub mod llm_engine;
pub mod orchestrator;
pub mod search;
pub mod session;
pub mod tools;

pub use error::{ErrorKind, WorkflowError};
pub use session::{GenerationRequest, SessionId, SessionStatus};
