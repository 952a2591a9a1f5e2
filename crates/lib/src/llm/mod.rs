//! Completion service abstraction and HTTP client.
//!
//! The completion service does intent classification, function-call selection,
//! slot extraction, and reply composition for the agent runtime.

mod completion;

pub use completion::{
    Classification, CompletionBackend, CompletionClient, CompletionError, Composition,
    FunctionCall,
};
