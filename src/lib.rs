//! DbRheo core - a conversational database agent.
//!
//! A user issues natural-language requests, a model plans, and this crate
//! executes database and ancillary operations on the user's behalf:
//!
//! - Turn-based conversation loop with history compression
//! - Tool scheduler with a risk-gated confirmation flow
//! - Capability-tagged tool registry
//! - One streaming protocol over Gemini / Anthropic / OpenAI
//! - Pluggable database adapters (SQLite, PostgreSQL, MySQL) with
//!   connection and transaction management
//!
//! # Example
//!
//! ```ignore
//! use dbrheo::{AgentClient, AgentSettings, AbortSignal};
//!
//! let client = std::sync::Arc::new(AgentClient::new(AgentSettings::load()?)?);
//! let mut events = client
//!     .send_message_stream("show the first two rows of t", AbortSignal::new())
//!     .await;
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

#![forbid(unsafe_code)]

pub mod adapters;
mod client;
mod compressor;
mod config;
mod connection;
mod error;
mod events;
mod next_speaker;
mod registry;
mod risk;
mod scheduler;
pub mod tools;
mod transaction;
mod turn;
mod types;

pub mod llm;

pub use client::AgentClient;
pub use compressor::{CompressionResult, HistoryCompressor, TokenEstimator};
pub use config::{AgentSettings, ConfigScope, RetrySettings};
pub use connection::{ActiveConnection, ConnectionManager, ConnectionSummary, SavedConnection};
pub use error::{DbError, Result};
pub use events::AgentEvent;
pub use next_speaker::NextSpeaker;
pub use registry::{Capability, ToolDeclaration, ToolRegistration, ToolRegistry};
pub use risk::{RiskAssessment, RiskLevel, StatementKind};
pub use scheduler::{
    ConfirmationDecision, ConfirmationHandler, ConfirmationRequest, ToolCallRecord, ToolCallState,
    ToolScheduler,
};
pub use transaction::TransactionManager;
pub use turn::{Turn, TurnResult};
pub use types::{
    unpaired_call_ids, AbortSignal, Content, FinishReason, FunctionCall, FunctionResponse, Part,
    Role, TokenUsage,
};
