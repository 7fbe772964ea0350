//! Notebook sandbox sessions.
//!
//! Turns a user request into an executed notebook: code is generated, the
//! conversation's sandbox is acquired from the [`SessionRegistry`] (created on
//! first use and reused until it has been idle for the session timeout),
//! attached files are copied in, and each cell runs against the sandbox's
//! persistent interpreter state.
//!
//! Sandboxes come from one of several backends behind [`SandboxProvider`]:
//! a hosted code-interpreter API ([`RemoteProvider`]), a local persistent
//! Python kernel ([`NativeKernelProvider`]), or, with the
//! `microsandbox-engine` feature, a microVM.
//!
//! # Example
//! ```rust,no_run
//! use nbsandbox::{
//!     create_provider, EventSink, HttpFileSource, MemoryDocumentStore, NotebookConfig,
//!     NotebookOrchestrator, SessionRegistry,
//! };
//! use std::sync::Arc;
//!
//! # async fn run(generator: Arc<dyn nbsandbox::CodeGenerator>) -> nbsandbox::Result<()> {
//! let config = NotebookConfig::from_env();
//! let registry = SessionRegistry::init(create_provider(&config.provider)?, config.session.clone());
//! let orchestrator = NotebookOrchestrator::new(
//!     registry,
//!     Arc::new(HttpFileSource::new()),
//!     generator,
//!     Arc::new(MemoryDocumentStore::new()),
//!     config,
//! );
//!
//! let result = orchestrator.run_code("conversation-1", "print('hello')").await?;
//! assert_eq!(result.outputs[0].content, "hello\n");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod errors;
pub mod executor;
pub mod materializer;
pub mod metadata;
pub mod native;
pub mod notebook;
pub mod orchestrator;
pub mod prompt;
pub mod registry;
pub mod remote;
pub mod sandbox_builder;
pub mod store;
pub mod workspace;

#[cfg(feature = "microsandbox-engine")]
pub mod microsandbox_auth;
#[cfg(feature = "microsandbox-engine")]
pub mod microsandbox_engine;

#[cfg(test)]
mod testing;

pub use config::{
    ImportPolicy, NotebookConfig, ProviderConfig, ResourceLimits, SessionConfig,
};
pub use engine::{RawExecution, RichPayload, RichResult, Sandbox, SandboxHandle, SandboxProvider};
pub use errors::{ParseError, Result, SandboxError};
pub use executor::{CodeExecutor, ExecutionResult};
pub use materializer::{FileMaterializer, FileSource, HttpFileSource, MaterializationReport};
pub use metadata::{
    guess_media_type, is_tabular_media_type, CsvMetadataExtractor, MetadataExtractor,
    TabularMetadata,
};
pub use native::NativeKernelProvider;
pub use notebook::{
    cells_from_json, cells_to_json, CellOutput, CellStatus, CodeCell, CodeCellDraft,
    FileDescriptor,
};
pub use orchestrator::{
    CodeGenerator, DeltaStream, DocumentStore, EventSink, GenerationDelta, NotebookEvent,
    NotebookOrchestrator, SavedDocument, TurnReport, TurnRequest,
};
pub use registry::{SessionRegistry, SessionStatus};
pub use remote::RemoteProvider;
pub use sandbox_builder::create_provider;
pub use store::MemoryDocumentStore;

#[cfg(feature = "microsandbox-engine")]
pub use microsandbox_engine::MicrosandboxProvider;
