//! Platform-independent engine: memory scanner, user-mode debugger, thread
//! dispatcher, and the facade tying them together for a UI layer. Concrete
//! OS access (process memory, debug events, thread contexts) is supplied by
//! a `vertex-runtime` implementation of the traits in [`plugin`].

pub mod alloc;
pub mod config;
pub mod debugger;
pub mod dispatch;
pub mod error;
pub mod facade;
pub mod log;
pub mod plugin;
pub mod registry;
pub mod scanner;
pub mod types;

pub use error::{VertexError, VertexResult};
pub use facade::Facade;
