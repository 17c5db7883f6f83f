//! Como server library: live sources and the observers watching them.
//!
//! Instrumented code creates sources through a [`SourceRegistry`]; every
//! change is pushed to each observer connected through [`ComoServer`].
//!
//! # Example
//!
//! ```no_run
//! use como_server::{ComoServer, ServerConfig, SourceRegistry};
//! use como_types::SourceType;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = SourceRegistry::new();
//! let mut temperature = registry.create_source(
//!     SourceType::Double,
//!     "temperature",
//!     "Thermometer",
//!     21.5,
//!     "Room temperature",
//! )?;
//!
//! let server = ComoServer::bind(&ServerConfig::default(), registry.clone()).await?;
//! tokio::spawn(server.serve());
//!
//! temperature.set_double(23.0);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod registry;
pub mod server;
pub mod session;
pub mod source;

pub use config::ServerConfig;
pub use error::{Result, ServerError};
pub use registry::{SessionSender, SourceRegistry, SourceToken};
pub use server::ComoServer;
pub use session::{CloseReason, SessionId, SessionOptions, run_session};
pub use source::LiveSource;
