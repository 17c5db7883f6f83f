//! Wire protocol for como sources.
//!
//! This crate provides the byte-level pieces shared by instrumented processes
//! and their observers, plus the observer-side session.
//!
//! # Architecture
//!
//! - [`codec`]: Binary encoding of source snapshots and typed values
//! - [`transport`]: Length-prefixed framing of messages on a byte stream
//! - [`protocol`]: Message kinds and the frame/message conversions
//! - [`client`]: Observer session connected to a como server
//! - [`cache`]: Latest snapshot per source, fed from client events
//!
//! # Example
//!
//! ```no_run
//! use como_protocol::{ClientEvent, ComoClient, SourceCache};
//!
//! # async fn example() -> Result<(), como_protocol::ClientError> {
//! let mut client = ComoClient::connect("127.0.0.1:4242").await?;
//! client.request_source_list().await?;
//!
//! let mut cache = SourceCache::new();
//! while let Some(event) = client.recv().await {
//!     cache.apply(&event);
//!     if let ClientEvent::SourceUpdated(source) = event {
//!         println!("{} = {}", source.name(), source.value());
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod client;
pub mod codec;
pub mod protocol;
pub mod transport;

pub use cache::{CacheChange, SourceCache};
pub use client::{ClientError, ClientEvent, ClientOptions, ComoClient};
pub use codec::{CodecError, decode_source, encode_source};
pub use protocol::{Frame, Message, MessageKind};
pub use transport::{ComoCodec, DEFAULT_MAX_FRAME_SIZE, FrameError, encode_frame, feed};

pub use como_types::{Source, SourceError, SourceType, SourceValue};
