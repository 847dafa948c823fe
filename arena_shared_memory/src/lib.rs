//! # Shared-Memory Arena
//!
//! Reference-counted, interprocess shared memory for structured values.
//! Cooperating processes attach to a named *domain*, share values into it
//! and fetch them back without copying: a fetched value's storage points
//! straight into the shared segment.
//!
//! ## Features
//!
//! - **Zero-copy fetch**: materializing a value costs time proportional to
//!   its tree shape, never to its data size
//! - **Lock-free bookkeeping**: reference counts, revisions and statistics
//!   are single atomic words; only edits of the shared list take the lock
//! - **Cooperative collection**: values nobody references any more are
//!   unlinked on the next arena call, no background thread
//! - **Crash visibility**: a process dying inside the lock poisons the
//!   domain instead of silently corrupting it
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────┐         ┌──────────────────────────────┐
//! │ Process A            │         │ Info object /<prefix>info_64 │
//! │                      │         │                              │
//! │ Arena                ├────────►│ DirectoryHeader              │
//! │  ├ Domain            │  lock   │  rev_num, first/last,        │
//! │  ├ LocalSegmentCache │◄────────┤  stats, lock, config         │
//! │  └ VariableTracker   │         └──────────────────────────────┘
//! │        │             │
//! │  ValueHandle ──┐     │         ┌──────────────┐   ┌──────────────┐
//! └────────────────┼─────┘    ┌───►│ /<prefix>0000│◄─►│ /<prefix>0001│
//!                  └──────────┘    │ metadata     │   │ metadata     │
//!                    aliases       │ value tree   │   │ value tree   │
//!                                  └──────────────┘   └──────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use arena_shared_memory::{Arena, ArenaOptions, ShareOptions, Value};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Producer
//! let mut producer: Arena = Arena::attach(ArenaOptions::default())?;
//! let matrix = Value::numeric(&[3, 3], &[1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0])?;
//! let _shared = producer.share(&matrix, ShareOptions::default())?;
//!
//! // Consumer, normally another process
//! let mut consumer: Arena = Arena::attach(ArenaOptions::default())?;
//! if let Some(handle) = consumer.fetch_latest()? {
//!     let data = handle.read().to_vec::<f64>();
//!     println!("{:?}", data);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Values shared under a key replace each other:
//!
//! ```rust,no_run
//! use arena_shared_memory::{Arena, ArenaOptions, ShareOptions, Value};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut arena: Arena = Arena::attach(ArenaOptions::default())?;
//! let options = ShareOptions {
//!     key: Some("setpoint"),
//!     persistent: true,
//!     ..ShareOptions::default()
//! };
//! arena.share(&Value::scalar(20.5), options)?;
//! arena.share(&Value::scalar(21.0), options)?;
//! let setpoint = arena.fetch_key("setpoint")?;
//! assert_eq!(setpoint.read().to_vec::<f64>(), Some(vec![21.0]));
//! # Ok(())
//! # }
//! ```
//!
//! ## Error Handling
//!
//! Every operation returns [`ArenaResult`]. [`ArenaError::severity`] tells
//! user mistakes (bad key, limits) apart from fatal conditions; after a
//! fatal error the arena refuses further work, and shared corruption poisons
//! the domain for every process.
//!
//! ## Thread Safety
//!
//! An [`Arena`] and the handles it returns belong to one thread. Processes
//! synchronize through the domain lock when `thread_safety` is enabled in
//! the configuration.
//!
//! ## Platform Support
//!
//! POSIX shared memory (`shm_open`) with `flock` for the domain lock.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod arena;
pub mod cache;
pub mod client;
pub mod codec;
pub mod counter;
pub mod directory;
pub mod error;
pub mod mutex;
pub mod platform;
pub mod segment;
pub mod tracker;
pub mod value;

pub use self::arena::{Arena, ArenaOptions, DomainStatus, SegmentStatus, ShareOptions};
pub use cache::LocalSegmentCache;
pub use client::{ClassId, ClientValue, DataBlock, ValueFlags};
pub use counter::{AtomicCounter, CounterSnapshot, SpinWait};
pub use directory::{DirectoryHeader, Domain};
pub use error::{ArenaError, ArenaResult};
pub use segment::{SegmentMetadata, SharedSegment};
pub use tracker::{ValueHandle, VariableTracker};
pub use value::{Element, Value};

pub use ::arena::config::{ConfigUpdate, FetchMode, ShareMode, UserConfig};
pub use ::arena::severity::Severity;

/// Initialize tracing for arena diagnostics
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
