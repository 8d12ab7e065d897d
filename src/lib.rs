//! stressgen -- adaptive-rate ICMP echo / TCP SYN / UDP traffic generator.
//!
//! The engine sends pre-built packet templates from a pool of workers, each
//! pacing itself towards its share of a target byte rate with a burst-size
//! feedback loop, and aggregates what was sent into periodic snapshots.
//!
//! ```no_run
//! use std::sync::Arc;
//! use stressgen::{FloodConfig, Protocol, Session, StressConfig, TracingSink};
//!
//! # async fn demo() -> Result<(), stressgen::SessionError> {
//! let mut session = Session::new(StressConfig::default(), Arc::new(TracingSink));
//! let mut flood = FloodConfig::new(Protocol::Udp, "192.0.2.10", 8_000_000);
//! flood.target_port = 9000;
//! session.start(flood).await?;
//! tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//! session.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod governor;
pub mod packet;
pub mod session;
pub mod stats;
pub mod worker;

pub use config::{StressConfig, WorkerMode};
pub use packet::Protocol;
pub use session::{FloodConfig, Session, SessionError, SessionHandle, SessionState, StopReport};
pub use stats::{Performance, SnapshotSink, StatisticsSnapshot, TracingSink};
