//! Lifeline - incident fan-out and evidence custody core
//!
//! When a user raises an SOS, Lifeline ranks nearby guardians and volunteers,
//! notifies them tier by tier until one accepts, and meanwhile ingests the
//! user's chunked audio/video/photo evidence into an append-only,
//! hash-chained ledger.
//!
//! ## Architecture
//!
//! ```text
//! SOS ──► IncidentOrchestrator ──► ResponderDirectory (rank, frozen snapshot)
//!              │        │
//!              │        └────────► Dispatcher ──► push / sms / mesh
//!              │                      (tiers, deadlines, first accept wins)
//!              ▼
//!        IncidentTopics (per-incident events)
//!
//! chunks ──► ChunkStore ──finalize──► EvidenceLedger ──► ObjectStore
//!                                         │ commit notice
//!                                         └──► orchestrator attaches evidence
//! ```
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/lifeline/
//! └── evidence/
//!     └── blobs/             # Content-addressed evidence streams
//! ```

pub mod app;
pub mod collaborators;
pub mod config;
pub mod dispatch;
pub mod evidence;
pub mod geo;
pub mod http;
pub mod ids;
pub mod incident;
pub mod responders;
pub mod topics;
pub mod types;

pub use app::{Collaborators, Lifeline};
pub use config::{Args, LifelineConfig};
pub use geo::GeoPoint;
pub use http::HttpServer;
pub use types::{LifelineError, Result};
