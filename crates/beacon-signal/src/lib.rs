//! Beacon Signal - presence tracking for a peer signaling service
//!
//! Clients keep a WebSocket open and report liveness. A reaper pings quiet
//! clients, evicts silent ones and drops idle rooms. Each client is handed
//! an ICE server list: STUN, TURN with ephemeral credentials, and whatever
//! a third-party token service adds.
//!
//! # Flow
//!
//! 1. Client connects and sends `hello` (optionally naming a room)
//! 2. Server stores the client and replies with its id and ICE servers
//! 3. Any frame from the client refreshes its `seen` timestamp
//! 4. After 10s of silence the reaper sends `ping`
//! 5. After 30s of silence the reaper sends `bye` and forgets the client
//! 6. Rooms with no activity for 60s are forgotten

pub mod directory;
pub mod messages;
pub mod notify;
pub mod reaper;
pub mod server;
pub mod store;
pub mod timer;

pub use directory::{IceDirectory, IceTokenProvider, TokenError, TwilioTokenProvider};
pub use messages::{ErrorCode, PresenceMessage};
pub use notify::{Notifier, NotifyError};
pub use reaper::{PassReport, Reaper, ReaperHandles, ReaperPolicy};
pub use server::{ConnectionRegistry, PresenceServer};
pub use store::{Client, PresenceStore, Room, SqliteStore, StoreError};
pub use timer::{PeriodicTask, TaskHandle};

/// Default listen port
pub const DEFAULT_PORT: u16 = 8080;
