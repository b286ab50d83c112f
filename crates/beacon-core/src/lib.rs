//! Beacon Core - configuration, ICE descriptors and TURN credentials
//!
//! This crate contains the runtime-free pieces shared by Beacon components.
//! It has no dependencies on networking or storage code.

pub mod config;
pub mod error;
pub mod ice;
pub mod turn;

pub use config::{
    Config, IceConfig, ReaperConfig, SignalConfig, TurnSettings, TwilioConfig, TwilioCredentials,
};
pub use error::*;
pub use ice::{IceServer, IceUrls};
pub use turn::{generate_turn_credentials, TurnCredential, TURN_CREDENTIAL_TTL};
