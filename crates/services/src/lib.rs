//! # Services
//!
//! Business rules for the hyperlocal engine. Everything here talks to storage,
//! hashing and token signing through the ports in `domains`.

pub mod credentials;
pub mod moderation;
pub mod proximity;
pub mod reports;
pub mod validation;
mod views;
pub mod votes;

pub use credentials::{CredentialManager, TokenPolicy};
pub use moderation::{EnginePolicy, EnginePorts, ModerationFacade};
pub use proximity::{ProximityEngine, DEFAULT_RADIUS_METERS};
pub use reports::{ReportPolicy, FLAG_THRESHOLD};
pub use votes::VoteLedger;
