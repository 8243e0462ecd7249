pub mod cards;
pub mod client;
pub mod config;
pub mod friends;
pub mod owners;
pub mod session;

pub use client::{AlteredClient, AlteredError};
pub use friends::Friend;
pub use owners::{TransferClient, TransferError};
pub use session::{StaticTokenProvider, TokenError, TokenProvider, token_provider_from_env};
