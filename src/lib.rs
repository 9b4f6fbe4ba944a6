//! Hosted-channel provider core
//!
//! This crate implements the core of a hosted-channel provider: a daemon
//! that extends an upstream Lightning node with off-chain, trust-based
//! channels whose balance is backed purely by an append-only sequence of
//! mutually signed states. The provider hosts channels for connected
//! peers, forwards HTLCs between hosted channels and the upstream network,
//! and can always prove the latest balance via a peer-countersigned state.
//!
//! The RPC plugin front-end, the Sphinx implementation and the upstream
//! node itself live outside this crate, behind the narrow interfaces in
//! [`upstream`] and [`onion`].

pub mod channel;
pub mod config;
pub mod lcss;
pub mod master;
pub mod onion;
pub mod state;
pub mod store;
pub mod types;
pub mod upstream;
pub mod wire;

pub use channel::{
    ChannelAction, ChannelContext, ChannelError, ChannelStatus, HostedChannel, HtlcResolution,
    OutgoingFailure, OutgoingResult,
};
pub use config::{ConfigError, HostedConfig};
pub use lcss::LastCrossSignedState;
pub use master::{ChannelInfo, ChannelMaster, ChannelSummary};
pub use onion::{FailureMessage, OnionError, OnionHandler, PeeledOnion, PeeledPayload};
pub use store::{ChannelRecord, DetailedError, Store, StoreData, StoreError};
pub use types::{
    ChannelId, HtlcIdentifier, PaymentHash, PaymentPreimage, ShortChannelId, TypeError,
};
pub use upstream::{OutgoingStatus, UpstreamError, UpstreamEvent, UpstreamNode};
pub use wire::{HostedMessage, WireError};

use thiserror::Error;

/// Error types for hosted-channel operations
#[derive(Debug, Error)]
pub enum HostedError {
    #[error("Channel error: {0}")]
    Channel(#[from] channel::ChannelError),

    #[error("Wire error: {0}")]
    Wire(#[from] wire::WireError),

    #[error("Store error: {0}")]
    Store(#[from] store::StoreError),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] upstream::UpstreamError),

    #[error("Invalid value: {0}")]
    Type(#[from] types::TypeError),
}
