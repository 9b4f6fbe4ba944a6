//! Provider configuration
//!
//! All knobs are optional with conservative defaults, so the front-end can
//! deserialize a sparse config file directly into [`HostedConfig`].
//! Millisatoshi fields accept both the bare-number and `"123msat"` JSON
//! forms.

use crate::types::msat_serde;
use crate::wire::{HostedChannelBranding, InitHostedChannel};
use serde::Deserialize;
use thiserror::Error;

/// Error types for configuration handling
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid color: {0}")]
    InvalidColor(String),

    #[error("Invalid secret: {0}")]
    InvalidSecret(String),
}

/// Static configuration of the hosted-channel provider
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HostedConfig {
    /// Minimum CLTV distance we require between an incoming HTLC and the
    /// chain tip before forwarding
    pub cltv_expiry_delta: u32,

    /// Base routing fee per forwarded HTLC
    #[serde(deserialize_with = "msat_serde::deserialize")]
    pub fee_base_msat: u64,

    /// Proportional routing fee in millionths of the forwarded amount
    pub fee_proportional_millionths: u64,

    /// Cap on the summed value of incoming HTLCs in flight
    #[serde(deserialize_with = "msat_serde::deserialize")]
    pub max_htlc_value_in_flight_msat: u64,

    /// Smallest HTLC we accept
    #[serde(deserialize_with = "msat_serde::deserialize")]
    pub htlc_minimum_msat: u64,

    /// Cap on the number of incoming HTLCs in flight
    pub max_accepted_htlcs: u16,

    /// Capacity of every hosted channel we open
    #[serde(deserialize_with = "msat_serde::deserialize")]
    pub channel_capacity_msat: u64,

    /// Balance granted to the client at channel creation
    #[serde(deserialize_with = "msat_serde::deserialize")]
    pub initial_client_balance_msat: u64,

    /// Branding: operator contact URL
    pub contact_url: Option<String>,

    /// Branding: path to a PNG logo served to clients
    pub logo_file: Option<String>,

    /// Branding: RGB color as `#rrggbb`
    pub hex_color: String,

    /// Development mode (relaxed logging, regtest-friendly defaults)
    pub is_dev: bool,

    /// Require an invocation secret before opening a channel
    pub require_secret: bool,

    /// Always-valid invocation secrets, hex-encoded
    pub permanent_secrets: Vec<String>,

    /// Skip scanning blocks for preimages of in-flight HTLCs
    pub disable_preimage_checking: bool,
}

impl Default for HostedConfig {
    fn default() -> Self {
        Self {
            cltv_expiry_delta: 143,
            fee_base_msat: 1000,
            fee_proportional_millionths: 1000,
            max_htlc_value_in_flight_msat: 100_000_000, // 0.001 BTC in millisatoshis
            htlc_minimum_msat: 1000,
            max_accepted_htlcs: 12,
            channel_capacity_msat: 100_000_000,
            initial_client_balance_msat: 0,
            contact_url: None,
            logo_file: None,
            hex_color: "#ffffff".to_string(),
            is_dev: true,
            require_secret: false,
            permanent_secrets: Vec::new(),
            disable_preimage_checking: true,
        }
    }
}

impl HostedConfig {
    /// The static channel parameters we advertise when a peer invokes a
    /// hosted channel
    pub fn init_hosted_channel(&self) -> InitHostedChannel {
        InitHostedChannel {
            max_htlc_value_in_flight_msat: self.max_htlc_value_in_flight_msat,
            htlc_minimum_msat: self.htlc_minimum_msat,
            max_accepted_htlcs: self.max_accepted_htlcs,
            channel_capacity_msat: self.channel_capacity_msat,
            initial_client_balance_msat: self.initial_client_balance_msat,
        }
    }

    /// Parse the configured `#rrggbb` color into raw RGB bytes
    pub fn rgb_color(&self) -> Result<[u8; 3], ConfigError> {
        let digits = self
            .hex_color
            .strip_prefix('#')
            .ok_or_else(|| ConfigError::InvalidColor(self.hex_color.clone()))?;
        let bytes =
            hex::decode(digits).map_err(|_| ConfigError::InvalidColor(self.hex_color.clone()))?;
        if bytes.len() != 3 {
            return Err(ConfigError::InvalidColor(self.hex_color.clone()));
        }
        Ok([bytes[0], bytes[1], bytes[2]])
    }

    /// Branding message served on `AskBrandingInfo`, if the operator
    /// configured any branding at all
    pub fn branding(&self, logo_png: Option<Vec<u8>>) -> Option<HostedChannelBranding> {
        let contact_info = self.contact_url.clone()?;
        let rgb = self.rgb_color().ok()?;
        Some(HostedChannelBranding {
            rgb,
            png_icon: logo_png,
            contact_info,
        })
    }

    /// Decode the configured permanent secrets
    pub fn permanent_secret_bytes(&self) -> Result<Vec<Vec<u8>>, ConfigError> {
        self.permanent_secrets
            .iter()
            .map(|s| hex::decode(s).map_err(|_| ConfigError::InvalidSecret(s.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostedConfig::default();
        assert_eq!(config.cltv_expiry_delta, 143);
        assert_eq!(config.fee_base_msat, 1000);
        assert_eq!(config.max_accepted_htlcs, 12);
        assert_eq!(config.channel_capacity_msat, 100_000_000);
        assert!(!config.require_secret);
    }

    #[test]
    fn test_sparse_config_with_msat_strings() {
        let config: HostedConfig = serde_json::from_str(
            r##"{"channel_capacity_msat": "50000000msat", "htlc_minimum_msat": 2000, "hex_color": "#ff9900"}"##,
        )
        .unwrap();
        assert_eq!(config.channel_capacity_msat, 50_000_000);
        assert_eq!(config.htlc_minimum_msat, 2000);
        assert_eq!(config.rgb_color().unwrap(), [0xff, 0x99, 0x00]);
        // untouched fields keep their defaults
        assert_eq!(config.max_htlc_value_in_flight_msat, 100_000_000);
    }

    #[test]
    fn test_branding_requires_contact() {
        let mut config = HostedConfig::default();
        assert!(config.branding(None).is_none());
        config.contact_url = Some("https://host.example".to_string());
        let branding = config.branding(None).unwrap();
        assert_eq!(branding.rgb, [0xff, 0xff, 0xff]);
    }
}
