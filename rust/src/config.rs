// Copyright 2023 The Android Open Source Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Runtime configuration of the controller core.

use serde::Deserialize;
use thiserror::Error;

/// Bluetooth Core 5.0.
pub const BT_VERSION_5_0: u8 = 0x09;
/// Bluetooth Core 5.2.
pub const BT_VERSION_5_2: u8 = 0x0b;

/// LE feature bits, Vol 6, Part B, 4.6.
#[repr(u64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeFeature {
    Encryption = 1 << 0,
    DataLengthExtension = 1 << 5,
    Le2mPhy = 1 << 8,
    LeCodedPhy = 1 << 11,
    ChannelSelectionAlgorithm2 = 1 << 14,
    SleepClockAccuracyUpdates = 1 << 27,
    ConnectedIsochronousStreamCentral = 1 << 28,
    ConnectedIsochronousStreamPeripheral = 1 << 29,
    ConnectedIsochronousStreamHostSupport = 1 << 32,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Malformed configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Pool size {0} must be non-zero")]
    EmptyPool(&'static str),
    #[error("Invalid sleep clock accuracy code {0}")]
    InvalidSca(u8),
    #[error("CIS handle base 0x{0:03x} overlaps the ACL handle range")]
    CisHandleOverlap(u16),
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CoreConfig {
    /// Number of ACL connection contexts.
    pub max_conn: u16,
    /// Number of CIS contexts.
    pub max_cis: u16,
    /// Number of CIG contexts.
    pub max_cig: u16,
    /// Supported Bluetooth version, gates the advertised features.
    pub bt_version: u8,
    pub default_tx_power_dbm: i8,
    /// Runtime delay appended to every CIS sub-event.
    pub sub_evt_delay_usec: u32,
    /// Local sleep clock accuracy code (0..=7).
    pub local_sca: u8,
    pub llcp_rsp_timeout_ms: u32,
    /// First CIS connection handle. CIS handles are allocated
    /// contiguously from this base.
    pub cis_handle_base: u16,
    /// Flow control credits for outbound ISO SDUs.
    pub num_iso_bufs: u16,
    pub company_id: u16,
    pub sub_version: u16,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            max_conn: 4,
            max_cis: 4,
            max_cig: 2,
            bt_version: BT_VERSION_5_2,
            default_tx_power_dbm: 0,
            sub_evt_delay_usec: 0,
            local_sca: 5,
            llcp_rsp_timeout_ms: 40_000,
            cis_handle_base: 0x0e00,
            num_iso_bufs: 8,
            company_id: 0x00e0,
            sub_version: 0x0001,
        }
    }
}

impl CoreConfig {
    /// Parse and validate a TOML configuration. Missing keys keep
    /// their default value.
    pub fn from_toml_str(toml_str: &str) -> Result<CoreConfig, ConfigError> {
        let config: CoreConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_conn == 0 {
            return Err(ConfigError::EmptyPool("max_conn"));
        }
        if self.max_cis == 0 {
            return Err(ConfigError::EmptyPool("max_cis"));
        }
        if self.max_cig == 0 {
            return Err(ConfigError::EmptyPool("max_cig"));
        }
        if self.local_sca > 7 {
            return Err(ConfigError::InvalidSca(self.local_sca));
        }
        if self.cis_handle_base < self.max_conn
            || self.cis_handle_base.checked_add(self.max_cis).map_or(true, |end| end > 0x0eff)
        {
            return Err(ConfigError::CisHandleOverlap(self.cis_handle_base));
        }
        Ok(())
    }

    /// LE features advertised in LL_FEATURE_REQ / LL_FEATURE_RSP.
    pub fn supported_features(&self) -> u64 {
        let mut features =
            LeFeature::Encryption as u64 | LeFeature::DataLengthExtension as u64;
        if self.bt_version >= BT_VERSION_5_0 {
            features |= LeFeature::Le2mPhy as u64
                | LeFeature::LeCodedPhy as u64
                | LeFeature::ChannelSelectionAlgorithm2 as u64;
        }
        if self.bt_version >= BT_VERSION_5_2 {
            features |= LeFeature::SleepClockAccuracyUpdates as u64
                | LeFeature::ConnectedIsochronousStreamCentral as u64
                | LeFeature::ConnectedIsochronousStreamPeripheral as u64
                | LeFeature::ConnectedIsochronousStreamHostSupport as u64;
        }
        features
    }

    pub fn supports(&self, feature: LeFeature) -> bool {
        (self.supported_features() & feature as u64) != 0
    }

    /// PHY bitmask (1M, 2M, Coded) enabled by the supported features.
    pub fn supported_phys(&self) -> u8 {
        let mut phys = 0x1;
        if self.supports(LeFeature::Le2mPhy) {
            phys |= 0x2;
        }
        if self.supports(LeFeature::LeCodedPhy) {
            phys |= 0x4;
        }
        phys
    }
}
