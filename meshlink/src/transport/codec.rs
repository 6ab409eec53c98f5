// Copyright Andeya Lee 2024
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! Serde codec selection.

pub use ::tokio_serde::formats::*;
use crate::config::ConfigError;
use faststr::FastStr;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Transport serde codec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    /// Bincode codec using [bincode](https://docs.rs/bincode) crate.
    #[default]
    Bincode,
    /// JSON codec using [serde_json](https://docs.rs/serde_json) crate.
    Json,
    /// MessagePack codec using [rmp-serde](https://docs.rs/rmp-serde) crate.
    #[cfg(feature = "serde-transport-messagepack")]
    MessagePack,
    /// CBOR codec using [serde_cbor](https://docs.rs/serde_cbor) crate.
    #[cfg(feature = "serde-transport-cbor")]
    Cbor,
}

impl Codec {
    /// Lowercase name of the codec.
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Bincode => "bincode",
            Codec::Json => "json",
            #[cfg(feature = "serde-transport-messagepack")]
            Codec::MessagePack => "messagepack",
            #[cfg(feature = "serde-transport-cbor")]
            Codec::Cbor => "cbor",
        }
    }
}

impl Display for Codec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Codec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bincode" => Ok(Codec::Bincode),
            "json" => Ok(Codec::Json),
            #[cfg(feature = "serde-transport-messagepack")]
            "messagepack" => Ok(Codec::MessagePack),
            #[cfg(feature = "serde-transport-cbor")]
            "cbor" => Ok(Codec::Cbor),
            _ => Err(ConfigError::InvalidCodec(FastStr::new(s))),
        }
    }
}
