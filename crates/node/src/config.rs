//! Node configuration files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator_keys::Address;

/// On-disk description of the validator set: addresses in index order,
/// the coordinator's own address among them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSetConfig {
    pub validators: Vec<String>,
}

impl ValidatorSetConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading validator set {path:?}"))?;
        serde_json::from_str(&raw).context("parsing validator set")
    }

    pub fn addresses(&self) -> Result<Vec<Address>> {
        self.validators
            .iter()
            .map(|raw| {
                raw.parse::<Address>()
                    .map_err(|err| anyhow::anyhow!("bad validator address {raw}: {err}"))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_addresses_in_order() {
        let config: ValidatorSetConfig = serde_json::from_str(
            r#"{"validators": [
                "0x0101010101010101010101010101010101010101",
                "0x0202020202020202020202020202020202020202"
            ]}"#,
        )
        .unwrap();
        let addresses = config.addresses().unwrap();
        assert_eq!(addresses.len(), 2);
        assert_eq!(addresses[0], Address([1u8; 20]));
        assert_eq!(addresses[1], Address([2u8; 20]));
    }

    #[test]
    fn rejects_malformed_addresses() {
        let config = ValidatorSetConfig {
            validators: vec!["0xnothex".to_string()],
        };
        assert!(config.addresses().is_err());
    }
}
