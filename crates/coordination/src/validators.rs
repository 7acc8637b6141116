//! The fixed validator set and its index assignment.

use anyhow::{bail, Result};
use std::collections::HashMap;
use validator_keys::Address;

/// Immutable membership table for one VM: every validator's address and its
/// fixed index, the coordinator's own address included. Built once at
/// startup and shared read-only with every task.
#[derive(Debug, Clone)]
pub struct ValidatorSet {
    order: Vec<Address>,
    indices: HashMap<Address, usize>,
    own: Address,
}

impl ValidatorSet {
    /// Build the set from addresses listed in index order.
    pub fn new(addresses: Vec<Address>, own: Address) -> Result<Self> {
        if addresses.len() < 2 {
            bail!("a validator set needs at least two members");
        }
        let mut indices = HashMap::with_capacity(addresses.len());
        for (index, address) in addresses.iter().enumerate() {
            if indices.insert(*address, index).is_some() {
                bail!("duplicate validator address {address}");
            }
        }
        if !indices.contains_key(&own) {
            bail!("own address {own} is not in the validator set");
        }
        Ok(Self {
            order: addresses,
            indices,
            own,
        })
    }

    pub fn count(&self) -> usize {
        self.order.len()
    }

    /// Number of followers the coordinator waits for.
    pub fn remote_count(&self) -> usize {
        self.order.len() - 1
    }

    pub fn index_of(&self, address: &Address) -> Option<usize> {
        self.indices.get(address).copied()
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.indices.contains_key(address)
    }

    pub fn own_address(&self) -> Address {
        self.own
    }

    pub fn own_index(&self) -> usize {
        self.indices[&self.own]
    }

    /// Addresses in index order.
    pub fn addresses(&self) -> &[Address] {
        &self.order
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(tag: u8) -> Address {
        Address([tag; 20])
    }

    #[test]
    fn assigns_indices_in_list_order() {
        let set = ValidatorSet::new(vec![address(1), address(2), address(3)], address(2)).unwrap();
        assert_eq!(set.count(), 3);
        assert_eq!(set.remote_count(), 2);
        assert_eq!(set.index_of(&address(1)), Some(0));
        assert_eq!(set.index_of(&address(3)), Some(2));
        assert_eq!(set.own_index(), 1);
        assert_eq!(set.index_of(&address(9)), None);
    }

    #[test]
    fn rejects_duplicates() {
        assert!(ValidatorSet::new(vec![address(1), address(1)], address(1)).is_err());
    }

    #[test]
    fn rejects_foreign_own_address() {
        assert!(ValidatorSet::new(vec![address(1), address(2)], address(9)).is_err());
    }

    #[test]
    fn rejects_singleton_sets() {
        assert!(ValidatorSet::new(vec![address(1)], address(1)).is_err());
    }
}
