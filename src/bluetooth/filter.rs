use std::collections::HashMap;

use crate::models::{MacAddress, SensorIdentity};

/// Lookup over the configured sensors, used to drop advertisements from
/// unknown devices before decoding them.
#[derive(Debug, Clone, Default)]
pub struct AddressFilter {
    names: HashMap<MacAddress, String>,
}

impl AddressFilter {
    /// Build the filter. If an address is configured twice the first name wins.
    pub fn new(identities: &[SensorIdentity]) -> Self {
        let mut names = HashMap::with_capacity(identities.len());
        for identity in identities {
            names
                .entry(identity.address)
                .or_insert_with(|| identity.name.clone());
        }
        AddressFilter { names }
    }

    pub fn contains(&self, address: &MacAddress) -> bool {
        self.names.contains_key(address)
    }

    pub fn name_for(&self, address: &MacAddress) -> Option<&str> {
        self.names.get(address).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{identities, CHAMBRE, SALON, VOISIN};

    #[test]
    fn known_addresses_resolve_to_names() {
        let filter = AddressFilter::new(&identities());
        assert_eq!(filter.len(), 2);
        assert!(filter.contains(&SALON));
        assert_eq!(filter.name_for(&CHAMBRE), Some("Chambre"));
    }

    #[test]
    fn unknown_address_is_rejected() {
        let filter = AddressFilter::new(&identities());
        assert!(!filter.contains(&VOISIN));
        assert_eq!(filter.name_for(&VOISIN), None);
    }

    #[test]
    fn duplicate_address_keeps_first_name() {
        let mut sensors = identities();
        sensors.push(SensorIdentity {
            address: SALON,
            name: "Cuisine".to_string(),
        });
        let filter = AddressFilter::new(&sensors);
        assert_eq!(filter.len(), 2);
        assert_eq!(filter.name_for(&SALON), Some("Salon"));
    }

    #[test]
    fn empty_filter() {
        let filter = AddressFilter::new(&[]);
        assert!(filter.is_empty());
        assert!(!filter.contains(&SALON));
    }
}
