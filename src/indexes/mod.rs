mod hash;

use regex::Regex;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndexName(String);

impl TryFrom<&str> for IndexName {
    type Error = &'static str;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        let regex = Regex::new(r"^[\p{L}\p{N}_]{1,64}$").unwrap();
        if regex.is_match(name) {
            Ok(Self(name.to_string()))
        } else {
            Err("IndexName contains invalid characters")
        }
    }
}

impl IndexName {
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

pub use hash::{
    HashTableError, KeyComparator, KeyHasher, LinearProbeHashTable, OrdComparator, SipKeyHasher,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_name_validation() {
        assert!(IndexName::try_from("primary_idx_1").is_ok());
        assert!(IndexName::try_from("").is_err());
        assert!(IndexName::try_from("no spaces").is_err());
        assert!(IndexName::try_from("semi;colon").is_err());
    }
}
