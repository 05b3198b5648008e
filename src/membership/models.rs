//! Membership data models
//!
//! `MemberProfile` is the full record as held in the canonical blob. All
//! fields are optional so that an absent field stays absent through a
//! store round-trip.

use super::error::MembershipError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// Time-ordered record identifier, stable across every stage move
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordKey(Uuid);

impl RecordKey {
    /// New key ordered after every key previously generated by this process
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Parse the external form (lowercase hex, hyphens tolerated)
    pub fn parse(s: &str) -> Result<Self, MembershipError> {
        Uuid::try_parse(s.trim())
            .map(Self)
            .map_err(|_| MembershipError::InvalidKey(s.to_string()))
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl std::str::FromStr for RecordKey {
    type Err = MembershipError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for RecordKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for RecordKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        RecordKey::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Personal, account and financial data of a member or applicant
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub street: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zipcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    /// Account name; write-once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pwhash: Option<String>,
    /// Fee amount in whole currency units
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_yearly: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_key: Option<bool>,
    /// Unix timestamp up to which fees are paid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payments_caught_up_to: Option<u64>,
}

/// Request and lifecycle metadata. Timestamps are Unix seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver_uid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goodbye_initiator: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goodbye_timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goodbye_reason: Option<String>,
}

/// The complete membership record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberProfile {
    #[serde(default)]
    pub member: MemberData,
    #[serde(default)]
    pub metadata: MembershipMetadata,
    /// Scan of the signed membership agreement
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_bytes")]
    pub agreement_pdf: Option<Vec<u8>>,
}

impl MemberProfile {
    pub fn has_agreement(&self) -> bool {
        self.agreement_pdf.as_ref().is_some_and(|pdf| !pdf.is_empty())
    }
}

/// One enumerated record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecordEntry {
    pub key: RecordKey,
    pub profile: MemberProfile,
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_record_key_external_form() {
        let key = RecordKey::from_bytes([0xab; 16]);
        assert_eq!(key.to_string(), "abababababababababababababababab");
        assert_eq!(RecordKey::parse(&key.to_string()).unwrap(), key);
        assert_eq!(
            RecordKey::parse("abababab-abab-abab-abab-abababababab").unwrap(),
            key
        );
        assert!(matches!(
            RecordKey::parse("nope"),
            Err(MembershipError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_generated_keys_are_time_ordered() {
        let keys: Vec<RecordKey> = (0..50).map(|_| RecordKey::generate()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_agreement_presence() {
        let mut profile = MemberProfile::default();
        assert!(!profile.has_agreement());
        profile.agreement_pdf = Some(Vec::new());
        assert!(!profile.has_agreement());
        profile.agreement_pdf = Some(b"%PDF".to_vec());
        assert!(profile.has_agreement());
    }
}
