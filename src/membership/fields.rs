//! Typed field updates

use super::error::MembershipError;
use super::models::{MemberProfile, RecordKey};
use serde::Serialize;

/// A single change to an updatable field
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum FieldUpdate {
    Name(String),
    Street(String),
    City(String),
    Zipcode(String),
    Country(String),
    Phone(String),
    /// Write-once
    Username(String),
    Fee(u64),
    FeeYearly(bool),
    PaymentsCaughtUpTo(u64),
    HasKey(bool),
}

impl FieldUpdate {
    /// Build an update from external input
    pub fn parse(field: &str, value: &str) -> Result<Self, MembershipError> {
        let update = match field {
            "name" => FieldUpdate::Name(value.to_string()),
            "street" => FieldUpdate::Street(value.to_string()),
            "city" => FieldUpdate::City(value.to_string()),
            "zipcode" => FieldUpdate::Zipcode(value.to_string()),
            "country" => FieldUpdate::Country(value.to_string()),
            "phone" => FieldUpdate::Phone(value.to_string()),
            "username" => FieldUpdate::Username(value.to_lowercase()),
            "fee" => FieldUpdate::Fee(parse_integer("fee", value)?),
            "fee_yearly" => FieldUpdate::FeeYearly(parse_flag("fee_yearly", value)?),
            "payments_caught_up_to" => {
                FieldUpdate::PaymentsCaughtUpTo(parse_integer("payments_caught_up_to", value)?)
            }
            "has_key" => FieldUpdate::HasKey(parse_flag("has_key", value)?),
            other => return Err(MembershipError::UnknownField(other.to_string())),
        };
        Ok(update)
    }

    pub fn field_name(&self) -> &'static str {
        match self {
            FieldUpdate::Name(_) => "name",
            FieldUpdate::Street(_) => "street",
            FieldUpdate::City(_) => "city",
            FieldUpdate::Zipcode(_) => "zipcode",
            FieldUpdate::Country(_) => "country",
            FieldUpdate::Phone(_) => "phone",
            FieldUpdate::Username(_) => "username",
            FieldUpdate::Fee(_) => "fee",
            FieldUpdate::FeeYearly(_) => "fee_yearly",
            FieldUpdate::PaymentsCaughtUpTo(_) => "payments_caught_up_to",
            FieldUpdate::HasKey(_) => "has_key",
        }
    }

    /// Apply to an in-memory profile, touching exactly one field
    pub fn apply(&self, profile: &mut MemberProfile, key: &RecordKey) -> Result<(), MembershipError> {
        let m = &mut profile.member;
        match self {
            FieldUpdate::Name(v) => m.name = Some(v.clone()),
            FieldUpdate::Street(v) => m.street = Some(v.clone()),
            FieldUpdate::City(v) => m.city = Some(v.clone()),
            FieldUpdate::Zipcode(v) => m.zipcode = Some(v.clone()),
            FieldUpdate::Country(v) => m.country = Some(v.clone()),
            FieldUpdate::Phone(v) => m.phone = Some(v.clone()),
            FieldUpdate::Username(v) => {
                let taken = m
                    .username
                    .as_deref()
                    .is_some_and(|current| !current.is_empty() && current != v.as_str());
                if taken {
                    return Err(MembershipError::ImmutableField {
                        field: "username",
                        key: key.to_string(),
                    });
                }
                m.username = Some(v.clone());
            }
            FieldUpdate::Fee(v) => m.fee = Some(*v),
            FieldUpdate::FeeYearly(v) => m.fee_yearly = Some(*v),
            FieldUpdate::PaymentsCaughtUpTo(v) => m.payments_caught_up_to = Some(*v),
            FieldUpdate::HasKey(v) => m.has_key = Some(*v),
        }
        Ok(())
    }
}

fn parse_integer(field: &'static str, value: &str) -> Result<u64, MembershipError> {
    value
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| MembershipError::InvalidValue {
            field,
            reason: e.to_string(),
        })
}

fn parse_flag(field: &'static str, value: &str) -> Result<bool, MembershipError> {
    match value.trim() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(MembershipError::InvalidValue {
            field,
            reason: format!("'{}' is not a boolean", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_fields() {
        assert_eq!(FieldUpdate::parse("fee", "30").unwrap(), FieldUpdate::Fee(30));
        assert_eq!(FieldUpdate::parse("has_key", "yes").unwrap(), FieldUpdate::HasKey(true));
        assert_eq!(
            FieldUpdate::parse("username", "Ada").unwrap(),
            FieldUpdate::Username("ada".to_string())
        );
    }

    #[test]
    fn test_parse_rejects_unknown_and_malformed() {
        assert!(matches!(
            FieldUpdate::parse("pwhash", "x"),
            Err(MembershipError::UnknownField(f)) if f == "pwhash"
        ));
        assert!(matches!(
            FieldUpdate::parse("fee", "twenty"),
            Err(MembershipError::InvalidValue { field: "fee", .. })
        ));
        assert!(matches!(
            FieldUpdate::parse("fee_yearly", "maybe"),
            Err(MembershipError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_username_is_write_once() {
        let key = RecordKey::generate();
        let mut profile = MemberProfile::default();

        FieldUpdate::Username("ada".into()).apply(&mut profile, &key).unwrap();
        // Same value again is a no-op
        FieldUpdate::Username("ada".into()).apply(&mut profile, &key).unwrap();
        assert!(matches!(
            FieldUpdate::Username("bob".into()).apply(&mut profile, &key),
            Err(MembershipError::ImmutableField { field: "username", .. })
        ));
        assert_eq!(profile.member.username.as_deref(), Some("ada"));
    }

    #[test]
    fn test_apply_touches_one_field() {
        let key = RecordKey::generate();
        let mut profile = MemberProfile::default();
        profile.member.name = Some("Ada".into());

        FieldUpdate::Fee(30).apply(&mut profile, &key).unwrap();
        assert_eq!(profile.member.fee, Some(30));
        assert_eq!(profile.member.name.as_deref(), Some("Ada"));
        assert_eq!(profile.member.fee_yearly, None);
    }
}
