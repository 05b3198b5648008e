//! Record codec
//!
//! The canonical blob is the JSON encoding of [`MemberProfile`]. Projected
//! columns duplicate single scalar fields: integers as 8-byte big-endian,
//! booleans as one `0x00`/`0x01` byte, strings as raw UTF-8.

use super::models::MemberProfile;
use crate::backend::Cell;
use thiserror::Error;

/// Column holding the canonical blob
pub const CANONICAL_COLUMN: &str = "pb_data";

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0}")]
    Corrupt(String),

    #[error("unexpected column '{0}'")]
    UnexpectedColumn(String),
}

/// Wire representation of a projected column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Flag,
    Bytes,
}

/// Scalar fields that may be duplicated into their own column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectedField {
    Name,
    Street,
    City,
    Zipcode,
    Country,
    Email,
    EmailVerified,
    Phone,
    Fee,
    Username,
    Pwhash,
    FeeYearly,
    HasKey,
    PaymentsCaughtUpTo,
    SourceIp,
    UserAgent,
    ApplicationPdf,
}

impl ProjectedField {
    pub const ALL: [ProjectedField; 17] = [
        ProjectedField::Name,
        ProjectedField::Street,
        ProjectedField::City,
        ProjectedField::Zipcode,
        ProjectedField::Country,
        ProjectedField::Email,
        ProjectedField::EmailVerified,
        ProjectedField::Phone,
        ProjectedField::Fee,
        ProjectedField::Username,
        ProjectedField::Pwhash,
        ProjectedField::FeeYearly,
        ProjectedField::HasKey,
        ProjectedField::PaymentsCaughtUpTo,
        ProjectedField::SourceIp,
        ProjectedField::UserAgent,
        ProjectedField::ApplicationPdf,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            ProjectedField::Name => "name",
            ProjectedField::Street => "street",
            ProjectedField::City => "city",
            ProjectedField::Zipcode => "zipcode",
            ProjectedField::Country => "country",
            ProjectedField::Email => "email",
            ProjectedField::EmailVerified => "email_verified",
            ProjectedField::Phone => "phone",
            ProjectedField::Fee => "fee",
            ProjectedField::Username => "username",
            ProjectedField::Pwhash => "pwhash",
            ProjectedField::FeeYearly => "fee_yearly",
            ProjectedField::HasKey => "has_key",
            ProjectedField::PaymentsCaughtUpTo => "payments_caught_up_to",
            ProjectedField::SourceIp => "sourceip",
            ProjectedField::UserAgent => "useragent",
            ProjectedField::ApplicationPdf => "application_pdf",
        }
    }

    pub fn from_column(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.column() == name)
    }

    pub fn kind(&self) -> FieldKind {
        match self {
            ProjectedField::Fee | ProjectedField::PaymentsCaughtUpTo => FieldKind::Integer,
            ProjectedField::EmailVerified | ProjectedField::FeeYearly | ProjectedField::HasKey => {
                FieldKind::Flag
            }
            ProjectedField::ApplicationPdf => FieldKind::Bytes,
            _ => FieldKind::Text,
        }
    }

    /// Column value for this field, `None` when the field is absent or empty
    pub fn extract(&self, profile: &MemberProfile) -> Option<Vec<u8>> {
        let m = &profile.member;
        let text = |v: &Option<String>| {
            v.as_deref()
                .filter(|s| !s.is_empty())
                .map(|s| s.as_bytes().to_vec())
        };
        let integer = |v: Option<u64>| v.map(|n| n.to_be_bytes().to_vec());
        let flag = |v: Option<bool>| v.map(|b| vec![u8::from(b)]);

        match self {
            ProjectedField::Name => text(&m.name),
            ProjectedField::Street => text(&m.street),
            ProjectedField::City => text(&m.city),
            ProjectedField::Zipcode => text(&m.zipcode),
            ProjectedField::Country => text(&m.country),
            ProjectedField::Email => text(&m.email),
            ProjectedField::EmailVerified => flag(m.email_verified),
            ProjectedField::Phone => text(&m.phone),
            ProjectedField::Fee => integer(m.fee),
            ProjectedField::Username => text(&m.username),
            ProjectedField::Pwhash => text(&m.pwhash),
            ProjectedField::FeeYearly => flag(m.fee_yearly),
            ProjectedField::HasKey => flag(m.has_key),
            ProjectedField::PaymentsCaughtUpTo => integer(m.payments_caught_up_to),
            ProjectedField::SourceIp => text(&profile.metadata.request_source_ip),
            ProjectedField::UserAgent => text(&profile.metadata.user_agent),
            ProjectedField::ApplicationPdf => profile
                .agreement_pdf
                .as_ref()
                .filter(|pdf| !pdf.is_empty())
                .cloned(),
        }
    }

    /// Write a column value back into a (partial) profile
    fn inject(&self, profile: &mut MemberProfile, value: &[u8]) -> Result<(), CodecError> {
        let m = &mut profile.member;
        match self {
            ProjectedField::Name => m.name = Some(decode_text(self, value)?),
            ProjectedField::Street => m.street = Some(decode_text(self, value)?),
            ProjectedField::City => m.city = Some(decode_text(self, value)?),
            ProjectedField::Zipcode => m.zipcode = Some(decode_text(self, value)?),
            ProjectedField::Country => m.country = Some(decode_text(self, value)?),
            ProjectedField::Email => m.email = Some(decode_text(self, value)?),
            ProjectedField::EmailVerified => m.email_verified = Some(decode_flag(self, value)?),
            ProjectedField::Phone => m.phone = Some(decode_text(self, value)?),
            ProjectedField::Fee => m.fee = Some(decode_integer(self, value)?),
            ProjectedField::Username => m.username = Some(decode_text(self, value)?),
            ProjectedField::Pwhash => m.pwhash = Some(decode_text(self, value)?),
            ProjectedField::FeeYearly => m.fee_yearly = Some(decode_flag(self, value)?),
            ProjectedField::HasKey => m.has_key = Some(decode_flag(self, value)?),
            ProjectedField::PaymentsCaughtUpTo => {
                m.payments_caught_up_to = Some(decode_integer(self, value)?)
            }
            ProjectedField::SourceIp => {
                profile.metadata.request_source_ip = Some(decode_text(self, value)?)
            }
            ProjectedField::UserAgent => {
                profile.metadata.user_agent = Some(decode_text(self, value)?)
            }
            ProjectedField::ApplicationPdf => profile.agreement_pdf = Some(value.to_vec()),
        }
        Ok(())
    }
}

impl std::fmt::Display for ProjectedField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.column())
    }
}

fn decode_text(field: &ProjectedField, value: &[u8]) -> Result<String, CodecError> {
    String::from_utf8(value.to_vec())
        .map_err(|_| CodecError::Corrupt(format!("column {} is not valid UTF-8", field)))
}

fn decode_integer(field: &ProjectedField, value: &[u8]) -> Result<u64, CodecError> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| {
        CodecError::Corrupt(format!(
            "column {} holds {} bytes, expected 8",
            field,
            value.len()
        ))
    })?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_flag(field: &ProjectedField, value: &[u8]) -> Result<bool, CodecError> {
    match value {
        [0] => Ok(false),
        [1] => Ok(true),
        _ => Err(CodecError::Corrupt(format!(
            "column {} is not a boolean",
            field
        ))),
    }
}

pub fn encode(profile: &MemberProfile) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(profile)?)
}

pub fn decode(bytes: &[u8]) -> Result<MemberProfile, CodecError> {
    serde_json::from_slice(bytes)
        .map_err(|e| CodecError::Corrupt(format!("canonical blob does not parse: {}", e)))
}

/// Column values for every field in `fields` that is present on the profile
pub fn project_columns(
    profile: &MemberProfile,
    fields: &[ProjectedField],
) -> Vec<(&'static str, Vec<u8>)> {
    fields
        .iter()
        .filter_map(|field| field.extract(profile).map(|value| (field.column(), value)))
        .collect()
}

/// Every column a record may carry in any stage
pub fn known_columns() -> Vec<String> {
    std::iter::once(CANONICAL_COLUMN)
        .chain(ProjectedField::ALL.iter().map(|f| f.column()))
        .map(String::from)
        .collect()
}

/// Decode a row read with the canonical blob as its only projected column
pub fn decode_canonical_cells(cells: &[Cell]) -> Result<MemberProfile, CodecError> {
    if let Some(stray) = cells.iter().find(|c| c.name != CANONICAL_COLUMN) {
        return Err(CodecError::UnexpectedColumn(stray.name.clone()));
    }
    let blob = cells
        .first()
        .ok_or_else(|| CodecError::Corrupt("canonical blob missing".to_string()))?;
    decode(&blob.value)
}

/// Rebuild a partial profile from projected columns. The canonical blob is
/// read only as a liveness marker and skipped. Other columns outside
/// `allowed` are an integrity fault.
pub fn decode_projection(
    cells: &[Cell],
    allowed: &[ProjectedField],
) -> Result<MemberProfile, CodecError> {
    let mut profile = MemberProfile::default();
    for cell in cells.iter().filter(|c| c.name != CANONICAL_COLUMN) {
        let field = ProjectedField::from_column(&cell.name)
            .filter(|f| allowed.contains(f))
            .ok_or_else(|| CodecError::UnexpectedColumn(cell.name.clone()))?;
        field.inject(&mut profile, &cell.value)?;
    }
    Ok(profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::models::{MemberData, MembershipMetadata};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn ada() -> MemberProfile {
        MemberProfile {
            member: MemberData {
                name: Some("Ada".to_string()),
                street: Some("1 Analytical Way".to_string()),
                city: Some("London".to_string()),
                fee: Some(20),
                fee_yearly: Some(false),
                username: Some("ada".to_string()),
                ..Default::default()
            },
            metadata: MembershipMetadata {
                request_source_ip: Some("192.0.2.1".to_string()),
                request_timestamp: Some(1_700_000_000),
                ..Default::default()
            },
            agreement_pdf: Some(vec![0x25, 0x50, 0x44, 0x46, 0x00, 0xff]),
        }
    }

    fn cell(name: &str, value: &[u8]) -> Cell {
        Cell {
            name: name.to_string(),
            value: value.to_vec(),
            timestamp: 1,
        }
    }

    #[test]
    fn test_round_trip_preserves_absence() {
        let profile = ada();
        let decoded = decode(&encode(&profile).unwrap()).unwrap();
        assert_eq!(decoded, profile);
        assert_eq!(decoded.member.phone, None);
        assert_eq!(decoded.member.has_key, None);

        // Zero and false are values, not absence
        let mut zeroed = MemberProfile::default();
        zeroed.member.fee = Some(0);
        zeroed.member.has_key = Some(false);
        assert_eq!(decode(&encode(&zeroed).unwrap()).unwrap(), zeroed);
        assert_eq!(decode(&encode(&MemberProfile::default()).unwrap()).unwrap(), MemberProfile::default());
    }

    fn arb_text() -> impl Strategy<Value = Option<String>> {
        proptest::option::of(any::<String>())
    }

    prop_compose! {
        fn arb_member()(
            (name, street, city, zipcode, country, email) in
                (arb_text(), arb_text(), arb_text(), arb_text(), arb_text(), arb_text()),
            (phone, username, pwhash) in (arb_text(), arb_text(), arb_text()),
            (email_verified, fee, fee_yearly, has_key, payments_caught_up_to) in (
                proptest::option::of(any::<bool>()),
                proptest::option::of(any::<u64>()),
                proptest::option::of(any::<bool>()),
                proptest::option::of(any::<bool>()),
                proptest::option::of(any::<u64>()),
            ),
        ) -> MemberData {
            MemberData {
                name, street, city, zipcode, country, email, email_verified, phone,
                username, pwhash, fee, fee_yearly, has_key, payments_caught_up_to,
            }
        }
    }

    prop_compose! {
        fn arb_metadata()(
            (request_source_ip, user_agent, comment, approver_uid) in
                (arb_text(), arb_text(), arb_text(), arb_text()),
            (goodbye_initiator, goodbye_reason) in (arb_text(), arb_text()),
            (request_timestamp, approval_timestamp, goodbye_timestamp) in (
                proptest::option::of(any::<u64>()),
                proptest::option::of(any::<u64>()),
                proptest::option::of(any::<u64>()),
            ),
        ) -> MembershipMetadata {
            MembershipMetadata {
                request_source_ip, user_agent, request_timestamp, comment, approver_uid,
                approval_timestamp, goodbye_initiator, goodbye_timestamp, goodbye_reason,
            }
        }
    }

    prop_compose! {
        fn arb_profile()(
            member in arb_member(),
            metadata in arb_metadata(),
            agreement_pdf in proptest::option::of(proptest::collection::vec(any::<u8>(), 0..512)),
        ) -> MemberProfile {
            MemberProfile { member, metadata, agreement_pdf }
        }
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(profile in arb_profile()) {
            let blob = encode(&profile).unwrap();
            prop_assert_eq!(decode(&blob).unwrap(), profile);
        }

        #[test]
        fn prop_projection_decodes_to_the_projected_fields(profile in arb_profile()) {
            let fields = ProjectedField::ALL;
            let cells: Vec<Cell> = project_columns(&profile, &fields)
                .into_iter()
                .map(|(name, value)| cell(name, &value))
                .collect();
            let partial = decode_projection(&cells, &fields).unwrap();
            for field in fields {
                prop_assert_eq!(field.extract(&partial), field.extract(&profile));
            }
        }
    }

    #[test]
    fn test_decode_garbage_is_corruption() {
        assert!(matches!(decode(b"\x08\x96\x01"), Err(CodecError::Corrupt(_))));
        assert!(matches!(decode(br#"{"member": 7}"#), Err(CodecError::Corrupt(_))));
    }

    #[test]
    fn test_projection_wire_format() {
        let columns = project_columns(
            &ada(),
            &[
                ProjectedField::Name,
                ProjectedField::Fee,
                ProjectedField::FeeYearly,
                ProjectedField::Phone,
                ProjectedField::ApplicationPdf,
            ],
        );
        assert_eq!(
            columns,
            vec![
                ("name", b"Ada".to_vec()),
                ("fee", vec![0, 0, 0, 0, 0, 0, 0, 20]),
                ("fee_yearly", vec![0]),
                ("application_pdf", vec![0x25, 0x50, 0x44, 0x46, 0x00, 0xff]),
            ]
        );
    }

    #[test]
    fn test_empty_strings_are_not_projected() {
        let mut profile = ada();
        profile.member.name = Some(String::new());
        assert!(project_columns(&profile, &[ProjectedField::Name]).is_empty());
    }

    #[test]
    fn test_decode_projection() {
        let allowed = [ProjectedField::Name, ProjectedField::Fee, ProjectedField::HasKey];
        let profile = decode_projection(
            &[cell("name", b"Ada"), cell("fee", &30u64.to_be_bytes()), cell("has_key", &[1])],
            &allowed,
        )
        .unwrap();
        assert_eq!(profile.member.name.as_deref(), Some("Ada"));
        assert_eq!(profile.member.fee, Some(30));
        assert_eq!(profile.member.has_key, Some(true));
        assert_eq!(profile.member.city, None);
    }

    #[test]
    fn test_decode_projection_skips_canonical_blob() {
        let blob = encode(&ada()).unwrap();
        let profile = decode_projection(
            &[cell(CANONICAL_COLUMN, &blob), cell("name", b"Ada")],
            &[ProjectedField::Name],
        )
        .unwrap();
        assert_eq!(profile.member.name.as_deref(), Some("Ada"));
        assert_eq!(profile.agreement_pdf, None);

        // A live record with no list fields still decodes
        let empty = decode_projection(&[cell(CANONICAL_COLUMN, &blob)], &[ProjectedField::Name]).unwrap();
        assert_eq!(empty, MemberProfile::default());
    }

    #[test]
    fn test_decode_projection_rejects_bad_columns() {
        let allowed = [ProjectedField::Name, ProjectedField::Fee, ProjectedField::HasKey];
        assert!(matches!(
            decode_projection(&[cell("pwhash", b"x")], &allowed),
            Err(CodecError::UnexpectedColumn(c)) if c == "pwhash"
        ));
        assert!(matches!(
            decode_projection(&[cell("fee", &[0, 20])], &allowed),
            Err(CodecError::Corrupt(_))
        ));
        assert!(matches!(
            decode_projection(&[cell("has_key", &[2])], &allowed),
            Err(CodecError::Corrupt(_))
        ));
    }

    #[test]
    fn test_decode_canonical_cells() {
        let blob = encode(&ada()).unwrap();
        assert_eq!(decode_canonical_cells(&[cell(CANONICAL_COLUMN, &blob)]).unwrap(), ada());
        assert!(matches!(
            decode_canonical_cells(&[cell(CANONICAL_COLUMN, &blob), cell("name", b"Ada")]),
            Err(CodecError::UnexpectedColumn(c)) if c == "name"
        ));
    }

    #[test]
    fn test_column_names_are_unique() {
        assert_eq!(known_columns().len(), ProjectedField::ALL.len() + 1);
        for field in ProjectedField::ALL {
            assert_eq!(ProjectedField::from_column(field.column()), Some(field));
            assert_ne!(field.column(), CANONICAL_COLUMN);
        }
    }
}
