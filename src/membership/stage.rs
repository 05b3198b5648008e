//! Stage layout
//!
//! Each stage owns a key namespace (`prefix` .. `end`, the end being the
//! prefix with its trailing `:` bumped to `;`) inside one column family.

use super::codec::ProjectedField;
use super::models::RecordKey;
use serde::{Deserialize, Serialize};

/// Phase of a membership record. A record lives in exactly one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Application,
    Queued,
    Dequeued,
    Member,
    Archived,
}

/// How a stage's records are read back during enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListView {
    /// From projected columns only
    Projected(&'static [ProjectedField]),
    /// By decoding the canonical blob
    Canonical,
}

const APPLICATION_PROJECTION: &[ProjectedField] = &[
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
    ProjectedField::SourceIp,
    ProjectedField::UserAgent,
    ProjectedField::ApplicationPdf,
];

const MEMBER_PROJECTION: &[ProjectedField] = &[
    ProjectedField::Name,
    ProjectedField::Street,
    ProjectedField::City,
    ProjectedField::Zipcode,
    ProjectedField::Country,
    ProjectedField::Email,
    ProjectedField::Phone,
    ProjectedField::Username,
    ProjectedField::Fee,
    ProjectedField::FeeYearly,
    ProjectedField::HasKey,
    ProjectedField::PaymentsCaughtUpTo,
];

const APPLICATION_LIST: &[ProjectedField] = &[
    ProjectedField::Name,
    ProjectedField::Street,
    ProjectedField::City,
    ProjectedField::Fee,
    ProjectedField::FeeYearly,
];

const MEMBER_LIST: &[ProjectedField] = &[
    ProjectedField::Name,
    ProjectedField::City,
    ProjectedField::Country,
    ProjectedField::Email,
    ProjectedField::Phone,
    ProjectedField::Username,
    ProjectedField::Fee,
    ProjectedField::FeeYearly,
    ProjectedField::HasKey,
    ProjectedField::PaymentsCaughtUpTo,
];

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Application,
        Stage::Queued,
        Stage::Dequeued,
        Stage::Member,
        Stage::Archived,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            Stage::Application => "applicant:",
            Stage::Queued => "queue:",
            Stage::Dequeued => "dequeue:",
            Stage::Member => "member:",
            Stage::Archived => "archive:",
        }
    }

    /// Exclusive upper bound of the namespace
    pub fn end_key(&self) -> &'static str {
        match self {
            Stage::Application => "applicant;",
            Stage::Queued => "queue;",
            Stage::Dequeued => "dequeue;",
            Stage::Member => "member;",
            Stage::Archived => "archive;",
        }
    }

    pub fn family(&self) -> &'static str {
        match self {
            Stage::Application => "application",
            Stage::Queued => "membership_queue",
            Stage::Dequeued => "membership_dequeue",
            Stage::Member => "members",
            Stage::Archived => "membership_archive",
        }
    }

    /// Families that receive a copy of the canonical blob
    pub fn mirror_families(&self) -> &'static [&'static str] {
        match self {
            Stage::Member => &["member_agreements"],
            _ => &[],
        }
    }

    /// Scalar fields duplicated into columns of the primary family
    pub fn projection(&self) -> &'static [ProjectedField] {
        match self {
            Stage::Application => APPLICATION_PROJECTION,
            Stage::Member => MEMBER_PROJECTION,
            Stage::Queued | Stage::Dequeued | Stage::Archived => &[],
        }
    }

    pub fn list_view(&self) -> ListView {
        match self {
            Stage::Application => ListView::Projected(APPLICATION_LIST),
            Stage::Member => ListView::Projected(MEMBER_LIST),
            Stage::Queued | Stage::Dequeued | Stage::Archived => ListView::Canonical,
        }
    }

    /// Records in this stage eventually expire
    pub fn expires(&self) -> bool {
        matches!(self, Stage::Archived)
    }

    /// Field updates are accepted only while the record is live
    pub fn accepts_updates(&self) -> bool {
        matches!(self, Stage::Application | Stage::Queued | Stage::Member)
    }

    pub fn partition_key(&self, key: &RecordKey) -> Vec<u8> {
        let mut partition = self.prefix().as_bytes().to_vec();
        partition.extend_from_slice(key.as_bytes());
        partition
    }

    /// Inverse of [`Stage::partition_key`]
    pub fn record_key(&self, partition: &[u8]) -> Option<RecordKey> {
        let raw = partition.strip_prefix(self.prefix().as_bytes())?;
        let bytes: [u8; 16] = raw.try_into().ok()?;
        Some(RecordKey::from_bytes(bytes))
    }

    /// Name used in URLs (`/api/{segment}`)
    pub fn path_segment(&self) -> &'static str {
        match self {
            Stage::Application => "applications",
            Stage::Queued => "queue",
            Stage::Dequeued => "dequeue",
            Stage::Member => "members",
            Stage::Archived => "archive",
        }
    }

    pub fn from_path_segment(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.path_segment() == segment)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Application => "application",
            Stage::Queued => "queued",
            Stage::Dequeued => "dequeued",
            Stage::Member => "member",
            Stage::Archived => "archived",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaces_cover_exactly_their_prefix() {
        let key = RecordKey::from_bytes([0xff; 16]);
        for stage in Stage::ALL {
            let partition = stage.partition_key(&key);
            assert!(partition.as_slice() >= stage.prefix().as_bytes());
            assert!(partition.as_slice() < stage.end_key().as_bytes());
            assert_eq!(partition.len(), stage.prefix().len() + 16);
        }
    }

    #[test]
    fn test_namespaces_do_not_overlap() {
        let key = RecordKey::from_bytes([0; 16]);
        for stage in Stage::ALL {
            for other in Stage::ALL.into_iter().filter(|o| *o != stage) {
                assert!(other.record_key(&stage.partition_key(&key)).is_none());
            }
        }
    }

    #[test]
    fn test_record_key_round_trip() {
        let key = RecordKey::generate();
        let partition = Stage::Member.partition_key(&key);
        assert_eq!(Stage::Member.record_key(&partition), Some(key));
        assert_eq!(Stage::Member.record_key(b"member:short"), None);
    }

    #[test]
    fn test_list_views_are_within_projection() {
        for stage in Stage::ALL {
            if let ListView::Projected(fields) = stage.list_view() {
                assert!(fields.iter().all(|f| stage.projection().contains(f)));
            }
        }
    }

    #[test]
    fn test_path_segments() {
        for stage in Stage::ALL {
            assert_eq!(Stage::from_path_segment(stage.path_segment()), Some(stage));
        }
        assert_eq!(Stage::from_path_segment("trash"), None);
    }
}
