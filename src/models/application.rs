//! Membership application intake DTOs

use crate::membership::{MemberData, MemberProfile, MembershipMetadata, RecordKey};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidateEmail, ValidationError};

/// Fee floor for monthly payers
pub const MIN_FEE_MONTHLY: u64 = 20;
/// Fee floor for yearly payers
pub const MIN_FEE_YEARLY: u64 = 200;

static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9 .\-]+$").expect("valid phone pattern"));

/// Membership application as submitted by the form
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationRequest {
    #[validate(length(min = 1, code = "no-name", message = "A name is required"))]
    pub name: String,

    #[validate(length(min = 1, code = "no-street", message = "An address is required"))]
    pub street: String,

    #[validate(length(min = 1, code = "no-city", message = "A city is required"))]
    pub city: String,

    #[validate(length(min = 1, code = "no-zip", message = "A zip code is required"))]
    pub zipcode: String,

    #[validate(length(min = 1, code = "no-country", message = "A country is required"))]
    pub country: String,

    #[validate(custom(function = "validate_email_address"))]
    pub email: String,

    #[serde(default)]
    #[validate(custom(function = "validate_phone"))]
    pub phone: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: String,

    #[serde(default)]
    pub password_confirm: String,

    /// Pay once a year instead of monthly
    #[serde(default)]
    pub yearly: bool,

    /// Amount other than the standard fee
    #[serde(default)]
    pub custom_fee: Option<f64>,

    /// A fee below the floor requires a reduction request
    #[serde(default)]
    pub reduction_requested: bool,

    #[serde(default)]
    pub statutes_accepted: bool,
    #[serde(default)]
    pub payment_accepted: bool,
    #[serde(default)]
    pub rules_accepted: bool,
    #[serde(default)]
    pub privacy_accepted: bool,
    #[serde(default)]
    pub email_contact_accepted: bool,
    #[serde(default)]
    pub adult: bool,

    #[serde(default)]
    pub comment: Option<String>,
}

/// A rejected form field together with the counter tag for it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldProblem {
    pub field: String,
    pub reason: String,
    pub message: String,
}

fn validate_email_address(email: &str) -> Result<(), ValidationError> {
    let (code, message) = if email.trim().is_empty() {
        ("no-email", "An email address is required")
    } else if email.validate_email() {
        return Ok(());
    } else {
        ("bad-email-format", "Email should look like a@b.ch")
    };
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    Err(err)
}

fn validate_phone(phone: &str) -> Result<(), ValidationError> {
    if phone.is_empty() || PHONE_RE.is_match(phone) {
        return Ok(());
    }
    let mut err = ValidationError::new("bad-phone-format");
    err.message = Some("Phone number should look like +41 79 123 45 67".into());
    Err(err)
}

impl ApplicationRequest {
    pub fn minimum_fee(&self) -> u64 {
        if self.yearly {
            MIN_FEE_YEARLY
        } else {
            MIN_FEE_MONTHLY
        }
    }

    /// Every problem with the submission. Empty when it can be stored.
    pub fn problems(&self) -> Vec<FieldProblem> {
        let mut problems = Vec::new();

        if let Err(errors) = self.validate() {
            for (field, errs) in errors.field_errors() {
                for e in errs {
                    problems.push(FieldProblem {
                        field: field.to_string(),
                        reason: e.code.to_string(),
                        message: e
                            .message
                            .as_ref()
                            .map(|m| m.to_string())
                            .unwrap_or_else(|| format!("{} is invalid", field)),
                    });
                }
            }
        }

        let mut problem = |field: &str, reason: &str, message: String| {
            problems.push(FieldProblem {
                field: field.to_string(),
                reason: reason.to_string(),
                message,
            })
        };

        if self.password != self.password_confirm {
            problem("password", "password-mismatch", "Passwords do not match".to_string());
        }

        let acceptances = [
            (self.statutes_accepted, "statutesAccepted", "statutes-not-accepted", "The statutes must be accepted"),
            (self.payment_accepted, "paymentAccepted", "payment-not-accepted", "Willingness to pay is required"),
            (self.rules_accepted, "rulesAccepted", "rules-not-accepted", "The rules must be accepted"),
            (self.privacy_accepted, "privacyAccepted", "gdpr-not-accepted", "Data processing must be permitted"),
            (self.email_contact_accepted, "emailContactAccepted", "email-not-accepted", "Email contact must be permitted"),
            (self.adult, "adult", "not-gt18", "Members must be at least 18 years old"),
        ];
        for (accepted, field, reason, message) in acceptances {
            if !accepted {
                problem(field, reason, message.to_string());
            }
        }

        if let Some(fee) = self.custom_fee {
            if !fee.is_finite() || fee < 0.0 || fee > u32::MAX as f64 {
                problem("customFee", "fee-out-of-range", "The fee is out of range".to_string());
            } else if fee < self.minimum_fee() as f64 && !self.reduction_requested {
                problem(
                    "customFee",
                    "low-fee-without-reduction",
                    format!(
                        "A fee below {} requires a reduction request",
                        self.minimum_fee()
                    ),
                );
            }
        }

        problems
    }

    pub fn fee(&self) -> u64 {
        match self.custom_fee {
            // Fractions are dropped
            Some(fee) => fee as u64,
            None => self.minimum_fee(),
        }
    }

    /// Build the record to store. `pwhash` is the already hashed password.
    pub fn into_profile(
        self,
        pwhash: Option<String>,
        source_ip: Option<String>,
        user_agent: Option<String>,
    ) -> MemberProfile {
        let fee = self.fee();
        MemberProfile {
            member: MemberData {
                name: Some(self.name),
                street: Some(self.street),
                city: Some(self.city),
                zipcode: Some(self.zipcode),
                country: Some(self.country),
                email: Some(self.email),
                email_verified: Some(false),
                phone: self.phone.filter(|p| !p.is_empty()),
                username: self
                    .username
                    .map(|u| u.trim().to_lowercase())
                    .filter(|u| !u.is_empty()),
                pwhash,
                fee: Some(fee),
                fee_yearly: Some(self.yearly),
                ..Default::default()
            },
            metadata: MembershipMetadata {
                request_source_ip: source_ip,
                user_agent,
                comment: self.comment.filter(|c| !c.is_empty()),
                ..Default::default()
            },
            agreement_pdf: None,
        }
    }
}

/// Response to a stored application
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationCreated {
    pub key: RecordKey,
    pub fee: u64,
    pub fee_yearly: bool,
}
