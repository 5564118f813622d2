//! Core types shared across the credential engine.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A signed credential accepted by the remote query API.
///
/// Identity is `id` (the challenge uuid). Every other field may be replaced
/// in place; liveness is derived from `issued_at` at read time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Challenge uuid the credential was signed for
    pub id: String,

    /// Authentication token obtained before the challenge
    pub token: String,

    /// Signature returned by the verification endpoint
    pub sign: String,

    /// Rotating continuation value attached by the query endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rci: Option<String>,

    /// When the credential was issued
    pub issued_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(id: impl Into<String>, token: impl Into<String>, sign: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
            sign: sign.into(),
            rci: None,
            issued_at: Utc::now(),
        }
    }

    /// Age of the credential at `now`
    pub fn age_at(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.issued_at
    }

    /// Live iff `now - issued_at <= ttl` (inclusive boundary)
    pub fn is_live_at(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        let ttl = TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX);
        self.age_at(now) <= ttl
    }

    /// Merge the set fields of `patch`, leaving `id` and `issued_at` untouched
    pub fn apply(&mut self, patch: CredentialPatch) {
        if let Some(token) = patch.token {
            self.token = token;
        }
        if let Some(sign) = patch.sign {
            self.sign = sign;
        }
        if let Some(rci) = patch.rci {
            self.rci = Some(rci);
        }
    }
}

/// Partial credential update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sign: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rci: Option<String>,
}

impl CredentialPatch {
    pub fn rci(rci: impl Into<String>) -> Self {
        Self {
            rci: Some(rci.into()),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.sign.is_none() && self.rci.is_none()
    }
}

/// A candidate region in source-image pixel coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
    pub score: f32,
}

impl DetectionBox {
    pub fn area(&self) -> i64 {
        i64::from(self.width.max(0)) * i64::from(self.height.max(0))
    }
}

/// A click point submitted for one target glyph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchedPoint {
    pub x: i32,
    pub y: i32,
}

/// Detector input geometry and the number of targets a challenge carries.
///
/// Two challenge variants exist; they share the localization routine and
/// differ only in these parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeGeometry {
    /// Detector input width
    pub input_width: u32,

    /// Detector input height
    pub input_height: u32,

    /// Number of boxes the localizer must return
    pub targets: usize,
}

impl ChallengeGeometry {
    /// Click-word challenge served by the ICP filing query API
    pub const ICP: ChallengeGeometry = ChallengeGeometry {
        input_width: 512,
        input_height: 192,
        targets: 5,
    };

    /// Click-word challenge served by the public-security filing portal
    pub const MPS: ChallengeGeometry = ChallengeGeometry {
        input_width: 330,
        input_height: 155,
        targets: 4,
    };
}

/// Named geometry presets, selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeometryPreset {
    #[default]
    Icp,
    Mps,
}

impl GeometryPreset {
    pub fn geometry(&self) -> ChallengeGeometry {
        match self {
            Self::Icp => ChallengeGeometry::ICP,
            Self::Mps => ChallengeGeometry::MPS,
        }
    }
}

/// One page of query results as returned to consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPage {
    pub keyword: String,
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub records: Vec<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_boundary_is_inclusive() {
        let now = Utc::now();
        let mut credential = Credential::new("id", "token", "sign");
        credential.issued_at = now - TimeDelta::seconds(60);

        assert!(credential.is_live_at(Duration::from_secs(60), now));
        assert!(credential.is_live_at(Duration::from_secs(61), now));
        assert!(!credential.is_live_at(Duration::from_secs(59), now));
    }

    #[test]
    fn test_apply_patch_keeps_identity_and_timestamp() {
        let mut credential = Credential::new("id", "token", "sign");
        let issued_at = credential.issued_at;

        credential.apply(CredentialPatch::rci("rotated"));
        credential.apply(CredentialPatch {
            sign: Some("resigned".into()),
            ..Default::default()
        });

        assert_eq!(credential.id, "id");
        assert_eq!(credential.token, "token");
        assert_eq!(credential.sign, "resigned");
        assert_eq!(credential.rci.as_deref(), Some("rotated"));
        assert_eq!(credential.issued_at, issued_at);
    }

    #[test]
    fn test_geometry_presets() {
        assert_eq!(GeometryPreset::Icp.geometry().targets, 5);
        assert_eq!(GeometryPreset::Mps.geometry().input_width, 330);
        let preset: GeometryPreset = serde_json::from_str("\"mps\"").unwrap();
        assert_eq!(preset, GeometryPreset::Mps);
    }
}
