//! Code signing models produced by credential preparation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::PathBuf;

// ============================================================================
// Distribution Type
// ============================================================================

/// How an app signed with a provisioning profile may be distributed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DistributionType {
    AdHoc,
    AppStore,
    Enterprise,
}

impl DistributionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DistributionType::AdHoc => "ad-hoc",
            DistributionType::AppStore => "app-store",
            DistributionType::Enterprise => "enterprise",
        }
    }
}

impl std::str::FromStr for DistributionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ad-hoc" | "adhoc" => Ok(DistributionType::AdHoc),
            "app-store" | "appstore" => Ok(DistributionType::AppStore),
            "enterprise" => Ok(DistributionType::Enterprise),
            _ => Err(format!("Unknown distribution type: {}", s)),
        }
    }
}

impl std::fmt::Display for DistributionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Provisioning Profile Data
// ============================================================================

/// Fields derived from a decoded provisioning profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningProfileData {
    /// Location of the installed `.mobileprovision` file.
    pub path: PathBuf,
    /// Build target this profile was supplied for.
    pub target: String,
    /// Bundle identifier from the `application-identifier` entitlement,
    /// without the team prefix.
    pub bundle_identifier: String,
    pub team_id: String,
    pub uuid: String,
    pub name: String,
    /// DER bytes of the first embedded developer certificate.
    #[serde(serialize_with = "serialize_base64")]
    pub developer_certificate: Vec<u8>,
    /// Common name of the certificate the caller supplied for this target.
    pub certificate_common_name: String,
    pub distribution_type: DistributionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

fn serialize_base64<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    serializer.serialize_str(&BASE64.encode(bytes))
}

// ============================================================================
// Credentials
// ============================================================================

/// Everything downstream build tooling needs to sign an iOS build.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub application_target_provisioning_profile: ProvisioningProfileData,
    pub keychain_path: PathBuf,
    pub target_provisioning_profiles: BTreeMap<String, ProvisioningProfileData>,
    pub distribution_type: DistributionType,
    pub team_id: String,
}

impl Credentials {
    /// Maps each bundle identifier to the UUID of its provisioning profile,
    /// the shape expected by `exportOptions.plist`.
    pub fn export_provisioning_profiles(&self) -> BTreeMap<String, String> {
        self.target_provisioning_profiles
            .values()
            .map(|p| (p.bundle_identifier.clone(), p.uuid.clone()))
            .collect()
    }
}
