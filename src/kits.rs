use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};

/// Where a kit's telemetry arrives from. Promotion is monotone: a kit seen
/// over both transports becomes `Both` and never demotes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DbEnum, Serialize, Deserialize)]
#[ExistingTypePath = "crate::schema::sql_types::KitSource"]
#[serde(rename_all = "lowercase")]
pub enum KitSource {
    Http,
    Mqtt,
    Both,
}

impl KitSource {
    /// Lattice join: `http ∨ mqtt = both`; `both` absorbs everything.
    pub fn merge(self, incoming: KitSource) -> KitSource {
        match (self, incoming) {
            (KitSource::Both, _) | (_, KitSource::Both) => KitSource::Both,
            (a, b) if a == b => a,
            _ => KitSource::Both,
        }
    }
}

impl std::fmt::Display for KitSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KitSource::Http => write!(f, "http"),
            KitSource::Mqtt => write!(f, "mqtt"),
            KitSource::Both => write!(f, "both"),
        }
    }
}

/// Liveness classification derived from `last_seen` by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, DbEnum, Serialize, Deserialize)]
#[ExistingTypePath = "crate::schema::sql_types::KitStatus"]
#[serde(rename_all = "lowercase")]
pub enum KitStatus {
    Online,
    Stale,
    Offline,
    Error,
    Unknown,
}

impl std::fmt::Display for KitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KitStatus::Online => write!(f, "online"),
            KitStatus::Stale => write!(f, "stale"),
            KitStatus::Offline => write!(f, "offline"),
            KitStatus::Error => write!(f, "error"),
            KitStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// A registered field sensor kit.
#[derive(Debug, Clone, Queryable, QueryableByName, Selectable, Serialize)]
#[diesel(table_name = crate::schema::kits)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct Kit {
    pub kit_id: String,
    pub name: String,
    pub location: Option<String>,
    pub api_url: Option<String>,
    pub source: KitSource,
    pub enabled: bool,
    pub disabled_by_admin: bool,
    pub status: KitStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Kit {
    /// Kits the HTTP collector should poll: enabled, HTTP-capable, with a
    /// base URL.
    pub fn pollable(&self) -> bool {
        self.enabled
            && self.source != KitSource::Mqtt
            && self.api_url.as_deref().is_some_and(|u| !u.is_empty())
    }
}

/// Insert model for new kits.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = crate::schema::kits)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewKit {
    pub kit_id: String,
    pub name: String,
    pub location: Option<String>,
    pub api_url: Option<String>,
    pub source: KitSource,
    pub enabled: bool,
}

/// An upsert request against the registry. `None` fields are left untouched
/// on an existing row; `source` always merges through the lattice.
#[derive(Debug, Clone)]
pub struct KitUpsert {
    pub kit_id: String,
    pub name: Option<String>,
    pub location: Option<String>,
    pub api_url: Option<String>,
    pub source: KitSource,
    pub enabled: Option<bool>,
}

impl KitUpsert {
    /// Minimal upsert used by bus auto-registration: kit id only, source
    /// `mqtt`, no API URL.
    pub fn auto_registered(kit_id: &str) -> Self {
        Self {
            kit_id: kit_id.to_string(),
            name: None,
            location: None,
            api_url: None,
            source: KitSource::Mqtt,
            enabled: Some(true),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_lattice_join() {
        assert_eq!(KitSource::Http.merge(KitSource::Mqtt), KitSource::Both);
        assert_eq!(KitSource::Mqtt.merge(KitSource::Http), KitSource::Both);
        assert_eq!(KitSource::Http.merge(KitSource::Http), KitSource::Http);
        assert_eq!(KitSource::Mqtt.merge(KitSource::Mqtt), KitSource::Mqtt);
    }

    #[test]
    fn test_source_lattice_both_is_absorbing() {
        for s in [KitSource::Http, KitSource::Mqtt, KitSource::Both] {
            assert_eq!(KitSource::Both.merge(s), KitSource::Both);
            assert_eq!(s.merge(KitSource::Both), KitSource::Both);
        }
    }

    #[test]
    fn test_pollable_requires_url_and_enabled() {
        let mut kit = Kit {
            kit_id: "wardragon-001".into(),
            name: "Test".into(),
            location: None,
            api_url: Some("http://10.0.0.5:8080".into()),
            source: KitSource::Http,
            enabled: true,
            disabled_by_admin: false,
            status: KitStatus::Unknown,
            last_seen: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(kit.pollable());

        kit.enabled = false;
        assert!(!kit.pollable());

        kit.enabled = true;
        kit.source = KitSource::Mqtt;
        assert!(!kit.pollable());

        kit.source = KitSource::Both;
        kit.api_url = None;
        assert!(!kit.pollable());
    }
}
