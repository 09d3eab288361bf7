use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

use super::kinds::EntityKind;

const IGDB_IMAGE_BASE: &str = "https://images.igdb.com/igdb/image/upload";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ImageRef {
    #[serde(default)]
    pub image_id: Option<String>,
}

/// One raw record from IGDB (genre, company, game or extension).
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ExternalRecord {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    /// `summary` for games, `description` for companies.
    #[serde(default, alias = "description")]
    pub summary: Option<String>,
    #[serde(default)]
    pub first_release_date: Option<i64>,
    #[serde(default)]
    pub cover: Option<ImageRef>,
    #[serde(default)]
    pub logo: Option<ImageRef>,
    #[serde(default, deserialize_with = "de_id_refs")]
    pub genres: Vec<i64>,
    /// Company ids read from `involved_companies.company`.
    #[serde(
        default,
        rename = "involved_companies",
        deserialize_with = "de_involved_companies"
    )]
    pub companies: Vec<i64>,
    #[serde(default, deserialize_with = "de_opt_id_ref")]
    pub parent_game: Option<i64>,
    #[serde(default)]
    pub updated_at: Option<i64>,
}

/// Nested references arrive either as bare ids or as expanded `{ "id": n }` objects.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IdRef {
    Id(i64),
    Object { id: i64 },
}

impl IdRef {
    fn id(&self) -> i64 {
        match self {
            IdRef::Id(id) | IdRef::Object { id } => *id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum InvolvedCompanyRef {
    Expanded {
        #[serde(default)]
        company: Option<IdRef>,
    },
    // Unexpanded involved_company ids cannot be mapped to companies.
    Bare(#[allow(dead_code)] i64),
}

fn de_id_refs<'de, D>(deserializer: D) -> Result<Vec<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let refs: Option<Vec<IdRef>> = Option::deserialize(deserializer)?;
    Ok(refs
        .unwrap_or_default()
        .iter()
        .map(IdRef::id)
        .collect())
}

fn de_opt_id_ref<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let r: Option<IdRef> = Option::deserialize(deserializer)?;
    Ok(r.map(|r| r.id()))
}

fn de_involved_companies<'de, D>(deserializer: D) -> Result<Vec<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let refs: Option<Vec<InvolvedCompanyRef>> = Option::deserialize(deserializer)?;
    let mut ids: Vec<i64> = Vec::new();
    for r in refs.unwrap_or_default() {
        if let InvolvedCompanyRef::Expanded { company: Some(c) } = r {
            if !ids.contains(&c.id()) {
                ids.push(c.id());
            }
        }
    }
    Ok(ids)
}

impl ExternalRecord {
    pub fn image_id(&self) -> Option<&str> {
        self.cover
            .as_ref()
            .or(self.logo.as_ref())
            .and_then(|img| img.image_id.as_deref())
            .filter(|s| !s.is_empty())
    }

    pub fn image_url(&self, size: &str) -> Option<String> {
        self.image_id()
            .map(|id| format!("{IGDB_IMAGE_BASE}/{size}/{id}.jpg"))
    }

    pub fn release_date(&self) -> Option<DateTime<Utc>> {
        self.first_release_date
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
    }
}

/// Column values written for one entity by an upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRow {
    pub external_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub release_date: Option<DateTime<Utc>>,
    pub image_url: Option<String>,
    /// Internal id of the owning game (extensions only).
    pub parent_id: Option<i64>,
}

impl EntityRow {
    pub fn from_record(kind: EntityKind, record: &ExternalRecord, parent_id: Option<i64>) -> Self {
        let spec = kind.spec();
        let name = record
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Untitled IGDB {} #{}", kind.label(), record.id));
        Self {
            external_id: record.id,
            name,
            description: record.summary.clone().filter(|s| !s.trim().is_empty()),
            release_date: record.release_date(),
            image_url: spec.image_size.and_then(|size| record.image_url(size)),
            parent_id,
        }
    }
}

/// A stored entity as the store sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalEntity {
    pub id: i64,
    pub external_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub release_date: Option<DateTime<Utc>>,
    pub image_url: Option<String>,
    pub parent_id: Option<i64>,
    pub last_updated_at: DateTime<Utc>,
}
