use serde::{Deserialize, Serialize};
use std::fmt;

use super::record::ExternalRecord;

/// Entity kinds imported from IGDB, in the only order they may be imported:
/// games reference genres and companies, extensions reference games.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    #[value(name = "genres", alias = "genre")]
    Genre,
    #[value(name = "companies", alias = "company")]
    Company,
    #[value(name = "games", alias = "game")]
    Game,
    #[value(name = "extensions", alias = "extension", alias = "dlc")]
    Extension,
}

/// Columns written by an upsert, besides `igdb_id` and `updated_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertColumn {
    Name,
    Description,
    ReleaseDate,
    ImageUrl,
    ParentId,
}

impl UpsertColumn {
    pub fn column_name(self) -> &'static str {
        match self {
            UpsertColumn::Name => "name",
            UpsertColumn::Description => "description",
            UpsertColumn::ReleaseDate => "release_date",
            UpsertColumn::ImageUrl => "image_url",
            UpsertColumn::ParentId => "game_id",
        }
    }
}

/// Per-kind field mapping and relationship configuration.
#[derive(Debug)]
pub struct KindSpec {
    pub kind: EntityKind,
    pub label: &'static str,
    /// IGDB endpoint path segment under the API base url.
    pub endpoint: &'static str,
    pub fields: &'static str,
    pub base_filter: Option<&'static str>,
    pub table: &'static str,
    pub columns: &'static [UpsertColumn],
    /// IGDB image size preset used to build `image_url`.
    pub image_size: Option<&'static str>,
    pub relations: &'static [RelationKind],
    /// Kind referenced by `parent_game`, resolved into the `game_id` column.
    pub parent: Option<EntityKind>,
    /// Whether the all-kinds run passes the checkpoint's `updated_since` to this kind.
    pub incremental_in_umbrella: bool,
}

static KIND_SPECS: [KindSpec; 4] = [
    KindSpec {
        kind: EntityKind::Genre,
        label: "genres",
        endpoint: "genres",
        fields: "id,name,updated_at",
        base_filter: None,
        table: "genre",
        columns: &[UpsertColumn::Name],
        image_size: None,
        relations: &[],
        parent: None,
        incremental_in_umbrella: false,
    },
    KindSpec {
        kind: EntityKind::Company,
        label: "companies",
        endpoint: "companies",
        fields: "id,name,description,logo.image_id,updated_at",
        base_filter: None,
        table: "company",
        columns: &[
            UpsertColumn::Name,
            UpsertColumn::Description,
            UpsertColumn::ImageUrl,
        ],
        image_size: Some("t_logo_med"),
        relations: &[],
        parent: None,
        incremental_in_umbrella: false,
    },
    KindSpec {
        kind: EntityKind::Game,
        label: "games",
        endpoint: "games",
        fields: "id,name,summary,first_release_date,cover.image_id,genres,involved_companies.company,updated_at",
        base_filter: Some("parent_game = null"),
        table: "game",
        columns: &[
            UpsertColumn::Name,
            UpsertColumn::Description,
            UpsertColumn::ReleaseDate,
            UpsertColumn::ImageUrl,
        ],
        image_size: Some("t_cover_big"),
        relations: &[RelationKind::GameGenre, RelationKind::GameCompany],
        parent: None,
        incremental_in_umbrella: true,
    },
    KindSpec {
        kind: EntityKind::Extension,
        label: "extensions",
        endpoint: "games",
        fields: "id,name,summary,first_release_date,cover.image_id,parent_game,updated_at",
        base_filter: Some("parent_game != null"),
        table: "extension",
        columns: &[
            UpsertColumn::Name,
            UpsertColumn::Description,
            UpsertColumn::ReleaseDate,
            UpsertColumn::ImageUrl,
            UpsertColumn::ParentId,
        ],
        image_size: Some("t_cover_big"),
        relations: &[],
        parent: Some(EntityKind::Game),
        incremental_in_umbrella: false,
    },
];

impl EntityKind {
    pub const RUN_ORDER: [EntityKind; 4] = [
        EntityKind::Genre,
        EntityKind::Company,
        EntityKind::Game,
        EntityKind::Extension,
    ];

    pub fn spec(self) -> &'static KindSpec {
        &KIND_SPECS[self as usize]
    }

    pub fn label(self) -> &'static str {
        self.spec().label
    }

    /// Kinds whose identifier maps a batch of this kind needs, besides its own.
    pub fn referenced_kinds(self) -> Vec<EntityKind> {
        let spec = self.spec();
        let mut kinds: Vec<EntityKind> = spec.relations.iter().map(|r| r.target_kind()).collect();
        if let Some(parent) = spec.parent {
            kinds.push(parent);
        }
        kinds.dedup();
        kinds
    }

    /// External ids of `referenced` kind mentioned by `record`.
    pub fn referenced_external_ids(self, referenced: EntityKind, record: &ExternalRecord) -> Vec<i64> {
        let spec = self.spec();
        let mut ids: Vec<i64> = spec
            .relations
            .iter()
            .filter(|r| r.target_kind() == referenced)
            .flat_map(|r| r.target_external_ids(record).iter().copied())
            .collect();
        if spec.parent == Some(referenced) {
            ids.extend(record.parent_game);
        }
        ids
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Many-to-many relationships owned by games.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelationKind {
    GameGenre,
    GameCompany,
}

impl RelationKind {
    pub fn table(self) -> &'static str {
        match self {
            RelationKind::GameGenre => "game_genre",
            RelationKind::GameCompany => "game_company",
        }
    }

    pub fn owner_column(self) -> &'static str {
        "game_id"
    }

    pub fn target_column(self) -> &'static str {
        match self {
            RelationKind::GameGenre => "genre_id",
            RelationKind::GameCompany => "company_id",
        }
    }

    pub fn target_kind(self) -> EntityKind {
        match self {
            RelationKind::GameGenre => EntityKind::Genre,
            RelationKind::GameCompany => EntityKind::Company,
        }
    }

    pub fn target_external_ids(self, record: &ExternalRecord) -> &[i64] {
        match self {
            RelationKind::GameGenre => &record.genres,
            RelationKind::GameCompany => &record.companies,
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}
