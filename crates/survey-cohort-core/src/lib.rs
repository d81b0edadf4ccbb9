use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CohortError {
    #[error("record table is missing required columns {missing:?}; expected header fields {expected:?}")]
    Schema {
        missing: Vec<String>,
        expected: Vec<String>,
    },
    #[error("value {value:?} is outside the declared domain of field {field}")]
    FieldDomain { field: &'static str, value: String },
    #[error("failed to load clustering model: {0}")]
    ModelLoad(String),
    #[error("model output does not expose a usable cluster label column (tried \"Cluster\", \"prediction_label\")")]
    MissingLabelColumn,
    #[error("cluster label {raw:?} cannot be parsed as a cluster id")]
    LabelFormat { raw: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum AgeBand {
    #[serde(rename = "<18")]
    Under18,
    #[serde(rename = "18-24")]
    Age18To24,
    #[serde(rename = "25-34")]
    Age25To34,
    #[serde(rename = "35-44")]
    Age35To44,
    #[serde(rename = "45-54")]
    Age45To54,
    #[serde(rename = "55-64")]
    Age55To64,
    #[serde(rename = ">=65")]
    Over65,
    #[serde(rename = "unknown")]
    Unknown,
}

impl AgeBand {
    /// Fixed total order of the scale; rank equals position in this array.
    pub const ALL: [Self; 8] = [
        Self::Under18,
        Self::Age18To24,
        Self::Age25To34,
        Self::Age35To44,
        Self::Age45To54,
        Self::Age55To64,
        Self::Over65,
        Self::Unknown,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Under18 => "<18",
            Self::Age18To24 => "18-24",
            Self::Age25To34 => "25-34",
            Self::Age35To44 => "35-44",
            Self::Age45To54 => "45-54",
            Self::Age55To64 => "55-64",
            Self::Over65 => ">=65",
            Self::Unknown => "unknown",
        }
    }

    /// Fails closed: any value absent from the scale maps to `Unknown`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "<18" => Self::Under18,
            "18-24" => Self::Age18To24,
            "25-34" => Self::Age25To34,
            "35-44" => Self::Age35To44,
            "45-54" => Self::Age45To54,
            "55-64" => Self::Age55To64,
            ">=65" => Self::Over65,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn rank(self) -> usize {
        match self {
            Self::Under18 => 0,
            Self::Age18To24 => 1,
            Self::Age25To34 => 2,
            Self::Age35To44 => 3,
            Self::Age45To54 => 4,
            Self::Age55To64 => 5,
            Self::Over65 => 6,
            Self::Unknown => 7,
        }
    }

    /// Ranks past the end of the scale clamp to `Unknown` (the last slot).
    #[must_use]
    pub fn from_rank(rank: usize) -> Self {
        Self::ALL.get(rank).copied().unwrap_or(Self::Unknown)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EduLevel {
    #[serde(rename = "Podstawowe")]
    Podstawowe,
    #[serde(rename = "Średnie")]
    Srednie,
    #[serde(rename = "Wyższe")]
    Wyzsze,
}

impl EduLevel {
    pub const ALL: [Self; 3] = [Self::Podstawowe, Self::Srednie, Self::Wyzsze];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Podstawowe => "Podstawowe",
            Self::Srednie => "Średnie",
            Self::Wyzsze => "Wyższe",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Podstawowe" => Some(Self::Podstawowe),
            "Średnie" => Some(Self::Srednie),
            "Wyższe" => Some(Self::Wyzsze),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum FavAnimals {
    #[serde(rename = "Brak ulubionych")]
    BrakUlubionych,
    #[serde(rename = "Psy")]
    Psy,
    #[serde(rename = "Koty")]
    Koty,
    #[serde(rename = "Inne")]
    Inne,
    #[serde(rename = "Koty i Psy")]
    KotyIPsy,
}

impl FavAnimals {
    pub const ALL: [Self; 5] = [
        Self::BrakUlubionych,
        Self::Psy,
        Self::Koty,
        Self::Inne,
        Self::KotyIPsy,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BrakUlubionych => "Brak ulubionych",
            Self::Psy => "Psy",
            Self::Koty => "Koty",
            Self::Inne => "Inne",
            Self::KotyIPsy => "Koty i Psy",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Brak ulubionych" => Some(Self::BrakUlubionych),
            "Psy" => Some(Self::Psy),
            "Koty" => Some(Self::Koty),
            "Inne" => Some(Self::Inne),
            "Koty i Psy" => Some(Self::KotyIPsy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum FavPlace {
    #[serde(rename = "Nad wodą")]
    NadWoda,
    #[serde(rename = "W lesie")]
    WLesie,
    #[serde(rename = "W górach")]
    WGorach,
    #[serde(rename = "Inne")]
    Inne,
}

impl FavPlace {
    pub const ALL: [Self; 4] = [Self::NadWoda, Self::WLesie, Self::WGorach, Self::Inne];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NadWoda => "Nad wodą",
            Self::WLesie => "W lesie",
            Self::WGorach => "W górach",
            Self::Inne => "Inne",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Nad wodą" => Some(Self::NadWoda),
            "W lesie" => Some(Self::WLesie),
            "W górach" => Some(Self::WGorach),
            "Inne" => Some(Self::Inne),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Gender {
    #[serde(rename = "Mężczyzna")]
    Mezczyzna,
    #[serde(rename = "Kobieta")]
    Kobieta,
}

impl Gender {
    pub const ALL: [Self; 2] = [Self::Mezczyzna, Self::Kobieta];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mezczyzna => "Mężczyzna",
            Self::Kobieta => "Kobieta",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Mężczyzna" => Some(Self::Mezczyzna),
            "Kobieta" => Some(Self::Kobieta),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Age,
    EduLevel,
    FavAnimals,
    FavPlace,
    Gender,
}

impl Field {
    /// Canonical column order for headers, encoding, and export.
    pub const ALL: [Self; 5] = [
        Self::Age,
        Self::EduLevel,
        Self::FavAnimals,
        Self::FavPlace,
        Self::Gender,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Age => "age",
            Self::EduLevel => "edu_level",
            Self::FavAnimals => "fav_animals",
            Self::FavPlace => "fav_place",
            Self::Gender => "gender",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "age" => Some(Self::Age),
            "edu_level" => Some(Self::EduLevel),
            "fav_animals" => Some(Self::FavAnimals),
            "fav_place" => Some(Self::FavPlace),
            "gender" => Some(Self::Gender),
            _ => None,
        }
    }

    /// Serialized forms of the field's domain, in declaration order.
    #[must_use]
    pub fn domain(self) -> Vec<&'static str> {
        match self {
            Self::Age => AgeBand::ALL.iter().map(|band| band.as_str()).collect(),
            Self::EduLevel => EduLevel::ALL.iter().map(|level| level.as_str()).collect(),
            Self::FavAnimals => FavAnimals::ALL.iter().map(|value| value.as_str()).collect(),
            Self::FavPlace => FavPlace::ALL.iter().map(|place| place.as_str()).collect(),
            Self::Gender => Gender::ALL.iter().map(|gender| gender.as_str()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Record {
    pub age: AgeBand,
    pub edu_level: EduLevel,
    pub fav_animals: FavAnimals,
    pub fav_place: FavPlace,
    pub gender: Gender,
}

impl Record {
    /// Builds a record from raw serialized field values.
    ///
    /// Age fails closed to `unknown`; every other field MUST be drawn from
    /// its declared domain.
    ///
    /// # Errors
    /// Returns [`CohortError::FieldDomain`] for a nominal value outside its
    /// declared domain.
    pub fn from_fields(
        age: &str,
        edu_level: &str,
        fav_animals: &str,
        fav_place: &str,
        gender: &str,
    ) -> Result<Self, CohortError> {
        Ok(Self {
            age: AgeBand::parse(age),
            edu_level: EduLevel::parse(edu_level).ok_or_else(|| CohortError::FieldDomain {
                field: "edu_level",
                value: edu_level.to_string(),
            })?,
            fav_animals: FavAnimals::parse(fav_animals).ok_or_else(|| {
                CohortError::FieldDomain {
                    field: "fav_animals",
                    value: fav_animals.to_string(),
                }
            })?,
            fav_place: FavPlace::parse(fav_place).ok_or_else(|| CohortError::FieldDomain {
                field: "fav_place",
                value: fav_place.to_string(),
            })?,
            gender: Gender::parse(gender).ok_or_else(|| CohortError::FieldDomain {
                field: "gender",
                value: gender.to_string(),
            })?,
        })
    }

    #[must_use]
    pub fn field_str(&self, field: Field) -> &'static str {
        match field {
            Field::Age => self.age.as_str(),
            Field::EduLevel => self.edu_level.as_str(),
            Field::FavAnimals => self.fav_animals.as_str(),
            Field::FavPlace => self.fav_place.as_str(),
            Field::Gender => self.gender.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ClusterId(pub u32);

impl Display for ClusterId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq)]
pub struct Assignment {
    pub record: Record,
    pub cluster: ClusterId,
}

pub const PRIMARY_LABEL_COLUMN: &str = "Cluster";
pub const FALLBACK_LABEL_COLUMN: &str = "prediction_label";

/// Textual tag some model versions prepend to the numeric label.
pub const CLUSTER_LABEL_TAG: &str = "Cluster";

/// Named-column value table produced by a clustering model.
///
/// Cells are loosely typed on purpose: label column name and value format
/// are not stable across model versions, and normalization defends against
/// both recognized shapes instead of assuming one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelFrame {
    columns: Vec<(String, Vec<Value>)>,
}

impl LabelFrame {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_column(&mut self, name: impl Into<String>, values: Vec<Value>) {
        self.columns.push((name.into(), values));
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&[Value]> {
        self.columns
            .iter()
            .find(|(column, _)| column == name)
            .map(|(_, values)| values.as_slice())
    }
}

/// Minimal capability the opaque pre-trained model must provide.
pub trait ClusteringModel {
    /// Produces one label per input record, in input order.
    ///
    /// # Errors
    /// Returns [`CohortError::ModelLoad`] when the model cannot evaluate the
    /// batch.
    fn label_batch(&self, records: &[Record]) -> Result<LabelFrame, CohortError>;
}

/// Normalizes a raw model label into a canonical cluster id.
///
/// Accepts a bare non-negative integer or a string with an optional
/// `Cluster` tag (`"Cluster 3"`, `"3"`). Anything else is a hard stop: an
/// unparseable label indicates a model/version mismatch, and guessing would
/// silently mis-assign the user.
///
/// # Errors
/// Returns [`CohortError::LabelFormat`] when the label is not a recognized
/// shape.
pub fn normalize_cluster_id(raw: &Value) -> Result<ClusterId, CohortError> {
    match raw {
        Value::Number(number) => number
            .as_u64()
            .and_then(|id| u32::try_from(id).ok())
            .map(ClusterId)
            .ok_or_else(|| CohortError::LabelFormat {
                raw: raw.to_string(),
            }),
        Value::String(label) => label
            .replace(CLUSTER_LABEL_TAG, "")
            .trim()
            .parse::<u32>()
            .map(ClusterId)
            .map_err(|_| CohortError::LabelFormat { raw: label.clone() }),
        other => Err(CohortError::LabelFormat {
            raw: other.to_string(),
        }),
    }
}

fn label_column<'frame>(
    frame: &'frame LabelFrame,
    expected_len: usize,
) -> Result<&'frame [Value], CohortError> {
    let labels = frame
        .column(PRIMARY_LABEL_COLUMN)
        .or_else(|| frame.column(FALLBACK_LABEL_COLUMN))
        .ok_or(CohortError::MissingLabelColumn)?;

    // A short or long column is the same contract violation as a missing one.
    if labels.len() != expected_len {
        return Err(CohortError::MissingLabelColumn);
    }

    Ok(labels)
}

/// Assigns a cluster id to a single ad-hoc record.
///
/// # Errors
/// Returns [`CohortError::MissingLabelColumn`] when the model output exposes
/// neither recognized label column and [`CohortError::LabelFormat`] when the
/// label value is unparseable.
pub fn assign_one(model: &dyn ClusteringModel, record: Record) -> Result<ClusterId, CohortError> {
    let frame = model.label_batch(&[record])?;
    let labels = label_column(&frame, 1)?;
    normalize_cluster_id(&labels[0])
}

/// Assigns a cluster id to every record in one batched model call.
///
/// Output preserves input order; no record is dropped or reordered.
///
/// # Errors
/// Same failure modes as [`assign_one`].
pub fn assign_all(
    model: &dyn ClusteringModel,
    records: &[Record],
) -> Result<Vec<Assignment>, CohortError> {
    let frame = model.label_batch(records)?;
    let labels = label_column(&frame, records.len())?;

    records
        .iter()
        .zip(labels)
        .map(|(record, label)| {
            Ok(Assignment {
                record: *record,
                cluster: normalize_cluster_id(label)?,
            })
        })
        .collect()
}

/// Records assigned to `target`, original order preserved.
#[must_use]
pub fn partition_by_cluster(assignments: &[Assignment], target: ClusterId) -> Vec<Record> {
    assignments
        .iter()
        .filter(|assignment| assignment.cluster == target)
        .map(|assignment| assignment.record)
        .collect()
}

/// Ascending deduplicated cluster ids observed over a full assignment pass.
#[must_use]
pub fn distinct_cluster_ids(assignments: &[Assignment]) -> Vec<ClusterId> {
    assignments
        .iter()
        .map(|assignment| assignment.cluster)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Median age band of a record subset, computed on rank.
///
/// Categories have no arithmetic meaning; only the declared order does, so
/// the median runs over rank indices. Even-sized groups average the two
/// middle ranks with the tie rounded toward the lower rank.
#[must_use]
pub fn median_age_band(records: &[Record]) -> AgeBand {
    if records.is_empty() {
        return AgeBand::Unknown;
    }

    let mut ranks: Vec<usize> = records.iter().map(|record| record.age.rank()).collect();
    ranks.sort_unstable();

    let middle = ranks.len() / 2;
    let median_rank = if ranks.len() % 2 == 0 {
        (ranks[middle - 1] + ranks[middle]) / 2
    } else {
        ranks[middle]
    };

    AgeBand::from_rank(median_rank)
}

/// Percentage distribution of a field over a record subset.
///
/// Observed categories only, ascending key order, one-decimal rounding.
/// Empty input yields an empty table (a "no data" state, not an error).
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn percent_breakdown(records: &[Record], field: Field) -> BTreeMap<String, f64> {
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for record in records {
        *counts.entry(record.field_str(field)).or_insert(0) += 1;
    }

    let total = records.len() as f64;
    counts
        .into_iter()
        .map(|(category, count)| (category.to_string(), round1(count as f64 / total * 100.0)))
        .collect()
}

/// Five composite trait scores in `[0, 1]` for a record subset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TraitScores {
    pub younger: f64,
    pub nature: f64,
    pub animals: f64,
    pub higher_education: f64,
    pub women: f64,
}

impl TraitScores {
    pub const ZERO: Self = Self {
        younger: 0.0,
        nature: 0.0,
        animals: 0.0,
        higher_education: 0.0,
        women: 0.0,
    };

    #[must_use]
    pub fn as_array(&self) -> [f64; 5] {
        [
            self.younger,
            self.nature,
            self.animals,
            self.higher_education,
            self.women,
        ]
    }
}

/// Computes the trait-score vector for a record subset.
///
/// An empty subset yields the all-zero vector: a zero profile is a valid
/// "no basis for comparison" output, not an error.
#[must_use]
pub fn trait_scores(records: &[Record]) -> TraitScores {
    if records.is_empty() {
        return TraitScores::ZERO;
    }

    TraitScores {
        younger: fraction(records, |record| {
            matches!(
                record.age,
                AgeBand::Under18 | AgeBand::Age18To24 | AgeBand::Age25To34
            )
        }),
        nature: fraction(records, |record| {
            matches!(
                record.fav_place,
                FavPlace::NadWoda | FavPlace::WLesie | FavPlace::WGorach
            )
        }),
        animals: fraction(records, |record| {
            matches!(
                record.fav_animals,
                FavAnimals::Psy | FavAnimals::Koty | FavAnimals::KotyIPsy
            )
        }),
        higher_education: fraction(records, |record| record.edu_level == EduLevel::Wyzsze),
        women: fraction(records, |record| record.gender == Gender::Kobieta),
    }
}

#[allow(clippy::cast_precision_loss)]
fn fraction(records: &[Record], predicate: impl Fn(Record) -> bool) -> f64 {
    records
        .iter()
        .copied()
        .filter(|record| predicate(*record))
        .count() as f64
        / records.len() as f64
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

pub const CATALOG_FALLBACK_DESCRIPTION: &str = "Brak opisu dla tej grupy.";

/// One catalog entry: either a detailed block or a bare display name.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum CatalogEntry {
    Detailed {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        description: Option<String>,
    },
    Name(String),
}

/// Resolved display name and description for one cluster.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClusterProfile {
    pub name: String,
    pub description: String,
}

/// Static cluster id → display metadata mapping, keyed by the id's string
/// form. Loaded once, read-only.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct ClusterCatalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl ClusterCatalog {
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn placeholder_name(cluster: ClusterId) -> String {
        format!("Klaster {cluster}")
    }

    /// Resolves a cluster's display profile.
    ///
    /// Unknown ids and missing fields fall back to the generated placeholder
    /// name and the fixed description; this is never an error.
    #[must_use]
    pub fn profile(&self, cluster: ClusterId) -> ClusterProfile {
        match self.entries.get(&cluster.to_string()) {
            Some(CatalogEntry::Detailed { name, description }) => ClusterProfile {
                name: name
                    .clone()
                    .unwrap_or_else(|| Self::placeholder_name(cluster)),
                description: description
                    .clone()
                    .unwrap_or_else(|| CATALOG_FALLBACK_DESCRIPTION.to_string()),
            },
            Some(CatalogEntry::Name(name)) => ClusterProfile {
                name: name.clone(),
                description: CATALOG_FALLBACK_DESCRIPTION.to_string(),
            },
            None => ClusterProfile {
                name: Self::placeholder_name(cluster),
                description: CATALOG_FALLBACK_DESCRIPTION.to_string(),
            },
        }
    }
}
