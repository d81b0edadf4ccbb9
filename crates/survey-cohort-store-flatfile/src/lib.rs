#![allow(clippy::missing_errors_doc)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use survey_cohort_core::{
    Assignment, ClusterCatalog, ClusterId, ClusteringModel, CohortError, Field, LabelFrame,
    Record, PRIMARY_LABEL_COLUMN,
};
use time::OffsetDateTime;

/// Fixed resource names inside the data directory.
pub const RECORD_FILE: &str = "welcome_survey_simple_v2.csv";
pub const MODEL_FILE: &str = "welcome_survey_clustering_pipeline_v2.json";
pub const CATALOG_FILE: &str = "welcome_survey_cluster_names_and_descriptions_v2.json";

pub const FIELD_SEPARATOR: &str = ";";
pub const EXPORT_CLUSTER_COLUMN: &str = "cluster_id";
pub const MODEL_ARTIFACT_VERSION: &str = "welcome_survey_kmeans.v2";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum AppendOutcome {
    Appended,
    Duplicate,
}

/// Append-only record table backed by a delimited flat file.
///
/// The table is the single source of truth; rows keep arrival order and are
/// never deleted or reordered. Loads are memoized until a successful append
/// (or an explicit [`FlatFileStore::invalidate`]) drops the snapshot.
pub struct FlatFileStore {
    path: PathBuf,
    cache: Option<Arc<Vec<Record>>>,
}

impl FlatFileStore {
    #[must_use]
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cache: None,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the full table, creating it (header only) when absent.
    ///
    /// Repeated calls without an intervening append return the same
    /// snapshot without re-reading the backing file. Fails with
    /// [`CohortError::Schema`] when an existing file lacks any required
    /// column.
    pub fn load(&mut self) -> Result<Arc<Vec<Record>>> {
        if let Some(snapshot) = &self.cache {
            return Ok(Arc::clone(snapshot));
        }

        let snapshot = Arc::new(self.read_all()?);
        debug!(
            "loaded {} records from {}",
            snapshot.len(),
            self.path.display()
        );
        self.cache = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    /// Dedup append: a field-wise identical record is a silent no-op.
    ///
    /// Otherwise the record is appended at the end and the whole file is
    /// rewritten synchronously before returning; the memoized snapshot is
    /// invalidated so the next load re-reads from disk.
    ///
    /// Concurrent appends from independent sessions sharing this file are
    /// last-writer-wins. Deployments needing true multi-session safety must
    /// add an external lock around the read-rewrite cycle; none is taken
    /// here (open requirement).
    pub fn append(&mut self, record: &Record) -> Result<AppendOutcome> {
        let snapshot = self.load()?;
        if snapshot.iter().any(|existing| existing == record) {
            debug!("duplicate record skipped on append");
            return Ok(AppendOutcome::Duplicate);
        }

        let mut records: Vec<Record> = snapshot.as_ref().clone();
        records.push(*record);
        self.write_all(&records)?;
        self.invalidate();
        info!("appended record; table now holds {} rows", records.len());
        Ok(AppendOutcome::Appended)
    }

    /// Drops the memoized snapshot; the next load re-reads the file.
    pub fn invalidate(&mut self) {
        self.cache = None;
    }

    fn read_all(&self) -> Result<Vec<Record>> {
        if !self.path.exists() {
            fs::write(&self.path, format!("{}\n", canonical_header())).with_context(|| {
                format!("failed to create record table at {}", self.path.display())
            })?;
            info!("created empty record table at {}", self.path.display());
            return Ok(Vec::new());
        }

        let body = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read record table at {}", self.path.display()))?;
        parse_table(&body)
    }

    fn write_all(&self, records: &[Record]) -> Result<()> {
        let mut body = canonical_header();
        body.push('\n');
        for record in records {
            body.push_str(&format_row(record));
            body.push('\n');
        }

        fs::write(&self.path, body)
            .with_context(|| format!("failed to write record table at {}", self.path.display()))
    }
}

#[must_use]
pub fn canonical_header() -> String {
    Field::ALL.map(Field::as_str).join(FIELD_SEPARATOR)
}

fn format_row(record: &Record) -> String {
    Field::ALL
        .map(|field| record.field_str(field))
        .join(FIELD_SEPARATOR)
}

fn parse_table(body: &str) -> Result<Vec<Record>> {
    let mut lines = body.lines();
    let header = lines.next().unwrap_or("").trim_start_matches('\u{feff}');

    let columns: Vec<&str> = header
        .split(FIELD_SEPARATOR)
        .map(str::trim)
        .collect();

    // Columns are detected by name; the physical order is not required to
    // match the canonical one.
    let mut indices = [0_usize; 5];
    let mut missing = Vec::new();
    for (slot, field) in Field::ALL.iter().enumerate() {
        match columns.iter().position(|column| *column == field.as_str()) {
            Some(position) => indices[slot] = position,
            None => missing.push(field.as_str().to_string()),
        }
    }

    if !missing.is_empty() {
        return Err(CohortError::Schema {
            missing,
            expected: Field::ALL.iter().map(|field| field.as_str().to_string()).collect(),
        }
        .into());
    }

    let mut records = Vec::new();
    for (offset, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }

        let cells: Vec<&str> = line.split(FIELD_SEPARATOR).collect();
        let cell = |slot: usize| cells.get(indices[slot]).map_or("", |value| value.trim());
        let record = Record::from_fields(cell(0), cell(1), cell(2), cell(3), cell(4))
            .with_context(|| format!("invalid record at line {}", offset + 2))?;
        records.push(record);
    }

    Ok(records)
}

#[derive(Debug, Clone, Deserialize)]
struct ArtifactDoc {
    artifact_version: String,
    cluster_count: usize,
    encoding: BTreeMap<String, Vec<String>>,
    centroids: Vec<Vec<f64>>,
}

/// Pre-trained k-means pipeline artifact: per-field one-hot encoding lists
/// plus centroids in encoded space. Opaque to the assignment engine, which
/// only sees the [`ClusteringModel`] capability.
pub struct KMeansModelArtifact {
    encoding: Vec<(Field, Vec<String>)>,
    centroids: Vec<Vec<f64>>,
}

impl KMeansModelArtifact {
    /// Loads and validates the artifact.
    ///
    /// Any missing, unreadable, or internally inconsistent artifact is a
    /// [`CohortError::ModelLoad`]: the caller must halt rather than guess.
    pub fn load(path: &Path) -> Result<Self, CohortError> {
        let body = fs::read_to_string(path).map_err(|err| {
            CohortError::ModelLoad(format!("cannot read {}: {err}", path.display()))
        })?;

        let doc: ArtifactDoc = serde_json::from_str(body.trim_start_matches('\u{feff}'))
            .map_err(|err| {
                CohortError::ModelLoad(format!("invalid artifact JSON in {}: {err}", path.display()))
            })?;

        if doc.artifact_version != MODEL_ARTIFACT_VERSION {
            return Err(CohortError::ModelLoad(format!(
                "unsupported artifact version {:?} (expected {MODEL_ARTIFACT_VERSION:?})",
                doc.artifact_version
            )));
        }

        if doc.cluster_count == 0 || doc.centroids.len() != doc.cluster_count {
            return Err(CohortError::ModelLoad(format!(
                "artifact declares {} clusters but carries {} centroids",
                doc.cluster_count,
                doc.centroids.len()
            )));
        }

        let mut encoding = Vec::with_capacity(Field::ALL.len());
        for field in Field::ALL {
            let categories = doc
                .encoding
                .get(field.as_str())
                .filter(|categories| !categories.is_empty())
                .ok_or_else(|| {
                    CohortError::ModelLoad(format!(
                        "artifact encoding is missing field {:?}",
                        field.as_str()
                    ))
                })?;
            encoding.push((field, categories.clone()));
        }

        let width: usize = encoding.iter().map(|(_, categories)| categories.len()).sum();
        if let Some(centroid) = doc.centroids.iter().find(|centroid| centroid.len() != width) {
            return Err(CohortError::ModelLoad(format!(
                "centroid width {} does not match encoding width {width}",
                centroid.len()
            )));
        }

        Ok(Self {
            encoding,
            centroids: doc.centroids,
        })
    }

    #[must_use]
    pub fn cluster_count(&self) -> usize {
        self.centroids.len()
    }

    fn encode(&self, record: &Record) -> Vec<f64> {
        let mut point = Vec::with_capacity(self.centroids.first().map_or(0, Vec::len));
        for (field, categories) in &self.encoding {
            let value = record.field_str(*field);
            for category in categories {
                point.push(if category == value { 1.0 } else { 0.0 });
            }
        }
        point
    }

    fn nearest_centroid(&self, point: &[f64]) -> usize {
        let mut best = 0_usize;
        let mut best_distance = f64::INFINITY;
        for (index, centroid) in self.centroids.iter().enumerate() {
            let distance: f64 = centroid
                .iter()
                .zip(point)
                .map(|(coordinate, value)| (coordinate - value) * (coordinate - value))
                .sum();
            // Strict comparison keeps the lowest index on ties.
            if distance < best_distance {
                best = index;
                best_distance = distance;
            }
        }
        best
    }
}

impl ClusteringModel for KMeansModelArtifact {
    fn label_batch(&self, records: &[Record]) -> Result<LabelFrame, CohortError> {
        let labels = records
            .iter()
            .map(|record| {
                let nearest = self.nearest_centroid(&self.encode(record));
                Value::String(format!("Cluster {nearest}"))
            })
            .collect();

        let mut frame = LabelFrame::new();
        frame.push_column(PRIMARY_LABEL_COLUMN, labels);
        Ok(frame)
    }
}

/// Loads the cluster catalog document. A UTF-8 BOM is tolerated; a corrupt
/// document is fatal, while missing ids inside a valid document are not.
pub fn load_catalog(path: &Path) -> Result<ClusterCatalog> {
    let body = fs::read_to_string(path)
        .with_context(|| format!("failed to read cluster catalog at {}", path.display()))?;
    let catalog: ClusterCatalog = serde_json::from_str(body.trim_start_matches('\u{feff}'))
        .with_context(|| format!("invalid cluster catalog JSON at {}", path.display()))?;
    info!("loaded cluster catalog with {} entries", catalog.len());
    Ok(catalog)
}

/// Delimited byte stream of one cluster's records (fields plus computed
/// cluster id), original order preserved.
#[must_use]
pub fn export_cluster_csv(assignments: &[Assignment], target: ClusterId) -> Vec<u8> {
    let mut body = format!("{}{FIELD_SEPARATOR}{EXPORT_CLUSTER_COLUMN}\n", canonical_header());
    for assignment in assignments
        .iter()
        .filter(|assignment| assignment.cluster == target)
    {
        body.push_str(&format_row(&assignment.record));
        body.push_str(FIELD_SEPARATOR);
        body.push_str(&assignment.cluster.to_string());
        body.push('\n');
    }
    body.into_bytes()
}

/// Deterministic export file name for a cluster subset at a given instant.
pub fn export_file_name(target: ClusterId, at: OffsetDateTime) -> Result<String> {
    let format = time::format_description::parse("[year][month][day]_[hour][minute][second]")
        .context("invalid export timestamp format description")?;
    let stamp = at
        .format(&format)
        .context("failed to format export timestamp")?;
    Ok(format!("cohort_{target}_{stamp}.csv"))
}

/// Explicit process-wide cache of the three backing resources.
///
/// Lifecycle: init-on-first-use, invalidate-on-write (appends drop the
/// record snapshot), and [`SessionState::clear`] for the explicit
/// cache-clear control. Passed by reference into each render pass.
pub struct SessionState {
    data_dir: PathBuf,
    store: FlatFileStore,
    model: Option<Arc<KMeansModelArtifact>>,
    catalog: Option<Arc<ClusterCatalog>>,
}

impl SessionState {
    #[must_use]
    pub fn open(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            store: FlatFileStore::open(data_dir.join(RECORD_FILE)),
            model: None,
            catalog: None,
        }
    }

    pub fn records(&mut self) -> Result<Arc<Vec<Record>>> {
        self.store.load()
    }

    pub fn append_record(&mut self, record: &Record) -> Result<AppendOutcome> {
        self.store.append(record)
    }

    pub fn model(&mut self) -> Result<Arc<KMeansModelArtifact>> {
        if let Some(model) = &self.model {
            return Ok(Arc::clone(model));
        }

        let loaded = Arc::new(KMeansModelArtifact::load(&self.data_dir.join(MODEL_FILE))?);
        info!("loaded clustering model with {} clusters", loaded.cluster_count());
        self.model = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    pub fn catalog(&mut self) -> Result<Arc<ClusterCatalog>> {
        if let Some(catalog) = &self.catalog {
            return Ok(Arc::clone(catalog));
        }

        let loaded = Arc::new(load_catalog(&self.data_dir.join(CATALOG_FILE))?);
        self.catalog = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    /// Drops every memoized resource; the next access reloads from disk.
    pub fn clear(&mut self) {
        self.store.invalidate();
        self.model = None;
        self.catalog = None;
        debug!("session caches cleared");
    }
}
