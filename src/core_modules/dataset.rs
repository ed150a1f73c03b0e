// THEORY:
// The dataset is plain files under one root so that it can be inspected,
// copied and trimmed by hand:
//
//   <root>/screenshots/minimap_<uuid>/minimap_<uuid>.png   raw capture (+ debug masks)
//   <root>/csv/labels_csv/labels_<uuid>.csv                one label record per sample
//   <root>/csv/merged_samples_csv/all_labels.csv           aggregate ledger
//
// The per-sample label files are the source of truth. The ledger is derived
// from them and is rewritten in full whenever samples are evicted, so it can
// never disagree with the label files for longer than one prune pass.

use crate::core_modules::classifier::{AngleMicro, Classification, DistanceMicro};
use crate::core_modules::utils::geometry::Point2;
use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub const LABEL_COLUMNS: [&str; 12] = [
    "green_x",
    "green_y",
    "red_x",
    "red_y",
    "red_tip_x",
    "red_tip_y",
    "distance_px",
    "angle_deg",
    "angle_micro",
    "angle_macro",
    "distance_micro",
    "distance_macro",
];

pub const LEDGER_COLUMNS: [&str; 7] = [
    "uuid",
    "distance_px",
    "distance_macro",
    "distance_micro",
    "angle_deg",
    "angle_macro",
    "angle_micro",
];

const LABEL_PREFIX: &str = "labels_";
const SAMPLE_DIR_PREFIX: &str = "minimap_";

/// Paths of every dataset artifact under one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetLayout {
    root: PathBuf,
}

impl DatasetLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn screenshots_dir(&self) -> PathBuf {
        self.root.join("screenshots")
    }

    pub fn labels_dir(&self) -> PathBuf {
        self.root.join("csv").join("labels_csv")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join("csv").join("merged_samples_csv").join("all_labels.csv")
    }

    pub fn sample_dir(&self, uuid: &Uuid) -> PathBuf {
        self.screenshots_dir().join(format!("{SAMPLE_DIR_PREFIX}{uuid}"))
    }

    pub fn capture_path(&self, uuid: &Uuid) -> PathBuf {
        self.sample_dir(uuid).join(format!("{SAMPLE_DIR_PREFIX}{uuid}.png"))
    }

    pub fn debug_mask_path(&self, uuid: &Uuid, marker: &str) -> PathBuf {
        self.sample_dir(uuid).join(format!("{marker}_mask.png"))
    }

    pub fn label_path(&self, uuid: &Uuid) -> PathBuf {
        self.labels_dir().join(format!("{LABEL_PREFIX}{uuid}.csv"))
    }

    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.screenshots_dir(),
            self.labels_dir(),
            self.ledger_path().parent().map(Path::to_path_buf).unwrap_or_default(),
        ] {
            fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Every `labels_*.csv` file, sorted by name. A missing directory is an empty dataset.
    pub fn label_files(&self) -> Result<Vec<PathBuf>> {
        let dir = self.labels_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("Failed to list {}", dir.display()))? {
            let path = entry?.path();
            let is_label = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with(LABEL_PREFIX) && name.ends_with(".csv"));
            if is_label && path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Removes a sample's label file and capture directory, logging failures.
    /// Returns whether the label file is gone.
    pub fn remove_sample(&self, label_path: &Path, uuid: Option<&Uuid>) -> bool {
        let label_removed = match fs::remove_file(label_path) {
            Ok(()) => true,
            Err(err) => {
                warn!("Could not remove {}: {}", label_path.display(), err);
                !label_path.exists()
            }
        };
        // A label that survives keeps its capture.
        if let (true, Some(uuid)) = (label_removed, uuid) {
            self.remove_sample_dir(uuid);
        }
        label_removed
    }

    pub fn remove_sample_dir(&self, uuid: &Uuid) {
        let dir = self.sample_dir(uuid);
        if dir.exists() {
            if let Err(err) = fs::remove_dir_all(&dir) {
                warn!("Could not remove {}: {}", dir.display(), err);
            }
        }
    }
}

/// UUID encoded in a `labels_<uuid>.csv` file name.
pub fn uuid_from_label_path(path: &Path) -> Option<Uuid> {
    let stem = path.file_stem()?.to_str()?;
    Uuid::parse_str(stem.strip_prefix(LABEL_PREFIX)?).ok()
}

/// One persisted sample's label.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleLabel {
    pub uuid: Uuid,
    pub angle_deg: f64,
    pub distance_px: f64,
    #[serde(flatten)]
    pub labels: Classification,
    pub timestamp: DateTime<Utc>,
}

impl SampleLabel {
    pub fn new(uuid: Uuid, angle_deg: f64, distance_px: f64, labels: Classification) -> Self {
        Self {
            uuid,
            angle_deg,
            distance_px,
            labels,
            timestamp: Utc::now(),
        }
    }
}

/// Everything written to a per-sample label file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabelRecord {
    pub target: Point2,
    pub reference: Point2,
    pub reference_tip: Point2,
    pub sample: SampleLabel,
}

fn label_row(record: &LabelRecord) -> String {
    let sample = &record.sample;
    let labels = &sample.labels;
    [
        format!("{:.2}", record.target.0),
        format!("{:.2}", record.target.1),
        format!("{:.2}", record.reference.0),
        format!("{:.2}", record.reference.1),
        format!("{:.2}", record.reference_tip.0),
        format!("{:.2}", record.reference_tip.1),
        format!("{:.3}", sample.distance_px),
        format!("{:.3}", sample.angle_deg),
        labels.angle_micro.to_string(),
        labels.angle_macro.to_string(),
        labels.distance_micro.to_string(),
        labels.distance_macro.to_string(),
    ]
    .join(",")
}

fn ledger_row(sample: &SampleLabel) -> String {
    let labels = &sample.labels;
    [
        sample.uuid.to_string(),
        format!("{:.3}", sample.distance_px),
        labels.distance_macro.to_string(),
        labels.distance_micro.to_string(),
        format!("{:.3}", sample.angle_deg),
        labels.angle_macro.to_string(),
        labels.angle_micro.to_string(),
    ]
    .join(",")
}

/// Writes `labels_<uuid>.csv` (header plus one row).
pub fn write_label(layout: &DatasetLayout, record: &LabelRecord) -> Result<PathBuf> {
    let path = layout.label_path(&record.sample.uuid);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let contents = format!("{}\n{}\n", LABEL_COLUMNS.join(","), label_row(record));
    fs::write(&path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Reads the label fields of a per-sample file; the timestamp is the file's mtime.
pub fn read_label(path: &Path) -> Result<SampleLabel> {
    let uuid = uuid_from_label_path(path).ok_or_else(|| anyhow!("No UUID in {}", path.display()))?;
    let contents = fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let mut lines = contents.lines().filter(|line| !line.trim().is_empty());
    let (header, row) = match (lines.next(), lines.next()) {
        (Some(header), Some(row)) => (header, row),
        _ => return Err(anyhow!("{} has no data row", path.display())),
    };
    let fields: HashMap<&str, &str> = header.split(',').map(str::trim).zip(row.split(',').map(str::trim)).collect();
    let field = |name: &str| {
        fields
            .get(name)
            .copied()
            .ok_or_else(|| anyhow!("{} lacks column {}", path.display(), name))
    };
    let angle_micro: AngleMicro = field("angle_micro")?.parse()?;
    let distance_micro: DistanceMicro = field("distance_micro")?.parse()?;
    let angle_deg: f64 = field("angle_deg")?.parse().context("angle_deg")?;
    let distance_px: f64 = field("distance_px")?.parse().context("distance_px")?;
    let timestamp = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok(SampleLabel {
        uuid,
        angle_deg,
        distance_px,
        labels: Classification::new(angle_micro, distance_micro),
        timestamp,
    })
}

/// Appends one sample, writing the header first when the ledger is new.
pub fn append_ledger(layout: &DatasetLayout, sample: &SampleLabel) -> Result<()> {
    let path = layout.ledger_path();
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let write_header = !path.exists();
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    if write_header {
        writeln!(file, "{}", LEDGER_COLUMNS.join(","))?;
    }
    writeln!(file, "{}", ledger_row(sample))?;
    Ok(())
}

/// Replaces the ledger with `samples` (ordered by UUID); removes it when empty.
pub fn rewrite_ledger(layout: &DatasetLayout, samples: &[SampleLabel]) -> Result<()> {
    let path = layout.ledger_path();
    if samples.is_empty() {
        if path.exists() {
            fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
        }
        return Ok(());
    }
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    let mut ordered: Vec<&SampleLabel> = samples.iter().collect();
    ordered.sort_by_key(|sample| sample.uuid);
    let mut contents = LEDGER_COLUMNS.join(",");
    contents.push('\n');
    for sample in ordered {
        contents.push_str(&ledger_row(sample));
        contents.push('\n');
    }
    fs::write(&path, contents).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

/// UUIDs listed in the ledger, in file order.
#[cfg(test)]
pub(crate) fn ledger_uuids(layout: &DatasetLayout) -> Result<Vec<Uuid>> {
    let path = layout.ledger_path();
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(contents
        .lines()
        .skip(1)
        .filter_map(|line| line.split(',').next())
        .filter_map(|id| Uuid::parse_str(id.trim()).ok())
        .collect())
}
