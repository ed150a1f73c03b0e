// THEORY:
// The `QuotaBalancer` keeps the dataset evenly spread over the label space.
// Every sample belongs to five overlapping groups at once: its
// (angle micro, distance micro) pair, its angle micro sector, its distance
// micro bin, its distance macro band, and the global total. Each group has a cap.
//
// Key architectural principles:
// 1.  **Counts Are Derived**: Group counts are never stored; they are recomputed
//     from the label files on disk each time. The dataset is small enough that a
//     full scan is cheap, and a scan can never drift out of sync with the files.
// 2.  **Admission Before Persistence**: A new sample is checked before its label
//     is written. A rejection is an expected outcome, not an error, and carries
//     the exact list of groups that are full.
// 3.  **Recency-biased Eviction**: The prune pass walks samples newest first and
//     keeps a sample only while all five of its groups still have room. Older
//     samples are the ones evicted, and the result never exceeds any cap.
// 4.  **Best-effort Cleanup**: File-system failures during eviction are logged
//     and skipped; a prune pass never aborts a capture.

use crate::config::QuotaCaps;
use crate::core_modules::classifier::{AngleMicro, Classification, DistanceMacro, DistanceMicro};
use crate::core_modules::dataset::{self, DatasetLayout, SampleLabel};
use anyhow::Result;
use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

/// One of the five overlapping groupings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaGroup {
    Pair,
    AngleMicro,
    DistanceMicro,
    DistanceMacro,
    Total,
}

impl QuotaGroup {
    pub const ALL: [QuotaGroup; 5] = [
        QuotaGroup::Pair,
        QuotaGroup::AngleMicro,
        QuotaGroup::DistanceMicro,
        QuotaGroup::DistanceMacro,
        QuotaGroup::Total,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            QuotaGroup::Pair => "pair",
            QuotaGroup::AngleMicro => "angle micro",
            QuotaGroup::DistanceMicro => "distance micro",
            QuotaGroup::DistanceMacro => "distance macro",
            QuotaGroup::Total => "total",
        }
    }

    pub fn cap(&self, caps: &QuotaCaps) -> usize {
        match self {
            QuotaGroup::Pair => caps.pair,
            QuotaGroup::AngleMicro => caps.angle_micro,
            QuotaGroup::DistanceMicro => caps.distance_micro,
            QuotaGroup::DistanceMacro => caps.distance_macro,
            QuotaGroup::Total => caps.total,
        }
    }

    /// Group key of `labels` in this grouping, e.g. `ww/medium_2` for a pair.
    pub fn key(&self, labels: &Classification) -> String {
        match self {
            QuotaGroup::Pair => format!("{}/{}", labels.angle_micro, labels.distance_micro),
            QuotaGroup::AngleMicro => labels.angle_micro.to_string(),
            QuotaGroup::DistanceMicro => labels.distance_micro.to_string(),
            QuotaGroup::DistanceMacro => labels.distance_macro.to_string(),
            QuotaGroup::Total => "all".to_string(),
        }
    }
}

impl fmt::Display for QuotaGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A full group that blocks admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaViolation {
    pub group: QuotaGroup,
    pub key: String,
    pub count: usize,
    pub cap: usize,
}

impl fmt::Display for QuotaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.group {
            QuotaGroup::Total => write!(f, "total samples cap reached: {}/{}", self.count, self.cap),
            group => write!(f, "{} cap reached: {} = {}/{}", group, self.key, self.count, self.cap),
        }
    }
}

/// A group's count once the admitted sample is included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupProgress {
    pub group: QuotaGroup,
    pub key: String,
    pub count: usize,
    pub cap: usize,
}

impl GroupProgress {
    pub fn remaining(&self) -> usize {
        self.cap.saturating_sub(self.count)
    }
}

impl fmt::Display for GroupProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.group {
            QuotaGroup::Total => write!(f, "total = {}/{}, remaining {}", self.count, self.cap, self.remaining()),
            group => write!(
                f,
                "{} {} = {}/{}, remaining {}",
                group,
                self.key,
                self.count,
                self.cap,
                self.remaining()
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AdmissionProgress(pub Vec<GroupProgress>);

impl fmt::Display for AdmissionProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join("; "))
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Admission {
    Accepted(AdmissionProgress),
    Rejected(Vec<QuotaViolation>),
}

/// Per-group sample counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaCounts {
    pair: HashMap<(AngleMicro, DistanceMicro), usize>,
    angle_micro: HashMap<AngleMicro, usize>,
    distance_micro: HashMap<DistanceMicro, usize>,
    distance_macro: HashMap<DistanceMacro, usize>,
    total: usize,
}

impl QuotaCounts {
    pub fn from_labels<'a>(labels: impl IntoIterator<Item = &'a Classification>) -> Self {
        let mut counts = Self::default();
        for label in labels {
            counts.add(label);
        }
        counts
    }

    pub fn add(&mut self, labels: &Classification) {
        *self.pair.entry((labels.angle_micro, labels.distance_micro)).or_default() += 1;
        *self.angle_micro.entry(labels.angle_micro).or_default() += 1;
        *self.distance_micro.entry(labels.distance_micro).or_default() += 1;
        *self.distance_macro.entry(labels.distance_macro).or_default() += 1;
        self.total += 1;
    }

    /// Current size of the `group` that `labels` falls into.
    pub fn count(&self, group: QuotaGroup, labels: &Classification) -> usize {
        match group {
            QuotaGroup::Pair => self.pair_count(labels.angle_micro, labels.distance_micro),
            QuotaGroup::AngleMicro => self.angle_micro_count(labels.angle_micro),
            QuotaGroup::DistanceMicro => self.distance_micro_count(labels.distance_micro),
            QuotaGroup::DistanceMacro => self.distance_macro_count(labels.distance_macro),
            QuotaGroup::Total => self.total,
        }
    }

    pub fn pair_count(&self, angle: AngleMicro, distance: DistanceMicro) -> usize {
        self.pair.get(&(angle, distance)).copied().unwrap_or(0)
    }

    pub fn angle_micro_count(&self, angle: AngleMicro) -> usize {
        self.angle_micro.get(&angle).copied().unwrap_or(0)
    }

    pub fn distance_micro_count(&self, distance: DistanceMicro) -> usize {
        self.distance_micro.get(&distance).copied().unwrap_or(0)
    }

    pub fn distance_macro_count(&self, distance: DistanceMacro) -> usize {
        self.distance_macro.get(&distance).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Groups that are already at or above their cap for `labels`.
    pub fn violations(&self, labels: &Classification, caps: &QuotaCaps) -> Vec<QuotaViolation> {
        QuotaGroup::ALL
            .into_iter()
            .filter_map(|group| {
                let (count, cap) = (self.count(group, labels), group.cap(caps));
                (count >= cap).then(|| QuotaViolation {
                    group,
                    key: group.key(labels),
                    count,
                    cap,
                })
            })
            .collect()
    }

    /// Counts every group would reach if `labels` were added.
    pub fn progress_after(&self, labels: &Classification, caps: &QuotaCaps) -> AdmissionProgress {
        AdmissionProgress(
            QuotaGroup::ALL
                .into_iter()
                .map(|group| GroupProgress {
                    group,
                    key: group.key(labels),
                    count: self.count(group, labels) + 1,
                    cap: group.cap(caps),
                })
                .collect(),
        )
    }
}

/// Samples removed and retained by one prune pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PruneReport {
    /// UUID (or file stem when the name carries none) of each evicted sample.
    pub removed: Vec<String>,
    pub retained: Vec<SampleLabel>,
}

/// One row of the balance report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupBalance {
    pub key: String,
    pub count: usize,
    pub cap: usize,
    pub remaining: usize,
}

impl GroupBalance {
    fn new(key: impl Into<String>, count: usize, cap: usize) -> Self {
        Self {
            key: key.into(),
            count,
            cap,
            remaining: cap.saturating_sub(count),
        }
    }
}

/// Dataset counts against caps after a prune pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalanceReport {
    pub caps: QuotaCaps,
    pub angle_micro: Vec<GroupBalance>,
    pub distance_micro: Vec<GroupBalance>,
    pub distance_macro: Vec<GroupBalance>,
    pub total: GroupBalance,
    /// Rows follow `AngleMicro::ALL`, columns follow `DistanceMicro::all()`.
    pub pairs: Vec<(AngleMicro, Vec<usize>)>,
    pub pruned: usize,
}

impl BalanceReport {
    pub fn from_counts(counts: &QuotaCounts, caps: QuotaCaps, pruned: usize) -> Self {
        Self {
            caps,
            angle_micro: AngleMicro::ALL
                .into_iter()
                .map(|angle| GroupBalance::new(angle.name(), counts.angle_micro_count(angle), caps.angle_micro))
                .collect(),
            distance_micro: DistanceMicro::all()
                .map(|distance| {
                    GroupBalance::new(distance.to_string(), counts.distance_micro_count(distance), caps.distance_micro)
                })
                .collect(),
            distance_macro: DistanceMacro::ALL
                .into_iter()
                .map(|distance| {
                    GroupBalance::new(distance.name(), counts.distance_macro_count(distance), caps.distance_macro)
                })
                .collect(),
            total: GroupBalance::new("all", counts.total(), caps.total),
            pairs: AngleMicro::ALL
                .into_iter()
                .map(|angle| {
                    (
                        angle,
                        DistanceMicro::all()
                            .map(|distance| counts.pair_count(angle, distance))
                            .collect(),
                    )
                })
                .collect(),
            pruned,
        }
    }
}

impl fmt::Display for BalanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "total: {}/{} (remaining {})", self.total.count, self.total.cap, self.total.remaining)?;
        for (title, rows) in [
            ("angle micro", &self.angle_micro),
            ("distance micro", &self.distance_micro),
            ("distance macro", &self.distance_macro),
        ] {
            writeln!(f, "{title}:")?;
            for row in rows.iter() {
                writeln!(f, "  {:<9} {:>4}/{:<4} remaining {}", row.key, row.count, row.cap, row.remaining)?;
            }
        }
        write!(f, "pairs (cap {}):\n     ", self.caps.pair)?;
        for distance in DistanceMicro::all() {
            write!(f, " {:>8}", distance.to_string())?;
        }
        writeln!(f)?;
        for (angle, row) in &self.pairs {
            write!(f, "  {:<3}", angle.name())?;
            for count in row {
                write!(f, " {count:>8}")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Admission control and eviction over one dataset root.
#[derive(Debug, Clone)]
pub struct QuotaBalancer {
    caps: QuotaCaps,
    layout: DatasetLayout,
}

impl QuotaBalancer {
    pub fn new(caps: QuotaCaps, layout: DatasetLayout) -> Self {
        Self { caps, layout }
    }

    pub fn caps(&self) -> &QuotaCaps {
        &self.caps
    }

    pub fn layout(&self) -> &DatasetLayout {
        &self.layout
    }

    /// Current counts; unreadable label files are skipped.
    pub fn counts(&self) -> Result<QuotaCounts> {
        let mut counts = QuotaCounts::default();
        for path in self.layout.label_files()? {
            match dataset::read_label(&path) {
                Ok(sample) => counts.add(&sample.labels),
                Err(err) => warn!("Skipping unreadable label file: {err:#}"),
            }
        }
        Ok(counts)
    }

    /// Checks whether a sample labelled `labels` may be persisted.
    pub fn admit(&self, labels: &Classification) -> Result<Admission> {
        let counts = self.counts()?;
        let violations = counts.violations(labels, &self.caps);
        if violations.is_empty() {
            Ok(Admission::Accepted(counts.progress_after(labels, &self.caps)))
        } else {
            Ok(Admission::Rejected(violations))
        }
    }

    /// Evicts the oldest samples that push any group over its cap and rewrites the ledger.
    pub fn prune(&self) -> PruneReport {
        self.prune_with(|path, uuid| self.layout.remove_sample(path, uuid))
    }

    /// Prune pass with a pluggable eviction; `remove` reports whether the label file is gone.
    fn prune_with<R>(&self, mut remove: R) -> PruneReport
    where
        R: FnMut(&Path, Option<&Uuid>) -> bool,
    {
        let files = match self.layout.label_files() {
            Ok(files) => files,
            Err(err) => {
                warn!("Prune skipped: {err:#}");
                return PruneReport::default();
            }
        };

        let mut dated: Vec<(SystemTime, PathBuf)> = files
            .into_iter()
            .map(|path| {
                let modified = fs::metadata(&path)
                    .and_then(|meta| meta.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                (modified, path)
            })
            .collect();
        // Newest first; names break ties so repeated passes agree.
        dated.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let mut counts = QuotaCounts::default();
        let mut report = PruneReport::default();
        for (_, path) in dated {
            let uuid = dataset::uuid_from_label_path(&path);
            let evicted = match dataset::read_label(&path) {
                Ok(sample) => {
                    if counts.violations(&sample.labels, &self.caps).is_empty() {
                        counts.add(&sample.labels);
                        report.retained.push(sample);
                        continue;
                    }
                    Some(sample)
                }
                Err(err) => {
                    warn!("Evicting unreadable label file: {err:#}");
                    None
                }
            };
            if !remove(&path, uuid.as_ref()) {
                // Still on disk, so admission keeps counting it; the ledger must agree.
                if let Some(sample) = evicted {
                    counts.add(&sample.labels);
                    report.retained.push(sample);
                }
                continue;
            }
            let name = uuid.map(|id| id.to_string()).unwrap_or_else(|| {
                path.file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });
            report.removed.push(name);
        }

        if let Err(err) = dataset::rewrite_ledger(&self.layout, &report.retained) {
            warn!("Could not rewrite ledger: {err:#}");
        }
        if !report.removed.is_empty() {
            info!(
                "Pruned {} sample(s) to respect caps: {}",
                report.removed.len(),
                report.removed.join(", ")
            );
        }
        report
    }

    /// Prunes, then reports every group against its cap.
    pub fn balance(&self) -> BalanceReport {
        let pruned = self.prune();
        let counts = QuotaCounts::from_labels(pruned.retained.iter().map(|sample| &sample.labels));
        BalanceReport::from_counts(&counts, self.caps, pruned.removed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::dataset::{LabelRecord, write_label};
    use crate::core_modules::test_utils::temp_root;
    use std::time::Duration;
    use uuid::Uuid;

    fn labels(angle: &str, distance: &str) -> Classification {
        Classification::new(angle.parse().expect("angle"), distance.parse().expect("distance"))
    }

    /// Writes a sample whose label file is `age_secs` old.
    fn seed(layout: &DatasetLayout, labels: Classification, age_secs: u64) -> Uuid {
        let uuid = Uuid::new_v4();
        let record = LabelRecord {
            target: (100.0, 60.0),
            reference: (100.0, 100.0),
            reference_tip: (100.0, 85.0),
            sample: SampleLabel::new(uuid, labels.angle_micro.center_deg(), 40.0, labels),
        };
        let path = write_label(layout, &record).expect("write label");
        fs::create_dir_all(layout.sample_dir(&uuid)).expect("sample dir");
        let when = SystemTime::now() - Duration::from_secs(age_secs);
        fs::File::options()
            .write(true)
            .open(&path)
            .and_then(|file| file.set_modified(when))
            .expect("set mtime");
        uuid
    }

    fn balancer(caps: QuotaCaps) -> (PathBuf, QuotaBalancer) {
        let root = temp_root("quota");
        let layout = DatasetLayout::new(&root);
        layout.ensure().expect("dirs");
        (root, QuotaBalancer::new(caps, layout))
    }

    #[test]
    fn default_caps_match_the_derived_goals() {
        let caps = QuotaCaps::default();
        assert_eq!(
            (caps.pair, caps.angle_micro, caps.distance_micro, caps.distance_macro, caps.total),
            (9, 81, 108, 324, 972)
        );
    }

    #[test]
    fn full_pair_rejects_with_a_named_reason() {
        let (root, balancer) = balancer(QuotaCaps::default());
        let label = labels("ww", "medium_2");
        for age in 0..9 {
            seed(balancer.layout(), label, 100 + age);
        }
        let Admission::Rejected(violations) = balancer.admit(&label).expect("admit") else {
            panic!("pair is full");
        };
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].to_string(), "pair cap reached: ww/medium_2 = 9/9");

        // Another pair in the same sector still fits.
        assert!(matches!(
            balancer.admit(&labels("ww", "medium_3")).expect("admit"),
            Admission::Accepted(_)
        ));
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn admission_reports_progress_including_the_new_sample() {
        let (root, balancer) = balancer(QuotaCaps::default());
        let label = labels("ww", "medium_2");
        for age in 0..3 {
            seed(balancer.layout(), label, 10 + age);
        }
        let Admission::Accepted(progress) = balancer.admit(&label).expect("admit") else {
            panic!("room left");
        };
        assert_eq!(progress.0[0].to_string(), "pair ww/medium_2 = 4/9, remaining 5");
        assert_eq!(progress.0[4].to_string(), "total = 4/972, remaining 968");
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn every_full_group_is_listed() {
        let caps = QuotaCaps {
            pair: 5,
            angle_micro: 2,
            distance_micro: 5,
            distance_macro: 5,
            total: 2,
        };
        let (root, balancer) = balancer(caps);
        seed(balancer.layout(), labels("nn", "near_1"), 5);
        seed(balancer.layout(), labels("nn", "far_3"), 4);
        let Admission::Rejected(violations) = balancer.admit(&labels("nn", "near_2")).expect("admit") else {
            panic!("angle and total are full");
        };
        let reasons: Vec<String> = violations.iter().map(ToString::to_string).collect();
        assert_eq!(
            reasons,
            vec![
                "angle micro cap reached: nn = 2/2".to_string(),
                "total samples cap reached: 2/2".to_string(),
            ]
        );
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn prune_evicts_the_oldest_over_cap_samples_and_is_idempotent() {
        let (root, balancer) = balancer(QuotaCaps::from_pair(2));
        let label = labels("ss", "far_1");
        let oldest = seed(balancer.layout(), label, 300);
        let middle = seed(balancer.layout(), label, 200);
        let newest = seed(balancer.layout(), label, 100);
        let other = seed(balancer.layout(), labels("ee", "near_1"), 400);

        let first = balancer.prune();
        assert_eq!(first.removed, vec![oldest.to_string()]);
        assert!(!balancer.layout().sample_dir(&oldest).exists());
        assert!(!balancer.layout().label_path(&oldest).exists());

        let mut kept: Vec<Uuid> = first.retained.iter().map(|s| s.uuid).collect();
        kept.sort();
        let mut expected = vec![middle, newest, other];
        expected.sort();
        assert_eq!(kept, expected);
        assert_eq!(dataset::ledger_uuids(balancer.layout()).expect("ledger"), expected);

        let second = balancer.prune();
        assert!(second.removed.is_empty());
        let mut again: Vec<Uuid> = second.retained.iter().map(|s| s.uuid).collect();
        again.sort();
        assert_eq!(again, expected);
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn sample_that_cannot_be_removed_stays_in_the_ledger() {
        let (root, balancer) = balancer(QuotaCaps::from_pair(1));
        let label = labels("nn", "near_2");
        let older = seed(balancer.layout(), label, 200);
        let newer = seed(balancer.layout(), label, 100);

        let report = balancer.prune_with(|_, _| false);
        assert!(report.removed.is_empty());
        let mut kept: Vec<Uuid> = report.retained.iter().map(|s| s.uuid).collect();
        kept.sort();
        let mut expected = vec![older, newer];
        expected.sort();
        assert_eq!(kept, expected);
        assert_eq!(dataset::ledger_uuids(balancer.layout()).expect("ledger"), expected);
        assert_eq!(
            balancer.counts().expect("counts").total(),
            dataset::ledger_uuids(balancer.layout()).expect("ledger").len()
        );
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn prune_removes_unreadable_label_files() {
        let (root, balancer) = balancer(QuotaCaps::default());
        let good = seed(balancer.layout(), labels("nn", "medium_1"), 10);
        let broken = Uuid::new_v4();
        fs::write(balancer.layout().label_path(&broken), "garbage").expect("write");

        let report = balancer.prune();
        assert_eq!(report.removed, vec![broken.to_string()]);
        assert_eq!(report.retained.len(), 1);
        assert_eq!(report.retained[0].uuid, good);
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn prune_of_an_empty_dataset_removes_a_stale_ledger() {
        let (root, balancer) = balancer(QuotaCaps::default());
        let stale = balancer.layout().ledger_path();
        fs::write(&stale, "uuid\n").expect("write");
        let report = balancer.prune();
        assert!(report.removed.is_empty());
        assert!(!stale.exists());
        fs::remove_dir_all(root).ok();
    }

    #[test]
    fn balance_counts_survivors_per_group() {
        let (root, balancer) = balancer(QuotaCaps::default());
        seed(balancer.layout(), labels("nn", "medium_2"), 30);
        seed(balancer.layout(), labels("nn", "medium_2"), 20);
        seed(balancer.layout(), labels("ww", "far_3"), 10);

        let report = balancer.balance();
        assert_eq!(report.pruned, 0);
        assert_eq!(report.total.count, 3);
        assert_eq!(report.total.remaining, 969);
        let nn = report.angle_micro.iter().find(|row| row.key == "nn").expect("nn row");
        assert_eq!((nn.count, nn.remaining), (2, 79));
        let medium = report.distance_macro.iter().find(|row| row.key == "medium").expect("row");
        assert_eq!(medium.count, 2);
        let (_, nn_pairs) = report.pairs.iter().find(|(angle, _)| *angle == AngleMicro::Nn).expect("row");
        assert_eq!(nn_pairs[4], 2);
        assert!(report.to_string().contains("total: 3/972"));
        fs::remove_dir_all(root).ok();
    }
}
