use std::fmt;

use serde::{Serialize, Serializer};
use tracing::debug;

use super::{Denomination, RawDetection};

/// Order in which candidates are offered to the greedy deduplication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupOrder {
    /// Detector output order; the earlier of two overlapping boxes wins
    /// regardless of confidence.
    #[default]
    FirstSeen,
    /// Highest confidence first. Equal confidences keep detector order.
    ConfidenceDescending,
}

/// Which already accepted boxes a candidate is compared against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DedupScope {
    /// Every accepted box, so a note can suppress an overlapping note of a
    /// different denomination.
    #[default]
    AllClasses,
    /// Only accepted boxes of the same denomination.
    SameClass,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateConfig {
    /// A candidate is a duplicate when its IoU with an accepted box is strictly above this
    pub overlap_threshold: f32,
    pub order: DedupOrder,
    pub scope: DedupScope,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        AggregateConfig {
            overlap_threshold: 0.5,
            order: DedupOrder::default(),
            scope: DedupScope::default(),
        }
    }
}

impl AggregateConfig {
    fn is_duplicate(&self, kept: &AcceptedDetection, candidate: &AcceptedDetection) -> bool {
        if self.scope == DedupScope::SameClass && kept.denomination != candidate.denomination {
            return false;
        }
        kept.detection.bbox.iou(&candidate.detection.bbox) > self.overlap_threshold
    }
}

/// A detection whose class maps to a known denomination
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AcceptedDetection {
    pub detection: RawDetection,
    pub denomination: Denomination,
}

/// Summed value of the accepted notes, in rupiah.
///
/// Displays and serializes in thousands, e.g. `"35ribu"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TotalValue(pub u64);

impl fmt::Display for TotalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ribu", self.0 / 1000)
    }
}

impl Serialize for TotalValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Outcome of one aggregation call. Serializes to the response payload
/// `{"detections": [...], "total_value": "...", "detection_info": [...]}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionResult {
    /// Surviving detections in acceptance order
    #[serde(rename = "detections", serialize_with = "serialize_labels")]
    pub accepted: Vec<AcceptedDetection>,
    pub total_value: TotalValue,
    /// One line per raw detection, recorded before filtering
    #[serde(rename = "detection_info")]
    pub trace: Vec<String>,
}

impl DetectionResult {
    pub fn labels(&self) -> Vec<&'static str> {
        self.accepted
            .iter()
            .map(|accepted| accepted.denomination.label)
            .collect()
    }
}

fn serialize_labels<S: Serializer>(accepted: &[AcceptedDetection], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(accepted.iter().map(|accepted| accepted.denomination.label))
}

/// Turns raw detector output into deduplicated, valued notes.
///
/// Every detection is traced first. Unknown classes are then dropped and the
/// rest go through a greedy pass: a candidate is kept unless it overlaps an
/// already kept box by more than `config.overlap_threshold`. The result is
/// maximal for the chosen order, not a globally optimal selection.
pub fn aggregate(detections: &[RawDetection], config: &AggregateConfig) -> DetectionResult {
    let trace = detections
        .iter()
        .map(RawDetection::trace_line)
        .collect::<Vec<_>>();

    let mut candidates = detections
        .iter()
        .filter_map(|detection| match Denomination::for_class(detection.class) {
            Some(denomination) => Some(AcceptedDetection {
                detection: detection.clone(),
                denomination,
            }),
            None => {
                debug!(class = detection.class, "Ignoring detection with unknown class");
                None
            }
        })
        .collect::<Vec<_>>();

    if config.order == DedupOrder::ConfidenceDescending {
        // sort_by is stable, so ties stay in detector order
        candidates.sort_by(|a, b| b.detection.confidence.total_cmp(&a.detection.confidence));
    }

    let mut accepted: Vec<AcceptedDetection> = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        if accepted.iter().any(|kept| config.is_duplicate(kept, &candidate)) {
            debug!(
                label = candidate.denomination.label,
                confidence = candidate.detection.confidence,
                "Dropping overlapping detection"
            );
            continue;
        }
        accepted.push(candidate);
    }

    let total_value = TotalValue(accepted.iter().map(|kept| kept.denomination.value).sum());

    DetectionResult {
        accepted,
        total_value,
        trace,
    }
}
