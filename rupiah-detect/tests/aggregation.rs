use std::convert::Infallible;

use image::DynamicImage;
use rupiah_detect::{
    aggregate, AggregateConfig, BoundingBox, DedupOrder, DedupScope, Denomination, Detector, RawDetection, TotalValue,
};

fn detection(class: i32, confidence: f32, bbox: (f32, f32, f32, f32)) -> RawDetection {
    RawDetection {
        class,
        confidence,
        bbox: BoundingBox::new(bbox.0, bbox.1, bbox.2, bbox.3),
    }
}

/// A cluttered frame: overlapping notes, unknown classes and a reversed box
fn cluttered() -> Vec<RawDetection> {
    vec![
        detection(1, 0.91, (0.0, 0.0, 100.0, 50.0)),
        detection(1, 0.88, (3.0, 1.0, 101.0, 50.0)),
        detection(9, 0.77, (200.0, 0.0, 300.0, 50.0)),
        detection(4, 0.66, (200.0, 0.0, 300.0, 50.0)),
        detection(0, 0.95, (205.0, 2.0, 298.0, 49.0)),
        detection(6, 0.52, (400.0, 100.0, 380.0, 60.0)),
        detection(7, 0.49, (0.0, 300.0, 80.0, 340.0)),
        detection(5, 0.81, (60.0, 310.0, 140.0, 350.0)),
    ]
}

#[test]
fn scenario_high_overlap_counts_once() {
    // IoU 0.9
    let detections = vec![
        detection(1, 0.8, (0.0, 0.0, 100.0, 100.0)),
        detection(1, 0.7, (0.0, 0.0, 100.0, 90.0)),
    ];
    let result = aggregate(&detections, &AggregateConfig::default());
    assert_eq!(result.labels(), vec!["10ribu"]);
    assert_eq!(result.total_value, TotalValue(10_000));
}

#[test]
fn scenario_low_overlap_counts_both() {
    // IoU 0.1
    let detections = vec![
        detection(1, 0.8, (0.0, 0.0, 10.0, 10.0)),
        detection(1, 0.7, (0.0, 0.0, 1.0, 10.0)),
    ];
    let result = aggregate(&detections, &AggregateConfig::default());
    assert_eq!(result.labels(), vec!["10ribu", "10ribu"]);
    assert_eq!(result.total_value, TotalValue(20_000));
}

#[test]
fn scenario_unknown_class_is_traced_only() {
    let detections = vec![detection(12, 0.9, (0.0, 0.0, 10.0, 10.0))];
    let result = aggregate(&detections, &AggregateConfig::default());
    assert!(result.accepted.is_empty());
    assert_eq!(result.total_value, TotalValue(0));
    assert_eq!(result.trace.len(), 1);
}

#[test]
fn scenario_empty_input() {
    let result = aggregate(&[], &AggregateConfig::default());
    assert!(result.accepted.is_empty());
    assert_eq!(result.total_value, TotalValue(0));
    assert!(result.trace.is_empty());
}

#[test]
fn cluttered_frame_first_seen() {
    let result = aggregate(&cluttered(), &AggregateConfig::default());
    // 10ribu duplicate dropped, class 9 ignored, 100ribu suppressed by the 50ribu
    // seen before it, reversed 5ribu box never overlaps, 75ribu and 20ribu barely touch
    assert_eq!(result.labels(), vec!["10ribu", "50ribu", "5ribu", "75ribu", "20ribu"]);
    assert_eq!(result.total_value, TotalValue(160_000));
    assert_eq!(result.total_value.to_string(), "160ribu");
    assert_eq!(result.trace.len(), 8);
}

#[test]
fn cluttered_frame_confidence_sorted() {
    let config = AggregateConfig {
        order: DedupOrder::ConfidenceDescending,
        ..AggregateConfig::default()
    };
    let result = aggregate(&cluttered(), &config);
    assert_eq!(result.labels(), vec!["100ribu", "10ribu", "20ribu", "5ribu", "75ribu"]);
    assert_eq!(result.total_value, TotalValue(210_000));
}

#[test]
fn total_matches_output_labels() {
    let configs = [
        AggregateConfig::default(),
        AggregateConfig {
            order: DedupOrder::ConfidenceDescending,
            ..AggregateConfig::default()
        },
        AggregateConfig {
            scope: DedupScope::SameClass,
            ..AggregateConfig::default()
        },
    ];
    for config in &configs {
        let result = aggregate(&cluttered(), config);
        let summed: u64 = result
            .accepted
            .iter()
            .map(|accepted| {
                Denomination::for_class(accepted.detection.class)
                    .map(|denomination| denomination.value)
                    .unwrap_or_default()
            })
            .sum();
        assert_eq!(result.total_value, TotalValue(summed));
        assert_eq!(result.labels().len(), result.accepted.len());
    }
}

#[test]
fn deduplication_is_idempotent() {
    let configs = [
        AggregateConfig::default(),
        AggregateConfig {
            order: DedupOrder::ConfidenceDescending,
            scope: DedupScope::SameClass,
            ..AggregateConfig::default()
        },
    ];
    for config in &configs {
        let first = aggregate(&cluttered(), config);
        let survivors = first
            .accepted
            .iter()
            .map(|accepted| accepted.detection.clone())
            .collect::<Vec<_>>();
        let second = aggregate(&survivors, config);
        assert_eq!(second.accepted, first.accepted);
        assert_eq!(second.total_value, first.total_value);
    }
}

#[test]
fn no_retained_pair_exceeds_threshold() {
    let config = AggregateConfig::default();
    let result = aggregate(&cluttered(), &config);
    for (i, a) in result.accepted.iter().enumerate() {
        for b in &result.accepted[i + 1..] {
            assert!(a.detection.bbox.iou(&b.detection.bbox) <= config.overlap_threshold);
        }
    }
}

#[test]
fn serializes_response_payload() {
    let detections = vec![
        detection(1, 0.8, (0.0, 0.0, 10.0, 10.0)),
        detection(3, 0.456, (20.0, 0.0, 30.0, 10.5)),
    ];
    let result = aggregate(&detections, &AggregateConfig::default());
    let payload = serde_json::to_value(&result).unwrap();
    assert_eq!(
        payload,
        serde_json::json!({
            "detections": ["10ribu", "2ribu"],
            "total_value": "12ribu",
            "detection_info": [
                "Class: 1, Confidence: 0.80, BBox: [0.0, 0.0, 10.0, 10.0]",
                "Class: 3, Confidence: 0.46, BBox: [20.0, 0.0, 30.0, 10.5]"
            ]
        })
    );
}

#[test]
fn column_output_feeds_aggregation() {
    let detections =
        RawDetection::from_columns(&[[0.0, 0.0, 50.0, 20.0], [1.0, 0.0, 50.0, 20.0]], &[4.0, 4.0], &[0.7, 0.9])
            .unwrap();
    let result = aggregate(&detections, &AggregateConfig::default());
    assert_eq!(result.labels(), vec!["50ribu"]);
    assert_eq!(result.accepted[0].detection.confidence, 0.7);
}

struct FixedDetector(Vec<RawDetection>);

impl Detector for FixedDetector {
    type Error = Infallible;

    fn detect(&self, _image: DynamicImage) -> Result<Vec<RawDetection>, Infallible> {
        Ok(self.0.clone())
    }
}

#[test]
fn requests_do_not_share_traces() {
    let detector = FixedDetector(vec![detection(2, 0.6, (0.0, 0.0, 10.0, 10.0))]);
    let config = AggregateConfig::default();
    let first = aggregate(&detector.detect(DynamicImage::new_rgb8(32, 32)).unwrap(), &config);
    let second = aggregate(&detector.detect(DynamicImage::new_rgb8(32, 32)).unwrap(), &config);
    assert_eq!(first.trace.len(), 1);
    assert_eq!(second.trace.len(), 1);
    assert_eq!(second.total_value.to_string(), "1ribu");
}
