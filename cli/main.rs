use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use image::Rgba;
use imageproc::{drawing::draw_hollow_rect_mut, rect::Rect};
use ort::Environment;
use rupiah_detect::{aggregate, AggregateConfig, Config, DedupOrder, DedupScope, DetectionResult, Detector, YOLOV8};
use tracing::info;
use tracing_subscriber::EnvFilter;

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Parser, Debug)]
#[command(author, version, about = "Counts rupiah banknotes in images", long_about = None)]
struct Args {
    /// ONNX model to use
    model_path: String,

    /// Images to count notes in
    #[arg(required = true)]
    image_paths: Vec<String>,

    /// Detector suppression threshold
    #[arg(long, default_value = "0.3")]
    iou: f32,

    /// Confidence threshold
    #[arg(long, default_value = "0.4")]
    confidence: f32,

    /// Overlap above which a note counts as already seen
    #[arg(long, default_value = "0.5")]
    overlap: f32,

    /// Pad images instead of resizing
    #[arg(long)]
    pad: bool,

    /// Deduplicate highest confidence first instead of in detector order
    #[arg(long)]
    sort_by_confidence: bool,

    /// Only let notes of the same denomination suppress each other
    #[arg(long)]
    same_class_only: bool,

    /// Folder to put images with the counted notes drawn in
    #[arg(long)]
    output_folder: Option<String>,
}

impl Args {
    fn detector_config(&self) -> Config {
        Config {
            resize_type: if self.pad {
                rupiah_detect::ResizeType::Pad
            } else {
                rupiah_detect::ResizeType::Resize(image::imageops::FilterType::Nearest)
            },
            thresholds: rupiah_detect::Thresholds {
                iou: self.iou,
                confidence: self.confidence,
            },
            undo_resize: true,
        }
    }

    fn aggregate_config(&self) -> AggregateConfig {
        AggregateConfig {
            overlap_threshold: self.overlap,
            order: if self.sort_by_confidence {
                DedupOrder::ConfidenceDescending
            } else {
                DedupOrder::FirstSeen
            },
            scope: if self.same_class_only {
                DedupScope::SameClass
            } else {
                DedupScope::AllClasses
            },
        }
    }
}

fn check_extension(image_path: &str) -> anyhow::Result<()> {
    let extension = Path::new(image_path)
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_lowercase);
    match extension {
        Some(extension) if IMAGE_EXTENSIONS.contains(&extension.as_str()) => Ok(()),
        _ => bail!("{image_path}: invalid file type, expected png, jpg or jpeg"),
    }
}

fn annotate(image: &image::DynamicImage, result: &DetectionResult, output_path: &Path) -> anyhow::Result<()> {
    let mut image = image.clone();
    let color = Rgba([0u8, 0u8, 255u8, 255u8]);
    for accepted in &result.accepted {
        let bbox = accepted.detection.bbox;
        let x1 = bbox.x1.max(0.0);
        let y1 = bbox.y1.max(0.0);
        let width = (bbox.x2 - x1).max(1.0) as u32;
        let height = (bbox.y2 - y1).max(1.0) as u32;
        draw_hollow_rect_mut(
            &mut image,
            Rect::at(x1 as i32, y1 as i32).of_size(width, height),
            color,
        );
    }
    image
        .save(output_path)
        .with_context(|| format!("Failed to write {}", output_path.display()))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    for image_path in &args.image_paths {
        check_extension(image_path)?;
    }

    let environment = Arc::new(
        Environment::builder()
            .with_name("rupiah-detect")
            .build()
            .context("Failed to create ort environment")?,
    );
    let model = YOLOV8::new(&environment, &args.model_path)
        .with_context(|| format!("Failed to load model {}", args.model_path))?
        .with_config(args.detector_config());
    let aggregate_config = args.aggregate_config();

    for image_path in &args.image_paths {
        let image = image::open(image_path).with_context(|| format!("Failed to open {image_path}"))?;
        let detections = model
            .detect(image.clone())
            .with_context(|| format!("Failed to process {image_path}"))?;
        let result = aggregate(&detections, &aggregate_config);
        info!(
            image = %image_path,
            detections = ?result.labels(),
            total_value = %result.total_value,
            "Counted notes"
        );

        println!("{}", serde_json::to_string(&result)?);

        if let Some(output_folder) = &args.output_folder {
            let file_name = Path::new(image_path)
                .file_name()
                .with_context(|| format!("{image_path} has no file name"))?;
            annotate(&image, &result, &Path::new(output_folder).join(file_name))?;
        }
    }
    Ok(())
}
