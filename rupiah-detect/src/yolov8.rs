use super::{BoundingBox, RawDetection};
use image::imageops;
use image::{imageops::FilterType, DynamicImage, GenericImageView};
use ndarray::CowArray;
use ndarray::{s, Array, Axis, IxDyn};
use ort::Value;
use ort::{Environment, SessionBuilder};
use std::{path::Path, sync::Arc};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum InitializationError {
    #[error("Internal error in the ort library")]
    Ort(#[from] ort::OrtError),
    #[error("Invalid model")]
    InvalidModel,
}

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("Internal error in the ort library")]
    Ort(#[from] ort::OrtError),
    #[error("Error preprocessing input")]
    PreprocessingInput(#[from] PreprocessImagesError),
    #[error("Error processing output")]
    ProcessingOutput(#[from] ProcessOutputError),
    #[error("Model returned no results for the image")]
    EmptyBatch,
}

#[derive(Error, Debug)]
pub enum PreprocessImagesError {
    #[error("No images provided")]
    NoImages,
    #[error("Image sizes mismatch")]
    ImageSizeMismatch,
}

#[derive(Error, Debug)]
pub enum ProcessOutputError {
    #[error("Invalid output format")]
    InvalidFormat,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Thresholds {
    /// Intersection over union threshold for the detector's own suppression
    pub iou: f32,
    /// Confidence threshold
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResizeType {
    /// Add black padding to the image
    Pad,
    /// Resize the image
    Resize(FilterType),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Object detection result thresholds
    pub thresholds: Thresholds,
    /// Method of resizing the image
    pub resize_type: ResizeType,
    /// Map boxes back onto the original image
    pub undo_resize: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            thresholds: Thresholds {
                iou: 0.3,
                confidence: 0.4,
            },
            resize_type: ResizeType::Resize(FilterType::Nearest),
            undo_resize: true,
        }
    }
}

/// Anything that turns an image into raw, unfiltered note detections.
pub trait Detector {
    type Error: std::error::Error + Send + Sync + 'static;

    fn detect(&self, image: DynamicImage) -> Result<Vec<RawDetection>, Self::Error>;
}

/// Adds padding to an image so that its dimensions are a multiple of `round`
fn round_image(image: &DynamicImage, round: u32) -> DynamicImage {
    let (width, height) = image.dimensions();
    let new_width = width.div_ceil(round) * round;
    let new_height = height.div_ceil(round) * round;
    let mut new_image = DynamicImage::new_rgb8(new_width, new_height);
    imageops::overlay(&mut new_image, image, 0, 0);
    new_image
}

/// Decodes a `[num_boxes, 4 + num_classes, batch_size]` output into per-image detections.
///
/// Rows are `[x_center, y_center, w, h, class_0_prob, class_1_prob, ...]`; the
/// most probable class wins.
fn decode_output(output: &Array<f32, IxDyn>) -> Result<Vec<Vec<RawDetection>>, ProcessOutputError> {
    if output.ndim() != 3 {
        return Err(ProcessOutputError::InvalidFormat);
    }
    let batch_size = output.shape()[2];
    let mut detections = Vec::with_capacity(batch_size);
    for i in 0..batch_size {
        let mut batch_detections = Vec::new();
        let image_output = output.slice(s![.., .., i]);
        for row in image_output.axis_iter(Axis(0)) {
            let row: Vec<f32> = row.iter().copied().collect();
            let (class_id, prob) = row
                .iter()
                // Skip the first 4 elements because they are the bounding box coordinates
                .skip(4)
                .enumerate()
                .reduce(|highest_class, class| {
                    if class.1 > highest_class.1 {
                        class
                    } else {
                        highest_class
                    }
                })
                .ok_or(ProcessOutputError::InvalidFormat)?;
            let (xc, yc, w, h) = (row[0], row[1], row[2], row[3]);
            batch_detections.push(RawDetection {
                class: class_id as i32,
                confidence: *prob,
                bbox: BoundingBox::new(xc - w / 2.0, yc - h / 2.0, xc + w / 2.0, yc + h / 2.0),
            });
        }
        detections.push(batch_detections);
    }
    Ok(detections)
}

/// Confidence filter followed by per-class non-maximum suppression.
///
/// Boxes of different classes never suppress each other here; overlap across
/// denominations is left to the aggregation stage.
fn suppress(detections: Vec<RawDetection>, thresholds: &Thresholds) -> Vec<RawDetection> {
    let mut detections = detections
        .into_iter()
        .filter(|detection| detection.confidence > thresholds.confidence)
        .collect::<Vec<_>>();
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut i = 0;
    while i < detections.len() {
        let mut j = i + 1;
        while j < detections.len() {
            if detections[i].class == detections[j].class
                && detections[i].bbox.iou(&detections[j].bbox) > thresholds.iou
            {
                detections.remove(j);
            } else {
                j += 1;
            }
        }
        i += 1;
    }
    detections
}

/// Scales boxes from model input space back to an image of `original` size.
fn rescale(detections: &mut [RawDetection], original: (u32, u32), model_input: (u32, u32)) {
    let x_scale = original.0 as f32 / model_input.0 as f32;
    let y_scale = original.1 as f32 / model_input.1 as f32;
    for detection in detections.iter_mut() {
        detection.bbox.x1 *= x_scale;
        detection.bbox.x2 *= x_scale;
        detection.bbox.y1 *= y_scale;
        detection.bbox.y2 *= y_scale;
    }
}

/// Clips boxes that reach into the padding added by [`round_image`].
fn clip_to(detections: &mut [RawDetection], original: (u32, u32)) {
    let (width, height) = (original.0 as f32, original.1 as f32);
    for detection in detections.iter_mut() {
        detection.bbox.x2 = detection.bbox.x2.min(width);
        detection.bbox.y2 = detection.bbox.y2.min(height);
    }
}

/// Represents a YOLOv8 note detection model
pub struct YOLOV8 {
    session: ort::Session,
    dynamic_batch_size: bool,
    image_size: Option<(u32, u32)>,
    config: Config,
}

impl YOLOV8 {
    /// Initializes a YOLOv8 model from an ONNX model file
    pub fn new(environment: &Arc<Environment>, model_path: &str) -> Result<Self, InitializationError> {
        let model = SessionBuilder::new(environment)
            .map_err(InitializationError::Ort)?
            .with_model_from_file(Path::new(model_path))
            .map_err(InitializationError::Ort)?;

        let input_dims: Vec<Option<usize>> = model
            .inputs
            .first()
            .ok_or(InitializationError::InvalidModel)?
            .dimensions()
            .collect();
        if input_dims.len() != 4 {
            return Err(InitializationError::InvalidModel);
        }

        let dynamic_batch_size = input_dims[0].is_none();
        let image_size = match (input_dims[2], input_dims[3]) {
            (Some(height), Some(width)) => Some((width as u32, height as u32)),
            _ => None,
        };

        if model.outputs.is_empty() {
            return Err(InitializationError::InvalidModel);
        }

        debug!(model_path, dynamic_batch_size, ?image_size, "Loaded detection model");

        Ok(YOLOV8 {
            session: model,
            dynamic_batch_size,
            image_size,
            config: Config::default(),
        })
    }

    /// Sets the configuration used by [`Detector::detect`]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Runs the model on multiple images
    pub fn run_batch(
        &self,
        images: Vec<DynamicImage>,
        config: &Config,
    ) -> Result<Vec<(DynamicImage, Vec<RawDetection>)>, DetectionError> {
        if !self.dynamic_batch_size && images.len() > 1 {
            // Run the model on each image individually
            return images
                .into_iter()
                .map(|image| {
                    self.run_batch(vec![image], config)?
                        .pop()
                        .ok_or(DetectionError::EmptyBatch)
                })
                .collect();
        }
        let original_image_sizes = images
            .iter()
            .map(|image| image.dimensions())
            .collect::<Vec<_>>();
        let (resized_images, image_size) = self.preprocess_images(&images, config)?;
        let input = process_input(&resized_images, image_size);

        let input_tensor = Value::from_array(self.session.allocator(), &input)?;
        let outputs = self.session.run(vec![input_tensor])?;
        let output = outputs
            .first()
            .ok_or(ProcessOutputError::InvalidFormat)?
            .try_extract::<f32>()?
            .view()
            .t()
            .into_owned();
        let batches = decode_output(&output)?
            .into_iter()
            .map(|batch| suppress(batch, &config.thresholds))
            .collect::<Vec<_>>();

        if !config.undo_resize {
            return Ok(resized_images.into_iter().zip(batches).collect());
        }

        let padded = self.image_size.is_none() && config.resize_type == ResizeType::Pad;
        Ok(images
            .into_iter()
            .zip(batches)
            .zip(original_image_sizes)
            .map(|((image, mut detections), size)| {
                if padded {
                    clip_to(&mut detections, size);
                } else {
                    rescale(&mut detections, size, image_size);
                }
                (image, detections)
            })
            .collect())
    }

    /// Run the model on a single image
    pub fn run(&self, image: DynamicImage, config: &Config) -> Result<Vec<RawDetection>, DetectionError> {
        self.run_batch(vec![image], config)?
            .pop()
            .map(|(_, detections)| detections)
            .ok_or(DetectionError::EmptyBatch)
    }

    fn preprocess_images(
        &self,
        images: &[DynamicImage],
        config: &Config,
    ) -> Result<(Vec<DynamicImage>, (u32, u32)), PreprocessImagesError> {
        let first = images.first().ok_or(PreprocessImagesError::NoImages)?;

        if let Some(image_size) = self.image_size {
            let filter_type = match config.resize_type {
                ResizeType::Resize(filter_type) => filter_type,
                ResizeType::Pad => FilterType::Nearest,
            };
            let resized = images
                .iter()
                .map(|image| image.resize_exact(image_size.0, image_size.1, filter_type))
                .collect();
            return Ok((resized, image_size));
        }

        let image_size = first.dimensions();
        if images.iter().any(|image| image.dimensions() != image_size) {
            return Err(PreprocessImagesError::ImageSizeMismatch);
        }

        // Dynamic models need dimensions that are a multiple of 32
        let resized_images = if image_size.0 % 32 != 0 || image_size.1 % 32 != 0 {
            match config.resize_type {
                ResizeType::Pad => images.iter().map(|image| round_image(image, 32)).collect::<Vec<_>>(),
                ResizeType::Resize(filter_type) => images
                    .iter()
                    .map(|image| {
                        image.resize_exact(image_size.0.div_ceil(32) * 32, image_size.1.div_ceil(32) * 32, filter_type)
                    })
                    .collect::<Vec<_>>(),
            }
        } else {
            images.to_vec()
        };
        let image_size = resized_images
            .first()
            .map(|image| image.dimensions())
            .ok_or(PreprocessImagesError::NoImages)?;
        Ok((resized_images, image_size))
    }
}

impl Detector for YOLOV8 {
    type Error = DetectionError;

    fn detect(&self, image: DynamicImage) -> Result<Vec<RawDetection>, DetectionError> {
        self.run(image, &self.config)
    }
}

/// Packs images into a normalized `[batch, 3, height, width]` tensor
fn process_input<'a>(images: &[DynamicImage], image_size: (u32, u32)) -> CowArray<'a, f32, IxDyn> {
    let mut input = Array::zeros((images.len(), 3, image_size.1 as usize, image_size.0 as usize)).into_dyn();
    for (i, image) in images.iter().enumerate() {
        for (x, y, rgb) in image.pixels() {
            let (x, y) = (x as usize, y as usize);
            input[[i, 0, y, x]] = rgb[0] as f32 / 255.0;
            input[[i, 1, y, x]] = rgb[1] as f32 / 255.0;
            input[[i, 2, y, x]] = rgb[2] as f32 / 255.0;
        }
    }
    CowArray::from(input)
}
