use crate::{config::ModelConfig, model_service::ModelOutput};
use image::{GrayImage, Luma};
use ndarray::{s, Array1, Array2, ArrayView2, Axis, Ix3, Ix4};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PostprocessError {
    #[error("Unexpected detections tensor: {0}")]
    Detections(String),
    #[error("Unexpected prototypes tensor: {0}")]
    Prototypes(String),
}

#[derive(Debug, Clone, Copy)]
pub struct PostprocessParams {
    pub input_size: u32,
    pub min_probability: f32,
    pub iou_threshold: f32,
    pub mask_threshold: f32,
}

impl From<&ModelConfig> for PostprocessParams {
    fn from(model_config: &ModelConfig) -> Self {
        Self {
            input_size: model_config.input_size,
            min_probability: model_config.min_probability,
            iou_threshold: model_config.iou_threshold,
            mask_threshold: model_config.mask_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    fn from_center(xc: f32, yc: f32, w: f32, h: f32) -> Self {
        Self {
            x1: xc - w / 2.,
            y1: yc - h / 2.,
            x2: xc + w / 2.,
            y2: yc + h / 2.,
        }
    }

    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.) * (self.y2 - self.y1).max(0.)
    }

    fn intersection(&self, other: &BoundingBox) -> f32 {
        let w = self.x2.min(other.x2) - self.x1.max(other.x1);
        let h = self.y2.min(other.y2) - self.y1.max(other.y1);
        w.max(0.) * h.max(0.)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        if union <= 0. {
            0.
        } else {
            inter / union
        }
    }

    fn scale(&self, sx: f32, sy: f32, width: f32, height: f32) -> Self {
        Self {
            x1: (self.x1 * sx).clamp(0., width),
            y1: (self.y1 * sy).clamp(0., height),
            x2: (self.x2 * sx).clamp(0., width),
            y2: (self.y2 * sy).clamp(0., height),
        }
    }
}

/// Binary instance mask covering the detection's box, anchored at `(left, top)`
/// in original image coordinates.
#[derive(Debug, Clone)]
pub struct Mask {
    pub left: u32,
    pub top: u32,
    pub pixels: GrayImage,
}

impl Mask {
    pub fn contains(&self, x: u32, y: u32) -> bool {
        if x < self.left || y < self.top {
            return false;
        }
        self.pixels
            .get_pixel_checked(x - self.left, y - self.top)
            .is_some_and(|p| p.0[0] > 0)
    }
}

#[derive(Debug, Clone)]
pub struct Detection {
    pub class_id: usize,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub mask: Option<Mask>,
}

struct Candidate {
    class_id: usize,
    confidence: f32,
    bbox: BoundingBox,
    coefficients: Array1<f32>,
}

/// Turns raw model tensors into detections in the coordinate space of an
/// image of `width x height` that was stretched to the model input square.
pub fn decode_output(
    output: &ModelOutput,
    width: u32,
    height: u32,
    params: &PostprocessParams,
) -> Result<Vec<Detection>, PostprocessError> {
    let predictions = output
        .detections
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|e| PostprocessError::Detections(e.to_string()))?;
    if predictions.shape()[0] != 1 {
        return Err(PostprocessError::Detections(format!(
            "expected batch of 1, got {}",
            predictions.shape()[0]
        )));
    }
    let predictions = predictions.index_axis_move(Axis(0), 0);

    let prototypes = match &output.prototypes {
        Some(prototypes) => {
            let prototypes = prototypes
                .view()
                .into_dimensionality::<Ix4>()
                .map_err(|e| PostprocessError::Prototypes(e.to_string()))?
                .index_axis_move(Axis(0), 0);
            let (m, mh, mw) = prototypes.dim();
            if mh == 0 || mw == 0 {
                return Err(PostprocessError::Prototypes(format!(
                    "empty {}x{} prototype grid",
                    mh, mw
                )));
            }
            let flat: Array2<f32> = prototypes
                .as_standard_layout()
                .into_owned()
                .into_shape_with_order((m, mh * mw))
                .map_err(|e| PostprocessError::Prototypes(e.to_string()))?;
            Some((flat, (mh, mw)))
        }
        None => None,
    };
    let mask_dim = prototypes.as_ref().map_or(0, |(flat, _)| flat.nrows());

    let channels = predictions.shape()[0];
    if channels <= 4 + mask_dim {
        return Err(PostprocessError::Detections(format!(
            "{} channels leave no room for class scores with {} mask coefficients",
            channels, mask_dim
        )));
    }
    let num_classes = channels - 4 - mask_dim;

    let candidates = collect_candidates(&predictions, num_classes, params.min_probability);
    let kept = non_maximum_suppression(candidates, params.iou_threshold);

    let sx = width as f32 / params.input_size as f32;
    let sy = height as f32 / params.input_size as f32;

    let mut detections = Vec::with_capacity(kept.len());
    for candidate in kept {
        let bbox = candidate
            .bbox
            .scale(sx, sy, width as f32, height as f32);
        let mask = prototypes.as_ref().map(|(flat, grid)| {
            build_mask(
                &candidate.coefficients,
                &flat.view(),
                *grid,
                &bbox,
                (width, height),
                params.mask_threshold,
            )
        });

        detections.push(Detection {
            class_id: candidate.class_id,
            confidence: candidate.confidence,
            bbox,
            mask,
        });
    }

    Ok(detections)
}

fn collect_candidates(
    predictions: &ArrayView2<f32>,
    num_classes: usize,
    min_probability: f32,
) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for column in predictions.axis_iter(Axis(1)) {
        let scores = column.slice(s![4..4 + num_classes]);
        let Some((class_id, confidence)) = scores
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, score)| score.is_finite())
            .reduce(|accum, item| if item.1 > accum.1 { item } else { accum })
        else {
            continue;
        };

        // NaN never passes a `>=` comparison.
        if !(confidence >= min_probability) {
            continue;
        }

        let (xc, yc, w, h) = (column[0], column[1], column[2], column[3]);
        if ![xc, yc, w, h].iter().all(|v| v.is_finite()) {
            continue;
        }

        candidates.push(Candidate {
            class_id,
            confidence,
            bbox: BoundingBox::from_center(xc, yc, w, h),
            coefficients: column.slice(s![4 + num_classes..]).to_owned(),
        });
    }

    candidates
}

/// Class-agnostic greedy NMS, highest confidence first.
fn non_maximum_suppression(mut candidates: Vec<Candidate>, iou_threshold: f32) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if kept
            .iter()
            .all(|k| k.bbox.iou(&candidate.bbox) < iou_threshold)
        {
            kept.push(candidate);
        }
    }

    kept
}

fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

fn build_mask(
    coefficients: &Array1<f32>,
    prototypes: &ArrayView2<f32>,
    (mh, mw): (usize, usize),
    bbox: &BoundingBox,
    (width, height): (u32, u32),
    threshold: f32,
) -> Mask {
    let logits = coefficients.dot(prototypes);

    let left = (bbox.x1.floor() as u32).min(width);
    let top = (bbox.y1.floor() as u32).min(height);
    let right = (bbox.x2.ceil() as u32).min(width);
    let bottom = (bbox.y2.ceil() as u32).min(height);

    let mut pixels = GrayImage::new(right.saturating_sub(left), bottom.saturating_sub(top));
    for y in top..bottom {
        let py = (((y as f32 + 0.5) * mh as f32 / height as f32) as usize).min(mh - 1);
        for x in left..right {
            let px = (((x as f32 + 0.5) * mw as f32 / width as f32) as usize).min(mw - 1);
            if sigmoid(logits[py * mw + px]) > threshold {
                pixels.put_pixel(x - left, y - top, Luma([255]));
            }
        }
    }

    Mask { left, top, pixels }
}
