use std::{convert::TryFrom, path::Path};

use tch::{Device, IValue, Kind, Tensor};
use tracing::debug;
use video_ingest::{Frame, FrameFormat};

use crate::{Detection, InstanceMask, Point, Scorer, ScorerError, Shape};

/// Upper bound on detections kept per frame.
const MAX_DETECTIONS: usize = 512;

/// Mask probability at which a prototype cell belongs to the instance.
const MASK_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone)]
pub struct TorchScorerOptions {
    pub device: Device,
    /// Network input (width, height); frames are resized to it.
    pub input_size: (i64, i64),
    pub confidence_threshold: f32,
    /// Class names indexed by class id.
    pub labels: Vec<String>,
}

impl Default for TorchScorerOptions {
    fn default() -> Self {
        Self {
            device: Device::cuda_if_available(),
            input_size: (640, 640),
            confidence_threshold: 0.25,
            labels: Vec::new(),
        }
    }
}

/// TorchScript detector exporting `[1, C, N]` predictions laid out as
/// `cx, cy, w, h, confidence[, class]` in network input pixels.
///
/// Segmentation exports return a `(predictions, prototypes)` tuple instead,
/// with prototypes shaped `[1, K, H, W]` and each prediction carrying `K`
/// mask coefficients after the class. Their detections are outlines of the
/// instance mask rather than boxes.
pub struct TorchScorer {
    name: String,
    module: tch::CModule,
    options: TorchScorerOptions,
}

impl TorchScorer {
    pub fn load(
        name: impl Into<String>,
        model_path: impl AsRef<Path>,
        options: TorchScorerOptions,
    ) -> anyhow::Result<Self> {
        let model_path = model_path.as_ref();
        let module = tch::CModule::load_on_device(model_path, options.device)?;
        debug!(
            model = %model_path.display(),
            device = ?options.device,
            "TorchScript scorer loaded"
        );
        Ok(Self {
            name: name.into(),
            module,
            options,
        })
    }

    /// BGR8 frame to a normalised RGB `[1, 3, H, W]` tensor at network size.
    fn frame_to_tensor(&self, frame: &Frame) -> Result<Tensor, ScorerError> {
        if frame.format != FrameFormat::Bgr8 {
            return Err(ScorerError::InvalidInput(format!(
                "unsupported frame format {:?}",
                frame.format
            )));
        }
        if frame.data.len() != frame.expected_len() || frame.resolution.is_empty() {
            return Err(ScorerError::InvalidInput(format!(
                "frame buffer holds {} bytes, {} expects {}",
                frame.data.len(),
                frame.resolution,
                frame.expected_len()
            )));
        }

        let (in_w, in_h) = self.options.input_size;
        let (w, h) = (i64::from(frame.width()), i64::from(frame.height()));
        let tensor = Tensor::from_slice(&frame.data)
            .to_device(self.options.device)
            .view([1, h, w, 3])
            .permute([0, 3, 1, 2])
            .flip([1])
            .to_kind(Kind::Float)
            / 255.0;
        if (w, h) == (in_w, in_h) {
            return Ok(tensor);
        }
        Ok(tensor.upsample_bilinear2d([in_h, in_w], false, None, None))
    }

    /// Outline of one instance from its mask coefficients, cropped to its box.
    fn mask_shape(
        &self,
        protos: &Prototypes,
        coefficients: &[f32],
        (cx, cy, w, h): (f32, f32, f32, f32),
        frame_scale: (f32, f32),
    ) -> Result<Option<Shape>, ScorerError> {
        let probs = Tensor::from_slice(coefficients)
            .view([1, protos.channels])
            .matmul(&protos.flat)
            .sigmoid()
            .view([-1]);
        let probs = Vec::<f32>::try_from(&probs)
            .map_err(|err| ScorerError::Inference(err.to_string()))?;

        let (in_w, in_h) = self.options.input_size;
        let gx = protos.width as f32 / in_w as f32;
        let gy = protos.height as f32 / in_h as f32;
        let crop = (
            Point::new((cx - w / 2.0) * gx, (cy - h / 2.0) * gy),
            Point::new((cx + w / 2.0) * gx, (cy + h / 2.0) * gy),
        );
        let mask = InstanceMask {
            probs: &probs,
            width: protos.width,
            height: protos.height,
        };
        Ok(mask.outline(
            MASK_THRESHOLD,
            crop,
            (frame_scale.0 / gx, frame_scale.1 / gy),
        ))
    }

    fn label_for(&self, class_id: i64) -> String {
        usize::try_from(class_id)
            .ok()
            .and_then(|idx| self.options.labels.get(idx))
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }
}

impl Scorer for TorchScorer {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<Detection>, ScorerError> {
        let input = self.frame_to_tensor(frame)?;
        let output = tch::no_grad(|| self.module.forward_is(&[IValue::Tensor(input)]))
            .map_err(|err| ScorerError::Inference(err.to_string()))?;
        let (output, protos) = match output {
            IValue::Tensor(preds) => (preds, None),
            IValue::Tuple(parts) | IValue::GenericList(parts) => match parts.as_slice() {
                [IValue::Tensor(preds), IValue::Tensor(protos), ..] => {
                    (preds.shallow_clone(), Some(Prototypes::new(protos)?))
                }
                _ => {
                    return Err(ScorerError::Inference(
                        "segmentation output must be (predictions, prototypes)".into(),
                    ));
                }
            },
            _ => {
                return Err(ScorerError::Inference("unexpected detector output type".into()));
            }
        };

        let shape = output.size();
        let &[batch, channels, _] = shape.as_slice() else {
            return Err(ScorerError::Inference(format!(
                "unexpected detector output shape: {shape:?}"
            )));
        };
        let needed = protos.as_ref().map_or(5, |p| 6 + p.channels);
        if batch != 1 || channels < needed {
            return Err(ScorerError::Inference(format!(
                "detector output {shape:?} needs batch 1 and at least {needed} channels"
            )));
        }

        let preds = output
            .to_device(Device::Cpu)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows = Vec::<Vec<f32>>::try_from(&preds)
            .map_err(|err| ScorerError::Inference(err.to_string()))?;

        let (in_w, in_h) = self.options.input_size;
        let sx = frame.width() as f32 / in_w as f32;
        let sy = frame.height() as f32 / in_h as f32;

        let mut detections = Vec::new();
        for row in rows {
            let score = row[4];
            if score < self.options.confidence_threshold {
                continue;
            }
            let class_id = row.get(5).map_or(0, |c| *c as i64);
            let boxed = Shape::from_center(row[0] * sx, row[1] * sy, row[2] * sx, row[3] * sy);
            let shape = match &protos {
                // An instance whose mask is empty keeps its box.
                Some(protos) => {
                    let coefficients = &row[6..6 + protos.channels as usize];
                    self.mask_shape(protos, coefficients, (row[0], row[1], row[2], row[3]), (sx, sy))?
                        .unwrap_or(boxed)
                }
                None => boxed,
            };
            detections.push(
                Detection::new(self.label_for(class_id), score, shape).with_class_id(class_id),
            );
            if detections.len() >= MAX_DETECTIONS {
                break;
            }
        }
        Ok(detections)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Mask prototypes of one frame, flattened to `[K, H * W]` on the CPU.
struct Prototypes {
    flat: Tensor,
    channels: i64,
    width: usize,
    height: usize,
}

impl Prototypes {
    fn new(protos: &Tensor) -> Result<Self, ScorerError> {
        let shape = protos.size();
        let &[1, channels, height, width] = shape.as_slice() else {
            return Err(ScorerError::Inference(format!(
                "mask prototypes must be [1, K, H, W], got {shape:?}"
            )));
        };
        if channels <= 0 || height <= 0 || width <= 0 {
            return Err(ScorerError::Inference(format!("empty mask prototypes {shape:?}")));
        }
        let flat = protos
            .to_device(Device::Cpu)
            .to_kind(Kind::Float)
            .contiguous()
            .view([channels, height * width]);
        Ok(Self {
            flat,
            channels,
            width: width as usize,
            height: height as usize,
        })
    }
}
