use crate::config::OnnxConfig;
use crate::error::AppError;
use crate::models::classify_types::Prediction;
use crate::services::classifier::catalog::ModelDescriptor;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::Value;
use std::fmt;
use std::path::Path;
use std::sync::Mutex;

/// Black-box image classifier: labels with scores, best first.
pub trait Classifier: Send + Sync {
    fn predict(&self, image: &RgbImage, top_k: usize) -> Result<Vec<Prediction>, AppError>;
}

impl fmt::Debug for dyn Classifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Classifier")
    }
}

/// Whether the ONNX runtime can be initialised in this process.
pub fn runtime_available() -> bool {
    Session::builder().is_ok()
}

pub struct OnnxClassifier {
    session: Mutex<Session>,
    labels: Vec<String>,
    input_size: u32,
    mean: [f32; 3],
    std: [f32; 3],
}

impl OnnxClassifier {
    /// Blocking; run on a worker thread.
    pub fn load(
        snapshot: &Path,
        descriptor: &ModelDescriptor,
        onnx: &OnnxConfig,
    ) -> Result<Self, AppError> {
        let labels = read_labels(&snapshot.join(&descriptor.metadata_file))?;
        let weights = descriptor.weights_in(snapshot).ok_or_else(|| {
            AppError::NonRetriable(format!(
                "No ONNX weights for {} in {}",
                descriptor.remote_id,
                snapshot.display()
            ))
        })?;
        let session = build_session(&weights, onnx)?;
        Ok(Self {
            session: Mutex::new(session),
            labels,
            input_size: descriptor.input_size,
            mean: descriptor.mean,
            std: descriptor.std,
        })
    }
}

impl Classifier for OnnxClassifier {
    fn predict(&self, image: &RgbImage, top_k: usize) -> Result<Vec<Prediction>, AppError> {
        let tensor = preprocess_image(image, self.input_size, self.mean, self.std)?;
        let mut session = self
            .session
            .lock()
            .map_err(|_| AppError::Classification("Model session lock poisoned".to_string()))?;
        let logits = run_session(&mut session, tensor)?;
        Ok(top_predictions(&softmax(&logits), &self.labels, top_k))
    }
}

/// Labels from the `id2label` table of a hub `config.json`.
pub fn read_labels(config_path: &Path) -> Result<Vec<String>, AppError> {
    let content = std::fs::read_to_string(config_path).map_err(|e| {
        AppError::NonRetriable(format!(
            "Failed to read config file {}: {}",
            config_path.display(),
            e
        ))
    })?;
    parse_labels(&content)
}

pub fn parse_labels(content: &str) -> Result<Vec<String>, AppError> {
    let config: serde_json::Value = serde_json::from_str(content)?;
    let id2label = config["id2label"]
        .as_object()
        .ok_or_else(|| AppError::NonRetriable("Config missing id2label field".to_string()))?;

    let mut labels: Vec<(usize, String)> = id2label
        .iter()
        .filter_map(|(k, v)| {
            let idx = k.parse::<usize>().ok()?;
            Some((idx, v.as_str().unwrap_or("unknown").to_string()))
        })
        .collect();
    labels.sort_by_key(|(idx, _)| *idx);
    Ok(labels.into_iter().map(|(_, label)| label).collect())
}

fn build_session(model_path: &Path, onnx: &OnnxConfig) -> Result<Session, AppError> {
    let mut builder = Session::builder()
        .map_err(|e| AppError::NotAvailable(format!("Failed to create session builder: {}", e)))?
        .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
        .map_err(|e| AppError::NonRetriable(format!("Failed to set optimization level: {}", e)))?
        .with_intra_threads(onnx.intra_threads)
        .map_err(|e| AppError::NonRetriable(format!("Failed to set intra threads: {}", e)))?;

    if onnx.use_gpu {
        builder = builder
            .with_execution_providers([
                ort::execution_providers::DirectMLExecutionProvider::default().build(),
                ort::execution_providers::CoreMLExecutionProvider::default().build(),
                ort::execution_providers::CUDAExecutionProvider::default().build(),
                ort::execution_providers::CPUExecutionProvider::default().build(),
            ])
            .map_err(|e| {
                AppError::NonRetriable(format!("Failed to register GPU execution providers: {}", e))
            })?;
    } else {
        builder = builder
            .with_execution_providers([
                ort::execution_providers::CPUExecutionProvider::default().build(),
            ])
            .map_err(|e| {
                AppError::NonRetriable(format!("Failed to register CPU execution provider: {}", e))
            })?;
    }

    builder.commit_from_file(model_path).map_err(|e| {
        AppError::NonRetriable(format!(
            "Failed to load ONNX model {}: {}",
            model_path.display(),
            e
        ))
    })
}

/// Resize to `size`x`size` and normalise into an NCHW tensor.
pub fn preprocess_image(
    image: &RgbImage,
    size: u32,
    mean: [f32; 3],
    std: [f32; 3],
) -> Result<Array4<f32>, AppError> {
    let resized = image::imageops::resize(image, size, size, image::imageops::FilterType::Triangle);

    let hw = (size * size) as usize;
    let mut data = vec![0f32; 3 * hw];
    for (i, pixel) in resized.pixels().enumerate() {
        for c in 0..3 {
            data[c * hw + i] = (pixel[c] as f32 / 255.0 - mean[c]) / std[c];
        }
    }

    Array4::from_shape_vec((1, 3, size as usize, size as usize), data)
        .map_err(|e| AppError::Classification(format!("Failed to create tensor: {}", e)))
}

fn run_session(model: &mut Session, input: Array4<f32>) -> Result<Vec<f32>, AppError> {
    let input_name = model.inputs()[0].name().to_string();

    let input_tensor = Value::from_array(input)
        .map_err(|e| AppError::Classification(format!("Failed to create tensor value: {}", e)))?;

    let outputs = model
        .run(ort::inputs![input_name.as_str() => input_tensor])
        .map_err(|e| AppError::Classification(format!("Inference failed: {}", e)))?;

    let output_value = outputs
        .values()
        .next()
        .ok_or_else(|| AppError::Classification("Model produced no outputs".to_string()))?;

    let (_, data) = output_value
        .try_extract_tensor::<f32>()
        .map_err(|e| AppError::Classification(format!("Failed to extract output tensor: {}", e)))?;

    Ok(data.iter().copied().collect())
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let exp_sum: f32 = logits.iter().map(|&x| (x - max_logit).exp()).sum();
    logits
        .iter()
        .map(|&x| (x - max_logit).exp() / exp_sum)
        .collect()
}

pub fn top_predictions(probabilities: &[f32], labels: &[String], top_k: usize) -> Vec<Prediction> {
    let mut indexed: Vec<(usize, f32)> = probabilities.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    indexed
        .into_iter()
        .take(top_k)
        .map(|(idx, conf)| Prediction {
            class_name: labels
                .get(idx)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", idx)),
            confidence: conf,
        })
        .collect()
}
