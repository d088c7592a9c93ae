//! Haar cascade face locator.
//!
//! Evaluates a boosted cascade of Haar-like stump classifiers over an image
//! pyramid (sliding-window detection), then clusters the raw hits and keeps
//! clusters supported by enough neighbors.
//!
//! Cascades are read from OpenCV's stock `opencv_storage` XML files
//! (`haarcascade_frontalface_default.xml`), limited to HAAR features with
//! depth-1 weak classifiers. A `.json` path is read instead as a serialized
//! [`HaarCascade`]:
//!
//! ```json
//! {
//!   "window_width": 24, "window_height": 24,
//!   "stages": [{ "threshold": -0.75, "classifiers": [
//!     { "feature": 0, "threshold": -0.03, "left": 0.83, "right": -0.49 }
//!   ]}],
//!   "features": [{ "rects": [
//!     { "x": 6, "y": 4, "width": 12, "height": 9, "weight": -1.0 },
//!     { "x": 6, "y": 7, "width": 12, "height": 3, "weight": 3.0 }
//!   ]}]
//! }
//! ```

use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use roxmltree::Node;
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

// --- Named constants (no magic numbers) ---
const DEFAULT_SCALE_FACTOR: f64 = 1.3;
const DEFAULT_MIN_NEIGHBORS: u32 = 5;
/// Relative tolerance used when clustering raw hits.
const GROUP_EPS: f64 = 0.2;
/// Sliding-window step switches to 1 pixel past this pyramid factor.
const FINE_STEP_FACTOR: f64 = 2.0;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("cascade file not found: {0} — place the frontal-face cascade in the model directory")]
    ModelNotFound(String),
    #[error("failed to read cascade {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cascade parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("cascade XML error: {0}")]
    Xml(#[from] roxmltree::Error),
    #[error("invalid cascade: {0}")]
    InvalidCascade(String),
    #[error("invalid detector parameters: {0}")]
    InvalidParams(String),
}

/// Detects candidate face boxes in a single frame.
///
/// Boxes are returned in detector output order; callers that need one face
/// take the first.
pub trait FaceLocator: Send + Sync {
    fn locate(&self, frame: &RgbImage) -> Vec<BoundingBox>;
}

/// One weighted rectangle of a Haar-like feature, relative to the window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeightedRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaarFeature {
    pub rects: Vec<WeightedRect>,
}

/// Depth-1 decision tree over one feature.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stump {
    pub feature: usize,
    pub threshold: f64,
    /// Vote when the normalized feature value is below `threshold`.
    pub left: f64,
    /// Vote otherwise.
    pub right: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub threshold: f64,
    pub classifiers: Vec<Stump>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HaarCascade {
    pub window_width: u32,
    pub window_height: u32,
    pub stages: Vec<Stage>,
    pub features: Vec<HaarFeature>,
}

impl HaarCascade {
    /// Parse an OpenCV HAAR cascade in the `opencv_storage` XML layout.
    ///
    /// Each weak classifier must be a stump: `internalNodes` holds
    /// `left right feature threshold` and `leafValues` the two votes.
    /// Feature rects are `x y width height weight`.
    pub fn from_opencv_xml(xml: &str) -> Result<Self, DetectorError> {
        let doc = roxmltree::Document::parse(xml)?;
        let cascade = child(doc.root_element(), "cascade")?;

        if let Some(kind) = elements(cascade).find(|n| n.has_tag_name("featureType")) {
            let kind = kind.text().unwrap_or_default().trim();
            if kind != "HAAR" {
                return Err(DetectorError::InvalidCascade(format!(
                    "feature type {kind} is not supported"
                )));
            }
        }

        let window_width = number(child(cascade, "width")?)?;
        let window_height = number(child(cascade, "height")?)?;

        let stages = elements(child(cascade, "stages")?)
            .map(|stage| -> Result<Stage, DetectorError> {
                let threshold = number(child(stage, "stageThreshold")?)?;
                let classifiers = elements(child(stage, "weakClassifiers")?)
                    .map(read_stump)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Stage { threshold, classifiers })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let features = elements(child(cascade, "features")?)
            .map(read_feature)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            window_width,
            window_height,
            stages,
            features,
        })
    }

    fn validate(&self) -> Result<(), DetectorError> {
        if self.window_width < 3 || self.window_height < 3 {
            return Err(DetectorError::InvalidCascade(format!(
                "window {}x{} is too small",
                self.window_width, self.window_height
            )));
        }
        if self.stages.is_empty() {
            return Err(DetectorError::InvalidCascade("no stages".into()));
        }
        for (si, stage) in self.stages.iter().enumerate() {
            for stump in &stage.classifiers {
                if stump.feature >= self.features.len() {
                    return Err(DetectorError::InvalidCascade(format!(
                        "stage {si} references feature {} of {}",
                        stump.feature,
                        self.features.len()
                    )));
                }
            }
        }
        for (fi, feature) in self.features.iter().enumerate() {
            for r in &feature.rects {
                if r.x + r.width > self.window_width || r.y + r.height > self.window_height {
                    return Err(DetectorError::InvalidCascade(format!(
                        "feature {fi} rect ({}, {}, {}, {}) exceeds the window",
                        r.x, r.y, r.width, r.height
                    )));
                }
            }
        }
        Ok(())
    }
}

fn elements<'a, 'i>(node: Node<'a, 'i>) -> impl Iterator<Item = Node<'a, 'i>> {
    node.children().filter(|n| n.is_element())
}

fn child<'a, 'i>(node: Node<'a, 'i>, tag: &str) -> Result<Node<'a, 'i>, DetectorError> {
    elements(node).find(|n| n.has_tag_name(tag)).ok_or_else(|| {
        DetectorError::InvalidCascade(format!("<{}> has no <{tag}>", node.tag_name().name()))
    })
}

fn tokens<'a>(node: Node<'a, '_>) -> Vec<&'a str> {
    node.text().unwrap_or_default().split_whitespace().collect()
}

fn parse_token<T: FromStr>(token: &str, node: Node<'_, '_>) -> Result<T, DetectorError> {
    token.parse().map_err(|_| {
        DetectorError::InvalidCascade(format!(
            "bad value {token:?} in <{}>",
            node.tag_name().name()
        ))
    })
}

fn number<T: FromStr>(node: Node<'_, '_>) -> Result<T, DetectorError> {
    match tokens(node).as_slice() {
        [token] => parse_token(token, node),
        _ => Err(DetectorError::InvalidCascade(format!(
            "<{}> must hold one value",
            node.tag_name().name()
        ))),
    }
}

fn read_stump(weak: Node<'_, '_>) -> Result<Stump, DetectorError> {
    let nodes_el = child(weak, "internalNodes")?;
    let leaves_el = child(weak, "leafValues")?;
    let (nodes, leaves) = (tokens(nodes_el), tokens(leaves_el));
    if nodes.len() != 4 || leaves.len() != 2 {
        return Err(DetectorError::InvalidCascade(format!(
            "weak classifier has {} node values and {} leaves; only stumps are supported",
            nodes.len(),
            leaves.len()
        )));
    }
    Ok(Stump {
        feature: parse_token(nodes[2], nodes_el)?,
        threshold: parse_token(nodes[3], nodes_el)?,
        left: parse_token(leaves[0], leaves_el)?,
        right: parse_token(leaves[1], leaves_el)?,
    })
}

fn read_feature(feature: Node<'_, '_>) -> Result<HaarFeature, DetectorError> {
    if let Some(tilted) = elements(feature).find(|n| n.has_tag_name("tilted")) {
        if number::<u32>(tilted)? != 0 {
            return Err(DetectorError::InvalidCascade("tilted features are not supported".into()));
        }
    }
    let rects = elements(child(feature, "rects")?)
        .map(|rect| -> Result<WeightedRect, DetectorError> {
            match tokens(rect).as_slice() {
                [x, y, w, h, weight] => Ok(WeightedRect {
                    x: parse_token(x, rect)?,
                    y: parse_token(y, rect)?,
                    width: parse_token(w, rect)?,
                    height: parse_token(h, rect)?,
                    // Stock files write whole weights as "-1." which f64 accepts.
                    weight: parse_token(weight, rect)?,
                }),
                other => Err(DetectorError::InvalidCascade(format!(
                    "rect needs 5 values, got {}",
                    other.len()
                ))),
            }
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(HaarFeature { rects })
}

/// Multi-scale search parameters.
#[derive(Debug, Clone, Copy)]
pub struct DetectorParams {
    /// Pyramid step between scales; must be > 1.
    pub scale_factor: f64,
    /// A cluster needs more than this many raw hits to be reported.
    pub min_neighbors: u32,
}

impl Default for DetectorParams {
    fn default() -> Self {
        Self {
            scale_factor: DEFAULT_SCALE_FACTOR,
            min_neighbors: DEFAULT_MIN_NEIGHBORS,
        }
    }
}

/// Haar cascade face detector.
pub struct CascadeDetector {
    cascade: HaarCascade,
    params: DetectorParams,
}

impl CascadeDetector {
    /// Load a cascade from the given path with default parameters.
    ///
    /// `.json` files hold a serialized [`HaarCascade`]; anything else is read
    /// as OpenCV XML. A missing or malformed cascade is a startup error;
    /// nothing is retried per frame.
    pub fn load(cascade_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(cascade_path).exists() {
            return Err(DetectorError::ModelNotFound(cascade_path.to_string()));
        }
        let raw = std::fs::read_to_string(cascade_path).map_err(|source| DetectorError::Io {
            path: cascade_path.to_string(),
            source,
        })?;
        let is_json = Path::new(cascade_path)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let cascade = if is_json {
            serde_json::from_str(&raw)?
        } else {
            HaarCascade::from_opencv_xml(&raw)?
        };
        let detector = Self::new(cascade, DetectorParams::default())?;

        tracing::info!(
            path = cascade_path,
            stages = detector.cascade.stages.len(),
            features = detector.cascade.features.len(),
            window = ?(detector.cascade.window_width, detector.cascade.window_height),
            "loaded Haar cascade"
        );

        Ok(detector)
    }

    pub fn new(cascade: HaarCascade, params: DetectorParams) -> Result<Self, DetectorError> {
        cascade.validate()?;
        if params.scale_factor.is_nan() || params.scale_factor <= 1.0 {
            return Err(DetectorError::InvalidParams(format!(
                "scale factor must be > 1, got {}",
                params.scale_factor
            )));
        }
        Ok(Self { cascade, params })
    }

    /// Detect faces in a grayscale image.
    pub fn detect_gray(&self, gray: &GrayImage) -> Vec<BoundingBox> {
        let (img_w, img_h) = gray.dimensions();
        let (win_w, win_h) = (self.cascade.window_width, self.cascade.window_height);
        let mut candidates = Vec::new();
        let mut factor = 1.0f64;

        loop {
            let scaled_w = (img_w as f64 / factor).round() as u32;
            let scaled_h = (img_h as f64 / factor).round() as u32;
            if scaled_w < win_w || scaled_h < win_h {
                break;
            }

            let window_w = (win_w as f64 * factor).round() as i64;
            let window_h = (win_h as f64 * factor).round() as i64;

            let integral = if factor == 1.0 {
                IntegralImage::new(gray)
            } else {
                IntegralImage::new(&imageops::resize(gray, scaled_w, scaled_h, FilterType::Triangle))
            };

            let step = if factor > FINE_STEP_FACTOR { 1 } else { 2 };
            for y in (0..=scaled_h - win_h).step_by(step) {
                for x in (0..=scaled_w - win_w).step_by(step) {
                    if self.evaluate_window(&integral, x as usize, y as usize) {
                        candidates.push(Rect {
                            x: (x as f64 * factor).round() as i64,
                            y: (y as f64 * factor).round() as i64,
                            w: window_w,
                            h: window_h,
                        });
                    }
                }
            }

            factor *= self.params.scale_factor;
        }

        tracing::trace!(raw = candidates.len(), "cascade candidates");
        group_rectangles(&candidates, self.params.min_neighbors, GROUP_EPS)
    }

    /// Run every stage on the window anchored at (x, y). True if all stages pass.
    fn evaluate_window(&self, integral: &IntegralImage, x: usize, y: usize) -> bool {
        let win_w = self.cascade.window_width as usize;
        let win_h = self.cascade.window_height as usize;

        // Variance normalization over the window interior.
        let (nw, nh) = (win_w - 2, win_h - 2);
        let area = (nw * nh) as f64;
        let sum = integral.sum(x + 1, y + 1, nw, nh) as f64;
        let sqsum = integral.sqsum(x + 1, y + 1, nw, nh) as f64;
        let variance = area * sqsum - sum * sum;
        let inv_norm = if variance > 0.0 { 1.0 / variance.sqrt() } else { 1.0 };

        for stage in &self.cascade.stages {
            let mut stage_sum = 0.0f64;
            for stump in &stage.classifiers {
                let feature = &self.cascade.features[stump.feature];
                let raw: f64 = feature
                    .rects
                    .iter()
                    .map(|r| {
                        r.weight
                            * integral.sum(
                                x + r.x as usize,
                                y + r.y as usize,
                                r.width as usize,
                                r.height as usize,
                            ) as f64
                    })
                    .sum();
                let value = raw * inv_norm;
                stage_sum += if value < stump.threshold { stump.left } else { stump.right };
            }
            if stage_sum < stage.threshold {
                return false;
            }
        }
        true
    }
}

impl FaceLocator for CascadeDetector {
    fn locate(&self, frame: &RgbImage) -> Vec<BoundingBox> {
        let gray = imageops::grayscale(frame);
        self.detect_gray(&gray)
    }
}

/// Summed-area tables for pixel values and squared pixel values.
struct IntegralImage {
    stride: usize,
    sum: Vec<u64>,
    sqsum: Vec<u64>,
}

impl IntegralImage {
    fn new(gray: &GrayImage) -> Self {
        let (w, h) = (gray.width() as usize, gray.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0u64; stride * (h + 1)];
        let mut sqsum = vec![0u64; stride * (h + 1)];
        let pixels = gray.as_raw();

        for y in 0..h {
            let mut row_sum = 0u64;
            let mut row_sq = 0u64;
            for x in 0..w {
                let p = pixels[y * w + x] as u64;
                row_sum += p;
                row_sq += p * p;
                sum[(y + 1) * stride + x + 1] = sum[y * stride + x + 1] + row_sum;
                sqsum[(y + 1) * stride + x + 1] = sqsum[y * stride + x + 1] + row_sq;
            }
        }

        Self { stride, sum, sqsum }
    }

    fn sum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        Self::rect(&self.sum, self.stride, x, y, w, h)
    }

    fn sqsum(&self, x: usize, y: usize, w: usize, h: usize) -> u64 {
        Self::rect(&self.sqsum, self.stride, x, y, w, h)
    }

    fn rect(table: &[u64], stride: usize, x: usize, y: usize, w: usize, h: usize) -> u64 {
        let a = table[y * stride + x];
        let b = table[y * stride + x + w];
        let c = table[(y + h) * stride + x];
        let d = table[(y + h) * stride + x + w];
        (d + a) - (b + c)
    }
}

/// Raw hit in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Rect {
    x: i64,
    y: i64,
    w: i64,
    h: i64,
}

fn similar(a: &Rect, b: &Rect, eps: f64) -> bool {
    let delta = eps * (a.w.min(b.w) + a.h.min(b.h)) as f64 * 0.5;
    (a.x - b.x).abs() as f64 <= delta
        && (a.y - b.y).abs() as f64 <= delta
        && (a.x + a.w - b.x - b.w).abs() as f64 <= delta
        && (a.y + a.h - b.y - b.h).abs() as f64 <= delta
}

fn find_root(parent: &mut [usize], mut i: usize) -> usize {
    while parent[i] != i {
        parent[i] = parent[parent[i]];
        i = parent[i];
    }
    i
}

/// Cluster similar raw hits, average each cluster, and keep clusters with
/// more than `min_neighbors` members that are not nested inside a stronger one.
///
/// Output follows the order in which clusters first appear in `rects`.
fn group_rectangles(rects: &[Rect], min_neighbors: u32, eps: f64) -> Vec<BoundingBox> {
    if min_neighbors == 0 {
        return rects.iter().map(|r| to_bbox(r, 1)).collect();
    }

    let n = rects.len();
    let mut parent: Vec<usize> = (0..n).collect();
    for i in 0..n {
        for j in (i + 1)..n {
            if similar(&rects[i], &rects[j], eps) {
                let ri = find_root(&mut parent, i);
                let rj = find_root(&mut parent, j);
                if ri != rj {
                    parent[ri.max(rj)] = ri.min(rj);
                }
            }
        }
    }

    // Label clusters in order of first appearance.
    let mut label_of_root = vec![usize::MAX; n];
    let mut sums: Vec<(i64, i64, i64, i64)> = Vec::new();
    let mut counts: Vec<i64> = Vec::new();
    for (i, r) in rects.iter().enumerate() {
        let root = find_root(&mut parent, i);
        if label_of_root[root] == usize::MAX {
            label_of_root[root] = sums.len();
            sums.push((0, 0, 0, 0));
            counts.push(0);
        }
        let cls = label_of_root[root];
        sums[cls].0 += r.x;
        sums[cls].1 += r.y;
        sums[cls].2 += r.w;
        sums[cls].3 += r.h;
        counts[cls] += 1;
    }

    let averaged: Vec<Rect> = sums
        .iter()
        .zip(&counts)
        .map(|(&(x, y, w, h), &c)| {
            let s = 1.0 / c as f64;
            Rect {
                x: (x as f64 * s).round() as i64,
                y: (y as f64 * s).round() as i64,
                w: (w as f64 * s).round() as i64,
                h: (h as f64 * s).round() as i64,
            }
        })
        .collect();

    let threshold = min_neighbors as i64;
    let mut result = Vec::new();
    for (i, r1) in averaged.iter().enumerate() {
        let n1 = counts[i];
        if n1 <= threshold {
            continue;
        }
        let nested = averaged.iter().enumerate().any(|(j, r2)| {
            let n2 = counts[j];
            if j == i || n2 <= threshold {
                return false;
            }
            let dx = (r2.w as f64 * eps).round() as i64;
            let dy = (r2.h as f64 * eps).round() as i64;
            r1.x >= r2.x - dx
                && r1.y >= r2.y - dy
                && r1.x + r1.w <= r2.x + r2.w + dx
                && r1.y + r1.h <= r2.y + r2.h + dy
                && (n2 > n1.max(3) || n1 < 3)
        });
        if !nested {
            result.push(to_bbox(r1, n1 as u32));
        }
    }

    result
}

fn to_bbox(r: &Rect, neighbors: u32) -> BoundingBox {
    BoundingBox {
        x: r.x.max(0) as u32,
        y: r.y.max(0) as u32,
        width: r.w.max(0) as u32,
        height: r.h.max(0) as u32,
        neighbors,
    }
}
