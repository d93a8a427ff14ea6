//! Affine input/output normalization: statistics, transforms, gradient duals
//! and sidecar persistence.

use std::{fs, path::Path};

use log::{debug, warn};
use ndarray::{Array1, ArrayView2, ArrayViewMut1, Axis};
use serde::Serialize;

use crate::{Result, backend::NnData};

const INPUT_OFFSET_KEY: &str = "InputOffset";
const INPUT_SCALE_KEY: &str = "InputScale";
const OUTPUT_OFFSET_KEY: &str = "OutputOffset";
const OUTPUT_SCALE_KEY: &str = "OutputScale";

const SCALE_SUFFIX: &str = "_scale.txt";

/// The four affine normalization vectors.
///
/// Offsets store the negated mean and scales the inverse standard deviation;
/// applying normalization is "add offset, then multiply by scale". The set is
/// valid iff all four vectors are non-empty; when invalid every transform is
/// a pass-through.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OffsetScale {
    pub input_offset: Array1<NnData>,
    pub input_scale: Array1<NnData>,
    pub output_offset: Array1<NnData>,
    pub output_scale: Array1<NnData>,
}

#[derive(Serialize)]
struct SidecarDoc {
    #[serde(rename = "InputOffset")]
    input_offset: Vec<NnData>,
    #[serde(rename = "InputScale")]
    input_scale: Vec<NnData>,
    #[serde(rename = "OutputOffset")]
    output_offset: Vec<NnData>,
    #[serde(rename = "OutputScale")]
    output_scale: Vec<NnData>,
}

impl OffsetScale {
    /// Whether all four vectors are present.
    pub fn valid(&self) -> bool {
        !self.input_offset.is_empty()
            && !self.input_scale.is_empty()
            && !self.output_offset.is_empty()
            && !self.output_scale.is_empty()
    }

    /// Resets to identity normalization (zero offset, unit scale) sized to
    /// the given dimensionalities.
    pub fn init_identity(&mut self, input_size: usize, output_size: usize) {
        self.input_offset = Array1::zeros(input_size);
        self.input_scale = Array1::ones(input_size);
        self.output_offset = Array1::zeros(output_size);
        self.output_scale = Array1::ones(output_size);
    }

    /// Empties all four vectors, making the set invalid.
    pub fn clear(&mut self) {
        self.input_offset = Array1::zeros(0);
        self.input_scale = Array1::zeros(0);
        self.output_offset = Array1::zeros(0);
        self.output_scale = Array1::zeros(0);
    }

    pub fn normalize_input(&self, mut x: ArrayViewMut1<NnData>) {
        if self.valid() {
            x += &self.input_offset;
            x *= &self.input_scale;
        }
    }

    pub fn unnormalize_input(&self, mut x: ArrayViewMut1<NnData>) {
        if self.valid() {
            x /= &self.input_scale;
            x -= &self.input_offset;
        }
    }

    /// Gradient dual of [`Self::normalize_input`]: no additive term, since
    /// the offset's derivative is zero.
    pub fn normalize_input_diff(&self, mut x_diff: ArrayViewMut1<NnData>) {
        if self.valid() {
            x_diff *= &self.input_scale;
        }
    }

    pub fn unnormalize_input_diff(&self, mut x_diff: ArrayViewMut1<NnData>) {
        if self.valid() {
            x_diff /= &self.input_scale;
        }
    }

    pub fn normalize_output(&self, mut y: ArrayViewMut1<NnData>) {
        if self.valid() {
            y += &self.output_offset;
            y *= &self.output_scale;
        }
    }

    pub fn unnormalize_output(&self, mut y: ArrayViewMut1<NnData>) {
        if self.valid() {
            y /= &self.output_scale;
            y -= &self.output_offset;
        }
    }

    pub fn normalize_output_diff(&self, mut y_diff: ArrayViewMut1<NnData>) {
        if self.valid() {
            y_diff *= &self.output_scale;
        }
    }

    pub fn unnormalize_output_diff(&self, mut y_diff: ArrayViewMut1<NnData>) {
        if self.valid() {
            y_diff /= &self.output_scale;
        }
    }

    /// Leniently loads the four vectors from a sidecar file.
    ///
    /// A missing or unreadable file leaves everything unchanged. Within an
    /// otherwise valid document, a missing key, unparsable value or length
    /// mismatch against `input_size`/`output_size` leaves that field alone.
    pub fn load_sidecar(&mut self, scale_file: &str, input_size: usize, output_size: usize) {
        let text = match fs::read_to_string(scale_file) {
            Ok(text) => text,
            Err(_) => {
                debug!("no normalization sidecar at {scale_file}, keeping current state");
                return;
            }
        };

        let root: serde_json::Value = match serde_json::from_str(&text) {
            Ok(root) => root,
            Err(e) => {
                warn!("malformed normalization sidecar {scale_file}: {e}");
                return;
            }
        };

        if let Some(v) = read_sized_vector(&root, INPUT_OFFSET_KEY, input_size) {
            self.input_offset = v;
        }
        if let Some(v) = read_sized_vector(&root, INPUT_SCALE_KEY, input_size) {
            self.input_scale = v;
        }
        if let Some(v) = read_sized_vector(&root, OUTPUT_OFFSET_KEY, output_size) {
            self.output_offset = v;
        }
        if let Some(v) = read_sized_vector(&root, OUTPUT_SCALE_KEY, output_size) {
            self.output_scale = v;
        }
    }

    /// Writes the four vectors as the sidecar document.
    pub fn write_sidecar(&self, scale_file: &str) -> Result<()> {
        let doc = SidecarDoc {
            input_offset: self.input_offset.to_vec(),
            input_scale: self.input_scale.to_vec(),
            output_offset: self.output_offset.to_vec(),
            output_scale: self.output_scale.to_vec(),
        };

        let text = serde_json::to_string_pretty(&doc)?;
        fs::write(scale_file, text)?;
        Ok(())
    }
}

fn read_sized_vector(
    root: &serde_json::Value,
    key: &str,
    expected_len: usize,
) -> Option<Array1<NnData>> {
    let items = root.get(key)?.as_array()?;
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        out.push(item.as_f64()?);
    }

    if out.len() != expected_len {
        debug!(
            "sidecar field {key} has {} entries, expected {expected_len}, keeping prior value",
            out.len()
        );
        return None;
    }

    Some(Array1::from_vec(out))
}

/// Computes per-column normalization statistics from a sample matrix:
/// offset = -mean, scale = 1/stddev.
///
/// A column with zero standard deviation gets scale 0, zeroing that
/// dimension's contribution entirely rather than passing it through.
pub fn calc_offset_scale(x: ArrayView2<NnData>) -> (Array1<NnData>, Array1<NnData>) {
    let cols = x.ncols();
    let mean = x
        .mean_axis(Axis(0))
        .unwrap_or_else(|| Array1::zeros(cols));

    let norm = 1.0 / x.nrows().max(1) as NnData;
    let mut variance = Array1::<NnData>::zeros(cols);
    for row in x.rows() {
        let centered = &row - &mean;
        variance += &(centered.mapv(|v| v * v) * norm);
    }

    let offset = -mean;
    let scale = variance.mapv(|v| {
        let stddev = v.sqrt();
        if stddev == 0.0 { 0.0 } else { 1.0 / stddev }
    });

    (offset, scale)
}

/// Derives the sidecar path from a checkpoint path: the extension is
/// stripped and `_scale.txt` appended.
pub fn scale_file(model_file: &str) -> String {
    let path = Path::new(model_file);
    let stem = match path.file_stem() {
        Some(stem) => stem.to_string_lossy().into_owned(),
        None => String::new(),
    };

    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent
            .join(format!("{stem}{SCALE_SUFFIX}"))
            .to_string_lossy()
            .into_owned(),
        _ => format!("{stem}{SCALE_SUFFIX}"),
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    const TOLERANCE: NnData = 1e-12;

    fn sample_offset_scale() -> OffsetScale {
        OffsetScale {
            input_offset: array![-1.0, 2.0, 0.5],
            input_scale: array![2.0, 0.25, 4.0],
            output_offset: array![0.5, -3.0],
            output_scale: array![0.5, 2.0],
        }
    }

    #[test]
    fn normalize_unnormalize_input_roundtrip() {
        let os = sample_offset_scale();
        let original = array![3.0, -7.0, 0.125];

        let mut x = original.clone();
        os.normalize_input(x.view_mut());
        os.unnormalize_input(x.view_mut());

        for (got, expected) in x.iter().zip(original.iter()) {
            assert!((got - expected).abs() < TOLERANCE, "{got} != {expected}");
        }
    }

    #[test]
    fn normalize_unnormalize_output_roundtrip() {
        let os = sample_offset_scale();
        let original = array![11.0, -0.5];

        let mut y = original.clone();
        os.normalize_output(y.view_mut());
        os.unnormalize_output(y.view_mut());

        for (got, expected) in y.iter().zip(original.iter()) {
            assert!((got - expected).abs() < TOLERANCE, "{got} != {expected}");
        }
    }

    #[test]
    fn diff_transforms_are_derivative_consistent() {
        let os = sample_offset_scale();

        let mut x_diff = array![1.0, 1.0, 1.0];
        os.normalize_input_diff(x_diff.view_mut());
        assert_eq!(x_diff, array![2.0, 0.25, 4.0]);

        os.unnormalize_input_diff(x_diff.view_mut());
        assert_eq!(x_diff, array![1.0, 1.0, 1.0]);

        let mut y_diff = array![1.0, 1.0];
        os.unnormalize_output_diff(y_diff.view_mut());
        assert_eq!(y_diff, array![2.0, 0.5]);
    }

    #[test]
    fn invalid_set_is_pass_through() {
        let os = OffsetScale::default();
        assert!(!os.valid());

        let mut x = array![1.0, 2.0];
        os.normalize_input(x.view_mut());
        assert_eq!(x, array![1.0, 2.0]);
    }

    #[test]
    fn identity_init_sizes() {
        let mut os = OffsetScale::default();
        os.init_identity(3, 2);

        assert!(os.valid());
        assert_eq!(os.input_offset, Array1::<NnData>::zeros(3));
        assert_eq!(os.input_scale, Array1::<NnData>::ones(3));
        assert_eq!(os.output_offset, Array1::<NnData>::zeros(2));
        assert_eq!(os.output_scale, Array1::<NnData>::ones(2));
    }

    #[test]
    fn offset_is_negated_mean_scale_is_inverse_stddev() {
        let x = array![[0.0, 1.0], [2.0, 3.0], [4.0, 5.0]];
        let (offset, scale) = calc_offset_scale(x.view());

        assert!((offset[0] - -2.0).abs() < TOLERANCE);
        assert!((offset[1] - -3.0).abs() < TOLERANCE);

        // population stddev of {0, 2, 4} is sqrt(8/3)
        let expected = 1.0 / (8.0f64 / 3.0).sqrt();
        assert!((scale[0] - expected).abs() < TOLERANCE);
        assert!((scale[1] - expected).abs() < TOLERANCE);
    }

    #[test]
    fn zero_variance_column_gets_zero_scale() {
        let x = array![[5.0, 1.0], [5.0, 2.0], [5.0, 3.0]];
        let (offset, scale) = calc_offset_scale(x.view());

        assert_eq!(offset[0], -5.0);
        assert_eq!(scale[0], 0.0);
        assert!(scale[1] > 0.0);
    }

    #[test]
    fn scale_file_replaces_extension() {
        assert_eq!(scale_file("models/policy.ckpt"), "models/policy_scale.txt");
        assert_eq!(scale_file("policy.ckpt"), "policy_scale.txt");
        assert_eq!(scale_file("policy"), "policy_scale.txt");
    }

    #[test]
    fn sidecar_load_is_lenient_per_field() {
        let mut os = sample_offset_scale();
        let prior = os.clone();

        let dir = std::env::temp_dir();
        let path = dir.join(format!("policy_net_sidecar_{}.txt", std::process::id()));
        let path = path.to_string_lossy().into_owned();

        // OutputScale has the wrong length, InputScale is missing entirely.
        let doc = r#"{
            "InputOffset": [9.0, 9.0, 9.0],
            "OutputOffset": [1.0, 1.0],
            "OutputScale": [1.0]
        }"#;
        fs::write(&path, doc).unwrap();

        os.load_sidecar(&path, 3, 2);
        fs::remove_file(&path).ok();

        assert_eq!(os.input_offset, array![9.0, 9.0, 9.0]);
        assert_eq!(os.input_scale, prior.input_scale);
        assert_eq!(os.output_offset, array![1.0, 1.0]);
        assert_eq!(os.output_scale, prior.output_scale);
    }

    #[test]
    fn missing_sidecar_leaves_state_unchanged() {
        let mut os = sample_offset_scale();
        let prior = os.clone();

        os.load_sidecar("/definitely/not/a/real/file_scale.txt", 3, 2);
        assert_eq!(os, prior);
    }
}
