//! EuRoC-style monocular sequences.
//!
//! Layout:
//! - `cam0/data.csv`: `timestamp [ns], filename` per frame
//! - `cam0/data/<filename>`: grayscale images
//! - `cam0/sensor.yaml`: pinhole intrinsics, resolution and radial-tangential
//!   distortion

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use csv::ReaderBuilder;
use image::GrayImage;
use serde::Deserialize;

use crate::tracking::frame::CameraModel;

#[derive(Debug, Clone)]
pub struct ImageEntry {
    pub timestamp_ns: u64,
    pub filename: String,
}

#[derive(Debug)]
pub struct MonoSequence {
    root: PathBuf,
    pub entries: Vec<ImageEntry>,
    pub camera: CameraModel,
}

impl MonoSequence {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let entries = load_image_list(&root.join("cam0/data.csv"))?;
        let camera = load_camera(&root.join("cam0/sensor.yaml"))?;
        Ok(Self { root, entries, camera })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Timestamp in seconds and grayscale image of frame `idx`.
    pub fn frame(&self, idx: usize) -> Result<(f64, GrayImage)> {
        let entry = self
            .entries
            .get(idx)
            .with_context(|| format!("No frame at index {}", idx))?;
        let path = self.root.join("cam0/data").join(&entry.filename);
        let image = image::open(&path)
            .with_context(|| format!("Failed to read image {}", path.display()))?
            .into_luma8();
        Ok((entry.timestamp_ns as f64 * 1e-9, image))
    }
}

fn load_image_list(csv_path: &Path) -> Result<Vec<ImageEntry>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 2 {
            continue;
        }
        let timestamp_ns: u64 = rec[0]
            .trim()
            .parse()
            .with_context(|| format!("Bad timestamp '{}' in {}", &rec[0], csv_path.display()))?;
        entries.push(ImageEntry {
            timestamp_ns,
            filename: rec[1].trim().to_string(),
        });
    }
    Ok(entries)
}

/// EuRoC camera sensor.yaml format
#[derive(Debug, Deserialize)]
struct CameraYaml {
    /// [fx, fy, cx, cy]
    intrinsics: Vec<f64>,
    /// [width, height]
    resolution: Vec<u32>,
    /// [k1, k2, p1, p2]
    #[serde(default)]
    distortion_coefficients: Vec<f64>,
}

fn load_camera(yaml_path: &Path) -> Result<CameraModel> {
    let file = File::open(yaml_path).with_context(|| format!("Failed to open {}", yaml_path.display()))?;
    let yaml: CameraYaml =
        serde_yaml::from_reader(file).with_context(|| format!("Failed to parse {}", yaml_path.display()))?;
    camera_from_yaml(&yaml)
}

fn camera_from_yaml(yaml: &CameraYaml) -> Result<CameraModel> {
    let &[fx, fy, cx, cy] = yaml.intrinsics.as_slice() else {
        bail!("Expected 4 intrinsics [fx, fy, cx, cy], got {}", yaml.intrinsics.len());
    };
    let &[width, height] = yaml.resolution.as_slice() else {
        bail!("Expected resolution [width, height], got {:?}", yaml.resolution);
    };
    let mut camera = CameraModel::pinhole(fx, fy, cx, cy, width, height);
    match yaml.distortion_coefficients.as_slice() {
        [] => {}
        [k1, k2, p1, p2, rest @ ..] if rest.len() <= 1 => {
            camera.k1 = *k1;
            camera.k2 = *k2;
            camera.p1 = *p1;
            camera.p2 = *p2;
            if let Some(k3) = rest.first() {
                camera.k3 = *k3;
            }
        }
        other => bail!("Expected 4 or 5 distortion coefficients, got {}", other.len()),
    }
    camera.validate()?;
    Ok(camera)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const SENSOR_YAML: &str = "sensor_type: camera\n\
        rate_hz: 20\n\
        resolution: [752, 480]\n\
        camera_model: pinhole\n\
        intrinsics: [458.654, 457.296, 367.215, 248.375]\n\
        distortion_model: radial-tangential\n\
        distortion_coefficients: [-0.28340811, 0.07395907, 0.00019359, 1.76187114e-05]\n";

    #[test]
    fn test_open_reads_list_and_calibration() {
        let dir = tempfile::tempdir().unwrap();
        let cam0 = dir.path().join("cam0");
        fs::create_dir_all(cam0.join("data")).unwrap();
        fs::write(cam0.join("sensor.yaml"), SENSOR_YAML).unwrap();
        fs::write(
            cam0.join("data.csv"),
            "#timestamp [ns],filename\n1403636579763555584,1403636579763555584.png\n1403636579813555456,1403636579813555456.png\n",
        )
        .unwrap();
        GrayImage::from_pixel(8, 6, image::Luma([200]))
            .save(cam0.join("data/1403636579763555584.png"))
            .unwrap();

        let seq = MonoSequence::open(dir.path()).unwrap();
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.camera.width, 752);
        assert!((seq.camera.fx - 458.654).abs() < 1e-9);
        assert!((seq.camera.k1 + 0.28340811).abs() < 1e-12);

        let (ts, image) = seq.frame(0).unwrap();
        assert!((ts - 1403636579.763555584).abs() < 1e-3);
        assert_eq!(image.dimensions(), (8, 6));
        assert!(seq.frame(1).is_err());
        assert!(seq.frame(5).is_err());
    }

    #[test]
    fn test_bad_intrinsics_are_rejected() {
        let yaml: CameraYaml = serde_yaml::from_str("intrinsics: [1.0, 2.0]\nresolution: [640, 480]\n").unwrap();
        assert!(camera_from_yaml(&yaml).is_err());
    }
}
