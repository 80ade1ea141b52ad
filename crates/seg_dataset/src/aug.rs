//! Paired image/label augmentation.
//!
//! Geometry is applied identically to every image channel and to the label;
//! labels are only ever sampled with nearest neighbour so class indices stay intact.

use crate::types::{DatasetResult, SegDatasetError, SegSample};
use image::imageops::FilterType;
use image::{ImageBuffer, Luma};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RandomGenerator {
    /// Output `(height, width)`.
    pub output_size: (usize, usize),
    /// Probability of a random 90° rotation followed by a random-axis flip.
    pub rot_flip_prob: f32,
    /// Probability of a small rotation, tried only when rot/flip was not applied.
    pub rotate_prob: f32,
    /// Rotation angle is drawn from `-max_angle_deg..max_angle_deg`.
    pub max_angle_deg: i32,
}

impl RandomGenerator {
    pub fn new(output_size: (usize, usize)) -> Self {
        Self {
            output_size,
            rot_flip_prob: 0.5,
            rotate_prob: 0.5,
            max_angle_deg: 20,
        }
    }

    /// No random geometry; only resizes to `output_size`.
    pub fn resize_only(output_size: (usize, usize)) -> Self {
        Self {
            rot_flip_prob: 0.0,
            rotate_prob: 0.0,
            ..Self::new(output_size)
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "output={}x{} rot_flip_p={:.2} rotate_p={:.2} max_angle={}",
            self.output_size.0,
            self.output_size.1,
            self.rot_flip_prob,
            self.rotate_prob,
            self.max_angle_deg
        )
    }

    pub fn apply<R: Rng + ?Sized>(&self, sample: SegSample, rng: &mut R) -> DatasetResult<SegSample> {
        let (out_h, out_w) = self.output_size;
        if out_h == 0 || out_w == 0 {
            return Err(SegDatasetError::Other(
                "augmentation output size must be non-zero".to_string(),
            ));
        }
        let SegSample {
            name,
            image,
            label,
            channels,
            height,
            width,
        } = sample;
        let plane_len = height * width;
        let mut planes: Vec<Vec<f32>> = image.chunks(plane_len.max(1)).map(<[f32]>::to_vec).collect();
        let mut label = label;
        let (mut h, mut w) = (height, width);

        if rng.random::<f32>() < self.rot_flip_prob {
            let k = rng.random_range(0..4);
            let axis = rng.random_range(0..2);
            for plane in planes.iter_mut() {
                *plane = flip(&rot90(plane, h, w, k), rotated_dims(h, w, k), axis);
            }
            label = flip(&rot90(&label, h, w, k), rotated_dims(h, w, k), axis);
            (h, w) = rotated_dims(h, w, k);
        } else if rng.random::<f32>() < self.rotate_prob && self.max_angle_deg > 0 {
            let angle = rng.random_range(-self.max_angle_deg..self.max_angle_deg) as f32;
            for plane in planes.iter_mut() {
                *plane = rotate_nearest(plane, h, w, angle);
            }
            label = rotate_nearest(&label, h, w, angle);
        }

        if (h, w) != (out_h, out_w) {
            for plane in planes.iter_mut() {
                *plane = resize_plane(std::mem::take(plane), h, w, out_h, out_w, &name)?;
            }
            label = resize_nearest(&label, h, w, out_h, out_w);
            (h, w) = (out_h, out_w);
        }

        SegSample::new(name, planes.concat(), label, channels, h, w)
    }
}

fn rotated_dims(h: usize, w: usize, k: u32) -> (usize, usize) {
    if k % 2 == 1 {
        (w, h)
    } else {
        (h, w)
    }
}

/// Rotates a row-major plane counter-clockwise by `k` quarter turns.
pub fn rot90<T: Copy>(plane: &[T], h: usize, w: usize, k: u32) -> Vec<T> {
    let mut out = plane.to_vec();
    let (mut h, mut w) = (h, w);
    for _ in 0..k % 4 {
        let mut next = Vec::with_capacity(out.len());
        // new dims (w, h): out[i][j] = in[j][w - 1 - i]
        for i in 0..w {
            for j in 0..h {
                next.push(out[j * w + (w - 1 - i)]);
            }
        }
        out = next;
        (h, w) = (w, h);
    }
    out
}

/// Flips along rows (`axis == 0`) or columns (`axis == 1`).
pub fn flip<T: Copy>(plane: &[T], dims: (usize, usize), axis: u32) -> Vec<T> {
    let (h, w) = dims;
    let mut out = Vec::with_capacity(plane.len());
    for y in 0..h {
        for x in 0..w {
            let (sy, sx) = if axis == 0 { (h - 1 - y, x) } else { (y, w - 1 - x) };
            out.push(plane[sy * w + sx]);
        }
    }
    out
}

/// Rotates about the centre by `angle_deg`, keeping the shape; uncovered pixels become the default value.
pub fn rotate_nearest<T: Copy + Default>(plane: &[T], h: usize, w: usize, angle_deg: f32) -> Vec<T> {
    let (sin, cos) = angle_deg.to_radians().sin_cos();
    let cy = (h as f32 - 1.0) / 2.0;
    let cx = (w as f32 - 1.0) / 2.0;
    let mut out = vec![T::default(); plane.len()];
    for y in 0..h {
        for x in 0..w {
            let dy = y as f32 - cy;
            let dx = x as f32 - cx;
            let sy = (cos * dy - sin * dx + cy).round();
            let sx = (sin * dy + cos * dx + cx).round();
            if sy >= 0.0 && sx >= 0.0 && (sy as usize) < h && (sx as usize) < w {
                out[y * w + x] = plane[sy as usize * w + sx as usize];
            }
        }
    }
    out
}

fn resize_plane(
    plane: Vec<f32>,
    h: usize,
    w: usize,
    out_h: usize,
    out_w: usize,
    name: &str,
) -> DatasetResult<Vec<f32>> {
    let buf: ImageBuffer<Luma<f32>, Vec<f32>> = ImageBuffer::from_raw(w as u32, h as u32, plane)
        .ok_or_else(|| SegDatasetError::ShapeMismatch {
            name: name.to_string(),
            msg: format!("plane does not fit {h}x{w}"),
        })?;
    let resized = image::imageops::resize(&buf, out_w as u32, out_h as u32, FilterType::CatmullRom);
    Ok(resized.into_raw())
}

pub fn resize_nearest<T: Copy>(plane: &[T], h: usize, w: usize, out_h: usize, out_w: usize) -> Vec<T> {
    let mut out = Vec::with_capacity(out_h * out_w);
    for y in 0..out_h {
        let sy = (((y as f32 + 0.5) * h as f32 / out_h as f32) as usize).min(h - 1);
        for x in 0..out_w {
            let sx = (((x as f32 + 0.5) * w as f32 / out_w as f32) as usize).min(w - 1);
            out.push(plane[sy * w + sx]);
        }
    }
    out
}
