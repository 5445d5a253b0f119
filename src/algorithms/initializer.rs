use nalgebra::DMatrix;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

/// One draw from N(0, 1) via Box-Muller.
pub fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    // u1 in (0, 1] keeps ln() finite
    let u1: f32 = 1.0 - rng.gen::<f32>();
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * PI * u2).cos()
}

pub fn normal<R: Rng + ?Sized>(rng: &mut R, size: usize, mean: f32, std_dev: f32) -> Vec<f32> {
    (0..size)
        .map(|_| standard_normal(rng) * std_dev + mean)
        .collect()
}

pub fn uniform<R: Rng + ?Sized>(rng: &mut R, size: usize, low: f32, high: f32) -> Vec<f32> {
    (0..size).map(|_| rng.gen_range(low..high)).collect()
}

pub fn lecun_normal<R: Rng + ?Sized>(rng: &mut R, size: usize, fan_in: usize) -> Vec<f32> {
    let std_dev = (1.0 / fan_in.max(1) as f32).sqrt();
    normal(rng, size, 0.0, std_dev)
}

pub fn xavier_uniform<R: Rng + ?Sized>(
    rng: &mut R,
    size: usize,
    fan_in: usize,
    fan_out: usize,
) -> Vec<f32> {
    let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    uniform(rng, size, -limit, limit)
}

pub fn xavier_normal<R: Rng + ?Sized>(
    rng: &mut R,
    size: usize,
    fan_in: usize,
    fan_out: usize,
) -> Vec<f32> {
    let std_dev = (2.0 / (fan_in + fan_out).max(1) as f32).sqrt();
    normal(rng, size, 0.0, std_dev)
}

pub fn zeros(size: usize) -> Vec<f32> {
    vec![0.0; size]
}

pub fn constant(size: usize, value: f32) -> Vec<f32> {
    vec![value; size]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum InitializationMethod {
    LecunNormal,
    XavierUniform,
    XavierNormal,
    Uniform { low: f32, high: f32 },
    Normal { mean: f32, std_dev: f32 },
    Zeros,
    Constant { value: f32 },
}

impl Default for InitializationMethod {
    fn default() -> Self {
        InitializationMethod::LecunNormal
    }
}

impl InitializationMethod {
    /// Fills a `rows x cols` table; each row is one embedding, so `cols` is
    /// the fan-in.
    pub fn initialize_matrix<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        rows: usize,
        cols: usize,
    ) -> DMatrix<f32> {
        let size = rows * cols;
        let values = match self {
            InitializationMethod::LecunNormal => lecun_normal(rng, size, cols),
            InitializationMethod::XavierUniform => xavier_uniform(rng, size, cols, rows),
            InitializationMethod::XavierNormal => xavier_normal(rng, size, cols, rows),
            InitializationMethod::Uniform { low, high } => uniform(rng, size, *low, *high),
            InitializationMethod::Normal { mean, std_dev } => normal(rng, size, *mean, *std_dev),
            InitializationMethod::Zeros => zeros(size),
            InitializationMethod::Constant { value } => constant(size, *value),
        };
        DMatrix::from_row_slice(rows, cols, &values)
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            InitializationMethod::Uniform { low, high } if !(low < high) => {
                Err(format!("uniform init needs low < high, got [{low}, {high})"))
            }
            InitializationMethod::Normal { std_dev, .. } if !(*std_dev >= 0.0) => {
                Err(format!("normal init needs std_dev >= 0, got {std_dev}"))
            }
            _ => Ok(()),
        }
    }
}
