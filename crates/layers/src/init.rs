//! Variable initialization.
//!
//! [`init_var`] turns a [`WeightHParams`] and a seed into a tensor. Values
//! are sampled on the host in `f64` from a seeded [`StdRng`] and cast to the
//! requested dtype, so the same seed and metadata always produce the same
//! tensor regardless of device.

use candle_core::{DType, Device, Shape, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;
use sha2::{Digest, Sha256};

use crate::{
    precondition,
    weights::{fan_in_fan_out, InitMethod, WeightHParams},
    LayerError, Result,
};

/// Derives an independent seed from `seed` and a label.
pub fn fold_in(seed: u64, data: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update(data.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn normal(rng: &mut StdRng, n: usize) -> Vec<f64> {
    (0..n).map(|_| rng.sample::<f64, _>(StandardNormal)).collect()
}

fn uniform(rng: &mut StdRng, n: usize) -> Vec<f64> {
    (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

/// Standard normal samples rejected outside `[-2, 2]`.
fn truncated_normal(rng: &mut StdRng, n: usize) -> Vec<f64> {
    (0..n)
        .map(|_| loop {
            let x: f64 = rng.sample(StandardNormal);
            if (-2.0..=2.0).contains(&x) {
                break x;
            }
        })
        .collect()
}

/// Row-major `rows x cols` matrix with orthonormal rows or columns
/// (whichever is the shorter side), from Gram-Schmidt on a Gaussian matrix.
fn orthogonal(rng: &mut StdRng, rows: usize, cols: usize) -> Vec<f64> {
    let (m, n) = (rows.max(cols), rows.min(cols));
    let a = normal(rng, m * n);
    // Column-major copy of the m x n Gaussian matrix.
    let mut q: Vec<Vec<f64>> = (0..n).map(|j| (0..m).map(|i| a[i * n + j]).collect()).collect();
    for j in 0..n {
        for k in 0..j {
            let r: f64 = (0..m).map(|i| q[k][i] * q[j][i]).sum();
            for i in 0..m {
                q[j][i] -= r * q[k][i];
            }
        }
        let norm = q[j].iter().map(|x| x * x).sum::<f64>().sqrt().max(f64::MIN_POSITIVE);
        q[j].iter_mut().for_each(|x| *x /= norm);
    }
    let mut out = vec![0.0; rows * cols];
    for r in 0..rows {
        for c in 0..cols {
            out[r * cols + c] = if rows >= cols { q[c][r] } else { q[r][c] };
        }
    }
    out
}

/// Orthogonal matrix scaled by `max(sqrt(rows / cols), 1)`.
fn scaled_orthogonal(rng: &mut StdRng, rows: usize, cols: usize) -> Vec<f64> {
    let scale = (rows as f64 / cols as f64).sqrt().max(1.0);
    orthogonal(rng, rows, cols)
        .into_iter()
        .map(|x| x * scale)
        .collect()
}

/// Zeros everywhere except a scaled orthogonal matrix at the spatial centre.
fn scaled_delta_orthogonal(rng: &mut StdRng, shape: &[usize]) -> Result<Vec<f64>> {
    if !(3..=5).contains(&shape.len()) {
        return Err(LayerError::UnsupportedRank {
            method: InitMethod::DeltaOrthogonal.to_string(),
            rank: shape.len(),
        });
    }
    let (spatial, matrix) = shape.split_at(shape.len() - 2);
    let (rows, cols) = (matrix[0], matrix[1]);
    let block = rows * cols;
    let offset = spatial
        .iter()
        .fold(0, |acc, &k| acc * k + (k - 1) / 2)
        * block;
    let mut out = vec![0.0; shape.iter().product()];
    out[offset..offset + block].copy_from_slice(&scaled_orthogonal(rng, rows, cols));
    Ok(out)
}

fn to_tensor(values: Vec<f64>, shape: &[usize], dtype: DType, device: &Device) -> Result<Tensor> {
    let shape = Shape::from(shape.to_vec());
    let tensor = if dtype == DType::F64 {
        Tensor::from_vec(values, shape, device)?
    } else {
        let values: Vec<f32> = values.into_iter().map(|v| v as f32).collect();
        Tensor::from_vec(values, shape, device)?.to_dtype(dtype)?
    };
    Ok(tensor)
}

/// Creates the initial value of a variable.
///
/// `init` and `dtype` must already be resolved on `hparams`; layers fill
/// them from their own defaults before calling this. Repeat prefixes are
/// not supported here.
pub fn init_var(hparams: &WeightHParams, seed: u64, name: &str, device: &Device) -> Result<Tensor> {
    let init = hparams
        .init
        .as_ref()
        .ok_or_else(|| precondition(format!("variable {name} has no initializer")))?;
    let dtype = hparams.dtype.unwrap_or(DType::F32);
    let shape = hparams.shape.as_slice();
    log_at!(
        info,
        "Creating var {name} with shape={shape:?}, dtype={}, init method={} and scale={}",
        dtype.as_str(),
        init.method,
        init.scale
    );
    if hparams.repeat_prefix.as_ref().is_some_and(|p| !p.is_empty())
        || hparams
            .repeat_prefix_split_dims_mapping
            .as_ref()
            .is_some_and(|p| !p.is_empty())
    {
        return Err(precondition(format!(
            "variable {name} has a repeat prefix; initialize the per-instance shape instead"
        )));
    }
    if shape.iter().any(|&d| d == 0) {
        return Err(precondition(format!("shape of {name} is {shape:?}")));
    }
    let method = init.init_method()?;
    let dim0 = shape.first().copied().unwrap_or(1);
    let mut scale = init.scale;

    if init.is_default() {
        log_at!(
            debug,
            "var {name} is using the default xavier initializer; make sure this is intended"
        );
    }
    if method == InitMethod::DeltaOrthogonal && shape.len() < 2 {
        log_at!(warn, "delta orthogonal applied to {}-D var {name}", shape.len());
    }

    let fans = || {
        fan_in_fan_out(
            shape,
            hparams.fan_in_axes.as_deref(),
            hparams.fan_out_axes.as_deref(),
        )
    };
    match method {
        InitMethod::GaussianSqrtDim
        | InitMethod::UniformSqrtDim
        | InitMethod::TruncatedGaussianSqrtDim => {
            if shape.len() > 2 {
                log_at!(
                    warn,
                    "initializing {name} of shape {shape:?} with method {method}: dim0={dim0}; \
                     make sure that it is intended"
                );
            }
            scale /= (dim0 as f64).sqrt();
        }
        InitMethod::GaussianSqrtFanIn | InitMethod::TruncatedGaussianSqrtFanIn => {
            scale /= (fans()?.0 as f64).sqrt();
        }
        InitMethod::GaussianSqrtFanOut | InitMethod::TruncatedGaussianSqrtFanOut => {
            scale /= (fans()?.1 as f64).sqrt();
        }
        InitMethod::GaussianSqrtFanAvg | InitMethod::UniformSqrtFanAvg => {
            let (fan_in, fan_out) = fans()?;
            scale *= (2.0 / (fan_in + fan_out) as f64).sqrt();
        }
        _ => {}
    }

    let n: usize = shape.iter().product();
    let mut rng = StdRng::seed_from_u64(seed);
    let scaled = |values: Vec<f64>, factor: f64| -> Vec<f64> {
        values.into_iter().map(|v| v * factor).collect()
    };
    let values: Vec<f64> = match method {
        InitMethod::DeltaOrthogonal => match shape.len() {
            0 | 1 => scaled(normal(&mut rng, n), scale),
            2 => scaled_orthogonal(&mut rng, shape[0], shape[1]),
            _ => scaled_delta_orthogonal(&mut rng, shape)?,
        },
        InitMethod::Gaussian
        | InitMethod::GaussianSqrtDim
        | InitMethod::GaussianSqrtFanIn
        | InitMethod::GaussianSqrtFanOut
        | InitMethod::GaussianSqrtFanAvg => scaled(normal(&mut rng, n), scale),
        InitMethod::Uniform | InitMethod::UniformSqrtDim => scaled(uniform(&mut rng, n), scale),
        InitMethod::UniformSqrtFanAvg => scaled(uniform(&mut rng, n), 3f64.sqrt() * scale),
        InitMethod::TruncatedGaussian
        | InitMethod::TruncatedGaussianSqrtDim
        | InitMethod::TruncatedGaussianSqrtFanIn
        | InitMethod::TruncatedGaussianSqrtFanOut => scaled(truncated_normal(&mut rng, n), scale),
        InitMethod::Constant => vec![scale; n],
        InitMethod::Xavier => {
            let (fan_in, fan_out) = fans()?;
            let limit = scale * (6.0 / (fan_in + fan_out) as f64).sqrt();
            scaled(uniform(&mut rng, n), limit)
        }
        InitMethod::UniformUnitScaling => {
            let input_size = match shape.split_last() {
                Some((_, leading)) => leading.iter().product::<usize>().max(1),
                None => 1,
            };
            let max_val = (3.0 / input_size as f64).sqrt() * scale;
            scaled(uniform(&mut rng, n), max_val)
        }
    };
    to_tensor(values, shape, dtype, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weights::WeightInit;

    fn values(t: &Tensor) -> Result<Vec<f64>> {
        Ok(t.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?)
    }

    fn hp(shape: &[usize], init: WeightInit) -> WeightHParams {
        WeightHParams::new(shape.to_vec()).with_init(init).with_dtype(DType::F32)
    }

    #[test]
    fn same_seed_same_values() -> Result<()> {
        let device = Device::Cpu;
        let spec = hp(&[4, 6], WeightInit::gaussian(0.5));
        let a = values(&init_var(&spec, 7, "w", &device)?)?;
        let b = values(&init_var(&spec, 7, "w", &device)?)?;
        let c = values(&init_var(&spec, 8, "w", &device)?)?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        Ok(())
    }

    #[test]
    fn constant_fills_scale() -> Result<()> {
        let t = init_var(&hp(&[3], WeightInit::constant(0.25)), 0, "b", &Device::Cpu)?;
        assert_eq!(values(&t)?, vec![0.25; 3]);
        Ok(())
    }

    #[test]
    fn xavier_respects_fan_limit() -> Result<()> {
        let t = init_var(&hp(&[8, 24], WeightInit::xavier(1.0)), 3, "w", &Device::Cpu)?;
        let limit = (6.0f64 / 32.0).sqrt();
        assert!(values(&t)?.iter().all(|v| v.abs() <= limit + 1e-6));
        Ok(())
    }

    #[test]
    fn truncated_stays_within_two_sigma() -> Result<()> {
        let t = init_var(
            &hp(&[64, 64], WeightInit::truncated_gaussian(1.0)),
            11,
            "w",
            &Device::Cpu,
        )?;
        assert!(values(&t)?.iter().all(|v| v.abs() <= 2.0 + 1e-6));
        Ok(())
    }

    #[test]
    fn orthogonal_matrix_has_orthonormal_columns() -> Result<()> {
        let t = init_var(&hp(&[5, 5], WeightInit::delta_orthogonal(1.0)), 2, "w", &Device::Cpu)?;
        let product = t.t()?.matmul(&t)?;
        let eye = Tensor::eye(5, DType::F32, &Device::Cpu)?;
        let err = (product - eye)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()?;
        assert!(err < 1e-4, "max deviation {err}");
        Ok(())
    }

    #[test]
    fn delta_orthogonal_is_zero_off_centre() -> Result<()> {
        let t = init_var(
            &hp(&[3, 2, 2], WeightInit::delta_orthogonal(1.0)),
            5,
            "conv",
            &Device::Cpu,
        )?;
        let v = values(&t)?;
        assert!(v[..4].iter().chain(&v[8..]).all(|x| *x == 0.0));
        assert!(v[4..8].iter().any(|x| *x != 0.0));

        let too_deep = hp(&[2, 2, 2, 2, 2, 2], WeightInit::delta_orthogonal(1.0));
        assert!(matches!(
            init_var(&too_deep, 5, "w", &Device::Cpu),
            Err(LayerError::UnsupportedRank { rank: 6, .. })
        ));
        Ok(())
    }

    #[test]
    fn rejects_unknown_methods_and_repeat_prefixes() {
        let unknown = hp(&[2], WeightInit { method: "kaiming".into(), scale: 1.0 });
        assert!(matches!(
            init_var(&unknown, 0, "w", &Device::Cpu),
            Err(LayerError::UnsupportedInit(_))
        ));

        let mut repeated = hp(&[2], WeightInit::gaussian(1.0));
        repeated.repeat_prefix = Some(vec![3]);
        assert!(init_var(&repeated, 0, "w", &Device::Cpu).is_err());
    }

    #[test]
    fn fold_in_separates_labels() {
        assert_ne!(fold_in(1, "a"), fold_in(1, "b"));
        assert_eq!(fold_in(1, "a"), fold_in(1, "a"));
    }

    #[test]
    fn scalar_variables_are_supported() -> Result<()> {
        let t = init_var(&hp(&[], WeightInit::constant(2.0)), 0, "s", &Device::Cpu)?;
        assert_eq!(t.rank(), 0);
        assert_eq!(t.to_scalar::<f32>()?, 2.0);
        Ok(())
    }
}
