//! Loss terms and the per-iteration loss log.

use candle_core::Tensor;

use crate::{Error, Result};

/// `mean((target - x)^2)`: least-squares GAN objective against a constant.
pub fn least_squares(x: &Tensor, target: f64) -> Result<Tensor> {
    Ok(x.affine(-1.0, target)?.sqr()?.mean_all()?)
}

/// Mean absolute error.
pub fn l1(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    if a.dims() != b.dims() {
        return Err(Error::dims("l1 operands", a.dims(), b.dims()));
    }
    Ok((a - b)?.abs()?.mean_all()?)
}

/// Cross-entropy of `logits` `[B, N]` against `u32` labels `[B]`.
pub fn classification(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    Ok(candle_nn::loss::cross_entropy(logits, labels)?)
}

/// Read a scalar loss, failing on NaN or infinity.
pub fn scalar(name: &'static str, loss: &Tensor, iteration: usize) -> Result<f32> {
    let value = loss.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?;
    if !value.is_finite() {
        return Err(Error::NonFinite {
            name,
            value,
            iteration,
        });
    }
    Ok(value)
}

/// Named loss values of one iteration, in the order they were computed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationLosses {
    /// Zero-based iteration index.
    pub iteration: usize,
    /// Identity-loss weight applied, when the generator was updated.
    pub id_weight: Option<f64>,
    entries: Vec<(&'static str, f32)>,
}

impl IterationLosses {
    pub fn new(iteration: usize) -> Self {
        Self {
            iteration,
            id_weight: None,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, name: &'static str, value: f32) {
        self.entries.push((name, value));
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.entries.iter().find(|(n, _)| *n == name).map(|(_, v)| *v)
    }

    pub fn entries(&self) -> &[(&'static str, f32)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `"D/loss_real: 0.2500, D/loss_fake: 0.2500, ..."`
    pub fn format_line(&self) -> String {
        self.entries
            .iter()
            .map(|(name, value)| format!("{name}: {value:.4}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn t(v: &[f32]) -> Tensor {
        Tensor::new(v, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_least_squares() {
        let x = t(&[0.0, 0.5, 1.0]);
        let real = least_squares(&x, 1.0).unwrap().to_scalar::<f32>().unwrap();
        // (1 + 0.25 + 0) / 3
        assert!((real - 1.25 / 3.0).abs() < 1e-6);
        let fake = least_squares(&x, 0.0).unwrap().to_scalar::<f32>().unwrap();
        assert!((fake - 1.25 / 3.0).abs() < 1e-6);
        let half = least_squares(&t(&[0.5; 4]), 1.0).unwrap().to_scalar::<f32>().unwrap();
        assert!((half - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_l1() {
        let v = l1(&t(&[1.0, -1.0, 2.0]), &t(&[0.0, 1.0, 2.0]))
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((v - 1.0).abs() < 1e-6);
        assert!(l1(&t(&[1.0]), &t(&[1.0, 2.0])).is_err());
    }

    #[test]
    fn test_classification_prefers_correct_label() {
        let logits = Tensor::new(&[[4f32, 0.0, 0.0]], &Device::Cpu).unwrap();
        let right = classification(&logits, &Tensor::new(&[0u32], &Device::Cpu).unwrap())
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let wrong = classification(&logits, &Tensor::new(&[2u32], &Device::Cpu).unwrap())
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(right < wrong);
    }

    #[test]
    fn test_scalar_rejects_non_finite() {
        let nan = Tensor::new(f32::NAN, &Device::Cpu).unwrap();
        match scalar("G/loss_rec", &nan, 3) {
            Err(Error::NonFinite { name, iteration, .. }) => {
                assert_eq!(name, "G/loss_rec");
                assert_eq!(iteration, 3);
            }
            other => panic!("expected NonFinite, got {other:?}"),
        }
        let inf = Tensor::new(f32::INFINITY, &Device::Cpu).unwrap();
        assert!(scalar("D/loss", &inf, 0).is_err());
    }

    #[test]
    fn test_format_line_keeps_order() {
        let mut log = IterationLosses::new(9);
        log.push("D/loss_real", 0.25);
        log.push("D/loss_fake", 0.125);
        assert_eq!(log.format_line(), "D/loss_real: 0.2500, D/loss_fake: 0.1250");
        assert_eq!(log.get("D/loss_fake"), Some(0.125));
        assert_eq!(log.get("G/loss_id"), None);
    }
}
