use crate::error::{Error, Result};
use crate::tensor::{Tensor, Type};
use rand::Rng;
use rand_distr::{Distribution, Uniform};

/// Xavier uniform initialization.
/// Samples from U(-a, a) where a = sqrt(3 / fan_in), so the variance of every
/// output of a layer with `fan_in` inputs stays close to the input variance.
pub fn xavier_uniform<R: Rng>(fan_in: usize, rng: &mut R) -> Result<impl FnMut() -> f32 + '_> {
    let fan_in = fan_in.max(1);
    let a = (3.0 / fan_in as f32).sqrt();
    let uniform = Uniform::new(-a, a)
        .map_err(|e| Error::msg(format!("invalid xavier range for fan_in {fan_in}: {e}")))?;

    Ok(move || uniform.sample(&mut *rng))
}

// Helper to initialize a complete tensor
pub fn init_tensor_xavier_uniform<R: Rng>(ty: Type, fan_in: usize, rng: &mut R) -> Result<Tensor> {
    let total_size = ty.size();
    let mut initializer = xavier_uniform(fan_in, rng)?;
    let data = (0..total_size).map(|_| initializer()).collect();
    Tensor::from_vec(ty, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_xavier_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let tensor = init_tensor_xavier_uniform(Type::float(&[12, 4]), 12, &mut rng).unwrap();
        let bound = (3.0f32 / 12.0).sqrt();
        assert!(tensor.data().iter().all(|&x| x >= -bound && x < bound));
        // Not every value can be identical.
        let first = tensor.to_vec()[0];
        assert!(tensor.data().iter().any(|&x| x != first));
    }

    #[test]
    fn test_seeded_initialization_is_reproducible() {
        let a = init_tensor_xavier_uniform(Type::float(&[8]), 8, &mut StdRng::seed_from_u64(1))
            .unwrap();
        let b = init_tensor_xavier_uniform(Type::float(&[8]), 8, &mut StdRng::seed_from_u64(1))
            .unwrap();
        assert_eq!(a, b);
    }
}
