use crate::graph::SgdParams;
use ndarray::{ArrayD, Zip};

/// One SGD step with momentum and L2 weight decay.
///
/// The decay is folded into the gradient (`grad + l2_decay * weight`, proper L2
/// rather than decoupled decay), then
/// `velocity = momentum * velocity - learning_rate * effective_grad` and
/// `weight = weight + velocity`. Returns the new weight and velocity.
pub fn sgd(
    weight: &ArrayD<f32>,
    grad: &ArrayD<f32>,
    velocity: &ArrayD<f32>,
    params: &SgdParams,
) -> Result<(ArrayD<f32>, ArrayD<f32>), String> {
    if weight.shape() != grad.shape() || weight.shape() != velocity.shape() {
        return Err(format!(
            "weight {:?}, gradient {:?} and velocity {:?} differ in shape",
            weight.shape(),
            grad.shape(),
            velocity.shape()
        ));
    }

    let new_velocity = Zip::from(weight)
        .and(grad)
        .and(velocity)
        .map_collect(|&w, &g, &v| {
            let effective_grad = g + params.l2_decay * w;
            params.momentum * v - params.learning_rate * effective_grad
        });
    let new_weight = Zip::from(weight)
        .and(&new_velocity)
        .map_collect(|&w, &v| w + v);

    Ok((new_weight, new_velocity))
}
