/// Hyper-parameters of the SGD update emitted by differentiation.
///
/// The update for every trainable weight is
/// `velocity = momentum * velocity - learning_rate * (gradient + l2_decay * weight)`
/// followed by `weight = weight + velocity`.
///
/// The values are baked into the training graph when it is differentiated, so
/// changing them only affects the next `compile(Train, ..)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingConfig {
    pub learning_rate: f32,
    pub momentum: f32,
    pub l2_decay: f32,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.01,
            momentum: 0.0,
            l2_decay: 0.0,
        }
    }
}

impl TrainingConfig {
    pub fn new(learning_rate: f32, momentum: f32, l2_decay: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            l2_decay,
        }
    }

    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_l2_decay(mut self, l2_decay: f32) -> Self {
        self.l2_decay = l2_decay;
        self
    }
}
