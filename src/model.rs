use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv1d, Conv1dConfig},
        PaddingConfig1d, Relu,
    },
    tensor::{backend::Backend, Tensor},
};

/// Layout of the pretrained multiscale behavior encoder.
#[derive(Config, Debug)]
pub struct MultiscaleEncoderConfig {
    /// Per-frame input features (keypoints * coords + angle bins).
    pub input_dim: usize,
    pub short_term_dim: usize,
    pub long_term_dim: usize,
    #[config(default = 3)]
    pub kernel_size: usize,
    /// Dilation of the long-term branch; widens its temporal receptive field.
    #[config(default = 8)]
    pub long_term_dilation: usize,
}

/// Two temporal convolution branches over the frame axis: a narrow short-term
/// branch and a dilated long-term branch. Frame count is preserved.
#[derive(Module, Debug)]
pub struct MultiscaleEncoder<B: Backend> {
    short_term: Conv1d<B>,
    long_term: Conv1d<B>,
    activation: Relu,
}

impl MultiscaleEncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MultiscaleEncoder<B> {
        let short_term = Conv1dConfig::new(self.input_dim, self.short_term_dim, self.kernel_size)
            .with_padding(PaddingConfig1d::Explicit(same_padding(self.kernel_size, 1)))
            .init(device);

        let long_term = Conv1dConfig::new(self.input_dim, self.long_term_dim, self.kernel_size)
            .with_dilation(self.long_term_dilation)
            .with_padding(PaddingConfig1d::Explicit(same_padding(
                self.kernel_size,
                self.long_term_dilation,
            )))
            .init(device);

        MultiscaleEncoder {
            short_term,
            long_term,
            activation: Relu::new(),
        }
    }
}

/// Padding that keeps the frame count for an odd kernel.
fn same_padding(kernel_size: usize, dilation: usize) -> usize {
    dilation * (kernel_size.saturating_sub(1)) / 2
}

impl<B: Backend> MultiscaleEncoder<B> {
    /// Input: `[samples, frames, input_dim]`.
    /// Output: `([samples, frames, short_term_dim], [samples, frames, long_term_dim])`.
    pub fn forward(&self, x: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 3>) {
        // Conv1d wants channels before time.
        let x = x.swap_dims(1, 2);

        let short = self.activation.forward(self.short_term.forward(x.clone()));
        let long = self.activation.forward(self.long_term.forward(x));

        (short.swap_dims(1, 2), long.swap_dims(1, 2))
    }
}
