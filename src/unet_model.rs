use burn::nn::conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, Dropout, DropoutConfig, PaddingConfig2d, Relu};
use burn::prelude::*;

/// Configuration to create a [U-Net](UNet) using the [init function](UNetConfig::init).
#[derive(Config, Debug)]
pub struct UNetConfig {
    /// The number of input channels.
    #[config(default = 3)]
    pub in_channels: usize,
    /// The number of output channels.
    #[config(default = 1)]
    pub out_channels: usize,
    /// The number of filters of the first encoder block; doubled at each level.
    #[config(default = 32)]
    pub filters: usize,
    /// The number of encoder/decoder levels.
    #[config(default = 4)]
    pub num_layers: usize,
    /// The dropout rate applied inside each convolution block.
    #[config(default = 0.3)]
    pub dropout: f64,
}

/// Two padded 3x3 convolutions, each followed by batch normalization and a
/// relu activation, with dropout in between.
#[derive(Module, Debug)]
pub struct DoubleConv<B: Backend> {
    conv1: Conv2d<B>,
    norm1: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    norm2: BatchNorm<B, 2>,
    dropout: Dropout,
    activation: Relu,
}

impl<B: Backend> DoubleConv<B> {
    fn new(channels_in: usize, channels_out: usize, dropout: f64, device: &B::Device) -> Self {
        let conv = |channels_in| {
            Conv2dConfig::new([channels_in, channels_out], [3, 3])
                .with_padding(PaddingConfig2d::Same)
                .init(device)
        };

        Self {
            conv1: conv(channels_in),
            norm1: BatchNormConfig::new(channels_out).init(device),
            conv2: conv(channels_out),
            norm2: BatchNormConfig::new(channels_out).init(device),
            dropout: DropoutConfig::new(dropout).init(),
            activation: Relu::new(),
        }
    }

    /// Applies the forward pass on the input tensor.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(input);
        let x = self.norm1.forward(x);
        let x = self.activation.forward(x);
        let x = self.dropout.forward(x);
        let x = self.conv2.forward(x);
        let x = self.norm2.forward(x);

        self.activation.forward(x)
    }
}

/// U-Net segmentation model.
///
/// An encoder of [DoubleConv] blocks with 2x2 max-pooling between levels, a
/// bottleneck block, and a decoder of stride-2 transposed convolutions with
/// skip concatenation, closed by a 1x1 convolution producing mask logits.
///
/// Should be created with [UNetConfig].
#[derive(Module, Debug)]
pub struct UNet<B: Backend> {
    encoder: Vec<DoubleConv<B>>,
    pool: MaxPool2d,
    bottleneck: DoubleConv<B>,
    upsamplers: Vec<ConvTranspose2d<B>>,
    decoder: Vec<DoubleConv<B>>,
    head: Conv2d<B>,
}

impl UNetConfig {
    /// Initialize a new [U-Net](UNet) module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> UNet<B> {
        let mut encoder = Vec::with_capacity(self.num_layers);
        let mut channels = self.in_channels;
        let mut filters = self.filters;

        for _ in 0..self.num_layers {
            encoder.push(DoubleConv::new(channels, filters, self.dropout, device));
            channels = filters;
            filters *= 2;
        }

        let bottleneck = DoubleConv::new(channels, filters, self.dropout, device);

        let mut upsamplers = Vec::with_capacity(self.num_layers);
        let mut decoder = Vec::with_capacity(self.num_layers);
        let mut channels = filters;

        for _ in 0..self.num_layers {
            let skip = channels / 2;
            upsamplers.push(
                ConvTranspose2dConfig::new([channels, skip], [2, 2])
                    .with_stride([2, 2])
                    .init(device),
            );
            // The upsampled features are concatenated with the skip connection.
            decoder.push(DoubleConv::new(skip * 2, skip, self.dropout, device));
            channels = skip;
        }

        UNet {
            encoder,
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            bottleneck,
            upsamplers,
            decoder,
            head: Conv2dConfig::new([channels, self.out_channels], [1, 1]).init(device),
        }
    }
}

impl<B: Backend> UNet<B> {
    /// Applies the forward pass on the input tensor.
    ///
    /// # Shapes
    ///
    /// - input: `[batch_size, in_channels, height, width]`
    /// - output: `[batch_size, out_channels, height, width]`
    ///
    /// Height and width must be divisible by `2^num_layers`.
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut skips = Vec::with_capacity(self.encoder.len());
        let mut x = input;

        for block in self.encoder.iter() {
            let features = block.forward(x);
            x = self.pool.forward(features.clone());
            skips.push(features);
        }

        x = self.bottleneck.forward(x);

        for ((upsampler, block), skip) in self
            .upsamplers
            .iter()
            .zip(self.decoder.iter())
            .zip(skips.into_iter().rev())
        {
            let upsampled = upsampler.forward(x);
            x = block.forward(Tensor::cat(vec![skip, upsampled], 1));
        }

        self.head.forward(x)
    }
}
