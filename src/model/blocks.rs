use burn::{
    nn::{
        BatchNorm, BatchNormConfig, PaddingConfig3d, Relu,
        conv::{Conv3d, Conv3dConfig},
    },
    prelude::*,
};

/// Zero padding applied to the skip path of a [`ResBlock3d`] along the
/// channel axis, so that it matches the block's filter count.
#[derive(Config, Debug)]
pub struct ChannelPadding {
    pub before: usize,
    pub after: usize,
}

impl ChannelPadding {
    pub fn symmetric(amount: usize) -> Self {
        Self::new(amount, amount)
    }

    pub fn total(&self) -> usize {
        self.before + self.after
    }

    pub fn apply<B: Backend>(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        if self.total() == 0 {
            return x;
        }

        let [batch, channels, depth, height, width] = x.dims();
        let device = x.device();

        let mut parts = Vec::with_capacity(3);
        if self.before > 0 {
            parts.push(Tensor::zeros(
                [batch, self.before, depth, height, width],
                &device,
            ));
        }
        parts.push(x);
        if self.after > 0 {
            parts.push(Tensor::zeros([batch, self.after, depth, height, width], &device));
        }

        let padded = Tensor::cat(parts, 1);
        debug_assert_eq!(padded.dims()[1], channels + self.total());
        padded
    }
}

/// Pre-activation residual block:
///
/// ```text
/// +-input-+
/// |       |
/// |   batchnorm
/// |     relu
/// |    conv3d
/// |   batchnorm  (skipped with `one_batchnorm`)
/// |     relu
/// |    conv3d
/// |       |
/// pad     |
/// +-(sum)-+
///     |
///   output
/// ```
#[derive(Module, Debug)]
pub struct ResBlock3d<B: Backend> {
    layer_num: usize,
    in_channels: usize,
    norm1: BatchNorm<B, 3>,
    conv1: Conv3d<B>,
    norm2: Option<BatchNorm<B, 3>>,
    conv2: Conv3d<B>,
    activation: Relu,
    padding_before: usize,
    padding_after: usize,
}

impl<B: Backend> ResBlock3d<B> {
    pub fn forward(&self, input: Tensor<B, 5>) -> Tensor<B, 5> {
        let channels = input.dims()[1];
        assert_eq!(
            channels, self.in_channels,
            "Residual block {} expects {} input channels, got {}",
            self.layer_num, self.in_channels, channels
        );

        let x = self.norm1.forward(input.clone());
        let x = self.activation.forward(x);
        let x = self.conv1.forward(x);

        let x = match &self.norm2 {
            Some(norm) => norm.forward(x),
            None => x,
        };
        let x = self.activation.forward(x);
        let x = self.conv2.forward(x);

        let skip = ChannelPadding::new(self.padding_before, self.padding_after).apply(input);

        x + skip
    }

    pub fn layer_num(&self) -> usize {
        self.layer_num
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.in_channels + self.padding_before + self.padding_after
    }

    pub fn has_second_norm(&self) -> bool {
        self.norm2.is_some()
    }
}

#[derive(Config, Debug)]
pub struct ResBlock3dConfig {
    layer_num: usize,
    in_channels: usize,
    filters: usize,
    #[config(default = "3")]
    kernel_size: usize,
    #[config(default = "1")]
    dilation: usize,
    #[config(default = "None")]
    padding: Option<ChannelPadding>,
    /// Only normalize the block input. Saves the memory of the second
    /// batch-norm, which lets larger volumes fit.
    #[config(default = "false")]
    one_batchnorm: bool,
}

impl ResBlock3dConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResBlock3d<B> {
        self.assertions();

        let kernel = [self.kernel_size; 3];
        let dilation = [self.dilation; 3];
        let same = self.dilation * (self.kernel_size - 1) / 2;
        let padding = self
            .padding
            .clone()
            .unwrap_or(ChannelPadding::symmetric(0));

        ResBlock3d {
            layer_num: self.layer_num,
            in_channels: self.in_channels,
            norm1: BatchNormConfig::new(self.in_channels).init(device),
            conv1: Conv3dConfig::new([self.in_channels, self.filters], kernel)
                .with_dilation(dilation)
                .with_padding(PaddingConfig3d::Explicit(same, same, same))
                .init(device),
            norm2: (!self.one_batchnorm).then(|| BatchNormConfig::new(self.filters).init(device)),
            conv2: Conv3dConfig::new([self.filters, self.filters], kernel)
                .with_dilation(dilation)
                .with_padding(PaddingConfig3d::Explicit(same, same, same))
                .init(device),
            activation: Relu::new(),
            padding_before: padding.before,
            padding_after: padding.after,
        }
    }

    fn assertions(&self) {
        assert!(
            self.kernel_size % 2 == 1,
            "Kernel size must be odd to preserve the spatial shape. Got {}",
            self.kernel_size
        );

        assert!(
            self.dilation >= 1,
            "Dilation must be at least 1. Got {}",
            self.dilation
        );

        let padding = self.padding.as_ref().map_or(0, ChannelPadding::total);
        assert_eq!(
            self.in_channels + padding,
            self.filters,
            "Residual block {}: skip path has {} channels ({} + {} padding) but the block produces {}",
            self.layer_num,
            self.in_channels + padding,
            self.in_channels,
            padding,
            self.filters
        );
    }
}
