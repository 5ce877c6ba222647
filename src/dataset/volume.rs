use burn::{data::dataloader::batcher::Batcher, prelude::*};

/// One training sample: a multi-channel volume and its label map.
///
/// `volume` is laid out `[channels, depth, height, width]` and `labels`
/// `[depth, height, width]`, both row-major.
#[derive(Clone, Debug)]
pub struct VolumeItem {
    pub volume: Vec<f32>,
    pub labels: Vec<i64>,
    pub channels: usize,
    pub shape: [usize; 3],
}

impl VolumeItem {
    pub fn new(volume: Vec<f32>, labels: Vec<i64>, channels: usize, shape: [usize; 3]) -> Self {
        let voxels: usize = shape.iter().product();
        assert_eq!(
            volume.len(),
            channels * voxels,
            "Volume has {} values, expected {} channels x {:?}",
            volume.len(),
            channels,
            shape
        );
        assert_eq!(
            labels.len(),
            voxels,
            "Label map has {} values, expected {:?}",
            labels.len(),
            shape
        );

        Self {
            volume,
            labels,
            channels,
            shape,
        }
    }
}

#[derive(Clone, Debug)]
pub struct VolumeBatch<B: Backend> {
    /// `[batch, channels, depth, height, width]`
    pub volumes: Tensor<B, 5>,
    /// `[batch, depth, height, width]`
    pub labels: Tensor<B, 4, Int>,
}

#[derive(Clone)]
pub struct VolumeBatcher<B: Backend> {
    device: B::Device,
    n_classes: usize,
}

impl<B: Backend> VolumeBatcher<B> {
    pub fn new(device: B::Device, n_classes: usize) -> Self {
        Self { device, n_classes }
    }
}

impl<B: Backend> Batcher<VolumeItem, VolumeBatch<B>> for VolumeBatcher<B> {
    fn batch(&self, items: Vec<VolumeItem>) -> VolumeBatch<B> {
        assert!(!items.is_empty(), "Cannot batch zero volumes");

        let channels = items[0].channels;
        let shape = items[0].shape;
        let [depth, height, width] = shape;

        let mut volumes = Vec::with_capacity(items.len());
        let mut labels = Vec::with_capacity(items.len());

        for item in items {
            assert!(
                item.channels == channels && item.shape == shape,
                "Volumes in a batch must share a shape: {} x {:?} vs {} x {:?}",
                channels,
                shape,
                item.channels,
                item.shape
            );
            assert!(
                item.labels
                    .iter()
                    .all(|&label| label >= 0 && (label as usize) < self.n_classes),
                "Labels must lie in [0, {})",
                self.n_classes
            );

            volumes.push(Tensor::<B, 4>::from_data(
                TensorData::new(item.volume, Shape::new([channels, depth, height, width]))
                    .convert::<B::FloatElem>(),
                &self.device,
            ));
            labels.push(Tensor::<B, 3, Int>::from_data(
                TensorData::new(item.labels, Shape::new(shape)).convert::<B::IntElem>(),
                &self.device,
            ));
        }

        VolumeBatch {
            volumes: Tensor::stack::<5>(volumes, 0),
            labels: Tensor::stack::<4>(labels, 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    fn item(offset: f32) -> VolumeItem {
        VolumeItem::new(
            (0..16).map(|v| v as f32 + offset).collect(),
            vec![0, 1, 1, 0, 1, 0, 0, 1],
            2,
            [2, 2, 2],
        )
    }

    #[test]
    fn test_batch_shapes() {
        let batcher = VolumeBatcher::<B>::new(Default::default(), 2);
        let batch = batcher.batch(vec![item(0.0), item(100.0), item(200.0)]);

        assert_eq!(batch.volumes.dims(), [3, 2, 2, 2, 2]);
        assert_eq!(batch.labels.dims(), [3, 2, 2, 2]);

        let values = batch.volumes.into_data().to_vec::<f32>().unwrap();
        assert_eq!(values[0], 0.0);
        assert_eq!(values[16], 100.0);
        assert_eq!(values[47], 215.0);
    }

    #[test]
    #[should_panic(expected = "Labels must lie in [0, 1)")]
    fn test_batch_label_range() {
        let batcher = VolumeBatcher::<B>::new(Default::default(), 1);
        batcher.batch(vec![item(0.0)]);
    }

    #[test]
    #[should_panic(expected = "Label map has 3 values")]
    fn test_item_shape() {
        VolumeItem::new(vec![0.0; 8], vec![0, 0, 0], 1, [2, 2, 2]);
    }
}
