//! Image type: tensor data, voxel geometry and a name.

use burn::tensor::backend::Backend;
use burn::tensor::{ElementConversion, Shape, Tensor, TensorData};

use super::grid::Grid;
use super::header::Header;
use crate::error::{CoreError, Result};

/// A named 3D volume or 4D series with physical geometry.
///
/// Data is stored `[Z, Y, X]` for volumes and `[T, Z, Y, X]` for series.
/// The header describes the three spatial axes only; the time axis carries
/// no geometry. Images are values: every operation returns a new image.
///
/// # Type Parameters
/// * `B` - The backend for tensor operations
/// * `D` - Tensor rank, 3 or 4
#[derive(Debug, Clone)]
pub struct Image<B: Backend, const D: usize> {
    name: String,
    data: Tensor<B, D>,
    header: Header,
}

/// A single 3D volume.
pub type Volume<B> = Image<B, 3>;

/// A 4D series of volumes (time first).
pub type Series<B> = Image<B, 4>;

impl<B: Backend, const D: usize> Image<B, D> {
    /// Create a new image. Only ranks 3 and 4 are supported.
    pub fn new(name: impl Into<String>, data: Tensor<B, D>, header: Header) -> Result<Self> {
        if D != 3 && D != 4 {
            return Err(CoreError::invalid_image(format!(
                "images must be 3D or 4D, got rank {D}"
            )));
        }
        if data.dims().iter().any(|d| *d == 0) {
            return Err(CoreError::invalid_image("image has an empty axis"));
        }
        Ok(Self {
            name: name.into(),
            data,
            header,
        })
    }

    /// Build an image from flat `f32` values in `[.., Z, Y, X]` order.
    pub fn from_vec(
        name: impl Into<String>,
        values: Vec<f32>,
        shape: [usize; D],
        header: Header,
        device: &B::Device,
    ) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(CoreError::shape_mismatch(&[expected], &[values.len()]));
        }
        let data = Tensor::<B, D>::from_data(TensorData::new(values, Shape::new(shape)), device);
        Self::new(name, data, header)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &Tensor<B, D> {
        &self.data
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn into_data(self) -> Tensor<B, D> {
        self.data
    }

    pub fn device(&self) -> B::Device {
        self.data.device()
    }

    /// Full tensor shape.
    pub fn shape(&self) -> [usize; D] {
        self.data.dims()
    }

    /// Shape of the trailing three spatial axes, `[Z, Y, X]`.
    pub fn spatial_shape(&self) -> [usize; 3] {
        let dims = self.data.dims();
        [dims[D - 3], dims[D - 2], dims[D - 1]]
    }

    /// Number of volumes: 1 for a 3D image, `T` for a series.
    pub fn num_volumes(&self) -> usize {
        if D == 4 {
            self.data.dims()[0]
        } else {
            1
        }
    }

    /// Geometry of the spatial axes.
    pub fn grid(&self) -> Grid {
        Grid::new(self.header.clone(), self.spatial_shape())
    }

    /// Same image under a new name.
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: self.data.clone(),
            header: self.header.clone(),
        }
    }

    /// New image sharing this image's name and geometry but holding `data`.
    pub fn with_data(&self, data: Tensor<B, D>) -> Result<Self> {
        let expected = self.spatial_shape();
        let dims = data.dims();
        let actual = [dims[D - 3], dims[D - 2], dims[D - 1]];
        if expected != actual {
            return Err(CoreError::shape_mismatch(&expected, &actual));
        }
        Ok(Self {
            name: self.name.clone(),
            data,
            header: self.header.clone(),
        })
    }

    /// Image values copied to the host as `f32`.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        self.data
            .to_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| CoreError::invalid_image(format!("cannot read tensor data: {e:?}")))
    }

    /// Mean over all elements.
    pub fn mean_value(&self) -> f64 {
        self.data.clone().mean().into_scalar().elem::<f64>()
    }

    /// Multiply by a scalar.
    pub fn mul_scalar(&self, factor: f64) -> Self {
        Self {
            name: self.name.clone(),
            data: self.data.clone().mul_scalar(factor),
            header: self.header.clone(),
        }
    }

    /// Multiply voxelwise by a 3D field, broadcasting over time for series.
    pub fn mul_field(&self, field: &Volume<B>) -> Result<Self> {
        let field = self.broadcast_field(field)?;
        self.with_data(self.data.clone().mul(field))
    }

    /// Divide voxelwise by a 3D field, broadcasting over time for series.
    pub fn div_field(&self, field: &Volume<B>) -> Result<Self> {
        let field = self.broadcast_field(field)?;
        self.with_data(self.data.clone().div(field))
    }

    fn broadcast_field(&self, field: &Volume<B>) -> Result<Tensor<B, D>> {
        let expected = self.spatial_shape();
        let actual = field.spatial_shape();
        if expected != actual {
            return Err(CoreError::shape_mismatch(&expected, &actual));
        }
        let mut dims = [1usize; D];
        dims[D - 3..].copy_from_slice(&actual);
        Ok(field.data.clone().reshape(Shape::new(dims)))
    }
}

impl<B: Backend> Image<B, 3> {
    /// Elementwise ratio `self / other` of two volumes on the same grid.
    pub fn ratio(&self, other: &Volume<B>) -> Result<Self> {
        self.div_field(other)
    }

    /// Elementwise reciprocal.
    pub fn recip(&self) -> Self {
        Self {
            name: self.name.clone(),
            data: self.data.clone().recip(),
            header: self.header.clone(),
        }
    }

    /// Mean of the voxels where `mask > 0.5`. `None` when the mask is empty.
    pub fn masked_mean(&self, mask: &Volume<B>) -> Result<Option<f64>> {
        let expected = self.spatial_shape();
        let actual = mask.spatial_shape();
        if expected != actual {
            return Err(CoreError::shape_mismatch(&expected, &actual));
        }
        let weights = mask.data.clone().greater_elem(0.5).float();
        let count = weights.clone().sum().into_scalar().elem::<f64>();
        if count <= 0.0 {
            return Ok(None);
        }
        let total = (self.data.clone() * weights).sum().into_scalar().elem::<f64>();
        Ok(Some(total / count))
    }
}

impl<B: Backend> Image<B, 4> {
    /// Extract volume `t` of the series.
    pub fn volume(&self, t: usize) -> Result<Volume<B>> {
        let [n, z, y, x] = self.data.dims();
        if t >= n {
            return Err(CoreError::invalid_image(format!(
                "volume {t} out of range for series of {n}"
            )));
        }
        let data = self.data.clone().slice([t..t + 1, 0..z, 0..y, 0..x]).reshape([z, y, x]);
        Image::new(self.name.clone(), data, self.header.clone())
    }

    /// All volumes of the series in order.
    pub fn volumes(&self) -> Result<Vec<Volume<B>>> {
        (0..self.num_volumes()).map(|t| self.volume(t)).collect()
    }

    /// Stack volumes sharing one grid into a series.
    pub fn from_volumes(name: impl Into<String>, volumes: &[Volume<B>]) -> Result<Self> {
        let first = volumes
            .first()
            .ok_or_else(|| CoreError::invalid_image("cannot stack an empty list of volumes"))?;
        let shape = first.spatial_shape();
        let mut data = Vec::with_capacity(volumes.len());
        for volume in volumes {
            if volume.spatial_shape() != shape {
                return Err(CoreError::shape_mismatch(&shape, &volume.spatial_shape()));
            }
            data.push(volume.data.clone().unsqueeze_dim::<4>(0));
        }
        Image::new(name, Tensor::cat(data, 0), first.header.clone())
    }

    /// Mean over the time axis.
    pub fn mean_volume(&self) -> Result<Volume<B>> {
        let [_, z, y, x] = self.data.dims();
        let data = self.data.clone().mean_dim(0).reshape([z, y, x]);
        Image::new(self.name.clone(), data, self.header.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn volume(value: f32, shape: [usize; 3]) -> Volume<TestBackend> {
        let device = Default::default();
        Image::new("vol", Tensor::full(shape, value, &device), Header::default()).unwrap()
    }

    #[test]
    fn test_field_broadcasts_over_time() {
        let device = Default::default();
        let series: Series<TestBackend> =
            Image::new("asl", Tensor::ones([3, 2, 2, 2], &device), Header::default()).unwrap();
        let scaled = series.mul_field(&volume(2.0, [2, 2, 2])).unwrap();
        assert_eq!(scaled.shape(), [3, 2, 2, 2]);
        assert!(scaled.to_vec().unwrap().iter().all(|v| (*v - 2.0).abs() < 1e-6));
        assert_eq!(scaled.name(), "asl");
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let a = volume(1.0, [2, 2, 2]);
        let b = volume(1.0, [2, 2, 3]);
        assert!(matches!(a.div_field(&b), Err(CoreError::ShapeMismatch { .. })));
    }

    #[test]
    fn test_volume_stack_roundtrip() {
        let volumes = vec![volume(1.0, [2, 3, 4]), volume(2.0, [2, 3, 4])];
        let series = Series::from_volumes("pair", &volumes).unwrap();
        assert_eq!(series.shape(), [2, 2, 3, 4]);
        assert!((series.volume(1).unwrap().mean_value() - 2.0).abs() < 1e-6);
        assert!((series.mean_volume().unwrap().mean_value() - 1.5).abs() < 1e-6);
        assert!(series.volume(2).is_err());
    }

    #[test]
    fn test_masked_mean() {
        let device = Default::default();
        let image = Volume::<TestBackend>::from_vec(
            "calib",
            vec![1.0, 2.0, 3.0, 4.0],
            [1, 2, 2],
            Header::default(),
            &device,
        )
        .unwrap();
        let mask = Volume::<TestBackend>::from_vec(
            "mask",
            vec![1.0, 0.0, 1.0, 0.0],
            [1, 2, 2],
            Header::default(),
            &device,
        )
        .unwrap();
        assert_eq!(image.masked_mean(&mask).unwrap(), Some(2.0));
        assert_eq!(image.masked_mean(&volume(0.0, [1, 2, 2])).unwrap(), None);
    }

    #[test]
    fn test_rejects_unsupported_rank() {
        let device = Default::default();
        let data = Tensor::<TestBackend, 2>::zeros([2, 2], &device);
        assert!(Image::new("flat", data, Header::default()).is_err());
    }
}
