use std::path::Path;

use error_stack::{Report, ResultExt};
use gdal::Dataset;
use log::debug;

use crate::crs::SpatialReference;
use crate::error::{BasinError, Result};
use crate::rasterize::PixelWindow;

/// North-up affine transform: `x = origin_x + col * pixel_width`,
/// `y = origin_y + row * pixel_height` with `pixel_height < 0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoTransform {
    pub origin_x: f64,
    pub pixel_width: f64,
    pub origin_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    pub fn new(origin_x: f64, pixel_width: f64, origin_y: f64, pixel_height: f64) -> Result<Self> {
        if !(pixel_width > 0.0) || !(pixel_height < 0.0) {
            return Err(Report::new(BasinError::ResourceOpen).attach_printable(format!(
                "geotransform must be north-up (pixel width {}, pixel height {})",
                pixel_width, pixel_height
            )));
        }
        Ok(GeoTransform { origin_x, pixel_width, origin_y, pixel_height })
    }

    /// Accepts a gdal-ordered coefficient array; rotation terms must be zero.
    pub fn from_gdal(gt: &[f64; 6]) -> Result<Self> {
        if gt[2] != 0.0 || gt[4] != 0.0 {
            return Err(Report::new(BasinError::ResourceOpen)
                .attach_printable(format!("rotated geotransforms are not supported: {:?}", gt)));
        }
        GeoTransform::new(gt[0], gt[1], gt[3], gt[5])
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [self.origin_x, self.pixel_width, 0.0, self.origin_y, 0.0, self.pixel_height]
    }

    /// Transform of the sub-grid whose upper-left pixel is (`x_offset`, `y_offset`).
    pub fn shifted(&self, x_offset: isize, y_offset: isize) -> GeoTransform {
        GeoTransform {
            origin_x: self.origin_x + x_offset as f64 * self.pixel_width,
            pixel_width: self.pixel_width,
            origin_y: self.origin_y + y_offset as f64 * self.pixel_height,
            pixel_height: self.pixel_height,
        }
    }
}

/// Read access to a single-band raster grid.
///
/// Implemented by the file-backed [`RasterDataset`] and by the in-memory
/// [`Raster`]; the zonal, binning and karst operations only see this trait.
pub trait GridSource {
    /// Identifier reported in zonal results (usually the file path).
    fn name(&self) -> &str;
    fn geo_transform(&self) -> GeoTransform;
    fn crs(&self) -> &SpatialReference;
    fn no_data(&self) -> Option<f64>;
    /// (width, height) in pixels.
    fn size(&self) -> (usize, usize);
    /// Reads a block that lies fully inside the grid, row-major.
    fn read_block(&self, x_offset: usize, y_offset: usize, width: usize, height: usize) -> Result<Vec<f64>>;

    /// Reads an arbitrary window. Pixels outside the grid come back as NaN.
    fn read_window(&self, window: &PixelWindow) -> Result<Vec<f64>> {
        let (cols, rows) = self.size();
        let mut values = vec![f64::NAN; window.width * window.height];

        let x0 = window.x_offset.max(0);
        let y0 = window.y_offset.max(0);
        let x1 = (window.x_offset + window.width as isize).min(cols as isize);
        let y1 = (window.y_offset + window.height as isize).min(rows as isize);
        if x0 >= x1 || y0 >= y1 {
            debug!("window {:?} lies outside {} ({}x{})", window, self.name(), cols, rows);
            return Ok(values);
        }

        let block_width = (x1 - x0) as usize;
        let block_height = (y1 - y0) as usize;
        let block = self.read_block(x0 as usize, y0 as usize, block_width, block_height)?;

        let col_shift = (x0 - window.x_offset) as usize;
        let row_shift = (y0 - window.y_offset) as usize;
        for row in 0..block_height {
            let src = &block[row * block_width..(row + 1) * block_width];
            let start = (row + row_shift) * window.width + col_shift;
            values[start..start + block_width].copy_from_slice(src);
        }

        Ok(values)
    }
}

/// In-memory raster grid.
#[derive(Debug, Clone)]
pub struct Raster {
    pub name: String,
    pub data: Vec<f64>,
    pub width: usize,
    pub height: usize,
    pub geo_transform: GeoTransform,
    pub crs: SpatialReference,
    pub no_data: Option<f64>,
}

impl Raster {
    pub fn new(
        name: &str,
        data: Vec<f64>,
        width: usize,
        height: usize,
        geo_transform: GeoTransform,
        crs: SpatialReference,
        no_data: Option<f64>,
    ) -> Result<Self> {
        if data.len() != width * height {
            return Err(Report::new(BasinError::ResourceOpen).attach_printable(format!(
                "raster {} has {} samples, expected {}x{}",
                name,
                data.len(),
                width,
                height
            )));
        }
        Ok(Raster {
            name: name.to_string(),
            data,
            width,
            height,
            geo_transform,
            crs,
            no_data,
        })
    }

    pub fn xy_to_index(&self, x: usize, y: usize) -> usize {
        y * self.width + x
    }
}

impl GridSource for Raster {
    fn name(&self) -> &str {
        &self.name
    }

    fn geo_transform(&self) -> GeoTransform {
        self.geo_transform
    }

    fn crs(&self) -> &SpatialReference {
        &self.crs
    }

    fn no_data(&self) -> Option<f64> {
        self.no_data
    }

    fn size(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn read_block(&self, x_offset: usize, y_offset: usize, width: usize, height: usize) -> Result<Vec<f64>> {
        if x_offset + width > self.width || y_offset + height > self.height {
            return Err(Report::new(BasinError::ResourceOpen)
                .attach_printable(format!("block out of bounds in raster {}", self.name)));
        }
        let mut block = Vec::with_capacity(width * height);
        for y in y_offset..y_offset + height {
            let start = self.xy_to_index(x_offset, y);
            block.extend_from_slice(&self.data[start..start + width]);
        }
        Ok(block)
    }
}

/// Band 1 of a gdal-readable raster file.
///
/// The dataset handle is closed when the value is dropped.
pub struct RasterDataset {
    name: String,
    dataset: Dataset,
    geo_transform: GeoTransform,
    crs: SpatialReference,
    no_data: Option<f64>,
    size: (usize, usize),
}

impl RasterDataset {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let dataset = Dataset::open(path)
            .change_context(BasinError::ResourceOpen)
            .attach_printable_lazy(|| format!("raster {}", path.display()))?;

        let gt = dataset
            .geo_transform()
            .change_context(BasinError::ResourceOpen)
            .attach_printable_lazy(|| format!("raster {} has no geotransform", path.display()))?;
        let geo_transform = GeoTransform::from_gdal(&gt)?;

        let crs = SpatialReference::from_wkt(&dataset.projection())
            .attach_printable_lazy(|| format!("raster {}", path.display()))?;

        let no_data = dataset
            .rasterband(1)
            .change_context(BasinError::ResourceOpen)
            .attach_printable_lazy(|| format!("raster {} has no band 1", path.display()))?
            .no_data_value();

        let size = dataset.raster_size();
        debug!("opened raster {} ({}x{}, nodata {:?})", path.display(), size.0, size.1, no_data);

        Ok(RasterDataset {
            name: path.display().to_string(),
            dataset,
            geo_transform,
            crs,
            no_data,
            size,
        })
    }
}

impl GridSource for RasterDataset {
    fn name(&self) -> &str {
        &self.name
    }

    fn geo_transform(&self) -> GeoTransform {
        self.geo_transform
    }

    fn crs(&self) -> &SpatialReference {
        &self.crs
    }

    fn no_data(&self) -> Option<f64> {
        self.no_data
    }

    fn size(&self) -> (usize, usize) {
        self.size
    }

    fn read_block(&self, x_offset: usize, y_offset: usize, width: usize, height: usize) -> Result<Vec<f64>> {
        let band = self
            .dataset
            .rasterband(1)
            .change_context(BasinError::ResourceOpen)
            .attach_printable_lazy(|| format!("raster {}", self.name))?;
        let buffer = band
            .read_as::<f64>(
                (x_offset as isize, y_offset as isize),
                (width, height),
                (width, height),
                None,
            )
            .change_context(BasinError::ResourceOpen)
            .attach_printable_lazy(|| {
                format!("reading {}x{} at ({}, {}) from {}", width, height, x_offset, y_offset, self.name)
            })?;
        Ok(buffer.data)
    }
}
