pub mod error;
pub mod config;
pub mod crs;
pub mod geometry;
pub mod raster;
pub mod rasterize;
pub mod zonal;
pub mod twi;
pub mod karst;
pub mod climate;
pub mod characteristics;
pub mod output;
pub mod utils;
