use crate::data::{Image, ZStack};
use crate::mosaic::TileStack;
use anyhow::{anyhow, Context};
use image::{GrayImage, ImageBuffer, Luma};
use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Loads a grey-scale image; intensities keep their 16-bit range.
pub fn load_image<P: AsRef<Path>>(path: P, pixel_size: f64) -> anyhow::Result<Image> {
    let path = path.as_ref();
    let img = image::open(path)
        .with_context(|| format!("failed to open image {}", path.display()))?
        .to_luma16();
    let (width, height) = img.dimensions();
    let data = Array2::from_shape_fn((height as usize, width as usize), |(r, c)| {
        img.get_pixel(c as u32, r as u32)[0] as f32
    });
    Ok(Image::new(data, pixel_size))
}

pub fn validate_image_size(img: &Image, min_size: usize) -> anyhow::Result<()> {
    if img.width() < min_size || img.height() < min_size {
        return Err(anyhow!(
            "Image too small: {}x{}, minimum: {}x{}",
            img.width(),
            img.height(),
            min_size,
            min_size
        ));
    }
    Ok(())
}

/// Writes an image as 8-bit PNG, stretching its range to 0..=255.
pub fn save_image<P: AsRef<Path>>(img: &Image, path: P) -> anyhow::Result<()> {
    let (min, max) = img
        .data
        .iter()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let range = if max > min { max - min } else { 1.0 };
    let out: GrayImage = ImageBuffer::from_fn(img.width() as u32, img.height() as u32, |x, y| {
        let v = img.data[[y as usize, x as usize]];
        Luma([(((v - min) / range) * 255.0).round().clamp(0.0, 255.0) as u8])
    });
    out.save(path.as_ref())
        .with_context(|| format!("failed to write {}", path.as_ref().display()))?;
    Ok(())
}

/// One tile entry of a montage manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileEntry {
    pub path: PathBuf,
    /// Stage offset in full-resolution pixels.
    pub x: i64,
    pub y: i64,
    #[serde(default)]
    pub z: f64,
}

/// Montage description: tiles plus their stage offsets, in TOML or JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileManifest {
    pub pixel_size: f64,
    pub tiles: Vec<TileEntry>,
}

impl TileManifest {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read manifest {}", path.as_ref().display()))?;
        if content.trim_start().starts_with('{') {
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(toml::from_str(&content)?)
        }
    }
}

/// Reads every tile of a manifest; tile paths are relative to the manifest.
pub fn load_tile_stack<P: AsRef<Path>>(manifest_path: P) -> anyhow::Result<TileStack> {
    let manifest_path = manifest_path.as_ref();
    let manifest = TileManifest::load_from_file(manifest_path)?;
    let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));

    let first = manifest
        .tiles
        .first()
        .ok_or_else(|| anyhow!("manifest {} lists no tiles", manifest_path.display()))?;
    let first = load_image(base.join(&first.path), manifest.pixel_size)?;
    let (rows, cols) = first.shape();

    let mut tiles = Array3::<f32>::zeros((manifest.tiles.len(), rows, cols));
    for (i, entry) in manifest.tiles.iter().enumerate() {
        let tile = load_image(base.join(&entry.path), manifest.pixel_size)?;
        if tile.shape() != (rows, cols) {
            return Err(anyhow!(
                "tile {} has shape {:?}, expected {:?}",
                entry.path.display(),
                tile.shape(),
                (rows, cols)
            ));
        }
        tiles.index_axis_mut(ndarray::Axis(0), i).assign(&tile.data);
    }

    let offsets = manifest.tiles.iter().map(|t| (t.x, t.y)).collect();
    let heights = manifest.tiles.iter().map(|t| t.z).collect();
    Ok(TileStack::new(tiles, offsets, heights, manifest.pixel_size)?)
}

/// Reads equally sized slice images, in order, into one z-stack.
pub fn load_z_stack<P: AsRef<Path>>(slices: &[P], pixel_size: f64, z_step: f64) -> anyhow::Result<ZStack> {
    let first = slices.first().ok_or_else(|| anyhow!("a z-stack needs at least one slice"))?;
    let first = load_image(first, pixel_size)?;
    let (rows, cols) = first.shape();

    let mut data = Array3::<f32>::zeros((slices.len(), rows, cols));
    for (z, path) in slices.iter().enumerate() {
        let slice = load_image(path, pixel_size)?;
        if slice.shape() != (rows, cols) {
            return Err(anyhow!(
                "slice {} has shape {:?}, expected {:?}",
                path.as_ref().display(),
                slice.shape(),
                (rows, cols)
            ));
        }
        data.index_axis_mut(ndarray::Axis(0), z).assign(&slice.data);
    }
    Ok(ZStack::new(data, pixel_size, z_step))
}
