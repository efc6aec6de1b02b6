//! Persistence of generated samples and raw tensors.

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{DType, Tensor};
use image::{Rgb, RgbImage};

/// Rows and columns of a sample grid.
pub const GRID_SIDE: usize = 8;

/// Render the first `rows · cols` images of `(n, c, h, w)` samples in
/// `[0, 1]` as one PNG. Grayscale samples are expanded to RGB.
pub fn save_image_grid(samples: &Tensor, (rows, cols): (usize, usize), path: &Path) -> anyhow::Result<()> {
    let (n, c, h, w) = samples.dims4()?;
    if c != 1 && c != 3 {
        anyhow::bail!("cannot render {c}-channel samples");
    }
    let count = n.min(rows * cols);
    let pixels: Vec<f32> = samples
        .narrow(0, 0, count)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1()?;

    let mut img = RgbImage::new((cols * w) as u32, (rows * h) as u32);
    let to_u8 = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u8;
    for idx in 0..count {
        let (gy, gx) = (idx / cols, idx % cols);
        let base = idx * c * h * w;
        for y in 0..h {
            for x in 0..w {
                let at = |ch: usize| pixels[base + ch * h * w + y * w + x];
                let rgb = if c == 1 {
                    let v = to_u8(at(0));
                    [v, v, v]
                } else {
                    [to_u8(at(0)), to_u8(at(1)), to_u8(at(2))]
                };
                img.put_pixel((gx * w + x) as u32, (gy * h + y) as u32, Rgb(rgb));
            }
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    img.save(path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// `train_{step:02}.png` inside `dir`.
pub fn sample_grid_path(dir: &Path, step: usize) -> PathBuf {
    dir.join(format!("train_{step:02}.png"))
}

/// Write named tensors into one `.npz` archive.
pub fn save_npz(path: &Path, tensors: &[(String, Tensor)]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Tensor::write_npz(tensors, path).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Write every tensor to `{dir}/{key}.npy`; returns the written paths.
pub fn save_npy_each(dir: &Path, tensors: &[(String, Tensor)]) -> anyhow::Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dir)?;
    let mut written = Vec::with_capacity(tensors.len());
    for (key, t) in tensors {
        let path = dir.join(format!("{key}.npy"));
        t.write_npy(&path)
            .with_context(|| format!("writing {}", path.display()))?;
        tracing::info!(rows = t.dim(0)?, key = %key, path = %path.display(), "saved");
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn grid_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let samples = Tensor::rand(0f32, 1f32, (70, 1, 4, 5), &Device::Cpu).unwrap();
        let path = sample_grid_path(dir.path(), 3);
        assert!(path.ends_with("train_03.png"));
        save_image_grid(&samples, (GRID_SIDE, GRID_SIDE), &path).unwrap();
        let img = image::open(&path).unwrap();
        assert_eq!((img.width(), img.height()), (40, 32));
    }

    #[test]
    fn partial_grid_and_colour() {
        let dir = tempfile::tempdir().unwrap();
        let samples = Tensor::ones((3, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let path = dir.path().join("g.png");
        save_image_grid(&samples, (2, 2), &path).unwrap();
        let img = image::open(&path).unwrap().to_rgb8();
        assert_eq!(img.get_pixel(0, 0), &Rgb([255, 255, 255]));
        // Fourth cell is empty.
        assert_eq!(img.get_pixel(3, 3), &Rgb([0, 0, 0]));
    }

    #[test]
    fn unsupported_channels() {
        let dir = tempfile::tempdir().unwrap();
        let samples = Tensor::zeros((1, 2, 2, 2), DType::F32, &Device::Cpu).unwrap();
        assert!(save_image_grid(&samples, (1, 1), &dir.path().join("x.png")).is_err());
    }

    #[test]
    fn npz_and_npy() {
        let dir = tempfile::tempdir().unwrap();
        let t = Tensor::arange(0f32, 6.0, &Device::Cpu).unwrap().reshape((2, 3)).unwrap();
        let named = vec![("hF_real".to_string(), t.clone()), ("hF_fake".to_string(), t.clone())];
        save_npz(&dir.path().join("layer_outputs_0.npz"), &named).unwrap();
        let loaded = Tensor::read_npz(dir.path().join("layer_outputs_0.npz")).unwrap();
        assert_eq!(loaded.len(), 2);
        let paths = save_npy_each(dir.path(), &named).unwrap();
        let back = Tensor::read_npy(&paths[0]).unwrap();
        assert_eq!(back.to_vec2::<f32>().unwrap(), t.to_vec2::<f32>().unwrap());
    }
}
