use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, ImageBuffer, ImageReader, Luma};
use imageproc::contrast::{threshold, ThresholdType};
use imageproc::filter::median_filter;
use idscan_core::{BinarizeParams, CanonicalSize, CropRegion, ProcessorConfig};
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Crop region selects nothing from a {width}x{height} image")]
    EmptyRegion { width: u32, height: u32 },
    #[error("Failed to encode processed image: {0}")]
    Encode(String),
}

/// Open an image file, sniffing the format from its contents rather than its extension.
pub fn load_image(path: &Path) -> Result<DynamicImage, PreprocessError> {
    let img = ImageReader::open(path)
        .and_then(|r| r.with_guessed_format())
        .map_err(image::ImageError::IoError)?
        .decode()?;
    Ok(img)
}

pub fn load_image_from_bytes(data: &[u8]) -> Result<DynamicImage, PreprocessError> {
    Ok(image::load_from_memory(data)?)
}

/// Full normalization: orientation + crop, shadow removal + binarization,
/// then resize into the canonical field-box space.
pub fn prepare_canonical(
    img: &DynamicImage,
    config: &ProcessorConfig,
) -> Result<GrayImage, PreprocessError> {
    let cropped = normalize_geometry(img, &config.crop_region)?;
    let binary = remove_shadows_and_binarize(&cropped, &config.binarize);
    Ok(to_canonical(&binary, config.canonical_size))
}

// ── Geometry ─────────────────────────────────────────────────────────────────

/// Rotate 90° counter-clockwise and keep `region` of the rotated image.
pub fn normalize_geometry(
    img: &DynamicImage,
    region: &CropRegion,
) -> Result<DynamicImage, PreprocessError> {
    let rotated = img.rotate270();
    let (width, height) = (rotated.width(), rotated.height());
    let px = region.to_pixels(width, height);
    if px.is_empty() {
        return Err(PreprocessError::EmptyRegion { width, height });
    }
    Ok(rotated.crop_imm(px.x1, px.y1, px.width(), px.height()))
}

pub fn to_canonical(img: &GrayImage, size: CanonicalSize) -> GrayImage {
    imageops::resize(img, size.width, size.height, FilterType::Triangle)
}

// ── Illumination ─────────────────────────────────────────────────────────────

/// Grayscale → median background estimate → divide → CLAHE → global threshold.
pub fn remove_shadows_and_binarize(img: &DynamicImage, params: &BinarizeParams) -> GrayImage {
    let gray = img.to_luma8();
    let radius = params.median_kernel / 2;
    let background = median_filter(&gray, radius, radius);
    let flattened = divide_by_background(&gray, &background);
    let enhanced = clahe(&flattened, params.clahe_clip_limit, params.clahe_tile_grid);
    threshold(&enhanced, params.threshold, ThresholdType::Binary)
}

/// `gray * 255 / background`, saturated; zero where the background is zero.
fn divide_by_background(gray: &GrayImage, background: &GrayImage) -> GrayImage {
    ImageBuffer::from_fn(gray.width(), gray.height(), |x, y| {
        let g = gray.get_pixel(x, y)[0] as f32;
        let bg = background.get_pixel(x, y)[0] as f32;
        let v = if bg == 0.0 { 0.0 } else { (g * 255.0 / bg).round().min(255.0) };
        Luma([v as u8])
    })
}

/// Contrast-limited adaptive histogram equalization with bilinear blending
/// between neighbouring tile mappings.
fn clahe(img: &GrayImage, clip_limit: f32, grid: u32) -> GrayImage {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return img.clone();
    }

    let tile_w = width.div_ceil(grid.clamp(1, width));
    let tile_h = height.div_ceil(grid.clamp(1, height));
    let tiles_x = width.div_ceil(tile_w);
    let tiles_y = height.div_ceil(tile_h);

    let mut luts = Vec::with_capacity((tiles_x * tiles_y) as usize);
    for ty in 0..tiles_y {
        for tx in 0..tiles_x {
            let x0 = tx * tile_w;
            let y0 = ty * tile_h;
            let x1 = (x0 + tile_w).min(width);
            let y1 = (y0 + tile_h).min(height);
            luts.push(tile_lut(img, x0, y0, x1, y1, clip_limit));
        }
    }
    let lut_at = |tx: u32, ty: u32| &luts[(ty * tiles_x + tx) as usize];

    let inv_tw = 1.0 / tile_w as f32;
    let inv_th = 1.0 / tile_h as f32;
    let max_tx = tiles_x as i64 - 1;
    let max_ty = tiles_y as i64 - 1;

    ImageBuffer::from_fn(width, height, |x, y| {
        let v = img.get_pixel(x, y)[0] as usize;

        let txf = x as f32 * inv_tw - 0.5;
        let tx1 = txf.floor() as i64;
        let xa = txf - tx1 as f32;
        let (left, right) = (tx1.clamp(0, max_tx) as u32, (tx1 + 1).clamp(0, max_tx) as u32);

        let tyf = y as f32 * inv_th - 0.5;
        let ty1 = tyf.floor() as i64;
        let ya = tyf - ty1 as f32;
        let (top, bottom) = (ty1.clamp(0, max_ty) as u32, (ty1 + 1).clamp(0, max_ty) as u32);

        let upper = lut_at(left, top)[v] as f32 * (1.0 - xa) + lut_at(right, top)[v] as f32 * xa;
        let lower =
            lut_at(left, bottom)[v] as f32 * (1.0 - xa) + lut_at(right, bottom)[v] as f32 * xa;
        let out = upper * (1.0 - ya) + lower * ya;
        Luma([out.round().clamp(0.0, 255.0) as u8])
    })
}

fn tile_lut(img: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32, clip_limit: f32) -> [u8; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            hist[img.get_pixel(x, y)[0] as usize] += 1;
        }
    }
    let area = (x1 - x0) * (y1 - y0);

    // Clip, then hand the excess back evenly; the remainder goes to spaced bins.
    let clip = ((clip_limit * area as f32 / 256.0) as u32).max(1);
    let mut excess = 0u32;
    for h in hist.iter_mut() {
        if *h > clip {
            excess += *h - clip;
            *h = clip;
        }
    }
    let batch = excess / 256;
    let mut residual = excess % 256;
    for h in hist.iter_mut() {
        *h += batch;
    }
    if residual > 0 {
        let step = (256 / residual).max(1) as usize;
        for h in hist.iter_mut().step_by(step) {
            if residual == 0 {
                break;
            }
            *h += 1;
            residual -= 1;
        }
    }

    let scale = 255.0 / area as f32;
    let mut lut = [0u8; 256];
    let mut cdf = 0u32;
    for (i, h) in hist.iter().enumerate() {
        cdf += h;
        lut[i] = (cdf as f32 * scale).round().min(255.0) as u8;
    }
    lut
}

// ── Encoding ─────────────────────────────────────────────────────────────────

pub fn encode_png(img: &GrayImage) -> Result<Vec<u8>, PreprocessError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| PreprocessError::Encode(e.to_string()))?;
    Ok(buf)
}
