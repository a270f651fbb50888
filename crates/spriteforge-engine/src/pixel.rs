//! Deterministic pixel-art normalization: nearest-neighbor downscale, adaptive
//! palette reduction, optional Floyd-Steinberg dithering, and magnified grid
//! previews. No I/O and no randomness; identical inputs produce identical
//! sprites.

use std::collections::BTreeMap;

use anyhow::Result;
use image::imageops::{self, ColorMap, FilterType};
use image::{DynamicImage, Rgb, RgbImage};

use crate::ImageProcessingError;

pub const DEFAULT_SPRITE_SIZE: u32 = 16;
pub const DEFAULT_PALETTE_SIZE: usize = 32;
pub const DEFAULT_PIXEL_SIZE: u32 = 20;
pub const DEFAULT_GRID_COLOR: Rgb<u8> = Rgb([128, 128, 128]);
pub const DEFAULT_GRID_WIDTH: u32 = 1;

const DOMINANT_COLOR_LIMIT: usize = 5;

/// Prompt fragments that mark a query as already styled for pixel art.
const STYLE_MARKERS: [&str; 4] = ["pixel", "8-bit", "16-bit", "sprite"];

#[derive(Debug, Clone, Copy)]
pub struct PixelArtOptions {
    pub sprite_size: u32,
    pub palette_size: usize,
    pub dither: bool,
}

impl Default for PixelArtOptions {
    fn default() -> Self {
        Self {
            sprite_size: DEFAULT_SPRITE_SIZE,
            palette_size: DEFAULT_PALETTE_SIZE,
            dither: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GridOptions {
    pub pixel_size: u32,
    pub grid_color: Rgb<u8>,
    pub grid_width: u32,
}

impl Default for GridOptions {
    fn default() -> Self {
        Self {
            pixel_size: DEFAULT_PIXEL_SIZE,
            grid_color: DEFAULT_GRID_COLOR,
            grid_width: DEFAULT_GRID_WIDTH,
        }
    }
}

/// Converts an arbitrary raster into a small fixed-palette sprite.
///
/// Nearest-neighbor keeps hard edges through the downscale; the palette is
/// derived per image with median-cut, so the sprite never carries more than
/// `palette_size` distinct colors.
pub fn to_pixel_art(image: &DynamicImage, options: PixelArtOptions) -> Result<RgbImage> {
    if image.width() == 0 || image.height() == 0 {
        return Err(ImageProcessingError("input image has zero dimensions".to_string()).into());
    }
    if options.sprite_size == 0 {
        return Err(ImageProcessingError("sprite size must be at least 1".to_string()).into());
    }
    if options.palette_size == 0 {
        return Err(ImageProcessingError("palette size must be at least 1".to_string()).into());
    }

    let rgb = image.to_rgb8();
    let mut sprite = imageops::resize(
        &rgb,
        options.sprite_size,
        options.sprite_size,
        FilterType::Nearest,
    );

    let palette = AdaptivePalette::from_image(&sprite, options.palette_size);
    if options.dither {
        imageops::dither(&mut sprite, &palette);
    } else {
        for pixel in sprite.pixels_mut() {
            palette.map_color(pixel);
        }
    }
    Ok(sprite)
}

/// Image-specific palette built by median-cut over the sprite's pixels.
///
/// Boxes are split on their widest channel at the median until `max_colors`
/// boxes exist or no box can split further; each box contributes its average
/// color. Ordering is deterministic for a given input.
#[derive(Debug, Clone)]
pub struct AdaptivePalette {
    colors: Vec<Rgb<u8>>,
}

impl AdaptivePalette {
    pub fn from_image(image: &RgbImage, max_colors: usize) -> Self {
        let pixels: Vec<Rgb<u8>> = image.pixels().copied().collect();
        Self::from_pixels(&pixels, max_colors)
    }

    fn from_pixels(pixels: &[Rgb<u8>], max_colors: usize) -> Self {
        let max_colors = max_colors.max(1);
        if pixels.is_empty() {
            return Self {
                colors: vec![Rgb([0, 0, 0])],
            };
        }

        let mut boxes: Vec<Vec<Rgb<u8>>> = vec![pixels.to_vec()];
        while boxes.len() < max_colors {
            // Split the box with the widest channel range.
            let candidate = boxes
                .iter()
                .enumerate()
                .filter_map(|(idx, colors)| {
                    let (channel, range) = widest_channel(colors);
                    (range > 0).then_some((idx, channel, range))
                })
                .max_by_key(|(_, _, range)| *range);
            let Some((idx, channel, _)) = candidate else {
                break;
            };

            let mut colors = boxes.swap_remove(idx);
            colors.sort_by_key(|color| color[channel]);
            let mid = colors.len() / 2;
            let upper = colors.split_off(mid);
            if colors.is_empty() || upper.is_empty() {
                boxes.push(if colors.is_empty() { upper } else { colors });
                break;
            }
            boxes.push(colors);
            boxes.push(upper);
        }

        let mut colors: Vec<Rgb<u8>> = boxes.iter().map(|colors| average_color(colors)).collect();
        colors.sort_by_key(|color| (color[0], color[1], color[2]));
        colors.dedup();
        Self { colors }
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    pub fn colors(&self) -> &[Rgb<u8>] {
        &self.colors
    }
}

impl ColorMap for AdaptivePalette {
    type Color = Rgb<u8>;

    fn index_of(&self, color: &Rgb<u8>) -> usize {
        let mut best = 0;
        let mut best_distance = u32::MAX;
        for (idx, candidate) in self.colors.iter().enumerate() {
            let distance = squared_distance(color, candidate);
            if distance < best_distance {
                best_distance = distance;
                best = idx;
            }
        }
        best
    }

    fn lookup(&self, index: usize) -> Option<Rgb<u8>> {
        self.colors.get(index).copied()
    }

    fn has_lookup(&self) -> bool {
        true
    }

    fn map_color(&self, color: &mut Rgb<u8>) {
        *color = self.colors[self.index_of(color)];
    }
}

fn widest_channel(colors: &[Rgb<u8>]) -> (usize, u8) {
    let mut min = [u8::MAX; 3];
    let mut max = [u8::MIN; 3];
    for color in colors {
        for channel in 0..3 {
            min[channel] = min[channel].min(color[channel]);
            max[channel] = max[channel].max(color[channel]);
        }
    }
    (0..3)
        .map(|channel| (channel, max[channel] - min[channel]))
        .max_by_key(|(_, range)| *range)
        .unwrap_or((0, 0))
}

fn average_color(colors: &[Rgb<u8>]) -> Rgb<u8> {
    if colors.is_empty() {
        return Rgb([0, 0, 0]);
    }
    let mut sums = [0u64; 3];
    for color in colors {
        for channel in 0..3 {
            sums[channel] += u64::from(color[channel]);
        }
    }
    let count = colors.len() as u64;
    Rgb([
        (sums[0] / count) as u8,
        (sums[1] / count) as u8,
        (sums[2] / count) as u8,
    ])
}

fn squared_distance(a: &Rgb<u8>, b: &Rgb<u8>) -> u32 {
    (0..3)
        .map(|channel| {
            let delta = i32::from(a[channel]) - i32::from(b[channel]);
            (delta * delta) as u32
        })
        .sum()
}

/// Magnifies a sprite into a preview where every sprite pixel becomes a
/// `pixel_size` block separated by grid lines.
///
/// Output side length is `n * (pixel_size + grid_width) + grid_width` for an
/// `n`-pixel sprite side.
pub fn pixel_grid(sprite: &RgbImage, options: GridOptions) -> RgbImage {
    let cell = options.pixel_size + options.grid_width;
    let width = sprite.width() * cell + options.grid_width;
    let height = sprite.height() * cell + options.grid_width;
    let mut preview = RgbImage::from_pixel(width, height, options.grid_color);

    for (x, y, pixel) in sprite.enumerate_pixels() {
        let origin_x = x * cell + options.grid_width;
        let origin_y = y * cell + options.grid_width;
        for dy in 0..options.pixel_size {
            for dx in 0..options.pixel_size {
                preview.put_pixel(origin_x + dx, origin_y + dy, *pixel);
            }
        }
    }
    preview
}

/// Appends pixel-art style keywords to a prompt unless it already carries
/// one of the style markers. Idempotent.
pub fn enhance_prompt(prompt: &str) -> String {
    let lowered = prompt.to_lowercase();
    if STYLE_MARKERS.iter().any(|marker| lowered.contains(marker)) {
        return prompt.to_string();
    }
    format!("{prompt}, pixel art style, 8-bit, 16-bit")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelArtStats {
    pub width: u32,
    pub height: u32,
    pub total_pixels: u64,
    pub unique_colors: usize,
    /// Up to five most frequent colors, most frequent first. Ties break on
    /// the lower color value.
    pub dominant_colors: Vec<(Rgb<u8>, u64)>,
}

pub fn analyze(sprite: &RgbImage) -> PixelArtStats {
    let mut counts: BTreeMap<[u8; 3], u64> = BTreeMap::new();
    for pixel in sprite.pixels() {
        *counts.entry(pixel.0).or_insert(0) += 1;
    }

    let unique_colors = counts.len();
    let mut ranked: Vec<([u8; 3], u64)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    PixelArtStats {
        width: sprite.width(),
        height: sprite.height(),
        total_pixels: u64::from(sprite.width()) * u64::from(sprite.height()),
        unique_colors,
        dominant_colors: ranked
            .into_iter()
            .take(DOMINANT_COLOR_LIMIT)
            .map(|(color, count)| (Rgb(color), count))
            .collect(),
    }
}
