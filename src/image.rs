use crate::config::Parallelism;
use crate::error::{Error, Result};
use rayon::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};

/// Colour with normalized channels, nominally in `[0, 1]`.
#[derive(Copy, Clone, Debug, PartialEq, Default)]
pub struct Rgb {
    pub r: f64,
    pub g: f64,
    pub b: f64,
}

impl Rgb {
    pub const fn new(r: f64, g: f64, b: f64) -> Self {
        Self { r, g, b }
    }

    pub fn from_u8(r: u8, g: u8, b: u8) -> Self {
        Self::new(
            f64::from(r) / 255.0,
            f64::from(g) / 255.0,
            f64::from(b) / 255.0,
        )
    }

    pub fn to_u8(&self) -> [u8; 3] {
        let c = self.clamped();
        [c.r, c.g, c.b].map(|v| (v * 255.0).round() as u8)
    }

    pub fn channels(&self) -> [f64; 3] {
        [self.r, self.g, self.b]
    }

    pub fn from_channels([r, g, b]: [f64; 3]) -> Self {
        Self::new(r, g, b)
    }

    pub fn clamped(&self) -> Self {
        Self::new(
            self.r.clamp(0.0, 1.0),
            self.g.clamp(0.0, 1.0),
            self.b.clamp(0.0, 1.0),
        )
    }
}

/// One colour mapping: pixels looking like `source` should become `target`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Sample {
    pub source: Rgb,
    pub target: Rgb,
}

impl Sample {
    pub fn new(source: Rgb, target: Rgb) -> Self {
        Self { source, target }
    }
}

/// Row-major pixel grid.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    width: usize,
    height: usize,
    pixels: Vec<Rgb>,
}

impl Image {
    pub fn new(width: usize, height: usize, pixels: Vec<Rgb>) -> Result<Self> {
        if width.checked_mul(height) != Some(pixels.len()) {
            return Err(Error::ImageSize {
                width,
                height,
                len: pixels.len(),
            });
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    pub fn filled(width: usize, height: usize, colour: Rgb) -> Self {
        Self {
            width,
            height,
            pixels: vec![colour; width * height],
        }
    }

    pub fn from_fn<F>(width: usize, height: usize, mut f: F) -> Self
    where
        F: FnMut(usize, usize) -> Rgb,
    {
        let mut pixels = Vec::with_capacity(width * height);
        for y in 0..height {
            for x in 0..width {
                pixels.push(f(x, y));
            }
        }
        Self {
            width,
            height,
            pixels,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pixels(&self) -> &[Rgb] {
        &self.pixels
    }

    pub fn pixel(&self, x: usize, y: usize) -> Option<Rgb> {
        if x >= self.width {
            return None;
        }
        self.pixels.get(y * self.width + x).copied()
    }

    pub fn rows(&self) -> impl Iterator<Item = &[Rgb]> {
        // chunks(0) panics; an empty grid has no rows.
        self.pixels.chunks(self.width.max(1))
    }

    /// Rewrites every pixel through `f`, giving each row its own clone of
    /// `state`. Once `abort` is raised the remaining pixels keep their
    /// original colour.
    pub fn map_rows<S, F>(
        &self,
        parallelism: Parallelism,
        abort: &AtomicBool,
        state: &S,
        f: F,
    ) -> Result<Image>
    where
        S: Clone + Sync,
        F: Fn(&mut S, Rgb) -> Result<Rgb> + Sync,
    {
        let mut pixels = self.pixels.clone();
        if self.width == 0 {
            return Image::new(self.width, self.height, pixels);
        }

        let map_row = |row: &mut [Rgb]| -> Result<()> {
            let mut local = state.clone();
            for pixel in row.iter_mut() {
                if abort.load(Ordering::Relaxed) {
                    break;
                }
                *pixel = f(&mut local, *pixel)?;
            }
            Ok(())
        };

        match parallelism {
            Parallelism::Sequential => pixels.chunks_mut(self.width).try_for_each(map_row)?,
            Parallelism::Parallel => pixels.par_chunks_mut(self.width).try_for_each(map_row)?,
        }

        Image::new(self.width, self.height, pixels)
    }
}
