use derive_more::{Deref, DerefMut};
use image::{GrayImage, ImageBuffer, Luma};
use std::f32;

type GrayImageBuffer = ImageBuffer<Luma<f32>, Vec<f32>>;

/// A grayscale image with values between 0 and 1, the working format of every detector.
#[derive(Debug, Clone, Deref, DerefMut)]
pub struct GrayFloatImage(pub GrayImageBuffer);

impl GrayFloatImage {
    pub fn from_gray(image: &GrayImage) -> Self {
        Self(ImageBuffer::from_fn(image.width(), image.height(), |x, y| {
            Luma([f32::from(image[(x, y)][0]) / 255.0])
        }))
    }

    pub fn new(width: usize, height: usize) -> Self {
        Self(ImageBuffer::from_pixel(
            width as u32,
            height as u32,
            Luma([0.0]),
        ))
    }

    pub fn width(&self) -> usize {
        self.0.width() as usize
    }

    pub fn height(&self) -> usize {
        self.0.height() as usize
    }

    pub fn get(&self, x: usize, y: usize) -> f32 {
        self.0.as_raw()[y * self.width() + x]
    }

    pub fn put(&mut self, x: usize, y: usize, value: f32) {
        let width = self.width();
        let data: &mut [f32] = &mut self.0;
        data[y * width + x] = value;
    }

    /// Reads a pixel, replicating the border for coordinates outside of the image.
    pub fn get_clamped(&self, x: isize, y: isize) -> f32 {
        let x = x.clamp(0, self.width() as isize - 1) as usize;
        let y = y.clamp(0, self.height() as isize - 1) as usize;
        self.get(x, y)
    }

    /// Bilinear interpolation with border replication.
    pub fn sample(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let (fx, fy) = (x - x0, y - y0);
        let (x0, y0) = (x0 as isize, y0 as isize);
        let top = self.get_clamped(x0, y0) * (1.0 - fx) + self.get_clamped(x0 + 1, y0) * fx;
        let bottom =
            self.get_clamped(x0, y0 + 1) * (1.0 - fx) + self.get_clamped(x0 + 1, y0 + 1) * fx;
        top * (1.0 - fy) + bottom * fy
    }

    /// Element-wise difference `self - other` of two images of the same size.
    pub fn difference(&self, other: &Self) -> Self {
        let data = self
            .0
            .as_raw()
            .iter()
            .zip(other.0.as_raw())
            .map(|(a, b)| a - b)
            .collect();
        Self::from_raw(self.width(), self.height(), data)
    }

    fn from_raw(width: usize, height: usize, data: Vec<f32>) -> Self {
        match GrayImageBuffer::from_raw(width as u32, height as u32, data) {
            Some(buffer) => Self(buffer),
            None => Self::new(width, height),
        }
    }
}

/// Convolves every row with `kernel`, replicating the border pixels.
pub fn horizontal_filter(image: &GrayFloatImage, kernel: &[f32]) -> GrayFloatImage {
    debug_assert!(kernel.len() % 2 == 1);
    let half = kernel.len() / 2;
    let width = image.width();
    let height = image.height();
    let mut output = vec![0.0; width * height];
    let mut scratch = vec![0f32; width + half * 2];
    for (row_in, row_out) in image
        .as_raw()
        .chunks_exact(width.max(1))
        .zip(output.chunks_exact_mut(width.max(1)))
    {
        // Prefill extended buffer with center and edge values.
        scratch[..half].fill(row_in[0]);
        scratch[half..half + width].copy_from_slice(row_in);
        scratch[half + width..].fill(row_in[width - 1]);
        for (window, out) in scratch.windows(kernel.len()).zip(row_out) {
            *out = window.iter().zip(kernel).map(|(a, b)| a * b).sum();
        }
    }
    GrayFloatImage::from_raw(width, height, output)
}

/// Convolves every column with `kernel`, replicating the border pixels.
pub fn vertical_filter(image: &GrayFloatImage, kernel: &[f32]) -> GrayFloatImage {
    debug_assert!(kernel.len() % 2 == 1);
    let half = kernel.len() as isize / 2;
    let width = image.width();
    let height = image.height();
    let mut output = vec![0.0; width * height];
    for y in 0..height {
        for (k, &weight) in kernel.iter().enumerate() {
            let source = (y as isize + k as isize - half).clamp(0, height as isize - 1) as usize;
            let row_in = &image.as_raw()[source * width..(source + 1) * width];
            let row_out = &mut output[y * width..(y + 1) * width];
            for (out, value) in row_out.iter_mut().zip(row_in) {
                *out += weight * value;
            }
        }
    }
    GrayFloatImage::from_raw(width, height, output)
}

pub fn separable_filter(image: &GrayFloatImage, h_kernel: &[f32], v_kernel: &[f32]) -> GrayFloatImage {
    let h = horizontal_filter(image, h_kernel);
    vertical_filter(&h, v_kernel)
}

/// The Gaussian function.
fn gaussian(x: f32, r: f32) -> f32 {
    ((2.0 * f32::consts::PI).sqrt() * r).recip() * (-x.powi(2) / (2.0 * r.powi(2))).exp()
}

/// Generate a normalized Gaussian kernel of odd size.
pub fn gaussian_kernel(r: f32, kernel_size: usize) -> Vec<f32> {
    debug_assert!(kernel_size % 2 == 1, "kernel_size must be odd");
    let half_width = (kernel_size / 2) as i32;
    let mut kernel: Vec<f32> = (-half_width..=half_width)
        .map(|i| gaussian(i as f32, r))
        .collect();
    let sum: f32 = kernel.iter().sum();
    for val in kernel.iter_mut() {
        *val /= sum;
    }
    kernel
}

/// Perform Gaussian blur with standard deviation `r` on an image.
pub fn gaussian_blur(image: &GrayFloatImage, r: f32) -> GrayFloatImage {
    if r <= 0.0 {
        return image.clone();
    }
    let kernel_radius = (2.0 * r).ceil() as usize;
    let kernel = gaussian_kernel(r, kernel_radius * 2 + 1);
    separable_filter(image, &kernel, &kernel)
}

/// Sobel derivatives along `x` and `y`, scaled so a unit ramp has a unit derivative.
pub fn gradients(image: &GrayFloatImage) -> (GrayFloatImage, GrayFloatImage) {
    const DERIVATIVE: [f32; 3] = [-0.5, 0.0, 0.5];
    const SMOOTH: [f32; 3] = [0.25, 0.5, 0.25];
    (
        separable_filter(image, &DERIVATIVE, &SMOOTH),
        separable_filter(image, &SMOOTH, &DERIVATIVE),
    )
}

/// Finds local maxima of `response` above `threshold` within a square of `radius`, ignoring a
/// border of `margin` pixels.
///
/// The result is sorted by decreasing response and then by position, so it does not depend on
/// anything but the image.
pub fn local_maxima(
    response: &GrayFloatImage,
    radius: usize,
    margin: usize,
    threshold: f32,
) -> Vec<(usize, usize, f32)> {
    let (width, height) = (response.width(), response.height());
    let mut maxima = vec![];
    if width <= 2 * margin || height <= 2 * margin {
        return maxima;
    }
    for y in margin..height - margin {
        for x in margin..width - margin {
            let value = response.get(x, y);
            if value <= threshold {
                continue;
            }
            let is_max = (y.saturating_sub(radius)..=(y + radius).min(height - 1)).all(|ny| {
                (x.saturating_sub(radius)..=(x + radius).min(width - 1))
                    .all(|nx| {
                        let other = response.get(nx, ny);
                        // On plateaus the first pixel in raster order wins.
                        other < value || (other == value && (ny, nx) >= (y, x))
                    })
            });
            if is_max {
                maxima.push((x, y, value));
            }
        }
    }
    sort_by_response(&mut maxima);
    maxima
}

pub fn sort_by_response(points: &mut [(usize, usize, f32)]) {
    points.sort_by(|a, b| {
        float_ord::FloatOrd(b.2)
            .cmp(&float_ord::FloatOrd(a.2))
            .then((a.1, a.0).cmp(&(b.1, b.0)))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gaussian_kernel_correct() {
        // test against known correct kernel
        let kernel = gaussian_kernel(3.0, 7);
        let known_correct_kernel = [
            0.1062_8852,
            0.1403_2133,
            0.1657_7007,
            0.1752_4014,
            0.1657_7007,
            0.1403_2133,
            0.1062_8852,
        ];
        for (i, j) in kernel.iter().zip(known_correct_kernel.iter()) {
            assert!(f32::abs(*i - *j) < 0.0001);
        }
    }

    #[test]
    fn blur_preserves_constant_image() {
        let mut image = GrayFloatImage::new(9, 7);
        for y in 0..7 {
            for x in 0..9 {
                image.put(x, y, 0.25);
            }
        }
        let blurred = gaussian_blur(&image, 1.5);
        assert!(blurred.as_raw().iter().all(|&v| (v - 0.25).abs() < 1e-6));
    }

    #[test]
    fn ramp_gradient() {
        let mut image = GrayFloatImage::new(8, 8);
        for y in 0..8 {
            for x in 0..8 {
                image.put(x, y, x as f32 * 0.1);
            }
        }
        let (gx, gy) = gradients(&image);
        assert!((gx.get(4, 4) - 0.1).abs() < 1e-6);
        assert!(gy.get(4, 4).abs() < 1e-6);
    }
}
