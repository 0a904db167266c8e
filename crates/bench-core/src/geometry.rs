use image::{Rgb, RgbImage};
use nalgebra::{Matrix3, Point2, SMatrix, SVector, Vector3};
use serde::{Deserialize, Serialize};

/// Axis-aligned pixel rectangle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.right() && other.x < self.right() && self.y < other.bottom() && other.y < self.bottom()
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x && other.y >= self.y && other.right() <= self.right() && other.bottom() <= self.bottom()
    }

    /// Clip to a `width` x `height` image
    pub fn clipped(&self, width: u32, height: u32) -> Rect {
        let x = self.x.min(width);
        let y = self.y.min(height);
        Rect::new(x, y, self.right().min(width) - x, self.bottom().min(height) - y)
    }
}

/// What a sample outside the source image resolves to
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Border {
    /// Clamp to the nearest edge pixel
    Replicate,
    /// Fixed fill color
    Constant(Rgb<u8>),
}

/// Apply perspective warp to an image.
///
/// `matrix` maps source coordinates to destination coordinates; every output
/// pixel is pulled back through its inverse.
pub fn warp_perspective(
    img: &RgbImage,
    matrix: &Matrix3<f64>,
    out_width: u32,
    out_height: u32,
    border: Border,
) -> Option<RgbImage> {
    let inv_matrix = matrix.try_inverse()?;

    Some(remap(img, out_width, out_height, border, |x, y| {
        let src_point_h = inv_matrix * Vector3::new(x as f64, y as f64, 1.0);

        // Points at infinity resolve to the border
        let z = src_point_h.z;
        if z.abs() < 1e-12 {
            return (-1.0, -1.0);
        }
        ((src_point_h.x / z) as f32, (src_point_h.y / z) as f32)
    }))
}

/// Compute the homography mapping `src` points onto `dst` points.
///
/// Four correspondences give eight equations; with `h33 = 1` the remaining
/// eight unknowns come out of a dense LU solve. Returns `None` for degenerate
/// (collinear) configurations.
pub fn find_homography(src: [Point2<f32>; 4], dst: [Point2<f32>; 4]) -> Option<Matrix3<f64>> {
    if has_collinear_triple(&src) || has_collinear_triple(&dst) {
        return None;
    }

    let mut a = SMatrix::<f64, 8, 8>::zeros();
    let mut b = SVector::<f64, 8>::zeros();

    for i in 0..4 {
        let (x, y) = (src[i].x as f64, src[i].y as f64);
        let (u, v) = (dst[i].x as f64, dst[i].y as f64);
        let r = i * 2;

        a[(r, 0)] = x;
        a[(r, 1)] = y;
        a[(r, 2)] = 1.0;
        a[(r, 6)] = -x * u;
        a[(r, 7)] = -y * u;
        b[r] = u;

        a[(r + 1, 3)] = x;
        a[(r + 1, 4)] = y;
        a[(r + 1, 5)] = 1.0;
        a[(r + 1, 6)] = -x * v;
        a[(r + 1, 7)] = -y * v;
        b[r + 1] = v;
    }

    let h = a.lu().solve(&b)?;
    if h.iter().any(|value| !value.is_finite()) {
        return None;
    }

    Some(Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0))
}

fn has_collinear_triple(points: &[Point2<f32>; 4]) -> bool {
    const TRIPLES: [(usize, usize, usize); 4] = [(0, 1, 2), (0, 1, 3), (0, 2, 3), (1, 2, 3)];
    TRIPLES.iter().any(|&(i, j, k)| {
        let (a, b, c) = (points[i], points[j], points[k]);
        let area = (b.x - a.x) as f64 * (c.y - a.y) as f64 - (b.y - a.y) as f64 * (c.x - a.x) as f64;
        area.abs() < 1e-6
    })
}

/// Rotate counter-clockwise by `angle_deg` around the image center, growing the
/// canvas so no corner of the source is clipped.
pub fn rotate_expanded(img: &RgbImage, angle_deg: f64, fill: Rgb<u8>) -> RgbImage {
    let (width, height) = (img.width() as f64, img.height() as f64);
    let theta = angle_deg.to_radians();
    let (sin, cos) = theta.sin_cos();

    // Trim float noise so 90 degrees does not grow the canvas by a pixel
    let new_width = (width * cos.abs() + height * sin.abs() - 1e-6).ceil().max(1.0) as u32;
    let new_height = (width * sin.abs() + height * cos.abs() - 1e-6).ceil().max(1.0) as u32;

    let (cx, cy) = (width / 2.0, height / 2.0);
    let (ncx, ncy) = (new_width as f64 / 2.0, new_height as f64 / 2.0);

    remap(img, new_width, new_height, Border::Constant(fill), |x, y| {
        // Pixel centers, inverse rotation (y axis points down)
        let dx = x as f64 + 0.5 - ncx;
        let dy = y as f64 + 0.5 - ncy;
        let sx = dx * cos - dy * sin + cx - 0.5;
        let sy = dx * sin + dy * cos + cy - 0.5;
        (sx as f32, sy as f32)
    })
}

/// Build an image by sampling `img` at the coordinates `map(x, y)` returns
/// for every output pixel.
pub fn remap<F>(img: &RgbImage, out_width: u32, out_height: u32, border: Border, map: F) -> RgbImage
where
    F: Fn(u32, u32) -> (f32, f32),
{
    let mut output = RgbImage::new(out_width, out_height);
    for y in 0..out_height {
        for x in 0..out_width {
            let (sx, sy) = map(x, y);
            output.put_pixel(x, y, bilinear_sample(img, sx, sy, border));
        }
    }
    output
}

/// Bilinear interpolation with the given border handling
pub fn bilinear_sample(img: &RgbImage, x: f32, y: f32, border: Border) -> Rgb<u8> {
    if !x.is_finite() || !y.is_finite() {
        return edge_pixel(img, 0, 0, border);
    }

    let x0 = x.floor();
    let y0 = y.floor();
    let dx = x - x0;
    let dy = y - y0;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let p00 = edge_pixel(img, x0, y0, border);
    let p10 = edge_pixel(img, x0 + 1, y0, border);
    let p01 = edge_pixel(img, x0, y0 + 1, border);
    let p11 = edge_pixel(img, x0 + 1, y0 + 1, border);

    let mut out = [0u8; 3];
    for c in 0..3 {
        let top = p00.0[c] as f32 * (1.0 - dx) + p10.0[c] as f32 * dx;
        let bottom = p01.0[c] as f32 * (1.0 - dx) + p11.0[c] as f32 * dx;
        out[c] = (top * (1.0 - dy) + bottom * dy).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

fn edge_pixel(img: &RgbImage, x: i64, y: i64, border: Border) -> Rgb<u8> {
    let (width, height) = (img.width() as i64, img.height() as i64);
    if width == 0 || height == 0 {
        return match border {
            Border::Constant(fill) => fill,
            Border::Replicate => Rgb([0, 0, 0]),
        };
    }

    if x >= 0 && x < width && y >= 0 && y < height {
        return *img.get_pixel(x as u32, y as u32);
    }

    match border {
        Border::Constant(fill) => fill,
        Border::Replicate => {
            let cx = x.clamp(0, width - 1) as u32;
            let cy = y.clamp(0, height - 1) as u32;
            *img.get_pixel(cx, cy)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(side: f32) -> [Point2<f32>; 4] {
        [
            Point2::new(0.0, 0.0),
            Point2::new(side, 0.0),
            Point2::new(side, side),
            Point2::new(0.0, side),
        ]
    }

    #[test]
    fn test_homography_integrity() {
        let src = square(10.0);
        let h = find_homography(src, src).unwrap();
        // Should be roughly identity
        assert!((h - Matrix3::identity()).abs().max() < 1e-9);
    }

    #[test]
    fn test_homography_maps_corners() {
        let src = square(100.0);
        let dst = [
            Point2::new(10.0, 5.0),
            Point2::new(90.0, 12.0),
            Point2::new(95.0, 98.0),
            Point2::new(3.0, 90.0),
        ];
        let h = find_homography(src, dst).unwrap();

        for (s, d) in src.iter().zip(dst.iter()) {
            let p = h * Vector3::new(s.x as f64, s.y as f64, 1.0);
            assert!((p.x / p.z - d.x as f64).abs() < 1e-6);
            assert!((p.y / p.z - d.y as f64).abs() < 1e-6);
        }
    }

    #[test]
    fn test_homography_degenerate() {
        let src = [
            Point2::new(0.0, 0.0),
            Point2::new(1.0, 1.0),
            Point2::new(2.0, 2.0),
            Point2::new(3.0, 3.0),
        ];
        assert!(find_homography(src, square(10.0)).is_none());
    }

    #[test]
    fn test_warp_identity_preserves_image() {
        let mut img = RgbImage::from_pixel(8, 8, Rgb([200, 200, 200]));
        img.put_pixel(3, 4, Rgb([10, 20, 30]));
        let out = warp_perspective(&img, &Matrix3::identity(), 8, 8, Border::Replicate).unwrap();
        assert_eq!(out, img);
    }

    #[test]
    fn test_rotate_expanded_dimensions() {
        let img = RgbImage::from_pixel(100, 50, Rgb([0, 0, 0]));
        let fill = Rgb([240, 240, 240]);

        let rotated = rotate_expanded(&img, 90.0, fill);
        assert_eq!(rotated.dimensions(), (50, 100));

        let rotated = rotate_expanded(&img, 45.0, fill);
        // 100*cos45 + 50*sin45 = 106.07
        assert_eq!(rotated.dimensions(), (107, 107));
        assert_eq!(*rotated.get_pixel(0, 0), fill);
        assert_eq!(*rotated.get_pixel(53, 53), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_rect_relations() {
        let outer = Rect::new(0, 0, 100, 100);
        let inner = Rect::new(10, 10, 20, 20);
        let apart = Rect::new(30, 30, 5, 5);
        assert!(outer.contains(&inner));
        assert!(!inner.intersects(&apart));
        assert_eq!(Rect::new(90, 90, 20, 20).clipped(100, 95), Rect::new(90, 90, 10, 5));
    }

    #[test]
    fn test_constant_border() {
        let img = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        let fill = Rgb([255, 0, 0]);
        assert_eq!(bilinear_sample(&img, -5.0, 1.0, Border::Constant(fill)), fill);
        assert_eq!(bilinear_sample(&img, -5.0, 1.0, Border::Replicate), Rgb([0, 0, 0]));
    }
}
