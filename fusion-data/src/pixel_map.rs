//! Dense row-major per-pixel buffers.
//!
//! Callers go through the semantic accessors below; the storage layout is an
//! internal detail so that buffers can be swapped for device-resident ones.

use glam::Vec3;

/// Per-pixel camera-space positions; `None` marks pixels without a surface.
pub type VertexMap = PixelMap<Option<Vec3>>;
/// Per-pixel unit normals; `None` marks pixels without a usable normal.
pub type NormalMap = PixelMap<Option<Vec3>>;

/// Depth values that are finite and strictly positive carry a measurement.
#[inline]
pub fn is_valid_depth(depth: f32) -> bool {
    depth.is_finite() && depth > 0.0
}

/// A width × height grid of `T` stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct PixelMap<T> {
    width: u32,
    height: u32,
    data: Vec<T>,
}

impl<T: Copy> PixelMap<T> {
    /// Create a map with every pixel set to `fill`.
    pub fn new(width: u32, height: u32, fill: T) -> Self {
        Self {
            width,
            height,
            data: vec![fill; width as usize * height as usize],
        }
    }

    /// Wrap an existing row-major buffer. Returns `None` if the length does
    /// not match the dimensions.
    pub fn from_vec(width: u32, height: u32, data: Vec<T>) -> Option<Self> {
        (data.len() == width as usize * height as usize).then_some(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    /// Read a pixel.
    ///
    /// # Panics
    /// Panics if `(x, y)` lies outside the map, like `ImageBuffer::get_pixel`.
    #[inline]
    pub fn get(&self, x: u32, y: u32) -> T {
        assert!(x < self.width && y < self.height, "pixel ({x}, {y}) out of bounds");
        self.data[self.index(x, y)]
    }

    /// Read a pixel with signed coordinates, `None` outside the map.
    #[inline]
    pub fn get_checked(&self, x: i64, y: i64) -> Option<T> {
        if x < 0 || y < 0 || x >= self.width as i64 || y >= self.height as i64 {
            return None;
        }
        Some(self.data[self.index(x as u32, y as u32)])
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, value: T) {
        assert!(x < self.width && y < self.height, "pixel ({x}, {y}) out of bounds");
        let idx = self.index(x, y);
        self.data[idx] = value;
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Rows in top-to-bottom order.
    pub fn rows(&self) -> impl Iterator<Item = &[T]> {
        self.data.chunks_exact(self.width.max(1) as usize)
    }

    /// Apply `f` to every pixel, producing a map of the same size.
    pub fn map<U: Copy>(&self, f: impl Fn(T) -> U) -> PixelMap<U> {
        PixelMap {
            width: self.width,
            height: self.height,
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }
}

impl<T: Copy> PixelMap<Option<T>> {
    /// Number of pixels holding a value.
    pub fn valid_count(&self) -> usize {
        self.data.iter().filter(|v| v.is_some()).count()
    }
}
