use euclid::default::{Box2D, Point2D};
use serde::{Deserialize, Serialize};

/// Axis aligned bounds in canvas space.
pub type Bounds = Box2D<f32>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<Point> for Point2D<f32> {
    fn from(p: Point) -> Self {
        Point2D::new(p.x, p.y)
    }
}

/// The region of the canvas a client is looking at. `x`, `y`, `width` and
/// `height` are in canvas coordinates; `scale` is the client's zoom factor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub scale: f32,
}

impl Viewport {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
            scale: 1.0,
        }
    }

    pub fn rect(&self) -> Bounds {
        rect(self.x, self.y, self.width, self.height)
    }

    pub fn is_valid(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite()
            && self.scale.is_finite()
            && self.width >= 0.0
            && self.height >= 0.0
            && self.scale > 0.0
    }
}

/// Narrow capability the store and the culler need from anything they index.
pub trait HasBounds {
    fn bounds(&self) -> Bounds;
}

pub fn rect(x: f32, y: f32, width: f32, height: f32) -> Bounds {
    Box2D::new(Point2D::new(x, y), Point2D::new(x + width, y + height))
}

/// Grows `bounds` on every side by `ratio` of its own width and height.
pub fn expand(bounds: &Bounds, ratio: f32) -> Bounds {
    if ratio <= 0.0 {
        return *bounds;
    }
    bounds.inflate(bounds.width() * ratio, bounds.height() * ratio)
}

/// Inclusive overlap test; bounds that share an edge intersect.
pub fn intersects(a: &Bounds, b: &Bounds) -> bool {
    a.min.x <= b.max.x && a.max.x >= b.min.x && a.min.y <= b.max.y && a.max.y >= b.min.y
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_expands_by_ratio_of_each_dimension() {
        let expanded = expand(&rect(0.0, 0.0, 100.0, 50.0), 0.2);
        assert_eq!(expanded.min, Point2D::new(-20.0, -10.0));
        assert_eq!(expanded.max, Point2D::new(120.0, 60.0));
    }

    #[test]
    fn it_treats_touching_edges_as_intersecting() {
        let a = rect(0.0, 0.0, 10.0, 10.0);
        assert!(intersects(&a, &rect(10.0, 0.0, 5.0, 5.0)));
        assert!(!intersects(&a, &rect(10.5, 0.0, 5.0, 5.0)));
    }

    #[test]
    fn it_rejects_degenerate_viewports() {
        assert!(Viewport::new(0.0, 0.0, 10.0, 10.0).is_valid());
        assert!(!Viewport::new(0.0, 0.0, -1.0, 10.0).is_valid());
        assert!(!Viewport::new(f32::NAN, 0.0, 1.0, 10.0).is_valid());
    }
}
