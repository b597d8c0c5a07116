use crate::error::MutationError;
use crate::geometry::{rect, Bounds, HasBounds, Point};
use crate::types::{Color, ShapeId, Timestamp};
use euclid::default::{Box2D, Point2D};
use serde::{Deserialize, Serialize};

pub const MAX_SHAPE_ID_LEN: usize = 128;

/// Geometry and props of a single canvas element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeKind {
    Rectangle {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        fill: Option<Color>,
        corner_radius: f32,
    },
    Ellipse {
        cx: f32,
        cy: f32,
        rx: f32,
        ry: f32,
        fill: Option<Color>,
    },
    Path {
        points: Vec<Point>,
        stroke: Option<Color>,
        stroke_width: f32,
        closed: bool,
    },
    Text {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        content: String,
        font_size: f32,
    },
    Image {
        x: f32,
        y: f32,
        width: f32,
        height: f32,
        src: String,
    },
}

impl ShapeKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rectangle { .. } => "rectangle",
            Self::Ellipse { .. } => "ellipse",
            Self::Path { .. } => "path",
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
        }
    }

    pub fn validate(&self) -> Result<(), MutationError> {
        let name = self.name();
        let finite = |values: &[f32]| {
            if values.iter().all(|v| v.is_finite()) {
                Ok(())
            } else {
                Err(MutationError::NonFinite(name))
            }
        };
        let non_negative = |values: &[f32]| {
            if values.iter().all(|v| *v >= 0.0) {
                Ok(())
            } else {
                Err(MutationError::NegativeSize(name))
            }
        };

        match self {
            Self::Rectangle {
                x,
                y,
                width,
                height,
                corner_radius,
                ..
            } => {
                finite(&[*x, *y, *width, *height, *corner_radius])?;
                non_negative(&[*width, *height, *corner_radius])
            }
            Self::Ellipse { cx, cy, rx, ry, .. } => {
                finite(&[*cx, *cy, *rx, *ry])?;
                non_negative(&[*rx, *ry])
            }
            Self::Path {
                points,
                stroke_width,
                ..
            } => {
                if points.is_empty() {
                    return Err(MutationError::EmptyPath);
                }
                if !points.iter().all(Point::is_finite) {
                    return Err(MutationError::NonFinite(name));
                }
                finite(&[*stroke_width])?;
                non_negative(&[*stroke_width])
            }
            Self::Text {
                x,
                y,
                width,
                height,
                font_size,
                ..
            } => {
                finite(&[*x, *y, *width, *height, *font_size])?;
                non_negative(&[*width, *height, *font_size])
            }
            Self::Image {
                x,
                y,
                width,
                height,
                ..
            } => {
                finite(&[*x, *y, *width, *height])?;
                non_negative(&[*width, *height])
            }
        }
    }
}

impl HasBounds for ShapeKind {
    fn bounds(&self) -> Bounds {
        match self {
            Self::Rectangle {
                x,
                y,
                width,
                height,
                ..
            }
            | Self::Text {
                x,
                y,
                width,
                height,
                ..
            }
            | Self::Image {
                x,
                y,
                width,
                height,
                ..
            } => rect(*x, *y, *width, *height),
            Self::Ellipse { cx, cy, rx, ry, .. } => {
                rect(cx - rx, cy - ry, rx * 2.0, ry * 2.0)
            }
            Self::Path {
                points,
                stroke_width,
                ..
            } => {
                let bounds = Box2D::from_points(points.iter().map(|p| Point2D::from(*p)));
                let half = stroke_width / 2.0;
                bounds.inflate(half, half)
            }
        }
    }
}

/// A canvas element as the session knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub id: ShapeId,
    pub kind: ShapeKind,
    pub version: u64,
    pub updated_at: Timestamp,
    pub deleted: bool,
}

impl HasBounds for Shape {
    fn bounds(&self) -> Bounds {
        self.kind.bounds()
    }
}

/// What a client submits when it creates or edits a shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapeDraft {
    pub id: ShapeId,
    pub kind: ShapeKind,
    /// Version of the shape the client edited on top of, if it had one.
    #[serde(default)]
    pub base_version: Option<u64>,
}

impl ShapeDraft {
    pub fn validate(&self) -> Result<(), MutationError> {
        validate_shape_id(&self.id)?;
        self.kind.validate()
    }
}

pub fn validate_shape_id(id: &str) -> Result<(), MutationError> {
    if id.is_empty() {
        Err(MutationError::EmptyShapeId)
    } else if id.len() > MAX_SHAPE_ID_LEN {
        Err(MutationError::ShapeIdTooLong(MAX_SHAPE_ID_LEN))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_computes_bounds_per_kind() {
        let ellipse = ShapeKind::Ellipse {
            cx: 10.0,
            cy: 20.0,
            rx: 5.0,
            ry: 2.0,
            fill: None,
        };
        assert_eq!(ellipse.bounds(), rect(5.0, 18.0, 10.0, 4.0));

        let path = ShapeKind::Path {
            points: vec![Point::new(0.0, 0.0), Point::new(10.0, 4.0)],
            stroke: None,
            stroke_width: 2.0,
            closed: false,
        };
        assert_eq!(path.bounds(), rect(-1.0, -1.0, 12.0, 6.0));
    }

    #[test]
    fn it_rejects_malformed_geometry() {
        let negative = ShapeKind::Rectangle {
            x: 0.0,
            y: 0.0,
            width: -3.0,
            height: 1.0,
            fill: None,
            corner_radius: 0.0,
        };
        assert_eq!(
            negative.validate(),
            Err(MutationError::NegativeSize("rectangle"))
        );

        let empty_path = ShapeKind::Path {
            points: vec![],
            stroke: None,
            stroke_width: 1.0,
            closed: false,
        };
        assert_eq!(empty_path.validate(), Err(MutationError::EmptyPath));

        let draft = ShapeDraft {
            id: String::new(),
            kind: ShapeKind::Image {
                x: 0.0,
                y: 0.0,
                width: 1.0,
                height: 1.0,
                src: "a.png".into(),
            },
            base_version: None,
        };
        assert_eq!(draft.validate(), Err(MutationError::EmptyShapeId));
    }
}
