//! Drawing operations: the unit of ordering inside a room.
//!
//! Every operation is created once by the participant that drew it, stamped
//! with a `sequence_no` by the room registry, and never mutated afterwards.
//!
//! ```text
//! ┌──────────┬───────────┬─────────────┬───────────┬──────────────────┐
//! │ op_id    │ origin_id │ sequence_no │ timestamp │ kind             │
//! │ 16 bytes │ 16 bytes  │ varint      │ varint    │ tag + fields     │
//! └──────────┴───────────┴─────────────┴───────────┴──────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::codec::CodecError;

/// Identity of an operation. For additive operations this is also the
/// identity of the drawn object, which is what `ObjectRemoved` targets.
pub type OpId = Uuid;

/// Process-unique participant identity, assigned by the registry on join.
pub type ParticipantId = Uuid;

/// Per-room ordering key. Assigned values start at 1.
pub type SequenceNo = u64;

/// Sentinel for an operation that has not been committed yet.
pub const UNASSIGNED: SequenceNo = 0;

/// 2D point in canvas coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Axis-aligned bounding box of a shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Bounds {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self { x, y, width, height }
    }
}

/// Visual attributes shared by strokes and shapes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Style {
    /// Stroke color, e.g. `#000000`.
    pub color: String,
    /// Brush width in canvas units.
    pub width: f32,
    /// Fill color for closed shapes.
    pub fill: Option<String>,
}

impl Style {
    pub fn stroke(color: impl Into<String>, width: f32) -> Self {
        Self {
            color: color.into(),
            width,
            fill: None,
        }
    }

    pub fn filled(color: impl Into<String>) -> Self {
        let color = color.into();
        Self {
            fill: Some(color.clone()),
            color,
            width: 1.0,
        }
    }
}

impl Default for Style {
    fn default() -> Self {
        Self::stroke("#000000", 2.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShapeKind {
    Rectangle,
    Circle,
}

/// What an operation does to the canvas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OperationKind {
    /// A freehand path.
    StrokeAdded { path: Vec<Point>, style: Style },
    ShapeAdded {
        shape: ShapeKind,
        bounds: Bounds,
        style: Style,
    },
    /// Removes the object drawn by the operation `target`. Emitted by undo.
    ObjectRemoved { target: OpId },
    /// Invalidates everything committed before it.
    CanvasCleared { generation: u64 },
}

impl OperationKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::StrokeAdded { .. } => "stroke-added",
            OperationKind::ShapeAdded { .. } => "shape-added",
            OperationKind::ObjectRemoved { .. } => "object-removed",
            OperationKind::CanvasCleared { .. } => "canvas-cleared",
        }
    }

    /// Whether applying this operation adds an object to the canvas.
    pub fn is_additive(&self) -> bool {
        matches!(
            self,
            OperationKind::StrokeAdded { .. } | OperationKind::ShapeAdded { .. }
        )
    }
}

/// A single logical drawing or control action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub op_id: OpId,
    pub origin_id: ParticipantId,
    /// Ordering authority. `UNASSIGNED` until the registry commits it.
    pub sequence_no: SequenceNo,
    /// Wall clock in milliseconds. Advisory only, never used for ordering.
    pub timestamp: u64,
    pub kind: OperationKind,
}

impl Operation {
    /// A freshly captured operation with a new identity and no origin yet.
    pub fn draft(kind: OperationKind) -> Self {
        Self {
            op_id: Uuid::new_v4(),
            origin_id: Uuid::nil(),
            sequence_no: UNASSIGNED,
            timestamp: now_millis(),
            kind,
        }
    }

    pub fn stroke(path: Vec<Point>, style: Style) -> Self {
        Self::draft(OperationKind::StrokeAdded { path, style })
    }

    pub fn shape(shape: ShapeKind, bounds: Bounds, style: Style) -> Self {
        Self::draft(OperationKind::ShapeAdded {
            shape,
            bounds,
            style,
        })
    }

    pub fn is_committed(&self) -> bool {
        self.sequence_no != UNASSIGNED
    }

    /// Structural checks a decoded payload must pass before anyone applies it.
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.op_id.is_nil() {
            return Err(malformed("operation id is nil"));
        }
        match &self.kind {
            OperationKind::StrokeAdded { path, style } => {
                if path.is_empty() {
                    return Err(malformed("stroke path has no points"));
                }
                if !path.iter().all(Point::is_finite) {
                    return Err(malformed("stroke path has a non-finite point"));
                }
                validate_style(style)
            }
            OperationKind::ShapeAdded { bounds, style, .. } => {
                let finite = [bounds.x, bounds.y, bounds.width, bounds.height]
                    .iter()
                    .all(|v| v.is_finite());
                if !finite {
                    return Err(malformed("shape bounds are not finite"));
                }
                if bounds.width < 0.0 || bounds.height < 0.0 {
                    return Err(malformed("shape bounds are negative"));
                }
                validate_style(style)
            }
            OperationKind::ObjectRemoved { target } => {
                if target.is_nil() {
                    return Err(malformed("removal target is nil"));
                }
                Ok(())
            }
            OperationKind::CanvasCleared { .. } => Ok(()),
        }
    }
}

fn validate_style(style: &Style) -> Result<(), CodecError> {
    if style.color.trim().is_empty() {
        return Err(malformed("style color is empty"));
    }
    if !style.width.is_finite() || style.width <= 0.0 {
        return Err(malformed("style width must be positive"));
    }
    if matches!(&style.fill, Some(fill) if fill.trim().is_empty()) {
        return Err(malformed("style fill is empty"));
    }
    Ok(())
}

fn malformed(reason: &str) -> CodecError {
    CodecError::MalformedOperation(reason.to_string())
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line() -> Vec<Point> {
        vec![Point::new(0.0, 0.0), Point::new(10.0, 5.0)]
    }

    #[test]
    fn test_draft_is_uncommitted() {
        let op = Operation::stroke(line(), Style::default());
        assert!(!op.is_committed());
        assert!(op.origin_id.is_nil());
        assert!(!op.op_id.is_nil());
        assert!(op.timestamp > 0);
    }

    #[test]
    fn test_drafts_have_distinct_ids() {
        let a = Operation::stroke(line(), Style::default());
        let b = Operation::stroke(line(), Style::default());
        assert_ne!(a.op_id, b.op_id);
    }

    #[test]
    fn test_validate_accepts_every_kind() {
        let ops = [
            Operation::stroke(line(), Style::default()),
            Operation::shape(
                ShapeKind::Circle,
                Bounds::new(100.0, 100.0, 100.0, 100.0),
                Style::filled("#ff0000"),
            ),
            Operation::draft(OperationKind::ObjectRemoved {
                target: Uuid::new_v4(),
            }),
            Operation::draft(OperationKind::CanvasCleared { generation: 1 }),
        ];
        for op in &ops {
            assert!(op.validate().is_ok(), "{} should be valid", op.kind.name());
        }
    }

    #[test]
    fn test_validate_rejects_empty_path() {
        let op = Operation::stroke(Vec::new(), Style::default());
        assert!(matches!(op.validate(), Err(CodecError::MalformedOperation(_))));
    }

    #[test]
    fn test_validate_rejects_nan_point() {
        let op = Operation::stroke(vec![Point::new(f32::NAN, 1.0)], Style::default());
        assert!(op.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_negative_bounds() {
        let op = Operation::shape(
            ShapeKind::Rectangle,
            Bounds::new(0.0, 0.0, -1.0, 4.0),
            Style::default(),
        );
        assert!(op.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_style() {
        let op = Operation::stroke(line(), Style::stroke("", 2.0));
        assert!(op.validate().is_err());

        let op = Operation::stroke(line(), Style::stroke("#000000", 0.0));
        assert!(op.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_nil_identities() {
        let mut op = Operation::stroke(line(), Style::default());
        op.op_id = Uuid::nil();
        assert!(op.validate().is_err());

        let op = Operation::draft(OperationKind::ObjectRemoved {
            target: Uuid::nil(),
        });
        assert!(op.validate().is_err());
    }

    #[test]
    fn test_additive_kinds() {
        assert!(OperationKind::StrokeAdded {
            path: line(),
            style: Style::default()
        }
        .is_additive());
        assert!(!OperationKind::CanvasCleared { generation: 0 }.is_additive());
        assert!(!OperationKind::ObjectRemoved {
            target: Uuid::new_v4()
        }
        .is_additive());
    }
}
