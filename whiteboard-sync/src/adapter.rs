//! Boundary to the drawing surface.
//!
//! The synchronization core never renders. It talks to whatever draws
//! through [`CanvasAdapter`]: remote operations go in through
//! `apply_remote`, locally drawn ones come out of the stream returned by
//! `capture_local`.
//!
//! [`InMemoryCanvas`] is the reference adapter used by tests and headless
//! clients. It keeps the visible objects as an ordered list of the operations
//! that drew them.

use log::debug;
use tokio::sync::mpsc;

use crate::operation::{
    Bounds, OpId, Operation, OperationKind, Point, ShapeKind, Style,
};

/// Contract between a session and a drawing surface.
pub trait CanvasAdapter: Send {
    /// Apply an operation drawn by someone else.
    ///
    /// Must be idempotent: an additive operation whose `op_id` is already on
    /// the canvas is ignored, and removing an absent object does nothing.
    fn apply_remote(&mut self, op: &Operation);

    /// Optimistic local echo of an operation captured on this surface.
    /// Surfaces that already show what the user drew can ignore it.
    fn apply_local(&mut self, op: &Operation) {
        let _ = op;
    }

    fn clear_local(&mut self);

    /// Remove the most recently added object and return the operation that
    /// drew it.
    fn remove_last(&mut self) -> Option<Operation>;

    /// Hand out the stream of locally drawn operations. Yields `Some` once.
    fn capture_local(&mut self) -> Option<CaptureStream>;
}

/// Locally drawn operations, in capture order.
#[derive(Debug)]
pub struct CaptureStream {
    receiver: mpsc::UnboundedReceiver<Operation>,
}

impl CaptureStream {
    /// Next captured operation, or `None` once every pen is gone.
    pub async fn next(&mut self) -> Option<Operation> {
        self.receiver.recv().await
    }
}

/// Input handle for a surface: everything drawn through it shows up on the
/// capture stream.
#[derive(Debug, Clone)]
pub struct LocalPen {
    sender: mpsc::UnboundedSender<Operation>,
}

impl LocalPen {
    /// Finish a freehand stroke.
    pub fn stroke(&self, path: Vec<Point>, style: Style) -> OpId {
        self.draw(Operation::stroke(path, style))
    }

    pub fn shape(&self, shape: ShapeKind, bounds: Bounds, style: Style) -> OpId {
        self.draw(Operation::shape(shape, bounds, style))
    }

    /// A 100x100 rectangle at (100, 100).
    pub fn default_rectangle(&self, style: Style) -> OpId {
        self.shape(
            ShapeKind::Rectangle,
            Bounds::new(100.0, 100.0, 100.0, 100.0),
            style,
        )
    }

    /// A circle of radius 50 with its bounding box at (100, 100).
    pub fn default_circle(&self, style: Style) -> OpId {
        self.shape(
            ShapeKind::Circle,
            Bounds::new(100.0, 100.0, 100.0, 100.0),
            style,
        )
    }

    pub fn draw(&self, op: Operation) -> OpId {
        let id = op.op_id;
        if self.sender.send(op).is_err() {
            debug!("capture stream dropped, discarding operation {id}");
        }
        id
    }
}

/// Headless reference surface.
#[derive(Debug)]
pub struct InMemoryCanvas {
    objects: Vec<Operation>,
    pen: LocalPen,
    capture: Option<CaptureStream>,
}

impl InMemoryCanvas {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            objects: Vec::new(),
            pen: LocalPen { sender },
            capture: Some(CaptureStream { receiver }),
        }
    }

    pub fn pen(&self) -> LocalPen {
        self.pen.clone()
    }

    /// Visible objects, oldest first.
    pub fn objects(&self) -> &[Operation] {
        &self.objects
    }

    pub fn object_ids(&self) -> Vec<OpId> {
        self.objects.iter().map(|o| o.op_id).collect()
    }

    pub fn contains(&self, id: &OpId) -> bool {
        self.objects.iter().any(|o| o.op_id == *id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn apply(&mut self, op: &Operation) {
        match &op.kind {
            OperationKind::StrokeAdded { .. } | OperationKind::ShapeAdded { .. } => {
                if !self.contains(&op.op_id) {
                    self.objects.push(op.clone());
                }
            }
            OperationKind::ObjectRemoved { target } => {
                self.objects.retain(|o| o.op_id != *target);
            }
            OperationKind::CanvasCleared { .. } => self.objects.clear(),
        }
    }
}

impl Default for InMemoryCanvas {
    fn default() -> Self {
        Self::new()
    }
}

impl CanvasAdapter for InMemoryCanvas {
    fn apply_remote(&mut self, op: &Operation) {
        self.apply(op);
    }

    fn apply_local(&mut self, op: &Operation) {
        self.apply(op);
    }

    fn clear_local(&mut self) {
        self.objects.clear();
    }

    fn remove_last(&mut self) -> Option<Operation> {
        self.objects.pop()
    }

    fn capture_local(&mut self) -> Option<CaptureStream> {
        self.capture.take()
    }
}
