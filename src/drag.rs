// Drag-to-move handling
// Repositions the window under the pointer while move mode is on

use crate::geometry::Point;

#[derive(Debug, Clone, Default)]
pub struct DragController {
    /// Pointer position relative to the window's top-left corner at press time
    grab_offset: Option<Point>,
}

impl DragController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn press(&mut self, move_mode: bool, pointer: Point, window_top_left: Point) {
        if !move_mode {
            return;
        }
        self.grab_offset = Some(pointer - window_top_left);
    }

    /// New top-left corner for the window, if it has to move
    pub fn motion(&mut self, move_mode: bool, primary_held: bool, pointer: Point) -> Option<Point> {
        if !move_mode || !primary_held {
            return None;
        }
        self.grab_offset.map(|offset| pointer - offset)
    }

    /// Returns whether a drag was in progress
    pub fn release(&mut self) -> bool {
        self.grab_offset.take().is_some()
    }
}
