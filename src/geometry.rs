// Window geometry primitives
// Sizes, positions and the persisted window record

/// Largest accepted window side, mirrors the shm buffer limits of the overlay
pub const MAX_WINDOW_SIDE: i32 = 4096;

/// Width/height pair in surface units
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

impl Size {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    /// Grow both axes by the same amount
    pub const fn expanded(self, margin: i32) -> Self {
        Self {
            width: self.width + margin,
            height: self.height + margin,
        }
    }

    pub fn is_valid(self) -> bool {
        (1..=MAX_WINDOW_SIDE).contains(&self.width) && (1..=MAX_WINDOW_SIDE).contains(&self.height)
    }
}

/// Point in global (output) coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl std::ops::Sub for Point {
    type Output = Point;

    fn sub(self, rhs: Point) -> Point {
        Point::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl std::ops::Add for Point {
    type Output = Point;

    fn add(self, rhs: Point) -> Point {
        Point::new(self.x + rhs.x, self.y + rhs.y)
    }
}

/// Persisted window record: size plus top-left corner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGeometry {
    pub width: i32,
    pub height: i32,
    pub x: i32,
    pub y: i32,
}

impl WindowGeometry {
    pub const fn new(width: i32, height: i32, x: i32, y: i32) -> Self {
        Self {
            width,
            height,
            x,
            y,
        }
    }

    /// Geometry of the given size centered inside an output of `output` size
    pub fn centered(size: Size, output: Size) -> Self {
        Self::new(
            size.width,
            size.height,
            ((output.width - size.width) / 2).max(0),
            ((output.height - size.height) / 2).max(0),
        )
    }

    pub const fn size(&self) -> Size {
        Size::new(self.width, self.height)
    }

    pub const fn position(&self) -> Point {
        Point::new(self.x, self.y)
    }

    pub fn set_size(&mut self, size: Size) {
        self.width = size.width;
        self.height = size.height;
    }

    pub fn set_position(&mut self, position: Point) {
        self.x = position.x;
        self.y = position.y;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn centered_geometry_splits_remaining_space() {
        let geometry = WindowGeometry::centered(Size::new(200, 200), Size::new(1920, 1080));
        assert_eq!(geometry, WindowGeometry::new(200, 200, 860, 440));
    }

    #[test]
    fn centered_geometry_never_goes_negative() {
        let geometry = WindowGeometry::centered(Size::new(800, 800), Size::new(640, 480));
        assert_eq!(geometry.position(), Point::new(0, 0));
    }

    #[test]
    fn size_validity_rejects_zero_and_oversized_sides() {
        assert!(Size::new(1, 1).is_valid());
        assert!(Size::new(MAX_WINDOW_SIDE, 10).is_valid());
        assert!(!Size::new(0, 10).is_valid());
        assert!(!Size::new(10, -5).is_valid());
        assert!(!Size::new(MAX_WINDOW_SIDE + 1, 10).is_valid());
    }
}
