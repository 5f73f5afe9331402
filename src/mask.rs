// Rounded-corner mask
// Hit region and paint clip for the overlay silhouette

/// Corner radius of the overlay in surface units
pub const CORNER_RADIUS: i32 = 20;

/// Axis-aligned rectangle, used to build compositor input regions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaskRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Rounded rectangle rasterised into one horizontal span per row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundedMask {
    width: i32,
    height: i32,
    radius: i32,
    /// Left inset of each row, the right inset mirrors it
    insets: Vec<i32>,
}

impl RoundedMask {
    pub fn new(width: i32, height: i32, radius: i32) -> Self {
        let width = width.max(0);
        let height = height.max(0);
        let radius = radius.clamp(0, width.min(height) / 2);
        let insets = (0..height)
            .map(|row| row_inset(row, height, radius))
            .collect();
        Self {
            width,
            height,
            radius,
            insets,
        }
    }

    pub fn for_size(width: i32, height: i32) -> Self {
        Self::new(width, height, CORNER_RADIUS)
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    pub fn radius(&self) -> i32 {
        self.radius
    }

    /// Covered `[start, end)` columns of a row
    pub fn span(&self, row: i32) -> Option<(i32, i32)> {
        let inset = *self.insets.get(usize::try_from(row).ok()?)?;
        let end = self.width - inset;
        (inset < end).then_some((inset, end))
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.span(y)
            .is_some_and(|(start, end)| (start..end).contains(&x))
    }

    /// Smallest rectangle covering every masked pixel
    pub fn bounding_box(&self) -> Option<MaskRect> {
        let mut rows = (0..self.height).filter_map(|row| self.span(row).map(|span| (row, span)));
        let (first_row, (mut left, mut right)) = rows.next()?;
        let mut last_row = first_row;
        for (row, (start, end)) in rows {
            left = left.min(start);
            right = right.max(end);
            last_row = row;
        }
        Some(MaskRect {
            x: left,
            y: first_row,
            width: right - left,
            height: last_row - first_row + 1,
        })
    }

    /// Rows with identical spans merged into rectangles
    pub fn rects(&self) -> Vec<MaskRect> {
        let mut rects: Vec<MaskRect> = Vec::new();
        for row in 0..self.height {
            let Some((start, end)) = self.span(row) else {
                continue;
            };
            match rects.last_mut() {
                Some(last)
                    if last.x == start
                        && last.width == end - start
                        && last.y + last.height == row =>
                {
                    last.height += 1;
                }
                _ => rects.push(MaskRect {
                    x: start,
                    y: row,
                    width: end - start,
                    height: 1,
                }),
            }
        }
        rects
    }
}

/// Horizontal inset of `row`, measured at the pixel row center against the
/// corner arc
fn row_inset(row: i32, height: i32, radius: i32) -> i32 {
    if radius == 0 {
        return 0;
    }
    let distance_from_edge = row.min(height - 1 - row);
    if distance_from_edge >= radius {
        return 0;
    }
    let r = radius as f32;
    let dy = r - (distance_from_edge as f32 + 0.5);
    let dx = (r * r - dy * dy).max(0.0).sqrt();
    (r - dx).round() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_box_matches_window_size() {
        let mask = RoundedMask::for_size(200, 100);
        assert_eq!(
            mask.bounding_box(),
            Some(MaskRect {
                x: 0,
                y: 0,
                width: 200,
                height: 100
            })
        );
    }

    #[test]
    fn corner_squares_outside_the_arc_are_excluded() {
        let (width, height, radius) = (200, 100, 20);
        let mask = RoundedMask::new(width, height, radius);
        let r = radius as f32;

        // pixel centers relative to each corner's arc center
        for y in 0..radius {
            for x in 0..radius {
                let dx = r - (x as f32 + 0.5);
                let dy = r - (y as f32 + 0.5);
                let distance = (dx * dx + dy * dy).sqrt();
                let corners = [
                    (x, y),
                    (width - 1 - x, y),
                    (x, height - 1 - y),
                    (width - 1 - x, height - 1 - y),
                ];
                for (cx, cy) in corners {
                    if distance > r + 1.0 {
                        assert!(!mask.contains(cx, cy), "({cx},{cy}) lies outside the arc");
                    }
                    if distance < r - 1.0 {
                        assert!(mask.contains(cx, cy), "({cx},{cy}) lies inside the arc");
                    }
                }
            }
        }
        assert!(!mask.contains(0, 0));
        assert!(!mask.contains(199, 99));
        assert!(mask.contains(100, 0));
        assert!(mask.contains(0, 50));
    }

    #[test]
    fn rects_cover_exactly_the_masked_pixels() {
        let mask = RoundedMask::for_size(64, 48);
        let rects = mask.rects();
        for y in 0..48 {
            for x in 0..64 {
                let in_rects = rects
                    .iter()
                    .any(|r| x >= r.x && x < r.x + r.width && y >= r.y && y < r.y + r.height);
                assert_eq!(in_rects, mask.contains(x, y), "mismatch at ({x},{y})");
            }
        }
        // the straight middle section collapses into one rectangle
        assert!(rects
            .iter()
            .any(|r| r.x == 0 && r.width == 64 && r.height >= 48 - 2 * CORNER_RADIUS));
    }

    #[test]
    fn radius_is_clamped_for_small_windows() {
        let mask = RoundedMask::for_size(10, 30);
        assert_eq!(mask.radius(), 5);
        assert!(mask.contains(5, 15));
        assert_eq!(RoundedMask::for_size(0, 0).bounding_box(), None);
    }
}
