use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

/// Axis-aligned rectangle in capture pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: u32,
    pub h: u32,
}

impl Rect {
    pub fn new(x: i32, y: i32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    pub fn right(&self) -> i32 {
        self.x.saturating_add(self.w as i32)
    }

    pub fn bottom(&self) -> i32 {
        self.y.saturating_add(self.h as i32)
    }

    pub fn center(&self) -> Point {
        Point {
            x: self.x.saturating_add((self.w / 2) as i32),
            y: self.y.saturating_add((self.h / 2) as i32),
        }
    }

    pub fn contains(&self, p: Point) -> bool {
        p.x >= self.x && p.x < self.right() && p.y >= self.y && p.y < self.bottom()
    }

    pub fn overlaps(&self, other: &Rect) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// Clips to the pixel bounds of a `w` x `h` capture. Returns `None` when
    /// nothing of the rectangle lies inside the bounds.
    pub fn clamp_to_bounds(&self, w: u32, h: u32) -> Option<Rect> {
        let x0 = self.x.max(0);
        let y0 = self.y.max(0);
        let x1 = self.right().min(w as i32);
        let y1 = self.bottom().min(h as i32);
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect {
            x: x0,
            y: y0,
            w: (x1 - x0) as u32,
            h: (y1 - y0) as u32,
        })
    }

    pub fn inflate(&self, px: u32) -> Rect {
        Rect {
            x: self.x.saturating_sub(px as i32),
            y: self.y.saturating_sub(px as i32),
            w: self.w.saturating_add(px * 2),
            h: self.h.saturating_add(px * 2),
        }
    }
}

/// Reading order: top-to-bottom, then left-to-right. Used as the fusion
/// tie-break when several text blocks overlap one element.
pub fn reading_order(a: &Rect, b: &Rect) -> Ordering {
    a.y.cmp(&b.y).then(a.x.cmp(&b.x))
}

pub fn center_distance_sq(a: &Rect, b: &Rect) -> i64 {
    let ca = a.center();
    let cb = b.center();
    let dx = (ca.x - cb.x) as i64;
    let dy = (ca.y - cb.y) as i64;
    dx * dx + dy * dy
}
