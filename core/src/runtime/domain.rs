use anyhow::{anyhow, Result};

/// Inclusive box `[lo, hi]` in an N-dimensional integer space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rect {
    pub lo: Vec<i64>,
    pub hi: Vec<i64>,
}

impl Rect {
    pub fn new(lo: Vec<i64>, hi: Vec<i64>) -> Self {
        Self { lo, hi }
    }

    /// `[0, size - 1]` along every axis.
    pub fn from_sizes(sizes: &[usize]) -> Self {
        Self {
            lo: vec![0; sizes.len()],
            hi: sizes.iter().map(|s| *s as i64 - 1).collect(),
        }
    }

    pub fn dim(&self) -> usize {
        self.lo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lo.iter().zip(self.hi.iter()).any(|(lo, hi)| hi < lo)
    }

    pub fn extents(&self) -> Vec<usize> {
        self.lo
            .iter()
            .zip(self.hi.iter())
            .map(|(lo, hi)| if hi < lo { 0 } else { (hi - lo + 1) as usize })
            .collect()
    }

    pub fn volume(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        self.extents().iter().map(|e| *e as u64).product()
    }

    pub fn intersection(&self, other: &Rect) -> Rect {
        let lo = self
            .lo
            .iter()
            .zip(other.lo.iter())
            .map(|(a, b)| *a.max(b))
            .collect();
        let hi = self
            .hi
            .iter()
            .zip(other.hi.iter())
            .map(|(a, b)| *a.min(b))
            .collect();
        Rect { lo, hi }
    }

    pub fn overlaps(&self, other: &Rect) -> bool {
        !self.is_empty() && !other.is_empty() && !self.intersection(other).is_empty()
    }

    pub fn contains_point(&self, p: &[i64]) -> bool {
        p.len() == self.dim()
            && p
                .iter()
                .zip(self.lo.iter().zip(self.hi.iter()))
                .all(|(x, (lo, hi))| x >= lo && x <= hi)
    }

    /// Every point of the box, last axis varying slowest.
    pub fn points(&self) -> Vec<Vec<i64>> {
        if self.is_empty() {
            return Vec::new();
        }
        let mut points = Vec::with_capacity(self.volume() as usize);
        let mut cur = self.lo.clone();
        loop {
            points.push(cur.clone());
            let mut axis = 0;
            loop {
                if axis == cur.len() {
                    return points;
                }
                if cur[axis] < self.hi[axis] {
                    cur[axis] += 1;
                    break;
                }
                cur[axis] = self.lo[axis];
                axis += 1;
            }
        }
    }
}

/// Maps a color point of rank `cols` to an offset in a space of rank `rows`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    rows: usize,
    cols: usize,
    m: Vec<i64>,
}

impl Transform {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            m: vec![0; rows * cols],
        }
    }
    pub fn rows(&self) -> usize {
        self.rows
    }
    pub fn cols(&self) -> usize {
        self.cols
    }
    pub fn get(&self, i: usize, j: usize) -> i64 {
        self.m[i * self.cols + j]
    }
    pub fn set(&mut self, i: usize, j: usize, v: i64) {
        self.m[i * self.cols + j] = v;
    }
    pub fn apply(&self, color: &[i64]) -> Result<Vec<i64>> {
        if color.len() != self.cols {
            return Err(anyhow!(
                "color rank {} does not match transform columns {}",
                color.len(),
                self.cols
            ));
        }
        Ok((0..self.rows)
            .map(|i| (0..self.cols).map(|j| self.get(i, j) * color[j]).sum())
            .collect())
    }
}

#[test]
fn test_rect_ops() -> anyhow::Result<()> {
    let r = Rect::from_sizes(&[4, 3]);
    assert_eq!(r.volume(), 12);
    assert_eq!(r.points().len(), 12);
    assert_eq!(r.points()[1], vec![1, 0]);
    let s = Rect::new(vec![2, 2], vec![6, 6]);
    assert_eq!(r.intersection(&s), Rect::new(vec![2, 2], vec![3, 2]));
    assert!(r.overlaps(&s));
    let t = Rect::new(vec![4, 0], vec![5, 2]);
    assert!(!r.overlaps(&t));
    assert!(Rect::new(vec![1], vec![0]).is_empty());
    Ok(())
}

#[test]
fn test_transform_apply() -> anyhow::Result<()> {
    let mut t = Transform::zeros(2, 1);
    t.set(1, 0, 16);
    assert_eq!(t.apply(&[3])?, vec![0, 48]);
    assert!(t.apply(&[1, 1]).is_err());
    Ok(())
}
