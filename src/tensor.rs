//! Shape-checked views over caller-owned buffers.
//!
//! Every operator tensor is a flat, contiguous buffer addressed as
//! `[batch, row, col]`: positions are `B×N×D`, per-point data `B×N×C`,
//! index tables `B×N×1`. The library only borrows these buffers for the
//! duration of a call.

use crate::error::{Result, SpnError};

/// An immutable `[batch, rows, cols]` view over a flat buffer.
#[derive(Debug)]
pub struct BatchView<'a, T> {
    data: &'a [T],
    batch: usize,
    rows: usize,
    cols: usize,
}

impl<T> Clone for BatchView<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for BatchView<'_, T> {}

impl<'a, T> BatchView<'a, T> {
    /// Wraps `data` as a `batch × rows × cols` tensor.
    ///
    /// # Errors
    /// Returns `InvalidShape` if `data.len() != batch * rows * cols`.
    pub fn new(data: &'a [T], batch: usize, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != batch * rows * cols {
            return Err(SpnError::shape(
                "view",
                format!("{} elements ({}x{}x{})", batch * rows * cols, batch, rows, cols),
                format!("{} elements", data.len()),
            ));
        }
        Ok(Self {
            data,
            batch,
            rows,
            cols,
        })
    }

    /// Batch size.
    #[inline]
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Rows per batch element (points, queries, ...).
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Columns per row (dimensions, channels, ...).
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// The whole underlying buffer.
    #[inline]
    pub fn as_slice(&self) -> &'a [T] {
        self.data
    }

    /// Row `i` of batch element `b`.
    #[inline]
    pub fn row(&self, b: usize, i: usize) -> &'a [T] {
        let start = (b * self.rows + i) * self.cols;
        &self.data[start..start + self.cols]
    }

    /// All rows of batch element `b`.
    #[inline]
    pub fn batch_slice(&self, b: usize) -> &'a [T] {
        let stride = self.rows * self.cols;
        &self.data[b * stride..(b + 1) * stride]
    }

    /// Checks this view against an expected shape. `None` leaves a dimension free.
    pub fn expect_shape(
        &self,
        name: &'static str,
        batch: Option<usize>,
        rows: Option<usize>,
        cols: Option<usize>,
    ) -> Result<()> {
        check_shape(name, (self.batch, self.rows, self.cols), batch, rows, cols)
    }
}

/// A mutable `[batch, rows, cols]` view over a flat buffer.
#[derive(Debug)]
pub struct BatchViewMut<'a, T> {
    data: &'a mut [T],
    batch: usize,
    rows: usize,
    cols: usize,
}

impl<'a, T> BatchViewMut<'a, T> {
    /// Wraps `data` as a mutable `batch × rows × cols` tensor.
    ///
    /// # Errors
    /// Returns `InvalidShape` if `data.len() != batch * rows * cols`.
    pub fn new(data: &'a mut [T], batch: usize, rows: usize, cols: usize) -> Result<Self> {
        if data.len() != batch * rows * cols {
            return Err(SpnError::shape(
                "view",
                format!("{} elements ({}x{}x{})", batch * rows * cols, batch, rows, cols),
                format!("{} elements", data.len()),
            ));
        }
        Ok(Self {
            data,
            batch,
            rows,
            cols,
        })
    }

    /// Batch size.
    #[inline]
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Rows per batch element.
    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Columns per row.
    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// The whole underlying buffer.
    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &*self.data
    }

    /// The whole underlying buffer, mutably.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut *self.data
    }

    /// Reborrows as an immutable view.
    #[inline]
    pub fn view(&self) -> BatchView<'_, T> {
        BatchView {
            data: &*self.data,
            batch: self.batch,
            rows: self.rows,
            cols: self.cols,
        }
    }

    /// Checks this view against an expected shape. `None` leaves a dimension free.
    pub fn expect_shape(
        &self,
        name: &'static str,
        batch: Option<usize>,
        rows: Option<usize>,
        cols: Option<usize>,
    ) -> Result<()> {
        check_shape(name, (self.batch, self.rows, self.cols), batch, rows, cols)
    }
}

fn check_shape(
    name: &'static str,
    actual: (usize, usize, usize),
    batch: Option<usize>,
    rows: Option<usize>,
    cols: Option<usize>,
) -> Result<()> {
    let matches = batch.map_or(true, |b| b == actual.0)
        && rows.map_or(true, |r| r == actual.1)
        && cols.map_or(true, |c| c == actual.2);
    if matches {
        return Ok(());
    }
    let fmt = |d: Option<usize>| d.map_or_else(|| "*".to_string(), |v| v.to_string());
    Err(SpnError::shape(
        name,
        format!("{}x{}x{}", fmt(batch), fmt(rows), fmt(cols)),
        format!("{}x{}x{}", actual.0, actual.1, actual.2),
    ))
}
