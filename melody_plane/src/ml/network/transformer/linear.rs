use std::{cell::OnceCell, iter};

use anyhow::{anyhow, Context, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::ml::{layer::LayerInitStrategy, LayerValues, NodeValue, RngStrategy};

use self::iter_ext::KnownSizeIterator;

/// Row-major matrix of `count` rows, each `stride` values wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linear {
    inner: LayerValues,
    stride: usize,
    count: usize,
}

impl Linear {
    pub fn new(count: usize, stride: usize) -> Self {
        Self::with_value(count, stride, 0.0)
    }

    pub fn with_dimensions(other: &Self) -> Self {
        Self::with_value(other.count, other.stride, 0.0)
    }

    pub fn with_value(count: usize, stride: usize, value: NodeValue) -> Self {
        Self {
            inner: LayerValues::new(vec![value; count * stride]),
            stride,
            count,
        }
    }

    /// Square mask where row `i` keeps columns `0..=i`, so position `i` only sees
    /// positions at or before itself.
    pub fn causal_mask(size: usize) -> Self {
        Self {
            inner: (0..size * size)
                .map(|idx| (idx / size, idx % size))
                .map(|(row, col)| if col <= row { 1.0 } else { 0.0 })
                .collect(),
            stride: size,
            count: size,
        }
    }

    pub fn from_iter<I: Iterator<Item = NodeValue>>(stride: usize, values: I) -> Result<Self> {
        let inner: LayerValues = values.collect();
        if stride == 0 {
            return Err(anyhow!("invalid zero stride dimension"));
        }
        let count = inner.len() / stride;

        if inner.len() != stride * count {
            Err(anyhow!("mismatched values length/stride"))?;
        }

        Ok(Self {
            inner,
            stride,
            count,
        })
    }

    pub fn zero(&mut self) {
        self.inner.iter_mut().for_each(|x| *x = 0.0);
    }

    pub fn initialize_as_layer(&mut self, strategy: &LayerInitStrategy, rng: &RngStrategy) {
        strategy.apply(self.inner.iter_mut(), iter::empty(), self.count, rng);
    }

    pub fn initialize_as_layer_bias(&mut self, strategy: &LayerInitStrategy, rng: &RngStrategy) {
        strategy.apply(iter::empty(), self.inner.iter_mut(), self.count, rng);
    }

    pub fn iter<'a>(&'a self) -> LinearIter<'a, impl Iterator<Item = NodeValue> + 'a> {
        LinearIter {
            inner: self.inner.iter().copied(),
            stride: self.stride,
            count: self.count,
            parent: Some(self),
        }
    }

    pub fn iter_transpose<'a>(&'a self) -> LinearIter<'a, impl Iterator<Item = NodeValue> + 'a> {
        let stride = self.stride;
        let count = self.count;

        let inner = (0..self.inner.len()).map(move |idx| {
            let (row, col) = (idx % count, idx / count);
            self.inner[col + row * stride]
        });
        LinearIter {
            inner,
            stride: count,
            count: stride,
            parent: None,
        }
    }

    /// Joins `self` and `rhs` side by side along the stride dimension.
    pub fn concat<'a>(&'a self, rhs: &'a Linear) -> BoxedLinearIter<'a> {
        assert_eq!(self.count, rhs.count, "mismatched count dimension");
        let self_items = self.inner.chunks_exact(self.stride);
        let rhs_items = rhs.inner.chunks_exact(rhs.stride);
        BoxedLinearIter {
            inner: Box::new(
                self_items
                    .zip(rhs_items)
                    .flat_map(|(lhs, rhs)| lhs.iter().chain(rhs).copied()),
            ),
            stride: self.stride + rhs.stride,
            count: self.count,
            parent: None,
        }
    }

    /// Cuts the stride dimension into `n` equally sized column blocks.
    pub fn split(&self, n: usize) -> Vec<Self> {
        assert_eq!(self.stride % n, 0, "mismatched dimensions");
        let stride = self.stride / n;
        (0..n)
            .map(|i| Self {
                inner: self
                    .inner
                    .chunks_exact(self.stride)
                    .flat_map(|row| row[i * stride..(i + 1) * stride].iter())
                    .copied()
                    .collect(),
                stride,
                count: self.count,
            })
            .collect()
    }

    /// Backpropagates `self` (gradients w.r.t. softmax outputs) through a row-wise softmax.
    pub fn softmax_d(&self, softmax_outputs: &Linear) -> Linear {
        assert_eq!(self.stride, softmax_outputs.stride, "mismatched stride");
        assert_eq!(self.count, softmax_outputs.count, "mismatched count");
        let inner = self
            .rows_iter()
            .zip(softmax_outputs.rows_iter())
            .flat_map(|(grads, probs)| {
                let dot = grads.iter().zip(probs).map(|(g, p)| g * p).sum::<NodeValue>();
                grads.iter().zip(probs).map(move |(g, p)| p * (g - dot))
            })
            .collect();

        Linear {
            inner,
            stride: self.stride,
            count: self.count,
        }
    }

    /// returns (Self * Rhs)
    pub fn matrix_product(&self, rhs: &Linear) -> Linear {
        assert_eq!(self.stride, rhs.count, "mismatched dimensions");
        self.iter().matrix_product_fast(rhs.iter())
    }

    /// returns (Self * Rhs.T)
    pub fn matrix_product_rhs_transposed(&self, rhs: &Linear) -> Linear {
        assert_eq!(self.stride, rhs.stride, "mismatched stride dimension");
        self.iter().matrix_transpose_product(rhs.iter())
    }

    /// returns (Self.T * Rhs)
    pub fn matrix_product_lhs_transposed(&self, rhs: &Linear) -> Linear {
        assert_eq!(self.count, rhs.count, "mismatched count dimension");
        self.iter_transpose().matrix_product_fast(rhs.iter())
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_finite(&self) -> bool {
        self.inner.iter().all(|x| x.is_finite())
    }

    pub fn rows_iter(&self) -> impl Iterator<Item = &[NodeValue]> {
        self.inner.chunks_exact(self.stride)
    }

    pub fn rows_iter_mut(&mut self) -> impl Iterator<Item = &mut [NodeValue]> {
        self.inner.chunks_exact_mut(self.stride)
    }

    pub fn row(&self, idx: usize) -> Option<&[NodeValue]> {
        self.inner.chunks_exact(self.stride).nth(idx)
    }

    pub fn values_iter(&self) -> impl Iterator<Item = (&NodeValue, usize, usize)> {
        self.inner
            .iter()
            .enumerate()
            .map(|(idx, x)| (x, idx % self.stride, idx / self.stride))
    }

    pub fn as_scalar(&self) -> Result<NodeValue> {
        if self.inner.len() == 1 {
            Ok(self.inner[0])
        } else {
            Err(anyhow!(
                "can not read value of shape = [{}, {}] as scalar",
                self.count,
                self.stride
            ))
        }
    }

    pub fn copy_stride_into(&mut self, src: &Self, src_row_idx: usize, dest_row_idx: usize) {
        assert_eq!(self.stride, src.stride, "mismatched stride dimension");
        assert!(src.count > src_row_idx, "invalid source row index");
        assert!(self.count > dest_row_idx, "invalid destination row index");
        let start = src_row_idx * self.stride;
        let src = &src.inner[start..start + self.stride];

        let start = dest_row_idx * self.stride;
        self.inner[start..start + self.stride].copy_from_slice(src);
    }

    pub fn to_sum(&self) -> NodeValue {
        self.inner.iter().sum()
    }
}

impl std::fmt::Display for Linear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.rows_iter()
            .fold(&mut f.debug_list(), |list, row| list.entry(&row))
            .finish()
    }
}

impl std::str::FromStr for Linear {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lines = s
            .lines()
            .map(|x| x.trim())
            .filter(|x| !x.is_empty())
            .collect_vec();

        let count = lines.len();
        let elements: std::result::Result<Vec<NodeValue>, _> = lines
            .into_iter()
            .flat_map(|line| line.split_whitespace().map(|x| x.parse::<NodeValue>()))
            .collect();

        let elements = elements.context("invalid numerical found")?;
        if count == 0 || elements.len() % count != 0 {
            return Err(anyhow!("mismatch row length found"));
        }

        Linear::from_iter(elements.len() / count, elements.into_iter())
    }
}

impl Default for Linear {
    fn default() -> Self {
        Self {
            inner: LayerValues::new(vec![0.0]),
            stride: 1,
            count: 1,
        }
    }
}

pub type BoxedLinearIter<'a> = LinearIter<'a, Box<dyn Iterator<Item = NodeValue> + 'a>>;

#[must_use = "linear iterators are lazy and do nothing unless consumed"]
pub struct LinearIter<'a, I> {
    inner: I,
    stride: usize,
    count: usize,
    parent: Option<&'a Linear>,
}

impl<'a, I> LinearIter<'a, I>
where
    I: Iterator<Item = NodeValue> + 'a,
{
    /// returns underlying data stride dimension size (or 'width')
    pub fn stride(&self) -> usize {
        self.stride
    }
    /// returns underlying data count dimension size (or 'height')
    pub fn count(&self) -> usize {
        self.count
    }
    /// returns owned result of (Self * Rhs), walking rhs rows contiguously
    pub fn matrix_product_fast(
        self,
        rhs: LinearIter<'a, impl Iterator<Item = NodeValue>>,
    ) -> Linear {
        let (m, k, n) = (self.count, self.stride, rhs.stride);
        assert_eq!(k, rhs.count, "mismatched stride dimension");
        let self_oc = OnceCell::new();
        let rhs_oc = OnceCell::new();
        let a = self.get_or_init_inner(&self_oc);
        let b = rhs.get_or_init_inner(&rhs_oc);

        let mut c = vec![0.0; m * n];
        if n > 0 && k > 0 {
            for (c_row, a_row) in c.chunks_exact_mut(n).zip(a.chunks_exact(k)) {
                for (&a, b_row) in a_row.iter().zip(b.chunks_exact(n)) {
                    if a == 0.0 {
                        continue;
                    }
                    for (c, &b) in c_row.iter_mut().zip(b_row) {
                        *c = a.mul_add(b, *c);
                    }
                }
            }
        }

        Linear {
            inner: LayerValues::new(c),
            stride: n,
            count: m,
        }
    }
    /// returns owned result of (Self * Rhs.T)
    pub fn matrix_transpose_product(
        self,
        rhs_transpose: LinearIter<'a, impl Iterator<Item = NodeValue>>,
    ) -> Linear {
        assert_eq!(
            self.stride, rhs_transpose.stride,
            "mismatched stride dimension"
        );
        let (count, stride) = (self.count, rhs_transpose.count);
        let chunk = self.stride;
        let self_oc = OnceCell::new();
        let rhs_oc = OnceCell::new();
        let a = self.get_or_init_inner(&self_oc);
        let b = rhs_transpose.get_or_init_inner(&rhs_oc);

        let mut inner = LayerValues::new(vec![0.0; count * stride]);
        if chunk > 0 {
            a.chunks_exact(chunk)
                .flat_map(|a| {
                    b.chunks_exact(chunk)
                        .map(move |b| a.iter().zip(b).map(|(a, b)| a * b).sum::<NodeValue>())
                })
                .zip(inner.iter_mut())
                .for_each(|(x, i)| *i = x);
        }

        Linear {
            inner,
            stride,
            count,
        }
    }
    /// point-wise multiplication
    pub fn dot_product(
        self,
        other: LinearIter<'a, impl Iterator<Item = NodeValue>>,
    ) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        assert_eq!(self.stride, other.stride, "mismatched stride dimension");
        assert_eq!(self.count, other.count, "mismatched count dimension");
        LinearIter {
            inner: self.inner.zip(other.inner).map(|(x, y)| x * y),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise division
    pub fn div(
        self,
        rhs: LinearIter<'a, impl Iterator<Item = NodeValue>>,
        epsilon: Option<NodeValue>,
    ) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        assert_eq!(self.stride, rhs.stride, "mismatched stride dimension");
        assert_eq!(self.count, rhs.count, "mismatched count dimension");
        let e = epsilon.unwrap_or(0.0);
        LinearIter {
            inner: self.inner.zip(rhs.inner).map(move |(x, y)| x / (y + e)),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise addition
    pub fn add(
        self,
        other: LinearIter<'a, impl Iterator<Item = NodeValue>>,
    ) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        assert_eq!(self.stride, other.stride, "mismatched stride dimension");
        assert_eq!(self.count, other.count, "mismatched count dimension");
        LinearIter {
            inner: self.inner.zip(other.inner).map(|(x, y)| x + y),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise subtraction
    pub fn sub(
        self,
        rhs: LinearIter<'a, impl Iterator<Item = NodeValue>>,
    ) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        assert_eq!(self.stride, rhs.stride, "mismatched stride dimension");
        assert_eq!(self.count, rhs.count, "mismatched count dimension");
        LinearIter {
            inner: self.inner.zip(rhs.inner).map(|(x, y)| x - y),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise multiplication by scalar constant
    pub fn multiply_scalar(
        self,
        rhs: NodeValue,
    ) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        LinearIter {
            inner: self.inner.map(move |x| x * rhs),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise raise to the power of scalar integer constant
    pub fn powi_scalar(self, n: i32) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        LinearIter {
            inner: self.inner.map(move |x| x.powi(n)),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// point-wise round to fixed point decimal
    pub fn round(self, decimals: u32) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        let mul = 10u32.pow(decimals) as NodeValue;
        LinearIter {
            inner: self.inner.map(move |x| (x * mul).round() / mul),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    pub fn abs(self) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        LinearIter {
            inner: self.inner.map(|x| x.abs()),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    pub fn sqrt(self) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        LinearIter {
            inner: self.inner.map(|x| x.sqrt()),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// overwrites values with `masked_value` wherever the mask holds 0.0
    pub fn set_mask(
        self,
        mask: LinearIter<'a, impl Iterator<Item = NodeValue>>,
        masked_value: NodeValue,
    ) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        assert_eq!(self.stride, mask.stride, "mismatched stride dimension");
        assert_eq!(self.count, mask.count, "mismatched count dimensions");
        LinearIter {
            inner: self
                .inner
                .zip(mask.inner)
                .map(move |(x, mask)| if mask == 0.0 { masked_value } else { x }),
            stride: self.stride,
            count: self.count,
            parent: None,
        }
    }
    /// extends count dimension by duplicating the single row
    /// Note: count dimension must be equal to 1
    pub fn stack(self, count: usize) -> LinearIter<'a, impl Iterator<Item = NodeValue>> {
        assert_eq!(self.count, 1, "can only stack when count dimension = 1");
        let row = self.inner.collect_vec();
        LinearIter {
            inner: iter::repeat(row).take(count).flatten(),
            stride: self.stride,
            count,
            parent: None,
        }
    }
    /// row-wise softmax, entries at -inf receive zero probability
    pub fn softmax(self) -> Linear {
        let stride = self.stride;
        let count = self.count;
        let mut exp_counts = self.inner.collect_vec();
        exp_counts.chunks_exact_mut(stride).for_each(|chunk| {
            let max = chunk
                .iter()
                .copied()
                .filter(|x| *x != NodeValue::NEG_INFINITY)
                .fold(NodeValue::NEG_INFINITY, NodeValue::max);
            chunk.iter_mut().for_each(|x| {
                *x = if *x != NodeValue::NEG_INFINITY {
                    (*x - max).exp()
                } else {
                    0.0
                }
            });
            let sum = chunk.iter().sum::<NodeValue>();
            let sum = if sum != 0.0 { sum } else { 1e-8 };
            chunk.iter_mut().for_each(|x| *x /= sum);
        });
        Linear {
            inner: exp_counts.into(),
            stride,
            count,
        }
    }
    /// row-wise log-softmax computed through log-sum-exp
    pub fn log_softmax(self) -> Linear {
        let stride = self.stride;
        let count = self.count;
        let mut values = self.inner.collect_vec();
        values.chunks_exact_mut(stride).for_each(|chunk| {
            let max = chunk.iter().copied().fold(NodeValue::NEG_INFINITY, NodeValue::max);
            let log_sum = chunk.iter().map(|x| (x - max).exp()).sum::<NodeValue>().ln() + max;
            chunk.iter_mut().for_each(|x| *x -= log_sum);
        });
        Linear {
            inner: values.into(),
            stride,
            count,
        }
    }
    pub fn flatten_sum(self) -> Linear {
        Linear {
            inner: self
                .inner
                .chunks(self.stride)
                .into_iter()
                .map(|x| x.sum::<NodeValue>())
                .collect(),
            stride: 1,
            count: self.count,
        }
    }
    pub fn flatten_mean(self) -> Linear {
        let stride = self.stride as NodeValue;
        Linear {
            inner: self
                .inner
                .chunks(self.stride)
                .into_iter()
                .map(|x| x.sum::<NodeValue>() / stride)
                .collect(),
            stride: 1,
            count: self.count,
        }
    }
    fn get_or_init_inner<'b>(self, cell: &'b OnceCell<Vec<NodeValue>>) -> &'b [NodeValue]
    where
        'a: 'b,
    {
        match self.parent {
            Some(parent) => parent.inner.as_slice(),
            None => cell.get_or_init(|| self.inner.collect_vec()).as_slice(),
        }
    }
    pub fn collect(self) -> Linear {
        Linear {
            inner: self.inner.with_size(self.stride * self.count).collect(),
            stride: self.stride,
            count: self.count,
        }
    }
}

mod iter_ext {
    use crate::ml::NodeValue;

    pub trait KnownSizeIterator: Iterator<Item = NodeValue> {
        fn with_size(self, size: usize) -> KnownSizedIter<Self>
        where
            Self: Sized,
        {
            KnownSizedIter { inner: self, size }
        }
    }

    pub struct KnownSizedIter<I> {
        size: usize,
        inner: I,
    }

    impl<I: Iterator<Item = NodeValue>> Iterator for KnownSizedIter<I> {
        type Item = NodeValue;

        fn next(&mut self) -> Option<Self::Item> {
            self.inner.next()
        }

        fn size_hint(&self) -> (usize, Option<usize>) {
            (self.size, Some(self.size))
        }
    }

    impl<I: Iterator<Item = NodeValue>> KnownSizeIterator for I {}
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn can_linear_perform_mat_mul() {
        let a = Linear::from_iter(3, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0].into_iter()).unwrap();
        let b = Linear::from_iter(2, [10.0, 11.0, 20.0, 21.0, 30.0, 31.0].into_iter()).unwrap();
        let y = a.matrix_product(&b);

        let expected = Linear::from_iter(2, [140.0, 146.0, 320.0, 335.0].into_iter()).unwrap();
        assert_eq!(expected, y);
    }

    #[test]
    fn can_linear_perform_transposed_mat_muls() {
        let a: Linear = "
            1 2 3
            4 5 6
        "
        .parse()
        .unwrap();
        let b: Linear = "
            1 0 1
            0 1 0
        "
        .parse()
        .unwrap();

        let rhs_t = a.matrix_product_rhs_transposed(&b);
        let expected: Linear = "
            4 2
            10 5
        "
        .parse()
        .unwrap();
        assert_eq!(expected, rhs_t);

        let lhs_t = a.matrix_product_lhs_transposed(&b);
        let expected: Linear = "
            1 4 1
            2 5 2
            3 6 3
        "
        .parse()
        .unwrap();
        assert_eq!(expected, lhs_t);
    }

    #[test]
    fn can_linear_perform_transpose() {
        let a = Linear::from_iter(3, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0].into_iter()).unwrap();
        let y = a.iter_transpose().collect();

        let expected = Linear::from_iter(2, [1.0, 4.0, 2.0, 5.0, 3.0, 6.0].into_iter()).unwrap();
        assert_eq!(expected, y);
    }

    #[test]
    fn can_linear_perform_pointwise_ops() {
        let a = Linear::from_iter(2, [1.0, 2.0, 3.0, 4.0].into_iter()).unwrap();
        let b = Linear::from_iter(2, [5.0, 4.0, 3.0, 2.0].into_iter()).unwrap();

        let y = a.iter().add(b.iter()).collect();
        let expected = Linear::from_iter(2, [6.0, 6.0, 6.0, 6.0].into_iter()).unwrap();
        assert_eq!(expected, y);

        let y = a.iter().sub(b.iter()).collect();
        let expected = Linear::from_iter(2, [-4.0, -2.0, 0.0, 2.0].into_iter()).unwrap();
        assert_eq!(expected, y);

        let y = a.iter().dot_product(b.iter()).collect();
        let expected = Linear::from_iter(2, [5.0, 8.0, 9.0, 8.0].into_iter()).unwrap();
        assert_eq!(expected, y);

        let y = a.iter().div(b.iter(), None).collect();
        let expected = Linear::from_iter(2, [0.2, 0.5, 1.0, 2.0].into_iter()).unwrap();
        assert_eq!(expected, y);
    }

    #[test]
    fn can_linear_sum_rows() {
        let x = Linear::from_iter(2, [1.0, 2.0, 3.0, 4.0].into_iter()).unwrap();
        let y = x.iter().flatten_sum();

        let expected = Linear::from_iter(1, [3.0, 7.0].into_iter()).unwrap();
        assert_eq!(expected, y);
    }

    #[test]
    fn can_linear_stack_single_row() {
        let x = Linear::from_iter(3, [1.0, 2.0, 3.0].into_iter()).unwrap();
        let y = x.iter().stack(2).collect();

        let expected =
            Linear::from_iter(3, [1.0, 2.0, 3.0, 1.0, 2.0, 3.0].into_iter()).unwrap();
        assert_eq!(expected, y);
    }

    #[test]
    fn can_linear_softmax() {
        let x = Linear::from_iter(
            2,
            [1.0, 1.0, 0.0, 0.0, -100.0, -100.0, 100.0, 100.0].into_iter(),
        )
        .unwrap();
        let y = x.iter().softmax();

        let expected =
            Linear::from_iter(2, [0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5, 0.5].into_iter()).unwrap();
        assert_eq!(expected, y);
    }

    #[test]
    fn can_linear_log_softmax_match_softmax() {
        let x = Linear::from_iter(3, [1.0, 2.0, 3.0, -5.0, 0.0, 5.0].into_iter()).unwrap();
        let probs = x.iter().softmax();
        let log_probs = x.iter().log_softmax();

        for ((p, ..), (log_p, ..)) in probs.values_iter().zip(log_probs.values_iter()) {
            assert!((p.ln() - log_p).abs() < 1e-10, "{} != {}", p.ln(), log_p);
        }
    }

    #[test]
    fn can_linear_perform_causal_masked_softmax() {
        let x = Linear::from_iter(
            3,
            [-1.0, -1.0, -1.0, 0.0, 0.0, 0.0, 1.0, 1.0, 1.0].into_iter(),
        )
        .unwrap();
        let mask = Linear::causal_mask(3);

        let y = x
            .iter()
            .set_mask(mask.iter(), NodeValue::NEG_INFINITY)
            .softmax();

        let const_1_3 = 1.0 / 3.0;
        let expected = Linear::from_iter(
            3,
            [1.0, 0.0, 0.0, 0.5, 0.5, 0.0, const_1_3, const_1_3, const_1_3].into_iter(),
        )
        .unwrap();
        assert_eq!(expected, y);
    }

    #[test]
    fn can_linear_create_causal_mask() {
        let mask = Linear::causal_mask(3);
        let expected: Linear = "
            1 0 0
            1 1 0
            1 1 1
        "
        .parse()
        .unwrap();
        assert_eq!(expected, mask);
    }

    #[test]
    fn can_linear_split_and_concat_again() {
        let x = Linear::from_iter(
            6,
            [
                11.0, 12.0, 21.0, 22.0, 31.0, 32.0, 11.1, 12.1, 21.1, 22.1, 31.1, 32.1,
            ]
            .into_iter(),
        )
        .unwrap();

        let split = x.split(3);
        let expected_split = Linear::from_iter(2, [21.0, 22.0, 21.1, 22.1].into_iter()).unwrap();
        assert_eq!(3, split.len());
        assert_eq!(expected_split, split[1]);

        let joined = split[0].concat(&split[1]).collect();
        let joined = joined.concat(&split[2]).collect();
        assert_eq!(x, joined);
    }

    #[test]
    fn can_linear_backprop_softmax() {
        let x = Linear::from_iter(3, [0.5, -0.2, 0.1].into_iter()).unwrap();
        let probs = x.iter().softmax();
        let grads = Linear::from_iter(3, [1.0, 1.0, 1.0].into_iter()).unwrap();

        // uniform upstream gradients cancel out through the normalisation
        let dx = grads.softmax_d(&probs).iter().round(10).collect();
        assert_eq!(Linear::with_dimensions(&x), dx);
    }
}
