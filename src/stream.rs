// src/stream.rs

use crate::normalize::RowNormalizer;
use crate::ThreadSafeStdError;
use nalgebra::DMatrix;
use nalgebra_sparse::ops::serial::spmm_csr_dense;
use nalgebra_sparse::ops::Op;
use nalgebra_sparse::{CooMatrix, CsrMatrix};
use ndarray::{s, Array1, Array2, ArrayView1, ArrayView2, Axis};
use std::ops::ControlFlow;

/// Lazy sequence of raw rows returned by a `RowStream`.
pub type RowIter<'a> = Box<dyn Iterator<Item = Result<Array1<f64>, ThreadSafeStdError>> + 'a>;

/// Lazy sequence of `(first_row_index, chunk)` pairs returned by a `ChunkSource`.
pub type ChunkIter<'a> = Box<dyn Iterator<Item = Result<(usize, RowChunk), ThreadSafeStdError>> + 'a>;

/// A restartable source of N rows of M numbers.
///
/// `rows` is called once per pass; each call starts again at row 0. Codec and
/// decompression details stay behind the implementation.
pub trait RowStream {
    /// `(N, M)`: number of rows and length of each row.
    fn dimensions(&self) -> (usize, usize);

    /// Opens a fresh sequential pass over all rows.
    fn rows(&self) -> Result<RowIter<'_>, ThreadSafeStdError>;

    /// Whether `row` can be used. Random row order needs it.
    fn supports_random_access(&self) -> bool {
        false
    }

    /// Reads a single row by index.
    fn row(&self, index: usize) -> Result<Array1<f64>, ThreadSafeStdError> {
        Err(format!("This stream does not support random access (requested row {}).", index).into())
    }
}

/// A source that hands out contiguous blocks of rows.
pub trait ChunkSource {
    fn dimensions(&self) -> (usize, usize);

    /// Opens a fresh pass. Every chunk except possibly the last has `chunk_size` rows.
    fn chunks(&self, chunk_size: usize) -> Result<ChunkIter<'_>, ThreadSafeStdError>;
}

/// A fully resident matrix, rows as samples.
#[derive(Clone, Debug)]
pub struct InMemoryRows {
    data: Array2<f64>,
}

impl InMemoryRows {
    pub fn new(data: Array2<f64>) -> Self {
        InMemoryRows { data }
    }

    pub fn data(&self) -> ArrayView2<'_, f64> {
        self.data.view()
    }
}

impl From<Array2<f64>> for InMemoryRows {
    fn from(data: Array2<f64>) -> Self {
        InMemoryRows::new(data)
    }
}

impl RowStream for InMemoryRows {
    fn dimensions(&self) -> (usize, usize) {
        self.data.dim()
    }

    fn rows(&self) -> Result<RowIter<'_>, ThreadSafeStdError> {
        Ok(Box::new(
            self.data
                .axis_iter(Axis(0))
                .map(|row| -> Result<Array1<f64>, ThreadSafeStdError> { Ok(row.to_owned()) }),
        ))
    }

    fn supports_random_access(&self) -> bool {
        true
    }

    fn row(&self, index: usize) -> Result<Array1<f64>, ThreadSafeStdError> {
        if index >= self.data.nrows() {
            return Err(format!("Row {} is out of range for {} rows.", index, self.data.nrows()).into());
        }
        Ok(self.data.row(index).to_owned())
    }
}

impl ChunkSource for InMemoryRows {
    fn dimensions(&self) -> (usize, usize) {
        self.data.dim()
    }

    fn chunks(&self, chunk_size: usize) -> Result<ChunkIter<'_>, ThreadSafeStdError> {
        if chunk_size == 0 {
            return Err("chunk_size must be at least 1.".into());
        }
        let n_rows = self.data.nrows();
        Ok(Box::new((0..n_rows).step_by(chunk_size).map(
            move |start| -> Result<(usize, RowChunk), ThreadSafeStdError> {
                let end = (start + chunk_size).min(n_rows);
                Ok((start, RowChunk::Dense(self.data.slice(s![start..end, ..]).to_owned())))
            },
        )))
    }
}

/// Adapts any `RowStream` into a `ChunkSource` by buffering consecutive rows.
pub struct BufferedChunks<'a, S: RowStream + ?Sized> {
    source: &'a S,
}

impl<'a, S: RowStream + ?Sized> BufferedChunks<'a, S> {
    pub fn new(source: &'a S) -> Self {
        BufferedChunks { source }
    }
}

impl<'a, S: RowStream + ?Sized> ChunkSource for BufferedChunks<'a, S> {
    fn dimensions(&self) -> (usize, usize) {
        self.source.dimensions()
    }

    fn chunks(&self, chunk_size: usize) -> Result<ChunkIter<'_>, ThreadSafeStdError> {
        if chunk_size == 0 {
            return Err("chunk_size must be at least 1.".into());
        }
        let (_, n_cols) = self.source.dimensions();
        let mut rows = self.source.rows()?;
        let mut next_start = 0usize;
        let mut finished = false;
        Ok(Box::new(std::iter::from_fn(move || -> Option<Result<(usize, RowChunk), ThreadSafeStdError>> {
            if finished {
                return None;
            }
            let mut buffer: Vec<f64> = Vec::with_capacity(chunk_size * n_cols);
            let mut taken = 0usize;
            while taken < chunk_size {
                match rows.next() {
                    Some(Ok(row)) => {
                        if row.len() != n_cols {
                            finished = true;
                            return Some(Err(format!(
                                "Row {} has {} values, expected {}.",
                                next_start + taken,
                                row.len(),
                                n_cols
                            )
                            .into()));
                        }
                        buffer.extend(row.iter().copied());
                        taken += 1;
                    }
                    Some(Err(e)) => {
                        finished = true;
                        return Some(Err(e));
                    }
                    None => {
                        finished = true;
                        break;
                    }
                }
            }
            if taken == 0 {
                return None;
            }
            let start = next_start;
            next_start += taken;
            Some(
                Array2::from_shape_vec((taken, n_cols), buffer)
                    .map(|block| (start, RowChunk::Dense(block)))
                    .map_err(|e| -> ThreadSafeStdError { Box::new(e) }),
            )
        })))
    }
}

/// One block of rows, dense or compressed sparse row.
#[derive(Clone, Debug)]
pub enum RowChunk {
    Dense(Array2<f64>),
    Sparse(CsrMatrix<f64>),
}

impl RowChunk {
    pub fn nrows(&self) -> usize {
        match self {
            RowChunk::Dense(block) => block.nrows(),
            RowChunk::Sparse(csr) => csr.nrows(),
        }
    }

    pub fn ncols(&self) -> usize {
        match self {
            RowChunk::Dense(block) => block.ncols(),
            RowChunk::Sparse(csr) => csr.ncols(),
        }
    }

    /// `chunk · rhs` where `rhs` is (M x l).
    pub fn dot(&self, rhs: &Array2<f64>) -> Array2<f64> {
        match self {
            RowChunk::Dense(block) => block.dot(rhs),
            RowChunk::Sparse(csr) => from_nalgebra(&(csr * &to_nalgebra(&rhs.view()))),
        }
    }

    /// `chunkᵗ · rhs` where `rhs` is (rows x l).
    pub fn t_dot(&self, rhs: &ArrayView2<f64>) -> Array2<f64> {
        match self {
            RowChunk::Dense(block) => block.t().dot(rhs),
            RowChunk::Sparse(csr) => {
                let mut out = DMatrix::<f64>::zeros(csr.ncols(), rhs.ncols());
                spmm_csr_dense(0.0, &mut out, 1.0, Op::Transpose(csr), Op::NoOp(&to_nalgebra(rhs)));
                from_nalgebra(&out)
            }
        }
    }
}

fn to_nalgebra(block: &ArrayView2<f64>) -> DMatrix<f64> {
    DMatrix::from_fn(block.nrows(), block.ncols(), |i, j| block[[i, j]])
}

fn from_nalgebra(matrix: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn(matrix.shape(), |(i, j)| matrix[(i, j)])
}

/// Builds a CSR block from raw parts. Offsets, column bounds, and sorted unique
/// column indices per row are checked by `nalgebra_sparse`.
pub fn csr_from_parts(
    n_rows: usize,
    n_cols: usize,
    row_offsets: Vec<usize>,
    col_indices: Vec<usize>,
    values: Vec<f64>,
) -> Result<CsrMatrix<f64>, ThreadSafeStdError> {
    CsrMatrix::try_from_csr_data(n_rows, n_cols, row_offsets, col_indices, values)
        .map_err(|e| format!("Invalid CSR data for a {}x{} block: {}", n_rows, n_cols, e).into())
}

/// Stores the non-zero entries of a dense block.
pub fn csr_from_dense(block: &ArrayView2<f64>) -> CsrMatrix<f64> {
    let (n_rows, n_cols) = block.dim();
    let mut coo = CooMatrix::new(n_rows, n_cols);
    for ((i, j), &v) in block.indexed_iter() {
        if v != 0.0 {
            coo.push(i, j, v);
        }
    }
    CsrMatrix::from(&coo)
}

/// Expands a CSR block, explicit zeros included.
pub fn csr_to_dense(csr: &CsrMatrix<f64>) -> Array2<f64> {
    from_nalgebra(&DMatrix::from(csr))
}

/// A resident sparse matrix served as CSR chunks.
#[derive(Clone, Debug)]
pub struct CsrMatrixSource {
    matrix: CsrMatrix<f64>,
}

impl CsrMatrixSource {
    pub fn new(matrix: CsrMatrix<f64>) -> Self {
        CsrMatrixSource { matrix }
    }
}

impl ChunkSource for CsrMatrixSource {
    fn dimensions(&self) -> (usize, usize) {
        (self.matrix.nrows(), self.matrix.ncols())
    }

    fn chunks(&self, chunk_size: usize) -> Result<ChunkIter<'_>, ThreadSafeStdError> {
        if chunk_size == 0 {
            return Err("chunk_size must be at least 1.".into());
        }
        let m = &self.matrix;
        let n_rows = m.nrows();
        Ok(Box::new((0..n_rows).step_by(chunk_size).map(
            move |start| -> Result<(usize, RowChunk), ThreadSafeStdError> {
                let end = (start + chunk_size).min(n_rows);
                let offsets = m.row_offsets();
                let (lo, hi) = (offsets[start], offsets[end]);
                let chunk = csr_from_parts(
                    end - start,
                    m.ncols(),
                    offsets[start..=end].iter().map(|p| p - lo).collect(),
                    m.col_indices()[lo..hi].to_vec(),
                    m.values()[lo..hi].to_vec(),
                )?;
                Ok((start, RowChunk::Sparse(chunk)))
            },
        )))
    }
}

/// Logical position in the stream: epoch `s` (1-based) and row position `n`
/// (0-based) within the epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamCursor {
    n_rows: usize,
    epoch: usize,
    position: usize,
}

impl StreamCursor {
    pub fn new(n_rows: usize) -> Self {
        StreamCursor { n_rows, epoch: 1, position: 0 }
    }

    /// Positions the cursor at an arbitrary `(epoch, position)`.
    pub fn at(n_rows: usize, epoch: usize, position: usize) -> Self {
        StreamCursor { n_rows, epoch: epoch.max(1), position }
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// 1-based absolute sample index `N·(s−1) + n + 1`. Identical for the same
    /// absolute sample no matter which epoch a run was restarted from.
    pub fn global_index(&self) -> u64 {
        (self.n_rows as u64) * (self.epoch as u64 - 1) + self.position as u64 + 1
    }

    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch = epoch.max(1);
        self.position = 0;
    }

    pub fn advance(&mut self) {
        self.position += 1;
    }
}

/// Normalized view over a `RowStream`, in natural or explicit row order.
pub struct NormalizedRows<'a> {
    source: &'a dyn RowStream,
    normalizer: &'a RowNormalizer,
    order: Option<&'a [usize]>,
    limit: Option<usize>,
}

impl<'a> NormalizedRows<'a> {
    pub fn new(source: &'a dyn RowStream, normalizer: &'a RowNormalizer) -> Self {
        NormalizedRows { source, normalizer, order: None, limit: None }
    }

    /// Visit rows in this order instead. Requires random access.
    pub fn with_order(mut self, order: &'a [usize]) -> Self {
        self.order = Some(order);
        self
    }

    /// Stop after the first `limit` rows of the pass.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Runs one pass, calling `visit(position, row_index, sample)` for each row.
    /// `visit` may break early. Returns the number of rows visited.
    pub fn for_each_sample<F>(&self, mut visit: F) -> Result<usize, ThreadSafeStdError>
    where
        F: FnMut(usize, usize, ArrayView1<f64>) -> Result<ControlFlow<()>, ThreadSafeStdError>,
    {
        let (n_rows, _) = self.source.dimensions();
        let wanted = self.limit.map_or(n_rows, |l| l.min(n_rows));
        let mut visited = 0usize;

        match self.order {
            Some(order) => {
                if !self.source.supports_random_access() {
                    return Err("Random row order requires a stream with random access.".into());
                }
                for (position, &row_index) in order.iter().take(wanted).enumerate() {
                    let raw = self.source.row(row_index)?;
                    let sample = self.normalizer.normalize(row_index, raw.view())?;
                    visited += 1;
                    if visit(position, row_index, sample.view())?.is_break() {
                        break;
                    }
                }
            }
            None => {
                let mut rows = self.source.rows()?;
                for position in 0..wanted {
                    let raw = match rows.next() {
                        Some(row) => row?,
                        None => {
                            return Err(format!(
                                "Stream ended after {} rows but declares {}.",
                                position, n_rows
                            )
                            .into())
                        }
                    };
                    let sample = self.normalizer.normalize(position, raw.view())?;
                    visited += 1;
                    if visit(position, position, sample.view())?.is_break() {
                        break;
                    }
                }
            }
        }
        Ok(visited)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NormalizationSettings;
    use ndarray::array;

    /// Sequential-only stream for exercising the fallbacks.
    struct SequentialOnly(Array2<f64>);

    impl RowStream for SequentialOnly {
        fn dimensions(&self) -> (usize, usize) {
            self.0.dim()
        }
        fn rows(&self) -> Result<RowIter<'_>, ThreadSafeStdError> {
            Ok(Box::new(self.0.axis_iter(Axis(0)).map(|r| -> Result<Array1<f64>, ThreadSafeStdError> { Ok(r.to_owned()) })))
        }
    }

    fn sample_matrix() -> Array2<f64> {
        array![
            [0.0, 2.0, 0.0, 1.0],
            [3.0, 0.0, 0.0, 0.0],
            [0.0, 0.0, 0.0, 0.0],
            [1.0, 1.0, 1.0, 1.0],
            [0.0, 5.0, 0.0, 2.0],
        ]
    }

    #[test]
    fn test_cursor_global_index_is_epoch_consistent() {
        let mut cursor = StreamCursor::new(10);
        assert_eq!(cursor.global_index(), 1);
        for _ in 0..9 {
            cursor.advance();
        }
        assert_eq!(cursor.global_index(), 10);
        cursor.start_epoch(2);
        assert_eq!(cursor.global_index(), 11);
        assert_eq!(StreamCursor::at(10, 2, 3).global_index(), StreamCursor::at(10, 1, 13).global_index());
    }

    #[test]
    fn test_csr_products_match_dense() {
        let dense = sample_matrix();
        let csr = csr_from_dense(&dense.view());
        assert_eq!(csr.nnz(), 9);
        assert_eq!(csr_to_dense(&csr), dense);

        let chunk = RowChunk::Sparse(csr);
        let rhs = array![[1.0, -1.0], [0.5, 2.0], [3.0, 0.0], [-2.0, 1.0]];
        assert_eq!(chunk.dot(&rhs), dense.dot(&rhs));

        let left = array![[1.0], [2.0], [3.0], [4.0], [5.0]];
        assert_eq!(chunk.t_dot(&left.view()), dense.t().dot(&left));
    }

    #[test]
    fn test_csr_rejects_malformed_structure() {
        assert!(csr_from_parts(2, 3, vec![0, 1], vec![0], vec![1.0]).is_err());
        assert!(csr_from_parts(1, 3, vec![0, 1], vec![3], vec![1.0]).is_err());
        assert!(csr_from_parts(2, 3, vec![0, 2, 1], vec![0, 1], vec![1.0, 1.0]).is_err());
        assert!(csr_from_parts(1, 3, vec![0, 1], vec![2], vec![1.0]).is_ok());
    }

    #[test]
    fn test_csr_rejects_unsorted_or_repeated_columns() {
        let unsorted = csr_from_parts(1, 4, vec![0, 2], vec![3, 1], vec![1.0, 2.0]);
        let err = unsorted.unwrap_err().to_string();
        assert!(err.contains("1x4"), "{}", err);
        assert!(csr_from_parts(1, 4, vec![0, 2], vec![1, 1], vec![1.0, 2.0]).is_err());
        assert!(csr_from_parts(1, 4, vec![0, 2], vec![1, 3], vec![1.0, 2.0]).is_ok());
    }

    #[test]
    fn test_sparse_chunks_keep_explicit_zeros_and_offsets() {
        // row 1 stores an explicit zero; row 2 is empty
        let csr = csr_from_parts(4, 3, vec![0, 2, 3, 3, 5], vec![0, 2, 1, 0, 1], vec![1.0, 2.0, 0.0, 4.0, 5.0])
            .unwrap();
        let dense = csr_to_dense(&csr);
        let source = CsrMatrixSource::new(csr);
        let chunks: Vec<(usize, RowChunk)> = source.chunks(3).unwrap().collect::<Result<_, _>>().unwrap();
        assert_eq!(chunks.len(), 2);
        match &chunks[0].1 {
            RowChunk::Sparse(first) => {
                assert_eq!(first.row_offsets(), &[0, 2, 3, 3]);
                assert_eq!(first.nnz(), 3);
            }
            RowChunk::Dense(_) => panic!("sparse source produced a dense chunk"),
        }
        match &chunks[1].1 {
            RowChunk::Sparse(last) => {
                assert_eq!(last.row_offsets(), &[0, 2]);
                assert_eq!(csr_to_dense(last), dense.slice(s![3..4, ..]));
            }
            RowChunk::Dense(_) => panic!("sparse source produced a dense chunk"),
        }
    }

    #[test]
    fn test_chunk_sources_cover_all_rows() {
        let dense = sample_matrix();
        let in_memory = InMemoryRows::new(dense.clone());
        let sparse = CsrMatrixSource::new(csr_from_dense(&dense.view()));
        let sequential = SequentialOnly(dense.clone());
        let buffered = BufferedChunks::new(&sequential);

        let sources: [&dyn ChunkSource; 3] = [&in_memory, &sparse, &buffered];
        for source in sources {
            let chunks: Vec<(usize, RowChunk)> = source.chunks(2).unwrap().collect::<Result<_, _>>().unwrap();
            assert_eq!(chunks.len(), 3);
            assert_eq!(chunks.iter().map(|(start, _)| *start).collect::<Vec<_>>(), vec![0, 2, 4]);
            assert_eq!(chunks[2].1.nrows(), 1);
            for (start, chunk) in &chunks {
                let rebuilt = match chunk {
                    RowChunk::Dense(block) => block.clone(),
                    RowChunk::Sparse(csr) => csr_to_dense(csr),
                };
                assert_eq!(rebuilt, dense.slice(s![*start..*start + chunk.nrows(), ..]));
            }
        }
    }

    #[test]
    fn test_normalized_pass_orders_and_limits() {
        let source = InMemoryRows::new(sample_matrix());
        let normalizer = RowNormalizer::new(&NormalizationSettings::default(), 5, 4).unwrap();

        let mut seen = Vec::new();
        let visited = NormalizedRows::new(&source, &normalizer)
            .with_order(&[4, 0, 2, 1, 3])
            .for_each_sample(|position, row, x| {
                seen.push((position, row, x.sum()));
                Ok(ControlFlow::Continue(()))
            })
            .unwrap();
        assert_eq!(visited, 5);
        assert_eq!(seen[0], (0, 4, 7.0));
        assert_eq!(seen[1], (1, 0, 3.0));

        let limited = NormalizedRows::new(&source, &normalizer)
            .with_limit(2)
            .for_each_sample(|_, _, _| Ok(ControlFlow::Continue(())))
            .unwrap();
        assert_eq!(limited, 2);

        let stopped = NormalizedRows::new(&source, &normalizer)
            .for_each_sample(|position, _, _| Ok(if position == 1 { ControlFlow::Break(()) } else { ControlFlow::Continue(()) }))
            .unwrap();
        assert_eq!(stopped, 2);
    }

    #[test]
    fn test_random_order_requires_random_access() {
        let source = SequentialOnly(sample_matrix());
        let normalizer = RowNormalizer::new(&NormalizationSettings::default(), 5, 4).unwrap();
        let err = NormalizedRows::new(&source, &normalizer)
            .with_order(&[1, 0, 2, 3, 4])
            .for_each_sample(|_, _, _| Ok(ControlFlow::Continue(())))
            .unwrap_err();
        assert!(err.to_string().contains("random access"));
        assert!(source.row(0).is_err());
    }
}
