/// Output of `pre_decode`: which surviving chunks to fetch and, for repair,
/// the precomputed coefficient rows to apply to them.
#[derive(Debug, Clone, Default)]
pub struct DecodingPlan {
    input_chunk_ids: Vec<usize>,
    min_num_inputs: usize,
    repair_matrix: Vec<u8>,
}

impl DecodingPlan {
    pub fn new(input_chunk_ids: Vec<usize>, min_num_inputs: usize) -> Self {
        Self {
            input_chunk_ids,
            min_num_inputs,
            repair_matrix: Vec::new(),
        }
    }

    /// Ids of all surviving chunks usable as decode input, in ascending
    /// order. The first `min_num_inputs` are the preferred selection; later
    /// entries are substitutes when a fetch fails.
    pub fn input_chunk_ids(&self) -> &[usize] {
        &self.input_chunk_ids
    }

    pub fn num_inputs(&self) -> usize {
        self.input_chunk_ids.len()
    }

    /// Minimum number of chunks that must be retrieved for decoding.
    pub fn min_num_inputs(&self) -> usize {
        self.min_num_inputs
    }

    pub fn set_repair_matrix(&mut self, matrix: Vec<u8>) {
        self.repair_matrix = matrix;
    }

    /// Repair coefficient rows, one row of `k` bytes per failed chunk.
    /// Empty unless the plan was built for a repair.
    pub fn repair_matrix(&self) -> &[u8] {
        &self.repair_matrix
    }
}
