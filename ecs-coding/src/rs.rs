//! Systematic Reed-Solomon codes over GF(2^8).

use log::{debug, error};

use ecs_api_types::CodingScheme;

use crate::matrix;
use crate::plan::DecodingPlan;
use crate::{gf256, CodingEngine, CodingError};

pub struct ReedSolomon {
    n: usize,
    k: usize,
    repair_using_car: bool,
    /// `n x k` generator matrix; the first `k` rows are the identity.
    encode_matrix: Vec<u8>,
}

impl ReedSolomon {
    pub fn new(n: u8, k: u8, repair_using_car: bool) -> Result<Self, CodingError> {
        if n == 0 || k == 0 || n < k {
            return Err(CodingError::InvalidParams(format!(
                "RS codes require n >= k, n > 0 and k > 0 (got n = {n}, k = {k})"
            )));
        }
        let (n, k) = (n as usize, k as usize);
        debug!("RS code init with n = {n}, k = {k}, CAR = {repair_using_car}");
        Ok(Self {
            n,
            k,
            repair_using_car,
            encode_matrix: matrix::gen_rs_matrix(n, k),
        })
    }

    /// Rows of `G * S^-1` for the given failed ids, where `S` is the `k x k`
    /// generator submatrix of the first `k` surviving chunks. Data rows come
    /// straight out of `S^-1`; parity rows need the extra multiplication.
    fn repair_rows(
        &self,
        inverted: &[u8],
        failed_ids: &[usize],
    ) -> Vec<u8> {
        let k = self.k;
        let mut rows = vec![0u8; failed_ids.len() * k];
        for (i, &f) in failed_ids.iter().enumerate() {
            if f < k {
                rows[i * k..(i + 1) * k].copy_from_slice(&inverted[f * k..(f + 1) * k]);
            } else {
                for j in 0..k {
                    let mut s = 0u8;
                    for l in 0..k {
                        s ^= gf256::mul(inverted[l * k + j], self.encode_matrix[f * k + l]);
                    }
                    rows[i * k + j] = s;
                }
            }
        }
        rows
    }

    /// Invert the generator submatrix selected by the first `k` entries of
    /// `input_ids`.
    fn invert_selected(&self, input_ids: &[usize]) -> Result<Vec<u8>, CodingError> {
        let k = self.k;
        let mut selected = vec![0u8; k * k];
        for (row, &id) in input_ids.iter().take(k).enumerate() {
            selected[row * k..(row + 1) * k]
                .copy_from_slice(&self.encode_matrix[id * k..(id + 1) * k]);
        }
        matrix::invert(&selected, k).ok_or_else(|| {
            error!("failed to invert the decode matrix for chunks {input_ids:?}");
            CodingError::Unrecoverable {
                needed: k,
                available: input_ids.len(),
            }
        })
    }
}

impl CodingEngine for ReedSolomon {
    fn scheme(&self) -> CodingScheme {
        CodingScheme::ReedSolomon
    }

    fn n(&self) -> u8 {
        self.n as u8
    }

    fn k(&self) -> u8 {
        self.k as u8
    }

    fn num_data_chunks(&self) -> usize {
        self.k
    }

    fn num_code_chunks(&self) -> usize {
        self.n - self.k
    }

    fn chunks_per_node(&self) -> usize {
        1
    }

    fn coding_state_size(&self) -> usize {
        0
    }

    fn chunk_size(&self, data_size: usize) -> usize {
        (data_size + self.k - 1) / self.k
    }

    fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, CodingError> {
        let chunk_size = self.chunk_size(data.len());
        if chunk_size == 0 {
            return Err(CodingError::InvalidParams("cannot encode empty data".into()));
        }

        let mut stripe = Vec::with_capacity(self.n);
        // data chunks carry the payload, zero-padded to the chunk size
        for i in 0..self.k {
            let start = (i * chunk_size).min(data.len());
            let end = ((i + 1) * chunk_size).min(data.len());
            let mut chunk = vec![0u8; chunk_size];
            chunk[..end - start].copy_from_slice(&data[start..end]);
            stripe.push(chunk);
        }
        // code chunks are the parity rows applied to the data chunks
        for r in self.k..self.n {
            let mut chunk = vec![0u8; chunk_size];
            for c in 0..self.k {
                gf256::mul_acc(&mut chunk, &stripe[c], self.encode_matrix[r * self.k + c]);
            }
            stripe.push(chunk);
        }
        Ok(stripe)
    }

    fn pre_decode(&self, failed_ids: &[usize], is_repair: bool) -> Result<DecodingPlan, CodingError> {
        if failed_ids.len() > self.n - self.k {
            error!(
                "number of failures = {} is greater than n - k = {}",
                failed_ids.len(),
                self.n - self.k
            );
            return Err(CodingError::Unrecoverable {
                needed: self.k,
                available: self.n - failed_ids.len(),
            });
        }

        let input_ids: Vec<usize> = (0..self.n).filter(|i| !failed_ids.contains(i)).collect();
        if input_ids.len() < self.k {
            return Err(CodingError::Unrecoverable {
                needed: self.k,
                available: input_ids.len(),
            });
        }

        let mut plan = DecodingPlan::new(input_ids, self.k);

        if is_repair {
            let inverted = self.invert_selected(plan.input_chunk_ids())?;
            plan.set_repair_matrix(self.repair_rows(&inverted, failed_ids));
        }

        Ok(plan)
    }

    fn decode(
        &self,
        inputs: &[(usize, &[u8])],
        _plan: &DecodingPlan,
        is_repair: bool,
        repair_targets: &[usize],
    ) -> Result<Vec<u8>, CodingError> {
        // CAR repair feeds fewer than k inputs (one partial encoding per
        // agent group); every other mode needs at least k chunks
        if inputs.len() < self.k && !(is_repair && self.repair_using_car) {
            error!(
                "insufficient input chunks for decoding, got {} but require {}",
                inputs.len(),
                self.k
            );
            return Err(CodingError::Unrecoverable {
                needed: self.k,
                available: inputs.len(),
            });
        }
        let chunk_size = inputs.first().map(|(_, d)| d.len()).unwrap_or(0);
        if chunk_size == 0 || inputs.iter().any(|(_, d)| d.len() != chunk_size) {
            return Err(CodingError::InvalidParams(
                "decode inputs must be non-empty chunks of equal size".into(),
            ));
        }

        // repair everything missing unless the caller named specific targets
        let targets: Vec<usize> = if is_repair && repair_targets.is_empty() {
            (0..self.n)
                .filter(|i| !inputs.iter().any(|(id, _)| id == i))
                .collect()
        } else {
            repair_targets.to_vec()
        };

        // single-failure CAR repair: the inputs are already partially
        // encoded, the final step is their XOR
        if is_repair && targets.len() == 1 && self.repair_using_car {
            debug!("decode using {} partially encoded chunks", inputs.len());
            let mut out = inputs[0].1.to_vec();
            for (_, data) in &inputs[1..] {
                for (o, b) in out.iter_mut().zip(*data) {
                    *o ^= b;
                }
            }
            return Ok(out);
        }

        let input_ids: Vec<usize> = inputs.iter().map(|(id, _)| *id).collect();
        let inverted = self.invert_selected(&input_ids)?;

        let final_matrix = if is_repair {
            self.repair_rows(&inverted, &targets)
        } else {
            inverted
        };

        let num_out = if is_repair { targets.len() } else { self.k };
        let bufs: Vec<&[u8]> = inputs.iter().take(self.k).map(|(_, d)| *d).collect();
        let mut outputs = vec![vec![0u8; chunk_size]; num_out];
        matrix::mat_apply(&final_matrix, self.k, &bufs, &mut outputs);

        Ok(outputs.concat())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn engine(n: u8, k: u8) -> ReedSolomon {
        ReedSolomon::new(n, k, false).unwrap()
    }

    #[test]
    fn rejects_bad_params() {
        assert!(ReedSolomon::new(2, 4, false).is_err());
        assert!(ReedSolomon::new(0, 0, false).is_err());
        assert!(ReedSolomon::new(4, 4, false).is_ok());
    }

    #[test]
    fn encode_pads_and_sizes_chunks() {
        let rs = engine(4, 3);
        let data = payload(10);
        let stripe = rs.encode(&data).unwrap();
        assert_eq!(stripe.len(), 4);
        // ceil(10 / 3) = 4
        assert!(stripe.iter().all(|c| c.len() == 4));
        assert_eq!(&stripe[0][..], &data[0..4]);
        assert_eq!(stripe[2][2..], [0, 0]);
    }

    #[test]
    fn decode_with_failures_recovers_data() {
        let rs = engine(6, 4);
        let data = payload(64);
        let stripe = rs.encode(&data).unwrap();

        for failed in [vec![0usize, 5], vec![1, 2], vec![4, 5], vec![0, 3]] {
            let plan = rs.pre_decode(&failed, false).unwrap();
            let inputs: Vec<(usize, &[u8])> = plan
                .input_chunk_ids()
                .iter()
                .take(plan.min_num_inputs())
                .map(|&id| (id, stripe[id].as_slice()))
                .collect();
            let decoded = rs.decode(&inputs, &plan, false, &[]).unwrap();
            assert_eq!(&decoded[..data.len()], &data[..], "failed set {failed:?}");
        }
    }

    #[test]
    fn pre_decode_rejects_too_many_failures() {
        let rs = engine(6, 4);
        match rs.pre_decode(&[0, 1, 2], false) {
            Err(CodingError::Unrecoverable { needed, available }) => {
                assert_eq!(needed, 4);
                assert_eq!(available, 3);
            }
            other => panic!("expected Unrecoverable, got {other:?}"),
        }
    }

    #[test]
    fn repair_restores_failed_chunks() {
        let rs = engine(6, 4);
        let data = payload(128);
        let stripe = rs.encode(&data).unwrap();

        for failed in [vec![0usize], vec![5], vec![1, 4], vec![2, 3]] {
            let plan = rs.pre_decode(&failed, true).unwrap();
            assert_eq!(plan.repair_matrix().len(), failed.len() * 4);
            let inputs: Vec<(usize, &[u8])> = plan
                .input_chunk_ids()
                .iter()
                .take(plan.min_num_inputs())
                .map(|&id| (id, stripe[id].as_slice()))
                .collect();
            let repaired = rs.decode(&inputs, &plan, true, &failed).unwrap();
            let chunk_size = stripe[0].len();
            for (i, &f) in failed.iter().enumerate() {
                assert_eq!(
                    &repaired[i * chunk_size..(i + 1) * chunk_size],
                    &stripe[f][..],
                    "repair of chunk {f}"
                );
            }
        }
    }

    #[test]
    fn car_partial_encodings_xor_to_repaired_chunk() {
        let rs = ReedSolomon::new(6, 4, true).unwrap();
        let data = payload(96);
        let stripe = rs.encode(&data).unwrap();

        let failed = vec![2usize];
        let plan = rs.pre_decode(&failed, true).unwrap();
        let matrix = plan.repair_matrix();
        let selected: Vec<usize> = plan.input_chunk_ids()[..plan.min_num_inputs()].to_vec();

        // emulate two agent groups each combining its local chunks with the
        // repair coefficients before sending
        let chunk_size = stripe[0].len();
        let groups = [&selected[..2], &selected[2..]];
        let mut partials = Vec::new();
        for group in groups {
            let mut partial = vec![0u8; chunk_size];
            for &id in group {
                let idx = selected.iter().position(|&s| s == id).unwrap();
                gf256::mul_acc(&mut partial, &stripe[id], matrix[idx]);
            }
            partials.push(partial);
        }

        let inputs: Vec<(usize, &[u8])> = partials
            .iter()
            .enumerate()
            .map(|(i, p)| (i, p.as_slice()))
            .collect();
        let repaired = rs.decode(&inputs, &plan, true, &failed).unwrap();
        assert_eq!(&repaired[..], &stripe[2][..]);
    }
}
