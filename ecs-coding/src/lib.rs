//! Erasure-coding engines of the ecstore proxy.
//!
//! The chunk manager drives coding through the object-safe [`CodingEngine`]
//! trait; concrete engines are produced and cached by a [`CodingRegistry`]
//! keyed by `(scheme, n, k)`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ecs_api_types::{CodingMeta, CodingScheme};

pub mod gf256;
pub mod matrix;

mod plan;
mod rs;

pub use plan::DecodingPlan;
pub use rs::ReedSolomon;

#[derive(Debug, thiserror::Error)]
pub enum CodingError {
    #[error("invalid coding parameters: {0}")]
    InvalidParams(String),
    #[error("insufficient chunks to decode, need {needed} but only {available} available")]
    Unrecoverable { needed: usize, available: usize },
}

/// One erasure-coding scheme instance, fixed to a parameter set.
pub trait CodingEngine: Send + Sync {
    fn scheme(&self) -> CodingScheme;
    fn n(&self) -> u8;
    fn k(&self) -> u8;

    /// Number of data chunks per stripe.
    fn num_data_chunks(&self) -> usize;
    /// Number of code chunks per stripe.
    fn num_code_chunks(&self) -> usize;
    /// Number of chunks stored per node; 1 for Reed-Solomon.
    fn chunks_per_node(&self) -> usize;
    /// Bytes of per-stripe coding state this scheme persists; 0 if stateless.
    fn coding_state_size(&self) -> usize;

    fn num_chunks(&self) -> usize {
        self.num_data_chunks() + self.num_code_chunks()
    }

    /// Chunk size for a stripe carrying `data_size` bytes of payload.
    fn chunk_size(&self, data_size: usize) -> usize;

    /// Encode one stripe of payload into `n * chunks_per_node` chunks; the
    /// data chunks come first and carry the (zero-padded) payload.
    fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, CodingError>;

    /// Select decode inputs among the survivors of `failed_ids` and, for a
    /// repair, precompute the repair matrix.
    fn pre_decode(&self, failed_ids: &[usize], is_repair: bool) -> Result<DecodingPlan, CodingError>;

    /// Decode (or repair) from `(chunk_id, data)` inputs. For a plain decode
    /// the output is the concatenated data chunks; for a repair it is the
    /// concatenated repaired chunks in `repair_targets` order.
    fn decode(
        &self,
        inputs: &[(usize, &[u8])],
        plan: &DecodingPlan,
        is_repair: bool,
        repair_targets: &[usize],
    ) -> Result<Vec<u8>, CodingError>;
}

/// Lazily-populated cache of coding engines, shared process-wide.
pub struct CodingRegistry {
    repair_using_car: bool,
    engines: Mutex<HashMap<(CodingScheme, u8, u8), Arc<dyn CodingEngine>>>,
}

impl CodingRegistry {
    pub fn new(repair_using_car: bool) -> Self {
        Self {
            repair_using_car,
            engines: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(
        &self,
        scheme: CodingScheme,
        n: u8,
        k: u8,
    ) -> Result<Arc<dyn CodingEngine>, CodingError> {
        let mut engines = self.engines.lock().unwrap();
        if let Some(engine) = engines.get(&(scheme, n, k)) {
            return Ok(engine.clone());
        }
        let engine: Arc<dyn CodingEngine> = match scheme {
            CodingScheme::ReedSolomon => Arc::new(ReedSolomon::new(n, k, self.repair_using_car)?),
            CodingScheme::Unknown => {
                return Err(CodingError::InvalidParams("unknown coding scheme".into()))
            }
        };
        engines.insert((scheme, n, k), engine.clone());
        Ok(engine)
    }

    pub fn get_for(&self, meta: &CodingMeta) -> Result<Arc<dyn CodingEngine>, CodingError> {
        self.get(meta.scheme(), meta.n, meta.k)
    }

    /// Payload bytes per stripe under a full chunk size.
    pub fn max_data_size_per_stripe(
        &self,
        meta: &CodingMeta,
    ) -> Result<usize, CodingError> {
        let engine = self.get_for(meta)?;
        Ok(meta.max_chunk_size as usize * engine.num_data_chunks())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn registry_caches_instances() {
        let registry = CodingRegistry::new(false);
        let a = registry.get(CodingScheme::ReedSolomon, 4, 2).unwrap();
        let b = registry.get(CodingScheme::ReedSolomon, 4, 2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = registry.get(CodingScheme::ReedSolomon, 6, 4).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn registry_rejects_invalid() {
        let registry = CodingRegistry::new(false);
        assert!(registry.get(CodingScheme::ReedSolomon, 2, 4).is_err());
        assert!(registry.get(CodingScheme::Unknown, 4, 2).is_err());
    }

    #[test]
    fn stripe_size_follows_parameters() {
        let registry = CodingRegistry::new(false);
        let meta = CodingMeta::new(CodingScheme::ReedSolomon, 4, 2, 0, 1 << 20);
        assert_eq!(registry.max_data_size_per_stripe(&meta).unwrap(), 2 << 20);
    }
}
