//! MD5 digests for chunk and object checksums.

use anyhow::Error;
use openssl::hash::{Hasher, MessageDigest};

use ecs_api_types::MD5_DIGEST_LENGTH;

/// One-shot MD5 of a buffer.
pub fn md5sum(data: &[u8]) -> [u8; MD5_DIGEST_LENGTH] {
    let digest = openssl::hash::hash(MessageDigest::md5(), data)
        .expect("md5 is always available in openssl");
    let mut out = [0u8; MD5_DIGEST_LENGTH];
    out.copy_from_slice(&digest);
    out
}

/// Incremental MD5 used to checksum a whole object across its stripes.
pub struct Md5Digest {
    hasher: Hasher,
}

impl Md5Digest {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            hasher: Hasher::new(MessageDigest::md5())?,
        })
    }

    pub fn update(&mut self, data: &[u8]) -> Result<(), Error> {
        self.hasher.update(data)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<[u8; MD5_DIGEST_LENGTH], Error> {
        let digest = self.hasher.finish()?;
        let mut out = [0u8; MD5_DIGEST_LENGTH];
        out.copy_from_slice(&digest);
        Ok(out)
    }
}
