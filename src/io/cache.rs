//! Versioned, content-addressed stage artifacts.
//!
//! Every cached stage result lives in `<cache_dir>/<stage>-<key>.bin`, where `key` is an FNV-1a
//! hash over everything the stage reads. A changed input changes the key, so an old file is never
//! picked up for new inputs. File layout (little endian):
//!
//! ```text
//! magic "HDRC" | version u8 | key u64 | stage len u16 | stage utf8
//! | rank u8 | dims u64 × rank | f32 × product(dims)
//! ```

use crate::error::{EstimateError, Result};
use log::{debug, warn};
use std::fs;
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"HDRC";

/// Bumped whenever a cached stage changes what it computes.
pub const CACHE_VERSION: u8 = 1;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Incremental FNV-1a 64 hasher for cache keys.
#[derive(Debug, Clone, Copy)]
pub struct KeyBuilder {
    hash: u64,
}

impl Default for KeyBuilder {
    fn default() -> Self {
        Self { hash: FNV_OFFSET }
    }
}

impl KeyBuilder {
    pub fn new(stage: &str) -> Self {
        Self::default().bytes(stage.as_bytes()).bytes(&[CACHE_VERSION])
    }

    pub fn bytes(mut self, data: &[u8]) -> Self {
        for &b in data {
            self.hash ^= b as u64;
            self.hash = self.hash.wrapping_mul(FNV_PRIME);
        }
        self
    }

    pub fn f32s(self, data: &[f32]) -> Self {
        data.iter().fold(self, |k, v| k.bytes(&v.to_le_bytes()))
    }

    pub fn f64s(self, data: &[f64]) -> Self {
        data.iter().fold(self, |k, v| k.bytes(&v.to_le_bytes()))
    }

    pub fn u64(self, value: u64) -> Self {
        self.bytes(&value.to_le_bytes())
    }

    /// Chains another key into this one.
    pub fn key(self, key: CacheKey) -> Self {
        self.u64(key.0)
    }

    pub fn finish(self) -> CacheKey {
        CacheKey(self.hash)
    }
}

/// Content hash identifying the inputs of one stage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(pub u64);

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A dense f32 array with its shape.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Artifact {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected = shape.iter().try_fold(1usize, |n, &d| n.checked_mul(d));
        if expected != Some(data.len()) {
            return Err(EstimateError::Cache(format!(
                "shape {shape:?} does not hold {} values",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    fn encode(&self, stage: &str, key: CacheKey) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + stage.len() + self.shape.len() * 8 + self.data.len() * 4);
        out.extend_from_slice(MAGIC);
        out.push(CACHE_VERSION);
        out.extend_from_slice(&key.0.to_le_bytes());
        out.extend_from_slice(&(stage.len() as u16).to_le_bytes());
        out.extend_from_slice(stage.as_bytes());
        out.push(self.shape.len() as u8);
        for &dim in &self.shape {
            out.extend_from_slice(&(dim as u64).to_le_bytes());
        }
        for v in &self.data {
            out.extend_from_slice(&v.to_le_bytes());
        }
        out
    }

    fn decode(bytes: &[u8], stage: &str, key: CacheKey) -> Result<Self> {
        let mut reader = Reader { bytes, pos: 0 };
        if reader.take(4)? != MAGIC {
            return Err(EstimateError::Cache("not a cache file".into()));
        }
        let version = reader.take(1)?[0];
        if version != CACHE_VERSION {
            return Err(EstimateError::Cache(format!(
                "version {version}, expected {CACHE_VERSION}"
            )));
        }
        if reader.u64()? != key.0 {
            return Err(EstimateError::Cache("key does not match file name".into()));
        }
        let name_len = u16::from_le_bytes([reader.take(1)?[0], reader.take(1)?[0]]) as usize;
        if reader.take(name_len)? != stage.as_bytes() {
            return Err(EstimateError::Cache(format!("file belongs to another stage than '{stage}'")));
        }
        let rank = reader.take(1)?[0] as usize;
        let shape = (0..rank)
            .map(|_| reader.u64().map(|d| d as usize))
            .collect::<Result<Vec<_>>>()?;
        let payload_len = shape
            .iter()
            .try_fold(4usize, |len, &d| len.checked_mul(d))
            .ok_or_else(|| EstimateError::Cache(format!("shape {shape:?} overflows")))?;
        let payload = reader.take(payload_len)?;
        if reader.pos != bytes.len() {
            return Err(EstimateError::Cache("trailing bytes".into()));
        }
        let data = payload
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Ok(Self { shape, data })
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| EstimateError::Cache("truncated file".into()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }
}

/// Stage artifact store rooted at one directory. A disabled cache never hits and never writes.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
    enabled: bool,
}

impl ArtifactCache {
    pub fn new<P: AsRef<Path>>(dir: P, enabled: bool) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            enabled,
        }
    }

    pub fn disabled() -> Self {
        Self::new(PathBuf::new(), false)
    }

    pub fn path(&self, stage: &str, key: CacheKey) -> PathBuf {
        self.dir.join(format!("{stage}-{key}.bin"))
    }

    /// Cached artifact for `(stage, key)`. Unreadable or outdated files are ignored with a warning.
    pub fn load(&self, stage: &str, key: CacheKey) -> Option<Artifact> {
        if !self.enabled {
            return None;
        }
        let path = self.path(stage, key);
        let bytes = fs::read(&path).ok()?;
        match Artifact::decode(&bytes, stage, key) {
            Ok(artifact) => {
                debug!("Cache hit for '{stage}' ({})", path.display());
                Some(artifact)
            }
            Err(e) => {
                warn!("Ignoring stale cache file {}: {e}", path.display());
                None
            }
        }
    }

    pub fn store(&self, stage: &str, key: CacheKey, artifact: &Artifact) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        fs::create_dir_all(&self.dir)?;
        let path = self.path(stage, key);
        // Never leave a partial file under the final name.
        let partial = path.with_extension("partial");
        fs::write(&partial, artifact.encode(stage, key))?;
        fs::rename(&partial, &path)?;
        debug!("Cached '{stage}' at {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fnv_matches_reference_vectors() {
        assert_eq!(KeyBuilder::default().finish().0, 0xcbf2_9ce4_8422_2325);
        assert_eq!(KeyBuilder::default().bytes(b"a").finish().0, 0xaf63_dc4c_8601_ec8c);
        assert_ne!(
            KeyBuilder::new("exposure").f32s(&[1.0]).finish(),
            KeyBuilder::new("exposure").f32s(&[1.5]).finish()
        );
    }

    #[test]
    fn store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path(), true);
        let key = KeyBuilder::new("exposure").u64(3).finish();
        let artifact = Artifact::new(vec![2, 3], vec![1.0, 2.0, f32::NAN, 4.0, 5.0, 6.0]).unwrap();
        cache.store("exposure", key, &artifact).unwrap();

        let loaded = cache.load("exposure", key).unwrap();
        assert_eq!(loaded.shape, vec![2, 3]);
        assert!(loaded.data[2].is_nan());
        assert_eq!(loaded.data[5], 6.0);

        let other = KeyBuilder::new("exposure").u64(4).finish();
        assert!(cache.load("exposure", other).is_none());
    }

    #[test]
    fn stale_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path(), true);
        let key = CacheKey(42);
        let artifact = Artifact::new(vec![1], vec![7.0]).unwrap();
        cache.store("reprojection", key, &artifact).unwrap();

        // Older format version.
        let path = cache.path("reprojection", key);
        let mut bytes = fs::read(&path).unwrap();
        bytes[4] = CACHE_VERSION.wrapping_sub(1);
        fs::write(&path, &bytes).unwrap();
        assert!(cache.load("reprojection", key).is_none());

        // Truncated payload.
        let mut bytes = artifact.encode("reprojection", key);
        bytes.pop();
        fs::write(&path, &bytes).unwrap();
        assert!(cache.load("reprojection", key).is_none());
    }

    #[test]
    fn oversized_shape_is_a_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path(), true);
        let key = CacheKey(9);
        let corrupt = Artifact {
            shape: vec![usize::MAX, 2],
            data: vec![],
        };
        fs::write(cache.path("correspondence", key), corrupt.encode("correspondence", key)).unwrap();
        assert!(cache.load("correspondence", key).is_none());
        assert!(Artifact::new(vec![usize::MAX, 2], vec![]).is_err());
    }

    #[test]
    fn disabled_cache_is_inert() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ArtifactCache::new(dir.path().join("off"), false);
        let artifact = Artifact::new(vec![1], vec![1.0]).unwrap();
        cache.store("exposure", CacheKey(1), &artifact).unwrap();
        assert!(!dir.path().join("off").exists());
        assert!(cache.load("exposure", CacheKey(1)).is_none());
        assert!(Artifact::new(vec![2, 2], vec![0.0; 3]).is_err());
    }
}
