use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use syncstore_base::Hash;
use tracing::{debug, instrument};

use super::{
    ChunkNotFoundSnafu, DagError, DecodeDataSnafu, DecodeHeadSnafu, DecodeMetaSnafu,
    InvalidRefCountSnafu,
    chunk::{Chunk, ChunkHasher, HashValidator, default_hasher, default_validator},
    gc::{self, HeadChange, RefCountSource},
    key::{chunk_data_key, chunk_meta_key, chunk_ref_count_key, head_key},
};
use crate::{
    config::Config,
    kv::{self, ReadKv},
};

/// A chunk store over a key-value database.
///
/// Cloning is cheap, clones share the database.
#[derive(derive_more::Debug, Clone)]
pub struct Store {
    kv: kv::Store,
    #[debug("ChunkHasher")]
    chunk_hasher: ChunkHasher,
    #[debug("HashValidator")]
    assert_valid_hash: HashValidator,
}

impl Store {
    /// Creates a store with the default hasher and temp hash validation.
    pub fn new(kv: kv::Store) -> Self {
        Self::with_hasher(kv, default_hasher(), default_validator())
    }

    /// Opens the store `config` describes, on disk when it names a path and
    /// in memory otherwise.
    pub fn open(config: &Config) -> Result<Self, DagError> {
        let kv = match &config.path {
            Some(path) => kv::Store::persistent(path)?,
            None => kv::Store::in_memory()?,
        };
        Ok(Self::new(kv))
    }

    /// Creates a store with a custom chunk hasher and hash validator.
    pub fn with_hasher(
        kv: kv::Store,
        chunk_hasher: ChunkHasher,
        assert_valid_hash: HashValidator,
    ) -> Self {
        Self {
            kv,
            chunk_hasher,
            assert_valid_hash,
        }
    }

    /// The underlying key-value store.
    pub fn kv(&self) -> &kv::Store {
        &self.kv
    }

    /// Starts a read transaction.
    pub fn read(&self) -> Result<Read, DagError> {
        Ok(Read {
            kv: self.kv.read()?,
            chunk_hasher: self.chunk_hasher.clone(),
        })
    }

    /// Starts a write transaction.
    ///
    /// Only one write transaction is open at any time; this blocks until the
    /// previous one is committed or dropped.
    pub fn write(&self) -> Result<Write, DagError> {
        Ok(Write {
            kv: self.kv.write()?,
            chunk_hasher: self.chunk_hasher.clone(),
            assert_valid_hash: self.assert_valid_hash.clone(),
            put_chunks: BTreeSet::new(),
            changed_heads: BTreeMap::new(),
        })
    }
}

/// Read access to chunks and heads, shared by [`Read`] and [`Write`].
pub trait Readable {
    /// The key-value view this reads from.
    fn kv(&self) -> &dyn ReadKv;

    /// The hasher chunks created through this view use.
    fn chunk_hasher(&self) -> &ChunkHasher;

    /// Creates a chunk without storing it.
    fn create_chunk(&self, data: Value, refs: Vec<Hash>) -> Chunk {
        Chunk::new(data, refs, self.chunk_hasher())
    }

    /// Whether the chunk is stored.
    fn has_chunk(&self, hash: &Hash) -> Result<bool, DagError> {
        Ok(self.kv().has(&chunk_data_key(hash))?)
    }

    /// Loads a chunk; a missing chunk is `None`, not an error.
    fn get_chunk(&self, hash: &Hash) -> Result<Option<Chunk>, DagError> {
        let Some(data) = self.kv().get(&chunk_data_key(hash))? else {
            return Ok(None);
        };
        let data: Value =
            serde_json::from_slice(&data).context(DecodeDataSnafu { hash: *hash })?;
        let refs = read_refs(self.kv(), hash)?;
        Ok(Some(Chunk::with_hash(*hash, data, refs)))
    }

    /// Loads a chunk that must exist.
    fn must_get_chunk(&self, hash: &Hash) -> Result<Chunk, DagError> {
        self.get_chunk(hash)?
            .context(ChunkNotFoundSnafu { hash: *hash })
    }

    /// The current target of the head `name`.
    fn get_head(&self, name: &str) -> Result<Option<Hash>, DagError> {
        let Some(value) = self.kv().get(&head_key(name))? else {
            return Ok(None);
        };
        let bytes: [u8; 32] = value
            .as_slice()
            .try_into()
            .ok()
            .context(DecodeHeadSnafu { name })?;
        Ok(Some(Hash::from(bytes)))
    }
}

fn read_refs(kv: &dyn ReadKv, hash: &Hash) -> Result<Vec<Hash>, DagError> {
    match kv.get(&chunk_meta_key(hash))? {
        Some(meta) => postcard::from_bytes(&meta).context(DecodeMetaSnafu { hash: *hash }),
        None => Ok(Vec::new()),
    }
}

fn read_ref_count(kv: &dyn ReadKv, hash: &Hash) -> Result<u16, DagError> {
    let Some(value) = kv.get(&chunk_ref_count_key(hash))? else {
        return Ok(0);
    };
    let text = String::from_utf8_lossy(&value);
    serde_json::from_str::<serde_json::Number>(&text)
        .ok()
        .and_then(|n| n.as_u64())
        .and_then(|n| u16::try_from(n).ok())
        .context(InvalidRefCountSnafu {
            value: text.into_owned(),
        })
}

/// A read transaction.
#[derive(derive_more::Debug)]
pub struct Read {
    kv: kv::Read,
    #[debug("ChunkHasher")]
    chunk_hasher: ChunkHasher,
}

impl Readable for Read {
    fn kv(&self) -> &dyn ReadKv {
        &self.kv
    }

    fn chunk_hasher(&self) -> &ChunkHasher {
        &self.chunk_hasher
    }
}

/// A write transaction.
///
/// Chunks and heads written here are visible through this transaction right
/// away. Ref counts are settled and unreferenced chunks collected on
/// [`Write::commit`]. Dropping the write discards everything.
#[derive(derive_more::Debug)]
pub struct Write {
    kv: kv::Write,
    #[debug("ChunkHasher")]
    chunk_hasher: ChunkHasher,
    #[debug("HashValidator")]
    assert_valid_hash: HashValidator,
    put_chunks: BTreeSet<Hash>,
    changed_heads: BTreeMap<String, HeadChange>,
}

impl Readable for Write {
    fn kv(&self) -> &dyn ReadKv {
        &self.kv
    }

    fn chunk_hasher(&self) -> &ChunkHasher {
        &self.chunk_hasher
    }
}

impl RefCountSource for Write {
    fn get_ref_count(&self, hash: &Hash) -> Result<u16, DagError> {
        read_ref_count(&self.kv, hash)
    }

    fn get_refs(&self, hash: &Hash) -> Result<Vec<Hash>, DagError> {
        read_refs(&self.kv, hash)
    }
}

impl Write {
    /// Stores a chunk. Refs are only written when there are any.
    pub fn put_chunk(&mut self, chunk: &Chunk) -> Result<(), DagError> {
        (self.assert_valid_hash)(&chunk.hash())?;
        for r in chunk.refs() {
            (self.assert_valid_hash)(r)?;
        }
        let data = chunk.data().to_string();
        self.kv.put(&chunk_data_key(&chunk.hash()), data.as_bytes())?;
        if !chunk.refs().is_empty() {
            let meta = postcard::to_stdvec(chunk.refs()).context(super::EncodeMetaSnafu)?;
            self.kv.put(&chunk_meta_key(&chunk.hash()), &meta)?;
        }
        self.put_chunks.insert(chunk.hash());
        Ok(())
    }

    /// Points the head `name` at `hash`.
    pub fn set_head(&mut self, name: &str, hash: Hash) -> Result<(), DagError> {
        (self.assert_valid_hash)(&hash)?;
        self.change_head(name, Some(hash))
    }

    /// Removes the head `name`.
    pub fn remove_head(&mut self, name: &str) -> Result<(), DagError> {
        self.change_head(name, None)
    }

    fn change_head(&mut self, name: &str, new: Option<Hash>) -> Result<(), DagError> {
        let old = self.get_head(name)?;
        let key = head_key(name);
        match new {
            Some(hash) => self.kv.put(&key, hash.as_bytes())?,
            None => self.kv.del(&key)?,
        }
        self.changed_heads
            .entry(name.to_string())
            .and_modify(|change| change.new = new)
            .or_insert(HeadChange { old, new });
        Ok(())
    }

    /// Settles ref counts, removes unreferenced chunks and commits.
    #[instrument(
        skip(self),
        fields(heads = self.changed_heads.len(), chunks = self.put_chunks.len())
    )]
    pub fn commit(mut self) -> Result<(), DagError> {
        let updates =
            gc::compute_ref_count_updates(self.changed_heads.values(), &self.put_chunks, &self)?;
        let mut collected = 0usize;
        for (hash, count) in updates {
            if count == 0 {
                self.kv.del(&chunk_data_key(&hash))?;
                self.kv.del(&chunk_meta_key(&hash))?;
                self.kv.del(&chunk_ref_count_key(&hash))?;
                collected += 1;
            } else {
                self.kv
                    .put(&chunk_ref_count_key(&hash), count.to_string().as_bytes())?;
            }
        }
        debug!(collected, "dag write committed");
        self.kv.commit()?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn kv_mut(&mut self) -> &mut kv::Write {
        &mut self.kv
    }
}
