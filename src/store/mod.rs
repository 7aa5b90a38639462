//! Document store: the persistence boundary. Spec.md §1 calls this an
//! external collaborator — this crate only defines the contract
//! ([`DocumentStore`]) and the on-disk metadata-record framing
//! ([`MetadataRecord`]); [`memory_store`] is a reference/test collaborator,
//! not a production implementation.

pub mod memory_store;

use crate::error::Result;
use crate::failover::FailoverEntry;
use crate::key::StoredKey;
use crate::value::{ConflictResMode, Datatype};

/// The three on-disk metadata-record generations (spec.md §6.2). Readers
/// accept all three; writers always emit V2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataRecord {
    /// Compare-and-swap token.
    pub cas: i64,
    /// Absolute expiry.
    pub exptime: u32,
    /// Client flags.
    pub flags: u32,
    /// Payload encoding. `None` for a V0 record (no datatype byte).
    pub datatype: Option<Datatype>,
    /// Conflict-resolution mode. `None` for V0/V1 records.
    pub conflict_res_mode: Option<ConflictResMode>,
}

const V0_LEN: usize = 8 + 4 + 4;
const V1_LEN: usize = V0_LEN + 1 + 1; // + flex byte + datatype
const V2_LEN: usize = V1_LEN + 1; // + conflict-resolution mode

impl MetadataRecord {
    /// Decodes whichever generation `bytes` encodes, keyed by its length.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < V0_LEN {
            return Err(crate::error::EngineError::Corruption(
                "metadata record shorter than V0 layout".into(),
            ));
        }
        let cas = i64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let exptime = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let flags = u32::from_le_bytes(bytes[12..16].try_into().unwrap());

        let datatype = if bytes.len() >= V1_LEN {
            Some(Datatype::from_u8(bytes[17]))
        } else {
            None
        };
        let conflict_res_mode = if bytes.len() >= V2_LEN {
            Some(match bytes[18] {
                0 => ConflictResMode::RevisionSeqno,
                _ => ConflictResMode::LogicalClock,
            })
        } else {
            None
        };

        Ok(Self {
            cas,
            exptime,
            flags,
            datatype,
            conflict_res_mode,
        })
    }

    /// Always encodes the current (V2) layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(V2_LEN);
        out.extend_from_slice(&self.cas.to_le_bytes());
        out.extend_from_slice(&self.exptime.to_le_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.push(0); // flex byte, reserved
        out.push(self.datatype.unwrap_or(Datatype::Raw).to_u8());
        out.push(match self.conflict_res_mode.unwrap_or(ConflictResMode::RevisionSeqno) {
            ConflictResMode::RevisionSeqno => 0,
            ConflictResMode::LogicalClock => 1,
        });
        out
    }
}

/// Per-partition persisted state document (spec.md §6.2).
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    /// Highest seqno durably committed.
    pub last_seqno: i64,
    /// Start of the last complete snapshot persisted.
    pub last_snap_start: i64,
    /// End of the last complete snapshot persisted.
    pub last_snap_end: i64,
    /// Highest cas observed.
    pub max_cas: i64,
    /// Highest seqno purged by the collection-purge task.
    pub purge_seqno: i64,
    /// Highest revSeqno among deleted items, for tombstone GC.
    pub max_deleted_rev_seqno: u64,
    /// This partition's failover history.
    pub failover: Vec<FailoverEntry>,
}

/// One document mutation within a [`CommitBatch`].
pub struct DocumentMutation {
    /// Fully qualified key.
    pub key: StoredKey,
    /// Decoded metadata, always written back as V2.
    pub metadata: MetadataRecord,
    /// `None` for a tombstone (deleted, no body retained).
    pub value: Option<Vec<u8>>,
    /// Order stamp this mutation was committed under.
    pub by_seqno: i64,
}

/// One document returned by [`DocumentStore::scan_by_seqno`]: a committed
/// record plus the seqno it was written under, enough to rebuild a DCP
/// mutation/deletion message during backfill.
pub struct BackfillRecord {
    /// Fully qualified key.
    pub key: StoredKey,
    /// Decoded metadata.
    pub metadata: MetadataRecord,
    /// `None` for a tombstone.
    pub value: Option<Vec<u8>>,
    /// Order stamp this record was committed under.
    pub by_seqno: i64,
}

/// Everything `flushOne` commits atomically (spec.md §4.4).
pub struct CommitBatch {
    /// Document upserts/tombstones, already deduplicated by key.
    pub documents: Vec<DocumentMutation>,
    /// Updated partition state document.
    pub state: PersistedState,
    /// Serialized collections-manifest JSON document.
    pub collections_manifest_json: Vec<u8>,
}

/// The persistence contract a partition's flusher commits through.
/// Deliberately outside this crate's scope to implement for real; see the
/// module docs.
pub trait DocumentStore: Send + Sync {
    /// Commits `batch` for `partition_id` as a single transaction.
    fn commit(&self, partition_id: u16, batch: CommitBatch) -> Result<()>;

    /// Reads back the persisted state document, if the partition has ever
    /// been flushed.
    fn persisted_state(&self, partition_id: u16) -> Option<PersistedState>;

    /// Reads a document back by key (used by background fetch).
    fn get(&self, partition_id: u16, key: &StoredKey) -> Option<(MetadataRecord, Option<Vec<u8>>)>;

    /// Reads the persisted collections-manifest JSON document, if any.
    fn collections_manifest_json(&self, partition_id: u16) -> Option<Vec<u8>>;

    /// Scans committed records with `after_seqno < bySeqno <= through_seqno`,
    /// in ascending seqno order, up to `limit` records. Backs the DCP
    /// Backfill phase's read of data already expired from the in-memory
    /// checkpoint log (spec.md §4.6).
    fn scan_by_seqno(
        &self,
        partition_id: u16,
        after_seqno: i64,
        through_seqno: i64,
        limit: usize,
    ) -> Vec<BackfillRecord>;
}
