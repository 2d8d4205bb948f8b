//! Per-tenant write-ahead log.
//!
//! Each tenant owns a directory of append-only segments
//! (`{root}/{tenant}/wal/{segment_id:08}.v1`) holding length-prefixed,
//! checksummed, protobuf-encoded batch records. A batch is fsynced before the
//! append returns, so an acknowledged write survives a crash. On startup the
//! unretired segments are replayed to rebuild the in-memory state; replay of
//! a segment stops at the first truncated or corrupt record and discards the
//! remainder with a warning.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::{SequenceNumber, SpanBatch, TenantId};
use observability_deps::tracing::{debug, info, warn};
use parking_lot::Mutex;
use prost::Message;
use siphasher::sip::SipHasher24;
use snafu::{ResultExt, Snafu};
use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    hash::Hasher,
    io::{BufReader, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

/// File extension carrying the record format version.
const SEGMENT_SUFFIX: &str = "v1";

/// Bytes of framing per record: u32 length + u64 checksum.
const FRAME_BYTES: usize = 4 + 8;

/// Errors raised by WAL operations.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("error creating wal dir {}: {source}", path.display()))]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error opening wal segment {}: {source}", path.display()))]
    OpenSegment {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error writing wal segment {}: {source}", path.display()))]
    WriteSegment {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error syncing wal segment {}: {source}", path.display()))]
    SyncSegment {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error listing wal dir {}: {source}", path.display()))]
    ListDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("error deleting wal segment {}: {source}", path.display()))]
    DeleteSegment {
        path: PathBuf,
        source: std::io::Error,
    },
}

#[allow(missing_docs)]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// WAL tuning knobs.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory under which per-tenant WALs live.
    pub root: PathBuf,
    /// A segment is sealed and a new one started once it exceeds this size.
    pub segment_size: usize,
}

impl WalConfig {
    /// Config with the default 16 MiB segment size.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            segment_size: 16 * 1024 * 1024,
        }
    }
}

fn record_checksum(payload: &[u8]) -> u64 {
    let mut hasher = SipHasher24::new_with_keys(0x77616c5f, 0x6c617267);
    hasher.write(payload);
    hasher.finish()
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:08}.{SEGMENT_SUFFIX}"))
}

fn tenant_wal_dir(root: &Path, tenant: &TenantId) -> PathBuf {
    root.join(tenant.as_str()).join("wal")
}

/// One replayed record.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayedBatch {
    /// Sequence assigned at the original append.
    pub sequence: SequenceNumber,
    /// The batch.
    pub batch: SpanBatch,
}

/// A sealed or active segment the writer knows about.
#[derive(Debug, Clone, Copy)]
struct SegmentInfo {
    id: u64,
    max_sequence: SequenceNumber,
}

struct OpenSegment {
    id: u64,
    path: PathBuf,
    file: File,
    bytes_written: usize,
    max_sequence: SequenceNumber,
}

impl std::fmt::Debug for OpenSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenSegment")
            .field("id", &self.id)
            .field("bytes_written", &self.bytes_written)
            .finish()
    }
}

#[derive(Debug)]
struct WriterState {
    next_sequence: SequenceNumber,
    next_segment_id: u64,
    open: Option<OpenSegment>,
    sealed: Vec<SegmentInfo>,
}

/// The write-ahead log of a single tenant on this ingester.
#[derive(Debug)]
pub struct TenantWal {
    tenant: TenantId,
    dir: PathBuf,
    segment_size: usize,
    state: Mutex<WriterState>,
}

impl TenantWal {
    fn open_segment(&self, state: &mut WriterState) -> Result<()> {
        if state.open.is_some() {
            return Ok(());
        }
        let id = state.next_segment_id;
        state.next_segment_id += 1;
        let path = segment_path(&self.dir, id);
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .context(OpenSegmentSnafu { path: path.clone() })?;
        debug!(tenant=%self.tenant, segment=id, "opened wal segment");
        state.open = Some(OpenSegment {
            id,
            path,
            file,
            bytes_written: 0,
            max_sequence: SequenceNumber::new(0),
        });
        Ok(())
    }

    /// Append a batch, fsync it, and return its sequence number.
    ///
    /// Appends for one tenant are totally ordered by the internal lock; the
    /// caller must not acknowledge the write before this returns.
    pub fn append(&self, batch: &SpanBatch) -> Result<SequenceNumber> {
        let record = wire_types::WalRecord {
            sequence: 0, // patched below under the lock
            batch: Some(wire_types::encode_batch(batch)),
        };

        let mut state = self.state.lock();
        let sequence = state.next_sequence;
        state.next_sequence = sequence.next();

        let record = wire_types::WalRecord {
            sequence: sequence.get(),
            ..record
        };
        let mut payload = Vec::with_capacity(record.encoded_len());
        record
            .encode(&mut payload)
            .expect("vec write cannot fail");

        self.open_segment(&mut state)?;
        let segment = state.open.as_mut().expect("segment opened above");

        let mut frame = Vec::with_capacity(FRAME_BYTES + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&record_checksum(&payload).to_le_bytes());
        frame.extend_from_slice(&payload);

        segment
            .file
            .write_all(&frame)
            .context(WriteSegmentSnafu {
                path: segment.path.clone(),
            })?;
        segment.file.sync_data().context(SyncSegmentSnafu {
            path: segment.path.clone(),
        })?;

        segment.bytes_written += frame.len();
        segment.max_sequence = sequence;

        if segment.bytes_written >= self.segment_size {
            let sealed = state.open.take().expect("segment is open");
            debug!(
                tenant=%self.tenant,
                segment=sealed.id,
                bytes=sealed.bytes_written,
                "sealing wal segment"
            );
            state.sealed.push(SegmentInfo {
                id: sealed.id,
                max_sequence: sealed.max_sequence,
            });
        }

        Ok(sequence)
    }

    /// Seal the active segment so it becomes eligible for retirement.
    pub fn roll(&self) {
        let mut state = self.state.lock();
        if let Some(sealed) = state.open.take() {
            state.sealed.push(SegmentInfo {
                id: sealed.id,
                max_sequence: sealed.max_sequence,
            });
        }
    }

    /// Delete sealed segments whose records are all at or below
    /// `up_to`, i.e. durably flushed into a block.
    pub fn retire(&self, up_to: SequenceNumber) -> Result<()> {
        let retired: Vec<SegmentInfo> = {
            let mut state = self.state.lock();
            let (retired, keep): (Vec<_>, Vec<_>) = state
                .sealed
                .iter()
                .copied()
                .partition(|s| s.max_sequence <= up_to);
            state.sealed = keep;
            retired
        };

        for segment in retired {
            let path = segment_path(&self.dir, segment.id);
            std::fs::remove_file(&path).context(DeleteSegmentSnafu { path: path.clone() })?;
            info!(
                tenant=%self.tenant,
                segment=segment.id,
                max_sequence=segment.max_sequence.get(),
                "retired wal segment"
            );
        }
        Ok(())
    }

    /// The highest sequence number handed out so far.
    pub fn max_sequence(&self) -> SequenceNumber {
        let state = self.state.lock();
        SequenceNumber::new(state.next_sequence.get() - 1)
    }
}

/// The write-ahead log of one ingester process: a [`TenantWal`] per tenant.
#[derive(Debug)]
pub struct Wal {
    config: WalConfig,
    tenants: Mutex<BTreeMap<TenantId, Arc<TenantWal>>>,
}

impl Wal {
    /// Open (or create) the WAL under `config.root`.
    pub fn new(config: WalConfig) -> Self {
        Self {
            config,
            tenants: Mutex::new(BTreeMap::new()),
        }
    }

    /// The tenant's WAL, creating its directory on first use.
    pub fn tenant(&self, tenant: &TenantId) -> Result<Arc<TenantWal>> {
        let mut tenants = self.tenants.lock();
        if let Some(wal) = tenants.get(tenant) {
            return Ok(Arc::clone(wal));
        }

        let dir = tenant_wal_dir(&self.config.root, tenant);
        std::fs::create_dir_all(&dir).context(CreateDirSnafu { path: dir.clone() })?;

        // resume after the highest segment already on disk
        let existing = list_segment_ids(&dir)?;
        let next_segment_id = existing.last().map(|id| id + 1).unwrap_or(0);

        let wal = Arc::new(TenantWal {
            tenant: tenant.clone(),
            dir,
            segment_size: self.config.segment_size,
            state: Mutex::new(WriterState {
                next_sequence: SequenceNumber::new(1),
                next_segment_id,
                open: None,
                sealed: vec![],
            }),
        });
        tenants.insert(tenant.clone(), Arc::clone(&wal));
        Ok(wal)
    }

    /// Tenants with WAL directories on disk, whether or not they have been
    /// opened this process lifetime.
    pub fn tenants_on_disk(&self) -> Result<Vec<TenantId>> {
        let mut out = vec![];
        let root = &self.config.root;
        if !root.exists() {
            return Ok(out);
        }
        let entries = std::fs::read_dir(root).context(ListDirSnafu { path: root.clone() })?;
        for entry in entries {
            let entry = entry.context(ListDirSnafu { path: root.clone() })?;
            if !entry.path().is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(tenant) = TenantId::new(name.to_string()) {
                    out.push(tenant);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Replay every record of the tenant's on-disk segments in order.
    ///
    /// Sets the tenant's next sequence number past the highest replayed one,
    /// so appends after replay continue the sequence. Must therefore be
    /// called before the first append for the tenant.
    pub fn replay_tenant(&self, tenant: &TenantId) -> Result<Vec<ReplayedBatch>> {
        let wal = self.tenant(tenant)?;
        let segment_ids = list_segment_ids(&wal.dir)?;

        let mut replayed = vec![];
        let mut sealed = vec![];
        for id in segment_ids {
            let path = segment_path(&wal.dir, id);
            let records = replay_segment(&path)?;
            let max_sequence = records
                .last()
                .map(|r| r.sequence)
                .unwrap_or_else(|| SequenceNumber::new(0));
            sealed.push(SegmentInfo { id, max_sequence });
            replayed.extend(records);
        }

        let mut state = wal.state.lock();
        let max = replayed
            .iter()
            .map(|r| r.sequence.get())
            .max()
            .unwrap_or(0);
        state.next_sequence = SequenceNumber::new(max + 1);
        state.sealed = sealed;
        drop(state);

        info!(
            tenant=%tenant,
            records=replayed.len(),
            "replayed wal"
        );
        Ok(replayed)
    }
}

fn list_segment_ids(dir: &Path) -> Result<Vec<u64>> {
    let mut ids = vec![];
    if !dir.exists() {
        return Ok(ids);
    }
    let entries = std::fs::read_dir(dir).context(ListDirSnafu {
        path: dir.to_path_buf(),
    })?;
    for entry in entries {
        let entry = entry.context(ListDirSnafu {
            path: dir.to_path_buf(),
        })?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(&format!(".{SEGMENT_SUFFIX}")) else {
            continue;
        };
        if let Ok(id) = stem.parse::<u64>() {
            ids.push(id);
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

/// Read records until EOF or the first integrity failure. A short or corrupt
/// tail is logged and discarded, per the crash-recovery contract.
fn replay_segment(path: &Path) -> Result<Vec<ReplayedBatch>> {
    let file = File::open(path).context(OpenSegmentSnafu {
        path: path.to_path_buf(),
    })?;
    let mut reader = BufReader::new(file);
    let mut records = vec![];

    loop {
        let mut frame_header = [0u8; FRAME_BYTES];
        match read_exact_or_eof(&mut reader, &mut frame_header) {
            ReadOutcome::Eof => break,
            ReadOutcome::Short => {
                warn!(path=%path.display(), "truncated wal frame header, discarding tail");
                break;
            }
            ReadOutcome::Err(source) => {
                return Err(Error::OpenSegment {
                    path: path.to_path_buf(),
                    source,
                })
            }
            ReadOutcome::Full => {}
        }

        let len = u32::from_le_bytes(frame_header[..4].try_into().expect("4 bytes")) as usize;
        let checksum = u64::from_le_bytes(frame_header[4..].try_into().expect("8 bytes"));

        let mut payload = vec![0u8; len];
        match read_exact_or_eof(&mut reader, &mut payload) {
            ReadOutcome::Full => {}
            ReadOutcome::Eof | ReadOutcome::Short => {
                warn!(path=%path.display(), "truncated wal record, discarding tail");
                break;
            }
            ReadOutcome::Err(source) => {
                return Err(Error::OpenSegment {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }

        if record_checksum(&payload) != checksum {
            warn!(path=%path.display(), "wal record checksum mismatch, discarding tail");
            break;
        }

        let record = match wire_types::WalRecord::decode(payload.as_slice()) {
            Ok(record) => record,
            Err(e) => {
                warn!(path=%path.display(), error=%e, "undecodable wal record, discarding tail");
                break;
            }
        };
        let Some(batch) = record.batch.as_ref() else {
            warn!(path=%path.display(), "wal record without batch, discarding tail");
            break;
        };
        let batch = match wire_types::decode_batch(batch) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(path=%path.display(), error=%e, "invalid wal batch, discarding tail");
                break;
            }
        };

        records.push(ReplayedBatch {
            sequence: SequenceNumber::new(record.sequence),
            batch,
        });
    }

    Ok(records)
}

enum ReadOutcome {
    Full,
    Eof,
    Short,
    Err(std::io::Error),
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return ReadOutcome::Eof,
            Ok(0) => return ReadOutcome::Short,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return ReadOutcome::Err(e),
        }
    }
    ReadOutcome::Full
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{Resource, Span, SpanId, SpanKind, SpanStatus, TraceId};

    fn batch(n: u8) -> SpanBatch {
        SpanBatch {
            resource: Resource {
                service_name: "svc".into(),
                attributes: vec![],
            },
            spans: vec![Span {
                trace_id: TraceId::new([n; 16]),
                span_id: SpanId::new([n; 8]),
                parent_span_id: None,
                name: format!("op-{n}").into(),
                kind: SpanKind::Internal,
                start_unix_nanos: n as i64,
                end_unix_nanos: n as i64 + 10,
                status: SpanStatus::default(),
                attributes: vec![],
                events: vec![],
                links: vec![],
            }],
        }
    }

    fn tenant() -> TenantId {
        TenantId::new("t1").unwrap()
    }

    #[test]
    fn append_replay_round_trip() {
        let dir = test_helpers::tmp_dir().unwrap();
        let wal = Wal::new(WalConfig::new(dir.path()));
        let t = wal.tenant(&tenant()).unwrap();

        let s1 = t.append(&batch(1)).unwrap();
        let s2 = t.append(&batch(2)).unwrap();
        assert_eq!(s1, SequenceNumber::new(1));
        assert_eq!(s2, SequenceNumber::new(2));

        // fresh process
        let wal = Wal::new(WalConfig::new(dir.path()));
        let replayed = wal.replay_tenant(&tenant()).unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].sequence, s1);
        assert_eq!(replayed[0].batch, batch(1));
        assert_eq!(replayed[1].batch, batch(2));

        // sequence numbers continue after replay
        let t = wal.tenant(&tenant()).unwrap();
        assert_eq!(t.append(&batch(3)).unwrap(), SequenceNumber::new(3));
    }

    #[test]
    fn truncated_tail_is_discarded() {
        let dir = test_helpers::tmp_dir().unwrap();
        let wal = Wal::new(WalConfig::new(dir.path()));
        let t = wal.tenant(&tenant()).unwrap();
        t.append(&batch(1)).unwrap();
        t.append(&batch(2)).unwrap();

        // chop bytes off the end of the only segment
        let seg = segment_path(&tenant_wal_dir(dir.path(), &tenant()), 0);
        let bytes = std::fs::read(&seg).unwrap();
        std::fs::write(&seg, &bytes[..bytes.len() - 5]).unwrap();

        let wal = Wal::new(WalConfig::new(dir.path()));
        let replayed = wal.replay_tenant(&tenant()).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].batch, batch(1));
    }

    #[test]
    fn corrupt_record_terminates_replay() {
        let dir = test_helpers::tmp_dir().unwrap();
        let wal = Wal::new(WalConfig::new(dir.path()));
        let t = wal.tenant(&tenant()).unwrap();
        t.append(&batch(1)).unwrap();
        let second_start = {
            let seg = segment_path(&tenant_wal_dir(dir.path(), &tenant()), 0);
            std::fs::metadata(&seg).unwrap().len() as usize
        };
        t.append(&batch(2)).unwrap();
        t.append(&batch(3)).unwrap();

        // flip a byte inside the second record's payload
        let seg = segment_path(&tenant_wal_dir(dir.path(), &tenant()), 0);
        let mut bytes = std::fs::read(&seg).unwrap();
        bytes[second_start + FRAME_BYTES + 2] ^= 0xff;
        std::fs::write(&seg, &bytes).unwrap();

        let wal = Wal::new(WalConfig::new(dir.path()));
        let replayed = wal.replay_tenant(&tenant()).unwrap();
        assert_eq!(replayed.len(), 1, "records after the corruption are lost");
    }

    #[test]
    fn segments_roll_and_retire() {
        let dir = test_helpers::tmp_dir().unwrap();
        let config = WalConfig {
            root: dir.path().to_path_buf(),
            segment_size: 1, // roll after every record
        };
        let wal = Wal::new(config);
        let t = wal.tenant(&tenant()).unwrap();
        t.append(&batch(1)).unwrap();
        t.append(&batch(2)).unwrap();
        t.append(&batch(3)).unwrap();

        let wal_dir = tenant_wal_dir(dir.path(), &tenant());
        assert_eq!(list_segment_ids(&wal_dir).unwrap(), vec![0, 1, 2]);

        // spans up to sequence 2 are flushed; their segments go away
        t.retire(SequenceNumber::new(2)).unwrap();
        assert_eq!(list_segment_ids(&wal_dir).unwrap(), vec![2]);

        let wal = Wal::new(WalConfig::new(dir.path()));
        let replayed = wal.replay_tenant(&tenant()).unwrap();
        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].sequence, SequenceNumber::new(3));
    }

    #[test]
    fn tenants_on_disk_lists_replayable_tenants() {
        let dir = test_helpers::tmp_dir().unwrap();
        let wal = Wal::new(WalConfig::new(dir.path()));
        let t_a = TenantId::new("a").unwrap();
        let t_b = TenantId::new("b").unwrap();
        wal.tenant(&t_a).unwrap().append(&batch(1)).unwrap();
        wal.tenant(&t_b).unwrap().append(&batch(2)).unwrap();

        let wal = Wal::new(WalConfig::new(dir.path()));
        assert_eq!(wal.tenants_on_disk().unwrap(), vec![t_a, t_b]);
    }
}
