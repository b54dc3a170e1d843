use std::io::{self, Read};
use thiserror::Error;

/// Event tags with a stable on-disk value. Unknown tags on read are fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogEvent {
    Open = 0,
    DefineTablet = 1,
    CompactionStart = 2,
    CompactionFinish = 3,
    ManyMutations = 4,
}

impl LogEvent {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            0 => Ok(LogEvent::Open),
            1 => Ok(LogEvent::DefineTablet),
            2 => Ok(LogEvent::CompactionStart),
            3 => Ok(LogEvent::CompactionFinish),
            4 => Ok(LogEvent::ManyMutations),
            other => Err(CodecError::UnknownEvent(other)),
        }
    }
}

/// Row-range descriptor for a tablet. `end_row`/`prev_end_row` of `None`
/// mean the range is unbounded on that side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletExtent {
    pub table_id: String,
    pub end_row: Option<Vec<u8>>,
    pub prev_end_row: Option<Vec<u8>>,
}

impl TabletExtent {
    pub fn new(
        table_id: impl Into<String>,
        end_row: Option<Vec<u8>>,
        prev_end_row: Option<Vec<u8>>,
    ) -> Self {
        Self {
            table_id: table_id.into(),
            end_row,
            prev_end_row,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnUpdate {
    pub family: Vec<u8>,
    pub qualifier: Vec<u8>,
    pub timestamp: i64,
    pub delete: bool,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub row: Vec<u8>,
    pub updates: Vec<ColumnUpdate>,
}

impl Mutation {
    pub fn new(row: impl Into<Vec<u8>>) -> Self {
        Self {
            row: row.into(),
            updates: Vec::new(),
        }
    }

    pub fn put(
        &mut self,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) {
        self.updates.push(ColumnUpdate {
            family: family.into(),
            qualifier: qualifier.into(),
            timestamp: 0,
            delete: false,
            value: value.into(),
        });
    }

    pub fn put_at(
        &mut self,
        family: impl Into<Vec<u8>>,
        qualifier: impl Into<Vec<u8>>,
        timestamp: i64,
        value: impl Into<Vec<u8>>,
    ) {
        self.updates.push(ColumnUpdate {
            family: family.into(),
            qualifier: qualifier.into(),
            timestamp,
            delete: false,
            value: value.into(),
        });
    }

    pub fn delete(&mut self, family: impl Into<Vec<u8>>, qualifier: impl Into<Vec<u8>>) {
        self.updates.push(ColumnUpdate {
            family: family.into(),
            qualifier: qualifier.into(),
            timestamp: 0,
            delete: true,
            value: Vec::new(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogKey {
    pub event: LogEvent,
    pub seq: i64,
    pub tablet_id: i32,
    pub extent: Option<TabletExtent>,
    pub filename: Option<String>,
    pub session: Option<String>,
}

impl LogKey {
    pub fn open(session: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            event: LogEvent::Open,
            seq: 0,
            tablet_id: -1,
            extent: None,
            filename: Some(filename.into()),
            session: Some(session.into()),
        }
    }

    pub fn define_tablet(seq: i64, tablet_id: i32, extent: TabletExtent) -> Self {
        Self {
            event: LogEvent::DefineTablet,
            seq,
            tablet_id,
            extent: Some(extent),
            filename: None,
            session: None,
        }
    }

    pub fn compaction_start(seq: i64, tablet_id: i32, filename: impl Into<String>) -> Self {
        Self {
            event: LogEvent::CompactionStart,
            seq,
            tablet_id,
            extent: None,
            filename: Some(filename.into()),
            session: None,
        }
    }

    pub fn compaction_finish(seq: i64, tablet_id: i32) -> Self {
        Self {
            event: LogEvent::CompactionFinish,
            seq,
            tablet_id,
            extent: None,
            filename: None,
            session: None,
        }
    }

    pub fn many_mutations(seq: i64, tablet_id: i32) -> Self {
        Self {
            event: LogEvent::ManyMutations,
            seq,
            tablet_id,
            extent: None,
            filename: None,
            session: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogValue {
    pub mutations: Vec<Mutation>,
}

impl LogValue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_mutations(mutations: Vec<Mutation>) -> Self {
        Self { mutations }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("record I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("unknown event tag {0}")]
    UnknownEvent(u8),
    #[error("record field is not valid UTF-8")]
    BadUtf8,
    #[error("implausible field length {0}")]
    BadLength(u32),
}

// Individual fields never approach this; a larger length means the stream is
// desynchronized or corrupt.
const MAX_FIELD_BYTES: u32 = 256 << 20;

/// Deterministic encoding of one `(key, value)` record. All integers are
/// big-endian; strings are `u16`-length-prefixed UTF-8; byte arrays are
/// `u32`-length-prefixed.
pub fn encode_record(key: &LogKey, value: &LogValue) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    buf.push(key.event.tag());
    buf.extend_from_slice(&key.seq.to_be_bytes());
    buf.extend_from_slice(&key.tablet_id.to_be_bytes());
    match &key.extent {
        Some(extent) => {
            buf.push(1);
            put_str(&mut buf, &extent.table_id);
            put_opt_bytes(&mut buf, extent.end_row.as_deref());
            put_opt_bytes(&mut buf, extent.prev_end_row.as_deref());
        }
        None => buf.push(0),
    }
    put_opt_str(&mut buf, key.filename.as_deref());
    put_opt_str(&mut buf, key.session.as_deref());

    buf.extend_from_slice(&(value.mutations.len() as u32).to_be_bytes());
    for mutation in &value.mutations {
        put_bytes(&mut buf, &mutation.row);
        buf.extend_from_slice(&(mutation.updates.len() as u32).to_be_bytes());
        for update in &mutation.updates {
            put_bytes(&mut buf, &update.family);
            put_bytes(&mut buf, &update.qualifier);
            buf.extend_from_slice(&update.timestamp.to_be_bytes());
            buf.push(update.delete as u8);
            put_bytes(&mut buf, &update.value);
        }
    }
    buf
}

/// Reads one record. Returns `None` on a clean end-of-stream (no byte of a
/// further record present); any partial record is an error.
pub fn read_record(reader: &mut impl Read) -> Result<Option<(LogKey, LogValue)>, CodecError> {
    let tag = match read_u8_or_eof(reader)? {
        Some(tag) => tag,
        None => return Ok(None),
    };
    let event = LogEvent::from_tag(tag)?;
    let seq = i64::from_be_bytes(read_array(reader)?);
    let tablet_id = i32::from_be_bytes(read_array(reader)?);
    let extent = if read_u8(reader)? != 0 {
        let table_id = read_str(reader)?;
        let end_row = read_opt_bytes(reader)?;
        let prev_end_row = read_opt_bytes(reader)?;
        Some(TabletExtent {
            table_id,
            end_row,
            prev_end_row,
        })
    } else {
        None
    };
    let filename = read_opt_str(reader)?;
    let session = read_opt_str(reader)?;

    let mutation_count = u32::from_be_bytes(read_array(reader)?);
    if mutation_count > MAX_FIELD_BYTES {
        return Err(CodecError::BadLength(mutation_count));
    }
    let mut mutations = Vec::with_capacity(mutation_count as usize);
    for _ in 0..mutation_count {
        let row = read_bytes(reader)?;
        let update_count = u32::from_be_bytes(read_array(reader)?);
        if update_count > MAX_FIELD_BYTES {
            return Err(CodecError::BadLength(update_count));
        }
        let mut updates = Vec::with_capacity(update_count as usize);
        for _ in 0..update_count {
            let family = read_bytes(reader)?;
            let qualifier = read_bytes(reader)?;
            let timestamp = i64::from_be_bytes(read_array(reader)?);
            let delete = read_u8(reader)? != 0;
            let value = read_bytes(reader)?;
            updates.push(ColumnUpdate {
                family,
                qualifier,
                timestamp,
                delete,
                value,
            });
        }
        mutations.push(Mutation { row, updates });
    }
    Ok(Some((
        LogKey {
            event,
            seq,
            tablet_id,
            extent,
            filename,
            session,
        },
        LogValue { mutations },
    )))
}

pub(crate) fn put_str(buf: &mut Vec<u8>, value: &str) {
    buf.extend_from_slice(&(value.len() as u16).to_be_bytes());
    buf.extend_from_slice(value.as_bytes());
}

fn put_opt_str(buf: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(value) => {
            buf.push(1);
            put_str(buf, value);
        }
        None => buf.push(0),
    }
}

fn put_bytes(buf: &mut Vec<u8>, value: &[u8]) {
    buf.extend_from_slice(&(value.len() as u32).to_be_bytes());
    buf.extend_from_slice(value);
}

fn put_opt_bytes(buf: &mut Vec<u8>, value: Option<&[u8]>) {
    match value {
        Some(value) => {
            buf.push(1);
            put_bytes(buf, value);
        }
        None => buf.push(0),
    }
}

fn read_u8(reader: &mut impl Read) -> Result<u8, CodecError> {
    let byte: [u8; 1] = read_array(reader)?;
    Ok(byte[0])
}

fn read_u8_or_eof(reader: &mut impl Read) -> Result<Option<u8>, CodecError> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

fn read_array<const N: usize>(reader: &mut impl Read) -> Result<[u8; N], CodecError> {
    let mut array = [0u8; N];
    reader.read_exact(&mut array)?;
    Ok(array)
}

pub(crate) fn read_str(reader: &mut impl Read) -> Result<String, CodecError> {
    let len = u16::from_be_bytes(read_array(reader)?) as usize;
    let mut raw = vec![0u8; len];
    reader.read_exact(&mut raw)?;
    String::from_utf8(raw).map_err(|_| CodecError::BadUtf8)
}

fn read_opt_str(reader: &mut impl Read) -> Result<Option<String>, CodecError> {
    if read_u8(reader)? != 0 {
        Ok(Some(read_str(reader)?))
    } else {
        Ok(None)
    }
}

fn read_bytes(reader: &mut impl Read) -> Result<Vec<u8>, CodecError> {
    let len = u32::from_be_bytes(read_array(reader)?);
    if len > MAX_FIELD_BYTES {
        return Err(CodecError::BadLength(len));
    }
    let mut raw = vec![0u8; len as usize];
    reader.read_exact(&mut raw)?;
    Ok(raw)
}

fn read_opt_bytes(reader: &mut impl Read) -> Result<Option<Vec<u8>>, CodecError> {
    if read_u8(reader)? != 0 {
        Ok(Some(read_bytes(reader)?))
    } else {
        Ok(None)
    }
}
