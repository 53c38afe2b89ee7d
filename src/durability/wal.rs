use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::durability::encoding::{
    crc32, put_string, put_u32, put_u64, put_u8, put_value, Reader,
};
use crate::error::{Error, Result};
use crate::ids::Gid;
use crate::value::PropertyValue;

pub(crate) const WAL_MAGIC: &[u8; 4] = b"MGwl";
const WAL_VERSION: u32 = 1;

/// One forward operation as stored on disk. Label, property and edge-type
/// names are written as strings so replay does not depend on mapper state.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WalRecord {
    VertexCreate { gid: Gid },
    VertexDelete { gid: Gid },
    VertexAddLabel { gid: Gid, label: String },
    VertexRemoveLabel { gid: Gid, label: String },
    VertexSetProperty { gid: Gid, property: String, value: PropertyValue },
    EdgeCreate { gid: Gid, edge_type: String, from: Gid, to: Gid },
    EdgeDelete { gid: Gid, edge_type: String, from: Gid, to: Gid },
    EdgeSetProperty { gid: Gid, property: String, value: PropertyValue },
    TransactionEnd,
    LabelIndexCreate { label: String },
    LabelIndexDrop { label: String },
    LabelPropertyIndexCreate { label: String, property: String },
    LabelPropertyIndexDrop { label: String, property: String },
    ExistenceConstraintCreate { label: String, property: String },
    ExistenceConstraintDrop { label: String, property: String },
    UniqueConstraintCreate { label: String, properties: Vec<String> },
    UniqueConstraintDrop { label: String, properties: Vec<String> },
}

impl WalRecord {
    fn tag(&self) -> u8 {
        match self {
            WalRecord::VertexCreate { .. } => 1,
            WalRecord::VertexDelete { .. } => 2,
            WalRecord::VertexAddLabel { .. } => 3,
            WalRecord::VertexRemoveLabel { .. } => 4,
            WalRecord::VertexSetProperty { .. } => 5,
            WalRecord::EdgeCreate { .. } => 6,
            WalRecord::EdgeDelete { .. } => 7,
            WalRecord::EdgeSetProperty { .. } => 8,
            WalRecord::TransactionEnd => 9,
            WalRecord::LabelIndexCreate { .. } => 10,
            WalRecord::LabelIndexDrop { .. } => 11,
            WalRecord::LabelPropertyIndexCreate { .. } => 12,
            WalRecord::LabelPropertyIndexDrop { .. } => 13,
            WalRecord::ExistenceConstraintCreate { .. } => 14,
            WalRecord::ExistenceConstraintDrop { .. } => 15,
            WalRecord::UniqueConstraintCreate { .. } => 16,
            WalRecord::UniqueConstraintDrop { .. } => 17,
        }
    }

    /// Whether this record is a schema operation applied outside any data
    /// transaction during replay.
    pub(crate) fn is_schema_op(&self) -> bool {
        self.tag() >= 10
    }

    fn encode_payload(&self, buf: &mut Vec<u8>) {
        match self {
            WalRecord::VertexCreate { gid } | WalRecord::VertexDelete { gid } => {
                put_u64(buf, gid.as_u64());
            }
            WalRecord::VertexAddLabel { gid, label }
            | WalRecord::VertexRemoveLabel { gid, label } => {
                put_u64(buf, gid.as_u64());
                put_string(buf, label);
            }
            WalRecord::VertexSetProperty { gid, property, value }
            | WalRecord::EdgeSetProperty { gid, property, value } => {
                put_u64(buf, gid.as_u64());
                put_string(buf, property);
                put_value(buf, value);
            }
            WalRecord::EdgeCreate { gid, edge_type, from, to }
            | WalRecord::EdgeDelete { gid, edge_type, from, to } => {
                put_u64(buf, gid.as_u64());
                put_string(buf, edge_type);
                put_u64(buf, from.as_u64());
                put_u64(buf, to.as_u64());
            }
            WalRecord::TransactionEnd => {}
            WalRecord::LabelIndexCreate { label } | WalRecord::LabelIndexDrop { label } => {
                put_string(buf, label);
            }
            WalRecord::LabelPropertyIndexCreate { label, property }
            | WalRecord::LabelPropertyIndexDrop { label, property }
            | WalRecord::ExistenceConstraintCreate { label, property }
            | WalRecord::ExistenceConstraintDrop { label, property } => {
                put_string(buf, label);
                put_string(buf, property);
            }
            WalRecord::UniqueConstraintCreate { label, properties }
            | WalRecord::UniqueConstraintDrop { label, properties } => {
                put_string(buf, label);
                put_u32(buf, properties.len() as u32);
                for property in properties {
                    put_string(buf, property);
                }
            }
        }
    }

    fn decode(tag: u8, reader: &mut Reader<'_>) -> Result<Self> {
        let record = match tag {
            1 => WalRecord::VertexCreate {
                gid: Gid::from_u64(reader.read_u64()?),
            },
            2 => WalRecord::VertexDelete {
                gid: Gid::from_u64(reader.read_u64()?),
            },
            3 => WalRecord::VertexAddLabel {
                gid: Gid::from_u64(reader.read_u64()?),
                label: reader.read_string()?,
            },
            4 => WalRecord::VertexRemoveLabel {
                gid: Gid::from_u64(reader.read_u64()?),
                label: reader.read_string()?,
            },
            5 => WalRecord::VertexSetProperty {
                gid: Gid::from_u64(reader.read_u64()?),
                property: reader.read_string()?,
                value: reader.read_value()?,
            },
            6 => WalRecord::EdgeCreate {
                gid: Gid::from_u64(reader.read_u64()?),
                edge_type: reader.read_string()?,
                from: Gid::from_u64(reader.read_u64()?),
                to: Gid::from_u64(reader.read_u64()?),
            },
            7 => WalRecord::EdgeDelete {
                gid: Gid::from_u64(reader.read_u64()?),
                edge_type: reader.read_string()?,
                from: Gid::from_u64(reader.read_u64()?),
                to: Gid::from_u64(reader.read_u64()?),
            },
            8 => WalRecord::EdgeSetProperty {
                gid: Gid::from_u64(reader.read_u64()?),
                property: reader.read_string()?,
                value: reader.read_value()?,
            },
            9 => WalRecord::TransactionEnd,
            10 => WalRecord::LabelIndexCreate {
                label: reader.read_string()?,
            },
            11 => WalRecord::LabelIndexDrop {
                label: reader.read_string()?,
            },
            12 => WalRecord::LabelPropertyIndexCreate {
                label: reader.read_string()?,
                property: reader.read_string()?,
            },
            13 => WalRecord::LabelPropertyIndexDrop {
                label: reader.read_string()?,
                property: reader.read_string()?,
            },
            14 => WalRecord::ExistenceConstraintCreate {
                label: reader.read_string()?,
                property: reader.read_string()?,
            },
            15 => WalRecord::ExistenceConstraintDrop {
                label: reader.read_string()?,
                property: reader.read_string()?,
            },
            16 | 17 => {
                let label = reader.read_string()?;
                let len = reader.read_u32()? as usize;
                let mut properties = Vec::with_capacity(len.min(64));
                for _ in 0..len {
                    properties.push(reader.read_string()?);
                }
                if tag == 16 {
                    WalRecord::UniqueConstraintCreate { label, properties }
                } else {
                    WalRecord::UniqueConstraintDrop { label, properties }
                }
            }
            _ => {
                return Err(Error::Recovery(format!("unknown WAL record tag {tag}")));
            }
        };
        Ok(record)
    }
}

fn encode_header(uuid: &str, epoch: &str, sequence_number: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(WAL_MAGIC);
    put_u32(&mut buf, WAL_VERSION);
    put_string(&mut buf, uuid);
    put_string(&mut buf, epoch);
    put_u64(&mut buf, sequence_number);
    buf
}

fn encode_record(timestamp: u64, record: &WalRecord) -> Vec<u8> {
    let mut payload = Vec::new();
    record.encode_payload(&mut payload);
    let mut frame = Vec::with_capacity(payload.len() + 21);
    put_u64(&mut frame, timestamp);
    put_u8(&mut frame, record.tag());
    put_u32(&mut frame, payload.len() as u32);
    frame.extend_from_slice(&payload);
    let checksum = crc32(&frame);
    put_u32(&mut frame, checksum);
    frame
}

/// Append side of one WAL segment. Records are ordered by commit timestamp
/// because appends happen under the engine lock in commit order.
pub(crate) struct WalWriter {
    file: BufWriter<File>,
    path: PathBuf,
    sequence_number: u64,
    size: u64,
    from_timestamp: u64,
    to_timestamp: u64,
}

impl WalWriter {
    pub(crate) fn create(
        wal_directory: &Path,
        uuid: &str,
        epoch: &str,
        sequence_number: u64,
        first_timestamp: u64,
    ) -> Result<Self> {
        std::fs::create_dir_all(wal_directory)?;
        let path = wal_directory.join(format!("{sequence_number:06}_{first_timestamp:020}.wal"));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut writer = Self {
            file: BufWriter::new(file),
            path,
            sequence_number,
            size: 0,
            from_timestamp: first_timestamp,
            to_timestamp: first_timestamp,
        };
        let header = encode_header(uuid, epoch, sequence_number);
        writer.file.write_all(&header)?;
        writer.size = header.len() as u64;
        debug!(
            path = %writer.path.display(),
            sequence_number,
            "wal.segment.created"
        );
        Ok(writer)
    }

    pub(crate) fn append(&mut self, timestamp: u64, record: &WalRecord) -> Result<()> {
        let frame = encode_record(timestamp, record);
        self.file.write_all(&frame)?;
        self.size += frame.len() as u64;
        self.to_timestamp = timestamp;
        Ok(())
    }

    /// Pushes buffered bytes to the OS. Commit publication waits for this,
    /// not for fsync, unless strict sync is configured.
    pub(crate) fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        Ok(())
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    /// Writes the trailing magic, syncs and closes the segment.
    pub(crate) fn finalize(mut self) -> Result<()> {
        self.file.write_all(WAL_MAGIC)?;
        self.file.flush()?;
        self.file.get_ref().sync_data()?;
        debug!(
            path = %self.path.display(),
            sequence_number = self.sequence_number,
            from_timestamp = self.from_timestamp,
            to_timestamp = self.to_timestamp,
            "wal.segment.finalized"
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub(crate) struct WalSegmentHeader {
    pub(crate) uuid: String,
    pub(crate) epoch: String,
    pub(crate) sequence_number: u64,
}

/// Outcome of reading one segment: the records that decoded cleanly and
/// whether the segment ended at a record boundary. A `false` flag on any
/// segment other than the newest makes recovery fail.
pub(crate) struct WalSegmentData {
    pub(crate) header: WalSegmentHeader,
    pub(crate) records: Vec<(u64, WalRecord)>,
    pub(crate) clean_end: bool,
}

pub(crate) fn read_segment(path: &Path) -> Result<WalSegmentData> {
    let data = std::fs::read(path)?;
    let mut reader = Reader::new(&data);
    let magic = reader.read_bytes(4).map_err(|_| header_error(path))?;
    if magic != WAL_MAGIC {
        return Err(header_error(path));
    }
    let version = reader.read_u32().map_err(|_| header_error(path))?;
    if version != WAL_VERSION {
        return Err(Error::Recovery(format!(
            "unsupported WAL version {version} in {}",
            path.display()
        )));
    }
    let uuid = reader.read_string().map_err(|_| header_error(path))?;
    let epoch = reader.read_string().map_err(|_| header_error(path))?;
    let sequence_number = reader.read_u64().map_err(|_| header_error(path))?;
    let header = WalSegmentHeader {
        uuid,
        epoch,
        sequence_number,
    };

    let mut records = Vec::new();
    let mut clean_end = true;
    loop {
        if reader.remaining() == 0 {
            break;
        }
        if reader.remaining() == 4 {
            if reader.read_bytes(4)? == WAL_MAGIC {
                break;
            }
            clean_end = false;
            break;
        }
        match read_record(&mut reader) {
            Ok(entry) => records.push(entry),
            Err(_) => {
                warn!(
                    path = %path.display(),
                    offset = reader.position(),
                    records = records.len(),
                    "wal.segment.corrupt_tail"
                );
                clean_end = false;
                break;
            }
        }
    }
    Ok(WalSegmentData {
        header,
        records,
        clean_end,
    })
}

fn read_record(reader: &mut Reader<'_>) -> Result<(u64, WalRecord)> {
    let frame_start = reader.position();
    let timestamp = reader.read_u64()?;
    let tag = reader.read_u8()?;
    let payload_len = reader.read_u32()? as usize;
    let payload = reader.read_bytes(payload_len)?.to_vec();
    let stored_checksum = reader.read_u32()?;
    let frame_end = reader.position() - 4;
    // Recompute over the full frame minus the checksum itself.
    let mut frame = Vec::with_capacity(frame_end - frame_start);
    put_u64(&mut frame, timestamp);
    put_u8(&mut frame, tag);
    put_u32(&mut frame, payload_len as u32);
    frame.extend_from_slice(&payload);
    if crc32(&frame) != stored_checksum {
        return Err(Error::Recovery("WAL record checksum mismatch".into()));
    }
    let mut payload_reader = Reader::new(&payload);
    let record = WalRecord::decode(tag, &mut payload_reader)?;
    Ok((timestamp, record))
}

fn header_error(path: &Path) -> Error {
    Error::Recovery(format!("invalid WAL segment header in {}", path.display()))
}

/// WAL segments in the directory, sorted by sequence number.
pub(crate) fn list_segments(wal_directory: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !wal_directory.exists() {
        return Ok(segments);
    }
    for entry in std::fs::read_dir(wal_directory)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("wal") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let Some(sequence) = stem.split('_').next().and_then(|s| s.parse::<u64>().ok()) else {
            continue;
        };
        segments.push((sequence, path));
    }
    segments.sort();
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_records() -> Vec<(u64, WalRecord)> {
        vec![
            (5, WalRecord::VertexCreate { gid: Gid::from_u64(1) }),
            (
                5,
                WalRecord::VertexAddLabel {
                    gid: Gid::from_u64(1),
                    label: "Person".into(),
                },
            ),
            (
                5,
                WalRecord::VertexSetProperty {
                    gid: Gid::from_u64(1),
                    property: "name".into(),
                    value: PropertyValue::String("ada".into()),
                },
            ),
            (5, WalRecord::TransactionEnd),
            (
                6,
                WalRecord::EdgeCreate {
                    gid: Gid::from_u64(0),
                    edge_type: "KNOWS".into(),
                    from: Gid::from_u64(1),
                    to: Gid::from_u64(1),
                },
            ),
            (6, WalRecord::TransactionEnd),
        ]
    }

    #[test]
    fn segment_round_trip() {
        let dir = tempdir().unwrap();
        let mut writer = WalWriter::create(dir.path(), "uuid-1", "epoch-1", 3, 5).unwrap();
        for (timestamp, record) in sample_records() {
            writer.append(timestamp, &record).unwrap();
        }
        writer.finalize().unwrap();

        let segments = list_segments(dir.path()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].0, 3);

        let data = read_segment(&segments[0].1).unwrap();
        assert!(data.clean_end);
        assert_eq!(data.header.uuid, "uuid-1");
        assert_eq!(data.header.sequence_number, 3);
        assert_eq!(data.records, sample_records());
    }

    #[test]
    fn truncated_tail_is_reported_not_fatal() {
        let dir = tempdir().unwrap();
        let mut writer = WalWriter::create(dir.path(), "uuid-1", "epoch-1", 0, 5).unwrap();
        for (timestamp, record) in sample_records() {
            writer.append(timestamp, &record).unwrap();
        }
        writer.finalize().unwrap();

        let (_, path) = list_segments(dir.path()).unwrap().pop().unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 10]).unwrap();

        let data = read_segment(&path).unwrap();
        assert!(!data.clean_end);
        // Everything before the damaged frame is still decodable.
        assert!(data.records.len() >= 4);
    }

    #[test]
    fn flipped_byte_detected_by_checksum() {
        let dir = tempdir().unwrap();
        let mut writer = WalWriter::create(dir.path(), "uuid-1", "epoch-1", 0, 5).unwrap();
        for (timestamp, record) in sample_records() {
            writer.append(timestamp, &record).unwrap();
        }
        writer.finalize().unwrap();

        let (_, path) = list_segments(dir.path()).unwrap().pop().unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        let flip_at = bytes.len() - 30;
        bytes[flip_at] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let data = read_segment(&path).unwrap();
        assert!(!data.clean_end);
        assert!(data.records.len() < sample_records().len());
    }
}
