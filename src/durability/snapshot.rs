use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::durability::encoding::{crc32, put_string, put_u32, put_u64, put_value, Reader};
use crate::error::{Error, Result};
use crate::ids::Gid;
use crate::value::PropertyValue;

pub(crate) const SNAPSHOT_MAGIC: &[u8; 4] = b"MGsn";
const SNAPSHOT_VERSION: u32 = 1;
const SECTION_COUNT: usize = 5;
/// Offsets table (5 x u64) plus the trailing magic.
const TAIL_LEN: usize = SECTION_COUNT * 8 + 4;

#[derive(Debug, Clone)]
pub(crate) struct SnapshotVertexRec {
    pub(crate) gid: Gid,
    pub(crate) labels: Vec<u32>,
    pub(crate) properties: Vec<(u32, PropertyValue)>,
    /// (edge gid, edge type id, destination vertex gid)
    pub(crate) out_edges: Vec<(u64, u32, u64)>,
}

#[derive(Debug, Clone)]
pub(crate) struct SnapshotEdgeRec {
    pub(crate) gid: Gid,
    pub(crate) edge_type: u32,
    pub(crate) from: Gid,
    pub(crate) to: Gid,
    pub(crate) properties: Vec<(u32, PropertyValue)>,
}

/// Fully decoded snapshot, ready to install into an empty object store.
#[derive(Debug, Clone, Default)]
pub(crate) struct SnapshotContents {
    pub(crate) uuid: String,
    pub(crate) epoch: String,
    pub(crate) start_timestamp: u64,
    pub(crate) vertices: Vec<SnapshotVertexRec>,
    pub(crate) edges: Vec<SnapshotEdgeRec>,
    pub(crate) label_indices: Vec<u32>,
    pub(crate) label_property_indices: Vec<(u32, u32)>,
    pub(crate) existence_constraints: Vec<(u32, u32)>,
    pub(crate) unique_constraints: Vec<(u32, Vec<u32>)>,
    pub(crate) mapper_names: Vec<String>,
}

fn encode_section(out: &mut Vec<u8>, payload: &[u8]) -> u64 {
    let offset = out.len() as u64;
    put_u64(out, payload.len() as u64);
    out.extend_from_slice(payload);
    put_u32(out, crc32(payload));
    offset
}

fn decode_section<'a>(data: &'a [u8], offset: u64) -> Result<Reader<'a>> {
    let offset = offset as usize;
    let mut reader = Reader::new(data.get(offset..).ok_or_else(bad_section)?);
    let len = reader.read_u64()? as usize;
    let payload = reader.read_bytes(len)?;
    let stored = reader.read_u32()?;
    if crc32(payload) != stored {
        return Err(Error::Recovery("snapshot section checksum mismatch".into()));
    }
    Ok(Reader::new(payload))
}

fn bad_section() -> Error {
    Error::Recovery("snapshot section offset out of bounds".into())
}

/// Serializes a snapshot to `<dir>/<start_ts>.snapshot`, writing through a
/// temporary name so a crash never leaves a half-written file with a valid
/// name.
pub(crate) fn write_snapshot(
    snapshot_directory: &Path,
    contents: &SnapshotContents,
) -> Result<PathBuf> {
    std::fs::create_dir_all(snapshot_directory)?;

    let mut out = Vec::new();
    out.extend_from_slice(SNAPSHOT_MAGIC);
    put_u32(&mut out, SNAPSHOT_VERSION);
    put_string(&mut out, &contents.uuid);
    put_string(&mut out, &contents.epoch);
    put_u64(&mut out, contents.start_timestamp);

    let mut payload = Vec::new();
    put_u64(&mut payload, contents.vertices.len() as u64);
    for vertex in &contents.vertices {
        put_u64(&mut payload, vertex.gid.as_u64());
        put_u32(&mut payload, vertex.labels.len() as u32);
        for label in &vertex.labels {
            put_u32(&mut payload, *label);
        }
        put_u32(&mut payload, vertex.properties.len() as u32);
        for (property, value) in &vertex.properties {
            put_u32(&mut payload, *property);
            put_value(&mut payload, value);
        }
        put_u32(&mut payload, vertex.out_edges.len() as u32);
        for (edge_gid, edge_type, to) in &vertex.out_edges {
            put_u64(&mut payload, *edge_gid);
            put_u32(&mut payload, *edge_type);
            put_u64(&mut payload, *to);
        }
    }
    let vertices_offset = encode_section(&mut out, &payload);

    payload.clear();
    put_u64(&mut payload, contents.edges.len() as u64);
    for edge in &contents.edges {
        put_u64(&mut payload, edge.gid.as_u64());
        put_u32(&mut payload, edge.edge_type);
        put_u64(&mut payload, edge.from.as_u64());
        put_u64(&mut payload, edge.to.as_u64());
        put_u32(&mut payload, edge.properties.len() as u32);
        for (property, value) in &edge.properties {
            put_u32(&mut payload, *property);
            put_value(&mut payload, value);
        }
    }
    let edges_offset = encode_section(&mut out, &payload);

    payload.clear();
    put_u32(&mut payload, contents.label_indices.len() as u32);
    for label in &contents.label_indices {
        put_u32(&mut payload, *label);
    }
    put_u32(&mut payload, contents.label_property_indices.len() as u32);
    for (label, property) in &contents.label_property_indices {
        put_u32(&mut payload, *label);
        put_u32(&mut payload, *property);
    }
    let indices_offset = encode_section(&mut out, &payload);

    payload.clear();
    put_u32(&mut payload, contents.existence_constraints.len() as u32);
    for (label, property) in &contents.existence_constraints {
        put_u32(&mut payload, *label);
        put_u32(&mut payload, *property);
    }
    put_u32(&mut payload, contents.unique_constraints.len() as u32);
    for (label, properties) in &contents.unique_constraints {
        put_u32(&mut payload, *label);
        put_u32(&mut payload, properties.len() as u32);
        for property in properties {
            put_u32(&mut payload, *property);
        }
    }
    let constraints_offset = encode_section(&mut out, &payload);

    payload.clear();
    put_u32(&mut payload, contents.mapper_names.len() as u32);
    for name in &contents.mapper_names {
        put_string(&mut payload, name);
    }
    let mappers_offset = encode_section(&mut out, &payload);

    for offset in [
        vertices_offset,
        edges_offset,
        indices_offset,
        constraints_offset,
        mappers_offset,
    ] {
        put_u64(&mut out, offset);
    }
    out.extend_from_slice(SNAPSHOT_MAGIC);

    let final_path =
        snapshot_directory.join(format!("{:020}.snapshot", contents.start_timestamp));
    let tmp_path = snapshot_directory.join(format!(
        "{:020}.snapshot.tmp",
        contents.start_timestamp
    ));
    {
        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&out)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, &final_path)?;
    debug!(
        path = %final_path.display(),
        vertices = contents.vertices.len(),
        edges = contents.edges.len(),
        "snapshot.written"
    );
    Ok(final_path)
}

pub(crate) fn read_snapshot(path: &Path) -> Result<SnapshotContents> {
    let data = std::fs::read(path)?;
    if data.len() < 8 + TAIL_LEN || &data[..4] != SNAPSHOT_MAGIC {
        return Err(Error::Recovery(format!(
            "invalid snapshot magic in {}",
            path.display()
        )));
    }
    if &data[data.len() - 4..] != SNAPSHOT_MAGIC {
        return Err(Error::Recovery(format!(
            "snapshot {} is truncated",
            path.display()
        )));
    }

    let mut header = Reader::new(&data[4..]);
    let version = header.read_u32()?;
    if version != SNAPSHOT_VERSION {
        return Err(Error::Recovery(format!(
            "unsupported snapshot version {version}"
        )));
    }
    let uuid = header.read_string()?;
    let epoch = header.read_string()?;
    let start_timestamp = header.read_u64()?;

    let mut offsets_reader = Reader::new(&data[data.len() - TAIL_LEN..data.len() - 4]);
    let mut offsets = [0u64; SECTION_COUNT];
    for slot in offsets.iter_mut() {
        *slot = offsets_reader.read_u64()?;
    }

    let mut contents = SnapshotContents {
        uuid,
        epoch,
        start_timestamp,
        ..SnapshotContents::default()
    };

    let mut section = decode_section(&data, offsets[0])?;
    let vertex_count = section.read_u64()?;
    for _ in 0..vertex_count {
        let gid = Gid::from_u64(section.read_u64()?);
        let label_count = section.read_u32()?;
        let mut labels = Vec::with_capacity(label_count as usize);
        for _ in 0..label_count {
            labels.push(section.read_u32()?);
        }
        let property_count = section.read_u32()?;
        let mut properties = Vec::with_capacity(property_count as usize);
        for _ in 0..property_count {
            let property = section.read_u32()?;
            properties.push((property, section.read_value()?));
        }
        let edge_count = section.read_u32()?;
        let mut out_edges = Vec::with_capacity(edge_count as usize);
        for _ in 0..edge_count {
            let edge_gid = section.read_u64()?;
            let edge_type = section.read_u32()?;
            let to = section.read_u64()?;
            out_edges.push((edge_gid, edge_type, to));
        }
        contents.vertices.push(SnapshotVertexRec {
            gid,
            labels,
            properties,
            out_edges,
        });
    }

    let mut section = decode_section(&data, offsets[1])?;
    let edge_count = section.read_u64()?;
    for _ in 0..edge_count {
        let gid = Gid::from_u64(section.read_u64()?);
        let edge_type = section.read_u32()?;
        let from = Gid::from_u64(section.read_u64()?);
        let to = Gid::from_u64(section.read_u64()?);
        let property_count = section.read_u32()?;
        let mut properties = Vec::with_capacity(property_count as usize);
        for _ in 0..property_count {
            let property = section.read_u32()?;
            properties.push((property, section.read_value()?));
        }
        contents.edges.push(SnapshotEdgeRec {
            gid,
            edge_type,
            from,
            to,
            properties,
        });
    }

    let mut section = decode_section(&data, offsets[2])?;
    let label_index_count = section.read_u32()?;
    for _ in 0..label_index_count {
        contents.label_indices.push(section.read_u32()?);
    }
    let pair_index_count = section.read_u32()?;
    for _ in 0..pair_index_count {
        let label = section.read_u32()?;
        let property = section.read_u32()?;
        contents.label_property_indices.push((label, property));
    }

    let mut section = decode_section(&data, offsets[3])?;
    let existence_count = section.read_u32()?;
    for _ in 0..existence_count {
        let label = section.read_u32()?;
        let property = section.read_u32()?;
        contents.existence_constraints.push((label, property));
    }
    let unique_count = section.read_u32()?;
    for _ in 0..unique_count {
        let label = section.read_u32()?;
        let property_count = section.read_u32()?;
        let mut properties = Vec::with_capacity(property_count as usize);
        for _ in 0..property_count {
            properties.push(section.read_u32()?);
        }
        contents.unique_constraints.push((label, properties));
    }

    let mut section = decode_section(&data, offsets[4])?;
    let name_count = section.read_u32()?;
    for _ in 0..name_count {
        contents.mapper_names.push(section.read_string()?);
    }

    Ok(contents)
}

/// Snapshots on disk, newest first.
pub(crate) fn list_snapshots(snapshot_directory: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut snapshots = Vec::new();
    if !snapshot_directory.exists() {
        return Ok(snapshots);
    }
    for entry in std::fs::read_dir(snapshot_directory)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("snapshot") {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let Ok(start_timestamp) = stem.parse::<u64>() else {
            continue;
        };
        snapshots.push((start_timestamp, path));
    }
    snapshots.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(snapshots)
}

/// Deletes all but the newest `keep` snapshots.
pub(crate) fn apply_retention(snapshot_directory: &Path, keep: usize) -> Result<()> {
    let snapshots = list_snapshots(snapshot_directory)?;
    for (start_timestamp, path) in snapshots.into_iter().skip(keep.max(1)) {
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), start_timestamp, "snapshot.retired"),
            Err(error) => warn!(
                path = %path.display(),
                %error,
                "snapshot.retire_failed"
            ),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_contents() -> SnapshotContents {
        SnapshotContents {
            uuid: "uuid-xyz".into(),
            epoch: "epoch-1".into(),
            start_timestamp: 42,
            vertices: vec![SnapshotVertexRec {
                gid: Gid::from_u64(7),
                labels: vec![0, 2],
                properties: vec![(1, PropertyValue::Int(5))],
                out_edges: vec![(11, 3, 7)],
            }],
            edges: vec![SnapshotEdgeRec {
                gid: Gid::from_u64(11),
                edge_type: 3,
                from: Gid::from_u64(7),
                to: Gid::from_u64(7),
                properties: vec![(4, PropertyValue::Bool(true))],
            }],
            label_indices: vec![0],
            label_property_indices: vec![(0, 1)],
            existence_constraints: vec![(2, 1)],
            unique_constraints: vec![(0, vec![1, 4])],
            mapper_names: vec!["Person".into(), "age".into()],
        }
    }

    #[test]
    fn snapshot_round_trip() {
        let dir = tempdir().unwrap();
        let path = write_snapshot(dir.path(), &sample_contents()).unwrap();
        let loaded = read_snapshot(&path).unwrap();
        assert_eq!(loaded.uuid, "uuid-xyz");
        assert_eq!(loaded.start_timestamp, 42);
        assert_eq!(loaded.vertices.len(), 1);
        assert_eq!(loaded.vertices[0].out_edges, vec![(11, 3, 7)]);
        assert_eq!(loaded.edges.len(), 1);
        assert_eq!(loaded.unique_constraints, vec![(0, vec![1, 4])]);
        assert_eq!(loaded.mapper_names, vec!["Person", "age"]);
    }

    #[test]
    fn corrupted_section_is_rejected() {
        let dir = tempdir().unwrap();
        let path = write_snapshot(dir.path(), &sample_contents()).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        // Flip a byte inside the vertices section (right after the header).
        let flip_at = 40;
        bytes[flip_at] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        assert!(read_snapshot(&path).is_err());
    }

    #[test]
    fn retention_keeps_newest() {
        let dir = tempdir().unwrap();
        for start_timestamp in [10, 20, 30] {
            let contents = SnapshotContents {
                start_timestamp,
                ..sample_contents()
            };
            write_snapshot(dir.path(), &contents).unwrap();
        }
        apply_retention(dir.path(), 2).unwrap();
        let remaining = list_snapshots(dir.path()).unwrap();
        let timestamps: Vec<u64> = remaining.iter().map(|(ts, _)| *ts).collect();
        assert_eq!(timestamps, vec![30, 20]);
    }
}
