use std::sync::atomic::Ordering;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::{info, warn};

use crate::durability::snapshot::{self, SnapshotContents};
use crate::durability::wal::{self, WalRecord};
use crate::durability::{snapshot_directory, wal_directory};
use crate::error::{Error, Result};
use crate::ids::{EdgeTypeId, Gid, LabelId, PropertyId};
use crate::storage::accessor::Accessor;
use crate::storage::edge::{Edge, EdgeEntry, EdgeRepr};
use crate::storage::transaction::{IsolationLevel, StorageMode};
use crate::storage::vertex::Vertex;
use crate::storage::{StorageInner, View};

/// Rebuilds engine state from the newest valid snapshot plus the WAL
/// suffix. Fatal inconsistencies (gaps, corruption before the final
/// segment, unreplayable records) refuse startup with a recovery error.
pub(crate) fn recover(storage: &Arc<StorageInner>) -> Result<()> {
    let snapshot_dir = snapshot_directory(&storage.config.data_directory);
    let wal_dir = wal_directory(&storage.config.data_directory);

    let mut recovered: Option<SnapshotContents> = None;
    for (start_timestamp, path) in snapshot::list_snapshots(&snapshot_dir)? {
        match snapshot::read_snapshot(&path) {
            Ok(contents) => {
                info!(
                    path = %path.display(),
                    start_timestamp,
                    "storage.recovery.snapshot_selected"
                );
                recovered = Some(contents);
                break;
            }
            Err(error) => {
                warn!(
                    path = %path.display(),
                    %error,
                    "storage.recovery.snapshot_skipped"
                );
            }
        }
    }

    let snapshot_timestamp = match &recovered {
        Some(contents) => Some(contents.start_timestamp),
        None => None,
    };
    if let Some(contents) = recovered {
        *storage.uuid.write() = contents.uuid.clone();
        *storage.epoch_id.write() = contents.epoch.clone();
        install_snapshot(storage, &contents)?;
        storage
            .timestamp
            .store(contents.start_timestamp + 1, Ordering::Release);
    }

    replay_wal(storage, &wal_dir, snapshot_timestamp)?;

    let next_timestamp = storage
        .timestamp
        .load(Ordering::Acquire)
        .max(snapshot_timestamp.map(|ts| ts + 1).unwrap_or(0));
    storage.timestamp.store(next_timestamp, Ordering::Release);
    // Everything below the recovered clock counts as finished, so the
    // replay transactions' version chains are unlinked by the first GC
    // cycle.
    storage.commit_log.reset(next_timestamp);

    info!(
        next_timestamp,
        vertices = storage.vertices.read().len(),
        edge_count = storage.edge_count.load(Ordering::Acquire),
        "storage.recovery.finished"
    );
    Ok(())
}

fn install_snapshot(storage: &Arc<StorageInner>, contents: &SnapshotContents) -> Result<()> {
    storage
        .name_id_mapper
        .restore(contents.mapper_names.clone());

    let properties_on_edges = storage.config.properties_on_edges;
    let mut edge_properties: FxHashMap<u64, Vec<(u32, crate::value::PropertyValue)>> =
        FxHashMap::default();
    if properties_on_edges {
        for edge in &contents.edges {
            edge_properties.insert(edge.gid.as_u64(), edge.properties.clone());
        }
    }

    let mut vertices: FxHashMap<u64, Arc<Vertex>> = FxHashMap::default();
    let mut max_vertex_gid = 0u64;
    for record in &contents.vertices {
        let vertex = Vertex::new(record.gid);
        {
            let mut payload = vertex.payload.lock();
            payload.labels = record
                .labels
                .iter()
                .map(|label| LabelId::new(*label))
                .collect();
            payload.properties = record
                .properties
                .iter()
                .map(|(property, value)| (PropertyId::new(*property), value.clone()))
                .collect();
        }
        max_vertex_gid = max_vertex_gid.max(record.gid.as_u64());
        vertices.insert(record.gid.as_u64(), vertex);
    }

    let mut edge_objects: FxHashMap<u64, Arc<Edge>> = FxHashMap::default();
    let mut max_edge_gid = 0u64;
    let mut edge_count = 0u64;
    for record in &contents.vertices {
        let Some(from_vertex) = vertices.get(&record.gid.as_u64()).cloned() else {
            continue;
        };
        for (edge_gid, edge_type, to) in &record.out_edges {
            let to_vertex = vertices.get(to).cloned().ok_or_else(|| {
                Error::Recovery(format!(
                    "snapshot edge {edge_gid} points at unknown vertex {to}"
                ))
            })?;
            let repr = if properties_on_edges {
                let edge = edge_objects.entry(*edge_gid).or_insert_with(|| {
                    let edge = Edge::new(Gid::from_u64(*edge_gid));
                    if let Some(properties) = edge_properties.get(edge_gid) {
                        let mut payload = edge.payload.lock();
                        payload.properties = properties
                            .iter()
                            .map(|(property, value)| (PropertyId::new(*property), value.clone()))
                            .collect();
                    }
                    edge
                });
                EdgeRepr::Object(Arc::clone(edge))
            } else {
                EdgeRepr::Gid(Gid::from_u64(*edge_gid))
            };
            from_vertex.payload.lock().out_edges.push(EdgeEntry {
                edge_type: EdgeTypeId::new(*edge_type),
                neighbor: Gid::from_u64(*to),
                edge: repr.clone(),
            });
            to_vertex.payload.lock().in_edges.push(EdgeEntry {
                edge_type: EdgeTypeId::new(*edge_type),
                neighbor: record.gid,
                edge: repr,
            });
            max_edge_gid = max_edge_gid.max(*edge_gid);
            edge_count += 1;
        }
    }

    {
        let mut store = storage.vertices.write();
        for (gid, vertex) in vertices {
            store.insert(Gid::from_u64(gid), vertex);
        }
    }
    if properties_on_edges {
        let mut store = storage.edges.write();
        for (gid, edge) in edge_objects {
            store.insert(Gid::from_u64(gid), edge);
        }
    }
    storage.edge_count.store(edge_count, Ordering::Release);
    storage
        .vertex_id
        .fetch_max(max_vertex_gid + 1, Ordering::AcqRel);
    storage
        .edge_id
        .fetch_max(max_edge_gid + 1, Ordering::AcqRel);

    // Index and constraint definitions are seeded from the freshly
    // installed object store.
    let all_vertices = storage.collect_vertices();
    for label in &contents.label_indices {
        if !storage
            .indices
            .label
            .create(LabelId::new(*label), &all_vertices)
        {
            return Err(Error::Recovery("duplicate label index in snapshot".into()));
        }
    }
    for (label, property) in &contents.label_property_indices {
        if !storage.indices.label_property.create(
            LabelId::new(*label),
            PropertyId::new(*property),
            &all_vertices,
        ) {
            return Err(Error::Recovery(
                "duplicate label+property index in snapshot".into(),
            ));
        }
    }
    for (label, property) in &contents.existence_constraints {
        storage
            .constraints
            .existence
            .create(LabelId::new(*label), PropertyId::new(*property), &all_vertices)
            .map_err(|error| {
                Error::Recovery(format!("snapshot existence constraint invalid: {error}"))
            })?;
    }
    for (label, properties) in &contents.unique_constraints {
        let properties: Vec<PropertyId> =
            properties.iter().map(|p| PropertyId::new(*p)).collect();
        storage
            .constraints
            .unique
            .create(LabelId::new(*label), &properties, &all_vertices)
            .map_err(|error| {
                Error::Recovery(format!("snapshot unique constraint invalid: {error}"))
            })?;
    }
    Ok(())
}

fn replay_wal(
    storage: &Arc<StorageInner>,
    wal_dir: &std::path::Path,
    snapshot_timestamp: Option<u64>,
) -> Result<()> {
    let segments = wal::list_segments(wal_dir)?;
    if segments.is_empty() {
        return Ok(());
    }

    let mut storage_uuid = if snapshot_timestamp.is_some() {
        Some(storage.uuid.read().clone())
    } else {
        None
    };

    let mut selected = Vec::new();
    for (_, path) in &segments {
        let data = wal::read_segment(path)?;
        match &storage_uuid {
            None => {
                // WAL-only recovery adopts the first segment's identity.
                storage_uuid = Some(data.header.uuid.clone());
                *storage.uuid.write() = data.header.uuid.clone();
                *storage.epoch_id.write() = data.header.epoch.clone();
                selected.push((path.clone(), data));
            }
            Some(uuid) if *uuid == data.header.uuid => selected.push((path.clone(), data)),
            Some(_) => {
                warn!(
                    path = %path.display(),
                    "storage.recovery.wal_segment_foreign_uuid"
                );
            }
        }
    }

    let segment_count = selected.len();
    let mut expected_sequence: Option<u64> = None;
    let mut pending: Vec<(u64, WalRecord)> = Vec::new();
    let mut last_sequence = 0u64;
    for (index, (path, data)) in selected.into_iter().enumerate() {
        if let Some(previous) = expected_sequence {
            if data.header.sequence_number != previous + 1 {
                return Err(Error::Recovery(format!(
                    "gap in WAL sequence numbers: expected {}, found {} in {}",
                    previous + 1,
                    data.header.sequence_number,
                    path.display()
                )));
            }
        }
        expected_sequence = Some(data.header.sequence_number);
        last_sequence = data.header.sequence_number;

        let is_last = index + 1 == segment_count;
        if !data.clean_end && !is_last {
            return Err(Error::Recovery(format!(
                "corrupt record in non-final WAL segment {}",
                path.display()
            )));
        }

        for (timestamp, record) in data.records {
            if let Some(snapshot_ts) = snapshot_timestamp {
                if timestamp <= snapshot_ts {
                    continue;
                }
            }
            if record.is_schema_op() {
                apply_schema_record(storage, &record, timestamp)?;
                continue;
            }
            let is_transaction_end = matches!(record, WalRecord::TransactionEnd);
            pending.push((timestamp, record));
            if is_transaction_end {
                let transaction = std::mem::take(&mut pending);
                apply_transaction(storage, &transaction)?;
            }
        }

        if !pending.is_empty() {
            if is_last {
                warn!(
                    path = %path.display(),
                    dropped_records = pending.len(),
                    "storage.recovery.partial_transaction_discarded"
                );
                pending.clear();
            } else {
                return Err(Error::Recovery(format!(
                    "WAL segment {} ends inside a transaction",
                    path.display()
                )));
            }
        }
    }

    if expected_sequence.is_some() {
        storage.wal_seq.store(last_sequence + 1, Ordering::Release);
    }
    Ok(())
}

fn apply_schema_record(
    storage: &Arc<StorageInner>,
    record: &WalRecord,
    timestamp: u64,
) -> Result<()> {
    let label_id = |name: &str| LabelId::new(storage.name_id_mapper.name_to_id(name));
    let property_id = |name: &str| PropertyId::new(storage.name_id_mapper.name_to_id(name));
    let result = match record {
        WalRecord::LabelIndexCreate { label } => {
            storage.create_label_index(label_id(label), Some(timestamp))
        }
        WalRecord::LabelIndexDrop { label } => {
            storage.drop_label_index(label_id(label), Some(timestamp))
        }
        WalRecord::LabelPropertyIndexCreate { label, property } => {
            storage.create_label_property_index(label_id(label), property_id(property), Some(timestamp))
        }
        WalRecord::LabelPropertyIndexDrop { label, property } => {
            storage.drop_label_property_index(label_id(label), property_id(property), Some(timestamp))
        }
        WalRecord::ExistenceConstraintCreate { label, property } => {
            storage.create_existence_constraint(label_id(label), property_id(property), Some(timestamp))
        }
        WalRecord::ExistenceConstraintDrop { label, property } => {
            storage.drop_existence_constraint(label_id(label), property_id(property), Some(timestamp))
        }
        WalRecord::UniqueConstraintCreate { label, properties } => {
            let properties: Vec<PropertyId> =
                properties.iter().map(|name| property_id(name)).collect();
            storage.create_unique_constraint(label_id(label), &properties, Some(timestamp))
        }
        WalRecord::UniqueConstraintDrop { label, properties } => {
            let properties: Vec<PropertyId> =
                properties.iter().map(|name| property_id(name)).collect();
            storage.drop_unique_constraint(label_id(label), &properties, Some(timestamp))
        }
        _ => unreachable!("data record routed to schema replay"),
    };
    result.map_err(|error| Error::Recovery(format!("schema replay failed: {error}")))
}

fn apply_transaction(storage: &Arc<StorageInner>, records: &[(u64, WalRecord)]) -> Result<()> {
    let Some((commit_timestamp, _)) = records.last() else {
        return Ok(());
    };
    let commit_timestamp = *commit_timestamp;
    let replay_error =
        |error: Error| Error::Recovery(format!("WAL replay failed at {commit_timestamp}: {error}"));

    let accessor = Accessor::new(
        storage,
        IsolationLevel::SnapshotIsolation,
        StorageMode::Transactional,
    );
    for (_, record) in records {
        match record {
            WalRecord::VertexCreate { gid } => {
                accessor.create_vertex_with_gid(*gid).map_err(replay_error)?;
            }
            WalRecord::VertexDelete { gid } => {
                let vertex = accessor
                    .find_vertex(*gid, View::New)
                    .ok_or_else(|| Error::Recovery(format!("vertex {gid} missing in replay")))?;
                accessor
                    .detach_delete(&[vertex], &[], false)
                    .map_err(replay_error)?;
            }
            WalRecord::VertexAddLabel { gid, label } => {
                let vertex = accessor
                    .find_vertex(*gid, View::New)
                    .ok_or_else(|| Error::Recovery(format!("vertex {gid} missing in replay")))?;
                vertex
                    .add_label(LabelId::new(storage.name_id_mapper.name_to_id(label)))
                    .map_err(replay_error)?;
            }
            WalRecord::VertexRemoveLabel { gid, label } => {
                let vertex = accessor
                    .find_vertex(*gid, View::New)
                    .ok_or_else(|| Error::Recovery(format!("vertex {gid} missing in replay")))?;
                vertex
                    .remove_label(LabelId::new(storage.name_id_mapper.name_to_id(label)))
                    .map_err(replay_error)?;
            }
            WalRecord::VertexSetProperty { gid, property, value } => {
                let vertex = accessor
                    .find_vertex(*gid, View::New)
                    .ok_or_else(|| Error::Recovery(format!("vertex {gid} missing in replay")))?;
                vertex
                    .set_property(
                        PropertyId::new(storage.name_id_mapper.name_to_id(property)),
                        value.clone(),
                    )
                    .map_err(replay_error)?;
            }
            WalRecord::EdgeCreate { gid, edge_type, from, to } => {
                let from_vertex = accessor
                    .find_vertex(*from, View::New)
                    .ok_or_else(|| Error::Recovery(format!("vertex {from} missing in replay")))?;
                let to_vertex = accessor
                    .find_vertex(*to, View::New)
                    .ok_or_else(|| Error::Recovery(format!("vertex {to} missing in replay")))?;
                let edge_type =
                    EdgeTypeId::new(storage.name_id_mapper.name_to_id(edge_type));
                accessor
                    .create_edge_internal(&from_vertex, &to_vertex, edge_type, Some(*gid))
                    .map_err(replay_error)?;
            }
            WalRecord::EdgeDelete { gid, edge_type, from, to } => {
                let repr = edge_repr_for_replay(storage, *gid)?;
                let edge_type =
                    EdgeTypeId::new(storage.name_id_mapper.name_to_id(edge_type));
                accessor
                    .delete_edge_parts(&repr, edge_type, *from, *to, true)
                    .map_err(replay_error)?;
            }
            WalRecord::EdgeSetProperty { gid, property, value } => {
                let EdgeRepr::Object(edge) = edge_repr_for_replay(storage, *gid)? else {
                    return Err(Error::Recovery(
                        "edge property record without edge objects".into(),
                    ));
                };
                // Property writes go through the object directly: endpoint
                // information is irrelevant for them.
                let edge_ref = crate::storage::accessor::EdgeRef::new(
                    EdgeRepr::Object(edge),
                    EdgeTypeId::new(0),
                    Gid::ZERO,
                    Gid::ZERO,
                    &accessor,
                );
                edge_ref
                    .set_property(
                        PropertyId::new(storage.name_id_mapper.name_to_id(property)),
                        value.clone(),
                    )
                    .map_err(replay_error)?;
            }
            WalRecord::TransactionEnd => {}
            _ => unreachable!("schema record routed to transaction replay"),
        }
    }
    accessor
        .commit_with_timestamp(commit_timestamp)
        .map_err(replay_error)
}

fn edge_repr_for_replay(storage: &Arc<StorageInner>, gid: Gid) -> Result<EdgeRepr> {
    if storage.config.properties_on_edges {
        let edge = storage
            .edges
            .read()
            .get(&gid)
            .cloned()
            .ok_or_else(|| Error::Recovery(format!("edge {gid} missing in replay")))?;
        Ok(EdgeRepr::Object(edge))
    } else {
        Ok(EdgeRepr::Gid(gid))
    }
}
