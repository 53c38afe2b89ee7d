mod edge_ref;
mod vertex_ref;

pub use edge_ref::EdgeRef;
pub use vertex_ref::VertexRef;

use std::ops::Bound;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{MutexGuard, RawRwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::ids::{EdgeTypeId, Gid};
use crate::storage::delta::{link_delta, prepare_for_write, Delta, DeltaAction, DeltaOwner};
use crate::storage::edge::{Edge, EdgeEntry, EdgeRepr};
use crate::storage::transaction::{IsolationLevel, StorageMode, Transaction};
use crate::storage::vertex::{Vertex, VertexPayload};
use crate::storage::{FinishedTransaction, StorageInner, View};
use crate::value::PropertyValue;

/// Short-lived handle through which a transaction reads and writes the
/// graph. Obtained from [`Storage::access`](crate::Storage::access);
/// dropping an accessor that was neither committed nor aborted aborts it.
pub struct Accessor {
    pub(crate) storage: Arc<StorageInner>,
    pub(crate) transaction: Transaction,
    commit_timestamp: Option<u64>,
    is_active: bool,
    _main_guard: ArcRwLockReadGuard<RawRwLock, ()>,
}

impl Accessor {
    pub(crate) fn new(
        storage: &Arc<StorageInner>,
        isolation_level: IsolationLevel,
        storage_mode: StorageMode,
    ) -> Self {
        let main_guard = storage.main_lock.read_arc();
        let (id, start_timestamp) = {
            let _engine = storage.engine_lock.lock();
            let id = storage.transaction_id.fetch_add(1, Ordering::AcqRel);
            let start_timestamp = storage.timestamp.fetch_add(1, Ordering::AcqRel);
            (id, start_timestamp)
        };
        if storage_mode == StorageMode::Analytical {
            storage.analytical_accessors.fetch_add(1, Ordering::AcqRel);
        }
        let deadline = storage
            .config
            .transaction_timeout
            .map(|timeout| Instant::now() + timeout);
        debug!(
            transaction_id = id,
            start_timestamp,
            ?isolation_level,
            "storage.transaction.started"
        );
        Self {
            storage: Arc::clone(storage),
            transaction: Transaction::new(id, start_timestamp, isolation_level, storage_mode, deadline),
            commit_timestamp: None,
            is_active: true,
            _main_guard: main_guard,
        }
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.transaction.isolation_level
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.transaction.storage_mode
    }

    pub fn start_timestamp(&self) -> u64 {
        self.transaction.start_timestamp
    }

    /// Requests cooperative abort; the next operation on this accessor
    /// fails with [`Error::TransactionTerminated`].
    pub fn terminate(&self) {
        self.transaction.must_abort.store(true, Ordering::Release);
    }

    fn transactional(&self) -> bool {
        self.transaction.storage_mode == StorageMode::Transactional
    }

    /// Resolves the view timestamp for this read plus whether the
    /// transaction's own uncommitted writes should be visible.
    pub(crate) fn view_components(&self, view: View) -> (u64, bool) {
        let view_timestamp = match self.transaction.isolation_level {
            IsolationLevel::SnapshotIsolation => self.transaction.start_timestamp,
            IsolationLevel::ReadCommitted => self.storage.timestamp.load(Ordering::Acquire),
            IsolationLevel::ReadUncommitted => u64::MAX,
        };
        (view_timestamp, view == View::New)
    }

    // ---- vertices ----------------------------------------------------

    pub fn create_vertex(&self) -> Result<VertexRef<'_>> {
        self.transaction.check_cancellation()?;
        let gid = Gid::from_u64(self.storage.vertex_id.fetch_add(1, Ordering::AcqRel));
        Ok(self.insert_vertex(gid, DeltaAction::DeleteObject))
    }

    /// Creates a vertex with an explicit gid — the ingest path used by WAL
    /// replay and external delta consumers. The id counter is advanced with
    /// an atomic max so concurrent allocations can never move it backwards.
    pub fn create_vertex_with_gid(&self, gid: Gid) -> Result<VertexRef<'_>> {
        self.transaction.check_cancellation()?;
        self.storage
            .vertex_id
            .fetch_max(gid.as_u64() + 1, Ordering::AcqRel);
        debug_assert!(self.storage.vertex_id.load(Ordering::Acquire) > gid.as_u64());
        if self.storage.vertices.read().contains_key(&gid) {
            return Err(Error::Recovery(format!("vertex gid {gid} already in use")));
        }
        Ok(self.insert_vertex(gid, DeltaAction::DeleteDeserializedObject))
    }

    fn insert_vertex(&self, gid: Gid, initial_action: DeltaAction) -> VertexRef<'_> {
        let vertex = Vertex::new(gid);
        if self.transactional() {
            let delta = Delta::new(
                initial_action,
                &self.transaction,
                DeltaOwner::Vertex(Arc::downgrade(&vertex)),
            );
            let mut payload = vertex.payload.lock();
            link_delta(&self.transaction, &mut payload.delta, delta);
        }
        self.storage.vertices.write().insert(gid, Arc::clone(&vertex));
        VertexRef::new(vertex, self)
    }

    /// The vertex at `gid` if it is visible at the requested view.
    pub fn find_vertex(&self, gid: Gid, view: View) -> Option<VertexRef<'_>> {
        let vertex = self.storage.vertices.read().get(&gid).cloned()?;
        if self.vertex_visible(&vertex, view) {
            Some(VertexRef::new(vertex, self))
        } else {
            None
        }
    }

    pub(crate) fn vertex_visible(&self, vertex: &Arc<Vertex>, view: View) -> bool {
        let (view_timestamp, include_own) = self.view_components(view);
        let (mut deleted, head) = {
            let payload = vertex.payload.lock();
            (payload.deleted, payload.delta.clone())
        };
        let mut exists = true;
        crate::storage::delta::apply_deltas_for_read(
            head,
            self.transaction.id,
            view_timestamp,
            include_own,
            |action| match action {
                DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => exists = false,
                DeltaAction::RecreateObject => deleted = false,
                _ => {}
            },
        );
        exists && !deleted
    }

    /// All vertices visible at the view.
    pub fn vertices(&self, view: View) -> Vec<VertexRef<'_>> {
        let candidates: Vec<Arc<Vertex>> =
            self.storage.vertices.read().values().cloned().collect();
        candidates
            .into_iter()
            .filter(|vertex| self.vertex_visible(vertex, view))
            .map(|vertex| VertexRef::new(vertex, self))
            .collect()
    }

    /// Label-index scan. Fails when no index exists for the label.
    pub fn vertices_by_label(
        &self,
        label: crate::ids::LabelId,
        view: View,
    ) -> Result<Vec<VertexRef<'_>>> {
        let candidates = self
            .storage
            .indices
            .label
            .candidates(label)
            .ok_or(Error::IndexDefinition("label index does not exist"))?;
        Ok(candidates
            .into_iter()
            .filter_map(|vertex| {
                let vertex_ref = VertexRef::new(vertex, self);
                match vertex_ref.has_label(label, view) {
                    Ok(true) => Some(vertex_ref),
                    _ => None,
                }
            })
            .collect())
    }

    /// Label+property point lookup through the index.
    pub fn vertices_by_label_property_value(
        &self,
        label: crate::ids::LabelId,
        property: crate::ids::PropertyId,
        value: &PropertyValue,
        view: View,
    ) -> Result<Vec<VertexRef<'_>>> {
        let candidates = self
            .storage
            .indices
            .label_property
            .candidates_for_value(label, property, value)
            .ok_or(Error::IndexDefinition("label+property index does not exist"))?;
        Ok(candidates
            .into_iter()
            .filter_map(|vertex| {
                let vertex_ref = VertexRef::new(vertex, self);
                let matches = vertex_ref.has_label(label, view).unwrap_or(false)
                    && vertex_ref
                        .get_property(property, view)
                        .map(|current| &current == value)
                        .unwrap_or(false);
                matches.then_some(vertex_ref)
            })
            .collect())
    }

    /// Label+property range scan with optional inclusive/exclusive bounds.
    pub fn vertices_by_label_property_range(
        &self,
        label: crate::ids::LabelId,
        property: crate::ids::PropertyId,
        lower: Bound<PropertyValue>,
        upper: Bound<PropertyValue>,
        view: View,
    ) -> Result<Vec<VertexRef<'_>>> {
        let candidates = self
            .storage
            .indices
            .label_property
            .candidates_for_range(label, property, lower.clone(), upper.clone())
            .ok_or(Error::IndexDefinition("label+property index does not exist"))?;
        Ok(candidates
            .into_iter()
            .filter_map(|vertex| {
                let vertex_ref = VertexRef::new(vertex, self);
                if !vertex_ref.has_label(label, view).unwrap_or(false) {
                    return None;
                }
                let current = vertex_ref.get_property(property, view).ok()?;
                if current.is_null() || !value_in_bounds(&current, &lower, &upper) {
                    return None;
                }
                Some(vertex_ref)
            })
            .collect())
    }

    // ---- edges -------------------------------------------------------

    pub fn create_edge(
        &self,
        from: &VertexRef<'_>,
        to: &VertexRef<'_>,
        edge_type: EdgeTypeId,
    ) -> Result<EdgeRef<'_>> {
        self.create_edge_internal(from, to, edge_type, None)
    }

    pub(crate) fn create_edge_internal(
        &self,
        from: &VertexRef<'_>,
        to: &VertexRef<'_>,
        edge_type: EdgeTypeId,
        desired_gid: Option<Gid>,
    ) -> Result<EdgeRef<'_>> {
        self.transaction.check_cancellation()?;
        let from_vertex = Arc::clone(&from.vertex);
        let to_vertex = Arc::clone(&to.vertex);
        let from_gid = from_vertex.gid;
        let to_gid = to_vertex.gid;

        let (mut first_guard, mut second_guard) = lock_vertex_pair(&from_vertex, &to_vertex);
        {
            let (from_payload, to_payload) =
                payload_pair(&from_vertex, &mut first_guard, &mut second_guard);
            if self.transactional() {
                if !prepare_for_write(&self.transaction, &from_payload.delta) {
                    return Err(Error::Serialization);
                }
            }
            if from_payload.deleted {
                return Err(Error::DeletedObject);
            }
            if let Some(to_payload) = to_payload {
                if self.transactional() && !prepare_for_write(&self.transaction, &to_payload.delta)
                {
                    return Err(Error::Serialization);
                }
                if to_payload.deleted {
                    return Err(Error::DeletedObject);
                }
            }
        }

        let gid = match desired_gid {
            None => Gid::from_u64(self.storage.edge_id.fetch_add(1, Ordering::AcqRel)),
            Some(gid) => {
                self.storage
                    .edge_id
                    .fetch_max(gid.as_u64() + 1, Ordering::AcqRel);
                gid
            }
        };
        let initial_action = match desired_gid {
            None => DeltaAction::DeleteObject,
            Some(_) => DeltaAction::DeleteDeserializedObject,
        };

        let repr = if self.storage.config.properties_on_edges {
            if self.storage.edges.read().contains_key(&gid) {
                return Err(Error::Recovery(format!("edge gid {gid} already in use")));
            }
            let edge = Edge::new(gid);
            if self.transactional() {
                let delta = Delta::new(
                    initial_action,
                    &self.transaction,
                    DeltaOwner::Edge(Arc::downgrade(&edge)),
                );
                let mut payload = edge.payload.lock();
                link_delta(&self.transaction, &mut payload.delta, delta);
            }
            self.storage.edges.write().insert(gid, Arc::clone(&edge));
            EdgeRepr::Object(edge)
        } else {
            EdgeRepr::Gid(gid)
        };

        let out_entry = EdgeEntry {
            edge_type,
            neighbor: to_gid,
            edge: repr.clone(),
        };
        let in_entry = EdgeEntry {
            edge_type,
            neighbor: from_gid,
            edge: repr.clone(),
        };

        {
            let from_payload = &mut *first_guard;
            if self.transactional() {
                let delta = Delta::new(
                    DeltaAction::RemoveOutEdge(out_entry.clone()),
                    &self.transaction,
                    DeltaOwner::Vertex(Arc::downgrade(&from_vertex)),
                );
                link_delta(&self.transaction, &mut from_payload.delta, delta);
            }
            from_payload.out_edges.push(out_entry);
        }
        {
            let to_payload: &mut VertexPayload = match second_guard.as_mut() {
                Some(guard) => guard,
                None => &mut first_guard,
            };
            if self.transactional() {
                let delta = Delta::new(
                    DeltaAction::RemoveInEdge(in_entry.clone()),
                    &self.transaction,
                    DeltaOwner::Vertex(Arc::downgrade(&to_vertex)),
                );
                link_delta(&self.transaction, &mut to_payload.delta, delta);
            }
            to_payload.in_edges.push(in_entry);
        }

        self.transaction.invalidate_cache(from_gid);
        self.transaction.invalidate_cache(to_gid);
        self.storage.edge_count.fetch_add(1, Ordering::AcqRel);

        Ok(EdgeRef::new(repr, edge_type, from_gid, to_gid, self))
    }

    /// Deletes the edge. Deleting an edge that is already gone is a no-op.
    pub fn delete_edge(&self, edge: &EdgeRef<'_>) -> Result<()> {
        self.transaction.check_cancellation()?;
        self.delete_edge_parts(&edge.repr, edge.edge_type(), edge.from_gid(), edge.to_gid(), true)
            .map(|_| ())
    }

    /// Removes the adjacency entries of one edge. With `mark_edge_deleted`
    /// the edge object itself is tombstoned too; endpoint moves keep the
    /// object alive and only re-link the adjacency.
    pub(crate) fn delete_edge_parts(
        &self,
        repr: &EdgeRepr,
        edge_type: EdgeTypeId,
        from_gid: Gid,
        to_gid: Gid,
        mark_edge_deleted: bool,
    ) -> Result<bool> {
        let from_vertex = self
            .storage
            .vertices
            .read()
            .get(&from_gid)
            .cloned()
            .ok_or(Error::NonexistentObject)?;
        let to_vertex = self
            .storage
            .vertices
            .read()
            .get(&to_gid)
            .cloned()
            .ok_or(Error::NonexistentObject)?;

        let (mut first_guard, mut second_guard) = lock_vertex_pair(&from_vertex, &to_vertex);
        {
            let (from_payload, to_payload) =
                payload_pair(&from_vertex, &mut first_guard, &mut second_guard);
            if self.transactional() {
                if !prepare_for_write(&self.transaction, &from_payload.delta) {
                    return Err(Error::Serialization);
                }
                if let Some(to_payload) = &to_payload {
                    if !prepare_for_write(&self.transaction, &to_payload.delta) {
                        return Err(Error::Serialization);
                    }
                }
            }
        }

        let out_entry = EdgeEntry {
            edge_type,
            neighbor: to_gid,
            edge: repr.clone(),
        };
        let in_entry = EdgeEntry {
            edge_type,
            neighbor: from_gid,
            edge: repr.clone(),
        };

        let removed = {
            let from_payload = &mut *first_guard;
            match from_payload
                .out_edges
                .iter()
                .position(|entry| *entry == out_entry)
            {
                None => false,
                Some(position) => {
                    from_payload.out_edges.swap_remove(position);
                    if self.transactional() {
                        let delta = Delta::new(
                            DeltaAction::AddOutEdge(out_entry.clone()),
                            &self.transaction,
                            DeltaOwner::Vertex(Arc::downgrade(&from_vertex)),
                        );
                        link_delta(&self.transaction, &mut from_payload.delta, delta);
                    }
                    true
                }
            }
        };
        if !removed {
            return Ok(false);
        }
        {
            let to_payload: &mut VertexPayload = match second_guard.as_mut() {
                Some(guard) => guard,
                None => &mut first_guard,
            };
            let position = to_payload
                .in_edges
                .iter()
                .position(|entry| *entry == in_entry)
                .expect("in-edge entry must mirror the out-edge entry");
            to_payload.in_edges.swap_remove(position);
            if self.transactional() {
                let delta = Delta::new(
                    DeltaAction::AddInEdge(in_entry.clone()),
                    &self.transaction,
                    DeltaOwner::Vertex(Arc::downgrade(&to_vertex)),
                );
                link_delta(&self.transaction, &mut to_payload.delta, delta);
            }
        }

        if mark_edge_deleted {
            if let EdgeRepr::Object(edge_object) = repr {
                let mut payload = edge_object.payload.lock();
                if self.transactional() {
                    if !prepare_for_write(&self.transaction, &payload.delta) {
                        return Err(Error::Serialization);
                    }
                    let delta = Delta::new(
                        DeltaAction::RecreateObject,
                        &self.transaction,
                        DeltaOwner::Edge(Arc::downgrade(edge_object)),
                    );
                    link_delta(&self.transaction, &mut payload.delta, delta);
                }
                payload.deleted = true;
            }
            if self.transaction.storage_mode == StorageMode::Analytical {
                self.storage
                    .analytical_deleted_edges
                    .lock()
                    .push(repr.gid());
            }
        }

        self.transaction.invalidate_cache(from_gid);
        self.transaction.invalidate_cache(to_gid);
        self.storage.edge_count.fetch_sub(1, Ordering::AcqRel);
        Ok(true)
    }

    /// Moves the edge's origin to another vertex. Returns the updated
    /// handle; the edge keeps its gid and properties.
    pub fn set_edge_from(
        &self,
        edge: &EdgeRef<'_>,
        new_from: &VertexRef<'_>,
    ) -> Result<EdgeRef<'_>> {
        self.move_edge_endpoint(edge, new_from, true)
    }

    /// Moves the edge's destination to another vertex.
    pub fn set_edge_to(&self, edge: &EdgeRef<'_>, new_to: &VertexRef<'_>) -> Result<EdgeRef<'_>> {
        self.move_edge_endpoint(edge, new_to, false)
    }

    fn move_edge_endpoint(
        &self,
        edge: &EdgeRef<'_>,
        new_vertex: &VertexRef<'_>,
        move_from: bool,
    ) -> Result<EdgeRef<'_>> {
        self.transaction.check_cancellation()?;
        let (new_from, new_to) = if move_from {
            (new_vertex.gid(), edge.to_gid())
        } else {
            (edge.from_gid(), new_vertex.gid())
        };
        if new_from == edge.from_gid() && new_to == edge.to_gid() {
            return Ok(EdgeRef::new(
                edge.repr.clone(),
                edge.edge_type(),
                new_from,
                new_to,
                self,
            ));
        }
        // Re-linking is a detach of the old adjacency plus an attach of the
        // new one under the same edge identity. The edge object itself (and
        // its properties) survives because the entries carry the same repr.
        let removed = self.delete_edge_parts(
            &edge.repr,
            edge.edge_type(),
            edge.from_gid(),
            edge.to_gid(),
            false,
        )?;
        if !removed {
            return Err(Error::NonexistentObject);
        }
        self.attach_edge_entries(&edge.repr, edge.edge_type(), new_from, new_to)?;
        Ok(EdgeRef::new(
            edge.repr.clone(),
            edge.edge_type(),
            new_from,
            new_to,
            self,
        ))
    }

    fn attach_edge_entries(
        &self,
        repr: &EdgeRepr,
        edge_type: EdgeTypeId,
        from_gid: Gid,
        to_gid: Gid,
    ) -> Result<()> {
        let from_vertex = self
            .storage
            .vertices
            .read()
            .get(&from_gid)
            .cloned()
            .ok_or(Error::NonexistentObject)?;
        let to_vertex = self
            .storage
            .vertices
            .read()
            .get(&to_gid)
            .cloned()
            .ok_or(Error::NonexistentObject)?;

        let (mut first_guard, mut second_guard) = lock_vertex_pair(&from_vertex, &to_vertex);
        {
            let (from_payload, to_payload) =
                payload_pair(&from_vertex, &mut first_guard, &mut second_guard);
            if self.transactional() && !prepare_for_write(&self.transaction, &from_payload.delta) {
                return Err(Error::Serialization);
            }
            if from_payload.deleted {
                return Err(Error::DeletedObject);
            }
            if let Some(to_payload) = to_payload {
                if self.transactional() && !prepare_for_write(&self.transaction, &to_payload.delta)
                {
                    return Err(Error::Serialization);
                }
                if to_payload.deleted {
                    return Err(Error::DeletedObject);
                }
            }
        }

        let out_entry = EdgeEntry {
            edge_type,
            neighbor: to_gid,
            edge: repr.clone(),
        };
        let in_entry = EdgeEntry {
            edge_type,
            neighbor: from_gid,
            edge: repr.clone(),
        };
        {
            let from_payload = &mut *first_guard;
            if self.transactional() {
                let delta = Delta::new(
                    DeltaAction::RemoveOutEdge(out_entry.clone()),
                    &self.transaction,
                    DeltaOwner::Vertex(Arc::downgrade(&from_vertex)),
                );
                link_delta(&self.transaction, &mut from_payload.delta, delta);
            }
            from_payload.out_edges.push(out_entry);
        }
        {
            let to_payload: &mut VertexPayload = match second_guard.as_mut() {
                Some(guard) => guard,
                None => &mut first_guard,
            };
            if self.transactional() {
                let delta = Delta::new(
                    DeltaAction::RemoveInEdge(in_entry.clone()),
                    &self.transaction,
                    DeltaOwner::Vertex(Arc::downgrade(&to_vertex)),
                );
                link_delta(&self.transaction, &mut to_payload.delta, delta);
            }
            to_payload.in_edges.push(in_entry);
        }
        // Undo the count adjustment made by the detach half.
        self.storage.edge_count.fetch_add(1, Ordering::AcqRel);
        self.transaction.invalidate_cache(from_gid);
        self.transaction.invalidate_cache(to_gid);
        Ok(())
    }

    // ---- deletion ----------------------------------------------------

    /// Deletes the given vertices and edges. With `detach`, edges incident
    /// to the vertices are deleted as well; without it, a vertex that still
    /// has edges fails the whole operation. Returns the gids of everything
    /// deleted.
    pub fn detach_delete(
        &self,
        nodes: &[VertexRef<'_>],
        edges: &[EdgeRef<'_>],
        detach: bool,
    ) -> Result<(Vec<Gid>, Vec<Gid>)> {
        self.transaction.check_cancellation()?;

        let mut target_vertices: Vec<Arc<Vertex>> = Vec::new();
        for node in nodes {
            if !target_vertices.iter().any(|vertex| vertex.gid == node.gid()) {
                target_vertices.push(Arc::clone(&node.vertex));
            }
        }

        struct EdgeTarget {
            repr: EdgeRepr,
            edge_type: EdgeTypeId,
            from: Gid,
            to: Gid,
        }
        let mut target_edges: Vec<EdgeTarget> = Vec::new();
        let push_edge = |target: EdgeTarget, targets: &mut Vec<EdgeTarget>| {
            if !targets.iter().any(|existing| existing.repr.gid() == target.repr.gid()) {
                targets.push(target);
            }
        };
        for edge in edges {
            push_edge(
                EdgeTarget {
                    repr: edge.repr.clone(),
                    edge_type: edge.edge_type(),
                    from: edge.from_gid(),
                    to: edge.to_gid(),
                },
                &mut target_edges,
            );
        }

        // Conflict-check the vertices up front so concurrent writers fail
        // early, before any edge is touched.
        for vertex in &target_vertices {
            let payload = vertex.payload.lock();
            if self.transactional() && !prepare_for_write(&self.transaction, &payload.delta) {
                return Err(Error::Serialization);
            }
        }

        let mut deleted_edges = Vec::new();
        for target in &target_edges {
            if self.delete_edge_parts(&target.repr, target.edge_type, target.from, target.to, true)?
            {
                deleted_edges.push(target.repr.gid());
            }
        }

        // Detach loop: gather and delete incident edges until none remain.
        // A concurrent writer may attach a new edge between passes; it is
        // picked up by the next round (or conflicts on the vertex lock).
        while detach {
            let mut round: Vec<EdgeTarget> = Vec::new();
            for vertex in &target_vertices {
                let payload = vertex.payload.lock();
                if payload.deleted {
                    continue;
                }
                for entry in &payload.out_edges {
                    push_edge(
                        EdgeTarget {
                            repr: entry.edge.clone(),
                            edge_type: entry.edge_type,
                            from: vertex.gid,
                            to: entry.neighbor,
                        },
                        &mut round,
                    );
                }
                for entry in &payload.in_edges {
                    push_edge(
                        EdgeTarget {
                            repr: entry.edge.clone(),
                            edge_type: entry.edge_type,
                            from: entry.neighbor,
                            to: vertex.gid,
                        },
                        &mut round,
                    );
                }
            }
            if round.is_empty() {
                break;
            }
            for target in &round {
                if self.delete_edge_parts(
                    &target.repr,
                    target.edge_type,
                    target.from,
                    target.to,
                    true,
                )? {
                    deleted_edges.push(target.repr.gid());
                }
            }
        }

        let mut deleted_vertices = Vec::new();
        for vertex in &target_vertices {
            let mut payload = vertex.payload.lock();
            if self.transactional() && !prepare_for_write(&self.transaction, &payload.delta) {
                return Err(Error::Serialization);
            }
            if payload.deleted {
                continue;
            }
            if !payload.out_edges.is_empty() || !payload.in_edges.is_empty() {
                return Err(Error::VertexHasEdges);
            }
            payload.deleted = true;
            if self.transactional() {
                let delta = Delta::new(
                    DeltaAction::RecreateObject,
                    &self.transaction,
                    DeltaOwner::Vertex(Arc::downgrade(vertex)),
                );
                link_delta(&self.transaction, &mut payload.delta, delta);
            } else {
                self.storage
                    .analytical_deleted_vertices
                    .lock()
                    .push(vertex.gid);
            }
            self.transaction.invalidate_cache(vertex.gid);
            deleted_vertices.push(vertex.gid);
        }

        Ok((deleted_vertices, deleted_edges))
    }

    // ---- lifecycle ---------------------------------------------------

    /// Commits with an engine-assigned commit timestamp.
    pub fn commit(mut self) -> Result<()> {
        self.commit_internal(None)
    }

    /// Commits at the caller's timestamp — the ingest hook used by recovery
    /// and external WAL-delta consumers. The engine clock is advanced past
    /// the desired timestamp.
    pub fn commit_with_timestamp(mut self, desired: u64) -> Result<()> {
        self.commit_internal(Some(desired))
    }

    pub fn abort(mut self) {
        self.abort_internal();
    }

    fn commit_internal(&mut self, desired: Option<u64>) -> Result<()> {
        if let Err(error) = self.transaction.check_cancellation() {
            self.abort_internal();
            return Err(error);
        }
        if !self.transaction.has_deltas() {
            self.storage
                .commit_log
                .mark_finished(self.transaction.start_timestamp);
            self.is_active = false;
            return Ok(());
        }

        let modified = self.modified_vertices();

        if !self.storage.constraints.existence.is_empty() {
            for vertex in &modified {
                // Only this transaction can touch these vertices until the
                // commit finishes, but another reader may hold the lock.
                let violation = {
                    let payload = vertex.payload.lock();
                    self.storage.constraints.existence.validate_payload(&payload)
                };
                if let Some(violation) = violation {
                    self.abort_internal();
                    return Err(Error::ConstraintViolation(violation));
                }
            }
        }

        let commit_timestamp;
        let mut unique_violation = None;
        {
            let engine_guard = self.storage.engine_lock.lock();
            commit_timestamp = self.storage.commit_timestamp(desired);
            // The timestamp is consumed even when validation or the WAL
            // append fails below. Stashing it here makes finalization mark
            // it finished on every path; a permanently unfinished timestamp
            // would stall the oldest-active fence and with it the garbage
            // collector.
            self.commit_timestamp = Some(commit_timestamp);

            if !self.storage.constraints.unique.is_empty() {
                for vertex in &modified {
                    self.storage
                        .constraints
                        .unique
                        .update_before_commit(vertex, self.transaction.start_timestamp);
                }
                for vertex in &modified {
                    unique_violation = self.storage.constraints.unique.validate(
                        vertex,
                        &self.transaction,
                        commit_timestamp,
                    );
                    if unique_violation.is_some() {
                        break;
                    }
                }
            }

            if unique_violation.is_none() {
                // The WAL write happens under the engine lock so record
                // order equals commit order, and strictly before the commit
                // timestamp is published.
                let deltas = self.transaction.deltas();
                if let Err(error) = self
                    .storage
                    .wal_append_transaction(&deltas, commit_timestamp)
                {
                    drop(engine_guard);
                    self.abort_internal();
                    return Err(error);
                }
                self.transaction
                    .commit_cell
                    .store(commit_timestamp, Ordering::Release);
                self.storage
                    .last_commit_timestamp
                    .store(commit_timestamp, Ordering::Release);
                self.storage
                    .commit_log
                    .mark_finished(self.transaction.start_timestamp);
            }
        }

        if let Some(violation) = unique_violation {
            self.abort_internal();
            return Err(Error::ConstraintViolation(violation));
        }

        self.is_active = false;
        debug!(
            transaction_id = self.transaction.id,
            commit_timestamp, "storage.transaction.committed"
        );
        Ok(())
    }

    fn modified_vertices(&self) -> Vec<Arc<Vertex>> {
        let mut vertices: Vec<Arc<Vertex>> = Vec::new();
        for delta in self.transaction.deltas() {
            if let DeltaOwner::Vertex(weak) = &delta.owner {
                if let Some(vertex) = weak.upgrade() {
                    if !vertices.iter().any(|existing| existing.gid == vertex.gid) {
                        vertices.push(vertex);
                    }
                }
            }
        }
        vertices
    }

    fn abort_internal(&mut self) {
        if !self.is_active {
            return;
        }
        let deltas = self.transaction.take_deltas();
        let mut my_deleted_vertices = Vec::new();
        let mut my_deleted_edges = Vec::new();

        // Unwind each object's chain suffix belonging to this transaction,
        // newest first, restoring the recorded inverse states.
        let mut seen_vertices: Vec<Gid> = Vec::new();
        let mut seen_edges: Vec<Gid> = Vec::new();
        for delta in &deltas {
            match &delta.owner {
                DeltaOwner::Vertex(weak) => {
                    let Some(vertex) = weak.upgrade() else { continue };
                    if seen_vertices.contains(&vertex.gid) {
                        continue;
                    }
                    seen_vertices.push(vertex.gid);
                    self.unwind_vertex(&vertex, &mut my_deleted_vertices);
                }
                DeltaOwner::Edge(weak) => {
                    let Some(edge) = weak.upgrade() else { continue };
                    if seen_edges.contains(&edge.gid) {
                        continue;
                    }
                    seen_edges.push(edge.gid);
                    self.unwind_edge(&edge, &mut my_deleted_edges);
                }
            }
        }

        let mark_timestamp = {
            let _engine = self.storage.engine_lock.lock();
            self.storage.timestamp.load(Ordering::Acquire)
        };
        self.storage
            .garbage_undo_buffers
            .lock()
            .push_back((mark_timestamp, deltas));
        self.storage
            .deleted_vertices
            .lock()
            .extend(my_deleted_vertices);
        self.storage.deleted_edges.lock().extend(my_deleted_edges);
        self.storage
            .commit_log
            .mark_finished(self.transaction.start_timestamp);
        self.is_active = false;
        debug!(
            transaction_id = self.transaction.id,
            "storage.transaction.aborted"
        );
    }

    fn unwind_vertex(&self, vertex: &Arc<Vertex>, deleted_out: &mut Vec<Gid>) {
        let mut payload = vertex.payload.lock();
        while let Some(head) = payload.delta.clone() {
            if head.load_timestamp() != self.transaction.id {
                break;
            }
            match &head.action {
                DeltaAction::RemoveLabel(label) => {
                    let position = payload
                        .labels
                        .iter()
                        .position(|existing| existing == label)
                        .expect("aborted label must be present");
                    payload.labels.swap_remove(position);
                }
                DeltaAction::AddLabel(label) => {
                    payload.labels.push(*label);
                }
                DeltaAction::SetProperty { key, value } => {
                    if value.is_null() {
                        payload.properties.remove(key);
                    } else {
                        payload.properties.insert(*key, value.clone());
                    }
                }
                DeltaAction::AddInEdge(entry) => {
                    payload.in_edges.push(entry.clone());
                }
                DeltaAction::AddOutEdge(entry) => {
                    payload.out_edges.push(entry.clone());
                    self.storage.edge_count.fetch_add(1, Ordering::AcqRel);
                }
                DeltaAction::RemoveInEdge(entry) => {
                    let position = payload
                        .in_edges
                        .iter()
                        .position(|existing| existing == entry)
                        .expect("aborted in-edge must be present");
                    payload.in_edges.swap_remove(position);
                }
                DeltaAction::RemoveOutEdge(entry) => {
                    let position = payload
                        .out_edges
                        .iter()
                        .position(|existing| existing == entry)
                        .expect("aborted out-edge must be present");
                    payload.out_edges.swap_remove(position);
                    self.storage.edge_count.fetch_sub(1, Ordering::AcqRel);
                }
                DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => {
                    payload.deleted = true;
                    deleted_out.push(vertex.gid);
                }
                DeltaAction::RecreateObject => {
                    payload.deleted = false;
                }
            }
            payload.delta = head.next.read().clone();
        }
    }

    fn unwind_edge(&self, edge: &Arc<Edge>, deleted_out: &mut Vec<Gid>) {
        let mut payload = edge.payload.lock();
        while let Some(head) = payload.delta.clone() {
            if head.load_timestamp() != self.transaction.id {
                break;
            }
            match &head.action {
                DeltaAction::SetProperty { key, value } => {
                    if value.is_null() {
                        payload.properties.remove(key);
                    } else {
                        payload.properties.insert(*key, value.clone());
                    }
                }
                DeltaAction::DeleteObject | DeltaAction::DeleteDeserializedObject => {
                    payload.deleted = true;
                    deleted_out.push(edge.gid);
                }
                DeltaAction::RecreateObject => {
                    payload.deleted = false;
                }
                _ => panic!("invalid delta action on an edge chain"),
            }
            payload.delta = head.next.read().clone();
        }
    }
}

impl Drop for Accessor {
    fn drop(&mut self) {
        if self.is_active {
            self.abort_internal();
        }
        if let Some(commit_timestamp) = self.commit_timestamp.take() {
            // The commit cell leaves the transaction-id sentinel only when
            // the commit was published. A commit aborted after timestamp
            // assignment must not enter the committed queue (its sentinel
            // would wedge the collector's commit-order scan), but its
            // timestamp still has to be marked finished or oldest-active
            // never moves past it.
            let published =
                self.transaction.commit_cell.load(Ordering::Acquire) == commit_timestamp;
            if published {
                let deltas = self.transaction.take_deltas();
                self.storage
                    .committed_transactions
                    .lock()
                    .push_back(FinishedTransaction {
                        commit_cell: Arc::clone(&self.transaction.commit_cell),
                        deltas,
                    });
            }
            self.storage.commit_log.mark_finished(commit_timestamp);
        }
        if self.transaction.storage_mode == StorageMode::Analytical {
            self.storage
                .analytical_accessors
                .fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Locks two vertex payloads in ascending gid order; a self-pair locks only
/// once. The first guard always belongs to `a`.
fn lock_vertex_pair<'v>(
    a: &'v Vertex,
    b: &'v Vertex,
) -> (
    MutexGuard<'v, VertexPayload>,
    Option<MutexGuard<'v, VertexPayload>>,
) {
    if a.gid == b.gid {
        (a.payload.lock(), None)
    } else if a.gid < b.gid {
        let first = a.payload.lock();
        let second = b.payload.lock();
        (first, Some(second))
    } else {
        let second = b.payload.lock();
        let first = a.payload.lock();
        (first, Some(second))
    }
}

/// Splits the pair guards into (`a`'s payload, `b`'s payload when distinct).
fn payload_pair<'g, 'v>(
    _a: &Vertex,
    first: &'g mut MutexGuard<'v, VertexPayload>,
    second: &'g mut Option<MutexGuard<'v, VertexPayload>>,
) -> (&'g mut VertexPayload, Option<&'g mut VertexPayload>) {
    match second {
        Some(guard) => (&mut **first, Some(&mut **guard)),
        None => (&mut **first, None),
    }
}

fn value_in_bounds(
    value: &PropertyValue,
    lower: &Bound<PropertyValue>,
    upper: &Bound<PropertyValue>,
) -> bool {
    let lower_ok = match lower {
        Bound::Included(bound) => value >= bound,
        Bound::Excluded(bound) => value > bound,
        Bound::Unbounded => true,
    };
    let upper_ok = match upper {
        Bound::Included(bound) => value <= bound,
        Bound::Excluded(bound) => value < bound,
        Bound::Unbounded => true,
    };
    lower_ok && upper_ok
}
