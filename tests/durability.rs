use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;
use trellis::{
    Config, DurabilityMode, Error, Gid, IsolationLevel, PropertyValue, Storage, StorageMode, View,
};

fn wal_config(dir: &Path) -> Config {
    let mut config = Config::in_memory(dir);
    config.durability_mode = DurabilityMode::PeriodicSnapshotWithWal;
    config.recover_on_startup = true;
    config.snapshot_on_exit = false;
    config.periodic_gc = false;
    config
}

fn si(storage: &Storage) -> trellis::Accessor {
    storage.access(IsolationLevel::SnapshotIsolation, StorageMode::Transactional)
}

fn wal_segments(dir: &Path) -> Vec<PathBuf> {
    let mut segments: Vec<PathBuf> = fs::read_dir(dir.join("wal"))
        .expect("wal directory exists")
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.extension().and_then(|e| e.to_str()) == Some("wal"))
        .collect();
    segments.sort();
    segments
}

#[test]
fn s4_wal_round_trip() -> trellis::Result<()> {
    let dir = tempdir()?;
    const VERTICES: usize = 1000;

    let mut expected_targets: Vec<(Gid, Vec<Gid>)> = Vec::new();
    {
        let storage = Storage::new(wal_config(dir.path()))?;
        let node = storage.label_id("Node");
        let id_prop = storage.property_id("id");
        let link = storage.edge_type_id("LINK");

        let tx = si(&storage);
        let mut vertices = Vec::with_capacity(VERTICES);
        for i in 0..VERTICES {
            let v = tx.create_vertex()?;
            v.add_label(node)?;
            v.set_property(id_prop, PropertyValue::Int(i as i64))?;
            vertices.push(v);
        }
        let mut rng = StdRng::seed_from_u64(7);
        for i in 0..VERTICES {
            let mut targets = Vec::new();
            for _ in 0..2 {
                let target = rng.gen_range(0..VERTICES);
                tx.create_edge(&vertices[i], &vertices[target], link)?;
                targets.push(vertices[target].gid());
            }
            expected_targets.push((vertices[i].gid(), targets));
        }
        drop(vertices);
        tx.commit()?;
    }

    let storage = Storage::new(wal_config(dir.path()))?;
    let node = storage.label_id("Node");
    let id_prop = storage.property_id("id");

    let info = storage.info();
    assert_eq!(info.vertex_count, VERTICES as u64);
    assert_eq!(info.edge_count, 2 * VERTICES as u64);

    let tx = si(&storage);
    let all = tx.vertices(View::Old);
    assert_eq!(all.len(), VERTICES);
    let mut seen_ids = BTreeSet::new();
    for vertex in &all {
        assert!(vertex.has_label(node, View::Old)?);
        let id = match vertex.get_property(id_prop, View::Old)? {
            PropertyValue::Int(id) => id,
            other => panic!("unexpected id property {other:?}"),
        };
        seen_ids.insert(id);
    }
    assert_eq!(seen_ids.len(), VERTICES);

    for (from, targets) in &expected_targets {
        let vertex = tx.find_vertex(*from, View::Old).expect("recovered vertex");
        let out: Vec<Gid> = vertex
            .out_edges(View::Old, &[])?
            .iter()
            .map(|edge| edge.to_gid())
            .collect();
        let mut out_sorted = out.clone();
        out_sorted.sort();
        let mut expected_sorted = targets.clone();
        expected_sorted.sort();
        assert_eq!(out_sorted, expected_sorted);
        // Every edge endpoint resolves to a live vertex.
        for edge in vertex.out_edges(View::Old, &[])? {
            edge.to_vertex()?;
            edge.from_vertex()?;
        }
    }
    Ok(())
}

#[test]
fn s5_wal_tail_corruption_is_tolerated() -> trellis::Result<()> {
    let dir = tempdir()?;
    const TRANSACTIONS: i64 = 300;

    {
        let mut config = wal_config(dir.path());
        config.wal_segment_size = 1024;
        let storage = Storage::new(config)?;
        let id_prop = storage.property_id("id");
        for i in 0..TRANSACTIONS {
            let tx = si(&storage);
            let v = tx.create_vertex()?;
            v.set_property(id_prop, PropertyValue::Int(i))?;
            drop(v);
            tx.commit()?;
        }
    }

    let segments = wal_segments(dir.path());
    assert!(segments.len() > 3, "expected multiple WAL segments");
    let newest = segments.last().unwrap();
    let bytes = fs::read(newest)?;
    fs::write(newest, &bytes[..bytes.len().saturating_sub(100)])?;

    let mut config = wal_config(dir.path());
    config.wal_segment_size = 1024;
    let storage = Storage::new(config)?;
    let id_prop = storage.property_id("id");

    let recovered = storage.info().vertex_count as i64;
    assert!(recovered < TRANSACTIONS);
    assert!(recovered > 0);

    // Exactly the transactions whose TRANSACTION_END survived are present,
    // which in commit order means an unbroken prefix.
    let tx = si(&storage);
    let mut ids = BTreeSet::new();
    for vertex in tx.vertices(View::Old) {
        match vertex.get_property(id_prop, View::Old)? {
            PropertyValue::Int(id) => ids.insert(id),
            other => panic!("unexpected id property {other:?}"),
        };
    }
    let expected: BTreeSet<i64> = (0..recovered).collect();
    assert_eq!(ids, expected);
    Ok(())
}

#[test]
fn s11_earlier_wal_corruption_is_fatal() -> trellis::Result<()> {
    let dir = tempdir()?;
    {
        let mut config = wal_config(dir.path());
        config.wal_segment_size = 1024;
        let storage = Storage::new(config)?;
        let id_prop = storage.property_id("id");
        for i in 0..200i64 {
            let tx = si(&storage);
            let v = tx.create_vertex()?;
            v.set_property(id_prop, PropertyValue::Int(i))?;
            drop(v);
            tx.commit()?;
        }
    }

    let segments = wal_segments(dir.path());
    assert!(segments.len() > 2);
    let middle = &segments[segments.len() / 2];
    let mut bytes = fs::read(middle)?;
    let flip_at = bytes.len() / 2;
    bytes[flip_at] ^= 0xff;
    fs::write(middle, &bytes)?;

    let mut config = wal_config(dir.path());
    config.wal_segment_size = 1024;
    match Storage::new(config) {
        Err(Error::Recovery(_)) => {}
        other => panic!("expected fatal recovery error, got {other:?}"),
    }
    Ok(())
}

#[test]
fn snapshot_round_trip_with_schema() -> trellis::Result<()> {
    let dir = tempdir()?;
    let (label, prop, link);
    {
        let mut config = wal_config(dir.path());
        config.snapshot_on_exit = true;
        let storage = Storage::new(config)?;
        label = storage.label_id("Person");
        prop = storage.property_id("name");
        link = storage.edge_type_id("KNOWS");
        storage.create_label_index(label)?;
        storage.create_label_property_index(label, prop)?;
        storage.create_existence_constraint(label, prop)?;
        storage.create_unique_constraint(label, &[prop])?;

        let tx = si(&storage);
        let a = tx.create_vertex()?;
        a.add_label(label)?;
        a.set_property(prop, PropertyValue::from("ada"))?;
        let b = tx.create_vertex()?;
        b.add_label(label)?;
        b.set_property(prop, PropertyValue::from("grace"))?;
        let edge = tx.create_edge(&a, &b, link)?;
        edge.set_property(storage.property_id("since"), PropertyValue::Int(1980))?;
        drop((a, b, edge));
        tx.commit()?;
    }
    assert!(fs::read_dir(dir.path().join("snapshots"))?.count() > 0);

    let storage = Storage::new(wal_config(dir.path()))?;
    // Names must resolve to the same ids after the mapper was restored.
    assert_eq!(storage.label_id("Person"), label);
    assert_eq!(storage.property_id("name"), prop);
    assert_eq!(storage.edge_type_id("KNOWS"), link);
    assert_eq!(storage.label_indices(), vec![label]);
    assert_eq!(storage.label_property_indices(), vec![(label, prop)]);
    assert_eq!(storage.existence_constraints(), vec![(label, prop)]);
    assert_eq!(storage.unique_constraints(), vec![(label, vec![prop])]);

    let since = storage.property_id("since");
    let tx = si(&storage);
    let people = tx.vertices_by_label(label, View::Old)?;
    assert_eq!(people.len(), 2);
    let by_name = tx.vertices_by_label_property_value(
        label,
        prop,
        &PropertyValue::from("ada"),
        View::Old,
    )?;
    assert_eq!(by_name.len(), 1);
    let out = by_name[0].out_edges(View::Old, &[])?;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].get_property(since, View::Old)?, PropertyValue::Int(1980));

    // The restored unique constraint still validates commits.
    let duplicate = tx.create_vertex()?;
    duplicate.add_label(label)?;
    duplicate.set_property(prop, PropertyValue::from("ada"))?;
    drop((people, by_name, out, duplicate));
    assert!(matches!(
        tx.commit(),
        Err(Error::ConstraintViolation(_))
    ));
    Ok(())
}

#[test]
fn s12_properties_on_edges_disabled() -> trellis::Result<()> {
    let dir = tempdir()?;
    let mut config = Config::in_memory(dir.path());
    config.properties_on_edges = false;
    config.periodic_gc = false;
    let storage = Storage::new(config)?;
    let link = storage.edge_type_id("LINK");
    let weight = storage.property_id("weight");

    let tx = si(&storage);
    let a = tx.create_vertex()?;
    let b = tx.create_vertex()?;
    let edge = tx.create_edge(&a, &b, link)?;
    assert!(matches!(
        edge.set_property(weight, PropertyValue::Int(1)),
        Err(Error::PropertiesDisabled)
    ));
    assert_eq!(edge.get_property(weight, View::New)?, PropertyValue::Null);
    assert!(edge.properties(View::New)?.is_empty());
    drop((a, b, edge));
    tx.commit()?;

    // Edges still traverse and count correctly.
    assert_eq!(storage.info().edge_count, 1);
    Ok(())
}

#[test]
fn recovery_disabled_moves_files_to_backup() -> trellis::Result<()> {
    let dir = tempdir()?;
    {
        let storage = Storage::new(wal_config(dir.path()))?;
        let tx = si(&storage);
        tx.create_vertex()?;
        tx.commit()?;
    }
    assert!(!wal_segments(dir.path()).is_empty());

    let mut config = wal_config(dir.path());
    config.recover_on_startup = false;
    let storage = Storage::new(config)?;
    assert_eq!(storage.info().vertex_count, 0);
    assert!(wal_segments(dir.path()).is_empty());
    assert!(dir.path().join(".backup/wal").exists());
    Ok(())
}

#[test]
fn storage_directory_is_exclusively_locked() -> trellis::Result<()> {
    let dir = tempdir()?;
    let first = Storage::new(wal_config(dir.path()))?;
    match Storage::new(wal_config(dir.path())) {
        Err(Error::Recovery(message)) => assert!(message.contains("locked")),
        other => panic!("expected lock error, got {other:?}"),
    }
    drop(first);
    Storage::new(wal_config(dir.path()))?;
    Ok(())
}

#[test]
fn edge_endpoint_moves_survive_recovery() -> trellis::Result<()> {
    let dir = tempdir()?;
    let (a, b, c) = {
        let storage = Storage::new(wal_config(dir.path()))?;
        let link = storage.edge_type_id("LINK");
        let tx = si(&storage);
        let va = tx.create_vertex()?;
        let vb = tx.create_vertex()?;
        let vc = tx.create_vertex()?;
        let gids = (va.gid(), vb.gid(), vc.gid());
        let edge = tx.create_edge(&va, &vb, link)?;
        let moved = tx.set_edge_to(&edge, &vc)?;
        assert_eq!(moved.to_gid(), gids.2);
        drop((va, vb, vc, edge, moved));
        tx.commit()?;
        gids
    };

    let storage = Storage::new(wal_config(dir.path()))?;
    assert_eq!(storage.info().edge_count, 1);
    let tx = si(&storage);
    let va = tx.find_vertex(a, View::Old).expect("recovered");
    let out = va.out_edges(View::Old, &[])?;
    assert_eq!(out.len(), 1);
    assert_eq!(out[0].to_gid(), c);
    let vb = tx.find_vertex(b, View::Old).expect("recovered");
    assert!(vb.in_edges(View::Old, &[])?.is_empty());
    Ok(())
}
