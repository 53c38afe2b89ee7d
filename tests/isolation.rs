use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use tempfile::tempdir;
use trellis::{Config, Error, IsolationLevel, PropertyValue, Storage, StorageMode, View};

fn open_storage(dir: &std::path::Path) -> Storage {
    let mut config = Config::in_memory(dir);
    config.periodic_gc = false;
    Storage::new(config).expect("storage opens")
}

fn si(storage: &Storage) -> trellis::Accessor {
    storage.access(IsolationLevel::SnapshotIsolation, StorageMode::Transactional)
}

#[test]
fn s1_snapshot_isolation() -> trellis::Result<()> {
    let dir = tempdir()?;
    let storage = open_storage(dir.path());
    let label_a = storage.label_id("A");
    let prop_x = storage.property_id("x");

    // T1 creates v with label "A" and {x: 1}.
    let gid;
    {
        let t1 = si(&storage);
        let v = t1.create_vertex()?;
        v.add_label(label_a)?;
        v.set_property(prop_x, PropertyValue::Int(1))?;
        gid = v.gid();
        t1.commit()?;
    }

    let t2 = si(&storage);

    // T3 updates x to 2 and commits while T2 is open.
    {
        let t3 = si(&storage);
        let v = t3.find_vertex(gid, View::Old).expect("v visible to T3");
        v.set_property(prop_x, PropertyValue::Int(2))?;
        t3.commit()?;
    }

    // T2 still sees the pre-T3 state.
    let v = t2.find_vertex(gid, View::Old).expect("v visible to T2");
    assert_eq!(v.get_property(prop_x, View::Old)?, PropertyValue::Int(1));
    drop(v);
    t2.commit()?;

    // A fresh transaction sees T3's write.
    let t4 = si(&storage);
    let v = t4.find_vertex(gid, View::Old).expect("v visible to T4");
    assert_eq!(v.get_property(prop_x, View::Old)?, PropertyValue::Int(2));
    Ok(())
}

#[test]
fn s2_write_write_conflict() -> trellis::Result<()> {
    let dir = tempdir()?;
    let storage = open_storage(dir.path());
    let prop_x = storage.property_id("x");

    let gid;
    {
        let setup = si(&storage);
        let v = setup.create_vertex()?;
        v.set_property(prop_x, PropertyValue::Int(1))?;
        gid = v.gid();
        setup.commit()?;
    }

    let t1 = si(&storage);
    let t2 = si(&storage);

    let v1 = t1.find_vertex(gid, View::Old).expect("visible");
    v1.set_property(prop_x, PropertyValue::Int(10))?;

    let v2 = t2.find_vertex(gid, View::Old).expect("visible");
    let conflict = v2.set_property(prop_x, PropertyValue::Int(20));
    assert!(matches!(conflict, Err(Error::Serialization)));
    assert!(conflict.unwrap_err().is_retryable());

    drop(v1);
    t1.commit()?;
    drop(v2);
    t2.abort();

    let check = si(&storage);
    let v = check.find_vertex(gid, View::Old).expect("visible");
    assert_eq!(v.get_property(prop_x, View::Old)?, PropertyValue::Int(10));
    Ok(())
}

#[test]
fn s3_unique_constraint_on_concurrent_commits() -> trellis::Result<()> {
    let dir = tempdir()?;
    let storage = open_storage(dir.path());
    let label = storage.label_id("L");
    let prop = storage.property_id("p");
    storage.create_unique_constraint(label, &[prop])?;

    let (g1, g2);
    {
        let setup = si(&storage);
        let v1 = setup.create_vertex()?;
        v1.add_label(label)?;
        v1.set_property(prop, PropertyValue::from("k1"))?;
        g1 = v1.gid();
        let v2 = setup.create_vertex()?;
        v2.add_label(label)?;
        v2.set_property(prop, PropertyValue::from("k2"))?;
        g2 = v2.gid();
        drop((v1, v2));
        setup.commit()?;
    }

    let t1 = si(&storage);
    let t2 = si(&storage);
    t1.find_vertex(g1, View::Old)
        .expect("v1 visible")
        .set_property(prop, PropertyValue::from("same"))?;
    t2.find_vertex(g2, View::Old)
        .expect("v2 visible")
        .set_property(prop, PropertyValue::from("same"))?;

    t1.commit()?;
    let result = t2.commit();
    match result {
        Err(Error::ConstraintViolation(violation)) => {
            assert_eq!(violation.label, label);
            assert_eq!(violation.properties, vec![prop]);
        }
        other => panic!("expected unique constraint violation, got {other:?}"),
    }
    Ok(())
}

#[test]
fn concurrent_unique_inserts_commit_exactly_once() -> trellis::Result<()> {
    let dir = tempdir()?;
    let storage = Arc::new(open_storage(dir.path()));
    let label = storage.label_id("Account");
    let prop = storage.property_id("number");
    storage.create_unique_constraint(label, &[prop])?;

    let barrier = Arc::new(Barrier::new(2));
    let mut handles = Vec::new();
    for _ in 0..2 {
        let storage = Arc::clone(&storage);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || -> trellis::Result<bool> {
            let accessor =
                storage.access(IsolationLevel::SnapshotIsolation, StorageMode::Transactional);
            let v = accessor.create_vertex()?;
            v.add_label(label)?;
            v.set_property(prop, PropertyValue::Int(42))?;
            drop(v);
            barrier.wait();
            match accessor.commit() {
                Ok(()) => Ok(true),
                Err(Error::ConstraintViolation(_)) => Ok(false),
                Err(other) => Err(other),
            }
        }));
    }
    let outcomes: Vec<bool> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .collect();
    assert_eq!(outcomes.iter().filter(|committed| **committed).count(), 1);
    Ok(())
}

#[test]
fn atomic_commit_never_observed_partially() -> trellis::Result<()> {
    let dir = tempdir()?;
    let storage = Arc::new(open_storage(dir.path()));
    let prop_a = storage.property_id("a");
    let prop_b = storage.property_id("b");

    let gid;
    {
        let setup = si(&storage);
        let v = setup.create_vertex()?;
        v.set_property(prop_a, PropertyValue::Int(0))?;
        v.set_property(prop_b, PropertyValue::Int(0))?;
        gid = v.gid();
        drop(v);
        setup.commit()?;
    }

    let barrier = Arc::new(Barrier::new(2));
    let writer = {
        let storage = Arc::clone(&storage);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || -> trellis::Result<()> {
            barrier.wait();
            for round in 1..=200i64 {
                let tx = storage
                    .access(IsolationLevel::SnapshotIsolation, StorageMode::Transactional);
                let v = tx.find_vertex(gid, View::Old).expect("visible");
                v.set_property(prop_a, PropertyValue::Int(round))?;
                v.set_property(prop_b, PropertyValue::Int(round))?;
                drop(v);
                tx.commit()?;
            }
            Ok(())
        })
    };
    let reader = {
        let storage = Arc::clone(&storage);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..400 {
                let tx = storage
                    .access(IsolationLevel::SnapshotIsolation, StorageMode::Transactional);
                let v = tx.find_vertex(gid, View::Old).expect("visible");
                let a = v.get_property(prop_a, View::Old).unwrap();
                let b = v.get_property(prop_b, View::Old).unwrap();
                assert_eq!(a, b, "half-committed transaction observed");
            }
        })
    };
    writer.join().unwrap()?;
    reader.join().unwrap();
    Ok(())
}

#[test]
fn own_writes_are_visible_in_program_order() -> trellis::Result<()> {
    let dir = tempdir()?;
    let storage = open_storage(dir.path());
    let label = storage.label_id("L");
    let prop = storage.property_id("p");

    let tx = si(&storage);
    let v = tx.create_vertex()?;
    v.add_label(label)?;
    v.set_property(prop, PropertyValue::Int(7))?;
    assert!(v.has_label(label, View::New)?);
    assert_eq!(v.get_property(prop, View::New)?, PropertyValue::Int(7));
    // The pre-transaction view does not contain the uncommitted vertex.
    assert!(matches!(
        v.get_property(prop, View::Old),
        Err(Error::NonexistentObject)
    ));
    Ok(())
}

#[test]
fn isolation_levels_select_the_view() -> trellis::Result<()> {
    let dir = tempdir()?;
    let storage = open_storage(dir.path());
    let prop = storage.property_id("p");

    let gid;
    {
        let setup = si(&storage);
        let v = setup.create_vertex()?;
        v.set_property(prop, PropertyValue::Int(1))?;
        gid = v.gid();
        drop(v);
        setup.commit()?;
    }

    let snapshot_reader = si(&storage);
    let committed_reader =
        storage.access(IsolationLevel::ReadCommitted, StorageMode::Transactional);
    let uncommitted_reader =
        storage.access(IsolationLevel::ReadUncommitted, StorageMode::Transactional);

    // A later committed write...
    {
        let writer = si(&storage);
        let v = writer.find_vertex(gid, View::Old).expect("visible");
        v.set_property(prop, PropertyValue::Int(2))?;
        drop(v);
        writer.commit()?;
    }
    // ...and an open uncommitted one.
    let open_writer = si(&storage);
    let v = open_writer.find_vertex(gid, View::Old).expect("visible");
    v.set_property(prop, PropertyValue::Int(3))?;
    drop(v);

    let read = |accessor: &trellis::Accessor| -> trellis::Result<PropertyValue> {
        accessor
            .find_vertex(gid, View::Old)
            .expect("visible")
            .get_property(prop, View::Old)
    };
    assert_eq!(read(&snapshot_reader)?, PropertyValue::Int(1));
    assert_eq!(read(&committed_reader)?, PropertyValue::Int(2));
    assert_eq!(read(&uncommitted_reader)?, PropertyValue::Int(3));

    open_writer.abort();
    Ok(())
}

#[test]
fn existence_constraint_enforced_at_commit() -> trellis::Result<()> {
    let dir = tempdir()?;
    let storage = open_storage(dir.path());
    let label = storage.label_id("Person");
    let prop = storage.property_id("name");
    storage.create_existence_constraint(label, prop)?;

    let tx = si(&storage);
    let v = tx.create_vertex()?;
    v.add_label(label)?;
    drop(v);
    assert!(matches!(
        tx.commit(),
        Err(Error::ConstraintViolation(violation))
            if violation.label == label && violation.properties == vec![prop]
    ));

    // With the property present the commit passes.
    let tx = si(&storage);
    let v = tx.create_vertex()?;
    v.add_label(label)?;
    v.set_property(prop, PropertyValue::from("ada"))?;
    drop(v);
    tx.commit()?;
    Ok(())
}

#[test]
fn abort_restores_previous_state() -> trellis::Result<()> {
    let dir = tempdir()?;
    let storage = open_storage(dir.path());
    let label = storage.label_id("L");
    let prop = storage.property_id("p");
    let knows = storage.edge_type_id("KNOWS");

    let (g1, g2);
    {
        let setup = si(&storage);
        let v1 = setup.create_vertex()?;
        v1.set_property(prop, PropertyValue::Int(1))?;
        g1 = v1.gid();
        let v2 = setup.create_vertex()?;
        g2 = v2.gid();
        drop((v1, v2));
        setup.commit()?;
    }
    assert_eq!(storage.info().edge_count, 0);

    {
        let tx = si(&storage);
        let v1 = tx.find_vertex(g1, View::Old).expect("visible");
        let v2 = tx.find_vertex(g2, View::Old).expect("visible");
        v1.add_label(label)?;
        v1.set_property(prop, PropertyValue::Int(99))?;
        tx.create_edge(&v1, &v2, knows)?;
        drop((v1, v2));
        tx.abort();
    }

    let check = si(&storage);
    let v1 = check.find_vertex(g1, View::Old).expect("visible");
    assert!(!v1.has_label(label, View::Old)?);
    assert_eq!(v1.get_property(prop, View::Old)?, PropertyValue::Int(1));
    assert!(v1.out_edges(View::Old, &[])?.is_empty());
    assert_eq!(storage.info().edge_count, 0);
    Ok(())
}

#[test]
fn detach_delete_semantics() -> trellis::Result<()> {
    let dir = tempdir()?;
    let storage = open_storage(dir.path());
    let knows = storage.edge_type_id("KNOWS");

    let (g1, g2);
    {
        let setup = si(&storage);
        let v1 = setup.create_vertex()?;
        let v2 = setup.create_vertex()?;
        setup.create_edge(&v1, &v2, knows)?;
        g1 = v1.gid();
        g2 = v2.gid();
        drop((v1, v2));
        setup.commit()?;
    }

    // Without detach the vertex with an edge cannot be deleted.
    {
        let tx = si(&storage);
        let v1 = tx.find_vertex(g1, View::Old).expect("visible");
        let result = tx.detach_delete(&[v1], &[], false);
        assert!(matches!(result, Err(Error::VertexHasEdges)));
        tx.abort();
    }

    // With detach both the vertex and its edge go away.
    {
        let tx = si(&storage);
        let v1 = tx.find_vertex(g1, View::Old).expect("visible");
        let (deleted_vertices, deleted_edges) = tx.detach_delete(&[v1], &[], true)?;
        assert_eq!(deleted_vertices, vec![g1]);
        assert_eq!(deleted_edges.len(), 1);
        tx.commit()?;
    }

    let check = si(&storage);
    assert!(check.find_vertex(g1, View::Old).is_none());
    let v2 = check.find_vertex(g2, View::Old).expect("v2 survives");
    assert!(v2.in_edges(View::Old, &[])?.is_empty());
    assert_eq!(storage.info().edge_count, 0);
    Ok(())
}

#[test]
fn deleted_vertex_rejects_writes() -> trellis::Result<()> {
    let dir = tempdir()?;
    let storage = open_storage(dir.path());
    let prop = storage.property_id("p");

    let gid;
    {
        let setup = si(&storage);
        gid = setup.create_vertex()?.gid();
        setup.commit()?;
    }
    let tx = si(&storage);
    let v = tx.find_vertex(gid, View::Old).expect("visible");
    tx.detach_delete(&[tx.find_vertex(gid, View::Old).unwrap()], &[], true)?;
    assert!(matches!(
        v.set_property(prop, PropertyValue::Int(1)),
        Err(Error::DeletedObject)
    ));
    Ok(())
}

#[test]
fn termination_and_timeout() -> trellis::Result<()> {
    let dir = tempdir()?;
    let storage = open_storage(dir.path());

    let tx = si(&storage);
    tx.terminate();
    assert!(matches!(
        tx.create_vertex(),
        Err(Error::TransactionTerminated)
    ));
    tx.abort();

    let mut config = Config::in_memory(dir.path().join("timeout"));
    config.periodic_gc = false;
    config.transaction_timeout = Some(Duration::from_millis(5));
    let bounded = Storage::new(config)?;
    let tx = bounded.access(IsolationLevel::SnapshotIsolation, StorageMode::Transactional);
    thread::sleep(Duration::from_millis(20));
    assert!(matches!(
        tx.create_vertex(),
        Err(Error::TransactionTimeout)
    ));
    Ok(())
}

#[test]
fn analytical_mode_writes_directly() -> trellis::Result<()> {
    let dir = tempdir()?;
    let storage = open_storage(dir.path());
    let prop = storage.property_id("p");

    let analytical = storage.access(IsolationLevel::SnapshotIsolation, StorageMode::Analytical);
    let v = analytical.create_vertex()?;
    v.set_property(prop, PropertyValue::Int(5))?;
    let gid = v.gid();
    drop(v);

    // Visible to a concurrent snapshot reader immediately: analytical
    // writes bypass versioning.
    let reader = si(&storage);
    let seen = reader.find_vertex(gid, View::Old).expect("visible");
    assert_eq!(seen.get_property(prop, View::Old)?, PropertyValue::Int(5));
    drop(seen);
    drop(reader);

    // Analytical deletion leaves a tombstone that GC erases.
    analytical.detach_delete(&[analytical.find_vertex(gid, View::New).unwrap()], &[], true)?;
    analytical.commit()?;
    storage.run_gc();
    assert_eq!(storage.info().vertex_count, 0);
    Ok(())
}
