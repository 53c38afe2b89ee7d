use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use tempfile::tempdir;
use trellis::{Config, Error, IsolationLevel, PropertyValue, Storage, StorageMode, View};

fn si(storage: &Storage) -> trellis::Accessor {
    storage.access(IsolationLevel::SnapshotIsolation, StorageMode::Transactional)
}

#[test]
fn s6_gc_reclaims_after_reader_leaves() -> trellis::Result<()> {
    let dir = tempdir()?;
    let mut config = Config::in_memory(dir.path());
    config.periodic_gc = false;
    let storage = Storage::new(config)?;
    let label = storage.label_id("Churn");
    let prop = storage.property_id("p");
    storage.create_label_index(label)?;
    storage.create_label_property_index(label, prop)?;

    // Long-lived reader pins the oldest active start timestamp.
    let long_reader = si(&storage);

    // Churn: create, update several times, then delete, across many
    // committed transactions.
    let mut gids = Vec::new();
    for i in 0..100i64 {
        let tx = si(&storage);
        let v = tx.create_vertex()?;
        v.add_label(label)?;
        v.set_property(prop, PropertyValue::Int(i))?;
        gids.push(v.gid());
        drop(v);
        tx.commit()?;
    }
    for round in 0..10i64 {
        let tx = si(&storage);
        for gid in &gids {
            let v = tx.find_vertex(*gid, View::Old).expect("visible");
            v.set_property(prop, PropertyValue::Int(round))?;
        }
        tx.commit()?;
    }
    {
        let tx = si(&storage);
        let doomed: Vec<_> = gids
            .iter()
            .map(|gid| tx.find_vertex(*gid, View::Old).expect("visible"))
            .collect();
        tx.detach_delete(&doomed, &[], true)?;
        drop(doomed);
        tx.commit()?;
    }

    // While the reader lives, GC must not reclaim anything it can see.
    storage.run_gc();
    storage.run_gc();
    assert_eq!(storage.info().vertex_count, 100);
    assert!(storage.index_entry_count() > 0);
    let still_visible = long_reader
        .vertices_by_label(label, View::Old)
        .expect("index scan");
    assert!(still_visible.is_empty(), "reader started before the churn");

    // Release the reader and give the two-phase collector its cycles: the
    // first unlinks, a helper transaction advances the oldest-active fence,
    // the second reclaims.
    long_reader.abort();
    storage.run_gc();
    si(&storage).commit()?;
    storage.run_gc();

    assert_eq!(storage.info().vertex_count, 0);
    assert_eq!(storage.index_entry_count(), 0);
    Ok(())
}

#[test]
fn reader_never_sees_reclaimed_state_under_continuous_gc() -> trellis::Result<()> {
    let dir = tempdir()?;
    let mut config = Config::in_memory(dir.path());
    config.gc_interval = Duration::from_millis(5);
    let storage = Arc::new(Storage::new(config)?);
    let prop = storage.property_id("p");

    let gid;
    {
        let setup = si(&storage);
        let v = setup.create_vertex()?;
        v.set_property(prop, PropertyValue::Int(0))?;
        gid = v.gid();
        drop(v);
        setup.commit()?;
    }

    let barrier = Arc::new(Barrier::new(3));
    let reader = {
        let storage = Arc::clone(&storage);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            // One long snapshot: every read must keep yielding the value
            // from before the writer churn, no matter what GC reclaims.
            let tx = storage
                .access(IsolationLevel::SnapshotIsolation, StorageMode::Transactional);
            for _ in 0..500 {
                let v = tx.find_vertex(gid, View::Old).expect("visible");
                let value = v.get_property(prop, View::Old).unwrap();
                assert_eq!(value, PropertyValue::Int(0));
            }
        })
    };
    let writer = {
        let storage = Arc::clone(&storage);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || -> trellis::Result<()> {
            barrier.wait();
            for i in 1..=300i64 {
                let tx = storage
                    .access(IsolationLevel::SnapshotIsolation, StorageMode::Transactional);
                let v = tx.find_vertex(gid, View::Old).expect("visible");
                v.set_property(prop, PropertyValue::Int(i))?;
                drop(v);
                tx.commit()?;
            }
            Ok(())
        })
    };
    barrier.wait();
    reader.join().unwrap();
    writer.join().unwrap()?;
    Ok(())
}

#[test]
fn edge_count_matches_enumeration() -> trellis::Result<()> {
    let dir = tempdir()?;
    let mut config = Config::in_memory(dir.path());
    config.periodic_gc = false;
    let storage = Storage::new(config)?;
    let link = storage.edge_type_id("LINK");

    let mut gids = Vec::new();
    {
        let tx = si(&storage);
        for _ in 0..10 {
            gids.push(tx.create_vertex()?.gid());
        }
        tx.commit()?;
    }

    // Committed edges between consecutive vertices.
    {
        let tx = si(&storage);
        for pair in gids.windows(2) {
            let from = tx.find_vertex(pair[0], View::Old).expect("visible");
            let to = tx.find_vertex(pair[1], View::Old).expect("visible");
            tx.create_edge(&from, &to, link)?;
        }
        tx.commit()?;
    }
    // An aborted transaction adds and removes edges; it must not leak into
    // the count.
    {
        let tx = si(&storage);
        let from = tx.find_vertex(gids[0], View::Old).expect("visible");
        let to = tx.find_vertex(gids[5], View::Old).expect("visible");
        tx.create_edge(&from, &to, link)?;
        let existing = from.out_edges(View::New, &[])?;
        tx.delete_edge(&existing[0])?;
        drop((existing, from, to));
        tx.abort();
    }
    // A committed deletion.
    {
        let tx = si(&storage);
        let from = tx.find_vertex(gids[3], View::Old).expect("visible");
        let existing = from.out_edges(View::Old, &[])?;
        tx.delete_edge(&existing[0])?;
        drop((existing, from));
        tx.commit()?;
    }

    storage.run_gc();
    si(&storage).commit()?;
    storage.run_gc();

    let tx = si(&storage);
    let enumerated: u64 = tx
        .vertices(View::Old)
        .iter()
        .map(|vertex| vertex.out_edges(View::Old, &[]).unwrap().len() as u64)
        .sum();
    assert_eq!(enumerated, 8);
    assert_eq!(storage.info().edge_count, enumerated);
    Ok(())
}

#[test]
fn oldest_active_advances_past_failed_commits() -> trellis::Result<()> {
    let dir = tempdir()?;
    let mut config = Config::in_memory(dir.path());
    config.periodic_gc = false;
    let storage = Storage::new(config)?;
    let label = storage.label_id("L");
    let prop = storage.property_id("p");
    storage.create_unique_constraint(label, &[prop])?;

    let g2;
    {
        let setup = si(&storage);
        let v1 = setup.create_vertex()?;
        v1.add_label(label)?;
        v1.set_property(prop, PropertyValue::from("same"))?;
        let v2 = setup.create_vertex()?;
        v2.add_label(label)?;
        v2.set_property(prop, PropertyValue::from("other"))?;
        g2 = v2.gid();
        drop((v1, v2));
        setup.commit()?;
    }

    // A unique-constraint violation aborts the commit after it already
    // drew its commit timestamp from the shared counter.
    {
        let tx = si(&storage);
        tx.find_vertex(g2, View::Old)
            .expect("visible")
            .set_property(prop, PropertyValue::from("same"))?;
        assert!(matches!(tx.commit(), Err(Error::ConstraintViolation(_))));
    }

    // The burned timestamp must not pin the oldest-active fence: later
    // garbage is still reclaimed and the fence keeps moving.
    let doomed;
    {
        let tx = si(&storage);
        doomed = tx.create_vertex()?.gid();
        tx.commit()?;
    }
    {
        let tx = si(&storage);
        let v = tx.find_vertex(doomed, View::Old).expect("visible");
        tx.detach_delete(&[v], &[], true)?;
        tx.commit()?;
    }

    storage.run_gc();
    let first = storage.last_gc_stats().expect("cycle ran").oldest_active;
    si(&storage).commit()?;
    storage.run_gc();
    let second = storage.last_gc_stats().expect("cycle ran").oldest_active;
    assert!(second > first, "oldest-active fence stalled at {first}");
    // Physical reclamation happened: only v1 and v2 remain in the store.
    assert_eq!(storage.info().vertex_count, 2);
    assert!(si(&storage).find_vertex(doomed, View::Old).is_none());
    Ok(())
}

#[test]
fn gc_stats_report_progress() -> trellis::Result<()> {
    let dir = tempdir()?;
    let mut config = Config::in_memory(dir.path());
    config.periodic_gc = false;
    let storage = Storage::new(config)?;

    for _ in 0..5 {
        let tx = si(&storage);
        tx.create_vertex()?;
        tx.commit()?;
    }
    storage.run_gc();
    let stats = storage.last_gc_stats().expect("a cycle ran");
    assert!(stats.transactions_unlinked >= 5);
    assert!(!stats.forced);
    assert!(stats.oldest_active > 0);
    Ok(())
}
