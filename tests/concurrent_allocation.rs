mod support;

use occukey_rs::{KeyLookupResult, OccurrenceKey};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::Arc;
use std::thread;
use support::{fast_config, SharedTables};

#[test]
fn racing_overlapping_sets_converge_on_one_key() -> anyhow::Result<()> {
    let tables = SharedTables::new();
    let first = Arc::new(tables.service(&fast_config()));
    let second = Arc::new(tables.service(&fast_config()));

    let left = {
        let service = Arc::clone(&first);
        thread::spawn(move || service.generate_key(["a"], "ds"))
    };
    let right = {
        let service = Arc::clone(&second);
        thread::spawn(move || service.generate_key(["b", "a"], "ds"))
    };

    let left = left.join().unwrap()?;
    let right = right.join().unwrap()?;

    assert_eq!(left.key, right.key);
    assert_eq!(
        [left, right].iter().filter(|r| r.created).count(),
        1,
        "exactly one racer creates the key"
    );
    Ok(())
}

#[test]
fn many_writers_sharing_a_fragment_converge() -> anyhow::Result<()> {
    let tables = SharedTables::new();
    let service = Arc::new(tables.service(&fast_config()));

    let mut handles = Vec::new();
    for i in 0..8 {
        let service = Arc::clone(&service);
        handles.push(thread::spawn(move || {
            // Every set shares the pivot fragment plus a writer-specific one.
            service.generate_key(["pivot", &format!("writer-{i}")], "ds")
        }));
    }

    let results: Vec<KeyLookupResult> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect::<anyhow::Result<_>>()?;

    let keys: HashSet<OccurrenceKey> = results.iter().map(|r| r.key).collect();
    assert_eq!(keys.len(), 1, "all writers must converge on one key");
    assert_eq!(results.iter().filter(|r| r.created).count(), 1);
    Ok(())
}

#[test]
fn disjoint_sets_get_distinct_keys() -> anyhow::Result<()> {
    let tables = SharedTables::new();
    let service = Arc::new(tables.service(&fast_config()));

    let mut handles = Vec::new();
    for i in 0..8 {
        let service = Arc::clone(&service);
        handles.push(thread::spawn(move || {
            service.generate_key([format!("solo-{i}")], "ds")
        }));
    }

    let mut keys = HashSet::new();
    for handle in handles {
        let result = handle.join().unwrap()?;
        assert!(result.created);
        assert!(keys.insert(result.key), "duplicate key handed out");
    }
    assert_eq!(keys.len(), 8);
    Ok(())
}

#[test]
fn sequential_allocations_are_strictly_increasing() -> anyhow::Result<()> {
    let tables = SharedTables::new();
    let service = tables.service(&fast_config());

    let mut previous = 0;
    for i in 0..250 {
        let result = service.generate_key([format!("occ-{i}")], "ds")?;
        assert!(result.key.0 > previous);
        previous = result.key.0;
    }
    Ok(())
}

#[test]
fn randomized_overlapping_partitions_converge_per_group() -> anyhow::Result<()> {
    let mut rng = StdRng::seed_from_u64(42);
    let tables = SharedTables::new();
    let service = Arc::new(tables.service(&fast_config()));

    // Each group's writers share an anchor fragment and carry a random
    // number of writer-specific extras; groups never overlap each other.
    let mut group_keys = HashSet::new();
    for group in 0..5 {
        let mut handles = Vec::new();
        for writer in 0..4 {
            let mut uniques = vec![format!("g{group}-anchor")];
            for extra in 0..rng.random_range(0..3) {
                uniques.push(format!("g{group}-w{writer}-x{extra}"));
            }
            let service = Arc::clone(&service);
            handles.push(thread::spawn(move || service.generate_key(&uniques, "ds")));
        }

        let results: Vec<KeyLookupResult> = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<anyhow::Result<_>>()?;
        let keys: HashSet<OccurrenceKey> = results.iter().map(|r| r.key).collect();
        assert_eq!(keys.len(), 1, "group {group} did not converge");
        assert_eq!(results.iter().filter(|r| r.created).count(), 1);
        assert!(
            group_keys.insert(results[0].key),
            "group {group} reused another group's key"
        );
    }
    assert_eq!(group_keys.len(), 5);
    Ok(())
}

#[test]
fn parallel_processes_never_hand_out_the_same_key() -> anyhow::Result<()> {
    let tables = SharedTables::new();
    // Three service instances over one backend model three processes, each
    // with its own reserved counter window.
    let processes: Vec<_> = (0..3)
        .map(|_| Arc::new(tables.service(&fast_config())))
        .collect();

    let mut handles = Vec::new();
    for (process_id, process) in processes.iter().enumerate() {
        for worker in 0..4 {
            let service = Arc::clone(process);
            handles.push(thread::spawn(move || {
                let mut keys = Vec::new();
                for i in 0..25 {
                    let unique = format!("p{process_id}-w{worker}-occ-{i}");
                    keys.push(service.generate_key([unique], "ds")?);
                }
                anyhow::Ok(keys)
            }));
        }
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for handle in handles {
        for result in handle.join().unwrap()? {
            assert!(result.created);
            assert!(seen.insert(result.key), "key {} issued twice", result.key);
            total += 1;
        }
    }
    assert_eq!(total, 3 * 4 * 25);
    assert_eq!(seen.len(), total);
    Ok(())
}
