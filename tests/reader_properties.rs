//! Stream-level properties of the cache reader

mod common;

use common::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use strata_db_cache::{
    Error, Fragment, MutationReader, Position, PositionRange, RowRange, Tombstone,
};

#[tokio::test]
async fn test_p2_second_read_never_fast_forwards() {
    let t = Tombstone::new(3, 30);
    let builder = ReaderBuilder::new()
        .fragments(vec![
            row_frag(1),
            rtc_before(2, Some(t)),
            row_frag(4),
            rtc_before(6, None),
            row_frag(8),
        ])
        .ranges(vec![RowRange::inclusive(k(0), k(9))]);

    let mut reader = builder.build();
    let first = drain(&mut reader).await;
    assert_well_formed(&first, false);
    let fast_forwards = builder.stats.fast_forwards();

    let mut reader = builder.build();
    let second = drain(&mut reader).await;
    assert_eq!(second, first);
    assert_eq!(builder.stats.fast_forwards(), fast_forwards);
}

#[tokio::test]
async fn test_p3_continuity_serves_subranges_from_cache_alone() {
    let builder = ReaderBuilder::new()
        .fragments(vec![row_frag(1), row_frag(3), row_frag(5)])
        .ranges(vec![RowRange::inclusive(k(0), k(6))]);
    let mut reader = builder.build();
    drain(&mut reader).await;

    // Any subrange of the covered interval must not consult the underlying.
    for (range, expected) in [
        (RowRange::inclusive(k(0), k(6)), vec![1, 3, 5]),
        (RowRange::inclusive(k(1), k(3)), vec![1, 3]),
        (RowRange::inclusive(k(2), k(4)), vec![3]),
        (RowRange::inclusive(k(4), k(6)), vec![5]),
    ] {
        let sub = ReaderBuilder {
            cache: builder.cache.clone(),
            key: builder.key.clone(),
            ranges: vec![range.clone()],
            ..ReaderBuilder::new()
        };
        let mut reader = sub.build_cache_only();
        let fragments = drain(&mut reader).await;
        assert_well_formed(&fragments, false);
        assert_eq!(row_keys(&fragments), expected, "range {:?}", range);
    }
}

#[tokio::test]
async fn test_p3_continuity_replays_tombstones_from_cache_alone() {
    let t = Tombstone::new(10, 100);
    let builder = ReaderBuilder::new()
        .fragments(vec![
            rtc_before(1, Some(t)),
            row_frag(2),
            rtc_before(4, None),
        ])
        .ranges(vec![RowRange::inclusive(k(0), k(5))]);
    let mut reader = builder.build();
    drain(&mut reader).await;

    let sub = ReaderBuilder {
        cache: builder.cache.clone(),
        key: builder.key.clone(),
        ranges: vec![RowRange::inclusive(k(1), k(3))],
        ..ReaderBuilder::new()
    };
    let mut reader = sub.build_cache_only();
    let fragments = drain(&mut reader).await;
    assert_well_formed(&fragments, false);
    // Exactly the row, wrapped in the transitions the stored tombstone
    // implies for this window.
    assert_eq!(
        body(&fragments),
        vec![
            rtc_before(1, Some(t)),
            row_frag(2),
            Fragment::RangeTombstoneChange {
                position: Position::after_key(k(3)),
                tombstone: None,
            },
        ]
    );
}

#[tokio::test]
async fn test_p4_redundant_dummy_is_elided_without_semantic_change() {
    let builder = ReaderBuilder::new()
        .fragments(vec![row_frag(1), row_frag(3)])
        .ranges(vec![RowRange::inclusive(k(0), k(5))]);
    let mut reader = builder.build();
    drain(&mut reader).await;

    let snapshot = builder.cache.snapshot(&builder.key);
    let mid_dummy = snapshot
        .entry_snapshot(&Position::after_key(k(5)))
        .unwrap();
    assert!(mid_dummy.dummy && mid_dummy.continuous);

    // Extending the scan seals a new dummy at 8; the one at 5 now sits
    // inside a continuous interval with the same tombstone and is dropped.
    let extended = ReaderBuilder {
        cache: builder.cache.clone(),
        key: builder.key.clone(),
        fragments: builder.fragments.clone(),
        ranges: vec![RowRange::inclusive(k(0), k(8))],
        stats: builder.stats.clone(),
        ..ReaderBuilder::new()
    };
    let mut reader = extended.build();
    let fragments = drain(&mut reader).await;
    assert_eq!(row_keys(&fragments), vec![1, 3]);

    assert!(
        snapshot.entry_snapshot(&Position::after_key(k(5))).is_none(),
        "the interior dummy must be elided"
    );
    assert!(
        !builder.cache.tracker().lru_contains(mid_dummy.id),
        "the elided entry must leave the LRU"
    );
    let end_dummy = snapshot
        .entry_snapshot(&Position::after_key(k(8)))
        .unwrap();
    assert!(end_dummy.dummy && end_dummy.continuous);

    // Logical content is unchanged: both ranges replay from cache.
    for range in [
        RowRange::inclusive(k(0), k(5)),
        RowRange::inclusive(k(0), k(8)),
    ] {
        let sub = ReaderBuilder {
            cache: builder.cache.clone(),
            key: builder.key.clone(),
            ranges: vec![range],
            ..ReaderBuilder::new()
        };
        let mut reader = sub.build_cache_only();
        let fragments = drain(&mut reader).await;
        assert_eq!(row_keys(&fragments), vec![1, 3]);
    }
}

#[tokio::test]
async fn test_p7_position_fast_forward_is_a_programming_error() {
    let builder = ReaderBuilder::new().ranges(vec![RowRange::inclusive(k(0), k(5))]);
    let mut reader = builder.build();
    let err = reader
        .fast_forward_to(PositionRange::new(
            Position::before_key(k(0)),
            Position::after_key(k(5)),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Unsupported(_)));
}

#[tokio::test]
async fn test_underlying_failure_propagates() {
    let builder = ReaderBuilder::new().ranges(vec![RowRange::inclusive(k(0), k(5))]);
    let mut reader = builder.build_cache_only();
    let err = drain_result(&mut reader).await.unwrap_err();
    assert!(matches!(err, Error::Underlying(_)));
}

async fn drain_result(
    reader: &mut strata_db_cache::CacheRowReader<'_>,
) -> strata_db_cache::Result<Vec<Fragment>> {
    let mut out = Vec::new();
    while !reader.is_end_of_stream() {
        reader.fill_buffer().await?;
        while let Some(fragment) = reader.pop_fragment() {
            out.push(fragment);
        }
    }
    Ok(out)
}

/// Randomized differential run: random row sets and range reads against one
/// shared cache, checked against the plain set model after every read
#[tokio::test]
async fn test_random_reads_agree_with_model() {
    let mut rng = StdRng::seed_from_u64(0x5712a7a);
    for round in 0..8 {
        let mut keys: Vec<i64> = (0..50).filter(|_| rng.gen_bool(0.3)).collect();
        keys.sort_unstable();
        keys.dedup();
        let t = Tombstone::new(5, 50);
        let mut fragments: Vec<Fragment> = keys.iter().map(|&v| row_frag(v)).collect();
        if rng.gen_bool(0.5) {
            // One tombstone zone over a random stretch.
            let lo = rng.gen_range(0..25);
            let hi = rng.gen_range(lo + 1..=49);
            fragments.push(rtc_before(lo, Some(t)));
            fragments.push(rtc_before(hi, None));
        }
        fragments.sort_by(|a, b| a.position().cmp(&b.position()));

        let builder = ReaderBuilder::new()
            .fragments(fragments)
            .ranges(vec![RowRange::full()]);

        for read in 0..6 {
            let lo = rng.gen_range(0..40);
            let hi = rng.gen_range(lo..50);
            let ranges = vec![RowRange::inclusive(k(lo), k(hi))];
            let expected: Vec<i64> = keys
                .iter()
                .copied()
                .filter(|&key| key >= lo && key <= hi)
                .collect();

            let sub = ReaderBuilder {
                cache: builder.cache.clone(),
                key: builder.key.clone(),
                fragments: builder.fragments.clone(),
                ranges,
                stats: builder.stats.clone(),
                ..ReaderBuilder::new()
            };
            let mut reader = sub.build();
            let fragments = drain(&mut reader).await;
            assert_well_formed(&fragments, false);
            assert_eq!(
                row_keys(&fragments),
                expected,
                "round {} read {} range [{}, {}]",
                round,
                read,
                lo,
                hi
            );
        }

        // A final full read, then the same from cache alone: everything the
        // partition holds is now continuous.
        let mut reader = builder.build();
        let full = drain(&mut reader).await;
        assert_eq!(row_keys(&full), keys);
        let cache_only = ReaderBuilder {
            cache: builder.cache.clone(),
            key: builder.key.clone(),
            ranges: vec![RowRange::full()],
            ..ReaderBuilder::new()
        };
        let mut reader = cache_only.build_cache_only();
        let replay = drain(&mut reader).await;
        assert_eq!(row_keys(&replay), keys);
        assert_well_formed(&replay, false);
    }
}
