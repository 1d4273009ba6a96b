//! Property tests: no overlapping slots, conservation of in-use bytes

mod common;

use std::collections::HashMap;

use common::{scenario_classes, HostFixture};
use forgemem::memory::{AllocationToken, SizeClassConfig};
use proptest::prelude::*;
use rayon::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Allocate { size: u64, align_shift: u32 },
    Free { pick: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u64..66_000, 0u32..9).prop_map(|(size, align_shift)| Op::Allocate { size, align_shift }),
        2 => any::<usize>().prop_map(|pick| Op::Free { pick }),
    ]
}

fn slot_size_of(classes: &[SizeClassConfig], token: &AllocationToken) -> u64 {
    classes[token.class_index().expect("live token")].slot_size
}

/// Live slots as half-open ranges per backing buffer must be disjoint
fn assert_disjoint(classes: &[SizeClassConfig], live: &[AllocationToken]) {
    let mut by_buffer: HashMap<u64, Vec<(u64, u64)>> = HashMap::new();
    for token in live {
        let start = token.buffer_offset();
        by_buffer
            .entry(token.buffer().raw())
            .or_default()
            .push((start, start + slot_size_of(classes, token)));
    }
    for ranges in by_buffer.values_mut() {
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlapping slots {:?}", pair);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_no_overlap_and_conservation(ops in prop::collection::vec(op_strategy(), 1..300)) {
        let classes = scenario_classes();
        let fixture = HostFixture::new();
        let allocator = fixture.dedicated_allocator(&classes).unwrap();
        let mut live: Vec<AllocationToken> = Vec::new();

        for op in ops {
            match op {
                Op::Allocate { size, align_shift } => {
                    match allocator.allocate(size, 1 << align_shift) {
                        Ok(token) => {
                            prop_assert!(token.size() <= slot_size_of(&classes, &token));
                            prop_assert_eq!(token.buffer_offset() % (1 << align_shift), 0);
                            live.push(token);
                        }
                        Err(e) => prop_assert!(
                            e.is_out_of_memory()
                                || matches!(e, forgemem::ForgeMemError::RequestTooLarge { .. }),
                            "unexpected error {}",
                            e
                        ),
                    }
                }
                Op::Free { pick } => {
                    if !live.is_empty() {
                        let token = live.swap_remove(pick % live.len());
                        allocator.free(token).unwrap();
                    }
                }
            }

            let stats = allocator.stats().unwrap();
            let expected: u64 = live.iter().map(|t| slot_size_of(&classes, t)).sum();
            prop_assert_eq!(stats.in_use_bytes, expected);
            prop_assert_eq!(stats.live_allocations, live.len() as u64);
        }

        assert_disjoint(&classes, &live);
        allocator.validate().unwrap();
        for token in live {
            allocator.free(token).unwrap();
        }
        prop_assert_eq!(allocator.stats().unwrap().chunk_count, 0);
    }

    #[test]
    fn test_class_selection_is_smallest_fit(size in 1u64..65_536, align_shift in 0u32..17) {
        let classes = scenario_classes();
        let fixture = HostFixture::new();
        let allocator = fixture.dedicated_allocator(&classes).unwrap();
        let alignment = 1u64 << align_shift;

        let expected = classes
            .iter()
            .position(|c| c.slot_size >= size && c.slot_size >= alignment && c.slot_size % alignment == 0);
        match (allocator.allocate(size, alignment), expected) {
            (Ok(token), Some(class)) => {
                prop_assert_eq!(token.class_index(), Some(class));
                allocator.free(token).unwrap();
            }
            (Err(e), None) => prop_assert!(
                matches!(e, forgemem::ForgeMemError::RequestTooLarge { .. }),
                "unexpected error {}",
                e
            ),
            (result, expected) => prop_assert!(false, "got {:?}, expected class {:?}", result.map(|t| t.to_string()), expected),
        }
    }
}

#[test]
fn test_concurrent_allocation_no_overlap() {
    let classes = scenario_classes();
    let fixture = HostFixture::new();
    let allocator = fixture.dedicated_allocator(&classes).unwrap();

    let live: Vec<AllocationToken> = (0..3000u64)
        .into_par_iter()
        .map(|i| allocator.allocate(1 + (i * 131) % 2000, 8).unwrap())
        .collect();
    assert_disjoint(&classes, &live);
    allocator.validate().unwrap();

    let expected: u64 = live.iter().map(|t| slot_size_of(&classes, t)).sum();
    assert_eq!(allocator.stats().unwrap().in_use_bytes, expected);

    live.into_par_iter()
        .for_each(|token| allocator.free(token).unwrap());
    assert_eq!(allocator.stats().unwrap().chunk_count, 0);
    drop(allocator);
    fixture.assert_no_leak();
}
