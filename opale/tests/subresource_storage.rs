//! Laws of the compressed per-subresource state map, checked through the
//! public API.

use opale::{Aspects, SubresourceRange, SubresourceStorage, TextureFormat};

fn collect(storage: &SubresourceStorage<u32>) -> Vec<(SubresourceRange, u32)> {
    let mut out = Vec::new();
    storage.iterate(|range, value| out.push((*range, *value)));
    out
}

fn value_at(storage: &SubresourceStorage<u32>, aspect: Aspects, layer: u32, mip: u32) -> u32 {
    *storage.get(aspect, layer, mip)
}

#[test]
fn fill_makes_every_subresource_observe_the_value() {
    let aspects = Aspects::DEPTH | Aspects::STENCIL;
    let mut storage = SubresourceStorage::new(aspects, 6, 4, 0u32);
    storage.fill(42);

    for aspect in aspects.iter_bits() {
        for layer in 0..6 {
            for mip in 0..4 {
                assert_eq!(value_at(&storage, aspect, layer, mip), 42);
            }
        }
    }
}

#[test]
fn update_touches_exactly_the_requested_range() {
    let mut storage = SubresourceStorage::new(Aspects::COLOR, 4, 5, 1u32);
    let range = SubresourceRange {
        aspects: Aspects::COLOR,
        base_array_layer: 1,
        layer_count: 2,
        base_mip_level: 2,
        level_count: 3,
    };
    storage.update(&range, |_, value| *value = 9);

    for layer in 0..4 {
        for mip in 0..5 {
            let inside = (1..3).contains(&layer) && (2..5).contains(&mip);
            assert_eq!(
                value_at(&storage, Aspects::COLOR, layer, mip),
                if inside { 9 } else { 1 }
            );
        }
    }
}

#[test]
fn update_ranges_partition_the_request() {
    let mut storage = SubresourceStorage::new(Aspects::COLOR, 3, 3, 0u32);
    // Desynchronize one subresource so the storage holds mixed granularity.
    storage.update(
        &SubresourceRange::single(Aspects::COLOR, 2, 2),
        |_, value| *value = 7,
    );

    let mut visited = 0u32;
    storage.update(
        &SubresourceRange::whole(Aspects::COLOR, 3, 3),
        |range, _| {
            visited += range.layer_count * range.level_count;
        },
    );
    // Every subresource is visited exactly once, whatever the chunking.
    assert_eq!(visited, 9);
}

#[test]
fn converging_values_compress_back_to_one_range() {
    let mut storage = SubresourceStorage::new(Aspects::COLOR, 4, 4, 0u32);
    storage.update(
        &SubresourceRange::single(Aspects::COLOR, 0, 0),
        |_, value| *value = 3,
    );
    assert!(collect(&storage).len() > 1);

    storage.update(
        &SubresourceRange::whole(Aspects::COLOR, 4, 4),
        |_, value| *value = 3,
    );
    assert_eq!(
        collect(&storage),
        vec![(SubresourceRange::whole(Aspects::COLOR, 4, 4), 3)]
    );
}

#[test]
fn merge_coverage_is_independent_of_compression_history() {
    // Two storages with identical logical contents but different histories.
    let mut compressed = SubresourceStorage::new(Aspects::COLOR, 3, 2, 5u32);

    let mut decompressed = SubresourceStorage::new(Aspects::COLOR, 3, 2, 0u32);
    decompressed.update(
        &SubresourceRange::single(Aspects::COLOR, 1, 0),
        |_, value| *value = 8,
    );
    decompressed.update(
        &SubresourceRange::whole(Aspects::COLOR, 3, 2),
        |_, value| *value = 5,
    );

    assert_eq!(collect(&compressed), collect(&decompressed));

    let mut other = SubresourceStorage::new(Aspects::COLOR, 3, 2, 100u32);
    other.update(
        &SubresourceRange::single(Aspects::COLOR, 2, 1),
        |_, value| *value = 200,
    );

    let mut merged_a = Vec::new();
    compressed.merge(&other, |range, value, incoming| {
        *value += *incoming;
        merged_a.push((*range, *value));
    });
    let mut merged_b = Vec::new();
    decompressed.merge(&other, |range, value, incoming| {
        *value += *incoming;
        merged_b.push((*range, *value));
    });

    // Merge callbacks may chunk differently, but the resulting contents are
    // identical.
    assert_eq!(collect(&compressed), collect(&decompressed));
    assert_eq!(value_at(&compressed, Aspects::COLOR, 2, 1), 205);
    assert_eq!(value_at(&compressed, Aspects::COLOR, 0, 0), 105);
}

#[test]
fn format_aspects_drive_storage_shape() {
    let ds = TextureFormat::Depth24UnormStencil8.info();
    assert_eq!(ds.aspects, Aspects::DEPTH | Aspects::STENCIL);

    let storage = SubresourceStorage::new(ds.aspects, 1, 1, 0u32);
    assert_eq!(storage.aspects().count(), 2);
    // Independent per-aspect values.
    let mut storage = storage;
    storage.update(
        &SubresourceRange::single(Aspects::STENCIL, 0, 0),
        |_, value| *value = 1,
    );
    assert_eq!(value_at(&storage, Aspects::DEPTH, 0, 0), 0);
    assert_eq!(value_at(&storage, Aspects::STENCIL, 0, 0), 1);
}
