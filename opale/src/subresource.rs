//! Texture subresources and the compressed per-subresource state map.

use bitflags::bitflags;

bitflags! {
    /// The partitions of a texture used for synchronization purposes.
    ///
    /// Every format maps to a fixed, non-empty aspect set (see
    /// [`crate::format::FormatInfo`]).
    pub struct Aspects: u32 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
        const PLANE_0 = 1 << 3;
        const PLANE_1 = 1 << 4;
        const PLANE_2 = 1 << 5;
    }
}

pub(crate) const MAX_ASPECT_COUNT: usize = 6;

impl Aspects {
    /// Iterates over the individual aspect bits contained in this set.
    pub fn iter_bits(self) -> impl Iterator<Item = Aspects> {
        (0..MAX_ASPECT_COUNT as u32)
            .map(|i| Aspects::from_bits_truncate(1 << i))
            .filter(move |&a| self.contains(a))
    }

    /// Number of aspect bits set.
    pub fn count(self) -> usize {
        self.bits().count_ones() as usize
    }

    /// Position of `aspect` (a single bit) among the bits of `self`.
    fn index_of(self, aspect: Aspects) -> usize {
        debug_assert_eq!(aspect.count(), 1);
        debug_assert!(self.contains(aspect));
        (self.bits() & (aspect.bits() - 1)).count_ones() as usize
    }
}

/// A contiguous cuboid of subresources of one texture.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SubresourceRange {
    pub aspects: Aspects,
    pub base_array_layer: u32,
    pub layer_count: u32,
    pub base_mip_level: u32,
    pub level_count: u32,
}

impl SubresourceRange {
    /// The range covering every subresource of a texture with the given shape.
    pub fn whole(aspects: Aspects, layer_count: u32, level_count: u32) -> SubresourceRange {
        SubresourceRange {
            aspects,
            base_array_layer: 0,
            layer_count,
            base_mip_level: 0,
            level_count,
        }
    }

    /// A range of a single subresource.
    pub fn single(aspect: Aspects, array_layer: u32, mip_level: u32) -> SubresourceRange {
        debug_assert_eq!(aspect.count(), 1);
        SubresourceRange {
            aspects: aspect,
            base_array_layer: array_layer,
            layer_count: 1,
            base_mip_level: mip_level,
            level_count: 1,
        }
    }
}

#[derive(Clone, Debug)]
enum LayerData<T> {
    /// All mips of this layer hold the same value.
    Uniform(T),
    /// One value per mip level.
    PerMip(Vec<T>),
}

#[derive(Clone, Debug)]
enum AspectData<T> {
    /// All subresources of this aspect hold the same value.
    Uniform(T),
    /// One entry per array layer.
    PerLayer(Vec<LayerData<T>>),
}

/// A map from `(aspect, array layer, mip level)` to `T`, compressed on two
/// axes: whole aspects and whole layers holding a single equal value are
/// stored once. Compression is an implementation detail; the observable value
/// at any subresource is the value at its leaf.
#[derive(Clone, Debug)]
pub struct SubresourceStorage<T> {
    aspects: Aspects,
    layer_count: u32,
    mip_level_count: u32,
    per_aspect: Vec<AspectData<T>>,
}

impl<T: Clone + PartialEq> SubresourceStorage<T> {
    pub fn new(
        aspects: Aspects,
        layer_count: u32,
        mip_level_count: u32,
        initial: T,
    ) -> SubresourceStorage<T> {
        assert!(!aspects.is_empty());
        assert!(layer_count > 0 && mip_level_count > 0);
        SubresourceStorage {
            aspects,
            layer_count,
            mip_level_count,
            per_aspect: vec![AspectData::Uniform(initial); aspects.count()],
        }
    }

    pub fn aspects(&self) -> Aspects {
        self.aspects
    }

    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    pub fn mip_level_count(&self) -> u32 {
        self.mip_level_count
    }

    /// Sets every subresource to `value`, fully compressed.
    pub fn fill(&mut self, value: T) {
        for aspect in self.per_aspect.iter_mut() {
            *aspect = AspectData::Uniform(value.clone());
        }
    }

    /// Value at a single subresource. `aspect` must be a single bit.
    pub fn get(&self, aspect: Aspects, array_layer: u32, mip_level: u32) -> &T {
        assert!(array_layer < self.layer_count && mip_level < self.mip_level_count);
        let data = &self.per_aspect[self.aspects.index_of(aspect)];
        match data {
            AspectData::Uniform(v) => v,
            AspectData::PerLayer(layers) => match &layers[array_layer as usize] {
                LayerData::Uniform(v) => v,
                LayerData::PerMip(mips) => &mips[mip_level as usize],
            },
        }
    }

    fn covers_all_layers(&self, range: &SubresourceRange) -> bool {
        range.base_array_layer == 0 && range.layer_count == self.layer_count
    }

    fn covers_all_mips(&self, range: &SubresourceRange) -> bool {
        range.base_mip_level == 0 && range.level_count == self.mip_level_count
    }

    /// Invokes `f` over maximal uniform sub-ranges of `range`, allowing it to
    /// modify the stored value. Storage is decompressed as values diverge and
    /// re-compressed where they converge again.
    pub fn update(
        &mut self,
        range: &SubresourceRange,
        mut f: impl FnMut(&SubresourceRange, &mut T),
    ) {
        assert!(self.aspects.contains(range.aspects));
        assert!(range.base_array_layer + range.layer_count <= self.layer_count);
        assert!(range.base_mip_level + range.level_count <= self.mip_level_count);

        let layer_count = self.layer_count;
        let mip_level_count = self.mip_level_count;
        let full_layers = self.covers_all_layers(range);
        let full_mips = self.covers_all_mips(range);

        for aspect in range.aspects.iter_bits() {
            let index = self.aspects.index_of(aspect);
            let data = &mut self.per_aspect[index];

            // Fast path: the whole aspect is uniform and fully covered.
            if full_layers && full_mips {
                if let AspectData::Uniform(value) = data {
                    f(
                        &SubresourceRange::whole(aspect, layer_count, mip_level_count),
                        value,
                    );
                    continue;
                }
            }

            let layers = decompress_aspect(data, layer_count);
            for layer in range.base_array_layer..range.base_array_layer + range.layer_count {
                let layer_data = &mut layers[layer as usize];
                if full_mips {
                    if let LayerData::Uniform(value) = layer_data {
                        f(
                            &SubresourceRange {
                                aspects: aspect,
                                base_array_layer: layer,
                                layer_count: 1,
                                base_mip_level: 0,
                                level_count: mip_level_count,
                            },
                            value,
                        );
                        continue;
                    }
                }
                let mips = decompress_layer(layer_data, mip_level_count);
                for mip in range.base_mip_level..range.base_mip_level + range.level_count {
                    f(
                        &SubresourceRange::single(aspect, layer, mip),
                        &mut mips[mip as usize],
                    );
                }
            }
            recompress_aspect(&mut self.per_aspect[index]);
        }
    }

    /// Zips `other` into `self`. `f` receives maximally uniform ranges across
    /// both storages and may modify the value stored in `self`.
    ///
    /// Both storages must describe the same texture shape.
    pub fn merge<U: Clone + PartialEq>(
        &mut self,
        other: &SubresourceStorage<U>,
        mut f: impl FnMut(&SubresourceRange, &mut T, &U),
    ) {
        assert_eq!(self.aspects, other.aspects);
        assert_eq!(self.layer_count, other.layer_count);
        assert_eq!(self.mip_level_count, other.mip_level_count);

        let layer_count = self.layer_count;
        let mip_level_count = self.mip_level_count;

        for aspect in self.aspects.iter_bits() {
            let index = self.aspects.index_of(aspect);
            let other_data = &other.per_aspect[index];
            let data = &mut self.per_aspect[index];

            if let (AspectData::Uniform(value), AspectData::Uniform(other_value)) =
                (&mut *data, other_data)
            {
                f(
                    &SubresourceRange::whole(aspect, layer_count, mip_level_count),
                    value,
                    other_value,
                );
                continue;
            }

            let layers = decompress_aspect(data, layer_count);
            for layer in 0..layer_count {
                let other_layer = other.layer_data(index, layer);
                let layer_data = &mut layers[layer as usize];
                if let (LayerData::Uniform(value), LayerData::Uniform(other_value)) =
                    (&mut *layer_data, other_layer)
                {
                    f(
                        &SubresourceRange {
                            aspects: aspect,
                            base_array_layer: layer,
                            layer_count: 1,
                            base_mip_level: 0,
                            level_count: mip_level_count,
                        },
                        value,
                        &other_value,
                    );
                    continue;
                }
                let mips = decompress_layer(layer_data, mip_level_count);
                for mip in 0..mip_level_count {
                    f(
                        &SubresourceRange::single(aspect, layer, mip),
                        &mut mips[mip as usize],
                        other.get(aspect, layer, mip),
                    );
                }
            }
            recompress_aspect(&mut self.per_aspect[index]);
        }
    }

    /// Read-only traversal of maximal uniform ranges.
    pub fn iterate(&self, mut f: impl FnMut(&SubresourceRange, &T)) {
        for aspect in self.aspects.iter_bits() {
            let index = self.aspects.index_of(aspect);
            match &self.per_aspect[index] {
                AspectData::Uniform(value) => f(
                    &SubresourceRange::whole(aspect, self.layer_count, self.mip_level_count),
                    value,
                ),
                AspectData::PerLayer(layers) => {
                    for (layer, layer_data) in layers.iter().enumerate() {
                        match layer_data {
                            LayerData::Uniform(value) => f(
                                &SubresourceRange {
                                    aspects: aspect,
                                    base_array_layer: layer as u32,
                                    layer_count: 1,
                                    base_mip_level: 0,
                                    level_count: self.mip_level_count,
                                },
                                value,
                            ),
                            LayerData::PerMip(mips) => {
                                for (mip, value) in mips.iter().enumerate() {
                                    f(
                                        &SubresourceRange::single(
                                            aspect,
                                            layer as u32,
                                            mip as u32,
                                        ),
                                        value,
                                    );
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn layer_data(&self, aspect_index: usize, layer: u32) -> LayerData<T> {
        match &self.per_aspect[aspect_index] {
            AspectData::Uniform(v) => LayerData::Uniform(v.clone()),
            AspectData::PerLayer(layers) => layers[layer as usize].clone(),
        }
    }
}

fn decompress_aspect<T: Clone>(data: &mut AspectData<T>, layer_count: u32) -> &mut Vec<LayerData<T>> {
    if let AspectData::Uniform(value) = data {
        let layers = vec![LayerData::Uniform(value.clone()); layer_count as usize];
        *data = AspectData::PerLayer(layers);
    }
    match data {
        AspectData::PerLayer(layers) => layers,
        AspectData::Uniform(_) => unreachable!(),
    }
}

fn decompress_layer<T: Clone>(data: &mut LayerData<T>, mip_level_count: u32) -> &mut Vec<T> {
    if let LayerData::Uniform(value) = data {
        let mips = vec![value.clone(); mip_level_count as usize];
        *data = LayerData::PerMip(mips);
    }
    match data {
        LayerData::PerMip(mips) => mips,
        LayerData::Uniform(_) => unreachable!(),
    }
}

fn recompress_aspect<T: Clone + PartialEq>(data: &mut AspectData<T>) {
    if let AspectData::PerLayer(layers) = data {
        for layer in layers.iter_mut() {
            if let LayerData::PerMip(mips) = layer {
                if mips.windows(2).all(|w| w[0] == w[1]) {
                    *layer = LayerData::Uniform(mips[0].clone());
                }
            }
        }
        let all_uniform_and_equal = layers.windows(2).all(|w| match (&w[0], &w[1]) {
            (LayerData::Uniform(a), LayerData::Uniform(b)) => a == b,
            _ => false,
        }) && matches!(layers[0], LayerData::Uniform(_));
        if all_uniform_and_equal {
            if let LayerData::Uniform(value) = &layers[0] {
                *data = AspectData::Uniform(value.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect<T: Clone + PartialEq>(
        storage: &SubresourceStorage<T>,
    ) -> Vec<(SubresourceRange, T)> {
        let mut out = Vec::new();
        storage.iterate(|range, value| out.push((*range, value.clone())));
        out
    }

    #[test]
    fn fill_then_get() {
        let mut s = SubresourceStorage::new(Aspects::DEPTH | Aspects::STENCIL, 4, 3, 0u32);
        s.fill(7);
        for aspect in (Aspects::DEPTH | Aspects::STENCIL).iter_bits() {
            for layer in 0..4 {
                for mip in 0..3 {
                    assert_eq!(*s.get(aspect, layer, mip), 7);
                }
            }
        }
        // Fully compressed: one range per aspect.
        assert_eq!(collect(&s).len(), 2);
    }

    #[test]
    fn update_partial_range_decompresses() {
        let mut s = SubresourceStorage::new(Aspects::COLOR, 4, 4, 0u32);
        let range = SubresourceRange {
            aspects: Aspects::COLOR,
            base_array_layer: 1,
            layer_count: 2,
            base_mip_level: 0,
            level_count: 4,
        };
        s.update(&range, |_, v| *v = 5);

        for layer in 0..4 {
            for mip in 0..4 {
                let expected = if (1..3).contains(&layer) { 5 } else { 0 };
                assert_eq!(*s.get(Aspects::COLOR, layer, mip), expected);
            }
        }
    }

    #[test]
    fn update_converging_values_recompresses() {
        let mut s = SubresourceStorage::new(Aspects::COLOR, 2, 2, 0u32);
        s.update(&SubresourceRange::single(Aspects::COLOR, 0, 0), |_, v| {
            *v = 9
        });
        assert!(collect(&s).len() > 1);

        // Writing 9 everywhere folds the storage back into a single range.
        s.update(&SubresourceRange::whole(Aspects::COLOR, 2, 2), |_, v| *v = 9);
        let ranges = collect(&s);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].0, SubresourceRange::whole(Aspects::COLOR, 2, 2));
        assert_eq!(ranges[0].1, 9);
    }

    #[test]
    fn update_callback_sees_maximal_uniform_ranges() {
        let mut s = SubresourceStorage::new(Aspects::COLOR, 3, 2, 0u32);
        // Make layer 0 diverge.
        s.update(&SubresourceRange::single(Aspects::COLOR, 0, 1), |_, v| {
            *v = 1
        });

        let mut seen = Vec::new();
        s.update(&SubresourceRange::whole(Aspects::COLOR, 3, 2), |range, _| {
            seen.push(*range);
        });
        // Layer 0 is visited per mip, layers 1 and 2 as whole layers.
        assert!(seen.contains(&SubresourceRange::single(Aspects::COLOR, 0, 0)));
        assert!(seen.contains(&SubresourceRange::single(Aspects::COLOR, 0, 1)));
        assert!(seen.iter().any(|r| r.base_array_layer == 1
            && r.layer_count == 1
            && r.level_count == 2));
    }

    #[test]
    fn merge_zips_uniform_ranges() {
        let mut a = SubresourceStorage::new(Aspects::COLOR, 2, 2, 0u32);
        let mut b = SubresourceStorage::new(Aspects::COLOR, 2, 2, 10u32);
        b.update(&SubresourceRange::single(Aspects::COLOR, 1, 1), |_, v| {
            *v = 11
        });

        a.merge(&b, |_, dst, src| *dst += *src);

        assert_eq!(*a.get(Aspects::COLOR, 0, 0), 10);
        assert_eq!(*a.get(Aspects::COLOR, 1, 0), 10);
        assert_eq!(*a.get(Aspects::COLOR, 1, 1), 11);
    }

    #[test]
    fn merge_coverage_is_independent_of_compression_history() {
        // Build the same logical contents along two different histories and
        // check the iterated (range, value) pairs agree.
        let mut fresh = SubresourceStorage::new(Aspects::COLOR, 2, 2, 3u32);

        let mut history = SubresourceStorage::new(Aspects::COLOR, 2, 2, 0u32);
        history.update(&SubresourceRange::single(Aspects::COLOR, 0, 0), |_, v| {
            *v = 1
        });
        history.update(&SubresourceRange::whole(Aspects::COLOR, 2, 2), |_, v| {
            *v = 3
        });

        assert_eq!(collect(&fresh), collect(&history));

        let other = SubresourceStorage::new(Aspects::COLOR, 2, 2, 5u32);
        let mut merged_fresh = Vec::new();
        fresh.merge(&other, |r, v, o| merged_fresh.push((*r, *v, *o)));
        let mut merged_history = Vec::new();
        history.merge(&other, |r, v, o| merged_history.push((*r, *v, *o)));
        assert_eq!(merged_fresh, merged_history);
    }
}
