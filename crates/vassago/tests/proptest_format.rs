//! Property tests over the container format, the shard bank framing, and
//! the fp16 codec.

use proptest::prelude::*;

use vassago::container::{Reader, SectionType, Writer, FLAG_COMP_LZ4, FLAG_COMP_ZSTD};
use vassago::shard::{self, ShardType};
use vassago_core::fp16;

fn flag_strategy() -> impl Strategy<Value = u32> {
    prop_oneof![Just(0u32), Just(FLAG_COMP_ZSTD), Just(FLAG_COMP_LZ4)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn container_roundtrips_any_flag_mix(
        meta in proptest::collection::vec(any::<u8>(), 0..512),
        bank in proptest::collection::vec(any::<u8>(), 0..4096),
        routing in proptest::collection::vec(any::<u8>(), 0..2048),
        f_meta in flag_strategy(),
        f_bank in flag_strategy(),
        f_routing in flag_strategy(),
    ) {
        let mut w = Writer::new();
        w.add_section(SectionType::Meta, meta.clone(), f_meta);
        w.add_section(SectionType::ShardBank, bank.clone(), f_bank);
        w.add_section(SectionType::Routing, routing.clone(), f_routing);

        let path = tempfile::NamedTempFile::new().unwrap().into_temp_path();
        w.write(&path).unwrap();

        let r = Reader::open(&path).unwrap();
        prop_assert_eq!(r.section_uncompressed(SectionType::Meta).unwrap(), meta);
        prop_assert_eq!(r.section_uncompressed(SectionType::ShardBank).unwrap(), bank);
        prop_assert_eq!(r.section_uncompressed(SectionType::Routing).unwrap(), routing);
    }

    #[test]
    fn bank_index_reproduces_the_bank(
        payloads in proptest::collection::vec(
            (0u8..4, any::<u16>(), proptest::collection::vec(any::<u8>(), 0..200)),
            0..12,
        )
    ) {
        let mut bank = Vec::new();
        for (ty, scope, payload) in &payloads {
            let ty = ShardType::try_from(*ty).unwrap();
            bank.extend_from_slice(&shard::frame(ty, *scope, payload));
        }
        let records = shard::index_bank(&bank).unwrap();
        prop_assert_eq!(records.len(), payloads.len());
        let mut rebuilt = Vec::new();
        for rec in &records {
            rebuilt.extend_from_slice(&rec.header.to_bytes());
            rebuilt.extend_from_slice(rec.payload(&bank));
        }
        prop_assert_eq!(rebuilt, bank);
    }

    #[test]
    fn fp16_preserves_order(
        a in -65504.0f32..65504.0,
        b in -65504.0f32..65504.0,
    ) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let lo16 = fp16::decode(fp16::encode(lo));
        let hi16 = fp16::decode(fp16::encode(hi));
        prop_assert!(lo16 <= hi16, "{} -> {}, {} -> {}", lo, lo16, hi, hi16);
    }

    #[test]
    fn fp16_roundtrip_bounded_in_normal_range(
        mag in 6.104e-5f32..32768.0,
        neg in any::<bool>(),
    ) {
        let v = if neg { -mag } else { mag };
        let back = fp16::decode(fp16::encode(v));
        let rel = ((back as f64 - v as f64) / v as f64).abs();
        prop_assert!(rel <= 2.0f64.powi(-10), "v={v} back={back} rel={rel}");
    }
}
