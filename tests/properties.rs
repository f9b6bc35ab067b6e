//! Randomized operation sequences checked against an in-memory model, with
//! a remount between writing and verification.

mod common;

use common::Flash;
use norkv::{Error, ItemType, Key, Partition, Storage};
use proptest::prelude::*;
use std::collections::BTreeMap;

fn mount(flash: &mut Flash) -> Storage<&mut Flash> {
    let len = flash.len();
    let partition = Partition::new(flash, 0, len).unwrap();
    let mut storage = Storage::new(partition);
    storage.init().unwrap();
    storage
}

const KEYS: u8 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Kind {
    U32,
    Str,
    Blob,
}

impl Kind {
    fn item_type(self) -> ItemType {
        match self {
            Kind::U32 => ItemType::U32,
            Kind::Str => ItemType::Str,
            Kind::Blob => ItemType::Blob,
        }
    }
}

#[derive(Debug, Clone)]
enum Op {
    SetU32 { key: u8, value: u32 },
    SetStr { key: u8, len: usize },
    SetBlob { key: u8, len: usize },
    Erase { key: u8, kind: Kind },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0..KEYS, any::<u32>()).prop_map(|(key, value)| Op::SetU32 { key, value }),
        (0..KEYS, 0usize..200).prop_map(|(key, len)| Op::SetStr { key, len }),
        (0..KEYS, 0usize..3000).prop_map(|(key, len)| Op::SetBlob { key, len }),
        (0..KEYS, prop_oneof![Just(Kind::U32), Just(Kind::Str), Just(Kind::Blob)])
            .prop_map(|(key, kind)| Op::Erase { key, kind }),
    ]
}

fn key_name(index: u8) -> Key {
    Key::try_from_str(&format!("k{index}")).unwrap()
}

/// Payload derived from the op parameters so the model never has to store
/// anything the test cannot regenerate.
fn payload(key: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(key))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn model_equivalence_across_remount(ops in proptest::collection::vec(op_strategy(), 1..24)) {
        let mut flash = Flash::new(6);
        let mut model: BTreeMap<(u8, Kind), Vec<u8>> = BTreeMap::new();

        {
            let mut storage = mount(&mut flash);
            let ns = storage
                .create_or_open_namespace(&Key::from_str("ns"), true)
                .unwrap();

            for op in &ops {
                match *op {
                    Op::SetU32 { key, value } => {
                        let bytes = value.to_le_bytes().to_vec();
                        match storage.write_item(ns, ItemType::U32, &key_name(key), &bytes) {
                            Ok(()) => {
                                model.insert((key, Kind::U32), bytes);
                            }
                            Err(Error::NotEnoughSpace) => {}
                            Err(e) => panic!("write failed: {e:?}"),
                        }
                    }
                    Op::SetStr { key, len } => {
                        let bytes = payload(key, len);
                        match storage.write_item(ns, ItemType::Str, &key_name(key), &bytes) {
                            Ok(()) => {
                                model.insert((key, Kind::Str), bytes);
                            }
                            Err(Error::NotEnoughSpace) => {}
                            Err(e) => panic!("write failed: {e:?}"),
                        }
                    }
                    Op::SetBlob { key, len } => {
                        let bytes = payload(key, len);
                        match storage.write_item(ns, ItemType::Blob, &key_name(key), &bytes) {
                            Ok(()) => {
                                model.insert((key, Kind::Blob), bytes);
                            }
                            Err(Error::NotEnoughSpace) => {}
                            Err(e) => panic!("write failed: {e:?}"),
                        }
                    }
                    Op::Erase { key, kind } => {
                        let result = storage.erase_item(ns, Some(kind.item_type()), &key_name(key));
                        let existed = model.remove(&(key, kind)).is_some();
                        match (existed, result) {
                            (true, Ok(())) => {}
                            (false, Err(Error::NotFound)) => {}
                            (existed, result) => {
                                panic!("erase mismatch: existed={existed} result={result:?}")
                            }
                        }
                    }
                }
            }
        }

        // reboot
        let mut storage = mount(&mut flash);
        let ns = storage
            .create_or_open_namespace(&Key::from_str("ns"), false)
            .unwrap();

        for key in 0..KEYS {
            for kind in [Kind::U32, Kind::Str, Kind::Blob] {
                let expected = model.get(&(key, kind));
                let mut buf = vec![0u8; expected.map_or(4096, Vec::len)];
                let result = storage.read_item(ns, kind.item_type(), &key_name(key), &mut buf);
                match expected {
                    Some(bytes) => {
                        let read = result.unwrap();
                        prop_assert_eq!(read, bytes.len());
                        prop_assert_eq!(&buf[..read], bytes.as_slice());
                    }
                    None => {
                        prop_assert_eq!(result, Err(Error::NotFound));
                    }
                }
            }
        }

        // every surviving item is visible exactly once
        let visible = storage
            .find_entry(None, None)
            .unwrap()
            .map(|e| e.unwrap())
            .count();
        prop_assert_eq!(visible, model.len());
    }
}
