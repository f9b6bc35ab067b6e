//! Power-loss behavior: every test cuts the flash dead at some operation,
//! remounts and checks that the store recovered into a consistent state.

mod common;

use common::Flash;
use norkv::{Error, ItemType, Key, Partition, Storage};
use pretty_assertions::assert_eq;

fn mount(flash: &mut Flash) -> Storage<&mut Flash> {
    let len = flash.len();
    let partition = Partition::new(flash, 0, len).unwrap();
    let mut storage = Storage::new(partition);
    storage.init().unwrap();
    storage
}

/// Flash operations a clean mount of `image` performs. Deterministic, so a
/// fault armed beyond this count hits the workload, not the mount.
fn mount_cost(image: &[u8]) -> usize {
    let mut flash = Flash::from_image(image.to_vec());
    {
        let _ = mount(&mut flash);
    }
    flash.operations.len()
}

/// Remounting twice in a row must not touch the flash: recovery converges
/// in one pass.
fn assert_recovery_converged(flash: &mut Flash, context: &str) {
    let snapshot = flash.buf.clone();
    {
        let _ = mount(flash);
    }
    assert_eq!(snapshot, flash.buf, "mount not idempotent {context}");
}

#[test]
fn primitive_overwrite_power_cut() {
    let old = 0xAAAA_AAAAu32;
    let new = 0x5555_5555u32;

    let mut flash = Flash::new(2);
    {
        let mut storage = mount(&mut flash);
        let ns = storage
            .create_or_open_namespace(&Key::from_str("ns"), true)
            .unwrap();
        assert_eq!(ns, 1);
        storage
            .write_item(ns, ItemType::U32, &Key::from_str("val"), &old.to_le_bytes())
            .unwrap();
    }
    let base = flash.buf.clone();
    let mount_ops = mount_cost(&base);

    let mut cut = 0usize;
    loop {
        let mut flash = Flash::from_image(base.clone());
        flash.fail_after_operation = mount_ops + cut;

        let write_result;
        {
            let mut storage = mount(&mut flash);
            write_result =
                storage.write_item(1, ItemType::U32, &Key::from_str("val"), &new.to_le_bytes());
        }
        let completed = write_result.is_ok() && !flash.faulted();
        flash.disable_faults();

        {
            let mut storage = mount(&mut flash);
            let mut buf = [0u8; 4];
            storage
                .read_item(1, ItemType::U32, &Key::from_str("val"), &mut buf)
                .unwrap();
            let value = u32::from_le_bytes(buf);
            assert!(
                value == old || value == new,
                "torn value {value:#010x} at cut {cut}"
            );

            // reconciliation leaves exactly one copy
            assert_eq!(
                storage.calc_entries_in_namespace(1).unwrap(),
                1,
                "at cut {cut}"
            );
        }
        assert_recovery_converged(&mut flash, &format!("at cut {cut}"));

        if completed {
            break;
        }
        cut += 1;
    }
    assert!(cut > 0, "the fault sweep never reached the workload");
}

#[test]
fn blob_overwrite_atomic_swap() {
    let blob_a: Vec<u8> = std::iter::repeat(0xAAu8).take(8192).collect();
    let blob_b: Vec<u8> = (0u8..251).cycle().take(8192).collect();

    let mut flash = Flash::new(8);
    {
        let mut storage = mount(&mut flash);
        let ns = storage
            .create_or_open_namespace(&Key::from_str("ns"), true)
            .unwrap();
        assert_eq!(ns, 1);
        storage
            .write_item(ns, ItemType::Blob, &Key::from_str("big"), &blob_a)
            .unwrap();
    }
    let base = flash.buf.clone();
    let mount_ops = mount_cost(&base);

    let mut cut = 0usize;
    loop {
        let mut flash = Flash::from_image(base.clone());
        flash.fail_after_operation = mount_ops + cut;

        let write_result;
        {
            let mut storage = mount(&mut flash);
            write_result = storage.write_item(1, ItemType::Blob, &Key::from_str("big"), &blob_b);
        }
        let completed = write_result.is_ok() && !flash.faulted();
        flash.disable_faults();

        {
            let mut storage = mount(&mut flash);
            let mut buf = vec![0u8; 8192];
            let read = storage
                .read_item(1, ItemType::Blob, &Key::from_str("big"), &mut buf)
                .unwrap_or_else(|e| panic!("blob lost at cut {cut}: {e:?}"));
            assert_eq!(read, 8192, "short blob at cut {cut}");
            assert!(
                buf == blob_a || buf == blob_b,
                "mixed generations at cut {cut}"
            );

            // one generation visible, no leftover chunks of the other
            let visible = storage
                .find_entry(None, None)
                .unwrap()
                .map(|e| e.unwrap())
                .count();
            assert_eq!(visible, 1, "at cut {cut}");
        }
        assert_recovery_converged(&mut flash, &format!("at cut {cut}"));

        if completed {
            break;
        }
        cut += 1;
    }
    assert!(cut > 0, "the fault sweep never reached the workload");
}

/// Overwriting a blob writes the replacement at the toggled version
/// offset, so its chunk ordinals start at 0x80 rather than 0. A cut in the
/// middle of that write must reclaim exactly those chunks, both through
/// the in-session rollback and through the next mount; erasing at the
/// untoggled ordinals would hit the live generation instead and leak the
/// new chunks until some future relocation.
#[test]
fn blob_overwrite_power_cut_reclaims_new_chunks() {
    let blob_a: Vec<u8> = (0u8..113).cycle().take(8192).collect();
    let blob_b: Vec<u8> = (7u8..203).cycle().take(8192).collect();

    let mut flash = Flash::new(8);
    {
        let mut storage = mount(&mut flash);
        let ns = storage
            .create_or_open_namespace(&Key::from_str("ns"), true)
            .unwrap();
        assert_eq!(ns, 1);
        storage
            .write_item(ns, ItemType::Blob, &Key::from_str("big"), &blob_a)
            .unwrap();
    }
    let base = flash.buf.clone();
    let mount_ops = mount_cost(&base);

    // Entry footprint of each generation on an image that holds only it,
    // measured once so the sweep can assert exact accounting.
    let entries_with_a = {
        let mut flash = Flash::from_image(base.clone());
        let mut storage = mount(&mut flash);
        storage.calc_entries_in_namespace(1).unwrap()
    };
    let entries_with_b = {
        let mut flash = Flash::from_image(base.clone());
        {
            let mut storage = mount(&mut flash);
            storage
                .write_item(1, ItemType::Blob, &Key::from_str("big"), &blob_b)
                .unwrap();
        }
        let mut storage = mount(&mut flash);
        storage.calc_entries_in_namespace(1).unwrap()
    };

    let mut cut = 0usize;
    loop {
        let mut flash = Flash::from_image(base.clone());
        flash.fail_after_operation = mount_ops + cut;

        let write_result;
        {
            let mut storage = mount(&mut flash);
            write_result = storage.write_item(1, ItemType::Blob, &Key::from_str("big"), &blob_b);
        }
        let completed = write_result.is_ok() && !flash.faulted();
        flash.disable_faults();

        {
            let mut storage = mount(&mut flash);
            let mut buf = vec![0u8; 8192];
            storage
                .read_item(1, ItemType::Blob, &Key::from_str("big"), &mut buf)
                .unwrap_or_else(|e| panic!("blob lost at cut {cut}: {e:?}"));

            let expected = if buf == blob_a {
                entries_with_a
            } else if buf == blob_b {
                entries_with_b
            } else {
                panic!("mixed generations at cut {cut}");
            };

            // A leaked chunk of the dead generation would inflate both
            // counts; a rollback aimed at the wrong ordinals would deflate
            // them by tombstoning live chunks.
            assert_eq!(
                storage.calc_entries_in_namespace(1).unwrap(),
                expected,
                "leaked or lost chunk entries at cut {cut}"
            );
            let stats = storage.fill_stats().unwrap();
            assert_eq!(
                stats.used_entries,
                expected + 1, // plus the namespace mapping
                "at cut {cut}"
            );
        }
        assert_recovery_converged(&mut flash, &format!("at cut {cut}"));

        if completed {
            break;
        }
        cut += 1;
    }
    assert!(cut > 0, "the fault sweep never reached the workload");
}

#[test]
fn first_blob_write_power_cut_reclaims_orphans() {
    let blob: Vec<u8> = (0u8..97).cycle().take(9000).collect();

    let mut flash = Flash::new(4);
    {
        let mut storage = mount(&mut flash);
        let ns = storage
            .create_or_open_namespace(&Key::from_str("ns"), true)
            .unwrap();
        assert_eq!(ns, 1);
    }
    let base = flash.buf.clone();
    let mount_ops = mount_cost(&base);

    let mut cut = 0usize;
    loop {
        let mut flash = Flash::from_image(base.clone());
        flash.fail_after_operation = mount_ops + cut;

        let write_result;
        {
            let mut storage = mount(&mut flash);
            write_result = storage.write_item(1, ItemType::Blob, &Key::from_str("x"), &blob);
        }
        let completed = write_result.is_ok() && !flash.faulted();
        flash.disable_faults();

        {
            let mut storage = mount(&mut flash);
            let mut buf = vec![0u8; 9000];
            match storage.read_item(1, ItemType::Blob, &Key::from_str("x"), &mut buf) {
                Ok(read) => {
                    assert_eq!(read, 9000, "short blob at cut {cut}");
                    assert_eq!(buf, blob, "torn blob at cut {cut}");
                }
                Err(Error::NotFound) => {
                    // the write never became visible; all of its chunks
                    // must have been reclaimed, only the namespace remains
                    let stats = storage.fill_stats().unwrap();
                    assert_eq!(stats.used_entries, 1, "orphans left at cut {cut}");
                }
                Err(e) => panic!("unexpected error at cut {cut}: {e:?}"),
            }
        }
        assert_recovery_converged(&mut flash, &format!("at cut {cut}"));

        if completed {
            break;
        }
        cut += 1;
    }
    assert!(cut > 0, "the fault sweep never reached the workload");
}

#[test]
fn garbage_collection_power_cut() {
    let rounds = 160u32;

    let mut flash = Flash::new(2);
    {
        let mut storage = mount(&mut flash);
        let ns = storage
            .create_or_open_namespace(&Key::from_str("ns"), true)
            .unwrap();
        assert_eq!(ns, 1);
        storage
            .write_item(ns, ItemType::U32, &Key::from_str("fixed"), &0x77u32.to_le_bytes())
            .unwrap();
    }
    let base = flash.buf.clone();
    let mount_ops = mount_cost(&base);

    // Run once to completion to learn the workload size, then sample cut
    // points across it.
    let total = {
        let mut flash = Flash::from_image(base.clone());
        {
            let mut storage = mount(&mut flash);
            for i in 0..rounds {
                storage
                    .write_item(1, ItemType::U32, &Key::from_str("val"), &i.to_le_bytes())
                    .unwrap();
            }
        }
        flash.operations.len() - mount_ops
    };
    assert!(total > 0);
    let step = (total / 400).max(1);

    let mut cut = 0usize;
    while cut <= total {
        let mut flash = Flash::from_image(base.clone());
        flash.fail_after_operation = mount_ops + cut;

        {
            let mut storage = mount(&mut flash);
            for i in 0..rounds {
                if storage
                    .write_item(1, ItemType::U32, &Key::from_str("val"), &i.to_le_bytes())
                    .is_err()
                {
                    break;
                }
            }
        }
        flash.disable_faults();

        {
            let mut storage = mount(&mut flash);

            // survives any number of relocations
            let mut buf = [0u8; 4];
            storage
                .read_item(1, ItemType::U32, &Key::from_str("fixed"), &mut buf)
                .unwrap_or_else(|e| panic!("fixed key lost at cut {cut}: {e:?}"));
            assert_eq!(u32::from_le_bytes(buf), 0x77, "at cut {cut}");

            match storage.read_item(1, ItemType::U32, &Key::from_str("val"), &mut buf) {
                Ok(_) => {
                    let value = u32::from_le_bytes(buf);
                    assert!(value < rounds, "impossible value {value} at cut {cut}");
                }
                // only possible when the cut hit before the first write
                Err(Error::NotFound) => {}
                Err(e) => panic!("unexpected error at cut {cut}: {e:?}"),
            }

            // at most one copy of each key survives reconciliation
            assert!(
                storage.calc_entries_in_namespace(1).unwrap() <= 2,
                "duplicates left at cut {cut}"
            );
        }
        assert_recovery_converged(&mut flash, &format!("at cut {cut}"));

        cut += step;
    }
}

#[test]
fn corrupt_page_is_quarantined_and_reused() {
    let mut flash = Flash::new(3);
    {
        let mut storage = mount(&mut flash);
        let ns = storage
            .create_or_open_namespace(&Key::from_str("ns"), true)
            .unwrap();
        storage
            .write_item(ns, ItemType::U32, &Key::from_str("k"), &9u32.to_le_bytes())
            .unwrap();
    }

    // scribble over the header of an untouched sector
    flash.buf[common::SECTOR_SIZE] = 0x00;

    {
        let mut storage = mount(&mut flash);
        let stats = storage.fill_stats().unwrap();
        assert_eq!(stats.pages.corrupt, 1);

        let mut buf = [0u8; 4];
        storage
            .read_item(1, ItemType::U32, &Key::from_str("k"), &mut buf)
            .unwrap();
        assert_eq!(u32::from_le_bytes(buf), 9);

        // churn until garbage collection has to erase the quarantined
        // sector and bring it back into rotation
        for i in 0..300u32 {
            storage
                .write_item(1, ItemType::U32, &Key::from_str("churn"), &i.to_le_bytes())
                .unwrap();
        }
        storage
            .read_item(1, ItemType::U32, &Key::from_str("churn"), &mut buf)
            .unwrap();
        assert_eq!(u32::from_le_bytes(buf), 299);
    }
    assert!(flash.erases() >= 1);

    let mut storage = mount(&mut flash);
    let mut buf = [0u8; 4];
    storage
        .read_item(1, ItemType::U32, &Key::from_str("k"), &mut buf)
        .unwrap();
    assert_eq!(u32::from_le_bytes(buf), 9);
    storage
        .read_item(1, ItemType::U32, &Key::from_str("churn"), &mut buf)
        .unwrap();
    assert_eq!(u32::from_le_bytes(buf), 299);
}
